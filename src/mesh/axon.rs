use std::net::SocketAddr;

use quinn::{Connecting, RecvStream, SendStream};
use tracing::{debug, debug_span, Instrument};

use super::{
    error::Error::{self, *},
    wire::{Frame, FramePrefix, Hello, Payload, Tag, Welcome, MAX_FRAME_LEN},
    Rank,
};

/// Axons are the QUIC links between two ranks of a run. Each axon carries a
/// single bidirectional stream, so frames between a pair stay in order.
pub struct Axon {
    conn: quinn::Connection,
    remote_addr: SocketAddr,
    peer: Rank,
}

impl Axon {
    /// Completes an in-progress connection and the rank handshake. The dialing
    /// side opens the stream and introduces itself; the accepting side checks
    /// the introduction and answers with its own.
    pub async fn new(
        in_progress: Connecting,
        should_open_streams: bool,
        local: Hello,
    ) -> Result<(Self, FrameSendStream, FrameRecvStream), Error> {
        let remote_addr = in_progress.remote_address();
        let span = debug_span!("axon", remote = %remote_addr, rank = local.rank);
        async move {
            debug!("establishing QUIC connection");
            let conn = in_progress.await?;
            debug!("connected via QUIC");
            let (send_stream, recv_stream) = if should_open_streams {
                debug!("opening frame stream");
                conn.open_bi().await?
            } else {
                debug!("waiting for peer to open frame stream");
                conn.accept_bi().await?
            };
            let mut send_stream = FrameSendStream::new(send_stream);
            let mut recv_stream = FrameRecvStream::new(recv_stream);

            let peer = if should_open_streams {
                let hello = Frame::seal(local.rank as Rank, Tag::HELLO, local.encode()?)?;
                send_stream.send(&hello).await?;
                debug!("sent hello to peer");

                let reply = recv_stream.receive(Rank::MAX).await?.ok_or(Error::EndpointStopped)?;
                if reply.tag() != Tag::WELCOME {
                    Err(ReceivedBadHandshakeMessage(reply.tag()))?
                }
                let Welcome(theirs) = Welcome::decode(&reply.open()?)?;
                verify(&local, &theirs)?;
                if theirs.rank >= local.rank {
                    Err(UnexpectedPeer(theirs.rank as Rank))?
                }
                theirs.rank as Rank
            } else {
                let hello = recv_stream.receive(Rank::MAX).await?.ok_or(Error::EndpointStopped)?;
                if hello.tag() != Tag::HELLO {
                    Err(ReceivedBadHandshakeMessage(hello.tag()))?
                }
                let theirs = Hello::decode(&hello.open()?)?;
                debug!(peer = theirs.rank, "received hello from peer");
                verify(&local, &theirs)?;
                if theirs.rank <= local.rank {
                    Err(UnexpectedPeer(theirs.rank as Rank))?
                }
                let welcome = Welcome(local.clone());
                let reply = Frame::seal(local.rank as Rank, Tag::WELCOME, welcome.encode()?)?;
                send_stream.send(&reply).await?;
                theirs.rank as Rank
            };
            debug!(peer, "handshake complete");

            Ok((
                Axon {
                    conn,
                    remote_addr,
                    peer,
                },
                send_stream,
                recv_stream,
            ))
        }
        .instrument(span)
        .await
    }

    pub fn peer(&self) -> Rank {
        self.peer
    }

    pub fn conn(&self) -> &quinn::Connection {
        &self.conn
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

/// Both sides must agree on the run before any search traffic flows.
fn verify(local: &Hello, theirs: &Hello) -> Result<(), Error> {
    if theirs.size != local.size {
        Err(SizeMismatch {
            rank: theirs.rank as Rank,
            expected: local.size as usize,
            found: theirs.size as usize,
        })?
    }
    if theirs.rank >= local.size {
        Err(InvalidRank(theirs.rank as Rank))?
    }
    if theirs.fingerprint != local.fingerprint {
        Err(FingerprintMismatch(theirs.rank as Rank))?
    }
    Ok(())
}

pub struct FrameSendStream(SendStream);

impl FrameSendStream {
    pub fn new(stream: SendStream) -> Self {
        Self(stream)
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), Error> {
        self.0.write_all(&frame.to_wire()).await?;
        Ok(())
    }

    /// Signals the end of the stream and waits until the peer has everything.
    pub async fn finish(&mut self) -> Result<(), Error> {
        self.0.finish().await?;
        Ok(())
    }
}

pub struct FrameRecvStream(RecvStream);

impl FrameRecvStream {
    pub fn new(stream: RecvStream) -> Self {
        Self(stream)
    }

    /// Reads the next frame and attributes it to `source`. Returns `None` once
    /// the peer finished the stream cleanly between two frames.
    pub async fn receive(&mut self, source: Rank) -> Result<Option<Frame>, Error> {
        // prefix | varint(len) | body
        let mut prefix = [0u8; 1];
        match self.0.read(&mut prefix).await? {
            None => return Ok(None),
            Some(0) => return Ok(None),
            Some(_) => {}
        }
        let prefix = FramePrefix::try_from(prefix[0])?;

        let mut len_buf = unsigned_varint::encode::u64_buffer();
        let mut filled = 0;
        let len = loop {
            if filled == len_buf.len() {
                Err(TruncatedFrame)?
            }
            self.0.read_exact(&mut len_buf[filled..filled + 1]).await?;
            filled += 1;
            if !unsigned_varint::decode::is_last(len_buf[filled - 1]) {
                continue;
            }
            let (len, _) = unsigned_varint::decode::u64(&len_buf[..filled])
                .map_err(|_| TruncatedFrame)?;
            break len;
        };
        if len > MAX_FRAME_LEN {
            Err(FrameTooLarge(len))?
        }

        let mut body = vec![0u8; len as usize];
        self.0.read_exact(&mut body).await?;
        Ok(Some(Frame {
            source,
            prefix,
            body,
        }))
    }
}
