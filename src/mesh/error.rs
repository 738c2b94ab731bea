use std::{fmt, io, time::Duration};

#[cfg(feature = "quic")]
use quinn::{ConnectError, ConnectionError, ReadError, ReadExactError, WriteError};

use super::{Rank, Tag};

#[derive(Debug)]
pub enum Error {
    #[cfg(feature = "quic")]
    ConnectError(ConnectError),
    #[cfg(feature = "quic")]
    ConnectionError(ConnectionError),
    #[cfg(feature = "quic")]
    WriteError(WriteError),
    #[cfg(feature = "quic")]
    ReadError(ReadError),
    #[cfg(feature = "quic")]
    ReadExactError(ReadExactError),
    #[cfg(feature = "quic")]
    Tls(rustls::Error),
    #[cfg(feature = "quic")]
    Certificate(rcgen::RcgenError),
    Io(io::Error),
    CouldNotEncodeMessage,
    CouldNotDecodeMessage,
    UnknownTag(u8),
    TruncatedFrame,
    FrameTooLarge(u64),
    InvalidRank(Rank),
    /// The link to a peer went away.
    PeerClosed(Rank),
    /// Our own inbound channel closed.
    Closed,
    /// A peer announced it is aborting the run.
    Interrupted(Rank),
    TimedOut { source: Rank, tag: Tag, after: Duration },
    CountMismatch { rank: Rank, expected: u64, found: u64 },
    ReceivedBadHandshakeMessage(Tag),
    FingerprintMismatch(Rank),
    SizeMismatch { rank: Rank, expected: usize, found: usize },
    UnexpectedPeer(Rank),
    EndpointStopped,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "quic")]
            Error::ConnectError(e) => write!(f, "could not connect: {e}"),
            #[cfg(feature = "quic")]
            Error::ConnectionError(e) => write!(f, "connection failed: {e}"),
            #[cfg(feature = "quic")]
            Error::WriteError(e) => write!(f, "stream write failed: {e}"),
            #[cfg(feature = "quic")]
            Error::ReadError(e) => write!(f, "stream read failed: {e}"),
            #[cfg(feature = "quic")]
            Error::ReadExactError(e) => write!(f, "stream read failed: {e}"),
            #[cfg(feature = "quic")]
            Error::Tls(e) => write!(f, "tls setup failed: {e}"),
            #[cfg(feature = "quic")]
            Error::Certificate(e) => write!(f, "certificate generation failed: {e}"),
            Error::Io(e) => write!(f, "io: {e}"),
            Error::CouldNotEncodeMessage => f.write_str("could not encode message"),
            Error::CouldNotDecodeMessage => f.write_str("could not decode message"),
            Error::UnknownTag(tag) => write!(f, "unknown frame prefix {tag:#010b}"),
            Error::TruncatedFrame => f.write_str("truncated frame"),
            Error::FrameTooLarge(len) => write!(f, "frame of {len} bytes exceeds the limit"),
            Error::InvalidRank(rank) => write!(f, "rank {rank} is not part of the mesh"),
            Error::PeerClosed(rank) => write!(f, "link to rank {rank} closed"),
            Error::Closed => f.write_str("inbound channel closed"),
            Error::Interrupted(rank) => write!(f, "rank {rank} aborted the run"),
            Error::TimedOut { source, tag, after } => {
                write!(f, "no {tag} from rank {source} within {after:?}")
            }
            Error::CountMismatch {
                rank,
                expected,
                found,
            } => write!(
                f,
                "rank {rank} announced {expected} items but sent {found}"
            ),
            Error::ReceivedBadHandshakeMessage(tag) => {
                write!(f, "unexpected {tag} during handshake")
            }
            Error::FingerprintMismatch(rank) => {
                write!(f, "rank {rank} runs with a different configuration")
            }
            Error::SizeMismatch {
                rank,
                expected,
                found,
            } => write!(
                f,
                "rank {rank} expects {found} ranks, this process expects {expected}"
            ),
            Error::UnexpectedPeer(rank) => write!(f, "rank {rank} connected out of order"),
            Error::EndpointStopped => f.write_str("endpoint stopped accepting"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            #[cfg(feature = "quic")]
            Error::ConnectError(e) => Some(e),
            #[cfg(feature = "quic")]
            Error::ConnectionError(e) => Some(e),
            #[cfg(feature = "quic")]
            Error::WriteError(e) => Some(e),
            #[cfg(feature = "quic")]
            Error::ReadError(e) => Some(e),
            #[cfg(feature = "quic")]
            Error::ReadExactError(e) => Some(e),
            #[cfg(feature = "quic")]
            Error::Tls(e) => Some(e),
            #[cfg(feature = "quic")]
            Error::Certificate(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(feature = "quic")]
impl From<ConnectError> for Error {
    fn from(error: ConnectError) -> Self {
        Self::ConnectError(error)
    }
}

#[cfg(feature = "quic")]
impl From<ConnectionError> for Error {
    fn from(error: ConnectionError) -> Self {
        Self::ConnectionError(error)
    }
}

#[cfg(feature = "quic")]
impl From<WriteError> for Error {
    fn from(e: WriteError) -> Self {
        Self::WriteError(e)
    }
}

#[cfg(feature = "quic")]
impl From<ReadError> for Error {
    fn from(e: ReadError) -> Self {
        Self::ReadError(e)
    }
}

#[cfg(feature = "quic")]
impl From<ReadExactError> for Error {
    fn from(e: ReadExactError) -> Self {
        Self::ReadExactError(e)
    }
}

#[cfg(feature = "quic")]
impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e)
    }
}

#[cfg(feature = "quic")]
impl From<rcgen::RcgenError> for Error {
    fn from(e: rcgen::RcgenError) -> Self {
        Self::Certificate(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
