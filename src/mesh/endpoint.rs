use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::Arc,
    time::{Duration, SystemTime},
};

use futures::future::try_join_all;
use quinn::{default_runtime, VarInt};
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate as RustlsCert, PrivateKey, ServerName,
};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use typed_builder::TypedBuilder;

use super::{
    axon::{Axon, FrameRecvStream, FrameSendStream},
    error::Error,
    wire::{Frame, Hello},
    Rank, Transport,
};

/// Name every rank presents in its self-signed certificate.
const SERVER_NAME: &str = "sweep.mesh";

/// How one process joins a QUIC mesh.
#[derive(Clone, Debug, TypedBuilder)]
pub struct MeshConfig {
    /// This process's rank.
    pub rank: Rank,
    /// Listening address of every rank, indexed by rank.
    pub peers: Vec<SocketAddr>,
    /// Hash of the run configuration. Ranks with a different fingerprint are
    /// refused during the handshake.
    pub fingerprint: [u8; 32],
    #[builder(default = 100)]
    pub connect_attempts: u32,
    #[builder(default = Duration::from_millis(100))]
    pub retry_delay: Duration,
    #[builder(default = Duration::from_secs(1))]
    pub keep_alive: Duration,
    #[builder(default = Duration::from_secs(10))]
    pub idle_timeout: Duration,
}

/// One rank's view of a QUIC mesh: an outbound stream per peer and a single
/// inbound queue fed by one reader task per link.
pub struct QuicTransport {
    rank: Rank,
    size: usize,
    links: Vec<Option<FrameSendStream>>,
    axons: Vec<Axon>,
    inbox: mpsc::UnboundedReceiver<Result<Frame, Error>>,
    endpoint: quinn::Endpoint,
}

impl QuicTransport {
    /// Binds this rank's endpoint and links it with every other rank. Rank `i`
    /// dials every lower rank and accepts every higher one, so each pair ends
    /// up with exactly one connection.
    pub async fn join(config: &MeshConfig) -> Result<Self, Error> {
        let size = config.peers.len();
        let rank = config.rank;
        let local_addr = *config.peers.get(rank).ok_or(Error::InvalidRank(rank))?;
        let endpoint = Self::endpoint(local_addr, config)?;
        info!(rank, size, %local_addr, "joining mesh");

        let hello = Hello {
            rank: rank as u32,
            size: size as u32,
            fingerprint: config.fingerprint,
        };

        let acceptor = tokio::spawn(Self::accept_peers(
            endpoint.clone(),
            size - 1 - rank,
            hello.clone(),
        ));
        let dialed = try_join_all(
            (0..rank).map(|peer| Self::dial(&endpoint, config, peer, hello.clone())),
        )
        .await?;
        let accepted = acceptor.await.map_err(|e| {
            Error::Io(io::Error::new(io::ErrorKind::Other, e.to_string()))
        })??;

        let (inbound_tx, inbox) = mpsc::unbounded_channel();
        let mut links: Vec<Option<FrameSendStream>> = (0..size).map(|_| None).collect();
        let mut axons = Vec::with_capacity(size.saturating_sub(1));
        for (axon, send_stream, recv_stream) in dialed.into_iter().chain(accepted) {
            let peer = axon.peer();
            if links[peer].is_some() {
                Err(Error::UnexpectedPeer(peer))?
            }
            links[peer] = Some(send_stream);
            tokio::spawn(Self::read_link(peer, recv_stream, inbound_tx.clone()));
            axons.push(axon);
        }
        info!(rank, links = axons.len(), "mesh complete");

        Ok(Self {
            rank,
            size,
            links,
            axons,
            inbox,
            endpoint,
        })
    }

    /// Creates the endpoint for this rank, acting as both server and client.
    fn endpoint(local_addr: SocketAddr, config: &MeshConfig) -> Result<quinn::Endpoint, Error> {
        let socket = UdpSocket::bind(local_addr)?;
        let runtime = default_runtime().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "no async runtime found")
        })?;

        let (client_tls, server_tls) = Self::tls_config()?;

        // shared transport configuration for the server and client sides
        // this is the default config with the BBR congestion controller enabled
        let mut transport_config = quinn::TransportConfig::default();
        let bbr_config = quinn::congestion::BbrConfig::default();
        transport_config.congestion_controller_factory(Arc::new(bbr_config));
        transport_config.keep_alive_interval(Some(config.keep_alive));
        let idle_ms = config.idle_timeout.as_millis().min(u32::MAX as u128) as u32;
        transport_config.max_idle_timeout(Some(VarInt::from_u32(idle_ms).into()));
        let transport_config = Arc::new(transport_config);

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(server_tls));
        server_config.transport_config(transport_config.clone());

        let mut client_config = quinn::ClientConfig::new(Arc::new(client_tls));
        client_config.transport_config(transport_config);

        let endpoint_config = quinn::EndpointConfig::default();
        let mut endpoint =
            quinn::Endpoint::new(endpoint_config, Some(server_config), socket, runtime)?;
        endpoint.set_default_client_config(client_config);
        Ok(endpoint)
    }

    /// Accepts links from every higher rank. This runs until all of them have
    /// completed the handshake, so it should be spawned in a dedicated task.
    async fn accept_peers(
        endpoint: quinn::Endpoint,
        expected: usize,
        hello: Hello,
    ) -> Result<Vec<(Axon, FrameSendStream, FrameRecvStream)>, Error> {
        let mut accepted = Vec::with_capacity(expected);
        while accepted.len() < expected {
            let in_progress = endpoint.accept().await.ok_or(Error::EndpointStopped)?;
            match Axon::new(in_progress, false, hello.clone()).await {
                Ok(link) => accepted.push(link),
                Err(e @ (Error::FingerprintMismatch(_) | Error::SizeMismatch { .. })) => Err(e)?,
                Err(e) => warn!(error = %e, "dropping failed inbound link"),
            }
        }
        Ok(accepted)
    }

    /// Dials a lower rank, retrying while it is still starting up.
    async fn dial(
        endpoint: &quinn::Endpoint,
        config: &MeshConfig,
        peer: Rank,
        hello: Hello,
    ) -> Result<(Axon, FrameSendStream, FrameRecvStream), Error> {
        let remote = config.peers[peer];
        let mut attempt = 0;
        loop {
            attempt += 1;
            let in_progress = endpoint.connect(remote, SERVER_NAME)?;
            match Axon::new(in_progress, true, hello.clone()).await {
                Ok(link) => return Ok(link),
                Err(Error::ConnectionError(e)) if attempt < config.connect_attempts => {
                    debug!(peer, attempt, error = %e, "peer not reachable yet");
                    tokio::time::sleep(config.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Forwards every frame of one link into the shared inbound queue.
    async fn read_link(
        peer: Rank,
        mut stream: FrameRecvStream,
        inbound_tx: mpsc::UnboundedSender<Result<Frame, Error>>,
    ) {
        loop {
            match stream.receive(peer).await {
                Ok(Some(frame)) => {
                    if inbound_tx.send(Ok(frame)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    trace!(peer, "link finished");
                    break;
                }
                Err(e) => {
                    let _ = inbound_tx.send(Err(e));
                    break;
                }
            }
        }
    }

    /// Rustls configurations with a fresh self-signed certificate. Peers are
    /// not authenticated by certificate; the handshake's fingerprint check is
    /// what keeps foreign processes out of a run.
    fn tls_config() -> Result<(rustls::ClientConfig, rustls::ServerConfig), Error> {
        let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()])?;
        let cert_der = RustlsCert(cert.serialize_der()?);
        let key = PrivateKey(cert.serialize_private_key_der());

        let client_config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyPeer))
            .with_no_client_auth();

        let server_config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key)?;

        Ok((client_config, server_config))
    }
}

struct AcceptAnyPeer;

impl ServerCertVerifier for AcceptAnyPeer {
    fn verify_server_cert(
        &self,
        _end_entity: &RustlsCert,
        _intermediates: &[RustlsCert],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

impl Transport for QuicTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn send(&mut self, dest: Rank, frame: Frame) -> Result<(), Error> {
        self.links
            .get_mut(dest)
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidRank(dest))?
            .send(&frame)
            .await
            .map_err(|e| match e {
                Error::WriteError(_) => Error::PeerClosed(dest),
                other => other,
            })
    }

    async fn recv(&mut self) -> Result<Frame, Error> {
        self.inbox.recv().await.ok_or(Error::Closed)?
    }

    fn try_recv(&mut self) -> Result<Option<Frame>, Error> {
        match self.inbox.try_recv() {
            Ok(frame) => frame.map(Some),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            // every reader task finished, nothing more can arrive
            Err(mpsc::error::TryRecvError::Disconnected) => Ok(None),
        }
    }

    async fn close(&mut self) {
        for link in self.links.iter_mut().flatten() {
            let finished = tokio::time::timeout(Duration::from_secs(2), link.finish()).await;
            if let Ok(Err(e)) = finished {
                trace!(error = %e, "link already gone while finishing");
            }
        }
        for axon in &self.axons {
            axon.conn().close(VarInt::from_u32(0), b"done");
        }
        self.endpoint.close(VarInt::from_u32(0), b"done");
        if tokio::time::timeout(Duration::from_secs(2), self.endpoint.wait_idle())
            .await
            .is_err()
        {
            debug!(rank = self.rank, "endpoint did not go idle in time");
        }
    }
}
