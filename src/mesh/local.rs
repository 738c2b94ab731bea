use tokio::sync::mpsc::{self, error::TryRecvError};

use super::{error::Error, Frame, Rank, Transport};

/// In-process transport. Each rank owns one inbound queue and a sender for
/// every rank's queue, so frames from one sender stay in order.
pub struct LocalTransport {
    rank: Rank,
    peers: Vec<mpsc::UnboundedSender<Frame>>,
    inbox: mpsc::UnboundedReceiver<Frame>,
}

/// Builds a fully connected mesh of `size` in-process transports, indexed by
/// rank.
pub fn mesh(size: usize) -> Vec<LocalTransport> {
    let (senders, receivers): (Vec<_>, Vec<_>) =
        (0..size).map(|_| mpsc::unbounded_channel()).unzip();
    receivers
        .into_iter()
        .enumerate()
        .map(|(rank, inbox)| LocalTransport {
            rank,
            peers: senders.clone(),
            inbox,
        })
        .collect()
}

impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    async fn send(&mut self, dest: Rank, frame: Frame) -> Result<(), Error> {
        self.peers
            .get(dest)
            .ok_or(Error::InvalidRank(dest))?
            .send(frame)
            .map_err(|_| Error::PeerClosed(dest))
    }

    async fn recv(&mut self) -> Result<Frame, Error> {
        self.inbox.recv().await.ok_or(Error::Closed)
    }

    fn try_recv(&mut self) -> Result<Option<Frame>, Error> {
        match self.inbox.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::Closed),
        }
    }

    async fn close(&mut self) {
        self.inbox.close();
    }
}
