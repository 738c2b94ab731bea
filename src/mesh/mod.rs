// The mesh is the only way ranks talk to each other. Every rank owns one
// transport with a link to every other rank, and links are FIFO per pair. Work
// never migrates between ranks, so there is no routing: a frame is addressed
// to exactly one rank and is delivered to it or the link fails.
//
// Transports only move frames. Typed envelopes, the mailbox for frames that
// arrive before anyone asks for them, and the collectives all live in the
// communicator, so the in-process mesh used for simulated workers and the QUIC
// mesh used between processes behave identically from the search's point of
// view.

use std::future::Future;

#[cfg(feature = "quic")]
pub mod axon;
mod comm;
#[cfg(feature = "quic")]
pub mod endpoint;
pub mod error;
pub mod local;
pub mod wire;

pub use comm::{Communicator, Envelope, Gathered, TrafficStats};
pub use error::Error;
pub use wire::{Frame, Payload, Tag};

/// Position of a participant in the run. Fixed for the lifetime of a run.
pub type Rank = usize;

/// Moves frames between ranks.
pub trait Transport: Send {
    /// This transport's own rank.
    fn rank(&self) -> Rank;

    /// Number of ranks in the mesh, this one included.
    fn size(&self) -> usize;

    /// Queues a frame for `dest`. Frames to the same destination arrive in
    /// the order they were sent.
    fn send(&mut self, dest: Rank, frame: Frame) -> impl Future<Output = Result<(), Error>> + Send;

    /// Waits for the next inbound frame from any rank.
    fn recv(&mut self) -> impl Future<Output = Result<Frame, Error>> + Send;

    /// Returns an inbound frame if one is already waiting.
    fn try_recv(&mut self) -> Result<Option<Frame>, Error>;

    /// Releases the links. No frames may be sent afterwards.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}
