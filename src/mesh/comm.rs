use std::{collections::VecDeque, mem, time::Duration};

use hashbrown::HashMap;
use tracing::{trace, warn};

use super::{
    error::Error,
    wire::{Arrive, Count, Frame, Payload, Release, Tag},
    Rank, Transport,
};

/// A decoded payload together with where it came from.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope<P> {
    pub source: Rank,
    pub tag: Tag,
    pub payload: P,
}

/// Message and byte counters, headers included.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
}

/// Result of a variable sized gather: every rank's items in rank order inside
/// one buffer, with `offsets[r]..offsets[r + 1]` delimiting rank `r`.
#[derive(Clone, Debug, PartialEq)]
pub struct Gathered<I> {
    pub items: Vec<I>,
    pub offsets: Vec<usize>,
}

impl<I> Gathered<I> {
    pub fn from_rank(&self, rank: Rank) -> &[I] {
        &self.items[self.offsets[rank]..self.offsets[rank + 1]]
    }
}

/// Typed channels and collectives on top of a [`Transport`].
///
/// Frames that arrive before anyone asks for them are parked in a mailbox
/// keyed by `(source, tag)`, so collectives on different tags can interleave
/// without losing traffic.
pub struct Communicator<T> {
    transport: T,
    mailbox: HashMap<(Rank, Tag), VecDeque<Frame>>,
    stats: TrafficStats,
    recv_timeout: Option<Duration>,
    interrupt: Option<Tag>,
    epoch: u64,
}

impl<T: Transport> Communicator<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            mailbox: HashMap::new(),
            stats: TrafficStats::default(),
            recv_timeout: None,
            interrupt: None,
            epoch: 0,
        }
    }

    /// Bounds every blocking receive. A stalled collective then surfaces as
    /// [`Error::TimedOut`] instead of hanging forever.
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = Some(timeout);
        self
    }

    pub fn set_recv_timeout(&mut self, timeout: Option<Duration>) {
        self.recv_timeout = timeout;
    }

    /// Frames on `tag` fail any blocking receive with
    /// [`Error::Interrupted`]. Passing `None` turns this off.
    pub fn set_interrupt(&mut self, tag: Option<Tag>) {
        self.interrupt = tag;
    }

    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    pub fn size(&self) -> usize {
        self.transport.size()
    }

    pub fn stats(&self) -> TrafficStats {
        self.stats
    }

    /// Sends one payload to `dest`.
    pub async fn send<P: Payload>(&mut self, dest: Rank, payload: &P) -> Result<(), Error> {
        let frame = Frame::seal(self.rank(), P::TAG, payload.encode()?)?;
        self.send_frame(dest, frame).await
    }

    /// Sends the same payload to every other rank, encoding it once. Returns
    /// the number of peers reached.
    pub async fn send_to_peers<P: Payload>(&mut self, payload: &P) -> Result<usize, Error> {
        let rank = self.rank();
        let frame = Frame::seal(rank, P::TAG, payload.encode()?)?;
        let mut sent = 0;
        for dest in (0..self.size()).filter(|dest| *dest != rank) {
            self.send_frame(dest, frame.clone()).await?;
            sent += 1;
        }
        Ok(sent)
    }

    async fn send_frame(&mut self, dest: Rank, frame: Frame) -> Result<(), Error> {
        if dest >= self.size() || dest == self.rank() {
            Err(Error::InvalidRank(dest))?
        }
        self.stats.messages_sent += 1;
        self.stats.bytes_sent += frame.wire_len() as u64;
        trace!(dest, tag = %frame.tag(), len = frame.body.len(), "frame out");
        self.transport.send(dest, frame).await
    }

    /// Waits for the next payload of type `P` from `source`.
    pub async fn recv<P: Payload>(&mut self, source: Rank) -> Result<Envelope<P>, Error> {
        let frame = self.recv_frame(source, P::TAG).await?;
        open(frame)
    }

    /// Returns a waiting payload of type `P` from any rank without blocking.
    /// Lower ranks are served first.
    pub fn try_recv_any<P: Payload>(&mut self) -> Result<Option<Envelope<P>>, Error> {
        self.pump()?;
        self.take_any(P::TAG).map(open).transpose()
    }

    /// Non-blocking check for waiting traffic on `tag`.
    pub fn probe(&mut self, tag: Tag) -> Result<bool, Error> {
        self.pump()?;
        Ok(self.pending(tag) > 0)
    }

    /// Number of frames on `tag` already pulled off the transport.
    pub fn pending(&self, tag: Tag) -> usize {
        self.mailbox
            .iter()
            .filter(|((_, t), _)| *t == tag)
            .map(|(_, queue)| queue.len())
            .sum()
    }

    /// Drops one waiting frame on `tag` without decoding it and returns its
    /// source.
    pub fn discard_any(&mut self, tag: Tag) -> Result<Option<Rank>, Error> {
        self.pump()?;
        Ok(self.take_any(tag).map(|frame| frame.source))
    }

    /// Moves everything the transport already holds into the mailbox.
    fn pump(&mut self) -> Result<usize, Error> {
        let mut moved = 0;
        while let Some(frame) = self.transport.try_recv()? {
            self.count_inbound(&frame);
            self.stash(frame);
            moved += 1;
        }
        Ok(moved)
    }

    async fn recv_frame(&mut self, source: Rank, tag: Tag) -> Result<Frame, Error> {
        if source >= self.size() {
            Err(Error::InvalidRank(source))?
        }
        if let Some(frame) = self.take(source, tag) {
            return Ok(frame);
        }
        if let Some(rank) = self.interrupted_by() {
            Err(Error::Interrupted(rank))?
        }
        loop {
            let frame = self.next_frame(source, tag).await?;
            if frame.source == source && frame.tag() == tag {
                return Ok(frame);
            }
            let interrupted = self.interrupt == Some(frame.tag());
            let from = frame.source;
            self.stash(frame);
            if interrupted {
                Err(Error::Interrupted(from))?
            }
        }
    }

    async fn next_frame(&mut self, source: Rank, tag: Tag) -> Result<Frame, Error> {
        let frame = match self.recv_timeout {
            Some(after) => tokio::time::timeout(after, self.transport.recv())
                .await
                .map_err(|_| Error::TimedOut { source, tag, after })??,
            None => self.transport.recv().await?,
        };
        self.count_inbound(&frame);
        Ok(frame)
    }

    fn count_inbound(&mut self, frame: &Frame) {
        self.stats.messages_received += 1;
        self.stats.bytes_received += frame.wire_len() as u64;
        trace!(source = frame.source, tag = %frame.tag(), len = frame.body.len(), "frame in");
    }

    fn interrupted_by(&self) -> Option<Rank> {
        let tag = self.interrupt?;
        self.mailbox
            .iter()
            .find(|((_, t), queue)| *t == tag && !queue.is_empty())
            .map(|((source, _), _)| *source)
    }

    fn stash(&mut self, frame: Frame) {
        self.mailbox
            .entry((frame.source, frame.tag()))
            .or_default()
            .push_back(frame);
    }

    fn take(&mut self, source: Rank, tag: Tag) -> Option<Frame> {
        let queue = self.mailbox.get_mut(&(source, tag))?;
        let frame = queue.pop_front();
        if queue.is_empty() {
            self.mailbox.remove(&(source, tag));
        }
        frame
    }

    fn take_any(&mut self, tag: Tag) -> Option<Frame> {
        (0..self.size()).find_map(|source| self.take(source, tag))
    }

    /// Distributes `value` from `root` to every rank. Only the root's value is
    /// used; other ranks pass `None`.
    pub async fn broadcast<P: Payload>(
        &mut self,
        root: Rank,
        value: Option<P>,
    ) -> Result<P, Error> {
        if self.rank() == root {
            let value = value.ok_or(Error::InvalidRank(root))?;
            self.send_to_peers(&value).await?;
            Ok(value)
        } else {
            Ok(self.recv::<P>(root).await?.payload)
        }
    }

    /// Collects one value per rank at `root`, in rank order. Other ranks get
    /// `None`.
    pub async fn gather<P: Payload>(
        &mut self,
        root: Rank,
        value: P,
    ) -> Result<Option<Vec<P>>, Error> {
        if self.rank() != root {
            self.send(root, &value).await?;
            return Ok(None);
        }
        let mut values = Vec::with_capacity(self.size());
        for source in (0..self.size()).filter(|source| *source != root) {
            values.push(self.recv::<P>(source).await?.payload);
        }
        values.insert(root, value);
        Ok(Some(values))
    }

    /// Gathers a different number of items from every rank. Counts go first
    /// so the root can lay out one buffer and verify what each rank sends.
    pub async fn gather_varying<I>(
        &mut self,
        root: Rank,
        items: Vec<I>,
    ) -> Result<Option<Gathered<I>>, Error>
    where
        Vec<I>: Payload,
    {
        let Some(counts) = self.gather(root, Count(items.len() as u64)).await? else {
            self.send(root, &items).await?;
            return Ok(None);
        };

        let mut offsets = Vec::with_capacity(counts.len() + 1);
        offsets.push(0usize);
        for Count(count) in &counts {
            let last = offsets[offsets.len() - 1];
            offsets.push(last + *count as usize);
        }

        let mut buffer = Vec::with_capacity(offsets[counts.len()]);
        let mut own = items;
        for (source, Count(expected)) in counts.iter().enumerate() {
            let batch = if source == root {
                mem::take(&mut own)
            } else {
                self.recv::<Vec<I>>(source).await?.payload
            };
            if batch.len() as u64 != *expected {
                Err(Error::CountMismatch {
                    rank: source,
                    expected: *expected,
                    found: batch.len() as u64,
                })?
            }
            buffer.extend(batch);
        }
        Ok(Some(Gathered {
            items: buffer,
            offsets,
        }))
    }

    /// Folds one value per rank at `root`, in rank order.
    pub async fn reduce<P, F>(&mut self, root: Rank, value: P, fold: F) -> Result<Option<P>, Error>
    where
        P: Payload,
        F: FnMut(P, P) -> P,
    {
        Ok(self
            .gather(root, value)
            .await?
            .and_then(|values| values.into_iter().reduce(fold)))
    }

    /// Returns once every rank has entered the barrier.
    pub async fn barrier(&mut self) -> Result<(), Error> {
        const ROOT: Rank = 0;
        self.epoch += 1;
        let epoch = self.epoch;
        if self.rank() == ROOT {
            for source in 1..self.size() {
                let arrive = self.recv::<Arrive>(source).await?;
                if arrive.payload.epoch != epoch {
                    warn!(
                        source,
                        theirs = arrive.payload.epoch,
                        ours = epoch,
                        "barrier epochs disagree"
                    );
                }
            }
            self.send_to_peers(&Release { epoch }).await?;
        } else {
            self.send(ROOT, &Arrive { epoch }).await?;
            self.recv::<Release>(ROOT).await?;
        }
        Ok(())
    }

    /// Closes the underlying transport.
    pub async fn close(mut self) {
        self.transport.close().await;
    }
}

fn open<P: Payload>(frame: Frame) -> Result<Envelope<P>, Error> {
    let body = frame.open()?;
    Ok(Envelope {
        source: frame.source,
        tag: frame.tag(),
        payload: P::decode(&body)?,
    })
}
