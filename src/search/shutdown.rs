use std::time::Duration;

use tracing::{debug, info, warn};

use super::{
    error::{Error, Result},
    protocol::{tags, Abort, Flush},
};
use crate::mesh::{Communicator, Tag, Transport};

const IDLE_POLL: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Running,
    Draining,
    Barrier,
    Terminated,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Frames consumed while draining, markers included.
    pub drained: usize,
    /// Exchange frames still waiting after the barrier.
    pub residual: usize,
    /// Whether every peer's flush marker arrived.
    pub flushed: bool,
}

impl ShutdownReport {
    pub fn clean(&self) -> bool {
        self.flushed && self.residual == 0
    }
}

/// Takes a worker from its search loop to a state where nothing is left in
/// flight. Point-to-point announcements have no collective to retire them, so
/// every rank ends its traffic with a flush marker and waits for everyone
/// else's before the final barrier.
pub struct ShutdownCoordinator {
    phase: Phase,
    discoveries_sent: u64,
    flushed: bool,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            phase: Phase::Running,
            discoveries_sent: 0,
            flushed: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn count_discovery(&mut self) {
        self.discoveries_sent += 1;
    }

    /// Announces the end of this rank's traffic and discards what peers still
    /// send until every peer did the same, or `max_iterations` polls passed.
    /// Returns the number of frames consumed.
    pub async fn drain_pending<T: Transport>(
        &mut self,
        comm: &mut Communicator<T>,
        max_iterations: usize,
    ) -> Result<usize> {
        self.drain(comm, max_iterations, &[tags::DISCOVERY]).await
    }

    async fn drain<T: Transport>(
        &mut self,
        comm: &mut Communicator<T>,
        max_iterations: usize,
        discard: &[Tag],
    ) -> Result<usize> {
        self.phase = Phase::Draining;
        comm.send_to_peers(&Flush {
            sent: self.discoveries_sent,
        })
        .await?;

        let rank = comm.rank();
        let mut waiting: Vec<bool> = (0..comm.size()).map(|peer| peer != rank).collect();
        let mut remaining = comm.size().saturating_sub(1);
        let mut drained = 0;
        let mut iterations = 0;
        while remaining > 0 && iterations < max_iterations {
            iterations += 1;
            let mut progressed = false;
            // a peer's traffic precedes its marker, so markers go first
            while let Some(source) = comm.discard_any(tags::FLUSH)? {
                drained += 1;
                progressed = true;
                if std::mem::take(&mut waiting[source]) {
                    remaining -= 1;
                }
            }
            for tag in discard {
                while comm.discard_any(*tag)?.is_some() {
                    drained += 1;
                    progressed = true;
                }
            }
            if remaining == 0 {
                break;
            }
            if progressed {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(IDLE_POLL).await;
            }
        }

        self.flushed = remaining == 0;
        if self.flushed {
            debug!(rank, drained, iterations, "drained");
        } else {
            let missing: Vec<usize> = waiting
                .iter()
                .enumerate()
                .filter(|(_, waiting)| **waiting)
                .map(|(peer, _)| peer)
                .collect();
            warn!(rank, drained, iterations, ?missing, "gave up waiting for flush markers");
        }
        Ok(drained)
    }

    /// Final barrier, then one non-blocking pass that must find the exchange
    /// channels empty.
    pub async fn barrier<T: Transport>(
        &mut self,
        comm: &mut Communicator<T>,
        drained: usize,
    ) -> Result<ShutdownReport> {
        self.phase = Phase::Barrier;
        comm.barrier().await?;

        let mut residual = 0;
        for tag in tags::EXCHANGE {
            comm.probe(tag)?;
            residual += comm.pending(tag);
        }
        self.phase = Phase::Terminated;
        let report = ShutdownReport {
            drained,
            residual,
            flushed: self.flushed,
        };
        if residual > 0 {
            warn!(rank = comm.rank(), residual, "exchange traffic left after barrier");
        }
        Ok(report)
    }

    /// Normal shutdown: drain, then barrier. A peer that aborted meanwhile
    /// turns this into an error.
    pub async fn shutdown<T: Transport>(
        &mut self,
        comm: &mut Communicator<T>,
        max_iterations: usize,
    ) -> Result<ShutdownReport> {
        let drained = self.drain_pending(comm, max_iterations).await?;
        let report = self.barrier(comm, drained).await?;
        comm.probe(tags::ABORT)?;
        if let Some(rank) = comm.discard_any(tags::ABORT)? {
            Err(Error::PeerAborted { rank })?
        }
        Ok(report)
    }

    /// Error path. Tells every peer the run is over, drains and attempts the
    /// barrier under `timeout`. Failures along the way are logged, the
    /// original error is what the caller reports.
    pub async fn abort<T: Transport>(
        &mut self,
        comm: &mut Communicator<T>,
        reason: &str,
        max_iterations: usize,
        timeout: Duration,
    ) -> ShutdownReport {
        let rank = comm.rank();
        comm.set_interrupt(None);
        comm.set_recv_timeout(Some(timeout));
        if let Err(e) = comm
            .send_to_peers(&Abort {
                reason: reason.to_owned(),
            })
            .await
        {
            warn!(rank, error = %e, "could not announce abort");
        }

        let drained = match self
            .drain(comm, max_iterations, &[tags::DISCOVERY, tags::ABORT])
            .await
        {
            Ok(drained) => drained,
            Err(e) => {
                warn!(rank, error = %e, "drain failed while aborting");
                0
            }
        };

        match tokio::time::timeout(timeout, self.barrier(comm, drained)).await {
            Ok(Ok(report)) => {
                info!(rank, ?report, "aborted cleanly");
                report
            }
            Ok(Err(e)) => {
                warn!(rank, error = %e, "barrier failed while aborting");
                self.phase = Phase::Terminated;
                ShutdownReport {
                    drained,
                    residual: 0,
                    flushed: self.flushed,
                }
            }
            Err(_) => {
                warn!(rank, ?timeout, "barrier timed out while aborting");
                self.phase = Phase::Terminated;
                ShutdownReport {
                    drained,
                    residual: 0,
                    flushed: self.flushed,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mesh::{local, Error as MeshError},
        search::protocol::{Discovery, PatternRecord},
    };

    fn record() -> PatternRecord {
        PatternRecord {
            pattern: [0; 32],
            pattern_len: 0,
            states: [0; 32],
            cost: 0.0,
            frequency: 0,
            solve_time_us: 0,
            origin: 0,
        }
    }

    #[tokio::test]
    async fn nothing_is_left_after_shutdown() {
        let handles: Vec<_> = local::mesh(4)
            .into_iter()
            .map(|transport| {
                tokio::spawn(async move {
                    let mut comm = Communicator::new(transport);
                    let mut coordinator = ShutdownCoordinator::new();
                    // a burst of announcements right before shutting down
                    for _ in 0..comm.rank() * 3 {
                        comm.send_to_peers(&Discovery(record())).await.unwrap();
                        coordinator.count_discovery();
                    }
                    let report = coordinator.shutdown(&mut comm, 10_000).await.unwrap();
                    (coordinator.phase(), report)
                })
            })
            .collect();

        for handle in handles {
            let (phase, report) = handle.await.unwrap();
            assert_eq!(phase, Phase::Terminated);
            assert!(report.clean());
            assert!(report.drained >= 3);
        }
    }

    #[tokio::test]
    async fn drain_gives_up_on_silent_peers() {
        let mut comms: Vec<_> = local::mesh(2).into_iter().map(Communicator::new).collect();
        let _silent = comms.pop().unwrap();
        let mut first = comms.pop().unwrap();
        let mut coordinator = ShutdownCoordinator::new();
        let drained = coordinator.drain_pending(&mut first, 5).await.unwrap();
        assert_eq!(drained, 0);
        assert_eq!(coordinator.phase(), Phase::Draining);
    }

    #[tokio::test]
    async fn abort_interrupts_blocked_peers() {
        let mut transports = local::mesh(2);
        let second = transports.pop().unwrap();
        let first = transports.pop().unwrap();

        let failing = tokio::spawn(async move {
            let mut comm = Communicator::new(first);
            let mut coordinator = ShutdownCoordinator::new();
            coordinator
                .abort(&mut comm, "disk full", 1000, Duration::from_secs(5))
                .await
        });
        let waiting = tokio::spawn(async move {
            let mut comm = Communicator::new(second);
            comm.set_interrupt(Some(tags::ABORT));
            // blocked in a collective the failing rank never joins
            let err = comm.barrier().await.unwrap_err();
            assert!(matches!(err, MeshError::Interrupted(0)));
            let mut coordinator = ShutdownCoordinator::new();
            coordinator
                .abort(&mut comm, "peer aborted", 1000, Duration::from_secs(5))
                .await
        });

        let failed = failing.await.unwrap();
        let waited = waiting.await.unwrap();
        assert!(failed.flushed);
        assert!(waited.flushed);
    }
}
