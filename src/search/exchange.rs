use std::cmp::Ordering;

use hashbrown::HashMap;
use tracing::{debug, trace};
use typed_builder::TypedBuilder;

use super::{
    cache::{CacheConfig, PatternCache},
    error::{ConfigError, Result},
    protocol::{Discovery, PatternRecord, Selection, Vote},
};
use crate::mesh::{Communicator, Rank, Transport};

#[derive(Clone, Debug, PartialEq, Eq, TypedBuilder)]
pub struct ExchangeConfig {
    /// Turns every exchange round off. Discoveries are still absorbed.
    #[builder(default = true)]
    pub enabled: bool,
    /// Scenarios between periodic rounds.
    #[builder(default = 1000)]
    pub interval: u64,
    /// Every this many valid solutions one short run is announced to peers.
    /// Zero turns announcements off.
    #[builder(default = 500)]
    pub share_every: u64,
    /// Scenarios between non-blocking polls for announcements.
    #[builder(default = 256)]
    pub poll_interval: u64,
    /// Rank that selects and distributes records.
    #[builder(default = 0)]
    pub collector: Rank,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ExchangeConfig {
    pub fn validate(&self, workers: usize) -> Result<(), ConfigError> {
        if self.interval == 0 {
            Err(ConfigError::invalid("exchange.interval", "must be at least 1"))?
        }
        if self.poll_interval == 0 {
            Err(ConfigError::invalid("exchange.poll_interval", "must be at least 1"))?
        }
        if self.collector >= workers {
            Err(ConfigError::RankOutOfRange {
                rank: self.collector,
                workers,
            })?
        }
        Ok(())
    }
}

/// Decides when a worker takes part in exchange rounds and announcements.
///
/// Every rank plans the same number of periodic rounds, derived from the
/// smallest share of the work, so the collective rounds line up even though
/// ranges differ by one scenario.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeScheduler {
    interval: u64,
    planned: u64,
    completed: u64,
    cancelled: bool,
    share_every: u64,
    valid_seen: u64,
    poll_interval: u64,
    since_poll: u64,
}

impl ExchangeScheduler {
    pub fn new(config: &ExchangeConfig, total: u64, workers: usize) -> Self {
        let interval = config.interval.max(1);
        let min_assigned = total / workers.max(1) as u64;
        Self {
            interval,
            planned: if config.enabled {
                min_assigned / interval
            } else {
                0
            },
            completed: 0,
            cancelled: false,
            share_every: config.share_every,
            valid_seen: 0,
            poll_interval: config.poll_interval.max(1),
            since_poll: 0,
        }
    }

    pub fn planned_rounds(&self) -> u64 {
        self.planned
    }

    pub fn completed_rounds(&self) -> u64 {
        self.completed
    }

    pub fn rounds_remaining(&self) -> u64 {
        if self.cancelled {
            0
        } else {
            self.planned - self.completed
        }
    }

    /// Scenario count at which the next periodic round happens.
    pub fn next_mark(&self) -> Option<u64> {
        (self.rounds_remaining() > 0).then(|| (self.completed + 1) * self.interval)
    }

    pub fn round_due(&self, processed: u64) -> bool {
        self.next_mark().is_some_and(|mark| processed >= mark)
    }

    pub fn complete_round(&mut self) {
        self.completed = (self.completed + 1).min(self.planned);
    }

    /// Drops the periodic rounds that have not happened yet.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Counts a valid solution. Returns whether it is time for an
    /// announcement.
    pub fn record_valid(&mut self) -> bool {
        self.valid_seen += 1;
        self.share_every > 0 && self.valid_seen % self.share_every == 0
    }

    /// Counts a processed scenario. Returns whether it is time to poll for
    /// announcements.
    pub fn poll_due(&mut self) -> bool {
        self.since_poll += 1;
        if self.since_poll >= self.poll_interval {
            self.since_poll = 0;
            true
        } else {
            false
        }
    }
}

/// What one round did on this rank.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoundOutcome {
    pub offered: usize,
    pub selected: usize,
    pub merged: usize,
    pub stop: bool,
}

fn rank_records(a: &PatternRecord, b: &PatternRecord) -> Ordering {
    b.value()
        .total_cmp(&a.value())
        .then(a.origin.cmp(&b.origin))
        .then(a.pattern.cmp(&b.pattern))
}

/// Collector side of a round: one record per key, the most valuable ones
/// first.
pub fn select(offers: Vec<PatternRecord>, config: &CacheConfig) -> Vec<PatternRecord> {
    let mut distinct: HashMap<[u8; 32], PatternRecord> = HashMap::with_capacity(offers.len());
    for record in offers {
        distinct
            .entry(record.pattern)
            .and_modify(|kept| {
                if rank_records(&record, kept) == Ordering::Less {
                    *kept = record;
                }
            })
            .or_insert(record);
    }
    let mut ranked: Vec<PatternRecord> = distinct.into_values().collect();
    ranked.sort_by(rank_records);
    ranked.truncate(config.selection_size(ranked.len()));
    ranked
}

/// One collective exchange round. Every rank must call this the same number
/// of times. Records are merged absent-only, so nothing a rank solved itself
/// is ever replaced.
pub async fn exchange_round<T: Transport>(
    comm: &mut Communicator<T>,
    cache: &mut PatternCache,
    collector: Rank,
    stop: bool,
) -> Result<RoundOutcome> {
    let rank = comm.rank();
    let vote = comm
        .reduce(collector, Vote(stop), |a, b| Vote(a.0 || b.0))
        .await?;

    let offers = cache.valuable(rank);
    let offered = offers.len();
    let gathered = comm.gather_varying(collector, offers).await?;

    let selection = match (gathered, vote) {
        (Some(gathered), Some(Vote(stop))) => {
            let total = gathered.items.len();
            let records = select(gathered.items, cache.config());
            debug!(offered = total, selected = records.len(), stop, "exchange selection");
            Some(Selection { records, stop })
        }
        _ => None,
    };
    let selection = comm.broadcast(collector, selection).await?;

    let mut merged = 0;
    for record in &selection.records {
        if record.origin as Rank != rank && cache.merge_remote(record) {
            merged += 1;
        }
    }
    trace!(rank, offered, merged, "exchange round done");
    Ok(RoundOutcome {
        offered,
        selected: selection.records.len(),
        merged,
        stop: selection.stop,
    })
}

/// Announces one fragment to every peer. Returns the number of peers reached.
pub async fn share_discovery<T: Transport>(
    comm: &mut Communicator<T>,
    record: PatternRecord,
) -> Result<usize> {
    Ok(comm.send_to_peers(&Discovery(record)).await?)
}

/// Merges every announcement that already arrived. Returns how many were
/// received and how many were new to the cache.
pub fn absorb_discoveries<T: Transport>(
    comm: &mut Communicator<T>,
    cache: &mut PatternCache,
) -> Result<(u64, u64)> {
    let mut received = 0;
    let mut merged = 0;
    while let Some(envelope) = comm.try_recv_any::<Discovery>()? {
        received += 1;
        if cache.merge_remote(&envelope.payload.0) {
            merged += 1;
        }
    }
    Ok((received, merged))
}
