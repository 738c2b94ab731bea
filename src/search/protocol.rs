use rkyv::{Archive, Deserialize, Serialize};

use super::{
    adapter::{PatternKey, MAX_PATTERN_LEN},
    cache::CacheEntry,
    machine::State,
    metrics::MetricsAccumulator,
    partition::WorkRange,
};
use crate::mesh::{wire::archived_payload, Rank, Tag};

/// Channels of the search layer.
pub mod tags {
    use crate::mesh::Tag;

    pub const PLAN: Tag = Tag(8);
    pub const RANGE: Tag = Tag(9);
    pub const EXCHANGE_VOTE: Tag = Tag(10);
    pub const EXCHANGE_RECORDS: Tag = Tag(11);
    pub const EXCHANGE_SELECTION: Tag = Tag(12);
    pub const DISCOVERY: Tag = Tag(13);
    pub const FLUSH: Tag = Tag(14);
    pub const ABORT: Tag = Tag(15);
    pub const METRICS: Tag = Tag(16);

    /// Tags that carry cache traffic and must be empty once a run shuts down.
    pub const EXCHANGE: [Tag; 5] = [
        EXCHANGE_VOTE,
        EXCHANGE_RECORDS,
        EXCHANGE_SELECTION,
        DISCOVERY,
        FLUSH,
    ];
}

/// A cache entry in fixed-size form, as offered to and distributed by the
/// collector.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct PatternRecord {
    pub pattern: [u8; MAX_PATTERN_LEN],
    pub pattern_len: u8,
    pub states: [u8; MAX_PATTERN_LEN],
    pub cost: f64,
    pub frequency: u32,
    pub solve_time_us: u64,
    pub origin: u32,
}

impl PatternRecord {
    /// Packs `entry` for the exchange. Returns `None` when the key text or the
    /// schedule does not fit a record.
    pub fn from_entry(entry: &CacheEntry, origin: Rank) -> Option<Self> {
        let text = entry.pattern.to_string();
        if text.len() > MAX_PATTERN_LEN || entry.partial_states.len() > MAX_PATTERN_LEN {
            return None;
        }
        let mut pattern = [0u8; MAX_PATTERN_LEN];
        pattern[..text.len()].copy_from_slice(text.as_bytes());
        let mut states = [0u8; MAX_PATTERN_LEN];
        for (slot, state) in entry.partial_states.iter().enumerate() {
            states[slot] = state.code();
        }
        Some(Self {
            pattern,
            pattern_len: text.len() as u8,
            states,
            cost: entry.accumulated_cost,
            frequency: entry.use_count,
            solve_time_us: entry.solve_time.as_micros().min(u64::MAX as u128) as u64,
            origin: origin as u32,
        })
    }

    pub fn pattern_text(&self) -> Option<&str> {
        let len = (self.pattern_len as usize).min(MAX_PATTERN_LEN);
        std::str::from_utf8(&self.pattern[..len]).ok()
    }

    pub fn key(&self) -> Option<PatternKey> {
        self.pattern_text()?.parse().ok()
    }

    /// Decoded schedule, checked against the length of the key.
    pub fn schedule(&self) -> Option<Vec<State>> {
        let len = self.key()?.len();
        self.states[..len]
            .iter()
            .map(|code| State::from_code(*code))
            .collect()
    }

    /// How much solving time the record saves, used to rank offers.
    pub fn value(&self) -> f64 {
        self.frequency as f64 * self.solve_time_us as f64
    }
}

/// Stop vote sent ahead of an exchange round.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Vote(pub bool);

/// What the collector distributes at the end of a round.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct Selection {
    pub records: Vec<PatternRecord>,
    /// Set when any rank asked to stop processing.
    pub stop: bool,
}

/// A single fragment announced to every peer between rounds.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct Discovery(pub PatternRecord);

/// End of a rank's point-to-point traffic.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Flush {
    /// Discoveries the sender sent during the run.
    pub sent: u64,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Abort {
    pub reason: String,
}

/// Facts about a run that rank 0 decides and everyone else adopts.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct RunPlan {
    pub run_id: u64,
    pub horizon: u32,
    pub total: u64,
    pub workers: u32,
    pub started_ms: i64,
}

archived_payload!(RunPlan => tags::PLAN);
archived_payload!(WorkRange => tags::RANGE);
archived_payload!(Vote => tags::EXCHANGE_VOTE);
archived_payload!(Vec<PatternRecord> => tags::EXCHANGE_RECORDS);
archived_payload!(Selection => tags::EXCHANGE_SELECTION);
archived_payload!(Discovery => tags::DISCOVERY);
archived_payload!(Flush => tags::FLUSH);
archived_payload!(Abort => tags::ABORT);
archived_payload!(MetricsAccumulator => tags::METRICS);

/// Tag values stay clear of the mesh's own channels.
const _: () = assert!(tags::PLAN.0 > Tag::COUNT.0 && tags::METRICS.0 <= Tag::MAX);

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        mesh::{Frame, Payload},
        search::{adapter::FragmentKind, cache::Origin},
    };

    fn entry() -> CacheEntry {
        CacheEntry {
            pattern: PatternKey::new(FragmentKind::Run, &[false, true, true, false]).unwrap(),
            partial_states: vec![State::OnHot, State::OffHot, State::OnWarm, State::OnHot],
            accumulated_cost: 12.5,
            use_count: 4,
            last_used: 9,
            solve_time: Duration::from_micros(250),
            origin: Origin::Local,
        }
    }

    #[test]
    fn records_carry_entries() {
        let entry = entry();
        let record = PatternRecord::from_entry(&entry, 3).unwrap();
        assert_eq!(record.pattern_text(), Some("r0110"));
        assert_eq!(record.key(), Some(entry.pattern));
        assert_eq!(record.schedule(), Some(entry.partial_states.clone()));
        assert_eq!(record.value(), 1000.0);
        assert_eq!(record.origin, 3);

        let decoded = Discovery::decode(&Discovery(record).encode().unwrap()).unwrap();
        assert_eq!(decoded.0, record);
    }

    #[test]
    fn corrupt_records_are_refused() {
        let mut record = PatternRecord::from_entry(&entry(), 0).unwrap();
        record.states[1] = 42;
        assert_eq!(record.schedule(), None);

        record.pattern[0] = b'?';
        assert_eq!(record.key(), None);
    }

    #[test]
    fn selections_survive_compression() {
        let record = PatternRecord::from_entry(&entry(), 1).unwrap();
        let selection = Selection {
            records: vec![record; 500],
            stop: true,
        };
        let frame = Frame::seal(1, Selection::TAG, selection.encode().unwrap()).unwrap();
        assert!(frame.prefix.compressed());
        assert_eq!(Selection::decode(&frame.open().unwrap()).unwrap(), selection);
    }
}
