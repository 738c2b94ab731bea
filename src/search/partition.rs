use std::ops::Range;

use rkyv::{Archive, Deserialize, Serialize};
use tracing::debug;

use super::error::{ConfigError, Result};
use crate::mesh::{Communicator, Rank, Transport};

/// Half-open range of scenario ids owned by one rank.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
pub struct WorkRange {
    pub start: u64,
    pub end: u64,
}

impl WorkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn ids(&self) -> Range<u64> {
        self.start..self.end
    }
}

/// Contiguous share of `0..total` for `rank`. The first `total % workers`
/// ranks get one extra scenario.
pub fn partition(total: u64, workers: usize, rank: Rank) -> Result<WorkRange, ConfigError> {
    if workers == 0 {
        Err(ConfigError::NoWorkers)?
    }
    if rank >= workers {
        Err(ConfigError::RankOutOfRange { rank, workers })?
    }
    let workers = workers as u64;
    let rank = rank as u64;
    let base = total / workers;
    let extra = total % workers;
    let start = rank * base + rank.min(extra);
    let len = base + u64::from(rank < extra);
    Ok(WorkRange {
        start,
        end: start + len,
    })
}

/// Every rank's range, indexed by rank.
pub fn partition_all(total: u64, workers: usize) -> Result<Vec<WorkRange>, ConfigError> {
    (0..workers.max(1))
        .map(|rank| partition(total, workers, rank))
        .collect()
}

/// How ranks learn their range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RangeDistribution {
    /// Every rank computes its own range.
    #[default]
    Computed,
    /// Rank 0 computes every range and sends each rank its own, in rank order.
    Pushed,
}

/// Establishes this rank's range. Both modes agree.
pub async fn distribute<T: Transport>(
    comm: &mut Communicator<T>,
    total: u64,
    mode: RangeDistribution,
) -> Result<WorkRange> {
    let rank = comm.rank();
    let workers = comm.size();
    let range = match mode {
        RangeDistribution::Computed => partition(total, workers, rank)?,
        RangeDistribution::Pushed if rank == 0 => {
            let ranges = partition_all(total, workers)?;
            for (dest, range) in ranges.iter().enumerate().skip(1) {
                comm.send(dest, range).await?;
            }
            ranges[0]
        }
        RangeDistribution::Pushed => comm.recv::<WorkRange>(0).await?.payload,
    };
    debug!(rank, start = range.start, end = range.end, ?mode, "work range");
    Ok(range)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::mesh::local;

    #[test]
    fn remainder_goes_to_the_first_ranks() {
        let ranges = partition_all(10, 4).unwrap();
        let lens: Vec<u64> = ranges.iter().map(WorkRange::len).collect();
        assert_eq!(lens, vec![3, 3, 2, 2]);
        assert_eq!(ranges[0], WorkRange { start: 0, end: 3 });
        assert_eq!(ranges[3], WorkRange { start: 8, end: 10 });
    }

    #[test]
    fn more_workers_than_work() {
        let ranges = partition_all(2, 4).unwrap();
        assert!(!ranges[1].is_empty());
        assert!(ranges[2].is_empty());
        assert!(ranges[3].is_empty());
        assert_eq!(ranges[3].start, 2);
    }

    #[test]
    fn bad_arguments() {
        assert_eq!(partition(10, 0, 0), Err(ConfigError::NoWorkers));
        assert_eq!(
            partition(10, 2, 2),
            Err(ConfigError::RankOutOfRange { rank: 2, workers: 2 })
        );
    }

    #[tokio::test]
    async fn pushed_ranges_match_computed_ones() {
        let handles: Vec<_> = local::mesh(3)
            .into_iter()
            .map(|transport| {
                tokio::spawn(async move {
                    let mut comm = Communicator::new(transport);
                    let rank = comm.rank();
                    let pushed = distribute(&mut comm, 100, RangeDistribution::Pushed)
                        .await
                        .unwrap();
                    (rank, pushed)
                })
            })
            .collect();
        for handle in handles {
            let (rank, pushed) = handle.await.unwrap();
            assert_eq!(pushed, partition(100, 3, rank).unwrap());
        }
    }

    proptest! {
        #[test]
        fn ranges_tile_the_scenarios(total in 0u64..100_000, workers in 1usize..64) {
            let ranges = partition_all(total, workers).unwrap();
            let mut next = 0;
            for range in &ranges {
                prop_assert_eq!(range.start, next);
                next = range.end;
            }
            prop_assert_eq!(next, total);
            let longest = ranges.iter().map(WorkRange::len).max().unwrap();
            let shortest = ranges.iter().map(WorkRange::len).min().unwrap();
            prop_assert!(longest - shortest <= 1);
        }
    }
}
