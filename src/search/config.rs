use std::{path::PathBuf, sync::Arc, time::Duration};

use byteorder::{ByteOrder, LittleEndian};
use typed_builder::TypedBuilder;

use super::{
    cache::CacheConfig,
    checkpoint::ArtifactDir,
    error::ConfigError,
    exchange::ExchangeConfig,
    machine::StateMachineConfig,
    partition::RangeDistribution,
    results::results_name,
    scenario::total_scenarios,
};

/// Where a run leaves its files.
#[derive(Clone, Debug, PartialEq, Eq, TypedBuilder)]
pub struct ArtifactConfig {
    /// Checkpoints, metrics and result parts.
    #[builder(default = PathBuf::from("."), setter(into))]
    pub output_dir: PathBuf,
    /// Merged result file. Defaults to `results_<run>.csv` in `output_dir`.
    #[builder(default, setter(strip_option, into))]
    pub results_path: Option<PathBuf>,
    #[builder(default = false)]
    pub save_results: bool,
    #[builder(default = ArtifactDir::default_fallback(), setter(into))]
    pub fallback_dir: PathBuf,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ArtifactConfig {
    pub fn dir(&self) -> ArtifactDir {
        ArtifactDir::new(&self.output_dir, &self.fallback_dir)
    }

    pub fn results_target(&self, run_id: u64) -> PathBuf {
        self.results_path
            .clone()
            .unwrap_or_else(|| self.output_dir.join(results_name(run_id)))
    }
}

/// Everything one rank needs to take part in a run. Every rank of a run must
/// be given the same configuration, apart from `threads` and `time_budget`.
#[derive(Clone, Debug, TypedBuilder)]
pub struct RunConfig {
    /// Slots per scenario, 1 to 30.
    pub horizon: u32,
    /// Solver threads per worker.
    #[builder(default = 1)]
    pub threads: usize,
    #[builder(default = Arc::new(StateMachineConfig::standard()))]
    pub machine: Arc<StateMachineConfig>,
    #[builder(default)]
    pub cache: CacheConfig,
    #[builder(default)]
    pub exchange: ExchangeConfig,
    #[builder(default)]
    pub artifacts: ArtifactConfig,
    #[builder(default)]
    pub distribution: RangeDistribution,
    /// Fixed run id. Rank 0 picks a random one otherwise.
    #[builder(default, setter(strip_option))]
    pub run_id: Option<u64>,
    /// Wall clock allowance for the search loop of each worker.
    #[builder(default, setter(strip_option))]
    pub time_budget: Option<Duration>,
    /// Caps the run to the first this many scenarios.
    #[builder(default, setter(strip_option))]
    pub scenario_limit: Option<u64>,
    /// Above this many scenarios the metrics reduction is replaced by a
    /// summary assembled from per-worker files.
    #[builder(default = 1 << 18)]
    pub reduction_threshold: u64,
    /// Progress checkpoints per worker.
    #[builder(default = 4)]
    pub checkpoints: u32,
    /// Scenarios per parallel batch and thread.
    #[builder(default = 64)]
    pub batch_per_thread: u64,
    /// Polls spent waiting for peers' flush markers at shutdown.
    #[builder(default = 10_000)]
    pub drain_iterations: usize,
    /// Upper bound on any single blocking receive.
    #[builder(default, setter(strip_option))]
    pub collective_timeout: Option<Duration>,
    /// Bound on the barrier attempted while aborting.
    #[builder(default = Duration::from_secs(10))]
    pub abort_timeout: Duration,
}

impl RunConfig {
    pub fn validate(&self, workers: usize) -> Result<(), ConfigError> {
        total_scenarios(self.horizon)?;
        if workers == 0 {
            Err(ConfigError::NoWorkers)?
        }
        if self.threads == 0 {
            Err(ConfigError::invalid("threads", "must be at least 1"))?
        }
        if self.batch_per_thread == 0 {
            Err(ConfigError::invalid("batch_per_thread", "must be at least 1"))?
        }
        if self.scenario_limit == Some(0) {
            Err(ConfigError::invalid("scenario_limit", "must be at least 1"))?
        }
        if self.collective_timeout.is_some_and(|timeout| timeout.is_zero()) {
            Err(ConfigError::invalid("collective_timeout", "must not be zero"))?
        }
        self.cache.validate()?;
        self.exchange.validate(workers)?;
        Ok(())
    }

    /// Scenarios this run enumerates.
    pub fn total(&self) -> Result<u64, ConfigError> {
        let total = total_scenarios(self.horizon)?;
        Ok(self.scenario_limit.map_or(total, |limit| limit.min(total)))
    }

    /// Hash of everything ranks must agree on. QUIC peers refuse each other
    /// when their fingerprints differ.
    pub fn fingerprint(&self, workers: usize) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"sweep run v1");
        let mut put = |value: u64| {
            let mut word = [0u8; 8];
            LittleEndian::write_u64(&mut word, value);
            hasher.update(&word);
        };

        put(self.horizon as u64);
        put(workers as u64);
        put(self.scenario_limit.unwrap_or(u64::MAX));
        put(self.run_id.unwrap_or(u64::MAX));
        put(self.reduction_threshold);
        put(self.checkpoints as u64);
        put(self.distribution as u64);
        put(self.artifacts.save_results as u64);

        for cost in self.machine.costs() {
            put(cost.to_bits());
        }
        put(self.machine.deficit_state().map_or(u64::MAX, |state| state.code() as u64));
        put(self.machine.transition_count() as u64);

        let cache = &self.cache;
        put(cache.max_size as u64);
        put(cache.eviction_fraction.to_bits());
        put(cache.min_solve_time.as_nanos().min(u64::MAX as u128) as u64);
        put(cache.min_use_count as u64);
        put(cache.exchange_cap as u64);
        put(cache.exchange_fraction.to_bits());

        let exchange = &self.exchange;
        put(exchange.enabled as u64);
        put(exchange.interval);
        put(exchange.share_every);
        put(exchange.poll_interval);
        put(exchange.collector as u64);

        *hasher.finalize().as_bytes()
    }

    /// Whether the end-of-run metrics skip the collective reduction.
    pub fn robust(&self, total: u64) -> bool {
        total > self.reduction_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        let config = RunConfig::builder().horizon(10).build();
        assert_eq!(config.validate(4), Ok(()));
        assert_eq!(config.validate(0), Err(ConfigError::NoWorkers));

        let config = RunConfig::builder().horizon(31).build();
        assert_eq!(
            config.validate(1),
            Err(ConfigError::Horizon { got: 31, max: 30 })
        );
        let config = RunConfig::builder().horizon(0).build();
        assert!(config.validate(1).is_err());

        let config = RunConfig::builder().horizon(4).threads(0).build();
        assert!(matches!(
            config.validate(1),
            Err(ConfigError::Invalid { field: "threads", .. })
        ));

        let exchange = ExchangeConfig::builder().collector(3).build();
        let config = RunConfig::builder().horizon(4).exchange(exchange).build();
        assert_eq!(
            config.validate(2),
            Err(ConfigError::RankOutOfRange {
                rank: 3,
                workers: 2
            })
        );
    }

    #[test]
    fn limit_caps_total() {
        let config = RunConfig::builder().horizon(10).build();
        assert_eq!(config.total(), Ok(1024));
        let config = RunConfig::builder().horizon(10).scenario_limit(1000).build();
        assert_eq!(config.total(), Ok(1000));
        let config = RunConfig::builder().horizon(3).scenario_limit(1000).build();
        assert_eq!(config.total(), Ok(8));
    }

    #[test]
    fn fingerprint_tracks_shared_settings() {
        let base = RunConfig::builder().horizon(12).build();
        assert_eq!(base.fingerprint(4), base.fingerprint(4));
        assert_ne!(base.fingerprint(4), base.fingerprint(3));

        let other = RunConfig::builder().horizon(13).build();
        assert_ne!(base.fingerprint(4), other.fingerprint(4));

        // local knobs do not matter
        let threaded = RunConfig::builder()
            .horizon(12)
            .threads(8)
            .time_budget(Duration::from_secs(1))
            .build();
        assert_eq!(base.fingerprint(4), threaded.fingerprint(4));
    }

    #[test]
    fn results_default_next_to_artifacts() {
        let artifacts = ArtifactConfig::builder().output_dir("out").build();
        assert_eq!(
            artifacts.results_target(1),
            PathBuf::from("out").join(results_name(1))
        );
        let artifacts = ArtifactConfig::builder()
            .output_dir("out")
            .results_path("all.csv")
            .build();
        assert_eq!(artifacts.results_target(1), PathBuf::from("all.csv"));
    }
}
