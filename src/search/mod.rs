// A run enumerates every availability pattern over a fixed horizon. Ranks own
// contiguous slices of the pattern space and solve them independently; the
// only traffic between them is cache exchange, a few announcements, metrics at
// the end and the shutdown handshake. Results never depend on that traffic:
// the cache only saves solving time.

pub mod adapter;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod exchange;
pub mod machine;
pub mod metrics;
pub mod partition;
pub mod protocol;
pub mod results;
mod run;
pub mod scenario;
pub mod shutdown;
pub mod solver;
mod worker;

pub use adapter::{FragmentStore, PatternKey, ScenarioSolver};
pub use cache::{CacheConfig, PatternCache};
pub use config::{ArtifactConfig, RunConfig};
pub use error::{ConfigError, Error, ErrorKind, Result};
pub use exchange::ExchangeConfig;
pub use machine::{State, StateMachineConfig};
pub use metrics::{GlobalMetrics, MetricsSnapshot, ResultSummary};
pub use partition::{partition, partition_all, RangeDistribution, WorkRange};
#[cfg(feature = "quic")]
pub use run::run_cluster;
pub use run::{run_local, RunReport};
pub use scenario::Scenario;
pub use solver::{DpSolver, Solver, SolverResult};
pub use worker::{run_worker, WorkerReport};
