use std::thread;

use tracing::{info, warn};

use super::{
    checkpoint::run_label,
    config::RunConfig,
    error::{Error, ErrorKind, Result},
    metrics::{GlobalMetrics, ResultSummary},
    worker::{run_worker, WorkerReport},
};
use crate::mesh::{local, Transport};

/// Every rank's report of a run executed in this process.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub run_id: u64,
    pub workers: Vec<WorkerReport>,
}

impl RunReport {
    pub fn processed(&self) -> u64 {
        self.workers.iter().map(|w| w.snapshot.processed).sum()
    }

    pub fn summary(&self) -> ResultSummary {
        let mut summary = ResultSummary::default();
        for worker in &self.workers {
            summary.merge(&worker.snapshot.summary);
        }
        summary
    }

    /// Whole-run metrics, when the coordinator reduced them.
    pub fn global(&self) -> Option<&GlobalMetrics> {
        self.workers.iter().find_map(|w| w.global.as_ref())
    }

    pub fn coordinator(&self) -> Option<&WorkerReport> {
        self.workers.first()
    }
}

/// Runs `workers` simulated ranks in this process, each on its own thread
/// and runtime, connected by an in-process mesh.
pub fn run_local(config: &RunConfig, workers: usize) -> Result<RunReport> {
    config.validate(workers)?;
    let outcomes: Vec<Result<WorkerReport>> = thread::scope(|scope| {
        let handles: Vec<_> = local::mesh(workers)
            .into_iter()
            .map(|transport| {
                let rank = transport.rank();
                (rank, scope.spawn(move || on_runtime(transport, config)))
            })
            .collect();
        handles
            .into_iter()
            .map(|(rank, handle)| {
                handle
                    .join()
                    .unwrap_or(Err(Error::Panicked { rank }))
            })
            .collect()
    });

    let mut reports = Vec::with_capacity(workers);
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(report) => reports.push(report),
            Err(e) => failures.push(e),
        }
    }
    if let Some(error) = root_cause(failures) {
        Err(error)?
    }

    let run_id = reports.first().map_or(0, |report| report.run_id);
    let report = RunReport {
        run_id,
        workers: reports,
    };
    info!(
        run = %run_label(run_id),
        processed = report.processed(),
        workers,
        "local run complete"
    );
    Ok(report)
}

fn on_runtime<T: Transport>(transport: T, config: &RunConfig) -> Result<WorkerReport> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(Error::Runtime)?;
    runtime.block_on(run_worker(transport, config))
}

/// A failing rank makes its peers fail too. The error worth reporting is the
/// first one that is not a consequence of another rank going away.
fn root_cause(failures: Vec<Error>) -> Option<Error> {
    if failures.len() > 1 {
        warn!(failed = failures.len(), "several ranks failed");
    }
    let cause = failures
        .iter()
        .position(|e| e.kind() != ErrorKind::Transport)
        .unwrap_or(0);
    failures.into_iter().nth(cause)
}

/// Joins a QUIC mesh as one rank and runs it.
#[cfg(feature = "quic")]
pub async fn run_cluster(
    config: &RunConfig,
    mesh: &crate::mesh::endpoint::MeshConfig,
) -> Result<WorkerReport> {
    use super::error::ConfigError;
    use crate::mesh::endpoint::QuicTransport;

    let workers = mesh.peers.len();
    config.validate(workers)?;
    if mesh.rank >= workers {
        Err(ConfigError::RankOutOfRange {
            rank: mesh.rank,
            workers,
        })?
    }
    if mesh.fingerprint != config.fingerprint(workers) {
        Err(ConfigError::invalid(
            "fingerprint",
            "mesh was configured for a different run",
        ))?
    }
    let transport = QuicTransport::join(mesh).await?;
    run_worker(transport, config).await
}
