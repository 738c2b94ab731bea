use std::{
    ops::Range,
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use chrono::Utc;
use rayon::prelude::*;
use tracing::{debug, debug_span, info, warn, Instrument};

use super::{
    adapter::{FreshFragment, PatternKey, ScenarioSolver, SolverStats},
    cache::{CacheView, PatternCache},
    checkpoint::{
        run_label, write_consolidated_summary, write_global_metrics, write_worker_metrics,
        ArtifactDir, Checkpointer, ConsolidatedSummary, Stage,
    },
    config::RunConfig,
    error::{ConfigError, Error, Result},
    exchange::{absorb_discoveries, exchange_round, share_discovery, ExchangeScheduler},
    metrics::{peak_rss_bytes, GlobalMetrics, MetricsAccumulator, MetricsSnapshot},
    partition::{distribute, WorkRange},
    protocol::{tags, PatternRecord, RunPlan},
    results::{merge_parts, MergeOutcome, ResultWriter},
    scenario::Scenario,
    shutdown::{Phase, ShutdownCoordinator, ShutdownReport},
    solver::{DpSolver, SolverResult},
};
use crate::mesh::{Communicator, Rank, Transport};

const COORDINATOR: Rank = 0;

/// What one rank did during a run.
#[derive(Clone, Debug)]
pub struct WorkerReport {
    pub rank: Rank,
    pub run_id: u64,
    pub range: WorkRange,
    pub snapshot: MetricsSnapshot,
    /// Only on the coordinator, when the metrics were reduced.
    pub global: Option<GlobalMetrics>,
    /// Only on the coordinator, when the reduction was skipped.
    pub summary: Option<ConsolidatedSummary>,
    /// Only on the coordinator, when results were saved.
    pub results: Option<MergeOutcome>,
    pub shutdown: ShutdownReport,
    pub artifacts: Vec<PathBuf>,
}

/// Runs one rank of a search over `transport` until the run completes or
/// fails. A failing rank tells its peers before returning the error.
pub async fn run_worker<T: Transport>(transport: T, config: &RunConfig) -> Result<WorkerReport> {
    let rank = transport.rank();
    let span = debug_span!("worker", rank);
    async move {
        config.validate(transport.size())?;
        let mut comm = Communicator::new(transport);
        comm.set_recv_timeout(config.collective_timeout);
        comm.set_interrupt(Some(tags::ABORT));

        let mut session = Session::new(comm, config);
        let outcome = session.run().await;
        if let Err(e) = &outcome {
            warn!(error = %e, "run failed");
            session.abort(e).await;
        }
        session.comm.close().await;
        outcome
    }
    .instrument(span)
    .await
}

/// Solver side state of one rank's search.
struct Search {
    cache: PatternCache,
    solver: ScenarioSolver<DpSolver>,
    // one per pool thread, only with `threads > 1`
    pool: Option<(rayon::ThreadPool, Vec<ScenarioSolver<DpSolver>>)>,
    scheduler: ExchangeScheduler,
    results: Option<ResultWriter>,
    next: u64,
    end: u64,
    processed: u64,
}

impl Search {
    fn stats(&self) -> SolverStats {
        let mut stats = self.solver.stats();
        for solver in self.pool.iter().flat_map(|(_, solvers)| solvers) {
            let other = solver.stats();
            stats.hits += other.hits;
            stats.misses += other.misses;
            stats.fresh_solves += other.fresh_solves;
        }
        stats
    }

    fn done(&self) -> bool {
        self.next >= self.end
    }
}

/// What one pool job produced, folded into the owner in job order.
#[derive(Default)]
struct BatchPart {
    solved: Vec<(Scenario, SolverResult)>,
    fresh: Vec<FreshFragment>,
    touched: Vec<PatternKey>,
}

struct Session<'c, T> {
    comm: Communicator<T>,
    config: &'c RunConfig,
    coordinator: ShutdownCoordinator,
    started: Instant,
    snapshot: MetricsSnapshot,
    checkpointer: Option<Checkpointer>,
    artifacts: Vec<PathBuf>,
}

impl<'c, T: Transport> Session<'c, T> {
    fn new(comm: Communicator<T>, config: &'c RunConfig) -> Self {
        let snapshot = MetricsSnapshot {
            rank: comm.rank(),
            ..MetricsSnapshot::default()
        };
        Self {
            comm,
            config,
            coordinator: ShutdownCoordinator::new(),
            started: Instant::now(),
            snapshot,
            checkpointer: None,
            artifacts: Vec::new(),
        }
    }

    fn rank(&self) -> Rank {
        self.comm.rank()
    }

    async fn run(&mut self) -> Result<WorkerReport> {
        let plan = self.agree_plan().await?;
        let range = distribute(&mut self.comm, plan.total, self.config.distribution).await?;
        let dir = self.config.artifacts.dir();

        self.snapshot.assigned = range.len();
        let mut checkpointer = Checkpointer::new(
            dir.clone(),
            plan.run_id,
            self.rank(),
            range.len(),
            self.config.checkpoints,
        );
        let mut search = self.prepare(&plan, &dir, range)?;
        self.snapshot.init_time = self.started.elapsed();
        self.refresh(&search);
        self.artifacts.push(checkpointer.write(Stage::Init, &self.snapshot)?);
        self.checkpointer = Some(checkpointer);

        self.process(&plan, &mut search).await?;
        self.finish_rounds(&mut search).await?;

        if let Some(results) = search.results.take() {
            self.artifacts.push(results.finish()?);
        }
        self.refresh(&search);
        self.artifacts
            .push(write_worker_metrics(&dir, plan.run_id, &self.snapshot)?);
        info!(
            processed = self.snapshot.processed,
            assigned = self.snapshot.assigned,
            valid = self.snapshot.summary.valid,
            timed_out = self.snapshot.timed_out,
            "search finished"
        );

        let robust = self.config.robust(plan.total);
        let global = if robust {
            None
        } else {
            self.reduce_metrics(&plan, &dir).await?
        };

        let shutdown = self
            .coordinator
            .shutdown(&mut self.comm, self.config.drain_iterations)
            .await?;

        let mut summary = None;
        let mut results = None;
        if self.rank() == COORDINATOR {
            if robust {
                let written = write_consolidated_summary(
                    &dir,
                    plan.run_id,
                    plan.workers as usize,
                    plan.horizon,
                    plan.total,
                    self.started.elapsed(),
                )?;
                if written.found < written.workers {
                    warn!(found = written.found, workers = written.workers, "summary is partial");
                }
                self.artifacts.push(written.path.clone());
                summary = Some(written);
            }
            if self.config.artifacts.save_results {
                let target = self.config.artifacts.results_target(plan.run_id);
                let merged = merge_parts(&dir, plan.run_id, plan.workers as usize, &target)?;
                self.artifacts.push(merged.path.clone());
                results = Some(merged);
            }
        }

        self.snapshot.traffic = self.comm.stats();
        if let Some(checkpointer) = self.checkpointer.as_mut() {
            self.artifacts
                .push(checkpointer.write(Stage::Completed, &self.snapshot)?);
        }

        Ok(WorkerReport {
            rank: self.rank(),
            run_id: plan.run_id,
            range,
            snapshot: self.snapshot.clone(),
            global,
            summary,
            results,
            shutdown,
            artifacts: std::mem::take(&mut self.artifacts),
        })
    }

    /// Rank 0 decides the run identity and size. Everyone else checks it
    /// against its own configuration.
    async fn agree_plan(&mut self) -> Result<RunPlan> {
        let horizon = self.config.horizon;
        let total = self.config.total()?;
        let workers = self.comm.size();
        let ours = (self.rank() == COORDINATOR).then(|| RunPlan {
            run_id: self.config.run_id.unwrap_or_else(rand::random),
            horizon,
            total,
            workers: workers as u32,
            started_ms: Utc::now().timestamp_millis(),
        });
        let plan = self.comm.broadcast(COORDINATOR, ours).await?;
        if plan.horizon != horizon || plan.total != total || plan.workers as usize != workers {
            Err(ConfigError::PlanMismatch {
                ours: describe(horizon, total, workers),
                theirs: describe(plan.horizon, plan.total, plan.workers as usize),
            })?
        }
        debug!(run = %run_label(plan.run_id), horizon, total, workers, "plan agreed");
        Ok(plan)
    }

    fn prepare(&self, plan: &RunPlan, dir: &ArtifactDir, range: WorkRange) -> Result<Search> {
        let config = self.config;
        let pool = if config.threads > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.threads)
                .thread_name(move |index| format!("sweep-solver-{index}"))
                .build()
                .map_err(|e| ConfigError::invalid("threads", e.to_string()))?;
            let solvers = (0..config.threads)
                .map(|_| ScenarioSolver::new(DpSolver::new(config.machine.clone())))
                .collect();
            Some((pool, solvers))
        } else {
            None
        };
        let results = if config.artifacts.save_results {
            Some(ResultWriter::create(dir, plan.run_id, self.rank())?)
        } else {
            None
        };
        Ok(Search {
            cache: PatternCache::new(config.cache.clone()),
            solver: ScenarioSolver::new(DpSolver::new(config.machine.clone())),
            pool,
            scheduler: ExchangeScheduler::new(&config.exchange, plan.total, self.comm.size()),
            results,
            next: range.start,
            end: range.end,
            processed: 0,
        })
    }

    fn refresh(&mut self, search: &Search) {
        let stats = search.stats();
        let cache = search.cache.stats();
        let snapshot = &mut self.snapshot;
        snapshot.processed = search.processed;
        snapshot.cache_hits = stats.hits;
        snapshot.cache_misses = stats.misses;
        snapshot.cache_entries = search.cache.len() as u64;
        snapshot.cache_evictions = cache.evicted;
        snapshot.memory_used = peak_rss_bytes();
        snapshot.traffic = self.comm.stats();
    }

    fn out_of_time(&self) -> bool {
        self.config
            .time_budget
            .is_some_and(|budget| self.started.elapsed() >= budget)
    }

    /// The processing loop. Ends when the range is exhausted, the budget runs
    /// out, or a round broadcasts the stop flag.
    async fn process(&mut self, plan: &RunPlan, search: &mut Search) -> Result<()> {
        let horizon = plan.horizon as u8;
        while !search.done() {
            if self.out_of_time() {
                self.snapshot.timed_out = true;
                info!(processed = search.processed, "time budget exhausted");
                break;
            }

            let started = Instant::now();
            let solved = if search.pool.is_some() {
                solve_batch(search, horizon, self.config.batch_per_thread)
            } else {
                let scenario = Scenario::new(search.next, horizon);
                let solved = search.solver.solve(&scenario, &mut search.cache);
                for fresh in solved.fresh {
                    search.cache.insert_fresh(fresh);
                }
                search.next += 1;
                search.processed += 1;
                vec![(scenario, solved.result)]
            };
            self.snapshot.solve_time += started.elapsed();

            for (scenario, result) in &solved {
                self.record(search, scenario, result).await?;
            }

            if self
                .checkpointer
                .as_mut()
                .is_some_and(|checkpointer| checkpointer.progress_due(search.processed))
            {
                self.refresh(search);
                if let Some(checkpointer) = self.checkpointer.as_mut() {
                    self.artifacts
                        .push(checkpointer.write(Stage::Progress, &self.snapshot)?);
                }
            }
            if search.scheduler.round_due(search.processed) && self.round(search, false).await? {
                info!(processed = search.processed, "stop broadcast, leaving the search");
                break;
            }
        }
        Ok(())
    }

    async fn record(
        &mut self,
        search: &mut Search,
        scenario: &Scenario,
        result: &SolverResult,
    ) -> Result<()> {
        if let Some(results) = search.results.as_mut() {
            results.write(scenario, result)?;
        }
        self.snapshot.summary.record(scenario, result);
        if search.scheduler.poll_due() {
            self.poll(search)?;
        }
        if !result.is_valid || !search.scheduler.record_valid() {
            return Ok(());
        }

        let record = search
            .solver
            .discovery_candidate(scenario)
            .and_then(|key| search.cache.peek(&key))
            .and_then(|entry| PatternRecord::from_entry(entry, self.comm.rank()));
        if let Some(record) = record {
            let peers = share_discovery(&mut self.comm, record).await?;
            if peers > 0 {
                self.snapshot.exchange.discoveries_sent += 1;
                self.coordinator.count_discovery();
            }
        }
        Ok(())
    }

    /// Non-blocking pass over announcements and abort notices.
    fn poll(&mut self, search: &mut Search) -> Result<()> {
        let (received, _) = absorb_discoveries(&mut self.comm, &mut search.cache)?;
        self.snapshot.exchange.discoveries_received += received;
        if let Some(rank) = self.comm.discard_any(tags::ABORT)? {
            Err(Error::PeerAborted { rank })?
        }
        Ok(())
    }

    /// One collective round. Returns the broadcast stop flag.
    async fn round(&mut self, search: &mut Search, stop: bool) -> Result<bool> {
        self.poll(search)?;
        let collector = self.config.exchange.collector;
        let outcome = exchange_round(&mut self.comm, &mut search.cache, collector, stop).await?;
        let exchange = &mut self.snapshot.exchange;
        exchange.rounds += 1;
        exchange.offered += outcome.offered as u64;
        exchange.merged += outcome.merged as u64;
        search.scheduler.complete_round();
        if outcome.stop {
            search.scheduler.cancel();
        }
        debug!(
            processed = search.processed,
            offered = outcome.offered,
            selected = outcome.selected,
            merged = outcome.merged,
            stop = outcome.stop,
            "exchange round"
        );
        Ok(outcome.stop)
    }

    /// Periodic rounds this rank still owes its peers, then the final round.
    async fn finish_rounds(&mut self, search: &mut Search) -> Result<()> {
        let stop = self.snapshot.timed_out || !search.done();
        while search.scheduler.rounds_remaining() > 0 {
            self.round(search, stop).await?;
        }
        if self.config.exchange.enabled {
            self.round(search, true).await?;
        }
        Ok(())
    }

    async fn reduce_metrics(
        &mut self,
        plan: &RunPlan,
        dir: &ArtifactDir,
    ) -> Result<Option<GlobalMetrics>> {
        self.snapshot.traffic = self.comm.stats();
        let reduced = self
            .comm
            .reduce(
                COORDINATOR,
                MetricsAccumulator::from(&self.snapshot),
                MetricsAccumulator::merge,
            )
            .await?;
        let Some(totals) = reduced else {
            return Ok(None);
        };
        let global = GlobalMetrics::derive(totals, self.started.elapsed());
        let table = global.table(plan.run_id, plan.horizon, plan.total);
        self.artifacts
            .push(write_global_metrics(dir, plan.run_id, &table)?);
        info!(
            processed = totals.processed,
            valid = totals.summary.valid,
            throughput = %format!("{:.1}", global.throughput),
            "run totals"
        );
        Ok(Some(global))
    }

    /// Error path: notify peers, retire in-flight traffic, leave an ABORTED
    /// checkpoint behind.
    async fn abort(&mut self, error: &Error) {
        let config = self.config;
        // past the final barrier every peer has already retired its traffic
        if self.coordinator.phase() != Phase::Terminated {
            self.coordinator
                .abort(
                    &mut self.comm,
                    &error.to_string(),
                    config.drain_iterations,
                    config.abort_timeout,
                )
                .await;
        }
        self.snapshot.traffic = self.comm.stats();
        if let Some(checkpointer) = self.checkpointer.as_mut() {
            match checkpointer.write(Stage::Aborted, &self.snapshot) {
                Ok(path) => self.artifacts.push(path),
                Err(e) => warn!(error = %e, "could not write the abort checkpoint"),
            }
        }
    }
}

/// Solves the next batch on the pool. Batches never cross the next round
/// mark, so rounds happen at the same scenario counts as sequentially.
fn solve_batch(search: &mut Search, horizon: u8, per_thread: u64) -> Vec<(Scenario, SolverResult)> {
    let Some((pool, solvers)) = search.pool.as_mut() else {
        return Vec::new();
    };
    let threads = solvers.len() as u64;
    let mut len = (search.end - search.next).min(threads * per_thread);
    if let Some(mark) = search.scheduler.next_mark() {
        len = len.min(mark.saturating_sub(search.processed).max(1));
    }
    let start = search.next;
    let chunk = len.div_ceil(threads).max(1);
    let chunks: Vec<Range<u64>> = (0..threads)
        .map(|job| {
            let from = (start + job * chunk).min(start + len);
            from..(from + chunk).min(start + len)
        })
        .collect();

    let progress = AtomicU64::new(0);
    let cache = &search.cache;
    let parts: Vec<BatchPart> = pool.install(|| {
        solvers
            .par_iter_mut()
            .zip(chunks.into_par_iter())
            .map(|(solver, ids)| {
                let mut view = CacheView::new(cache);
                let mut part = BatchPart::default();
                for id in ids {
                    let scenario = Scenario::new(id, horizon);
                    let solved = solver.solve(&scenario, &mut view);
                    for fresh in &solved.fresh {
                        view.remember(fresh);
                    }
                    part.fresh.extend(solved.fresh);
                    part.solved.push((scenario, solved.result));
                    progress.fetch_add(1, Ordering::Relaxed);
                }
                part.touched = view.into_touched();
                part
            })
            .collect()
    });

    let mut solved = Vec::with_capacity(len as usize);
    for part in parts {
        search.cache.record_uses(&part.touched);
        for fresh in part.fresh {
            search.cache.insert_fresh(fresh);
        }
        solved.extend(part.solved);
    }
    let done = progress.into_inner();
    search.next += done;
    search.processed += done;
    solved
}

fn describe(horizon: u32, total: u64, workers: usize) -> String {
    format!("{total} scenarios over {horizon} slots on {workers} workers")
}
