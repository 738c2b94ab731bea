use std::{fmt::Display, time::Duration};

use rkyv::{Archive, Deserialize, Serialize};

use super::{
    scenario::{Scenario, ScenarioClass},
    solver::SolverResult,
};
use crate::mesh::{Rank, TrafficStats};

/// A cost together with the scenario that produced it.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct Extreme {
    pub cost: f64,
    pub scenario: u64,
}

/// Running statistics over solved scenarios. Extremes that tie on cost keep
/// the lowest scenario id, so merging summaries in any order agrees.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
#[archive(check_bytes)]
pub struct ResultSummary {
    pub valid: u64,
    pub invalid: u64,
    pub cost_sum: f64,
    pub best: Option<Extreme>,
    pub worst: Option<Extreme>,
    pub critical: u64,
    pub optimal: u64,
    pub mixed: u64,
}

impl ResultSummary {
    pub fn record(&mut self, scenario: &Scenario, result: &SolverResult) {
        match scenario.class() {
            ScenarioClass::Critical => self.critical += 1,
            ScenarioClass::Optimal => self.optimal += 1,
            ScenarioClass::Mixed => self.mixed += 1,
        }
        if !result.is_valid {
            self.invalid += 1;
            return;
        }
        self.valid += 1;
        self.cost_sum += result.total_cost;
        let seen = Extreme {
            cost: result.total_cost,
            scenario: scenario.id,
        };
        self.best = Some(lower(self.best, seen));
        self.worst = Some(higher(self.worst, seen));
    }

    pub fn merge(&mut self, other: &ResultSummary) {
        self.valid += other.valid;
        self.invalid += other.invalid;
        self.cost_sum += other.cost_sum;
        self.critical += other.critical;
        self.optimal += other.optimal;
        self.mixed += other.mixed;
        if let Some(best) = other.best {
            self.best = Some(lower(self.best, best));
        }
        if let Some(worst) = other.worst {
            self.worst = Some(higher(self.worst, worst));
        }
    }

    pub fn mean_cost(&self) -> f64 {
        if self.valid == 0 {
            0.0
        } else {
            self.cost_sum / self.valid as f64
        }
    }
}

fn lower(current: Option<Extreme>, seen: Extreme) -> Extreme {
    match current {
        Some(current)
            if current.cost < seen.cost
                || (current.cost == seen.cost && current.scenario <= seen.scenario) =>
        {
            current
        }
        _ => seen,
    }
}

fn higher(current: Option<Extreme>, seen: Extreme) -> Extreme {
    match current {
        Some(current)
            if current.cost > seen.cost
                || (current.cost == seen.cost && current.scenario <= seen.scenario) =>
        {
            current
        }
        _ => seen,
    }
}

/// Cache traffic of one worker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExchangeCounters {
    pub rounds: u64,
    pub offered: u64,
    pub merged: u64,
    pub discoveries_sent: u64,
    pub discoveries_received: u64,
}

/// One worker's view of its run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub rank: Rank,
    pub assigned: u64,
    pub processed: u64,
    pub solve_time: Duration,
    pub init_time: Duration,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_entries: u64,
    pub cache_evictions: u64,
    /// Peak resident set size of the process.
    pub memory_used: u64,
    pub summary: ResultSummary,
    pub traffic: TrafficStats,
    pub exchange: ExchangeCounters,
    pub timed_out: bool,
}

impl MetricsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        ratio(self.cache_hits, self.cache_hits + self.cache_misses)
    }

    /// Scenarios per second of solving time.
    pub fn speed(&self) -> f64 {
        per_second(self.processed, self.solve_time)
    }

    pub fn table(&self, run_id: u64) -> MetricsTable {
        let mut table = MetricsTable::default();
        let section = format!("worker_{}", self.rank);
        table.push("run", "run_id", format!("{run_id:016x}"), "id");
        table.push(&section, "assigned", self.assigned, "count");
        table.push(&section, "processed", self.processed, "count");
        table.push(&section, "solve_time", millis(self.solve_time), "ms");
        table.push(&section, "init_time", millis(self.init_time), "ms");
        table.push(&section, "speed", format!("{:.2}", self.speed()), "scenarios/s");
        table.push(&section, "memory_used", self.memory_used, "bytes");
        table.push(&section, "timed_out", self.timed_out, "flag");
        table.push("cache", "hits", self.cache_hits, "count");
        table.push("cache", "misses", self.cache_misses, "count");
        table.push("cache", "hit_rate", format!("{:.4}", self.hit_rate()), "ratio");
        table.push("cache", "entries", self.cache_entries, "count");
        table.push("cache", "evictions", self.cache_evictions, "count");
        table.push("exchange", "rounds", self.exchange.rounds, "count");
        table.push("exchange", "offered", self.exchange.offered, "count");
        table.push("exchange", "merged", self.exchange.merged, "count");
        table.push("exchange", "discoveries_sent", self.exchange.discoveries_sent, "count");
        table.push(
            "exchange",
            "discoveries_received",
            self.exchange.discoveries_received,
            "count",
        );
        push_traffic(&mut table, &self.traffic);
        push_summary(&mut table, &self.summary);
        table
    }
}

/// Reducible form of [`MetricsSnapshot`], as it travels to the coordinator.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
#[archive(check_bytes)]
pub struct MetricsAccumulator {
    pub workers: u32,
    pub assigned: u64,
    pub processed: u64,
    pub total_solve_us: u64,
    pub max_solve_us: u64,
    pub min_solve_us: u64,
    pub max_init_us: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub peak_memory: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub exchange_rounds: u64,
    pub records_merged: u64,
    pub timed_out_workers: u32,
    pub summary: ResultSummary,
}

impl From<&MetricsSnapshot> for MetricsAccumulator {
    fn from(snapshot: &MetricsSnapshot) -> Self {
        let solve_us = micros(snapshot.solve_time);
        Self {
            workers: 1,
            assigned: snapshot.assigned,
            processed: snapshot.processed,
            total_solve_us: solve_us,
            max_solve_us: solve_us,
            min_solve_us: solve_us,
            max_init_us: micros(snapshot.init_time),
            cache_hits: snapshot.cache_hits,
            cache_misses: snapshot.cache_misses,
            peak_memory: snapshot.memory_used,
            messages_sent: snapshot.traffic.messages_sent,
            bytes_sent: snapshot.traffic.bytes_sent,
            messages_received: snapshot.traffic.messages_received,
            bytes_received: snapshot.traffic.bytes_received,
            exchange_rounds: snapshot.exchange.rounds,
            records_merged: snapshot.exchange.merged,
            timed_out_workers: u32::from(snapshot.timed_out),
            summary: snapshot.summary,
        }
    }
}

impl MetricsAccumulator {
    pub fn merge(mut self, other: Self) -> Self {
        if other.workers == 0 {
            return self;
        }
        if self.workers == 0 {
            return other;
        }
        self.workers += other.workers;
        self.assigned += other.assigned;
        self.processed += other.processed;
        self.total_solve_us += other.total_solve_us;
        self.max_solve_us = self.max_solve_us.max(other.max_solve_us);
        self.min_solve_us = self.min_solve_us.min(other.min_solve_us);
        self.max_init_us = self.max_init_us.max(other.max_init_us);
        self.cache_hits += other.cache_hits;
        self.cache_misses += other.cache_misses;
        self.peak_memory = self.peak_memory.max(other.peak_memory);
        self.messages_sent += other.messages_sent;
        self.bytes_sent += other.bytes_sent;
        self.messages_received += other.messages_received;
        self.bytes_received += other.bytes_received;
        self.exchange_rounds = self.exchange_rounds.max(other.exchange_rounds);
        self.records_merged += other.records_merged;
        self.timed_out_workers += other.timed_out_workers;
        self.summary.merge(&other.summary);
        self
    }
}

/// Whole-run figures derived on the coordinator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GlobalMetrics {
    pub totals: MetricsAccumulator,
    pub wall: Duration,
    pub throughput: f64,
    pub speedup: f64,
    pub parallel_efficiency: f64,
    pub load_balance_ratio: f64,
}

impl GlobalMetrics {
    pub fn derive(totals: MetricsAccumulator, wall: Duration) -> Self {
        let workers = totals.workers as f64;
        let max_solve = totals.max_solve_us as f64;
        let min_solve = totals.min_solve_us as f64;
        // sequential time is estimated as the slowest worker times the pool size
        let speedup = if max_solve > 0.0 {
            (max_solve * workers) / max_solve
        } else {
            0.0
        };
        let parallel_efficiency = if workers > 0.0 { speedup / workers } else { 0.0 };
        let load_balance_ratio = if max_solve > 0.0 {
            min_solve / max_solve
        } else {
            1.0
        };
        Self {
            totals,
            wall,
            throughput: per_second(totals.processed, wall),
            speedup,
            parallel_efficiency,
            load_balance_ratio,
        }
    }

    pub fn table(&self, run_id: u64, horizon: u32, total: u64) -> MetricsTable {
        let totals = &self.totals;
        let mut table = MetricsTable::default();
        table.push("run", "run_id", format!("{run_id:016x}"), "id");
        table.push("global", "horizon", horizon, "slots");
        table.push("global", "total_scenarios", total, "count");
        table.push("global", "workers", totals.workers, "count");
        table.push("global", "assigned", totals.assigned, "count");
        table.push("global", "processed", totals.processed, "count");
        table.push("global", "wall_time", millis(self.wall), "ms");
        table.push("global", "throughput", format!("{:.2}", self.throughput), "scenarios/s");
        table.push("global", "speedup", format!("{:.2}", self.speedup), "factor");
        table.push(
            "global",
            "parallel_efficiency",
            format!("{:.4}", self.parallel_efficiency),
            "ratio",
        );
        table.push(
            "global",
            "load_balance_ratio",
            format!("{:.4}", self.load_balance_ratio),
            "ratio",
        );
        table.push("global", "max_solve_time", totals.max_solve_us as f64 / 1000.0, "ms");
        table.push("global", "min_solve_time", totals.min_solve_us as f64 / 1000.0, "ms");
        table.push("global", "peak_memory", totals.peak_memory, "bytes");
        table.push("global", "timed_out_workers", totals.timed_out_workers, "count");
        table.push("cache", "hits", totals.cache_hits, "count");
        table.push("cache", "misses", totals.cache_misses, "count");
        table.push(
            "cache",
            "hit_rate",
            format!(
                "{:.4}",
                ratio(totals.cache_hits, totals.cache_hits + totals.cache_misses)
            ),
            "ratio",
        );
        table.push("exchange", "rounds", totals.exchange_rounds, "count");
        table.push("exchange", "merged", totals.records_merged, "count");
        push_traffic(
            &mut table,
            &TrafficStats {
                messages_sent: totals.messages_sent,
                bytes_sent: totals.bytes_sent,
                messages_received: totals.messages_received,
                bytes_received: totals.bytes_received,
            },
        );
        push_summary(&mut table, &totals.summary);
        table
    }
}

fn push_traffic(table: &mut MetricsTable, traffic: &TrafficStats) {
    table.push("traffic", "messages_sent", traffic.messages_sent, "count");
    table.push("traffic", "bytes_sent", traffic.bytes_sent, "bytes");
    table.push("traffic", "messages_received", traffic.messages_received, "count");
    table.push("traffic", "bytes_received", traffic.bytes_received, "bytes");
}

fn push_summary(table: &mut MetricsTable, summary: &ResultSummary) {
    table.push("results", "valid", summary.valid, "count");
    table.push("results", "invalid", summary.invalid, "count");
    table.push("results", "critical", summary.critical, "count");
    table.push("results", "optimal", summary.optimal, "count");
    table.push("results", "mixed", summary.mixed, "count");
    table.push("results", "cost_sum", format!("{:.2}", summary.cost_sum), "cost");
    table.push("results", "mean_cost", format!("{:.4}", summary.mean_cost()), "cost");
    if let Some(best) = summary.best {
        table.push("results", "best_cost", format!("{:.2}", best.cost), "cost");
        table.push("results", "best_scenario", best.scenario, "id");
    }
    if let Some(worst) = summary.worst {
        table.push("results", "worst_cost", format!("{:.2}", worst.cost), "cost");
        table.push("results", "worst_scenario", worst.scenario, "id");
    }
}

pub const METRICS_HEADER: &str = "section,metric_name,value,unit";

/// Rows of a metrics artifact.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsTable {
    rows: Vec<[String; 4]>,
}

impl MetricsTable {
    pub fn push(&mut self, section: &str, name: &str, value: impl Display, unit: &str) {
        self.rows.push([
            section.to_owned(),
            name.to_owned(),
            value.to_string(),
            unit.to_owned(),
        ]);
    }

    pub fn extend(&mut self, other: MetricsTable) {
        self.rows.extend(other.rows);
    }

    pub fn get(&self, section: &str, name: &str) -> Option<&str> {
        self.rows
            .iter()
            .find(|row| row[0] == section && row[1] == name)
            .map(|row| row[2].as_str())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::with_capacity(64 * (self.rows.len() + 1));
        out.push_str(METRICS_HEADER);
        out.push('\n');
        for row in &self.rows {
            out.push_str(&row.join(","));
            out.push('\n');
        }
        out
    }

    /// Reads rows back from [`MetricsTable::to_csv`] output.
    pub fn parse(text: &str) -> Option<Self> {
        let mut lines = text.lines();
        if lines.next()? != METRICS_HEADER {
            return None;
        }
        let mut table = Self::default();
        for line in lines.filter(|line| !line.is_empty()) {
            let mut cells = line.splitn(4, ',');
            let row = [cells.next()?, cells.next()?, cells.next()?, cells.next()?];
            table.rows.push(row.map(str::to_owned));
        }
        Some(table)
    }
}

/// Peak resident set size of this process in bytes, or 0 when unavailable.
#[cfg(unix)]
pub fn peak_rss_bytes() -> u64 {
    // SAFETY: a zeroed rusage is a valid out parameter and the return code is
    // checked before it is read.
    let usage = unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) != 0 {
            return 0;
        }
        usage
    };
    let max_rss = usage.ru_maxrss.max(0) as u64;
    if cfg!(target_os = "macos") {
        max_rss
    } else {
        max_rss.saturating_mul(1024)
    }
}

#[cfg(not(unix))]
pub fn peak_rss_bytes() -> u64 {
    0
}

fn micros(duration: Duration) -> u64 {
    duration.as_micros().min(u64::MAX as u128) as u64
}

fn millis(duration: Duration) -> String {
    format!("{:.3}", duration.as_secs_f64() * 1000.0)
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn per_second(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::machine::State;

    fn valid(cost: f64) -> SolverResult {
        SolverResult {
            states: vec![State::OnHot],
            total_cost: cost,
            is_valid: true,
            critical_slots: 0,
        }
    }

    fn snapshot(rank: Rank, processed: u64, solve_ms: u64) -> MetricsSnapshot {
        let mut summary = ResultSummary::default();
        summary.record(&Scenario::new(rank as u64, 4), &valid(rank as f64));
        MetricsSnapshot {
            rank,
            assigned: processed,
            processed,
            solve_time: Duration::from_millis(solve_ms),
            cache_hits: 3,
            cache_misses: 1,
            summary,
            ..Default::default()
        }
    }

    #[test]
    fn extremes_break_ties_by_id() {
        let mut summary = ResultSummary::default();
        summary.record(&Scenario::new(9, 4), &valid(5.0));
        summary.record(&Scenario::new(3, 4), &valid(5.0));
        summary.record(&Scenario::new(4, 4), &valid(7.5));
        summary.record(&Scenario::new(5, 4), &SolverResult::infeasible(2));
        assert_eq!(summary.best.unwrap().scenario, 3);
        assert_eq!(summary.worst.unwrap().scenario, 4);
        assert_eq!(summary.valid, 3);
        assert_eq!(summary.invalid, 1);
        assert_eq!(summary.cost_sum, 17.5);

        let mut other = ResultSummary::default();
        other.record(&Scenario::new(1, 4), &valid(5.0));
        summary.merge(&other);
        assert_eq!(summary.best.unwrap().scenario, 1);
    }

    #[test]
    fn global_figures() {
        let totals = [snapshot(0, 10, 200), snapshot(1, 6, 100)]
            .iter()
            .map(MetricsAccumulator::from)
            .fold(MetricsAccumulator::default(), MetricsAccumulator::merge);
        assert_eq!(totals.workers, 2);
        assert_eq!(totals.processed, 16);
        assert_eq!(totals.cache_hits, 6);
        assert_eq!(totals.summary.best.unwrap().scenario, 0);

        let global = GlobalMetrics::derive(totals, Duration::from_secs(2));
        assert_eq!(global.throughput, 8.0);
        assert_eq!(global.speedup, 2.0);
        assert_eq!(global.parallel_efficiency, 1.0);
        assert_eq!(global.load_balance_ratio, 0.5);

        let idle =
            GlobalMetrics::derive(MetricsAccumulator::from(&snapshot(0, 0, 0)), Duration::ZERO);
        assert_eq!(idle.speedup, 0.0);
        assert_eq!(idle.load_balance_ratio, 1.0);
        assert_eq!(idle.throughput, 0.0);
    }

    #[test]
    fn tables_round_trip_through_csv() {
        let table = snapshot(2, 5, 10).table(0xabc);
        let csv = table.to_csv();
        assert!(csv.starts_with("section,metric_name,value,unit\n"));
        let parsed = MetricsTable::parse(&csv).unwrap();
        assert_eq!(parsed, table);
        assert_eq!(parsed.get("worker_2", "processed"), Some("5"));
        assert_eq!(parsed.get("run", "run_id"), Some("0000000000000abc"));
        assert!(MetricsTable::parse("scenario_id,cost\n").is_none());
    }

    #[test]
    fn peak_memory_is_reported() {
        if cfg!(unix) {
            assert!(peak_rss_bytes() > 0);
        }
    }
}
