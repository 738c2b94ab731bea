use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::Local;
use tracing::{debug, warn};

use super::{
    error::{Error, Result},
    metrics::{MetricsSnapshot, MetricsTable},
};
use crate::mesh::Rank;

/// Directory for run artifacts with a single fallback. Anything that cannot
/// be written to the primary directory is retried once in the fallback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactDir {
    primary: PathBuf,
    fallback: PathBuf,
}

impl ArtifactDir {
    pub fn new(primary: impl Into<PathBuf>, fallback: impl Into<PathBuf>) -> Self {
        Self {
            primary: primary.into(),
            fallback: fallback.into(),
        }
    }

    /// `$TMPDIR/sweep-fallback`.
    pub fn default_fallback() -> PathBuf {
        std::env::temp_dir().join("sweep-fallback")
    }

    pub fn primary(&self) -> &Path {
        &self.primary
    }

    pub fn fallback(&self) -> &Path {
        &self.fallback
    }

    /// Tries `attempt` in the primary directory, then in the fallback.
    fn with_fallback<T>(
        &self,
        action: &'static str,
        name: &str,
        mut attempt: impl FnMut(&Path) -> io::Result<T>,
    ) -> Result<T> {
        match attempt(&self.primary) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(
                    dir = %self.primary.display(),
                    fallback = %self.fallback.display(),
                    name,
                    error = %e,
                    "artifact directory unusable, falling back"
                );
                attempt(&self.fallback).map_err(|e| Error::io(action, self.fallback.join(name), e))
            }
        }
    }

    /// Writes `contents` to `name` through a `.tmp` sibling and a rename, so
    /// readers never see a partial file.
    pub fn write_atomic(&self, name: &str, contents: &[u8]) -> Result<PathBuf> {
        self.with_fallback("write", name, |dir| {
            fs::create_dir_all(dir)?;
            let target = dir.join(name);
            let tmp = dir.join(format!("{name}.tmp"));
            fs::write(&tmp, contents)?;
            fs::rename(&tmp, &target)?;
            Ok(target)
        })
    }

    /// Opens `name` for appending, creating it if needed.
    pub fn open_append(&self, name: &str) -> Result<(PathBuf, fs::File)> {
        self.with_fallback("open", name, |dir| {
            fs::create_dir_all(dir)?;
            let target = dir.join(name);
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&target)?;
            Ok((target, file))
        })
    }

    /// Where `name` ended up, if it exists in either directory.
    pub fn locate(&self, name: &str) -> Option<PathBuf> {
        [&self.primary, &self.fallback]
            .into_iter()
            .map(|dir| dir.join(name))
            .find(|path| path.is_file())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Init,
    Progress,
    Completed,
    Aborted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Init => "INIT",
            Stage::Progress => "PROGRESS",
            Stage::Completed => "COMPLETED",
            Stage::Aborted => "ABORTED",
        })
    }
}

/// Run ids are always shown as 16 hex digits.
pub fn run_label(run_id: u64) -> String {
    format!("{run_id:016x}")
}

pub fn worker_metrics_name(run_id: u64, rank: Rank) -> String {
    format!("metrics_{}_rank{rank}.csv", run_label(run_id))
}

pub fn global_metrics_name(run_id: u64) -> String {
    format!("metrics_{}_global.csv", run_label(run_id))
}

pub fn summary_metrics_name(run_id: u64) -> String {
    format!("metrics_{}_summary.csv", run_label(run_id))
}

/// Writes one worker's checkpoint artifacts as its run advances.
pub struct Checkpointer {
    dir: ArtifactDir,
    run_id: u64,
    rank: Rank,
    seq: u64,
    interval: Option<u64>,
    next_mark: u64,
}

impl Checkpointer {
    /// Progress is checkpointed `checkpoints` times over `assigned` scenarios.
    /// Zero turns progress checkpoints off.
    pub fn new(dir: ArtifactDir, run_id: u64, rank: Rank, assigned: u64, checkpoints: u32) -> Self {
        let interval = (checkpoints > 0).then(|| (assigned / checkpoints as u64).max(1));
        Self {
            dir,
            run_id,
            rank,
            seq: 0,
            interval,
            next_mark: interval.unwrap_or(u64::MAX),
        }
    }

    /// Whether a progress checkpoint is due after `processed` scenarios.
    pub fn progress_due(&mut self, processed: u64) -> bool {
        let Some(interval) = self.interval else {
            return false;
        };
        if processed < self.next_mark {
            return false;
        }
        while self.next_mark <= processed {
            self.next_mark = self.next_mark.saturating_add(interval);
        }
        true
    }

    pub fn write(&mut self, stage: Stage, snapshot: &MetricsSnapshot) -> Result<PathBuf> {
        self.seq += 1;
        let now = Local::now();
        let name = format!(
            "checkpoint_{}_rank{}_{}_{}_{:04}.csv",
            run_label(self.run_id),
            self.rank,
            stage,
            now.format("%Y%m%dT%H%M%S%3f"),
            self.seq
        );

        let mut table = MetricsTable::default();
        table.push("checkpoint", "stage", stage, "text");
        table.push("checkpoint", "sequence", self.seq, "count");
        table.push("checkpoint", "timestamp", now.to_rfc3339(), "time");
        table.extend(snapshot.table(self.run_id));

        let path = self.dir.write_atomic(&name, table.to_csv().as_bytes())?;
        debug!(rank = self.rank, %stage, path = %path.display(), "checkpoint written");
        Ok(path)
    }
}

pub fn write_worker_metrics(
    dir: &ArtifactDir,
    run_id: u64,
    snapshot: &MetricsSnapshot,
) -> Result<PathBuf> {
    let name = worker_metrics_name(run_id, snapshot.rank);
    dir.write_atomic(&name, snapshot.table(run_id).to_csv().as_bytes())
}

pub fn write_global_metrics(
    dir: &ArtifactDir,
    run_id: u64,
    table: &MetricsTable,
) -> Result<PathBuf> {
    dir.write_atomic(&global_metrics_name(run_id), table.to_csv().as_bytes())
}

/// What the coordinator could assemble without a collective reduction.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsolidatedSummary {
    pub path: PathBuf,
    pub found: usize,
    pub workers: usize,
}

/// Builds the run summary from whatever per-worker metrics files exist.
/// Files that are missing or unreadable are counted, not fatal.
pub fn write_consolidated_summary(
    dir: &ArtifactDir,
    run_id: u64,
    workers: usize,
    horizon: u32,
    total: u64,
    wall: Duration,
) -> Result<ConsolidatedSummary> {
    let mut found = 0;
    let mut processed = 0u64;
    let mut assigned = 0u64;
    let mut valid = 0u64;
    let mut timed_out = 0u64;
    for rank in 0..workers {
        let name = worker_metrics_name(run_id, rank);
        let Some(path) = dir.locate(&name) else {
            warn!(rank, name, "worker metrics missing");
            continue;
        };
        let table = fs::read_to_string(&path)
            .ok()
            .and_then(|text| MetricsTable::parse(&text));
        let Some(table) = table else {
            warn!(rank, path = %path.display(), "worker metrics unreadable");
            continue;
        };
        let section = format!("worker_{rank}");
        let number = |section: &str, name: &str| -> u64 {
            table
                .get(section, name)
                .and_then(|value| value.parse().ok())
                .unwrap_or(0)
        };
        processed += number(&section, "processed");
        assigned += number(&section, "assigned");
        valid += number("results", "valid");
        if table.get(&section, "timed_out") == Some("true") {
            timed_out += 1;
        }
        found += 1;
    }

    let secs = wall.as_secs_f64();
    let throughput = if secs > 0.0 { processed as f64 / secs } else { 0.0 };
    let mut table = MetricsTable::default();
    table.push("run", "run_id", run_label(run_id), "id");
    table.push("global", "mode", "robust", "text");
    table.push("global", "horizon", horizon, "slots");
    table.push("global", "total_scenarios", total, "count");
    table.push("global", "workers", workers, "count");
    table.push("global", "worker_files_found", found, "count");
    table.push(
        "global",
        "status",
        if found == workers { "complete" } else { "partial" },
        "text",
    );
    table.push("global", "assigned", assigned, "count");
    table.push("global", "processed", processed, "count");
    table.push("global", "wall_time", format!("{:.3}", secs * 1000.0), "ms");
    table.push("global", "throughput", format!("{throughput:.2}"), "scenarios/s");
    table.push("global", "timed_out_workers", timed_out, "count");
    table.push("results", "valid", valid, "count");

    let path = dir.write_atomic(&summary_metrics_name(run_id), table.to_csv().as_bytes())?;
    Ok(ConsolidatedSummary {
        path,
        found,
        workers,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn snapshot(rank: Rank, processed: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            rank,
            assigned: processed,
            processed,
            ..Default::default()
        }
    }

    #[test]
    fn atomic_writes_leave_no_temporaries() {
        let root = tempfile::tempdir().unwrap();
        let dir = ArtifactDir::new(root.path().join("out"), root.path().join("fallback"));
        let path = dir.write_atomic("a.csv", b"x\n").unwrap();
        assert_eq!(path, root.path().join("out").join("a.csv"));
        dir.write_atomic("a.csv", b"y\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "y\n");
        assert!(!root.path().join("out").join("a.csv.tmp").exists());
        assert_eq!(dir.locate("a.csv"), Some(path));
        assert_eq!(dir.locate("b.csv"), None);
    }

    #[test]
    fn unusable_primary_falls_back() {
        let root = tempfile::tempdir().unwrap();
        // a file where the directory should be
        let blocked = root.path().join("blocked");
        fs::write(&blocked, b"").unwrap();
        let dir = ArtifactDir::new(&blocked, root.path().join("fallback"));

        let path = dir.write_atomic("a.csv", b"x\n").unwrap();
        assert_eq!(path, root.path().join("fallback").join("a.csv"));
        assert_eq!(dir.locate("a.csv"), Some(path));

        let (appended, mut file) = dir.open_append("b.csv").unwrap();
        writeln!(file, "row").unwrap();
        assert_eq!(fs::read_to_string(appended).unwrap(), "row\n");

        let broken = ArtifactDir::new(&blocked, &blocked);
        assert!(matches!(
            broken.write_atomic("a.csv", b"x"),
            Err(Error::Io { .. })
        ));
    }

    #[test]
    fn progress_marks() {
        let root = tempfile::tempdir().unwrap();
        let dir = ArtifactDir::new(root.path(), root.path());
        let mut checkpointer = Checkpointer::new(dir.clone(), 1, 0, 100, 4);
        let due: Vec<u64> = (1..=100).filter(|n| checkpointer.progress_due(*n)).collect();
        assert_eq!(due, vec![25, 50, 75, 100]);

        let mut tiny = Checkpointer::new(dir.clone(), 1, 0, 2, 4);
        assert!(tiny.progress_due(1));
        assert!(tiny.progress_due(2));

        let mut off = Checkpointer::new(dir, 1, 0, 100, 0);
        assert!(!off.progress_due(100));
    }

    #[test]
    fn checkpoint_names_and_contents() {
        let root = tempfile::tempdir().unwrap();
        let dir = ArtifactDir::new(root.path(), root.path());
        let mut checkpointer = Checkpointer::new(dir, 0xbeef, 3, 10, 4);

        let init = checkpointer.write(Stage::Init, &snapshot(3, 0)).unwrap();
        let done = checkpointer.write(Stage::Completed, &snapshot(3, 10)).unwrap();
        let init_name = init.file_name().unwrap().to_str().unwrap();
        let done_name = done.file_name().unwrap().to_str().unwrap();
        assert!(init_name.starts_with("checkpoint_000000000000beef_rank3_INIT_"));
        assert!(init_name.ends_with("_0001.csv"));
        assert!(done_name.contains("_COMPLETED_"));
        assert!(done_name.ends_with("_0002.csv"));

        let table = MetricsTable::parse(&fs::read_to_string(done).unwrap()).unwrap();
        assert_eq!(table.get("checkpoint", "stage"), Some("COMPLETED"));
        assert_eq!(table.get("worker_3", "processed"), Some("10"));
    }

    #[test]
    fn consolidated_summary_counts_worker_files() {
        let root = tempfile::tempdir().unwrap();
        let dir = ArtifactDir::new(root.path(), root.path().join("fallback"));
        write_worker_metrics(&dir, 7, &snapshot(0, 40)).unwrap();
        write_worker_metrics(&dir, 7, &snapshot(2, 30)).unwrap();

        let summary =
            write_consolidated_summary(&dir, 7, 3, 10, 1024, Duration::from_secs(1)).unwrap();
        assert_eq!(summary.found, 2);
        assert_eq!(summary.workers, 3);
        let table = MetricsTable::parse(&fs::read_to_string(&summary.path).unwrap()).unwrap();
        assert_eq!(table.get("global", "processed"), Some("70"));
        assert_eq!(table.get("global", "status"), Some("partial"));
        assert_eq!(
            summary.path.file_name().unwrap().to_str().unwrap(),
            "metrics_0000000000000007_summary.csv"
        );
    }
}
