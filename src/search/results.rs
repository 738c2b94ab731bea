use std::{
    ffi::OsString,
    fs,
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use super::{
    checkpoint::{run_label, ArtifactDir},
    error::{Error, Result},
    scenario::Scenario,
    solver::SolverResult,
};
use crate::mesh::Rank;

pub const RESULT_HEADER: &str =
    "scenario_id,pattern_bits,total_cost,is_valid,critical_slots,transitions";

const FLUSH_EVERY: u64 = 4096;

pub fn part_name(run_id: u64, rank: Rank) -> String {
    format!("results_{}.part{rank}.csv", run_label(run_id))
}

pub fn results_name(run_id: u64) -> String {
    format!("results_{}.csv", run_label(run_id))
}

pub fn format_row(scenario: &Scenario, result: &SolverResult) -> String {
    format!(
        "{},{},{:.2},{},{},{}",
        scenario.id,
        scenario.pattern_bits(),
        result.total_cost,
        if result.is_valid { "yes" } else { "no" },
        result.critical_slots,
        result.transitions()
    )
}

/// Appends one worker's result rows to its part file.
pub struct ResultWriter {
    path: PathBuf,
    out: BufWriter<fs::File>,
    rows: u64,
}

impl ResultWriter {
    pub fn create(dir: &ArtifactDir, run_id: u64, rank: Rank) -> Result<Self> {
        let (path, file) = dir.open_append(&part_name(run_id, rank))?;
        let empty = file
            .metadata()
            .map_err(|e| Error::io("inspect", &path, e))?
            .len()
            == 0;
        let mut writer = Self {
            out: BufWriter::new(file),
            path,
            rows: 0,
        };
        if empty {
            writer.line(RESULT_HEADER)?;
        }
        Ok(writer)
    }

    fn line(&mut self, line: &str) -> Result<()> {
        writeln!(self.out, "{line}").map_err(|e| Error::io("write", &self.path, e))
    }

    pub fn write(&mut self, scenario: &Scenario, result: &SolverResult) -> Result<()> {
        self.write_row(&format_row(scenario, result))
    }

    /// Appends a row produced by [`format_row`].
    pub fn write_row(&mut self, row: &str) -> Result<()> {
        self.line(row)?;
        self.rows += 1;
        if self.rows % FLUSH_EVERY == 0 {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush().map_err(|e| Error::io("flush", &self.path, e))
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn finish(mut self) -> Result<PathBuf> {
        self.flush()?;
        debug!(rows = self.rows, path = %self.path.display(), "result part closed");
        Ok(self.path)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeOutcome {
    pub path: PathBuf,
    pub rows: u64,
    pub parts: usize,
}

/// Concatenates every worker's part into `target` in rank order, keeping a
/// single header, then removes the parts. A target that cannot be written is
/// retried once under the fallback directory of `dir`.
pub fn merge_parts(
    dir: &ArtifactDir,
    run_id: u64,
    workers: usize,
    target: &Path,
) -> Result<MergeOutcome> {
    let parts: Vec<PathBuf> = (0..workers)
        .filter_map(|rank| {
            let part = dir.locate(&part_name(run_id, rank));
            if part.is_none() {
                warn!(rank, "result part missing");
            }
            part
        })
        .collect();

    let (path, rows) = match concat_parts(target, &parts) {
        Ok(rows) => (target.to_path_buf(), rows),
        Err(MergeError::Part(e)) => Err(e)?,
        Err(MergeError::Target(e)) => {
            let name: OsString = target
                .file_name()
                .map_or_else(|| results_name(run_id).into(), ToOwned::to_owned);
            let fallback = dir.fallback().join(name);
            warn!(
                target = %target.display(),
                fallback = %fallback.display(),
                error = %e,
                "results target unusable, falling back"
            );
            match concat_parts(&fallback, &parts) {
                Ok(rows) => (fallback, rows),
                Err(MergeError::Target(e) | MergeError::Part(e)) => Err(e)?,
            }
        }
    };

    for part in &parts {
        if let Err(e) = fs::remove_file(part) {
            warn!(path = %part.display(), error = %e, "could not remove result part");
        }
    }
    info!(rows, parts = parts.len(), path = %path.display(), "results merged");
    Ok(MergeOutcome {
        path,
        rows,
        parts: parts.len(),
    })
}

/// Which side of a merge failed. Only target failures are worth a retry.
enum MergeError {
    Target(Error),
    Part(Error),
}

fn concat_parts(target: &Path, parts: &[PathBuf]) -> Result<u64, MergeError> {
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| MergeError::Target(Error::io("create", parent, e)))?;
    }
    let tmp = target.with_extension("csv.tmp");
    let file =
        fs::File::create(&tmp).map_err(|e| MergeError::Target(Error::io("create", &tmp, e)))?;
    let mut out = BufWriter::new(file);
    let write_err = |e| MergeError::Target(Error::io("write", &tmp, e));
    writeln!(out, "{RESULT_HEADER}").map_err(write_err)?;

    let mut rows = 0;
    for part in parts {
        let file =
            fs::File::open(part).map_err(|e| MergeError::Part(Error::io("open", part, e)))?;
        for line in BufReader::new(file).lines().skip(1) {
            let line = line.map_err(|e| MergeError::Part(Error::io("read", part, e)))?;
            if line.is_empty() {
                continue;
            }
            writeln!(out, "{line}").map_err(write_err)?;
            rows += 1;
        }
    }
    out.flush().map_err(write_err)?;
    drop(out);
    fs::rename(&tmp, target)
        .map_err(|e| MergeError::Target(Error::io("rename", target, e)))?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::search::{
        machine::StateMachineConfig,
        solver::{DpSolver, Solver},
    };

    #[test]
    fn rows() {
        let mut solver = DpSolver::new(Arc::new(StateMachineConfig::standard()));
        let scenario = Scenario::new(0b0110, 4);
        let result = solver.solve(&scenario.flags());
        assert_eq!(format_row(&scenario, &result), "6,0110,12.50,yes,2,0-1-2-3");

        let scenario = Scenario::new(0b1111, 4);
        let result = solver.solve(&scenario.flags());
        assert_eq!(format_row(&scenario, &result), "15,1111,0.00,yes,0,");

        let infeasible = SolverResult::infeasible(3);
        assert_eq!(
            format_row(&Scenario::new(1, 4), &infeasible),
            "1,0001,0.00,no,3,"
        );
    }

    #[test]
    fn parts_merge_in_rank_order() {
        let root = tempfile::tempdir().unwrap();
        let dir = ArtifactDir::new(root.path(), root.path().join("fallback"));
        let solved = SolverResult::infeasible(0);
        // later ranks finish first
        for rank in [2, 0, 1] {
            let mut writer = ResultWriter::create(&dir, 5, rank).unwrap();
            writer.write(&Scenario::new(rank as u64 * 2, 3), &solved).unwrap();
            writer.write(&Scenario::new(rank as u64 * 2 + 1, 3), &solved).unwrap();
            writer.finish().unwrap();
        }

        let target = root.path().join("merged").join("results.csv");
        let outcome = merge_parts(&dir, 5, 3, &target).unwrap();
        assert_eq!(outcome.rows, 6);
        assert_eq!(outcome.parts, 3);

        let text = fs::read_to_string(&target).unwrap();
        let ids: Vec<&str> = text
            .lines()
            .skip(1)
            .map(|line| line.split(',').next().unwrap())
            .collect();
        assert_eq!(ids, vec!["0", "1", "2", "3", "4", "5"]);
        assert_eq!(text.lines().next(), Some(RESULT_HEADER));
        assert!(dir.locate(&part_name(5, 0)).is_none());
    }

    #[test]
    fn unwritable_target_falls_back() {
        let root = tempfile::tempdir().unwrap();
        let dir = ArtifactDir::new(root.path(), root.path().join("fallback"));
        for rank in 0..2 {
            let mut writer = ResultWriter::create(&dir, 9, rank).unwrap();
            writer
                .write(&Scenario::new(rank as u64, 2), &SolverResult::infeasible(1))
                .unwrap();
            writer.finish().unwrap();
        }
        let blocker = root.path().join("file");
        fs::write(&blocker, b"not a directory").unwrap();

        let outcome = merge_parts(&dir, 9, 2, &blocker.join("all.csv")).unwrap();
        assert_eq!(outcome.path, root.path().join("fallback").join("all.csv"));
        assert_eq!(outcome.rows, 2);
        let text = fs::read_to_string(&outcome.path).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(dir.locate(&part_name(9, 1)).is_none());
    }

    #[test]
    fn unusable_fallback_fails_the_merge() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("file");
        fs::write(&blocker, b"not a directory").unwrap();
        let dir = ArtifactDir::new(root.path(), blocker.join("fallback"));
        let mut writer = ResultWriter::create(&dir, 4, 0).unwrap();
        writer
            .write(&Scenario::new(0, 2), &SolverResult::infeasible(1))
            .unwrap();
        writer.finish().unwrap();

        let err = merge_parts(&dir, 4, 1, &blocker.join("all.csv")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert!(dir.locate(&part_name(4, 0)).is_some());
    }

    #[test]
    fn reopened_parts_keep_one_header() {
        let root = tempfile::tempdir().unwrap();
        let dir = ArtifactDir::new(root.path(), root.path());
        for _ in 0..2 {
            let mut writer = ResultWriter::create(&dir, 1, 0).unwrap();
            writer
                .write(&Scenario::new(0, 2), &SolverResult::infeasible(2))
                .unwrap();
            writer.finish().unwrap();
        }
        let text = fs::read_to_string(root.path().join(part_name(1, 0))).unwrap();
        assert_eq!(text.matches("scenario_id").count(), 1);
        assert_eq!(text.lines().count(), 3);
    }
}
