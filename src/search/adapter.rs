use std::{
    fmt,
    str::FromStr,
    time::{Duration, Instant},
};

use super::{
    machine::State,
    scenario::Scenario,
    solver::{schedule_cost, Solver, SolverResult},
};

/// Longest pattern key text that may travel in an exchange record.
pub const MAX_PATTERN_LEN: usize = 32;

// Fragments borrow their boundary slots from the deficits around them. With a
// single state able to serve a deficit, every deficit slot pins the schedule,
// so the optimal schedule of a whole pattern is the concatenation of the
// optimal schedules of the stretches between consecutive deficits. Those
// stretches repeat across patterns far more often than whole patterns do,
// which is what makes them worth caching and exchanging.

/// Where a fragment sits relative to the deficits of its pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FragmentKind {
    /// A pattern without deficits. Both ends are free.
    Whole,
    /// From slot 0 to the first deficit. The end is pinned.
    Head,
    /// Between two consecutive deficits. Both ends are pinned.
    Run,
    /// From the last deficit to the end of the horizon. The start is pinned.
    Tail,
}

impl FragmentKind {
    pub fn symbol(self) -> char {
        match self {
            FragmentKind::Whole => 'w',
            FragmentKind::Head => 'p',
            FragmentKind::Run => 'r',
            FragmentKind::Tail => 's',
        }
    }

    pub fn from_symbol(symbol: char) -> Option<Self> {
        match symbol {
            'w' => Some(FragmentKind::Whole),
            'p' => Some(FragmentKind::Head),
            'r' => Some(FragmentKind::Run),
            's' => Some(FragmentKind::Tail),
            _ => None,
        }
    }
}

/// Cache key of a fragment: its kind and coverage bits, slot 0 as the most
/// significant bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatternKey {
    kind: FragmentKind,
    bits: u32,
    len: u8,
}

impl PatternKey {
    /// Returns `None` when the key text would not fit in [`MAX_PATTERN_LEN`].
    pub fn new(kind: FragmentKind, flags: &[bool]) -> Option<Self> {
        if flags.is_empty() || flags.len() >= MAX_PATTERN_LEN {
            return None;
        }
        let bits = flags
            .iter()
            .fold(0u32, |bits, covered| (bits << 1) | u32::from(*covered));
        Some(Self {
            kind,
            bits,
            len: flags.len() as u8,
        })
    }

    pub fn kind(&self) -> FragmentKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn flags(&self) -> Vec<bool> {
        (0..self.len)
            .rev()
            .map(|shift| (self.bits >> shift) & 1 == 1)
            .collect()
    }
}

impl fmt::Display for PatternKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:0width$b}",
            self.kind.symbol(),
            self.bits,
            width = self.len as usize
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidPatternKey;

impl fmt::Display for InvalidPatternKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("malformed pattern key")
    }
}

impl std::error::Error for InvalidPatternKey {}

impl FromStr for PatternKey {
    type Err = InvalidPatternKey;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut chars = text.chars();
        let kind = chars
            .next()
            .and_then(FragmentKind::from_symbol)
            .ok_or(InvalidPatternKey)?;
        let flags = chars
            .map(|c| match c {
                '0' => Ok(false),
                '1' => Ok(true),
                _ => Err(InvalidPatternKey),
            })
            .collect::<Result<Vec<_>, _>>()?;
        PatternKey::new(kind, &flags).ok_or(InvalidPatternKey)
    }
}

/// One stretch of a pattern, as a slot range plus its pinned ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fragment {
    pub key: PatternKey,
    pub start: usize,
    pub len: usize,
    pub start_state: Option<State>,
    pub end_state: Option<State>,
}

impl Fragment {
    fn new(
        flags: &[bool],
        kind: FragmentKind,
        start: usize,
        end: usize,
        start_state: Option<State>,
        end_state: Option<State>,
    ) -> Option<Self> {
        Some(Self {
            key: PatternKey::new(kind, &flags[start..end])?,
            start,
            len: end - start,
            start_state,
            end_state,
        })
    }

    pub fn slots<'a>(&self, flags: &'a [bool]) -> &'a [bool] {
        &flags[self.start..self.start + self.len]
    }
}

/// Splits a pattern at its deficit slots. Neighbouring fragments share their
/// boundary slot. Returns `None` for an empty pattern or one too long to key.
pub fn fragments(flags: &[bool], deficit: State) -> Option<Vec<Fragment>> {
    let deficits: Vec<usize> = (0..flags.len()).filter(|slot| !flags[*slot]).collect();
    let (Some(&first), Some(&last)) = (deficits.first(), deficits.last()) else {
        return Some(vec![Fragment::new(
            flags,
            FragmentKind::Whole,
            0,
            flags.len(),
            None,
            None,
        )?]);
    };

    let mut out = Vec::with_capacity(deficits.len() + 1);
    out.push(Fragment::new(
        flags,
        FragmentKind::Head,
        0,
        first + 1,
        None,
        Some(deficit),
    )?);
    for pair in deficits.windows(2) {
        out.push(Fragment::new(
            flags,
            FragmentKind::Run,
            pair[0],
            pair[1] + 1,
            Some(deficit),
            Some(deficit),
        )?);
    }
    out.push(Fragment::new(
        flags,
        FragmentKind::Tail,
        last,
        flags.len(),
        Some(deficit),
        None,
    )?);
    Some(out)
}

/// Source of previously solved fragments.
pub trait FragmentStore {
    fn fetch(&mut self, key: &PatternKey) -> Option<&[State]>;
}

/// A store that never has anything, for solving without a cache.
pub struct NoStore;

impl FragmentStore for NoStore {
    fn fetch(&mut self, _key: &PatternKey) -> Option<&[State]> {
        None
    }
}

/// A fragment solved while handling a scenario, not yet in any cache.
#[derive(Clone, Debug, PartialEq)]
pub struct FreshFragment {
    pub key: PatternKey,
    pub states: Vec<State>,
    pub cost: f64,
    pub solve_time: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Solved {
    pub result: SolverResult,
    pub fresh: Vec<FreshFragment>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SolverStats {
    pub hits: u64,
    pub misses: u64,
    pub fresh_solves: u64,
}

/// Solves whole scenarios from cached fragments where possible, handing
/// only the uncached remainder to the wrapped [`Solver`].
pub struct ScenarioSolver<S> {
    solver: S,
    fragmenting: Option<State>,
    flags: Vec<bool>,
    stats: SolverStats,
}

impl<S: Solver> ScenarioSolver<S> {
    pub fn new(solver: S) -> Self {
        let fragmenting = solver.machine().deficit_state();
        Self {
            solver,
            fragmenting,
            flags: Vec::new(),
            stats: SolverStats::default(),
        }
    }

    /// Whether scenarios are split into cacheable fragments.
    pub fn fragmenting(&self) -> bool {
        self.fragmenting.is_some()
    }

    pub fn stats(&self) -> SolverStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = SolverStats::default();
    }

    pub fn solve(&mut self, scenario: &Scenario, store: &mut impl FragmentStore) -> Solved {
        let mut flags = std::mem::take(&mut self.flags);
        scenario.fill_flags(&mut flags);
        let solved = self.solve_flags(&flags, store);
        self.flags = flags;
        solved
    }

    pub fn solve_flags(&mut self, flags: &[bool], store: &mut impl FragmentStore) -> Solved {
        let pieces = self
            .fragmenting
            .and_then(|deficit| fragments(flags, deficit));
        let Some(pieces) = pieces else {
            return Solved {
                result: self.solve_direct(flags),
                fresh: Vec::new(),
            };
        };

        let critical_slots = flags.iter().filter(|covered| !**covered).count() as u32;
        let mut states: Vec<State> = Vec::with_capacity(flags.len());
        let mut fresh = Vec::new();
        for piece in &pieces {
            // neighbours share a boundary slot, keep only the first copy
            let skip = usize::from(piece.start > 0);
            match store.fetch(&piece.key) {
                Some(cached) if cached.len() == piece.len => {
                    self.stats.hits += 1;
                    states.extend_from_slice(&cached[skip..]);
                    continue;
                }
                _ => self.stats.misses += 1,
            }

            let started = Instant::now();
            let result =
                self.solver
                    .solve_segment(piece.slots(flags), piece.start_state, piece.end_state);
            let solve_time = started.elapsed();
            self.stats.fresh_solves += 1;
            if !result.is_valid {
                return Solved {
                    result: SolverResult::infeasible(critical_slots),
                    fresh,
                };
            }
            states.extend_from_slice(&result.states[skip..]);
            fresh.push(FreshFragment {
                key: piece.key,
                states: result.states,
                cost: result.total_cost,
                solve_time,
            });
        }

        Solved {
            result: SolverResult {
                total_cost: schedule_cost(self.solver.machine(), &states),
                states,
                is_valid: true,
                critical_slots,
            },
            fresh,
        }
    }

    /// Solves the whole pattern in one go, bypassing fragments.
    pub fn solve_direct(&mut self, flags: &[bool]) -> SolverResult {
        self.stats.fresh_solves += 1;
        self.solver.solve(flags)
    }

    /// Key of the first short run in `scenario`, the kind of fragment worth
    /// announcing to peers as soon as it is known.
    pub fn discovery_candidate(&self, scenario: &Scenario) -> Option<PatternKey> {
        let flags = scenario.flags();
        fragments(&flags, self.fragmenting?)?
            .into_iter()
            .find(|piece| piece.key.kind() == FragmentKind::Run && (3..=8).contains(&piece.len))
            .map(|piece| piece.key)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hashbrown::HashMap;

    use super::*;
    use crate::search::{machine::StateMachineConfig, solver::DpSolver};

    #[derive(Default)]
    struct MapStore(HashMap<PatternKey, Vec<State>>);

    impl FragmentStore for MapStore {
        fn fetch(&mut self, key: &PatternKey) -> Option<&[State]> {
            self.0.get(key).map(Vec::as_slice)
        }
    }

    fn adapter() -> ScenarioSolver<DpSolver> {
        ScenarioSolver::new(DpSolver::new(Arc::new(StateMachineConfig::standard())))
    }

    #[test]
    fn keys_round_trip_through_text() {
        let key = PatternKey::new(FragmentKind::Run, &[false, true, true, false]).unwrap();
        assert_eq!(key.to_string(), "r0110");
        assert_eq!("r0110".parse::<PatternKey>(), Ok(key));
        assert_eq!(key.flags(), vec![false, true, true, false]);

        assert!("x01".parse::<PatternKey>().is_err());
        assert!("r012".parse::<PatternKey>().is_err());
        assert!("r".parse::<PatternKey>().is_err());
        assert!(PatternKey::new(FragmentKind::Whole, &[true; MAX_PATTERN_LEN]).is_none());
        assert!(PatternKey::new(FragmentKind::Whole, &[true; MAX_PATTERN_LEN - 1]).is_some());
    }

    #[test]
    fn splits_at_deficits() {
        let flags = [true, false, true, true, false, true];
        let pieces = fragments(&flags, State::OnHot).unwrap();
        let keys: Vec<String> = pieces.iter().map(|p| p.key.to_string()).collect();
        assert_eq!(keys, vec!["p10", "r0110", "s01"]);
        assert_eq!(pieces[1].start, 1);
        assert_eq!(pieces[1].len, 4);
        assert_eq!(pieces[0].end_state, Some(State::OnHot));
        assert_eq!(pieces[2].start_state, Some(State::OnHot));
        assert_eq!(pieces[2].end_state, None);

        let whole = fragments(&[true, true], State::OnHot).unwrap();
        assert_eq!(whole.len(), 1);
        assert_eq!(whole[0].key.kind(), FragmentKind::Whole);
    }

    #[test]
    fn fragments_match_direct_solves() {
        let mut adapter = adapter();
        let mut store = MapStore::default();
        for id in 0..(1u64 << 8) {
            let scenario = Scenario::new(id, 8);
            let solved = adapter.solve(&scenario, &mut store);
            let direct = adapter.solve_direct(&scenario.flags());
            assert_eq!(solved.result.total_cost, direct.total_cost, "{scenario}");
            assert_eq!(solved.result.is_valid, direct.is_valid);
            assert_eq!(solved.result.states.len(), 8);
            for piece in solved.fresh {
                store.0.insert(piece.key, piece.states);
            }
        }
        assert!(adapter.stats().hits > adapter.stats().misses);
    }

    #[test]
    fn cached_fragments_are_reused() {
        let mut adapter = adapter();
        let mut store = MapStore::default();
        let scenario = Scenario::new(0b1011_0110, 8);

        let first = adapter.solve(&scenario, &mut store);
        assert_eq!(adapter.stats().hits, 0);
        assert_eq!(first.fresh.len() as u64, adapter.stats().misses);
        for piece in first.fresh {
            store.0.insert(piece.key, piece.states);
        }

        adapter.reset_stats();
        let second = adapter.solve(&scenario, &mut NoStore);
        assert_eq!(second.result, first.result);
        let third = adapter.solve(&scenario, &mut store);
        assert!(third.fresh.is_empty());
        assert_eq!(third.result, first.result);
        assert_eq!(adapter.stats().fresh_solves, second.fresh.len() as u64);
    }

    #[test]
    fn machines_without_a_single_deficit_state_solve_directly() {
        let machine = StateMachineConfig::new(
            [1.0; 6],
            [true, true, false, false, false, false],
            [(State::OnHot, State::OnWarm), (State::OnWarm, State::OnHot)],
        )
        .unwrap();
        let mut adapter = ScenarioSolver::new(DpSolver::new(Arc::new(machine)));
        assert!(!adapter.fragmenting());
        let solved = adapter.solve(&Scenario::new(0b010, 3), &mut NoStore);
        assert!(solved.fresh.is_empty());
        assert!(solved.result.is_valid);
        assert_eq!(solved.result.total_cost, 3.0);
    }

    #[test]
    fn discovery_prefers_short_runs() {
        let adapter = adapter();
        let key = adapter
            .discovery_candidate(&Scenario::new(0b0110_0101, 8))
            .unwrap();
        assert_eq!(key.to_string(), "r0110");
        assert!(adapter
            .discovery_candidate(&Scenario::new(0b0000_0000, 8))
            .is_none());
    }
}
