use std::sync::Arc;

use super::machine::{State, StateMachineConfig, STATE_COUNT};

/// Optimal schedule for one pattern or one stretch of it.
#[derive(Clone, Debug, PartialEq)]
pub struct SolverResult {
    /// One state per slot. Empty when no legal schedule exists.
    pub states: Vec<State>,
    pub total_cost: f64,
    pub is_valid: bool,
    /// Slots the machine had to serve itself.
    pub critical_slots: u32,
}

impl SolverResult {
    pub fn infeasible(critical_slots: u32) -> Self {
        Self {
            states: Vec::new(),
            total_cost: 0.0,
            is_valid: false,
            critical_slots,
        }
    }

    /// On/off switch points of a valid schedule, see [`transition_summary`].
    pub fn transitions(&self) -> String {
        if self.is_valid {
            transition_summary(&self.states)
        } else {
            String::new()
        }
    }
}

/// Solves the optimal schedule of a constrained stretch of slots. Callers
/// treat implementations as black boxes: the same input always yields the
/// same schedule.
pub trait Solver {
    fn machine(&self) -> &StateMachineConfig;

    /// Solves `flags` with the first and last state optionally pinned.
    /// `flags[i]` is true when slot `i` is covered externally.
    fn solve_segment(
        &mut self,
        flags: &[bool],
        start: Option<State>,
        end: Option<State>,
    ) -> SolverResult;

    fn solve(&mut self, flags: &[bool]) -> SolverResult {
        self.solve_segment(flags, None, None)
    }
}

/// Forward dynamic program over (slot, state) with back pointers. Ties go to
/// the state listed first in [`State::ALL`].
pub struct DpSolver {
    machine: Arc<StateMachineConfig>,
    best: Vec<[f64; STATE_COUNT]>,
    parent: Vec<[Option<State>; STATE_COUNT]>,
}

impl DpSolver {
    pub fn new(machine: Arc<StateMachineConfig>) -> Self {
        Self {
            machine,
            best: Vec::new(),
            parent: Vec::new(),
        }
    }
}

impl Solver for DpSolver {
    fn machine(&self) -> &StateMachineConfig {
        &self.machine
    }

    fn solve_segment(
        &mut self,
        flags: &[bool],
        start: Option<State>,
        end: Option<State>,
    ) -> SolverResult {
        let critical_slots = flags.iter().filter(|covered| !**covered).count() as u32;
        if flags.is_empty() {
            return SolverResult::infeasible(critical_slots);
        }
        let machine = &*self.machine;
        let slots = flags.len();
        self.best.clear();
        self.best.resize(slots, [f64::INFINITY; STATE_COUNT]);
        self.parent.clear();
        self.parent.resize(slots, [None; STATE_COUNT]);

        for state in State::ALL {
            let pinned_out = start.is_some_and(|pinned| pinned != state);
            if !pinned_out && machine.admits(flags[0], state) {
                self.best[0][state.index()] = machine.cost(state);
            }
        }

        for slot in 1..slots {
            for state in State::ALL {
                if !machine.admits(flags[slot], state) {
                    continue;
                }
                let mut best = f64::INFINITY;
                let mut parent = None;
                for &from in machine.predecessors(state) {
                    let reached = self.best[slot - 1][from.index()];
                    if reached < best {
                        best = reached;
                        parent = Some(from);
                    }
                }
                if parent.is_some() {
                    self.best[slot][state.index()] = best + machine.cost(state);
                    self.parent[slot][state.index()] = parent;
                }
            }
        }

        let last = &self.best[slots - 1];
        let finish = match end {
            Some(state) => last[state.index()].is_finite().then_some(state),
            None => {
                let mut finish = None;
                let mut best = f64::INFINITY;
                for state in State::ALL {
                    if last[state.index()] < best {
                        best = last[state.index()];
                        finish = Some(state);
                    }
                }
                finish
            }
        };
        let Some(mut state) = finish else {
            return SolverResult::infeasible(critical_slots);
        };

        let mut states = vec![state; slots];
        for slot in (1..slots).rev() {
            match self.parent[slot][state.index()] {
                Some(from) => {
                    state = from;
                    states[slot - 1] = from;
                }
                None => return SolverResult::infeasible(critical_slots),
            }
        }

        SolverResult {
            total_cost: schedule_cost(machine, &states),
            states,
            is_valid: true,
            critical_slots,
        }
    }
}

/// Sum of state costs in slot order.
pub fn schedule_cost(machine: &StateMachineConfig, states: &[State]) -> f64 {
    states.iter().map(|state| machine.cost(*state)).sum()
}

/// Slots where the machine is switched on or off, joined by `-`. Slot 0 counts
/// as a switch when the schedule starts running, and the last slot is added
/// when the schedule ends running. An empty string means the machine never
/// ran.
pub fn transition_summary(states: &[State]) -> String {
    let mut switches = Vec::new();
    let mut was_on = false;
    for (slot, state) in states.iter().enumerate() {
        let on = state.is_on();
        if slot == 0 {
            if on {
                switches.push(slot);
            }
        } else if on != was_on {
            switches.push(slot);
        }
        was_on = on;
    }
    let last = states.len().saturating_sub(1);
    if was_on && switches.last().is_some_and(|slot| *slot != last) {
        switches.push(last);
    }

    switches
        .iter()
        .map(|slot| slot.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use State::*;

    fn solver() -> DpSolver {
        DpSolver::new(Arc::new(StateMachineConfig::standard()))
    }

    fn flags(bits: &str) -> Vec<bool> {
        bits.chars().map(|c| c == '1').collect()
    }

    #[test]
    fn extremes_of_four_slots() {
        let mut solver = solver();
        let covered = solver.solve(&flags("1111"));
        assert!(covered.is_valid);
        assert_eq!(covered.total_cost, 0.0);
        assert_eq!(covered.critical_slots, 0);
        assert_eq!(covered.states, vec![OffHot, OffWarm, OffCold, OffCold]);

        let deficit = solver.solve(&flags("0000"));
        assert!(deficit.is_valid);
        assert_eq!(deficit.total_cost, 20.0);
        assert_eq!(deficit.critical_slots, 4);
        assert_eq!(deficit.states, vec![OnHot; 4]);
    }

    #[test]
    fn cools_down_between_deficits() {
        let result = solver().solve(&flags("0110"));
        assert_eq!(result.states, vec![OnHot, OffHot, OnWarm, OnHot]);
        assert_eq!(result.total_cost, 12.5);

        // too short a gap to save anything
        let result = solver().solve(&flags("010"));
        assert_eq!(result.states, vec![OnHot, OnHot, OnHot]);
        assert_eq!(result.total_cost, 15.0);
    }

    #[test]
    fn pinned_ends() {
        let mut solver = solver();
        let result = solver.solve_segment(&flags("11"), Some(OffCold), Some(OnHot));
        assert!(!result.is_valid);
        assert!(result.states.is_empty());
        assert_eq!(result.total_cost, 0.0);

        let result = solver.solve_segment(&flags("011"), Some(OnHot), None);
        assert_eq!(result.states[0], OnHot);
        assert_eq!(result.total_cost, 5.0);

        let result = solver.solve_segment(&flags("110"), None, Some(OnHot));
        assert_eq!(result.states, vec![OffHot, OnWarm, OnHot]);
        assert_eq!(result.total_cost, 7.5);

        assert!(!solver.solve(&[]).is_valid);
    }

    #[test]
    fn deterministic() {
        let mut first = solver();
        let mut second = solver();
        for id in 0..(1u32 << 8) {
            let bits: Vec<bool> = (0..8).rev().map(|b| (id >> b) & 1 == 1).collect();
            assert_eq!(first.solve(&bits), second.solve(&bits));
            assert_eq!(first.solve(&bits), first.solve(&bits));
        }
    }

    #[test]
    fn transitions() {
        assert_eq!(transition_summary(&[OnHot, OnHot, OffHot, OnWarm]), "0-2-3");
        assert_eq!(transition_summary(&[OffHot, OnWarm, OnHot, OffHot]), "1-3");
        assert_eq!(transition_summary(&[OffHot, OffWarm, OffCold]), "");
        assert_eq!(transition_summary(&[OnHot]), "0");
        assert_eq!(transition_summary(&[OffHot, OffHot, OnWarm]), "2");
        assert_eq!(transition_summary(&[]), "");
    }
}
