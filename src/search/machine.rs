use std::fmt;

use petgraph::{graphmap::DiGraphMap, Direction};

use super::error::ConfigError;

pub const STATE_COUNT: usize = 6;

/// Operating state of the resource during one slot. Enumeration order is the
/// solver's tie-break order.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum State {
    OnHot = 0,
    OnWarm = 1,
    OnCold = 2,
    OffHot = 3,
    OffWarm = 4,
    OffCold = 5,
}

impl State {
    pub const ALL: [State; STATE_COUNT] = [
        State::OnHot,
        State::OnWarm,
        State::OnCold,
        State::OffHot,
        State::OffWarm,
        State::OffCold,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<State> {
        State::ALL.get(code as usize).copied()
    }

    /// Whether the resource is running in this state.
    pub fn is_on(self) -> bool {
        matches!(self, State::OnHot | State::OnWarm | State::OnCold)
    }

    pub fn label(self) -> &'static str {
        match self {
            State::OnHot => "ON_HOT",
            State::OnWarm => "ON_WARM",
            State::OnCold => "ON_COLD",
            State::OffHot => "OFF_HOT",
            State::OffWarm => "OFF_WARM",
            State::OffCold => "OFF_COLD",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Costs, deficit coverage and legal transitions of the resource. Constructed
/// once per run and handed to every solver.
#[derive(Clone, Debug)]
pub struct StateMachineConfig {
    costs: [f64; STATE_COUNT],
    serves_deficit: [bool; STATE_COUNT],
    transitions: DiGraphMap<State, ()>,
    // incoming edges per state, sorted, for the DP inner loop
    predecessors: [Vec<State>; STATE_COUNT],
}

impl StateMachineConfig {
    pub fn new(
        costs: [f64; STATE_COUNT],
        serves_deficit: [bool; STATE_COUNT],
        transitions: impl IntoIterator<Item = (State, State)>,
    ) -> Result<Self, ConfigError> {
        for state in State::ALL {
            let cost = costs[state.index()];
            if !cost.is_finite() || cost < 0.0 {
                Err(ConfigError::InvalidCost { state, cost })?
            }
        }
        if !serves_deficit.iter().any(|serves| *serves) {
            Err(ConfigError::NoDeficitState)?
        }

        Ok(Self::build(costs, serves_deficit, transitions))
    }

    fn build(
        costs: [f64; STATE_COUNT],
        serves_deficit: [bool; STATE_COUNT],
        transitions: impl IntoIterator<Item = (State, State)>,
    ) -> Self {
        let mut graph = DiGraphMap::new();
        for state in State::ALL {
            graph.add_node(state);
        }
        for (from, to) in transitions {
            graph.add_edge(from, to, ());
        }

        let predecessors = State::ALL.map(|state| {
            let mut incoming: Vec<State> = graph
                .neighbors_directed(state, Direction::Incoming)
                .collect();
            incoming.sort();
            incoming
        });

        Self {
            costs,
            serves_deficit,
            transitions: graph,
            predecessors,
        }
    }

    /// Three temperatures, on and off. Only a hot running machine can cover a
    /// deficit, and a machine cools one step each slot it spends off.
    pub fn standard() -> Self {
        use State::*;
        let transitions = [
            (OnHot, OnHot),
            (OnHot, OffHot),
            (OffHot, OnWarm),
            (OffHot, OffWarm),
            (OnWarm, OnHot),
            (OnWarm, OffHot),
            (OffWarm, OnCold),
            (OffWarm, OffCold),
            (OnCold, OnWarm),
            (OnCold, OffWarm),
            (OffCold, OnCold),
            (OffCold, OffCold),
        ];
        Self::build(
            [5.0, 2.5, 1.0, 0.0, 0.0, 0.0],
            [true, false, false, false, false, false],
            transitions,
        )
    }

    pub fn cost(&self, state: State) -> f64 {
        self.costs[state.index()]
    }

    pub fn costs(&self) -> &[f64; STATE_COUNT] {
        &self.costs
    }

    /// Whether `state` may occupy a slot whose demand is not covered
    /// externally.
    pub fn serves_deficit(&self, state: State) -> bool {
        self.serves_deficit[state.index()]
    }

    /// Whether `state` may occupy a slot with the given coverage.
    pub fn admits(&self, covered: bool, state: State) -> bool {
        covered || self.serves_deficit(state)
    }

    pub fn allows(&self, from: State, to: State) -> bool {
        self.transitions.contains_edge(from, to)
    }

    pub fn predecessors(&self, state: State) -> &[State] {
        &self.predecessors[state.index()]
    }

    /// The only state able to cover a deficit, if there is exactly one. Deficit
    /// slots then pin the schedule, which is what makes fragments reusable.
    pub fn deficit_state(&self) -> Option<State> {
        let mut serving = State::ALL
            .into_iter()
            .filter(|state| self.serves_deficit(*state));
        match (serving.next(), serving.next()) {
            (Some(state), None) => Some(state),
            _ => None,
        }
    }

    /// Cost of the most expensive state able to cover a deficit.
    pub fn hottest_on_cost(&self) -> f64 {
        State::ALL
            .into_iter()
            .filter(|state| self.serves_deficit(*state))
            .map(|state| self.cost(state))
            .fold(0.0, f64::max)
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.edge_count()
    }
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use State::*;

    #[test]
    fn standard_machine_shape() {
        let machine = StateMachineConfig::standard();
        assert_eq!(machine.transition_count(), 12);
        assert_eq!(machine.deficit_state(), Some(OnHot));
        assert_eq!(machine.hottest_on_cost(), 5.0);

        assert!(machine.allows(OnHot, OffHot));
        assert!(machine.allows(OffCold, OffCold));
        assert!(!machine.allows(OffHot, OnHot));
        assert!(!machine.allows(OnCold, OnHot));

        assert_eq!(machine.predecessors(OnHot), &[OnHot, OnWarm]);
        assert_eq!(machine.predecessors(OffHot), &[OnHot, OnWarm]);
        assert_eq!(machine.predecessors(OnCold), &[OffWarm, OffCold]);
    }

    #[test]
    fn custom_machine_matches_standard() {
        let reference = StateMachineConfig::standard();
        let standard = &reference;
        let edges = State::ALL.into_iter().flat_map(|from| {
            State::ALL
                .into_iter()
                .filter(move |to| standard.allows(from, *to))
                .map(move |to| (from, to))
        });
        let custom = StateMachineConfig::new(
            [5.0, 2.5, 1.0, 0.0, 0.0, 0.0],
            [true, false, false, false, false, false],
            edges.collect::<Vec<_>>(),
        )
        .unwrap();
        for state in State::ALL {
            assert_eq!(custom.predecessors(state), standard.predecessors(state));
        }
    }

    #[test]
    fn rejects_bad_machines() {
        assert!(matches!(
            StateMachineConfig::new([-1.0, 0.0, 0.0, 0.0, 0.0, 0.0], [true; 6], []),
            Err(ConfigError::InvalidCost { state: OnHot, .. })
        ));
        assert!(matches!(
            StateMachineConfig::new([0.0; 6], [false; 6], []),
            Err(ConfigError::NoDeficitState)
        ));
        let two_servers =
            StateMachineConfig::new([1.0; 6], [true, true, false, false, false, false], [])
                .unwrap();
        assert_eq!(two_servers.deficit_state(), None);
    }

    #[test]
    fn state_codes_round_trip() {
        for state in State::ALL {
            assert_eq!(State::from_code(state.code()), Some(state));
        }
        assert_eq!(State::from_code(6), None);
        assert!(OnCold.is_on());
        assert!(!OffHot.is_on());
    }
}
