use hashbrown::HashMap;

use crate::alphabet::Alphabet;
use crate::automaton::{Automaton, State, TransitionSpec};
use crate::errors::{CrfError, Result};

/// Separator between the two halves of a pair state name.
pub const DEFAULT_SEPARATOR: &str = ",";

// A first-order transition with every index replaced by its name.
struct NamedEdge {
    pair: String,
    label: String,
    weights: Vec<String>,
}

impl NamedEdge {
    fn spec<'a>(&'a self, prev: Option<&'a NamedEdge>) -> TransitionSpec<'a> {
        TransitionSpec {
            destination: &self.pair,
            label: &self.label,
            weights: self.weights.iter().map(String::as_str).collect(),
            prev_label: prev.map(|p| p.label.as_str()),
            prev_weights: prev
                .map(|p| p.weights.iter().map(String::as_str).collect())
                .unwrap_or_default(),
        }
    }
}

fn lookup(alphabet: &Alphabet, idx: usize) -> Result<&str> {
    alphabet
        .name(idx)
        .ok_or_else(|| CrfError::inconsistent(format!("index {idx} has no name")))
}

/// Automaton whose states remember the previous first-order state.
///
/// Every first-order state `C` with a finite initial cost becomes a start
/// state named `C`, and every first-order transition `L→C` becomes a pair
/// state named `"L{sep}C"`. A transition out of a state whose center is `C`
/// exists for every first-order transition `C→R` and leads to `"C{sep}R"`.
/// Transitions leaving a pair state also carry the label and weights of the
/// edge `L→C`.
///
/// Paths correspond one to one with those of the first-order automaton, with
/// the same costs. The weight vectors have the same names and handles.
#[derive(Clone, Debug)]
pub struct SecondOrder {
    automaton: Automaton,
    first_states: Alphabet,
    origins: Vec<(Option<usize>, usize)>,
    starts: Vec<Option<usize>>,
    representatives: Vec<Option<usize>>,
    pairs: HashMap<(usize, usize), usize>,
}

impl SecondOrder {
    /// Builds the second-order automaton using [`DEFAULT_SEPARATOR`].
    ///
    /// # Errors
    ///
    /// See [`SecondOrder::with_separator()`].
    pub fn new(first: &Automaton) -> Result<Self> {
        Self::with_separator(first, DEFAULT_SEPARATOR)
    }

    /// Builds the second-order automaton of `first`.
    ///
    /// # Errors
    ///
    /// Fails if `first` has undeclared states, a state name contains
    /// `separator`, or two states are connected by more than one transition.
    pub fn with_separator(first: &Automaton, separator: &str) -> Result<Self> {
        if separator.is_empty() {
            return Err(CrfError::invalid_argument("separator must not be empty"));
        }
        first.check_resolved()?;
        if let Some(state) = first.states().iter().find(|s| s.name().contains(separator)) {
            return Err(CrfError::invalid_argument(format!(
                "state name {} contains the separator {separator}",
                state.name()
            )));
        }

        let mut automaton = Automaton::new(first.input_dim());
        for label in first.labels().iter() {
            automaton.add_label(label);
        }
        for name in first.weight_names().iter() {
            automaton.weights_index(name)?;
        }
        automaton.copy_weights_from(first)?;
        automaton.freeze_weights();

        let mut edges = Vec::with_capacity(first.num_states());
        for state in first.states() {
            let mut out = Vec::with_capacity(state.transitions().len());
            for t in state.transitions() {
                out.push(NamedEdge {
                    pair: format!(
                        "{}{separator}{}",
                        state.name(),
                        first.state(t.destination()).name()
                    ),
                    label: lookup(first.labels(), t.label())?.to_string(),
                    weights: t
                        .weights()
                        .iter()
                        .map(|&h| lookup(first.weight_names(), h).map(str::to_string))
                        .collect::<Result<_>>()?,
                });
            }
            edges.push(out);
        }

        let mut origins_by_name = HashMap::new();
        for (c, state) in first.states().iter().enumerate() {
            if state.initial_cost() == f64::INFINITY {
                continue;
            }
            let specs = edges[c].iter().map(|e| e.spec(None)).collect();
            automaton.declare_state(state.name(), state.initial_cost(), state.final_cost(), specs)?;
            origins_by_name.insert(state.name().to_string(), (None, c));
        }
        for (l, state) in first.states().iter().enumerate() {
            for (t, incoming) in state.transitions().iter().zip(&edges[l]) {
                let c = t.destination();
                let center = first.state(c);
                if origins_by_name.contains_key(&incoming.pair) {
                    return Err(CrfError::invalid_argument(format!(
                        "states {} and {} are connected by more than one transition",
                        state.name(),
                        center.name()
                    )));
                }
                let specs = edges[c].iter().map(|e| e.spec(Some(incoming))).collect();
                automaton.declare_state(&incoming.pair, f64::INFINITY, center.final_cost(), specs)?;
                origins_by_name.insert(incoming.pair.clone(), (Some(l), c));
            }
        }

        let mut origins = Vec::with_capacity(automaton.num_states());
        for state in automaton.states() {
            let origin = origins_by_name.get(state.name()).ok_or_else(|| {
                CrfError::inconsistent(format!("state {} has no origin", state.name()))
            })?;
            origins.push(*origin);
        }
        let mut starts = vec![None; first.num_states()];
        let mut representatives = vec![None; first.num_states()];
        let mut pairs = HashMap::new();
        for (s, &(left, center)) in origins.iter().enumerate() {
            match left {
                None => starts[center] = Some(s),
                Some(l) => {
                    pairs.insert((l, center), s);
                }
            }
            representatives[center].get_or_insert(s);
        }

        Ok(Self {
            automaton,
            first_states: Alphabet::from_names(first.states().iter().map(State::name)),
            origins,
            starts,
            representatives,
            pairs,
        })
    }

    /// Gets the second-order automaton.
    #[inline(always)]
    pub fn automaton(&self) -> &Automaton {
        &self.automaton
    }

    pub(crate) fn automaton_mut(&mut self) -> &mut Automaton {
        &mut self.automaton
    }

    /// Returns the second-order automaton.
    pub fn into_automaton(self) -> Automaton {
        self.automaton
    }

    /// Gets the first-order `(left, center)` states a state stands for. Start
    /// states have no left state.
    #[inline(always)]
    pub fn origin(&self, s: usize) -> (Option<usize>, usize) {
        self.origins[s]
    }

    /// Returns the index of a first-order state by name.
    #[inline(always)]
    pub fn first_state_index(&self, name: &str) -> Option<usize> {
        self.first_states.lookup(name)
    }

    /// Returns the start state built from first-order state `center`.
    #[inline(always)]
    pub fn start_state(&self, center: usize) -> Option<usize> {
        self.starts.get(center).copied().flatten()
    }

    /// Returns the pair state built from the first-order edge `left→center`.
    #[inline(always)]
    pub fn pair_state(&self, left: usize, center: usize) -> Option<usize> {
        self.pairs.get(&(left, center)).copied()
    }

    /// Some state whose center is `center`. All of them have the same
    /// outgoing transitions up to the incoming edge.
    pub(crate) fn representative(&self, center: usize) -> Option<usize> {
        self.representatives.get(center).copied().flatten()
    }

    /// Iterates over the start states.
    pub(crate) fn start_states(&self) -> impl Iterator<Item = usize> + '_ {
        self.starts.iter().flatten().copied()
    }

    /// Maps a sequence of second-order states to first-order states.
    pub fn to_first_order(&self, states: &[usize]) -> Vec<usize> {
        states.iter().map(|&s| self.origins[s].1).collect()
    }

    /// Copies the weights back into the first-order automaton.
    ///
    /// # Errors
    ///
    /// Fails if the input dimensions differ.
    pub fn copy_weights_into(&self, first: &mut Automaton) -> Result<()> {
        first.copy_weights_from(&self.automaton)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::feature::FeatureVector;
    use crate::lattice::Lattice;
    use crate::test_utils;

    #[test]
    fn test_structure() {
        let first = test_utils::generate_test_automaton();
        let second = SecondOrder::new(&first).unwrap();
        let automaton = second.automaton();

        // 2 start states and 4 pair states
        assert_eq!(6, automaton.num_states());
        for name in ["A", "B", "A,A", "A,B", "B,A", "B,B"] {
            assert!(automaton.state_index(name).is_some(), "{name}");
        }
        let a = first.state_index("A").unwrap();
        let b = first.state_index("B").unwrap();
        let ab = second.pair_state(a, b).unwrap();
        assert_eq!("A,B", automaton.state(ab).name());
        assert_eq!((Some(a), b), second.origin(ab));
        assert_eq!(f64::INFINITY, automaton.state(ab).initial_cost());
        assert_eq!(first.state(b).final_cost(), automaton.state(ab).final_cost());

        let start_a = second.start_state(a).unwrap();
        assert_eq!(first.state(a).initial_cost(), automaton.state(start_a).initial_cost());
        assert!(automaton.state(start_a).transitions().iter().all(|t| t.prev_label().is_none()));

        let ab_a = first.weight_names().lookup("A->B").unwrap();
        let transitions = automaton.state(ab).transitions();
        assert_eq!(2, transitions.len());
        for t in transitions {
            assert_eq!(Some(first.label_index("B").unwrap()), t.prev_label());
            assert_eq!(&[ab_a], t.prev_weights());
            assert_eq!(Some(b), second.origin(t.destination()).0);
        }
        assert_eq!(first.weights(ab_a), automaton.weights(ab_a));
        assert!(automaton.weights_frozen());
    }

    #[test]
    fn test_same_costs_as_first_order() {
        let first = test_utils::generate_test_automaton();
        let second = SecondOrder::new(&first).unwrap();
        let input = test_utils::generate_test_input();
        for len in 0..=input.len() {
            let x = &input[..len];
            let expected = Lattice::new(&first, x, None, None).unwrap().cost();
            let actual = Lattice::new(second.automaton(), x, None, None).unwrap().cost();
            assert!((expected - actual).abs() < 1e-12);
        }
        let mut longer = input.clone();
        longer.push(FeatureVector::binary(&[0, 2]));
        let expected = Lattice::new(&first, &longer, Some(&[1, 1, 0]), None)
            .unwrap()
            .cost();
        let actual = Lattice::new(second.automaton(), &longer, Some(&[1, 1, 0]), None)
            .unwrap()
            .cost();
        assert!((expected - actual).abs() < 1e-12);
    }

    #[test]
    fn test_best_path() {
        let first = test_utils::generate_test_automaton();
        let second = SecondOrder::new(&first).unwrap();
        let input = test_utils::generate_test_input();
        let expected = first.search_best_path(&input).unwrap();
        let actual = second.automaton().search_best_path(&input).unwrap();
        assert!((expected.cost - actual.cost).abs() < 1e-12);
        assert_eq!(expected.states, second.to_first_order(&actual.states));
        assert_eq!(expected.labels, actual.labels);
    }

    #[test]
    fn test_copy_weights_into() {
        let mut first = test_utils::generate_test_automaton();
        let mut second = SecondOrder::new(&first).unwrap();
        let h = first.weight_names().lookup("B->A").unwrap();
        second.automaton_mut().weights_mut(h)[1] = 4.0;
        second.copy_weights_into(&mut first).unwrap();
        assert_eq!(4.0, first.weights(h)[1]);
    }

    #[test]
    fn test_invalid() {
        let mut first = Automaton::new(1);
        first
            .add_state("A,1", 0.0, 0.0, &["A,1"], &["a"], &["w"])
            .unwrap();
        assert!(SecondOrder::new(&first).is_err());
        assert!(SecondOrder::with_separator(&first, "|").is_ok());
        assert!(SecondOrder::with_separator(&first, "").is_err());

        let mut parallel = Automaton::new(1);
        parallel
            .add_state("A", 0.0, 0.0, &["A", "A"], &["a", "b"], &["w0", "w1"])
            .unwrap();
        assert!(SecondOrder::new(&parallel).is_err());

        let mut unresolved = Automaton::new(1);
        unresolved
            .add_state("A", 0.0, 0.0, &["B"], &["b"], &["w"])
            .unwrap();
        assert!(SecondOrder::new(&unresolved).is_err());
    }
}
