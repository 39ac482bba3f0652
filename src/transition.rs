use crate::automaton::{Automaton, State, Transition};
use crate::feature::FeatureVector;
use crate::statistics::Statistics;

/// Computes the cost contributed by a set of weight vectors at one position:
/// `-Σ_w (w · x + w[default])`.
#[inline(always)]
pub fn weights_cost(automaton: &Automaton, handles: &[usize], input: &FeatureVector) -> f64 {
    let default = automaton.input_dim();
    let mut score = 0.0;
    for &h in handles {
        let w = automaton.weights(h);
        score += input.dot(&w[..default]) + w[default];
    }
    -score
}

/// Computes the cost of taking `transition` while reading `input`.
#[inline(always)]
pub fn transition_cost(automaton: &Automaton, transition: &Transition, input: &FeatureVector) -> f64 {
    weights_cost(automaton, &transition.weights, input)
}

/// Adds `amount` to the statistics of every weight vector of `transition`.
///
/// `stats` receives constraints or expectations depending on which pass is
/// running; this is the only path from lattice marginals to the gradient.
#[inline(always)]
pub fn increment_count(
    stats: &mut Statistics,
    transition: &Transition,
    input: &FeatureVector,
    amount: f64,
) {
    stats.increment_weights(&transition.weights, input, amount);
}

/// Iterates over the finite-cost transitions leaving a state at one input
/// position.
///
/// Transitions whose label differs from the imposed constraint, or whose cost
/// is `+∞`, are skipped.
pub struct TransitionIterator<'a> {
    automaton: &'a Automaton,
    transitions: &'a [Transition],
    input: &'a FeatureVector,
    label: Option<usize>,
    next: usize,
}

impl<'a> TransitionIterator<'a> {
    /// Creates an iterator over the transitions of `state`.
    ///
    /// # Arguments
    ///
    /// * `automaton` - Automaton providing the weights.
    /// * `state` - Source state.
    /// * `input` - Feature vector at the current position.
    /// * `label` - If given, only transitions emitting this label are live.
    #[inline(always)]
    pub fn new(
        automaton: &'a Automaton,
        state: &'a State,
        input: &'a FeatureVector,
        label: Option<usize>,
    ) -> Self {
        Self {
            automaton,
            transitions: state.transitions(),
            input,
            label,
            next: 0,
        }
    }
}

impl<'a> Iterator for TransitionIterator<'a> {
    /// Transition index within the state, the transition, and its cost.
    type Item = (usize, &'a Transition, f64);

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < self.transitions.len() {
            let i = self.next;
            self.next += 1;
            let transition = &self.transitions[i];
            if self.label.is_some_and(|l| l != transition.label) {
                continue;
            }
            let cost = transition_cost(self.automaton, transition, self.input);
            if cost == f64::INFINITY {
                continue;
            }
            return Some((i, transition, cost));
        }
        None
    }
}
