use crate::automaton::Automaton;
use crate::errors::{CrfError, Result};
use crate::feature::FeatureVector;
use crate::math::{costs_agree, sum_neg_log_prob};
use crate::statistics::Statistics;
use crate::transition::{increment_count, TransitionIterator};

/// Forward-backward tables of one input sequence.
///
/// `alpha[t][s]` is the cost of all paths that start in an initial state and
/// reach `s` after reading `t` positions. `beta[t][s]` is the cost of all
/// paths from `s` at position `t` to the end of the input, final cost
/// included. Costs are negative log weights combined with
/// [`sum_neg_log_prob`].
///
/// An absorbing state (see [`State::is_absorbing()`]) stays where it is at
/// cost 0 for every remaining position, whatever label is imposed there.
///
/// [`State::is_absorbing()`]: crate::State::is_absorbing
pub struct Lattice {
    alpha: Vec<Vec<f64>>,
    beta: Vec<Vec<f64>>,
    cost: f64,
    backward_cost: Option<f64>,
}

impl Lattice {
    /// Runs forward-backward over `input`.
    ///
    /// # Arguments
    ///
    /// * `automaton` - Automaton defining paths and costs.
    /// * `input` - One feature vector per position.
    /// * `output` - If given, only paths emitting exactly these labels count.
    /// * `stats` - If given, the backward pass also runs and the marginal of
    ///   every transition, initial and final state is added to it.
    ///
    /// # Errors
    ///
    /// Fails if `output` has a different length than `input`, if the total
    /// cost is NaN, or if the forward and backward totals disagree.
    pub fn new(
        automaton: &Automaton,
        input: &[FeatureVector],
        output: Option<&[usize]>,
        stats: Option<&mut Statistics>,
    ) -> Result<Self> {
        let backward = stats.is_some();
        Self::build(automaton, input, output, backward, stats)
    }

    /// Runs forward and backward without collecting statistics.
    ///
    /// # Errors
    ///
    /// See [`Lattice::new()`].
    pub fn full(
        automaton: &Automaton,
        input: &[FeatureVector],
        output: Option<&[usize]>,
    ) -> Result<Self> {
        Self::build(automaton, input, output, true, None)
    }

    fn build(
        automaton: &Automaton,
        input: &[FeatureVector],
        output: Option<&[usize]>,
        backward: bool,
        stats: Option<&mut Statistics>,
    ) -> Result<Self> {
        if let Some(output) = output {
            if output.len() != input.len() {
                return Err(CrfError::invalid_argument(format!(
                    "input has {} positions but output has {}",
                    input.len(),
                    output.len()
                )));
            }
        }
        let n_states = automaton.num_states();
        let len = input.len();

        // alphas
        let mut alpha = vec![vec![f64::INFINITY; n_states]; len + 1];
        for (a, state) in alpha[0].iter_mut().zip(automaton.states()) {
            *a = state.initial_cost();
        }
        for (t, x) in input.iter().enumerate() {
            let label = output.map(|o| o[t]);
            let (prev, next) = alpha.split_at_mut(t + 1);
            let (prev, next) = (&prev[t], &mut next[0]);
            for (s, (state, &a)) in automaton.states().iter().zip(prev).enumerate() {
                if a == f64::INFINITY {
                    continue;
                }
                if state.is_absorbing() {
                    next[s] = sum_neg_log_prob(next[s], a);
                    continue;
                }
                for (_, transition, cost) in TransitionIterator::new(automaton, state, x, label) {
                    let d = transition.destination();
                    next[d] = sum_neg_log_prob(next[d], a + cost);
                }
            }
        }
        let mut cost = f64::INFINITY;
        for (state, &a) in automaton.states().iter().zip(&alpha[len]) {
            if a == f64::INFINITY || state.final_cost() == f64::INFINITY {
                continue;
            }
            cost = sum_neg_log_prob(cost, a + state.final_cost());
        }
        if cost.is_nan() {
            return Err(CrfError::not_a_number("forward cost is NaN"));
        }

        if !backward {
            return Ok(Self {
                alpha,
                beta: vec![],
                cost,
                backward_cost: None,
            });
        }

        // betas
        let mut beta = vec![vec![f64::INFINITY; n_states]; len + 1];
        for (b, state) in beta[len].iter_mut().zip(automaton.states()) {
            *b = state.final_cost();
        }
        for (t, x) in input.iter().enumerate().rev() {
            let label = output.map(|o| o[t]);
            let (curr, next) = beta.split_at_mut(t + 1);
            let (curr, next) = (&mut curr[t], &next[0]);
            for (s, (state, b)) in automaton.states().iter().zip(curr.iter_mut()).enumerate() {
                if state.is_absorbing() {
                    *b = next[s];
                    continue;
                }
                for (_, transition, cost) in TransitionIterator::new(automaton, state, x, label) {
                    let nb = next[transition.destination()];
                    if nb == f64::INFINITY {
                        continue;
                    }
                    *b = sum_neg_log_prob(*b, cost + nb);
                }
            }
        }
        let mut backward_cost = f64::INFINITY;
        for (state, &b) in automaton.states().iter().zip(&beta[0]) {
            if b == f64::INFINITY || state.initial_cost() == f64::INFINITY {
                continue;
            }
            backward_cost = sum_neg_log_prob(backward_cost, state.initial_cost() + b);
        }
        if !costs_agree(cost, backward_cost) {
            return Err(CrfError::inconsistent(format!(
                "forward cost {cost} and backward cost {backward_cost} disagree"
            )));
        }

        let lattice = Self {
            alpha,
            beta,
            cost,
            backward_cost: Some(backward_cost),
        };
        if let Some(stats) = stats {
            if cost.is_finite() {
                lattice.accumulate(automaton, input, output, stats);
            }
        }
        Ok(lattice)
    }

    fn accumulate(
        &self,
        automaton: &Automaton,
        input: &[FeatureVector],
        output: Option<&[usize]>,
        stats: &mut Statistics,
    ) {
        let len = input.len();
        for (s, state) in automaton.states().iter().enumerate() {
            let b = self.beta[0][s];
            if state.initial_cost() == f64::INFINITY || b == f64::INFINITY {
                continue;
            }
            let p = (self.cost - (state.initial_cost() + b)).exp();
            stats.increment_initial(s, p);
        }
        for (t, x) in input.iter().enumerate() {
            let label = output.map(|o| o[t]);
            for (state, &a) in automaton.states().iter().zip(&self.alpha[t]) {
                if a == f64::INFINITY {
                    continue;
                }
                for (_, transition, cost) in TransitionIterator::new(automaton, state, x, label) {
                    let b = self.beta[t + 1][transition.destination()];
                    if b == f64::INFINITY {
                        continue;
                    }
                    let p = (self.cost - (a + cost + b)).exp();
                    increment_count(stats, transition, x, p);
                }
            }
        }
        for (s, state) in automaton.states().iter().enumerate() {
            let a = self.alpha[len][s];
            if state.final_cost() == f64::INFINITY || a == f64::INFINITY {
                continue;
            }
            let p = (self.cost - (a + state.final_cost())).exp();
            stats.increment_final(s, p);
        }
    }

    /// Gets the total cost of all paths.
    #[inline(always)]
    pub fn cost(&self) -> f64 {
        self.cost
    }

    /// Gets the total cost computed from the backward table, if it was built.
    #[inline(always)]
    pub fn backward_cost(&self) -> Option<f64> {
        self.backward_cost
    }

    /// Gets the number of positions.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.alpha.len() - 1
    }

    /// Returns `true` if the input was empty.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gets the forward cost of state `s` after `t` positions.
    #[inline(always)]
    pub fn alpha(&self, t: usize, s: usize) -> f64 {
        self.alpha[t][s]
    }

    /// Gets the backward cost of state `s` at position `t`, if it was built.
    #[inline(always)]
    pub fn beta(&self, t: usize, s: usize) -> Option<f64> {
        self.beta.get(t).map(|b| b[s])
    }

    /// Gets the probability of being in state `s` after `t` positions, if the
    /// backward table was built.
    pub fn state_marginal(&self, t: usize, s: usize) -> Option<f64> {
        let b = self.beta(t, s)?;
        let a = self.alpha[t][s];
        if a == f64::INFINITY || b == f64::INFINITY || self.cost == f64::INFINITY {
            return Some(0.0);
        }
        Some((self.cost - (a + b)).exp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_utils::{self, neg_logsumexp};

    #[test]
    fn test_single_state_empty_sequence() {
        let mut automaton = Automaton::new(3);
        automaton.add_state("S", 0.0, 0.0, &[], &[], &[]).unwrap();
        let lattice = Lattice::full(&automaton, &[], None).unwrap();
        assert_eq!(0.0, lattice.cost());
        assert_eq!(Some(0.0), lattice.backward_cost());
        assert!(lattice.is_empty());
    }

    #[test]
    fn test_single_state_without_transitions() {
        let mut automaton = Automaton::new(3);
        automaton.add_state("S", 0.0, 0.0, &[], &[], &[]).unwrap();
        automaton.add_label("a");
        let mut input = test_utils::generate_test_input();
        input.push(crate::feature::FeatureVector::binary(&[1]));
        for len in 0..=input.len() {
            let mut stats = Statistics::new(&automaton);
            let lattice = Lattice::new(&automaton, &input[..len], None, Some(&mut stats)).unwrap();
            assert_eq!(0.0, lattice.cost());
            assert_eq!(Some(0.0), lattice.backward_cost());
            assert_eq!(Some(1.0), lattice.state_marginal(len, 0));
            assert_eq!(1.0, stats.initial(0));
            assert_eq!(1.0, stats.final_count(0));
        }
        let labeled = Lattice::new(&automaton, &input, Some(&[0, 0, 0]), None).unwrap();
        assert_eq!(0.0, labeled.cost());
    }

    #[test]
    fn test_absorbing_state_after_transition() {
        let mut automaton = Automaton::new(1);
        automaton
            .add_state("S", 0.0, f64::INFINITY, &["E"], &["x"], &["w"])
            .unwrap();
        automaton.add_state("E", f64::INFINITY, 0.5, &[], &[], &[]).unwrap();
        automaton.weights_mut(0).copy_from_slice(&[0.3, -1.2]);
        let input = vec![crate::feature::FeatureVector::binary(&[0]); 3];
        let mut stats = Statistics::new(&automaton);
        let lattice = Lattice::new(&automaton, &input, None, Some(&mut stats)).unwrap();
        // S -> E at the first position, then E absorbs the rest
        assert!((lattice.cost() - 1.4).abs() < 1e-12);
        assert!((lattice.backward_cost().unwrap() - 1.4).abs() < 1e-12);
        assert!((stats.weights(0)[1] - 1.0).abs() < 1e-12);
        assert!((stats.weights(0)[0] - 1.0).abs() < 1e-12);
    }

    // Paths of the test automaton over the test input (labels A=0, B=1):
    // every label sequence y0 y1 with cost
    //   initial(y_-1) + c(y_-1 -> y0, x0) + c(y0 -> y1, x1) + final(y1)
    // summed over the start state y_-1.
    #[test]
    fn test_free_cost() {
        let automaton = test_utils::generate_test_automaton();
        let input = test_utils::generate_test_input();
        let lattice = Lattice::full(&automaton, &input, None).unwrap();

        let mut costs = vec![];
        for s in 0..2 {
            for y0 in 0..2 {
                for y1 in 0..2 {
                    costs.push(test_utils::path_cost(&automaton, &input, &[s, y0, y1]));
                }
            }
        }
        let expected = neg_logsumexp(&costs);
        assert!((expected - lattice.cost()).abs() < 1e-12);
        assert!((expected - lattice.backward_cost().unwrap()).abs() < 1e-12);
    }

    #[test]
    fn test_clamped_cost() {
        let automaton = test_utils::generate_test_automaton();
        let input = test_utils::generate_test_input();
        let lattice = Lattice::new(&automaton, &input, Some(&[1, 0]), None).unwrap();

        let costs: Vec<f64> = (0..2)
            .map(|s| test_utils::path_cost(&automaton, &input, &[s, 1, 0]))
            .collect();
        let expected = neg_logsumexp(&costs);
        assert!((expected - lattice.cost()).abs() < 1e-12);
        assert_eq!(None, lattice.backward_cost());
        assert_eq!(None, lattice.beta(0, 0));

        let free = Lattice::new(&automaton, &input, None, None).unwrap();
        assert!(lattice.cost() >= free.cost());
    }

    #[test]
    fn test_labeled_cost_at_least_free_cost() {
        let automaton = test_utils::generate_test_automaton();
        let input = test_utils::generate_test_input();
        let free = Lattice::new(&automaton, &input, None, None).unwrap().cost();
        for y0 in 0..2 {
            for y1 in 0..2 {
                let labeled = Lattice::new(&automaton, &input, Some(&[y0, y1]), None)
                    .unwrap()
                    .cost();
                assert!(labeled >= free);
            }
        }
    }

    #[test]
    fn test_single_path_equality() {
        let mut automaton = Automaton::new(1);
        automaton
            .add_state("S", 0.0, f64::INFINITY, &["E"], &["x"], &["w"])
            .unwrap();
        automaton
            .add_state("E", f64::INFINITY, 0.0, &[], &[], &[])
            .unwrap();
        automaton.weights_mut(0).copy_from_slice(&[0.3, -1.2]);
        let input = vec![crate::feature::FeatureVector::binary(&[0])];
        let free = Lattice::full(&automaton, &input, None).unwrap();
        let labeled = Lattice::full(&automaton, &input, Some(&[0])).unwrap();
        assert!((free.cost() - 0.9).abs() < 1e-12);
        assert!((free.cost() - labeled.cost()).abs() < f64::EPSILON);
    }

    #[test]
    fn test_impossible_labels() {
        let mut automaton = Automaton::new(1);
        automaton
            .add_state("A", 0.0, 0.0, &["A"], &["a"], &["w"])
            .unwrap();
        automaton.add_label("b");
        let input = vec![crate::feature::FeatureVector::binary(&[0])];
        let mut stats = Statistics::new(&automaton);
        let lattice = Lattice::new(&automaton, &input, Some(&[1]), Some(&mut stats)).unwrap();
        assert_eq!(f64::INFINITY, lattice.cost());
        assert!(stats.to_flat().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_marginals_sum_to_one() {
        let automaton = test_utils::generate_test_automaton();
        let input = test_utils::generate_test_input();
        let mut stats = Statistics::new(&automaton);
        let lattice = Lattice::new(&automaton, &input, None, Some(&mut stats)).unwrap();

        let initial: f64 = (0..2).map(|s| stats.initial(s)).sum();
        let finals: f64 = (0..2).map(|s| stats.final_count(s)).sum();
        assert!((initial - 1.0).abs() < 1e-12);
        assert!((finals - 1.0).abs() < 1e-12);

        // every transition fires the default feature once per position
        let default = automaton.input_dim();
        let transitions: f64 = (0..automaton.num_weights())
            .map(|h| stats.weights(h)[default])
            .sum();
        assert!((transitions - 2.0).abs() < 1e-12);

        for t in 0..=2 {
            let total: f64 = (0..2).map(|s| lattice.state_marginal(t, s).unwrap()).sum();
            assert!((total - 1.0).abs() < 1e-12);
        }
        assert!(
            (lattice.state_marginal(2, 1).unwrap() - stats.final_count(1)).abs() < 1e-12
        );
    }

    #[test]
    fn test_output_length_mismatch() {
        let automaton = test_utils::generate_test_automaton();
        let input = test_utils::generate_test_input();
        assert!(Lattice::new(&automaton, &input, Some(&[0]), None).is_err());
    }
}
