use crate::automaton::Automaton;
use crate::feature::FeatureVector;
use crate::transition::TransitionIterator;

/// Lowest-cost path through the automaton.
#[derive(Clone, Debug, PartialEq)]
pub struct Path {
    /// Visited states, one more than the number of positions.
    pub states: Vec<usize>,

    /// Emitted labels. Positions read by an absorbing state emit none.
    pub labels: Vec<usize>,

    /// Cost of the path.
    pub cost: f64,
}

impl Automaton {
    /// Searches the lowest-cost path for the given input.
    ///
    /// Returns `None` if no path accepts the input.
    pub fn search_best_path(&self, input: &[FeatureVector]) -> Option<Path> {
        let n_states = self.num_states();
        let mut best_costs = vec![vec![f64::INFINITY; n_states]; input.len() + 1];
        // (previous state, label)
        let mut back = vec![vec![(usize::MAX, None); n_states]; input.len()];
        for (c, state) in best_costs[0].iter_mut().zip(self.states()) {
            *c = state.initial_cost();
        }
        for (t, x) in input.iter().enumerate() {
            for (s, state) in self.states().iter().enumerate() {
                let prev = best_costs[t][s];
                if prev == f64::INFINITY {
                    continue;
                }
                if state.is_absorbing() {
                    if prev < best_costs[t + 1][s] {
                        best_costs[t + 1][s] = prev;
                        back[t][s] = (s, None);
                    }
                    continue;
                }
                for (_, transition, cost) in TransitionIterator::new(self, state, x, None) {
                    let d = transition.destination();
                    let score = prev + cost;
                    if score < best_costs[t + 1][d] {
                        best_costs[t + 1][d] = score;
                        back[t][d] = (s, Some(transition.label()));
                    }
                }
            }
        }
        let mut best_cost = f64::INFINITY;
        let mut idx = usize::MAX;
        for (s, state) in self.states().iter().enumerate() {
            let score = best_costs[input.len()][s] + state.final_cost();
            if score < best_cost {
                best_cost = score;
                idx = s;
            }
        }
        if idx == usize::MAX {
            return None;
        }
        let mut states = vec![idx];
        let mut labels = vec![];
        for t in (0..input.len()).rev() {
            let (prev, label) = back[t][idx];
            labels.extend(label);
            states.push(prev);
            idx = prev;
        }
        states.reverse();
        labels.reverse();
        Some(Path {
            states,
            labels,
            cost: best_cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils;

    #[test]
    fn test_search_best_path() {
        let automaton = test_utils::generate_test_automaton();
        let input = test_utils::generate_test_input();
        let path = automaton.search_best_path(&input).unwrap();

        let mut best = (f64::INFINITY, vec![]);
        for s in 0..2 {
            for y0 in 0..2 {
                for y1 in 0..2 {
                    let cost = test_utils::path_cost(&automaton, &input, &[s, y0, y1]);
                    if cost < best.0 {
                        best = (cost, vec![s, y0, y1]);
                    }
                }
            }
        }
        assert!((best.0 - path.cost).abs() < 1e-12);
        assert_eq!(best.1, path.states);
        assert_eq!(best.1[1..], path.labels[..]);
    }

    #[test]
    fn test_absorbing_state() {
        let mut automaton = crate::Automaton::new(1);
        automaton
            .add_state("S", 0.0, f64::INFINITY, &["E", "S"], &["e", "s"], &["e", "s"])
            .unwrap();
        automaton.add_state("E", f64::INFINITY, 0.0, &[], &[], &[]).unwrap();
        let e = automaton.weights_index("e").unwrap();
        let s = automaton.weights_index("s").unwrap();
        automaton.weights_mut(e)[1] = 1.0;
        automaton.weights_mut(s)[1] = -0.5;
        let input = vec![crate::FeatureVector::binary(&[0]); 2];
        let path = automaton.search_best_path(&input).unwrap();
        assert_eq!(vec![0, 1, 1], path.states);
        assert_eq!(vec![0], path.labels);
        assert!((path.cost + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_no_path() {
        let mut automaton = crate::Automaton::new(1);
        automaton
            .add_state("A", 0.0, f64::INFINITY, &["A"], &["a"], &["w"])
            .unwrap();
        assert_eq!(None, automaton.search_best_path(&test_utils::generate_test_input()));
    }
}
