use crate::automaton::Automaton;
use crate::feature::FeatureVector;

/// Sufficient statistics shaped like the parameters of an automaton.
///
/// One instance collects constraints (counts along label-consistent paths),
/// another collects expectations (counts under the model).
#[derive(Clone, Debug)]
pub struct Statistics {
    initial: Vec<f64>,
    finals: Vec<f64>,
    weights: Vec<Vec<f64>>,
    input_dim: usize,
}

impl Statistics {
    /// Allocates zeroed statistics for `automaton`.
    pub fn new(automaton: &Automaton) -> Self {
        Self {
            initial: vec![0.0; automaton.num_states()],
            finals: vec![0.0; automaton.num_states()],
            weights: vec![vec![0.0; automaton.input_dim() + 1]; automaton.num_weights()],
            input_dim: automaton.input_dim(),
        }
    }

    /// Adds every count of `other`.
    pub fn merge(&mut self, other: &Statistics) {
        for (x, y) in self.initial.iter_mut().zip(&other.initial) {
            *x += y;
        }
        for (x, y) in self.finals.iter_mut().zip(&other.finals) {
            *x += y;
        }
        for (w, v) in self.weights.iter_mut().zip(&other.weights) {
            for (x, y) in w.iter_mut().zip(v) {
                *x += y;
            }
        }
    }

    /// Gets the initial count of state `s`.
    #[inline(always)]
    pub fn initial(&self, s: usize) -> f64 {
        self.initial[s]
    }

    /// Gets the final count of state `s`.
    #[inline(always)]
    pub fn final_count(&self, s: usize) -> f64 {
        self.finals[s]
    }

    /// Gets the counts of the weight vector `handle`.
    #[inline(always)]
    pub fn weights(&self, handle: usize) -> &[f64] {
        &self.weights[handle]
    }

    #[inline(always)]
    pub(crate) fn increment_initial(&mut self, s: usize, amount: f64) {
        self.initial[s] += amount;
    }

    #[inline(always)]
    pub(crate) fn increment_final(&mut self, s: usize, amount: f64) {
        self.finals[s] += amount;
    }

    /// Adds `amount` times every feature of `input`, plus `amount` on the
    /// default feature, to each listed weight vector.
    #[inline(always)]
    pub(crate) fn increment_weights(&mut self, handles: &[usize], input: &FeatureVector, amount: f64) {
        for &h in handles {
            let w = &mut self.weights[h];
            for feature in input.features() {
                if feature.feature_id < self.input_dim {
                    w[feature.feature_id] += amount * feature.value;
                }
            }
            w[self.input_dim] += amount;
        }
    }

    /// Resizes for a grown input alphabet, keeping the default feature last.
    pub(crate) fn grow(&mut self, input_dim: usize) {
        for w in &mut self.weights {
            let default = w[self.input_dim];
            w[self.input_dim] = 0.0;
            w.resize(input_dim + 1, 0.0);
            w[input_dim] = default;
        }
        self.input_dim = input_dim;
    }

    /// Returns `true` if any count is NaN.
    pub fn has_nan(&self) -> bool {
        self.initial.iter().any(|x| x.is_nan())
            || self.finals.iter().any(|x| x.is_nan())
            || self.weights.iter().flatten().any(|x| x.is_nan())
    }

    /// Returns the counts in the flat parameter layout of the automaton.
    pub fn to_flat(&self) -> Vec<f64> {
        let mut flat = Vec::with_capacity(2 * self.initial.len() + self.weights.len() * (self.input_dim + 1));
        for (i, f) in self.initial.iter().zip(&self.finals) {
            flat.push(*i);
            flat.push(*f);
        }
        for w in &self.weights {
            flat.extend_from_slice(w);
        }
        flat
    }
}
