use bincode::{
    de::Decoder,
    enc::Encoder,
    error::{DecodeError, EncodeError},
    Decode, Encode,
};
use hashbrown::HashSet;

use crate::alphabet::Alphabet;
use crate::errors::{CrfError, Result};
use crate::feature::Instance;

/// An outgoing transition of a state.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub(crate) destination: usize,
    pub(crate) label: usize,
    pub(crate) weights: Vec<usize>,
    pub(crate) prev_label: Option<usize>,
    pub(crate) prev_weights: Vec<usize>,
}

impl Transition {
    /// Gets the index of the destination state.
    #[inline(always)]
    pub fn destination(&self) -> usize {
        self.destination
    }

    /// Gets the output label index.
    #[inline(always)]
    pub fn label(&self) -> usize {
        self.label
    }

    /// Gets the handles of the weight vectors scored by this transition.
    #[inline(always)]
    pub fn weights(&self) -> &[usize] {
        &self.weights
    }

    /// Gets the label of the edge leading into the source state (second-order
    /// automata only).
    #[inline(always)]
    pub fn prev_label(&self) -> Option<usize> {
        self.prev_label
    }

    /// Gets the weight handles of the edge leading into the source state
    /// (second-order automata only).
    #[inline(always)]
    pub fn prev_weights(&self) -> &[usize] {
        &self.prev_weights
    }
}

/// A state of the automaton.
#[derive(Clone, Debug)]
pub struct State {
    name: String,
    index: usize,
    initial_cost: f64,
    final_cost: f64,
    transitions: Vec<Transition>,
    declared: bool,
}

impl State {
    fn placeholder(name: &str, index: usize) -> Self {
        Self {
            name: name.to_string(),
            index,
            initial_cost: f64::INFINITY,
            final_cost: f64::INFINITY,
            transitions: vec![],
            declared: false,
        }
    }

    /// Gets the name.
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the index.
    #[inline(always)]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Gets the cost of starting a path here. `+∞` forbids it.
    #[inline(always)]
    pub fn initial_cost(&self) -> f64 {
        self.initial_cost
    }

    /// Gets the cost of ending a path here. `+∞` forbids it.
    #[inline(always)]
    pub fn final_cost(&self) -> f64 {
        self.final_cost
    }

    /// Gets the outgoing transitions in declaration order.
    #[inline(always)]
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Returns `true` if the state was declared without outgoing transitions.
    ///
    /// Such a state absorbs the rest of the input: each remaining position is
    /// read at cost 0 without emitting a label.
    #[inline(always)]
    pub fn is_absorbing(&self) -> bool {
        self.declared && self.transitions.is_empty()
    }
}

/// Description of a transition before names are resolved.
pub(crate) struct TransitionSpec<'a> {
    pub destination: &'a str,
    pub label: &'a str,
    pub weights: Vec<&'a str>,
    pub prev_label: Option<&'a str>,
    pub prev_weights: Vec<&'a str>,
}

/// Location of a flat parameter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ParamSlot {
    Initial(usize),
    Final(usize),
    Weight(usize, usize),
}

/// Weighted finite-state automaton whose transitions are scored by shared
/// weight vectors.
///
/// Each weight vector has `input_dim + 1` entries; the last one is the
/// default feature, which is always active with value 1.
#[derive(Clone, Debug)]
pub struct Automaton {
    states: Vec<State>,
    state_names: Alphabet,
    labels: Alphabet,
    weight_names: Alphabet,
    weights: Vec<Vec<f64>>,
    input_dim: usize,
    weights_frozen: bool,
}

impl Automaton {
    /// Creates an empty automaton for inputs with `input_dim` features.
    pub fn new(input_dim: usize) -> Self {
        Self {
            states: vec![],
            state_names: Alphabet::new(),
            labels: Alphabet::new(),
            weight_names: Alphabet::new(),
            weights: vec![],
            input_dim,
            weights_frozen: false,
        }
    }

    fn state_slot(&mut self, name: &str) -> usize {
        let idx = self.state_names.lookup_or_insert(name);
        if idx == self.states.len() {
            self.states.push(State::placeholder(name, idx));
        }
        idx
    }

    /// Adds a new state with one transition per destination.
    ///
    /// # Arguments
    ///
    /// * `name` - Name of the state.
    /// * `initial_cost` - Cost of starting a path in this state.
    /// * `final_cost` - Cost of ending a path in this state.
    /// * `destinations` - Names of the destination states.
    /// * `labels` - Output label of each transition.
    /// * `weight_names` - Name of the weight vector bound to each transition.
    ///
    /// # Errors
    ///
    /// Fails if the state already exists or the arrays differ in length.
    pub fn add_state(
        &mut self,
        name: &str,
        initial_cost: f64,
        final_cost: f64,
        destinations: &[&str],
        labels: &[&str],
        weight_names: &[&str],
    ) -> Result<usize> {
        if weight_names.len() != destinations.len() {
            return Err(CrfError::invalid_argument(format!(
                "state {name}: {} destinations but {} weight names",
                destinations.len(),
                weight_names.len()
            )));
        }
        let weight_names: Vec<[&str; 1]> = weight_names.iter().map(|&w| [w]).collect();
        let weight_names: Vec<&[&str]> = weight_names.iter().map(|w| &w[..]).collect();
        self.add_state_with_weights(
            name,
            initial_cost,
            final_cost,
            destinations,
            labels,
            &weight_names,
        )
    }

    /// Adds a new state whose transitions may each be bound to several weight
    /// vectors.
    ///
    /// # Errors
    ///
    /// Fails if the state already exists, the arrays differ in length, or a
    /// transition has no weight vector.
    pub fn add_state_with_weights(
        &mut self,
        name: &str,
        initial_cost: f64,
        final_cost: f64,
        destinations: &[&str],
        labels: &[&str],
        weight_names: &[&[&str]],
    ) -> Result<usize> {
        if destinations.len() != labels.len() || destinations.len() != weight_names.len() {
            return Err(CrfError::invalid_argument(format!(
                "state {name}: destinations, labels and weight names differ in length ({}, {}, {})",
                destinations.len(),
                labels.len(),
                weight_names.len()
            )));
        }
        let mut specs = Vec::with_capacity(destinations.len());
        for ((&destination, &label), weights) in
            destinations.iter().zip(labels).zip(weight_names)
        {
            if weights.is_empty() {
                return Err(CrfError::invalid_argument(format!(
                    "state {name}: transition to {destination} has no weights"
                )));
            }
            specs.push(TransitionSpec {
                destination,
                label,
                weights: weights.to_vec(),
                prev_label: None,
                prev_weights: vec![],
            });
        }
        self.declare_state(name, initial_cost, final_cost, specs)
    }

    pub(crate) fn declare_state(
        &mut self,
        name: &str,
        initial_cost: f64,
        final_cost: f64,
        specs: Vec<TransitionSpec>,
    ) -> Result<usize> {
        if initial_cost.is_nan() || final_cost.is_nan() {
            return Err(CrfError::invalid_argument(format!(
                "state {name}: costs must not be NaN"
            )));
        }
        if let Some(idx) = self.state_names.lookup(name) {
            if self.states[idx].declared {
                return Err(CrfError::invalid_argument(format!(
                    "state {name} already exists"
                )));
            }
        }
        // Resolve every name before touching the state table so that a failed
        // weight lookup leaves the automaton unchanged.
        let mut handles = Vec::with_capacity(specs.len());
        for spec in &specs {
            let weights = spec
                .weights
                .iter()
                .map(|w| self.weights_index(w))
                .collect::<Result<Vec<_>>>()?;
            let prev_weights = spec
                .prev_weights
                .iter()
                .map(|w| self.weights_index(w))
                .collect::<Result<Vec<_>>>()?;
            handles.push((weights, prev_weights));
        }
        let idx = self.state_slot(name);
        let mut transitions = Vec::with_capacity(specs.len());
        for (spec, (weights, prev_weights)) in specs.into_iter().zip(handles) {
            transitions.push(Transition {
                destination: self.state_slot(spec.destination),
                label: self.labels.lookup_or_insert(spec.label),
                weights,
                prev_label: spec.prev_label.map(|l| self.labels.lookup_or_insert(l)),
                prev_weights,
            });
        }
        let state = &mut self.states[idx];
        state.initial_cost = initial_cost;
        state.final_cost = final_cost;
        state.transitions = transitions;
        state.declared = true;
        Ok(idx)
    }

    /// Adds one state per label, connecting every state to every state.
    ///
    /// Transitions emit the name of their destination and are scored by the
    /// weight vector `"{source}->{destination}"`. Initial and final costs are
    /// zero.
    ///
    /// # Errors
    ///
    /// Fails if a state with one of the names exists already.
    pub fn add_fully_connected_states(&mut self, labels: &[&str]) -> Result<()> {
        for &label in labels {
            self.labels.lookup_or_insert(label);
        }
        for &source in labels {
            let weight_names: Vec<String> =
                labels.iter().map(|dst| format!("{source}->{dst}")).collect();
            let weight_names: Vec<&str> = weight_names.iter().map(String::as_str).collect();
            self.add_state(source, 0.0, 0.0, labels, labels, &weight_names)?;
        }
        Ok(())
    }

    /// Adds one state per label, connecting only the label pairs observed as
    /// neighbours in `instances`.
    ///
    /// Output indices of the instances refer to positions in `labels`.
    ///
    /// # Errors
    ///
    /// Fails if an instance refers to an unknown label or a state exists
    /// already.
    pub fn add_states_connected_as_in(
        &mut self,
        labels: &[&str],
        instances: &[Instance],
    ) -> Result<()> {
        let mut connected = HashSet::new();
        for instance in instances {
            if let Some(&y) = instance.output.iter().find(|&&y| y >= labels.len()) {
                return Err(CrfError::invalid_argument(format!(
                    "label index {y} out of range"
                )));
            }
            for pair in instance.output.windows(2) {
                connected.insert((pair[0], pair[1]));
            }
        }
        for &label in labels {
            self.labels.lookup_or_insert(label);
        }
        for (i, &source) in labels.iter().enumerate() {
            let destinations: Vec<&str> = labels
                .iter()
                .enumerate()
                .filter(|&(j, _)| connected.contains(&(i, j)))
                .map(|(_, &dst)| dst)
                .collect();
            let weight_names: Vec<String> = destinations
                .iter()
                .map(|dst| format!("{source}->{dst}"))
                .collect();
            let weight_names: Vec<&str> = weight_names.iter().map(String::as_str).collect();
            self.add_state(source, 0.0, 0.0, &destinations, &destinations, &weight_names)?;
        }
        Ok(())
    }

    /// Registers an output label and returns its index.
    #[inline(always)]
    pub fn add_label(&mut self, name: &str) -> usize {
        self.labels.lookup_or_insert(name)
    }

    /// Returns the index of an output label.
    #[inline(always)]
    pub fn label_index(&self, name: &str) -> Option<usize> {
        self.labels.lookup(name)
    }

    /// Gets the output label alphabet.
    #[inline(always)]
    pub fn labels(&self) -> &Alphabet {
        &self.labels
    }

    /// Returns the handle of the named weight vector, creating a zeroed one on
    /// first use.
    ///
    /// # Errors
    ///
    /// Fails for unknown names once the weights are frozen.
    pub fn weights_index(&mut self, name: &str) -> Result<usize> {
        if let Some(idx) = self.weight_names.lookup(name) {
            return Ok(idx);
        }
        if self.weights_frozen {
            return Err(CrfError::invalid_argument(format!(
                "unknown weight vector {name} after the weights were frozen"
            )));
        }
        let idx = self.weight_names.lookup_or_insert(name);
        self.weights.push(vec![0.0; self.input_dim + 1]);
        Ok(idx)
    }

    /// Forbids creating new weight vectors.
    #[inline(always)]
    pub fn freeze_weights(&mut self) {
        self.weights_frozen = true;
    }

    /// Returns `true` if new weight vectors can no longer be created.
    #[inline(always)]
    pub fn weights_frozen(&self) -> bool {
        self.weights_frozen
    }

    /// Resizes every weight vector for an input alphabet of `input_dim`
    /// features.
    ///
    /// Existing weights are preserved, new features start at zero, and the
    /// default feature moves to the new last index.
    ///
    /// # Errors
    ///
    /// Fails if `input_dim` is smaller than the current dimension.
    pub fn grow_weights_dimension(&mut self, input_dim: usize) -> Result<()> {
        if input_dim < self.input_dim {
            return Err(CrfError::invalid_argument(format!(
                "cannot shrink the input dimension from {} to {input_dim}",
                self.input_dim
            )));
        }
        let old_dim = self.input_dim;
        for w in &mut self.weights {
            let default = w[old_dim];
            w[old_dim] = 0.0;
            w.resize(input_dim + 1, 0.0);
            w[input_dim] = default;
        }
        self.input_dim = input_dim;
        Ok(())
    }

    /// Checks that every state referenced by a transition has been declared.
    ///
    /// # Errors
    ///
    /// Names the first undeclared state.
    pub fn check_resolved(&self) -> Result<()> {
        match self.states.iter().find(|s| !s.declared) {
            Some(s) => Err(CrfError::invalid_argument(format!(
                "state {} is a destination but was never added",
                s.name
            ))),
            None => Ok(()),
        }
    }

    /// Gets the number of states.
    #[inline(always)]
    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    /// Gets the states in index order.
    #[inline(always)]
    pub fn states(&self) -> &[State] {
        &self.states
    }

    /// Gets the state at `idx`.
    #[inline(always)]
    pub fn state(&self, idx: usize) -> &State {
        &self.states[idx]
    }

    /// Returns the index of the named state.
    #[inline(always)]
    pub fn state_index(&self, name: &str) -> Option<usize> {
        self.state_names.lookup(name)
    }

    /// Gets the number of observed features. The default feature lives at this
    /// index of every weight vector.
    #[inline(always)]
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Gets the number of weight vectors.
    #[inline(always)]
    pub fn num_weights(&self) -> usize {
        self.weights.len()
    }

    /// Gets the weight vector of `handle`.
    #[inline(always)]
    pub fn weights(&self, handle: usize) -> &[f64] {
        &self.weights[handle]
    }

    /// Gets the name of the weight vector of `handle`.
    #[inline(always)]
    pub fn weights_name(&self, handle: usize) -> Option<&str> {
        self.weight_names.name(handle)
    }

    /// Gets the weight-vector names.
    #[inline(always)]
    pub(crate) fn weight_names(&self) -> &Alphabet {
        &self.weight_names
    }

    pub(crate) fn weights_mut(&mut self, handle: usize) -> &mut Vec<f64> {
        &mut self.weights[handle]
    }

    /// Gets the number of trainable parameters: two per state followed by
    /// every weight vector.
    #[inline(always)]
    pub fn num_parameters(&self) -> usize {
        2 * self.states.len() + self.weights.len() * (self.input_dim + 1)
    }

    pub(crate) fn locate(&self, index: usize) -> Option<ParamSlot> {
        let n_state_params = 2 * self.states.len();
        if index < n_state_params {
            return Some(if index % 2 == 0 {
                ParamSlot::Initial(index / 2)
            } else {
                ParamSlot::Final(index / 2)
            });
        }
        let index = index - n_state_params;
        let width = self.input_dim + 1;
        let handle = index / width;
        (handle < self.weights.len()).then_some(ParamSlot::Weight(handle, index % width))
    }

    /// Returns the parameter at `index`.
    ///
    /// State parameters are negated costs, so that every parameter is a
    /// weight: larger values make paths more likely.
    ///
    /// # Errors
    ///
    /// Fails if `index` is out of range.
    pub fn parameter(&self, index: usize) -> Result<f64> {
        match self.locate(index) {
            Some(ParamSlot::Initial(s)) => Ok(-self.states[s].initial_cost),
            Some(ParamSlot::Final(s)) => Ok(-self.states[s].final_cost),
            Some(ParamSlot::Weight(h, j)) => Ok(self.weights[h][j]),
            None => Err(CrfError::invalid_argument(format!(
                "parameter index {index} out of range"
            ))),
        }
    }

    /// Sets the parameter at `index`.
    ///
    /// # Errors
    ///
    /// Fails if `index` is out of range.
    pub fn set_parameter(&mut self, index: usize, value: f64) -> Result<()> {
        match self.locate(index) {
            Some(ParamSlot::Initial(s)) => self.states[s].initial_cost = -value,
            Some(ParamSlot::Final(s)) => self.states[s].final_cost = -value,
            Some(ParamSlot::Weight(h, j)) => self.weights[h][j] = value,
            None => {
                return Err(CrfError::invalid_argument(format!(
                    "parameter index {index} out of range"
                )))
            }
        }
        Ok(())
    }

    /// Returns every parameter in flat layout.
    pub fn parameters(&self) -> Vec<f64> {
        let mut params = Vec::with_capacity(self.num_parameters());
        for state in &self.states {
            params.push(-state.initial_cost);
            params.push(-state.final_cost);
        }
        for w in &self.weights {
            params.extend_from_slice(w);
        }
        params
    }

    /// Sets every parameter from a flat vector.
    ///
    /// # Errors
    ///
    /// Fails if the length differs from [`Self::num_parameters()`].
    pub fn set_parameters(&mut self, params: &[f64]) -> Result<()> {
        if params.len() != self.num_parameters() {
            return Err(CrfError::invalid_argument(format!(
                "expected {} parameters, got {}",
                self.num_parameters(),
                params.len()
            )));
        }
        let (state_params, weight_params) = params.split_at(2 * self.states.len());
        for (state, p) in self.states.iter_mut().zip(state_params.chunks_exact(2)) {
            state.initial_cost = -p[0];
            state.final_cost = -p[1];
        }
        for (w, p) in self
            .weights
            .iter_mut()
            .zip(weight_params.chunks_exact(self.input_dim + 1))
        {
            w.copy_from_slice(p);
        }
        Ok(())
    }

    /// Copies every weight vector whose name also exists in `other`.
    ///
    /// # Errors
    ///
    /// Fails if the input dimensions differ.
    pub fn copy_weights_from(&mut self, other: &Automaton) -> Result<()> {
        if other.input_dim != self.input_dim {
            return Err(CrfError::invalid_argument(format!(
                "input dimensions differ ({} and {})",
                self.input_dim, other.input_dim
            )));
        }
        for (handle, name) in other.weight_names.iter().enumerate() {
            if let Some(idx) = self.weight_names.lookup(name) {
                self.weights[idx].copy_from_slice(&other.weights[handle]);
            }
        }
        Ok(())
    }
}

#[derive(Decode, Encode)]
struct RawTransition {
    destination: usize,
    label: usize,
    weights: Vec<usize>,
    prev_label: Option<usize>,
    prev_weights: Vec<usize>,
}

#[derive(Decode, Encode)]
struct RawState {
    name: String,
    initial_cost: f64,
    final_cost: f64,
    transitions: Vec<RawTransition>,
    declared: bool,
}

#[derive(Decode, Encode)]
struct RawAutomaton {
    states: Vec<RawState>,
    labels: Vec<String>,
    weight_names: Vec<String>,
    weights: Vec<Vec<f64>>,
    input_dim: usize,
    weights_frozen: bool,
}

impl RawAutomaton {
    fn validate(&self) -> Result<(), &'static str> {
        if self.weight_names.len() != self.weights.len() {
            return Err("weight names and weight vectors differ in number");
        }
        if self.weights.iter().any(|w| w.len() != self.input_dim + 1) {
            return Err("weight vector length does not match the input dimension");
        }
        for state in &self.states {
            for t in &state.transitions {
                if t.destination >= self.states.len() {
                    return Err("transition destination out of range");
                }
                if t.label >= self.labels.len() || t.prev_label.is_some_and(|l| l >= self.labels.len())
                {
                    return Err("transition label out of range");
                }
                if t
                    .weights
                    .iter()
                    .chain(&t.prev_weights)
                    .any(|&h| h >= self.weights.len())
                {
                    return Err("weight handle out of range");
                }
            }
        }
        Ok(())
    }
}

impl<Context> Decode<Context> for Automaton {
    fn decode<D: Decoder<Context = Context>>(decoder: &mut D) -> Result<Self, DecodeError> {
        let raw: RawAutomaton = Decode::decode(decoder)?;
        raw.validate()
            .map_err(|msg| DecodeError::OtherString(msg.to_string()))?;
        let state_names = Alphabet::from_names(raw.states.iter().map(|s| &s.name));
        if state_names.len() != raw.states.len() {
            return Err(DecodeError::OtherString("duplicate state name".to_string()));
        }
        let labels = Alphabet::from_names(&raw.labels);
        if labels.len() != raw.labels.len() {
            return Err(DecodeError::OtherString("duplicate label".to_string()));
        }
        let weight_names = Alphabet::from_names(&raw.weight_names);
        if weight_names.len() != raw.weight_names.len() {
            return Err(DecodeError::OtherString("duplicate weight name".to_string()));
        }
        let states = raw
            .states
            .into_iter()
            .enumerate()
            .map(|(index, s)| State {
                name: s.name,
                index,
                initial_cost: s.initial_cost,
                final_cost: s.final_cost,
                transitions: s
                    .transitions
                    .into_iter()
                    .map(|t| Transition {
                        destination: t.destination,
                        label: t.label,
                        weights: t.weights,
                        prev_label: t.prev_label,
                        prev_weights: t.prev_weights,
                    })
                    .collect(),
                declared: s.declared,
            })
            .collect();
        Ok(Self {
            states,
            state_names,
            labels,
            weight_names,
            weights: raw.weights,
            input_dim: raw.input_dim,
            weights_frozen: raw.weights_frozen,
        })
    }
}

impl Encode for Automaton {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        let raw = RawAutomaton {
            states: self
                .states
                .iter()
                .map(|s| RawState {
                    name: s.name.clone(),
                    initial_cost: s.initial_cost,
                    final_cost: s.final_cost,
                    transitions: s
                        .transitions
                        .iter()
                        .map(|t| RawTransition {
                            destination: t.destination,
                            label: t.label,
                            weights: t.weights.clone(),
                            prev_label: t.prev_label,
                            prev_weights: t.prev_weights.clone(),
                        })
                        .collect(),
                    declared: s.declared,
                })
                .collect(),
            labels: self.labels.iter().map(str::to_string).collect(),
            weight_names: self.weight_names.iter().map(str::to_string).collect(),
            weights: self.weights.clone(),
            input_dim: self.input_dim,
            weights_frozen: self.weights_frozen,
        };
        Encode::encode(&raw, encoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::feature::FeatureVector;

    fn two_state_automaton() -> Automaton {
        let mut automaton = Automaton::new(3);
        automaton
            .add_state("A", 0.0, 0.0, &["A", "B"], &["A", "B"], &["AA", "AB"])
            .unwrap();
        automaton
            .add_state("B", 0.5, -0.5, &["A", "B"], &["A", "B"], &["BA", "AB"])
            .unwrap();
        automaton
    }

    #[test]
    fn test_add_state() {
        let automaton = two_state_automaton();
        assert_eq!(2, automaton.num_states());
        assert_eq!(3, automaton.num_weights());
        assert_eq!(Some(1), automaton.state_index("B"));
        let b = automaton.state(1);
        assert_eq!("B", b.name());
        assert_eq!(1, b.index());
        assert_eq!(0, b.transitions()[0].destination());
        assert_eq!(&[1], b.transitions()[1].weights());
        assert_eq!(Some(1), automaton.label_index("B"));
        assert!(automaton.check_resolved().is_ok());
    }

    #[test]
    fn test_add_state_errors() {
        let mut automaton = two_state_automaton();
        assert!(automaton
            .add_state("A", 0.0, 0.0, &[], &[], &[])
            .is_err());
        assert!(automaton
            .add_state("C", 0.0, 0.0, &["A"], &["A", "B"], &["CA"])
            .is_err());
        assert!(automaton
            .add_state("C", 0.0, 0.0, &["A", "B"], &["A", "B"], &["CA"])
            .is_err());
        assert!(automaton
            .add_state_with_weights("C", 0.0, 0.0, &["A"], &["A"], &[&[]])
            .is_err());
        assert_eq!(2, automaton.num_states());
    }

    #[test]
    fn test_forward_reference() {
        let mut automaton = Automaton::new(1);
        automaton
            .add_state("start", 0.0, f64::INFINITY, &["end"], &["x"], &["w"])
            .unwrap();
        assert!(automaton.check_resolved().is_err());
        automaton
            .add_state("end", f64::INFINITY, 0.0, &[], &[], &[])
            .unwrap();
        assert!(automaton.check_resolved().is_ok());
        assert_eq!(1, automaton.state(0).transitions()[0].destination());
    }

    #[test]
    fn test_frozen_weights() {
        let mut automaton = two_state_automaton();
        automaton.freeze_weights();
        assert_eq!(1, automaton.weights_index("AB").unwrap());
        assert!(automaton.weights_index("unknown").is_err());
        assert!(automaton
            .add_state("C", 0.0, 0.0, &["A"], &["A"], &["CA"])
            .is_err());
        assert_eq!(None, automaton.state_index("C"));
    }

    #[test]
    fn test_parameter_layout() {
        let mut automaton = two_state_automaton();
        assert_eq!(4 + 3 * 4, automaton.num_parameters());
        assert_eq!(-0.5, automaton.parameter(2).unwrap());
        assert_eq!(0.5, automaton.parameter(3).unwrap());
        automaton.set_parameter(4 + 4 + 3, 2.5).unwrap();
        assert_eq!(2.5, automaton.weights(1)[3]);
        assert!(automaton.parameter(16).is_err());
        assert!(automaton.set_parameter(16, 1.0).is_err());

        let mut params = automaton.parameters();
        for (i, p) in params.iter_mut().enumerate() {
            *p = i as f64 * 0.25 - 1.0;
        }
        automaton.set_parameters(&params).unwrap();
        for (i, &p) in params.iter().enumerate() {
            let value = automaton.parameter(i).unwrap();
            assert_eq!(p, value);
            automaton.set_parameter(i, value).unwrap();
            assert_eq!(p, automaton.parameter(i).unwrap());
        }
        assert_eq!(params, automaton.parameters());
        assert!(automaton.set_parameters(&params[1..]).is_err());
    }

    #[test]
    fn test_grow_weights_dimension() {
        let mut automaton = two_state_automaton();
        let handle = automaton.weights_index("AA").unwrap();
        automaton.weights_mut(handle).copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        automaton.grow_weights_dimension(5).unwrap();
        assert_eq!(5, automaton.input_dim());
        assert_eq!(&[1.0, 2.0, 3.0, 0.0, 0.0, 4.0], automaton.weights(handle));
        assert!(automaton.grow_weights_dimension(4).is_err());
        automaton.grow_weights_dimension(5).unwrap();
        assert_eq!(&[1.0, 2.0, 3.0, 0.0, 0.0, 4.0], automaton.weights(handle));
    }

    #[test]
    fn test_fully_connected() {
        let mut automaton = Automaton::new(2);
        automaton.add_fully_connected_states(&["A", "B", "C"]).unwrap();
        assert_eq!(3, automaton.num_states());
        assert_eq!(9, automaton.num_weights());
        let b = automaton.state(1);
        assert_eq!(3, b.transitions().len());
        assert_eq!(2, b.transitions()[2].destination());
        assert_eq!(2, b.transitions()[2].label());
        assert_eq!(Some("B->C"), automaton.weights_name(b.transitions()[2].weights()[0]));
    }

    #[test]
    fn test_connected_as_in() {
        let instances = vec![
            Instance::new(vec![FeatureVector::default(); 3], vec![0, 1, 1]),
            Instance::new(vec![FeatureVector::default(); 2], vec![2, 0]),
        ];
        let mut automaton = Automaton::new(2);
        automaton
            .add_states_connected_as_in(&["A", "B", "C"], &instances)
            .unwrap();
        let dests = |s: usize| -> Vec<usize> {
            automaton
                .state(s)
                .transitions()
                .iter()
                .map(|t| t.destination())
                .collect()
        };
        assert_eq!(vec![1], dests(0));
        assert_eq!(vec![1], dests(1));
        assert_eq!(vec![0], dests(2));

        let bad = vec![Instance::new(vec![FeatureVector::default()], vec![3])];
        assert!(Automaton::new(2)
            .add_states_connected_as_in(&["A", "B", "C"], &bad)
            .is_err());
    }

    #[test]
    fn test_copy_weights_from() {
        let mut source = two_state_automaton();
        let handle = source.weights_index("BA").unwrap();
        source.weights_mut(handle)[0] = 7.0;
        let mut target = Automaton::new(3);
        target
            .add_state("X", 0.0, 0.0, &["X"], &["X"], &["BA"])
            .unwrap();
        target.copy_weights_from(&source).unwrap();
        assert_eq!(7.0, target.weights(0)[0]);
        assert!(target.copy_weights_from(&Automaton::new(1)).is_err());
    }

    #[test]
    fn test_bincode() {
        let mut automaton = two_state_automaton();
        let params: Vec<f64> = (0..automaton.num_parameters())
            .map(|i| (i as f64).sin())
            .collect();
        automaton.set_parameters(&params).unwrap();
        automaton.freeze_weights();

        let config = bincode::config::standard();
        let bytes = bincode::encode_to_vec(&automaton, config).unwrap();
        let (decoded, _): (Automaton, usize) = bincode::decode_from_slice(&bytes, config).unwrap();

        assert_eq!(automaton.parameters(), decoded.parameters());
        assert_eq!(automaton.input_dim(), decoded.input_dim());
        assert!(decoded.weights_frozen());
        assert_eq!(Some(1), decoded.state_index("B"));
        assert_eq!(Some("BA"), decoded.weights_name(2));
        for (a, b) in automaton.states().iter().zip(decoded.states()) {
            assert_eq!(a.name(), b.name());
            assert_eq!(a.transitions(), b.transitions());
        }
    }

    #[test]
    fn test_bincode_duplicate_names() {
        let raw = |labels: &[&str], weight_names: &[&str]| RawAutomaton {
            states: vec![RawState {
                name: "A".to_string(),
                initial_cost: 0.0,
                final_cost: 0.0,
                transitions: vec![RawTransition {
                    destination: 0,
                    label: 1,
                    weights: vec![1],
                    prev_label: None,
                    prev_weights: vec![],
                }],
                declared: true,
            }],
            labels: labels.iter().map(|l| l.to_string()).collect(),
            weight_names: weight_names.iter().map(|w| w.to_string()).collect(),
            weights: vec![vec![0.0; 2]; weight_names.len()],
            input_dim: 1,
            weights_frozen: false,
        };
        let config = bincode::config::standard();
        let decode = |raw: RawAutomaton| {
            let bytes = bincode::encode_to_vec(&raw, config).unwrap();
            bincode::decode_from_slice::<Automaton, _>(&bytes, config).map(|(a, _)| a)
        };

        let automaton = decode(raw(&["a", "b"], &["v", "w"])).unwrap();
        assert_eq!(Some(1), automaton.label_index("b"));
        assert!(decode(raw(&["a", "a"], &["v", "w"])).is_err());
        assert!(decode(raw(&["a", "b"], &["w", "w"])).is_err());
    }

    #[test]
    fn test_is_absorbing() {
        let mut automaton = Automaton::new(1);
        automaton
            .add_state("A", 0.0, 0.0, &["B", "C"], &["b", "c"], &["AB", "AC"])
            .unwrap();
        automaton.add_state("B", 0.0, 0.0, &[], &[], &[]).unwrap();
        assert!(!automaton.state(0).is_absorbing());
        assert!(automaton.state(1).is_absorbing());
        // C is only a forward reference
        assert!(!automaton.state(2).is_absorbing());
    }
}
