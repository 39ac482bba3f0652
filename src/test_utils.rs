use crate::automaton::Automaton;
use crate::feature::{Feature, FeatureVector, Instance};
use crate::transition::transition_cost;

macro_rules! logsumexp {
    ( $($x:expr,)* ) => {
        {
            let mut y = f64::NEG_INFINITY;
            $(
                y = $crate::math::logsumexp(y, $x);
            )*
            y
        }
    };
    ( $($x:expr),* ) => {
        logsumexp!($( $x, )*)
    };
}

/// Cost of the sum of the probabilities given as costs.
pub fn neg_logsumexp(costs: &[f64]) -> f64 {
    -costs.iter().fold(f64::NEG_INFINITY, |acc, &c| logsumexp!(acc, -c))
}

// Fully connected over labels A (0) and B (1), 3 input features.
//
// weights: [f0, f1, f2, default]
// A->A: [0.5, -0.2, 0.1, 0.3]
// A->B: [-0.4, 0.6, 0.0, -0.1]
// B->A: [0.2, 0.1, -0.3, 0.0]
// B->B: [0.0, -0.5, 0.7, 0.2]
// initial: A 0.2, B -0.1
// final: A 0.3, B 0.0
pub fn generate_test_automaton() -> Automaton {
    let mut automaton = Automaton::new(3);
    automaton.add_fully_connected_states(&["A", "B"]).unwrap();
    let weights = [
        ("A->A", [0.5, -0.2, 0.1, 0.3]),
        ("A->B", [-0.4, 0.6, 0.0, -0.1]),
        ("B->A", [0.2, 0.1, -0.3, 0.0]),
        ("B->B", [0.0, -0.5, 0.7, 0.2]),
    ];
    for (name, w) in weights {
        let handle = automaton.weights_index(name).unwrap();
        automaton.weights_mut(handle).copy_from_slice(&w);
    }
    automaton.set_parameter(0, -0.2).unwrap();
    automaton.set_parameter(1, -0.3).unwrap();
    automaton.set_parameter(2, 0.1).unwrap();
    automaton.set_parameter(3, 0.0).unwrap();
    automaton
}

pub fn generate_test_input() -> Vec<FeatureVector> {
    vec![
        FeatureVector::new(vec![Feature::new(0, 1.0), Feature::new(2, 0.5)]),
        FeatureVector::new(vec![Feature::new(1, 2.0)]),
    ]
}

/// Cost of the path visiting `states`, reading one input position per step.
///
/// Assumes at most one transition between any two states.
pub fn path_cost(automaton: &Automaton, input: &[FeatureVector], states: &[usize]) -> f64 {
    let mut cost = automaton.state(states[0]).initial_cost();
    for (x, pair) in input.iter().zip(states.windows(2)) {
        let transition = automaton
            .state(pair[0])
            .transitions()
            .iter()
            .find(|t| t.destination() == pair[1])
            .unwrap();
        cost += transition_cost(automaton, transition, x);
    }
    cost + automaton.state(*states.last().unwrap()).final_cost()
}

// Two labels with disjoint features: feature 0 fires for A, feature 1 for B.
pub fn generate_separable_instances() -> Vec<Instance> {
    let a = || FeatureVector::binary(&[0]);
    let b = || FeatureVector::binary(&[1]);
    vec![
        Instance::new(vec![a(), b()], vec![0, 1]),
        Instance::new(vec![b(), a()], vec![1, 0]),
        Instance::new(vec![a(), a()], vec![0, 0]),
    ]
}

/// Checks an analytic gradient against central finite differences.
#[cfg(feature = "train")]
pub fn check_gradient<O: crate::objective::Optimizable>(objective: &mut O, tolerance: f64) {
    let gradient = objective.gradient().unwrap();
    let params = objective.parameters();
    let h = 1e-5;
    for i in 0..params.len() {
        if !params[i].is_finite() {
            assert_eq!(0.0, gradient[i]);
            continue;
        }
        objective.set_parameter(i, params[i] + h).unwrap();
        let plus = objective.value().unwrap();
        objective.set_parameter(i, params[i] - h).unwrap();
        let minus = objective.value().unwrap();
        objective.set_parameter(i, params[i]).unwrap();
        let numeric = (plus - minus) / (2.0 * h);
        assert!(
            (numeric - gradient[i]).abs() < tolerance,
            "parameter {i}: numeric {numeric}, analytic {}",
            gradient[i]
        );
    }
}
