//! # fsacrf
//!
//! Conditional Random Fields over weighted finite-state automata,
//! implemented in pure Rust.
//!
//! Paths through an [`Automaton`] read one sparse [`FeatureVector`] per
//! position and emit one label per position. Each transition is scored by
//! named weight vectors shared across the automaton. Training maximises the
//! conditional likelihood of the labels, or the pseudolikelihood on the
//! [`SecondOrder`] automaton, with L-BFGS.
#![cfg_attr(
    feature = "train",
    doc = "
## Examples

```rust
use fsacrf::{Automaton, FeatureVector, Instance, NullEvaluator, Prior, Trainer};

// Feature 0 marks a noun, feature 1 marks a verb.
let noun = || FeatureVector::binary(&[0]);
let verb = || FeatureVector::binary(&[1]);

let mut automaton = Automaton::new(2);
automaton.add_fully_connected_states(&[\"N\", \"V\"]).unwrap();
let n = automaton.label_index(\"N\").unwrap();
let v = automaton.label_index(\"V\").unwrap();

let instances = vec![
    Instance::new(vec![noun(), verb()], vec![n, v]),
    Instance::new(vec![verb(), noun()], vec![v, n]),
    Instance::new(vec![noun(), noun(), verb()], vec![n, n, v]),
];

// Generates a model
let trainer = Trainer::new()
    .prior(Prior::gaussian(10.0).unwrap())
    .log_progress(false);
let trained = trainer.train(automaton, &instances, NullEvaluator).unwrap();

let path = trained
    .automaton
    .search_best_path(&[verb(), noun(), verb()])
    .unwrap();
assert_eq!(vec![v, n, v], path.labels);
```
"
)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod errors;

mod alphabet;
mod automaton;
mod feature;
mod lattice;
mod math;
mod second_order;
mod statistics;
mod transition;
mod viterbi;

#[cfg(feature = "train")]
mod objective;
#[cfg(feature = "train")]
mod prior;
#[cfg(feature = "train")]
mod pseudolikelihood;
#[cfg(feature = "train")]
mod trainer;

#[cfg(test)]
mod test_utils;

pub use alphabet::Alphabet;
pub use automaton::{Automaton, State, Transition};
pub use errors::{CrfError, Result};
pub use feature::{Feature, FeatureVector, Instance};
pub use lattice::Lattice;
pub use second_order::{SecondOrder, DEFAULT_SEPARATOR};
pub use statistics::Statistics;
pub use transition::{transition_cost, weights_cost, TransitionIterator};
pub use viterbi::Path;

#[cfg(feature = "train")]
pub use objective::{Likelihood, Optimizable};
#[cfg(feature = "train")]
pub use prior::{
    Prior, DEFAULT_GAUSSIAN_VARIANCE, DEFAULT_HYPERBOLIC_SHARPNESS, DEFAULT_HYPERBOLIC_SLOPE,
};
#[cfg(feature = "train")]
pub use pseudolikelihood::Pseudolikelihood;
#[cfg(feature = "train")]
pub use trainer::{Evaluator, NullEvaluator, Trained, Trainer};
