use std::sync::{Mutex, PoisonError};
use std::thread;

use crate::automaton::{Automaton, ParamSlot};
use crate::errors::{CrfError, Result};
use crate::feature::Instance;
use crate::lattice::Lattice;
use crate::prior::Prior;
use crate::statistics::Statistics;

/// A differentiable objective over a flat parameter vector.
///
/// `value()` is minimised. `gradient()` is the gradient of `value()`. Both
/// are pure functions of the current parameters and may be requested in any
/// order.
#[cfg_attr(docsrs, doc(cfg(feature = "train")))]
pub trait Optimizable {
    /// Gets the automaton whose parameters are optimised.
    fn automaton(&self) -> &Automaton;

    /// Gets the number of parameters.
    fn num_parameters(&self) -> usize {
        self.automaton().num_parameters()
    }

    /// Gets every parameter.
    fn parameters(&self) -> Vec<f64> {
        self.automaton().parameters()
    }

    /// Gets one parameter.
    ///
    /// # Errors
    ///
    /// Fails if `index` is out of range.
    fn parameter(&self, index: usize) -> Result<f64> {
        self.automaton().parameter(index)
    }

    /// Sets every parameter.
    ///
    /// # Errors
    ///
    /// Fails if the length is wrong.
    fn set_parameters(&mut self, params: &[f64]) -> Result<()>;

    /// Sets one parameter.
    ///
    /// # Errors
    ///
    /// Fails if `index` is out of range.
    fn set_parameter(&mut self, index: usize, value: f64) -> Result<()>;

    /// Computes the value to minimise.
    ///
    /// # Errors
    ///
    /// Fails on NaN or when the set of unreachable instances changes.
    fn value(&mut self) -> Result<f64>;

    /// Computes the gradient of [`Self::value()`].
    ///
    /// # Errors
    ///
    /// See [`Self::value()`].
    fn gradient(&mut self) -> Result<Vec<f64>>;
}

/// Constraints and expectations collected by one worker.
pub(crate) struct Accumulators {
    pub constraints: Statistics,
    pub expectations: Statistics,
}

impl Accumulators {
    pub fn new(automaton: &Automaton) -> Self {
        Self {
            constraints: Statistics::new(automaton),
            expectations: Statistics::new(automaton),
        }
    }

    fn merge(&mut self, other: &Self) {
        self.constraints.merge(&other.constraints);
        self.expectations.merge(&other.expectations);
    }
}

/// Runs `f` on every instance using `n_threads` workers and returns the
/// results in instance order together with the merged accumulators.
pub(crate) fn run_instances<T, F>(
    automaton: &Automaton,
    instances: &[Instance],
    n_threads: usize,
    f: F,
) -> Result<(Vec<T>, Accumulators)>
where
    T: Send,
    F: Fn(&Instance, &mut Accumulators) -> Result<T> + Sync,
{
    let (s, r) = crossbeam_channel::unbounded();
    for item in instances.iter().enumerate() {
        s.send(item)
            .map_err(|_| CrfError::inconsistent("instance channel closed"))?;
    }
    drop(s);
    let merged = Mutex::new((Accumulators::new(automaton), Vec::with_capacity(instances.len())));
    let error = Mutex::new(None);
    thread::scope(|scope| {
        for _ in 0..n_threads {
            scope.spawn(|| {
                let mut local = Accumulators::new(automaton);
                let mut results = vec![];
                while let Ok((i, instance)) = r.recv() {
                    match f(instance, &mut local) {
                        Ok(x) => results.push((i, x)),
                        Err(e) => {
                            error
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .get_or_insert(e);
                            return;
                        }
                    }
                }
                let mut merged = merged.lock().unwrap_or_else(PoisonError::into_inner);
                merged.0.merge(&local);
                merged.1.extend(results);
            });
        }
    });
    if let Some(e) = error.into_inner().unwrap_or_else(PoisonError::into_inner) {
        return Err(e);
    }
    let (accumulators, mut results) = merged.into_inner().unwrap_or_else(PoisonError::into_inner);
    results.sort_unstable_by_key(|&(i, _)| i);
    Ok((results.into_iter().map(|(_, x)| x).collect(), accumulators))
}

/// Checks that every instance is usable with `automaton`.
pub(crate) fn validate_instances(automaton: &Automaton, instances: &[Instance]) -> Result<()> {
    for (i, instance) in instances.iter().enumerate() {
        if instance.input.len() != instance.output.len() {
            return Err(CrfError::invalid_argument(format!(
                "instance {i}: input has {} positions but output has {}",
                instance.input.len(),
                instance.output.len()
            )));
        }
        if let Some(&y) = instance
            .output
            .iter()
            .find(|&&y| y >= automaton.labels().len())
        {
            return Err(CrfError::invalid_argument(format!(
                "instance {i}: unknown label index {y}"
            )));
        }
        for (t, x) in instance.input.iter().enumerate() {
            if let Some(f) = x
                .features()
                .iter()
                .find(|f| f.feature_id >= automaton.input_dim())
            {
                return Err(CrfError::invalid_argument(format!(
                    "instance {i}, position {t}: feature {} is out of range for input dimension {}",
                    f.feature_id,
                    automaton.input_dim()
                )));
            }
        }
    }
    Ok(())
}

/// Remembers which instances have an infinite labeled cost.
///
/// The set is fixed by the first evaluation; any later change is an error.
#[derive(Default)]
pub(crate) struct InfiniteInstances {
    flags: Option<Vec<bool>>,
}

impl InfiniteInstances {
    pub fn check(&mut self, flags: Vec<bool>) -> Result<()> {
        match &self.flags {
            None => {
                let n_infinite = flags.iter().filter(|&&f| f).count();
                if n_infinite != 0 {
                    log::info!(
                        "{n_infinite} of {} instances have no label-consistent path and are excluded",
                        flags.len()
                    );
                }
                self.flags = Some(flags);
                Ok(())
            }
            Some(prev) => match prev.iter().zip(&flags).position(|(a, b)| a != b) {
                Some(i) => Err(CrfError::inconsistent(format!(
                    "instance {i} changed from {} to {} cost",
                    if prev[i] { "infinite" } else { "finite" },
                    if flags[i] { "infinite" } else { "finite" },
                ))),
                None => Ok(()),
            },
        }
    }

    pub fn is_infinite(&self, i: usize) -> bool {
        self.flags.as_ref().is_some_and(|f| f[i])
    }
}

/// Memoised value and gradient.
pub(crate) struct EvaluationCache {
    pub value: f64,
    pub gradient: Vec<f64>,
    pub cost_stale: bool,
    pub gradient_stale: bool,
}

impl EvaluationCache {
    pub fn new(n_params: usize) -> Self {
        Self {
            value: f64::NAN,
            gradient: vec![0.0; n_params],
            cost_stale: true,
            gradient_stale: true,
        }
    }

    #[inline(always)]
    pub fn invalidate(&mut self) {
        self.cost_stale = true;
        self.gradient_stale = true;
    }
}

/// Sets every parameter, invalidating `cache` only if something changed.
pub(crate) fn update_parameters(
    automaton: &mut Automaton,
    cache: &mut EvaluationCache,
    params: &[f64],
) -> Result<()> {
    if params.len() == automaton.num_parameters() && automaton.parameters() == params {
        return Ok(());
    }
    automaton.set_parameters(params)?;
    cache.invalidate();
    Ok(())
}

/// Sets one parameter, invalidating `cache` only if it changed.
pub(crate) fn update_parameter(
    automaton: &mut Automaton,
    cache: &mut EvaluationCache,
    index: usize,
    value: f64,
) -> Result<()> {
    if automaton.parameter(index)? == value {
        return Ok(());
    }
    automaton.set_parameter(index, value)?;
    cache.invalidate();
    Ok(())
}

/// Fails if a weight, an accumulator, or the value is NaN.
pub(crate) fn check_nan(
    automaton: &Automaton,
    accumulators: &Accumulators,
    value: f64,
) -> Result<()> {
    if value.is_nan() {
        return Err(CrfError::not_a_number("objective value is NaN"));
    }
    if let Some(i) = automaton.parameters().iter().position(|p| p.is_nan()) {
        return Err(CrfError::not_a_number(format!("parameter {i} is NaN")));
    }
    if accumulators.constraints.has_nan() {
        return Err(CrfError::not_a_number("constraints contain NaN"));
    }
    if accumulators.expectations.has_nan() {
        return Err(CrfError::not_a_number("expectations contain NaN"));
    }
    Ok(())
}

/// Writes `expectation - constraint + prior'(θ)` for every finite parameter
/// and 0 for infinite ones.
pub(crate) fn assemble_gradient(
    automaton: &Automaton,
    accumulators: &Accumulators,
    prior: &Prior,
    gradient: &mut Vec<f64>,
) {
    let params = automaton.parameters();
    gradient.clear();
    gradient.resize(params.len(), 0.0);
    for (i, (g, &theta)) in gradient.iter_mut().zip(&params).enumerate() {
        if !theta.is_finite() {
            continue;
        }
        let (expectation, constraint) = match automaton.locate(i) {
            Some(ParamSlot::Initial(s)) => (
                accumulators.expectations.initial(s),
                accumulators.constraints.initial(s),
            ),
            Some(ParamSlot::Final(s)) => (
                accumulators.expectations.final_count(s),
                accumulators.constraints.final_count(s),
            ),
            Some(ParamSlot::Weight(h, j)) => (
                accumulators.expectations.weights(h)[j],
                accumulators.constraints.weights(h)[j],
            ),
            None => continue,
        };
        *g = expectation - constraint + prior.gradient(theta);
    }
}

/// Conditional log-likelihood of the training labels, computed by
/// forward-backward over the whole sequence.
///
/// The value is `Σ (labeled cost - free cost)` over instances with a
/// label-consistent path, plus the prior penalty.
#[cfg_attr(docsrs, doc(cfg(feature = "train")))]
pub struct Likelihood<'a> {
    automaton: Automaton,
    instances: &'a [Instance],
    prior: Prior,
    n_threads: usize,
    accumulators: Accumulators,
    infinite: InfiniteInstances,
    cache: EvaluationCache,
}

impl<'a> Likelihood<'a> {
    /// Creates the objective and gathers the constraints of every instance.
    ///
    /// Every evaluation of the value recounts the constraints in its clamped
    /// pass. The counts only change between evaluations when an instance has
    /// several label-consistent paths, e.g. when the start state is latent.
    ///
    /// # Errors
    ///
    /// Fails if the automaton has undeclared states or an instance does not
    /// match it.
    pub fn new(automaton: Automaton, instances: &'a [Instance], prior: Prior) -> Result<Self> {
        automaton.check_resolved()?;
        validate_instances(&automaton, instances)?;
        let accumulators = Accumulators::new(&automaton);
        let cache = EvaluationCache::new(automaton.num_parameters());
        let mut objective = Self {
            automaton,
            instances,
            prior,
            n_threads: 1,
            accumulators,
            infinite: InfiniteInstances::default(),
            cache,
        };
        objective.gather_constraints()?;
        Ok(objective)
    }

    /// Sets the number of threads used per evaluation.
    ///
    /// # Errors
    ///
    /// `n_threads` must not be 0.
    pub fn with_threads(mut self, n_threads: usize) -> Result<Self> {
        if n_threads == 0 {
            return Err(CrfError::invalid_argument("n_threads must not be 0"));
        }
        self.n_threads = n_threads;
        Ok(self)
    }

    fn gather_constraints(&mut self) -> Result<()> {
        let automaton = &self.automaton;
        let (costs, accumulators) =
            run_instances(automaton, self.instances, self.n_threads, |instance, acc| {
                let lattice = Lattice::new(
                    automaton,
                    &instance.input,
                    Some(instance.output.as_slice()),
                    Some(&mut acc.constraints),
                )?;
                Ok(lattice.cost())
            })?;
        log::info!(
            "gathered constraints from {} instances ({} without a label-consistent path)",
            costs.len(),
            costs.iter().filter(|c| c.is_infinite()).count()
        );
        self.accumulators.constraints = accumulators.constraints;
        Ok(())
    }

    /// Grows every weight vector to `input_dim` features and regathers the
    /// constraints.
    ///
    /// # Errors
    ///
    /// Fails if `input_dim` is smaller than the current dimension.
    pub fn grow_weights_dimension(&mut self, input_dim: usize) -> Result<()> {
        self.automaton.grow_weights_dimension(input_dim)?;
        self.accumulators.constraints.grow(input_dim);
        self.accumulators.expectations.grow(input_dim);
        self.cache = EvaluationCache::new(self.automaton.num_parameters());
        self.gather_constraints()
    }

    fn compute_value(&mut self) -> Result<()> {
        let automaton = &self.automaton;
        let (costs, accumulators) =
            run_instances(automaton, self.instances, self.n_threads, |instance, acc| {
                // The clamped pass refreshes the constraints; with a unique
                // label-consistent path they equal the gathered ones.
                let labeled = Lattice::new(
                    automaton,
                    &instance.input,
                    Some(instance.output.as_slice()),
                    Some(&mut acc.constraints),
                )?
                .cost();
                if labeled == f64::INFINITY {
                    return Ok((labeled, f64::INFINITY));
                }
                let free = Lattice::new(
                    automaton,
                    &instance.input,
                    None,
                    Some(&mut acc.expectations),
                )?
                .cost();
                Ok((labeled, free))
            })?;
        self.infinite
            .check(costs.iter().map(|&(l, _)| l == f64::INFINITY).collect())?;

        let mut value = 0.0;
        for (i, &(labeled, free)) in costs.iter().enumerate() {
            if self.infinite.is_infinite(i) {
                continue;
            }
            if free == f64::INFINITY {
                return Err(CrfError::inconsistent(format!(
                    "instance {i} has a finite labeled cost but an infinite free cost"
                )));
            }
            value += labeled - free;
        }
        value += self.prior.total_penalty(&self.automaton.parameters());
        log::debug!("value = {value}");

        self.accumulators = accumulators;
        self.cache.value = value;
        self.cache.cost_stale = false;
        self.cache.gradient_stale = true;
        Ok(())
    }

    /// Gets the constraints of the last evaluation, or the gathered ones if
    /// the value was not evaluated yet.
    #[inline(always)]
    pub fn constraints(&self) -> &Statistics {
        &self.accumulators.constraints
    }

    /// Gets the expectations of the last evaluation.
    #[inline(always)]
    pub fn expectations(&self) -> &Statistics {
        &self.accumulators.expectations
    }

    /// Releases the statistics and returns the automaton.
    pub fn into_automaton(self) -> Automaton {
        self.automaton
    }
}

impl Optimizable for Likelihood<'_> {
    fn automaton(&self) -> &Automaton {
        &self.automaton
    }

    fn set_parameters(&mut self, params: &[f64]) -> Result<()> {
        update_parameters(&mut self.automaton, &mut self.cache, params)
    }

    fn set_parameter(&mut self, index: usize, value: f64) -> Result<()> {
        update_parameter(&mut self.automaton, &mut self.cache, index, value)
    }

    fn value(&mut self) -> Result<f64> {
        if self.cache.cost_stale {
            self.compute_value()?;
        }
        Ok(self.cache.value)
    }

    fn gradient(&mut self) -> Result<Vec<f64>> {
        if self.cache.cost_stale {
            self.compute_value()?;
        }
        if self.cache.gradient_stale {
            check_nan(&self.automaton, &self.accumulators, self.cache.value)?;
            assemble_gradient(
                &self.automaton,
                &self.accumulators,
                &self.prior,
                &mut self.cache.gradient,
            );
            self.cache.gradient_stale = false;
        }
        Ok(self.cache.gradient.clone())
    }
}
