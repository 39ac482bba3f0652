use core::cell::RefCell;
use core::fmt;

use std::error::Error as StdError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use argmin::core::observers::{Observe, ObserverMode};
use argmin::core::{
    CostFunction, Error, Executor, Gradient, IterState, State, TerminationReason, KV,
};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use argmin_observer_slog::SlogLogger;

use crate::automaton::Automaton;
use crate::errors::{CrfError, Result};
use crate::feature::Instance;
use crate::objective::{Likelihood, Optimizable};
use crate::prior::Prior;
use crate::pseudolikelihood::Pseudolikelihood;
use crate::second_order::SecondOrder;

type LbfgsState = IterState<Vec<f64>, Vec<f64>, (), (), (), f64>;

/// Callback invoked while training.
#[cfg_attr(docsrs, doc(cfg(feature = "train")))]
pub trait Evaluator {
    /// Called after every iteration with an automaton carrying the current
    /// iterate, and once more when training ends. `converged` is only
    /// meaningful in the last call.
    ///
    /// Returning `false` stops training.
    fn evaluate(&mut self, automaton: &Automaton, iteration: u64, converged: bool, value: f64)
        -> bool;
}

impl<F> Evaluator for F
where
    F: FnMut(&Automaton, u64, bool, f64) -> bool,
{
    fn evaluate(
        &mut self,
        automaton: &Automaton,
        iteration: u64,
        converged: bool,
        value: f64,
    ) -> bool {
        self(automaton, iteration, converged, value)
    }
}

/// Evaluator that never stops training.
#[cfg_attr(docsrs, doc(cfg(feature = "train")))]
#[derive(Clone, Copy, Debug, Default)]
pub struct NullEvaluator;

impl Evaluator for NullEvaluator {
    fn evaluate(&mut self, _: &Automaton, _: u64, _: bool, _: f64) -> bool {
        true
    }
}

/// Result of training.
#[cfg_attr(docsrs, doc(cfg(feature = "train")))]
#[derive(Clone, Debug)]
pub struct Trained<A = Automaton> {
    /// Trained automaton.
    pub automaton: A,

    /// `false` if training ran out of iterations or was stopped by the
    /// evaluator.
    pub converged: bool,

    /// Number of completed iterations.
    pub iterations: u64,

    /// Objective value at the returned parameters.
    pub value: f64,
}

// Returned by the observer to abort the executor.
#[derive(Debug)]
struct EarlyStop;

impl fmt::Display for EarlyStop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "stopped by the evaluator")
    }
}

impl StdError for EarlyStop {}

/// Maps the finite parameters of an objective to the optimizer's vector.
///
/// Infinite parameters forbid structure and stay fixed.
#[derive(Clone)]
struct ParamLayout {
    template: Vec<f64>,
    free: Vec<usize>,
}

impl ParamLayout {
    fn new(params: Vec<f64>) -> Self {
        let free = (0..params.len()).filter(|&i| params[i].is_finite()).collect();
        Self {
            template: params,
            free,
        }
    }

    fn compress(&self, params: &[f64]) -> Vec<f64> {
        self.free.iter().map(|&i| params[i]).collect()
    }

    fn expand(&self, param: &[f64]) -> Vec<f64> {
        let mut params = self.template.clone();
        for (&i, &p) in self.free.iter().zip(param) {
            params[i] = p;
        }
        params
    }
}

struct ObjectiveFunction<'a, O> {
    objective: RefCell<&'a mut O>,
    layout: &'a ParamLayout,
    failure: &'a RefCell<Option<CrfError>>,
}

impl<O> ObjectiveFunction<'_, O> {
    // L-BFGS turns line search errors into a termination reason, so the
    // first objective error is kept aside to be raised after the run.
    fn record<T>(&self, result: Result<T>) -> Result<T, Error> {
        result.map_err(|e| {
            let msg = e.to_string();
            self.failure.borrow_mut().get_or_insert(e);
            Error::msg(msg)
        })
    }
}

impl<O> CostFunction for ObjectiveFunction<'_, O>
where
    O: Optimizable,
{
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, Error> {
        let mut objective = self.objective.borrow_mut();
        let value = objective
            .set_parameters(&self.layout.expand(param))
            .and_then(|()| objective.value());
        self.record(value)
    }
}

impl<O> Gradient for ObjectiveFunction<'_, O>
where
    O: Optimizable,
{
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Self::Param) -> Result<Self::Gradient, Error> {
        let mut objective = self.objective.borrow_mut();
        let gradient = objective
            .set_parameters(&self.layout.expand(param))
            .and_then(|()| objective.gradient());
        self.record(gradient.map(|g| self.layout.compress(&g)))
    }
}

struct Progress {
    evaluator: Box<dyn Evaluator + Send>,
    snapshot: Automaton,
    layout: ParamLayout,
    last: Option<Vec<f64>>,
    iterations: u64,
    stopped: bool,
}

#[derive(Clone)]
struct ProgressObserver(Arc<Mutex<Progress>>);

impl Observe<LbfgsState> for ProgressObserver {
    fn observe_iter(&mut self, state: &LbfgsState, _kv: &KV) -> Result<(), Error> {
        let mut progress = lock_progress(&self.0);
        let progress = &mut *progress;
        progress.iterations += 1;
        let Some(param) = state.get_param() else {
            return Ok(());
        };
        progress.last = Some(param.clone());
        progress
            .snapshot
            .set_parameters(&progress.layout.expand(param))?;
        if !progress.evaluator.evaluate(
            &progress.snapshot,
            progress.iterations,
            false,
            state.get_cost(),
        ) {
            progress.stopped = true;
            return Err(Error::new(EarlyStop));
        }
        Ok(())
    }
}

fn lock_progress(progress: &Mutex<Progress>) -> MutexGuard<'_, Progress> {
    progress.lock().unwrap_or_else(PoisonError::into_inner)
}

fn optimizer_error(e: Error) -> CrfError {
    CrfError::optimizer(e.to_string())
}

/// Trainer driving L-BFGS over a CRF objective.
#[cfg_attr(docsrs, doc(cfg(feature = "train")))]
pub struct Trainer {
    max_iter: u64,
    n_threads: usize,
    prior: Prior,
    tolerance: f64,
    memory: usize,
    log_progress: bool,
}

impl Default for Trainer {
    fn default() -> Self {
        Self::new()
    }
}

impl Trainer {
    /// Creates a new trainer.
    pub fn new() -> Self {
        Self {
            max_iter: 100,
            n_threads: 1,
            prior: Prior::default(),
            tolerance: 1e-6,
            memory: 7,
            log_progress: true,
        }
    }

    /// Sets the maximum number of iterations.
    ///
    /// # Errors
    ///
    /// `max_iter` must not be 0.
    pub fn max_iter(mut self, max_iter: u64) -> Result<Self> {
        if max_iter == 0 {
            return Err(CrfError::invalid_argument("max_iter must not be 0"));
        }
        self.max_iter = max_iter;
        Ok(self)
    }

    /// Sets the number of threads.
    ///
    /// # Errors
    ///
    /// `n_threads` must not be 0.
    pub fn n_threads(mut self, n_threads: usize) -> Result<Self> {
        if n_threads == 0 {
            return Err(CrfError::invalid_argument("n_threads must not be 0"));
        }
        self.n_threads = n_threads;
        Ok(self)
    }

    /// Sets the prior.
    pub fn prior(mut self, prior: Prior) -> Self {
        self.prior = prior;
        self
    }

    /// Sets the cost tolerance at which the optimizer is considered
    /// converged.
    ///
    /// # Errors
    ///
    /// `tolerance` must be non-negative.
    pub fn tolerance(mut self, tolerance: f64) -> Result<Self> {
        if !(tolerance >= 0.0) {
            return Err(CrfError::invalid_argument(
                "tolerance must be greater than or equal to 0.0",
            ));
        }
        self.tolerance = tolerance;
        Ok(self)
    }

    /// Sets the number of correction pairs kept by L-BFGS.
    ///
    /// # Errors
    ///
    /// `memory` must not be 0.
    pub fn memory(mut self, memory: usize) -> Result<Self> {
        if memory == 0 {
            return Err(CrfError::invalid_argument("memory must not be 0"));
        }
        self.memory = memory;
        Ok(self)
    }

    /// Enables or disables the per-iteration progress log.
    pub fn log_progress(mut self, log_progress: bool) -> Self {
        self.log_progress = log_progress;
        self
    }

    /// Trains `automaton` by maximising the conditional likelihood of the
    /// labels of `instances`.
    ///
    /// # Errors
    ///
    /// Fails if the objective cannot be built or becomes inconsistent, or if
    /// the optimizer fails without producing any iterate.
    pub fn train<E>(
        &self,
        automaton: Automaton,
        instances: &[Instance],
        evaluator: E,
    ) -> Result<Trained>
    where
        E: Evaluator + Send + 'static,
    {
        let mut objective =
            Likelihood::new(automaton, instances, self.prior)?.with_threads(self.n_threads)?;
        let (converged, iterations, value) = self.optimize(&mut objective, Box::new(evaluator))?;
        Ok(Trained {
            automaton: objective.into_automaton(),
            converged,
            iterations,
            value,
        })
    }

    /// Trains a second-order automaton by maximising the pseudolikelihood of
    /// the labels of `instances`.
    ///
    /// Use [`SecondOrder::copy_weights_into()`] to transfer the result to the
    /// first-order automaton.
    ///
    /// # Errors
    ///
    /// See [`Trainer::train()`].
    pub fn train_pseudolikelihood<E>(
        &self,
        second_order: SecondOrder,
        instances: &[Instance],
        evaluator: E,
    ) -> Result<Trained<SecondOrder>>
    where
        E: Evaluator + Send + 'static,
    {
        let mut objective = Pseudolikelihood::new(second_order, instances, self.prior)?
            .with_threads(self.n_threads)?;
        let (converged, iterations, value) = self.optimize(&mut objective, Box::new(evaluator))?;
        Ok(Trained {
            automaton: objective.into_second_order(),
            converged,
            iterations,
            value,
        })
    }

    // Runs one L-BFGS session of at most `max_iters` iterations.
    fn run_lbfgs<O: Optimizable>(
        &self,
        objective: &mut O,
        layout: &ParamLayout,
        init: Vec<f64>,
        max_iters: u64,
        progress: &Arc<Mutex<Progress>>,
    ) -> Result<Session> {
        let linesearch = MoreThuenteLineSearch::new()
            .with_c(1e-4, 0.9)
            .map_err(optimizer_error)?;
        let solver = LBFGS::new(linesearch, self.memory)
            .with_tolerance_cost(self.tolerance)
            .map_err(optimizer_error)?;
        let failure = RefCell::new(None);
        let problem = ObjectiveFunction {
            objective: RefCell::new(objective),
            layout,
            failure: &failure,
        };
        let mut executor = Executor::new(problem, solver)
            .configure(|state| state.param(init).max_iters(max_iters))
            .add_observer(ProgressObserver(Arc::clone(progress)), ObserverMode::Always);
        if self.log_progress {
            executor = executor.add_observer(SlogLogger::term(), ObserverMode::Always);
        }
        let result = executor.run();
        if let Some(e) = failure.borrow_mut().take() {
            return Err(e);
        }
        match result {
            Ok(res) => {
                let state = res.state();
                Ok(Session {
                    last: state.get_best_param().or_else(|| state.get_param()).cloned(),
                    outcome: Outcome::from_termination(state.get_termination_reason()),
                })
            }
            Err(e) => {
                let progress = lock_progress(progress);
                let outcome = if progress.stopped {
                    Outcome::Stopped
                } else {
                    match e.downcast::<CrfError>() {
                        Ok(e) => return Err(e),
                        Err(e) => Outcome::Failed(e.to_string()),
                    }
                };
                Ok(Session {
                    last: progress.last.clone(),
                    outcome,
                })
            }
        }
    }

    fn optimize<O: Optimizable>(
        &self,
        objective: &mut O,
        evaluator: Box<dyn Evaluator + Send>,
    ) -> Result<(bool, u64, f64)> {
        let layout = ParamLayout::new(objective.parameters());
        let progress = Arc::new(Mutex::new(Progress {
            evaluator,
            snapshot: objective.automaton().clone(),
            layout: layout.clone(),
            last: None,
            iterations: 0,
            stopped: false,
        }));

        let init = layout.compress(&objective.parameters());
        let (param, converged) = drive(init, |param| {
            let iterations = lock_progress(&progress).iterations;
            if iterations >= self.max_iter {
                return Ok(Session {
                    last: None,
                    outcome: Outcome::MaxIters,
                });
            }
            self.run_lbfgs(
                objective,
                &layout,
                param.to_vec(),
                self.max_iter - iterations,
                &progress,
            )
        })?;

        objective.set_parameters(&layout.expand(&param))?;
        let value = objective.value()?;
        let mut progress = lock_progress(&progress);
        let iterations = progress.iterations;
        progress
            .evaluator
            .evaluate(objective.automaton(), iterations, converged, value);
        log::info!(
            "training finished after {iterations} iterations (converged: {converged}, value: {value})"
        );
        Ok((converged, iterations, value))
    }
}

/// How an L-BFGS session ended.
#[derive(Debug, PartialEq)]
enum Outcome {
    Converged,
    MaxIters,
    Stopped,
    Failed(String),
}

impl Outcome {
    fn from_termination(reason: Option<&TerminationReason>) -> Self {
        match reason {
            Some(TerminationReason::MaxItersReached) => Self::MaxIters,
            // L-BFGS exits this way when the line search fails.
            Some(TerminationReason::SolverExit(msg)) => Self::Failed(msg.clone()),
            _ => Self::Converged,
        }
    }
}

struct Session {
    // Parameters to continue from, if the session produced any.
    last: Option<Vec<f64>>,
    outcome: Outcome,
}

/// Runs sessions starting from `param` until one ends. After a failure the
/// optimizer is restarted once from the last iterate; a second failure keeps
/// that iterate and counts as converged.
///
/// Returns the final parameters and whether training converged.
fn drive<F>(mut param: Vec<f64>, mut run: F) -> Result<(Vec<f64>, bool)>
where
    F: FnMut(&[f64]) -> Result<Session>,
{
    let mut restarted = false;
    loop {
        let session = run(&param)?;
        if let Some(last) = session.last {
            param = last;
        }
        match session.outcome {
            Outcome::Converged => return Ok((param, true)),
            Outcome::MaxIters => return Ok((param, false)),
            Outcome::Stopped => {
                log::info!("training stopped by the evaluator");
                return Ok((param, false));
            }
            Outcome::Failed(msg) if restarted => {
                log::warn!("optimizer failed again ({msg}), keeping the last iterate");
                return Ok((param, true));
            }
            Outcome::Failed(msg) => {
                log::warn!("optimizer failed ({msg}), restarting from the last iterate");
                restarted = true;
            }
        }
    }
}
