use crate::automaton::{Automaton, Transition};
use crate::errors::{CrfError, Result};
use crate::feature::{FeatureVector, Instance};
use crate::math::sum_neg_log_prob;
use crate::objective::{
    assemble_gradient, check_nan, run_instances, update_parameter, update_parameters,
    validate_instances, Accumulators, EvaluationCache, InfiniteInstances, Optimizable,
};
use crate::prior::Prior;
use crate::second_order::SecondOrder;
use crate::statistics::Statistics;
use crate::transition::weights_cost;

/// One way of filling the center position, with everything it contributes.
struct Candidate<'a> {
    cost: f64,
    initial: Option<usize>,
    prev: Option<(&'a [usize], &'a FeatureVector)>,
    next: (&'a [usize], &'a FeatureVector),
    final_state: Option<usize>,
}

impl Candidate<'_> {
    fn accumulate(&self, stats: &mut Statistics, amount: f64) {
        if let Some(s) = self.initial {
            stats.increment_initial(s, amount);
        }
        if let Some((handles, x)) = self.prev {
            stats.increment_weights(handles, x, amount);
        }
        stats.increment_weights(self.next.0, self.next.1, amount);
        if let Some(s) = self.final_state {
            stats.increment_final(s, amount);
        }
    }
}

/// Normalises the candidates and adds their posteriors to `stats`.
///
/// Returns the cost of the sum of their probabilities.
fn compute_local_log_z(candidates: &[Candidate], stats: &mut Statistics) -> f64 {
    let z = candidates
        .iter()
        .fold(f64::INFINITY, |acc, c| sum_neg_log_prob(acc, c.cost));
    if z == f64::INFINITY {
        return z;
    }
    for c in candidates {
        c.accumulate(stats, (z - c.cost).exp());
    }
    z
}

/// Pseudolikelihood of the training labels on a second-order automaton.
///
/// Each position is predicted from its fixed neighbours, normalising only
/// over the labels of that position. States of the underlying first-order
/// automaton must be named after the labels they emit.
#[cfg_attr(docsrs, doc(cfg(feature = "train")))]
pub struct Pseudolikelihood<'a> {
    second_order: SecondOrder,
    instances: &'a [Instance],
    prior: Prior,
    n_threads: usize,
    label_states: Vec<usize>,
    accumulators: Accumulators,
    infinite: InfiniteInstances,
    cache: EvaluationCache,
}

impl<'a> Pseudolikelihood<'a> {
    /// Creates the objective.
    ///
    /// # Errors
    ///
    /// Fails if a label has no first-order state of the same name or an
    /// instance does not match the automaton.
    pub fn new(second_order: SecondOrder, instances: &'a [Instance], prior: Prior) -> Result<Self> {
        let automaton = second_order.automaton();
        automaton.check_resolved()?;
        validate_instances(automaton, instances)?;
        let mut label_states = Vec::with_capacity(automaton.labels().len());
        for label in automaton.labels().iter() {
            let s = second_order.first_state_index(label).ok_or_else(|| {
                CrfError::invalid_argument(format!("label {label} has no state of the same name"))
            })?;
            label_states.push(s);
        }
        let accumulators = Accumulators::new(automaton);
        let cache = EvaluationCache::new(automaton.num_parameters());
        Ok(Self {
            second_order,
            instances,
            prior,
            n_threads: 1,
            label_states,
            accumulators,
            infinite: InfiniteInstances::default(),
            cache,
        })
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

    /// Gets the second-order automaton.
    #[inline(always)]
    pub fn second_order(&self) -> &SecondOrder {
        &self.second_order
    }

    /// Releases the statistics and returns the second-order automaton.
    pub fn into_second_order(self) -> SecondOrder {
        self.second_order
    }

    // Transitions out of `source` into pairs whose center is `right`.
    fn transitions_into<'b>(
        automaton: &'b Automaton,
        second_order: &'b SecondOrder,
        source: usize,
        right: usize,
        label: usize,
    ) -> impl Iterator<Item = &'b Transition> + 'b {
        automaton
            .state(source)
            .transitions()
            .iter()
            .filter(move |t| t.label() == label && second_order.origin(t.destination()).1 == right)
    }

    // Free and gold candidates for position `t`.
    fn collect_candidates<'b>(
        &'b self,
        instance: &'b Instance,
        t: usize,
    ) -> (Vec<Candidate<'b>>, Vec<Candidate<'b>>) {
        let automaton = self.second_order.automaton();
        let x = &instance.input;
        let y = &instance.output;
        let center = self.label_states[y[t]];
        let mut free = vec![];
        let mut gold = vec![];

        // The state before position `t`, and whether its initial cost is
        // part of the local factor.
        let sources: Vec<(usize, bool)> = if t == 0 {
            self.second_order.start_states().map(|s| (s, true)).collect()
        } else {
            self.second_order
                .representative(self.label_states[y[t - 1]])
                .map(|s| (s, false))
                .into_iter()
                .collect()
        };

        for (source, with_initial) in sources {
            let (initial_cost, initial) = if with_initial {
                (automaton.state(source).initial_cost(), Some(source))
            } else {
                (0.0, None)
            };
            if initial_cost == f64::INFINITY {
                continue;
            }
            for u in automaton.state(source).transitions() {
                let pair = u.destination();
                let is_center = self.second_order.origin(pair).1 == center && u.label() == y[t];
                if t + 1 == y.len() {
                    let cost = initial_cost
                        + weights_cost(automaton, u.weights(), &x[t])
                        + automaton.state(pair).final_cost();
                    if cost == f64::INFINITY {
                        continue;
                    }
                    let make = || Candidate {
                        cost,
                        initial,
                        prev: None,
                        next: (u.weights(), &x[t]),
                        final_state: Some(pair),
                    };
                    if is_center {
                        gold.push(make());
                    }
                    free.push(make());
                    continue;
                }
                let right = self.label_states[y[t + 1]];
                for v in
                    Self::transitions_into(automaton, &self.second_order, pair, right, y[t + 1])
                {
                    let cost = initial_cost
                        + weights_cost(automaton, v.prev_weights(), &x[t])
                        + weights_cost(automaton, v.weights(), &x[t + 1]);
                    if cost == f64::INFINITY {
                        continue;
                    }
                    let make = || Candidate {
                        cost,
                        initial,
                        prev: Some((v.prev_weights(), &x[t])),
                        next: (v.weights(), &x[t + 1]),
                        final_state: None,
                    };
                    if is_center && v.prev_label() == Some(y[t]) {
                        gold.push(make());
                    }
                    free.push(make());
                }
            }
        }
        (free, gold)
    }

    fn compute_value(&mut self) -> Result<()> {
        let this = &*self;
        let automaton = this.second_order.automaton();
        let (costs, accumulators) =
            run_instances(automaton, this.instances, this.n_threads, |instance, acc| {
                let candidates: Vec<_> = (0..instance.len())
                    .map(|t| this.collect_candidates(instance, t))
                    .collect();
                // An unreachable gold label at any position excludes the
                // whole instance.
                if candidates.iter().any(|(_, gold)| gold.is_empty()) {
                    return Ok((f64::INFINITY, f64::INFINITY));
                }
                let mut gold_total = 0.0;
                let mut free_total = 0.0;
                for (free, gold) in &candidates {
                    gold_total += compute_local_log_z(gold, &mut acc.constraints);
                    free_total += compute_local_log_z(free, &mut acc.expectations);
                }
                Ok((gold_total, free_total))
            })?;
        self.infinite
            .check(costs.iter().map(|&(g, _)| g == f64::INFINITY).collect())?;

        let mut value = 0.0;
        for (i, &(gold, free)) in costs.iter().enumerate() {
            if self.infinite.is_infinite(i) {
                continue;
            }
            value += gold - free;
        }
        value += self
            .prior
            .total_penalty(&self.second_order.automaton().parameters());
        log::debug!("pseudolikelihood value = {value}");

        self.accumulators = accumulators;
        self.cache.value = value;
        self.cache.cost_stale = false;
        self.cache.gradient_stale = true;
        Ok(())
    }
}

impl Optimizable for Pseudolikelihood<'_> {
    fn automaton(&self) -> &Automaton {
        self.second_order.automaton()
    }

    fn set_parameters(&mut self, params: &[f64]) -> Result<()> {
        update_parameters(self.second_order.automaton_mut(), &mut self.cache, params)
    }

    fn set_parameter(&mut self, index: usize, value: f64) -> Result<()> {
        update_parameter(self.second_order.automaton_mut(), &mut self.cache, index, value)
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
            let automaton = self.second_order.automaton();
            check_nan(automaton, &self.accumulators, self.cache.value)?;
            assemble_gradient(
                automaton,
                &self.accumulators,
                &self.prior,
                &mut self.cache.gradient,
            );
            self.cache.gradient_stale = false;
        }
        Ok(self.cache.gradient.clone())
    }
}
