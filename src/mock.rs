//! Deterministic in-memory solver engine.
//!
//! [`MockSolver`] implements [`SolverEngine`] on the host with small chain
//! BDDs, so the batched operations can be driven and checked without a
//! compute device.
//!
//! # Model
//!
//! Each BDD is a chain with one layer per variable it covers, followed by one
//! terminal layer mapped to the extra variable slot `nr_primal_variables()`.
//! For a layer `l` with costs `lo`, `hi` and deferred min-marginal `d`:
//!
//! - the min-marginal difference is `m = hi + d - lo`,
//! - the lower bound of a BDD is the sum of `min(lo, hi + d)` over its layers,
//! - one dual iteration updates `d -= omega * (m - w * s)`, where `w` is the
//!   layer's distribution weight and `s` the sum of `m` over every layer of
//!   the same variable.
//!
//! With weights summing to one per variable, the iterations drive the layers
//! of a variable towards agreeing min-marginals while keeping their sum.

use std::collections::VecDeque;

use log::debug;

use crate::engine::{EngineResult, HistoryOutputs, IterationGrads, OmegaGradSegment, OmegaSegment, SolverEngine};
use crate::error::EngineError;

/// Rounds of incremental primal rounding before giving up.
pub const MAX_ROUNDING_ROUNDS: usize = 100;

/// One request for a gradient replay, as received by the engine.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Replay {
    pub skip: usize,
    pub tracked: usize,
    pub num_caches: usize,
}

/// Result of incremental primal rounding.
#[derive(Debug, Clone, PartialEq)]
pub struct MockRounding {
    /// Value of every primal variable.
    pub assignment: Vec<bool>,
    /// Perturbation rounds it took to reach agreement.
    pub rounds: usize,
    /// Total lower bound when rounding finished.
    pub lower_bound: f32,
}

#[derive(Debug, Clone)]
pub struct MockSolver {
    nr_vars: usize,
    nr_bdds: usize,
    layer_var: Vec<usize>,
    layer_bdd: Vec<usize>,
    lo: Vec<f32>,
    hi: Vec<f32>,
    def: Vec<f32>,
    iteration_limit: Option<usize>,
    fail_on: Option<&'static str>,
    // Realized counts of `iterations` calls not yet replayed, most recent last.
    runs: Vec<usize>,
    replays: Vec<Replay>,
}

impl MockSolver {
    /// Creates a solver over `nr_vars` variables with one chain BDD per entry
    /// of `bdds`, each listing the variables it covers.
    ///
    /// # Panics
    ///
    /// Panics if a BDD mentions a variable `>= nr_vars`.
    pub fn new(nr_vars: usize, bdds: &[&[usize]]) -> Self {
        let mut layer_var = Vec::new();
        let mut layer_bdd = Vec::new();
        for (b, vars) in bdds.iter().enumerate() {
            for &v in vars.iter() {
                assert!(v < nr_vars, "Variable {} out of range 0..{}", v, nr_vars);
                layer_var.push(v);
                layer_bdd.push(b);
            }
            // Terminal layer.
            layer_var.push(nr_vars);
            layer_bdd.push(b);
        }
        let n = layer_var.len();
        Self {
            nr_vars,
            nr_bdds: bdds.len(),
            layer_var,
            layer_bdd,
            lo: vec![0.0; n],
            hi: vec![0.0; n],
            def: vec![0.0; n],
            iteration_limit: None,
            fail_on: None,
            runs: Vec::new(),
            replays: Vec::new(),
        }
    }

    /// Makes the engine report convergence after at most `limit` iterations.
    pub fn with_iteration_limit(mut self, limit: usize) -> Self {
        self.iteration_limit = Some(limit);
        self
    }

    /// Variable slot of every layer; the terminal slot is `nr_primal_variables()`.
    pub fn layer_variables(&self) -> &[usize] {
        &self.layer_var
    }

    pub fn layer_bdds(&self) -> &[usize] {
        &self.layer_bdd
    }

    /// Makes the native routine named `op` fail with [`EngineError::Native`].
    pub fn with_failure(mut self, op: &'static str) -> Self {
        self.fail_on = Some(op);
        self
    }

    /// Distribution weights that split every variable evenly over its layers.
    pub fn uniform_weights(&self) -> Vec<f32> {
        let counts = self.var_counts();
        self.layer_var.iter().map(|&v| 1.0 / counts[v] as f32).collect()
    }

    /// Gradient replays requested so far.
    pub fn replays(&self) -> &[Replay] {
        &self.replays
    }

    /// Realized iteration count of the latest `iterations` call not yet replayed.
    pub fn last_run(&self) -> Option<usize> {
        self.runs.last().copied()
    }

    /// Realized counts of every `iterations` call not yet replayed, oldest first.
    pub fn pending_runs(&self) -> &[usize] {
        &self.runs
    }

    pub fn lower_bound(&self) -> f32 {
        lower_bound(&self.lo, &self.hi, &self.def)
    }

    fn var_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.nr_vars + 1];
        for &v in &self.layer_var {
            counts[v] += 1;
        }
        counts
    }

    fn var_sums(&self, m: &[f32]) -> Vec<f32> {
        let mut sums = vec![0.0; self.nr_vars + 1];
        for (l, &v) in self.layer_var.iter().enumerate() {
            sums[v] += m[l];
        }
        sums
    }

    fn lower_bound_per_bdd_of(&self, d: &[f32]) -> Vec<f32> {
        let mut lbs = vec![0.0; self.nr_bdds];
        for l in 0..self.layer_var.len() {
            lbs[self.layer_bdd[l]] += self.lo[l].min(self.hi[l] + d[l]);
        }
        lbs
    }

    fn solution_of(&self, d: &[f32]) -> Vec<f32> {
        (0..self.layer_var.len())
            .map(|l| if self.hi[l] + d[l] < self.lo[l] { 1.0 } else { 0.0 })
            .collect()
    }

    /// One dual iteration on the deferred min-marginals `d`.
    fn step(&self, d: &mut [f32], w: &[f32], omega: &OmegaSegment<'_>) {
        let m = mm_diffs(&self.lo, &self.hi, d);
        let s = self.var_sums(&m);
        for l in 0..d.len() {
            d[l] -= omega.at(l) * (m[l] - w[l] * s[self.layer_var[l]]);
        }
    }

    /// Reverse of [`step`][Self::step] taken at state `d`.
    ///
    /// `gd` holds the gradient w.r.t. the state after the step and is turned
    /// into the gradient w.r.t. the state before it.
    fn step_backward(
        &self,
        d: &[f32],
        w: &[f32],
        omega: &OmegaSegment<'_>,
        gd: &mut [f32],
        grads: &mut IterationGrads<'_>,
        grad_omega: &mut OmegaGradSegment<'_>,
    ) {
        let m = mm_diffs(&self.lo, &self.hi, d);
        let s = self.var_sums(&m);
        let mut q = vec![0.0; self.nr_vars + 1];
        for l in 0..d.len() {
            q[self.layer_var[l]] += omega.at(l) * w[l] * gd[l];
        }
        for l in 0..d.len() {
            let v = self.layer_var[l];
            let g_m = -omega.at(l) * gd[l] + q[v];
            grads.dist_weights[l] += omega.at(l) * s[v] * gd[l];
            grad_omega.add(l, -(m[l] - w[l] * s[v]) * gd[l]);
            grads.hi[l] += g_m;
            grads.lo[l] -= g_m;
            gd[l] += g_m;
        }
    }

    fn check_len(&self, segment: &'static str, actual: usize, expected: usize) -> EngineResult<()> {
        if actual != expected {
            return Err(EngineError::SegmentLength {
                segment,
                expected,
                actual,
            });
        }
        Ok(())
    }

    fn check_failure(&self, op: &'static str) -> EngineResult<()> {
        if self.fail_on == Some(op) {
            return Err(EngineError::Native(format!("injected failure in {}", op)));
        }
        Ok(())
    }

    fn check_omega(&self, omega: &OmegaSegment<'_>) -> EngineResult<()> {
        match omega {
            OmegaSegment::Scalar(_) => Ok(()),
            OmegaSegment::PerLayer(ws) => self.check_len("omega", ws.len(), self.nr_layers()),
        }
    }
}

fn mm_diffs(lo: &[f32], hi: &[f32], d: &[f32]) -> Vec<f32> {
    lo.iter().zip(hi).zip(d).map(|((lo, hi), d)| hi + d - lo).collect()
}

fn lower_bound(lo: &[f32], hi: &[f32], d: &[f32]) -> f32 {
    lo.iter().zip(hi).zip(d).map(|((lo, hi), d)| lo.min(hi + d)).sum()
}

/// Mean of consecutive differences of a sequence of values.
fn mean_diff(values: &[f32]) -> f32 {
    if values.len() < 2 {
        return 0.0;
    }
    (values[values.len() - 1] - values[0]) / (values.len() - 1) as f32
}

impl SolverEngine for MockSolver {
    type Rounding = MockRounding;

    fn nr_layers(&self) -> usize {
        self.layer_var.len()
    }

    fn nr_bdds(&self) -> usize {
        self.nr_bdds
    }

    fn nr_primal_variables(&self) -> usize {
        self.nr_vars
    }

    fn set_costs(&mut self, lo: &[f32], hi: &[f32], deferred: &[f32]) -> EngineResult<()> {
        let n = self.nr_layers();
        self.check_len("lo", lo.len(), n)?;
        self.check_len("hi", hi.len(), n)?;
        self.check_len("deferred", deferred.len(), n)?;
        self.lo.copy_from_slice(lo);
        self.hi.copy_from_slice(hi);
        self.def.copy_from_slice(deferred);
        Ok(())
    }

    fn costs(&self, lo: &mut [f32], hi: &mut [f32], deferred: &mut [f32]) -> EngineResult<()> {
        let n = self.nr_layers();
        self.check_len("lo", lo.len(), n)?;
        self.check_len("hi", hi.len(), n)?;
        self.check_len("deferred", deferred.len(), n)?;
        lo.copy_from_slice(&self.lo);
        hi.copy_from_slice(&self.hi);
        deferred.copy_from_slice(&self.def);
        Ok(())
    }

    fn iterations(
        &mut self,
        dist_weights: &[f32],
        max_iters: usize,
        omega: OmegaSegment<'_>,
        improvement_slope: f32,
        history: Option<HistoryOutputs<'_>>,
    ) -> EngineResult<usize> {
        self.check_len("dist_weights", dist_weights.len(), self.nr_layers())?;
        self.check_omega(&omega)?;
        if let Some(h) = &history {
            self.check_len("sol_avg", h.sol_avg.len(), self.nr_layers())?;
            self.check_len("lb_first_order", h.lb_first_order.len(), self.nr_bdds)?;
            self.check_len("lb_second_order", h.lb_second_order.len(), self.nr_bdds)?;
        }

        let window = history.as_ref().map_or(0, |h| h.window);
        let mut lb_hist: VecDeque<Vec<f32>> = VecDeque::with_capacity(window + 1);
        let mut sol_hist: VecDeque<Vec<f32>> = VecDeque::with_capacity(window);
        let mut d = std::mem::take(&mut self.def);
        if window > 0 {
            lb_hist.push_back(self.lower_bound_per_bdd_of(&d));
        }

        let limit = self.iteration_limit.map_or(max_iters, |limit| limit.min(max_iters));
        let mut lb_prev = lower_bound(&self.lo, &self.hi, &d);
        let mut first_improvement = None;
        let mut run = 0;
        while run < limit {
            self.step(&mut d, dist_weights, &omega);
            run += 1;

            if window > 0 {
                if lb_hist.len() > window {
                    lb_hist.pop_front();
                }
                lb_hist.push_back(self.lower_bound_per_bdd_of(&d));
                if sol_hist.len() == window {
                    sol_hist.pop_front();
                }
                sol_hist.push_back(self.solution_of(&d));
            }

            let lb = lower_bound(&self.lo, &self.hi, &d);
            let improvement = lb - lb_prev;
            lb_prev = lb;
            if improvement_slope > 0.0 {
                match first_improvement {
                    None => first_improvement = Some(improvement),
                    Some(first) => {
                        if improvement <= improvement_slope * f32::abs(first) {
                            debug!("early stop after {} iterations (improvement {})", run, improvement);
                            break;
                        }
                    }
                }
            }
        }

        if let Some(h) = history {
            let current = self.solution_of(&d);
            let mut sols = sol_hist.iter();
            let mut avg = sols.next().cloned().unwrap_or(current);
            for sol in sols {
                for (a, s) in avg.iter_mut().zip(sol) {
                    *a = h.beta * *a + (1.0 - h.beta) * s;
                }
            }
            h.sol_avg.copy_from_slice(&avg);

            for b in 0..self.nr_bdds {
                let series: Vec<f32> = lb_hist.iter().map(|lbs| lbs[b]).collect();
                let diffs: Vec<f32> = series.windows(2).map(|p| p[1] - p[0]).collect();
                h.lb_first_order[b] = mean_diff(&series);
                h.lb_second_order[b] = mean_diff(&diffs);
            }
        }

        self.def = d;
        self.runs.push(run);
        Ok(run)
    }

    fn grad_iterations(
        &mut self,
        dist_weights: &[f32],
        mut grads: IterationGrads<'_>,
        omega: OmegaSegment<'_>,
        mut grad_omega: OmegaGradSegment<'_>,
        skip: usize,
        tracked: usize,
        num_caches: usize,
    ) -> EngineResult<()> {
        let n = self.nr_layers();
        self.check_len("dist_weights", dist_weights.len(), n)?;
        self.check_len("grad_lo", grads.lo.len(), n)?;
        self.check_len("grad_hi", grads.hi.len(), n)?;
        self.check_len("grad_deferred", grads.deferred.len(), n)?;
        self.check_len("grad_dist_weights", grads.dist_weights.len(), n)?;
        self.check_omega(&omega)?;
        if let OmegaGradSegment::PerLayer(g) = &grad_omega {
            self.check_len("grad_omega", g.len(), n)?;
        }
        // Chained blocks are replayed in reverse order of their forward runs.
        let run = self.runs.last().copied().unwrap_or(0);
        if skip + tracked != run {
            return Err(EngineError::InconsistentReplay { skip, tracked, run });
        }
        self.runs.pop();
        self.replays.push(Replay {
            skip,
            tracked,
            num_caches,
        });

        let mut d = self.def.clone();
        for _ in 0..skip {
            self.step(&mut d, dist_weights, &omega);
        }
        if tracked == 0 {
            return Ok(());
        }

        // Keep at most `num_caches` checkpoints and recompute the states in between.
        let stride = tracked.div_ceil(num_caches.max(1));
        let mut checkpoints = Vec::with_capacity(tracked.div_ceil(stride));
        for t in 0..tracked {
            if t % stride == 0 {
                checkpoints.push(d.clone());
            }
            self.step(&mut d, dist_weights, &omega);
        }

        let mut gd = grads.deferred.to_vec();
        for (c, checkpoint) in checkpoints.iter().enumerate().rev() {
            let start = c * stride;
            let end = (start + stride).min(tracked);
            let mut states = Vec::with_capacity(end - start);
            let mut state = checkpoint.clone();
            for _ in start..end {
                states.push(state.clone());
                self.step(&mut state, dist_weights, &omega);
            }
            for state in states.iter().rev() {
                self.step_backward(state, dist_weights, &omega, &mut gd, &mut grads, &mut grad_omega);
            }
        }
        grads.deferred.copy_from_slice(&gd);
        Ok(())
    }

    fn distribute_delta(&mut self) -> EngineResult<()> {
        self.check_failure("distribute_delta")?;
        for (hi, d) in self.hi.iter_mut().zip(self.def.iter_mut()) {
            *hi += *d;
            *d = 0.0;
        }
        Ok(())
    }

    fn grad_distribute_delta(&mut self, grad_lo: &[f32], grad_hi: &[f32], grad_deferred: &mut [f32]) -> EngineResult<()> {
        let n = self.nr_layers();
        self.check_len("grad_lo", grad_lo.len(), n)?;
        self.check_len("grad_hi", grad_hi.len(), n)?;
        self.check_len("grad_deferred", grad_deferred.len(), n)?;
        grad_deferred.copy_from_slice(grad_hi);
        Ok(())
    }

    fn all_min_marginal_differences(&mut self, out: &mut [f32]) -> EngineResult<()> {
        self.check_failure("all_min_marginal_differences")?;
        self.check_len("mm_diff", out.len(), self.nr_layers())?;
        out.copy_from_slice(&mm_diffs(&self.lo, &self.hi, &self.def));
        Ok(())
    }

    fn grad_all_min_marginal_differences(
        &mut self,
        grad_mm_diff: &[f32],
        grad_lo: &mut [f32],
        grad_hi: &mut [f32],
    ) -> EngineResult<()> {
        let n = self.nr_layers();
        self.check_len("grad_mm_diff", grad_mm_diff.len(), n)?;
        self.check_len("grad_lo", grad_lo.len(), n)?;
        self.check_len("grad_hi", grad_hi.len(), n)?;
        for l in 0..n {
            grad_lo[l] = -grad_mm_diff[l];
            grad_hi[l] = grad_mm_diff[l];
        }
        Ok(())
    }

    fn perturb_costs(&mut self, lo_pert: &[f32], hi_pert: &[f32]) -> EngineResult<()> {
        self.check_failure("perturb_costs")?;
        self.check_len("lo_pert", lo_pert.len(), self.nr_vars + 1)?;
        self.check_len("hi_pert", hi_pert.len(), self.nr_vars + 1)?;
        for (l, &v) in self.layer_var.iter().enumerate() {
            self.lo[l] += lo_pert[v];
            self.hi[l] += hi_pert[v];
        }
        Ok(())
    }

    fn grad_cost_perturbation(
        &mut self,
        grad_lo: &[f32],
        grad_hi: &[f32],
        grad_lo_pert: &mut [f32],
        grad_hi_pert: &mut [f32],
    ) -> EngineResult<()> {
        let n = self.nr_layers();
        self.check_len("grad_lo", grad_lo.len(), n)?;
        self.check_len("grad_hi", grad_hi.len(), n)?;
        self.check_len("grad_lo_pert", grad_lo_pert.len(), self.nr_vars + 1)?;
        self.check_len("grad_hi_pert", grad_hi_pert.len(), self.nr_vars + 1)?;
        grad_lo_pert.fill(0.0);
        grad_hi_pert.fill(0.0);
        for (l, &v) in self.layer_var.iter().enumerate() {
            grad_lo_pert[v] += grad_lo[l];
            grad_hi_pert[v] += grad_hi[l];
        }
        Ok(())
    }

    fn lower_bound_per_bdd(&mut self, out: &mut [f32]) -> EngineResult<()> {
        self.check_failure("lower_bound_per_bdd")?;
        self.check_len("lb_per_bdd", out.len(), self.nr_bdds)?;
        out.copy_from_slice(&self.lower_bound_per_bdd_of(&self.def));
        Ok(())
    }

    fn grad_lower_bound_per_bdd(&mut self, grad_lb: &[f32], grad_lo: &mut [f32], grad_hi: &mut [f32]) -> EngineResult<()> {
        let n = self.nr_layers();
        self.check_len("grad_lb", grad_lb.len(), self.nr_bdds)?;
        self.check_len("grad_lo", grad_lo.len(), n)?;
        self.check_len("grad_hi", grad_hi.len(), n)?;
        for l in 0..n {
            let g = grad_lb[self.layer_bdd[l]];
            if self.hi[l] + self.def[l] < self.lo[l] {
                grad_hi[l] = g;
            } else {
                grad_lo[l] += g;
                grad_hi[l] = 0.0;
            }
        }
        Ok(())
    }

    fn primal_rounding_incremental(
        &mut self,
        init_delta: f32,
        delta_growth_rate: f32,
        num_itr_lb: usize,
    ) -> EngineResult<MockRounding> {
        self.check_failure("primal_rounding_incremental")?;
        let weights = self.uniform_weights();
        let omega = OmegaSegment::Scalar(0.5);
        let mut delta = init_delta;

        for round in 0..MAX_ROUNDING_ROUNDS {
            let sol = self.solution_of(&self.def);
            let mut assignment = vec![None; self.nr_vars];
            let mut disagreeing = vec![false; self.nr_vars];
            for (l, &v) in self.layer_var.iter().enumerate() {
                if v == self.nr_vars {
                    continue;
                }
                let value = sol[l] > 0.5;
                match assignment[v] {
                    None => assignment[v] = Some(value),
                    Some(prev) if prev != value => disagreeing[v] = true,
                    Some(_) => {}
                }
            }

            if !disagreeing.contains(&true) {
                let assignment = assignment.into_iter().map(|x| x.unwrap_or(false)).collect();
                debug!("primal rounding agreed after {} rounds", round);
                return Ok(MockRounding {
                    assignment,
                    rounds: round,
                    lower_bound: self.lower_bound(),
                });
            }

            let s = self.var_sums(&mm_diffs(&self.lo, &self.hi, &self.def));
            for (l, &v) in self.layer_var.iter().enumerate() {
                if v < self.nr_vars && disagreeing[v] {
                    if s[v] < 0.0 {
                        self.lo[l] += delta;
                    } else {
                        self.hi[l] += delta;
                    }
                }
            }
            delta *= delta_growth_rate;

            let mut d = std::mem::take(&mut self.def);
            for _ in 0..num_itr_lb {
                self.step(&mut d, &weights, &omega);
            }
            self.def = d;
        }

        Err(EngineError::Native(format!(
            "primal rounding did not converge after {} rounds",
            MAX_ROUNDING_ROUNDS
        )))
    }

    fn solution_per_bdd(&mut self, out: &mut [f32]) -> EngineResult<()> {
        self.check_failure("solution_per_bdd")?;
        self.check_len("solution", out.len(), self.nr_layers())?;
        out.copy_from_slice(&self.solution_of(&self.def));
        Ok(())
    }
}
