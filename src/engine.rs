//! Solver engine interface.
//!
//! A [`SolverEngine`] owns the device-side state of one problem instance: its
//! BDD layers, working costs and message-passing structure. The orchestration
//! layer never looks inside; it binds cost segments, calls a native routine and
//! reads results back, one solver at a time.
//!
//! # Segment sizes
//!
//! Every slice handed to an engine is exactly one segment long:
//!
//! - layer segments have `nr_layers()` elements,
//! - BDD segments have `nr_bdds()` elements,
//! - variable segments have `nr_primal_variables() + 1` elements, the last
//!   slot holding the term of the terminal (diagram-level) layer.

use crate::error::EngineError;

/// Result type of native routines.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// The damping factor as seen by a single solver.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum OmegaSegment<'a> {
    /// One factor for every layer.
    Scalar(f32),
    /// One factor per layer of this solver.
    PerLayer(&'a [f32]),
}

impl OmegaSegment<'_> {
    /// Damping factor applied to `layer`.
    pub fn at(&self, layer: usize) -> f32 {
        match self {
            OmegaSegment::Scalar(w) => *w,
            OmegaSegment::PerLayer(ws) => ws[layer],
        }
    }
}

/// Destination for the gradient of the damping factor.
///
/// Engines *accumulate* into it: a scalar gradient is shared by every solver
/// of the batch.
#[derive(Debug)]
pub enum OmegaGradSegment<'a> {
    Scalar(&'a mut f32),
    PerLayer(&'a mut [f32]),
}

impl OmegaGradSegment<'_> {
    pub fn add(&mut self, layer: usize, value: f32) {
        match self {
            OmegaGradSegment::Scalar(g) => **g += value,
            OmegaGradSegment::PerLayer(gs) => gs[layer] += value,
        }
    }
}

/// Non-differentiable statistics collected over the trailing iterations.
#[derive(Debug)]
pub struct HistoryOutputs<'a> {
    /// Number of trailing iterations to collect statistics over.
    pub window: usize,
    /// Exponential averaging factor for the solution average.
    pub beta: f32,
    /// Averaged per-layer solution (layer segment).
    pub sol_avg: &'a mut [f32],
    /// Mean per-BDD lower-bound change per iteration (BDD segment).
    pub lb_first_order: &'a mut [f32],
    /// Mean per-BDD change of that change (BDD segment).
    pub lb_second_order: &'a mut [f32],
}

/// Gradient buffers of a dual-iteration replay, all layer segments.
///
/// `lo`, `hi` and `deferred` enter holding the gradient w.r.t. the iteration
/// outputs and leave holding the gradient w.r.t. the iteration inputs.
/// `dist_weights` is accumulated into.
#[derive(Debug)]
pub struct IterationGrads<'a> {
    pub lo: &'a mut [f32],
    pub hi: &'a mut [f32],
    pub deferred: &'a mut [f32],
    pub dist_weights: &'a mut [f32],
}

/// Native interface of one problem instance.
///
/// Methods other than the size queries operate on the costs bound by the
/// most recent [`set_costs`][SolverEngine::set_costs].
pub trait SolverEngine {
    /// Result of primal rounding, kept on the host.
    type Rounding;

    /// Number of arcs (layers) over all BDDs of this instance.
    fn nr_layers(&self) -> usize;
    fn nr_bdds(&self) -> usize;
    fn nr_primal_variables(&self) -> usize;

    /// Loads working costs from caller memory, replacing any prior binding.
    fn set_costs(&mut self, lo: &[f32], hi: &[f32], deferred: &[f32]) -> EngineResult<()>;

    /// Copies the current working costs into caller memory.
    fn costs(&self, lo: &mut [f32], hi: &mut [f32], deferred: &mut [f32]) -> EngineResult<()>;

    /// Runs up to `max_iters` dual iterations and returns how many were run.
    ///
    /// The engine may stop early once its lower-bound improvement falls under
    /// `improvement_slope` relative to the first improvement.
    fn iterations(
        &mut self,
        dist_weights: &[f32],
        max_iters: usize,
        omega: OmegaSegment<'_>,
        improvement_slope: f32,
        history: Option<HistoryOutputs<'_>>,
    ) -> EngineResult<usize>;

    /// Backpropagates through the last `skip + tracked` iterations.
    ///
    /// Starting from the bound costs, the first `skip` iterations are replayed
    /// without gradient tracking; gradients flow through the remaining
    /// `tracked` iterations only. `num_caches` bounds the number of states the
    /// engine may keep for the reverse sweep.
    #[allow(clippy::too_many_arguments)]
    fn grad_iterations(
        &mut self,
        dist_weights: &[f32],
        grads: IterationGrads<'_>,
        omega: OmegaSegment<'_>,
        grad_omega: OmegaGradSegment<'_>,
        skip: usize,
        tracked: usize,
        num_caches: usize,
    ) -> EngineResult<()>;

    /// Moves the deferred min-marginals into the costs, leaving them zero.
    fn distribute_delta(&mut self) -> EngineResult<()>;

    /// Gradient of the deferred input given gradients of the output costs.
    fn grad_distribute_delta(&mut self, grad_lo: &[f32], grad_hi: &[f32], grad_deferred: &mut [f32]) -> EngineResult<()>;

    /// Writes `hi - lo` min-marginal differences of every layer into `out`.
    fn all_min_marginal_differences(&mut self, out: &mut [f32]) -> EngineResult<()>;

    fn grad_all_min_marginal_differences(
        &mut self,
        grad_mm_diff: &[f32],
        grad_lo: &mut [f32],
        grad_hi: &mut [f32],
    ) -> EngineResult<()>;

    /// Adds per-variable perturbations (variable segments) to the costs.
    fn perturb_costs(&mut self, lo_pert: &[f32], hi_pert: &[f32]) -> EngineResult<()>;

    fn grad_cost_perturbation(
        &mut self,
        grad_lo: &[f32],
        grad_hi: &[f32],
        grad_lo_pert: &mut [f32],
        grad_hi_pert: &mut [f32],
    ) -> EngineResult<()>;

    /// Writes one lower bound per BDD into `out`.
    fn lower_bound_per_bdd(&mut self, out: &mut [f32]) -> EngineResult<()>;

    /// Distributes a per-BDD gradient onto the costs.
    ///
    /// `grad_lo` arrives zeroed and only receives nonzero contributions;
    /// `grad_hi` is overwritten entirely.
    fn grad_lower_bound_per_bdd(&mut self, grad_lb: &[f32], grad_lo: &mut [f32], grad_hi: &mut [f32]) -> EngineResult<()>;

    /// Incremental primal rounding.
    fn primal_rounding_incremental(
        &mut self,
        init_delta: f32,
        delta_growth_rate: f32,
        num_itr_lb: usize,
    ) -> EngineResult<Self::Rounding>;

    /// Writes the per-layer hi-branch indicator of every BDD's best path.
    fn solution_per_bdd(&mut self, out: &mut [f32]) -> EngineResult<()>;
}
