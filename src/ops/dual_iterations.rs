//! Dual iterations with truncated backpropagation.
//!
//! The forward pass runs up to `num_iterations` dual iterations on every
//! solver and records how many each one actually ran. The backward pass
//! rebinds the original costs and asks the engine to replay exactly those
//! iterations, tracking gradients through the trailing
//! `min(actual, grad_dual_itr_max_itr)` of them only (see
//! [`truncation`][crate::truncation]).

use log::{debug, info};

use crate::buffer::{ensure_len, validate_input_format, Buffer};
use crate::config::IterationConfig;
use crate::diagnostics::{ensure_finite, log_grad_stats};
use crate::engine::{HistoryOutputs, IterationGrads, SolverEngine};
use crate::error::{Error, Result};
use crate::layout::{Batch, Layout, SegmentKind, SolverSizes};
use crate::omega::{Omega, OmegaGrad};
use crate::ops::incoming_grad;
use crate::truncation;

/// Non-differentiable statistics over the trailing iterations.
#[derive(Debug, Clone, PartialEq)]
pub struct History {
    /// Averaged per-layer solution (layer-segmented).
    pub sol_avg: Buffer,
    /// Per-BDD first-order lower-bound trend (bdd-segmented).
    pub lb_first_order: Buffer,
    /// Per-BDD second-order lower-bound trend (bdd-segmented).
    pub lb_second_order: Buffer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DualIterationsOutput {
    pub lo_costs: Buffer,
    pub hi_costs: Buffer,
    pub def_mm: Buffer,
    /// Present when `compute_history_for_itrs > 0`.
    pub history: Option<History>,
}

/// Incoming gradients w.r.t. the forward outputs; `None` means zero.
#[derive(Debug, Default)]
pub struct DualIterationsOutputGrads {
    pub lo_costs: Option<Buffer>,
    pub hi_costs: Option<Buffer>,
    pub def_mm: Option<Buffer>,
    /// Ignored: the averaged solution is not differentiable.
    pub sol_avg: Option<Buffer>,
}

/// Gradients w.r.t. the forward inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct DualIterationsGrads {
    pub lo_costs: Buffer,
    pub hi_costs: Buffer,
    pub def_mm: Buffer,
    pub dist_weights: Buffer,
    pub omega: OmegaGrad,
}

/// State saved by [`DualIterations::forward`] for the matching backward pass.
#[derive(Debug)]
pub struct DualIterationsContext {
    lo_costs: Buffer,
    hi_costs: Buffer,
    def_mm: Buffer,
    dist_weights: Buffer,
    omega: Omega,
    sizes: Vec<SolverSizes>,
    actual_num_itr: Vec<usize>,
    grad_dual_itr_max_itr: usize,
    num_caches: usize,
}

pub struct DualIterations;

impl DualIterations {
    pub fn forward<S: SolverEngine>(
        batch: &mut Batch<S>,
        lo_costs: Buffer,
        hi_costs: Buffer,
        def_mm: Buffer,
        dist_weights: Buffer,
        omega: Omega,
        config: &IterationConfig,
    ) -> Result<(DualIterationsOutput, DualIterationsContext)> {
        validate_input_format(&[
            ("lo_costs", &lo_costs),
            ("hi_costs", &hi_costs),
            ("def_mm", &def_mm),
            ("dist_weights", &dist_weights),
        ])?;
        let n = lo_costs.len();
        ensure_len("hi_costs", &hi_costs, n)?;
        ensure_len("def_mm", &def_mm, n)?;
        ensure_len("dist_weights", &dist_weights, n)?;
        omega.validate(n)?;

        let layers = batch.resolve(SegmentKind::Layer, n)?;
        let bdds = batch.resolve(SegmentKind::Bdd, batch.total(SegmentKind::Bdd))?;

        let mut lo_out = Buffer::zeros(n);
        let mut hi_out = Buffer::zeros(n);
        let mut def_mm_out = Buffer::zeros(n);
        let mut history = config.has_history().then(|| History {
            sol_avg: Buffer::zeros(n),
            lb_first_order: Buffer::zeros(bdds.total()),
            lb_second_order: Buffer::zeros(bdds.total()),
        });

        let lo = lo_costs.view("lo_costs")?;
        let hi = hi_costs.view("hi_costs")?;
        let def = def_mm.view("def_mm")?;
        let weights = dist_weights.view("dist_weights")?;
        let lo_o = lo_out.view_mut("lo_costs_out")?;
        let hi_o = hi_out.view_mut("hi_costs_out")?;
        let def_o = def_mm_out.view_mut("def_mm_out")?;

        let context = format!("num_iterations: {}", config.num_iterations);
        let mut actual_num_itr = Vec::with_capacity(batch.len());
        for (i, solver) in batch.solvers_mut().enumerate() {
            let r = layers.range(i);
            let b = bdds.range(i);
            debug!("dual iterations: solver {} on layers {:?}", i, r);

            solver
                .set_costs(&lo[r.clone()], &hi[r.clone()], &def[r.clone()])
                .map_err(|e| Error::engine(i, "set_costs", context.clone(), e))?;

            let hist = match history.as_mut() {
                Some(h) => Some(HistoryOutputs {
                    window: config.compute_history_for_itrs,
                    beta: config.history_avg_beta,
                    sol_avg: &mut h.sol_avg.view_mut("sol_avg")?[r.clone()],
                    lb_first_order: &mut h.lb_first_order.view_mut("lb_first_order")?[b.clone()],
                    lb_second_order: &mut h.lb_second_order.view_mut("lb_second_order")?[b],
                }),
                None => None,
            };
            let num_itr = solver
                .iterations(
                    &weights[r.clone()],
                    config.num_iterations,
                    omega.segment(r.clone())?,
                    config.improvement_slope,
                    hist,
                )
                .map_err(|e| Error::engine(i, "iterations", context.clone(), e))?;
            actual_num_itr.push(num_itr);

            solver
                .costs(&mut lo_o[r.clone()], &mut hi_o[r.clone()], &mut def_o[r])
                .map_err(|e| Error::engine(i, "costs", context.clone(), e))?;
        }
        info!(
            "dual iterations: requested {}, realized {:?}",
            config.num_iterations, actual_num_itr
        );

        let output = DualIterationsOutput {
            lo_costs: lo_out,
            hi_costs: hi_out,
            def_mm: def_mm_out,
            history,
        };
        let ctx = DualIterationsContext {
            lo_costs,
            hi_costs,
            def_mm,
            dist_weights,
            omega,
            sizes: batch.sizes().to_vec(),
            actual_num_itr,
            grad_dual_itr_max_itr: config.grad_dual_itr_max_itr,
            num_caches: config.num_caches,
        };
        Ok((output, ctx))
    }
}

impl DualIterationsContext {
    /// Iterations each solver actually ran in the forward pass.
    pub fn actual_num_itr(&self) -> &[usize] {
        &self.actual_num_itr
    }

    pub fn backward<S: SolverEngine>(
        self,
        batch: &mut Batch<S>,
        grads: DualIterationsOutputGrads,
    ) -> Result<DualIterationsGrads> {
        let Self {
            lo_costs,
            hi_costs,
            def_mm,
            dist_weights,
            omega,
            sizes,
            actual_num_itr,
            grad_dual_itr_max_itr,
            num_caches,
        } = self;

        batch.ensure_matches(&sizes)?;
        let n = lo_costs.len();
        let mut grad_lo = incoming_grad("grad_lo_costs", grads.lo_costs, n)?;
        let mut grad_hi = incoming_grad("grad_hi_costs", grads.hi_costs, n)?;
        let mut grad_def = incoming_grad("grad_def_mm", grads.def_mm, n)?;
        if grads.sol_avg.is_some() {
            debug!("dual iterations: ignoring gradient of the averaged solution");
        }

        let layers = Layout::new(SegmentKind::Layer, &sizes);
        layers.check(n)?;

        let mut grad_weights = Buffer::zeros(n);
        let mut grad_omega = OmegaGrad::zeros_like(&omega);

        let lo = lo_costs.view("lo_costs")?;
        let hi = hi_costs.view("hi_costs")?;
        let def = def_mm.view("def_mm")?;
        let weights = dist_weights.view("dist_weights")?;
        let g_lo = grad_lo.view_mut("grad_lo_costs")?;
        let g_hi = grad_hi.view_mut("grad_hi_costs")?;
        let g_def = grad_def.view_mut("grad_def_mm")?;
        let g_w = grad_weights.view_mut("grad_dist_weights")?;

        let windows = truncation::plan(&actual_num_itr, grad_dual_itr_max_itr);
        for ((i, solver), window) in batch.solvers_mut().enumerate().zip(windows) {
            let r = layers.range(i);
            debug!("dual iterations backward: solver {} on layers {:?}, {}", i, r, window);

            solver
                .set_costs(&lo[r.clone()], &hi[r.clone()], &def[r.clone()])
                .map_err(|e| Error::engine(i, "set_costs", window.to_string(), e))?;
            log_grad_stats("grad_lo_costs_input", i, &g_lo[r.clone()]);
            log_grad_stats("grad_hi_costs_input", i, &g_hi[r.clone()]);
            log_grad_stats("grad_def_mm_input", i, &g_def[r.clone()]);

            solver
                .grad_iterations(
                    &weights[r.clone()],
                    IterationGrads {
                        lo: &mut g_lo[r.clone()],
                        hi: &mut g_hi[r.clone()],
                        deferred: &mut g_def[r.clone()],
                        dist_weights: &mut g_w[r.clone()],
                    },
                    omega.segment(r.clone())?,
                    grad_omega.segment(r.clone())?,
                    window.skip,
                    window.tracked,
                    num_caches,
                )
                .map_err(|e| Error::engine(i, "grad_iterations", window.to_string(), e))?;

            log_grad_stats("grad_lo_costs_out", i, &g_lo[r.clone()]);
            log_grad_stats("grad_hi_costs_out", i, &g_hi[r.clone()]);
            log_grad_stats("grad_def_mm_out", i, &g_def[r.clone()]);
            log_grad_stats("grad_dist_weights_out", i, &g_w[r]);
        }

        let grad_omega_buf = grad_omega.clone().into_buffer();
        ensure_finite(&[
            ("grad_lo_costs", &grad_lo),
            ("grad_hi_costs", &grad_hi),
            ("grad_def_mm", &grad_def),
            ("grad_dist_weights", &grad_weights),
            ("grad_omega", &grad_omega_buf),
        ])?;

        Ok(DualIterationsGrads {
            lo_costs: grad_lo,
            hi_costs: grad_hi,
            def_mm: grad_def,
            dist_weights: grad_weights,
            omega: grad_omega,
        })
    }
}
