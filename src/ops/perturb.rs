//! Additive per-variable perturbation of the costs.
//!
//! The perturbations are variable-segmented (`nr_primal_variables() + 1` per
//! solver, the last slot belonging to the terminal layers) while the costs are
//! layer-segmented. Both layouts advance in the same loop and both must cover
//! their buffers exactly.

use log::debug;

use crate::buffer::{ensure_len, validate_input_format, Buffer};
use crate::diagnostics::ensure_finite;
use crate::engine::SolverEngine;
use crate::error::{Error, Result};
use crate::layout::{Batch, Layout, SegmentKind, SolverSizes};
use crate::ops::incoming_grad;

#[derive(Debug, Clone, PartialEq)]
pub struct PerturbPrimalCostsOutput {
    pub lo_costs: Buffer,
    pub hi_costs: Buffer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerturbPrimalCostsGrads {
    pub lo_costs_pert: Buffer,
    pub hi_costs_pert: Buffer,
    /// The perturbation is additive, so these are the incoming gradients.
    pub lo_costs: Buffer,
    pub hi_costs: Buffer,
}

#[derive(Debug)]
pub struct PerturbPrimalCostsContext {
    lo_costs_pert: Buffer,
    hi_costs_pert: Buffer,
    lo_costs: Buffer,
    hi_costs: Buffer,
    sizes: Vec<SolverSizes>,
}

pub struct PerturbPrimalCosts;

impl PerturbPrimalCosts {
    pub fn forward<S: SolverEngine>(
        batch: &mut Batch<S>,
        lo_costs_pert: Buffer,
        hi_costs_pert: Buffer,
        lo_costs: Buffer,
        hi_costs: Buffer,
    ) -> Result<(PerturbPrimalCostsOutput, PerturbPrimalCostsContext)> {
        validate_input_format(&[
            ("lo_costs_pert", &lo_costs_pert),
            ("hi_costs_pert", &hi_costs_pert),
            ("lo_costs", &lo_costs),
            ("hi_costs", &hi_costs),
        ])?;
        let n = lo_costs.len();
        ensure_len("hi_costs", &hi_costs, n)?;
        ensure_len("hi_costs_pert", &hi_costs_pert, lo_costs_pert.len())?;
        let layers = batch.resolve(SegmentKind::Layer, n)?;
        let vars = batch.resolve(SegmentKind::Variable, lo_costs_pert.len())?;

        let zeros = vec![0.0; n];
        let mut lo_out = Buffer::zeros(n);
        let mut hi_out = Buffer::zeros(n);
        {
            let lo = lo_costs.view("lo_costs")?;
            let hi = hi_costs.view("hi_costs")?;
            let lo_p = lo_costs_pert.view("lo_costs_pert")?;
            let hi_p = hi_costs_pert.view("hi_costs_pert")?;
            let lo_o = lo_out.view_mut("lo_costs_out")?;
            let hi_o = hi_out.view_mut("hi_costs_out")?;
            // The deferred min-marginals stay zero; read them into scratch.
            let mut def_scratch = vec![0.0; n];

            for (i, solver) in batch.solvers_mut().enumerate() {
                let r = layers.range(i);
                let v = vars.range(i);
                let context = format!("layers {:?}, variables {:?}", r, v);
                debug!("perturb costs: solver {} on layers {:?}, variables {:?}", i, r, v);
                solver
                    .set_costs(&lo[r.clone()], &hi[r.clone()], &zeros[r.clone()])
                    .map_err(|e| Error::engine(i, "set_costs", context.clone(), e))?;
                solver
                    .perturb_costs(&lo_p[v.clone()], &hi_p[v])
                    .map_err(|e| Error::engine(i, "perturb_costs", context.clone(), e))?;
                solver
                    .costs(&mut lo_o[r.clone()], &mut hi_o[r.clone()], &mut def_scratch[r])
                    .map_err(|e| Error::engine(i, "costs", context.clone(), e))?;
            }
        }

        let ctx = PerturbPrimalCostsContext {
            lo_costs_pert,
            hi_costs_pert,
            lo_costs,
            hi_costs,
            sizes: batch.sizes().to_vec(),
        };
        Ok((
            PerturbPrimalCostsOutput {
                lo_costs: lo_out,
                hi_costs: hi_out,
            },
            ctx,
        ))
    }
}

impl PerturbPrimalCostsContext {
    /// Maps layer-segmented cost gradients to variable-segmented perturbation gradients.
    ///
    /// The incoming gradients are also returned unchanged as the gradients of
    /// the unperturbed costs.
    pub fn backward<S: SolverEngine>(
        self,
        batch: &mut Batch<S>,
        grad_lo_costs: Option<Buffer>,
        grad_hi_costs: Option<Buffer>,
    ) -> Result<PerturbPrimalCostsGrads> {
        batch.ensure_matches(&self.sizes)?;
        let n = self.lo_costs.len();
        let grad_lo = incoming_grad("grad_lo_costs", grad_lo_costs, n)?;
        let grad_hi = incoming_grad("grad_hi_costs", grad_hi_costs, n)?;
        let layers = Layout::new(SegmentKind::Layer, &self.sizes);
        let vars = Layout::new(SegmentKind::Variable, &self.sizes);
        layers.check(n)?;
        vars.check(self.lo_costs_pert.len())?;

        let zeros = vec![0.0; n];
        let mut grad_lo_pert = Buffer::zeros(self.lo_costs_pert.len());
        let mut grad_hi_pert = Buffer::zeros(self.hi_costs_pert.len());
        {
            let lo = self.lo_costs.view("lo_costs")?;
            let hi = self.hi_costs.view("hi_costs")?;
            let g_lo = grad_lo.view("grad_lo_costs")?;
            let g_hi = grad_hi.view("grad_hi_costs")?;
            let g_lo_p = grad_lo_pert.view_mut("grad_lo_costs_pert")?;
            let g_hi_p = grad_hi_pert.view_mut("grad_hi_costs_pert")?;

            for (i, solver) in batch.solvers_mut().enumerate() {
                let r = layers.range(i);
                let v = vars.range(i);
                let context = format!("layers {:?}, variables {:?}", r, v);
                solver
                    .set_costs(&lo[r.clone()], &hi[r.clone()], &zeros[r.clone()])
                    .map_err(|e| Error::engine(i, "set_costs", context.clone(), e))?;
                solver
                    .grad_cost_perturbation(&g_lo[r.clone()], &g_hi[r], &mut g_lo_p[v.clone()], &mut g_hi_p[v])
                    .map_err(|e| Error::engine(i, "grad_cost_perturbation", context.clone(), e))?;
            }
        }

        ensure_finite(&[
            ("grad_lo_costs_pert", &grad_lo_pert),
            ("grad_hi_costs_pert", &grad_hi_pert),
            ("grad_lo_costs", &grad_lo),
            ("grad_hi_costs", &grad_hi),
        ])?;
        Ok(PerturbPrimalCostsGrads {
            lo_costs_pert: grad_lo_pert,
            hi_costs_pert: grad_hi_pert,
            lo_costs: grad_lo,
            hi_costs: grad_hi,
        })
    }
}
