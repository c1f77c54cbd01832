//! Lower bound of every BDD.

use log::debug;

use crate::buffer::{ensure_len, validate_input_format, Buffer};
use crate::diagnostics::ensure_finite;
use crate::engine::SolverEngine;
use crate::error::{Error, Result};
use crate::layout::{Batch, Layout, SegmentKind, SolverSizes};
use crate::ops::incoming_grad;

#[derive(Debug, Clone, PartialEq)]
pub struct LowerBoundGrads {
    pub lo_costs: Buffer,
    pub hi_costs: Buffer,
}

#[derive(Debug)]
pub struct LowerBoundContext {
    lo_costs: Buffer,
    hi_costs: Buffer,
    sizes: Vec<SolverSizes>,
}

pub struct ComputeLowerBoundPerBdd;

impl ComputeLowerBoundPerBdd {
    /// Returns the bdd-segmented lower bounds.
    pub fn forward<S: SolverEngine>(
        batch: &mut Batch<S>,
        lo_costs: Buffer,
        hi_costs: Buffer,
    ) -> Result<(Buffer, LowerBoundContext)> {
        validate_input_format(&[("lo_costs", &lo_costs), ("hi_costs", &hi_costs)])?;
        let n = lo_costs.len();
        ensure_len("hi_costs", &hi_costs, n)?;
        let layers = batch.resolve(SegmentKind::Layer, n)?;
        let bdds = batch.resolve(SegmentKind::Bdd, batch.total(SegmentKind::Bdd))?;

        let zeros = vec![0.0; n];
        let mut lb = Buffer::zeros(bdds.total());
        {
            let lo = lo_costs.view("lo_costs")?;
            let hi = hi_costs.view("hi_costs")?;
            let out = lb.view_mut("lb_per_bdd")?;
            for (i, solver) in batch.solvers_mut().enumerate() {
                let r = layers.range(i);
                let b = bdds.range(i);
                let context = format!("layers {:?}, bdds {:?}", r, b);
                debug!("lower bound: solver {} on layers {:?}, bdds {:?}", i, r, b);
                solver
                    .set_costs(&lo[r.clone()], &hi[r.clone()], &zeros[r])
                    .map_err(|e| Error::engine(i, "set_costs", context.clone(), e))?;
                solver
                    .lower_bound_per_bdd(&mut out[b])
                    .map_err(|e| Error::engine(i, "lower_bound_per_bdd", context.clone(), e))?;
            }
        }

        let ctx = LowerBoundContext {
            lo_costs,
            hi_costs,
            sizes: batch.sizes().to_vec(),
        };
        Ok((lb, ctx))
    }
}

impl LowerBoundContext {
    pub fn backward<S: SolverEngine>(self, batch: &mut Batch<S>, grad_lb_per_bdd: Option<Buffer>) -> Result<LowerBoundGrads> {
        batch.ensure_matches(&self.sizes)?;
        let n = self.lo_costs.len();
        let layers = Layout::new(SegmentKind::Layer, &self.sizes);
        let bdds = Layout::new(SegmentKind::Bdd, &self.sizes);
        layers.check(n)?;
        // Gradients arriving as strided views are packed first.
        let grad_lb = incoming_grad(
            "grad_lb_per_bdd",
            grad_lb_per_bdd.map(|g| if g.is_contiguous() { g } else { g.to_contiguous() }),
            bdds.total(),
        )?;

        // `lo` only receives contributions from the engine, `hi` is overwritten.
        let mut grad_lo = Buffer::zeros(n);
        let mut grad_hi = Buffer::zeros(n);
        {
            let lo = self.lo_costs.view("lo_costs")?;
            let hi = self.hi_costs.view("hi_costs")?;
            let g_lb = grad_lb.view("grad_lb_per_bdd")?;
            let g_lo = grad_lo.view_mut("grad_lo_costs")?;
            let g_hi = grad_hi.view_mut("grad_hi_costs")?;
            for (i, solver) in batch.solvers_mut().enumerate() {
                let r = layers.range(i);
                let b = bdds.range(i);
                let context = format!("layers {:?}, bdds {:?}", r, b);
                // The zeroed `lo` gradient doubles as the deferred min-marginals.
                solver
                    .set_costs(&lo[r.clone()], &hi[r.clone()], &g_lo[r.clone()])
                    .map_err(|e| Error::engine(i, "set_costs", context.clone(), e))?;
                solver
                    .grad_lower_bound_per_bdd(&g_lb[b], &mut g_lo[r.clone()], &mut g_hi[r])
                    .map_err(|e| Error::engine(i, "grad_lower_bound_per_bdd", context.clone(), e))?;
            }
        }

        ensure_finite(&[("grad_lo_costs", &grad_lo), ("grad_hi_costs", &grad_hi)])?;
        Ok(LowerBoundGrads {
            lo_costs: grad_lo,
            hi_costs: grad_hi,
        })
    }
}
