//! Min-marginal differences of every layer.
//!
//! Deferred min-marginals must have been redistributed before the forward
//! pass; both passes bind a zero deferred buffer.

use log::debug;

use crate::buffer::{ensure_len, validate_input_format, Buffer};
use crate::diagnostics::ensure_finite;
use crate::engine::SolverEngine;
use crate::error::{Error, Result};
use crate::layout::{Batch, Layout, SegmentKind, SolverSizes};
use crate::ops::incoming_grad;

#[derive(Debug, Clone, PartialEq)]
pub struct MinMarginalsGrads {
    pub lo_costs: Buffer,
    pub hi_costs: Buffer,
}

#[derive(Debug)]
pub struct MinMarginalsContext {
    lo_costs: Buffer,
    hi_costs: Buffer,
    sizes: Vec<SolverSizes>,
}

pub struct ComputeAllMinMarginalsDiff;

impl ComputeAllMinMarginalsDiff {
    /// Returns the layer-segmented `hi - lo` min-marginal differences.
    pub fn forward<S: SolverEngine>(
        batch: &mut Batch<S>,
        lo_costs: Buffer,
        hi_costs: Buffer,
    ) -> Result<(Buffer, MinMarginalsContext)> {
        validate_input_format(&[("lo_costs", &lo_costs), ("hi_costs", &hi_costs)])?;
        let n = lo_costs.len();
        ensure_len("hi_costs", &hi_costs, n)?;
        let layers = batch.resolve(SegmentKind::Layer, n)?;

        let zeros = vec![0.0; n];
        let mut mm_diff = Buffer::zeros(n);
        {
            let lo = lo_costs.view("lo_costs")?;
            let hi = hi_costs.view("hi_costs")?;
            let out = mm_diff.view_mut("mm_diff")?;
            for (i, solver) in batch.solvers_mut().enumerate() {
                let r = layers.range(i);
                let context = format!("layers {:?}", r);
                debug!("min-marginal differences: solver {} on layers {:?}", i, r);
                solver
                    .set_costs(&lo[r.clone()], &hi[r.clone()], &zeros[r.clone()])
                    .map_err(|e| Error::engine(i, "set_costs", context.clone(), e))?;
                solver
                    .all_min_marginal_differences(&mut out[r])
                    .map_err(|e| Error::engine(i, "all_min_marginal_differences", context.clone(), e))?;
            }
        }

        let ctx = MinMarginalsContext {
            lo_costs,
            hi_costs,
            sizes: batch.sizes().to_vec(),
        };
        Ok((mm_diff, ctx))
    }
}

impl MinMarginalsContext {
    pub fn backward<S: SolverEngine>(self, batch: &mut Batch<S>, grad_mm_diff: Option<Buffer>) -> Result<MinMarginalsGrads> {
        batch.ensure_matches(&self.sizes)?;
        let n = self.lo_costs.len();
        let grad_mm = incoming_grad("grad_mm_diff", grad_mm_diff, n)?;
        let layers = Layout::new(SegmentKind::Layer, &self.sizes);
        layers.check(n)?;

        let zeros = vec![0.0; n];
        let mut grad_lo = Buffer::zeros(n);
        let mut grad_hi = Buffer::zeros(n);
        {
            let lo = self.lo_costs.view("lo_costs")?;
            let hi = self.hi_costs.view("hi_costs")?;
            let g_mm = grad_mm.view("grad_mm_diff")?;
            let g_lo = grad_lo.view_mut("grad_lo_costs")?;
            let g_hi = grad_hi.view_mut("grad_hi_costs")?;
            for (i, solver) in batch.solvers_mut().enumerate() {
                let r = layers.range(i);
                let context = format!("layers {:?}", r);
                solver
                    .set_costs(&lo[r.clone()], &hi[r.clone()], &zeros[r.clone()])
                    .map_err(|e| Error::engine(i, "set_costs", context.clone(), e))?;
                solver
                    .grad_all_min_marginal_differences(&g_mm[r.clone()], &mut g_lo[r.clone()], &mut g_hi[r])
                    .map_err(|e| Error::engine(i, "grad_all_min_marginal_differences", context.clone(), e))?;
            }
        }

        ensure_finite(&[("grad_lo_costs", &grad_lo), ("grad_hi_costs", &grad_hi)])?;
        Ok(MinMarginalsGrads {
            lo_costs: grad_lo,
            hi_costs: grad_hi,
        })
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::mock::MockSolver;

    #[test]
    fn test_mm_diff_forward_backward() {
        let mut batch = Batch::new(vec![MockSolver::new(1, &[&[0]]), MockSolver::new(1, &[&[0]])]);
        let lo = Buffer::from_vec(vec![1.0, 0.0, 2.0, 0.0]);
        let hi = Buffer::from_vec(vec![3.0, 0.0, -1.0, 0.5]);
        let (mm, ctx) = ComputeAllMinMarginalsDiff::forward(&mut batch, lo, hi).unwrap();
        assert_eq!(mm.to_vec(), vec![2.0, 0.0, -3.0, 0.5]);

        let grads = ctx
            .backward(&mut batch, Some(Buffer::from_vec(vec![1.0, 2.0, 3.0, 4.0])))
            .unwrap();
        assert_eq!(grads.lo_costs.to_vec(), vec![-1.0, -2.0, -3.0, -4.0]);
        assert_eq!(grads.hi_costs.to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_wrong_format_rejected() {
        let mut batch = Batch::new(vec![MockSolver::new(1, &[&[0]])]);
        let err = ComputeAllMinMarginalsDiff::forward(&mut batch, Buffer::zeros(2), Buffer::strided(vec![0.0; 4], 2))
            .unwrap_err();
        assert!(matches!(err, Error::Format { buffer: "hi_costs", .. }));
    }
}
