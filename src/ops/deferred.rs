//! Redistribution of deferred min-marginals into the costs.

use log::debug;

use crate::buffer::{ensure_len, validate_input_format, Buffer};
use crate::diagnostics::ensure_finite;
use crate::engine::SolverEngine;
use crate::error::{Error, Result};
use crate::layout::{Batch, Layout, SegmentKind, SolverSizes};
use crate::ops::incoming_grad;

#[derive(Debug, Clone, PartialEq)]
pub struct DistributeDeferredDeltaOutput {
    pub lo_costs: Buffer,
    pub hi_costs: Buffer,
    /// Deferred min-marginals after redistribution; zero for every solver.
    pub def_mm: Buffer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DistributeDeferredDeltaGrads {
    pub lo_costs: Buffer,
    pub hi_costs: Buffer,
    pub def_mm: Buffer,
}

#[derive(Debug)]
pub struct DistributeDeferredDeltaContext {
    lo_costs: Buffer,
    hi_costs: Buffer,
    def_mm: Buffer,
    sizes: Vec<SolverSizes>,
}

pub struct DistributeDeferredDelta;

impl DistributeDeferredDelta {
    pub fn forward<S: SolverEngine>(
        batch: &mut Batch<S>,
        lo_costs: Buffer,
        hi_costs: Buffer,
        def_mm: Buffer,
    ) -> Result<(DistributeDeferredDeltaOutput, DistributeDeferredDeltaContext)> {
        validate_input_format(&[("lo_costs", &lo_costs), ("hi_costs", &hi_costs), ("def_mm", &def_mm)])?;
        let n = lo_costs.len();
        ensure_len("hi_costs", &hi_costs, n)?;
        ensure_len("def_mm", &def_mm, n)?;
        let layers = batch.resolve(SegmentKind::Layer, n)?;

        let mut lo_out = Buffer::zeros(n);
        let mut hi_out = Buffer::zeros(n);
        let mut def_out = Buffer::zeros(n);
        {
            let lo = lo_costs.view("lo_costs")?;
            let hi = hi_costs.view("hi_costs")?;
            let def = def_mm.view("def_mm")?;
            let lo_o = lo_out.view_mut("lo_costs_out")?;
            let hi_o = hi_out.view_mut("hi_costs_out")?;
            let def_o = def_out.view_mut("def_mm_out")?;

            for (i, solver) in batch.solvers_mut().enumerate() {
                let r = layers.range(i);
                let context = format!("layers {:?}", r);
                debug!("distribute delta: solver {} on layers {:?}", i, r);
                solver
                    .set_costs(&lo[r.clone()], &hi[r.clone()], &def[r.clone()])
                    .map_err(|e| Error::engine(i, "set_costs", context.clone(), e))?;
                solver
                    .distribute_delta()
                    .map_err(|e| Error::engine(i, "distribute_delta", context.clone(), e))?;
                solver
                    .costs(&mut lo_o[r.clone()], &mut hi_o[r.clone()], &mut def_o[r])
                    .map_err(|e| Error::engine(i, "costs", context.clone(), e))?;
            }
        }

        let ctx = DistributeDeferredDeltaContext {
            lo_costs,
            hi_costs,
            def_mm,
            sizes: batch.sizes().to_vec(),
        };
        Ok((
            DistributeDeferredDeltaOutput {
                lo_costs: lo_out,
                hi_costs: hi_out,
                def_mm: def_out,
            },
            ctx,
        ))
    }
}

impl DistributeDeferredDeltaContext {
    /// The cost gradients pass through unchanged; the engine derives the
    /// gradient of the deferred input from them.
    pub fn backward<S: SolverEngine>(
        self,
        batch: &mut Batch<S>,
        grad_lo_costs: Option<Buffer>,
        grad_hi_costs: Option<Buffer>,
    ) -> Result<DistributeDeferredDeltaGrads> {
        batch.ensure_matches(&self.sizes)?;
        let n = self.lo_costs.len();
        let grad_lo = incoming_grad("grad_lo_costs", grad_lo_costs, n)?;
        let grad_hi = incoming_grad("grad_hi_costs", grad_hi_costs, n)?;
        let layers = Layout::new(SegmentKind::Layer, &self.sizes);
        layers.check(n)?;

        let mut grad_def = Buffer::zeros(n);
        {
            let lo = self.lo_costs.view("lo_costs")?;
            let hi = self.hi_costs.view("hi_costs")?;
            let def = self.def_mm.view("def_mm")?;
            let g_lo = grad_lo.view("grad_lo_costs")?;
            let g_hi = grad_hi.view("grad_hi_costs")?;
            let g_def = grad_def.view_mut("grad_def_mm")?;

            for (i, solver) in batch.solvers_mut().enumerate() {
                let r = layers.range(i);
                let context = format!("layers {:?}", r);
                solver
                    .set_costs(&lo[r.clone()], &hi[r.clone()], &def[r.clone()])
                    .map_err(|e| Error::engine(i, "set_costs", context.clone(), e))?;
                solver
                    .grad_distribute_delta(&g_lo[r.clone()], &g_hi[r.clone()], &mut g_def[r])
                    .map_err(|e| Error::engine(i, "grad_distribute_delta", context.clone(), e))?;
            }
        }

        ensure_finite(&[
            ("grad_lo_costs", &grad_lo),
            ("grad_hi_costs", &grad_hi),
            ("grad_def_mm", &grad_def),
        ])?;
        Ok(DistributeDeferredDeltaGrads {
            lo_costs: grad_lo,
            hi_costs: grad_hi,
            def_mm: grad_def,
        })
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::mock::MockSolver;

    fn batch() -> Batch<MockSolver> {
        Batch::new(vec![MockSolver::new(1, &[&[0]]), MockSolver::new(2, &[&[0, 1]])])
    }

    #[test]
    fn test_deferred_zero_after_forward() {
        let mut batch = batch();
        let def = Buffer::from_vec(vec![0.5, 0.0, -1.0, 2.0, 0.25]);
        let (out, _) = DistributeDeferredDelta::forward(
            &mut batch,
            Buffer::zeros(5),
            Buffer::full(5, 1.0),
            def,
        )
        .unwrap();
        assert_eq!(out.def_mm.to_vec(), vec![0.0; 5]);
        assert_eq!(out.hi_costs.to_vec(), vec![1.5, 1.0, 0.0, 3.0, 1.25]);
        assert_eq!(out.lo_costs.to_vec(), vec![0.0; 5]);
    }

    #[test]
    fn test_backward_passes_cost_grads_through() {
        let mut batch = batch();
        let (_, ctx) = DistributeDeferredDelta::forward(
            &mut batch,
            Buffer::zeros(5),
            Buffer::zeros(5),
            Buffer::zeros(5),
        )
        .unwrap();
        let g_lo = Buffer::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let g_hi = Buffer::from_vec(vec![-1.0, -2.0, -3.0, -4.0, -5.0]);
        let grads = ctx.backward(&mut batch, Some(g_lo.clone()), Some(g_hi.clone())).unwrap();
        assert_eq!(grads.lo_costs, g_lo);
        assert_eq!(grads.hi_costs, g_hi);
        assert_eq!(grads.def_mm, g_hi);
    }

    #[test]
    fn test_layout_checked() {
        let mut batch = batch();
        let err = DistributeDeferredDelta::forward(&mut batch, Buffer::zeros(4), Buffer::zeros(4), Buffer::zeros(4))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::LayoutMismatch {
                kind: SegmentKind::Layer,
                segmented: 5,
                buffer_len: 4
            }
        ));
    }

    #[test]
    fn test_non_finite_gradient_rejected() {
        let mut batch = batch();
        let (_, ctx) =
            DistributeDeferredDelta::forward(&mut batch, Buffer::zeros(5), Buffer::zeros(5), Buffer::zeros(5))
                .unwrap();
        let g_hi = Buffer::from_vec(vec![0.0, 0.0, f32::NAN, 0.0, 0.0]);
        let err = ctx.backward(&mut batch, None, Some(g_hi)).unwrap_err();
        assert!(matches!(
            err,
            Error::NonFiniteGradient {
                buffer: "grad_hi_costs",
                non_finite: 1,
                len: 5
            }
        ));
    }
}
