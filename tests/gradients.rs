//! Gradient checks of the batched operations.
//!
//! Analytic gradients are compared with central finite differences, and the
//! truncated replay is checked against the iteration counts each solver
//! actually ran.

use bdd_diff::buffer::Buffer;
use bdd_diff::config::IterationConfig;
use bdd_diff::layout::Batch;
use bdd_diff::mock::{MockSolver, Replay};
use bdd_diff::omega::{Omega, OmegaGrad};
use bdd_diff::ops::deferred::DistributeDeferredDelta;
use bdd_diff::ops::dual_iterations::{DualIterations, DualIterationsGrads, DualIterationsOutputGrads};
use bdd_diff::ops::lower_bound::ComputeLowerBoundPerBdd;
use test_log::test;

const EPS: f32 = 1e-2;

// Layers: [x0, x1, T] | [x0, T, x0, x1, T]
const LO: [f32; 8] = [1.0, -0.5, 2.0, 0.0, 1.5, -1.0, 0.5, 3.0];
const HI: [f32; 8] = [0.0, 0.5, -1.0, 1.0, 0.5, 0.0, -0.5, 2.0];
const DEF: [f32; 8] = [0.1, -0.2, 0.0, 0.3, 0.0, -0.1, 0.2, 0.0];

fn batch() -> Batch<MockSolver> {
    Batch::new(vec![
        MockSolver::new(2, &[&[0, 1]]),
        MockSolver::new(2, &[&[0], &[0, 1]]),
    ])
}

fn weights(batch: &Batch<MockSolver>) -> Vec<f32> {
    batch.solvers().iter().flat_map(|s| s.uniform_weights()).collect()
}

fn assert_close(name: &str, analytic: f32, numeric: f32, tol: f32) {
    let scale = 1.0f32.max(analytic.abs()).max(numeric.abs());
    assert!(
        (analytic - numeric).abs() <= tol * scale,
        "{}: analytic {} vs numeric {}",
        name,
        analytic,
        numeric
    );
}

/// Central difference of `f` w.r.t. entry `i` of `x`.
fn central_diff(x: &[f32], i: usize, mut f: impl FnMut(&[f32]) -> f32) -> f32 {
    let mut plus = x.to_vec();
    plus[i] += EPS;
    let mut minus = x.to_vec();
    minus[i] -= EPS;
    (f(&plus) - f(&minus)) / (2.0 * EPS)
}

// ─── Lower bound ───────────────────────────────────────────────────────────────

fn lb_loss(batch: &mut Batch<MockSolver>, lo: &[f32], hi: &[f32], c: &[f32]) -> f32 {
    let (lb, _) = ComputeLowerBoundPerBdd::forward(batch, Buffer::from_vec(lo.to_vec()), Buffer::from_vec(hi.to_vec())).unwrap();
    lb.to_vec().iter().zip(c).map(|(x, c)| x * c).sum()
}

#[test]
fn lower_bound_matches_finite_differences() {
    let mut batch = batch();
    let c = [1.0, -2.0, 0.5];
    let (_, ctx) = ComputeLowerBoundPerBdd::forward(&mut batch, Buffer::from_vec(LO.to_vec()), Buffer::from_vec(HI.to_vec())).unwrap();
    let grads = ctx.backward(&mut batch, Some(Buffer::from_vec(c.to_vec()))).unwrap();
    let g_lo = grads.lo_costs.to_vec();
    let g_hi = grads.hi_costs.to_vec();

    for l in 0..8 {
        let num_lo = central_diff(&LO, l, |lo| lb_loss(&mut batch, lo, &HI, &c));
        assert_close(&format!("lo[{}]", l), g_lo[l], num_lo, 1e-3);
        let num_hi = central_diff(&HI, l, |hi| lb_loss(&mut batch, &LO, hi, &c));
        assert_close(&format!("hi[{}]", l), g_hi[l], num_hi, 1e-3);
    }
}

// ─── Dual iterations ───────────────────────────────────────────────────────────

/// Fixed linear loss over the outputs of the dual iterations.
struct LinearLoss {
    a: Vec<f32>,
    b: Vec<f32>,
    c: Vec<f32>,
}

impl LinearLoss {
    fn new() -> Self {
        Self {
            a: vec![0.5, -1.0, 0.0, 2.0, 1.0, -0.5, 0.25, 0.0],
            b: vec![1.0, 0.0, -0.5, 0.5, 0.0, 1.5, -1.0, 0.0],
            c: vec![1.0, 2.0, -1.0, -0.5, 0.5, 1.0, -2.0, 0.75],
        }
    }

    fn grads(&self) -> DualIterationsOutputGrads {
        DualIterationsOutputGrads {
            lo_costs: Some(Buffer::from_vec(self.a.clone())),
            hi_costs: Some(Buffer::from_vec(self.b.clone())),
            def_mm: Some(Buffer::from_vec(self.c.clone())),
            sol_avg: None,
        }
    }
}

#[derive(Clone)]
struct Point {
    lo: Vec<f32>,
    hi: Vec<f32>,
    def: Vec<f32>,
    w: Vec<f32>,
    omega: f32,
}

fn config(num_iterations: usize, window: usize) -> IterationConfig {
    IterationConfig {
        num_iterations,
        grad_dual_itr_max_itr: window,
        improvement_slope: 0.0,
        ..IterationConfig::default()
    }
}

fn dual_forward_backward(
    batch: &mut Batch<MockSolver>,
    p: &Point,
    omega: Omega,
    config: &IterationConfig,
    loss: &LinearLoss,
) -> DualIterationsGrads {
    let (_, ctx) = DualIterations::forward(
        batch,
        Buffer::from_vec(p.lo.clone()),
        Buffer::from_vec(p.hi.clone()),
        Buffer::from_vec(p.def.clone()),
        Buffer::from_vec(p.w.clone()),
        omega,
        config,
    )
    .unwrap();
    ctx.backward(batch, loss.grads()).unwrap()
}

fn dual_loss(batch: &mut Batch<MockSolver>, p: &Point, config: &IterationConfig, loss: &LinearLoss) -> f32 {
    let (out, _) = DualIterations::forward(
        batch,
        Buffer::from_vec(p.lo.clone()),
        Buffer::from_vec(p.hi.clone()),
        Buffer::from_vec(p.def.clone()),
        Buffer::from_vec(p.w.clone()),
        Omega::Scalar(p.omega),
        config,
    )
    .unwrap();
    let dot = |x: &Buffer, y: &[f32]| x.to_vec().iter().zip(y).map(|(x, y)| x * y).sum::<f32>();
    dot(&out.lo_costs, &loss.a) + dot(&out.hi_costs, &loss.b) + dot(&out.def_mm, &loss.c)
}

fn point(batch: &Batch<MockSolver>) -> Point {
    // Slightly uneven weights so every weight gradient is exercised.
    let w = weights(batch)
        .iter()
        .enumerate()
        .map(|(l, w)| w * (1.0 + 0.05 * l as f32))
        .collect();
    Point {
        lo: LO.to_vec(),
        hi: HI.to_vec(),
        def: DEF.to_vec(),
        w,
        omega: 0.3,
    }
}

#[test]
fn dual_iterations_match_finite_differences() {
    let mut batch = batch();
    let loss = LinearLoss::new();
    let p = point(&batch);
    let config = config(4, 4);
    let grads = dual_forward_backward(&mut batch, &p, Omega::Scalar(p.omega), &config, &loss);

    let g_lo = grads.lo_costs.to_vec();
    let g_hi = grads.hi_costs.to_vec();
    let g_def = grads.def_mm.to_vec();
    let g_w = grads.dist_weights.to_vec();
    let tol = 2e-2;

    for l in 0..8 {
        let num = central_diff(&p.lo, l, |lo| {
            let q = Point { lo: lo.to_vec(), ..p.clone() };
            dual_loss(&mut batch, &q, &config, &loss)
        });
        assert_close(&format!("lo[{}]", l), g_lo[l], num, tol);

        let num = central_diff(&p.hi, l, |hi| {
            let q = Point { hi: hi.to_vec(), ..p.clone() };
            dual_loss(&mut batch, &q, &config, &loss)
        });
        assert_close(&format!("hi[{}]", l), g_hi[l], num, tol);

        let num = central_diff(&p.def, l, |def| {
            let q = Point { def: def.to_vec(), ..p.clone() };
            dual_loss(&mut batch, &q, &config, &loss)
        });
        assert_close(&format!("def_mm[{}]", l), g_def[l], num, tol);

        let num = central_diff(&p.w, l, |w| {
            let q = Point { w: w.to_vec(), ..p.clone() };
            dual_loss(&mut batch, &q, &config, &loss)
        });
        assert_close(&format!("dist_weights[{}]", l), g_w[l], num, tol);
    }

    let num = central_diff(&[p.omega], 0, |omega| {
        let q = Point { omega: omega[0], ..p.clone() };
        dual_loss(&mut batch, &q, &config, &loss)
    });
    let g_omega = grads.omega.as_scalar().unwrap();
    assert_close("omega", g_omega, num, tol);
}

#[test]
fn scalar_and_per_layer_omega_agree() {
    let mut batch = batch();
    let loss = LinearLoss::new();
    let p = point(&batch);
    let config = config(5, 3);

    let scalar = dual_forward_backward(&mut batch, &p, Omega::Scalar(p.omega), &config, &loss);
    let per_layer = dual_forward_backward(&mut batch, &p, Omega::PerLayer(Buffer::full(8, p.omega)), &config, &loss);

    assert_eq!(scalar.lo_costs, per_layer.lo_costs);
    assert_eq!(scalar.hi_costs, per_layer.hi_costs);
    assert_eq!(scalar.def_mm, per_layer.def_mm);
    assert_eq!(scalar.dist_weights, per_layer.dist_weights);

    let total: f32 = match per_layer.omega {
        OmegaGrad::PerLayer(g) => g.to_vec().iter().sum(),
        OmegaGrad::Scalar(_) => panic!("per-layer omega must get a per-layer gradient"),
    };
    assert_close("omega", scalar.omega.as_scalar().unwrap(), total, 1e-4);
}

#[test]
fn scalar_and_per_layer_omega_give_same_lower_bound() {
    let p = point(&batch());
    let mut lbs = Vec::new();
    for omega in [Omega::Scalar(0.4), Omega::PerLayer(Buffer::full(8, 0.4))] {
        let mut batch = batch();
        let (out, _) = DualIterations::forward(
            &mut batch,
            Buffer::from_vec(p.lo.clone()),
            Buffer::from_vec(p.hi.clone()),
            Buffer::from_vec(p.def.clone()),
            Buffer::from_vec(p.w.clone()),
            omega,
            &config(6, 6),
        )
        .unwrap();
        let (dist, _) = DistributeDeferredDelta::forward(&mut batch, out.lo_costs, out.hi_costs, out.def_mm).unwrap();
        let (lb, _) = ComputeLowerBoundPerBdd::forward(&mut batch, dist.lo_costs, dist.hi_costs).unwrap();
        lbs.push(lb);
    }
    assert_eq!(lbs[0], lbs[1]);
}

// ─── Truncation ────────────────────────────────────────────────────────────────

#[test]
fn replay_follows_realized_iterations() {
    // Solver 0 converges after 20 of the 50 requested iterations.
    let mut batch = Batch::new(vec![
        MockSolver::new(2, &[&[0, 1]]).with_iteration_limit(20),
        MockSolver::new(2, &[&[0], &[0, 1]]),
    ]);
    let p = point(&batch);
    let config = config(50, 10);
    let (_, ctx) = DualIterations::forward(
        &mut batch,
        Buffer::from_vec(p.lo.clone()),
        Buffer::from_vec(p.hi.clone()),
        Buffer::from_vec(p.def.clone()),
        Buffer::from_vec(p.w.clone()),
        Omega::Scalar(0.5),
        &config,
    )
    .unwrap();
    assert_eq!(ctx.actual_num_itr(), &[20, 50]);

    ctx.backward(&mut batch, LinearLoss::new().grads()).unwrap();
    assert_eq!(
        batch.solver(0).replays(),
        &[Replay {
            skip: 10,
            tracked: 10,
            num_caches: 5
        }]
    );
    assert_eq!(
        batch.solver(1).replays(),
        &[Replay {
            skip: 40,
            tracked: 10,
            num_caches: 5
        }]
    );
}

#[test]
fn chained_blocks_replay_in_reverse() {
    // Two dual-iteration blocks on the same batch, run back to back with
    // different iteration counts, then differentiated in reverse order.
    let loss = LinearLoss::new();
    let mut shared = batch();
    let p = point(&shared);
    let (first, first_ctx) = DualIterations::forward(
        &mut shared,
        Buffer::from_vec(p.lo.clone()),
        Buffer::from_vec(p.hi.clone()),
        Buffer::from_vec(p.def.clone()),
        Buffer::from_vec(p.w.clone()),
        Omega::Scalar(p.omega),
        &config(6, 5),
    )
    .unwrap();
    let (_, second_ctx) = DualIterations::forward(
        &mut shared,
        first.lo_costs,
        first.hi_costs,
        first.def_mm,
        Buffer::from_vec(p.w.clone()),
        Omega::Scalar(p.omega),
        &config(3, 5),
    )
    .unwrap();
    assert_eq!(first_ctx.actual_num_itr(), &[6, 6]);
    assert_eq!(second_ctx.actual_num_itr(), &[3, 3]);

    let second = second_ctx.backward(&mut shared, loss.grads()).unwrap();
    let incoming = || DualIterationsOutputGrads {
        lo_costs: Some(second.lo_costs.clone()),
        hi_costs: Some(second.hi_costs.clone()),
        def_mm: Some(second.def_mm.clone()),
        sol_avg: None,
    };
    let chained = first_ctx.backward(&mut shared, incoming()).unwrap();
    for solver in shared.solvers() {
        assert_eq!(
            solver.replays(),
            &[
                Replay {
                    skip: 0,
                    tracked: 3,
                    num_caches: 5
                },
                Replay {
                    skip: 1,
                    tracked: 5,
                    num_caches: 5
                },
            ]
        );
        assert_eq!(solver.last_run(), None);
    }

    // The first block differentiates as if it had run alone.
    let mut alone = batch();
    let (_, ctx) = DualIterations::forward(
        &mut alone,
        Buffer::from_vec(p.lo.clone()),
        Buffer::from_vec(p.hi.clone()),
        Buffer::from_vec(p.def.clone()),
        Buffer::from_vec(p.w.clone()),
        Omega::Scalar(p.omega),
        &config(6, 5),
    )
    .unwrap();
    let reference = ctx.backward(&mut alone, incoming()).unwrap();
    assert_eq!(chained, reference);
}

#[test]
fn wide_window_is_full_gradient() {
    let loss = LinearLoss::new();
    let p = point(&batch());
    let exact = dual_forward_backward(&mut batch(), &p, Omega::Scalar(p.omega), &config(6, 6), &loss);
    let wide = dual_forward_backward(&mut batch(), &p, Omega::Scalar(p.omega), &config(6, 1000), &loss);
    assert_eq!(exact, wide);
}

#[test]
fn narrow_window_drops_early_iterations() {
    let loss = LinearLoss::new();
    let p = point(&batch());
    let full = dual_forward_backward(&mut batch(), &p, Omega::Scalar(p.omega), &config(6, 6), &loss);
    let narrow = dual_forward_backward(&mut batch(), &p, Omega::Scalar(p.omega), &config(6, 2), &loss);
    assert_ne!(full.dist_weights, narrow.dist_weights);
}

#[test]
fn empty_window_passes_gradients_through() {
    let loss = LinearLoss::new();
    let mut batch = batch();
    let p = point(&batch);
    let grads = dual_forward_backward(&mut batch, &p, Omega::Scalar(p.omega), &config(6, 0), &loss);

    assert_eq!(grads.lo_costs.to_vec(), loss.a);
    assert_eq!(grads.hi_costs.to_vec(), loss.b);
    assert_eq!(grads.def_mm.to_vec(), loss.c);
    assert_eq!(grads.dist_weights.to_vec(), vec![0.0; 8]);
    assert_eq!(grads.omega, OmegaGrad::Scalar(0.0));
    assert!(batch.solvers().iter().all(|s| s.replays()[0].tracked == 0));
}

#[test]
fn checkpoint_budget_does_not_change_gradients() {
    let loss = LinearLoss::new();
    let p = point(&batch());
    let reference = dual_forward_backward(&mut batch(), &p, Omega::Scalar(p.omega), &config(8, 8), &loss);
    for num_caches in [1, 3, 16] {
        let config = IterationConfig {
            num_caches,
            ..config(8, 8)
        };
        let grads = dual_forward_backward(&mut batch(), &p, Omega::Scalar(p.omega), &config, &loss);
        assert_eq!(grads, reference);
    }
}
