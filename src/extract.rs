//! Non-differentiable solution extraction.

use log::{debug, info};

use crate::buffer::{ensure_len, validate_input_format, Buffer};
use crate::config::RoundingConfig;
use crate::engine::SolverEngine;
use crate::error::{Error, Result};
use crate::layout::{Batch, SegmentKind};

/// Runs incremental primal rounding on every solver.
///
/// Returns one rounding result per solver, in batch order. The solvers keep
/// the costs left behind by rounding.
pub fn compute_primal_solution<S: SolverEngine>(
    batch: &mut Batch<S>,
    lo_costs: &Buffer,
    hi_costs: &Buffer,
    def_mm: &Buffer,
    config: &RoundingConfig,
) -> Result<Vec<S::Rounding>> {
    validate_input_format(&[("lo_costs", lo_costs), ("hi_costs", hi_costs), ("def_mm", def_mm)])?;
    let n = lo_costs.len();
    ensure_len("hi_costs", hi_costs, n)?;
    ensure_len("def_mm", def_mm, n)?;
    let layers = batch.resolve(SegmentKind::Layer, n)?;

    let lo = lo_costs.view("lo_costs")?;
    let hi = hi_costs.view("hi_costs")?;
    let def = def_mm.view("def_mm")?;
    let context = format!(
        "init_delta: {}, delta_growth_rate: {}, num_itr_lb: {}",
        config.init_delta, config.delta_growth_rate, config.num_itr_lb
    );

    let mut solutions = Vec::with_capacity(batch.len());
    for (i, solver) in batch.solvers_mut().enumerate() {
        let r = layers.range(i);
        debug!("primal rounding: solver {} on layers {:?}", i, r);
        solver
            .set_costs(&lo[r.clone()], &hi[r.clone()], &def[r])
            .map_err(|e| Error::engine(i, "set_costs", context.clone(), e))?;
        let solution = solver
            .primal_rounding_incremental(config.init_delta, config.delta_growth_rate, config.num_itr_lb)
            .map_err(|e| Error::engine(i, "primal_rounding_incremental", context.clone(), e))?;
        solutions.push(solution);
    }
    info!("primal rounding finished for {} solvers", solutions.len());
    Ok(solutions)
}

/// Per-layer hi-branch solution of every BDD, layer-segmented.
///
/// The output starts zeroed and is bound as the deferred min-marginals before
/// the engine writes the solution into it.
pub fn compute_per_bdd_solutions<S: SolverEngine>(
    batch: &mut Batch<S>,
    lo_costs: &Buffer,
    hi_costs: &Buffer,
) -> Result<Buffer> {
    validate_input_format(&[("lo_costs", lo_costs), ("hi_costs", hi_costs)])?;
    let n = lo_costs.len();
    ensure_len("hi_costs", hi_costs, n)?;
    let layers = batch.resolve(SegmentKind::Layer, n)?;

    let mut solution_hi = Buffer::zeros(n);
    {
        let lo = lo_costs.view("lo_costs")?;
        let hi = hi_costs.view("hi_costs")?;
        let out = solution_hi.view_mut("per_bdd_solution_hi")?;
        for (i, solver) in batch.solvers_mut().enumerate() {
            let r = layers.range(i);
            let context = format!("layers {:?}", r);
            solver
                .set_costs(&lo[r.clone()], &hi[r.clone()], &out[r.clone()])
                .map_err(|e| Error::engine(i, "set_costs", context.clone(), e))?;
            solver
                .solution_per_bdd(&mut out[r])
                .map_err(|e| Error::engine(i, "solution_per_bdd", context.clone(), e))?;
        }
    }
    Ok(solution_hi)
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::mock::MockSolver;

    fn batch() -> Batch<MockSolver> {
        Batch::new(vec![MockSolver::new(1, &[&[0]]), MockSolver::new(2, &[&[0, 1], &[1]])])
    }

    #[test]
    fn test_per_bdd_solutions() {
        let mut batch = batch();
        // Layers: [x0, T] | [x0, x1, T, x1, T]
        let lo = Buffer::from_vec(vec![0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
        let hi = Buffer::from_vec(vec![-1.0, 0.0, 2.0, -0.5, 0.0, 0.5, 0.0]);
        let sol = compute_per_bdd_solutions(&mut batch, &lo, &hi).unwrap();
        assert_eq!(sol.to_vec(), vec![1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_primal_solution_per_solver() {
        let mut batch = batch();
        let lo = Buffer::zeros(7);
        let hi = Buffer::from_vec(vec![-1.0, 0.0, 2.0, -0.5, 0.0, 0.5, 0.0]);
        let def = Buffer::zeros(7);
        let config = RoundingConfig {
            num_itr_lb: 50,
            ..RoundingConfig::default()
        };
        let solutions = compute_primal_solution(&mut batch, &lo, &hi, &def, &config).unwrap();
        assert_eq!(solutions.len(), 2);
        assert_eq!(solutions[0].assignment, vec![true]);
        assert_eq!(solutions[0].rounds, 0);
        // x1 sums to 0: ties are pushed towards the lo branch.
        assert_eq!(solutions[1].assignment, vec![false, false]);
    }

    #[test]
    fn test_primal_solution_layout_mismatch() {
        let mut batch = batch();
        let b = Buffer::zeros(6);
        let err = compute_primal_solution(&mut batch, &b, &b, &b, &RoundingConfig::default()).unwrap_err();
        assert!(matches!(err, Error::LayoutMismatch { segmented: 7, buffer_len: 6, .. }));
    }

    #[test]
    fn test_per_bdd_solution_failure_names_layers() {
        let mut batch = Batch::new(vec![
            MockSolver::new(1, &[&[0]]),
            MockSolver::new(2, &[&[0, 1], &[1]]).with_failure("solution_per_bdd"),
        ]);
        let b = Buffer::zeros(7);
        let err = compute_per_bdd_solutions(&mut batch, &b, &b).unwrap_err();
        match &err {
            Error::Engine { solver, op, context, .. } => {
                assert_eq!(*solver, 1);
                assert_eq!(*op, "solution_per_bdd");
                assert_eq!(context, "layers 2..7");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
