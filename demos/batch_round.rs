use clap::Parser;

use bdd_diff::buffer::Buffer;
use bdd_diff::config::{IterationConfig, RoundingConfig};
use bdd_diff::diagnostics::GradStats;
use bdd_diff::extract::compute_primal_solution;
use bdd_diff::layout::{Batch, SegmentKind};
use bdd_diff::mock::MockSolver;
use bdd_diff::omega::Omega;
use bdd_diff::ops::deferred::DistributeDeferredDelta;
use bdd_diff::ops::dual_iterations::{DualIterations, DualIterationsOutputGrads};
use bdd_diff::ops::lower_bound::ComputeLowerBoundPerBdd;

#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// Number of problem instances in the batch.
    #[arg(value_name = "INT", default_value = "4")]
    instances: usize,

    /// Number of primal variables per instance.
    #[clap(long, value_name = "INT", default_value = "6")]
    vars: usize,

    /// Maximum number of dual iterations.
    #[clap(long, value_name = "INT", default_value = "20")]
    iterations: usize,

    /// Number of trailing iterations that receive gradients.
    #[clap(long, value_name = "INT", default_value = "5")]
    grad_window: usize,

    /// Damping factor of the dual iterations.
    #[clap(long, value_name = "FLOAT", default_value = "0.5")]
    omega: f32,

    /// Use one damping factor per layer instead of a single scalar.
    #[clap(long)]
    per_layer_omega: bool,

    /// Run primal rounding after the gradient round.
    #[clap(long)]
    round: bool,
}

/// Instance `k` gets three overlapping chain BDDs over `vars` variables.
fn make_instance(k: usize, vars: usize) -> MockSolver {
    let all: Vec<usize> = (0..vars).collect();
    let evens: Vec<usize> = (0..vars).step_by(2).collect();
    let tail: Vec<usize> = (vars / 2..vars).collect();
    let solver = MockSolver::new(vars, &[all.as_slice(), evens.as_slice(), tail.as_slice()]);
    // Every other instance converges early, so the replay windows differ.
    if k % 2 == 1 {
        solver.with_iteration_limit(3 + k)
    } else {
        solver
    }
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let time_total = std::time::Instant::now();

    let args = Cli::parse();
    println!("args = {:?}", args);

    let mut batch = Batch::new((0..args.instances).map(|k| make_instance(k, args.vars)).collect());
    println!("batch = {:?}", batch);

    let n = batch.total(SegmentKind::Layer);
    let lo = Buffer::zeros(n);
    let hi = Buffer::from_vec((0..n).map(|l| ((l * 7 % 11) as f32 - 5.0) / 3.0).collect());
    let def_mm = Buffer::zeros(n);
    let dist_weights = Buffer::from_vec(batch.solvers().iter().flat_map(|s| s.uniform_weights()).collect());
    let omega = if args.per_layer_omega {
        Omega::PerLayer(Buffer::full(n, args.omega))
    } else {
        Omega::Scalar(args.omega)
    };
    let config = IterationConfig::default()
        .with_iterations(args.iterations)
        .with_grad_window(args.grad_window);

    // Forward: dual iterations, redistribution, per-BDD lower bounds.
    let time_forward = std::time::Instant::now();
    let (dual, dual_ctx) = DualIterations::forward(&mut batch, lo.clone(), hi.clone(), def_mm.clone(), dist_weights, omega, &config)?;
    println!("realized iterations: {:?}", dual_ctx.actual_num_itr());
    let (dist, dist_ctx) = DistributeDeferredDelta::forward(&mut batch, dual.lo_costs, dual.hi_costs, dual.def_mm)?;
    let (lb, lb_ctx) = ComputeLowerBoundPerBdd::forward(&mut batch, dist.lo_costs.clone(), dist.hi_costs.clone())?;
    let total_lb: f32 = lb.to_vec().iter().sum();
    println!("lower bound = {} in {:.3} ms", total_lb, time_forward.elapsed().as_secs_f64() * 1000.0);

    // Backward: maximize the total lower bound.
    let time_backward = std::time::Instant::now();
    let lb_grads = lb_ctx.backward(&mut batch, Some(Buffer::full(lb.len(), 1.0)))?;
    let dist_grads = dist_ctx.backward(&mut batch, Some(lb_grads.lo_costs), Some(lb_grads.hi_costs))?;
    let dual_grads = dual_ctx.backward(
        &mut batch,
        DualIterationsOutputGrads {
            lo_costs: Some(dist_grads.lo_costs),
            hi_costs: Some(dist_grads.hi_costs),
            def_mm: Some(dist_grads.def_mm),
            sol_avg: None,
        },
    )?;
    println!("backward in {:.3} ms", time_backward.elapsed().as_secs_f64() * 1000.0);

    println!("grad dist_weights: {:?}", GradStats::of(&dual_grads.dist_weights.to_vec()));
    println!("grad omega: {:?}", GradStats::of(&dual_grads.omega.into_buffer().to_vec()));
    for (i, solver) in batch.solvers().iter().enumerate() {
        println!("solver {}: replays {:?}", i, solver.replays());
    }

    if args.round {
        let time_round = std::time::Instant::now();
        let solutions = compute_primal_solution(&mut batch, &lo, &hi, &def_mm, &RoundingConfig::default())?;
        for (i, solution) in solutions.iter().enumerate() {
            println!(
                "solver {}: assignment {:?} after {} rounds (lb = {})",
                i, solution.assignment, solution.rounds, solution.lower_bound
            );
        }
        println!("rounding in {:.3} s", time_round.elapsed().as_secs_f64());
    }

    println!("\nAll done in {:.3} s", time_total.elapsed().as_secs_f64());

    Ok(())
}
