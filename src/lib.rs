//! # bdd-diff: differentiable batched BDD dual solvers
//!
//! **`bdd-diff`** drives many independent BDD-based dual solvers through shared flat buffers,
//! and exposes every stateful solver computation as a differentiable operation with a hand-written backward pass.
//! This makes solver hyperparameters (per-layer distribution weights, damping factors) learnable from a downstream loss.
//!
//! ## How it works
//!
//! Each problem instance is owned by a [`SolverEngine`][crate::engine::SolverEngine]: an opaque object holding the
//! instance's BDD layers, costs and message-passing state. Solvers are collected into a [`Batch`][crate::layout::Batch],
//! and every batched buffer is the concatenation of one segment per solver:
//!
//! - **layer** buffers hold one value per BDD arc (`nr_layers()` per solver),
//! - **bdd** buffers hold one value per decision diagram (`nr_bdds()` per solver),
//! - **variable** buffers hold one value per primal variable plus one terminal slot (`nr_primal_variables() + 1`).
//!
//! ## Key Features
//!
//! - **Forward/backward pairs**: [`DualIterations`][crate::ops::dual_iterations::DualIterations],
//!   [`DistributeDeferredDelta`][crate::ops::deferred::DistributeDeferredDelta],
//!   [`ComputeAllMinMarginalsDiff`][crate::ops::min_marginals::ComputeAllMinMarginalsDiff],
//!   [`PerturbPrimalCosts`][crate::ops::perturb::PerturbPrimalCosts] and
//!   [`ComputeLowerBoundPerBdd`][crate::ops::lower_bound::ComputeLowerBoundPerBdd].
//!   Each `forward` returns a context that its `backward` consumes exactly once.
//! - **Truncated backpropagation**: gradients flow only through the trailing iterations a solver actually ran
//!   (see [`truncation`]).
//! - **Two damping shapes**: [`Omega`][crate::omega::Omega] is either one scalar for the whole batch or one value per layer.
//! - **Fail-fast checks**: buffer format, shapes and layouts are checked before any engine call,
//!   and every returned gradient is checked to be finite.
//!
//! ## Basic Usage
//!
//! ```rust
//! use bdd_diff::buffer::Buffer;
//! use bdd_diff::layout::Batch;
//! use bdd_diff::mock::MockSolver;
//! use bdd_diff::ops::lower_bound::ComputeLowerBoundPerBdd;
//!
//! // Two instances: 3 and 5 layers.
//! let mut batch = Batch::new(vec![
//!     MockSolver::new(2, &[&[0, 1]]),
//!     MockSolver::new(2, &[&[0], &[0, 1]]),
//! ]);
//!
//! let lo = Buffer::zeros(8);
//! let hi = Buffer::full(8, -1.0);
//! let (lb, ctx) = ComputeLowerBoundPerBdd::forward(&mut batch, lo, hi).unwrap();
//! assert_eq!(lb.len(), 3);
//!
//! let grads = ctx.backward(&mut batch, Some(Buffer::full(3, 1.0))).unwrap();
//! assert_eq!(grads.hi_costs.len(), 8);
//! ```

pub mod buffer;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod extract;
pub mod layout;
pub mod mock;
pub mod omega;
pub mod ops;
pub mod truncation;
