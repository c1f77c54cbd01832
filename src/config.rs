//! Parameters of dual iterations and primal rounding.

/// Parameters of [`DualIterations`][crate::ops::dual_iterations::DualIterations].
///
/// # Examples
///
/// ```
/// use bdd_diff::config::IterationConfig;
///
/// let config = IterationConfig {
///     num_iterations: 50,
///     grad_dual_itr_max_itr: 10,
///     ..IterationConfig::default()
/// };
/// assert_eq!(config.compute_history_for_itrs, 0);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct IterationConfig {
    /// Maximum number of dual iterations per solver (default: 20)
    pub num_iterations: usize,
    /// Number of trailing iterations that receive gradients (default: 5)
    pub grad_dual_itr_max_itr: usize,
    /// Relative lower-bound improvement under which a solver stops early (default: 1e-6)
    pub improvement_slope: f32,
    /// Checkpoint budget for the reverse sweep (default: 5)
    pub num_caches: usize,
    /// Trailing window of history statistics, 0 disables them (default: 0)
    pub compute_history_for_itrs: usize,
    /// Averaging factor of the solution history (default: 0.9)
    pub history_avg_beta: f32,
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            num_iterations: 20,
            grad_dual_itr_max_itr: 5,
            improvement_slope: 1e-6,
            num_caches: 5,
            compute_history_for_itrs: 0,
            history_avg_beta: 0.9,
        }
    }
}

impl IterationConfig {
    pub fn with_iterations(mut self, num_iterations: usize) -> Self {
        self.num_iterations = num_iterations;
        self
    }

    pub fn with_grad_window(mut self, grad_dual_itr_max_itr: usize) -> Self {
        self.grad_dual_itr_max_itr = grad_dual_itr_max_itr;
        self
    }

    pub fn with_history(mut self, window: usize, beta: f32) -> Self {
        self.compute_history_for_itrs = window;
        self.history_avg_beta = beta;
        self
    }

    pub fn has_history(&self) -> bool {
        self.compute_history_for_itrs > 0
    }
}

/// Parameters of incremental primal rounding.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundingConfig {
    /// Initial perturbation step (default: 1.0)
    pub init_delta: f32,
    /// Factor the step grows by each round (default: 1.2)
    pub delta_growth_rate: f32,
    /// Dual iterations run between rounds (default: 500)
    pub num_itr_lb: usize,
}

impl Default for RoundingConfig {
    fn default() -> Self {
        Self {
            init_delta: 1.0,
            delta_growth_rate: 1.2,
            num_itr_lb: 500,
        }
    }
}
