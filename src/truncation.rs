//! Truncated backpropagation through dual iterations.
//!
//! The forward pass of a solver may run fewer iterations than requested. Its
//! backward pass replays exactly the iterations that actually ran, and only
//! the trailing `min(actual, grad_dual_itr_max_itr)` of them carry gradients.
//! The earlier ones are replayed as constants.

use std::cmp::min;
use std::fmt;

/// Split of one solver's realized iterations for the gradient replay.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TruncationWindow {
    /// Iterations replayed without gradient tracking.
    pub skip: usize,
    /// Trailing iterations replayed with gradient tracking.
    pub tracked: usize,
}

impl TruncationWindow {
    pub fn new(actual_num_itr: usize, grad_dual_itr_max_itr: usize) -> Self {
        let tracked = min(actual_num_itr, grad_dual_itr_max_itr);
        Self {
            skip: actual_num_itr - tracked,
            tracked,
        }
    }

    /// Number of iterations replayed in total; equals the realized count.
    pub fn total(&self) -> usize {
        self.skip + self.tracked
    }

    /// Whether gradients flow through every realized iteration.
    pub fn is_full(&self) -> bool {
        self.skip == 0
    }
}

impl fmt::Display for TruncationWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "num_iterations: {}, track_grad_for_num_itr: {}, track_grad_after_itr: {}",
            self.total(),
            self.tracked,
            self.skip
        )
    }
}

/// Windows for every solver of a batch, in batch order.
pub fn plan(actual_num_itr: &[usize], grad_dual_itr_max_itr: usize) -> Vec<TruncationWindow> {
    actual_num_itr
        .iter()
        .map(|&n| TruncationWindow::new(n, grad_dual_itr_max_itr))
        .collect()
}
