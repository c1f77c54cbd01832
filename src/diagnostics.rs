//! Gradient sanity checks.
//!
//! [`ensure_finite`] is part of every backward pass and fails the call.
//! [`log_grad_stats`] only observes: it reports per-solver gradient statistics
//! through the `log` facade and never changes the outcome of a call.

use log::{debug, log_enabled, warn, Level};

use crate::buffer::Buffer;
use crate::error::{Error, Result};

/// Magnitude above which a gradient entry is reported as large.
pub const LARGE_GRADIENT: f32 = 1e3;

/// Summary of one gradient segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradStats {
    pub mean: f32,
    pub std: f32,
    pub min: f32,
    pub max: f32,
    pub non_finite: usize,
    pub len: usize,
}

impl GradStats {
    /// Statistics over the finite entries of `values`.
    pub fn of(values: &[f32]) -> Self {
        let finite: Vec<f32> = values.iter().copied().filter(|x| x.is_finite()).collect();
        let n = finite.len();
        let non_finite = values.len() - n;
        if n == 0 {
            return Self {
                mean: 0.0,
                std: 0.0,
                min: 0.0,
                max: 0.0,
                non_finite,
                len: values.len(),
            };
        }
        let mean = finite.iter().sum::<f32>() / n as f32;
        // Unbiased sample deviation.
        let std = if n > 1 {
            (finite.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / (n - 1) as f32).sqrt()
        } else {
            0.0
        };
        let min = finite.iter().copied().fold(f32::INFINITY, f32::min);
        let max = finite.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        Self {
            mean,
            std,
            min,
            max,
            non_finite,
            len: values.len(),
        }
    }

    pub fn is_large(&self) -> bool {
        self.max > LARGE_GRADIENT || self.min < -LARGE_GRADIENT
    }
}

/// Logs statistics of one solver's gradient segment.
pub fn log_grad_stats(name: &str, solver: usize, values: &[f32]) {
    if !log_enabled!(Level::Warn) {
        return;
    }
    let stats = GradStats::of(values);
    if stats.non_finite > 0 {
        warn!(
            "NaN gradient in solver {} / {}. Number of NaNs: {} / {}",
            solver, name, stats.non_finite, stats.len
        );
    }
    if stats.is_large() {
        warn!(
            "Large gradient in solver {} / {}. min: {}, max: {}.",
            solver, name, stats.min, stats.max
        );
    }
    debug!(
        "solver {} / {}: mean = {}, std = {}, min = {}, max = {}",
        solver, name, stats.mean, stats.std, stats.min, stats.max
    );
}

/// Fails if any named gradient buffer holds a NaN or infinity.
pub fn ensure_finite(grads: &[(&'static str, &Buffer)]) -> Result<()> {
    for &(name, grad) in grads {
        let non_finite = grad.count_non_finite();
        if non_finite > 0 {
            return Err(Error::NonFiniteGradient {
                buffer: name,
                non_finite,
                len: grad.len(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_stats() {
        let stats = GradStats::of(&[1.0, 2.0, 3.0, f32::NAN]);
        assert_eq!(stats.non_finite, 1);
        assert_eq!(stats.len, 4);
        assert_eq!(stats.mean, 2.0);
        assert_eq!(stats.std, 1.0);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 3.0);
        assert!(!stats.is_large());
    }

    #[test]
    fn test_large() {
        let stats = GradStats::of(&[-5e3, 0.0]);
        assert!(stats.is_large());
        log_grad_stats("grad_lo", 0, &[-5e3, 0.0, f32::INFINITY]);
    }

    #[test]
    fn test_ensure_finite() {
        let ok = Buffer::from_vec(vec![0.0, -1.0]);
        let bad = Buffer::from_vec(vec![0.0, f32::NAN, f32::NEG_INFINITY]);
        assert!(ensure_finite(&[("ok", &ok)]).is_ok());
        let err = ensure_finite(&[("ok", &ok), ("bad", &bad)]).unwrap_err();
        assert!(matches!(
            err,
            Error::NonFiniteGradient {
                buffer: "bad",
                non_finite: 2,
                len: 3
            }
        ));
    }
}
