//! Differentiable batched operations.
//!
//! Every operation is a pair of passes over a [`Batch`][crate::layout::Batch]:
//!
//! - `forward` validates its buffers, resolves the layout of every buffer
//!   kind it touches, dispatches one native call per solver in batch order and
//!   returns fresh output buffers together with a context;
//! - `backward` consumes that context, replays the same layout from the sizes
//!   recorded at forward time, and returns gradients w.r.t. the forward
//!   inputs. All returned gradients are checked to be finite.
//!
//! Inputs move into the context, so the forward pass never copies them.
//! A context can only be consumed once.

pub mod deferred;
pub mod dual_iterations;
pub mod lower_bound;
pub mod min_marginals;
pub mod perturb;

use crate::buffer::{ensure_len, validate_input_format, Buffer};
use crate::error::Result;

/// Validates an incoming gradient, or substitutes zeros for a missing one.
pub(crate) fn incoming_grad(name: &'static str, grad: Option<Buffer>, len: usize) -> Result<Buffer> {
    match grad {
        Some(grad) => {
            validate_input_format(&[(name, &grad)])?;
            ensure_len(name, &grad, len)?;
            Ok(grad)
        }
        None => Ok(Buffer::zeros(len)),
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::error::Error;

    #[test]
    fn test_missing_grad_is_zero() {
        let g = incoming_grad("grad", None, 3).unwrap();
        assert_eq!(g.to_vec(), vec![0.0; 3]);
    }

    #[test]
    fn test_incoming_grad_checked() {
        let err = incoming_grad("grad", Some(Buffer::zeros(2)), 3).unwrap_err();
        assert!(matches!(err, Error::Shape { buffer: "grad", .. }));
        let err = incoming_grad("grad", Some(Buffer::from_f64(vec![0.0; 3])), 3).unwrap_err();
        assert!(matches!(err, Error::Format { buffer: "grad", .. }));
    }
}
