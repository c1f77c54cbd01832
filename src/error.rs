//! Error taxonomy of the orchestration layer.
//!
//! All errors are fail-fast: nothing here is retried, and a batch traversal
//! that fails part-way leaves earlier solvers' segments written.

use std::fmt;

use thiserror::Error;

use crate::buffer::DType;
use crate::layout::SegmentKind;

/// Why a buffer was rejected by the input validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatReason {
    /// The buffer does not hold 32-bit floats.
    WrongDType(DType),
    /// The buffer addresses its elements with a gap between them.
    NonContiguous { stride: usize },
}

impl fmt::Display for FormatReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatReason::WrongDType(dtype) => write!(f, "argument not in FP32 format (found {})", dtype),
            FormatReason::NonContiguous { stride } => write!(f, "argument not contiguous (stride {})", stride),
        }
    }
}

/// Failure reported by a solver engine from inside one of its native routines.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Gradient replay was asked for a different number of iterations than were run.
    #[error("replay of {skip} + {tracked} iterations does not match the {run} iterations run")]
    InconsistentReplay { skip: usize, tracked: usize, run: usize },

    /// A segment handed to the engine has the wrong number of elements.
    #[error("segment `{segment}` has {actual} elements, expected {expected}")]
    SegmentLength {
        segment: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Any other failure raised by the native routine.
    #[error("{0}")]
    Native(String),
}

/// Errors raised by batched operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("buffer `{buffer}`: {reason}")]
    Format { buffer: &'static str, reason: FormatReason },

    #[error("buffer `{buffer}` has length {actual}, expected {expected}")]
    Shape {
        buffer: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{kind} segments of the batch sum to {segmented}, but the buffer has length {buffer_len}")]
    LayoutMismatch {
        kind: SegmentKind,
        segmented: usize,
        buffer_len: usize,
    },

    /// A solver's sizes differ from the ones the batch (or its forward pass) recorded.
    #[error("solver {solver} no longer matches the recorded batch layout")]
    BatchChanged { solver: usize },

    #[error("solver {solver} failed in `{op}` ({context}): {source}")]
    Engine {
        solver: usize,
        op: &'static str,
        context: String,
        #[source]
        source: EngineError,
    },

    #[error("gradient `{buffer}` has {non_finite} non-finite values out of {len}")]
    NonFiniteGradient {
        buffer: &'static str,
        non_finite: usize,
        len: usize,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wraps an engine failure with the identity of the failing solver.
    ///
    /// The failure is logged before it is handed back, so the context is not
    /// lost even if the caller discards the error.
    pub(crate) fn engine(solver: usize, op: &'static str, context: String, source: EngineError) -> Self {
        log::error!("Error in {} (solver {}): {}: {}", op, solver, context, source);
        Error::Engine {
            solver,
            op,
            context,
            source,
        }
    }
}
