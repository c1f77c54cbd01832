//! The damping parameter of dual iterations.

use std::ops::Range;

use crate::buffer::{ensure_len, Buffer};
use crate::engine::{OmegaGradSegment, OmegaSegment};
use crate::error::{Error, Result};

/// Damping factor: one value for the whole batch, or one per layer.
///
/// The variant is fixed for a forward/backward pair, and the gradient has the
/// same variant as the input.
#[derive(Debug, Clone, PartialEq)]
pub enum Omega {
    Scalar(f32),
    PerLayer(Buffer),
}

impl Omega {
    /// Interprets a buffer the way a tensor argument would be: a single
    /// element is a scalar, anything else is a per-layer buffer.
    pub fn from_buffer(buffer: Buffer) -> Result<Self> {
        if buffer.len() == 1 {
            Ok(Omega::Scalar(buffer.view("omega")?[0]))
        } else {
            Ok(Omega::PerLayer(buffer))
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Omega::Scalar(_))
    }

    /// Checks a per-layer buffer against the layer-segmented buffer length.
    pub(crate) fn validate(&self, layer_len: usize) -> Result<()> {
        match self {
            Omega::Scalar(_) => Ok(()),
            Omega::PerLayer(buffer) => {
                buffer
                    .check_format()
                    .map_err(|reason| Error::Format { buffer: "omega", reason })?;
                ensure_len("omega", buffer, layer_len)
            }
        }
    }

    /// The slice of the damping factor belonging to one solver's layers.
    pub(crate) fn segment(&self, range: Range<usize>) -> Result<OmegaSegment<'_>> {
        Ok(match self {
            Omega::Scalar(w) => OmegaSegment::Scalar(*w),
            Omega::PerLayer(buffer) => OmegaSegment::PerLayer(&buffer.view("omega")?[range]),
        })
    }
}

impl From<f32> for Omega {
    fn from(value: f32) -> Self {
        Omega::Scalar(value)
    }
}

/// Gradient w.r.t. [`Omega`], with the same cardinality.
#[derive(Debug, Clone, PartialEq)]
pub enum OmegaGrad {
    Scalar(f32),
    PerLayer(Buffer),
}

impl OmegaGrad {
    pub(crate) fn zeros_like(omega: &Omega) -> Self {
        match omega {
            Omega::Scalar(_) => OmegaGrad::Scalar(0.0),
            Omega::PerLayer(buffer) => OmegaGrad::PerLayer(Buffer::zeros(buffer.len())),
        }
    }

    pub(crate) fn segment(&mut self, range: Range<usize>) -> Result<OmegaGradSegment<'_>> {
        Ok(match self {
            OmegaGrad::Scalar(g) => OmegaGradSegment::Scalar(g),
            OmegaGrad::PerLayer(buffer) => OmegaGradSegment::PerLayer(&mut buffer.view_mut("grad_omega")?[range]),
        })
    }

    /// Flattens the gradient into a buffer of length 1 or `nr_layers` of the batch.
    pub fn into_buffer(self) -> Buffer {
        match self {
            OmegaGrad::Scalar(g) => Buffer::from_vec(vec![g]),
            OmegaGrad::PerLayer(buffer) => buffer,
        }
    }

    pub fn as_scalar(&self) -> Option<f32> {
        match self {
            OmegaGrad::Scalar(g) => Some(*g),
            OmegaGrad::PerLayer(_) => None,
        }
    }
}
