//! Flat batched buffers and the input validator.
//!
//! A [`Buffer`] is a one-dimensional run of numbers. Batched operations only
//! accept densely packed 32-bit floats; other element types and strided views
//! exist so that callers can hand over whatever they have and get a precise
//! [`Error::Format`][crate::error::Error::Format] back.

use std::fmt;

use crate::error::{Error, FormatReason, Result};

/// Numeric element type of a buffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DType {
    F32,
    F64,
    I32,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F64 => write!(f, "f64"),
            DType::I32 => write!(f, "i32"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Storage {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
}

impl Storage {
    fn len(&self) -> usize {
        match self {
            Storage::F32(v) => v.len(),
            Storage::F64(v) => v.len(),
            Storage::I32(v) => v.len(),
        }
    }
}

/// One-dimensional numeric buffer.
///
/// Logical element `i` lives at storage position `i * stride`.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    storage: Storage,
    stride: usize,
}

impl Buffer {
    pub fn from_vec(values: Vec<f32>) -> Self {
        Self {
            storage: Storage::F32(values),
            stride: 1,
        }
    }

    pub fn zeros(len: usize) -> Self {
        Self::full(len, 0.0)
    }

    pub fn full(len: usize, value: f32) -> Self {
        Self::from_vec(vec![value; len])
    }

    pub fn from_f64(values: Vec<f64>) -> Self {
        Self {
            storage: Storage::F64(values),
            stride: 1,
        }
    }

    pub fn from_i32(values: Vec<i32>) -> Self {
        Self {
            storage: Storage::I32(values),
            stride: 1,
        }
    }

    /// Creates a strided view over `storage`: every `stride`-th element is visible.
    pub fn strided(storage: Vec<f32>, stride: usize) -> Self {
        assert!(stride > 0, "Stride must be positive");
        Self {
            storage: Storage::F32(storage),
            stride,
        }
    }

    pub fn dtype(&self) -> DType {
        match self.storage {
            Storage::F32(_) => DType::F32,
            Storage::F64(_) => DType::F64,
            Storage::I32(_) => DType::I32,
        }
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Number of logical elements.
    pub fn len(&self) -> usize {
        self.storage.len().div_ceil(self.stride)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_contiguous(&self) -> bool {
        self.stride == 1
    }

    /// Checks the buffer is densely packed `f32`, reporting the first violation.
    pub fn check_format(&self) -> std::result::Result<(), FormatReason> {
        match self.dtype() {
            DType::F32 => {}
            other => return Err(FormatReason::WrongDType(other)),
        }
        if !self.is_contiguous() {
            return Err(FormatReason::NonContiguous { stride: self.stride });
        }
        Ok(())
    }

    /// Returns the elements as a dense `f32` slice, if the buffer is one.
    pub fn as_slice(&self) -> Option<&[f32]> {
        match &self.storage {
            Storage::F32(v) if self.stride == 1 => Some(v),
            _ => None,
        }
    }

    pub fn as_mut_slice(&mut self) -> Option<&mut [f32]> {
        match &mut self.storage {
            Storage::F32(v) if self.stride == 1 => Some(v),
            _ => None,
        }
    }

    pub(crate) fn view(&self, name: &'static str) -> Result<&[f32]> {
        self.check_format().map_err(|reason| Error::Format { buffer: name, reason })?;
        Ok(self.as_slice().unwrap_or_default())
    }

    pub(crate) fn view_mut(&mut self, name: &'static str) -> Result<&mut [f32]> {
        self.check_format().map_err(|reason| Error::Format { buffer: name, reason })?;
        Ok(self.as_mut_slice().unwrap_or_default())
    }

    /// Copies the logical elements into a `Vec<f32>`.
    ///
    /// Non-float element types are converted with `as` casts.
    pub fn to_vec(&self) -> Vec<f32> {
        match &self.storage {
            Storage::F32(v) => v.iter().step_by(self.stride).copied().collect(),
            Storage::F64(v) => v.iter().step_by(self.stride).map(|&x| x as f32).collect(),
            Storage::I32(v) => v.iter().step_by(self.stride).map(|&x| x as f32).collect(),
        }
    }

    /// Returns a densely packed `f32` copy of the logical elements.
    pub fn to_contiguous(&self) -> Buffer {
        Buffer::from_vec(self.to_vec())
    }

    /// Counts elements that are NaN or infinite.
    pub fn count_non_finite(&self) -> usize {
        match &self.storage {
            Storage::F32(v) => v.iter().step_by(self.stride).filter(|x| !x.is_finite()).count(),
            Storage::F64(v) => v.iter().step_by(self.stride).filter(|x| !x.is_finite()).count(),
            Storage::I32(_) => 0,
        }
    }
}

impl From<Vec<f32>> for Buffer {
    fn from(values: Vec<f32>) -> Self {
        Buffer::from_vec(values)
    }
}

/// Asserts that every named buffer is densely packed `f32`.
///
/// Fails on the first offending buffer, naming it.
pub fn validate_input_format(args: &[(&'static str, &Buffer)]) -> Result<()> {
    for &(name, buffer) in args {
        buffer
            .check_format()
            .map_err(|reason| Error::Format { buffer: name, reason })?;
    }
    Ok(())
}

/// Asserts that `buffer` has exactly `expected` elements.
pub fn ensure_len(name: &'static str, buffer: &Buffer, expected: usize) -> Result<()> {
    if buffer.len() != expected {
        return Err(Error::Shape {
            buffer: name,
            expected,
            actual: buffer.len(),
        });
    }
    Ok(())
}
