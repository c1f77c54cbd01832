//! Batches of solvers and the layout of flat batched buffers.
//!
//! A flat buffer is the concatenation, in batch order, of one segment per
//! solver. Three segmentations coexist:
//!
//! | kind       | segment length per solver    |
//! |------------|------------------------------|
//! | `Layer`    | `nr_layers()`                |
//! | `Bdd`      | `nr_bdds()`                  |
//! | `Variable` | `nr_primal_variables() + 1`  |
//!
//! A [`Layout`] is derived from the sizes captured when the [`Batch`] was
//! built, so the forward and backward pass of an operation always agree on
//! where each solver's segment starts.

use std::fmt;
use std::ops::Range;

use log::debug;

use crate::engine::SolverEngine;
use crate::error::{Error, Result};

/// Segmentation kind of a flat buffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SegmentKind {
    Layer,
    Bdd,
    Variable,
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentKind::Layer => write!(f, "layer"),
            SegmentKind::Bdd => write!(f, "bdd"),
            SegmentKind::Variable => write!(f, "variable"),
        }
    }
}

/// Sizes reported by one solver.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SolverSizes {
    pub layers: usize,
    pub bdds: usize,
    pub primal_variables: usize,
}

impl SolverSizes {
    pub fn of<S: SolverEngine>(solver: &S) -> Self {
        Self {
            layers: solver.nr_layers(),
            bdds: solver.nr_bdds(),
            primal_variables: solver.nr_primal_variables(),
        }
    }

    /// Segment length of this solver in a buffer of the given kind.
    pub fn segment_len(&self, kind: SegmentKind) -> usize {
        match kind {
            SegmentKind::Layer => self.layers,
            SegmentKind::Bdd => self.bdds,
            SegmentKind::Variable => self.primal_variables + 1,
        }
    }
}

/// Start/end offsets of every solver's segment for one segmentation kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    kind: SegmentKind,
    ranges: Vec<Range<usize>>,
}

impl Layout {
    /// Computes the layout with a single left-to-right sweep.
    pub fn new(kind: SegmentKind, sizes: &[SolverSizes]) -> Self {
        let mut start = 0;
        let ranges = sizes
            .iter()
            .map(|s| {
                let end = start + s.segment_len(kind);
                let range = start..end;
                start = end;
                range
            })
            .collect();
        Self { kind, ranges }
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    /// Sum of all segment lengths.
    pub fn total(&self) -> usize {
        self.ranges.last().map_or(0, |r| r.end)
    }

    pub fn range(&self, solver: usize) -> Range<usize> {
        self.ranges[solver].clone()
    }

    pub fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }

    /// Asserts the segments exactly cover a buffer of `buffer_len` elements.
    pub fn check(&self, buffer_len: usize) -> Result<()> {
        if self.total() != buffer_len {
            return Err(Error::LayoutMismatch {
                kind: self.kind,
                segmented: self.total(),
                buffer_len,
            });
        }
        Ok(())
    }
}

/// An ordered, fixed sequence of solvers.
///
/// The order and the sizes of the solvers are frozen at construction. Every
/// traversal re-checks that the solvers still report those sizes.
pub struct Batch<S> {
    solvers: Vec<S>,
    sizes: Vec<SolverSizes>,
}

impl<S: SolverEngine> Batch<S> {
    pub fn new(solvers: Vec<S>) -> Self {
        let sizes = solvers.iter().map(SolverSizes::of).collect();
        Self { solvers, sizes }
    }

    pub fn len(&self) -> usize {
        self.solvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.solvers.is_empty()
    }

    pub fn sizes(&self) -> &[SolverSizes] {
        &self.sizes
    }

    pub fn solver(&self, index: usize) -> &S {
        &self.solvers[index]
    }

    pub fn solver_mut(&mut self, index: usize) -> &mut S {
        &mut self.solvers[index]
    }

    pub fn solvers(&self) -> &[S] {
        &self.solvers
    }

    pub(crate) fn solvers_mut(&mut self) -> std::slice::IterMut<'_, S> {
        self.solvers.iter_mut()
    }

    pub fn into_solvers(self) -> Vec<S> {
        self.solvers
    }

    /// Total length of a buffer of the given kind over the whole batch.
    pub fn total(&self, kind: SegmentKind) -> usize {
        self.sizes.iter().map(|s| s.segment_len(kind)).sum()
    }

    /// Resolves the layout of a buffer of the given kind and checks its length.
    pub fn resolve(&self, kind: SegmentKind, buffer_len: usize) -> Result<Layout> {
        self.ensure_stable()?;
        let layout = Layout::new(kind, &self.sizes);
        layout.check(buffer_len)?;
        debug!(
            "resolved {} layout over {} solvers: {:?}",
            kind,
            self.len(),
            layout.ranges()
        );
        Ok(layout)
    }

    /// Checks that every solver still reports the sizes captured at construction.
    pub fn ensure_stable(&self) -> Result<()> {
        for (i, (solver, sizes)) in self.solvers.iter().zip(&self.sizes).enumerate() {
            if SolverSizes::of(solver) != *sizes {
                return Err(Error::BatchChanged { solver: i });
            }
        }
        Ok(())
    }

    /// Checks that this batch has the same shape as the one recorded by a forward pass.
    pub(crate) fn ensure_matches(&self, recorded: &[SolverSizes]) -> Result<()> {
        if self.sizes.len() != recorded.len() {
            return Err(Error::BatchChanged {
                solver: self.sizes.len().min(recorded.len()),
            });
        }
        if let Some(i) = self.sizes.iter().zip(recorded).position(|(a, b)| a != b) {
            return Err(Error::BatchChanged { solver: i });
        }
        self.ensure_stable()
    }
}

impl<S: SolverEngine + fmt::Debug> fmt::Debug for Batch<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("len", &self.len())
            .field("layers", &self.total(SegmentKind::Layer))
            .field("bdds", &self.total(SegmentKind::Bdd))
            .field("variables", &self.total(SegmentKind::Variable))
            .finish()
    }
}
