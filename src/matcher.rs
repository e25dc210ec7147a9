//! Bipartite matcher capability.
//!
//! The criterion does not care how the assignment between query slots and
//! ground truth objects is produced; a Hungarian solver is the usual choice
//! but any implementation of [`Matcher`] can be injected, including the fixed
//! assignments used in tests.

use candle_core::Result;

use crate::criterion::{ImageTargets, LayerOutputs};

/// Bipartite assignment for one image.
///
/// `src` holds matched query-slot indices, `tgt` the corresponding target
/// indices; the two are parallel and equal length. Every target of the image
/// appears exactly once in `tgt` (the matcher guarantees this whenever the
/// query count is at least the target count). Query slots absent from `src`
/// are implicitly assigned to the no-object class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchIndices {
    pub src: Vec<usize>,
    pub tgt: Vec<usize>,
}

impl MatchIndices {
    pub fn new(src: Vec<usize>, tgt: Vec<usize>) -> Self {
        debug_assert_eq!(src.len(), tgt.len());
        Self { src, tgt }
    }

    /// Number of matched pairs.
    pub fn len(&self) -> usize {
        self.src.len()
    }

    pub fn is_empty(&self) -> bool {
        self.src.is_empty()
    }
}

/// Optimal-assignment capability consumed by the criterion.
///
/// Called once per evaluated decoder layer: different layers may produce
/// different optimal assignments against the same targets.
pub trait Matcher: Send + Sync {
    /// Compute one [`MatchIndices`] per image in the batch.
    fn assign(&self, outputs: &LayerOutputs, targets: &[ImageTargets]) -> Result<Vec<MatchIndices>>;
}
