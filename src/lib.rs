//! DETR training loss and 2D position encodings for candle.
//!
//! This crate implements the two model-side pieces a DETR-style detector needs
//! beyond the backbone/transformer itself:
//!
//! - [`SetCriterion`]: the set-based training loss. A bipartite matcher (an
//!   injected [`Matcher`] capability) assigns predicted query slots to ground
//!   truth objects; the criterion then computes a class-balanced cross-entropy
//!   over all slots plus L1 and generalized-IoU regression terms over the
//!   matched pairs, replicated across auxiliary decoder layers for deep
//!   supervision.
//! - [`PositionEmbeddingSine`] / [`PositionEmbeddingLearned`]: per-pixel
//!   position features injected into the transformer encoder, selected via
//!   [`build_position_encoding`].
//!
//! The backbone, transformer, Hungarian solver, data loading and the training
//! loop itself are external; this crate only consumes their outputs.

pub mod box_ops;
pub mod config;
pub mod criterion;
pub mod matcher;
pub mod pos_enc;

pub use config::{CriterionConfig, PositionEncodingConfig, PositionEncodingKind};
pub use criterion::{DetectionOutputs, ImageTargets, LayerOutputs, SetCriterion};
pub use matcher::{MatchIndices, Matcher};
pub use pos_enc::{
    build_position_encoding, PositionEmbeddingLearned, PositionEmbeddingSine, PositionEncoding,
};
