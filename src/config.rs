//! Configuration for the criterion and position encodings.
//!
//! Plain data structs with defaulting constructors, mirroring the values the
//! original DETR training recipe uses (eos_coef=0.1, loss weights 1/5/2,
//! temperature=10000, learned tables capped at 50x50).

use std::collections::HashMap;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Which position encoding variant to build.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionEncodingKind {
    /// Closed-form interleaved sine/cosine encoding, no learned parameters.
    Sine,
    /// Learned row/column embedding lookup tables.
    Learned,
}

impl FromStr for PositionEncodingKind {
    type Err = candle_core::Error;

    /// Accepts `"sine"`/`"v2"` and `"learned"`/`"v3"`, the historical DETR
    /// command-line aliases.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sine" | "v2" => Ok(PositionEncodingKind::Sine),
            "learned" | "v3" => Ok(PositionEncodingKind::Learned),
            other => candle_core::bail!("unknown position encoding kind: {other:?}"),
        }
    }
}

/// Configuration for [`build_position_encoding`](crate::build_position_encoding).
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct PositionEncodingConfig {
    /// Variant selector.
    pub kind: PositionEncodingKind,
    /// Transformer hidden dimension. Must be even: each spatial axis receives
    /// `hidden_dim / 2` feature channels.
    pub hidden_dim: usize,
    /// Frequency temperature for the sine variant.
    pub temperature: f64,
    /// Whether to rescale coordinates to `[0, scale]` (sine variant).
    pub normalize: bool,
    /// Normalization target, typically 2*pi (sine variant).
    pub scale: f64,
    /// Maximum height/width the learned tables can index.
    pub max_spatial_size: usize,
}

impl PositionEncodingConfig {
    pub fn new(kind: PositionEncodingKind, hidden_dim: usize) -> Self {
        Self {
            kind,
            hidden_dim,
            temperature: 10000.0,
            normalize: true,
            scale: 2.0 * std::f64::consts::PI,
            max_spatial_size: 50,
        }
    }

    /// Sine encoding with the standard DETR settings.
    pub fn sine(hidden_dim: usize) -> Self {
        Self::new(PositionEncodingKind::Sine, hidden_dim)
    }

    /// Learned encoding with the standard DETR settings.
    pub fn learned(hidden_dim: usize) -> Self {
        Self::new(PositionEncodingKind::Learned, hidden_dim)
    }
}

/// Configuration for [`SetCriterion`](crate::SetCriterion).
#[derive(Debug, Clone)]
pub struct CriterionConfig {
    /// Number of object classes, excluding the synthetic no-object class.
    /// The no-object class index is `num_classes`.
    pub num_classes: usize,
    /// Classification weight for the no-object class, in (0, 1]. Down-weights
    /// the dominant unmatched slots to counter class imbalance.
    pub eos_coef: f64,
    /// Per-term loss multipliers consumed by the training loop (and by
    /// [`SetCriterion::weighted_sum`](crate::SetCriterion::weighted_sum)).
    /// Keys match the names in the returned loss dictionary.
    pub weight_dict: HashMap<String, f64>,
}

impl CriterionConfig {
    /// Standard DETR loss weights: ce=1, bbox=5, giou=2.
    pub fn new(num_classes: usize) -> Self {
        let mut weight_dict = HashMap::new();
        weight_dict.insert("loss_ce".to_string(), 1.0);
        weight_dict.insert("loss_bbox".to_string(), 5.0);
        weight_dict.insert("loss_giou".to_string(), 2.0);
        Self {
            num_classes,
            eos_coef: 0.1,
            weight_dict,
        }
    }

    /// Replicate the weight entries for `num_aux_layers` auxiliary decoder
    /// layers, producing the `_{i}`-suffixed keys the criterion emits.
    pub fn with_aux_weights(mut self, num_aux_layers: usize) -> Self {
        let base: Vec<(String, f64)> = self
            .weight_dict
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        for i in 0..num_aux_layers {
            for (k, v) in &base {
                self.weight_dict.insert(format!("{k}_{i}"), *v);
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_aliases() {
        assert_eq!(
            "sine".parse::<PositionEncodingKind>().unwrap(),
            PositionEncodingKind::Sine
        );
        assert_eq!(
            "v2".parse::<PositionEncodingKind>().unwrap(),
            PositionEncodingKind::Sine
        );
        assert_eq!(
            "learned".parse::<PositionEncodingKind>().unwrap(),
            PositionEncodingKind::Learned
        );
        assert_eq!(
            "v3".parse::<PositionEncodingKind>().unwrap(),
            PositionEncodingKind::Learned
        );
        assert!("v4".parse::<PositionEncodingKind>().is_err());
    }

    #[test]
    fn test_criterion_defaults() {
        let config = CriterionConfig::new(91);
        assert_eq!(config.weight_dict["loss_ce"], 1.0);
        assert_eq!(config.weight_dict["loss_bbox"], 5.0);
        assert_eq!(config.weight_dict["loss_giou"], 2.0);
        assert!((config.eos_coef - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_aux_weight_replication() {
        let config = CriterionConfig::new(91).with_aux_weights(2);
        assert_eq!(config.weight_dict["loss_giou_0"], 2.0);
        assert_eq!(config.weight_dict["loss_bbox_1"], 5.0);
        assert!(!config.weight_dict.contains_key("loss_ce_2"));
    }
}
