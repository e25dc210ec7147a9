//! Set-based training criterion for DETR-style detectors.
//!
//! The model emits a fixed number of query-slot predictions per image; the
//! criterion first asks the injected [`Matcher`] for an optimal bipartite
//! assignment between slots and ground truth objects, then computes:
//!
//! - `loss_ce`: class-balanced cross-entropy over every slot, with unmatched
//!   slots assigned to the synthetic no-object class,
//! - `loss_bbox`: L1 distance over matched pairs,
//! - `loss_giou`: generalized-IoU loss over matched pairs,
//!
//! each box term normalized by the batch-wide target count. When auxiliary
//! decoder-layer predictions are present, every layer is re-matched and scored
//! independently and its terms are suffixed with the layer index
//! (`loss_ce_0`, ...), sharing the same normalizer.

use std::collections::HashMap;

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::ops::log_softmax;

use crate::box_ops;
use crate::config::CriterionConfig;
use crate::matcher::{MatchIndices, Matcher};

/// Predictions from a single decoder layer.
#[derive(Debug, Clone)]
pub struct LayerOutputs {
    /// Class logits, `[batch, num_queries, num_classes + 1]`. The last class
    /// is the no-object class.
    pub pred_logits: Tensor,
    /// Boxes in normalized `(cx, cy, w, h)` format, `[batch, num_queries, 4]`.
    pub pred_boxes: Tensor,
}

impl LayerOutputs {
    pub fn new(pred_logits: Tensor, pred_boxes: Tensor) -> Self {
        Self {
            pred_logits,
            pred_boxes,
        }
    }
}

/// Full model output: the final decoder layer plus optional intermediate
/// layers kept for deep supervision.
#[derive(Debug, Clone)]
pub struct DetectionOutputs {
    /// Final-layer class logits, `[batch, num_queries, num_classes + 1]`.
    pub pred_logits: Tensor,
    /// Final-layer boxes, `[batch, num_queries, 4]`, normalized `(cx, cy, w, h)`.
    pub pred_boxes: Tensor,
    /// Earlier-layer predictions, ordered by layer. May be empty.
    pub aux_outputs: Vec<LayerOutputs>,
}

impl DetectionOutputs {
    pub fn new(pred_logits: Tensor, pred_boxes: Tensor) -> Self {
        Self {
            pred_logits,
            pred_boxes,
            aux_outputs: Vec::new(),
        }
    }

    pub fn with_aux(mut self, aux_outputs: Vec<LayerOutputs>) -> Self {
        self.aux_outputs = aux_outputs;
        self
    }

    /// View of the final layer with `aux_outputs` stripped; this is what gets
    /// matched and scored as the primary loss terms.
    pub fn final_layer(&self) -> LayerOutputs {
        LayerOutputs::new(self.pred_logits.clone(), self.pred_boxes.clone())
    }
}

/// Ground truth for one image. Zero objects is legitimate: such an image
/// contributes only no-object rows to the classification loss.
#[derive(Debug, Clone, Default)]
pub struct ImageTargets {
    /// Class indices in `0..num_classes`, no background entries.
    pub labels: Vec<u32>,
    /// Boxes in normalized `(cx, cy, w, h)` format, parallel to `labels`.
    pub boxes: Vec<[f32; 4]>,
}

impl ImageTargets {
    pub fn new(labels: Vec<u32>, boxes: Vec<[f32; 4]>) -> Self {
        debug_assert_eq!(labels.len(), boxes.len());
        Self { labels, boxes }
    }

    /// Number of annotated objects.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// The DETR set criterion.
///
/// Holds the matcher capability and the immutable per-class weight vector;
/// `forward` itself is stateless and safe to call concurrently on different
/// batches.
pub struct SetCriterion {
    config: CriterionConfig,
    matcher: Box<dyn Matcher>,
    /// `[num_classes + 1]`, all ones except the no-object entry = `eos_coef`.
    /// Plain buffer, never trained.
    empty_weight: Tensor,
}

impl SetCriterion {
    pub fn new(config: CriterionConfig, matcher: Box<dyn Matcher>, device: &Device) -> Result<Self> {
        if config.eos_coef <= 0.0 || config.eos_coef > 1.0 {
            candle_core::bail!("eos_coef must be in (0, 1], got {}", config.eos_coef);
        }
        let mut weights = vec![1f32; config.num_classes + 1];
        weights[config.num_classes] = config.eos_coef as f32;
        let empty_weight = Tensor::from_vec(weights, config.num_classes + 1, device)?;
        Ok(Self {
            config,
            matcher,
            empty_weight,
        })
    }

    pub fn weight_dict(&self) -> &HashMap<String, f64> {
        &self.config.weight_dict
    }

    /// Compute every loss term for a batch.
    ///
    /// Returns a map with one `loss_ce`/`loss_bbox`/`loss_giou` triple for the
    /// final layer and one `_{i}`-suffixed triple per auxiliary layer. Terms
    /// are unweighted scalars; applying `weight_dict` is the caller's job
    /// (or [`Self::weighted_sum`]).
    pub fn forward(
        &self,
        outputs: &DetectionOutputs,
        targets: &[ImageTargets],
    ) -> Result<HashMap<String, Tensor>> {
        let final_layer = outputs.final_layer();
        self.validate_layer(&final_layer, targets)?;

        // Shared normalizer for the box terms of every layer, so each matched
        // pair weighs the same regardless of layer or image. Clamped to 1 so
        // an all-empty batch divides by one instead of zero.
        let num_boxes = total_num_boxes(targets);

        let mut losses = HashMap::new();
        let indices = self.matcher.assign(&final_layer, targets)?;
        self.layer_losses(&mut losses, &final_layer, targets, &indices, num_boxes, None)?;

        for (i, aux) in outputs.aux_outputs.iter().enumerate() {
            self.validate_layer(aux, targets)?;
            // Each layer is re-matched: intermediate predictions may admit a
            // different optimal assignment.
            let indices = self.matcher.assign(aux, targets)?;
            self.layer_losses(&mut losses, aux, targets, &indices, num_boxes, Some(i))?;
        }
        Ok(losses)
    }

    /// Reduce a loss dictionary with the configured `weight_dict`:
    /// `sum(losses[k] * weight_dict[k])` over keys present in the dict.
    pub fn weighted_sum(&self, losses: &HashMap<String, Tensor>) -> Result<Tensor> {
        let mut total: Option<Tensor> = None;
        for (name, value) in losses {
            if let Some(&w) = self.config.weight_dict.get(name) {
                let term = (value * w)?;
                total = Some(match total {
                    Some(acc) => (acc + term)?,
                    None => term,
                });
            }
        }
        match total {
            Some(t) => Ok(t),
            None => candle_core::bail!("no loss term matches any weight_dict key"),
        }
    }

    fn layer_losses(
        &self,
        losses: &mut HashMap<String, Tensor>,
        layer: &LayerOutputs,
        targets: &[ImageTargets],
        indices: &[MatchIndices],
        num_boxes: f64,
        aux_index: Option<usize>,
    ) -> Result<()> {
        validate_indices(layer, targets, indices)?;
        let loss_ce = self.loss_labels(layer, targets, indices)?;
        let (loss_bbox, loss_giou) = self.loss_boxes(layer, targets, indices, num_boxes)?;

        let key = |name: &str| match aux_index {
            Some(i) => format!("{name}_{i}"),
            None => name.to_string(),
        };
        losses.insert(key("loss_ce"), loss_ce);
        losses.insert(key("loss_bbox"), loss_bbox);
        losses.insert(key("loss_giou"), loss_giou);
        Ok(())
    }

    /// Class-balanced cross-entropy over all batch x query slots.
    fn loss_labels(
        &self,
        layer: &LayerOutputs,
        targets: &[ImageTargets],
        indices: &[MatchIndices],
    ) -> Result<Tensor> {
        let (batch, queries, classes) = layer.pred_logits.dims3()?;
        let target_classes = dense_target_classes(
            targets,
            indices,
            queries,
            self.config.num_classes as u32,
        );

        let device = layer.pred_logits.device();
        let target = Tensor::from_vec(target_classes, batch * queries, device)?;
        let log_probs = log_softmax(&layer.pred_logits.reshape((batch * queries, classes))?, D::Minus1)?;
        // Per-slot negative log-likelihood of the assigned class.
        let nll = log_probs.gather(&target.unsqueeze(1)?, 1)?.squeeze(1)?.neg()?;
        // Weighted mean, matching weighted categorical cross-entropy:
        // sum(w[y] * nll) / sum(w[y]).
        let weights = self
            .empty_weight
            .to_dtype(nll.dtype())?
            .index_select(&target, 0)?;
        (&nll * &weights)?.sum_all()? / weights.sum_all()?
    }

    /// L1 and GIoU losses over the matched pairs only.
    fn loss_boxes(
        &self,
        layer: &LayerOutputs,
        targets: &[ImageTargets],
        indices: &[MatchIndices],
        num_boxes: f64,
    ) -> Result<(Tensor, Tensor)> {
        let (batch, queries, _) = layer.pred_boxes.dims3()?;
        let device = layer.pred_boxes.device();

        let (src_batch, src_slot) = src_permutation_idx(indices);
        let num_matched = src_batch.len();
        if num_matched == 0 {
            // Nothing matched anywhere in the batch: box terms vanish.
            let zero = Tensor::zeros((), DType::F32, device)?;
            return Ok((zero.clone(), zero));
        }

        // Gather matched predictions through flat batch*query coordinates.
        let flat: Vec<u32> = src_batch
            .iter()
            .zip(src_slot.iter())
            .map(|(&b, &s)| b * queries as u32 + s)
            .collect();
        let flat = Tensor::from_vec(flat, num_matched, device)?;
        let src_boxes = layer
            .pred_boxes
            .reshape((batch * queries, 4))?
            .index_select(&flat, 0)?;

        // Target boxes in the same pair order.
        let (tgt_batch, tgt_slot) = tgt_permutation_idx(indices);
        let mut matched = Vec::with_capacity(num_matched * 4);
        for (&b, &t) in tgt_batch.iter().zip(tgt_slot.iter()) {
            matched.extend_from_slice(&targets[b as usize].boxes[t as usize]);
        }
        let target_boxes = Tensor::from_vec(matched, (num_matched, 4), device)?;

        let loss_bbox = ((&src_boxes - &target_boxes)?.abs()?.sum_all()? / num_boxes)?;

        let giou = box_ops::generalized_box_iou(
            &box_ops::box_cxcywh_to_xyxy(&src_boxes)?,
            &box_ops::box_cxcywh_to_xyxy(&target_boxes)?,
        )?;
        let loss_giou = (box_ops::diag(&giou)?.affine(-1.0, 1.0)?.sum_all()? / num_boxes)?;
        Ok((loss_bbox, loss_giou))
    }

    fn validate_layer(&self, layer: &LayerOutputs, targets: &[ImageTargets]) -> Result<()> {
        let (batch, queries, classes) = layer.pred_logits.dims3()?;
        if classes != self.config.num_classes + 1 {
            candle_core::bail!(
                "pred_logits has {classes} classes, expected num_classes + 1 = {}",
                self.config.num_classes + 1
            );
        }
        let (b2, q2, coords) = layer.pred_boxes.dims3()?;
        if b2 != batch || q2 != queries || coords != 4 {
            candle_core::bail!(
                "pred_boxes shape [{b2}, {q2}, {coords}] does not match pred_logits [{batch}, {queries}, 4]"
            );
        }
        if targets.len() != batch {
            candle_core::bail!(
                "got {} target sets for a batch of {batch} images",
                targets.len()
            );
        }
        Ok(())
    }
}

/// Batch-wide box count used as the shared loss normalizer, clamped to 1.
fn total_num_boxes(targets: &[ImageTargets]) -> f64 {
    targets.iter().map(|t| t.len()).sum::<usize>().max(1) as f64
}

/// Dense `[batch * queries]` class array: no-object everywhere, matched slots
/// overwritten with their assigned target labels.
fn dense_target_classes(
    targets: &[ImageTargets],
    indices: &[MatchIndices],
    queries: usize,
    no_object: u32,
) -> Vec<u32> {
    let mut classes = vec![no_object; targets.len() * queries];
    for (b, m) in indices.iter().enumerate() {
        for (&s, &t) in m.src.iter().zip(m.tgt.iter()) {
            classes[b * queries + s] = targets[b].labels[t];
        }
    }
    classes
}

/// Flatten per-image assignments into parallel (batch index, query index)
/// sequences: per-image order preserved, images concatenated in batch order.
///
/// e.g. for `indices = [([0, 1], [1, 0]), ([0], [0])]`:
/// `batch_idx = [0, 0, 1]`, `src_idx = [0, 1, 0]`.
fn src_permutation_idx(indices: &[MatchIndices]) -> (Vec<u32>, Vec<u32>) {
    let mut batch_idx = Vec::new();
    let mut src_idx = Vec::new();
    for (b, m) in indices.iter().enumerate() {
        for &s in &m.src {
            batch_idx.push(b as u32);
            src_idx.push(s as u32);
        }
    }
    (batch_idx, src_idx)
}

/// Same as [`src_permutation_idx`] but over the target side of each pair.
fn tgt_permutation_idx(indices: &[MatchIndices]) -> (Vec<u32>, Vec<u32>) {
    let mut batch_idx = Vec::new();
    let mut tgt_idx = Vec::new();
    for (b, m) in indices.iter().enumerate() {
        for &t in &m.tgt {
            batch_idx.push(b as u32);
            tgt_idx.push(t as u32);
        }
    }
    (batch_idx, tgt_idx)
}

/// Sanity checks on matcher output: one assignment per image, parallel index
/// sequences, indices in range, every target matched exactly once.
fn validate_indices(
    layer: &LayerOutputs,
    targets: &[ImageTargets],
    indices: &[MatchIndices],
) -> Result<()> {
    let (batch, queries, _) = layer.pred_logits.dims3()?;
    if indices.len() != batch {
        candle_core::bail!(
            "matcher returned {} assignments for a batch of {batch}",
            indices.len()
        );
    }
    for (b, m) in indices.iter().enumerate() {
        if m.src.len() != m.tgt.len() {
            candle_core::bail!("image {b}: src/tgt index sequences differ in length");
        }
        if m.src.iter().any(|&s| s >= queries) {
            candle_core::bail!("image {b}: matched query index out of range (queries = {queries})");
        }
        let num_targets = targets[b].len();
        if m.tgt.len() != num_targets || {
            let mut seen = vec![false; num_targets];
            m.tgt.iter().any(|&t| t >= num_targets || std::mem::replace(&mut seen[t], true))
        } {
            candle_core::bail!("image {b}: each of the {num_targets} targets must be matched exactly once");
        }
    }
    Ok(())
}
