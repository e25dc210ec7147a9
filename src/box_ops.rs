//! Box geometry utilities.
//!
//! Format conversion and (generalized) IoU over batched corner-coordinate
//! boxes. These are pure tensor functions with no state; the criterion
//! consumes them for its regression terms.
//!
//! Boxes come in two layouts:
//! - `(cx, cy, w, h)`: center/size, normalized to [0, 1] — the model output.
//! - `(x0, y0, x1, y1)`: top-left/bottom-right corners — the IoU domain.

use candle_core::{Result, Tensor, D};

/// Convert boxes from `(cx, cy, w, h)` to `(x0, y0, x1, y1)`.
///
/// Works on any `[..., 4]` tensor; only the last dimension is touched.
pub fn box_cxcywh_to_xyxy(boxes: &Tensor) -> Result<Tensor> {
    let cx = boxes.narrow(D::Minus1, 0, 1)?;
    let cy = boxes.narrow(D::Minus1, 1, 1)?;
    let half_w = (boxes.narrow(D::Minus1, 2, 1)? * 0.5)?;
    let half_h = (boxes.narrow(D::Minus1, 3, 1)? * 0.5)?;

    let x0 = (&cx - &half_w)?;
    let y0 = (&cy - &half_h)?;
    let x1 = (&cx + &half_w)?;
    let y1 = (&cy + &half_h)?;
    Tensor::cat(&[&x0, &y0, &x1, &y1], D::Minus1)
}

/// Area of `[N, 4]` corner-format boxes, returned as `[N]`.
fn box_area(boxes: &Tensor) -> Result<Tensor> {
    let wh = (boxes.narrow(1, 2, 2)? - boxes.narrow(1, 0, 2)?)?;
    (wh.narrow(1, 0, 1)? * wh.narrow(1, 1, 1)?)?.squeeze(1)
}

/// Pairwise IoU between two corner-format box sets.
///
/// # Arguments
/// * `boxes1` - `[N, 4]` boxes in `(x0, y0, x1, y1)` format
/// * `boxes2` - `[M, 4]` boxes in the same format
///
/// # Returns
/// `(iou, union)`, both `[N, M]`.
pub fn box_iou(boxes1: &Tensor, boxes2: &Tensor) -> Result<(Tensor, Tensor)> {
    let area1 = box_area(boxes1)?;
    let area2 = box_area(boxes2)?;

    // Intersection rectangle: [N, 1, 2] against [1, M, 2] -> [N, M, 2]
    let lt = boxes1
        .narrow(1, 0, 2)?
        .unsqueeze(1)?
        .broadcast_maximum(&boxes2.narrow(1, 0, 2)?.unsqueeze(0)?)?;
    let rb = boxes1
        .narrow(1, 2, 2)?
        .unsqueeze(1)?
        .broadcast_minimum(&boxes2.narrow(1, 2, 2)?.unsqueeze(0)?)?;

    let wh = (rb - lt)?.relu()?;
    let inter = (wh.narrow(2, 0, 1)? * wh.narrow(2, 1, 1)?)?.squeeze(2)?;

    let union = (area1
        .unsqueeze(1)?
        .broadcast_add(&area2.unsqueeze(0)?)?
        - &inter)?;
    let iou = (&inter / &union)?;
    Ok((iou, union))
}

/// Pairwise generalized IoU between two corner-format box sets.
///
/// Equals plain IoU when one box encloses the other, degrades smoothly
/// toward -1 as disjoint boxes move apart; the smallest enclosing box is the
/// extra normalizer. Output is `[N, M]`.
pub fn generalized_box_iou(boxes1: &Tensor, boxes2: &Tensor) -> Result<Tensor> {
    let (iou, union) = box_iou(boxes1, boxes2)?;

    // Smallest enclosing box per pair.
    let lt = boxes1
        .narrow(1, 0, 2)?
        .unsqueeze(1)?
        .broadcast_minimum(&boxes2.narrow(1, 0, 2)?.unsqueeze(0)?)?;
    let rb = boxes1
        .narrow(1, 2, 2)?
        .unsqueeze(1)?
        .broadcast_maximum(&boxes2.narrow(1, 2, 2)?.unsqueeze(0)?)?;

    let wh = (rb - lt)?.relu()?;
    let area = (wh.narrow(2, 0, 1)? * wh.narrow(2, 1, 1)?)?.squeeze(2)?;

    let slack = ((&area - &union)? / &area)?;
    iou - slack
}

/// Diagonal of a square `[N, N]` matrix, returned as `[N]`.
///
/// Used to read off the aligned pairs when both inputs of a pairwise IoU are
/// already matched 1:1.
pub fn diag(matrix: &Tensor) -> Result<Tensor> {
    let (n, m) = matrix.dims2()?;
    if n != m {
        candle_core::bail!("diag expects a square matrix, got {n}x{m}");
    }
    let idx: Vec<u32> = (0..n as u32).map(|i| i * (n as u32 + 1)).collect();
    let idx = Tensor::from_vec(idx, n, matrix.device())?;
    matrix.flatten_all()?.index_select(&idx, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn boxes(data: &[[f32; 4]]) -> Tensor {
        let flat: Vec<f32> = data.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (data.len(), 4), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_cxcywh_to_xyxy() {
        let b = boxes(&[[0.5, 0.5, 0.2, 0.4]]);
        let xyxy = box_cxcywh_to_xyxy(&b).unwrap().to_vec2::<f32>().unwrap();
        let expected = [0.4f32, 0.3, 0.6, 0.7];
        for (got, want) in xyxy[0].iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-6, "got {got}, want {want}");
        }
    }

    #[test]
    fn test_giou_identical_boxes_is_one() {
        let b = boxes(&[[0.1, 0.1, 0.5, 0.6], [0.2, 0.3, 0.8, 0.9]]);
        let giou = generalized_box_iou(&b, &b).unwrap();
        let d = diag(&giou).unwrap().to_vec1::<f32>().unwrap();
        for v in d {
            assert!((v - 1.0).abs() < 1e-6, "giou(box, box) = {v}, want 1");
        }
    }

    #[test]
    fn test_giou_symmetry() {
        let a = boxes(&[[0.0, 0.0, 0.4, 0.4]]);
        let b = boxes(&[[0.2, 0.2, 0.9, 0.8]]);
        let ab = generalized_box_iou(&a, &b).unwrap().to_vec2::<f32>().unwrap();
        let ba = generalized_box_iou(&b, &a).unwrap().to_vec2::<f32>().unwrap();
        assert!((ab[0][0] - ba[0][0]).abs() < 1e-6);
    }

    #[test]
    fn test_giou_disjoint_is_negative_bounded() {
        let a = boxes(&[[0.0, 0.0, 0.1, 0.1]]);
        let b = boxes(&[[0.8, 0.8, 0.9, 0.9]]);
        let giou = generalized_box_iou(&a, &b).unwrap().to_vec2::<f32>().unwrap();
        let v = giou[0][0];
        assert!(v < 0.0, "disjoint giou {v} should be negative");
        assert!(v > -1.0, "giou {v} must stay above -1");
        assert!(v.is_finite());
    }

    #[test]
    fn test_giou_equals_iou_for_nested_boxes() {
        // When one box contains the other, the enclosing box is the outer box
        // and the penalty term vanishes.
        let outer = boxes(&[[0.0, 0.0, 1.0, 1.0]]);
        let inner = boxes(&[[0.25, 0.25, 0.75, 0.75]]);
        let (iou, _) = box_iou(&outer, &inner).unwrap();
        let giou = generalized_box_iou(&outer, &inner).unwrap();
        let iou = iou.to_vec2::<f32>().unwrap()[0][0];
        let giou = giou.to_vec2::<f32>().unwrap()[0][0];
        assert!((iou - 0.25).abs() < 1e-6);
        assert!((giou - iou).abs() < 1e-6);
    }

    #[test]
    fn test_diag_rejects_non_square() {
        let m = Tensor::zeros((2, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(diag(&m).is_err());
    }
}
