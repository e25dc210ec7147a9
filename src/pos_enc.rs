//! 2D position encodings for the transformer encoder.
//!
//! DETR injects a per-pixel position feature into the encoder input. Two
//! variants exist:
//!
//! - [`PositionEmbeddingSine`]: closed-form interleaved sine/cosine over both
//!   spatial axes, generalized from the original Transformer paper to 2D.
//!   Coordinates are cumulative valid-pixel counts, so padded pixels (from
//!   batching images of different sizes) do not stretch the coordinate grid.
//! - [`PositionEmbeddingLearned`]: per-row and per-column lookup tables
//!   trained with the rest of the model.
//!
//! Both produce `[batch, hidden_dim, height, width]` where each axis gets
//! `hidden_dim / 2` channels; [`build_position_encoding`] dispatches between
//! them from configuration.

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{Embedding, Init, Module, VarBuilder};

use crate::config::{PositionEncodingConfig, PositionEncodingKind};

/// Configuration for [`PositionEmbeddingSine`].
#[derive(Debug, Clone)]
pub struct PositionEmbeddingSineConfig {
    /// Channels per spatial axis (hidden_dim / 2).
    pub num_pos_feats: usize,
    /// Frequency temperature, typically 10000.
    pub temperature: f64,
    /// Rescale coordinates so the largest valid coordinate maps to `scale`.
    pub normalize: bool,
    /// Normalization target, typically 2*pi.
    pub scale: f64,
}

impl PositionEmbeddingSineConfig {
    pub fn new(num_pos_feats: usize) -> Self {
        Self {
            num_pos_feats,
            temperature: 10000.0,
            normalize: true,
            scale: 2.0 * std::f64::consts::PI,
        }
    }
}

/// Sinusoidal position embedding. Stateless: the whole map is a closed-form
/// function of the occupancy mask.
pub struct PositionEmbeddingSine {
    config: PositionEmbeddingSineConfig,
}

impl PositionEmbeddingSine {
    pub fn new(config: PositionEmbeddingSineConfig) -> Result<Self> {
        // The sin/cos interleave pairs up adjacent channels.
        if config.num_pos_feats % 2 != 0 {
            candle_core::bail!(
                "num_pos_feats must be even, got {}",
                config.num_pos_feats
            );
        }
        Ok(Self { config })
    }

    /// Compute the encoding for a padded batch.
    ///
    /// # Arguments
    /// * `mask` - `[batch, height, width]`, nonzero marks padded pixels
    ///
    /// # Returns
    /// `[batch, 2 * num_pos_feats, height, width]`
    pub fn forward(&self, mask: &Tensor) -> Result<Tensor> {
        let (y_embed, x_embed) = self.axis_embeddings(mask)?;

        let dim_t = self.dim_tensor(mask.device())?;
        // [B, H, W, 1] / [num_pos_feats] -> [B, H, W, num_pos_feats]
        let pos_y = y_embed.unsqueeze(3)?.broadcast_div(&dim_t)?;
        let pos_x = x_embed.unsqueeze(3)?.broadcast_div(&dim_t)?;

        let pos_y = sin_cos_interleaved(&pos_y)?;
        let pos_x = sin_cos_interleaved(&pos_x)?;

        // y block first, then x, then channels-first layout.
        let pos = Tensor::cat(&[&pos_y, &pos_x], 3)?;
        pos.permute((0, 3, 1, 2))
    }

    /// Convenience for the common all-valid case (no padding).
    pub fn forward_shape(
        &self,
        batch_size: usize,
        height: usize,
        width: usize,
        device: &Device,
    ) -> Result<Tensor> {
        let mask = Tensor::zeros((batch_size, height, width), DType::U8, device)?;
        self.forward(&mask)
    }

    /// Raw per-pixel coordinates: running counts of valid pixels along each
    /// axis, optionally normalized to `[0, scale]`.
    fn axis_embeddings(&self, mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let (_, height, width) = mask.dims3()?;
        // 1 where the pixel is real, 0 where padded.
        let not_mask = mask.to_dtype(DType::F32)?.affine(-1.0, 1.0)?;
        let y_embed = not_mask.cumsum(1)?;
        let x_embed = not_mask.cumsum(2)?;

        if !self.config.normalize {
            return Ok((y_embed, x_embed));
        }
        let eps = 1e-6;
        // The cumsum is nondecreasing, so the last row/column holds the
        // per-axis maximum; eps keeps fully-padded rows finite.
        let y_max = (y_embed.narrow(1, height - 1, 1)? + eps)?;
        let x_max = (x_embed.narrow(2, width - 1, 1)? + eps)?;
        let y_embed = (y_embed.broadcast_div(&y_max)? * self.config.scale)?;
        let x_embed = (x_embed.broadcast_div(&x_max)? * self.config.scale)?;
        Ok((y_embed, x_embed))
    }

    /// Per-channel wavelengths: `temperature^(2 * (i / 2) / num_pos_feats)`.
    fn dim_tensor(&self, device: &Device) -> Result<Tensor> {
        let n = self.config.num_pos_feats;
        let dim_t: Vec<f32> = (0..n)
            .map(|i| {
                let exponent = 2.0 * ((i / 2) as f64) / (n as f64);
                self.config.temperature.powf(exponent) as f32
            })
            .collect();
        Tensor::from_vec(dim_t, n, device)
    }
}

/// Apply sin to even channels and cos to odd channels of `[B, H, W, F]`,
/// keeping the interleaved channel order.
fn sin_cos_interleaved(pos: &Tensor) -> Result<Tensor> {
    let (b, h, w, f) = pos.dims4()?;
    // Adjacent (even, odd) channel pairs become the last axis of size 2.
    let pairs = pos.reshape((b, h, w, f / 2, 2))?;
    let sin = pairs.narrow(4, 0, 1)?.sin()?;
    let cos = pairs.narrow(4, 1, 1)?.cos()?;
    Tensor::cat(&[&sin, &cos], 4)?.reshape((b, h, w, f))
}

/// Learned position embedding: one row table and one column table, looked up
/// by pixel coordinate and broadcast across the orthogonal axis.
pub struct PositionEmbeddingLearned {
    row_embed: Embedding,
    col_embed: Embedding,
    num_pos_feats: usize,
    max_spatial_size: usize,
}

impl PositionEmbeddingLearned {
    /// Table weights are uniform-initialized in [0, 1), matching the original
    /// DETR reset.
    pub fn new(num_pos_feats: usize, max_spatial_size: usize, vb: VarBuilder) -> Result<Self> {
        let init = Init::Uniform { lo: 0.0, up: 1.0 };
        let row = vb.get_with_hints(
            (max_spatial_size, num_pos_feats),
            "row_embed.weight",
            init,
        )?;
        let col = vb.get_with_hints(
            (max_spatial_size, num_pos_feats),
            "col_embed.weight",
            init,
        )?;
        Ok(Self {
            row_embed: Embedding::new(row, num_pos_feats),
            col_embed: Embedding::new(col, num_pos_feats),
            num_pos_feats,
            max_spatial_size,
        })
    }

    /// Only the mask's shape matters: the same `[2 * num_pos_feats, H, W]`
    /// map is replicated across the batch.
    pub fn forward(&self, mask: &Tensor) -> Result<Tensor> {
        let (batch, height, width) = mask.dims3()?;
        if height > self.max_spatial_size || width > self.max_spatial_size {
            candle_core::bail!(
                "spatial extent {height}x{width} exceeds the learned table size {}",
                self.max_spatial_size
            );
        }
        let device = mask.device();
        let i = Tensor::arange(0u32, width as u32, device)?;
        let j = Tensor::arange(0u32, height as u32, device)?;
        let x_emb = self.col_embed.forward(&i)?; // [W, F]
        let y_emb = self.row_embed.forward(&j)?; // [H, F]

        let f = self.num_pos_feats;
        let pos = Tensor::cat(
            &[
                &x_emb.unsqueeze(0)?.expand((height, width, f))?,
                &y_emb.unsqueeze(1)?.expand((height, width, f))?,
            ],
            D::Minus1,
        )?;
        pos.permute((2, 0, 1))?
            .unsqueeze(0)?
            .expand((batch, 2 * f, height, width))?
            .contiguous()
    }
}

/// A built position encoding, either variant.
pub enum PositionEncoding {
    Sine(PositionEmbeddingSine),
    Learned(PositionEmbeddingLearned),
}

impl PositionEncoding {
    /// Encode an occupancy mask as `[batch, hidden_dim, H, W]`.
    pub fn forward(&self, mask: &Tensor) -> Result<Tensor> {
        match self {
            PositionEncoding::Sine(sine) => sine.forward(mask),
            PositionEncoding::Learned(learned) => learned.forward(mask),
        }
    }
}

/// Build the configured position encoding. Each spatial axis receives
/// `hidden_dim / 2` channels so the concatenated blocks restore `hidden_dim`.
/// The `VarBuilder` is only consulted for the learned variant's tables.
pub fn build_position_encoding(
    config: &PositionEncodingConfig,
    vb: VarBuilder,
) -> Result<PositionEncoding> {
    if config.hidden_dim % 2 != 0 {
        candle_core::bail!("hidden_dim must be even, got {}", config.hidden_dim);
    }
    let num_pos_feats = config.hidden_dim / 2;
    match config.kind {
        PositionEncodingKind::Sine => {
            let sine_config = PositionEmbeddingSineConfig {
                num_pos_feats,
                temperature: config.temperature,
                normalize: config.normalize,
                scale: config.scale,
            };
            Ok(PositionEncoding::Sine(PositionEmbeddingSine::new(
                sine_config,
            )?))
        }
        PositionEncodingKind::Learned => Ok(PositionEncoding::Learned(
            PositionEmbeddingLearned::new(num_pos_feats, config.max_spatial_size, vb)?,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn test_vb() -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (varmap, vb)
    }

    #[test]
    fn test_sine_output_shape() {
        let sine = PositionEmbeddingSine::new(PositionEmbeddingSineConfig::new(64)).unwrap();
        let out = sine.forward_shape(2, 7, 11, &Device::Cpu).unwrap();
        assert_eq!(out.dims(), &[2, 128, 7, 11]);
    }

    #[test]
    fn test_sine_values_bounded() {
        let sine = PositionEmbeddingSine::new(PositionEmbeddingSineConfig::new(32)).unwrap();
        let out = sine.forward_shape(1, 16, 16, &Device::Cpu).unwrap();
        let flat = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for v in flat {
            assert!((-1.0 - 1e-6..=1.0 + 1e-6).contains(&v), "value {v} out of [-1, 1]");
        }
    }

    #[test]
    fn test_sine_normalized_max_coordinate_is_scale() {
        let config = PositionEmbeddingSineConfig::new(8);
        let scale = config.scale;
        let sine = PositionEmbeddingSine::new(config).unwrap();
        let mask = Tensor::zeros((1, 5, 9), DType::U8, &Device::Cpu).unwrap();
        let (y_embed, x_embed) = sine.axis_embeddings(&mask).unwrap();

        // Fully-unpadded axes: the last row/column carries the scale itself.
        let y_last = y_embed.narrow(1, 4, 1).unwrap();
        let x_last = x_embed.narrow(2, 8, 1).unwrap();
        for v in y_last.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!((v - scale as f32).abs() < 1e-4, "y max {v} != scale {scale}");
        }
        for v in x_last.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!((v - scale as f32).abs() < 1e-4, "x max {v} != scale {scale}");
        }
    }

    #[test]
    fn test_sine_first_channel_value() {
        // Channel 0 is sin(y) with wavelength 1, so at the top row it equals
        // sin(scale / H) up to the normalization eps.
        let height = 4;
        let config = PositionEmbeddingSineConfig::new(8);
        let scale = config.scale as f32;
        let sine = PositionEmbeddingSine::new(config).unwrap();
        let out = sine.forward_shape(1, height, 4, &Device::Cpu).unwrap();
        let got = out
            .narrow(1, 0, 1)
            .unwrap()
            .narrow(2, 0, 1)
            .unwrap()
            .narrow(3, 0, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()[0];
        let expected = (scale / height as f32).sin();
        assert!((got - expected).abs() < 1e-4, "got {got}, expected {expected}");
    }

    #[test]
    fn test_sine_padding_shrinks_coordinates() {
        // Right half of the columns padded: the x cumsum tops out at W/2.
        let mut config = PositionEmbeddingSineConfig::new(8);
        config.normalize = false;
        let sine = PositionEmbeddingSine::new(config).unwrap();
        let width = 6;
        let mask_row: Vec<u8> = (0..width).map(|x| u8::from(x >= width / 2)).collect();
        let mask = Tensor::from_vec(mask_row, (1, 1, width), &Device::Cpu).unwrap();
        let (_, x_embed) = sine.axis_embeddings(&mask).unwrap();
        let row = x_embed.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(row, vec![1.0, 2.0, 3.0, 3.0, 3.0, 3.0]);
    }

    #[test]
    fn test_sine_rejects_odd_feature_count() {
        assert!(PositionEmbeddingSine::new(PositionEmbeddingSineConfig::new(7)).is_err());
    }

    #[test]
    fn test_learned_shape_and_batch_invariance() {
        let (_varmap, vb) = test_vb();
        let learned = PositionEmbeddingLearned::new(16, 50, vb).unwrap();
        let mask1 = Tensor::zeros((1, 6, 8), DType::U8, &Device::Cpu).unwrap();
        let mask3 = Tensor::zeros((3, 6, 8), DType::U8, &Device::Cpu).unwrap();
        let out1 = learned.forward(&mask1).unwrap();
        let out3 = learned.forward(&mask3).unwrap();
        assert_eq!(out1.dims(), &[1, 32, 6, 8]);
        assert_eq!(out3.dims(), &[3, 32, 6, 8]);

        // Each batch entry is the same per-pixel map.
        let base = out1.squeeze(0).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for b in 0..3 {
            let entry = out3
                .narrow(0, b, 1)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap();
            assert_eq!(base, entry);
        }
    }

    #[test]
    fn test_learned_rejects_oversized_input() {
        let (_varmap, vb) = test_vb();
        let learned = PositionEmbeddingLearned::new(16, 10, vb).unwrap();
        let mask = Tensor::zeros((1, 11, 4), DType::U8, &Device::Cpu).unwrap();
        assert!(learned.forward(&mask).is_err());
    }

    #[test]
    fn test_builder_dispatch() {
        let (_varmap, vb) = test_vb();
        let sine = build_position_encoding(&PositionEncodingConfig::sine(256), vb.clone()).unwrap();
        assert!(matches!(sine, PositionEncoding::Sine(_)));
        let learned =
            build_position_encoding(&PositionEncodingConfig::learned(256), vb.clone()).unwrap();
        assert!(matches!(learned, PositionEncoding::Learned(_)));

        // Either variant restores hidden_dim channels.
        let mask = Tensor::zeros((1, 5, 5), DType::U8, &Device::Cpu).unwrap();
        assert_eq!(sine.forward(&mask).unwrap().dims(), &[1, 256, 5, 5]);
        assert_eq!(learned.forward(&mask).unwrap().dims(), &[1, 256, 5, 5]);
    }

    #[test]
    fn test_builder_rejects_odd_hidden_dim() {
        let (_varmap, vb) = test_vb();
        assert!(build_position_encoding(&PositionEncodingConfig::sine(255), vb).is_err());
    }
}
