use candle_core::{DType, Device, IndexOp, Tensor};
use tracing::info;

use crate::{
    config::{RopeScalingKind, RotaryConfig},
    error::{Error, Result},
};

/// Precomputed rotary table, `[max_position, rotary_dim]` with the cosines in
/// the first half of each row and the sines in the second.
///
/// Built once and only read afterwards; share it between layers with `Arc`.
#[derive(Debug, Clone)]
pub struct RotaryPositionCache {
    cos_sin: Tensor,
    max_position: usize,
    rotary_dim: usize,
    is_neox: bool,
}

impl RotaryPositionCache {
    pub fn new(cfg: &RotaryConfig, head_dim: usize, dtype: DType, dev: &Device) -> Result<Self> {
        let rotary_dim = cfg.rotary_dim.unwrap_or(head_dim);
        if rotary_dim == 0 || !rotary_dim.is_multiple_of(2) || rotary_dim > head_dim {
            return Err(Error::Config(format!(
                "rotary dim {rotary_dim} must be even, non-zero and at most {head_dim}"
            )));
        }
        let max_pos = cfg.max_position_embeddings;
        let (kind, factor) = cfg
            .scaling
            .map(|s| (s.kind, s.factor))
            .unwrap_or((RopeScalingKind::Default, 1.0));

        // Every variant is the default table with a different length, base and position scale.
        let (max_position, base, position_scale) = match kind {
            RopeScalingKind::Default => (max_pos, cfg.base, 1.0),
            RopeScalingKind::Linear => ((max_pos as f64 * factor) as usize, cfg.base, factor),
            RopeScalingKind::Dynamic => {
                let len = (max_pos as f64 * factor) as usize;
                let ntk = factor * len as f64 / max_pos as f64 - (factor - 1.0);
                let base = cfg.base * ntk.powf(rotary_dim as f64 / (rotary_dim as f64 - 2.0));
                (len, base, 1.0)
            }
        };
        if max_position == 0 {
            return Err(Error::Config("rotary table has no positions".to_string()));
        }

        let inv_freq: Vec<_> = (0..rotary_dim)
            .step_by(2)
            .map(|i| 1f32 / base.powf(i as f64 / rotary_dim as f64) as f32)
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), dev)?;
        let t = Tensor::arange(0u32, max_position as u32, dev)?
            .to_dtype(DType::F32)?
            .affine(1.0 / position_scale, 0.0)?
            .reshape((max_position, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        let cos_sin = Tensor::cat(&[&freqs.cos()?, &freqs.sin()?], 1)?.to_dtype(dtype)?;

        info!(
            max_position,
            rotary_dim,
            ?kind,
            base,
            "built rotary position cache"
        );
        Ok(Self {
            cos_sin,
            max_position,
            rotary_dim,
            is_neox: cfg.is_neox,
        })
    }

    /// The `[rotary_dim]` row of `position`.
    pub fn lookup(&self, position: usize) -> Result<Tensor> {
        self.check(position)?;
        Ok(self.cos_sin.i(position)?)
    }

    /// Rows for each of `positions`, `[positions.len(), rotary_dim]`.
    pub fn gather(&self, positions: &[u32]) -> Result<Tensor> {
        for &p in positions {
            self.check(p as usize)?;
        }
        let ids = Tensor::from_slice(positions, positions.len(), self.cos_sin.device())?;
        Ok(self.cos_sin.index_select(&ids, 0)?)
    }

    fn check(&self, position: usize) -> Result<()> {
        if position >= self.max_position {
            return Err(Error::PositionOutOfRange {
                position,
                max: self.max_position,
            });
        }
        Ok(())
    }

    pub fn cos_sin(&self) -> &Tensor {
        &self.cos_sin
    }

    pub fn max_position(&self) -> usize {
        self.max_position
    }

    pub fn rotary_dim(&self) -> usize {
        self.rotary_dim
    }

    pub fn is_neox(&self) -> bool {
        self.is_neox
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RopeScaling;

    fn cfg(scaling: Option<RopeScaling>) -> RotaryConfig {
        RotaryConfig {
            max_position_embeddings: 16,
            rotary_dim: None,
            base: 10000.0,
            is_neox: true,
            scaling,
        }
    }

    fn row(cache: &RotaryPositionCache, p: usize) -> Vec<f32> {
        cache.lookup(p).unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_default_table() {
        let cache = RotaryPositionCache::new(&cfg(None), 4, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(cache.cos_sin().dims(), &[16, 4]);
        assert_eq!(row(&cache, 0), vec![1., 1., 0., 0.]);
        // inv_freq = [1, 0.01]
        let r = row(&cache, 3);
        assert!((r[0] - 3f32.cos()).abs() < 1e-6);
        assert!((r[1] - 0.03f32.cos()).abs() < 1e-6);
        assert!((r[2] - 3f32.sin()).abs() < 1e-6);
        assert!((r[3] - 0.03f32.sin()).abs() < 1e-6);
        assert!(matches!(
            cache.lookup(16),
            Err(Error::PositionOutOfRange { position: 16, max: 16 })
        ));
    }

    #[test]
    fn test_linear_scaling_stretches_positions() {
        let scaled = RotaryPositionCache::new(
            &cfg(Some(RopeScaling {
                kind: RopeScalingKind::Linear,
                factor: 2.0,
            })),
            4,
            DType::F32,
            &Device::Cpu,
        )
        .unwrap();
        let plain = RotaryPositionCache::new(&cfg(None), 4, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(scaled.max_position(), 32);
        let (a, b) = (row(&scaled, 6), row(&plain, 3));
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_dynamic_scaling_raises_base() {
        let scaled = RotaryPositionCache::new(
            &cfg(Some(RopeScaling {
                kind: RopeScalingKind::Dynamic,
                factor: 2.0,
            })),
            4,
            DType::F32,
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(scaled.max_position(), 32);
        // The lowest frequency is always 1; the others slow down.
        let r = row(&scaled, 3);
        assert!((r[0] - 3f32.cos()).abs() < 1e-6);
        assert!(r[3] < 0.03f32.sin());
    }

    #[test]
    fn test_gather_checks_range() {
        let cache = RotaryPositionCache::new(&cfg(None), 4, DType::F32, &Device::Cpu).unwrap();
        let rows = cache.gather(&[0, 3]).unwrap();
        assert_eq!(rows.dims(), &[2, 4]);
        assert!(cache.gather(&[1, 99]).is_err());
    }
}
