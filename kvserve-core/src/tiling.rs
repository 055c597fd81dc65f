//! Memoized slice tilings.
//!
//! A tiling depends only on the slice signature and the core budget, so it is
//! computed and copied to the device once per signature and reused by every
//! later call with the same shape.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use candle_core::Tensor;
use kvserve_paged_attn::{telemetry, DeviceStream, SliceTilingData, SliceTilingRef};
use tracing::debug;

use crate::{config::TilingConfig, error::Result};

/// Shape of a strided slice, in elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TilingSignature {
    pub start: usize,
    pub length: usize,
    pub step: usize,
    pub times: usize,
    pub element_size: usize,
}

/// A computed tiling and its device-resident copy.
#[derive(Debug)]
pub struct DeviceTiling {
    pub plan: SliceTilingData,
    pub buffer: Tensor,
}

impl DeviceTiling {
    pub fn slice_ref(&self) -> SliceTilingRef<'_> {
        SliceTilingRef {
            tiling: &self.buffer,
            block_dim: self.plan.used_core_num as usize,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TilingCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub device_uploads: u64,
}

struct Inner {
    limits: TilingConfig,
    entries: HashMap<TilingSignature, Arc<DeviceTiling>>,
    stats: TilingCacheStats,
}

/// Per-rank tiling cache, shared by that rank's dispatchers.
pub struct TilingCache {
    inner: Mutex<Inner>,
}

impl TilingCache {
    pub fn new(limits: TilingConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                limits,
                entries: HashMap::new(),
                stats: TilingCacheStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Entries are inserted whole, so a poisoned map is still usable.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Compute a tiling without caching or uploading it.
    pub fn compute(&self, sig: &TilingSignature) -> Result<SliceTilingData> {
        let limits = self.lock().limits;
        Self::compute_with(sig, &limits)
    }

    fn compute_with(sig: &TilingSignature, limits: &TilingConfig) -> Result<SliceTilingData> {
        Ok(SliceTilingData::generate(
            sig.start,
            sig.length,
            sig.step,
            sig.times,
            sig.element_size,
            limits.max_block_size,
            limits.max_used_core_num,
        )?)
    }

    /// The cached tiling for `sig`, computing and uploading it on first use.
    ///
    /// The lock is held across the upload so one signature is never uploaded twice.
    pub fn get_or_compute(
        &self,
        sig: &TilingSignature,
        stream: &DeviceStream,
    ) -> Result<Arc<DeviceTiling>> {
        let mut inner = self.lock();
        if let Some(tiling) = inner.entries.get(sig).cloned() {
            inner.stats.hits += 1;
            return Ok(tiling);
        }
        inner.stats.misses += 1;
        let plan = Self::compute_with(sig, &inner.limits)?;
        let buffer = plan.to_device(stream.device())?;
        stream.synchronize()?;
        inner.stats.device_uploads += 1;
        telemetry::record_tiling_upload(
            stream.rank(),
            (SliceTilingData::NUM_WORDS * std::mem::size_of::<u32>()) as u64,
        );
        debug!(rank = stream.rank(), ?sig, ?plan, "computed slice tiling");

        let tiling = Arc::new(DeviceTiling { plan, buffer });
        inner.entries.insert(*sig, tiling.clone());
        Ok(tiling)
    }

    /// Drop one entry. Returns whether it was cached.
    pub fn invalidate(&self, sig: &TilingSignature) -> bool {
        self.lock().entries.remove(sig).is_some()
    }

    /// Change the core budget. Every cached tiling was sized for the old one and is dropped.
    pub fn set_max_used_core_num(&self, max_used_core_num: usize) {
        let mut inner = self.lock();
        inner.limits.max_used_core_num = max_used_core_num;
        inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TilingCacheStats {
        self.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(length: usize, times: usize) -> TilingSignature {
        TilingSignature {
            start: 0,
            length,
            step: length,
            times,
            element_size: 1,
        }
    }

    #[test]
    fn test_short_row_is_one_block() {
        let cache = TilingCache::new(TilingConfig::default());
        let plan = cache.compute(&sig(200, 1)).unwrap();
        assert_eq!(
            (plan.block_size, plan.tail_block_size, plan.step_block_num),
            (200, 200, 1)
        );
    }

    #[test]
    fn test_long_row_has_tail() {
        let cache = TilingCache::new(TilingConfig::default());
        let plan = cache.compute(&sig(300, 1)).unwrap();
        assert_eq!(
            (plan.block_size, plan.tail_block_size, plan.step_block_num),
            (256, 44, 2)
        );
    }

    #[test]
    fn test_core_bound() {
        let cache = TilingCache::new(TilingConfig::default());
        for (length, times) in [(200, 1), (300, 7), (300, 24), (300, 25), (1024, 100)] {
            let plan = cache.compute(&sig(length, times)).unwrap();
            assert_eq!(
                plan.used_core_num as usize,
                (times * plan.step_block_num as usize).min(48)
            );
        }
    }

    #[test]
    fn test_memoized_upload() {
        let cache = TilingCache::new(TilingConfig::default());
        let stream = DeviceStream::cpu(0);
        let a = cache.get_or_compute(&sig(300, 4), &stream).unwrap();
        let b = cache.get_or_compute(&sig(300, 4), &stream).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = cache.get_or_compute(&sig(200, 4), &stream).unwrap();
        assert_ne!(a.plan, c.plan);
        assert_eq!(
            cache.stats(),
            TilingCacheStats {
                hits: 1,
                misses: 2,
                device_uploads: 2
            }
        );
        assert_eq!(
            c.buffer.to_vec1::<u32>().unwrap(),
            c.plan.to_words().to_vec()
        );
    }

    #[test]
    fn test_every_field_keys_the_cache() {
        let cache = TilingCache::new(TilingConfig::default());
        let stream = DeviceStream::cpu(0);
        let base = sig(300, 4);
        let variants = [
            base,
            TilingSignature { start: 8, ..base },
            TilingSignature { step: 600, ..base },
            TilingSignature { times: 5, ..base },
            TilingSignature {
                element_size: 2,
                ..base
            },
        ];
        let plans = variants
            .iter()
            .map(|s| cache.get_or_compute(s, &stream).unwrap().plan)
            .collect::<Vec<_>>();
        assert_eq!(cache.len(), variants.len());
        assert_eq!(cache.stats().hits, 0);
        for (i, (s, plan)) in variants.iter().zip(&plans).enumerate() {
            assert_eq!(plan, &cache.compute(s).unwrap());
            for other in &plans[i + 1..] {
                assert_ne!(plan, other);
            }
        }
        // Repeating any of them is a hit on its own entry.
        for s in &variants {
            cache.get_or_compute(s, &stream).unwrap();
        }
        assert_eq!(cache.stats().hits, variants.len() as u64);
        assert_eq!(cache.stats().device_uploads, variants.len() as u64);
    }

    #[test]
    fn test_invalidate_and_core_budget() {
        let cache = TilingCache::new(TilingConfig::default());
        let stream = DeviceStream::cpu(0);
        let s = sig(300, 40);
        assert_eq!(cache.get_or_compute(&s, &stream).unwrap().plan.used_core_num, 48);
        assert!(cache.invalidate(&s));
        assert!(!cache.invalidate(&s));
        cache.get_or_compute(&s, &stream).unwrap();
        cache.set_max_used_core_num(8);
        assert!(cache.is_empty());
        assert_eq!(cache.get_or_compute(&s, &stream).unwrap().plan.used_core_num, 8);
        assert_eq!(cache.stats().device_uploads, 3);
    }

    #[test]
    fn test_shared_across_threads() {
        let cache = Arc::new(TilingCache::new(TilingConfig::default()));
        let handles = (0..4)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    let stream = DeviceStream::cpu(0);
                    cache.get_or_compute(&sig(512, 3), &stream).unwrap().plan
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.stats().device_uploads, 1);
        assert_eq!(cache.len(), 1);
    }
}
