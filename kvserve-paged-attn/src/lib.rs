//! Kernel seam for the kvserve paged attention engine.
//!
//! This crate defines the argument set handed to backend attention kernels,
//! the [`AttentionBackend`] capability trait and its reference
//! implementations, and the data-movement kernels (slice, KV write, rotary)
//! those backends are built from. All reference kernels run on any
//! [`candle_core::Device`], including the CPU.

mod backend;
pub mod telemetry;

pub use backend::{
    apply_rotary_embedding, backend_for, gather_rows, get_tensor_device_ptr, reshape_and_cache,
    slice_rows, AttentionBackend, AttentionBackendKind, DeviceDataPtr, DeviceStream,
    FlashAttentionBackend, KvCacheArgs, KvCacheGeometry, KvLayout, NaiveAttentionBackend,
    PagedAttentionArgs, PagedPointerBackend, SliceTilingData, SliceTilingRef,
};
