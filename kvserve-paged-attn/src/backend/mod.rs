mod cache;
mod paged_attention;
mod rope;
mod slice;

use std::{fmt, ops::Deref, str::FromStr};

use candle_core::{bail, DType, Device, Result, Storage, Tensor};
use serde::{Deserialize, Serialize};

pub use cache::{gather_rows, reshape_and_cache};
pub use paged_attention::{FlashAttentionBackend, NaiveAttentionBackend, PagedPointerBackend};
pub use rope::apply_rotary_embedding;
pub use slice::{slice_rows, SliceTilingData};

/// A raw address in device memory, as handed to kernels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(C)]
pub struct DeviceDataPtr {
    ptr: u64,
}

impl DeviceDataPtr {
    pub fn new(ptr: u64) -> Self {
        Self { ptr }
    }
    pub fn null() -> Self {
        Self { ptr: 0 }
    }
    pub fn is_null(&self) -> bool {
        self.ptr == 0
    }
    pub fn as_ptr_int(&self) -> u64 {
        self.ptr
    }
    /// The address `n` bytes past this one.
    pub fn offset(&self, n: usize) -> Self {
        Self {
            ptr: self.ptr + n as u64,
        }
    }
}

impl fmt::Display for DeviceDataPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.ptr)
    }
}

/// Address of the first element of `tensor` in its backing storage.
pub fn get_tensor_device_ptr(tensor: &Tensor) -> Result<DeviceDataPtr> {
    let (storage, layout) = tensor.storage_and_layout();
    let start_offset = layout.start_offset();
    let data = match storage.deref() {
        Storage::Cpu(cpu_storage) => match tensor.dtype() {
            DType::U8 => cpu_storage.as_slice::<u8>()?.as_ptr() as u64,
            DType::U32 => cpu_storage.as_slice::<u32>()?.as_ptr() as u64,
            DType::I64 => cpu_storage.as_slice::<i64>()?.as_ptr() as u64,
            DType::F16 => cpu_storage.as_slice::<half::f16>()?.as_ptr() as u64,
            DType::BF16 => cpu_storage.as_slice::<half::bf16>()?.as_ptr() as u64,
            DType::F8E4M3 => cpu_storage.as_slice::<float8::F8E4M3>()?.as_ptr() as u64,
            DType::F32 => cpu_storage.as_slice::<f32>()?.as_ptr() as u64,
            DType::F64 => cpu_storage.as_slice::<f64>()?.as_ptr() as u64,
            #[allow(unreachable_patterns)]
            dtype => bail!("no device pointer support for dtype {dtype:?}"),
        },
        #[cfg(feature = "cuda")]
        Storage::Cuda(cuda_storage) => {
            use candle_core::cuda_backend::cudarc::driver::DevicePtr;
            fn ptr<T>(slice: &candle_core::cuda_backend::cudarc::driver::CudaSlice<T>) -> u64 {
                slice.device_ptr(slice.stream()).0
            }
            match tensor.dtype() {
                DType::U8 => ptr(cuda_storage.as_cuda_slice::<u8>()?),
                DType::U32 => ptr(cuda_storage.as_cuda_slice::<u32>()?),
                DType::I64 => ptr(cuda_storage.as_cuda_slice::<i64>()?),
                DType::F16 => ptr(cuda_storage.as_cuda_slice::<half::f16>()?),
                DType::BF16 => ptr(cuda_storage.as_cuda_slice::<half::bf16>()?),
                DType::F8E4M3 => ptr(cuda_storage.as_cuda_slice::<float8::F8E4M3>()?),
                DType::F32 => ptr(cuda_storage.as_cuda_slice::<f32>()?),
                DType::F64 => ptr(cuda_storage.as_cuda_slice::<f64>()?),
                #[allow(unreachable_patterns)]
                dtype => bail!("no device pointer support for dtype {dtype:?}"),
            }
        }
        #[allow(unreachable_patterns)]
        _ => bail!("device pointers are only available for cpu and cuda storage"),
    };
    Ok(DeviceDataPtr::new(
        data + (start_offset * tensor.dtype().size_in_bytes()) as u64,
    ))
}

/// The per-rank execution stream kernels are issued on.
///
/// Launches are asynchronous with respect to the host; `synchronize` is the
/// only blocking point.
#[derive(Debug, Clone)]
pub struct DeviceStream {
    rank: usize,
    device: Device,
}

impl DeviceStream {
    pub fn new(rank: usize, device: Device) -> Self {
        Self { rank, device }
    }

    pub fn cpu(rank: usize) -> Self {
        Self::new(rank, Device::Cpu)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn synchronize(&self) -> Result<()> {
        self.device.synchronize()
    }
}

/// Physical layout of the KV arena.
///
/// Every block holds, for each layer, `block_size` key rows followed by
/// `block_size` value rows. A row is one token's `[num_kv_heads, head_dim]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KvCacheGeometry {
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub block_size: usize,
}

impl KvCacheGeometry {
    pub fn row_elems(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    pub fn rows_per_block(&self) -> usize {
        self.num_layers * 2 * self.block_size
    }

    pub fn block_elems(&self) -> usize {
        self.rows_per_block() * self.row_elems()
    }

    pub fn block_bytes(&self, dtype: DType) -> usize {
        self.block_elems() * dtype.size_in_bytes()
    }

    /// Byte distance between the key rows of consecutive layers in a block.
    pub fn layer_stride_bytes(&self, dtype: DType) -> usize {
        2 * self.block_size * self.row_elems() * dtype.size_in_bytes()
    }

    /// Byte distance from a layer's key rows to its value rows.
    pub fn value_offset_bytes(&self, dtype: DType) -> usize {
        self.block_size * self.row_elems() * dtype.size_in_bytes()
    }

    pub fn key_row(&self, block: usize, layer: usize, slot: usize) -> usize {
        (block * self.num_layers + layer) * 2 * self.block_size + slot
    }

    pub fn value_row(&self, block: usize, layer: usize, slot: usize) -> usize {
        self.key_row(block, layer, slot) + self.block_size
    }

    /// View a flat arena of `num_blocks` blocks as `[rows, row_elems]`. Shares storage.
    pub fn rows_view(&self, arena: &Tensor) -> Result<Tensor> {
        let total = arena.elem_count();
        let block_elems = self.block_elems();
        if block_elems == 0 || !total.is_multiple_of(block_elems) {
            bail!("kv arena of {total} elements is not a whole number of {block_elems}-element blocks");
        }
        arena.reshape(((total / block_elems) * self.rows_per_block(), self.row_elems()))
    }
}

/// Which physical KV addressing a backend consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KvLayout {
    /// Per-layer key/value block addresses.
    PointerList,
    /// Block ids into the contiguous arena plus per-sequence offsets.
    OffsetTable,
}

#[derive(Clone, Copy, Debug)]
pub enum KvCacheArgs<'a> {
    PointerList {
        /// `[num_layers, total_block_num, 2]` i64 key/value addresses.
        kv_list: &'a Tensor,
        /// Address of block 0 in the arena.
        arena_base: DeviceDataPtr,
    },
    OffsetTable {
        /// `[total_block_num]` u32 block ids.
        block_ids: &'a Tensor,
    },
}

/// A device-resident slice tiling and the core count it was computed for.
#[derive(Clone, Copy, Debug)]
pub struct SliceTilingRef<'a> {
    pub tiling: &'a Tensor,
    pub block_dim: usize,
}

/// The full argument set of one backend attention call.
#[derive(Clone, Copy, Debug)]
pub struct PagedAttentionArgs<'a> {
    /// `[total_token_num, (num_heads + 2 * num_kv_heads) * head_dim]`
    pub qkv: &'a Tensor,
    /// `[batch_size + 1]` u32 token offsets into `qkv`.
    pub seq_offsets: &'a Tensor,
    /// `[batch_size]` u32 KV length of each sequence including the new tokens.
    pub context_lens: &'a Tensor,
    /// `[batch_size + 1]` u32 cumulative block counts.
    pub block_offsets: &'a Tensor,
    pub kv_cache: KvCacheArgs<'a>,
    /// Flat KV arena owned by the block pool.
    pub kv_arena: &'a Tensor,
    pub geometry: KvCacheGeometry,
    /// `[total_token_num]` u32 rotary positions.
    pub rope_pos: &'a Tensor,
    /// `[max_position, rotary_dim]`, cos half then sin half.
    pub cos_sin_cache: &'a Tensor,
    pub is_neox: bool,
    /// Tilings splitting `qkv` into query, key and value.
    pub qkv_tilings: [SliceTilingRef<'a>; 3],
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub softmax_scale: f32,
    pub batch_size: usize,
    pub total_token_num: usize,
    pub total_block_num: usize,
    pub layer_index: usize,
    pub is_multi_token_forward: bool,
    pub stream: &'a DeviceStream,
}

/// A backend attention kernel. Chosen once per layer and reused for every call.
pub trait AttentionBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn layout(&self) -> KvLayout;

    /// Rotary-embed the new keys and queries, write the new keys and values into
    /// the KV arena, and attend. Returns `[total_token_num, num_heads * head_dim]`.
    fn forward(&self, args: &PagedAttentionArgs<'_>) -> Result<Tensor>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttentionBackendKind {
    /// Block-wise online softmax over an offset table.
    Flash,
    /// Dense attention over per-layer block addresses.
    Paged,
    /// Dense attention over an offset table.
    #[default]
    Naive,
}

impl FromStr for AttentionBackendKind {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "flash" => Ok(Self::Flash),
            "paged" => Ok(Self::Paged),
            "naive" => Ok(Self::Naive),
            other => Err(format!(
                "Unexpected `AttentionBackendKind`, got `{other}` but expected `flash`, `paged` or `naive`."
            )),
        }
    }
}

impl fmt::Display for AttentionBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flash => write!(f, "flash"),
            Self::Paged => write!(f, "paged"),
            Self::Naive => write!(f, "naive"),
        }
    }
}

pub fn backend_for(kind: AttentionBackendKind) -> Box<dyn AttentionBackend> {
    match kind {
        AttentionBackendKind::Flash => Box::new(FlashAttentionBackend),
        AttentionBackendKind::Paged => Box::new(PagedPointerBackend),
        AttentionBackendKind::Naive => Box::new(NaiveAttentionBackend),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_rows() {
        let g = KvCacheGeometry {
            num_layers: 2,
            num_kv_heads: 2,
            head_dim: 4,
            block_size: 4,
        };
        assert_eq!(g.row_elems(), 8);
        assert_eq!(g.rows_per_block(), 16);
        assert_eq!(g.key_row(0, 0, 0), 0);
        assert_eq!(g.value_row(0, 0, 0), 4);
        assert_eq!(g.key_row(0, 1, 3), 11);
        assert_eq!(g.key_row(1, 0, 0), 16);
        assert_eq!(g.block_bytes(DType::F32), 16 * 8 * 4);
        assert_eq!(g.layer_stride_bytes(DType::F32), 2 * 4 * 8 * 4);
    }

    #[test]
    fn test_tensor_device_ptr_offset() {
        let t = Tensor::arange(0f32, 16f32, &Device::Cpu).unwrap();
        let base = get_tensor_device_ptr(&t).unwrap();
        let tail = get_tensor_device_ptr(&t.narrow(0, 4, 4).unwrap()).unwrap();
        assert!(!base.is_null());
        assert_eq!(tail, base.offset(16));
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!(
            "flash".parse::<AttentionBackendKind>().unwrap(),
            AttentionBackendKind::Flash
        );
        assert!("cudnn".parse::<AttentionBackendKind>().is_err());
        assert_eq!(backend_for(AttentionBackendKind::Paged).name(), "paged");
        assert_eq!(
            backend_for(AttentionBackendKind::Naive).layout(),
            KvLayout::OffsetTable
        );
    }
}
