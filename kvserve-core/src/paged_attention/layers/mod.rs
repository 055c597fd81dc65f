mod input_metadata;
mod paged_attention;

pub use input_metadata::{BatchDescriptor, PagedAttentionInputMetadata, SequenceSlice, Stage};
pub use paged_attention::{AttentionDispatcher, DispatcherState, LayerParams};
