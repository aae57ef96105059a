//! GPU-resident data model for the vkrt ray tracing core.
//!
//! This crate provides the plain-data types shared with the compute kernels:
//! - Ray, BVH node/block/instance and uniform block layouts
//! - The packed 24-bit integer used by hardware instance records
//! - Entry id and byte offset conversion for the BVH node buffer

pub mod layout;
pub mod packed;

pub use layout::{
    byte_offset_by_entry_id, entry_id_by_byte_offset, BuildConst, BvhBlock, BvhInstance,
    BvhNodeStruct, Mat3x4, Mat4x4, PrimitiveFlags, Ray, RtxInstance, StageUniform, UniformBlock,
    BVH_NODE_SIZE, MAT3X4_IDENTITY, MAT4_IDENTITY,
};
pub use packed::U24;

/// Shared constants.
pub mod constants {
    /// Maximum number of vertex attributes a geometry may carry.
    pub const ATTRIBUTE_EXTENT: u32 = 8;
    /// Bytes per tile in the host/device traffic buffers.
    pub const TRAFFIC_TILE_SIZE: u64 = 4;
}

/// Number of `tile`-sized tiles needed to hold `size` units (ceiling division).
///
/// Returns zero for a zero `size`.
#[inline]
pub const fn tiled(size: u64, tile: u64) -> u64 {
    size.div_ceil(tile)
}
