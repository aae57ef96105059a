//! Fixed-size structures shared with the compute kernels.
//!
//! Every type here is read by GPU code at fixed byte offsets. Field order,
//! field width and total size are part of the kernel ABI; the tests at the
//! bottom of this file pin them.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3};
use half::f16;

use crate::packed::U24;

/// Row-major 3x4 affine transform (three rows of four floats).
pub type Mat3x4 = [[f32; 4]; 3];

/// Row-major 4x4 matrix.
pub type Mat4x4 = [[f32; 4]; 4];

/// Identity 3x4 transform.
pub const MAT3X4_IDENTITY: Mat3x4 = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
];

/// Identity 4x4 matrix.
pub const MAT4_IDENTITY: Mat4x4 = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// Take the top three rows of a column-major glam matrix.
pub fn mat3x4_from_mat4(m: Mat4) -> Mat3x4 {
    [m.row(0).to_array(), m.row(1).to_array(), m.row(2).to_array()]
}

/// A ray as stored in the ray buffer (36 bytes).
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Ray {
    /// Ray origin.
    pub origin: Vec3,
    /// Id of the closest hit, [`Ray::NO_HIT`] when nothing was hit.
    pub hit_id: i32,
    /// Direction in polar form.
    pub polar_direction: Vec2,
    /// Index slot for external ray systems.
    pub index: u32,
    /// Half-float RGB throughput.
    pub color: [f16; 3],
    /// Kernel-owned state bits.
    pub bitfield: u16,
}

impl Ray {
    /// Hit id of a ray that missed.
    pub const NO_HIT: i32 = -1;

    /// Create a ray with white throughput and no hit.
    pub fn new(origin: Vec3, polar_direction: Vec2) -> Self {
        Self {
            origin,
            hit_id: Self::NO_HIT,
            polar_direction,
            color: [f16::ONE; 3],
            ..Self::default()
        }
    }

    /// Whether the ray recorded a hit.
    #[inline]
    pub const fn has_hit(&self) -> bool {
        self.hit_id >= 0
    }

    /// Throughput as full-precision floats.
    pub fn color_f32(&self) -> [f32; 3] {
        self.color.map(f16::to_f32)
    }

    /// Store throughput, rounding to half precision.
    pub fn set_color(&mut self, rgb: [f32; 3]) {
        self.color = rgb.map(f16::from_f32);
    }
}

bitflags! {
    /// Face and pass flags in [`UniformBlock::bitfield`].
    ///
    /// Bits 0-1 hold the hit group and are accessed through
    /// [`UniformBlock::hit_group`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PrimitiveFlags: u32 {
        const FRONT_FACE = 1 << 2;
        const BACK_FACE = 1 << 3;
        const SECONDARY = 1 << 4;
    }
}

/// Per-geometry constants consumed by the vertex assembly kernels (48 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct UniformBlock {
    pub primitive_count: u32,
    pub vertex_accessor: u32,
    pub index_accessor: u32,
    pub material_accessor: u32,

    pub primitive_offset: u32,
    pub attribute_offset: u32,
    pub attribute_count: u32,
    pub bitfield: u32,

    pub material_id: u32,
    pub read_offset: u32,
    pub reserved: [u32; 2],
}

impl UniformBlock {
    /// Accessor value meaning "not bound".
    pub const UNBOUND: u32 = u32::MAX;

    const HIT_GROUP_MASK: u32 = 0b11;

    /// Hit group (two bits).
    #[inline]
    pub const fn hit_group(&self) -> u32 {
        self.bitfield & Self::HIT_GROUP_MASK
    }

    /// Set the hit group; only the low two bits are kept.
    #[inline]
    pub fn set_hit_group(&mut self, group: u32) {
        self.bitfield = (self.bitfield & !Self::HIT_GROUP_MASK) | (group & Self::HIT_GROUP_MASK);
    }

    /// Face and pass flags.
    #[inline]
    pub const fn flags(&self) -> PrimitiveFlags {
        PrimitiveFlags::from_bits_truncate(self.bitfield)
    }

    /// Replace the face and pass flags, keeping the hit group.
    #[inline]
    pub fn set_flags(&mut self, flags: PrimitiveFlags) {
        self.bitfield = (self.bitfield & Self::HIT_GROUP_MASK) | flags.bits();
    }
}

impl Default for UniformBlock {
    fn default() -> Self {
        Self {
            primitive_count: 0,
            vertex_accessor: 0,
            index_accessor: Self::UNBOUND,
            material_accessor: Self::UNBOUND,
            primitive_offset: 0,
            attribute_offset: 0,
            attribute_count: 8,
            bitfield: 0,
            material_id: 0,
            read_offset: 0,
            reserved: [0; 2],
        }
    }
}

/// Per-dispatch ray tracing stage constants (32 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct StageUniform {
    pub current_group: i32,
    pub max_ray_count: i32,
    pub max_hit_count: i32,
    pub closest_hit_offset: i32,
    pub width: i32,
    pub height: i32,
    pub last_iteration: i32,
    pub iteration: i32,
}

impl Default for StageUniform {
    fn default() -> Self {
        Self {
            current_group: 0,
            max_ray_count: 0,
            max_hit_count: 0,
            closest_hit_offset: 0,
            width: 1,
            height: 1,
            last_iteration: 0,
            iteration: 0,
        }
    }
}

/// Header of one bottom-level BVH (96 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct BvhBlock {
    pub entry_id: i32,
    pub leaf_count: i32,
    pub primitive_count: i32,
    pub primitive_offset: i32,
    pub transform: Mat3x4,
    pub scene_min: [f32; 4],
    pub scene_max: [f32; 4],
}

impl Default for BvhBlock {
    fn default() -> Self {
        Self {
            entry_id: 0,
            leaf_count: 0,
            primitive_count: 0,
            primitive_offset: 0,
            transform: MAT3X4_IDENTITY,
            scene_min: [0.0; 4],
            scene_max: [0.0; 4],
        }
    }
}

/// Placement of a BVH block in the top-level structure (112 bytes).
///
/// `transform_in` is supplied by the caller alongside `transform`; it is not
/// derived from it.
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct BvhInstance {
    pub bvh_block_id: i32,
    pub entry_id: i32,
    pub reserved: [i32; 2],
    pub transform: Mat3x4,
    pub transform_in: Mat3x4,
}

impl Default for BvhInstance {
    fn default() -> Self {
        Self {
            bvh_block_id: 0,
            entry_id: 0,
            reserved: [0; 2],
            transform: MAT3X4_IDENTITY,
            transform_in: MAT3X4_IDENTITY,
        }
    }
}

/// Build constants for one BVH build dispatch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BuildConst {
    pub primitive_count: i32,
    pub primitive_offset: i32,
}

/// One BVH node as laid out in the node buffer (64 bytes).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BvhNodeStruct {
    pub children: [[u32; 2]; 6],
    pub data: [u32; 4],
}

/// Size of [`BvhNodeStruct`] in bytes.
pub const BVH_NODE_SIZE: u64 = std::mem::size_of::<BvhNodeStruct>() as u64;

/// Entry id of the node at `byte_offset`, rounded to the nearest even entry.
#[inline]
pub const fn entry_id_by_byte_offset(byte_offset: u64) -> u32 {
    (((byte_offset / BVH_NODE_SIZE + 1) >> 1) << 1) as u32
}

/// Byte offset of the node with `entry_id`.
///
/// The shift pair is an identity for every `u32` id and matches the kernel
/// side formula.
#[inline]
pub const fn byte_offset_by_entry_id(entry_id: u32) -> u64 {
    ((entry_id as u64 * BVH_NODE_SIZE) << 1) >> 1
}

/// Hardware ray tracing instance record (64 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct RtxInstance {
    pub transform: [f32; 12],
    pub instance_id: U24,
    pub mask: u8,
    pub instance_offset: U24,
    pub flags: u8,
    pub acceleration_structure_handle: u64,
}

impl Default for RtxInstance {
    fn default() -> Self {
        Self {
            transform: bytemuck::cast(MAT3X4_IDENTITY),
            instance_id: U24::ZERO,
            mask: 0,
            instance_offset: U24::ZERO,
            flags: 0,
            acceleration_structure_handle: 0,
        }
    }
}
