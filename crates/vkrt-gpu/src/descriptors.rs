//! Descriptor set layouts, the named layout catalog and the descriptor pool.
//!
//! The binding tables below are compiled into the compute kernels. Binding
//! indices, descriptor types and counts must match the SPIR-V exactly,
//! including the indices a layout leaves unused.

use crate::error::{GpuError, Result};
use ash::vk;
use hashbrown::HashMap;

/// One binding of a catalog layout. Every catalog binding is compute-only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
}

const fn buf(binding: u32) -> LayoutBinding {
    LayoutBinding {
        binding,
        ty: vk::DescriptorType::STORAGE_BUFFER,
        count: 1,
    }
}

const fn texel(binding: u32, count: u32) -> LayoutBinding {
    LayoutBinding {
        binding,
        ty: vk::DescriptorType::STORAGE_TEXEL_BUFFER,
        count,
    }
}

const fn uniform_texel(binding: u32, count: u32) -> LayoutBinding {
    LayoutBinding {
        binding,
        ty: vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        count,
    }
}

// rays, hit heads, closest hits, misses, hit payloads, ray indices,
// constants, counters, ray lines, traverse cache, ray-hit payload bindings
const RAY_TRACING: &[LayoutBinding] = &[
    buf(0),
    buf(1),
    buf(2),
    buf(3),
    buf(4),
    buf(5),
    buf(6),
    buf(7),
    buf(8),
    texel(9, 1),
    texel(10, 1),
];

const HLBVH2: &[LayoutBinding] = &[buf(0), texel(1, 1), buf(2), uniform_texel(3, 1)];

// Binding 2 is reserved.
const HLBVH2_WORK: &[LayoutBinding] = &[
    buf(0),
    buf(1),
    buf(3),
    buf(4),
    buf(5),
    buf(6),
    buf(7),
    buf(8),
    buf(9),
];

const VERTEX_DATA: &[LayoutBinding] = &[
    buf(0),
    buf(1),
    buf(2),
    texel(3, 1),
    LayoutBinding {
        binding: 4,
        ty: vk::DescriptorType::STORAGE_IMAGE,
        count: 1,
    },
    uniform_texel(5, 1),
    LayoutBinding {
        binding: 6,
        ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        count: 1,
    },
];

const RADIX_SORT_BIND: &[LayoutBinding] = &[buf(0), buf(1)];

// Bindings 0 and 1 live in radixSortBind.
const RADIX_SORT: &[LayoutBinding] = &[buf(2), buf(3), buf(4), buf(5), buf(6)];

const MATERIAL_SET: &[LayoutBinding] = &[
    LayoutBinding {
        binding: 0,
        ty: vk::DescriptorType::SAMPLED_IMAGE,
        count: 64,
    },
    LayoutBinding {
        binding: 1,
        ty: vk::DescriptorType::SAMPLER,
        count: 16,
    },
    buf(2),
    buf(3),
    buf(4),
];

const VERTEX_INPUT_SET: &[LayoutBinding] = &[
    uniform_texel(0, 1),
    buf(1),
    buf(2),
    buf(3),
    buf(4),
    buf(5),
];

const VERTEX_INPUT_V2_IN: &[LayoutBinding] = &[
    uniform_texel(0, 1),
    uniform_texel(1, 8),
    uniform_texel(2, 1),
    buf(3),
];

const VERTEX_INPUT_V2_OUT: &[LayoutBinding] = &[texel(0, 1), texel(1, 8), texel(2, 1)];

/// Names of the catalog layouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorLayoutName {
    RayTracing,
    Hlbvh2,
    Hlbvh2Work,
    VertexData,
    RadixSortBind,
    RadixSort,
    MaterialSet,
    VertexInputSet,
    VertexInputV2In,
    VertexInputV2Out,
}

impl DescriptorLayoutName {
    /// Every catalog layout, in creation order.
    pub const ALL: [Self; 10] = [
        Self::RayTracing,
        Self::Hlbvh2,
        Self::Hlbvh2Work,
        Self::VertexData,
        Self::RadixSortBind,
        Self::RadixSort,
        Self::MaterialSet,
        Self::VertexInputSet,
        Self::VertexInputV2In,
        Self::VertexInputV2Out,
    ];

    /// The catalog key as used by the kernels' host code.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RayTracing => "rayTracing",
            Self::Hlbvh2 => "hlbvh2",
            Self::Hlbvh2Work => "hlbvh2work",
            Self::VertexData => "vertexData",
            Self::RadixSortBind => "radixSortBind",
            Self::RadixSort => "radixSort",
            Self::MaterialSet => "materialSet",
            Self::VertexInputSet => "vertexInputSet",
            Self::VertexInputV2In => "vertexInputV2In",
            Self::VertexInputV2Out => "vertexInputV2Out",
        }
    }

    /// Look a name up by its catalog key. Matching is exact.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|n| n.as_str() == name)
    }

    /// The binding table of this layout.
    pub const fn bindings(self) -> &'static [LayoutBinding] {
        match self {
            Self::RayTracing => RAY_TRACING,
            Self::Hlbvh2 => HLBVH2,
            Self::Hlbvh2Work => HLBVH2_WORK,
            Self::VertexData => VERTEX_DATA,
            Self::RadixSortBind => RADIX_SORT_BIND,
            Self::RadixSort => RADIX_SORT,
            Self::MaterialSet => MATERIAL_SET,
            Self::VertexInputSet => VERTEX_INPUT_SET,
            Self::VertexInputV2In => VERTEX_INPUT_V2_IN,
            Self::VertexInputV2Out => VERTEX_INPUT_V2_OUT,
        }
    }
}

/// Descriptor set layout builder.
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl<'a> DescriptorSetLayoutBuilder<'a> {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Create a builder holding a catalog table, all bindings compute-visible.
    pub fn compute(table: &[LayoutBinding]) -> Self {
        table.iter().fold(Self::new(), |builder, b| {
            builder.binding(b.binding, b.ty, b.count, vk::ShaderStageFlags::COMPUTE)
        })
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);

        let layout = device.create_descriptor_set_layout(&layout_info, None)?;
        Ok(layout)
    }
}

impl Default for DescriptorSetLayoutBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Named descriptor set layouts shared by every pipeline on a device.
///
/// Created once during device construction and immutable afterwards.
#[derive(Debug, Default)]
pub struct DescriptorLayoutCatalog {
    layouts: HashMap<DescriptorLayoutName, vk::DescriptorSetLayout>,
}

impl DescriptorLayoutCatalog {
    /// Create every catalog layout.
    ///
    /// On failure the layouts created so far are destroyed.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn create(device: &ash::Device) -> Result<Self> {
        let mut catalog = Self::default();

        for name in DescriptorLayoutName::ALL {
            match DescriptorSetLayoutBuilder::compute(name.bindings()).build(device) {
                Ok(layout) => {
                    catalog.layouts.insert(name, layout);
                }
                Err(e) => {
                    catalog.destroy(device);
                    return Err(GpuError::InitializationFailed(format!(
                        "descriptor set layout {}: {e}",
                        name.as_str()
                    )));
                }
            }
        }

        tracing::debug!(count = catalog.layouts.len(), "Created descriptor layout catalog");
        Ok(catalog)
    }

    /// Build a catalog over existing layout handles.
    pub fn from_handles(
        handles: impl IntoIterator<Item = (DescriptorLayoutName, vk::DescriptorSetLayout)>,
    ) -> Self {
        Self {
            layouts: handles.into_iter().collect(),
        }
    }

    /// Get a layout handle.
    pub fn get(&self, name: DescriptorLayoutName) -> Option<vk::DescriptorSetLayout> {
        self.layouts.get(&name).copied()
    }

    /// Get a layout handle by its catalog key.
    pub fn get_by_name(&self, name: &str) -> Option<vk::DescriptorSetLayout> {
        DescriptorLayoutName::from_name(name).and_then(|n| self.get(n))
    }

    /// Get a layout handle, failing with [`GpuError::ResourceNotFound`].
    pub fn require(&self, name: DescriptorLayoutName) -> Result<vk::DescriptorSetLayout> {
        self.get(name)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("descriptor layout {}", name.as_str())))
    }

    /// Number of layouts held.
    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    /// Whether the catalog holds no layouts.
    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    /// Destroy every layout.
    ///
    /// # Safety
    /// The device must be valid and no pipeline layout created from these
    /// layouts may be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for (_, layout) in self.layouts.drain() {
            device.destroy_descriptor_set_layout(layout, None);
        }
    }
}

/// Maximum number of descriptor sets allocated from a device pool at once.
pub const MAX_DESCRIPTOR_SETS: u32 = 128;

/// Pool sizes of the device descriptor pool.
pub const DESCRIPTOR_POOL_SIZES: [vk::DescriptorPoolSize; 8] = [
    vk::DescriptorPoolSize {
        ty: vk::DescriptorType::STORAGE_BUFFER,
        descriptor_count: 8,
    },
    vk::DescriptorPoolSize {
        ty: vk::DescriptorType::STORAGE_BUFFER,
        descriptor_count: 32,
    },
    vk::DescriptorPoolSize {
        ty: vk::DescriptorType::STORAGE_IMAGE,
        descriptor_count: 32,
    },
    vk::DescriptorPoolSize {
        ty: vk::DescriptorType::SAMPLED_IMAGE,
        descriptor_count: 256,
    },
    vk::DescriptorPoolSize {
        ty: vk::DescriptorType::SAMPLER,
        descriptor_count: 32,
    },
    vk::DescriptorPoolSize {
        ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        descriptor_count: 256,
    },
    vk::DescriptorPoolSize {
        ty: vk::DescriptorType::UNIFORM_BUFFER,
        descriptor_count: 4,
    },
    vk::DescriptorPoolSize {
        ty: vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        descriptor_count: 8,
    },
];

/// Pool sizes holding exactly one set with `bindings`, one entry per
/// descriptor type.
pub fn pool_sizes_for(bindings: &[LayoutBinding]) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for b in bindings {
        match sizes.iter_mut().find(|size| size.ty == b.ty) {
            Some(size) => size.descriptor_count += b.count,
            None => sizes.push(vk::DescriptorPoolSize {
                ty: b.ty,
                descriptor_count: b.count,
            }),
        }
    }
    sizes
}

/// Whether a pool with `pool_sizes` has room for one set with `bindings`.
pub fn pool_covers(pool_sizes: &[vk::DescriptorPoolSize], bindings: &[LayoutBinding]) -> bool {
    pool_sizes_for(bindings).iter().all(|needed| {
        let available: u32 = pool_sizes
            .iter()
            .filter(|size| size.ty == needed.ty)
            .map(|size| size.descriptor_count)
            .sum();
        available >= needed.descriptor_count
    })
}

/// Descriptor pool for allocating descriptor sets.
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    /// Create a new descriptor pool.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

        let pool = device.create_descriptor_pool(&create_info, None)?;
        Ok(Self { pool })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Allocate descriptor sets.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(
        &self,
        device: &ash::Device,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        let sets = device.allocate_descriptor_sets(&alloc_info)?;
        Ok(sets)
    }

    /// Return descriptor sets to the pool.
    ///
    /// # Safety
    /// The device must be valid and the sets must not be in use.
    pub unsafe fn free(&self, device: &ash::Device, sets: &[vk::DescriptorSet]) -> Result<()> {
        device.free_descriptor_sets(self.pool, sets)?;
        Ok(())
    }

    /// Destroy the pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_descriptor_pool(self.pool, None);
    }
}

/// Write a storage buffer descriptor.
///
/// # Safety
/// Device and buffer must be valid.
pub unsafe fn write_storage_buffer(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    buffer: vk::Buffer,
    offset: u64,
    range: u64,
) {
    let buffer_info = vk::DescriptorBufferInfo::default()
        .buffer(buffer)
        .offset(offset)
        .range(range);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(dst_set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
        .buffer_info(std::slice::from_ref(&buffer_info));

    device.update_descriptor_sets(&[write], &[]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn indices(name: DescriptorLayoutName) -> Vec<u32> {
        name.bindings().iter().map(|b| b.binding).collect()
    }

    fn fake_catalog() -> DescriptorLayoutCatalog {
        DescriptorLayoutCatalog::from_handles(
            DescriptorLayoutName::ALL
                .into_iter()
                .zip(1u64..)
                .map(|(name, raw)| (name, vk::DescriptorSetLayout::from_raw(raw))),
        )
    }

    #[test]
    fn names_round_trip() {
        for name in DescriptorLayoutName::ALL {
            assert_eq!(DescriptorLayoutName::from_name(name.as_str()), Some(name));
        }
        assert_eq!(DescriptorLayoutName::from_name("raytracing"), None);
        assert_eq!(DescriptorLayoutName::from_name("rayTracing "), None);
        assert_eq!(DescriptorLayoutName::from_name(""), None);
    }

    #[test]
    fn reserved_gaps_are_kept() {
        assert_eq!(indices(DescriptorLayoutName::Hlbvh2Work), [0, 1, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(indices(DescriptorLayoutName::RadixSort), [2, 3, 4, 5, 6]);
        assert!(!indices(DescriptorLayoutName::Hlbvh2Work).contains(&2));
    }

    #[test]
    fn ray_tracing_table() {
        let table = DescriptorLayoutName::RayTracing.bindings();
        assert_eq!(table.len(), 11);
        for (i, b) in table.iter().enumerate() {
            assert_eq!(b.binding, i as u32);
            assert_eq!(b.count, 1);
            let expected = if i < 9 {
                vk::DescriptorType::STORAGE_BUFFER
            } else {
                vk::DescriptorType::STORAGE_TEXEL_BUFFER
            };
            assert_eq!(b.ty, expected);
        }
    }

    #[test]
    fn array_counts() {
        let material = DescriptorLayoutName::MaterialSet.bindings();
        assert_eq!((material[0].ty, material[0].count), (vk::DescriptorType::SAMPLED_IMAGE, 64));
        assert_eq!((material[1].ty, material[1].count), (vk::DescriptorType::SAMPLER, 16));

        let v2_in = DescriptorLayoutName::VertexInputV2In.bindings();
        assert_eq!(v2_in[1].count, 8);
        assert_eq!(v2_in[1].ty, vk::DescriptorType::UNIFORM_TEXEL_BUFFER);

        let v2_out = DescriptorLayoutName::VertexInputV2Out.bindings();
        assert_eq!(v2_out[1].count, 8);
        assert!(v2_out.iter().all(|b| b.ty == vk::DescriptorType::STORAGE_TEXEL_BUFFER));
    }

    #[test]
    fn vertex_data_types() {
        let types: Vec<_> = DescriptorLayoutName::VertexData
            .bindings()
            .iter()
            .map(|b| b.ty)
            .collect();
        assert_eq!(
            types,
            [
                vk::DescriptorType::STORAGE_BUFFER,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::DescriptorType::STORAGE_TEXEL_BUFFER,
                vk::DescriptorType::STORAGE_IMAGE,
                vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            ]
        );
    }

    #[test]
    fn builder_is_compute_only_and_ordered() {
        for name in DescriptorLayoutName::ALL {
            let builder = DescriptorSetLayoutBuilder::compute(name.bindings());
            assert_eq!(builder.bindings.len(), name.bindings().len());
            for (built, def) in builder.bindings.iter().zip(name.bindings()) {
                assert_eq!(built.binding, def.binding);
                assert_eq!(built.descriptor_type, def.ty);
                assert_eq!(built.descriptor_count, def.count);
                assert_eq!(built.stage_flags, vk::ShaderStageFlags::COMPUTE);
            }
        }
    }

    #[test]
    fn lookups_are_stable() {
        let catalog = fake_catalog();
        assert_eq!(catalog.len(), DescriptorLayoutName::ALL.len());
        for name in DescriptorLayoutName::ALL {
            let first = catalog.get(name);
            assert!(first.is_some());
            assert_eq!(catalog.get(name), first);
            assert_eq!(catalog.get_by_name(name.as_str()), first);
            assert_eq!(name.bindings(), name.bindings());
        }
    }

    #[test]
    fn missing_layout_is_not_found() {
        let catalog = DescriptorLayoutCatalog::from_handles([(
            DescriptorLayoutName::RayTracing,
            vk::DescriptorSetLayout::from_raw(7),
        )]);
        assert!(catalog.get(DescriptorLayoutName::MaterialSet).is_none());
        assert!(catalog.get_by_name("unknownLayout").is_none());
        assert!(matches!(
            catalog.require(DescriptorLayoutName::MaterialSet),
            Err(GpuError::ResourceNotFound(_))
        ));
    }

    #[test]
    fn pool_sizes() {
        assert_eq!(MAX_DESCRIPTOR_SETS, 128);
        let storage: Vec<_> = DESCRIPTOR_POOL_SIZES
            .iter()
            .filter(|s| s.ty == vk::DescriptorType::STORAGE_BUFFER)
            .map(|s| s.descriptor_count)
            .collect();
        assert_eq!(storage, [8, 32]);
    }

    #[test]
    fn sized_pools_cover_their_layout() {
        for name in DescriptorLayoutName::ALL {
            let sizes = pool_sizes_for(name.bindings());
            assert!(pool_covers(&sizes, name.bindings()), "{}", name.as_str());
            let total: u32 = sizes.iter().map(|s| s.descriptor_count).sum();
            let expected: u32 = name.bindings().iter().map(|b| b.count).sum();
            assert_eq!(total, expected);
        }
    }

    #[test]
    fn hlbvh2_pool_sizes() {
        let sizes = pool_sizes_for(DescriptorLayoutName::Hlbvh2.bindings());
        let count = |ty| {
            sizes
                .iter()
                .find(|s| s.ty == ty)
                .map(|s| s.descriptor_count)
        };
        assert_eq!(sizes.len(), 3);
        assert_eq!(count(vk::DescriptorType::STORAGE_BUFFER), Some(2));
        assert_eq!(count(vk::DescriptorType::STORAGE_TEXEL_BUFFER), Some(1));
        assert_eq!(count(vk::DescriptorType::UNIFORM_TEXEL_BUFFER), Some(1));
    }

    #[test]
    fn device_pool_lacks_storage_texel_buffers() {
        assert!(!pool_covers(&DESCRIPTOR_POOL_SIZES, DescriptorLayoutName::Hlbvh2.bindings()));
        assert!(pool_covers(&DESCRIPTOR_POOL_SIZES, DescriptorLayoutName::RadixSortBind.bindings()));
    }
}
