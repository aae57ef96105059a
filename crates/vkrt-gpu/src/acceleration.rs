//! Acceleration backend selection.
//!
//! Two backends exist: the software HLBVH2 builder, which every device
//! supports, and the NVIDIA ray tracing extension. A backend is chosen once
//! through an [`AccelerationSelector`] and stays fixed for every
//! [`AcceleratorSet`] created from it. No fallback happens here; a caller
//! that gets [`GpuError::ExtensionNotPresent`] picks the software backend
//! itself.

use std::ffi::CStr;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use vkrt_core::{BvhBlock, BVH_NODE_SIZE};

use crate::capabilities::DeviceFeatures;
use crate::descriptors::{pool_sizes_for, write_storage_buffer, DescriptorLayoutName, DescriptorPool};
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::memory::{GpuAllocator, GpuBuffer};

/// Extension the hardware backend requires.
pub const RTX_EXTENSION_NAME: &CStr = ash::nv::ray_tracing::NAME;

/// Backend tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccelerationName {
    /// HLBVH2 built by compute kernels.
    Software,
    /// Driver-built acceleration structures.
    Rtx,
}

impl AccelerationName {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Software => "software-hlbvh2",
            Self::Rtx => "rtx",
        }
    }

    /// Check whether a device with `features` can host this backend.
    ///
    /// The hardware backend needs an exact, case-sensitive match of
    /// [`RTX_EXTENSION_NAME`] in the reported extension list.
    pub fn criteria(self, features: &DeviceFeatures) -> Result<()> {
        match self {
            Self::Software => Ok(()),
            Self::Rtx if features.supports_extension(RTX_EXTENSION_NAME) => Ok(()),
            Self::Rtx => Err(GpuError::ExtensionNotPresent(
                RTX_EXTENSION_NAME.to_string_lossy().into_owned(),
            )),
        }
    }
}

/// Fail unless `name` is the hardware backend.
pub fn require_rtx(name: AccelerationName) -> Result<()> {
    match name {
        AccelerationName::Rtx => Ok(()),
        AccelerationName::Software => Err(GpuError::ExtensionNotPresent(format!(
            "{} (selected backend: {})",
            RTX_EXTENSION_NAME.to_string_lossy(),
            name.as_str()
        ))),
    }
}

/// Progress of a backend selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectorState {
    Uninitialized,
    CriteriaChecked { supported: bool },
    Initialized,
}

/// Drives one backend through criteria check and initialization.
#[derive(Debug)]
pub struct AccelerationSelector {
    name: AccelerationName,
    state: SelectorState,
}

impl AccelerationSelector {
    pub fn new(name: AccelerationName) -> Self {
        Self {
            name,
            state: SelectorState::Uninitialized,
        }
    }

    pub fn name(&self) -> AccelerationName {
        self.name
    }

    pub fn state(&self) -> SelectorState {
        self.state
    }

    /// Run the backend criteria against `features` and record the outcome.
    pub fn criteria(&mut self, features: &DeviceFeatures) -> Result<()> {
        if self.state == SelectorState::Initialized {
            return Err(GpuError::InvalidState(format!(
                "{} backend already initialized",
                self.name.as_str()
            )));
        }

        let result = self.name.criteria(features);
        self.state = SelectorState::CriteriaChecked {
            supported: result.is_ok(),
        };
        if result.is_err() {
            tracing::warn!(backend = self.name.as_str(), "Acceleration backend unsupported");
        }
        result
    }

    /// Create the backend on `device`.
    ///
    /// Runs the criteria first if they were never checked.
    pub fn initialize(&mut self, device: &Arc<Device>) -> Result<AccelerationBackend> {
        match self.state {
            SelectorState::Uninitialized => self.criteria(device.physical().features())?,
            SelectorState::CriteriaChecked { supported: true } => {}
            SelectorState::CriteriaChecked { supported: false } => {
                return Err(GpuError::ExtensionNotPresent(
                    RTX_EXTENSION_NAME.to_string_lossy().into_owned(),
                ));
            }
            SelectorState::Initialized => {
                return Err(GpuError::InvalidState(format!(
                    "{} backend already initialized",
                    self.name.as_str()
                )));
            }
        }

        let backend = match self.name {
            AccelerationName::Software => AccelerationBackend::Software(SoftwareBvh {
                device: Arc::clone(device),
            }),
            AccelerationName::Rtx => AccelerationBackend::Rtx(RtxAccelerator::new(device)),
        };

        self.state = SelectorState::Initialized;
        tracing::info!(backend = self.name.as_str(), "Initialized acceleration backend");
        Ok(backend)
    }
}

/// Sizing of an accelerator set.
#[derive(Clone, Copy, Debug)]
pub struct AcceleratorSetInfo {
    /// Upper bound of primitives the software BVH is built over.
    pub max_primitives: u32,
    /// Upper bound of instances in the hardware top-level structure.
    pub max_instances: u32,
}

impl Default for AcceleratorSetInfo {
    fn default() -> Self {
        Self {
            max_primitives: 1024,
            max_instances: 1,
        }
    }
}

/// Software HLBVH2 backend. Builds with the device's sub-builders.
pub struct SoftwareBvh {
    device: Arc<Device>,
}

impl SoftwareBvh {
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn create_set(&self, info: &AcceleratorSetInfo) -> Result<SoftwareSet> {
        SoftwareSet::new(&self.device, info)
    }
}

/// NVIDIA ray tracing backend.
pub struct RtxAccelerator {
    device: Arc<Device>,
    loader: ash::nv::ray_tracing::Device,
}

impl RtxAccelerator {
    fn new(device: &Arc<Device>) -> Self {
        let loader = ash::nv::ray_tracing::Device::new(device.physical().instance(), device.raw());
        Self {
            device: Arc::clone(device),
            loader,
        }
    }

    /// The extension function table.
    pub fn loader(&self) -> &ash::nv::ray_tracing::Device {
        &self.loader
    }

    fn create_set(&self, info: &AcceleratorSetInfo) -> Result<RtxSet> {
        unsafe { RtxSet::new(&self.device, &self.loader, info) }
    }
}

/// The selected backend.
pub enum AccelerationBackend {
    Software(SoftwareBvh),
    Rtx(RtxAccelerator),
}

impl AccelerationBackend {
    /// Backend tag. Check it before any backend-specific call.
    pub fn name(&self) -> AccelerationName {
        match self {
            Self::Software(_) => AccelerationName::Software,
            Self::Rtx(_) => AccelerationName::Rtx,
        }
    }

    /// The hardware backend, if selected.
    pub fn as_rtx(&self) -> Option<&RtxAccelerator> {
        match self {
            Self::Rtx(rtx) => Some(rtx),
            Self::Software(_) => None,
        }
    }

    /// The software backend, if selected.
    pub fn as_software(&self) -> Option<&SoftwareBvh> {
        match self {
            Self::Software(software) => Some(software),
            Self::Rtx(_) => None,
        }
    }

    /// Create an accelerator set on this backend.
    pub fn create_set(&self, info: &AcceleratorSetInfo) -> Result<AcceleratorSet> {
        match self {
            Self::Software(software) => software.create_set(info).map(AcceleratorSet::Software),
            Self::Rtx(rtx) => rtx.create_set(info).map(AcceleratorSet::Rtx),
        }
    }
}

fn release_buffer(allocator: &mut GpuAllocator, buffer: &mut GpuBuffer) {
    if let Err(e) = allocator.free_buffer(buffer) {
        tracing::warn!("Failed to free BVH buffer: {e}");
    }
}

/// Node and block storage of a software BVH, bound to an `hlbvh2` set.
///
/// The set comes from a pool of its own: the device pool has no storage
/// texel buffer descriptors.
pub struct SoftwareSet {
    device: Arc<Device>,
    nodes: GpuBuffer,
    blocks: GpuBuffer,
    pool: DescriptorPool,
    descriptor_set: vk::DescriptorSet,
}

impl SoftwareSet {
    /// Catalog layout of the set.
    pub const LAYOUT: DescriptorLayoutName = DescriptorLayoutName::Hlbvh2;

    /// Sizes of the pool backing one set.
    pub fn pool_sizes() -> Vec<vk::DescriptorPoolSize> {
        pool_sizes_for(Self::LAYOUT.bindings())
    }

    fn new(device: &Arc<Device>, info: &AcceleratorSetInfo) -> Result<Self> {
        let node_count = u64::from(info.max_primitives.max(1)) * 2;
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST;
        let set_layout = device.catalog().require(Self::LAYOUT)?;

        let mut allocator = device.allocator().lock();
        let mut nodes = allocator.create_buffer(
            node_count * BVH_NODE_SIZE,
            usage,
            MemoryLocation::GpuOnly,
            "bvh_nodes",
        )?;
        let mut blocks = match allocator.create_buffer(
            std::mem::size_of::<BvhBlock>() as u64,
            usage,
            MemoryLocation::GpuOnly,
            "bvh_blocks",
        ) {
            Ok(blocks) => blocks,
            Err(e) => {
                release_buffer(&mut allocator, &mut nodes);
                return Err(e);
            }
        };

        let pool = match unsafe { DescriptorPool::new(device.raw(), 1, &Self::pool_sizes()) } {
            Ok(pool) => pool,
            Err(e) => {
                release_buffer(&mut allocator, &mut blocks);
                release_buffer(&mut allocator, &mut nodes);
                return Err(e);
            }
        };

        let sets = unsafe { pool.allocate(device.raw(), &[set_layout]) };
        let descriptor_set = match sets.map(|s| s.into_iter().next()) {
            Ok(Some(set)) => set,
            other => {
                unsafe { pool.destroy(device.raw()) };
                release_buffer(&mut allocator, &mut blocks);
                release_buffer(&mut allocator, &mut nodes);
                return Err(match other {
                    Err(e) => e,
                    Ok(_) => GpuError::AllocationFailed("no descriptor set returned".to_string()),
                });
            }
        };
        drop(allocator);

        unsafe {
            write_storage_buffer(device.raw(), descriptor_set, 0, blocks.buffer, 0, vk::WHOLE_SIZE);
            write_storage_buffer(device.raw(), descriptor_set, 2, nodes.buffer, 0, vk::WHOLE_SIZE);
        }

        Ok(Self {
            device: Arc::clone(device),
            nodes,
            blocks,
            pool,
            descriptor_set,
        })
    }

    pub fn nodes(&self) -> vk::Buffer {
        self.nodes.buffer
    }

    pub fn blocks(&self) -> vk::Buffer {
        self.blocks.buffer
    }

    /// `hlbvh2` descriptor set with the block (0) and node (2) bindings
    /// written.
    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }
}

impl Drop for SoftwareSet {
    fn drop(&mut self) {
        let device = &self.device;
        // Destroying the pool frees its set.
        unsafe { self.pool.destroy(device.raw()) };
        let mut allocator = device.allocator().lock();
        release_buffer(&mut allocator, &mut self.blocks);
        release_buffer(&mut allocator, &mut self.nodes);
    }
}

/// A top-level NV acceleration structure with bound memory.
pub struct RtxSet {
    device: Arc<Device>,
    loader: ash::nv::ray_tracing::Device,
    structure: vk::AccelerationStructureNV,
    memory: Option<Allocation>,
}

impl RtxSet {
    unsafe fn new(
        device: &Arc<Device>,
        loader: &ash::nv::ray_tracing::Device,
        info: &AcceleratorSetInfo,
    ) -> Result<Self> {
        let as_info = vk::AccelerationStructureInfoNV::default()
            .ty(vk::AccelerationStructureTypeNV::TOP_LEVEL)
            .instance_count(info.max_instances);
        let create_info = vk::AccelerationStructureCreateInfoNV::default().info(as_info);
        let structure = loader.create_acceleration_structure(&create_info, None)?;

        let requirements_info = vk::AccelerationStructureMemoryRequirementsInfoNV::default()
            .ty(vk::AccelerationStructureMemoryRequirementsTypeNV::OBJECT)
            .acceleration_structure(structure);
        let requirements = loader
            .get_acceleration_structure_memory_requirements(&requirements_info)
            .memory_requirements;

        let mut allocator = device.allocator().lock();
        let memory = match allocator.allocate(requirements, MemoryLocation::GpuOnly, "rtx_top_level") {
            Ok(memory) => memory,
            Err(e) => {
                loader.destroy_acceleration_structure(structure, None);
                return Err(e);
            }
        };

        let bind = vk::BindAccelerationStructureMemoryInfoNV::default()
            .acceleration_structure(structure)
            .memory(memory.memory())
            .memory_offset(memory.offset());
        if let Err(e) = loader.bind_acceleration_structure_memory(&[bind]) {
            if let Err(free_err) = allocator.free(memory) {
                tracing::warn!("Failed to free acceleration structure memory: {free_err}");
            }
            loader.destroy_acceleration_structure(structure, None);
            return Err(e.into());
        }

        Ok(Self {
            device: Arc::clone(device),
            loader: loader.clone(),
            structure,
            memory: Some(memory),
        })
    }

    pub fn structure(&self) -> vk::AccelerationStructureNV {
        self.structure
    }
}

impl Drop for RtxSet {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_acceleration_structure(self.structure, None) };
        if let Some(memory) = self.memory.take() {
            if let Err(e) = self.device.allocator().lock().free(memory) {
                tracing::warn!("Failed to free acceleration structure memory: {e}");
            }
        }
    }
}

/// Acceleration storage created on one backend.
pub enum AcceleratorSet {
    Software(SoftwareSet),
    Rtx(RtxSet),
}

impl AcceleratorSet {
    pub fn name(&self) -> AccelerationName {
        match self {
            Self::Software(_) => AccelerationName::Software,
            Self::Rtx(_) => AccelerationName::Rtx,
        }
    }
}

/// Opaque 64-bit handle of a hardware acceleration structure, as written
/// into [`vkrt_core::RtxInstance::acceleration_structure_handle`].
///
/// Fails with [`GpuError::ExtensionNotPresent`] for software sets.
pub fn get_accelerator_handle(set: &AcceleratorSet) -> Result<u64> {
    require_rtx(set.name())?;
    match set {
        AcceleratorSet::Rtx(rtx) => {
            let handle = unsafe { rtx.loader.get_acceleration_structure_handle(rtx.structure)? };
            Ok(handle)
        }
        AcceleratorSet::Software(_) => Err(GpuError::ExtensionNotPresent(
            RTX_EXTENSION_NAME.to_string_lossy().into_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::pool_covers;

    fn nv_name() -> String {
        RTX_EXTENSION_NAME.to_str().unwrap().to_string()
    }

    #[test]
    fn rtx_criteria_exact_match() {
        let features = DeviceFeatures::from_extension_names(["VK_KHR_maintenance3".to_string(), nv_name()]);
        assert!(AccelerationName::Rtx.criteria(&features).is_ok());
    }

    #[test]
    fn rtx_criteria_rejects_near_misses() {
        let name = nv_name();
        let near_misses = [
            name[..name.len() - 1].to_string(),
            name.to_lowercase(),
            name.to_uppercase(),
            format!("{name}_2"),
            format!(" {name}"),
            String::new(),
        ];
        for candidate in near_misses {
            let features = DeviceFeatures::from_extension_names([candidate.clone()]);
            assert!(
                matches!(
                    AccelerationName::Rtx.criteria(&features),
                    Err(GpuError::ExtensionNotPresent(_))
                ),
                "{candidate:?} must not match"
            );
        }
    }

    #[test]
    fn software_always_supported() {
        let features = DeviceFeatures::from_extension_names(Vec::<String>::new());
        assert!(AccelerationName::Software.criteria(&features).is_ok());
    }

    #[test]
    fn selector_records_criteria() {
        let mut selector = AccelerationSelector::new(AccelerationName::Rtx);
        assert_eq!(selector.state(), SelectorState::Uninitialized);

        let missing = DeviceFeatures::from_extension_names(["VK_KHR_maintenance1"]);
        assert!(selector.criteria(&missing).is_err());
        assert_eq!(selector.state(), SelectorState::CriteriaChecked { supported: false });

        let present = DeviceFeatures::from_extension_names([nv_name()]);
        assert!(selector.criteria(&present).is_ok());
        assert_eq!(selector.state(), SelectorState::CriteriaChecked { supported: true });
    }

    #[test]
    fn hardware_only_calls_on_software_fail() {
        assert!(require_rtx(AccelerationName::Rtx).is_ok());
        assert!(matches!(
            require_rtx(AccelerationName::Software),
            Err(GpuError::ExtensionNotPresent(_))
        ));
    }

    #[test]
    fn names() {
        assert_eq!(AccelerationName::Software.as_str(), "software-hlbvh2");
        assert_eq!(AccelerationName::Rtx.as_str(), "rtx");
        assert_eq!(RTX_EXTENSION_NAME, c"VK_NV_ray_tracing");
    }

    #[test]
    fn software_set_pool_covers_its_layout() {
        let sizes = SoftwareSet::pool_sizes();
        assert!(pool_covers(&sizes, SoftwareSet::LAYOUT.bindings()));
        assert!(sizes
            .iter()
            .any(|s| s.ty == vk::DescriptorType::STORAGE_TEXEL_BUFFER));
    }
}
