//! Logical device and everything it owns.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::vk;

use crate::builders::{BuildContext, SubBuilders};
use crate::capabilities::PhysicalDevice;
use crate::chain::{strip_device_extension, DeviceExtensionInfo};
use crate::descriptors::{
    DescriptorLayoutCatalog, DescriptorLayoutName, DescriptorPool, DESCRIPTOR_POOL_SIZES,
    MAX_DESCRIPTOR_SETS,
};
use crate::error::{GpuError, Result};
use crate::memory::{GpuAllocator, SharedAllocator};
use crate::traffic::BufferTraffic;

/// A logical device with its allocator, pipeline cache, descriptor pool,
/// descriptor layout catalog, buffer traffic and sub-builders.
///
/// All of these are created together and destroyed together when the last
/// `Arc<Device>` drops.
pub struct Device {
    raw: Arc<ash::Device>,
    physical: Arc<PhysicalDevice>,
    allocator: SharedAllocator,
    owns_allocator: bool,
    owns_raw: bool,
    main_queue_family: u32,
    main_queue: vk::Queue,
    shader_path: PathBuf,
    pipeline_cache: vk::PipelineCache,
    descriptor_pool: DescriptorPool,
    catalog: DescriptorLayoutCatalog,
    buffer_traffic: BufferTraffic,
    builders: SubBuilders,
}

impl Device {
    /// Get the raw ash device.
    pub fn raw(&self) -> &ash::Device {
        &self.raw
    }

    /// The physical device this device was created from.
    pub fn physical(&self) -> &Arc<PhysicalDevice> {
        &self.physical
    }

    /// Get the allocator.
    pub fn allocator(&self) -> &SharedAllocator {
        &self.allocator
    }

    /// Whether the allocator was created by this device (and is shut down
    /// with it).
    pub fn owns_allocator(&self) -> bool {
        self.owns_allocator
    }

    pub fn main_queue_family(&self) -> u32 {
        self.main_queue_family
    }

    pub fn main_queue(&self) -> vk::Queue {
        self.main_queue
    }

    /// Directory the kernels were loaded from.
    pub fn shader_path(&self) -> &Path {
        &self.shader_path
    }

    pub fn pipeline_cache(&self) -> vk::PipelineCache {
        self.pipeline_cache
    }

    pub fn descriptor_pool(&self) -> &DescriptorPool {
        &self.descriptor_pool
    }

    pub fn catalog(&self) -> &DescriptorLayoutCatalog {
        &self.catalog
    }

    /// Look up a catalog layout.
    pub fn descriptor_layout(&self, name: DescriptorLayoutName) -> Option<vk::DescriptorSetLayout> {
        self.catalog.get(name)
    }

    pub fn buffer_traffic(&self) -> &BufferTraffic {
        &self.buffer_traffic
    }

    pub fn builders(&self) -> &SubBuilders {
        &self.builders
    }

    /// Serialized pipeline cache contents.
    pub fn pipeline_cache_data(&self) -> Result<Vec<u8>> {
        let data = unsafe { self.raw.get_pipeline_cache_data(self.pipeline_cache)? };
        Ok(data)
    }

    /// Wait for the device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.raw.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.raw.device_wait_idle() {
                tracing::warn!("Device wait idle failed during teardown: {e}");
            }

            {
                let mut allocator = self.allocator.lock();
                self.builders.destroy(&self.raw, &mut allocator);
                self.buffer_traffic.release(&self.raw, &mut allocator);
            }

            self.catalog.destroy(&self.raw);
            self.descriptor_pool.destroy(&self.raw);
            self.raw.destroy_pipeline_cache(self.pipeline_cache, None);

            // Allocator memory must go before the device.
            if self.owns_allocator {
                self.allocator.lock().shutdown();
            }
            if self.owns_raw {
                self.raw.destroy_device(None);
            }
        }
        tracing::debug!("Device destroyed");
    }
}

/// Objects created so far during conversion. Released on drop unless
/// handed over to a [`Device`].
struct PartialDevice {
    raw: Arc<ash::Device>,
    owns_raw: bool,
    allocator: Option<SharedAllocator>,
    owns_allocator: bool,
    pipeline_cache: vk::PipelineCache,
    descriptor_pool: Option<DescriptorPool>,
    catalog: DescriptorLayoutCatalog,
    buffer_traffic: Option<BufferTraffic>,
    builders: Option<SubBuilders>,
}

impl Drop for PartialDevice {
    fn drop(&mut self) {
        unsafe {
            if let Some(allocator) = &self.allocator {
                let mut allocator = allocator.lock();
                if let Some(builders) = self.builders.as_mut() {
                    builders.destroy(&self.raw, &mut allocator);
                }
                if let Some(traffic) = self.buffer_traffic.as_mut() {
                    traffic.release(&self.raw, &mut allocator);
                }
            }
            self.catalog.destroy(&self.raw);
            if let Some(pool) = self.descriptor_pool.take() {
                pool.destroy(&self.raw);
            }
            if self.pipeline_cache != vk::PipelineCache::null() {
                self.raw.destroy_pipeline_cache(self.pipeline_cache, None);
            }
            if self.owns_allocator {
                if let Some(allocator) = &self.allocator {
                    allocator.lock().shutdown();
                }
            }
            if self.owns_raw {
                self.raw.destroy_device(None);
            }
        }
    }
}

/// Create a device from a create info whose p_next chain may carry an
/// [`ArtificialDeviceExtension`](crate::chain::ArtificialDeviceExtension).
///
/// The extension block never reaches `vkCreateDevice`; the chain is
/// restored before this returns. Without a block, defaults apply.
///
/// # Safety
/// `create_info` and its whole chain must be valid for `vkCreateDevice`.
pub unsafe fn create_device(
    physical: &Arc<PhysicalDevice>,
    create_info: &mut vk::DeviceCreateInfo<'_>,
) -> Result<Arc<Device>> {
    let (raw, info) = {
        let stripped = strip_device_extension(create_info);
        let raw = physical
            .instance()
            .create_device(physical.handle(), stripped.create_info(), None)
            .map_err(|e| GpuError::InitializationFailed(format!("vkCreateDevice: {e}")))?;
        (raw, stripped.extension().cloned().unwrap_or_default())
    };

    build_device(Arc::new(raw), true, physical, info)
}

/// Wrap an externally created device. The raw device is not destroyed with
/// the returned [`Device`].
///
/// # Safety
/// `raw` must have been created from `physical` and outlive the result.
pub unsafe fn convert_device(
    physical: &Arc<PhysicalDevice>,
    raw: ash::Device,
    info: DeviceExtensionInfo,
) -> Result<Arc<Device>> {
    build_device(Arc::new(raw), false, physical, info)
}

unsafe fn build_device(
    raw: Arc<ash::Device>,
    owns_raw: bool,
    physical: &Arc<PhysicalDevice>,
    info: DeviceExtensionInfo,
) -> Result<Arc<Device>> {
    let mut partial = PartialDevice {
        raw,
        owns_raw,
        allocator: None,
        owns_allocator: false,
        pipeline_cache: vk::PipelineCache::null(),
        descriptor_pool: None,
        catalog: DescriptorLayoutCatalog::default(),
        buffer_traffic: None,
        builders: None,
    };

    let allocator = match info.allocator.clone() {
        Some(allocator) => allocator,
        None => {
            let allocator = GpuAllocator::new_shared(
                physical.instance(),
                Arc::clone(&partial.raw),
                physical.handle(),
            )?;
            partial.owns_allocator = true;
            allocator
        }
    };
    if !allocator.lock().is_active() {
        return Err(GpuError::AllocatorMissing);
    }
    partial.allocator = Some(allocator.clone());

    partial.pipeline_cache = partial
        .raw
        .create_pipeline_cache(&vk::PipelineCacheCreateInfo::default(), None)
        .map_err(|e| GpuError::InitializationFailed(format!("pipeline cache: {e}")))?;

    partial.descriptor_pool = Some(
        DescriptorPool::new(&partial.raw, MAX_DESCRIPTOR_SETS, &DESCRIPTOR_POOL_SIZES)
            .map_err(|e| GpuError::InitializationFailed(format!("descriptor pool: {e}")))?,
    );

    partial.catalog = DescriptorLayoutCatalog::create(&partial.raw)?;

    partial.buffer_traffic = Some(BufferTraffic::new(
        &partial.raw,
        &allocator,
        info.main_queue_family,
        info.shared_cache_size,
    )?);

    let main_queue = partial.raw.get_device_queue(info.main_queue_family, 0);

    let ctx = BuildContext {
        device: &partial.raw,
        allocator: &allocator,
        catalog: &partial.catalog,
        pipeline_cache: partial.pipeline_cache,
        queue: main_queue,
        queue_family: info.main_queue_family,
        shader_path: &info.shader_path,
    };
    let builders = SubBuilders::new(&ctx)?;
    partial.builders = Some(builders);

    let (Some(descriptor_pool), Some(mut buffer_traffic), Some(builders)) = (
        partial.descriptor_pool.take(),
        partial.buffer_traffic.take(),
        partial.builders.take(),
    ) else {
        return Err(GpuError::InvalidState("device construction incomplete".to_string()));
    };

    let raw = Arc::clone(&partial.raw);
    let pipeline_cache = std::mem::replace(&mut partial.pipeline_cache, vk::PipelineCache::null());
    let catalog = std::mem::take(&mut partial.catalog);
    let owns_allocator = std::mem::replace(&mut partial.owns_allocator, false);
    partial.owns_raw = false;
    drop(partial);

    tracing::info!(
        queue_family = info.main_queue_family,
        traffic_capacity = buffer_traffic.capacity(),
        external_allocator = !owns_allocator,
        shader_path = %info.shader_path.display(),
        "Device converted"
    );

    Ok(Arc::new_cyclic(|weak| {
        buffer_traffic.attach(weak.clone());
        Device {
            raw,
            physical: Arc::clone(physical),
            allocator,
            owns_allocator,
            owns_raw,
            main_queue_family: info.main_queue_family,
            main_queue,
            shader_path: info.shader_path,
            pipeline_cache,
            descriptor_pool,
            catalog,
            buffer_traffic,
            builders,
        }
    }))
}
