//! Host/device staging buffers shared by a device.

use std::sync::{Arc, Weak};

use ash::vk;
use bytemuck::Pod;
use gpu_allocator::MemoryLocation;
use vkrt_core::constants::TRAFFIC_TILE_SIZE;
use vkrt_core::tiled;

use crate::command::{cmd_copy_buffer, BarrierKind};
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::memory::{GpuAllocator, GpuBuffer, SharedAllocator};

/// Texel format of the traffic buffer views, one byte per element.
pub const TRAFFIC_FORMAT: vk::Format = vk::Format::R8_UINT;

/// Byte capacity of a traffic buffer for a requested cache size.
///
/// Rounds up to whole tiles. A zero request still yields one tile since
/// Vulkan buffers cannot be empty. `None` if the rounded size does not fit
/// in a `u64`.
pub const fn traffic_capacity(shared_cache_size: u64) -> Option<u64> {
    let tiles = tiled(shared_cache_size, TRAFFIC_TILE_SIZE);
    let tiles = if tiles == 0 { 1 } else { tiles };
    tiles.checked_mul(TRAFFIC_TILE_SIZE)
}

/// Non-owning link from a device-owned object back to its owner.
pub(crate) struct OwnerLink<T>(Weak<T>);

impl<T> OwnerLink<T> {
    pub(crate) const fn new() -> Self {
        Self(Weak::new())
    }

    pub(crate) fn attach(&mut self, owner: Weak<T>) {
        self.0 = owner;
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<T>> {
        self.0.upgrade()
    }
}

/// A traffic buffer and its `R8_UINT` texel view.
pub struct TrafficBuffer {
    buffer: GpuBuffer,
    view: vk::BufferView,
}

impl TrafficBuffer {
    unsafe fn new(
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Self> {
        let mut buffer = allocator.create_buffer(size, usage, location, name)?;

        let view_info = vk::BufferViewCreateInfo::default()
            .buffer(buffer.buffer)
            .format(TRAFFIC_FORMAT)
            .offset(0)
            .range(vk::WHOLE_SIZE);

        match device.create_buffer_view(&view_info, None) {
            Ok(view) => Ok(Self { buffer, view }),
            Err(e) => {
                if let Err(free_err) = allocator.free_buffer(&mut buffer) {
                    tracing::warn!("Failed to free traffic buffer: {free_err}");
                }
                Err(e.into())
            }
        }
    }

    /// The raw buffer.
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.buffer
    }

    /// The texel view over the whole buffer.
    pub fn view(&self) -> vk::BufferView {
        self.view
    }

    unsafe fn release(&mut self, device: &ash::Device, allocator: &mut GpuAllocator) {
        if self.view != vk::BufferView::null() {
            device.destroy_buffer_view(self.view, None);
            self.view = vk::BufferView::null();
        }
        if let Err(e) = allocator.free_buffer(&mut self.buffer) {
            tracing::warn!("Failed to free traffic buffer: {e}");
        }
    }
}

/// Paired upload (host to device) and download (device to host) buffers.
///
/// Both have the same fixed capacity and belong to the device's main queue
/// family. The device owns this; the back-reference is weak.
pub struct BufferTraffic {
    device: OwnerLink<Device>,
    upload: TrafficBuffer,
    download: TrafficBuffer,
    queue_family: u32,
    capacity: u64,
}

impl BufferTraffic {
    /// Allocate both buffers for a requested cache size.
    ///
    /// # Safety
    /// The device must be valid and the allocator created for it.
    pub(crate) unsafe fn new(
        device: &ash::Device,
        allocator: &SharedAllocator,
        queue_family: u32,
        shared_cache_size: u64,
    ) -> Result<Self> {
        let capacity = traffic_capacity(shared_cache_size).ok_or_else(|| {
            GpuError::InitializationFailed(format!(
                "shared cache size {shared_cache_size} overflows the traffic capacity"
            ))
        })?;
        let mut allocator = allocator.lock();

        let upload = TrafficBuffer::new(
            device,
            &mut allocator,
            capacity,
            vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER
                | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER,
            MemoryLocation::CpuToGpu,
            "traffic_upload",
        )?;

        let download = match TrafficBuffer::new(
            device,
            &mut allocator,
            capacity,
            vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER
                | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER,
            MemoryLocation::GpuToCpu,
            "traffic_download",
        ) {
            Ok(download) => download,
            Err(e) => {
                let mut upload = upload;
                upload.release(device, &mut allocator);
                return Err(e);
            }
        };

        tracing::debug!(shared_cache_size, capacity, queue_family, "Created buffer traffic");

        Ok(Self {
            device: OwnerLink::new(),
            upload,
            download,
            queue_family,
            capacity,
        })
    }

    /// Set the owning device back-reference.
    pub(crate) fn attach(&mut self, device: Weak<Device>) {
        self.device.attach(device);
    }

    /// The owning device, if it is still alive.
    pub fn device(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }

    /// Capacity of each buffer in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Queue family both buffers belong to.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// The host to device buffer.
    pub fn upload(&self) -> &TrafficBuffer {
        &self.upload
    }

    /// The device to host buffer.
    pub fn download(&self) -> &TrafficBuffer {
        &self.download
    }

    /// Write host data into the upload buffer.
    pub fn write_upload<T: Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        self.upload
            .buffer
            .write_bytes(offset, bytemuck::cast_slice(data))
    }

    /// Read device results out of the download buffer.
    pub fn read_download<T: Pod>(&self, offset: u64, out: &mut [T]) -> Result<()> {
        self.download.buffer.read(offset, out)
    }

    fn raw_device(&self) -> Result<Arc<Device>> {
        self.device()
            .ok_or_else(|| GpuError::InvalidState("buffer traffic outlived its device".to_string()))
    }

    /// Record a copy of `size` bytes from the upload buffer into `dst`.
    ///
    /// # Safety
    /// The command buffer must be recording on the main queue family.
    pub unsafe fn record_upload_to(
        &self,
        cmd: vk::CommandBuffer,
        dst: vk::Buffer,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.check_size(size)?;
        let device = self.raw_device()?;
        let region = vk::BufferCopy::default()
            .src_offset(0)
            .dst_offset(dst_offset)
            .size(size);
        cmd_copy_buffer(
            device.raw(),
            cmd,
            self.upload.buffer(),
            dst,
            &[region],
            BarrierKind::FromHost,
        );
        Ok(())
    }

    /// Record a copy of `size` bytes from `src` into the download buffer,
    /// followed by a barrier making it visible to the host.
    ///
    /// # Safety
    /// The command buffer must be recording on the main queue family.
    pub unsafe fn record_download_from(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.check_size(size)?;
        let device = self.raw_device()?;
        let region = vk::BufferCopy::default()
            .src_offset(src_offset)
            .dst_offset(0)
            .size(size);
        cmd_copy_buffer(
            device.raw(),
            cmd,
            src,
            self.download.buffer(),
            &[region],
            BarrierKind::ToHost,
        );
        Ok(())
    }

    fn check_size(&self, size: u64) -> Result<()> {
        if size > self.capacity {
            return Err(GpuError::InvalidState(format!(
                "transfer of {size} bytes exceeds traffic capacity {}",
                self.capacity
            )));
        }
        Ok(())
    }

    /// Free both buffers.
    ///
    /// # Safety
    /// The device must be idle with respect to both buffers.
    pub(crate) unsafe fn release(&mut self, device: &ash::Device, allocator: &mut GpuAllocator) {
        self.upload.release(device, allocator);
        self.download.release(device, allocator);
    }
}
