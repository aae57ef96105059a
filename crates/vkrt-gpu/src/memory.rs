//! GPU memory management.

use crate::error::{GpuError, Result};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

/// Allocator shared between a device and its owner.
pub type SharedAllocator = Arc<Mutex<GpuAllocator>>;

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: cfg!(debug_assertions),
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    /// Create an allocator and wrap it for sharing.
    ///
    /// # Safety
    /// Same as [`GpuAllocator::new`].
    pub unsafe fn new_shared(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<SharedAllocator> {
        Self::new(instance, device, physical_device).map(|a| Arc::new(Mutex::new(a)))
    }

    /// Whether the allocator can still serve allocations.
    pub fn is_active(&self) -> bool {
        self.allocator.is_some()
    }

    /// Allocate a buffer.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        let allocator = self.allocator.as_mut().ok_or(GpuError::AllocatorMissing)?;

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(GpuError::AllocationFailed(e.to_string()));
            }
        };

        if let Err(e) =
            unsafe { self.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
        {
            if let Err(free_err) = allocator.free(allocation) {
                tracing::warn!("Failed to free buffer memory after bind failure: {free_err}");
            }
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(e.into());
        }

        Ok(GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    /// Free a buffer allocation.
    pub fn free_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.allocator
                .as_mut()
                .ok_or(GpuError::AllocatorMissing)?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }

        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
        buffer.buffer = vk::Buffer::null();

        Ok(())
    }

    /// Allocate memory for and bind it to an externally created object.
    ///
    /// Used for objects whose memory requirements come from an extension
    /// query rather than `vkGetBufferMemoryRequirements`.
    pub fn allocate(
        &mut self,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Allocation> {
        self.allocator
            .as_mut()
            .ok_or(GpuError::AllocatorMissing)?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    /// Free memory returned by [`GpuAllocator::allocate`].
    pub fn free(&mut self, allocation: Allocation) -> Result<()> {
        self.allocator
            .as_mut()
            .ok_or(GpuError::AllocatorMissing)?
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations will be freed (and logged as leaks).
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A GPU buffer with its allocation.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
}

impl GpuBuffer {
    /// Map the buffer memory for CPU access.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.as_ptr().cast::<u8>())
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<usize> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(format!(
                "Range {offset}..{end} exceeds buffer size {}",
                self.size
            )));
        }
        usize::try_from(offset).map_err(|_| GpuError::InvalidState("Offset overflow".to_string()))
    }

    /// Write data to the start of the buffer (must be host-visible).
    pub fn write<T: Pod>(&self, data: &[T]) -> Result<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }

    /// Write raw bytes to the buffer at the given offset (must be host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;
        let offset = self.check_range(offset, data.len())?;

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset), data.len());
        }

        Ok(())
    }

    /// Read raw bytes from the buffer at the given offset (must be host-visible).
    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;
        let offset = self.check_range(offset, out.len())?;

        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset).cast_const(), out.as_mut_ptr(), out.len());
        }

        Ok(())
    }

    /// Read typed data from the buffer at the given offset (must be host-visible).
    pub fn read<T: Pod>(&self, offset: u64, out: &mut [T]) -> Result<()> {
        self.read_bytes(offset, bytemuck::cast_slice_mut(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unmapped(size: u64) -> GpuBuffer {
        GpuBuffer {
            buffer: vk::Buffer::null(),
            allocation: None,
            size,
        }
    }

    #[test]
    fn unmapped_buffer_rejects_host_access() {
        let buffer = unmapped(16);
        assert!(buffer.mapped_ptr().is_none());
        assert!(matches!(
            buffer.write(&[1u32, 2]),
            Err(GpuError::InvalidState(_))
        ));
        let mut out = [0u8; 4];
        assert!(matches!(
            buffer.read_bytes(0, &mut out),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn range_checks() {
        let buffer = unmapped(16);
        assert_eq!(buffer.check_range(0, 16).ok(), Some(0));
        assert_eq!(buffer.check_range(12, 4).ok(), Some(12));
        assert!(buffer.check_range(13, 4).is_err());
        assert!(buffer.check_range(u64::MAX, 1).is_err());
    }
}
