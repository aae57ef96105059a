//! Command buffer management and memory barriers.

use crate::error::{GpuError, Result};
use ash::vk;

/// The subset of device entry points used to record and submit work.
///
/// Implemented for [`ash::Device`]; tests substitute a fake device with
/// controllable fences.
///
/// # Safety
/// Every method forwards to the matching Vulkan command and inherits its
/// valid-usage rules. All handles passed in must belong to this device.
pub trait CommandDevice: Send + Sync + 'static {
    /// Allocate one command buffer from `pool`.
    unsafe fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer>;

    /// Begin recording.
    unsafe fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<()>;

    /// End recording.
    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;

    /// Return command buffers to `pool`.
    unsafe fn free_command_buffers(&self, pool: vk::CommandPool, cmds: &[vk::CommandBuffer]);

    /// Record a single global memory barrier.
    unsafe fn cmd_memory_barrier(&self, cmd: vk::CommandBuffer, masks: &BarrierMasks);

    /// Create a fence.
    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;

    /// Destroy a fence.
    unsafe fn destroy_fence(&self, fence: vk::Fence);

    /// Submit work to `queue`, signaling `fence` on completion.
    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<()>;

    /// Block until `fence` signals or `timeout_ns` elapses.
    ///
    /// A timeout is reported as [`GpuError::FenceTimeout`].
    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()>;
}

impl CommandDevice for ash::Device {
    unsafe fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(1);

        let buffers = ash::Device::allocate_command_buffers(self, &alloc_info)?;
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::InvalidState("No command buffer allocated".to_string()))
    }

    unsafe fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<()> {
        ash::Device::begin_command_buffer(self, cmd, begin_info)?;
        Ok(())
    }

    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        ash::Device::end_command_buffer(self, cmd)?;
        Ok(())
    }

    unsafe fn free_command_buffers(&self, pool: vk::CommandPool, cmds: &[vk::CommandBuffer]) {
        ash::Device::free_command_buffers(self, pool, cmds);
    }

    unsafe fn cmd_memory_barrier(&self, cmd: vk::CommandBuffer, masks: &BarrierMasks) {
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(masks.src_access)
            .dst_access_mask(masks.dst_access);

        self.cmd_pipeline_barrier(
            cmd,
            masks.src_stage,
            masks.dst_stage,
            vk::DependencyFlags::empty(),
            std::slice::from_ref(&barrier),
            &[],
            &[],
        );
    }

    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::default().flags(flags);
        let fence = ash::Device::create_fence(self, &create_info, None)?;
        Ok(fence)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        ash::Device::destroy_fence(self, fence, None);
    }

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<()> {
        ash::Device::queue_submit(self, queue, submits, fence)?;
        Ok(())
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        ash::Device::wait_for_fences(self, &[fence], true, timeout_ns)
            .map_err(|e| GpuError::from_fence_wait(e, timeout_ns))
    }
}

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = device.create_command_pool(&create_info, None)?;

        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Destroy the command pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// Allocate a command buffer and begin recording it.
///
/// Secondary buffers inherit compute-shader-invocation statistics queries.
/// `once` selects `ONE_TIME_SUBMIT`, otherwise `SIMULTANEOUS_USE`. The
/// returned buffer is always recording; the caller ends it.
///
/// # Safety
/// The device and pool must be valid, and the pool must be externally
/// synchronized.
pub unsafe fn create_command_buffer<D: CommandDevice + ?Sized>(
    device: &D,
    pool: vk::CommandPool,
    secondary: bool,
    once: bool,
) -> Result<vk::CommandBuffer> {
    let level = if secondary {
        vk::CommandBufferLevel::SECONDARY
    } else {
        vk::CommandBufferLevel::PRIMARY
    };
    let cmd = device.allocate_command_buffer(pool, level)?;

    let inheritance = vk::CommandBufferInheritanceInfo::default()
        .pipeline_statistics(vk::QueryPipelineStatisticFlags::COMPUTE_SHADER_INVOCATIONS);

    let flags = if once {
        vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
    } else {
        vk::CommandBufferUsageFlags::SIMULTANEOUS_USE
    };
    let mut begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    if secondary {
        begin_info = begin_info.inheritance_info(&inheritance);
    }

    if let Err(e) = device.begin_command_buffer(cmd, &begin_info) {
        device.free_command_buffers(pool, &[cmd]);
        return Err(e);
    }

    Ok(cmd)
}

/// Which side of a barrier the host participates on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BarrierKind {
    /// Device-only dependency between shader and transfer work.
    Device,
    /// Data written by the host becomes visible to device work.
    FromHost,
    /// Data written by the device becomes visible to the host.
    ToHost,
}

/// Access and stage masks of one global memory barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BarrierMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl BarrierKind {
    /// The fixed masks for this barrier direction.
    ///
    /// Barriers cover the whole pipeline rather than single resources.
    pub fn masks(self) -> BarrierMasks {
        let src_access = vk::AccessFlags::SHADER_WRITE
            | vk::AccessFlags::MEMORY_WRITE
            | vk::AccessFlags::TRANSFER_WRITE;
        let dst_access = vk::AccessFlags::SHADER_READ
            | vk::AccessFlags::UNIFORM_READ
            | vk::AccessFlags::MEMORY_READ
            | vk::AccessFlags::TRANSFER_READ;
        let src_stage = vk::PipelineStageFlags::COMPUTE_SHADER
            | vk::PipelineStageFlags::GEOMETRY_SHADER
            | vk::PipelineStageFlags::TRANSFER
            | vk::PipelineStageFlags::FRAGMENT_SHADER;
        let dst_stage = vk::PipelineStageFlags::COMPUTE_SHADER
            | vk::PipelineStageFlags::GEOMETRY_SHADER
            | vk::PipelineStageFlags::TRANSFER
            | vk::PipelineStageFlags::VERTEX_SHADER;
        let host_access = vk::AccessFlags::HOST_WRITE | vk::AccessFlags::HOST_READ;

        match self {
            Self::Device => BarrierMasks {
                src_access,
                dst_access,
                src_stage,
                dst_stage,
            },
            Self::FromHost => BarrierMasks {
                src_access: src_access | host_access,
                dst_access,
                src_stage: src_stage | vk::PipelineStageFlags::HOST,
                dst_stage,
            },
            Self::ToHost => BarrierMasks {
                src_access,
                dst_access: dst_access | host_access,
                src_stage,
                dst_stage: dst_stage | vk::PipelineStageFlags::HOST,
            },
        }
    }
}

/// Record a device-side barrier between dependent dispatches or copies.
///
/// # Safety
/// The command buffer must be recording.
pub unsafe fn command_barrier<D: CommandDevice + ?Sized>(device: &D, cmd: vk::CommandBuffer) {
    device.cmd_memory_barrier(cmd, &BarrierKind::Device.masks());
}

/// Record a barrier making host writes visible to device work.
///
/// # Safety
/// The command buffer must be recording.
pub unsafe fn from_host_command_barrier<D: CommandDevice + ?Sized>(
    device: &D,
    cmd: vk::CommandBuffer,
) {
    device.cmd_memory_barrier(cmd, &BarrierKind::FromHost.masks());
}

/// Record a barrier making device writes visible to the host.
///
/// # Safety
/// The command buffer must be recording.
pub unsafe fn to_host_command_barrier<D: CommandDevice + ?Sized>(
    device: &D,
    cmd: vk::CommandBuffer,
) {
    device.cmd_memory_barrier(cmd, &BarrierKind::ToHost.masks());
}

/// Bind a compute pipeline and dispatch it, optionally followed by a device
/// barrier.
///
/// # Safety
/// The command buffer must be recording and the pipeline's descriptor sets
/// bound.
pub unsafe fn cmd_dispatch(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    pipeline: vk::Pipeline,
    groups: [u32; 3],
    barrier: bool,
) {
    device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline);
    device.cmd_dispatch(cmd, groups[0], groups[1], groups[2]);
    if barrier {
        command_barrier(device, cmd);
    }
}

/// Copy buffer regions and record `barrier` after the copy.
///
/// # Safety
/// The command buffer must be recording and the regions in bounds.
pub unsafe fn cmd_copy_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    src: vk::Buffer,
    dst: vk::Buffer,
    regions: &[vk::BufferCopy],
    barrier: BarrierKind,
) {
    device.cmd_copy_buffer(cmd, src, dst, regions);
    device.cmd_memory_barrier(cmd, &barrier.masks());
}

/// Inline a small host array into a buffer.
///
/// # Safety
/// The command buffer must be recording; `data` must be at most 65536 bytes
/// and a multiple of four.
pub unsafe fn cmd_update_buffer<T: bytemuck::Pod>(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    dst: vk::Buffer,
    offset: u64,
    data: &[T],
) {
    device.cmd_update_buffer(cmd, dst, offset, bytemuck::cast_slice(data));
}

/// Fill a buffer range with a repeated 32-bit value.
///
/// # Safety
/// The command buffer must be recording.
pub unsafe fn cmd_fill_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    dst: vk::Buffer,
    offset: u64,
    size: u64,
    value: u32,
) {
    device.cmd_fill_buffer(cmd, dst, offset, size, value);
}
