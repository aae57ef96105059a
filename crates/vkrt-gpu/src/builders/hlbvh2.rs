use ash::vk;
use gpu_allocator::MemoryLocation;

use super::{BuildContext, KernelGroup};
use crate::command::{cmd_fill_buffer, CommandPool};
use crate::descriptors::DescriptorLayoutName;
use crate::error::Result;
use crate::memory::{GpuAllocator, GpuBuffer};
use crate::sync::submit_once;

const KERNELS: [&str; 5] = [
    "hlbvh2/bound-calc",
    "hlbvh2/leaf-gen",
    "hlbvh2/bvh-build",
    "hlbvh2/leaf-link",
    "hlbvh2/bvh-fit",
];

/// Number of `u32` work counters shared by the build kernels.
pub const COUNTER_COUNT: u64 = 16;

/// Linear BVH builder (HLBVH2) over Morton-sorted leaves.
pub struct Hlbvh2Builder {
    pool: CommandPool,
    kernels: KernelGroup,
    counters: GpuBuffer,
}

impl Hlbvh2Builder {
    pub const SETS: [DescriptorLayoutName; 2] =
        [DescriptorLayoutName::Hlbvh2Work, DescriptorLayoutName::Hlbvh2];

    /// Load the kernels and allocate zeroed work counters. Blocks until the
    /// counters are cleared.
    ///
    /// # Safety
    /// The context must be valid.
    pub(crate) unsafe fn new(ctx: &BuildContext<'_>) -> Result<Self> {
        let pool = CommandPool::new(
            ctx.device,
            ctx.queue_family,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;

        let mut kernels = match KernelGroup::new(ctx, &Self::SETS, &[], &KERNELS) {
            Ok(group) => group,
            Err(e) => {
                pool.destroy(ctx.device);
                return Err(e);
            }
        };

        let size = COUNTER_COUNT * std::mem::size_of::<u32>() as u64;
        let created = ctx.allocator.lock().create_buffer(
            size,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            "hlbvh2_counters",
        );
        let counters = created.and_then(|mut counters| {
            let cleared = submit_once(ctx.device, ctx.queue, pool.handle(), |cmd| {
                cmd_fill_buffer(ctx.device, cmd, counters.buffer, 0, vk::WHOLE_SIZE, 0);
            });
            match cleared {
                Ok(()) => Ok(counters),
                Err(e) => {
                    if let Err(free_err) = ctx.allocator.lock().free_buffer(&mut counters) {
                        tracing::warn!("Failed to free HLBVH2 counters: {free_err}");
                    }
                    Err(e)
                }
            }
        });

        match counters {
            Ok(counters) => Ok(Self {
                pool,
                kernels,
                counters,
            }),
            Err(e) => {
                kernels.destroy(ctx.device);
                pool.destroy(ctx.device);
                Err(e)
            }
        }
    }

    pub fn command_pool(&self) -> &CommandPool {
        &self.pool
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.kernels.layout()
    }

    /// Pipelines in dispatch order.
    pub fn pipelines(&self) -> [vk::Pipeline; 5] {
        std::array::from_fn(|i| self.kernels.pipeline(i))
    }

    pub fn counters(&self) -> vk::Buffer {
        self.counters.buffer
    }

    pub(crate) unsafe fn destroy(&mut self, device: &ash::Device, allocator: &mut GpuAllocator) {
        if let Err(e) = allocator.free_buffer(&mut self.counters) {
            tracing::warn!("Failed to free HLBVH2 counters: {e}");
        }
        self.kernels.destroy(device);
        self.pool.destroy(device);
    }
}
