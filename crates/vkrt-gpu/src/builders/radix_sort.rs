use ash::vk;

use super::{BuildContext, KernelGroup};
use crate::command::CommandPool;
use crate::descriptors::DescriptorLayoutName;
use crate::error::Result;
use crate::pipeline::INDEX_PUSH_CONSTANT_RANGE;

const KERNELS: [&str; 4] = [
    "radix/histogram",
    "radix/workprefix",
    "radix/permute",
    "radix/copyhack",
];

/// Key/value radix sort over `u32` keys.
pub struct RadixSort {
    pool: CommandPool,
    kernels: KernelGroup,
}

impl RadixSort {
    /// Sets bound by every radix sort dispatch.
    pub const SETS: [DescriptorLayoutName; 2] =
        [DescriptorLayoutName::RadixSortBind, DescriptorLayoutName::RadixSort];

    /// # Safety
    /// The context must be valid.
    pub(crate) unsafe fn new(ctx: &BuildContext<'_>) -> Result<Self> {
        let pool = CommandPool::new(
            ctx.device,
            ctx.queue_family,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;

        match KernelGroup::new(ctx, &Self::SETS, &[INDEX_PUSH_CONSTANT_RANGE], &KERNELS) {
            Ok(kernels) => Ok(Self { pool, kernels }),
            Err(e) => {
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

    pub fn histogram(&self) -> vk::Pipeline {
        self.kernels.pipeline(0)
    }

    pub fn work_prefix(&self) -> vk::Pipeline {
        self.kernels.pipeline(1)
    }

    pub fn permute(&self) -> vk::Pipeline {
        self.kernels.pipeline(2)
    }

    pub fn copy(&self) -> vk::Pipeline {
        self.kernels.pipeline(3)
    }

    pub(crate) unsafe fn destroy(&mut self, device: &ash::Device) {
        self.kernels.destroy(device);
        self.pool.destroy(device);
    }
}
