use ash::vk;

use super::{BuildContext, KernelGroup};
use crate::command::CommandPool;
use crate::descriptors::DescriptorLayoutName;
use crate::error::Result;
use crate::pipeline::INDEX_PUSH_CONSTANT_RANGE;

/// Turns vertex input into the triangle buffers the BVH builder reads.
///
/// Two kernel generations coexist: the original one reads `vertexData` and
/// `vertexInputSet`, the second one reads and writes texel buffers only.
pub struct VertexAssembler {
    pool: CommandPool,
    input: KernelGroup,
    input_v2: KernelGroup,
}

impl VertexAssembler {
    pub const SETS: [DescriptorLayoutName; 2] =
        [DescriptorLayoutName::VertexData, DescriptorLayoutName::VertexInputSet];
    pub const SETS_V2: [DescriptorLayoutName; 2] = [
        DescriptorLayoutName::VertexInputV2In,
        DescriptorLayoutName::VertexInputV2Out,
    ];

    /// # Safety
    /// The context must be valid.
    pub(crate) unsafe fn new(ctx: &BuildContext<'_>) -> Result<Self> {
        let pool = CommandPool::new(
            ctx.device,
            ctx.queue_family,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;

        let push = [INDEX_PUSH_CONSTANT_RANGE];
        let mut input = match KernelGroup::new(ctx, &Self::SETS, &push, &["vertex/vinput"]) {
            Ok(group) => group,
            Err(e) => {
                pool.destroy(ctx.device);
                return Err(e);
            }
        };

        match KernelGroup::new(ctx, &Self::SETS_V2, &push, &["vertex/vinput-v2"]) {
            Ok(input_v2) => Ok(Self {
                pool,
                input,
                input_v2,
            }),
            Err(e) => {
                input.destroy(ctx.device);
                pool.destroy(ctx.device);
                Err(e)
            }
        }
    }

    pub fn command_pool(&self) -> &CommandPool {
        &self.pool
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.input.layout()
    }

    pub fn pipeline(&self) -> vk::Pipeline {
        self.input.pipeline(0)
    }

    pub fn pipeline_layout_v2(&self) -> vk::PipelineLayout {
        self.input_v2.layout()
    }

    pub fn pipeline_v2(&self) -> vk::Pipeline {
        self.input_v2.pipeline(0)
    }

    pub(crate) unsafe fn destroy(&mut self, device: &ash::Device) {
        self.input_v2.destroy(device);
        self.input.destroy(device);
        self.pool.destroy(device);
    }
}
