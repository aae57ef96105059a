//! Device-owned sub-builders: radix sort, vertex assembly and HLBVH2.
//!
//! The kernels themselves are opaque SPIR-V loaded from the device's shader
//! directory. Each builder owns a command pool on the main queue family and
//! the pipeline layouts its kernels were compiled against.

mod hlbvh2;
mod radix_sort;
mod vertex_assembler;

pub use hlbvh2::Hlbvh2Builder;
pub use radix_sort::RadixSort;
pub use vertex_assembler::VertexAssembler;

use std::path::{Path, PathBuf};

use ash::vk;

use crate::descriptors::{DescriptorLayoutCatalog, DescriptorLayoutName};
use crate::error::Result;
use crate::memory::{GpuAllocator, SharedAllocator};
use crate::pipeline::{create_raw_pipeline_layout, ComputePipeline};

/// Device state a sub-builder is constructed from.
pub struct BuildContext<'a> {
    pub device: &'a ash::Device,
    pub allocator: &'a SharedAllocator,
    pub catalog: &'a DescriptorLayoutCatalog,
    pub pipeline_cache: vk::PipelineCache,
    pub queue: vk::Queue,
    pub queue_family: u32,
    pub shader_path: &'a Path,
}

/// Path of a compiled kernel below the shader directory.
pub fn kernel_path(shader_path: &Path, kernel: &str) -> PathBuf {
    shader_path.join(format!("{kernel}.comp.spv"))
}

/// Kernels sharing one pipeline layout.
pub struct KernelGroup {
    layout: vk::PipelineLayout,
    pipelines: Vec<ComputePipeline>,
}

impl KernelGroup {
    /// Create the layout from catalog sets and load every kernel against it.
    ///
    /// # Safety
    /// The context's device, catalog and cache must be valid.
    pub unsafe fn new(
        ctx: &BuildContext<'_>,
        sets: &[DescriptorLayoutName],
        push_constant_ranges: &[vk::PushConstantRange],
        kernels: &[&str],
    ) -> Result<Self> {
        let set_layouts = sets
            .iter()
            .map(|name| ctx.catalog.require(*name))
            .collect::<Result<Vec<_>>>()?;
        let layout = create_raw_pipeline_layout(ctx.device, &set_layouts, push_constant_ranges)?;

        let mut group = Self {
            layout,
            pipelines: Vec::with_capacity(kernels.len()),
        };

        for kernel in kernels {
            let path = kernel_path(ctx.shader_path, kernel);
            match ComputePipeline::from_file(ctx.device, ctx.pipeline_cache, &path, layout) {
                Ok(pipeline) => group.pipelines.push(pipeline),
                Err(e) => {
                    group.destroy(ctx.device);
                    return Err(e);
                }
            }
        }

        Ok(group)
    }

    /// The shared layout.
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Pipeline of the `index`th kernel. `index` must be below the kernel
    /// count; release builds return a null handle otherwise.
    pub fn pipeline(&self, index: usize) -> vk::Pipeline {
        debug_assert!(
            index < self.pipelines.len(),
            "kernel index {index} out of range for {} pipelines",
            self.pipelines.len()
        );
        self.pipelines
            .get(index)
            .map_or(vk::Pipeline::null(), |p| p.pipeline)
    }

    /// Destroy every pipeline and the layout.
    ///
    /// # Safety
    /// None of the pipelines may be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for pipeline in self.pipelines.drain(..) {
            pipeline.destroy(device);
        }
        if self.layout != vk::PipelineLayout::null() {
            device.destroy_pipeline_layout(self.layout, None);
            self.layout = vk::PipelineLayout::null();
        }
    }
}

/// The three sub-builders of a device.
pub struct SubBuilders {
    pub radix_sort: RadixSort,
    pub vertex_assembler: VertexAssembler,
    pub hlbvh2: Hlbvh2Builder,
}

impl SubBuilders {
    /// Construct every sub-builder, releasing the finished ones on failure.
    ///
    /// # Safety
    /// The context must be valid.
    pub unsafe fn new(ctx: &BuildContext<'_>) -> Result<Self> {
        let mut radix_sort = RadixSort::new(ctx)?;

        let mut vertex_assembler = match VertexAssembler::new(ctx) {
            Ok(v) => v,
            Err(e) => {
                radix_sort.destroy(ctx.device);
                return Err(e);
            }
        };

        let hlbvh2 = match Hlbvh2Builder::new(ctx) {
            Ok(h) => h,
            Err(e) => {
                vertex_assembler.destroy(ctx.device);
                radix_sort.destroy(ctx.device);
                return Err(e);
            }
        };

        tracing::debug!("Created sub-builders");
        Ok(Self {
            radix_sort,
            vertex_assembler,
            hlbvh2,
        })
    }

    /// Destroy every sub-builder.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device, allocator: &mut GpuAllocator) {
        self.hlbvh2.destroy(device, allocator);
        self.vertex_assembler.destroy(device);
        self.radix_sort.destroy(device);
    }
}
