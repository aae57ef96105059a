//! Pipeline layout composition and compute pipelines.

use std::path::Path;
use std::sync::Arc;

use crate::descriptors::{DescriptorLayoutCatalog, DescriptorLayoutName};
use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::vk;

/// What a pipeline layout is composed for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineLayoutKind {
    /// Ray generation, traversal and shading stages.
    RayTracing,
    /// Vertex assembly and every other stage.
    VertexInput,
}

/// Caller part of a pipeline layout.
#[derive(Clone, Debug, Default)]
pub struct PipelineLayoutInfo<'a> {
    /// Append the material set. Honored for ray tracing layouts only.
    pub enable_material_set: bool,
    /// Sets appended after the catalog sets, in order.
    pub set_layouts: &'a [vk::DescriptorSetLayout],
}

/// The single push constant range of non ray tracing layouts: one `u32`
/// visible to compute.
pub const INDEX_PUSH_CONSTANT_RANGE: vk::PushConstantRange = vk::PushConstantRange {
    stage_flags: vk::ShaderStageFlags::COMPUTE,
    offset: 0,
    size: std::mem::size_of::<u32>() as u32,
};

/// Ordered descriptor set layouts of a pipeline layout.
pub fn compose_set_layouts(
    catalog: &DescriptorLayoutCatalog,
    kind: PipelineLayoutKind,
    info: &PipelineLayoutInfo<'_>,
) -> Result<Vec<vk::DescriptorSetLayout>> {
    let mut layouts = match kind {
        PipelineLayoutKind::RayTracing => vec![catalog.require(DescriptorLayoutName::RayTracing)?],
        PipelineLayoutKind::VertexInput => vec![
            catalog.require(DescriptorLayoutName::VertexData)?,
            catalog.require(DescriptorLayoutName::VertexInputSet)?,
        ],
    };

    if info.enable_material_set && kind == PipelineLayoutKind::RayTracing {
        layouts.push(catalog.require(DescriptorLayoutName::MaterialSet)?);
    }

    layouts.extend_from_slice(info.set_layouts);
    Ok(layouts)
}

/// Push constant ranges of a pipeline layout. Ray tracing layouts have none.
pub fn push_constant_ranges(kind: PipelineLayoutKind) -> Vec<vk::PushConstantRange> {
    match kind {
        PipelineLayoutKind::RayTracing => Vec::new(),
        PipelineLayoutKind::VertexInput => vec![INDEX_PUSH_CONSTANT_RANGE],
    }
}

/// Create a bare pipeline layout.
///
/// # Safety
/// The device and every set layout must be valid.
pub unsafe fn create_raw_pipeline_layout(
    device: &ash::Device,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_ranges: &[vk::PushConstantRange],
) -> Result<vk::PipelineLayout> {
    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(set_layouts)
        .push_constant_ranges(push_constant_ranges);

    device
        .create_pipeline_layout(&layout_info, None)
        .map_err(|e| GpuError::PipelineCreation(e.to_string()))
}

/// A composed pipeline layout. Keeps its device alive and is destroyed on
/// drop.
pub struct PipelineLayout {
    device: Arc<Device>,
    kind: PipelineLayoutKind,
    raw: vk::PipelineLayout,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    push_constant_ranges: Vec<vk::PushConstantRange>,
}

impl PipelineLayout {
    /// The raw handle.
    pub fn handle(&self) -> vk::PipelineLayout {
        self.raw
    }

    /// The kind this layout was composed for.
    pub fn kind(&self) -> PipelineLayoutKind {
        self.kind
    }

    /// The final descriptor set layouts, in set order.
    pub fn set_layouts(&self) -> &[vk::DescriptorSetLayout] {
        &self.set_layouts
    }

    /// The final push constant ranges.
    pub fn push_constant_ranges(&self) -> &[vk::PushConstantRange] {
        &self.push_constant_ranges
    }

    /// The owning device.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe { self.device.raw().destroy_pipeline_layout(self.raw, None) };
    }
}

/// Compose and create a pipeline layout on `device`.
pub fn create_pipeline_layout(
    device: &Arc<Device>,
    info: &PipelineLayoutInfo<'_>,
    kind: PipelineLayoutKind,
) -> Result<PipelineLayout> {
    let set_layouts = compose_set_layouts(device.catalog(), kind, info)?;
    let push_constant_ranges = push_constant_ranges(kind);

    let raw = unsafe { create_raw_pipeline_layout(device.raw(), &set_layouts, &push_constant_ranges)? };
    tracing::debug!(?kind, sets = set_layouts.len(), "Created pipeline layout");

    Ok(PipelineLayout {
        device: Arc::clone(device),
        kind,
        raw,
        set_layouts,
        push_constant_ranges,
    })
}

/// Read a SPIR-V binary.
pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let shader_load = |source| GpuError::ShaderLoad {
        path: path.to_path_buf(),
        source,
    };
    let mut file = std::fs::File::open(path).map_err(shader_load)?;
    ash::util::read_spv(&mut file).map_err(shader_load)
}

/// Compute pipeline wrapper. The layout is borrowed, not owned.
pub struct ComputePipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl ComputePipeline {
    /// Create a compute pipeline from shader code.
    ///
    /// # Safety
    /// The device must be valid and the shader code must be valid SPIR-V.
    pub unsafe fn new(
        device: &ash::Device,
        cache: vk::PipelineCache,
        shader_code: &[u32],
        layout: vk::PipelineLayout,
    ) -> Result<Self> {
        let shader_info = vk::ShaderModuleCreateInfo::default().code(shader_code);
        let shader_module = device
            .create_shader_module(&shader_info, None)
            .map_err(|e| GpuError::PipelineCreation(format!("shader module: {e}")))?;

        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader_module)
            .name(c"main");

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(layout);

        let pipelines = device.create_compute_pipelines(cache, &[pipeline_info], None);

        device.destroy_shader_module(shader_module, None);

        let pipeline = pipelines
            .map_err(|(_pipelines, e)| GpuError::PipelineCreation(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::PipelineCreation("no pipeline returned".to_string()))?;

        Ok(Self { pipeline, layout })
    }

    /// Create a compute pipeline from a SPIR-V file.
    ///
    /// # Safety
    /// Same as [`ComputePipeline::new`].
    pub unsafe fn from_file(
        device: &ash::Device,
        cache: vk::PipelineCache,
        path: &Path,
        layout: vk::PipelineLayout,
    ) -> Result<Self> {
        let code = load_spirv(path)?;
        Self::new(device, cache, &code, layout)
    }

    /// Destroy the pipeline.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn layout(raw: u64) -> vk::DescriptorSetLayout {
        vk::DescriptorSetLayout::from_raw(raw)
    }

    fn catalog() -> DescriptorLayoutCatalog {
        DescriptorLayoutCatalog::from_handles(
            DescriptorLayoutName::ALL
                .into_iter()
                .zip(1u64..)
                .map(|(name, raw)| (name, layout(raw))),
        )
    }

    fn catalog_layout(catalog: &DescriptorLayoutCatalog, name: DescriptorLayoutName) -> vk::DescriptorSetLayout {
        catalog.get(name).unwrap()
    }

    #[test]
    fn ray_tracing_with_material_set() {
        let catalog = catalog();
        let extra = [layout(100), layout(101)];
        let info = PipelineLayoutInfo {
            enable_material_set: true,
            set_layouts: &extra,
        };
        let sets = compose_set_layouts(&catalog, PipelineLayoutKind::RayTracing, &info).unwrap();
        assert_eq!(
            sets,
            [
                catalog_layout(&catalog, DescriptorLayoutName::RayTracing),
                catalog_layout(&catalog, DescriptorLayoutName::MaterialSet),
                layout(100),
                layout(101),
            ]
        );
    }

    #[test]
    fn ray_tracing_without_material_set() {
        let catalog = catalog();
        let sets = compose_set_layouts(
            &catalog,
            PipelineLayoutKind::RayTracing,
            &PipelineLayoutInfo::default(),
        )
        .unwrap();
        assert_eq!(sets, [catalog_layout(&catalog, DescriptorLayoutName::RayTracing)]);
    }

    #[test]
    fn vertex_input_ignores_material_set() {
        let catalog = catalog();
        let extra = [layout(200)];
        for enable_material_set in [false, true] {
            let info = PipelineLayoutInfo {
                enable_material_set,
                set_layouts: &extra,
            };
            let sets = compose_set_layouts(&catalog, PipelineLayoutKind::VertexInput, &info).unwrap();
            assert_eq!(
                sets,
                [
                    catalog_layout(&catalog, DescriptorLayoutName::VertexData),
                    catalog_layout(&catalog, DescriptorLayoutName::VertexInputSet),
                    layout(200),
                ]
            );
        }
    }

    #[test]
    fn push_constants() {
        let vertex = push_constant_ranges(PipelineLayoutKind::VertexInput);
        assert_eq!(vertex.len(), 1);
        assert_eq!(vertex[0].stage_flags, vk::ShaderStageFlags::COMPUTE);
        assert_eq!(vertex[0].offset, 0);
        assert_eq!(vertex[0].size, 4);

        assert!(push_constant_ranges(PipelineLayoutKind::RayTracing).is_empty());
    }

    #[test]
    fn missing_catalog_entry_fails() {
        let catalog = DescriptorLayoutCatalog::from_handles([(DescriptorLayoutName::RayTracing, layout(1))]);
        let info = PipelineLayoutInfo {
            enable_material_set: true,
            ..Default::default()
        };
        assert!(matches!(
            compose_set_layouts(&catalog, PipelineLayoutKind::RayTracing, &info),
            Err(GpuError::ResourceNotFound(_))
        ));
        assert!(compose_set_layouts(&catalog, PipelineLayoutKind::VertexInput, &info).is_err());
    }

    #[test]
    fn missing_shader_file() {
        let err = load_spirv(Path::new("/nonexistent/kernel.comp.spv")).unwrap_err();
        assert!(matches!(err, GpuError::ShaderLoad { .. }));
    }
}
