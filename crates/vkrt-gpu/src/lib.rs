//! Vulkan host core of the vkrt GPU ray tracer.
//!
//! This crate provides:
//! - Device creation from a create info carrying a private configuration block
//! - The named descriptor set layout catalog the compute kernels bind against
//! - Pipeline layout composition for ray tracing and vertex input pipelines
//! - Host/device staging buffers (buffer traffic)
//! - Command buffer recording helpers, barriers and fence-based submission
//! - Selection between the software BVH and hardware ray tracing backends

pub mod acceleration;
pub mod builders;
pub mod capabilities;
pub mod chain;
pub mod command;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod memory;
pub mod pipeline;
pub mod sync;
pub mod traffic;

pub use acceleration::{
    get_accelerator_handle, AccelerationBackend, AccelerationName, AccelerationSelector,
    AcceleratorSet, AcceleratorSetInfo, RTX_EXTENSION_NAME,
};
pub use capabilities::{DeviceFeatures, GpuVendor, PhysicalDevice, RAYTRACING_EXTENSIONS};
pub use chain::{ArtificialDeviceExtension, DeviceExtensionInfo};
pub use command::{
    command_barrier, create_command_buffer, from_host_command_barrier, to_host_command_barrier,
    BarrierKind, CommandDevice, CommandPool,
};
pub use descriptors::{DescriptorLayoutCatalog, DescriptorLayoutName, DescriptorPool};
pub use device::{convert_device, create_device, Device};
pub use error::{GpuError, Result};
pub use memory::{GpuAllocator, GpuBuffer, SharedAllocator};
pub use pipeline::{
    create_pipeline_layout, ComputePipeline, PipelineLayout, PipelineLayoutInfo,
    PipelineLayoutKind,
};
pub use sync::{submit_cmd, submit_cmd_async, submit_once, submit_once_async, DEFAULT_FENCE_TIMEOUT};
pub use traffic::BufferTraffic;
