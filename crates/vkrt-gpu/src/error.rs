//! GPU error types.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Device or device-owned object creation failed.
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// A device extension required by the request is not available.
    #[error("Extension not present: {0}")]
    ExtensionNotPresent(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// The device has no usable allocator.
    #[error("No allocator available")]
    AllocatorMissing,

    /// A shader binary could not be read.
    #[error("Failed to load shader {path}: {source}")]
    ShaderLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A fence did not signal within the wait bound.
    #[error("Fence wait timed out after {timeout_ns} ns")]
    FenceTimeout { timeout_ns: u64 },
}

impl GpuError {
    /// Map a fence wait result, turning `TIMEOUT` into [`GpuError::FenceTimeout`].
    pub fn from_fence_wait(result: vk::Result, timeout_ns: u64) -> Self {
        match result {
            vk::Result::TIMEOUT => Self::FenceTimeout { timeout_ns },
            other => Self::Vulkan(other),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_timeout_mapping() {
        assert!(matches!(
            GpuError::from_fence_wait(vk::Result::TIMEOUT, 5),
            GpuError::FenceTimeout { timeout_ns: 5 }
        ));
        assert!(matches!(
            GpuError::from_fence_wait(vk::Result::ERROR_DEVICE_LOST, 5),
            GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)
        ));
    }
}
