//! Physical device capability detection.

use ash::vk;
use std::ffi::CStr;

/// Device extensions a ray tracing device is created with when available.
///
/// Pass the supported subset to device creation, see
/// [`DeviceFeatures::filter_supported`].
pub const RAYTRACING_EXTENSIONS: [&CStr; 25] = [
    c"VK_AMD_gpu_shader_int16",
    c"VK_AMD_gpu_shader_half_float",
    c"VK_AMD_buffer_marker",
    c"VK_AMD_shader_info",
    c"VK_AMD_shader_ballot",
    c"VK_AMD_texture_gather_bias_lod",
    c"VK_AMD_shader_image_load_store_lod",
    c"VK_AMD_gcn_shader",
    c"VK_AMD_shader_trinary_minmax",
    c"VK_KHR_8bit_storage",
    c"VK_KHR_16bit_storage",
    c"VK_KHR_descriptor_update_template",
    c"VK_KHR_push_descriptor",
    c"VK_KHR_image_format_list",
    c"VK_KHR_sampler_mirror_clamp_to_edge",
    c"VK_KHR_storage_buffer_storage_class",
    c"VK_KHR_variable_pointers",
    c"VK_KHR_relaxed_block_layout",
    c"VK_KHR_get_memory_requirements2",
    c"VK_KHR_get_physical_device_properties2",
    c"VK_KHR_get_surface_capabilities2",
    c"VK_KHR_bind_memory2",
    c"VK_KHR_maintenance1",
    c"VK_KHR_maintenance2",
    c"VK_KHR_maintenance3",
];

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            other => Self::Other(other),
        }
    }
}

/// Features reported by a physical device.
#[derive(Debug, Clone)]
pub struct DeviceFeatures {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Device extension names in driver-reported order
    pub extensions: Vec<String>,
}

impl DeviceFeatures {
    /// Query features from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);

        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to enumerate device extensions: {e}");
                Vec::new()
            })
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .filter_map(|name| name.to_str().ok().map(String::from))
            .collect();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name: CStr::from_ptr(properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned(),
            api_version: properties.api_version,
            extensions,
        }
    }

    /// Build a feature set from a list of extension names.
    pub fn from_extension_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            vendor: GpuVendor::Other(0),
            device_name: String::new(),
            api_version: vk::API_VERSION_1_1,
            extensions: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the device reports `name`. Matching is exact and case-sensitive.
    pub fn supports_extension(&self, name: &CStr) -> bool {
        let Ok(name) = name.to_str() else {
            return false;
        };
        self.extensions.iter().any(|ext| ext == name)
    }

    /// The entries of `wanted` this device reports, preserving order.
    pub fn filter_supported<'a>(&self, wanted: &[&'a CStr]) -> Vec<&'a CStr> {
        wanted
            .iter()
            .copied()
            .filter(|name| self.supports_extension(name))
            .collect()
    }

    /// Get a human-readable summary.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} extensions",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.extensions.len(),
        )
    }
}

/// A selected physical device. Not owned by this crate: the instance must
/// outlive every device created from it.
#[derive(Clone)]
pub struct PhysicalDevice {
    instance: ash::Instance,
    handle: vk::PhysicalDevice,
    features: DeviceFeatures,
}

impl PhysicalDevice {
    /// Wrap a physical device and query its features.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn new(instance: &ash::Instance, handle: vk::PhysicalDevice) -> Self {
        let features = DeviceFeatures::query(instance, handle);
        tracing::info!("Physical device: {}", features.summary());
        Self {
            instance: instance.clone(),
            handle,
            features,
        }
    }

    /// The instance this device was enumerated from.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// The raw handle.
    pub fn handle(&self) -> vk::PhysicalDevice {
        self.handle
    }

    /// The reported features.
    pub fn features(&self) -> &DeviceFeatures {
        &self.features
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x5143), GpuVendor::Other(0x5143));
    }

    #[test]
    fn extension_match_is_exact() {
        let features = DeviceFeatures::from_extension_names(["VK_KHR_maintenance1", "VK_KHR_8bit_storage"]);
        assert!(features.supports_extension(c"VK_KHR_maintenance1"));
        assert!(!features.supports_extension(c"VK_KHR_maintenance"));
        assert!(!features.supports_extension(c"vk_khr_maintenance1"));
        assert!(!features.supports_extension(c"VK_KHR_maintenance12"));
    }

    #[test]
    fn filter_keeps_table_order() {
        let features = DeviceFeatures::from_extension_names([
            "VK_KHR_maintenance3",
            "VK_AMD_gcn_shader",
            "VK_EXT_unrelated",
        ]);
        assert_eq!(
            features.filter_supported(&RAYTRACING_EXTENSIONS),
            [c"VK_AMD_gcn_shader", c"VK_KHR_maintenance3"]
        );
    }

    #[test]
    fn extension_table_has_no_duplicates() {
        let mut names: Vec<_> = RAYTRACING_EXTENSIONS.to_vec();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), RAYTRACING_EXTENSIONS.len());
    }
}
