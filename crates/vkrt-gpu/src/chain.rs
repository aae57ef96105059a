//! Private device-creation extension block.
//!
//! [`DeviceExtensionInfo`] configures a [`Device`](crate::Device). It travels
//! inside the `vk::DeviceCreateInfo` p_next chain wrapped in an
//! [`ArtificialDeviceExtension`], tagged with a structure type no driver
//! knows. The block is unlinked before the chain reaches `vkCreateDevice`
//! and relinked afterwards.

use std::ffi::c_void;
use std::path::PathBuf;

use ash::vk;

use crate::memory::SharedAllocator;

/// Structure type tagging [`ArtificialDeviceExtension`]. Outside every
/// registered Vulkan range.
pub const STRUCTURE_TYPE_ARTIFICIAL_DEVICE_EXTENSION: vk::StructureType =
    vk::StructureType::from_raw(0x1000_1000);

/// Device configuration carried by the extension block.
#[derive(Clone, Default)]
pub struct DeviceExtensionInfo {
    /// Externally owned allocator. When set the device borrows it and never
    /// shuts it down; it must outlive the device.
    pub allocator: Option<SharedAllocator>,
    /// Queue family used for traffic buffers, sub-builders and submission.
    pub main_queue_family: u32,
    /// Requested byte size of each traffic buffer.
    pub shared_cache_size: u64,
    /// Directory holding compiled `*.comp.spv` kernels.
    pub shader_path: PathBuf,
}

impl DeviceExtensionInfo {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an externally owned allocator.
    pub fn allocator(mut self, allocator: SharedAllocator) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Set the main queue family index.
    pub fn main_queue_family(mut self, family: u32) -> Self {
        self.main_queue_family = family;
        self
    }

    /// Set the traffic buffer size in bytes.
    pub fn shared_cache_size(mut self, size: u64) -> Self {
        self.shared_cache_size = size;
        self
    }

    /// Set the kernel directory.
    pub fn shader_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.shader_path = path.into();
        self
    }
}

impl std::fmt::Debug for DeviceExtensionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceExtensionInfo")
            .field("external_allocator", &self.allocator.is_some())
            .field("main_queue_family", &self.main_queue_family)
            .field("shared_cache_size", &self.shared_cache_size)
            .field("shader_path", &self.shader_path)
            .finish()
    }
}

/// Chainable wrapper around [`DeviceExtensionInfo`].
#[repr(C)]
pub struct ArtificialDeviceExtension {
    s_type: vk::StructureType,
    p_next: *mut c_void,
    pub info: DeviceExtensionInfo,
}

impl ArtificialDeviceExtension {
    pub fn new(info: DeviceExtensionInfo) -> Self {
        Self {
            s_type: STRUCTURE_TYPE_ARTIFICIAL_DEVICE_EXTENSION,
            p_next: std::ptr::null_mut(),
            info,
        }
    }

    /// Prepend this block to the p_next chain of `create_info`.
    pub fn chain<'a>(&'a mut self, create_info: vk::DeviceCreateInfo<'a>) -> vk::DeviceCreateInfo<'a> {
        let mut create_info = create_info;
        self.p_next = create_info.p_next.cast_mut();
        create_info.p_next = (self as *mut Self).cast::<c_void>().cast_const();
        create_info
    }
}

type Node = *mut vk::BaseOutStructure<'static>;

/// A device create info with every extension block unlinked.
///
/// Dropping it relinks the chain in its original order.
pub struct StrippedChain<'a, 'b> {
    create_info: &'a mut vk::DeviceCreateInfo<'b>,
    original: Vec<Node>,
    extension: Option<DeviceExtensionInfo>,
}

impl<'b> StrippedChain<'_, 'b> {
    /// The create info as the driver sees it.
    pub fn create_info(&self) -> &vk::DeviceCreateInfo<'b> {
        self.create_info
    }

    /// The first extension block found, if any.
    pub fn extension(&self) -> Option<&DeviceExtensionInfo> {
        self.extension.as_ref()
    }
}

unsafe fn link(head: Node, nodes: impl Iterator<Item = Node>) {
    let mut tail = head;
    for node in nodes {
        (*tail).p_next = node;
        tail = node;
    }
    (*tail).p_next = std::ptr::null_mut();
}

impl Drop for StrippedChain<'_, '_> {
    fn drop(&mut self) {
        let head: Node = (&mut *self.create_info as *mut vk::DeviceCreateInfo<'_>).cast();
        unsafe { link(head, self.original.iter().copied()) };
    }
}

/// Unlink every [`ArtificialDeviceExtension`] from the chain of
/// `create_info`, copying out the configuration of the first one.
///
/// # Safety
/// Every node of the chain must be a valid, writable Vulkan structure, and
/// nodes tagged [`STRUCTURE_TYPE_ARTIFICIAL_DEVICE_EXTENSION`] must be
/// [`ArtificialDeviceExtension`]s.
pub unsafe fn strip_device_extension<'a, 'b>(
    create_info: &'a mut vk::DeviceCreateInfo<'b>,
) -> StrippedChain<'a, 'b> {
    let head: Node = (&mut *create_info as *mut vk::DeviceCreateInfo<'_>).cast();

    let mut original = Vec::new();
    let mut node = (*head).p_next;
    while !node.is_null() {
        original.push(node);
        node = (*node).p_next;
    }

    let extension = original
        .iter()
        .find(|n| (***n).s_type == STRUCTURE_TYPE_ARTIFICIAL_DEVICE_EXTENSION)
        .map(|n| (*n.cast::<ArtificialDeviceExtension>()).info.clone());

    link(
        head,
        original
            .iter()
            .copied()
            .filter(|n| (**n).s_type != STRUCTURE_TYPE_ARTIFICIAL_DEVICE_EXTENSION),
    );

    StrippedChain {
        create_info,
        original,
        extension,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_types(create_info: &vk::DeviceCreateInfo<'_>) -> Vec<vk::StructureType> {
        let mut types = Vec::new();
        let mut node = create_info.p_next.cast::<vk::BaseInStructure<'_>>();
        while !node.is_null() {
            unsafe {
                types.push((*node).s_type);
                node = (*node).p_next;
            }
        }
        types
    }

    #[test]
    fn builder_sets_fields() {
        let info = DeviceExtensionInfo::new()
            .main_queue_family(2)
            .shared_cache_size(4096)
            .shader_path("shaders/rt");
        assert!(info.allocator.is_none());
        assert_eq!(info.main_queue_family, 2);
        assert_eq!(info.shared_cache_size, 4096);
        assert_eq!(info.shader_path, PathBuf::from("shaders/rt"));
    }

    #[test]
    fn defaults() {
        let info = DeviceExtensionInfo::default();
        assert!(info.allocator.is_none());
        assert_eq!(info.main_queue_family, 0);
        assert_eq!(info.shared_cache_size, 0);
    }

    #[test]
    fn strip_and_restore() {
        let mut features2 = vk::PhysicalDeviceFeatures2::default();
        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut ext = ArtificialDeviceExtension::new(
            DeviceExtensionInfo::new().main_queue_family(3).shared_cache_size(64),
        );

        let mut create_info = vk::DeviceCreateInfo::default()
            .push_next(&mut vulkan12)
            .push_next(&mut features2);
        create_info = ext.chain(create_info);

        let before = chain_types(&create_info);
        assert_eq!(before.len(), 3);
        assert_eq!(before[0], STRUCTURE_TYPE_ARTIFICIAL_DEVICE_EXTENSION);

        {
            let stripped = unsafe { strip_device_extension(&mut create_info) };
            let info = stripped.extension().map(|e| (e.main_queue_family, e.shared_cache_size));
            assert_eq!(info, Some((3, 64)));

            let seen = chain_types(stripped.create_info());
            assert_eq!(seen.len(), 2);
            assert!(!seen.contains(&STRUCTURE_TYPE_ARTIFICIAL_DEVICE_EXTENSION));
        }

        assert_eq!(chain_types(&create_info), before);
    }

    #[test]
    fn strip_from_middle_of_chain() {
        let mut features2 = vk::PhysicalDeviceFeatures2::default();
        let mut ext = ArtificialDeviceExtension::new(DeviceExtensionInfo::new().main_queue_family(1));
        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default();

        // head -> features2 -> ext -> vulkan12
        ext.p_next = (&mut vulkan12 as *mut vk::PhysicalDeviceVulkan12Features<'_>).cast();
        features2.p_next = (&mut ext as *mut ArtificialDeviceExtension).cast();
        let mut create_info = vk::DeviceCreateInfo::default();
        create_info.p_next = (&mut features2 as *mut vk::PhysicalDeviceFeatures2<'_>)
            .cast_const()
            .cast();

        let before = chain_types(&create_info);
        {
            let stripped = unsafe { strip_device_extension(&mut create_info) };
            assert_eq!(stripped.extension().map(|e| e.main_queue_family), Some(1));
            assert_eq!(
                chain_types(stripped.create_info()),
                [
                    vk::StructureType::PHYSICAL_DEVICE_FEATURES_2,
                    vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_2_FEATURES,
                ]
            );
        }
        assert_eq!(chain_types(&create_info), before);
    }

    #[test]
    fn strip_without_extension() {
        let mut features2 = vk::PhysicalDeviceFeatures2::default();
        let mut create_info = vk::DeviceCreateInfo::default().push_next(&mut features2);

        let stripped = unsafe { strip_device_extension(&mut create_info) };
        assert!(stripped.extension().is_none());
        assert_eq!(
            chain_types(stripped.create_info()),
            [vk::StructureType::PHYSICAL_DEVICE_FEATURES_2]
        );
    }

    #[test]
    fn empty_chain() {
        let mut create_info = vk::DeviceCreateInfo::default();
        let stripped = unsafe { strip_device_extension(&mut create_info) };
        assert!(stripped.extension().is_none());
        assert!(stripped.create_info().p_next.is_null());
    }
}
