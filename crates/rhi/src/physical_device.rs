//! Physical device (GPU) selection.
//!
//! A device qualifies if it has a graphics queue family, a family that can
//! present to the window surface, and the swapchain extension. Among
//! qualifying devices discrete GPUs win, then larger device-local memory.
//!
//! Transfer and compute families are only reported when the device has a
//! *dedicated* family for them. Callers that find `None` submit that work to
//! the graphics queue instead.

use std::ffi::CStr;

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::{RhiError, RhiResult};

/// Queue family indices for the queue kinds the engine submits to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics_family: Option<u32>,
    pub present_family: Option<u32>,
    /// A family with compute but no graphics support
    pub compute_family: Option<u32>,
    /// A family with transfer but neither graphics nor compute support
    pub transfer_family: Option<u32>,
}

impl QueueFamilyIndices {
    /// Picks families from the properties reported by a device.
    ///
    /// `supports_present` is asked about each family index until one
    /// answers true.
    pub fn from_properties(
        families: &[vk::QueueFamilyProperties],
        mut supports_present: impl FnMut(u32) -> bool,
    ) -> Self {
        let mut indices = Self::default();

        for (i, family) in families.iter().enumerate() {
            let i = i as u32;
            if family.queue_count == 0 {
                continue;
            }

            let flags = family.queue_flags;
            let graphics = flags.contains(vk::QueueFlags::GRAPHICS);
            let compute = flags.contains(vk::QueueFlags::COMPUTE);
            let transfer = flags.contains(vk::QueueFlags::TRANSFER);

            if graphics && indices.graphics_family.is_none() {
                indices.graphics_family = Some(i);
            }
            if compute && !graphics && indices.compute_family.is_none() {
                indices.compute_family = Some(i);
            }
            if transfer && !graphics && !compute && indices.transfer_family.is_none() {
                indices.transfer_family = Some(i);
            }
            if indices.present_family.is_none() && supports_present(i) {
                indices.present_family = Some(i);
            }
        }

        indices
    }

    /// Graphics and present families were both found.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.graphics_family.is_some() && self.present_family.is_some()
    }

    /// Distinct family indices, graphics first. One queue is created per
    /// entry.
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(4);
        for family in [
            self.graphics_family,
            self.present_family,
            self.compute_family,
            self.transfer_family,
        ]
        .into_iter()
        .flatten()
        {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

/// Information about the selected GPU.
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    pub device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: QueueFamilyIndices,
}

impl PhysicalDeviceInfo {
    pub fn device_name(&self) -> &str {
        // SAFETY: the driver fills device_name with a NUL-terminated string.
        unsafe {
            CStr::from_ptr(self.properties.device_name.as_ptr())
                .to_str()
                .unwrap_or("Unknown Device")
        }
    }

    pub fn device_type_name(&self) -> &'static str {
        device_type_name(self.properties.device_type)
    }

    /// Total device-local memory in bytes.
    pub fn device_local_memory(&self) -> u64 {
        self.memory_properties
            .memory_heaps
            .iter()
            .take(self.memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }
}

impl std::fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDeviceInfo")
            .field("name", &self.device_name())
            .field("type", &self.device_type_name())
            .field("queue_families", &self.queue_families)
            .finish()
    }
}

/// Selects the most suitable GPU for presenting to `surface`.
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] if no device qualifies.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> RhiResult<PhysicalDeviceInfo> {
    // SAFETY: the instance is valid for the duration of the call.
    let devices = unsafe { instance.enumerate_physical_devices()? };
    info!("Found {} GPU(s)", devices.len());

    let best = devices
        .into_iter()
        .filter_map(|device| check_device(instance, device, surface, surface_loader))
        .map(|info| {
            let score = rate_device(&info);
            debug!(
                "GPU '{}' ({}) scored {}",
                info.device_name(),
                info.device_type_name(),
                score
            );
            (info, score)
        })
        .max_by_key(|(_, score)| *score);

    match best {
        Some((info, _)) => {
            info!(
                "Selected GPU: '{}' ({}), queues {:?}",
                info.device_name(),
                info.device_type_name(),
                info.queue_families
            );
            Ok(info)
        }
        None => {
            warn!("No GPU offers graphics, presentation and swapchain support");
            Err(RhiError::NoSuitableGpu)
        }
    }
}

fn check_device(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> Option<PhysicalDeviceInfo> {
    // SAFETY: `device` was just enumerated from `instance`.
    let (properties, memory_properties, families) = unsafe {
        (
            instance.get_physical_device_properties(device),
            instance.get_physical_device_memory_properties(device),
            instance.get_physical_device_queue_family_properties(device),
        )
    };

    let queue_families = QueueFamilyIndices::from_properties(&families, |index| {
        // SAFETY: index is below the family count reported above.
        unsafe {
            surface_loader
                .get_physical_device_surface_support(device, index, surface)
                .unwrap_or(false)
        }
    });

    let info = PhysicalDeviceInfo {
        device,
        properties,
        memory_properties,
        queue_families,
    };

    if !queue_families.is_complete() {
        debug!("GPU '{}' skipped: no graphics or present queue", info.device_name());
        return None;
    }
    if !supports_swapchain(instance, device) {
        debug!("GPU '{}' skipped: no swapchain extension", info.device_name());
        return None;
    }
    Some(info)
}

fn supports_swapchain(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
    // SAFETY: `device` belongs to `instance`.
    let Ok(extensions) = (unsafe { instance.enumerate_device_extension_properties(device) })
    else {
        return false;
    };
    extensions.iter().any(|ext| {
        ext.extension_name_as_c_str()
            .is_ok_and(|name| name == ash::khr::swapchain::NAME)
    })
}

fn rate_device(info: &PhysicalDeviceInfo) -> u64 {
    let type_score: u64 = match info.properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 100_000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 10_000,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 1_000,
        _ => 0,
    };
    let vram_mb = info.device_local_memory() / (1024 * 1024);
    let dedicated = [
        info.queue_families.transfer_family,
        info.queue_families.compute_family,
    ]
    .iter()
    .filter(|f| f.is_some())
    .count() as u64;

    type_score + vram_mb.min(65_536) + dedicated * 100
}

fn device_type_name(ty: vk::PhysicalDeviceType) -> &'static str {
    match ty {
        vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
        vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
        vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
        vk::PhysicalDeviceType::CPU => "CPU",
        _ => "Other",
    }
}
