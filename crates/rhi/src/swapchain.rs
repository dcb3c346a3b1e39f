//! Swapchain and presentation.
//!
//! [`Swapchain`] implements [`Presenter`]. Images are created with
//! `TRANSFER_DST` usage because the renderer writes them with transfer
//! commands (clears) rather than a render pass.
//!
//! An out-of-date swapchain is reported as a value
//! ([`AcquireOutcome::OutOfDate`], [`PresentOutcome::OutOfDate`]); the owner
//! calls [`Swapchain::recreate`] and carries on.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::{debug, error, info, warn};

use crate::backend::{AcquireOutcome, GpuDevice, PresentOutcome, Presenter};
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::instance::Instance;

/// What a surface supports, as reported by the driver.
#[derive(Debug, Clone)]
pub struct SwapchainSupportDetails {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupportDetails {
    /// # Errors
    ///
    /// Returns an error if any of the surface queries fail.
    pub fn query(
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
    ) -> RhiResult<Self> {
        // SAFETY: surface and physical device come from the same instance.
        let (capabilities, formats, present_modes) = unsafe {
            (
                surface_loader.get_physical_device_surface_capabilities(physical_device, surface)?,
                surface_loader.get_physical_device_surface_formats(physical_device, surface)?,
                surface_loader
                    .get_physical_device_surface_present_modes(physical_device, surface)?,
            )
        };

        Ok(Self {
            capabilities,
            formats,
            present_modes,
        })
    }

    #[inline]
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

pub struct Swapchain {
    device: Arc<Device>,
    loader: ash::khr::swapchain::Device,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    format: vk::Format,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    vsync: bool,
}

impl Swapchain {
    /// Creates a swapchain for `surface`.
    ///
    /// `vsync` selects FIFO presentation; otherwise mailbox (or immediate)
    /// is used when the surface offers it.
    ///
    /// # Errors
    ///
    /// Returns an error if the surface cannot be queried, lacks transfer
    /// destination support, or swapchain creation fails.
    pub fn new(
        instance: &Instance,
        device: Arc<Device>,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> RhiResult<Self> {
        let loader = ash::khr::swapchain::Device::new(instance.handle(), device.handle());
        let mut swapchain = Self {
            device,
            loader,
            surface_loader: surface_loader.clone(),
            surface,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            vsync,
        };
        swapchain.build(width, height)?;
        Ok(swapchain)
    }

    /// Rebuilds the swapchain for a new surface size.
    ///
    /// Waits for the device to go idle first, so no frame still references
    /// the old images.
    ///
    /// # Errors
    ///
    /// Returns an error if the wait or creation fails.
    pub fn recreate(&mut self, width: u32, height: u32) -> RhiResult<()> {
        self.device.wait_idle()?;
        info!("Recreating swapchain at {}x{}", width, height);
        self.build(width, height)
    }

    fn build(&mut self, width: u32, height: u32) -> RhiResult<()> {
        let support = SwapchainSupportDetails::query(
            self.device.physical_device(),
            self.surface,
            &self.surface_loader,
        )?;
        if !support.is_adequate() {
            return Err(RhiError::SwapchainError(
                "surface reports no formats or present modes".into(),
            ));
        }

        let usage = vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST;
        if !support.capabilities.supported_usage_flags.contains(usage) {
            return Err(RhiError::SwapchainError(format!(
                "surface does not support image usage {usage:?}"
            )));
        }

        let surface_format = choose_surface_format(&support.formats);
        let present_mode = choose_present_mode(&support.present_modes, self.vsync);
        let extent = choose_extent(&support.capabilities, width, height);
        let image_count = determine_image_count(&support.capabilities);

        let families = self.device.queue_families();
        let (graphics, present) = (
            families.graphics_family.unwrap_or(0),
            families.present_family.unwrap_or(0),
        );
        let shared = [graphics, present];
        let (sharing_mode, family_indices): (_, &[u32]) = if graphics != present {
            (vk::SharingMode::CONCURRENT, &shared)
        } else {
            (vk::SharingMode::EXCLUSIVE, &[])
        };

        let old = self.swapchain;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(usage)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(family_indices)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);

        // SAFETY: the old swapchain (if any) is retired by this call and
        // destroyed below once the new one exists.
        let swapchain = unsafe { self.loader.create_swapchain(&create_info, None)? };
        if old != vk::SwapchainKHR::null() {
            // SAFETY: the device was idled before a rebuild.
            unsafe { self.loader.destroy_swapchain(old, None) };
        }
        self.swapchain = swapchain;

        // SAFETY: swapchain was just created.
        self.images = unsafe { self.loader.get_swapchain_images(swapchain)? };
        self.format = surface_format.format;
        self.extent = extent;
        self.present_mode = present_mode;

        info!(
            "Swapchain ready: {}x{}, {:?}, {:?}, {} images",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            self.images.len()
        );
        Ok(())
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    #[inline]
    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }
}

impl Presenter for Swapchain {
    fn acquire_next_image(
        &self,
        timeout: Duration,
        signal: vk::Semaphore,
    ) -> RhiResult<AcquireOutcome> {
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        // SAFETY: the semaphore is unsignaled with no pending operation.
        let result = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, timeout_ns, signal, vk::Fence::null())
        };
        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Err(RhiError::Timeout {
                operation: "acquire swapchain image",
                timeout,
            }),
            Err(result) => Err(RhiError::DeviceOperation {
                operation: "acquire swapchain image",
                result,
            }),
        }
    }

    fn present(&self, image_index: u32, wait: vk::Semaphore) -> RhiResult<PresentOutcome> {
        let swapchains = [self.swapchain];
        let indices = [image_index];
        let waits = [wait];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);

        match self.device.queue_present(&self.loader, &present_info) {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(result) => Err(RhiError::DeviceOperation {
                operation: "present",
                result,
            }),
        }
    }

    fn image(&self, image_index: u32) -> Option<vk::Image> {
        let image = self.images.get(image_index as usize).copied();
        if image.is_none() {
            error!(
                "Image index {} out of range for {} swapchain images",
                image_index,
                self.images.len()
            );
        }
        image
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        if self.swapchain != vk::SwapchainKHR::null() {
            // SAFETY: owners idle the device before dropping the swapchain.
            unsafe { self.loader.destroy_swapchain(self.swapchain, None) };
            debug!("Swapchain destroyed");
        }
    }
}

/// Prefers B8G8R8A8_SRGB, then B8G8R8A8_UNORM, then whatever comes first.
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    let find = |format| {
        formats.iter().copied().find(|f| {
            f.format == format && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
    };

    find(vk::Format::B8G8R8A8_SRGB)
        .or_else(|| find(vk::Format::B8G8R8A8_UNORM))
        .unwrap_or_else(|| {
            let first = formats.first().copied().unwrap_or_default();
            warn!("Using first available surface format: {:?}", first.format);
            first
        })
}

fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| modes.contains(mode))
        // FIFO is always supported.
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum, bounded by the maximum (0 means unbounded).
fn determine_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let preferred = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        preferred.min(capabilities.max_image_count)
    } else {
        preferred
    }
}
