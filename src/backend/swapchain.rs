// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// A swapchain is built whole and dropped whole; recreation means dropping
// this struct and building a fresh one.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use std::sync::Arc;

use super::buffer::create_image_view;
use super::tracker::{self, HandleKind};
use super::DeviceContext;
use crate::error::RenderError;
use crate::window::PresentTarget;

/// Prefer 32-bit BGRA sRGB, else whatever the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// MAILBOX: no vsync stall, no tearing, triple buffered
/// IMMEDIATE: no vsync, may tear
/// FIFO: vsync, always supported
pub fn choose_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| present_modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Fixed surface extent wins; otherwise clamp the framebuffer size into bounds.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, framebuffer: (u32, u32)) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: framebuffer
            .0
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: framebuffer
            .1
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum; a zero maximum means unbounded.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        desired.min(caps.max_image_count)
    } else {
        desired
    }
}

/// Block, pumping window events, until the framebuffer has a non-zero area.
/// Returns `None` if the window is closed while minimized.
pub fn wait_for_nonzero_extent(target: &mut impl PresentTarget) -> Option<(u32, u32)> {
    let mut size = target.framebuffer_size();
    if size.0 == 0 || size.1 == 0 {
        log::info!("Framebuffer is 0x0 (minimized), waiting before recreating swapchain");
    }
    while size.0 == 0 || size.1 == 0 {
        if target.close_requested() {
            return None;
        }
        target.wait_events();
        size = target.framebuffer_size();
    }
    Some(size)
}

/// Result of asking the presentation engine for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { index: u32, suboptimal: bool },
    OutOfDate,
}

/// Result of queueing an image for presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Optimal,
    Suboptimal,
    OutOfDate,
}

impl PresentOutcome {
    pub fn is_stale(self) -> bool {
        self != PresentOutcome::Optimal
    }
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    device: Arc<DeviceContext>,
}

impl Swapchain {
    /// Negotiate format/mode/extent with the device's surface and build the chain.
    pub fn new(device: Arc<DeviceContext>, framebuffer: (u32, u32)) -> Result<Self> {
        let surface = device.surface()?;

        let (surface_caps, formats, present_modes) = unsafe {
            (
                surface
                    .loader
                    .get_physical_device_surface_capabilities(device.physical_device, surface.handle)
                    .context("Failed to query surface capabilities")?,
                surface
                    .loader
                    .get_physical_device_surface_formats(device.physical_device, surface.handle)
                    .context("Failed to query surface formats")?,
                surface
                    .loader
                    .get_physical_device_surface_present_modes(device.physical_device, surface.handle)
                    .context("Failed to query present modes")?,
            )
        };

        let surface_format = choose_surface_format(&formats).context("Surface reports no formats")?;
        let present_mode = choose_present_mode(&present_modes);
        let extent = choose_extent(&surface_caps, framebuffer);
        let image_count = choose_image_count(&surface_caps);

        log::info!(
            "Creating swapchain: {}x{} {:?} {:?}, {} images requested",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            image_count
        );

        let queue_family_indices = device.queue_families.unique();
        let (sharing_mode, shared_families): (_, &[u32]) = if queue_family_indices.len() > 1 {
            (vk::SharingMode::CONCURRENT, queue_family_indices.as_slice())
        } else {
            (vk::SharingMode::EXCLUSIVE, &[][..])
        };

        let swapchain_loader = khr::Swapchain::new(&device.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.handle)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(shared_families)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;
        tracker::created(HandleKind::Swapchain, 1);

        let images = unsafe { swapchain_loader.get_swapchain_images(swapchain) }
            .context("Failed to get swapchain images")?;

        log::info!("Created swapchain with {} images", images.len());

        let mut chain = Self {
            swapchain,
            swapchain_loader,
            images,
            image_views: Vec::new(),
            format: surface_format.format,
            extent,
            present_mode,
            device,
        };

        // Views are pushed one by one so Drop releases exactly what exists
        for i in 0..chain.images.len() {
            let view = create_image_view(
                &chain.device,
                chain.images[i],
                chain.format,
                vk::ImageAspectFlags::COLOR,
            )?;
            chain.image_views.push(view);
            tracker::created(HandleKind::ImageView, 1);
        }

        Ok(chain)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire next image, signaling `semaphore` on the GPU when it is ready
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(RenderError::vulkan("vkAcquireNextImageKHR")(e).into()),
        }
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(false) => Ok(PresentOutcome::Optimal),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(RenderError::vulkan("vkQueuePresentKHR")(e).into()),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
        tracker::destroyed(HandleKind::ImageView, self.image_views.len());
        tracker::destroyed(HandleKind::Swapchain, 1);
    }
}
