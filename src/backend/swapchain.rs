// Swapchain - Window presentation
//
// Manages the surface and the chain of images we render to and present.
// Configuration is fixed: BGRA8 sRGB, FIFO (vsync), surface-minimum image
// count raised to the number of frames in flight. Anything the surface
// cannot do is a fatal MissingCapability; there is no negotiation.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;

use super::device::{color_subresource_range, DeviceCapability, VulkanDevice};
use super::gpu::GpuDevice;
use super::sync::MAX_FRAMES_IN_FLIGHT;
use crate::error::{RenderError, RenderResult};

pub const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Window surface, destroyed after the swapchain built on it.
pub struct Surface {
    surface: vk::SurfaceKHR,
    loader: ash::khr::surface::Instance,
    // Instance must outlive the surface
    _device: Arc<VulkanDevice>,
}

impl Surface {
    /// Create a surface for `window` and verify the device's graphics queue
    /// family can present to it.
    pub fn new<W>(device: &Arc<VulkanDevice>, window: &W) -> RenderResult<Self>
    where
        W: HasWindowHandle + HasDisplayHandle,
    {
        let display_handle = window.display_handle()?.as_raw();
        let window_handle = window.window_handle()?.as_raw();

        let surface = unsafe {
            ash_window::create_surface(
                &device.entry,
                &device.instance,
                display_handle,
                window_handle,
                None,
            )
        }
        .map_err(|e| RenderError::vulkan("create surface", e))?;

        let loader = ash::khr::surface::Instance::new(&device.entry, &device.instance);
        let surface = Self {
            surface,
            loader,
            _device: device.clone(),
        };

        let supported = unsafe {
            surface.loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                surface.surface,
            )
        }
        .map_err(|e| RenderError::vulkan("query surface support", e))?;

        if !supported {
            return Err(RenderError::MissingCapability(
                DeviceCapability::SurfacePresentation,
            ));
        }

        Ok(surface)
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.surface, None) };
    }
}

/// Pick the fixed BGRA8 sRGB format or fail.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> RenderResult<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == PREFERRED_FORMAT.format && f.color_space == PREFERRED_FORMAT.color_space
        })
        .ok_or(RenderError::MissingCapability(DeviceCapability::SurfaceFormat))
}

/// FIFO: vsync-locked, no tearing, bounded latency.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> RenderResult<vk::PresentModeKHR> {
    modes
        .iter()
        .copied()
        .find(|&mode| mode == vk::PresentModeKHR::FIFO)
        .ok_or(RenderError::MissingCapability(DeviceCapability::FifoPresentMode))
}

/// Surface extent, or the window size clamped to the surface bounds when
/// the surface lets the swapchain decide.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: window
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: window
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// Surface minimum, raised so every frame in flight can hold an image.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR, frames_in_flight: usize) -> u32 {
    let mut image_count = caps.min_image_count.max(frames_in_flight as u32);
    if caps.max_image_count > 0 && image_count > caps.max_image_count {
        image_count = caps.max_image_count;
    }
    image_count
}

pub struct Swapchain {
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::Format,
    extent: vk::Extent2D,
    device: Arc<dyn GpuDevice>,
    // Dropped after the swapchain itself
    _surface: Option<Surface>,
}

impl Swapchain {
    pub fn new(
        device: &Arc<VulkanDevice>,
        surface: Surface,
        window_extent: vk::Extent2D,
    ) -> RenderResult<Self> {
        log::info!(
            "Creating swapchain: {}x{}",
            window_extent.width,
            window_extent.height
        );

        let pd = device.physical_device;
        let surface_caps = unsafe {
            surface
                .loader
                .get_physical_device_surface_capabilities(pd, surface.surface)
        }
        .map_err(|e| RenderError::vulkan("query surface capabilities", e))?;

        let formats = unsafe {
            surface
                .loader
                .get_physical_device_surface_formats(pd, surface.surface)
        }
        .map_err(|e| RenderError::vulkan("query surface formats", e))?;

        let present_modes = unsafe {
            surface
                .loader
                .get_physical_device_surface_present_modes(pd, surface.surface)
        }
        .map_err(|e| RenderError::vulkan("query present modes", e))?;

        let surface_format = choose_surface_format(&formats)?;
        let present_mode = choose_present_mode(&present_modes)?;
        let extent = choose_extent(&surface_caps, window_extent);
        let image_count = choose_image_count(&surface_caps, MAX_FRAMES_IN_FLIGHT);

        log::info!("Present mode: {:?}", present_mode);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let loader = device.swapchain_loader();
        let handle = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|e| RenderError::vulkan("create swapchain", e))?;

        let dyn_device: Arc<dyn GpuDevice> = device.clone();
        let mut swapchain = Self {
            swapchain: handle,
            images: Vec::new(),
            image_views: Vec::new(),
            format: surface_format.format,
            extent,
            device: dyn_device,
            _surface: Some(surface),
        };

        swapchain.images = unsafe { loader.get_swapchain_images(handle) }
            .map_err(|e| RenderError::vulkan("get swapchain images", e))?;

        log::info!("Created swapchain with {} images", swapchain.images.len());

        // Views are pushed one by one so a failure still destroys the
        // ones already made
        for &image in &swapchain.images {
            let create_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(color_subresource_range());

            let view = unsafe { device.device.create_image_view(&create_info, None) }
                .map_err(|e| RenderError::vulkan("create image view", e))?;
            swapchain.image_views.push(view);
        }

        swapchain.check_image_count()?;
        Ok(swapchain)
    }

    /// Wrap handles created elsewhere. Takes ownership of the views and the
    /// swapchain handle; they are destroyed on drop.
    pub fn from_parts(
        device: Arc<dyn GpuDevice>,
        swapchain: vk::SwapchainKHR,
        images: Vec<vk::Image>,
        image_views: Vec<vk::ImageView>,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> RenderResult<Self> {
        let swapchain = Self {
            swapchain,
            images,
            image_views,
            format,
            extent,
            device,
            _surface: None,
        };
        swapchain.check_image_count()?;
        Ok(swapchain)
    }

    fn check_image_count(&self) -> RenderResult<()> {
        if self.images.len() < MAX_FRAMES_IN_FLIGHT || self.image_views.len() != self.images.len()
        {
            return Err(RenderError::InsufficientImages {
                images: self.images.len().min(self.image_views.len()),
                frames_in_flight: MAX_FRAMES_IN_FLIGHT,
            });
        }
        Ok(())
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn image(&self, index: u32) -> vk::Image {
        self.images[index as usize]
    }

    pub fn image_view(&self, index: u32) -> vk::ImageView {
        self.image_views[index as usize]
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // Images belong to the presentation engine; only views are ours
        for &view in &self.image_views {
            self.device.destroy_image_view(view);
        }
        self.device.destroy_swapchain(self.swapchain);
    }
}
