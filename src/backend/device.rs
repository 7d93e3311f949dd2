// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with optional validation layers
// - Physical device selection (first enumerated, no scoring)
// - Required capability checks (swapchain, dynamic rendering, graphics queue)
// - Logical device + graphics queue + command pool
// - GpuDevice implementation used by the frame protocol

use ash::{vk, Entry};
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;
use std::ffi::CStr;
use std::fmt;
use std::sync::Arc;

use super::gpu::{self, GpuDevice, PipelineDesc};
use crate::error::{RenderError, RenderResult};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// A device or surface capability the renderer cannot run without.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCapability {
    /// `VK_KHR_swapchain`
    SwapchainPresentation,
    /// Vulkan 1.3 `dynamicRendering` feature
    DynamicRendering,
    /// A queue family with graphics support
    GraphicsQueue,
    /// The graphics family can present to the window surface
    SurfacePresentation,
    /// `B8G8R8A8_SRGB` with `SRGB_NONLINEAR` color space
    SurfaceFormat,
    /// `FIFO` present mode
    FifoPresentMode,
}

impl fmt::Display for DeviceCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceCapability::SwapchainPresentation => "swapchain presentation (VK_KHR_swapchain)",
            DeviceCapability::DynamicRendering => "dynamic rendering (Vulkan 1.3)",
            DeviceCapability::GraphicsQueue => "graphics queue family",
            DeviceCapability::SurfacePresentation => "presentation to the window surface",
            DeviceCapability::SurfaceFormat => "B8G8R8A8_SRGB surface format",
            DeviceCapability::FifoPresentMode => "FIFO present mode",
        };
        f.write_str(name)
    }
}

/// What a physical device offers, gathered before the logical device exists.
#[derive(Debug, Clone, Default)]
pub struct DeviceSupport {
    pub extensions: Vec<String>,
    pub dynamic_rendering: bool,
    pub graphics_queue_family: Option<u32>,
}

/// Device extensions the renderer enables, paired with the capability each
/// one provides.
pub const REQUIRED_DEVICE_EXTENSIONS: &[(&CStr, DeviceCapability)] = &[(
    ash::khr::swapchain::NAME,
    DeviceCapability::SwapchainPresentation,
)];

/// Check a device against the required capability list.
///
/// Returns the graphics queue family index on success.
pub fn check_capabilities(support: &DeviceSupport) -> RenderResult<u32> {
    for (name, capability) in REQUIRED_DEVICE_EXTENSIONS {
        let name = name.to_string_lossy();
        if !support.extensions.iter().any(|ext| *ext == name) {
            return Err(RenderError::MissingCapability(*capability));
        }
    }

    if !support.dynamic_rendering {
        return Err(RenderError::MissingCapability(DeviceCapability::DynamicRendering));
    }

    support
        .graphics_queue_family
        .ok_or(RenderError::MissingCapability(DeviceCapability::GraphicsQueue))
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Vulkan handles
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    pub entry: Entry,

    // Queue handle (submission and present need external synchronization)
    graphics_queue: Mutex<vk::Queue>,
    pub graphics_queue_family: u32,

    command_pool: Mutex<vk::CommandPool>,
    swapchain_loader: ash::khr::swapchain::Device,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers if installed
    /// * `display` - Display the surface will be created on; decides the
    ///   window-system instance extensions
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        display: RawDisplayHandle,
    ) -> RenderResult<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }?;

        // Step 2: Create instance
        let enable_validation = enable_validation && Self::validation_layer_available(&entry);
        let instance = Self::create_instance(&entry, app_name, enable_validation, display)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Pick physical device (first enumerated) and check it
        let (physical_device, graphics_queue_family) = Self::pick_physical_device(&instance)?;

        // Step 5: Create logical device
        let device = Self::create_logical_device(&instance, physical_device, graphics_queue_family)?;
        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(|e| RenderError::vulkan("create command pool", e))?;

        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            properties
                .device_name_as_c_str()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            instance,
            entry,
            graphics_queue: Mutex::new(graphics_queue),
            graphics_queue_family,
            command_pool: Mutex::new(command_pool),
            swapchain_loader,
            debug_utils,
        }))
    }

    pub(crate) fn swapchain_loader(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain_loader
    }

    fn validation_layer_available(entry: &Entry) -> bool {
        let layers = unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();
        let found = layers
            .iter()
            .any(|layer| layer.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER));

        if !found {
            log::warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
        }
        found
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display: RawDisplayHandle,
    ) -> RenderResult<ash::Instance> {
        // Interior NUL bytes are dropped rather than rejected
        let app_name_cstr = std::ffi::CString::new(app_name.replace('\0', ""))
            .unwrap_or_default();

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"frame-renderer")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        // Platform surface extensions
        let mut extensions = ash_window::enumerate_required_extensions(display)
            .map_err(|e| RenderError::vulkan("enumerate surface extensions", e))?
            .to_vec();

        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| RenderError::vulkan("create instance", e))
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> RenderResult<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .map_err(|e| RenderError::vulkan("create debug messenger", e))?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(instance: &ash::Instance) -> RenderResult<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(|e| RenderError::vulkan("enumerate physical devices", e))?;

        let device = *devices.first().ok_or(RenderError::NoDevice)?;
        let support = Self::query_support(instance, device)?;
        let graphics_family = check_capabilities(&support)?;

        Ok((device, graphics_family))
    }

    fn query_support(
        instance: &ash::Instance,
        device: vk::PhysicalDevice,
    ) -> RenderResult<DeviceSupport> {
        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }
            .map_err(|e| RenderError::vulkan("enumerate device extensions", e))?
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .map(|name| name.to_string_lossy().into_owned())
            .collect();

        let props = unsafe { instance.get_physical_device_properties(device) };
        let dynamic_rendering = if props.api_version >= vk::API_VERSION_1_3 {
            let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
            {
                let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut features13);
                unsafe { instance.get_physical_device_features2(device, &mut features2) };
            }
            features13.dynamic_rendering == vk::TRUE
        } else {
            false
        };

        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };
        let graphics_queue_family = queue_families
            .iter()
            .position(|props| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|i| i as u32);

        Ok(DeviceSupport {
            extensions,
            dynamic_rendering,
            graphics_queue_family,
        })
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
    ) -> RenderResult<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities);

        let extensions: Vec<_> = REQUIRED_DEVICE_EXTENSIONS
            .iter()
            .map(|(name, _)| name.as_ptr())
            .collect();

        let mut features13 = vk::PhysicalDeviceVulkan13Features::default().dynamic_rendering(true);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .push_next(&mut features13);

        unsafe { instance.create_device(physical_device, &create_info, None) }
            .map_err(|e| RenderError::vulkan("create logical device", e))
    }
}

impl GpuDevice for VulkanDevice {
    fn create_fence(&self, signaled: bool) -> RenderResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        unsafe { self.device.create_fence(&info, None) }
            .map_err(|e| RenderError::vulkan("create fence", e))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> RenderResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) }
            .map_err(|e| RenderError::vulkan("wait for fence", e))
    }

    fn reset_fence(&self, fence: vk::Fence) -> RenderResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
            .map_err(|e| RenderError::vulkan("reset fence", e))
    }

    fn create_semaphore(&self) -> RenderResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        unsafe { self.device.create_semaphore(&info, None) }
            .map_err(|e| RenderError::vulkan("create semaphore", e))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn allocate_command_buffer(&self) -> RenderResult<vk::CommandBuffer> {
        let pool = self.command_pool.lock();
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }
            .map_err(|e| RenderError::vulkan("allocate command buffer", e))?;
        buffers
            .first()
            .copied()
            .ok_or(RenderError::vulkan("allocate command buffer", vk::Result::ERROR_UNKNOWN))
    }

    fn free_command_buffer(&self, cmd: vk::CommandBuffer) {
        let pool = self.command_pool.lock();
        unsafe { self.device.free_command_buffers(*pool, &[cmd]) };
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }
        .map_err(|e| RenderError::vulkan("reset command buffer", e))
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &info) }
            .map_err(|e| RenderError::vulkan("begin command buffer", e))
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        unsafe { self.device.end_command_buffer(cmd) }
            .map_err(|e| RenderError::vulkan("end command buffer", e))
    }

    fn cmd_image_barrier(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        let masks = gpu::barrier_masks(old_layout, new_layout);
        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(masks.src_access)
            .dst_access_mask(masks.dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(color_subresource_range());

        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                masks.src_stage,
                masks.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    fn cmd_begin_rendering(
        &self,
        cmd: vk::CommandBuffer,
        view: vk::ImageView,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    ) {
        let clear_value = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color,
            },
        };
        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(clear_value);

        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_attachment));

        unsafe { self.device.cmd_begin_rendering(cmd, &rendering_info) };
    }

    fn cmd_end_rendering(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_rendering(cmd) };
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline)
        };
    }

    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(cmd, 0, &[viewport]) };
    }

    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(cmd, 0, &[scissor]) };
    }

    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device
                .cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance)
        };
    }

    fn queue_submit(
        &self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        wait_stage: vk::PipelineStageFlags,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> RenderResult<()> {
        let wait_semaphores = [wait];
        let wait_stages = [wait_stage];
        let command_buffers = [cmd];
        let signal_semaphores = [signal];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        let queue = self.graphics_queue.lock();
        unsafe {
            self.device
                .queue_submit(*queue, std::slice::from_ref(&submit_info), fence)
        }
        .map_err(|e| RenderError::vulkan("queue submit", e))
    }

    fn wait_idle(&self) -> RenderResult<()> {
        // Holding the queue lock keeps present/submit out while idling
        let _queue = self.graphics_queue.lock();
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| RenderError::vulkan("device wait idle", e))
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> RenderResult<u32> {
        let result = unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, u64::MAX, signal, vk::Fence::null())
        };
        gpu::map_acquire_result(result)
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> RenderResult<()> {
        let wait_semaphores = [wait];
        let swapchains = [swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let queue = self.graphics_queue.lock();
        let result = unsafe { self.swapchain_loader.queue_present(*queue, &present_info) };
        gpu::map_present_result(result)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    fn create_shader_module(&self, code: &[u32]) -> RenderResult<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { self.device.create_shader_module(&create_info, None) }
            .map_err(|e| RenderError::vulkan("create shader module", e))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn create_graphics_pipeline(
        &self,
        desc: &PipelineDesc,
    ) -> RenderResult<(vk::Pipeline, vk::PipelineLayout)> {
        super::pipeline::create_vulkan_pipeline(&self.device, desc)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline, layout: vk::PipelineLayout) {
        unsafe {
            self.device.destroy_pipeline(pipeline, None);
            self.device.destroy_pipeline_layout(layout, None);
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        if let Err(e) = self.wait_idle() {
            log::error!("Device wait idle during teardown: {}", e);
        }

        let command_pool = *self.command_pool.get_mut();

        // Cleanup in reverse order
        unsafe {
            self.device.destroy_command_pool(command_pool, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Whole color aspect, single mip and layer (swapchain images)
pub(crate) fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
