// GPU operation seam
//
// Everything the frame protocol and the resource wrappers ask of the GPU
// goes through GpuDevice. VulkanDevice implements it with ash; tests use an
// in-memory recording device. Handles are plain ash::vk handles in both.

use ash::vk;

use crate::error::{RenderError, RenderResult};

use super::pipeline::PipelineState;

/// Parameters for compiling a graphics pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineDesc {
    pub vertex: vk::ShaderModule,
    pub fragment: vk::ShaderModule,
    /// Format of the single color attachment rendered into.
    pub color_format: vk::Format,
    pub state: PipelineState,
}

/// Device-level operations used by the renderer.
///
/// All command recording (`cmd_*`) happens from one thread; implementations
/// only need to guard the queue and the command pool.
pub trait GpuDevice: Send + Sync {
    // Synchronization
    fn create_fence(&self, signaled: bool) -> RenderResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Block until `fence` is signaled.
    fn wait_for_fence(&self, fence: vk::Fence) -> RenderResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> RenderResult<()>;
    fn create_semaphore(&self) -> RenderResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // Command buffers
    fn allocate_command_buffer(&self) -> RenderResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, cmd: vk::CommandBuffer);
    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()>;
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()>;

    // Recording
    fn cmd_image_barrier(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    );
    fn cmd_begin_rendering(
        &self,
        cmd: vk::CommandBuffer,
        view: vk::ImageView,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    );
    fn cmd_end_rendering(&self, cmd: vk::CommandBuffer);
    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline);
    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: vk::Viewport);
    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: vk::Rect2D);
    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );

    // Queue
    /// Submit `cmd`, gating `wait_stage` on `wait`, signaling `signal` and
    /// `fence` when the GPU finishes.
    fn queue_submit(
        &self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        wait_stage: vk::PipelineStageFlags,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> RenderResult<()>;
    fn wait_idle(&self) -> RenderResult<()>;

    // Presentation
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> RenderResult<u32>;
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> RenderResult<()>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    // Resources
    fn create_shader_module(&self, code: &[u32]) -> RenderResult<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    fn create_graphics_pipeline(
        &self,
        desc: &PipelineDesc,
    ) -> RenderResult<(vk::Pipeline, vk::PipelineLayout)>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline, layout: vk::PipelineLayout);
}

/// Interpret the result of `vkAcquireNextImageKHR`.
///
/// A suboptimal acquire still signals the semaphore, but the swapchain is
/// never re-created here, so it is reported the same way as out-of-date.
pub fn map_acquire_result(result: Result<(u32, bool), vk::Result>) -> RenderResult<u32> {
    match result {
        Ok((index, false)) => Ok(index),
        Ok((_, true)) => Err(RenderError::SwapchainSuboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(RenderError::SwapchainOutOfDate),
        Err(e) => Err(RenderError::vulkan("acquire next image", e)),
    }
}

/// Interpret the result of `vkQueuePresentKHR`.
pub fn map_present_result(result: Result<bool, vk::Result>) -> RenderResult<()> {
    match result {
        Ok(false) => Ok(()),
        Ok(true) => Err(RenderError::SwapchainSuboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(RenderError::SwapchainOutOfDate),
        Err(e) => Err(RenderError::vulkan("queue present", e)),
    }
}

/// Stage at which a frame's submission waits for its acquired image.
pub const ACQUIRE_WAIT_STAGE: vk::PipelineStageFlags =
    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;

/// Access and stage masks for one image layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Masks for the two transitions a swapchain image goes through each frame.
pub fn barrier_masks(old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> BarrierMasks {
    match (old_layout, new_layout) {
        // Contents are discarded. The source stage must match the stage the
        // submit waits on the acquire semaphore at, so the transition is
        // chained after the presentation engine releases the image.
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL) => BarrierMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            src_stage: ACQUIRE_WAIT_STAGE,
            dst_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        },
        (vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR) => {
            BarrierMasks {
                src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                dst_access: vk::AccessFlags::empty(),
                src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            }
        }
        _ => BarrierMasks {
            src_access: vk::AccessFlags::MEMORY_WRITE,
            dst_access: vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            src_stage: vk::PipelineStageFlags::ALL_COMMANDS,
            dst_stage: vk::PipelineStageFlags::ALL_COMMANDS,
        },
    }
}
