// Frame orchestrator
//
// RenderContext owns everything one window needs to draw: the device, the
// swapchain and the frame slots. Each frame walks a fixed sequence:
//
//   begin_frame:  wait slot fence -> reset fence -> acquire image ->
//                 reset/begin cmd -> UNDEFINED->COLOR_ATTACHMENT barrier ->
//                 begin rendering (clear)
//   draw:         bind pipeline, viewport, scissor, draw 3 vertices
//   end_frame:    end rendering -> COLOR_ATTACHMENT->PRESENT barrier ->
//                 end cmd -> submit -> present -> next slot
//
// The CPU only blocks on the slot fence and in wait_idle.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;

use crate::assets::ShaderSource;
use crate::backend::device::VulkanDevice;
use crate::backend::gpu::{GpuDevice, ACQUIRE_WAIT_STAGE};
use crate::backend::pipeline::Pipeline;
use crate::backend::shader::ShaderModule;
use crate::backend::swapchain::{Surface, Swapchain};
use crate::backend::sync::FrameSynchronizer;
use crate::config::{Config, GraphicsConfig};
use crate::error::{RenderError, RenderResult};

/// Vertices per draw call: one triangle built from gl_VertexIndex.
pub const TRIANGLE_VERTEX_COUNT: u32 = 3;

/// Where the current frame is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    Waiting,
    Acquiring,
    Recording,
    Submitted,
    Presented,
}

/// Viewport covering `extent`.
///
/// With `flip` the origin moves to the bottom-left (y = height, negative
/// height) so clip-space +y points up on screen.
pub fn frame_viewport(extent: vk::Extent2D, flip: bool) -> vk::Viewport {
    let width = extent.width as f32;
    let height = extent.height as f32;
    let (y, height) = if flip { (height, -height) } else { (0.0, height) };

    vk::Viewport {
        x: 0.0,
        y,
        width,
        height,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

pub struct RenderContext {
    // Field order is drop order: slots, then swapchain (and its surface),
    // then the device
    sync: FrameSynchronizer,
    swapchain: Swapchain,
    device: Arc<dyn GpuDevice>,
    graphics: GraphicsConfig,
    phase: FramePhase,
    image_index: Option<u32>,
    frames_presented: u64,
    // Work submitted since the last idle wait
    pending_work: bool,
}

impl RenderContext {
    /// Initialize Vulkan for `window`: device, surface, swapchain, frame
    /// slots. Every failure here is fatal.
    pub fn new<W>(window: &W, extent: vk::Extent2D, config: &Config) -> RenderResult<Self>
    where
        W: HasWindowHandle + HasDisplayHandle,
    {
        let display = window.display_handle()?.as_raw();
        let vulkan = VulkanDevice::new(
            &config.window.title,
            config.debug.validation_layers,
            display,
        )?;
        let surface = Surface::new(&vulkan, window)?;
        let swapchain = Swapchain::new(&vulkan, surface, extent)?;

        let device: Arc<dyn GpuDevice> = vulkan;
        Self::from_parts(device, swapchain, config.graphics.clone())
    }

    /// Build a context around an existing device and swapchain.
    pub fn from_parts(
        device: Arc<dyn GpuDevice>,
        swapchain: Swapchain,
        graphics: GraphicsConfig,
    ) -> RenderResult<Self> {
        let sync = FrameSynchronizer::new(device.clone())?;

        log::info!(
            "Render context ready: {}x{}, {} swapchain images",
            swapchain.extent().width,
            swapchain.extent().height,
            swapchain.image_count()
        );

        Ok(Self {
            sync,
            swapchain,
            device,
            graphics,
            phase: FramePhase::Idle,
            image_index: None,
            frames_presented: 0,
            pending_work: false,
        })
    }

    pub fn create_shader_module(&self, source: &ShaderSource) -> RenderResult<ShaderModule> {
        ShaderModule::new(&self.device, source)
    }

    /// Pipeline rendering into this context's swapchain format.
    pub fn create_pipeline(&self, shader: &ShaderModule) -> RenderResult<Pipeline> {
        Pipeline::new(&self.device, shader, self.swapchain.format())
    }

    /// Wait for this slot's previous frame, acquire an image and open the
    /// clear-and-render scope on it.
    pub fn begin_frame(&mut self) -> RenderResult<()> {
        self.expect_phase("begin_frame", FramePhase::Idle)?;

        self.set_phase(FramePhase::Waiting);
        self.sync.wait_current()?;

        self.set_phase(FramePhase::Acquiring);
        let (cmd, image_available) = {
            let slot = self.sync.current();
            (slot.command_buffer(), slot.image_available())
        };
        let image_index = self
            .device
            .acquire_next_image(self.swapchain.handle(), image_available)?;
        self.image_index = Some(image_index);

        self.set_phase(FramePhase::Recording);
        self.device.reset_command_buffer(cmd)?;
        self.device.begin_command_buffer(cmd)?;

        self.device.cmd_image_barrier(
            cmd,
            self.swapchain.image(image_index),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        self.device.cmd_begin_rendering(
            cmd,
            self.swapchain.image_view(image_index),
            self.swapchain.extent(),
            self.graphics.clear_color,
        );

        Ok(())
    }

    /// Record one triangle with `pipeline`.
    ///
    /// The pipeline stays referenced by this frame slot until the slot's
    /// fence signals.
    pub fn draw(&mut self, pipeline: &Pipeline) -> RenderResult<()> {
        self.expect_phase("draw", FramePhase::Recording)?;

        let cmd = self.sync.current().command_buffer();
        let extent = self.swapchain.extent();
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        self.device.cmd_bind_pipeline(cmd, pipeline.handle());
        self.device
            .cmd_set_viewport(cmd, frame_viewport(extent, self.graphics.flip_viewport));
        self.device.cmd_set_scissor(cmd, scissor);
        self.device.cmd_draw(cmd, TRIANGLE_VERTEX_COUNT, 1, 0, 0);

        self.sync.current_mut().retain(pipeline);
        Ok(())
    }

    /// Close the render scope, submit and present, then move to the next
    /// frame slot.
    pub fn end_frame(&mut self) -> RenderResult<()> {
        self.expect_phase("end_frame", FramePhase::Recording)?;
        let image_index = match self.image_index {
            Some(index) => index,
            None => {
                return Err(RenderError::InvalidFrameState {
                    operation: "end_frame",
                    phase: self.phase,
                })
            }
        };

        let (cmd, image_available, render_finished, fence) = {
            let slot = self.sync.current();
            (
                slot.command_buffer(),
                slot.image_available(),
                slot.render_finished(),
                slot.in_flight_fence(),
            )
        };

        self.device.cmd_end_rendering(cmd);
        self.device.cmd_image_barrier(
            cmd,
            self.swapchain.image(image_index),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        self.device.end_command_buffer(cmd)?;

        // Color output must not start before the image is actually ours
        self.device.queue_submit(
            cmd,
            image_available,
            ACQUIRE_WAIT_STAGE,
            render_finished,
            fence,
        )?;
        self.pending_work = true;
        self.set_phase(FramePhase::Submitted);

        self.device
            .queue_present(self.swapchain.handle(), image_index, render_finished)?;
        self.set_phase(FramePhase::Presented);

        self.image_index = None;
        self.frames_presented += 1;
        self.sync.advance();
        self.set_phase(FramePhase::Idle);
        Ok(())
    }

    /// Block until the GPU finished everything submitted so far, then
    /// release every pipeline the frame slots were keeping alive.
    ///
    /// Returns immediately when nothing was submitted since the last call.
    pub fn wait_idle(&mut self) -> RenderResult<()> {
        if self.phase == FramePhase::Recording {
            return Err(RenderError::InvalidFrameState {
                operation: "wait_idle",
                phase: self.phase,
            });
        }

        if self.pending_work {
            self.device.wait_idle()?;
            self.pending_work = false;
            log::debug!("Device idle after {} frames", self.frames_presented);
        }
        self.sync.release_all();
        Ok(())
    }

    #[inline]
    pub fn current_frame(&self) -> usize {
        self.sync.current_frame()
    }

    /// Image acquired for the frame being recorded, if any.
    #[inline]
    pub fn image_index(&self) -> Option<u32> {
        self.image_index
    }

    #[inline]
    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    #[inline]
    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    fn expect_phase(&self, operation: &'static str, expected: FramePhase) -> RenderResult<()> {
        if self.phase != expected {
            log::error!("{} called while frame is {:?}", operation, self.phase);
            return Err(RenderError::InvalidFrameState {
                operation,
                phase: self.phase,
            });
        }
        Ok(())
    }

    fn set_phase(&mut self, phase: FramePhase) {
        log::trace!(
            "Frame slot {}: {:?} -> {:?}",
            self.sync.current_frame(),
            self.phase,
            phase
        );
        self.phase = phase;
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        log::info!("Cleaning up render context...");
        if self.pending_work {
            if let Err(e) = self.device.wait_idle() {
                log::error!("wait_idle during shutdown failed: {}", e);
            }
        }
        self.sync.release_all();
    }
}
