// Synchronization primitives
//
// Fences, semaphores and command buffers for each frame in flight.
// Slot i is reused every MAX_FRAMES_IN_FLIGHT frames, and only after its
// fence proves the GPU finished the previous use.

use ash::vk;
use std::sync::Arc;

use super::gpu::GpuDevice;
use super::pipeline::{Pipeline, PipelineObject};
use crate::error::RenderResult;

/// Number of frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Per-frame resources - one per frame in flight
///
/// ```text
/// 1. Wait on in_flight_fence (previous use of this slot retired)
/// 2. Acquire swapchain image (signals image_available)
/// 3. Record into command_buffer
/// 4. Submit: wait image_available, signal render_finished + in_flight_fence
/// 5. Present: wait render_finished
/// ```
pub struct FrameSlot {
    command_buffer: vk::CommandBuffer,
    in_flight_fence: vk::Fence,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    // Pipelines referenced by commands recorded into this slot
    retained: Vec<Arc<PipelineObject>>,
}

impl FrameSlot {
    fn new(device: &dyn GpuDevice) -> RenderResult<Self> {
        let mut slot = Self {
            command_buffer: vk::CommandBuffer::null(),
            in_flight_fence: vk::Fence::null(),
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            retained: Vec::new(),
        };

        if let Err(e) = slot.create_objects(device) {
            slot.destroy(device);
            return Err(e);
        }
        Ok(slot)
    }

    fn create_objects(&mut self, device: &dyn GpuDevice) -> RenderResult<()> {
        self.command_buffer = device.allocate_command_buffer()?;
        // Start signaled so the first wait returns immediately
        self.in_flight_fence = device.create_fence(true)?;
        self.image_available = device.create_semaphore()?;
        self.render_finished = device.create_semaphore()?;
        Ok(())
    }

    fn destroy(&mut self, device: &dyn GpuDevice) {
        self.retained.clear();

        if self.render_finished != vk::Semaphore::null() {
            device.destroy_semaphore(self.render_finished);
        }
        if self.image_available != vk::Semaphore::null() {
            device.destroy_semaphore(self.image_available);
        }
        if self.in_flight_fence != vk::Fence::null() {
            device.destroy_fence(self.in_flight_fence);
        }
        if self.command_buffer != vk::CommandBuffer::null() {
            device.free_command_buffer(self.command_buffer);
        }
    }

    #[inline]
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    #[inline]
    pub fn in_flight_fence(&self) -> vk::Fence {
        self.in_flight_fence
    }

    #[inline]
    pub fn image_available(&self) -> vk::Semaphore {
        self.image_available
    }

    #[inline]
    pub fn render_finished(&self) -> vk::Semaphore {
        self.render_finished
    }

    /// Keep `pipeline` alive until this slot's fence signals.
    pub(crate) fn retain(&mut self, pipeline: &Pipeline) {
        let shared = pipeline.share();
        if !self.retained.iter().any(|held| Arc::ptr_eq(held, &shared)) {
            self.retained.push(shared);
        }
    }

    pub(crate) fn retained_count(&self) -> usize {
        self.retained.len()
    }
}

/// Rotating set of [`FrameSlot`]s.
pub struct FrameSynchronizer {
    slots: Vec<FrameSlot>,
    current_frame: usize,
    device: Arc<dyn GpuDevice>,
}

impl FrameSynchronizer {
    pub fn new(device: Arc<dyn GpuDevice>) -> RenderResult<Self> {
        let mut sync = Self {
            slots: Vec::with_capacity(MAX_FRAMES_IN_FLIGHT),
            current_frame: 0,
            device,
        };

        // Slots created so far are destroyed by Drop if a later one fails
        for i in 0..MAX_FRAMES_IN_FLIGHT {
            let slot = FrameSlot::new(sync.device.as_ref())?;
            log::debug!("Created frame slot {}", i);
            sync.slots.push(slot);
        }

        log::info!("Frame synchronizer ready with {} frames in flight", MAX_FRAMES_IN_FLIGHT);
        Ok(sync)
    }

    #[inline]
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.current_frame]
    }

    pub(crate) fn current_mut(&mut self) -> &mut FrameSlot {
        &mut self.slots[self.current_frame]
    }

    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    /// Block until the current slot's previous submission retired, then
    /// re-arm its fence and drop the resources that submission kept alive.
    pub fn wait_current(&mut self) -> RenderResult<()> {
        let slot = &mut self.slots[self.current_frame];
        self.device.wait_for_fence(slot.in_flight_fence)?;
        self.device.reset_fence(slot.in_flight_fence)?;
        slot.retained.clear();
        Ok(())
    }

    /// Move to the next slot (round-robin).
    pub fn advance(&mut self) {
        self.current_frame = (self.current_frame + 1) % self.slots.len();
    }

    /// Drop everything retained by every slot. Only valid once the device
    /// is idle.
    pub(crate) fn release_all(&mut self) {
        for slot in &mut self.slots {
            slot.retained.clear();
        }
    }
}

impl Drop for FrameSynchronizer {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            slot.destroy(self.device.as_ref());
        }
    }
}
