// In-memory GpuDevice for unit tests (no GPU required)
//
// Hands out fake handles, counts live objects per kind, and records every
// frame-protocol call in order. It panics on the misuse a real driver would
// turn into undefined behavior: double destroy, resetting a command buffer
// whose submission has not been observed complete, waiting on a fence
// nothing will ever signal, signaling a semaphore that is already signaled
// or that an unfinished submission still waits on.

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::gpu::{map_acquire_result, map_present_result, GpuDevice, PipelineDesc};
use super::swapchain::Swapchain;
use crate::error::{RenderError, RenderResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Fence,
    Semaphore,
    CommandBuffer,
    ShaderModule,
    Pipeline,
    PipelineLayout,
    ImageView,
    Swapchain,
}

/// One recorded call. Viewport and scissor are flattened so the variants
/// compare without relying on vk struct equality.
#[derive(Debug, Clone, PartialEq)]
pub enum GpuCall {
    WaitFence(vk::Fence),
    ResetFence(vk::Fence),
    Acquire { image_index: u32 },
    ResetCommandBuffer(vk::CommandBuffer),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    ImageBarrier {
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
    BeginRendering {
        view: vk::ImageView,
        extent: (u32, u32),
        clear_color: [f32; 4],
    },
    EndRendering,
    BindPipeline(vk::Pipeline),
    /// x, y, width, height, min_depth, max_depth
    SetViewport([f32; 6]),
    /// x, y, width, height
    SetScissor((i32, i32, u32, u32)),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    Submit {
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        wait_stage: vk::PipelineStageFlags,
        signal: vk::Semaphore,
        fence: vk::Fence,
    },
    Present {
        image_index: u32,
        wait: vk::Semaphore,
    },
    WaitIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Signaled,
    Unsignaled,
    /// Submitted; the fake GPU completes it when someone waits
    Pending,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    live: HashMap<ObjectKind, HashSet<u64>>,
    fences: HashMap<u64, FenceState>,
    // Submitted command buffer -> fence that retires it
    in_flight: HashMap<u64, u64>,
    // Signaled by acquire, not yet consumed by a submit wait
    signaled_semaphores: HashSet<u64>,
    // Semaphore waited on by a submission -> fence that retires it
    semaphore_waiters: HashMap<u64, u64>,
    calls: Vec<GpuCall>,
    image_count: u32,
    next_image: u32,
    acquire_override: Option<Result<(u32, bool), vk::Result>>,
    present_override: Option<Result<bool, vk::Result>>,
    semaphore_budget: Option<usize>,
    shader_module_budget: Option<usize>,
    last_pipeline_desc: Option<PipelineDesc>,
}

impl MockState {
    fn create(&mut self, kind: ObjectKind) -> u64 {
        self.next_handle += 1;
        let raw = self.next_handle;
        self.live.entry(kind).or_default().insert(raw);
        raw
    }

    fn destroy(&mut self, kind: ObjectKind, raw: u64) {
        let removed = self.live.entry(kind).or_default().remove(&raw);
        assert!(removed, "{:?} {:#x} destroyed twice or never created", kind, raw);
    }

    fn complete(&mut self, fence: u64) {
        self.fences.insert(fence, FenceState::Signaled);
        self.in_flight.retain(|_, f| *f != fence);
        self.semaphore_waiters.retain(|_, f| *f != fence);
    }
}

fn take_budget(budget: &mut Option<usize>) -> bool {
    match budget {
        Some(0) => false,
        Some(n) => {
            *n -= 1;
            true
        }
        None => true,
    }
}

pub struct MockDevice {
    state: Mutex<MockState>,
}

impl MockDevice {
    /// A device whose presentation engine owns `image_count` images.
    pub fn new(image_count: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                image_count,
                ..Default::default()
            }),
        })
    }

    pub fn into_dyn(self: Arc<Self>) -> Arc<dyn GpuDevice> {
        self
    }

    /// Build a swapchain of this device's images at `extent`.
    pub fn swapchain(self: &Arc<Self>, extent: vk::Extent2D) -> RenderResult<Swapchain> {
        let (handle, images, views) = {
            let mut state = self.state.lock();
            let handle = vk::SwapchainKHR::from_raw(state.create(ObjectKind::Swapchain));
            let count = state.image_count;
            let mut images = Vec::new();
            let mut views = Vec::new();
            for _ in 0..count {
                state.next_handle += 1;
                images.push(vk::Image::from_raw(state.next_handle));
                views.push(vk::ImageView::from_raw(state.create(ObjectKind::ImageView)));
            }
            (handle, images, views)
        };

        Swapchain::from_parts(
            self.clone().into_dyn(),
            handle,
            images,
            views,
            vk::Format::B8G8R8A8_SRGB,
            extent,
        )
    }

    pub fn live(&self, kind: ObjectKind) -> usize {
        self.state.lock().live.get(&kind).map_or(0, HashSet::len)
    }

    pub fn calls(&self) -> Vec<GpuCall> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, matches: impl Fn(&GpuCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| matches(call)).count()
    }

    /// Make the next acquire return `result` instead of the next image.
    pub fn override_next_acquire(&self, result: Result<(u32, bool), vk::Result>) {
        self.state.lock().acquire_override = Some(result);
    }

    pub fn override_next_present(&self, result: Result<bool, vk::Result>) {
        self.state.lock().present_override = Some(result);
    }

    /// Allow `n` more semaphores, then fail.
    pub fn fail_semaphore_after(&self, n: usize) {
        self.state.lock().semaphore_budget = Some(n);
    }

    /// Allow `n` more shader modules, then fail.
    pub fn fail_shader_module_after(&self, n: usize) {
        self.state.lock().shader_module_budget = Some(n);
    }

    pub fn last_pipeline_desc(&self) -> Option<PipelineDesc> {
        self.state.lock().last_pipeline_desc
    }
}

impl GpuDevice for MockDevice {
    fn create_fence(&self, signaled: bool) -> RenderResult<vk::Fence> {
        let mut state = self.state.lock();
        let raw = state.create(ObjectKind::Fence);
        let initial = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        state.fences.insert(raw, initial);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.destroy(ObjectKind::Fence, fence.as_raw());
        state.fences.remove(&fence.as_raw());
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> RenderResult<()> {
        let mut state = self.state.lock();
        match state.fences.get(&fence.as_raw()).copied() {
            Some(FenceState::Signaled) => {}
            Some(FenceState::Pending) => state.complete(fence.as_raw()),
            other => panic!("waiting on fence {:?} in state {:?} would never return", fence, other),
        }
        state.calls.push(GpuCall::WaitFence(fence));
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> RenderResult<()> {
        let mut state = self.state.lock();
        let current = state.fences.get(&fence.as_raw()).copied();
        assert_ne!(current, Some(FenceState::Pending), "reset of a fence still in use");
        state.fences.insert(fence.as_raw(), FenceState::Unsignaled);
        state.calls.push(GpuCall::ResetFence(fence));
        Ok(())
    }

    fn create_semaphore(&self) -> RenderResult<vk::Semaphore> {
        let mut state = self.state.lock();
        if !take_budget(&mut state.semaphore_budget) {
            return Err(RenderError::vulkan(
                "create semaphore",
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            ));
        }
        Ok(vk::Semaphore::from_raw(state.create(ObjectKind::Semaphore)))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.destroy(ObjectKind::Semaphore, semaphore.as_raw());
        state.signaled_semaphores.remove(&semaphore.as_raw());
    }

    fn allocate_command_buffer(&self) -> RenderResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        Ok(vk::CommandBuffer::from_raw(state.create(ObjectKind::CommandBuffer)))
    }

    fn free_command_buffer(&self, cmd: vk::CommandBuffer) {
        self.state
            .lock()
            .destroy(ObjectKind::CommandBuffer, cmd.as_raw());
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        let mut state = self.state.lock();
        assert!(
            !state.in_flight.contains_key(&cmd.as_raw()),
            "command buffer {:?} reset before its fence was observed signaled",
            cmd
        );
        state.calls.push(GpuCall::ResetCommandBuffer(cmd));
        Ok(())
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        self.state.lock().calls.push(GpuCall::BeginCommandBuffer(cmd));
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        self.state.lock().calls.push(GpuCall::EndCommandBuffer(cmd));
        Ok(())
    }

    fn cmd_image_barrier(
        &self,
        _cmd: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        self.state.lock().calls.push(GpuCall::ImageBarrier {
            image,
            old_layout,
            new_layout,
        });
    }

    fn cmd_begin_rendering(
        &self,
        _cmd: vk::CommandBuffer,
        view: vk::ImageView,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    ) {
        self.state.lock().calls.push(GpuCall::BeginRendering {
            view,
            extent: (extent.width, extent.height),
            clear_color,
        });
    }

    fn cmd_end_rendering(&self, _cmd: vk::CommandBuffer) {
        self.state.lock().calls.push(GpuCall::EndRendering);
    }

    fn cmd_bind_pipeline(&self, _cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.state.lock().calls.push(GpuCall::BindPipeline(pipeline));
    }

    fn cmd_set_viewport(&self, _cmd: vk::CommandBuffer, viewport: vk::Viewport) {
        self.state.lock().calls.push(GpuCall::SetViewport([
            viewport.x,
            viewport.y,
            viewport.width,
            viewport.height,
            viewport.min_depth,
            viewport.max_depth,
        ]));
    }

    fn cmd_set_scissor(&self, _cmd: vk::CommandBuffer, scissor: vk::Rect2D) {
        self.state.lock().calls.push(GpuCall::SetScissor((
            scissor.offset.x,
            scissor.offset.y,
            scissor.extent.width,
            scissor.extent.height,
        )));
    }

    fn cmd_draw(
        &self,
        _cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.state.lock().calls.push(GpuCall::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    fn queue_submit(
        &self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        wait_stage: vk::PipelineStageFlags,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> RenderResult<()> {
        let mut state = self.state.lock();
        assert_eq!(
            state.fences.get(&fence.as_raw()).copied(),
            Some(FenceState::Unsignaled),
            "submit with a fence that was not reset"
        );
        assert!(
            state.signaled_semaphores.remove(&wait.as_raw()),
            "submit waits on semaphore {:?} that nothing signaled",
            wait
        );
        state.fences.insert(fence.as_raw(), FenceState::Pending);
        state.in_flight.insert(cmd.as_raw(), fence.as_raw());
        state.semaphore_waiters.insert(wait.as_raw(), fence.as_raw());
        state.calls.push(GpuCall::Submit {
            cmd,
            wait,
            wait_stage,
            signal,
            fence,
        });
        Ok(())
    }

    fn wait_idle(&self) -> RenderResult<()> {
        let mut state = self.state.lock();
        let pending: Vec<u64> = state
            .fences
            .iter()
            .filter(|(_, s)| **s == FenceState::Pending)
            .map(|(raw, _)| *raw)
            .collect();
        for fence in pending {
            state.complete(fence);
        }
        state.calls.push(GpuCall::WaitIdle);
        Ok(())
    }

    fn acquire_next_image(
        &self,
        _swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> RenderResult<u32> {
        let mut state = self.state.lock();
        assert!(
            !state.semaphore_waiters.contains_key(&signal.as_raw()),
            "semaphore {:?} signaled while an unfinished submission still waits on it",
            signal
        );
        assert!(
            !state.signaled_semaphores.contains(&signal.as_raw()),
            "semaphore {:?} signaled twice without a wait in between",
            signal
        );
        let result = match state.acquire_override.take() {
            Some(result) => result,
            None => {
                let index = state.next_image;
                state.next_image = (index + 1) % state.image_count.max(1);
                Ok((index, false))
            }
        };
        let index = map_acquire_result(result)?;
        state.signaled_semaphores.insert(signal.as_raw());
        state.calls.push(GpuCall::Acquire { image_index: index });
        Ok(index)
    }

    fn queue_present(
        &self,
        _swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> RenderResult<()> {
        let mut state = self.state.lock();
        let result = state.present_override.take().unwrap_or(Ok(false));
        state.calls.push(GpuCall::Present { image_index, wait });
        map_present_result(result)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state.lock().destroy(ObjectKind::ImageView, view.as_raw());
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.state
            .lock()
            .destroy(ObjectKind::Swapchain, swapchain.as_raw());
    }

    fn create_shader_module(&self, _code: &[u32]) -> RenderResult<vk::ShaderModule> {
        let mut state = self.state.lock();
        if !take_budget(&mut state.shader_module_budget) {
            return Err(RenderError::vulkan(
                "create shader module",
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            ));
        }
        Ok(vk::ShaderModule::from_raw(state.create(ObjectKind::ShaderModule)))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.state
            .lock()
            .destroy(ObjectKind::ShaderModule, module.as_raw());
    }

    fn create_graphics_pipeline(
        &self,
        desc: &PipelineDesc,
    ) -> RenderResult<(vk::Pipeline, vk::PipelineLayout)> {
        let mut state = self.state.lock();
        state.last_pipeline_desc = Some(*desc);
        let layout = vk::PipelineLayout::from_raw(state.create(ObjectKind::PipelineLayout));
        let pipeline = vk::Pipeline::from_raw(state.create(ObjectKind::Pipeline));
        Ok((pipeline, layout))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline, layout: vk::PipelineLayout) {
        let mut state = self.state.lock();
        state.destroy(ObjectKind::Pipeline, pipeline.as_raw());
        state.destroy(ObjectKind::PipelineLayout, layout.as_raw());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit_on(mock: &MockDevice, wait: vk::Semaphore, fence: vk::Fence) {
        let cmd = mock.allocate_command_buffer().unwrap();
        let signal = mock.create_semaphore().unwrap();
        mock.queue_submit(
            cmd,
            wait,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            signal,
            fence,
        )
        .unwrap();
    }

    #[test]
    fn semaphore_is_reusable_once_its_waiter_retired() {
        let mock = MockDevice::new(2);
        let swapchain = vk::SwapchainKHR::null();
        let image_available = mock.create_semaphore().unwrap();
        let fence = mock.create_fence(false).unwrap();

        mock.acquire_next_image(swapchain, image_available).unwrap();
        submit_on(&mock, image_available, fence);
        mock.wait_for_fence(fence).unwrap();

        assert_eq!(mock.acquire_next_image(swapchain, image_available).unwrap(), 1);
    }

    #[test]
    #[should_panic(expected = "still waits on it")]
    fn signaling_a_semaphore_under_an_unfinished_wait_panics() {
        let mock = MockDevice::new(2);
        let swapchain = vk::SwapchainKHR::null();
        let image_available = mock.create_semaphore().unwrap();
        let fence = mock.create_fence(false).unwrap();

        mock.acquire_next_image(swapchain, image_available).unwrap();
        submit_on(&mock, image_available, fence);
        // No fence wait: the submission may still be waiting on the GPU
        let _ = mock.acquire_next_image(swapchain, image_available);
    }

    #[test]
    #[should_panic(expected = "signaled twice")]
    fn double_signal_without_wait_panics() {
        let mock = MockDevice::new(2);
        let image_available = mock.create_semaphore().unwrap();

        mock.acquire_next_image(vk::SwapchainKHR::null(), image_available)
            .unwrap();
        let _ = mock.acquire_next_image(vk::SwapchainKHR::null(), image_available);
    }
}
