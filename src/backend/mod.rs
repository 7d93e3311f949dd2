// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash. Frame-level code talks to the GPU only through
// the GpuDevice trait in `gpu`.

pub mod device;
pub mod gpu;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
pub(crate) mod mock;

pub use device::{DeviceCapability, VulkanDevice};
pub use gpu::GpuDevice;
pub use pipeline::Pipeline;
pub use shader::ShaderModule;
pub use swapchain::{Surface, Swapchain};
pub use sync::{FrameSynchronizer, MAX_FRAMES_IN_FLIGHT};
