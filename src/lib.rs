//! Minimal Vulkan frame renderer.
//!
//! One device, one swapchain, two frames in flight, and one fixed triangle
//! pipeline drawn with dynamic rendering. [`RenderContext`] drives the
//! per-frame protocol:
//!
//! ```no_run
//! # fn run(ctx: &mut frame_renderer::RenderContext, pipeline: &frame_renderer::Pipeline)
//! #     -> frame_renderer::RenderResult<()> {
//! ctx.begin_frame()?;
//! ctx.draw(pipeline)?;
//! ctx.end_frame()?;
//! // At shutdown, before destroying pipelines and shaders:
//! ctx.wait_idle()?;
//! # Ok(())
//! # }
//! ```

pub mod assets;
pub mod backend;
pub mod config;
pub mod error;
pub mod renderer;

pub use assets::ShaderSource;
pub use backend::{Pipeline, ShaderModule};
pub use config::Config;
pub use error::{ErrorKind, RenderError, RenderResult};
pub use renderer::{FramePhase, RenderContext};
