// =============================================================================
// FRAME RENDERER - Triangle demo
// =============================================================================
//
// Opens a window and draws one triangle per frame through RenderContext.
//
// FRAME FLOW:
// 1. begin_frame  (wait for the slot's previous frame, acquire an image)
// 2. draw         (bind pipeline, dynamic viewport/scissor, 3 vertices)
// 3. end_frame    (submit, present, next slot)
//
// The swapchain is never re-created, so the window is not resizable and
// an out-of-date or suboptimal swapchain ends the program.
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use frame_renderer::{Config, Pipeline, RenderContext, ShaderModule, ShaderSource};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> ExitCode {
    let config = Config::load();
    init_logging(&config);

    log::info!("Starting frame renderer");
    log::info!(
        "Window: {}x{}",
        config.window.width,
        config.window.height
    );

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> Result<()> {
    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app).context("Event loop failed")?;

    match app.failure.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Log level from config.toml, overridden by RUST_LOG when set
fn init_logging(config: &Config) {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or(config.debug.log_level.as_str())).init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Vulkan state created once the window exists.
///
/// Field order matters for Drop: the pipeline and shader go before the
/// context that owns the device.
struct Scene {
    pipeline: Option<Pipeline>,
    shader: Option<ShaderModule>,
    context: RenderContext,
}

/// `scene` is declared before `window` so its surface is destroyed while
/// the window still exists.
struct App {
    config: Config,
    scene: Option<Scene>,
    window: Option<Arc<Window>>,
    /// First fatal error; reported by main after the loop exits
    failure: Option<anyhow::Error>,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            config,
            scene: None,
            window: None,
            failure: None,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_scene(&self, window: &Window) -> Result<Scene> {
        let size = window.inner_size();
        let extent = vk::Extent2D {
            width: size.width,
            height: size.height,
        };

        let context = RenderContext::new(window, extent, &self.config)
            .context("Failed to initialize Vulkan")?;

        let source = ShaderSource::load(&self.config.shaders.vertex, &self.config.shaders.fragment)
            .context("Failed to load shaders")?;
        let shader = context
            .create_shader_module(&source)
            .context("Failed to create shader modules")?;
        let pipeline = context
            .create_pipeline(&shader)
            .context("Failed to create graphics pipeline")?;

        Ok(Scene {
            pipeline: Some(pipeline),
            shader: Some(shader),
            context,
        })
    }

    // =========================================================================
    // RENDERING
    // =========================================================================

    fn render_frame(&mut self) -> Result<()> {
        let Some(scene) = self.scene.as_mut() else {
            return Ok(());
        };
        let Some(pipeline) = scene.pipeline.as_ref() else {
            return Ok(());
        };

        scene.context.begin_frame().context("begin_frame failed")?;
        scene.context.draw(pipeline).context("draw failed")?;
        scene.context.end_frame().context("end_frame failed")?;
        Ok(())
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================

    /// Drain the GPU, then destroy the pipeline before the shader it uses.
    fn shutdown(&mut self) -> Result<()> {
        let Some(mut scene) = self.scene.take() else {
            return Ok(());
        };

        scene.context.wait_idle().context("wait_idle failed")?;
        if let Some(pipeline) = scene.pipeline.take() {
            pipeline.destroy().context("Failed to destroy pipeline")?;
        }
        if let Some(shader) = scene.shader.take() {
            shader.destroy().context("Failed to destroy shader modules")?;
        }

        log::info!(
            "Presented {} frames",
            scene.context.frames_presented()
        );
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        if self.failure.is_none() {
            self.failure = Some(error);
        }
        if let Err(e) = self.shutdown() {
            log::error!("Shutdown after failure: {:#}", e);
        }
        event_loop.exit();
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.graphics.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ))
            .with_resizable(false);

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        match self.init_scene(&window) {
            Ok(scene) => {
                self.scene = Some(scene);
                self.window = Some(window);
            }
            Err(e) => self.fail(event_loop, e),
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Err(e) = self.shutdown() {
                    self.fail(event_loop, e);
                    return;
                }
                event_loop.exit();
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(()) => self.update_fps(),
                Err(e) => self.fail(event_loop, e),
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    if let Err(e) = self.shutdown() {
                        self.fail(event_loop, e);
                        return;
                    }
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    /// Keep redrawing continuously
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        // No-op when the close/Escape path already shut down
        if let Err(e) = self.shutdown() {
            log::error!("Shutdown on exit failed: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropping_app_without_scene_is_clean() {
        let mut app = App::new(Config::default());
        assert!(app.shutdown().is_ok());
        // Second shutdown (as Drop runs it) is a no-op
        assert!(app.shutdown().is_ok());
        assert!(app.scene.is_none());
        drop(app);
    }
}
