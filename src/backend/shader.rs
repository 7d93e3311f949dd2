// Shader module loading and management
//
// Vulkan uses SPIR-V bytecode for shaders. A ShaderModule wraps the vertex
// and fragment modules of one program; both are created together and
// destroyed together.

use ash::vk;
use std::io::Cursor;
use std::sync::Arc;

use super::gpu::GpuDevice;
use crate::assets::ShaderSource;
use crate::error::{RenderError, RenderResult};

/// GPU-side vertex + fragment modules, freed when the last owner drops.
pub(crate) struct ShaderStages {
    device: Arc<dyn GpuDevice>,
    pub(crate) vertex: vk::ShaderModule,
    pub(crate) fragment: vk::ShaderModule,
}

impl Drop for ShaderStages {
    fn drop(&mut self) {
        log::debug!("Destroying shader modules {:?}/{:?}", self.vertex, self.fragment);
        self.device.destroy_shader_module(self.vertex);
        self.device.destroy_shader_module(self.fragment);
    }
}

/// Immutable vertex/fragment shader pair.
///
/// Every [`Pipeline`](super::pipeline::Pipeline) built from it holds its own
/// reference, so the modules outlive the pipelines that use them.
pub struct ShaderModule {
    stages: Arc<ShaderStages>,
}

impl ShaderModule {
    /// Upload both stages of `source`.
    pub fn new(device: &Arc<dyn GpuDevice>, source: &ShaderSource) -> RenderResult<Self> {
        let vertex = decode_spirv("vertex", &source.vertex)?;
        let fragment = decode_spirv("fragment", &source.fragment)?;
        Self::from_words(device, &vertex, &fragment)
    }

    /// Upload already-decoded SPIR-V words.
    pub fn from_words(
        device: &Arc<dyn GpuDevice>,
        vertex: &[u32],
        fragment: &[u32],
    ) -> RenderResult<Self> {
        let vertex = device.create_shader_module(vertex)?;
        let fragment = match device.create_shader_module(fragment) {
            Ok(module) => module,
            Err(e) => {
                device.destroy_shader_module(vertex);
                return Err(e);
            }
        };

        log::info!("Created shader modules (vertex {:?}, fragment {:?})", vertex, fragment);

        Ok(Self {
            stages: Arc::new(ShaderStages {
                device: device.clone(),
                vertex,
                fragment,
            }),
        })
    }

    pub fn vertex(&self) -> vk::ShaderModule {
        self.stages.vertex
    }

    pub fn fragment(&self) -> vk::ShaderModule {
        self.stages.fragment
    }

    pub(crate) fn stages(&self) -> &Arc<ShaderStages> {
        &self.stages
    }

    /// Destroy the modules.
    ///
    /// Fails with [`RenderError::ResourceInUse`] while pipelines built from
    /// this shader are alive. The modules are then freed together with the
    /// last such pipeline.
    pub fn destroy(self) -> RenderResult<()> {
        match Arc::try_unwrap(self.stages) {
            Ok(stages) => {
                drop(stages);
                Ok(())
            }
            Err(shared) => {
                let holders = Arc::strong_count(&shared) - 1;
                log::error!(
                    "Shader module destroyed while {} pipeline(s) still reference it",
                    holders
                );
                Err(RenderError::ResourceInUse {
                    resource: "shader module",
                    holders,
                })
            }
        }
    }
}

/// Decode SPIR-V bytes into words, fixing alignment and endianness.
pub fn decode_spirv(stage: &str, bytes: &[u8]) -> RenderResult<Vec<u32>> {
    if bytes.is_empty() {
        return Err(RenderError::InvalidShader(format!("{} shader is empty", stage)));
    }

    ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|e| RenderError::InvalidShader(format!("{} shader: {}", stage, e)))
}
