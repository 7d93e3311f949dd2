// Graphics pipeline creation and management
//
// One fixed configuration: triangle list, no vertex input (the vertex shader
// builds geometry from gl_VertexIndex), back-face culling, no blending,
// dynamic viewport/scissor, empty layout. Rendering is dynamic, so the
// pipeline names its color format instead of a render pass.

use ash::vk;
use std::sync::Arc;

use super::gpu::{GpuDevice, PipelineDesc};
use super::shader::{ShaderModule, ShaderStages};
use crate::error::{RenderError, RenderResult};

/// Fixed-function state baked into every pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineState {
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub samples: vk::SampleCountFlags,
    pub blend_enable: bool,
    pub color_write_mask: vk::ColorComponentFlags,
}

impl PipelineState {
    /// Viewport and scissor are set per frame to follow the swapchain extent.
    pub const DYNAMIC_STATES: [vk::DynamicState; 2] =
        [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];

    pub const fn fixed() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            // Counter-clockwise as seen through the y-flipped viewport
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            samples: vk::SampleCountFlags::TYPE_1,
            blend_enable: false,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        }
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::fixed()
    }
}

/// Owned pipeline + layout, destroyed when the last holder lets go.
pub(crate) struct PipelineObject {
    device: Arc<dyn GpuDevice>,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    // Modules must outlive every pipeline built from them
    _shader: Arc<ShaderStages>,
}

impl Drop for PipelineObject {
    fn drop(&mut self) {
        log::debug!("Destroying pipeline {:?}", self.pipeline);
        self.device.destroy_pipeline(self.pipeline, self.layout);
    }
}

/// A compiled graphics pipeline (the "material").
///
/// Frames that draw with a pipeline keep it alive until their fence
/// signals, so dropping or destroying it mid-flight defers the GPU-side
/// destruction instead of freeing a handle the GPU still reads.
pub struct Pipeline {
    inner: Arc<PipelineObject>,
}

impl Pipeline {
    pub fn new(
        device: &Arc<dyn GpuDevice>,
        shader: &ShaderModule,
        color_format: vk::Format,
    ) -> RenderResult<Self> {
        let stages = shader.stages();
        let desc = PipelineDesc {
            vertex: stages.vertex,
            fragment: stages.fragment,
            color_format,
            state: PipelineState::fixed(),
        };

        let (pipeline, layout) = device.create_graphics_pipeline(&desc)?;
        log::info!("Created graphics pipeline ({:?})", color_format);

        Ok(Self {
            inner: Arc::new(PipelineObject {
                device: device.clone(),
                pipeline,
                layout,
                _shader: stages.clone(),
            }),
        })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.inner.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.inner.layout
    }

    /// A reference held by an in-flight frame.
    pub(crate) fn share(&self) -> Arc<PipelineObject> {
        self.inner.clone()
    }

    /// Destroy the pipeline.
    ///
    /// Fails with [`RenderError::ResourceInUse`] while a frame in flight
    /// still references it; the GPU object is then released once that
    /// frame retires (or after `wait_idle`).
    pub fn destroy(self) -> RenderResult<()> {
        match Arc::try_unwrap(self.inner) {
            Ok(object) => {
                drop(object);
                Ok(())
            }
            Err(shared) => {
                let holders = Arc::strong_count(&shared) - 1;
                log::error!(
                    "Pipeline {:?} destroyed while {} in-flight frame(s) still use it",
                    shared.pipeline,
                    holders
                );
                Err(RenderError::ResourceInUse {
                    resource: "pipeline",
                    holders,
                })
            }
        }
    }
}

/// Build the fixed pipeline with ash.
pub(crate) fn create_vulkan_pipeline(
    device: &ash::Device,
    desc: &PipelineDesc,
) -> RenderResult<(vk::Pipeline, vk::PipelineLayout)> {
    let state = &desc.state;

    // Shader stages
    let vert_stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(desc.vertex)
        .name(c"main");

    let frag_stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::FRAGMENT)
        .module(desc.fragment)
        .name(c"main");

    let shader_stages = [vert_stage, frag_stage];

    // No vertex buffers
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::default();

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(state.topology)
        .primitive_restart_enable(false);

    // Counts only; the values are dynamic
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(state.polygon_mode)
        .line_width(1.0)
        .cull_mode(state.cull_mode)
        .front_face(state.front_face)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
        .sample_shading_enable(false)
        .rasterization_samples(state.samples);

    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(state.color_write_mask)
        .blend_enable(state.blend_enable);

    let color_blend_attachments = [color_blend_attachment];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&PipelineState::DYNAMIC_STATES);

    // No descriptor sets or push constants
    let layout_info = vk::PipelineLayoutCreateInfo::default();
    let pipeline_layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
        .map_err(|e| RenderError::vulkan("create pipeline layout", e))?;

    let color_formats = [desc.color_format];
    let mut rendering_info =
        vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(pipeline_layout)
        .push_next(&mut rendering_info);

    let pipelines = unsafe {
        device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            std::slice::from_ref(&pipeline_info),
            None,
        )
    };

    match pipelines {
        Ok(pipelines) if !pipelines.is_empty() => Ok((pipelines[0], pipeline_layout)),
        Ok(_) => {
            unsafe { device.destroy_pipeline_layout(pipeline_layout, None) };
            Err(RenderError::vulkan(
                "create graphics pipeline",
                vk::Result::ERROR_UNKNOWN,
            ))
        }
        Err((_, e)) => {
            unsafe { device.destroy_pipeline_layout(pipeline_layout, None) };
            Err(RenderError::vulkan("create graphics pipeline", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockDevice, ObjectKind};
    use crate::backend::shader::ShaderModule;

    #[test]
    fn fixed_state_matches_triangle_configuration() {
        let state = PipelineState::fixed();
        assert_eq!(state.topology, vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!(state.polygon_mode, vk::PolygonMode::FILL);
        assert_eq!(state.cull_mode, vk::CullModeFlags::BACK);
        assert_eq!(state.samples, vk::SampleCountFlags::TYPE_1);
        assert!(!state.blend_enable);
        assert_eq!(state.color_write_mask, vk::ColorComponentFlags::RGBA);
        assert_eq!(
            PipelineState::DYNAMIC_STATES,
            [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR]
        );
    }

    #[test]
    fn pipeline_is_built_from_both_shader_stages() {
        let mock = MockDevice::new(2);
        let device = mock.clone().into_dyn();
        let shader = ShaderModule::from_words(&device, &[0x0723_0203], &[0x0723_0203]).unwrap();

        let pipeline = Pipeline::new(&device, &shader, vk::Format::B8G8R8A8_SRGB).unwrap();

        let desc = mock.last_pipeline_desc().unwrap();
        assert_eq!(desc.vertex, shader.vertex());
        assert_eq!(desc.fragment, shader.fragment());
        assert_eq!(desc.color_format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(desc.state, PipelineState::fixed());

        pipeline.destroy().unwrap();
        shader.destroy().unwrap();
    }

    #[test]
    fn destroy_frees_exactly_pipeline_and_layout() {
        let mock = MockDevice::new(2);
        let device = mock.clone().into_dyn();
        let shader = ShaderModule::from_words(&device, &[1], &[2]).unwrap();
        let pipeline = Pipeline::new(&device, &shader, vk::Format::B8G8R8A8_SRGB).unwrap();

        assert_eq!(mock.live(ObjectKind::Pipeline), 1);
        assert_eq!(mock.live(ObjectKind::PipelineLayout), 1);

        pipeline.destroy().unwrap();

        assert_eq!(mock.live(ObjectKind::Pipeline), 0);
        assert_eq!(mock.live(ObjectKind::PipelineLayout), 0);
        assert_eq!(mock.live(ObjectKind::ShaderModule), 2);

        shader.destroy().unwrap();
        assert_eq!(mock.live(ObjectKind::ShaderModule), 0);
    }

    #[test]
    fn destroy_while_shared_is_reported_and_deferred() {
        let mock = MockDevice::new(2);
        let device = mock.clone().into_dyn();
        let shader = ShaderModule::from_words(&device, &[1], &[2]).unwrap();
        let pipeline = Pipeline::new(&device, &shader, vk::Format::B8G8R8A8_SRGB).unwrap();

        let in_flight = pipeline.share();
        let err = pipeline.destroy().unwrap_err();
        assert!(matches!(
            err,
            RenderError::ResourceInUse {
                resource: "pipeline",
                holders: 1
            }
        ));
        assert_eq!(mock.live(ObjectKind::Pipeline), 1);

        drop(in_flight);
        assert_eq!(mock.live(ObjectKind::Pipeline), 0);
        shader.destroy().unwrap();
    }
}
