// Render Target Pipeline
//
// Render pass, descriptor-set layout, graphics pipeline, depth buffer and
// one framebuffer per color target (normally one per swapchain image).
// Extent and attachment formats are baked in, so the whole state is rebuilt
// after every swapchain recreation.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CStr;
use std::mem::{offset_of, size_of};
use std::sync::Arc;

use super::buffer::{GpuImage, ResourceUploader};
use super::shader::ShaderModule;
use super::swapchain::Swapchain;
use super::tracker::{self, HandleKind};
use super::DeviceContext;
use crate::assets::Vertex;
use crate::config::AssetConfig;
use crate::error::RenderError;

const SHADER_ENTRY: &CStr = c"main";

/// Depth formats in order of preference.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// First candidate whose optimal tiling supports depth attachments.
pub fn pick_depth_format(
    candidates: &[vk::Format],
    properties: impl Fn(vk::Format) -> vk::FormatProperties,
) -> Result<vk::Format, RenderError> {
    candidates
        .iter()
        .copied()
        .find(|&format| {
            properties(format)
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
        .ok_or(RenderError::NoDepthFormat)
}

/// Color attachments the pipeline renders into, one framebuffer each.
#[derive(Debug, Clone, Copy)]
pub struct ColorTargets<'a> {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub views: &'a [vk::ImageView],
    /// Layout the color attachment is left in when the render pass ends
    pub final_layout: vk::ImageLayout,
}

impl<'a> ColorTargets<'a> {
    /// Swapchain images, handed to presentation after the pass.
    pub fn presentable(swapchain: &'a Swapchain) -> Self {
        Self {
            format: swapchain.format,
            extent: swapchain.extent,
            views: &swapchain.image_views,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }
}

/// Everything derived from the current color format and extent.
///
/// Handles start null and are filled in creation order; Drop releases them
/// in reverse. Destroying a null handle is a no-op, so a half-built state
/// still tears down cleanly.
pub struct PipelineState {
    pub framebuffers: Vec<vk::Framebuffer>,
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub depth: Option<GpuImage>,
    pub extent: vk::Extent2D,
    device: Arc<DeviceContext>,
}

impl PipelineState {
    pub fn new(
        device: Arc<DeviceContext>,
        uploader: &ResourceUploader,
        targets: ColorTargets<'_>,
        assets: &AssetConfig,
    ) -> Result<Self> {
        let mut state = Self {
            framebuffers: Vec::new(),
            pipeline: vk::Pipeline::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            render_pass: vk::RenderPass::null(),
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            depth: None,
            extent: targets.extent,
            device: device.clone(),
        };

        let depth_format =
            pick_depth_format(&DEPTH_FORMAT_CANDIDATES, |format| device.format_properties(format))?;

        state.render_pass = create_render_pass(&device, targets.format, targets.final_layout, depth_format)?;
        tracker::created(HandleKind::RenderPass, 1);

        state.descriptor_set_layout = create_descriptor_set_layout(&device)?;
        tracker::created(HandleKind::DescriptorSetLayout, 1);

        // Shader modules only need to outlive pipeline creation
        let vert = ShaderModule::from_file(device.clone(), &assets.vertex_shader)?;
        let frag = ShaderModule::from_file(device.clone(), &assets.fragment_shader)?;

        state.pipeline_layout = create_pipeline_layout(&device, state.descriptor_set_layout)?;
        tracker::created(HandleKind::PipelineLayout, 1);

        state.pipeline = create_graphics_pipeline(
            &device,
            state.render_pass,
            state.pipeline_layout,
            targets.extent,
            vert.module,
            frag.module,
        )?;
        tracker::created(HandleKind::Pipeline, 1);

        let depth = uploader.create_depth_image(targets.extent, depth_format)?;
        let depth_view = depth.view;
        state.depth = Some(depth);

        for &image_view in targets.views {
            let framebuffer = create_framebuffer(
                &device,
                image_view,
                depth_view,
                state.render_pass,
                targets.extent,
            )?;
            state.framebuffers.push(framebuffer);
            tracker::created(HandleKind::Framebuffer, 1);
        }

        log::info!(
            "Pipeline state built for {}x{} ({:?} + {:?})",
            targets.extent.width,
            targets.extent.height,
            targets.format,
            depth_format
        );

        Ok(state)
    }
}

impl Drop for PipelineState {
    fn drop(&mut self) {
        let device = &self.device.device;
        unsafe {
            for &framebuffer in &self.framebuffers {
                device.destroy_framebuffer(framebuffer, None);
            }
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_render_pass(self.render_pass, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }

        tracker::destroyed(HandleKind::Framebuffer, self.framebuffers.len());
        for (is_live, kind) in [
            (self.pipeline != vk::Pipeline::null(), HandleKind::Pipeline),
            (self.pipeline_layout != vk::PipelineLayout::null(), HandleKind::PipelineLayout),
            (self.render_pass != vk::RenderPass::null(), HandleKind::RenderPass),
            (
                self.descriptor_set_layout != vk::DescriptorSetLayout::null(),
                HandleKind::DescriptorSetLayout,
            ),
        ] {
            if is_live {
                tracker::destroyed(kind, 1);
            }
        }
        // depth image drops after this, last in creation order reversed
    }
}

/// Render pass: cleared color (stored, left in `color_final_layout`) +
/// cleared depth (discarded)
pub fn create_render_pass(
    device: &DeviceContext,
    color_format: vk::Format,
    color_final_layout: vk::ImageLayout,
    depth_format: vk::Format,
) -> Result<vk::RenderPass> {
    let color_attachment = vk::AttachmentDescription::builder()
        .format(color_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(color_final_layout)
        .build();

    let depth_attachment = vk::AttachmentDescription::builder()
        .format(depth_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let depth_attachment_ref = vk::AttachmentReference::builder()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachments = &[color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(color_attachments)
        .depth_stencil_attachment(&depth_attachment_ref)
        .build();

    // Color writes wait until the acquired image is released by presentation
    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .build();

    let attachments = &[color_attachment, depth_attachment];
    let subpasses = &[subpass];
    let dependencies = &[dependency];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(attachments)
        .subpasses(subpasses)
        .dependencies(dependencies);

    unsafe { device.device.create_render_pass(&render_pass_info, None) }
        .context("Failed to create render pass")
}

/// Binding 0: per-frame uniforms (vertex). Binding 1: texture (fragment).
pub fn create_descriptor_set_layout(device: &DeviceContext) -> Result<vk::DescriptorSetLayout> {
    let bindings = [
        vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .build(),
        vk::DescriptorSetLayoutBinding::builder()
            .binding(1)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build(),
    ];

    let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

    unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
        .context("Failed to create descriptor set layout")
}

fn create_pipeline_layout(
    device: &DeviceContext,
    descriptor_set_layout: vk::DescriptorSetLayout,
) -> Result<vk::PipelineLayout> {
    let set_layouts = [descriptor_set_layout];
    let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);

    unsafe { device.device.create_pipeline_layout(&layout_info, None) }
        .context("Failed to create pipeline layout")
}

fn create_framebuffer(
    device: &DeviceContext,
    image_view: vk::ImageView,
    depth_image_view: vk::ImageView,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> Result<vk::Framebuffer> {
    let attachments = &[image_view, depth_image_view];
    let framebuffer_info = vk::FramebufferCreateInfo::builder()
        .render_pass(render_pass)
        .attachments(attachments)
        .width(extent.width)
        .height(extent.height)
        .layers(1);

    unsafe { device.device.create_framebuffer(&framebuffer_info, None) }
        .context("Failed to create framebuffer")
}

/// Vertex input description for interleaved `Vertex` data
pub fn vertex_input_info() -> (
    [vk::VertexInputBindingDescription; 1],
    [vk::VertexInputAttributeDescription; 4],
) {
    let binding = vk::VertexInputBindingDescription::builder()
        .binding(0)
        .stride(size_of::<Vertex>() as u32)
        .input_rate(vk::VertexInputRate::VERTEX)
        .build();

    let attribute = |location: u32, format: vk::Format, offset: usize| {
        vk::VertexInputAttributeDescription::builder()
            .binding(0)
            .location(location)
            .format(format)
            .offset(offset as u32)
            .build()
    };

    (
        [binding],
        [
            attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, position)),
            attribute(1, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, normal)),
            attribute(2, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, color)),
            attribute(3, vk::Format::R32G32_SFLOAT, offset_of!(Vertex, uv)),
        ],
    )
}

/// Opaque triangle-list pipeline with depth test and back-face culling
pub fn create_graphics_pipeline(
    device: &DeviceContext,
    render_pass: vk::RenderPass,
    pipeline_layout: vk::PipelineLayout,
    extent: vk::Extent2D,
    vert_shader: vk::ShaderModule,
    frag_shader: vk::ShaderModule,
) -> Result<vk::Pipeline> {
    let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(vert_shader)
        .name(SHADER_ENTRY)
        .build();

    let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::FRAGMENT)
        .module(frag_shader)
        .name(SHADER_ENTRY)
        .build();

    let shader_stages = &[vert_stage, frag_stage];

    let (bindings, attributes) = vertex_input_info();
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    // Viewport and scissor are baked in; a new extent means a new pipeline
    let viewport = vk::Viewport::builder()
        .x(0.0)
        .y(0.0)
        .width(extent.width as f32)
        .height(extent.height as f32)
        .min_depth(0.0)
        .max_depth(1.0)
        .build();

    let scissor = vk::Rect2D::builder()
        .offset(vk::Offset2D { x: 0, y: 0 })
        .extent(extent)
        .build();

    let viewports = &[viewport];
    let scissors = &[scissor];
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewports(viewports)
        .scissors(scissors);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build();

    let color_blend_attachments = &[color_blend_attachment];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(color_blend_attachments);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .layout(pipeline_layout)
        .render_pass(render_pass)
        .subpass(0)
        .build();

    let pipelines = unsafe {
        device
            .device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_, e)| RenderError::vulkan("vkCreateGraphicsPipelines")(e))?
    };

    Ok(pipelines[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depth_capable(supported: &[vk::Format]) -> impl Fn(vk::Format) -> vk::FormatProperties + '_ {
        move |format| vk::FormatProperties {
            optimal_tiling_features: if supported.contains(&format) {
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::FormatFeatureFlags::empty()
            },
            ..Default::default()
        }
    }

    #[test]
    fn depth_format_follows_preference_order() {
        let all = depth_capable(&DEPTH_FORMAT_CANDIDATES);
        assert_eq!(pick_depth_format(&DEPTH_FORMAT_CANDIDATES, all).unwrap(), vk::Format::D32_SFLOAT);

        let stencil_only = depth_capable(&[vk::Format::D24_UNORM_S8_UINT]);
        assert_eq!(
            pick_depth_format(&DEPTH_FORMAT_CANDIDATES, stencil_only).unwrap(),
            vk::Format::D24_UNORM_S8_UINT
        );
    }

    #[test]
    fn missing_depth_format_is_an_error() {
        let none = depth_capable(&[]);
        assert!(matches!(
            pick_depth_format(&DEPTH_FORMAT_CANDIDATES, none),
            Err(RenderError::NoDepthFormat)
        ));
    }

    #[test]
    fn vertex_layout_matches_interleaved_vertex() {
        let (bindings, attributes) = vertex_input_info();
        assert_eq!(bindings[0].stride as usize, size_of::<Vertex>());
        assert_eq!(size_of::<Vertex>(), 11 * size_of::<f32>());

        let offsets: Vec<u32> = attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24, 36]);
        let locations: Vec<u32> = attributes.iter().map(|a| a.location).collect();
        assert_eq!(locations, vec![0, 1, 2, 3]);
    }

    fn offscreen_targets(device: &Arc<DeviceContext>, extent: vk::Extent2D, count: usize) -> Vec<GpuImage> {
        (0..count)
            .map(|_| {
                GpuImage::new(
                    device.clone(),
                    extent,
                    vk::Format::R8G8B8A8_UNORM,
                    vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
                    vk::ImageAspectFlags::COLOR,
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    #[ignore = "requires a Vulkan-capable GPU and compiled shaders"]
    fn rebuilding_at_same_extent_releases_everything_and_matches() {
        let _gpu = tracker::lock_for_test();
        let device = DeviceContext::new("pipeline-test", false, None).unwrap();
        let uploader = ResourceUploader::new(device.clone()).unwrap();

        let shaders = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("shaders");
        let assets = AssetConfig {
            vertex_shader: shaders.join("scene.vert.spv"),
            fragment_shader: shaders.join("scene.frag.spv"),
            ..AssetConfig::default()
        };

        let extent = vk::Extent2D {
            width: 1440,
            height: 900,
        };
        let images = offscreen_targets(&device, extent, 3);
        let views: Vec<vk::ImageView> = images.iter().map(|image| image.view).collect();
        let targets = ColorTargets {
            format: vk::Format::R8G8B8A8_UNORM,
            extent,
            views: &views,
            final_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        };

        let baseline = tracker::snapshot();
        let mut extents = Vec::new();
        for _ in 0..2 {
            let state = PipelineState::new(device.clone(), &uploader, targets, &assets).unwrap();
            assert_eq!(state.framebuffers.len(), 3);
            assert_eq!(
                tracker::live(HandleKind::Framebuffer),
                baseline[HandleKind::Framebuffer as usize] + 3
            );
            assert_ne!(state.pipeline, vk::Pipeline::null());
            extents.push(state.extent);
            drop(state);
            assert_eq!(tracker::snapshot(), baseline);
        }
        assert_eq!(extents, vec![extent, extent]);
    }

    #[test]
    #[ignore = "requires a Vulkan-capable GPU"]
    fn missing_shader_tears_down_partial_state() {
        let _gpu = tracker::lock_for_test();
        let device = DeviceContext::new("pipeline-partial-test", false, None).unwrap();
        let uploader = ResourceUploader::new(device.clone()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let assets = AssetConfig {
            vertex_shader: dir.path().join("missing.vert.spv"),
            fragment_shader: dir.path().join("missing.frag.spv"),
            ..AssetConfig::default()
        };

        let extent = vk::Extent2D {
            width: 64,
            height: 64,
        };
        let images = offscreen_targets(&device, extent, 1);
        let views = [images[0].view];
        let baseline = tracker::snapshot();

        let targets = ColorTargets {
            format: vk::Format::R8G8B8A8_UNORM,
            extent,
            views: &views,
            final_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        };
        // Render pass and set layout exist by the time the shader load fails
        let result = PipelineState::new(device.clone(), &uploader, targets, &assets);
        let err = result.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<RenderError>(),
            Some(RenderError::ShaderUnreadable { .. })
        ));
        assert_eq!(tracker::snapshot(), baseline);
    }
}
