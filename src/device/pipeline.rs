// Pipeline state objects and their construction
//
// Pipeline layouts are derived from the reflected descriptor tables of
// every stage: bindings group by set index, matching (set, binding)
// pairs union their stage flags and counts, and a descriptor-type
// conflict aborts the build. Push-constant ranges contract to the
// tight envelope over their member declarations. Render pipelines use
// dynamic rendering, so attachment formats ride in through a
// VkPipelineRenderingCreateInfo chain instead of a render pass.

use std::sync::Arc;

use ash::vk;

use utils::log;

use super::shader::{PipelineReflection, ShaderFunction, ShaderStage, StageReflection};
use super::types::{
    BlendState, CompareFunction, PixelFormat, PrimitiveType, StencilOperation, TriangleFillMode,
    VertexFormat, VertexStepRate,
};
use super::GraphicsDevice;
use crate::{GraupelError, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VertexAttributeDescriptor {
    pub format: VertexFormat,
    pub offset: u32,
    pub buffer_index: u32,
    pub location: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VertexBufferLayoutDescriptor {
    pub step: VertexStepRate,
    pub stride: u32,
    pub buffer_index: u32,
}

#[derive(Clone, Debug, Default)]
pub struct VertexDescriptor {
    pub attributes: Vec<VertexAttributeDescriptor>,
    pub layouts: Vec<VertexBufferLayoutDescriptor>,
}

#[derive(Clone)]
pub struct RenderPipelineColorAttachmentDescriptor {
    pub index: u32,
    pub pixel_format: PixelFormat,
    pub blend_state: BlendState,
}

#[derive(Clone)]
pub struct RenderPipelineDescriptor {
    pub vertex_function: Option<Arc<ShaderFunction>>,
    pub fragment_function: Option<Arc<ShaderFunction>>,
    pub vertex_descriptor: VertexDescriptor,
    pub color_attachments: Vec<RenderPipelineColorAttachmentDescriptor>,
    pub depth_stencil_attachment_pixel_format: PixelFormat,
    pub primitive_topology: PrimitiveType,
    pub triangle_fill_mode: TriangleFillMode,
    pub rasterization_enabled: bool,
}

impl Default for RenderPipelineDescriptor {
    fn default() -> Self {
        Self {
            vertex_function: None,
            fragment_function: None,
            vertex_descriptor: VertexDescriptor::default(),
            color_attachments: Vec::new(),
            depth_stencil_attachment_pixel_format: PixelFormat::Invalid,
            primitive_topology: PrimitiveType::Triangle,
            triangle_fill_mode: TriangleFillMode::Fill,
            rasterization_enabled: true,
        }
    }
}

#[derive(Clone, Default)]
pub struct ComputePipelineDescriptor {
    pub compute_function: Option<Arc<ShaderFunction>>,
    pub disable_optimization: bool,
}

pub struct RenderPipelineState {
    device: ash::Device,
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl Drop for RenderPipelineState {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

pub struct ComputePipelineState {
    device: ash::Device,
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl Drop for ComputePipelineState {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct StencilDescriptor {
    pub stencil_failure_operation: StencilOperation,
    pub depth_fail_operation: StencilOperation,
    pub depth_stencil_pass_operation: StencilOperation,
    pub stencil_compare_function: CompareFunction,
    pub read_mask: u32,
    pub write_mask: u32,
}

impl Default for StencilDescriptor {
    fn default() -> Self {
        Self {
            stencil_failure_operation: StencilOperation::Keep,
            depth_fail_operation: StencilOperation::Keep,
            depth_stencil_pass_operation: StencilOperation::Keep,
            stencil_compare_function: CompareFunction::Always,
            read_mask: 0xffffffff,
            write_mask: 0xffffffff,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct DepthStencilDescriptor {
    pub depth_write_enabled: bool,
    pub depth_compare_function: CompareFunction,
    pub front_face_stencil: StencilDescriptor,
    pub back_face_stencil: StencilDescriptor,
}

impl Default for DepthStencilDescriptor {
    fn default() -> Self {
        Self {
            depth_write_enabled: false,
            depth_compare_function: CompareFunction::Always,
            front_face_stencil: StencilDescriptor::default(),
            back_face_stencil: StencilDescriptor::default(),
        }
    }
}

/// Baked depth/stencil state, applied through dynamic state at encode
/// time. A descriptor whose stencil ops are all no-ops collapses to
/// stencil-test-off, and always-pass/no-write depth collapses to
/// depth-test-off.
#[derive(Copy, Clone)]
pub struct DepthStencilState {
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: vk::CompareOp,
    pub stencil_test_enable: bool,
    pub front: vk::StencilOpState,
    pub back: vk::StencilOpState,
}

impl DepthStencilState {
    pub fn from_descriptor(desc: &DepthStencilDescriptor) -> DepthStencilState {
        let stencil_op_state = |stencil: &StencilDescriptor| -> vk::StencilOpState {
            vk::StencilOpState {
                fail_op: stencil.stencil_failure_operation.to_vk(),
                pass_op: stencil.depth_stencil_pass_operation.to_vk(),
                depth_fail_op: stencil.depth_fail_operation.to_vk(),
                compare_op: stencil.stencil_compare_function.to_vk(),
                compare_mask: stencil.read_mask,
                write_mask: stencil.write_mask,
                reference: 0, // dynamic state
            }
        };

        let mut state = DepthStencilState {
            depth_test_enable: true,
            depth_write_enable: desc.depth_write_enabled,
            depth_compare_op: desc.depth_compare_function.to_vk(),
            stencil_test_enable: true,
            front: stencil_op_state(&desc.front_face_stencil),
            back: stencil_op_state(&desc.back_face_stencil),
        };

        let noop = |s: &vk::StencilOpState| {
            s.compare_op == vk::CompareOp::ALWAYS
                && s.fail_op == vk::StencilOp::KEEP
                && s.pass_op == vk::StencilOp::KEEP
                && s.depth_fail_op == vk::StencilOp::KEEP
        };
        if noop(&state.front) && noop(&state.back) {
            state.stencil_test_enable = false;
        }
        if !state.depth_write_enable && state.depth_compare_op == vk::CompareOp::ALWAYS {
            state.depth_test_enable = false;
        }
        state
    }
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self::from_descriptor(&DepthStencilDescriptor::default())
    }
}

/// Descriptor-set layouts plus push-constant ranges derived from the
/// stages' reflection. The returned set layouts belong to the caller.
pub(crate) fn make_pipeline_layout(
    device: &ash::Device,
    functions: &[&Arc<ShaderFunction>],
    layout_default_stage_flags: vk::ShaderStageFlags,
) -> Result<(vk::PipelineLayout, Vec<vk::DescriptorSetLayout>)> {
    let mut push_constant_ranges = Vec::new();
    let mut max_descriptor_sets = 0u32;

    for func in functions {
        let module = &func.module;
        for layout in module.push_constant_layouts.iter() {
            if layout.size > 0 {
                // VUID-VkGraphicsPipelineCreateInfo-layout-07987:
                // contract the range to the members actually declared
                let begin = layout
                    .members
                    .iter()
                    .fold(layout.offset, |r, m| r.min(m.offset));
                let end = layout
                    .members
                    .iter()
                    .fold(layout.offset + layout.size, |r, m| r.max(m.offset + m.size));
                push_constant_ranges.push(vk::PushConstantRange {
                    stage_flags: module.stage.to_vk(),
                    offset: begin,
                    size: end - begin,
                });
            }
        }
        if let Some(last) = module.descriptors.last() {
            max_descriptor_sets = max_descriptor_sets.max(last.set + 1);
        }
    }

    let mut descriptor_set_layouts: Vec<vk::DescriptorSetLayout> = Vec::new();
    let destroy_layouts = |layouts: &[vk::DescriptorSetLayout]| {
        for layout in layouts {
            unsafe { device.destroy_descriptor_set_layout(*layout, None) };
        }
    };

    for set_index in 0..max_descriptor_sets {
        let mut bindings: Vec<vk::DescriptorSetLayoutBinding> = Vec::new();
        for func in functions {
            let module = &func.module;
            for desc in module.descriptors.iter() {
                if desc.set > set_index {
                    break; // descriptors are sorted by set
                }
                if desc.set != set_index {
                    continue;
                }
                let mut new_binding = true;
                for b in bindings.iter_mut() {
                    if b.binding == desc.binding {
                        new_binding = false;
                        if b.descriptor_type == desc.descriptor_type.to_vk() {
                            b.descriptor_count = b.descriptor_count.max(desc.count);
                            b.stage_flags |= module.stage.to_vk();
                        } else {
                            log::error!(
                                "descriptor binding conflict (set={}, binding={})",
                                set_index,
                                desc.binding
                            );
                            destroy_layouts(&descriptor_set_layouts);
                            return Err(GraupelError::VALIDATION_FAILED);
                        }
                    }
                }
                if new_binding {
                    bindings.push(vk::DescriptorSetLayoutBinding {
                        binding: desc.binding,
                        descriptor_type: desc.descriptor_type.to_vk(),
                        descriptor_count: desc.count,
                        stage_flags: layout_default_stage_flags | module.stage.to_vk(),
                        p_immutable_samplers: std::ptr::null(),
                    });
                }
            }
        }

        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let layout = unsafe {
            match device.create_descriptor_set_layout(&info, None) {
                Ok(l) => l,
                Err(e) => {
                    log::error!("vkCreateDescriptorSetLayout failed: {:?}", e);
                    destroy_layouts(&descriptor_set_layouts);
                    return Err(GraupelError::from(e));
                }
            }
        };
        descriptor_set_layouts.push(layout);
    }

    let info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(&descriptor_set_layouts)
        .push_constant_ranges(&push_constant_ranges);
    let pipeline_layout = unsafe {
        match device.create_pipeline_layout(&info, None) {
            Ok(l) => l,
            Err(e) => {
                log::error!("vkCreatePipelineLayout failed: {:?}", e);
                destroy_layouts(&descriptor_set_layouts);
                return Err(GraupelError::from(e));
            }
        }
    };
    Ok((pipeline_layout, descriptor_set_layouts))
}

pub(crate) fn make_render_pipeline_state(
    gdevice: &GraphicsDevice,
    desc: &RenderPipelineDescriptor,
    mut reflection: Option<&mut PipelineReflection>,
) -> Result<Arc<RenderPipelineState>> {
    let device = gdevice.vk_device();

    for attachment in desc.color_attachments.iter() {
        if !attachment.pixel_format.is_color_format() {
            log::error!(
                "Invalid attachment pixel format: {:?}",
                attachment.pixel_format
            );
            return Err(GraupelError::VALIDATION_FAILED);
        }
    }

    let color_attachment_count = desc
        .color_attachments
        .iter()
        .fold(0u32, |r, a| r.max(a.index + 1));
    let max_color_attachments = gdevice.properties().limits.max_color_attachments;
    if color_attachment_count > max_color_attachments {
        log::error!(
            "The number of color attachments exceeds the device limit. {} > {}",
            color_attachment_count,
            max_color_attachments
        );
        return Err(GraupelError::VALIDATION_FAILED);
    }

    if let Some(vf) = desc.vertex_function.as_ref() {
        debug_assert!(vf.stage() == ShaderStage::Vertex);
    }
    if let Some(ff) = desc.fragment_function.as_ref() {
        debug_assert!(ff.stage() == ShaderStage::Fragment);
    }

    let functions: Vec<&Arc<ShaderFunction>> = desc
        .vertex_function
        .iter()
        .chain(desc.fragment_function.iter())
        .collect();

    let mut shader_stages = Vec::with_capacity(functions.len());
    for func in functions.iter() {
        shader_stages.push(
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(func.module.stage.to_vk())
                .module(func.module.module)
                .name(&func.function_name)
                .build(),
        );
    }

    let (pipeline_layout, set_layouts) =
        make_pipeline_layout(device, &functions, vk::ShaderStageFlags::ALL)?;
    // the set layouts only exist to build the pipeline layout
    let destroy_set_layouts = || {
        for layout in set_layouts.iter() {
            unsafe { device.destroy_descriptor_set_layout(*layout, None) };
        }
    };

    // vertex input state
    let vertex_bindings: Vec<vk::VertexInputBindingDescription> = desc
        .vertex_descriptor
        .layouts
        .iter()
        .map(|layout| vk::VertexInputBindingDescription {
            binding: layout.buffer_index,
            stride: layout.stride,
            input_rate: match layout.step {
                VertexStepRate::Vertex => vk::VertexInputRate::VERTEX,
                VertexStepRate::Instance => vk::VertexInputRate::INSTANCE,
            },
        })
        .collect();
    let vertex_attributes: Vec<vk::VertexInputAttributeDescription> = desc
        .vertex_descriptor
        .attributes
        .iter()
        .map(|attr| vk::VertexInputAttributeDescription {
            location: attr.location,
            binding: attr.buffer_index,
            format: attr.format.to_vk(),
            offset: attr.offset,
        })
        .collect();
    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&vertex_bindings)
        .vertex_attribute_descriptions(&vertex_attributes);

    let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(desc.primitive_topology.to_vk());

    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    // rasterization
    let mut polygon_mode = vk::PolygonMode::FILL;
    if desc.triangle_fill_mode == TriangleFillMode::Lines {
        if gdevice.features().fill_mode_non_solid != 0 {
            polygon_mode = vk::PolygonMode::LINE;
        } else {
            log::error!("PolygonFillMode not supported for this hardware.");
        }
    }
    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::builder()
        .polygon_mode(polygon_mode)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::CLOCKWISE)
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(!desc.rasterization_enabled)
        .depth_bias_enable(false)
        .line_width(1.0);

    let multisample_state = vk::PipelineMultisampleStateCreateInfo::builder()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    // depth/stencil defaults; the real state is dynamic
    let stencil_noop = vk::StencilOpState {
        fail_op: vk::StencilOp::KEEP,
        pass_op: vk::StencilOp::KEEP,
        depth_fail_op: vk::StencilOp::KEEP,
        compare_op: vk::CompareOp::ALWAYS,
        compare_mask: 0xffffffff,
        write_mask: 0xffffffff,
        reference: 0,
    };
    let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(false)
        .depth_write_enable(false)
        .depth_compare_op(vk::CompareOp::ALWAYS)
        .depth_bounds_test_enable(false)
        .min_depth_bounds(0.0)
        .max_depth_bounds(1.0)
        .front(stencil_noop)
        .back(stencil_noop)
        .stencil_test_enable(false);

    // everything an encoder may set per frame is dynamic
    let dynamic_states = [
        vk::DynamicState::VIEWPORT,
        vk::DynamicState::SCISSOR,
        vk::DynamicState::LINE_WIDTH,
        vk::DynamicState::DEPTH_BIAS,
        vk::DynamicState::BLEND_CONSTANTS,
        vk::DynamicState::DEPTH_BOUNDS,
        vk::DynamicState::STENCIL_COMPARE_MASK,
        vk::DynamicState::STENCIL_WRITE_MASK,
        vk::DynamicState::STENCIL_REFERENCE,
        // Provided by VK_VERSION_1_3
        vk::DynamicState::DEPTH_TEST_ENABLE,
        vk::DynamicState::DEPTH_WRITE_ENABLE,
        vk::DynamicState::DEPTH_COMPARE_OP,
        vk::DynamicState::DEPTH_BOUNDS_TEST_ENABLE,
        vk::DynamicState::STENCIL_TEST_ENABLE,
        vk::DynamicState::STENCIL_OP,
        vk::DynamicState::CULL_MODE,
        vk::DynamicState::FRONT_FACE,
    ];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    // dynamic rendering attachment formats
    let color_formats: Vec<vk::Format> = desc
        .color_attachments
        .iter()
        .map(|a| a.pixel_format.to_vk())
        .collect();
    let ds_format = desc.depth_stencil_attachment_pixel_format;
    let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(if ds_format.is_depth_format() {
            ds_format.to_vk()
        } else {
            vk::Format::UNDEFINED
        })
        .stencil_attachment_format(if ds_format.is_stencil_format() {
            ds_format.to_vk()
        } else {
            vk::Format::UNDEFINED
        });

    // color blending
    let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
        .color_attachments
        .iter()
        .map(|attachment| {
            let bs: &BlendState = &attachment.blend_state;
            vk::PipelineColorBlendAttachmentState {
                blend_enable: bs.enabled as u32,
                src_color_blend_factor: bs.source_rgb_blend_factor.to_vk(),
                dst_color_blend_factor: bs.destination_rgb_blend_factor.to_vk(),
                color_blend_op: bs.rgb_blend_operation.to_vk(),
                src_alpha_blend_factor: bs.source_alpha_blend_factor.to_vk(),
                dst_alpha_blend_factor: bs.destination_alpha_blend_factor.to_vk(),
                alpha_blend_op: bs.alpha_blend_operation.to_vk(),
                color_write_mask: bs.write_mask.to_vk(),
            }
        })
        .collect();
    let color_blend_state =
        vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

    let create_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly_state)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .depth_stencil_state(&depth_stencil_state)
        .color_blend_state(&color_blend_state)
        .dynamic_state(&dynamic_state)
        .layout(pipeline_layout)
        .push_next(&mut rendering_info)
        .build();

    let result = unsafe {
        device.create_graphics_pipelines(gdevice.pipeline_cache(), &[create_info], None)
    };
    let pipeline = match result {
        Ok(pipelines) => pipelines[0],
        Err((_, e)) => {
            log::error!("vkCreateGraphicsPipelines failed: {:?}", e);
            destroy_set_layouts();
            unsafe { device.destroy_pipeline_layout(pipeline_layout, None) };
            return Err(GraupelError::from(e));
        }
    };
    destroy_set_layouts();
    gdevice.save_pipeline_cache();

    if let Some(reflection) = reflection.as_mut() {
        let stages: Vec<StageReflection> =
            functions.iter().map(|f| StageReflection::of(f.as_ref())).collect();
        **reflection = PipelineReflection::merge(&stages)?;
    }

    Ok(Arc::new(RenderPipelineState {
        device: device.clone(),
        pipeline,
        layout: pipeline_layout,
    }))
}

pub(crate) fn make_compute_pipeline_state(
    gdevice: &GraphicsDevice,
    desc: &ComputePipelineDescriptor,
    mut reflection: Option<&mut PipelineReflection>,
) -> Result<Arc<ComputePipelineState>> {
    let device = gdevice.vk_device();

    let func = match desc.compute_function.as_ref() {
        Some(f) => f,
        None => return Err(GraupelError::VALIDATION_FAILED),
    };
    debug_assert!(func.module.stage == ShaderStage::Compute);

    let mut flags = vk::PipelineCreateFlags::empty();
    if desc.disable_optimization {
        flags |= vk::PipelineCreateFlags::DISABLE_OPTIMIZATION;
    }

    let (pipeline_layout, set_layouts) =
        make_pipeline_layout(device, &[func], vk::ShaderStageFlags::ALL)?;
    let destroy_set_layouts = || {
        for layout in set_layouts.iter() {
            unsafe { device.destroy_descriptor_set_layout(*layout, None) };
        }
    };

    let stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(func.module.module)
        .name(&func.function_name)
        .build();

    let create_info = vk::ComputePipelineCreateInfo::builder()
        .flags(flags)
        .stage(stage)
        .layout(pipeline_layout)
        .build();

    let result = unsafe {
        device.create_compute_pipelines(gdevice.pipeline_cache(), &[create_info], None)
    };
    let pipeline = match result {
        Ok(pipelines) => pipelines[0],
        Err((_, e)) => {
            log::error!("vkCreateComputePipelines failed: {:?}", e);
            destroy_set_layouts();
            unsafe { device.destroy_pipeline_layout(pipeline_layout, None) };
            return Err(GraupelError::from(e));
        }
    };
    destroy_set_layouts();
    gdevice.save_pipeline_cache();

    if let Some(reflection) = reflection.as_mut() {
        **reflection = PipelineReflection::merge(&[StageReflection::of(func)])?;
    }

    Ok(Arc::new(ComputePipelineState {
        device: device.clone(),
        pipeline,
        layout: pipeline_layout,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::shader::{ShaderPushConstantLayout, ShaderResourceStructMember, ShaderStageFlags};

    // the push-constant envelope logic used by make_pipeline_layout
    fn envelope(layout: &ShaderPushConstantLayout) -> (u32, u32) {
        let begin = layout
            .members
            .iter()
            .fold(layout.offset, |r, m| r.min(m.offset));
        let end = layout
            .members
            .iter()
            .fold(layout.offset + layout.size, |r, m| r.max(m.offset + m.size));
        (begin, end - begin)
    }

    fn member(offset: u32, size: u32) -> ShaderResourceStructMember {
        ShaderResourceStructMember {
            offset,
            size,
            ..Default::default()
        }
    }

    #[test]
    fn push_constant_range_contracts_to_member_envelope() {
        let layout = ShaderPushConstantLayout {
            name: "pc".into(),
            offset: 16,
            size: 32,
            stages: ShaderStageFlags::VERTEX,
            members: vec![member(8, 8), member(32, 16)],
        };
        let (offset, size) = envelope(&layout);
        assert_eq!(offset, 8);
        assert_eq!(size, 48 - 8);
    }

    #[test]
    fn no_op_stencil_collapses() {
        let state = DepthStencilState::from_descriptor(&DepthStencilDescriptor::default());
        assert!(!state.stencil_test_enable);
        assert!(!state.depth_test_enable);

        let mut desc = DepthStencilDescriptor::default();
        desc.depth_write_enabled = true;
        desc.depth_compare_function = CompareFunction::LessEqual;
        let state = DepthStencilState::from_descriptor(&desc);
        assert!(state.depth_test_enable);
        assert!(state.depth_write_enable);

        desc.front_face_stencil.depth_stencil_pass_operation = StencilOperation::Replace;
        let state = DepthStencilState::from_descriptor(&desc);
        assert!(state.stencil_test_enable);
    }
}
