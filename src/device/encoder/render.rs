// Render command encoder
//
// Recording captures deferred closures; encode() wraps them in the
// attachment layout prelude, vkCmdBeginRendering/vkCmdEndRendering and
// the dynamic-state defaults for anything the caller never set.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use ash::vk;

use utils::log;

use super::super::buffer::Buffer;
use super::super::cmdbuffer::CommandBuffer;
use super::super::descriptor::{DescriptorSet, ImageLayoutMap, ImageViewLayoutMap, ShaderBindingSet};
use super::super::image::Image;
use super::super::pipeline::{DepthStencilState, RenderPipelineState};
use super::super::semaphore::GpuEvent;
use super::super::types::{CullMode, DepthClipMode, IndexType, ScissorRect, Viewport, Winding};
use super::super::shader::ShaderStageFlags;
use super::{CommandEncoder, EncoderBase, RenderPassDescriptor};

pub(crate) struct RenderEncodingState {
    pub pipeline_state: Option<Arc<RenderPipelineState>>,
}

type RenderCommand = Box<dyn Fn(&ash::Device, vk::CommandBuffer, &mut RenderEncodingState) + Send>;

pub(crate) struct RenderEncoder {
    pub base: EncoderBase,
    queue_family_index: u32,
    render_pass: RenderPassDescriptor,
    setup_commands: Vec<RenderCommand>,
    commands: Vec<RenderCommand>,
    cleanup_commands: Vec<RenderCommand>,
    // descriptor sets bound by this pass, flushed at encode time
    descriptor_sets: Vec<Arc<Mutex<DescriptorSet>>>,
    set_dynamic_states: HashSet<vk::DynamicState>,
    draw_count: u32,
}

impl RenderEncoder {
    fn transition_attachments(&self, cmd: vk::CommandBuffer) {
        for attachment in self.render_pass.color_attachments.iter() {
            if let Some(view) = attachment.render_target.as_ref() {
                if let Some(image) = view.image() {
                    image.set_layout(
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                        Image::common_layout_access_mask(
                            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                        ),
                        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                        self.queue_family_index,
                        cmd,
                    );
                }
            }
        }
        if let Some(view) = self.render_pass.depth_stencil_attachment.render_target.as_ref() {
            if let Some(image) = view.image() {
                image.set_layout(
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    Image::common_layout_access_mask(
                        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    ),
                    vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                        | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                    vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                        | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                    self.queue_family_index,
                    cmd,
                );
            }
        }
    }

    // transition sampled/storage images referenced by the bound sets,
    // then patch the recorded descriptor layouts to match
    fn transition_descriptor_images(&mut self, cmd: vk::CommandBuffer) {
        let mut image_layouts: ImageLayoutMap = HashMap::new();
        let mut view_layouts: ImageViewLayoutMap = HashMap::new();
        for set in self.descriptor_sets.iter() {
            set.lock()
                .unwrap()
                .collect_image_view_layouts(&mut image_layouts, &mut view_layouts);
        }
        for (_, (image, layout)) in image_layouts.iter() {
            image.set_layout(
                *layout,
                Image::common_layout_access_mask(*layout),
                vk::PipelineStageFlags2::VERTEX_SHADER | vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
                self.queue_family_index,
                cmd,
            );
        }
        for set in self.descriptor_sets.iter() {
            let mut set = set.lock().unwrap();
            set.update_image_view_layouts(&view_layouts);
            set.flush();
        }
    }

    fn render_area(&self) -> vk::Rect2D {
        let mut width = u32::MAX;
        let mut height = u32::MAX;
        let mut any = false;
        let mut visit = |view: &Arc<super::super::image::ImageView>| {
            if let Some(image) = view.image() {
                width = width.min(image.width());
                height = height.min(image.height());
                any = true;
            }
        };
        for a in self.render_pass.color_attachments.iter() {
            if let Some(view) = a.render_target.as_ref() {
                visit(view);
            }
        }
        if let Some(view) = self.render_pass.depth_stencil_attachment.render_target.as_ref() {
            visit(view);
        }
        if !any {
            width = 0;
            height = 0;
        }
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D { width, height },
        }
    }

    fn set_default_dynamic_states(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        render_area: vk::Rect2D,
    ) {
        let unset = |state: vk::DynamicState| !self.set_dynamic_states.contains(&state);
        unsafe {
            if unset(vk::DynamicState::VIEWPORT) {
                let viewport = vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: render_area.extent.width.max(1) as f32,
                    height: render_area.extent.height.max(1) as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                };
                device.cmd_set_viewport(cmd, 0, &[viewport]);
            }
            if unset(vk::DynamicState::SCISSOR) {
                device.cmd_set_scissor(cmd, 0, &[render_area]);
            }
            if unset(vk::DynamicState::LINE_WIDTH) {
                device.cmd_set_line_width(cmd, 1.0);
            }
            if unset(vk::DynamicState::DEPTH_BIAS) {
                device.cmd_set_depth_bias(cmd, 0.0, 0.0, 0.0);
            }
            if unset(vk::DynamicState::BLEND_CONSTANTS) {
                device.cmd_set_blend_constants(cmd, &[0.0, 0.0, 0.0, 0.0]);
            }
            if unset(vk::DynamicState::DEPTH_BOUNDS) {
                device.cmd_set_depth_bounds(cmd, 0.0, 1.0);
            }
            if unset(vk::DynamicState::STENCIL_COMPARE_MASK) {
                device.cmd_set_stencil_compare_mask(cmd, vk::StencilFaceFlags::FRONT_AND_BACK, !0);
            }
            if unset(vk::DynamicState::STENCIL_WRITE_MASK) {
                device.cmd_set_stencil_write_mask(cmd, vk::StencilFaceFlags::FRONT_AND_BACK, !0);
            }
            if unset(vk::DynamicState::STENCIL_REFERENCE) {
                device.cmd_set_stencil_reference(cmd, vk::StencilFaceFlags::FRONT_AND_BACK, 0);
            }
            if unset(vk::DynamicState::DEPTH_TEST_ENABLE) {
                device.cmd_set_depth_test_enable(cmd, false);
            }
            if unset(vk::DynamicState::DEPTH_WRITE_ENABLE) {
                device.cmd_set_depth_write_enable(cmd, false);
            }
            if unset(vk::DynamicState::DEPTH_COMPARE_OP) {
                device.cmd_set_depth_compare_op(cmd, vk::CompareOp::ALWAYS);
            }
            if unset(vk::DynamicState::DEPTH_BOUNDS_TEST_ENABLE) {
                device.cmd_set_depth_bounds_test_enable(cmd, false);
            }
            if unset(vk::DynamicState::STENCIL_TEST_ENABLE) {
                device.cmd_set_stencil_test_enable(cmd, false);
            }
            if unset(vk::DynamicState::STENCIL_OP) {
                device.cmd_set_stencil_op(
                    cmd,
                    vk::StencilFaceFlags::FRONT_AND_BACK,
                    vk::StencilOp::KEEP,
                    vk::StencilOp::KEEP,
                    vk::StencilOp::KEEP,
                    vk::CompareOp::ALWAYS,
                );
            }
            if unset(vk::DynamicState::CULL_MODE) {
                device.cmd_set_cull_mode(cmd, vk::CullModeFlags::NONE);
            }
            if unset(vk::DynamicState::FRONT_FACE) {
                device.cmd_set_front_face(cmd, vk::FrontFace::CLOCKWISE);
            }
        }
    }
}

impl CommandEncoder for RenderEncoder {
    fn encode(
        &mut self,
        device: &ash::Device,
        queue_family_index: u32,
        cmd: vk::CommandBuffer,
    ) -> bool {
        self.queue_family_index = queue_family_index;

        let mut state = RenderEncodingState {
            pipeline_state: None,
        };

        self.transition_attachments(cmd);
        self.transition_descriptor_images(cmd);
        for command in self.setup_commands.iter() {
            command(device, cmd, &mut state);
        }

        let render_area = self.render_area();

        let mut color_infos = Vec::with_capacity(self.render_pass.color_attachments.len());
        for attachment in self.render_pass.color_attachments.iter() {
            let view = match attachment.render_target.as_ref() {
                Some(v) => v,
                None => continue,
            };
            let c = attachment.clear_color;
            color_infos.push(
                vk::RenderingAttachmentInfo::builder()
                    .image_view(view.image_view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(attachment.load_action.to_vk())
                    .store_op(attachment.store_action.to_vk())
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: [c.r, c.g, c.b, c.a],
                        },
                    })
                    .build(),
            );
        }

        let ds = &self.render_pass.depth_stencil_attachment;
        let ds_info = ds.render_target.as_ref().map(|view| {
            vk::RenderingAttachmentInfo::builder()
                .image_view(view.image_view)
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(ds.load_action.to_vk())
                .store_op(ds.store_action.to_vk())
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: ds.clear_depth,
                        stencil: ds.clear_stencil,
                    },
                })
                .build()
        });

        let mut rendering_info = vk::RenderingInfo::builder()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color_infos);
        if let (Some(info), Some(view)) = (ds_info.as_ref(), ds.render_target.as_ref()) {
            // attach per aspect, so depth-only and stencil-only formats
            // stay valid
            let format = view
                .image()
                .map(|i| i.pixel_format())
                .unwrap_or(super::super::types::PixelFormat::Invalid);
            if format.is_depth_format() {
                rendering_info = rendering_info.depth_attachment(info);
            }
            if format.is_stencil_format() {
                rendering_info = rendering_info.stencil_attachment(info);
            }
        }

        unsafe { device.cmd_begin_rendering(cmd, &rendering_info) };
        self.set_default_dynamic_states(device, cmd, render_area);
        for command in self.commands.iter() {
            command(device, cmd, &mut state);
        }
        unsafe { device.cmd_end_rendering(cmd) };

        for command in self.cleanup_commands.iter() {
            command(device, cmd, &mut state);
        }
        true
    }

    fn base(&self) -> &EncoderBase {
        &self.base
    }
}

/// Records draw state and draw calls against a render pass.
pub struct RenderCommandEncoder {
    cbuffer: Arc<CommandBuffer>,
    encoder: Option<Box<RenderEncoder>>,
}

impl RenderCommandEncoder {
    pub(crate) fn new(
        cbuffer: Arc<CommandBuffer>,
        render_pass: RenderPassDescriptor,
    ) -> RenderCommandEncoder {
        let mut base = EncoderBase::default();
        // swapchain render targets carry their frame's acquire
        // semaphore; the submission must wait for it and re-signal it
        for attachment in render_pass.color_attachments.iter() {
            if let Some(view) = attachment.render_target.as_ref() {
                let wait = *view.wait_semaphore.lock().unwrap();
                if wait != vk::Semaphore::null() {
                    base.add_wait_semaphore(
                        wait,
                        0,
                        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                    );
                }
                let signal = *view.signal_semaphore.lock().unwrap();
                if signal != vk::Semaphore::null() {
                    base.add_signal_semaphore(signal, 0, vk::PipelineStageFlags2::ALL_COMMANDS);
                }
            }
        }

        RenderCommandEncoder {
            cbuffer: cbuffer.clone(),
            encoder: Some(Box::new(RenderEncoder {
                base,
                queue_family_index: cbuffer.queue_family_index(),
                render_pass,
                setup_commands: Vec::new(),
                commands: Vec::new(),
                cleanup_commands: Vec::new(),
                descriptor_sets: Vec::new(),
                set_dynamic_states: HashSet::new(),
                draw_count: 0,
            })),
        }
    }

    fn encoder(&mut self) -> &mut RenderEncoder {
        self.encoder
            .as_mut()
            .expect("encoding already ended")
    }

    pub fn is_completed(&self) -> bool {
        self.encoder.is_none()
    }

    /// Hand the recorded commands to the command buffer.
    pub fn end_encoding(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.cbuffer.end_encoder(encoder);
        }
    }

    pub fn wait_event(&mut self, event: Arc<dyn GpuEvent>) {
        self.encoder()
            .base
            .wait_event(event, vk::PipelineStageFlags2::TOP_OF_PIPE);
    }

    pub fn signal_event(&mut self, event: Arc<dyn GpuEvent>) {
        self.encoder()
            .base
            .signal_event(event, vk::PipelineStageFlags2::ALL_COMMANDS);
    }

    pub fn wait_semaphore_value(&mut self, event: Arc<dyn GpuEvent>, value: u64) {
        self.encoder().base.wait_semaphore_value(event, value);
    }

    pub fn signal_semaphore_value(&mut self, event: Arc<dyn GpuEvent>, value: u64) {
        self.encoder().base.signal_semaphore_value(event, value);
    }

    /// Bind a set of shader resources at a descriptor-set index.
    pub fn set_resource(&mut self, index: u32, binding_set: &ShaderBindingSet) {
        let set = match binding_set.make_descriptor_set() {
            Ok(set) => Arc::new(Mutex::new(set)),
            Err(e) => {
                log::error!("set_resource failed: {:?}", e);
                return;
            }
        };
        self.encoder().descriptor_sets.push(set.clone());
        self.encoder().commands.push(Box::new(
            move |device: &ash::Device, cmd: vk::CommandBuffer, state: &mut RenderEncodingState| {
                let pipeline = match state.pipeline_state.as_ref() {
                    Some(p) => p,
                    None => {
                        log::error!("set_resource requires a bound pipeline state");
                        return;
                    }
                };
                let mut set = set.lock().unwrap();
                set.flush();
                let sets = [set.descriptor_set];
                unsafe {
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        pipeline.layout,
                        index,
                        &sets,
                        &[],
                    );
                }
            },
        ));
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.encoder().set_dynamic_states.insert(vk::DynamicState::VIEWPORT);
        self.encoder().commands.push(Box::new(
            move |device, cmd, _state: &mut RenderEncodingState| {
                let vp = vk::Viewport {
                    x: viewport.x,
                    y: viewport.y,
                    width: viewport.width,
                    height: viewport.height,
                    min_depth: viewport.near_z,
                    max_depth: viewport.far_z,
                };
                unsafe { device.cmd_set_viewport(cmd, 0, &[vp]) };
            },
        ));
    }

    pub fn set_scissor_rect(&mut self, rect: ScissorRect) {
        self.encoder().set_dynamic_states.insert(vk::DynamicState::SCISSOR);
        self.encoder().commands.push(Box::new(
            move |device, cmd, _state: &mut RenderEncodingState| {
                let scissor = vk::Rect2D {
                    offset: vk::Offset2D {
                        x: rect.x,
                        y: rect.y,
                    },
                    extent: vk::Extent2D {
                        width: rect.width,
                        height: rect.height,
                    },
                };
                unsafe { device.cmd_set_scissor(cmd, 0, &[scissor]) };
            },
        ));
    }

    pub fn set_render_pipeline_state(&mut self, pipeline: Arc<RenderPipelineState>) {
        self.encoder().commands.push(Box::new(
            move |device, cmd, state: &mut RenderEncodingState| {
                unsafe {
                    device.cmd_bind_pipeline(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        pipeline.pipeline,
                    )
                };
                state.pipeline_state = Some(pipeline.clone());
            },
        ));
    }

    pub fn set_vertex_buffer(&mut self, buffer: Arc<Buffer>, offset: u64, index: u32) {
        self.set_vertex_buffers(&[(buffer, offset)], index);
    }

    pub fn set_vertex_buffers(&mut self, buffers: &[(Arc<Buffer>, u64)], index: u32) {
        let handles: Vec<vk::Buffer> = buffers.iter().map(|(b, _)| b.buffer).collect();
        let offsets: Vec<u64> = buffers.iter().map(|(_, o)| *o).collect();
        let owned: Vec<Arc<Buffer>> = buffers.iter().map(|(b, _)| b.clone()).collect();
        self.encoder().commands.push(Box::new(
            move |device, cmd, _state: &mut RenderEncodingState| {
                let _ = &owned;
                unsafe { device.cmd_bind_vertex_buffers(cmd, index, &handles, &offsets) };
            },
        ));
    }

    /// Depth/stencil state applies through dynamic state, so one PSO
    /// serves every depth configuration.
    pub fn set_depth_stencil_state(&mut self, state: DepthStencilState) {
        let encoder = self.encoder();
        for dynamic in [
            vk::DynamicState::DEPTH_TEST_ENABLE,
            vk::DynamicState::DEPTH_WRITE_ENABLE,
            vk::DynamicState::DEPTH_COMPARE_OP,
            vk::DynamicState::STENCIL_TEST_ENABLE,
            vk::DynamicState::STENCIL_OP,
        ] {
            encoder.set_dynamic_states.insert(dynamic);
        }
        encoder.commands.push(Box::new(
            move |device, cmd, _s: &mut RenderEncodingState| unsafe {
                device.cmd_set_depth_test_enable(cmd, state.depth_test_enable);
                device.cmd_set_depth_write_enable(cmd, state.depth_write_enable);
                device.cmd_set_depth_compare_op(cmd, state.depth_compare_op);
                device.cmd_set_stencil_test_enable(cmd, state.stencil_test_enable);
                device.cmd_set_stencil_op(
                    cmd,
                    vk::StencilFaceFlags::FRONT,
                    state.front.fail_op,
                    state.front.pass_op,
                    state.front.depth_fail_op,
                    state.front.compare_op,
                );
                device.cmd_set_stencil_op(
                    cmd,
                    vk::StencilFaceFlags::BACK,
                    state.back.fail_op,
                    state.back.pass_op,
                    state.back.depth_fail_op,
                    state.back.compare_op,
                );
            },
        ));
    }

    pub fn set_depth_clip_mode(&mut self, mode: DepthClipMode) {
        // depth clamp is baked into the pipeline; log the request so a
        // mismatch is visible
        if mode == DepthClipMode::Clamp {
            log::debug!("set_depth_clip_mode(Clamp) requires a pipeline built with depth clamp");
        }
    }

    pub fn set_cull_mode(&mut self, mode: CullMode) {
        self.encoder().set_dynamic_states.insert(vk::DynamicState::CULL_MODE);
        self.encoder().commands.push(Box::new(
            move |device, cmd, _s: &mut RenderEncodingState| unsafe {
                device.cmd_set_cull_mode(cmd, mode.to_vk());
            },
        ));
    }

    pub fn set_front_facing(&mut self, winding: Winding) {
        self.encoder().set_dynamic_states.insert(vk::DynamicState::FRONT_FACE);
        self.encoder().commands.push(Box::new(
            move |device, cmd, _s: &mut RenderEncodingState| unsafe {
                device.cmd_set_front_face(cmd, winding.to_vk());
            },
        ));
    }

    pub fn set_blend_color(&mut self, r: f32, g: f32, b: f32, a: f32) {
        self.encoder().set_dynamic_states.insert(vk::DynamicState::BLEND_CONSTANTS);
        self.encoder().commands.push(Box::new(
            move |device, cmd, _s: &mut RenderEncodingState| unsafe {
                device.cmd_set_blend_constants(cmd, &[r, g, b, a]);
            },
        ));
    }

    pub fn set_stencil_reference_value(&mut self, value: u32) {
        self.encoder().set_dynamic_states.insert(vk::DynamicState::STENCIL_REFERENCE);
        self.encoder().commands.push(Box::new(
            move |device, cmd, _s: &mut RenderEncodingState| unsafe {
                device.cmd_set_stencil_reference(cmd, vk::StencilFaceFlags::FRONT_AND_BACK, value);
            },
        ));
    }

    pub fn set_stencil_reference_values(&mut self, front: u32, back: u32) {
        self.encoder().set_dynamic_states.insert(vk::DynamicState::STENCIL_REFERENCE);
        self.encoder().commands.push(Box::new(
            move |device, cmd, _s: &mut RenderEncodingState| unsafe {
                device.cmd_set_stencil_reference(cmd, vk::StencilFaceFlags::FRONT, front);
                device.cmd_set_stencil_reference(cmd, vk::StencilFaceFlags::BACK, back);
            },
        ));
    }

    pub fn set_depth_bias(&mut self, depth_bias: f32, slope_scale: f32, clamp: f32) {
        self.encoder().set_dynamic_states.insert(vk::DynamicState::DEPTH_BIAS);
        self.encoder().commands.push(Box::new(
            move |device, cmd, _s: &mut RenderEncodingState| unsafe {
                device.cmd_set_depth_bias(cmd, depth_bias, clamp, slope_scale);
            },
        ));
    }

    pub fn push_constant(&mut self, stages: ShaderStageFlags, offset: u32, data: &[u8]) {
        let data = data.to_vec();
        self.encoder().commands.push(Box::new(
            move |device, cmd, state: &mut RenderEncodingState| {
                let pipeline = match state.pipeline_state.as_ref() {
                    Some(p) => p,
                    None => {
                        log::error!("push_constant requires a bound pipeline state");
                        return;
                    }
                };
                unsafe {
                    device.cmd_push_constants(
                        cmd,
                        pipeline.layout,
                        stages.to_vk(),
                        offset,
                        &data,
                    );
                }
            },
        ));
    }

    pub fn draw(
        &mut self,
        vertex_start: u32,
        vertex_count: u32,
        instance_count: u32,
        base_instance: u32,
    ) {
        self.encoder().draw_count += 1;
        self.encoder().commands.push(Box::new(
            move |device, cmd, _s: &mut RenderEncodingState| unsafe {
                device.cmd_draw(cmd, vertex_count, instance_count, vertex_start, base_instance);
            },
        ));
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        index_type: IndexType,
        index_buffer: Arc<Buffer>,
        index_buffer_offset: u64,
        instance_count: u32,
        base_vertex: i32,
        base_instance: u32,
    ) {
        self.encoder().draw_count += 1;
        self.encoder().commands.push(Box::new(
            move |device, cmd, _s: &mut RenderEncodingState| unsafe {
                device.cmd_bind_index_buffer(
                    cmd,
                    index_buffer.buffer,
                    index_buffer_offset,
                    index_type.to_vk(),
                );
                device.cmd_draw_indexed(
                    cmd,
                    index_count,
                    instance_count,
                    0,
                    base_vertex,
                    base_instance,
                );
            },
        ));
    }
}

impl Drop for RenderCommandEncoder {
    fn drop(&mut self) {
        self.end_encoding();
    }
}
