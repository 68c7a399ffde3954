// Compute command encoder
//
// Before the recorded commands run, the encoder walks its descriptor
// sets, aggregates one target layout per referenced image (an image
// used in more than one way lands in GENERAL), emits a single
// transition barrier per image, and patches the recorded descriptor
// layouts to match.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ash::vk;

use utils::log;

use super::super::cmdbuffer::CommandBuffer;
use super::super::descriptor::{DescriptorSet, ImageLayoutMap, ImageViewLayoutMap, ShaderBindingSet};
use super::super::image::Image;
use super::super::pipeline::ComputePipelineState;
use super::super::semaphore::GpuEvent;
use super::super::shader::ShaderStageFlags;
use super::{CommandEncoder, EncoderBase};

pub(crate) struct ComputeEncodingState {
    pub pipeline_state: Option<Arc<ComputePipelineState>>,
}

type ComputeCommand =
    Box<dyn Fn(&ash::Device, vk::CommandBuffer, &mut ComputeEncodingState) + Send>;

pub(crate) struct ComputeEncoder {
    pub base: EncoderBase,
    queue_family_index: u32,
    commands: Vec<ComputeCommand>,
    descriptor_sets: Vec<Arc<Mutex<DescriptorSet>>>,
}

impl CommandEncoder for ComputeEncoder {
    fn encode(
        &mut self,
        device: &ash::Device,
        queue_family_index: u32,
        cmd: vk::CommandBuffer,
    ) -> bool {
        self.queue_family_index = queue_family_index;

        // aggregate desired image layouts across every bound set and
        // emit one barrier per image
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
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                self.queue_family_index,
                cmd,
            );
        }
        for set in self.descriptor_sets.iter() {
            let mut set = set.lock().unwrap();
            set.update_image_view_layouts(&view_layouts);
            set.flush();
        }

        let mut state = ComputeEncodingState {
            pipeline_state: None,
        };
        for command in self.commands.iter() {
            command(device, cmd, &mut state);
        }
        true
    }

    fn base(&self) -> &EncoderBase {
        &self.base
    }
}

pub struct ComputeCommandEncoder {
    cbuffer: Arc<CommandBuffer>,
    encoder: Option<Box<ComputeEncoder>>,
}

impl ComputeCommandEncoder {
    pub(crate) fn new(cbuffer: Arc<CommandBuffer>) -> ComputeCommandEncoder {
        ComputeCommandEncoder {
            cbuffer: cbuffer.clone(),
            encoder: Some(Box::new(ComputeEncoder {
                base: EncoderBase::default(),
                queue_family_index: cbuffer.queue_family_index(),
                commands: Vec::new(),
                descriptor_sets: Vec::new(),
            })),
        }
    }

    fn encoder(&mut self) -> &mut ComputeEncoder {
        self.encoder.as_mut().expect("encoding already ended")
    }

    pub fn is_completed(&self) -> bool {
        self.encoder.is_none()
    }

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

    pub fn set_compute_pipeline_state(&mut self, pipeline: Arc<ComputePipelineState>) {
        self.encoder().commands.push(Box::new(
            move |device, cmd, state: &mut ComputeEncodingState| {
                unsafe {
                    device.cmd_bind_pipeline(
                        cmd,
                        vk::PipelineBindPoint::COMPUTE,
                        pipeline.pipeline,
                    )
                };
                state.pipeline_state = Some(pipeline.clone());
            },
        ));
    }

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
            move |device, cmd, state: &mut ComputeEncodingState| {
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
                        vk::PipelineBindPoint::COMPUTE,
                        pipeline.layout,
                        index,
                        &sets,
                        &[],
                    );
                }
            },
        ));
    }

    pub fn push_constant(&mut self, stages: ShaderStageFlags, offset: u32, data: &[u8]) {
        let data = data.to_vec();
        self.encoder().commands.push(Box::new(
            move |device, cmd, state: &mut ComputeEncodingState| {
                let pipeline = match state.pipeline_state.as_ref() {
                    Some(p) => p,
                    None => {
                        log::error!("push_constant requires a bound pipeline state");
                        return;
                    }
                };
                unsafe {
                    device.cmd_push_constants(cmd, pipeline.layout, stages.to_vk(), offset, &data);
                }
            },
        ));
    }

    pub fn dispatch(&mut self, groups_x: u32, groups_y: u32, groups_z: u32) {
        self.encoder().commands.push(Box::new(
            move |device, cmd, _state: &mut ComputeEncodingState| unsafe {
                device.cmd_dispatch(cmd, groups_x, groups_y, groups_z);
            },
        ));
    }
}

impl Drop for ComputeCommandEncoder {
    fn drop(&mut self) {
        self.end_encoding();
    }
}
