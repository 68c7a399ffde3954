// Command encoders
//
// Encoders record deferred commands (closures over the command buffer
// and an encoding state) split into setup, main and cleanup lists. They
// also accumulate the wait/signal semaphores their submission needs;
// adding the same semaphore twice unions the stage masks and keeps the
// larger timeline value.

pub mod compute;
pub mod copy;
pub mod render;

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;

use super::image::ImageView;
use super::semaphore::GpuEvent;
use crate::geometry::Color;
use crate::device::types::{LoadAction, StoreAction};

pub use compute::ComputeCommandEncoder;
pub use copy::CopyCommandEncoder;
pub use render::RenderCommandEncoder;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SemaphoreStageValue {
    pub stages: vk::PipelineStageFlags2,
    pub value: u64,
}

/// Bookkeeping shared by all encoder kinds.
#[derive(Default)]
pub(crate) struct EncoderBase {
    pub wait_semaphores: HashMap<vk::Semaphore, SemaphoreStageValue>,
    pub signal_semaphores: HashMap<vk::Semaphore, SemaphoreStageValue>,
    // keep the semaphores alive until submission
    events: Vec<Arc<dyn GpuEvent>>,
}

impl EncoderBase {
    pub fn add_wait_semaphore(
        &mut self,
        semaphore: vk::Semaphore,
        value: u64,
        stages: vk::PipelineStageFlags2,
    ) {
        let entry = self
            .wait_semaphores
            .entry(semaphore)
            .or_insert_with(SemaphoreStageValue::default);
        entry.stages |= stages;
        entry.value = entry.value.max(value);
    }

    pub fn add_signal_semaphore(
        &mut self,
        semaphore: vk::Semaphore,
        value: u64,
        stages: vk::PipelineStageFlags2,
    ) {
        let entry = self
            .signal_semaphores
            .entry(semaphore)
            .or_insert_with(SemaphoreStageValue::default);
        entry.stages |= stages;
        entry.value = entry.value.max(value);
    }

    pub fn wait_event(&mut self, event: Arc<dyn GpuEvent>, stages: vk::PipelineStageFlags2) {
        self.add_wait_semaphore(event.vk_semaphore(), event.next_wait_value(), stages);
        self.events.push(event);
    }

    pub fn signal_event(&mut self, event: Arc<dyn GpuEvent>, stages: vk::PipelineStageFlags2) {
        self.add_signal_semaphore(event.vk_semaphore(), event.next_signal_value(), stages);
        self.events.push(event);
    }

    pub fn wait_semaphore_value(&mut self, event: Arc<dyn GpuEvent>, value: u64) {
        self.add_wait_semaphore(
            event.vk_semaphore(),
            value,
            vk::PipelineStageFlags2::TOP_OF_PIPE,
        );
        self.events.push(event);
    }

    pub fn signal_semaphore_value(&mut self, event: Arc<dyn GpuEvent>, value: u64) {
        self.add_signal_semaphore(
            event.vk_semaphore(),
            value,
            vk::PipelineStageFlags2::ALL_COMMANDS,
        );
        self.events.push(event);
    }
}

/// What the command buffer stores once an encoder finishes recording.
pub(crate) trait CommandEncoder: Send {
    /// Translate the recorded commands into `cmd`. Returns false when
    /// the encoding cannot be completed.
    fn encode(&mut self, device: &ash::Device, queue_family_index: u32, cmd: vk::CommandBuffer)
        -> bool;

    fn base(&self) -> &EncoderBase;
}

#[derive(Clone)]
pub struct RenderPassColorAttachmentDescriptor {
    pub render_target: Option<Arc<ImageView>>,
    pub clear_color: Color,
    pub load_action: LoadAction,
    pub store_action: StoreAction,
}

impl Default for RenderPassColorAttachmentDescriptor {
    fn default() -> Self {
        Self {
            render_target: None,
            clear_color: Color::transparent(),
            load_action: LoadAction::DontCare,
            store_action: StoreAction::DontCare,
        }
    }
}

#[derive(Clone)]
pub struct RenderPassDepthStencilAttachmentDescriptor {
    pub render_target: Option<Arc<ImageView>>,
    pub clear_depth: f32,
    pub clear_stencil: u32,
    pub load_action: LoadAction,
    pub store_action: StoreAction,
}

impl Default for RenderPassDepthStencilAttachmentDescriptor {
    fn default() -> Self {
        Self {
            render_target: None,
            clear_depth: 1.0,
            clear_stencil: 0,
            load_action: LoadAction::Clear,
            store_action: StoreAction::DontCare,
        }
    }
}

#[derive(Clone, Default)]
pub struct RenderPassDescriptor {
    pub color_attachments: Vec<RenderPassColorAttachmentDescriptor>,
    pub depth_stencil_attachment: RenderPassDepthStencilAttachmentDescriptor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_semaphores_union_stages_and_take_max_value() {
        let mut base = EncoderBase::default();
        let sem = vk::Semaphore::null();
        base.add_wait_semaphore(sem, 3, vk::PipelineStageFlags2::VERTEX_SHADER);
        base.add_wait_semaphore(sem, 1, vk::PipelineStageFlags2::FRAGMENT_SHADER);

        let entry = base.wait_semaphores.get(&sem).unwrap();
        assert_eq!(entry.value, 3);
        assert!(entry
            .stages
            .contains(vk::PipelineStageFlags2::VERTEX_SHADER | vk::PipelineStageFlags2::FRAGMENT_SHADER));
        assert_eq!(base.wait_semaphores.len(), 1);
    }
}
