// Command queues and command buffers
//
// A command buffer accumulates finished encoders. commit() allocates
// one primary VkCommandBuffer per encoder, gathers each encoder's
// wait/signal semaphores, records it, and submits the whole batch to
// the queue against a single fence from the device's fence cache; the
// fence-completion thread runs the attached handlers when it retires.

use std::sync::{Arc, Mutex};

use ash::vk;

use utils::log;

use super::encoder::compute::ComputeCommandEncoder;
use super::encoder::copy::CopyCommandEncoder;
use super::encoder::render::RenderCommandEncoder;
use super::encoder::{CommandEncoder, RenderPassDescriptor};
use super::swapchain::Swapchain;
use super::GraphicsDevice;
use crate::{GraupelError, Result};

bitflags::bitflags! {
    pub struct QueueFlags: u32 {
        const COPY = 0;
        const RENDER = 1;
        const COMPUTE = 1 << 1;
    }
}

pub struct CommandQueue {
    pub(crate) gdevice: Arc<GraphicsDevice>,
    pub(crate) queue: vk::Queue,
    pub family_index: u32,
    pub(crate) family_properties: vk::QueueFamilyProperties,
    submit_lock: Mutex<()>,
}

impl CommandQueue {
    pub(crate) fn new(
        gdevice: Arc<GraphicsDevice>,
        queue: vk::Queue,
        family_index: u32,
        family_properties: vk::QueueFamilyProperties,
    ) -> Arc<CommandQueue> {
        Arc::new(CommandQueue {
            gdevice,
            queue,
            family_index,
            family_properties,
            submit_lock: Mutex::new(()),
        })
    }

    pub fn device(&self) -> &Arc<GraphicsDevice> {
        &self.gdevice
    }

    /// Capabilities of this queue's family. Every queue can copy.
    pub fn flags(&self) -> QueueFlags {
        let mut flags = QueueFlags::COPY;
        if self
            .family_properties
            .queue_flags
            .contains(vk::QueueFlags::GRAPHICS)
        {
            flags |= QueueFlags::RENDER;
        }
        if self
            .family_properties
            .queue_flags
            .contains(vk::QueueFlags::COMPUTE)
        {
            flags |= QueueFlags::COMPUTE;
        }
        flags
    }

    pub fn make_command_buffer(self: &Arc<Self>) -> Result<Arc<CommandBuffer>> {
        let info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(self.family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe {
            self.gdevice
                .vk_device()
                .create_command_pool(&info, None)
                .map_err(|e| {
                    log::error!("vkCreateCommandPool failed: {:?}", e);
                    GraupelError::from(e)
                })?
        };
        Ok(Arc::new(CommandBuffer {
            queue: self.clone(),
            pool,
            inner: Mutex::new(CommandBufferInner {
                encoders: Vec::new(),
                allocated: Vec::new(),
            }),
            completed_handlers: Mutex::new(Vec::new()),
        }))
    }

    /// Create a swapchain presenting to `surface` through this queue.
    pub fn make_swapchain(
        self: &Arc<Self>,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        enable_vsync: bool,
    ) -> Result<Swapchain> {
        if !self
            .family_properties
            .queue_flags
            .contains(vk::QueueFlags::GRAPHICS)
        {
            log::error!("Presentation requires a graphics queue family");
            return Err(GraupelError::VALIDATION_FAILED);
        }
        Swapchain::new(self.clone(), surface, width, height, enable_vsync)
    }

    /// Submit pre-built submission batches. When a callback rides
    /// along, a fence from the device cache tracks completion.
    pub(crate) fn submit(
        &self,
        submits: &[vk::SubmitInfo2],
        callback: Option<Box<dyn Fn() + Send + Sync>>,
    ) -> Result<()> {
        let fence = if callback.is_some() {
            self.gdevice.fence()
        } else {
            vk::Fence::null()
        };

        let result = {
            let _guard = self.submit_lock.lock().unwrap();
            unsafe { self.gdevice.vk_device().queue_submit2(self.queue, submits, fence) }
        };
        if let Err(e) = result {
            log::error!("vkQueueSubmit2 failed: {:?}", e);
            return Err(GraupelError::from(e));
        }
        if let Some(callback) = callback {
            self.gdevice.add_fence_completion_handler(fence, callback);
        }
        Ok(())
    }

    pub fn wait_idle(&self) -> bool {
        let _guard = self.submit_lock.lock().unwrap();
        unsafe { self.gdevice.vk_device().queue_wait_idle(self.queue).is_ok() }
    }
}

struct CommandBufferInner {
    encoders: Vec<Box<dyn CommandEncoder>>,
    allocated: Vec<vk::CommandBuffer>,
}

pub struct CommandBuffer {
    queue: Arc<CommandQueue>,
    pool: vk::CommandPool,
    inner: Mutex<CommandBufferInner>,
    completed_handlers: Mutex<Vec<Arc<dyn Fn() + Send + Sync>>>,
}

impl CommandBuffer {
    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    pub(crate) fn queue_family_index(&self) -> u32 {
        self.queue.family_index
    }

    pub fn make_render_command_encoder(
        self: &Arc<Self>,
        render_pass: RenderPassDescriptor,
    ) -> Option<RenderCommandEncoder> {
        if !self.queue.flags().contains(QueueFlags::RENDER) {
            return None;
        }
        Some(RenderCommandEncoder::new(self.clone(), render_pass))
    }

    pub fn make_compute_command_encoder(self: &Arc<Self>) -> Option<ComputeCommandEncoder> {
        if !self.queue.flags().contains(QueueFlags::COMPUTE) {
            return None;
        }
        Some(ComputeCommandEncoder::new(self.clone()))
    }

    pub fn make_copy_command_encoder(self: &Arc<Self>) -> CopyCommandEncoder {
        CopyCommandEncoder::new(self.clone())
    }

    /// Runs on the fence-completion thread once per submission.
    pub fn add_completed_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.completed_handlers.lock().unwrap().push(Arc::new(handler));
    }

    pub(crate) fn end_encoder(&self, encoder: Box<dyn CommandEncoder>) {
        self.inner.lock().unwrap().encoders.push(encoder);
    }

    /// Record every pending encoder into primary command buffers and
    /// submit them as one batch.
    pub fn commit(self: &Arc<Self>) -> Result<()> {
        let device = self.queue.gdevice.vk_device().clone();
        let mut inner = self.inner.lock().unwrap();

        // free the primaries of any previous commit
        if !inner.allocated.is_empty() {
            unsafe { device.free_command_buffers(self.pool, &inner.allocated) };
            inner.allocated.clear();
        }

        if inner.encoders.is_empty() {
            return Ok(());
        }

        struct EncodedSubmission {
            cbuf_info: vk::CommandBufferSubmitInfo,
            waits: Vec<vk::SemaphoreSubmitInfo>,
            signals: Vec<vk::SemaphoreSubmitInfo>,
        }

        let mut submissions: Vec<EncodedSubmission> = Vec::with_capacity(inner.encoders.len());
        let family_index = self.queue.family_index;

        let inner = &mut *inner;
        for encoder in inner.encoders.iter_mut() {
            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(self.pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = unsafe {
                match device.allocate_command_buffers(&alloc_info) {
                    Ok(bufs) => bufs[0],
                    Err(e) => {
                        log::error!("vkAllocateCommandBuffers failed: {:?}", e);
                        return Err(GraupelError::from(e));
                    }
                }
            };
            inner.allocated.push(cmd);

            let semaphore_infos = |map: &std::collections::HashMap<
                vk::Semaphore,
                super::encoder::SemaphoreStageValue,
            >| {
                map.iter()
                    .map(|(semaphore, sv)| {
                        debug_assert!(!sv.stages.contains(vk::PipelineStageFlags2::HOST));
                        vk::SemaphoreSubmitInfo::builder()
                            .semaphore(*semaphore)
                            .value(sv.value)
                            .stage_mask(sv.stages)
                            .device_index(0)
                            .build()
                    })
                    .collect::<Vec<_>>()
            };
            let waits = semaphore_infos(&encoder.base().wait_semaphores);
            let signals = semaphore_infos(&encoder.base().signal_semaphores);

            let begin_info = vk::CommandBufferBeginInfo::builder();
            unsafe {
                if let Err(e) = device.begin_command_buffer(cmd, &begin_info) {
                    log::error!("vkBeginCommandBuffer failed: {:?}", e);
                    return Err(GraupelError::from(e));
                }
            }
            let encoded = encoder.encode(&device, family_index, cmd);
            unsafe {
                if let Err(e) = device.end_command_buffer(cmd) {
                    log::error!("vkEndCommandBuffer failed: {:?}", e);
                    return Err(GraupelError::from(e));
                }
            }
            if !encoded {
                return Err(GraupelError::VALIDATION_FAILED);
            }

            submissions.push(EncodedSubmission {
                cbuf_info: vk::CommandBufferSubmitInfo::builder()
                    .command_buffer(cmd)
                    .device_mask(0)
                    .build(),
                waits,
                signals,
            });
        }

        // the submit infos borrow into `submissions`, which is stable
        // from here on
        let submit_infos: Vec<vk::SubmitInfo2> = submissions
            .iter()
            .map(|s| {
                vk::SubmitInfo2::builder()
                    .command_buffer_infos(std::slice::from_ref(&s.cbuf_info))
                    .wait_semaphore_infos(&s.waits)
                    .signal_semaphore_infos(&s.signals)
                    .build()
            })
            .collect();

        let handlers: Vec<Arc<dyn Fn() + Send + Sync>> =
            self.completed_handlers.lock().unwrap().clone();
        let callback: Option<Box<dyn Fn() + Send + Sync>> = if handlers.is_empty() {
            None
        } else {
            Some(Box::new(move || {
                for handler in handlers.iter() {
                    handler();
                }
            }))
        };

        self.queue.submit(&submit_infos, callback)
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        let device = self.queue.gdevice.vk_device();
        let inner = self.inner.get_mut().unwrap();
        unsafe {
            if !inner.allocated.is_empty() {
                device.free_command_buffers(self.pool, &inner.allocated);
            }
            device.destroy_command_pool(self.pool, None);
        }
    }
}
