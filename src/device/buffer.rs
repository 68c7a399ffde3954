// GPU buffers and typed buffer views

use std::sync::Arc;

use ash::vk;

use utils::log;

use super::memory::{MemoryBlock, MemoryPool};
use super::types::PixelFormat;
use crate::{GraupelError, Result};

pub struct Buffer {
    device: ash::Device,
    pool: Option<Arc<MemoryPool>>,
    pub buffer: vk::Buffer,
    pub usage: vk::BufferUsageFlags,
    pub sharing_mode: vk::SharingMode,
    pub size: vk::DeviceSize,
    memory: Option<MemoryBlock>,
}

impl Buffer {
    pub(crate) fn new(
        device: ash::Device,
        pool: Arc<MemoryPool>,
        memory: MemoryBlock,
        buffer: vk::Buffer,
        create_info: &vk::BufferCreateInfo,
    ) -> Self {
        Self {
            device,
            pool: Some(pool),
            buffer,
            usage: create_info.usage,
            sharing_mode: create_info.sharing_mode,
            size: create_info.size,
            memory: Some(memory),
        }
    }

    pub fn length(&self) -> usize {
        self.size as usize
    }

    /// Host pointer to the persistently-mapped backing store, or null
    /// for device-local buffers.
    pub fn contents(&self) -> *mut u8 {
        match self.memory.as_ref() {
            Some(block) => block.mapped_ptr(),
            None => std::ptr::null_mut(),
        }
    }

    /// Flush host writes. Only meaningful for host-coherent memory.
    pub fn flush(&self) {
        if let Some(block) = self.memory.as_ref() {
            block.flush();
        }
    }

    /// Typed texel-buffer view over a range of this buffer.
    pub fn make_buffer_view(
        self: &Arc<Self>,
        format: PixelFormat,
        offset: usize,
        range: usize,
    ) -> Result<Arc<BufferView>> {
        if !self
            .usage
            .intersects(vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER)
        {
            log::error!("buffer was not created with texel-buffer usage");
            return Err(GraupelError::VALIDATION_FAILED);
        }
        let info = vk::BufferViewCreateInfo::builder()
            .buffer(self.buffer)
            .format(format.to_vk())
            .offset(offset as u64)
            .range(range as u64);
        let view = unsafe {
            self.device.create_buffer_view(&info, None).map_err(|e| {
                log::error!("vkCreateBufferView failed: {:?}", e);
                GraupelError::from(e)
            })?
        };
        Ok(Arc::new(BufferView {
            device: self.device.clone(),
            buffer: self.clone(),
            buffer_view: view,
        }))
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { self.device.destroy_buffer(self.buffer, None) };
        if let (Some(pool), Some(memory)) = (self.pool.take(), self.memory.take()) {
            pool.dealloc(memory);
        }
    }
}

/// A buffer plus, optionally, a VkBufferView reinterpreting its bytes
/// as texels.
pub struct BufferView {
    device: ash::Device,
    pub buffer: Arc<Buffer>,
    pub buffer_view: vk::BufferView,
}

impl BufferView {
    /// Plain wrapper with no texel view.
    pub fn untyped(buffer: Arc<Buffer>) -> Arc<BufferView> {
        Arc::new(BufferView {
            device: buffer.device.clone(),
            buffer,
            buffer_view: vk::BufferView::null(),
        })
    }
}

impl Drop for BufferView {
    fn drop(&mut self) {
        if self.buffer_view != vk::BufferView::null() {
            unsafe { self.device.destroy_buffer_view(self.buffer_view, None) };
        }
    }
}
