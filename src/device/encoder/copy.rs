// Copy command encoder
//
// Buffer and image transfers with up-front validation: regions are
// checked against buffer lengths and mip-level dimensions before
// anything is recorded, and an offending copy refuses to record at all.
// Involved images transition to TRANSFER_SRC/TRANSFER_DST implicitly.

use std::sync::Arc;

use ash::vk;

use utils::log;

use super::super::buffer::Buffer;
use super::super::cmdbuffer::CommandBuffer;
use super::super::image::{Image, ImageView};
use super::super::semaphore::GpuEvent;
use super::{CommandEncoder, EncoderBase};

/// Origin of a linear pixel layout inside a buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferImageOrigin {
    /// Must be 4-byte aligned.
    pub buffer_offset: u64,
    pub image_width: u32,
    pub image_height: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TextureOrigin {
    pub level: u32,
    pub layer: u32,
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TextureSize {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

pub(crate) struct CopyEncodingState {
    pub queue_family_index: u32,
}

type CopyCommand = Box<dyn Fn(&ash::Device, vk::CommandBuffer, &mut CopyEncodingState) + Send>;

pub(crate) struct CopyEncoder {
    pub base: EncoderBase,
    commands: Vec<CopyCommand>,
}

impl CommandEncoder for CopyEncoder {
    fn encode(
        &mut self,
        device: &ash::Device,
        queue_family_index: u32,
        cmd: vk::CommandBuffer,
    ) -> bool {
        let mut state = CopyEncodingState { queue_family_index };
        for command in self.commands.iter() {
            command(device, cmd, &mut state);
        }
        true
    }

    fn base(&self) -> &EncoderBase {
        &self.base
    }
}

fn subresource_layers(
    origin: &TextureOrigin,
    layer_count: u32,
    image: &Image,
) -> vk::ImageSubresourceLayers {
    let format = image.pixel_format();
    let mut aspect_mask = vk::ImageAspectFlags::empty();
    if format.is_color_format() {
        aspect_mask = vk::ImageAspectFlags::COLOR;
    } else {
        if format.is_depth_format() {
            aspect_mask |= vk::ImageAspectFlags::DEPTH;
        }
        if format.is_stencil_format() {
            aspect_mask |= vk::ImageAspectFlags::STENCIL;
        }
    }
    vk::ImageSubresourceLayers {
        aspect_mask,
        mip_level: origin.level,
        base_array_layer: origin.layer,
        layer_count,
    }
}

fn mip_dimensions(image: &Image, level: u32) -> TextureSize {
    TextureSize {
        width: (image.width() >> level).max(1),
        height: (image.height() >> level).max(1),
        depth: (image.depth() >> level).max(1),
    }
}

pub struct CopyCommandEncoder {
    cbuffer: Arc<CommandBuffer>,
    encoder: Option<Box<CopyEncoder>>,
}

impl CopyCommandEncoder {
    pub(crate) fn new(cbuffer: Arc<CommandBuffer>) -> CopyCommandEncoder {
        CopyCommandEncoder {
            cbuffer,
            encoder: Some(Box::new(CopyEncoder {
                base: EncoderBase::default(),
                commands: Vec::new(),
            })),
        }
    }

    fn encoder(&mut self) -> &mut CopyEncoder {
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

    pub(crate) fn add_wait_semaphore(
        &mut self,
        semaphore: vk::Semaphore,
        value: u64,
        stages: vk::PipelineStageFlags2,
    ) {
        self.encoder().base.add_wait_semaphore(semaphore, value, stages);
    }

    pub(crate) fn add_signal_semaphore(
        &mut self,
        semaphore: vk::Semaphore,
        value: u64,
        stages: vk::PipelineStageFlags2,
    ) {
        self.encoder().base.add_signal_semaphore(semaphore, value, stages);
    }

    /// Record an arbitrary command. Used by the swapchain for its
    /// presentation layout transition.
    pub(crate) fn callback<F>(&mut self, f: F)
    where
        F: Fn(&ash::Device, vk::CommandBuffer, u32) + Send + 'static,
    {
        self.encoder().commands.push(Box::new(
            move |device, cmd, state: &mut CopyEncodingState| {
                f(device, cmd, state.queue_family_index);
            },
        ));
    }

    pub fn copy_buffer(
        &mut self,
        src: Arc<Buffer>,
        src_offset: u64,
        dst: Arc<Buffer>,
        dst_offset: u64,
        size: u64,
    ) {
        if src_offset + size > src.length() as u64 || dst_offset + size > dst.length() as u64 {
            log::error!("CopyCommandEncoder::copy_buffer failed: Invalid buffer region");
            return;
        }

        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        self.encoder().commands.push(Box::new(
            move |device, cmd, _state: &mut CopyEncodingState| unsafe {
                device.cmd_copy_buffer(cmd, src.buffer, dst.buffer, &[region]);
            },
        ));
    }

    pub fn copy_buffer_to_texture(
        &mut self,
        src: Arc<Buffer>,
        src_offset: BufferImageOrigin,
        dst: Arc<ImageView>,
        dst_offset: TextureOrigin,
        size: TextureSize,
    ) {
        if src_offset.buffer_offset % 4 != 0 {
            log::error!("CopyCommandEncoder: buffer offset must be 4-byte aligned");
            return;
        }
        let image = match dst.image() {
            Some(i) => i,
            None => {
                log::error!("CopyCommandEncoder: destination has no image");
                return;
            }
        };

        let mip = mip_dimensions(&image, dst_offset.level);
        if dst_offset.x + size.width > mip.width
            || dst_offset.y + size.height > mip.height
            || dst_offset.z + size.depth > mip.depth
        {
            log::error!("CopyCommandEncoder::copy failed: Invalid texture region");
            return;
        }
        if size.width > src_offset.image_width || size.height > src_offset.image_height {
            log::error!("CopyCommandEncoder::copy failed: Invalid buffer region");
            return;
        }

        let bytes_per_pixel = image.pixel_format().bytes_per_pixel() as u64;
        debug_assert!(bytes_per_pixel > 0);
        let required = src_offset.image_width as u64
            * src_offset.image_height as u64
            * size.depth as u64
            * bytes_per_pixel
            + src_offset.buffer_offset;
        if required > src.length() as u64 {
            log::error!("CopyCommandEncoder::copy failed: buffer is too small!");
            return;
        }

        let region = vk::BufferImageCopy {
            buffer_offset: src_offset.buffer_offset,
            buffer_row_length: src_offset.image_width,
            buffer_image_height: src_offset.image_height,
            image_subresource: subresource_layers(&dst_offset, 1, &image),
            image_offset: vk::Offset3D {
                x: dst_offset.x as i32,
                y: dst_offset.y as i32,
                z: dst_offset.z as i32,
            },
            image_extent: vk::Extent3D {
                width: size.width,
                height: size.height,
                depth: size.depth,
            },
        };
        self.encoder().commands.push(Box::new(
            move |device, cmd, state: &mut CopyEncodingState| {
                image.set_layout(
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::AccessFlags2::TRANSFER_WRITE,
                    vk::PipelineStageFlags2::TRANSFER,
                    vk::PipelineStageFlags2::TRANSFER,
                    state.queue_family_index,
                    cmd,
                );
                unsafe {
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        src.buffer,
                        image.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
            },
        ));
    }

    pub fn copy_texture_to_buffer(
        &mut self,
        src: Arc<ImageView>,
        src_offset: TextureOrigin,
        dst: Arc<Buffer>,
        dst_offset: BufferImageOrigin,
        size: TextureSize,
    ) {
        if dst_offset.buffer_offset % 4 != 0 {
            log::error!("CopyCommandEncoder: buffer offset must be 4-byte aligned");
            return;
        }
        let image = match src.image() {
            Some(i) => i,
            None => {
                log::error!("CopyCommandEncoder: source has no image");
                return;
            }
        };

        let mip = mip_dimensions(&image, src_offset.level);
        if src_offset.x + size.width > mip.width
            || src_offset.y + size.height > mip.height
            || src_offset.z + size.depth > mip.depth
        {
            log::error!("CopyCommandEncoder::copy failed: Invalid texture region");
            return;
        }
        if size.width > dst_offset.image_width || size.height > dst_offset.image_height {
            log::error!("CopyCommandEncoder::copy failed: Invalid buffer region");
            return;
        }

        let bytes_per_pixel = image.pixel_format().bytes_per_pixel() as u64;
        debug_assert!(bytes_per_pixel > 0);
        let required = dst_offset.image_width as u64
            * dst_offset.image_height as u64
            * size.depth as u64
            * bytes_per_pixel
            + dst_offset.buffer_offset;
        if required > dst.length() as u64 {
            log::error!("CopyCommandEncoder::copy failed: buffer is too small!");
            return;
        }

        let region = vk::BufferImageCopy {
            buffer_offset: dst_offset.buffer_offset,
            buffer_row_length: dst_offset.image_width,
            buffer_image_height: dst_offset.image_height,
            image_subresource: subresource_layers(&src_offset, 1, &image),
            image_offset: vk::Offset3D {
                x: src_offset.x as i32,
                y: src_offset.y as i32,
                z: src_offset.z as i32,
            },
            image_extent: vk::Extent3D {
                width: size.width,
                height: size.height,
                depth: size.depth,
            },
        };
        self.encoder().commands.push(Box::new(
            move |device, cmd, state: &mut CopyEncodingState| {
                image.set_layout(
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::AccessFlags2::TRANSFER_READ,
                    vk::PipelineStageFlags2::TRANSFER,
                    vk::PipelineStageFlags2::TRANSFER,
                    state.queue_family_index,
                    cmd,
                );
                unsafe {
                    device.cmd_copy_image_to_buffer(
                        cmd,
                        image.image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst.buffer,
                        &[region],
                    );
                }
            },
        ));
    }

    pub fn copy_texture(
        &mut self,
        src: Arc<ImageView>,
        src_offset: TextureOrigin,
        dst: Arc<ImageView>,
        dst_offset: TextureOrigin,
        size: TextureSize,
    ) {
        let (src_image, dst_image) = match (src.image(), dst.image()) {
            (Some(s), Some(d)) => (s, d),
            _ => {
                log::error!("CopyCommandEncoder: texture copy requires images on both sides");
                return;
            }
        };

        let src_mip = mip_dimensions(&src_image, src_offset.level);
        if src_offset.x + size.width > src_mip.width
            || src_offset.y + size.height > src_mip.height
            || src_offset.z + size.depth > src_mip.depth
        {
            log::error!("CopyCommandEncoder::copy failed: Invalid source texture region");
            return;
        }
        let dst_mip = mip_dimensions(&dst_image, dst_offset.level);
        if dst_offset.x + size.width > dst_mip.width
            || dst_offset.y + size.height > dst_mip.height
            || dst_offset.z + size.depth > dst_mip.depth
        {
            log::error!("CopyCommandEncoder::copy failed: Invalid destination texture region");
            return;
        }

        let src_bpp = src_image.pixel_format().bytes_per_pixel();
        let dst_bpp = dst_image.pixel_format().bytes_per_pixel();
        debug_assert!(src_bpp > 0 && dst_bpp > 0);
        if src_bpp != dst_bpp {
            log::error!("CopyCommandEncoder::copy failed: Incompatible pixel formats");
            return;
        }

        let region = vk::ImageCopy {
            src_subresource: subresource_layers(&src_offset, 1, &src_image),
            src_offset: vk::Offset3D {
                x: src_offset.x as i32,
                y: src_offset.y as i32,
                z: src_offset.z as i32,
            },
            dst_subresource: subresource_layers(&dst_offset, 1, &dst_image),
            dst_offset: vk::Offset3D {
                x: dst_offset.x as i32,
                y: dst_offset.y as i32,
                z: dst_offset.z as i32,
            },
            extent: vk::Extent3D {
                width: size.width,
                height: size.height,
                depth: size.depth,
            },
        };
        self.encoder().commands.push(Box::new(
            move |device, cmd, state: &mut CopyEncodingState| {
                src_image.set_layout(
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::AccessFlags2::TRANSFER_READ,
                    vk::PipelineStageFlags2::TRANSFER,
                    vk::PipelineStageFlags2::TRANSFER,
                    state.queue_family_index,
                    cmd,
                );
                dst_image.set_layout(
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::AccessFlags2::TRANSFER_WRITE,
                    vk::PipelineStageFlags2::TRANSFER,
                    vk::PipelineStageFlags2::TRANSFER,
                    state.queue_family_index,
                    cmd,
                );
                unsafe {
                    device.cmd_copy_image(
                        cmd,
                        src_image.image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst_image.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
            },
        ));
    }

    pub fn fill_buffer(&mut self, buffer: Arc<Buffer>, offset: u64, length: u64, value: u8) {
        if offset + length > buffer.length() as u64 {
            log::error!("CopyCommandEncoder::fill failed: Invalid buffer region");
            return;
        }
        let data = u32::from_le_bytes([value, value, value, value]);
        self.encoder().commands.push(Box::new(
            move |device, cmd, _state: &mut CopyEncodingState| unsafe {
                device.cmd_fill_buffer(cmd, buffer.buffer, offset, length, data);
            },
        ));
    }
}

impl Drop for CopyCommandEncoder {
    fn drop(&mut self) {
        self.end_encoding();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_dimensions_clamp_to_one() {
        // shape of the mip-size arithmetic used by region validation
        let dims = |w: u32, h: u32, d: u32, level: u32| TextureSize {
            width: (w >> level).max(1),
            height: (h >> level).max(1),
            depth: (d >> level).max(1),
        };
        assert_eq!(
            dims(256, 128, 1, 0),
            TextureSize {
                width: 256,
                height: 128,
                depth: 1
            }
        );
        assert_eq!(
            dims(256, 128, 1, 8),
            TextureSize {
                width: 1,
                height: 1,
                depth: 1
            }
        );
    }
}
