// Images, image views and samplers
//
// Every image tracks its current layout, pending access mask, pipeline
// stage bracket and owning queue family under a per-image lock, so a
// layout transition is a single transactional operation from any
// encoder thread.

use std::sync::{Arc, Mutex};

use ash::vk;

use utils::log;

use super::memory::{MemoryBlock, MemoryPool};
use super::types::PixelFormat;
use crate::{GraupelError, Result};

#[derive(Copy, Clone)]
struct LayoutAccessInfo {
    layout: vk::ImageLayout,
    access_mask: vk::AccessFlags2,
    stage_mask_begin: vk::PipelineStageFlags2,
    stage_mask_end: vk::PipelineStageFlags2,
    queue_family_index: u32,
}

pub struct Image {
    device: ash::Device,
    pool: Option<Arc<MemoryPool>>,
    pub image: vk::Image,
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
    memory: Option<MemoryBlock>,
    // swapchain images belong to the swapchain, not to us
    owned: bool,
    layout_info: Mutex<LayoutAccessInfo>,
}

impl Image {
    pub(crate) fn new(
        device: ash::Device,
        pool: Arc<MemoryPool>,
        memory: MemoryBlock,
        image: vk::Image,
        create_info: &vk::ImageCreateInfo,
    ) -> Self {
        Self {
            device,
            pool: Some(pool),
            image,
            image_type: create_info.image_type,
            format: create_info.format,
            extent: create_info.extent,
            mip_levels: create_info.mip_levels,
            array_layers: create_info.array_layers,
            usage: create_info.usage,
            memory: Some(memory),
            owned: true,
            layout_info: Mutex::new(LayoutAccessInfo {
                layout: vk::ImageLayout::UNDEFINED,
                access_mask: vk::AccessFlags2::NONE,
                stage_mask_begin: vk::PipelineStageFlags2::TOP_OF_PIPE,
                stage_mask_end: vk::PipelineStageFlags2::TOP_OF_PIPE,
                queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            }),
        }
    }

    /// Wrap an externally-owned image (a swapchain image).
    pub(crate) fn from_external(device: ash::Device, image: vk::Image) -> Self {
        Self {
            device,
            pool: None,
            image,
            image_type: vk::ImageType::TYPE_2D,
            format: vk::Format::UNDEFINED,
            extent: vk::Extent3D::default(),
            mip_levels: 1,
            array_layers: 1,
            usage: vk::ImageUsageFlags::empty(),
            memory: None,
            owned: false,
            layout_info: Mutex::new(LayoutAccessInfo {
                layout: vk::ImageLayout::UNDEFINED,
                access_mask: vk::AccessFlags2::NONE,
                stage_mask_begin: vk::PipelineStageFlags2::TOP_OF_PIPE,
                stage_mask_end: vk::PipelineStageFlags2::TOP_OF_PIPE,
                queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            }),
        }
    }

    pub(crate) fn set_external_properties(
        &mut self,
        format: vk::Format,
        extent: vk::Extent3D,
        usage: vk::ImageUsageFlags,
    ) {
        self.format = format;
        self.extent = extent;
        self.usage = usage;
    }

    pub fn width(&self) -> u32 {
        self.extent.width
    }

    pub fn height(&self) -> u32 {
        self.extent.height
    }

    pub fn depth(&self) -> u32 {
        self.extent.depth
    }

    pub fn mipmap_count(&self) -> u32 {
        self.mip_levels
    }

    pub fn array_length(&self) -> u32 {
        self.array_layers
    }

    pub fn pixel_format(&self) -> PixelFormat {
        PixelFormat::from_vk(self.format)
    }

    /// Record a layout transition into `command_buffer` and update the
    /// tracked state in one step. Returns the previous layout.
    ///
    /// The source stage comes from the tracked end-of-use stage; it is
    /// widened to ALL_COMMANDS when ownership crosses queue families or
    /// when the recorded stage is BOTTOM_OF_PIPE.
    pub fn set_layout(
        &self,
        layout: vk::ImageLayout,
        access_mask: vk::AccessFlags2,
        stage_begin: vk::PipelineStageFlags2,
        stage_end: vk::PipelineStageFlags2,
        queue_family_index: u32,
        command_buffer: vk::CommandBuffer,
    ) -> vk::ImageLayout {
        debug_assert!(layout != vk::ImageLayout::UNDEFINED);
        debug_assert!(layout != vk::ImageLayout::PREINITIALIZED);
        debug_assert!(command_buffer != vk::CommandBuffer::null());

        let mut info = self.layout_info.lock().unwrap();

        let mut aspect_mask = vk::ImageAspectFlags::empty();
        let pixel_format = self.pixel_format();
        if pixel_format.is_color_format() {
            aspect_mask = vk::ImageAspectFlags::COLOR;
        } else {
            if pixel_format.is_depth_format() {
                aspect_mask |= vk::ImageAspectFlags::DEPTH;
            }
            if pixel_format.is_stencil_format() {
                aspect_mask |= vk::ImageAspectFlags::STENCIL;
            }
        }

        let mut barrier = vk::ImageMemoryBarrier2::builder()
            .src_access_mask(info.access_mask)
            .dst_access_mask(access_mask)
            .old_layout(info.layout)
            .new_layout(layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(aspect_mask)
                    .base_mip_level(0)
                    .level_count(vk::REMAINING_MIP_LEVELS)
                    .base_array_layer(0)
                    .layer_count(vk::REMAINING_ARRAY_LAYERS)
                    .build(),
            )
            .src_stage_mask(info.stage_mask_end)
            .dst_stage_mask(stage_begin)
            .build();

        if info.queue_family_index != queue_family_index {
            if info.queue_family_index == vk::QUEUE_FAMILY_IGNORED
                || queue_family_index == vk::QUEUE_FAMILY_IGNORED
            {
                barrier.src_stage_mask = vk::PipelineStageFlags2::ALL_COMMANDS;
            } else {
                barrier.src_queue_family_index = info.queue_family_index;
                barrier.dst_queue_family_index = queue_family_index;
            }
        }
        if barrier.src_stage_mask == vk::PipelineStageFlags2::BOTTOM_OF_PIPE {
            barrier.src_stage_mask = vk::PipelineStageFlags2::ALL_COMMANDS;
        }

        let barriers = [barrier];
        let dependency = vk::DependencyInfo::builder().image_memory_barriers(&barriers);
        unsafe {
            self.device.cmd_pipeline_barrier2(command_buffer, &dependency);
        }

        let old_layout = info.layout;
        info.layout = layout;
        info.stage_mask_begin = stage_begin;
        info.stage_mask_end = stage_end;
        info.access_mask = access_mask;
        info.queue_family_index = queue_family_index;
        old_layout
    }

    pub fn layout(&self) -> vk::ImageLayout {
        self.layout_info.lock().unwrap().layout
    }

    /// The access mask a layout conventionally implies.
    pub fn common_layout_access_mask(layout: vk::ImageLayout) -> vk::AccessFlags2 {
        match layout {
            vk::ImageLayout::UNDEFINED => vk::AccessFlags2::NONE,
            vk::ImageLayout::GENERAL => {
                vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE
            }
            vk::ImageLayout::PREINITIALIZED => vk::AccessFlags2::HOST_WRITE,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
            }
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
            }
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
            | vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL
            | vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL => {
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
            }
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags2::SHADER_READ,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags2::TRANSFER_READ,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags2::TRANSFER_WRITE,
            vk::ImageLayout::PRESENT_SRC_KHR => vk::AccessFlags2::NONE,
            _ => vk::AccessFlags2::NONE,
        }
    }

    /// View of this image, optionally aliasing through a parent view.
    pub fn make_image_view(
        self: &Arc<Self>,
        format: PixelFormat,
        parent: Option<Arc<ImageView>>,
    ) -> Result<Arc<ImageView>> {
        if !self.usage.intersects(
            vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
                | vk::ImageUsageFlags::INPUT_ATTACHMENT,
        ) {
            log::error!("image usage does not allow views");
            return Err(GraupelError::VALIDATION_FAILED);
        }

        let view_type = match self.image_type {
            vk::ImageType::TYPE_1D => vk::ImageViewType::TYPE_1D,
            vk::ImageType::TYPE_3D => vk::ImageViewType::TYPE_3D,
            _ => vk::ImageViewType::TYPE_2D,
        };

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

        let info = vk::ImageViewCreateInfo::builder()
            .image(self.image)
            .view_type(view_type)
            .format(format.to_vk())
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::R,
                g: vk::ComponentSwizzle::G,
                b: vk::ComponentSwizzle::B,
                a: vk::ComponentSwizzle::A,
            })
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(aspect_mask)
                    .base_mip_level(0)
                    .level_count(vk::REMAINING_MIP_LEVELS)
                    .base_array_layer(0)
                    .layer_count(vk::REMAINING_ARRAY_LAYERS)
                    .build(),
            );

        let view = unsafe {
            self.device.create_image_view(&info, None).map_err(|e| {
                log::error!("vkCreateImageView failed: {:?}", e);
                GraupelError::from(e)
            })?
        };

        Ok(Arc::new(ImageView {
            device: self.device.clone(),
            image_view: view,
            image: Mutex::new(Some(self.clone())),
            parent,
            wait_semaphore: Mutex::new(vk::Semaphore::null()),
            signal_semaphore: Mutex::new(vk::Semaphore::null()),
        }))
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if self.owned {
            unsafe { self.device.destroy_image(self.image, None) };
        }
        if let (Some(pool), Some(memory)) = (self.pool.take(), self.memory.take()) {
            pool.dealloc(memory);
        }
    }
}

pub struct ImageView {
    device: ash::Device,
    pub image_view: vk::ImageView,
    pub image: Mutex<Option<Arc<Image>>>,
    /// Parent view when this view aliases another one's image memory.
    pub parent: Option<Arc<ImageView>>,
    // swapchain bookkeeping: the acquire semaphore for the frame this
    // view is the render target of
    pub wait_semaphore: Mutex<vk::Semaphore>,
    pub signal_semaphore: Mutex<vk::Semaphore>,
}

impl ImageView {
    pub(crate) fn from_raw(
        device: ash::Device,
        image_view: vk::ImageView,
        image: Option<Arc<Image>>,
    ) -> Arc<ImageView> {
        Arc::new(ImageView {
            device,
            image_view,
            image: Mutex::new(image),
            parent: None,
            wait_semaphore: Mutex::new(vk::Semaphore::null()),
            signal_semaphore: Mutex::new(vk::Semaphore::null()),
        })
    }

    pub fn image(&self) -> Option<Arc<Image>> {
        self.image.lock().unwrap().clone()
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        unsafe { self.device.destroy_image_view(self.image_view, None) };
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SamplerFilter {
    Nearest,
    Linear,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SamplerAddressMode {
    Repeat,
    MirrorRepeat,
    ClampToEdge,
    ClampToBorder,
}

impl SamplerAddressMode {
    fn to_vk(self) -> vk::SamplerAddressMode {
        match self {
            SamplerAddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
            SamplerAddressMode::MirrorRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
            SamplerAddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            SamplerAddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct SamplerDescriptor {
    pub min_filter: SamplerFilter,
    pub mag_filter: SamplerFilter,
    pub mip_filter: SamplerFilter,
    pub address_mode_u: SamplerAddressMode,
    pub address_mode_v: SamplerAddressMode,
    pub address_mode_w: SamplerAddressMode,
    pub lod_min_clamp: f32,
    pub lod_max_clamp: f32,
    pub max_anisotropy: u32,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            min_filter: SamplerFilter::Linear,
            mag_filter: SamplerFilter::Linear,
            mip_filter: SamplerFilter::Linear,
            address_mode_u: SamplerAddressMode::Repeat,
            address_mode_v: SamplerAddressMode::Repeat,
            address_mode_w: SamplerAddressMode::Repeat,
            lod_min_clamp: 0.0,
            lod_max_clamp: vk::LOD_CLAMP_NONE,
            max_anisotropy: 1,
        }
    }
}

impl SamplerDescriptor {
    pub(crate) fn to_vk(&self) -> vk::SamplerCreateInfo {
        let filter = |f: SamplerFilter| match f {
            SamplerFilter::Nearest => vk::Filter::NEAREST,
            SamplerFilter::Linear => vk::Filter::LINEAR,
        };
        let mip = |f: SamplerFilter| match f {
            SamplerFilter::Nearest => vk::SamplerMipmapMode::NEAREST,
            SamplerFilter::Linear => vk::SamplerMipmapMode::LINEAR,
        };
        vk::SamplerCreateInfo::builder()
            .min_filter(filter(self.min_filter))
            .mag_filter(filter(self.mag_filter))
            .mipmap_mode(mip(self.mip_filter))
            .address_mode_u(self.address_mode_u.to_vk())
            .address_mode_v(self.address_mode_v.to_vk())
            .address_mode_w(self.address_mode_w.to_vk())
            .min_lod(self.lod_min_clamp)
            .max_lod(self.lod_max_clamp)
            .anisotropy_enable(self.max_anisotropy > 1)
            .max_anisotropy(self.max_anisotropy as f32)
            .build()
    }
}

pub struct Sampler {
    device: ash::Device,
    pub sampler: vk::Sampler,
}

impl Sampler {
    pub(crate) fn new(device: ash::Device, sampler: vk::Sampler) -> Self {
        Self { device, sampler }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe { self.device.destroy_sampler(self.sampler, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_layout_access_masks_follow_the_table() {
        // the canonical access mask each layout implies for barriers
        let cases = [
            (vk::ImageLayout::UNDEFINED, vk::AccessFlags2::NONE),
            (
                vk::ImageLayout::GENERAL,
                vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
            ),
            (vk::ImageLayout::PREINITIALIZED, vk::AccessFlags2::HOST_WRITE),
            (
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            ),
            (
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
            (
                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
            ),
            (
                vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
            ),
            (
                vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
            ),
            (
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags2::SHADER_READ,
            ),
            (
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::AccessFlags2::TRANSFER_READ,
            ),
            (
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags2::TRANSFER_WRITE,
            ),
            (vk::ImageLayout::PRESENT_SRC_KHR, vk::AccessFlags2::NONE),
        ];
        for (layout, expected) in cases.iter() {
            assert_eq!(
                Image::common_layout_access_mask(*layout),
                *expected,
                "{:?}",
                layout
            );
        }
    }

    #[test]
    fn unrecognized_layouts_imply_no_access() {
        let layout = vk::ImageLayout::from_raw(0x7fff_0000);
        assert_eq!(
            Image::common_layout_access_mask(layout),
            vk::AccessFlags2::NONE
        );
    }
}
