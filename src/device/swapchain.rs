// Swapchain and frame pacing
//
// Frame pacing uses three binary acquire semaphores in round-robin plus
// one shared timeline semaphore. Before reusing a binary semaphore the
// frame that last used it must have presented, which the timeline value
// recorded on the semaphore guarantees. Presentation failures reset the
// recorded value so the next reuse does not wait on a frame that never
// happened.

use std::sync::{Arc, Mutex};

use ash::extensions::khr;
use ash::vk;

use utils::log;

use super::cmdbuffer::CommandQueue;
use super::encoder::{RenderPassColorAttachmentDescriptor, RenderPassDescriptor};
use super::image::{Image, ImageView};
use super::semaphore::GpuEvent;
use super::types::{LoadAction, PixelFormat, StoreAction};
use crate::geometry::Color;
use crate::{GraupelError, Result};

const MAX_FRAME_SEMAPHORES: usize = 3;

// Round-robin acquire-semaphore slot for the frame about to start.
fn frame_semaphore_index(frame_count: u64, semaphore_count: usize) -> usize {
    (frame_count % semaphore_count as u64) as usize
}

// Frame index recorded on the retired binary semaphore. A successful
// present records the new frame count, so the next user of the
// semaphore waits for the timeline to reach it; a failed present
// records zero and the semaphore is reusable immediately.
fn retired_frame_index(frame_count: u64, present_succeeded: bool) -> u64 {
    if present_succeeded {
        frame_count
    } else {
        0
    }
}

struct FrameSemaphore {
    semaphore: vk::Semaphore,
    /// Frame count recorded when this semaphore's frame presented;
    /// zero means it has never been used (or its present failed).
    frame_index: u64,
}

struct SwapchainState {
    swapchain: vk::SwapchainKHR,
    surface_format: vk::SurfaceFormatKHR,
    available_surface_formats: Vec<vk::SurfaceFormatKHR>,
    image_views: Vec<Arc<ImageView>>,
    device_reset: bool,
    enable_vsync: bool,
    width: u32,
    height: u32,
}

struct FrameState {
    semaphores: Vec<FrameSemaphore>,
    frame_count: u64,
    /// Index of the acquired swapchain image.
    frame_index: u32,
    /// Index into `semaphores` for the in-flight frame.
    frame_ready: usize,
    render_pass_descriptor: Option<RenderPassDescriptor>,
}

pub struct Swapchain {
    queue: Arc<CommandQueue>,
    surface_loader: khr::Surface,
    swapchain_loader: khr::Swapchain,
    surface: vk::SurfaceKHR,
    frame_timeline: vk::Semaphore,
    state: Mutex<SwapchainState>,
    frame: Mutex<FrameState>,
}

impl Swapchain {
    pub(crate) fn new(
        queue: Arc<CommandQueue>,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        enable_vsync: bool,
    ) -> Result<Swapchain> {
        let gdevice = queue.gdevice.clone();
        let instance = gdevice.instance();
        let surface_loader = khr::Surface::new(&instance.loader, &instance.inst);
        let swapchain_loader = khr::Swapchain::new(&instance.inst, gdevice.vk_device());

        let supported = unsafe {
            surface_loader
                .get_physical_device_surface_support(
                    gdevice.physical_device(),
                    queue.family_index,
                    surface,
                )
                .map_err(GraupelError::from)?
        };
        if !supported {
            log::error!(
                "VkSurfaceKHR not supported by queue family {}",
                queue.family_index
            );
            return Err(GraupelError::VALIDATION_FAILED);
        }

        let available_surface_formats = unsafe {
            surface_loader
                .get_physical_device_surface_formats(gdevice.physical_device(), surface)
                .map_err(GraupelError::from)?
        };
        if available_surface_formats.is_empty() {
            log::error!("vkGetPhysicalDeviceSurfaceFormatsKHR returned no formats");
            return Err(GraupelError::VALIDATION_FAILED);
        }

        // no preferred format means we pick one
        let surface_format = if available_surface_formats.len() == 1
            && available_surface_formats[0].format == vk::Format::UNDEFINED
        {
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: available_surface_formats[0].color_space,
            }
        } else {
            available_surface_formats[0]
        };

        // the frame timeline plus one binary semaphore per in-flight frame
        let device = gdevice.vk_device();
        let mut timeline_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let info = vk::SemaphoreCreateInfo::builder().push_next(&mut timeline_info);
        let frame_timeline = unsafe {
            device
                .create_semaphore(&info, None)
                .map_err(GraupelError::from)?
        };

        let mut semaphores = Vec::with_capacity(MAX_FRAME_SEMAPHORES);
        for _ in 0..MAX_FRAME_SEMAPHORES {
            let info = vk::SemaphoreCreateInfo::builder();
            let semaphore = unsafe {
                device
                    .create_semaphore(&info, None)
                    .map_err(GraupelError::from)?
            };
            semaphores.push(FrameSemaphore {
                semaphore,
                frame_index: 0,
            });
        }

        let swapchain = Swapchain {
            queue,
            surface_loader,
            swapchain_loader,
            surface,
            frame_timeline,
            state: Mutex::new(SwapchainState {
                swapchain: vk::SwapchainKHR::null(),
                surface_format,
                available_surface_formats,
                image_views: Vec::new(),
                device_reset: false,
                enable_vsync,
                width,
                height,
            }),
            frame: Mutex::new(FrameState {
                semaphores,
                frame_count: 0,
                frame_index: 0,
                frame_ready: 0,
                render_pass_descriptor: None,
            }),
        };
        swapchain.update_device()?;
        Ok(swapchain)
    }

    pub fn pixel_format(&self) -> PixelFormat {
        PixelFormat::from_vk(self.state.lock().unwrap().surface_format.format)
    }

    /// Request a different surface format. Takes effect on the next
    /// present, which rebuilds the swapchain.
    pub fn set_pixel_format(&self, format: PixelFormat) {
        let mut state = self.state.lock().unwrap();
        let vk_format = format.to_vk();
        if vk_format == state.surface_format.format {
            return;
        }
        if !format.is_color_format() {
            log::error!("Swapchain::set_pixel_format failed (invalid format)");
            return;
        }

        let mut format_changed = false;
        if state.available_surface_formats.len() == 1
            && state.available_surface_formats[0].format == vk::Format::UNDEFINED
        {
            format_changed = true;
            state.surface_format.format = vk_format;
        } else if let Some(found) = state
            .available_surface_formats
            .iter()
            .find(|f| f.format == vk_format)
            .copied()
        {
            format_changed = true;
            state.surface_format = found;
        }

        if format_changed {
            state.device_reset = true;
            log::debug!("Swapchain::set_pixel_format value changed");
        } else {
            log::error!("Swapchain::set_pixel_format failed (not supported format)");
        }
    }

    pub fn maximum_buffer_count(&self) -> usize {
        self.state.lock().unwrap().image_views.len()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame.lock().unwrap().frame_count
    }

    /// (Re)build the swapchain against the current surface state.
    fn update_device(&self) -> Result<()> {
        let gdevice = &self.queue.gdevice;
        let pdev = gdevice.physical_device();
        let device = gdevice.vk_device();
        let mut state = self.state.lock().unwrap();

        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(pdev, self.surface)
                .map_err(GraupelError::from)?
        };
        let present_modes = unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(pdev, self.surface)
                .map_err(GraupelError::from)?
        };

        let extent = if caps.current_extent.width == u32::MAX {
            vk::Extent2D {
                width: state.width,
                height: state.height,
            }
        } else {
            caps.current_extent
        };

        // FIFO is always available; without vsync prefer mailbox, then
        // immediate
        let mut present_mode = vk::PresentModeKHR::FIFO;
        if !state.enable_vsync {
            for mode in present_modes.iter() {
                if *mode == vk::PresentModeKHR::MAILBOX {
                    present_mode = vk::PresentModeKHR::MAILBOX;
                    break;
                }
                if *mode == vk::PresentModeKHR::IMMEDIATE {
                    present_mode = vk::PresentModeKHR::IMMEDIATE;
                }
            }
        }

        let mut image_count = caps.min_image_count + 1;
        if caps.max_image_count > 0 {
            image_count = image_count.min(caps.max_image_count);
        }

        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let old_swapchain = state.swapchain;
        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(state.surface_format.format)
            .image_color_space(state.surface_format.color_space)
            .image_extent(extent)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(pre_transform)
            .image_array_layers(1)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .present_mode(present_mode)
            .old_swapchain(old_swapchain)
            .clipped(true)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE);

        let swapchain = unsafe {
            self.swapchain_loader
                .create_swapchain(&info, None)
                .map_err(|e| {
                    log::error!("vkCreateSwapchainKHR failed: {:?}", e);
                    GraupelError::from(e)
                })?
        };
        log::info!(
            "VkSwapchainKHR created. ({} x {}, V-sync: {}, {:?})",
            extent.width,
            extent.height,
            state.enable_vsync,
            present_mode
        );

        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_loader.destroy_swapchain(old_swapchain, None) };
        }

        // detach the retired render targets
        for view in state.image_views.iter() {
            *view.image.lock().unwrap() = None;
            *view.wait_semaphore.lock().unwrap() = vk::Semaphore::null();
            *view.signal_semaphore.lock().unwrap() = vk::Semaphore::null();
        }
        state.image_views.clear();

        let images = unsafe {
            self.swapchain_loader
                .get_swapchain_images(swapchain)
                .map_err(GraupelError::from)?
        };
        for image in images {
            let view_info = vk::ImageViewCreateInfo::builder()
                .format(state.surface_format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::R,
                    g: vk::ComponentSwizzle::G,
                    b: vk::ComponentSwizzle::B,
                    a: vk::ComponentSwizzle::A,
                })
                .subresource_range(
                    vk::ImageSubresourceRange::builder()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1)
                        .build(),
                )
                .view_type(vk::ImageViewType::TYPE_2D)
                .image(image);
            let image_view = unsafe {
                device
                    .create_image_view(&view_info, None)
                    .map_err(GraupelError::from)?
            };

            let mut swapchain_image = Image::from_external(device.clone(), image);
            swapchain_image.set_external_properties(
                state.surface_format.format,
                vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                },
                vk::ImageUsageFlags::COLOR_ATTACHMENT,
            );
            state.image_views.push(ImageView::from_raw(
                device.clone(),
                image_view,
                Some(Arc::new(swapchain_image)),
            ));
        }

        state.swapchain = swapchain;
        state.width = extent.width;
        state.height = extent.height;
        Ok(())
    }

    /// Pick this frame's acquire semaphore, wait until its previous
    /// frame has presented, acquire the next image, and build the
    /// frame's render pass descriptor.
    pub fn setup_frame(&self) -> RenderPassDescriptor {
        let gdevice = &self.queue.gdevice;
        let device = gdevice.vk_device();

        let mut frame = self.frame.lock().unwrap();
        let index = frame_semaphore_index(frame.frame_count, frame.semaphores.len());
        frame.frame_ready = index;

        let wait_value = frame.semaphores[index].frame_index;
        if wait_value > 0 {
            let semaphores = [self.frame_timeline];
            let values = [wait_value];
            let wait_info = vk::SemaphoreWaitInfo::builder()
                .semaphores(&semaphores)
                .values(&values);
            if let Err(e) = unsafe { device.wait_semaphores(&wait_info, u64::MAX) } {
                log::error!("vkWaitSemaphores failed: {:?}", e);
            }
        }

        let acquire_semaphore = frame.semaphores[index].semaphore;
        let (image_index, render_target) = {
            let state = self.state.lock().unwrap();
            let result = unsafe {
                self.swapchain_loader.acquire_next_image(
                    state.swapchain,
                    u64::MAX,
                    acquire_semaphore,
                    vk::Fence::null(),
                )
            };
            let image_index = match result {
                Ok((index, _suboptimal)) => index,
                Err(e) => {
                    log::error!("vkAcquireNextImageKHR failed: {:?}", e);
                    0
                }
            };
            (image_index, state.image_views[image_index as usize].clone())
        };
        frame.frame_index = image_index;

        *render_target.wait_semaphore.lock().unwrap() = acquire_semaphore;
        *render_target.signal_semaphore.lock().unwrap() = acquire_semaphore;

        let descriptor = RenderPassDescriptor {
            color_attachments: vec![RenderPassColorAttachmentDescriptor {
                render_target: Some(render_target),
                clear_color: Color::transparent(),
                load_action: LoadAction::Clear,
                store_action: StoreAction::Store,
            }],
            depth_stencil_attachment: Default::default(),
        };
        frame.render_pass_descriptor = Some(descriptor.clone());
        descriptor
    }

    pub fn current_render_pass_descriptor(&self) -> RenderPassDescriptor {
        if let Some(descriptor) = self.frame.lock().unwrap().render_pass_descriptor.clone() {
            return descriptor;
        }
        self.setup_frame()
    }

    /// Present the acquired image, then signal the frame timeline with
    /// the new frame count. Returns false when presentation failed.
    pub fn present(&self, wait_events: &[Arc<dyn GpuEvent>]) -> bool {
        let mut frame = self.frame.lock().unwrap();
        let frame_ready = frame.frame_ready;
        let frame_semaphore = frame.semaphores[frame_ready].semaphore;

        let present_src = {
            let state = self.state.lock().unwrap();
            state.image_views[frame.frame_index as usize].clone()
        };

        // the presentation engine wants PRESENT_SRC; transition with a
        // tiny one-command submission if the frame left it elsewhere
        let needs_transition = present_src
            .image()
            .map(|i| i.layout() != vk::ImageLayout::PRESENT_SRC_KHR)
            .unwrap_or(false);
        if needs_transition {
            if let Ok(cbuffer) = self.queue.make_command_buffer() {
                let mut encoder = cbuffer.make_copy_command_encoder();
                let image = present_src.image();
                encoder.callback(move |device, cmd, family| {
                    if let Some(image) = image.as_ref() {
                        image.set_layout(
                            vk::ImageLayout::PRESENT_SRC_KHR,
                            vk::AccessFlags2::NONE,
                            vk::PipelineStageFlags2::ALL_COMMANDS,
                            vk::PipelineStageFlags2::ALL_COMMANDS,
                            family,
                            cmd,
                        );
                    }
                    let _ = device;
                });
                encoder.add_wait_semaphore(
                    frame_semaphore,
                    0,
                    vk::PipelineStageFlags2::TOP_OF_PIPE,
                );
                encoder.add_signal_semaphore(
                    frame_semaphore,
                    0,
                    vk::PipelineStageFlags2::ALL_COMMANDS,
                );
                encoder.end_encoding();
                if let Err(e) = cbuffer.commit() {
                    log::error!("present transition submit failed: {:?}", e);
                }
            }
        }

        let mut wait_semaphores: Vec<vk::Semaphore> =
            wait_events.iter().map(|e| e.vk_semaphore()).collect();
        wait_semaphores.push(frame_semaphore);

        let image_indices = [frame.frame_index];
        let (present_result, device_reset) = {
            let state = self.state.lock().unwrap();
            let swapchains = [state.swapchain];
            let present_info = vk::PresentInfoKHR::builder()
                .swapchains(&swapchains)
                .image_indices(&image_indices)
                .wait_semaphores(&wait_semaphores);
            let result = unsafe {
                self.swapchain_loader
                    .queue_present(self.queue.queue, &present_info)
            };
            (result, state.device_reset)
        };

        frame.render_pass_descriptor = None;

        let out_of_date = matches!(present_result, Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        if let Err(e) = present_result {
            log::error!("vkQueuePresentKHR failed: {:?}", e);
        }

        if out_of_date || device_reset {
            self.queue.gdevice.wait_idle();
            self.state.lock().unwrap().device_reset = false;
            if self.update_device().is_err() {
                log::error!("Swapchain::update_device() failed.");
            }
        }

        frame.frame_count += 1;
        let succeeded = matches!(present_result, Ok(_));
        frame.semaphores[frame_ready].frame_index =
            retired_frame_index(frame.frame_count, succeeded);
        if succeeded {
            // signal the timeline with the retired frame count
            let signal_info = vk::SemaphoreSubmitInfo::builder()
                .semaphore(self.frame_timeline)
                .value(frame.frame_count)
                .stage_mask(vk::PipelineStageFlags2::NONE)
                .device_index(0)
                .build();
            let signal_infos = [signal_info];
            let submit = vk::SubmitInfo2::builder()
                .signal_semaphore_infos(&signal_infos)
                .build();
            if let Err(e) = self.queue.submit(&[submit], None) {
                log::error!("frame timeline signal failed: {:?}", e);
            }
        }

        succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_semaphores_rotate_round_robin() {
        let indices: Vec<usize> = (0..7)
            .map(|f| frame_semaphore_index(f, MAX_FRAME_SEMAPHORES))
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn failed_presents_never_block_semaphore_reuse() {
        assert_eq!(retired_frame_index(5, true), 5);
        assert_eq!(retired_frame_index(5, false), 0);
    }

    #[test]
    fn frame_pacing_waits_and_signals_in_lockstep() {
        // drive ten frames through the pacing bookkeeping the way
        // setup_frame and present do: pick the round-robin semaphore,
        // wait on its recorded frame, present, record the new count and
        // signal the timeline with it
        let mut recorded = [0u64; MAX_FRAME_SEMAPHORES];
        let mut frame_count = 0u64;
        let mut timeline_value = 0u64;
        let mut waited = Vec::new();

        for _ in 0..10 {
            let index = frame_semaphore_index(frame_count, recorded.len());
            if recorded[index] > 0 {
                // the wait can only complete if the timeline already
                // reached (or will reach) the recorded frame
                assert!(recorded[index] <= timeline_value);
                waited.push(recorded[index]);
            }

            frame_count += 1;
            recorded[index] = retired_frame_index(frame_count, true);

            // the timeline value signaled on frame N is N
            assert!(frame_count > timeline_value);
            timeline_value = frame_count;
        }

        // the first semaphore reuse (the fourth frame) waits on frame 1
        assert_eq!(waited.first().copied(), Some(1));
        assert_eq!(waited, vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(frame_count, 10);
        assert_eq!(timeline_value, 10);
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        let device = self.queue.gdevice.vk_device();
        let state = self.state.get_mut().unwrap();
        let frame = self.frame.get_mut().unwrap();
        unsafe {
            for view in state.image_views.iter() {
                *view.image.lock().unwrap() = None;
            }
            state.image_views.clear();
            if state.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_loader.destroy_swapchain(state.swapchain, None);
            }
            for fs in frame.semaphores.iter() {
                device.destroy_semaphore(fs.semaphore, None);
            }
            device.destroy_semaphore(self.frame_timeline, None);
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}
