// The graphics device facade
//
// Owns the VkDevice, the per-memory-type pools, the descriptor
// allocator, the pipeline cache and the fence cache with its
// completion thread. Every GPU resource is constructed through here.
// The device must outlive the resources created from it.

pub mod buffer;
pub mod cmdbuffer;
pub mod descriptor;
pub mod encoder;
pub mod image;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod semaphore;
pub mod shader;
pub mod swapchain;
pub mod types;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use ash::vk;

use utils::log;

use crate::{GraupelError, Result};

use buffer::Buffer;
use cmdbuffer::CommandQueue;
use descriptor::{DescriptorAllocator, PoolId, ShaderBindingSet, ShaderBindingSetLayout};
use image::{Image, Sampler, SamplerDescriptor};
use instance::Instance;
use memory::{MemoryBlock, MemoryPool};
use pipeline::{
    ComputePipelineDescriptor, ComputePipelineState, DepthStencilDescriptor, DepthStencilState,
    RenderPipelineDescriptor, RenderPipelineState,
};
use semaphore::{AutoIncrementTimeline, BinarySemaphore, TimelineSemaphore};
use shader::{PipelineReflection, Shader, ShaderModule};
use types::PixelFormat;

/// Where a buffer's memory lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StorageMode {
    /// Host-visible, persistently mapped.
    Shared,
    /// Device-local.
    Private,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CpuCacheMode {
    Default,
    WriteCombined,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TextureType {
    Type1D,
    Type2D,
    Type3D,
}

bitflags::bitflags! {
    pub struct TextureUsage: u32 {
        const COPY_SRC = 1;
        const COPY_DST = 1 << 1;
        const SAMPLED = 1 << 2;
        const STORAGE = 1 << 3;
        const RENDER_TARGET = 1 << 4;
    }
}

#[derive(Copy, Clone, Debug)]
pub struct TextureDescriptor {
    pub texture_type: TextureType,
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mipmap_levels: u32,
    pub array_length: u32,
    pub usage: TextureUsage,
}

type FenceHandler = Box<dyn Fn() + Send + Sync>;

struct FenceCallbacks {
    pending: Vec<(vk::Fence, FenceHandler)>,
    reusable: Vec<vk::Fence>,
    num_fences: u64,
}

struct FenceCompletion {
    mutex: Mutex<FenceCallbacks>,
    cond: Condvar,
    stop: AtomicBool,
}

pub struct GraphicsDevice {
    instance: Arc<Instance>,
    pdev: vk::PhysicalDevice,
    device: ash::Device,
    properties: vk::PhysicalDeviceProperties,
    features: vk::PhysicalDeviceFeatures,
    mem_properties: vk::PhysicalDeviceMemoryProperties,
    pools: Vec<Arc<MemoryPool>>,
    descriptor_allocator: Arc<DescriptorAllocator>,
    pipeline_cache: Mutex<vk::PipelineCache>,
    pipeline_cache_data: Mutex<Vec<u8>>,
    // one pre-created queue per family, handed out on request
    available_queues: Mutex<Vec<(u32, vk::QueueFamilyProperties, vk::Queue)>>,
    fence_completion: Arc<FenceCompletion>,
    fence_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl GraphicsDevice {
    /// Create a logical device on the best physical device the
    /// instance reports, with one queue per queue family and the
    /// Vulkan 1.2/1.3 features the engine depends on.
    pub fn new(instance: Arc<Instance>) -> Result<Arc<GraphicsDevice>> {
        let pdev = instance.select_physical_device()?;

        let queue_families = unsafe {
            instance
                .inst
                .get_physical_device_queue_family_properties(pdev)
        };

        let priorities = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = queue_families
            .iter()
            .enumerate()
            .map(|(index, _)| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(index as u32)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let extension_names = [ash::extensions::khr::Swapchain::name().as_ptr()];

        let features = vk::PhysicalDeviceFeatures::builder()
            .shader_clip_distance(true)
            .vertex_pipeline_stores_and_atomics(true)
            .fragment_stores_and_atomics(true)
            .fill_mode_non_solid(true);
        let mut vulkan12_features = vk::PhysicalDeviceVulkan12Features::builder()
            .timeline_semaphore(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true);
        let mut vulkan13_features = vk::PhysicalDeviceVulkan13Features::builder()
            .dynamic_rendering(true)
            .synchronization2(true);

        let device_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&features)
            .push_next(&mut vulkan12_features)
            .push_next(&mut vulkan13_features);

        let device = unsafe {
            instance
                .inst
                .create_device(pdev, &device_info, None)
                .map_err(|e| {
                    log::error!("vkCreateDevice failed: {:?}", e);
                    GraupelError::VK_NOT_ALL_EXTENSIONS_AVAILABLE
                })?
        };

        let properties = unsafe { instance.inst.get_physical_device_properties(pdev) };
        let features = unsafe { instance.inst.get_physical_device_features(pdev) };
        let mem_properties = unsafe { instance.inst.get_physical_device_memory_properties(pdev) };

        // a memory pool per memory type
        let mut pools = Vec::with_capacity(mem_properties.memory_type_count as usize);
        for index in 0..mem_properties.memory_type_count {
            let mem_type = mem_properties.memory_types[index as usize];
            let heap = mem_properties.memory_heaps[mem_type.heap_index as usize];
            pools.push(Arc::new(MemoryPool::new(
                &device,
                index,
                mem_type.property_flags,
                heap,
            )));
        }

        let available_queues = queue_families
            .iter()
            .enumerate()
            .map(|(index, props)| {
                let queue = unsafe { device.get_device_queue(index as u32, 0) };
                (index as u32, *props, queue)
            })
            .collect();

        let pipeline_cache = {
            let info = vk::PipelineCacheCreateInfo::builder();
            unsafe {
                device.create_pipeline_cache(&info, None).map_err(|e| {
                    log::error!("vkCreatePipelineCache failed: {:?}", e);
                    GraupelError::from(e)
                })?
            }
        };

        let descriptor_allocator = DescriptorAllocator::new(device.clone());

        let gdevice = Arc::new(GraphicsDevice {
            instance,
            pdev,
            device: device.clone(),
            properties,
            features,
            mem_properties,
            pools,
            descriptor_allocator,
            pipeline_cache: Mutex::new(pipeline_cache),
            pipeline_cache_data: Mutex::new(Vec::new()),
            available_queues: Mutex::new(available_queues),
            fence_completion: Arc::new(FenceCompletion {
                mutex: Mutex::new(FenceCallbacks {
                    pending: Vec::new(),
                    reusable: Vec::new(),
                    num_fences: 0,
                }),
                cond: Condvar::new(),
                stop: AtomicBool::new(false),
            }),
            fence_thread: Mutex::new(None),
        });

        // the fence-completion thread is the engine's only spot that
        // polls GPU progress
        let thread_device = device;
        let completion = gdevice.fence_completion.clone();
        let handle = thread::spawn(move || {
            fence_completion_thread(thread_device, completion);
        });
        *gdevice.fence_thread.lock().unwrap() = Some(handle);

        Ok(gdevice)
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.pdev
    }

    pub(crate) fn vk_device(&self) -> &ash::Device {
        &self.device
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn features(&self) -> &vk::PhysicalDeviceFeatures {
        &self.features
    }

    pub(crate) fn pipeline_cache(&self) -> vk::PipelineCache {
        *self.pipeline_cache.lock().unwrap()
    }

    /// Re-serialize the pipeline cache blob after a successful
    /// pipeline build. Persistence of the blob stays with the caller.
    pub(crate) fn save_pipeline_cache(&self) {
        let cache = self.pipeline_cache();
        if cache == vk::PipelineCache::null() {
            log::error!("VkPipelineCache is NULL");
            return;
        }
        match unsafe { self.device.get_pipeline_cache_data(cache) } {
            Ok(data) => *self.pipeline_cache_data.lock().unwrap() = data,
            Err(e) => log::error!("vkGetPipelineCacheData failed: {:?}", e),
        }
    }

    pub fn pipeline_cache_data(&self) -> Vec<u8> {
        self.pipeline_cache_data.lock().unwrap().clone()
    }

    pub fn wait_idle(&self) {
        let _ = unsafe { self.device.device_wait_idle() };
    }

    /// Memory type index satisfying the filter and flags. There is no
    /// way to continue without one, so failure aborts.
    fn find_memory_type_index(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> u32 {
        for index in 0..self.mem_properties.memory_type_count {
            if type_bits & (1 << index) != 0
                && self.mem_properties.memory_types[index as usize]
                    .property_flags
                    .contains(flags)
            {
                return index;
            }
        }
        panic!("no suitable memory type index");
    }

    /// A command queue with the requested capabilities, if a matching
    /// family has a queue left.
    pub fn make_command_queue(
        self: &Arc<Self>,
        flags: vk::QueueFlags,
    ) -> Result<Arc<CommandQueue>> {
        let mut available = self.available_queues.lock().unwrap();
        let position = available
            .iter()
            .position(|(_, props, _)| props.queue_flags.contains(flags));
        match position {
            Some(index) => {
                let (family_index, props, queue) = available.remove(index);
                Ok(CommandQueue::new(self.clone(), queue, family_index, props))
            }
            None => {
                log::error!("no queue family supports {:?}", flags);
                Err(GraupelError::INVALID)
            }
        }
    }

    pub fn make_buffer(
        self: &Arc<Self>,
        length: usize,
        storage_mode: StorageMode,
        cpu_cache_mode: CpuCacheMode,
    ) -> Result<Arc<Buffer>> {
        if length == 0 {
            return Err(GraupelError::VALIDATION_FAILED);
        }

        let info = vk::BufferCreateInfo::builder()
            .size(length as u64)
            .usage(
                vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER
                    | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER
                    | vk::BufferUsageFlags::UNIFORM_BUFFER
                    | vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::INDEX_BUFFER
                    | vk::BufferUsageFlags::VERTEX_BUFFER
                    | vk::BufferUsageFlags::INDIRECT_BUFFER,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            self.device.create_buffer(&info, None).map_err(|e| {
                log::error!("vkCreateBuffer failed: {:?}", e);
                GraupelError::from(e)
            })?
        };
        let reqs = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let mut flags = match storage_mode {
            StorageMode::Shared => vk::MemoryPropertyFlags::HOST_VISIBLE,
            StorageMode::Private => vk::MemoryPropertyFlags::DEVICE_LOCAL,
        };
        if storage_mode == StorageMode::Shared && cpu_cache_mode == CpuCacheMode::Default {
            flags |= vk::MemoryPropertyFlags::HOST_CACHED;
        }

        let type_index = self.find_memory_type_index(reqs.memory_type_bits, flags);
        let pool = self.pools[type_index as usize].clone();
        // block offsets align to the class size, so bump the request
        // until it satisfies the resource alignment
        let memory = match pool.alloc(reqs.size.max(reqs.alignment)) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        if let Err(e) = self.bind_buffer(buffer, &memory) {
            unsafe { self.device.destroy_buffer(buffer, None) };
            pool.dealloc(memory);
            return Err(e);
        }
        Ok(Arc::new(Buffer::new(
            self.device.clone(),
            pool,
            memory,
            buffer,
            &info,
        )))
    }

    fn bind_buffer(&self, buffer: vk::Buffer, memory: &MemoryBlock) -> Result<()> {
        unsafe {
            self.device
                .bind_buffer_memory(buffer, memory.memory(), memory.offset)
                .map_err(|e| {
                    log::error!("vkBindBufferMemory failed: {:?}", e);
                    GraupelError::from(e)
                })
        }
    }

    pub fn make_texture(self: &Arc<Self>, desc: &TextureDescriptor) -> Result<Arc<Image>> {
        let image_type = match desc.texture_type {
            TextureType::Type1D => vk::ImageType::TYPE_1D,
            TextureType::Type2D => vk::ImageType::TYPE_2D,
            TextureType::Type3D => vk::ImageType::TYPE_3D,
        };
        let mut usage = vk::ImageUsageFlags::empty();
        if desc.usage.contains(TextureUsage::COPY_SRC) {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if desc.usage.contains(TextureUsage::COPY_DST) {
            usage |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        if desc.usage.contains(TextureUsage::SAMPLED) {
            usage |= vk::ImageUsageFlags::SAMPLED;
        }
        if desc.usage.contains(TextureUsage::STORAGE) {
            usage |= vk::ImageUsageFlags::STORAGE;
        }
        if desc.usage.contains(TextureUsage::RENDER_TARGET) {
            if desc.pixel_format.is_color_format() {
                usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
            } else {
                usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
            }
        }

        let info = vk::ImageCreateInfo::builder()
            .image_type(image_type)
            .format(desc.pixel_format.to_vk())
            .extent(vk::Extent3D {
                width: desc.width.max(1),
                height: desc.height.max(1),
                depth: desc.depth.max(1),
            })
            .mip_levels(desc.mipmap_levels.max(1))
            .array_layers(desc.array_length.max(1))
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe {
            self.device.create_image(&info, None).map_err(|e| {
                log::error!("vkCreateImage failed: {:?}", e);
                GraupelError::from(e)
            })?
        };

        // honor a dedicated-allocation preference
        let mut dedicated_reqs = vk::MemoryDedicatedRequirements::builder();
        let mut reqs2 = vk::MemoryRequirements2::builder().push_next(&mut dedicated_reqs);
        let req_info = vk::ImageMemoryRequirementsInfo2::builder().image(image);
        unsafe {
            self.device
                .get_image_memory_requirements2(&req_info, &mut reqs2)
        };
        let reqs = reqs2.memory_requirements;
        let prefers_dedicated = dedicated_reqs.prefers_dedicated_allocation != 0
            || dedicated_reqs.requires_dedicated_allocation != 0;

        let type_index =
            self.find_memory_type_index(reqs.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL);
        let pool = self.pools[type_index as usize].clone();
        let alloc_result = if prefers_dedicated {
            pool.alloc_dedicated(reqs.size, image, vk::Buffer::null())
        } else {
            pool.alloc(reqs.size.max(reqs.alignment))
        };
        let memory = match alloc_result {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };
        let bind = unsafe {
            self.device
                .bind_image_memory(image, memory.memory(), memory.offset)
        };
        if let Err(e) = bind {
            log::error!("vkBindImageMemory failed: {:?}", e);
            unsafe { self.device.destroy_image(image, None) };
            pool.dealloc(memory);
            return Err(GraupelError::from(e));
        }

        Ok(Arc::new(Image::new(
            self.device.clone(),
            pool,
            memory,
            image,
            &info,
        )))
    }

    pub fn make_sampler(self: &Arc<Self>, desc: &SamplerDescriptor) -> Result<Arc<Sampler>> {
        let info = desc.to_vk();
        let sampler = unsafe {
            self.device.create_sampler(&info, None).map_err(|e| {
                log::error!("vkCreateSampler failed: {:?}", e);
                GraupelError::from(e)
            })?
        };
        Ok(Arc::new(Sampler::new(self.device.clone(), sampler)))
    }

    pub fn make_semaphore(self: &Arc<Self>) -> Result<Arc<BinarySemaphore>> {
        let info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe {
            self.device
                .create_semaphore(&info, None)
                .map_err(GraupelError::from)?
        };
        Ok(Arc::new(BinarySemaphore::new(self.device.clone(), semaphore)))
    }

    fn make_timeline(&self) -> Result<vk::Semaphore> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
        unsafe {
            self.device
                .create_semaphore(&info, None)
                .map_err(GraupelError::from)
        }
    }

    pub fn make_timeline_semaphore(self: &Arc<Self>) -> Result<Arc<TimelineSemaphore>> {
        let semaphore = self.make_timeline()?;
        Ok(Arc::new(TimelineSemaphore::new(self.device.clone(), semaphore)))
    }

    pub fn make_auto_increment_timeline(self: &Arc<Self>) -> Result<Arc<AutoIncrementTimeline>> {
        let semaphore = self.make_timeline()?;
        Ok(Arc::new(AutoIncrementTimeline::new(
            self.device.clone(),
            semaphore,
        )))
    }

    pub fn make_shader_module(self: &Arc<Self>, shader: &Shader) -> Result<Arc<ShaderModule>> {
        ShaderModule::new(self.device.clone(), shader)
    }

    /// Binding recorder for a declared set layout.
    pub fn make_shader_binding_set(
        self: &Arc<Self>,
        layout: &ShaderBindingSetLayout,
    ) -> Result<Arc<ShaderBindingSet>> {
        let pool_id = PoolId::from_layout(layout);
        if pool_id.mask == 0 {
            return Err(GraupelError::VALIDATION_FAILED);
        }

        let bindings: Vec<vk::DescriptorSetLayoutBinding> = layout
            .bindings
            .iter()
            .map(|binding| {
                let descriptor_type = binding.descriptor_type.to_vk();
                // input attachments are framebuffer loads, so fragment only
                let stage_flags = if descriptor_type == vk::DescriptorType::INPUT_ATTACHMENT {
                    vk::ShaderStageFlags::FRAGMENT
                } else {
                    vk::ShaderStageFlags::ALL
                };
                vk::DescriptorSetLayoutBinding {
                    binding: binding.binding,
                    descriptor_type,
                    descriptor_count: binding.array_length,
                    stage_flags,
                    p_immutable_samplers: std::ptr::null(),
                }
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let set_layout = unsafe {
            self.device
                .create_descriptor_set_layout(&info, None)
                .map_err(|e| {
                    log::error!("vkCreateDescriptorSetLayout failed: {:?}", e);
                    GraupelError::from(e)
                })?
        };

        Ok(Arc::new(ShaderBindingSet::new(
            self.descriptor_allocator.clone(),
            set_layout,
            pool_id,
            layout,
        )))
    }

    pub fn make_render_pipeline_state(
        self: &Arc<Self>,
        desc: &RenderPipelineDescriptor,
        reflection: Option<&mut PipelineReflection>,
    ) -> Result<Arc<RenderPipelineState>> {
        pipeline::make_render_pipeline_state(self, desc, reflection)
    }

    pub fn make_compute_pipeline_state(
        self: &Arc<Self>,
        desc: &ComputePipelineDescriptor,
        reflection: Option<&mut PipelineReflection>,
    ) -> Result<Arc<ComputePipelineState>> {
        pipeline::make_compute_pipeline_state(self, desc, reflection)
    }

    pub fn make_depth_stencil_state(&self, desc: &DepthStencilDescriptor) -> DepthStencilState {
        DepthStencilState::from_descriptor(desc)
    }

    pub fn descriptor_pool_count(&self) -> usize {
        self.descriptor_allocator.num_pools()
    }

    pub fn purge_memory(&self) -> u64 {
        self.pools.iter().map(|p| p.purge()).sum()
    }

    /// A fence from the reuse cache, or a fresh one when the cache is
    /// empty.
    pub(crate) fn fence(&self) -> vk::Fence {
        {
            let mut callbacks = self.fence_completion.mutex.lock().unwrap();
            if let Some(fence) = callbacks.reusable.pop() {
                return fence;
            }
        }
        let info = vk::FenceCreateInfo::builder();
        let fence = unsafe {
            self.device
                .create_fence(&info, None)
                .expect("vkCreateFence failed")
        };
        let mut callbacks = self.fence_completion.mutex.lock().unwrap();
        callbacks.num_fences += 1;
        log::info!("Queue completion: num fences: {}", callbacks.num_fences);
        fence
    }

    pub(crate) fn add_fence_completion_handler(&self, fence: vk::Fence, handler: FenceHandler) {
        debug_assert!(fence != vk::Fence::null());
        let mut callbacks = self.fence_completion.mutex.lock().unwrap();
        callbacks.pending.push((fence, handler));
        self.fence_completion.cond.notify_all();
    }
}

// Polls submitted fences with a zero timeout, reclaims the signaled
// ones (reset is mutually exclusive with handing fences back out), runs
// their completion handlers, and backs off ~2ms when nothing is ready.
fn fence_completion_thread(device: ash::Device, completion: Arc<FenceCompletion>) {
    const FENCE_WAIT_INTERVAL: Duration = Duration::from_millis(2);

    log::info!("Queue completion helper thread started.");

    let mut waiting: Vec<(vk::Fence, FenceHandler)> = Vec::new();
    let mut guard = completion.mutex.lock().unwrap();
    while !completion.stop.load(Ordering::Acquire) {
        waiting.append(&mut guard.pending);

        if !waiting.is_empty() {
            drop(guard);

            let fences: Vec<vk::Fence> = waiting.iter().map(|(f, _)| f).copied().collect();
            let wait = unsafe { device.wait_for_fences(&fences, false, 0) };

            let mut completed: Vec<(vk::Fence, FenceHandler)> = Vec::new();
            let timed_out = match wait {
                Ok(()) | Err(vk::Result::TIMEOUT) => {
                    let mut still_waiting = Vec::with_capacity(waiting.len());
                    for (fence, handler) in waiting.drain(..) {
                        let signaled =
                            unsafe { device.get_fence_status(fence).unwrap_or(false) };
                        if signaled {
                            completed.push((fence, handler));
                        } else {
                            still_waiting.push((fence, handler));
                        }
                    }
                    waiting = still_waiting;

                    if !completed.is_empty() {
                        let ready: Vec<vk::Fence> =
                            completed.iter().map(|(f, _)| f).copied().collect();
                        if let Err(e) = unsafe { device.reset_fences(&ready) } {
                            // a fence that cannot reset cannot be reused
                            panic!("vkResetFences failed: {:?}", e);
                        }
                    }
                    matches!(wait, Err(vk::Result::TIMEOUT))
                }
                Err(e) => {
                    panic!("vkWaitForFences failed: {:?}", e);
                }
            };

            // handlers run outside the lock
            for (_, handler) in completed.iter() {
                handler();
            }

            guard = completion.mutex.lock().unwrap();
            for (fence, _) in completed {
                guard.reusable.push(fence);
            }
            if timed_out {
                let (g, _) = completion
                    .cond
                    .wait_timeout(guard, FENCE_WAIT_INTERVAL)
                    .unwrap();
                guard = g;
            }
        } else {
            guard = completion.cond.wait(guard).unwrap();
        }
    }
    log::info!("Queue completion helper thread finished.");
}

impl Drop for GraphicsDevice {
    fn drop(&mut self) {
        self.wait_idle();

        // stop the completion thread before tearing anything down
        self.fence_completion.stop.store(true, Ordering::Release);
        {
            let _guard = self.fence_completion.mutex.lock().unwrap();
            self.fence_completion.cond.notify_all();
        }
        if let Some(handle) = self.fence_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        let mut callbacks = self.fence_completion.mutex.lock().unwrap();
        debug_assert!(callbacks.pending.is_empty());
        unsafe {
            for (fence, _) in callbacks.pending.drain(..) {
                self.device.destroy_fence(fence, None);
            }
            for fence in callbacks.reusable.drain(..) {
                self.device.destroy_fence(fence, None);
            }
            let cache = *self.pipeline_cache.lock().unwrap();
            if cache != vk::PipelineCache::null() {
                self.device.destroy_pipeline_cache(cache, None);
            }
        }
        drop(callbacks);

        // resources created from this device must already be gone
        unsafe { self.device.destroy_device(None) };
    }
}
