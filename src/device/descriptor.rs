// Descriptor pools, pool chains and binding sets
//
// Pools are grouped into chains keyed by a PoolId fingerprint (the
// per-descriptor-type size histogram of a set layout). Allocation walks
// the chain front to back, growing a doubled pool on exhaustion and
// moving the pool that served the request to the front. Chains live in
// a small fixed number of hash buckets, each under its own mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk;

use utils::log;

use super::buffer::{Buffer, BufferView};
use super::image::{Image, ImageView, Sampler};
use super::shader::ShaderDescriptorType;
use crate::{GraupelError, Result};

// descriptor types a PoolId can count, sorted by raw value
const DESCRIPTOR_TYPES: [vk::DescriptorType; 12] = [
    vk::DescriptorType::SAMPLER,
    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    vk::DescriptorType::SAMPLED_IMAGE,
    vk::DescriptorType::STORAGE_IMAGE,
    vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
    vk::DescriptorType::STORAGE_TEXEL_BUFFER,
    vk::DescriptorType::UNIFORM_BUFFER,
    vk::DescriptorType::STORAGE_BUFFER,
    vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
    vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
    vk::DescriptorType::INPUT_ATTACHMENT,
    vk::DescriptorType::INLINE_UNIFORM_BLOCK_EXT,
];
pub const NUM_DESCRIPTOR_TYPES: usize = DESCRIPTOR_TYPES.len();

const NUM_POOL_CHAIN_BUCKETS: usize = 7;

// release-path cleanup thresholds
const CLEANUP_THRESHOLD_ALL_CHAINS: usize = 2000;
const CLEANUP_THRESHOLD: usize = 100;

fn index_of_descriptor_type(t: vk::DescriptorType) -> usize {
    DESCRIPTOR_TYPES
        .iter()
        .position(|&d| d == t)
        .expect("unknown descriptor type")
}

/// Per-binding slot of a set layout as the engine declares it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ShaderBinding {
    pub binding: u32,
    pub descriptor_type: ShaderDescriptorType,
    pub array_length: u32,
}

#[derive(Clone, Debug, Default)]
pub struct ShaderBindingSetLayout {
    pub bindings: Vec<ShaderBinding>,
}

/// Fingerprint of a set layout: a histogram of descriptor-type counts
/// plus a mask of the nonzero slots. Chains are keyed by this.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PoolId {
    pub mask: u32,
    pub type_size: [u32; NUM_DESCRIPTOR_TYPES],
}

impl PoolId {
    pub fn from_layout(layout: &ShaderBindingSetLayout) -> PoolId {
        let mut id = PoolId::default();
        for binding in layout.bindings.iter() {
            let index = index_of_descriptor_type(binding.descriptor_type.to_vk());
            id.type_size[index] += binding.array_length;
        }
        for i in 0..NUM_DESCRIPTOR_TYPES {
            if id.type_size[i] != 0 {
                id.mask |= 1 << i;
            }
        }
        id
    }

    /// FNV-1a over the mask and the histogram, for bucket selection.
    pub fn hash(&self) -> u32 {
        let mut h: u32 = 0x811c9dc5;
        let mut eat = |v: u32| {
            for b in v.to_le_bytes().iter() {
                h ^= *b as u32;
                h = h.wrapping_mul(0x01000193);
            }
        };
        eat(self.mask);
        for v in self.type_size.iter() {
            eat(*v);
        }
        h
    }
}

impl PartialOrd for PoolId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PoolId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        if self.mask == other.mask {
            for i in 0..NUM_DESCRIPTOR_TYPES {
                if self.type_size[i] != other.type_size[i] {
                    return self.type_size[i].cmp(&other.type_size[i]);
                }
            }
        }
        self.mask.cmp(&other.mask)
    }
}

pub struct DescriptorPool {
    device: ash::Device,
    pub pool_id: PoolId,
    pub max_sets: u32,
    pub pool: vk::DescriptorPool,
    num_allocated_sets: AtomicU32,
}

impl DescriptorPool {
    pub fn num_allocated_sets(&self) -> u32 {
        self.num_allocated_sets.load(Ordering::SeqCst)
    }

    fn allocate(&self, layout: vk::DescriptorSetLayout) -> Option<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        match unsafe { self.device.allocate_descriptor_sets(&info) } {
            Ok(sets) => {
                self.num_allocated_sets.fetch_add(1, Ordering::SeqCst);
                Some(sets[0])
            }
            Err(_) => None,
        }
    }

    fn release(&self, set: vk::DescriptorSet) {
        let sets = [set];
        if let Err(e) = unsafe { self.device.free_descriptor_sets(self.pool, &sets) } {
            log::error!("vkFreeDescriptorSets failed: {:?}", e);
        }
        self.num_allocated_sets.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe { self.device.destroy_descriptor_pool(self.pool, None) };
    }
}

struct DescriptorPoolChain {
    pool_id: PoolId,
    max_sets: u32,
    pools: Vec<Arc<DescriptorPool>>,
}

impl DescriptorPoolChain {
    fn new(pool_id: PoolId) -> Self {
        debug_assert!(pool_id.mask != 0);
        Self {
            pool_id,
            max_sets: 0,
            pools: Vec::new(),
        }
    }

    fn allocate(
        &mut self,
        device: &ash::Device,
        layout: vk::DescriptorSetLayout,
    ) -> Option<(vk::DescriptorSet, Arc<DescriptorPool>)> {
        for index in 0..self.pools.len() {
            if let Some(set) = self.pools[index].allocate(layout) {
                let pool = self.pools[index].clone();
                if index != 0 {
                    // bring the pool to the front
                    self.pools.remove(index);
                    self.pools.insert(0, pool.clone());
                }
                return Some((set, pool));
            }
        }
        let pool = self.add_new_pool(device)?;
        pool.allocate(layout).map(|set| (set, pool))
    }

    /// Advance the chain to its next pool size (doubled plus one) and
    /// compute the per-type pool sizes the new pool needs. Split from
    /// `add_new_pool` so the growth policy runs without a device.
    fn grow(&mut self) -> Vec<vk::DescriptorPoolSize> {
        self.max_sets = self.max_sets * 2 + 1;

        let mut pool_sizes = Vec::with_capacity(NUM_DESCRIPTOR_TYPES);
        for i in 0..NUM_DESCRIPTOR_TYPES {
            if self.pool_id.type_size[i] > 0 {
                pool_sizes.push(vk::DescriptorPoolSize {
                    ty: DESCRIPTOR_TYPES[i],
                    descriptor_count: self.pool_id.type_size[i] * self.max_sets,
                });
            }
        }
        pool_sizes
    }

    fn add_new_pool(&mut self, device: &ash::Device) -> Option<Arc<DescriptorPool>> {
        let pool_sizes = self.grow();
        debug_assert!(!pool_sizes.is_empty());

        let info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .pool_sizes(&pool_sizes)
            .max_sets(self.max_sets);

        let pool = match unsafe { device.create_descriptor_pool(&info, None) } {
            Ok(p) => p,
            Err(e) => {
                log::error!("vkCreateDescriptorPool failed: {:?}", e);
                return None;
            }
        };

        let dp = Arc::new(DescriptorPool {
            device: device.clone(),
            pool_id: self.pool_id,
            max_sets: self.max_sets,
            pool,
            num_allocated_sets: AtomicU32::new(0),
        });
        self.pools.insert(0, dp.clone());
        Some(dp)
    }

    fn descriptor_pool_count(&self) -> usize {
        self.pools.len()
    }

    fn num_allocated_sets(&self) -> u32 {
        self.pools.iter().map(|p| p.num_allocated_sets()).sum()
    }

    /// Drop empty pools, keeping every pool with live sets plus the
    /// single largest empty pool for reuse. Returns the number of
    /// pools retained.
    fn cleanup(&mut self) -> usize {
        let stats: Vec<(u32, u32)> = self
            .pools
            .iter()
            .map(|p| (p.num_allocated_sets(), p.max_sets))
            .collect();
        let retained = cleanup_retention(&stats);
        let mut index = 0;
        self.pools.retain(|_| {
            let keep = retained.contains(&index);
            index += 1;
            keep
        });
        self.pools.len()
    }
}

// Indices of the pools cleanup keeps: all non-empty pools and the
// largest empty one.
fn cleanup_retention(stats: &[(u32, u32)]) -> Vec<usize> {
    let mut retained = Vec::with_capacity(stats.len());
    let mut largest_empty: Option<usize> = None;
    for (i, &(allocated, max_sets)) in stats.iter().enumerate() {
        if allocated > 0 {
            retained.push(i);
        } else {
            largest_empty = match largest_empty {
                Some(j) if stats[j].1 >= max_sets => Some(j),
                _ => Some(i),
            };
        }
    }
    if let Some(j) = largest_empty {
        retained.push(j);
    }
    retained
}

struct PoolChainBucket {
    chains: Mutex<HashMap<PoolId, DescriptorPoolChain>>,
}

/// Owner of every descriptor pool on the device.
pub struct DescriptorAllocator {
    device: ash::Device,
    buckets: Vec<PoolChainBucket>,
}

impl DescriptorAllocator {
    pub(crate) fn new(device: ash::Device) -> Arc<DescriptorAllocator> {
        let buckets = (0..NUM_POOL_CHAIN_BUCKETS)
            .map(|_| PoolChainBucket {
                chains: Mutex::new(HashMap::new()),
            })
            .collect();
        Arc::new(DescriptorAllocator { device, buckets })
    }

    fn bucket(&self, pool_id: &PoolId) -> &PoolChainBucket {
        &self.buckets[pool_id.hash() as usize % NUM_POOL_CHAIN_BUCKETS]
    }

    pub(crate) fn allocate(
        self: &Arc<Self>,
        layout: vk::DescriptorSetLayout,
        pool_id: &PoolId,
        bindings: Vec<DescriptorBinding>,
    ) -> Result<DescriptorSet> {
        if pool_id.mask == 0 {
            return Err(GraupelError::VALIDATION_FAILED);
        }
        let mut chains = self.bucket(pool_id).chains.lock().unwrap();
        let chain = chains
            .entry(*pool_id)
            .or_insert_with(|| DescriptorPoolChain::new(*pool_id));
        match chain.allocate(&self.device, layout) {
            Some((set, pool)) => Ok(DescriptorSet {
                allocator: self.clone(),
                descriptor_set: set,
                pool,
                bindings,
                flushed: false,
            }),
            None => {
                log::error!("descriptor set allocation failed");
                Err(GraupelError::RESOURCE_CREATION_FAILED)
            }
        }
    }

    fn release(&self, pool: &Arc<DescriptorPool>, set: vk::DescriptorSet) {
        let pool_id = pool.pool_id;
        let mut chains = self.bucket(&pool_id).chains.lock().unwrap();
        pool.release(set);

        let num_chain_pools: usize = chains.values().map(|c| c.descriptor_pool_count()).sum();
        if num_chain_pools > CLEANUP_THRESHOLD_ALL_CHAINS {
            // prune chains with no live sets entirely
            chains.retain(|_, chain| chain.num_allocated_sets() > 0);
        } else if let Some(chain) = chains.get_mut(&pool_id) {
            if chain.descriptor_pool_count() > CLEANUP_THRESHOLD && chain.cleanup() == 0 {
                chains.remove(&pool_id);
            }
        }
    }

    pub fn num_pools(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| {
                b.chains
                    .lock()
                    .unwrap()
                    .values()
                    .map(|c| c.descriptor_pool_count())
                    .sum::<usize>()
            })
            .sum()
    }
}

/// Buffer range bound into a set.
#[derive(Clone)]
pub struct BufferBindingInfo {
    pub buffer: Arc<Buffer>,
    pub offset: u64,
    pub length: u64,
}

/// One binding slot's recorded update: the resources held alive plus
/// the raw descriptor infos flushed into the set on first use.
#[derive(Clone)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub descriptor_count: u32,

    // hold resource object ownership
    pub buffer_views: Vec<Arc<BufferView>>,
    pub image_views: Vec<Arc<ImageView>>,
    pub samplers: Vec<Arc<Sampler>>,

    // descriptor infos for the pending write
    pub image_infos: Vec<vk::DescriptorImageInfo>,
    pub buffer_infos: Vec<vk::DescriptorBufferInfo>,
    pub texel_buffer_views: Vec<vk::BufferView>,

    pub value_set: bool,
}

impl Default for DescriptorBinding {
    fn default() -> Self {
        Self {
            binding: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 0,
            buffer_views: Vec::new(),
            image_views: Vec::new(),
            samplers: Vec::new(),
            image_infos: Vec::new(),
            buffer_infos: Vec::new(),
            texel_buffer_views: Vec::new(),
            value_set: false,
        }
    }
}

impl DescriptorBinding {
    fn clear_payload(&mut self) {
        self.buffer_views.clear();
        self.image_views.clear();
        self.samplers.clear();
        self.image_infos.clear();
        self.buffer_infos.clear();
        self.texel_buffer_views.clear();
    }
}

pub type ImageLayoutMap = HashMap<vk::Image, (Arc<Image>, vk::ImageLayout)>;
pub type ImageViewLayoutMap = HashMap<vk::ImageView, vk::ImageLayout>;

/// Recording surface for one descriptor set's worth of bindings,
/// bound to a VkDescriptorSetLayout created from the declared layout.
pub struct ShaderBindingSet {
    allocator: Arc<DescriptorAllocator>,
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pool_id: PoolId,
    bindings: Mutex<Vec<DescriptorBinding>>,
}

impl ShaderBindingSet {
    pub(crate) fn new(
        allocator: Arc<DescriptorAllocator>,
        descriptor_set_layout: vk::DescriptorSetLayout,
        pool_id: PoolId,
        layout: &ShaderBindingSetLayout,
    ) -> ShaderBindingSet {
        let bindings = layout
            .bindings
            .iter()
            .map(|b| DescriptorBinding {
                binding: b.binding,
                descriptor_type: b.descriptor_type.to_vk(),
                descriptor_count: b.array_length,
                ..DescriptorBinding::default()
            })
            .collect();
        ShaderBindingSet {
            allocator,
            descriptor_set_layout,
            pool_id,
            bindings: Mutex::new(bindings),
        }
    }

    fn with_binding<F>(&self, binding: u32, f: F)
    where
        F: FnOnce(&mut DescriptorBinding),
    {
        let mut bindings = self.bindings.lock().unwrap();
        match bindings.iter_mut().find(|b| b.binding == binding) {
            Some(b) => f(b),
            None => log::error!("binding {} not found in set layout", binding),
        }
    }

    pub fn set_buffer(&self, binding: u32, buffer: Arc<Buffer>, offset: u64, length: u64) {
        self.set_buffer_array(
            binding,
            &[BufferBindingInfo {
                buffer,
                offset,
                length,
            }],
        );
    }

    pub fn set_buffer_array(&self, binding: u32, buffers: &[BufferBindingInfo]) {
        self.with_binding(binding, |b| {
            b.clear_payload();
            for info in buffers.iter() {
                if info.offset + info.length > info.buffer.length() as u64 {
                    log::error!(
                        "buffer binding range out of bounds: {} + {} > {}",
                        info.offset,
                        info.length,
                        info.buffer.length()
                    );
                    continue;
                }
                b.buffer_infos.push(vk::DescriptorBufferInfo {
                    buffer: info.buffer.buffer,
                    offset: info.offset,
                    range: info.length,
                });
                b.buffer_views.push(BufferView::untyped(info.buffer.clone()));
            }
            b.value_set = !b.buffer_infos.is_empty();
        });
    }

    pub fn set_texture(&self, binding: u32, texture: Arc<ImageView>) {
        self.set_texture_array(binding, &[texture]);
    }

    pub fn set_texture_array(&self, binding: u32, textures: &[Arc<ImageView>]) {
        self.with_binding(binding, |b| {
            // keep previously recorded samplers when this is a
            // combined image sampler slot
            let samplers: Vec<vk::Sampler> =
                b.image_infos.iter().map(|i| i.sampler).collect();
            b.image_infos.clear();
            b.image_views.clear();
            for (i, view) in textures.iter().enumerate() {
                let layout = view
                    .image()
                    .map(|img| img.layout())
                    .unwrap_or(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
                b.image_infos.push(vk::DescriptorImageInfo {
                    sampler: samplers.get(i).copied().unwrap_or(vk::Sampler::null()),
                    image_view: view.image_view,
                    image_layout: layout,
                });
                b.image_views.push(view.clone());
            }
            b.value_set = !b.image_infos.is_empty();
        });
    }

    pub fn set_sampler(&self, binding: u32, sampler: Arc<Sampler>) {
        self.set_sampler_array(binding, &[sampler]);
    }

    pub fn set_sampler_array(&self, binding: u32, samplers: &[Arc<Sampler>]) {
        self.with_binding(binding, |b| {
            if b.image_infos.len() < samplers.len() {
                b.image_infos.resize(
                    samplers.len(),
                    vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: vk::ImageView::null(),
                        image_layout: vk::ImageLayout::UNDEFINED,
                    },
                );
            }
            b.samplers.clear();
            for (i, sampler) in samplers.iter().enumerate() {
                b.image_infos[i].sampler = sampler.sampler;
                b.samplers.push(sampler.clone());
            }
            b.value_set = true;
        });
    }

    pub fn set_texel_buffer_view(&self, binding: u32, view: Arc<BufferView>) {
        self.with_binding(binding, |b| {
            b.clear_payload();
            if view.buffer_view == vk::BufferView::null() {
                log::error!("texel buffer binding requires a typed buffer view");
                return;
            }
            b.texel_buffer_views.push(view.buffer_view);
            b.buffer_views.push(view.clone());
            b.value_set = true;
        });
    }

    /// Snapshot the recorded bindings into a freshly allocated
    /// descriptor set.
    pub fn make_descriptor_set(&self) -> Result<DescriptorSet> {
        let bindings = self.bindings.lock().unwrap().clone();
        self.allocator
            .allocate(self.descriptor_set_layout, &self.pool_id, bindings)
    }
}

impl Drop for ShaderBindingSet {
    fn drop(&mut self) {
        unsafe {
            self.allocator
                .device
                .destroy_descriptor_set_layout(self.descriptor_set_layout, None)
        };
    }
}

/// An allocated VkDescriptorSet carrying its recorded updates. The
/// writes flush once, the first time an encoder binds the set.
pub struct DescriptorSet {
    allocator: Arc<DescriptorAllocator>,
    pub descriptor_set: vk::DescriptorSet,
    pool: Arc<DescriptorPool>,
    pub bindings: Vec<DescriptorBinding>,
    flushed: bool,
}

impl DescriptorSet {
    /// Desired image layouts per descriptor type, aggregated so an
    /// image used in more than one way lands in GENERAL.
    pub fn collect_image_view_layouts(
        &self,
        image_layouts: &mut ImageLayoutMap,
        view_layouts: &mut ImageViewLayoutMap,
    ) {
        for binding in self.bindings.iter() {
            let desired = match binding.descriptor_type {
                vk::DescriptorType::STORAGE_IMAGE => vk::ImageLayout::GENERAL,
                vk::DescriptorType::SAMPLED_IMAGE
                | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
                | vk::DescriptorType::INPUT_ATTACHMENT => {
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                }
                _ => continue,
            };
            for view in binding.image_views.iter() {
                if let Some(image) = view.image() {
                    let entry = image_layouts
                        .entry(image.image)
                        .or_insert_with(|| (image.clone(), desired));
                    if entry.1 != desired {
                        entry.1 = vk::ImageLayout::GENERAL;
                    }
                    view_layouts.insert(view.image_view, entry.1);
                }
            }
        }
    }

    /// Patch recorded image infos with the layouts the barriers will
    /// leave the images in.
    pub fn update_image_view_layouts(&mut self, view_layouts: &ImageViewLayoutMap) {
        for binding in self.bindings.iter_mut() {
            let views: Vec<vk::ImageView> =
                binding.image_views.iter().map(|v| v.image_view).collect();
            for (i, info) in binding.image_infos.iter_mut().enumerate() {
                if let Some(view) = views.get(i) {
                    if let Some(layout) = view_layouts.get(view) {
                        if info.image_layout != *layout {
                            info.image_layout = *layout;
                            self.flushed = false;
                        }
                    }
                }
            }
        }
    }

    /// Write the recorded updates into the set. Runs once per recording
    /// unless the recorded state changed since.
    pub fn flush(&mut self) {
        if self.flushed {
            return;
        }
        let mut writes = Vec::with_capacity(self.bindings.len());
        for binding in self.bindings.iter() {
            if !binding.value_set {
                continue;
            }
            let mut write = vk::WriteDescriptorSet::builder()
                .dst_set(self.descriptor_set)
                .dst_binding(binding.binding)
                .descriptor_type(binding.descriptor_type);
            if !binding.image_infos.is_empty() {
                write = write.image_info(&binding.image_infos);
            }
            if !binding.buffer_infos.is_empty() {
                write = write.buffer_info(&binding.buffer_infos);
            }
            if !binding.texel_buffer_views.is_empty() {
                write = write.texel_buffer_view(&binding.texel_buffer_views);
            }
            writes.push(write.build());
        }
        if !writes.is_empty() {
            unsafe { self.allocator.device.update_descriptor_sets(&writes, &[]) };
        }
        self.flushed = true;
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        self.allocator.release(&self.pool, self.descriptor_set);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout_of(bindings: &[(u32, ShaderDescriptorType, u32)]) -> ShaderBindingSetLayout {
        ShaderBindingSetLayout {
            bindings: bindings
                .iter()
                .map(|&(binding, descriptor_type, array_length)| ShaderBinding {
                    binding,
                    descriptor_type,
                    array_length,
                })
                .collect(),
        }
    }

    #[test]
    fn pool_id_counts_descriptors_by_type() {
        let id = PoolId::from_layout(&layout_of(&[
            (0, ShaderDescriptorType::UniformBuffer, 1),
            (1, ShaderDescriptorType::UniformBuffer, 2),
            (2, ShaderDescriptorType::TextureSampler, 4),
        ]));
        let ub = index_of_descriptor_type(vk::DescriptorType::UNIFORM_BUFFER);
        let cis = index_of_descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(id.type_size[ub], 3);
        assert_eq!(id.type_size[cis], 4);
        assert_eq!(id.mask, (1 << ub) | (1 << cis));
    }

    #[test]
    fn equal_layouts_produce_equal_ids() {
        let a = PoolId::from_layout(&layout_of(&[
            (0, ShaderDescriptorType::UniformBuffer, 1),
            (1, ShaderDescriptorType::Texture, 2),
        ]));
        // binding slots differ, histogram does not
        let b = PoolId::from_layout(&layout_of(&[
            (3, ShaderDescriptorType::Texture, 2),
            (7, ShaderDescriptorType::UniformBuffer, 1),
        ]));
        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.cmp(&b), std::cmp::Ordering::Equal);
    }

    #[test]
    fn different_layouts_order_consistently() {
        let a = PoolId::from_layout(&layout_of(&[(0, ShaderDescriptorType::UniformBuffer, 1)]));
        let b = PoolId::from_layout(&layout_of(&[(0, ShaderDescriptorType::UniformBuffer, 2)]));
        assert!(a < b || b < a);
        assert_ne!(a, b);
    }

    #[test]
    fn pool_growth_doubles_plus_one() {
        // exhausting a pool makes the chain grow the next one through
        // grow(); walk a real chain through five generations
        let id = PoolId::from_layout(&layout_of(&[
            (0, ShaderDescriptorType::UniformBuffer, 2),
            (1, ShaderDescriptorType::TextureSampler, 1),
        ]));
        let mut chain = DescriptorPoolChain::new(id);
        assert_eq!(chain.max_sets, 0);

        let ub = index_of_descriptor_type(vk::DescriptorType::UNIFORM_BUFFER);
        let mut progression = Vec::new();
        for _ in 0..5 {
            let pool_sizes = chain.grow();
            progression.push(chain.max_sets);

            // every nonzero histogram slot scales with the new max_sets
            assert_eq!(pool_sizes.len(), 2);
            let ub_size = pool_sizes
                .iter()
                .find(|p| p.ty == vk::DescriptorType::UNIFORM_BUFFER)
                .unwrap();
            assert_eq!(ub_size.descriptor_count, id.type_size[ub] * chain.max_sets);
        }
        assert_eq!(progression, vec![1, 3, 7, 15, 31]);
    }

    #[test]
    fn cleanup_keeps_nonempty_pools_and_largest_empty() {
        // (allocated, max_sets)
        let retained = cleanup_retention(&[(0, 1), (2, 3), (0, 7), (1, 15), (0, 3)]);
        assert!(retained.contains(&1)); // live sets
        assert!(retained.contains(&3)); // live sets
        assert!(retained.contains(&2)); // the largest empty pool
        assert!(!retained.contains(&0));
        assert!(!retained.contains(&4));
    }

    #[test]
    fn cleanup_of_all_empty_pools_keeps_only_the_largest() {
        let retained = cleanup_retention(&[(0, 1), (0, 3), (0, 7)]);
        assert_eq!(retained, vec![2]);
    }
}
