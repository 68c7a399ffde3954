// Size-classed sub-allocation of VkDeviceMemory
//
// One MemoryPool exists per memory type. A pool owns an ordered list of
// allocators with power-of-two block sizes; each allocator carves its
// chunks (one VkDeviceMemory each) into fixed-size blocks kept on a
// free list. Requests above the largest class, and resources that want
// dedicated memory, become single-block chunks tracked separately.

use std::os::raw::c_void;
use std::ptr;
use std::sync::{Arc, Mutex};

use ash::vk;

use utils::log;

use crate::{GraupelError, Result};

// block size / blocks per chunk for each size class
const CHUNK_SIZE_CLASSES: [(u64, u64); 16] = [
    (1024, 512),
    (2048, 512),
    (4096, 512),
    (8192, 512),
    (16384, 256),
    (32768, 256),
    (65536, 256),
    (131072, 256),
    (262144, 256),
    (524288, 256),
    (1048576, 128),
    (2097152, 64),
    (4194304, 32),
    (8388608, 16),
    (16777216, 8),
    (33554432, 4),
];

// Smallest size class able to serve `size` (also resolves the class a
// block of that size came from); None falls to direct allocation.
fn size_class_index(size: u64) -> Option<usize> {
    let index = CHUNK_SIZE_CLASSES.partition_point(|&(block_size, _)| block_size < size);
    if index < CHUNK_SIZE_CLASSES.len() {
        Some(index)
    } else {
        None
    }
}

/// One VkDeviceMemory, optionally carved into blocks. Host-visible
/// chunks stay persistently mapped for their whole lifetime.
pub struct MemoryChunk {
    device: ash::Device,
    pub memory: vk::DeviceMemory,
    pub property_flags: vk::MemoryPropertyFlags,
    pub chunk_size: u64,
    pub block_size: u64,
    pub total_blocks: u64,
    pub dedicated: bool,
    // set when the chunk belongs to a size-class allocator
    pooled: bool,
    mapped: *mut c_void,
    free_blocks: Mutex<Vec<u64>>,
}

unsafe impl Send for MemoryChunk {}
unsafe impl Sync for MemoryChunk {}

impl MemoryChunk {
    fn new(
        device: &ash::Device,
        memory: vk::DeviceMemory,
        property_flags: vk::MemoryPropertyFlags,
        chunk_size: u64,
        block_size: u64,
        total_blocks: u64,
        dedicated: bool,
        pooled: bool,
    ) -> Arc<MemoryChunk> {
        let mut mapped = ptr::null_mut();
        if property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            mapped = unsafe {
                match device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) {
                    Ok(p) => p,
                    Err(e) => {
                        log::error!("vkMapMemory failed: {:?}", e);
                        ptr::null_mut()
                    }
                }
            };
        }

        let mut free_blocks = Vec::with_capacity(total_blocks as usize);
        let mut offset = 0;
        for _ in 0..total_blocks {
            free_blocks.push(offset);
            offset += block_size;
        }

        Arc::new(MemoryChunk {
            device: device.clone(),
            memory,
            property_flags,
            chunk_size,
            block_size,
            total_blocks,
            dedicated,
            pooled,
            mapped,
            free_blocks: Mutex::new(free_blocks),
        })
    }

    fn num_free_blocks(&self) -> u64 {
        self.free_blocks.lock().unwrap().len() as u64
    }

    fn pop(&self) -> Option<u64> {
        self.free_blocks.lock().unwrap().pop()
    }

    fn push(&self, offset: u64) {
        let mut free = self.free_blocks.lock().unwrap();
        debug_assert!(offset < self.chunk_size);
        free.push(offset);
        debug_assert!(free.len() as u64 <= self.total_blocks);
    }

    pub fn mapped_ptr(&self) -> *mut c_void {
        self.mapped
    }

    /// Flush a mapped range back to the device. Only applies to
    /// host-coherent chunks; anything else is a silent no-op.
    pub fn flush(&self, offset: u64, size: u64) -> bool {
        if self.mapped.is_null()
            || !self
                .property_flags
                .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return false;
        }
        if offset >= self.chunk_size {
            log::error!("MemoryChunk::flush out of range");
            return false;
        }
        let size = if size == vk::WHOLE_SIZE {
            size
        } else {
            size.min(self.chunk_size - offset)
        };
        let range = vk::MappedMemoryRange::builder()
            .memory(self.memory)
            .offset(offset)
            .size(size)
            .build();
        match unsafe { self.device.flush_mapped_memory_ranges(&[range]) } {
            Ok(()) => true,
            Err(e) => {
                log::error!("vkFlushMappedMemoryRanges failed: {:?}", e);
                false
            }
        }
    }

    pub fn invalidate(&self, offset: u64, size: u64) -> bool {
        if self.mapped.is_null()
            || !self
                .property_flags
                .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return false;
        }
        if offset >= self.chunk_size {
            log::error!("MemoryChunk::invalidate out of range");
            return false;
        }
        let size = if size == vk::WHOLE_SIZE {
            size
        } else {
            size.min(self.chunk_size - offset)
        };
        let range = vk::MappedMemoryRange::builder()
            .memory(self.memory)
            .offset(offset)
            .size(size)
            .build();
        match unsafe { self.device.invalidate_mapped_memory_ranges(&[range]) } {
            Ok(()) => true,
            Err(e) => {
                log::error!("vkInvalidateMappedMemoryRanges failed: {:?}", e);
                false
            }
        }
    }
}

impl Drop for MemoryChunk {
    fn drop(&mut self) {
        unsafe {
            if !self.mapped.is_null() {
                self.device.unmap_memory(self.memory);
            }
            self.device.free_memory(self.memory, None);
        }
    }
}

/// A sub-range of a chunk handed out to a resource.
#[derive(Clone)]
pub struct MemoryBlock {
    pub chunk: Arc<MemoryChunk>,
    pub offset: u64,
    pub size: u64,
}

impl MemoryBlock {
    pub fn memory(&self) -> vk::DeviceMemory {
        self.chunk.memory
    }

    /// Persistently-mapped pointer to this block, if host visible.
    pub fn mapped_ptr(&self) -> *mut u8 {
        let base = self.chunk.mapped_ptr();
        if base.is_null() {
            return ptr::null_mut();
        }
        unsafe { (base as *mut u8).add(self.offset as usize) }
    }

    pub fn flush(&self) -> bool {
        self.chunk.flush(self.offset, self.size)
    }

    pub fn invalidate(&self) -> bool {
        self.chunk.invalidate(self.offset, self.size)
    }
}

struct MemoryAllocator {
    block_size: u64,
    blocks_per_chunk: u64,
    chunks: Vec<Arc<MemoryChunk>>,
    memory_in_use: u64,
}

impl MemoryAllocator {
    fn alloc(
        &mut self,
        device: &ash::Device,
        memory_type_index: u32,
        property_flags: vk::MemoryPropertyFlags,
        size: u64,
    ) -> Result<MemoryBlock> {
        debug_assert!(size <= self.block_size);

        for chunk in self.chunks.iter() {
            if let Some(offset) = chunk.pop() {
                self.memory_in_use += size;
                return Ok(MemoryBlock {
                    chunk: chunk.clone(),
                    offset,
                    size,
                });
            }
        }

        // every chunk is exhausted, grow by one
        let chunk_size = self.block_size * self.blocks_per_chunk;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(chunk_size)
            .memory_type_index(memory_type_index);
        let memory = unsafe {
            device.allocate_memory(&alloc_info, None).map_err(|e| {
                log::error!("vkAllocateMemory failed: {:?}", e);
                GraupelError::from(e)
            })?
        };

        let chunk = MemoryChunk::new(
            device,
            memory,
            property_flags,
            chunk_size,
            self.block_size,
            self.blocks_per_chunk,
            false,
            true,
        );
        self.chunks.push(chunk.clone());
        let offset = chunk.pop().expect("fresh chunk has free blocks");
        self.memory_in_use += size;
        Ok(MemoryBlock {
            chunk,
            offset,
            size,
        })
    }

    fn dealloc(&mut self, block: &MemoryBlock) {
        let chunk = &block.chunk;
        debug_assert!(chunk.block_size == self.block_size);
        debug_assert!(self.memory_in_use >= block.size);
        self.memory_in_use -= block.size;
        chunk.push(block.offset);

        if chunk.num_free_blocks() == chunk.total_blocks {
            let free_blocks: u64 = self.chunks.iter().map(|c| c.num_free_blocks()).sum();
            if free_blocks > self.blocks_per_chunk + (self.blocks_per_chunk >> 2) {
                let target = Arc::as_ptr(chunk);
                self.chunks.retain(|c| Arc::as_ptr(c) != target);
            }
        }
        // most-used chunks first, so allocations pack tightly
        self.chunks
            .sort_by_key(|c| c.num_free_blocks());
    }

    fn purge(&mut self) -> u64 {
        let mut purged = 0;
        self.chunks.retain(|c| {
            if c.num_free_blocks() == c.total_blocks {
                purged += c.chunk_size;
                false
            } else {
                true
            }
        });
        purged
    }

    fn num_allocations(&self) -> u64 {
        self.chunks
            .iter()
            .map(|c| c.total_blocks - c.num_free_blocks())
            .sum()
    }

    fn total_memory_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.chunk_size).sum()
    }
}

/// All allocations for one memory type.
pub struct MemoryPool {
    device: ash::Device,
    pub memory_type_index: u32,
    pub property_flags: vk::MemoryPropertyFlags,
    pub heap: vk::MemoryHeap,
    allocators: Vec<Mutex<MemoryAllocator>>,
    dedicated: Mutex<Vec<Arc<MemoryChunk>>>,
}

impl MemoryPool {
    pub fn new(
        device: &ash::Device,
        memory_type_index: u32,
        property_flags: vk::MemoryPropertyFlags,
        heap: vk::MemoryHeap,
    ) -> MemoryPool {
        let allocators = CHUNK_SIZE_CLASSES
            .iter()
            .map(|&(block_size, blocks_per_chunk)| {
                Mutex::new(MemoryAllocator {
                    block_size,
                    blocks_per_chunk,
                    chunks: Vec::new(),
                    memory_in_use: 0,
                })
            })
            .collect();

        MemoryPool {
            device: device.clone(),
            memory_type_index,
            property_flags,
            heap,
            allocators,
            dedicated: Mutex::new(Vec::new()),
        }
    }

    /// Allocate from the smallest size class that fits; anything above
    /// the largest class gets its own VkDeviceMemory.
    pub fn alloc(&self, size: u64) -> Result<MemoryBlock> {
        debug_assert!(size > 0);
        if let Some(index) = size_class_index(size) {
            let mut allocator = self.allocators[index].lock().unwrap();
            debug_assert!(allocator.block_size >= size);
            return allocator.alloc(
                &self.device,
                self.memory_type_index,
                self.property_flags,
                size,
            );
        }

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(self.memory_type_index);
        let memory = unsafe {
            self.device.allocate_memory(&alloc_info, None).map_err(|e| {
                log::error!("vkAllocateMemory failed: {:?}", e);
                GraupelError::from(e)
            })?
        };
        let chunk = MemoryChunk::new(
            &self.device,
            memory,
            self.property_flags,
            size,
            size,
            1,
            false,
            false,
        );
        self.dedicated.lock().unwrap().push(chunk.clone());
        let offset = chunk.pop().expect("fresh chunk has a free block");
        Ok(MemoryBlock {
            chunk,
            offset,
            size,
        })
    }

    /// Dedicated allocation bound to exactly one image or buffer.
    pub fn alloc_dedicated(
        &self,
        size: u64,
        image: vk::Image,
        buffer: vk::Buffer,
    ) -> Result<MemoryBlock> {
        if image != vk::Image::null() && buffer != vk::Buffer::null() {
            log::error!("At most one of image and buffer may be set for a dedicated allocation");
            return Err(GraupelError::INVALID);
        }
        debug_assert!(size > 0);

        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::builder()
            .image(image)
            .buffer(buffer);
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(self.memory_type_index)
            .push_next(&mut dedicated_info);

        let memory = unsafe {
            self.device.allocate_memory(&alloc_info, None).map_err(|e| {
                log::error!("vkAllocateMemory failed: {:?}", e);
                GraupelError::from(e)
            })?
        };
        let chunk = MemoryChunk::new(
            &self.device,
            memory,
            self.property_flags,
            size,
            size,
            1,
            true,
            false,
        );
        self.dedicated.lock().unwrap().push(chunk.clone());
        let offset = chunk.pop().expect("fresh chunk has a free block");
        Ok(MemoryBlock {
            chunk,
            offset,
            size,
        })
    }

    /// Return a block. Fully-freed chunks may be destroyed when the
    /// owning allocator holds enough spare blocks already.
    pub fn dealloc(&self, block: MemoryBlock) {
        if block.chunk.pooled {
            let index =
                size_class_index(block.chunk.block_size).expect("pooled block has a size class");
            let mut allocator = self.allocators[index].lock().unwrap();
            allocator.dealloc(&block);
        } else {
            let target = Arc::as_ptr(&block.chunk);
            let mut dedicated = self.dedicated.lock().unwrap();
            dedicated.retain(|c| Arc::as_ptr(c) != target);
            // chunk is destroyed when the last block reference drops
        }
    }

    /// Destroy every fully-free chunk in every allocator. Returns the
    /// number of bytes released.
    pub fn purge(&self) -> u64 {
        self.allocators
            .iter()
            .map(|a| a.lock().unwrap().purge())
            .sum()
    }

    pub fn num_allocations(&self) -> u64 {
        let pooled: u64 = self
            .allocators
            .iter()
            .map(|a| a.lock().unwrap().num_allocations())
            .sum();
        pooled + self.dedicated.lock().unwrap().len() as u64
    }

    pub fn total_memory_size(&self) -> u64 {
        let pooled: u64 = self
            .allocators
            .iter()
            .map(|a| a.lock().unwrap().total_memory_size())
            .sum();
        let dedicated: u64 = self
            .dedicated
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.chunk_size)
            .sum();
        pooled + dedicated
    }

    pub fn memory_size_in_use(&self) -> u64 {
        let pooled: u64 = self
            .allocators
            .iter()
            .map(|a| a.lock().unwrap().memory_in_use)
            .sum();
        let dedicated: u64 = self
            .dedicated
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.chunk_size)
            .sum();
        pooled + dedicated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_classes_are_sorted_powers_of_two() {
        let mut prev = 0;
        for &(block_size, blocks) in CHUNK_SIZE_CLASSES.iter() {
            assert!(block_size > prev);
            assert!(block_size.is_power_of_two());
            assert!(blocks > 0);
            prev = block_size;
        }
        assert_eq!(CHUNK_SIZE_CLASSES[0].0, 1024);
        assert_eq!(CHUNK_SIZE_CLASSES[CHUNK_SIZE_CLASSES.len() - 1].0, 32 << 20);
    }

    #[test]
    fn size_class_lookup_picks_the_smallest_fit() {
        let class_of = |size: u64| size_class_index(size).map(|i| CHUNK_SIZE_CLASSES[i].0);
        assert_eq!(class_of(1), Some(1024));
        assert_eq!(class_of(1024), Some(1024));
        assert_eq!(class_of(1025), Some(2048));
        assert_eq!(class_of(32 << 20), Some(32 << 20));
        assert_eq!(class_of((32 << 20) + 1), None); // falls to direct allocation
    }

    #[test]
    fn blocks_resolve_back_to_their_owning_class() {
        // dealloc finds the allocator through the block's chunk size
        for &(block_size, _) in CHUNK_SIZE_CLASSES.iter() {
            let index = size_class_index(block_size).unwrap();
            assert_eq!(CHUNK_SIZE_CLASSES[index].0, block_size);
        }
    }
}
