// Synchronization primitives: binary semaphores, timeline semaphores,
// and a timeline variant that hands out monotonically increasing
// wait/signal values on demand.

use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;

use utils::log;

/// Something an encoder can wait on or signal at submission time.
pub trait GpuEvent: Send + Sync {
    fn vk_semaphore(&self) -> vk::Semaphore;

    /// Timeline value to wait for; binary semaphores report zero.
    fn next_wait_value(&self) -> u64 {
        0
    }

    /// Timeline value to signal; binary semaphores report zero.
    fn next_signal_value(&self) -> u64 {
        0
    }

    fn is_binary_semaphore(&self) -> bool {
        true
    }
}

pub struct BinarySemaphore {
    device: ash::Device,
    pub semaphore: vk::Semaphore,
}

impl BinarySemaphore {
    pub(crate) fn new(device: ash::Device, semaphore: vk::Semaphore) -> Self {
        Self { device, semaphore }
    }
}

impl GpuEvent for BinarySemaphore {
    fn vk_semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for BinarySemaphore {
    fn drop(&mut self) {
        unsafe { self.device.destroy_semaphore(self.semaphore, None) };
    }
}

/// Timeline semaphore with explicit values.
pub struct TimelineSemaphore {
    device: ash::Device,
    pub semaphore: vk::Semaphore,
}

impl TimelineSemaphore {
    pub(crate) fn new(device: ash::Device, semaphore: vk::Semaphore) -> Self {
        Self { device, semaphore }
    }

    pub fn signal(&self, value: u64) {
        let info = vk::SemaphoreSignalInfo::builder()
            .semaphore(self.semaphore)
            .value(value);
        if let Err(e) = unsafe { self.device.signal_semaphore(&info) } {
            log::error!("vkSignalSemaphore failed: {:?}", e);
        }
    }

    /// Wait until the semaphore reaches `value`. Returns false when the
    /// timeout (nanoseconds) elapses first.
    pub fn wait(&self, value: u64, timeout: u64) -> bool {
        let semaphores = [self.semaphore];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);
        match unsafe { self.device.wait_semaphores(&info, timeout) } {
            Ok(()) => true,
            Err(vk::Result::TIMEOUT) => false,
            Err(e) => {
                log::error!("vkWaitSemaphores failed: {:?}", e);
                false
            }
        }
    }

    pub fn value(&self) -> u64 {
        match unsafe { self.device.get_semaphore_counter_value(self.semaphore) } {
            Ok(v) => v,
            Err(e) => {
                log::error!("vkGetSemaphoreCounterValue failed: {:?}", e);
                0
            }
        }
    }
}

impl GpuEvent for TimelineSemaphore {
    fn vk_semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    fn is_binary_semaphore(&self) -> bool {
        false
    }
}

impl Drop for TimelineSemaphore {
    fn drop(&mut self) {
        unsafe { self.device.destroy_semaphore(self.semaphore, None) };
    }
}

/// Timeline semaphore whose wait/signal values increment atomically on
/// each request, so consecutive submissions chain without bookkeeping.
pub struct AutoIncrementTimeline {
    device: ash::Device,
    pub semaphore: vk::Semaphore,
    wait_value: AtomicU64,
    signal_value: AtomicU64,
}

impl AutoIncrementTimeline {
    pub(crate) fn new(device: ash::Device, semaphore: vk::Semaphore) -> Self {
        Self {
            device,
            semaphore,
            wait_value: AtomicU64::new(0),
            signal_value: AtomicU64::new(0),
        }
    }
}

impl GpuEvent for AutoIncrementTimeline {
    fn vk_semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    fn next_wait_value(&self) -> u64 {
        self.wait_value.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn next_signal_value(&self) -> u64 {
        self.signal_value.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_binary_semaphore(&self) -> bool {
        false
    }
}

impl Drop for AutoIncrementTimeline {
    fn drop(&mut self) {
        unsafe { self.device.destroy_semaphore(self.semaphore, None) };
    }
}
