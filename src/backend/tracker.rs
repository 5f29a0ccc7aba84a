// Live handle accounting
//
// Every RAII wrapper in the backend bumps a per-kind counter on creation and
// drops it on destruction. A non-zero count at shutdown is a leak.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    ImageView,
    Swapchain,
    Framebuffer,
    RenderPass,
    Pipeline,
    PipelineLayout,
    DescriptorSetLayout,
    DescriptorPool,
    Buffer,
    Image,
    Sampler,
    CommandPool,
    CommandBuffer,
    Semaphore,
    Fence,
}

impl HandleKind {
    pub const ALL: [HandleKind; 15] = [
        HandleKind::ImageView,
        HandleKind::Swapchain,
        HandleKind::Framebuffer,
        HandleKind::RenderPass,
        HandleKind::Pipeline,
        HandleKind::PipelineLayout,
        HandleKind::DescriptorSetLayout,
        HandleKind::DescriptorPool,
        HandleKind::Buffer,
        HandleKind::Image,
        HandleKind::Sampler,
        HandleKind::CommandPool,
        HandleKind::CommandBuffer,
        HandleKind::Semaphore,
        HandleKind::Fence,
    ];

    fn slot(self) -> &'static AtomicUsize {
        &LIVE[self as usize]
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const ZERO: AtomicUsize = AtomicUsize::new(0);
static LIVE: [AtomicUsize; HandleKind::ALL.len()] = [ZERO; HandleKind::ALL.len()];

pub fn created(kind: HandleKind, count: usize) {
    kind.slot().fetch_add(count, Ordering::Relaxed);
}

pub fn destroyed(kind: HandleKind, count: usize) {
    kind.slot().fetch_sub(count, Ordering::Relaxed);
}

pub fn live(kind: HandleKind) -> usize {
    kind.slot().load(Ordering::Relaxed)
}

/// Snapshot of every counter, in `HandleKind::ALL` order.
pub fn snapshot() -> [usize; HandleKind::ALL.len()] {
    let mut counts = [0; HandleKind::ALL.len()];
    for (count, kind) in counts.iter_mut().zip(HandleKind::ALL) {
        *count = live(kind);
    }
    counts
}

/// Warn about anything still alive. Returns true when nothing leaked.
pub fn report_leaks() -> bool {
    let mut clean = true;
    for kind in HandleKind::ALL {
        let count = live(kind);
        if count != 0 {
            log::warn!("{} {:?} handle(s) still alive at shutdown", count, kind);
            clean = false;
        }
    }
    clean
}

/// Counters are process-wide, so tests that create real handles take turns.
#[cfg(test)]
pub fn lock_for_test() -> std::sync::MutexGuard<'static, ()> {
    static GPU: std::sync::Mutex<()> = std::sync::Mutex::new(());
    GPU.lock().unwrap_or_else(|e| e.into_inner())
}
