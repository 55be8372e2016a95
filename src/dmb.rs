use std::sync::atomic::compiler_fence;
use std::sync::atomic::Ordering;

/// Data memory barrier between CPU writes to DMA memory and the register
/// write that hands it to the device.
#[inline(always)]
pub fn dmb() {
    compiler_fence(Ordering::SeqCst);
    #[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
    unsafe {
        std::arch::asm!("dmb sy", options(nostack, preserves_flags));
    }
    #[cfg(not(any(target_arch = "arm", target_arch = "aarch64")))]
    std::sync::atomic::fence(Ordering::SeqCst);
    compiler_fence(Ordering::SeqCst);
}
