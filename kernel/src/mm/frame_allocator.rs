//! Physical frame allocator.
//!
//! A flat bitmap allocator over the bootloader's memory map. Frames are
//! submitted in two passes: everything below 4 GiB first (so the SMP
//! trampoline page at physical 0x1000 is guaranteed reachable before any
//! higher memory is considered), then the remainder once the rest of the
//! kernel no longer depends on ordering.
//!
//! There is no NUMA awareness -- the platform is treated as a single flat
//! pool of frames, consistent with a single-socket bring-up target.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::sync::IrqLock;

use super::{FrameNumber, MemoryRegion, FRAME_SIZE};

/// Frames below this physical address are reserved for real-mode / SMP
/// trampoline use and are never handed out by the general allocator. Covers
/// frame 0 (the null-guard page) and frame 1 (physical `0x1000`, where the
/// SMP trampoline blob is copied and identity-mapped during AP bring-up).
const TRAMPOLINE_RESERVED_END: u64 = 0x2000;

/// Errors specific to frame allocation, convertible to [`KernelError`].
///
/// [`KernelError`]: crate::error::KernelError
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAllocatorError {
    OutOfMemory { requested: usize, available: usize },
}

/// Maximum physical memory the bitmap can describe (64 GiB), sized
/// generously for bring-up targets without needing a heap-backed bitmap.
const BITS_PER_WORD: usize = u64::BITS as usize;
const MAX_FRAMES: usize = 64 * 1024 * 1024 * 1024 / FRAME_SIZE;
const BITMAP_WORDS: usize = MAX_FRAMES / BITS_PER_WORD;

static mut BITMAP_STORAGE: [u64; BITMAP_WORDS] = [0; BITMAP_WORDS];

/// Bitmap-backed flat frame allocator.
///
/// One bit per frame; `1` means allocated. The bitmap itself lives in
/// `.bss`, borrowed exactly once by [`FrameAllocator`] behind its mutex.
struct Bitmap {
    words: &'static mut [u64],
    total_frames: usize,
    next_hint: usize,
}

impl Bitmap {
    const fn empty() -> Self {
        // SAFETY: `BITMAP_STORAGE` is only ever borrowed here, and only one
        // `Bitmap` is ever constructed (inside `FrameAllocator::new`, which
        // is itself only reachable through `FRAME_ALLOCATOR`'s mutex).
        Self {
            words: unsafe { &mut *core::ptr::addr_of_mut!(BITMAP_STORAGE) },
            total_frames: 0,
            next_hint: 0,
        }
    }

    fn set(&mut self, frame: usize, used: bool) {
        let word = frame / BITS_PER_WORD;
        let bit = frame % BITS_PER_WORD;
        if used {
            self.words[word] |= 1 << bit;
        } else {
            self.words[word] &= !(1 << bit);
        }
    }

    fn is_used(&self, frame: usize) -> bool {
        let word = frame / BITS_PER_WORD;
        let bit = frame % BITS_PER_WORD;
        (self.words[word] >> bit) & 1 == 1
    }

    /// Find `count` contiguous free frames, starting the search at
    /// `next_hint` and wrapping around once.
    fn find_free_run(&self, count: usize) -> Option<usize> {
        let mut search_start = self.next_hint;
        for _ in 0..2 {
            let mut run = 0;
            let mut run_start = search_start;
            for frame in search_start..self.total_frames {
                if self.is_used(frame) {
                    run = 0;
                    run_start = frame + 1;
                } else {
                    if run == 0 {
                        run_start = frame;
                    }
                    run += 1;
                    if run == count {
                        return Some(run_start);
                    }
                }
            }
            search_start = 0;
        }
        None
    }
}

/// Flat physical frame allocator.
pub struct FrameAllocator {
    bitmap: Bitmap,
    free_frames: usize,
}

impl FrameAllocator {
    const fn new() -> Self {
        Self {
            bitmap: Bitmap::empty(),
            free_frames: 0,
        }
    }

    fn submit_region(&mut self, region: &MemoryRegion) {
        if !region.usable {
            return;
        }
        let start_frame = (region.start / FRAME_SIZE as u64) as usize;
        let end_frame = ((region.start + region.size) / FRAME_SIZE as u64).min(MAX_FRAMES as u64) as usize;
        if self.bitmap.total_frames < end_frame {
            self.bitmap.total_frames = end_frame;
        }
        for frame in start_frame..end_frame {
            let phys = frame as u64 * FRAME_SIZE as u64;
            if phys < TRAMPOLINE_RESERVED_END {
                self.bitmap.set(frame, true);
                continue;
            }
            if self.bitmap.is_used(frame) {
                continue;
            }
            self.bitmap.set(frame, false);
            self.free_frames += 1;
        }
    }

    fn allocate(&mut self, count: usize) -> Result<FrameNumber, FrameAllocatorError> {
        match self.bitmap.find_free_run(count) {
            Some(start) => {
                for frame in start..start + count {
                    self.bitmap.set(frame, true);
                }
                self.bitmap.next_hint = start + count;
                self.free_frames -= count;
                Ok(FrameNumber::new(start as u64))
            }
            None => Err(FrameAllocatorError::OutOfMemory {
                requested: count * FRAME_SIZE,
                available: self.free_frames * FRAME_SIZE,
            }),
        }
    }

    fn free(&mut self, frame: FrameNumber, count: usize) {
        let start = frame.0 as usize;
        for f in start..start + count {
            debug_assert!(self.bitmap.is_used(f), "double free of frame {}", f);
            self.bitmap.set(f, false);
        }
        self.free_frames += count;
        if start < self.bitmap.next_hint {
            self.bitmap.next_hint = start;
        }
    }

    pub fn free_frame_count(&self) -> usize {
        self.free_frames
    }
}

/// Global frame allocator instance. Masks interrupts while held: a device
/// IRQ handler running on the same CPU that is mid-allocation must never be
/// able to re-enter the allocator and spin against itself.
pub static FRAME_ALLOCATOR: IrqLock<FrameAllocator> = IrqLock::new(FrameAllocator::new());

/// Frames currently outstanding, for diagnostics.
static ALLOCATED_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Submit the bootloader's memory map to the allocator.
///
/// Regions are processed in two passes: everything under 4 GiB first, then
/// the rest. This guarantees low memory (and the SMP trampoline page within
/// it) is accounted for deterministically regardless of the order the
/// bootloader reports regions in.
pub fn init(regions: &[MemoryRegion]) -> Result<(), FrameAllocatorError> {
    const FOUR_GIB: u64 = 4 * 1024 * 1024 * 1024;
    let mut allocator = FRAME_ALLOCATOR.lock();

    for region in regions {
        if region.start < FOUR_GIB {
            allocator.submit_region(region);
        }
    }
    for region in regions {
        if region.start >= FOUR_GIB {
            allocator.submit_region(region);
        }
    }

    println!(
        "[PMM] {} frames free ({} MiB)",
        allocator.free_frames,
        allocator.free_frames * FRAME_SIZE / (1024 * 1024)
    );
    Ok(())
}

/// Allocate `count` contiguous physical frames.
pub fn allocate(count: usize) -> Result<FrameNumber, FrameAllocatorError> {
    let frame = FRAME_ALLOCATOR.lock().allocate(count)?;
    ALLOCATED_COUNT.fetch_add(count, Ordering::Relaxed);
    Ok(frame)
}

/// Free `count` contiguous physical frames previously returned by
/// [`allocate`].
pub fn free(frame: FrameNumber, count: usize) {
    FRAME_ALLOCATOR.lock().free(frame, count);
    ALLOCATED_COUNT.fetch_sub(count, Ordering::Relaxed);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free_roundtrip() {
        let mut allocator = FrameAllocator::new();
        allocator.submit_region(&MemoryRegion {
            start: 0x10_0000,
            size: 16 * FRAME_SIZE as u64,
            usable: true,
        });

        let a = allocator.allocate(4).unwrap();
        let b = allocator.allocate(4).unwrap();
        assert_ne!(a.0, b.0);

        allocator.free(a, 4);
        let c = allocator.allocate(4).unwrap();
        assert_eq!(a.0, c.0);
    }

    #[test]
    fn out_of_memory_reports_available() {
        let mut allocator = FrameAllocator::new();
        allocator.submit_region(&MemoryRegion {
            start: 0x10_0000,
            size: 2 * FRAME_SIZE as u64,
            usable: true,
        });

        let err = allocator.allocate(3).unwrap_err();
        assert_eq!(
            err,
            FrameAllocatorError::OutOfMemory {
                requested: 3 * FRAME_SIZE,
                available: 2 * FRAME_SIZE,
            }
        );
    }
}
