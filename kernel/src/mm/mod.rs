//! Physical and virtual memory management.
//!
//! Brings up, in order: the physical frame allocator over the memory map
//! handed off by the bootloader, the direct-mapping window that gives the
//! kernel byte-addressable access to all physical memory, and the kernel
//! heap backed by frames drawn from the PMM.

#![allow(dead_code)]

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{KernelError, KernelResult};

pub mod frame_allocator;
pub mod heap;
pub mod page_table;
pub mod vmm;

pub use frame_allocator::{FrameAllocatorError, FRAME_ALLOCATOR};

/// Size of a standard (4 KiB) page/frame, in bytes.
pub const FRAME_SIZE: usize = 4096;

/// A physical memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Translate to a virtual address through the direct-mapping window.
    ///
    /// Returns `None` if the window has not been installed yet.
    pub fn to_virt(self) -> Option<VirtualAddress> {
        phys_to_virt(self.0).map(VirtualAddress::new)
    }
}

/// A virtual memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    pub fn add(self, offset: usize) -> Self {
        Self(self.0 + offset as u64)
    }
}

/// Index of a physical page frame (`PhysicalAddress / FRAME_SIZE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameNumber(pub u64);

impl FrameNumber {
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    pub fn from_addr(addr: u64) -> Self {
        Self(addr / FRAME_SIZE as u64)
    }

    pub fn addr(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * FRAME_SIZE as u64)
    }
}

/// Page size a mapping or allocation is expressed in.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    /// 4 KiB.
    Small = FRAME_SIZE,
    /// 2 MiB.
    Large = 2 * 1024 * 1024,
    /// 1 GiB.
    Huge = 1024 * 1024 * 1024,
}

bitflags::bitflags! {
    /// Flags for a page table entry, independent of the concrete hardware
    /// bit positions (translated in `page_table`).
    ///
    /// Callers request `EXEC` as a positive capability; `page_table::map_page`
    /// derives the real NX bit from its absence, so a mapping is
    /// non-executable unless the caller explicitly asks otherwise.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
        /// Instruction fetches are permitted. Absent ⇒ the leaf gets the
        /// hardware NX bit set.
        const EXEC          = 1 << 9;
        /// The real hardware no-execute bit (bit 63). Not caller-facing --
        /// `map_page` sets it on the leaf PTE itself, derived from `EXEC`.
        const NO_EXECUTE    = 1 << 63;
    }
}

/// A single region of physical memory reported by the bootloader.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub start: u64,
    pub size: u64,
    pub usable: bool,
}

/// Virtual base of the direct-mapping window, or 0 if not yet installed.
///
/// Set exactly once by [`vmm::init`]. Physical address `p` is reachable at
/// `DIRECT_MAP_BASE + p` for the kernel's entire lifetime -- the window is
/// installed once during boot and never unmapped or moved.
static DIRECT_MAP_BASE: AtomicU64 = AtomicU64::new(0);

/// Record the base of the direct-mapping window. Called once by `vmm::init`.
pub(crate) fn set_direct_map_base(base: u64) {
    DIRECT_MAP_BASE.store(base, Ordering::Release);
}

/// Translate a physical address to a virtual one through the direct-mapping
/// window. Returns `None` before the window is installed.
pub fn phys_to_virt(phys: u64) -> Option<usize> {
    let base = DIRECT_MAP_BASE.load(Ordering::Acquire);
    if base == 0 {
        return None;
    }
    Some((base + phys) as usize)
}

/// Initialize all of memory management: frame allocator, direct-mapping
/// window, kernel page tables, and kernel heap.
///
/// `regions` is the bootloader-provided physical memory map; `phys_mem_offset`
/// is the bootloader's own temporary physical-memory mapping, used only to
/// reach the memory map and page tables before our own window exists.
pub fn init(regions: &[MemoryRegion], phys_mem_offset: u64) -> KernelResult<()> {
    println!("[MM] Initializing physical frame allocator...");
    frame_allocator::init(regions)?;

    println!("[MM] Installing direct-mapping window...");
    vmm::init(phys_mem_offset)?;

    println!("[MM] Initializing kernel heap...");
    heap::init()?;

    println!("[MM] Memory management initialized");
    Ok(())
}

impl From<FrameAllocatorError> for KernelError {
    fn from(err: FrameAllocatorError) -> Self {
        match err {
            FrameAllocatorError::OutOfMemory {
                requested,
                available,
            } => KernelError::OutOfMemory {
                requested,
                available,
            },
        }
    }
}
