//! Virtual memory manager.
//!
//! The bootloader hands the kernel a fully-formed set of page tables with
//! the kernel image, stack, and all usable physical memory already mapped
//! at a fixed offset (`phys_mem_offset`). Rather than discard that mapping
//! and build a fresh one, `init` simply records it as the direct-mapping
//! window every other part of the kernel uses to turn a [`PhysicalAddress`]
//! into something dereferenceable. The kernel's own page table root stays
//! whatever CR3 already holds; new mappings are added to it in place.
//!
//! A process gets its own [`AddressSpace`], a fresh PML4 that still shares
//! the upper half (kernel mappings) with every other address space so a
//! syscall or interrupt taken while a user address space is loaded can
//! still reach kernel code and data.

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use super::{
    page_table::{ActivePageTable, PageMapper, PageTableHierarchy},
    set_direct_map_base, FrameNumber, PageFlags, PageSize, PhysicalAddress, VirtualAddress,
    FRAME_ALLOCATOR,
};
use crate::error::{KernelError, KernelResult};

/// Install the direct-mapping window at the bootloader's existing physical
/// memory offset and report the kernel's current page table root.
///
/// Must run after the frame allocator is initialized and before anything
/// calls [`map`]/[`unmap`]/[`translate`].
pub fn init(phys_mem_offset: u64) -> KernelResult<()> {
    set_direct_map_base(phys_mem_offset);
    crate::arch::x86_64::mmu::init();
    println!(
        "[VMM] direct-mapping window installed at offset 0x{:x}",
        phys_mem_offset
    );
    Ok(())
}

/// Build a [`PageMapper`] over the page table hierarchy currently loaded in
/// CR3 (the kernel's own address space during boot, or whichever process's
/// address space is active once scheduling starts).
fn current_mapper() -> PageMapper {
    let active = ActivePageTable::current();
    let l4_virt = super::phys_to_virt(active.l4_phys().as_u64())
        .expect("direct-mapping window not installed") as *mut super::page_table::PageTable;
    // SAFETY: `l4_virt` is the PML4 currently loaded in CR3, reached through
    // the direct-mapping window, which is valid for as long as the window
    // itself (the kernel's entire lifetime).
    unsafe { PageMapper::new(l4_virt) }
}

/// Map `virt` to `phys` in the currently active address space.
pub fn map(virt: VirtualAddress, phys: PhysicalAddress, flags: PageFlags, size: PageSize) -> KernelResult<()> {
    if size != PageSize::Small {
        return Err(KernelError::Unsupported { feature: "large/huge page mapping" });
    }
    let frame = FrameNumber::new(phys.as_u64() / super::FRAME_SIZE as u64);
    current_mapper().map_page(virt, frame, flags)
}

/// Allocate a physical frame and map it at `virt` in the currently active
/// address space.
pub fn allocate_and_map(virt: VirtualAddress, flags: PageFlags) -> KernelResult<()> {
    let frame = FRAME_ALLOCATOR.lock().allocate(1).map_err(KernelError::from)?;
    current_mapper().map_page(virt, frame, flags | PageFlags::PRESENT)
}

/// Unmap `virt` in the currently active address space and free the frame it
/// pointed to.
pub fn unmap(virt: VirtualAddress) -> KernelResult<()> {
    let frame = current_mapper().unmap_page(virt)?;
    FRAME_ALLOCATOR.lock().free(frame, 1);
    shootdown(virt);
    Ok(())
}

/// Identity-map a low-memory frame that the PMM never owned (it was carved
/// out of [`frame_allocator`](super::frame_allocator)'s reserved range
/// up front), such as the SMP trampoline page. Unlike [`map`], this never
/// touches the frame allocator's bookkeeping.
pub fn identity_map_low(phys: PhysicalAddress, flags: PageFlags) -> KernelResult<()> {
    let virt = VirtualAddress::new(phys.as_u64());
    let frame = FrameNumber::new(phys.as_u64() / super::FRAME_SIZE as u64);
    current_mapper().map_page(virt, frame, flags | PageFlags::PRESENT)
}

/// Undo [`identity_map_low`]. Does not return the frame to the PMM.
pub fn identity_unmap_low(phys: PhysicalAddress) -> KernelResult<()> {
    let virt = VirtualAddress::new(phys.as_u64());
    current_mapper().unmap_page(virt)?;
    shootdown(virt);
    Ok(())
}

/// Physical address of the kernel's current top-level page table (the
/// value loaded in CR3). Handed to APs during SMP bring-up so they can
/// load the same page tables before leaving the trampoline.
pub fn kernel_pml4() -> PhysicalAddress {
    ActivePageTable::current().l4_phys()
}

/// Translate `virt` to its mapped physical address in the currently active
/// address space, if mapped.
pub fn translate(virt: VirtualAddress) -> Option<(PhysicalAddress, PageFlags)> {
    let breakdown_offset = virt.as_u64() & 0xFFF;
    current_mapper()
        .translate(virt)
        .map(|(frame, flags)| (PhysicalAddress::new(frame.addr().as_u64() + breakdown_offset), flags))
}

/// A process address space: its own PML4, sharing the kernel's upper-half
/// mappings (installed once at boot and never torn down) with every other
/// address space.
pub struct AddressSpace {
    hierarchy: PageTableHierarchy,
}

impl AddressSpace {
    /// Create a fresh address space by copying the kernel's upper-half PML4
    /// entries (indices 256..512, i.e. the canonical higher half) into a new
    /// PML4. The lower half starts completely unmapped.
    pub fn new() -> KernelResult<Self> {
        let hierarchy = PageTableHierarchy::new()?;

        let kernel_l4_phys = ActivePageTable::current().l4_phys();
        let kernel_l4 = super::phys_to_virt(kernel_l4_phys.as_u64())
            .expect("direct-mapping window not installed") as *const super::page_table::PageTable;
        let new_l4 = super::phys_to_virt(hierarchy.l4_addr().as_u64())
            .expect("direct-mapping window not installed") as *mut super::page_table::PageTable;

        // SAFETY: both tables are reachable through the direct-mapping
        // window; `new_l4` was just allocated and zeroed by
        // `PageTableHierarchy::new` and is not yet referenced by any live
        // CR3, so writing its upper half is exclusive.
        unsafe {
            for i in 256..512 {
                (*new_l4)[i] = (*kernel_l4)[i];
            }
        }

        Ok(Self { hierarchy })
    }

    pub fn l4_phys(&self) -> PhysicalAddress {
        self.hierarchy.l4_addr()
    }

    fn mapper(&self) -> PageMapper {
        let l4_virt = super::phys_to_virt(self.hierarchy.l4_addr().as_u64())
            .expect("direct-mapping window not installed") as *mut super::page_table::PageTable;
        // SAFETY: this address space's PML4 is only ever mutated through
        // this mapper, and is reachable through the direct-mapping window
        // for as long as the `AddressSpace` lives.
        unsafe { PageMapper::new(l4_virt) }
    }

    pub fn map(&mut self, virt: VirtualAddress, phys: PhysicalAddress, flags: PageFlags) -> KernelResult<()> {
        let frame = FrameNumber::new(phys.as_u64() / super::FRAME_SIZE as u64);
        self.mapper().map_page(virt, frame, flags)
    }

    pub fn unmap(&mut self, virt: VirtualAddress) -> KernelResult<()> {
        let frame = self.mapper().unmap_page(virt)?;
        FRAME_ALLOCATOR.lock().free(frame, 1);
        Ok(())
    }

    pub fn translate(&self, virt: VirtualAddress) -> Option<(FrameNumber, PageFlags)> {
        self.mapper().translate(virt)
    }

    /// Load this address space into CR3.
    pub fn switch(&self) {
        crate::arch::x86_64::mmu::write_cr3(self.hierarchy.l4_addr());
    }
}

// ---------------------------------------------------------------------------
// TLB shootdown
// ---------------------------------------------------------------------------

/// Address most recently broadcast for a TLB shootdown. Read by every CPU's
/// IPI handler; written only by [`shootdown`], which holds exclusive use of
/// the slot for the duration of the broadcast.
static SHOOTDOWN_ADDR: Mutex<Option<VirtualAddress>> = Mutex::new(None);

/// Acknowledgements received for the in-flight shootdown.
static SHOOTDOWN_ACKS: AtomicUsize = AtomicUsize::new(0);

/// Invalidate `addr` on every CPU. Flushes locally and, if other CPUs are
/// online, broadcasts the TLB shootdown IPI and waits for every one of them
/// to acknowledge before returning.
pub fn shootdown(addr: VirtualAddress) {
    let others = crate::sched::smp::online_cpu_count().saturating_sub(1);

    tlb::flush_address(addr);

    if others == 0 {
        return;
    }

    {
        let mut slot = SHOOTDOWN_ADDR.lock();
        *slot = Some(addr);
    }
    SHOOTDOWN_ACKS.store(0, Ordering::SeqCst);

    if crate::arch::x86_64::apic::send_ipi_all_but_self(
        crate::arch::x86_64::idt::VECTOR_TLB_SHOOTDOWN_IPI,
    )
    .is_err()
    {
        return;
    }

    while SHOOTDOWN_ACKS.load(Ordering::SeqCst) < others {
        core::hint::spin_loop();
    }
}

/// Handle an incoming TLB shootdown IPI: flush the broadcast address locally
/// and acknowledge.
pub fn on_tlb_shootdown_ipi() {
    if let Some(addr) = *SHOOTDOWN_ADDR.lock() {
        tlb::flush_address(addr);
    }
    SHOOTDOWN_ACKS.fetch_add(1, Ordering::SeqCst);
}

/// x86_64 TLB invalidation primitives.
pub mod tlb {
    use super::VirtualAddress;

    /// Flush a single TLB entry.
    pub fn flush_address(addr: VirtualAddress) {
        // SAFETY: invlpg only affects TLB caching for the given address.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) addr.as_u64());
        }
    }

    /// Flush the entire TLB by reloading CR3.
    pub fn flush_all() {
        // SAFETY: round-tripping CR3 through a register reloads the TLB
        // without changing the active page table root.
        unsafe {
            let cr3: u64;
            core::arch::asm!("mov {}, cr3", out(reg) cr3);
            core::arch::asm!("mov cr3, {}", in(reg) cr3);
        }
    }
}
