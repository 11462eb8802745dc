//! Application-processor real-mode trampoline.
//!
//! Every AP starts executing in 16-bit real mode at whatever physical
//! address the BSP names in the Startup IPI (SIPI). This module assembles a
//! single self-contained blob that carries an AP through real mode,
//! protected mode, and into long mode, landing on [`super::smp::ap_entry`]
//! with a private stack. The blob is position-independent only insofar as
//! it is always copied to a fixed physical address (`0x1000`) before use --
//! it is not relocatable to an arbitrary load address.
//!
//! The blob and the BSP's bring-up code communicate through a handful of
//! fixed byte offsets within the copied page (the "cells"), rather than
//! through any Rust-visible struct, because the AP reads them in 16/32-bit
//! mode before a stack or calling convention exists.

use core::arch::global_asm;

use crate::error::{KernelError, KernelResult};
use crate::mm::{PageFlags, PhysicalAddress};

/// Physical address the trampoline blob is copied to and the AP is started
/// at. Must match the page reserved from general allocation by
/// [`crate::mm::frame_allocator`].
pub const TRAMPOLINE_PHYS: u64 = 0x1000;

/// SIPI vector argument encodes the target page as `addr >> 12`.
pub const TRAMPOLINE_PAGE: u8 = (TRAMPOLINE_PHYS >> 12) as u8;

/// Offset of the ready flag cell: zeroed by the BSP before startup, written
/// non-zero by the AP once it has loaded its own GDT/IDT and is about to
/// enter [`super::smp::ap_entry`].
pub const CELL_READY_FLAG: u64 = 0x510;
/// Offset of the kernel entry point cell (a `u64` pointer to `ap_entry`).
pub const CELL_ENTRY_POINT: u64 = 0x520;
/// Offset of the kernel PML4 physical address cell (a `u64`).
pub const CELL_PML4: u64 = 0x540;
/// Offset of the AP's stack-top cell (a `u64` virtual/physical address --
/// identity-mapped low memory, so the two coincide here).
pub const CELL_STACK_TOP: u64 = 0x550;
/// Offset of the 32-bit protected-mode GDT descriptor image (base+limit
/// pair followed by the three flat descriptors it points at).
pub const CELL_GDT_IMAGE: u64 = 0x580;
/// Offset reserved for a copy of the IDT descriptor; unused until the AP
/// reaches `ap_entry` and loads the kernel's real IDT, but reserved per the
/// fixed cell layout so nothing else is placed there.
#[allow(dead_code)]
pub const CELL_IDT_IMAGE: u64 = 0x590;

extern "C" {
    /// First byte of the assembled trampoline, linked at an arbitrary
    /// address in the kernel image -- only its *contents* are used, copied
    /// byte-for-byte to [`TRAMPOLINE_PHYS`].
    static trampoline_start: u8;
    /// One past the last byte of the assembled trampoline.
    static trampoline_end: u8;
}

/// Size of the assembled blob in bytes.
pub fn blob_len() -> usize {
    // SAFETY: both symbols are linker-provided addresses, never dereferenced;
    // only their difference is taken.
    unsafe { (&trampoline_end as *const u8).offset_from(&trampoline_start as *const u8) as usize }
}

/// The assembled blob as a byte slice, valid for the kernel's lifetime.
pub fn blob() -> &'static [u8] {
    // SAFETY: `trampoline_start`/`trampoline_end` bound a range of
    // initialized, read-only `.text` bytes emitted by the `global_asm!`
    // block below.
    unsafe { core::slice::from_raw_parts(&trampoline_start as *const u8, blob_len()) }
}

/// Copy the trampoline blob to [`TRAMPOLINE_PHYS`] through the direct-mapping
/// window and write the handoff cells for one AP.
///
/// Must be called with the trampoline page already identity-mapped
/// read-write-exec (see [`crate::mm::vmm::identity_map_low`]).
pub fn prepare(entry_point: extern "C" fn(u64) -> !, kernel_pml4: PhysicalAddress, stack_top: u64, cpu_arg: u64) -> KernelResult<()> {
    let base = crate::mm::phys_to_virt(TRAMPOLINE_PHYS).ok_or(KernelError::Unsupported { feature: "direct-mapping window" })? as *mut u8;

    let blob = blob();
    if blob.len() > CELL_READY_FLAG as usize {
        return Err(KernelError::Fatal { reason: "SMP trampoline blob does not fit before the handoff cells" });
    }

    // SAFETY: `base` points at the freshly identity-mapped trampoline page,
    // large enough (one 4 KiB frame) to hold the blob and every cell offset
    // used below; nothing else reads or writes this page concurrently
    // during bring-up (single BSP, AP not yet started).
    unsafe {
        core::ptr::copy_nonoverlapping(blob.as_ptr(), base, blob.len());

        write_cell_u64(base, CELL_READY_FLAG, 0);
        write_cell_u64(base, CELL_ENTRY_POINT, entry_point as u64);
        write_cell_u64(base, CELL_PML4, kernel_pml4.as_u64());
        write_cell_u64(base, CELL_STACK_TOP, stack_top);
        write_cell_u64(base, CELL_STACK_TOP + 8, cpu_arg);
    }

    Ok(())
}

/// # Safety
/// `base` must point at a writable, at-least-one-page region.
unsafe fn write_cell_u64(base: *mut u8, offset: u64, value: u64) {
    core::ptr::write_volatile(base.add(offset as usize) as *mut u64, value);
}

/// Read the ready flag cell. Non-zero once the AP has claimed the trampoline
/// page and is past the point where the BSP may safely reuse it.
pub fn ready_flag() -> bool {
    let Some(base) = crate::mm::phys_to_virt(TRAMPOLINE_PHYS) else {
        return false;
    };
    // SAFETY: the trampoline page is identity-mapped for the duration of
    // bring-up; the cell is written by the AP with `write_volatile` from its
    // 64-bit entry stub, observed here with a matching volatile read.
    unsafe { core::ptr::read_volatile((base + CELL_READY_FLAG as usize) as *const u64) != 0 }
}

/// Identity-map the trampoline page and page 0 (the real-mode IVT/BDA the
/// blob's 16-bit prologue briefly touches) read-write-exec.
pub fn map_for_bringup() -> KernelResult<()> {
    let flags = PageFlags::WRITABLE | PageFlags::EXEC;
    crate::mm::vmm::identity_map_low(PhysicalAddress::new(0x0), flags)?;
    crate::mm::vmm::identity_map_low(PhysicalAddress::new(TRAMPOLINE_PHYS), flags)?;
    Ok(())
}

/// Undo [`map_for_bringup`] once every AP has reported ready.
pub fn unmap_after_bringup() -> KernelResult<()> {
    crate::mm::vmm::identity_unmap_low(PhysicalAddress::new(0x0))?;
    crate::mm::vmm::identity_unmap_low(PhysicalAddress::new(TRAMPOLINE_PHYS))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// The blob itself
// ---------------------------------------------------------------------------
//
// Three stages, each handing off to the next with a far jump:
//   16-bit real mode  -> loads a flat GDT, sets CR0.PE, far jumps to stage 2.
//   32-bit protected  -> enables PAE, loads CR3 with the kernel PML4, sets
//                        EFER.LME, enables paging (which -- with LME and PAE
//                        already set -- puts the CPU in compatibility mode),
//                        far jumps to stage 3 through a 64-bit code selector.
//   64-bit long mode  -> loads flat data selectors, reads the stack-top and
//                        cpu-index cells, sets the ready flag, loads RSP and
//                        RDI, jumps to the entry-point cell.
//
// All three stages run from the *same* identity-mapped page the blob was
// copied to, so every label below is addressed relative to that page
// (`trampoline_start` is the page's first byte once copied to 0x1000).

// Written in AT&T syntax (`options(att_syntax)`): every cross-mode jump
// target is computed as `label - trampoline_start + 0x1000` rather than
// referenced directly, because the blob is linked somewhere inside the
// kernel image but only ever *executed* after being copied verbatim to
// physical 0x1000 -- a bare `label` operand would bake in the wrong
// (link-time) address. The symbol difference is a link-time constant
// regardless of where the linker ultimately places `trampoline_start`, so
// adding 0x1000 back gives the correct runtime address.
global_asm!(
    r#"
.section .text
.global trampoline_start
.global trampoline_end

.code16
trampoline_start:
    cli
    xor %ax, %ax
    mov %ax, %ds
    mov %ax, %es
    mov %ax, %ss

    lgdtl (gdt32_ptr - trampoline_start + 0x1000)

    mov %cr0, %eax
    or $1, %eax
    mov %eax, %cr0

    ljmp $0x08, $(pm32 - trampoline_start + 0x1000)

.align 8
gdt32_ptr:
    .word gdt32_end - gdt32_start - 1
    .long gdt32_start - trampoline_start + 0x1000

.align 16
gdt32_start:
    .quad 0x0000000000000000        /* null */
    .quad 0x00CF9A000000FFFF        /* 0x08: 32-bit code, base 0 limit 4G */
    .quad 0x00CF92000000FFFF        /* 0x10: 32-bit data, base 0 limit 4G */
    .quad 0x00AF9A000000FFFF        /* 0x18: 64-bit code */
gdt32_end:

.code32
pm32:
    mov $0x10, %ax
    mov %ax, %ds
    mov %ax, %es
    mov %ax, %ss

    /* Enable PAE (CR4 bit 5). */
    mov %cr4, %eax
    or $(1 << 5), %eax
    mov %eax, %cr4

    /* Load CR3 with the kernel PML4 physical address (cell +0x540). */
    mov 0x1540, %eax
    mov %eax, %cr3

    /* Set EFER.LME (bit 8). */
    mov $0xC0000080, %ecx
    rdmsr
    or $(1 << 8), %eax
    wrmsr

    /* Enable paging (CR0 bit 31); with PAE+LME already set this enters
       IA-32e compatibility mode. */
    mov %cr0, %eax
    or $(1 << 31), %eax
    mov %eax, %cr0

    ljmp $0x18, $(lm64 - trampoline_start + 0x1000)

.code64
lm64:
    mov $0x10, %ax
    mov %ax, %ds
    mov %ax, %es
    mov %ax, %ss

    mov 0x1550, %rsp
    mov 0x1558, %rdi

    movq $1, 0x1510

    mov 0x1520, %rax
    jmp *%rax

trampoline_end:
"#,
    options(att_syntax)
);
