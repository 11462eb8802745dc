//! Saved CPU register state and FPU/SSE save area.
//!
//! [`CpuContext`] mirrors the layout the preemption stubs in [`super::idt`]
//! push onto a thread's kernel stack: general-purpose registers, the
//! vector/error-code pair recorded for diagnostics, then the hardware
//! return frame (RIP/CS/RFLAGS). Because every thread runs at CPL 0, the
//! CPU never pushes RSP/SS on interrupt entry or pops them on `iretq` --
//! switching stacks is done explicitly by the dispatcher (`mov rsp, ...`)
//! before the final `iretq`, not by the hardware frame itself.

/// Register snapshot taken at a preemption point.
///
/// Field order matches the push order of the naked interrupt stubs in
/// reverse (the most recently pushed register sits at the lowest address,
/// i.e. offset 0) so that `*(rsp as *mut CpuContext)` aliases the real
/// stack contents.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
}

impl CpuContext {
    /// Build the initial frame for a thread that has never run. Laid out so
    /// that the preemption return path (pop GPRs, `iretq`) can resume it
    /// exactly as if it had been interrupted right at `entry`.
    pub fn new(entry: extern "C" fn() -> !, kernel_code_selector: u16) -> Self {
        Self {
            rip: entry as u64,
            cs: kernel_code_selector as u64,
            rflags: 0x202, // IF set, reserved bit 1 set
            ..Default::default()
        }
    }
}

/// FXSAVE/XSAVE legacy area. 512 bytes, 16-byte aligned per the FXSAVE
/// instruction's requirements (we over-align to 64 to also satisfy XSAVE).
#[repr(C, align(64))]
#[derive(Clone, Copy)]
pub struct FpuArea {
    bytes: [u8; 512],
}

impl FpuArea {
    pub const fn new() -> Self {
        Self { bytes: [0; 512] }
    }
}

impl Default for FpuArea {
    fn default() -> Self {
        Self::new()
    }
}

/// Enable the FPU and SSE execution units. Must run once per CPU before any
/// thread touches floating point or SSE registers.
pub fn init_fpu() {
    // SAFETY: clears CR0.EM/CR0.TS and sets CR4.OSFXSR/OSXMMEXCPT, the
    // documented sequence for enabling legacy SSE state on a CPU that
    // supports it (checked by the bootloader's CPU feature requirements).
    unsafe {
        let mut cr0: u64;
        core::arch::asm!("mov {}, cr0", out(reg) cr0);
        cr0 &= !(1 << 2); // clear EM
        cr0 |= 1 << 1; // set MP
        core::arch::asm!("mov cr0, {}", in(reg) cr0);

        let mut cr4: u64;
        core::arch::asm!("mov {}, cr4", out(reg) cr4);
        cr4 |= (1 << 9) | (1 << 10); // OSFXSR, OSXMMEXCPT
        core::arch::asm!("mov cr4, {}", in(reg) cr4);

        core::arch::asm!("fninit");
    }
}

/// Save the current FPU/SSE state into `area`.
///
/// # Safety
/// `area` must be 16-byte aligned and valid for a 512-byte write.
pub unsafe fn save_fpu_state(area: &mut FpuArea) {
    core::arch::asm!("fxsave [{}]", in(reg) area.bytes.as_mut_ptr());
}

/// Restore FPU/SSE state previously saved by [`save_fpu_state`].
///
/// # Safety
/// `area` must be 16-byte aligned and contain a state previously produced
/// by `fxsave`.
pub unsafe fn restore_fpu_state(area: &FpuArea) {
    core::arch::asm!("fxrstor [{}]", in(reg) area.bytes.as_ptr());
}

/// Walk the saved RBP chain starting at the caller's frame and print each
/// return address, up to `max_frames` deep or until the chain runs out.
///
/// Relies on frame pointers being preserved end to end; a build without
/// `force-frame-pointers` may cut the trace short at the first function
/// compiled without one.
#[inline(never)]
pub fn debug_trace_stack(max_frames: usize) {
    let mut rbp: u64;
    // SAFETY: reads RBP as it stands on entry to this (never-inlined)
    // function, i.e. the caller's own frame pointer.
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) rbp);
    }

    crate::println!("stack trace:");
    for depth in 0..max_frames {
        if rbp == 0 || rbp % 8 != 0 {
            break;
        }
        // SAFETY: `rbp` is checked non-null and 8-byte aligned before each
        // dereference. The pair at [rbp] is only trusted as far as the
        // frame-pointer chain stays intact; a corrupt chain stops the walk
        // via the `return_addr == 0` / `saved_rbp <= rbp` checks below
        // rather than reading further.
        let (saved_rbp, return_addr) = unsafe {
            let frame = rbp as *const u64;
            (core::ptr::read(frame), core::ptr::read(frame.add(1)))
        };
        if return_addr == 0 {
            break;
        }
        crate::println!("  #{depth} {:#018x}", return_addr);
        if saved_rbp <= rbp {
            break;
        }
        rbp = saved_rbp;
    }
}
