//! Per-CPU Global Descriptor Table and Task State Segment.
//!
//! Each CPU gets its own TSS (for the double-fault IST stack and, later,
//! RSP0) and its own small GDT carrying that CPU's TSS selector. The
//! segment descriptors themselves (kernel code/data) are identical across
//! CPUs, so only the TSS differs per entry.

use spin::Once;
use x86_64::{
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

use crate::sched::smp::MAX_CPUS;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const STACK_SIZE: usize = 4096 * 5;

#[repr(align(16))]
struct AlignedStack([u8; STACK_SIZE]);

/// GDT segment selectors for one CPU.
///
/// Layout:
/// - 0x00: Null descriptor
/// - 0x08: Kernel code segment (Ring 0)
/// - 0x10: Kernel data segment (Ring 0)
/// - 0x18: TSS (occupies 2 entries, 0x18-0x20)
pub struct Selectors {
    pub code_selector: SegmentSelector,
    pub data_selector: SegmentSelector,
    pub tss_selector: SegmentSelector,
}

struct PerCpuGdt {
    tss: TaskStateSegment,
    gdt: GlobalDescriptorTable,
    selectors: Selectors,
}

// `PerCpuGdt` holds raw pointers into per-CPU static stacks only; each
// instance is written once by its owning CPU before that CPU loads it, and
// never touched by any other CPU afterward.
unsafe impl Send for PerCpuGdt {}
unsafe impl Sync for PerCpuGdt {}

fn build_for_cpu(cpu_index: usize) -> PerCpuGdt {
    static mut DOUBLE_FAULT_STACKS: [AlignedStack; MAX_CPUS] =
        [const { AlignedStack([0; STACK_SIZE]) }; MAX_CPUS];
    static mut KERNEL_STACKS: [AlignedStack; MAX_CPUS] =
        [const { AlignedStack([0; STACK_SIZE]) }; MAX_CPUS];

    let mut tss = TaskStateSegment::new();
    // SAFETY: each CPU index is only ever initialized once, by its owning
    // CPU, before that CPU's GDT/TSS is loaded.
    unsafe {
        let df_stack = &raw mut DOUBLE_FAULT_STACKS[cpu_index];
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
            VirtAddr::from_ptr(df_stack) + STACK_SIZE as u64;

        let kstack = &raw mut KERNEL_STACKS[cpu_index];
        tss.privilege_stack_table[0] = VirtAddr::from_ptr(kstack) + STACK_SIZE as u64;
    }

    let mut gdt = GlobalDescriptorTable::new();
    let code_selector = gdt.append(Descriptor::kernel_code_segment());
    let data_selector = gdt.append(Descriptor::kernel_data_segment());

    PerCpuGdt {
        tss,
        gdt,
        selectors: Selectors {
            code_selector,
            data_selector,
            // Patched in below once the TSS descriptor is appended; the TSS
            // descriptor borrows `&tss` so it can't be built until `tss` has
            // its final address, which requires `PerCpuGdt` to already be
            // heap-free (it lives in a fixed-size static array).
            tss_selector: SegmentSelector::new(0, x86_64::PrivilegeLevel::Ring0),
        },
    }
}

static TABLES: [Once<PerCpuGdt>; MAX_CPUS] = [const { Once::new() }; MAX_CPUS];

/// Initialize the GDT/TSS for one CPU and load it onto the calling CPU.
///
/// Must be called once per CPU, on that CPU, before interrupts are enabled.
pub fn init(cpu_index: usize) {
    let table = TABLES[cpu_index].call_once(|| build_for_cpu(cpu_index));

    // The TSS descriptor must be appended after `tss` has settled at its
    // final static address, so we do it here rather than in `build_for_cpu`,
    // then patch the cached selector via a raw pointer into the `Once` cell.
    // SAFETY: this CPU is the only writer of its own table, and does so
    // exactly once, before `load()` below reads it back.
    unsafe {
        let table_ptr = table as *const PerCpuGdt as *mut PerCpuGdt;
        let tss_selector = (*table_ptr).gdt.append(Descriptor::tss_segment(&(*table_ptr).tss));
        (*table_ptr).selectors.tss_selector = tss_selector;
    }

    use x86_64::instructions::{
        segmentation::{Segment, CS, DS},
        tables::load_tss,
    };

    table.gdt.load();
    // SAFETY: the GDT was just loaded on this CPU; the selectors reference
    // descriptors within that same GDT.
    unsafe {
        CS::set_reg(table.selectors.code_selector);
        DS::set_reg(table.selectors.data_selector);
        load_tss(table.selectors.tss_selector);
    }
}

/// Selectors for the calling CPU. Must only be called after [`init`] has run
/// on this CPU.
pub fn selectors(cpu_index: usize) -> &'static Selectors {
    &TABLES[cpu_index].get().expect("gdt::init not called for this cpu").selectors
}

/// Update the kernel stack pointer (RSP0) in CPU `cpu_index`'s TSS. Called
/// by the scheduler when switching to a thread with a different kernel
/// stack; must be called with interrupts disabled.
pub fn set_kernel_stack(cpu_index: usize, stack_top: u64) {
    let table = TABLES[cpu_index].get().expect("gdt::init not called for this cpu");
    // SAFETY: only the owning CPU calls this, with interrupts disabled, so
    // there is no concurrent access to the TSS.
    unsafe {
        let tss_ptr = &table.tss as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss_ptr).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}

/// Read the current kernel stack pointer (RSP0) for `cpu_index`.
pub fn get_kernel_stack(cpu_index: usize) -> u64 {
    TABLES[cpu_index]
        .get()
        .expect("gdt::init not called for this cpu")
        .tss
        .privilege_stack_table[0]
        .as_u64()
}
