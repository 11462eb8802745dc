//! Local APIC and I/O APIC support for x86_64.
//!
//! Provides initialization and control of the Local APIC (interrupt delivery to
//! the local CPU) and I/O APIC (external interrupt routing). This module is
//! additive to the existing PIC (8259) setup -- the PIC remains as a fallback
//! while the APIC handles advanced interrupt routing.
//!
//! The Local APIC is memory-mapped at 0xFEE0_0000 (identity-mapped by the
//! bootloader). The I/O APIC is at 0xFEC0_0000 with indirect register access
//! via IOREGSEL/IOWIN.

use core::{
    ptr,
    sync::atomic::{AtomicBool, Ordering},
};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

// ---------------------------------------------------------------------------
// MSR addresses
// ---------------------------------------------------------------------------

/// IA32_APIC_BASE MSR address. Contains the APIC base physical address and
/// enable/BSP flags.
const IA32_APIC_BASE_MSR: u32 = 0x1B;

/// Bit 11 of IA32_APIC_BASE: global APIC enable.
const IA32_APIC_BASE_ENABLE: u64 = 1 << 11;

// ---------------------------------------------------------------------------
// Local APIC register offsets (byte offsets from APIC base)
// ---------------------------------------------------------------------------

/// Local APIC ID register.
const LAPIC_ID: u32 = 0x020;
/// Local APIC Version register.
const LAPIC_VERSION: u32 = 0x030;
/// Task Priority Register -- controls interrupt priority filtering.
const LAPIC_TPR: u32 = 0x080;
/// End-Of-Interrupt register -- write 0 to signal interrupt completion.
const LAPIC_EOI: u32 = 0x0B0;
/// Spurious Interrupt Vector register -- also contains the software enable bit.
const LAPIC_SVR: u32 = 0x0F0;
/// In-Service Register (ISR) base -- 8 consecutive 32-bit registers.
#[allow(dead_code)]
const LAPIC_ISR_BASE: u32 = 0x100;
/// Trigger Mode Register (TMR) base.
#[allow(dead_code)]
const LAPIC_TMR_BASE: u32 = 0x180;
/// Interrupt Request Register (IRR) base.
#[allow(dead_code)]
const LAPIC_IRR_BASE: u32 = 0x200;
/// Error Status Register.
#[allow(dead_code)]
const LAPIC_ESR: u32 = 0x280;
/// Interrupt Command Register (low 32 bits).
const LAPIC_ICR_LOW: u32 = 0x300;
/// Interrupt Command Register (high 32 bits -- destination field).
const LAPIC_ICR_HIGH: u32 = 0x310;
/// LVT Timer register.
const LAPIC_LVT_TIMER: u32 = 0x320;
/// LVT LINT0 register.
const LAPIC_LVT_LINT0: u32 = 0x350;
/// LVT LINT1 register.
const LAPIC_LVT_LINT1: u32 = 0x360;
/// LVT Error register.
const LAPIC_LVT_ERROR: u32 = 0x370;
/// Timer Initial Count register.
const LAPIC_TIMER_INIT_COUNT: u32 = 0x380;
/// Timer Current Count register (read-only).
const LAPIC_TIMER_CUR_COUNT: u32 = 0x390;
/// Timer Divide Configuration register.
const LAPIC_TIMER_DIV: u32 = 0x3E0;

/// ICR delivery mode: INIT (bits 10:8 = 101).
const ICR_DELIVERY_INIT: u32 = 0b101 << 8;
/// ICR delivery mode: Startup (bits 10:8 = 110).
const ICR_DELIVERY_STARTUP: u32 = 0b110 << 8;
/// ICR level bit (14), asserted for INIT.
const ICR_LEVEL_ASSERT: u32 = 1 << 14;

/// LVT mask bit (bit 16) -- when set, the interrupt is masked.
const LVT_MASK: u32 = 1 << 16;

/// Spurious Vector Register software enable bit (bit 8).
const SVR_ENABLE: u32 = 1 << 8;

/// Default spurious interrupt vector number (0xFF by convention).
const SPURIOUS_VECTOR: u8 = 0xFF;

// ---------------------------------------------------------------------------
// LVT Timer mode bits
// ---------------------------------------------------------------------------

/// One-shot timer mode (bits 18:17 = 00). The scheduler rearms the timer
/// itself before every quantum rather than relying on hardware reload, so
/// this is the only mode the LVT timer entry ever uses.
const TIMER_MODE_ONESHOT: u32 = 0b00 << 17;

/// ICR delivery status bit (bit 12, read-only): 1 while the last-written
/// IPI is still in flight, 0 once delivery completes.
const ICR_DELIVERY_STATUS_PENDING: u32 = 1 << 12;

// ---------------------------------------------------------------------------
// I/O APIC
// ---------------------------------------------------------------------------

/// Default I/O APIC MMIO base address (QEMU virt machine).
const IOAPIC_BASE: usize = 0xFEC0_0000;

/// I/O APIC Register Select (write the register index here).
const IOREGSEL: u32 = 0x00;
/// I/O APIC Window (read/write the selected register through here).
const IOWIN: u32 = 0x10;

/// I/O APIC ID register.
#[allow(dead_code)]
const IOAPIC_REG_ID: u32 = 0x00;
/// I/O APIC Version register.
const IOAPIC_REG_VER: u32 = 0x01;

/// I/O APIC redirection table entry base (each entry uses two 32-bit
/// registers).
const IOAPIC_REDTBL_BASE: u32 = 0x10;

// ---------------------------------------------------------------------------
// Redirection table entry bitfields
// ---------------------------------------------------------------------------

/// Redirection table entry -- represents a 64-bit I/O APIC routing entry.
///
/// Layout:
/// - Bits  7:0  -- Interrupt vector
/// - Bits 10:8  -- Delivery mode (000=Fixed, 001=LowestPri, 010=SMI, 100=NMI,
///   101=INIT, 111=ExtINT)
/// - Bit  11    -- Destination mode (0=Physical, 1=Logical)
/// - Bit  12    -- Delivery status (read-only: 0=idle, 1=pending)
/// - Bit  13    -- Pin polarity (0=active high, 1=active low)
/// - Bit  14    -- Remote IRR (read-only, level-triggered)
/// - Bit  15    -- Trigger mode (0=edge, 1=level)
/// - Bit  16    -- Mask (1=masked)
/// - Bits 63:56 -- Destination APIC ID (physical mode)
#[derive(Debug, Clone, Copy)]
pub struct RedirectionEntry {
    raw: u64,
}

impl RedirectionEntry {
    /// Create a new masked redirection entry with the given vector.
    pub const fn new(vector: u8) -> Self {
        Self {
            raw: (vector as u64) | ((1u64) << 16), // masked by default
        }
    }

    /// Set the interrupt vector (bits 7:0).
    pub fn set_vector(&mut self, vector: u8) {
        self.raw = (self.raw & !0xFF) | (vector as u64);
    }

    /// Get the interrupt vector.
    #[allow(dead_code)]
    pub fn vector(&self) -> u8 {
        (self.raw & 0xFF) as u8
    }

    /// Set delivery mode (bits 10:8).
    /// 0=Fixed, 1=LowestPriority, 2=SMI, 4=NMI, 5=INIT, 7=ExtINT.
    #[allow(dead_code)]
    pub fn set_delivery_mode(&mut self, mode: u8) {
        self.raw = (self.raw & !(0b111 << 8)) | (((mode & 0b111) as u64) << 8);
    }

    /// Set destination mode (bit 11). 0=Physical, 1=Logical.
    #[allow(dead_code)]
    pub fn set_dest_mode_logical(&mut self, logical: bool) {
        if logical {
            self.raw |= 1 << 11;
        } else {
            self.raw &= !(1 << 11);
        }
    }

    /// Set pin polarity (bit 13). false=active high, true=active low.
    #[allow(dead_code)]
    pub fn set_active_low(&mut self, active_low: bool) {
        if active_low {
            self.raw |= 1 << 13;
        } else {
            self.raw &= !(1 << 13);
        }
    }

    /// Set trigger mode (bit 15). false=edge, true=level.
    #[allow(dead_code)]
    pub fn set_level_triggered(&mut self, level: bool) {
        if level {
            self.raw |= 1 << 15;
        } else {
            self.raw &= !(1 << 15);
        }
    }

    /// Set mask bit (bit 16). true=masked.
    pub fn set_masked(&mut self, masked: bool) {
        if masked {
            self.raw |= 1 << 16;
        } else {
            self.raw &= !(1 << 16);
        }
    }

    /// Check if the entry is masked.
    pub fn is_masked(&self) -> bool {
        self.raw & (1 << 16) != 0
    }

    /// Set destination APIC ID (bits 63:56).
    pub fn set_destination(&mut self, dest: u8) {
        self.raw = (self.raw & !(0xFFu64 << 56)) | ((dest as u64) << 56);
    }

    /// Get the low 32 bits of the entry.
    pub fn low(&self) -> u32 {
        self.raw as u32
    }

    /// Get the high 32 bits of the entry.
    pub fn high(&self) -> u32 {
        (self.raw >> 32) as u32
    }

    /// Construct from low and high 32-bit halves.
    pub fn from_parts(low: u32, high: u32) -> Self {
        Self {
            raw: (low as u64) | ((high as u64) << 32),
        }
    }
}

// ---------------------------------------------------------------------------
// Local APIC
// ---------------------------------------------------------------------------

/// Local APIC controller.
///
/// Wraps the memory-mapped register file for the per-CPU Local APIC. All
/// register accesses use volatile reads/writes to prevent compiler reordering.
pub struct LocalApic {
    /// Virtual address of the APIC MMIO base (identity-mapped at 0xFEE0_0000).
    base: usize,
}

impl LocalApic {
    /// Create a new `LocalApic` handle with the given MMIO base address.
    fn new(base: usize) -> Self {
        Self { base }
    }

    /// Read a 32-bit Local APIC register at the given byte offset.
    fn read(&self, offset: u32) -> u32 {
        let addr = self.base + offset as usize;
        // SAFETY: The address `self.base + offset` points to a well-known Local
        // APIC MMIO register. The APIC region at 0xFEE0_0000 is identity-mapped
        // by the bootloader and reserved in the frame allocator. Volatile read
        // ensures the compiler does not elide or reorder the access.
        unsafe { ptr::read_volatile(addr as *const u32) }
    }

    /// Write a 32-bit value to a Local APIC register at the given byte offset.
    fn write(&self, offset: u32, value: u32) {
        let addr = self.base + offset as usize;
        // SAFETY: Same as `read` -- the address is a valid APIC MMIO register.
        // Volatile write ensures the hardware sees the store in program order.
        unsafe { ptr::write_volatile(addr as *mut u32, value) }
    }

    /// Read the Local APIC ID (bits 31:24 of the ID register).
    pub fn read_id(&self) -> u8 {
        ((self.read(LAPIC_ID) >> 24) & 0xFF) as u8
    }

    /// Read the Local APIC version register.
    #[allow(dead_code)]
    pub fn read_version(&self) -> u32 {
        self.read(LAPIC_VERSION)
    }

    /// Enable the Local APIC by setting the software-enable bit in the
    /// Spurious Interrupt Vector register and configuring the spurious vector.
    fn enable(&self) {
        // Set spurious vector to 0xFF and set the software-enable bit (bit 8).
        self.write(LAPIC_SVR, SVR_ENABLE | SPURIOUS_VECTOR as u32);
    }

    /// Mask all Local Vector Table entries (Timer, LINT0, LINT1, Error) to
    /// prevent unexpected interrupts before they are explicitly configured.
    fn mask_all_lvt(&self) {
        self.write(LAPIC_LVT_TIMER, LVT_MASK);
        self.write(LAPIC_LVT_LINT0, LVT_MASK);
        self.write(LAPIC_LVT_LINT1, LVT_MASK);
        self.write(LAPIC_LVT_ERROR, LVT_MASK);
    }

    /// Send an End-Of-Interrupt signal. Must be called at the end of every
    /// Local APIC interrupt handler.
    pub fn send_eoi(&self) {
        self.write(LAPIC_EOI, 0);
    }

    /// Set the Task Priority Register to allow all interrupts (priority 0).
    fn set_task_priority(&self, priority: u8) {
        self.write(LAPIC_TPR, priority as u32);
    }

    /// Configure the APIC timer for a single one-shot interrupt.
    ///
    /// - `vector`: IDT vector number for the timer interrupt.
    /// - `divide`: Timer divisor encoded as the Divide Configuration Register
    ///   value (e.g., 0x03 = divide by 16, 0x0B = divide by 1).
    /// - `initial_count`: Countdown value for this quantum. The timer fires
    ///   once it reaches zero and does not reload; the caller must rewrite
    ///   the initial count again before the next quantum (see
    ///   [`Self::rearm_timer`]).
    pub fn setup_timer(&self, vector: u8, divide: u8, initial_count: u32) {
        // Stop the timer first.
        self.write(LAPIC_TIMER_INIT_COUNT, 0);

        // Set the divide configuration.
        self.write(LAPIC_TIMER_DIV, divide as u32);

        // Configure LVT Timer: one-shot mode, unmasked, with the given vector.
        self.write(LAPIC_LVT_TIMER, TIMER_MODE_ONESHOT | vector as u32);

        // Setting the initial count starts the timer.
        self.write(LAPIC_TIMER_INIT_COUNT, initial_count);
    }

    /// Rewrite the initial count to arm the next one-shot quantum. The LVT
    /// timer entry (mode, vector) is left as [`Self::setup_timer`] last
    /// configured it.
    pub fn rearm_timer(&self, initial_count: u32) {
        self.write(LAPIC_TIMER_INIT_COUNT, initial_count);
    }

    /// Stop the APIC timer by zeroing the initial count and masking the LVT
    /// Timer entry.
    pub fn stop_timer(&self) {
        self.write(LAPIC_TIMER_INIT_COUNT, 0);
        self.write(LAPIC_LVT_TIMER, LVT_MASK);
    }

    /// Read the current timer count (counts down from the initial value).
    #[allow(dead_code)]
    pub fn read_timer_count(&self) -> u32 {
        self.read(LAPIC_TIMER_CUR_COUNT)
    }

    /// Spin until the ICR's delivery-status bit clears, i.e. the
    /// previously-written ICR-low has finished sending. Must be called
    /// after every ICR-low write before the register is touched again.
    fn wait_for_delivery(&self) {
        while self.read(LAPIC_ICR_LOW) & ICR_DELIVERY_STATUS_PENDING != 0 {
            core::hint::spin_loop();
        }
    }

    /// Write the Interrupt Command Register to send an IPI.
    ///
    /// - `dest`: Destination APIC ID.
    /// - `vector`: Interrupt vector.
    #[allow(dead_code)]
    pub fn send_ipi(&self, dest: u8, vector: u8) {
        // Write high dword first (destination in bits 31:24).
        self.write(LAPIC_ICR_HIGH, (dest as u32) << 24);
        // Write low dword (vector + delivery mode Fixed). Writing ICR low
        // triggers the IPI.
        self.write(LAPIC_ICR_LOW, vector as u32);
        self.wait_for_delivery();
    }

    /// Send an IPI using a destination shorthand instead of a specific APIC
    /// ID (bits 19:18 of the ICR low dword: 00=none, 01=self, 10=all
    /// including self, 11=all excluding self).
    pub fn send_ipi_shorthand(&self, vector: u8, shorthand: u8) {
        self.write(LAPIC_ICR_LOW, (vector as u32) | ((shorthand as u32 & 0b11) << 18));
        self.wait_for_delivery();
    }

    /// Send an INIT IPI (delivery mode 101, level-asserted) to `dest`, the
    /// first step of the Intel MP Specification startup sequence.
    pub fn send_init_ipi(&self, dest: u8) {
        self.write(LAPIC_ICR_HIGH, (dest as u32) << 24);
        self.write(LAPIC_ICR_LOW, ICR_DELIVERY_INIT | ICR_LEVEL_ASSERT);
        self.wait_for_delivery();
    }

    /// Send a Startup IPI (delivery mode 110) to `dest`, naming
    /// `vector_page` as the physical page (`addr >> 12`) the target CPU
    /// should begin executing at in real mode.
    pub fn send_startup_ipi(&self, dest: u8, vector_page: u8) {
        self.write(LAPIC_ICR_HIGH, (dest as u32) << 24);
        self.write(LAPIC_ICR_LOW, ICR_DELIVERY_STARTUP | vector_page as u32);
        self.wait_for_delivery();
    }
}

// ---------------------------------------------------------------------------
// I/O APIC
// ---------------------------------------------------------------------------

/// I/O APIC controller.
///
/// The I/O APIC uses indirect register access: write the register index to
/// IOREGSEL, then read/write the value through IOWIN.
pub struct IoApic {
    /// Virtual address of the I/O APIC MMIO base (identity-mapped at
    /// 0xFEC0_0000).
    base: usize,
    /// Global System Interrupt number of this I/O APIC's first input pin,
    /// from the MADT I/O APIC entry. Redirection-table indices are local to
    /// the owning I/O APIC, so a GSI must be translated to
    /// `gsi - gsi_base` before it can index the table.
    gsi_base: u32,
}

impl IoApic {
    /// Create a new `IoApic` handle with the given MMIO base address and
    /// GSI base.
    fn new(base: usize, gsi_base: u32) -> Self {
        Self { base, gsi_base }
    }

    /// Whether this I/O APIC owns the given GSI.
    fn owns_gsi(&self, gsi: u32) -> bool {
        gsi >= self.gsi_base && gsi - self.gsi_base < self.max_redirection_entries() as u32
    }

    /// Read a 32-bit I/O APIC register.
    pub fn read_register(&self, reg: u32) -> u32 {
        // SAFETY: IOREGSEL at base+0x00 and IOWIN at base+0x10 are the I/O
        // APIC's indirect register access ports. The base address 0xFEC0_0000
        // is identity-mapped by the bootloader. Volatile writes ensure the
        // register select is visible to hardware before the window read.
        unsafe {
            ptr::write_volatile((self.base + IOREGSEL as usize) as *mut u32, reg);
            ptr::read_volatile((self.base + IOWIN as usize) as *const u32)
        }
    }

    /// Write a 32-bit value to an I/O APIC register.
    pub fn write_register(&self, reg: u32, value: u32) {
        // SAFETY: Same as `read_register` -- indirect MMIO access through
        // IOREGSEL/IOWIN. The volatile operations guarantee ordering.
        unsafe {
            ptr::write_volatile((self.base + IOREGSEL as usize) as *mut u32, reg);
            ptr::write_volatile((self.base + IOWIN as usize) as *mut u32, value);
        }
    }

    /// Read the maximum number of redirection entries supported by this I/O
    /// APIC (from bits 23:16 of the version register, plus one).
    pub fn max_redirection_entries(&self) -> u8 {
        let ver = self.read_register(IOAPIC_REG_VER);
        (((ver >> 16) & 0xFF) + 1) as u8
    }

    /// Read a full 64-bit redirection table entry at the given index local
    /// to this I/O APIC (`gsi - gsi_base`, not a raw ISA IRQ number).
    fn read_redirection(&self, local_index: u8) -> RedirectionEntry {
        let reg_base = IOAPIC_REDTBL_BASE + (local_index as u32) * 2;
        let low = self.read_register(reg_base);
        let high = self.read_register(reg_base + 1);
        RedirectionEntry::from_parts(low, high)
    }

    /// Write a full 64-bit redirection table entry at the given local index.
    fn write_redirection(&self, local_index: u8, entry: RedirectionEntry) {
        let reg_base = IOAPIC_REDTBL_BASE + (local_index as u32) * 2;
        // Write high dword first to avoid a transient unmasked state if the
        // low dword unmasks the entry.
        self.write_register(reg_base + 1, entry.high());
        self.write_register(reg_base, entry.low());
    }

    /// Route `gsi` (which this I/O APIC must own) to a specific interrupt
    /// vector and destination APIC ID, with the given trigger mode and
    /// polarity.
    pub fn redirect(&self, gsi: u32, vector: u8, dest: u8, level_triggered: bool, active_low: bool) {
        let local_index = (gsi - self.gsi_base) as u8;
        let mut entry = RedirectionEntry::new(vector);
        entry.set_destination(dest);
        entry.set_level_triggered(level_triggered);
        entry.set_active_low(active_low);
        entry.set_masked(false);
        self.write_redirection(local_index, entry);
    }

    /// Mask `gsi` (which this I/O APIC must own) in the redirection table.
    pub fn mask_gsi(&self, gsi: u32) {
        let local_index = (gsi - self.gsi_base) as u8;
        let mut entry = self.read_redirection(local_index);
        entry.set_masked(true);
        self.write_redirection(local_index, entry);
    }

    /// Unmask `gsi` (which this I/O APIC must own) in the redirection table.
    pub fn unmask_gsi(&self, gsi: u32) {
        let local_index = (gsi - self.gsi_base) as u8;
        let mut entry = self.read_redirection(local_index);
        entry.set_masked(false);
        self.write_redirection(local_index, entry);
    }

    /// Mask all redirection entries owned by this I/O APIC.
    fn mask_all(&self) {
        let max = self.max_redirection_entries();
        for local_index in 0..max {
            let mut entry = self.read_redirection(local_index);
            entry.set_masked(true);
            self.write_redirection(local_index, entry);
        }
    }
}

// ---------------------------------------------------------------------------
// PIT channel 2 (8254) -- used only to calibrate the Local APIC timer
// ---------------------------------------------------------------------------

/// PIT mode/command register.
const PIT_COMMAND: u16 = 0x43;
/// PIT channel 2 data port.
const PIT_CHANNEL2_DATA: u16 = 0x42;
/// NMI/speaker gate register (also exposes PIT channel 2's output on bit 5).
const PIT_GATE_PORT: u16 = 0x61;
/// PIT input clock frequency in Hz.
const PIT_FREQUENCY_HZ: u32 = 1_193_182;

/// Calibrate the Local APIC timer by counting how far it decrements while a
/// known interval elapses on PIT channel 2.
///
/// `divide` must match the divide configuration the caller will later pass
/// to [`setup_timer`]. Returns the number of APIC timer ticks that elapsed
/// during `millis` milliseconds, i.e. the `initial_count` to use for a timer
/// period of `millis` milliseconds at that divide setting.
///
/// Must run after [`init`] (the Local APIC must already be mapped and
/// enabled) and before interrupts are enabled, since it busy-waits with the
/// timer masked.
pub fn calibrate_against_pit(millis: u32, divide: u8) -> KernelResult<u32> {
    let state = APIC_STATE.lock();
    let lapic = match state.as_ref() {
        Some(s) => &s.local_apic,
        None => return Err(KernelError::Unsupported { feature: "APIC" }),
    };

    let reload = (PIT_FREQUENCY_HZ as u64 * millis as u64 / 1000) as u16;

    // SAFETY: these ports are the standard 8254 PIT and NMI/gate registers,
    // accessed in the documented order (mode/command, then the LSB/MSB of
    // the reload count).
    unsafe {
        // Channel 2, mode 0 (interrupt on terminal count), lobyte/hibyte.
        super::outb(PIT_COMMAND, 0b1011_0000);
        super::outb(PIT_CHANNEL2_DATA, (reload & 0xFF) as u8);
        super::outb(PIT_CHANNEL2_DATA, (reload >> 8) as u8);

        // Re-arm the gate: clear then set bit 0 to restart the count, and
        // clear bit 1 so the speaker itself stays silent.
        let gate = super::inb(PIT_GATE_PORT);
        super::outb(PIT_GATE_PORT, (gate & !0x02) & !0x01);
        super::outb(PIT_GATE_PORT, (gate & !0x02) | 0x01);
    }

    lapic.write(LAPIC_TIMER_DIV, divide as u32);
    lapic.write(LAPIC_TIMER_INIT_COUNT, u32::MAX);

    // SAFETY: bit 5 of the gate port reflects channel 2's OUT line, which
    // goes high once the loaded count reaches zero in mode 0.
    while unsafe { super::inb(PIT_GATE_PORT) } & 0x20 == 0 {
        core::hint::spin_loop();
    }

    let elapsed = u32::MAX - lapic.read_timer_count();
    lapic.stop_timer();

    println!(
        "[APIC] PIT calibration: {} ticks over {} ms (divide={:#x})",
        elapsed, millis, divide
    );

    Ok(elapsed)
}

/// Busy-wait for approximately `micros` microseconds using PIT channel 2,
/// independent of the Local APIC timer. Used by SMP bring-up's INIT/SIPI
/// deassert delays, which must work whether or not the calling CPU's Local
/// APIC timer is programmed yet. Capped at one PIT reload's worth (~54ms);
/// callers needing longer waits loop this in chunks.
pub fn pit_stall_micros(micros: u32) {
    let reload = ((PIT_FREQUENCY_HZ as u64 * micros as u64) / 1_000_000)
        .clamp(1, u16::MAX as u64) as u16;

    // SAFETY: same documented 8254 channel 2 one-shot programming sequence
    // as `calibrate_against_pit`, used here purely as a delay loop.
    unsafe {
        super::outb(PIT_COMMAND, 0b1011_0000);
        super::outb(PIT_CHANNEL2_DATA, (reload & 0xFF) as u8);
        super::outb(PIT_CHANNEL2_DATA, (reload >> 8) as u8);

        let gate = super::inb(PIT_GATE_PORT);
        super::outb(PIT_GATE_PORT, (gate & !0x02) & !0x01);
        super::outb(PIT_GATE_PORT, (gate & !0x02) | 0x01);
    }

    // SAFETY: bit 5 of the gate port reflects channel 2's OUT line.
    while unsafe { super::inb(PIT_GATE_PORT) } & 0x20 == 0 {
        core::hint::spin_loop();
    }
}

// ---------------------------------------------------------------------------
// Global APIC state (no static mut -- uses spin::Mutex)
// ---------------------------------------------------------------------------

/// Maximum number of I/O APICs this kernel tracks. Bring-up targets never
/// exceed a handful of I/O APICs even on multi-socket boards.
const MAX_IO_APICS: usize = 4;

/// Combined Local APIC + I/O APIC state, protected by a spinlock. There can
/// be more than one I/O APIC on real hardware (one per chipset hub); each
/// owns a disjoint GSI range given by its MADT entry's `gsi_base`.
struct ApicState {
    local_apic: LocalApic,
    io_apics: [Option<IoApic>; MAX_IO_APICS],
    io_apic_count: usize,
}

impl ApicState {
    /// Find the I/O APIC that owns `gsi`, if any is configured for it.
    fn io_apic_for_gsi(&self, gsi: u32) -> Option<&IoApic> {
        self.io_apics[..self.io_apic_count]
            .iter()
            .filter_map(|slot| slot.as_ref())
            .find(|ioapic| ioapic.owns_gsi(gsi))
    }
}

// SAFETY: ApicState contains only raw pointer-like fields (usize base
// addresses) and is always accessed under a spinlock, so there are no data
// races.
unsafe impl Send for ApicState {}

/// Global APIC state. Initialized once by `init()`.
static APIC_STATE: Mutex<Option<ApicState>> = Mutex::new(None);

/// Flag indicating whether the APIC subsystem has been initialized.
static APIC_INITIALIZED: AtomicBool = AtomicBool::new(false);

// ---------------------------------------------------------------------------
// MSR helpers (delegated to arch::x86_64::msr module)
// ---------------------------------------------------------------------------

use super::msr::{phys_to_virt, rdmsr, wrmsr};

/// Initialize the Local APIC and I/O APIC.
///
/// This function:
/// 1. Reads the APIC base address from the IA32_APIC_BASE MSR.
/// 2. Ensures the global APIC enable bit is set in the MSR.
/// 3. Translates physical MMIO addresses to virtual using the bootloader's
///    physical memory offset.
/// 4. Initializes the Local APIC (software enable, mask all LVTs, set TPR=0).
/// 5. Initializes the I/O APIC (mask all redirection entries).
///
/// Must be called after GDT/IDT initialization but before interrupts are
/// enabled. Safe to call exactly once; subsequent calls return
/// `AlreadyExists`.
pub fn init() -> KernelResult<()> {
    if APIC_INITIALIZED.load(Ordering::Acquire) {
        return Err(KernelError::Fatal {
            reason: "APIC already initialized",
        });
    }

    // Read APIC base from MSR.
    let apic_base_msr = rdmsr(IA32_APIC_BASE_MSR);
    let apic_base_phys = (apic_base_msr & 0xFFFF_F000) as usize;

    println!(
        "[APIC] IA32_APIC_BASE MSR = {:#x}, physical base = {:#x}",
        apic_base_msr, apic_base_phys
    );

    // Translate physical APIC addresses to virtual addresses.
    // The bootloader maps all physical memory at a dynamic offset; MMIO
    // regions are NOT identity-mapped in a higher-half kernel.
    let lapic_virt = phys_to_virt(apic_base_phys).ok_or(KernelError::Unsupported { feature: "physical memory mapping (APIC)" })?;

    println!("[APIC] Virtual address: LAPIC={:#x}", lapic_virt);

    // Ensure the global enable bit is set.
    if apic_base_msr & IA32_APIC_BASE_ENABLE == 0 {
        println!("[APIC] Global APIC enable bit not set, enabling...");
        wrmsr(IA32_APIC_BASE_MSR, apic_base_msr | IA32_APIC_BASE_ENABLE);
    }

    // --- Local APIC initialization ---
    let lapic = LocalApic::new(lapic_virt);

    // Mask all LVT entries before enabling to prevent spurious interrupts.
    lapic.mask_all_lvt();

    // Enable the Local APIC via the Spurious Vector Register.
    lapic.enable();

    // Allow all interrupt priorities.
    lapic.set_task_priority(0);

    let apic_id = lapic.read_id();
    println!(
        "[APIC] Local APIC enabled (ID={}, SVR={:#x})",
        apic_id,
        lapic.read(LAPIC_SVR)
    );

    // --- I/O APIC initialization ---
    // The MADT can describe more than one I/O APIC; fall back to the
    // well-known QEMU/legacy single-IOAPIC layout if ACPI reported none.
    let mut descriptors: [(u32, u32); MAX_IO_APICS] = [(IOAPIC_BASE as u32, 0); MAX_IO_APICS];
    let mut descriptor_count = 1;
    if let Some(count) = super::acpi::with_acpi_info(|info| {
        let n = info.io_apic_count.min(MAX_IO_APICS);
        for (slot, entry) in descriptors.iter_mut().zip(info.io_apics.iter()).take(n) {
            if let Some(madt_ioapic) = entry {
                *slot = (madt_ioapic.address, madt_ioapic.gsi_base);
            }
        }
        n
    }) {
        if count > 0 {
            descriptor_count = count;
        }
    }

    let mut io_apics: [Option<IoApic>; MAX_IO_APICS] = [None, None, None, None];
    for (slot, &(address, gsi_base)) in io_apics.iter_mut().zip(descriptors.iter()).take(descriptor_count) {
        let virt = phys_to_virt(address as usize).ok_or(KernelError::Unsupported {
            feature: "physical memory mapping (I/O APIC)",
        })?;
        let ioapic = IoApic::new(virt, gsi_base);
        ioapic.mask_all();
        println!(
            "[APIC] I/O APIC at {:#x} (phys {:#x}), gsi_base={}, {} IRQ lines",
            virt,
            address,
            gsi_base,
            ioapic.max_redirection_entries()
        );
        *slot = Some(ioapic);
    }

    // Store global state.
    let mut state = APIC_STATE.lock();
    *state = Some(ApicState {
        local_apic: lapic,
        io_apics,
        io_apic_count: descriptor_count,
    });
    APIC_INITIALIZED.store(true, Ordering::Release);

    println!("[APIC] APIC subsystem initialized successfully");
    Ok(())
}

/// Check whether the APIC subsystem has been initialized.
pub fn is_initialized() -> bool {
    APIC_INITIALIZED.load(Ordering::Acquire)
}

/// Enable the Local APIC on the calling CPU.
///
/// Every CPU's Local APIC sits at the same MMIO base address (the CPU
/// redirects the access to its own device in hardware), so this reuses the
/// `LocalApic` handle [`init`] built on the BSP rather than reinitializing
/// the I/O APIC or the global [`APIC_STATE`] it owns. Called once per AP,
/// right after it lands in 64-bit mode.
pub fn init_ap() -> KernelResult<()> {
    let state = APIC_STATE.lock();
    match state.as_ref() {
        Some(s) => {
            s.local_apic.mask_all_lvt();
            s.local_apic.enable();
            s.local_apic.set_task_priority(0);
            Ok(())
        }
        None => Err(KernelError::Unsupported { feature: "APIC" }),
    }
}

/// Send an End-Of-Interrupt to the Local APIC.
///
/// Must be called at the end of every APIC-sourced interrupt handler.
pub fn send_eoi() {
    let state = APIC_STATE.lock();
    if let Some(ref s) = *state {
        s.local_apic.send_eoi();
    }
}

/// Read the Local APIC ID of the current CPU.
pub fn read_id() -> Option<u8> {
    let state = APIC_STATE.lock();
    state.as_ref().map(|s| s.local_apic.read_id())
}

/// Configure the Local APIC timer for periodic interrupts.
///
/// - `vector`: IDT vector number (e.g., 32 for the timer).
/// - `divide`: Divide configuration register value:
///   - `0x00` = divide by 2
///   - `0x01` = divide by 4
///   - `0x02` = divide by 8
///   - `0x03` = divide by 16
///   - `0x08` = divide by 32
///   - `0x09` = divide by 64
///   - `0x0A` = divide by 128
///   - `0x0B` = divide by 1
/// - `initial_count`: Initial countdown value.
pub fn setup_timer(vector: u8, divide: u8, initial_count: u32) -> KernelResult<()> {
    let state = APIC_STATE.lock();
    match state.as_ref() {
        Some(s) => {
            s.local_apic.setup_timer(vector, divide, initial_count);
            println!(
                "[APIC] Timer configured: vector={}, divide={:#x}, count={}",
                vector, divide, initial_count
            );
            Ok(())
        }
        None => Err(KernelError::Unsupported { feature: "APIC" }),
    }
}

/// Rewrite the initial count to arm the next one-shot quantum, reusing
/// whatever vector/divide [`setup_timer`] last configured.
pub fn rearm_timer(initial_count: u32) -> KernelResult<()> {
    let state = APIC_STATE.lock();
    match state.as_ref() {
        Some(s) => {
            s.local_apic.rearm_timer(initial_count);
            Ok(())
        }
        None => Err(KernelError::Unsupported { feature: "APIC" }),
    }
}

/// Calibrated timer (divide, ticks_per_ms) the BSP settled on, so that
/// [`crate::sched::smp::ap_entry`]-equivalent AP bring-up code, and the
/// scheduler rearming each CPU's one-shot quantum, can derive an initial
/// count for any quantum length without recalibrating against the PIT on
/// every CPU or every switch.
static TIMER_CONFIG: Mutex<Option<(u8, u32)>> = Mutex::new(None);

/// Record the divide setting and per-millisecond tick rate the BSP
/// calibrated, for APs and the scheduler to reuse.
pub fn set_timer_config(divide: u8, ticks_per_ms: u32) {
    *TIMER_CONFIG.lock() = Some((divide, ticks_per_ms));
}

/// The `(divide, ticks_per_ms)` recorded by [`set_timer_config`], if any.
pub fn timer_config() -> Option<(u8, u32)> {
    *TIMER_CONFIG.lock()
}

/// Stop the Local APIC timer.
pub fn stop_timer() -> KernelResult<()> {
    let state = APIC_STATE.lock();
    match state.as_ref() {
        Some(s) => {
            s.local_apic.stop_timer();
            Ok(())
        }
        None => Err(KernelError::Unsupported { feature: "APIC" }),
    }
}

/// Route `gsi` through its owning I/O APIC to a specific interrupt vector
/// and destination CPU, with the given trigger mode and polarity.
///
/// Returns [`KernelError::NotFound`] if no configured I/O APIC's range
/// covers `gsi`.
pub fn redirect(gsi: u32, vector: u8, dest: u8, level_triggered: bool, active_low: bool) -> KernelResult<()> {
    let state = APIC_STATE.lock();
    match state.as_ref() {
        Some(s) => match s.io_apic_for_gsi(gsi) {
            Some(ioapic) => {
                ioapic.redirect(gsi, vector, dest, level_triggered, active_low);
                Ok(())
            }
            None => Err(KernelError::NotFound {
                resource: "I/O APIC owning GSI",
                id: gsi as u64,
            }),
        },
        None => Err(KernelError::Unsupported { feature: "APIC" }),
    }
}

/// Route a legacy ISA IRQ (0-15) through the I/O APIC to a specific
/// interrupt vector and destination CPU.
///
/// Resolves `irq` through the MADT's Interrupt Source Override entries
/// first: a PS/2 keyboard on IRQ 1, for instance, might actually be wired to
/// a different GSI with non-default polarity or trigger mode, and the ISO
/// is the only place that mapping is recorded.
pub fn set_irq_route(irq: u8, vector: u8, dest: u8) -> KernelResult<()> {
    let (gsi, active_low, level_triggered) = super::acpi::with_acpi_info(|info| info.irq_to_gsi(irq))
        .unwrap_or((irq as u32, false, false));
    redirect(gsi, vector, dest, level_triggered, active_low)
}

/// Mask a legacy ISA IRQ in the I/O APIC, resolving ISO overrides the same
/// way [`set_irq_route`] does.
pub fn mask_irq(irq: u8) -> KernelResult<()> {
    let (gsi, _, _) =
        super::acpi::with_acpi_info(|info| info.irq_to_gsi(irq)).unwrap_or((irq as u32, false, false));
    let state = APIC_STATE.lock();
    match state.as_ref() {
        Some(s) => match s.io_apic_for_gsi(gsi) {
            Some(ioapic) => {
                ioapic.mask_gsi(gsi);
                Ok(())
            }
            None => Err(KernelError::NotFound {
                resource: "I/O APIC owning GSI",
                id: gsi as u64,
            }),
        },
        None => Err(KernelError::Unsupported { feature: "APIC" }),
    }
}

/// Unmask a legacy ISA IRQ in the I/O APIC, resolving ISO overrides the same
/// way [`set_irq_route`] does.
pub fn unmask_irq(irq: u8) -> KernelResult<()> {
    let (gsi, _, _) =
        super::acpi::with_acpi_info(|info| info.irq_to_gsi(irq)).unwrap_or((irq as u32, false, false));
    let state = APIC_STATE.lock();
    match state.as_ref() {
        Some(s) => match s.io_apic_for_gsi(gsi) {
            Some(ioapic) => {
                ioapic.unmask_gsi(gsi);
                Ok(())
            }
            None => Err(KernelError::NotFound {
                resource: "I/O APIC owning GSI",
                id: gsi as u64,
            }),
        },
        None => Err(KernelError::Unsupported { feature: "APIC" }),
    }
}

/// Send an Inter-Processor Interrupt via the Local APIC.
///
/// - `dest`: Destination APIC ID.
/// - `vector`: Interrupt vector.
///
/// Runs with this CPU's interrupts masked: the ICR is a single register
/// shared by every sender on this CPU, so an interrupt handler that also
/// sends an IPI while this write is in flight would corrupt it.
#[allow(dead_code)]
pub fn send_ipi(dest: u8, vector: u8) -> KernelResult<()> {
    let _guard = super::disable_interrupts();
    let state = APIC_STATE.lock();
    match state.as_ref() {
        Some(s) => {
            s.local_apic.send_ipi(dest, vector);
            Ok(())
        }
        None => Err(KernelError::Unsupported { feature: "APIC" }),
    }
}

/// Send an IPI to every other CPU (destination shorthand "all excluding
/// self"). Used for TLB shootdown and reschedule IPIs, where the caller
/// doesn't track individual APIC IDs.
pub fn send_ipi_all_but_self(vector: u8) -> KernelResult<()> {
    let _guard = super::disable_interrupts();
    let state = APIC_STATE.lock();
    match state.as_ref() {
        Some(s) => {
            s.local_apic.send_ipi_shorthand(vector, 0b11);
            Ok(())
        }
        None => Err(KernelError::Unsupported { feature: "APIC" }),
    }
}

/// Send an INIT IPI to `dest`. First step of application-processor
/// bring-up; see [`crate::sched::smp`].
pub fn send_init_ipi(dest: u8) -> KernelResult<()> {
    let _guard = super::disable_interrupts();
    let state = APIC_STATE.lock();
    match state.as_ref() {
        Some(s) => {
            s.local_apic.send_init_ipi(dest);
            Ok(())
        }
        None => Err(KernelError::Unsupported { feature: "APIC" }),
    }
}

/// Send a Startup IPI to `dest`, naming the physical page the target CPU
/// should fetch its first real-mode instruction from.
pub fn send_startup_ipi(dest: u8, vector_page: u8) -> KernelResult<()> {
    let _guard = super::disable_interrupts();
    let state = APIC_STATE.lock();
    match state.as_ref() {
        Some(s) => {
            s.local_apic.send_startup_ipi(dest, vector_page);
            Ok(())
        }
        None => Err(KernelError::Unsupported { feature: "APIC" }),
    }
}
