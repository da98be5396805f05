//! PWR register block of the PMU falcon.
//!
//! All offsets are absolute within the GPU register aperture (BAR0). The
//! falcon core registers live at `0x10a000`, the PMU queue/mutex registers
//! follow them in the same 4 KB page.
//!
//! ```text
//! 0x10a000..0x10a020  falcon interrupt set/clear/status/mask/dest
//! 0x10a04c            falcon idle state
//! 0x10a100..0x10a108  cpuctl / bootvec / hwcfg
//! 0x10a1c0..0x10a1e0  DMEM ports (DMEMC/DMEMD pairs, 4 ports)
//! 0x10a488..0x10a48c  mutex token generator / release
//! 0x10a4a0..0x10a4cc  command queue heads/tails, message queue head/tail
//! 0x10a580..0x10a5c0  mutex registers (16)
//! ```

// ── Falcon interrupts ────────────────────────────────────────────────────────

/// Interrupt set register. Writing a bit raises that interrupt.
pub const IRQSSET: u32 = 0x0010_a000;
/// Interrupt clear register. Writing a bit clears it in [`IRQSTAT`].
pub const IRQSCLR: u32 = 0x0010_a004;
/// Pending interrupt status.
pub const IRQSTAT: u32 = 0x0010_a008;
/// Interrupt mask set.
pub const IRQMSET: u32 = 0x0010_a010;
/// Interrupt mask clear.
pub const IRQMCLR: u32 = 0x0010_a014;
/// Current interrupt mask.
pub const IRQMASK: u32 = 0x0010_a018;
/// Interrupt destination (host vs. falcon) and routing.
pub const IRQDEST: u32 = 0x0010_a01c;

/// Falcon idle state (bit 0 falcon busy, bits 1..15 external busy).
pub const IDLESTATE: u32 = 0x0010_a04c;
/// Firmware OS version word.
pub const OS: u32 = 0x0010_a080;
/// CPU control.
pub const CPUCTL: u32 = 0x0010_a100;
/// Hardware configuration (DMEM size in 256-byte blocks at bits 9..17).
pub const HWCFG: u32 = 0x0010_a108;

/// Interrupt bits shared by IRQSSET/IRQSCLR/IRQSTAT/IRQMSET/IRQMCLR/IRQMASK.
pub mod irq {
    /// General purpose timer.
    pub const GPTMR: u32 = 1 << 0;
    /// Watchdog timer.
    pub const WDTMR: u32 = 1 << 1;
    /// Method.
    pub const MTHD: u32 = 1 << 2;
    /// Context switch.
    pub const CTXSW: u32 = 1 << 3;
    /// Falcon halted.
    pub const HALT: u32 = 1 << 4;
    /// External error.
    pub const EXTERR: u32 = 1 << 5;
    /// Software interrupt 0: messages pending in the message queue.
    pub const SWGEN0: u32 = 1 << 6;
    /// Software interrupt 1.
    pub const SWGEN1: u32 = 1 << 7;
    /// External interrupt lines (8 bits).
    pub const EXT: u32 = 0xff << 8;

    /// Everything the host driver unmasks at init.
    pub const HOST_ENABLED: u32 = GPTMR | WDTMR | HALT | EXTERR | SWGEN0 | SWGEN1;
    /// Everything the host driver clears from the mask before reprogramming.
    pub const ALL: u32 = GPTMR | WDTMR | MTHD | CTXSW | HALT | EXTERR | SWGEN0 | SWGEN1 | EXT;
}

/// IRQDEST routing. Low half: 1 = deliver to host. High half: target line.
pub mod irqdest {
    use super::irq;

    /// Interrupts routed to the host.
    pub const HOST: u32 = irq::WDTMR | irq::HALT | irq::SWGEN0 | irq::EXT;
    /// Interrupts delivered on the secondary line.
    pub const TARGET: u32 = (irq::GPTMR | irq::SWGEN1 | irq::EXT) << 16;
    /// Value written at init.
    pub const HOST_DEFAULT: u32 = HOST | TARGET;
}

// ── DMEM ports ───────────────────────────────────────────────────────────────

/// DMEM control register for `port` (address + auto-increment flags).
pub const fn dmemc(port: u32) -> u32 {
    0x0010_a1c0 + port * 8
}

/// DMEM data register for `port`.
pub const fn dmemd(port: u32) -> u32 {
    0x0010_a1c4 + port * 8
}

/// Number of DMEM ports.
pub const DMEM_PORT_COUNT: u32 = 4;

/// DMEMC field definitions.
pub mod dmemc_bits {
    /// Word offset within a block (bits 2..7).
    pub const OFFS_MASK: u32 = 0x0000_00fc;
    /// Block index (bits 8..15).
    pub const BLK_MASK: u32 = 0x0000_ff00;
    /// Address bits honoured by the port.
    pub const ADDR_MASK: u32 = OFFS_MASK | BLK_MASK;
    /// Auto-increment after each DMEMD write.
    pub const AINCW: u32 = 1 << 24;
    /// Auto-increment after each DMEMD read.
    pub const AINCR: u32 = 1 << 25;
}

// ── Mutexes ──────────────────────────────────────────────────────────────────

/// Mutex token generator: each read returns a fresh token.
pub const MUTEX_ID: u32 = 0x0010_a488;
/// Mutex token release: write a token to return it to the free pool.
pub const MUTEX_ID_RELEASE: u32 = 0x0010_a48c;

/// Mutex owner register `index`.
pub const fn mutex(index: u32) -> u32 {
    0x0010_a580 + index * 4
}

/// Number of hardware mutex registers.
pub const MUTEX_COUNT: u32 = 16;

/// Mutex register values.
pub mod mutex_bits {
    /// Owner value field.
    pub const VALUE_MASK: u32 = 0xff;
    /// Owner value of an unlocked mutex.
    pub const INITIAL_LOCK: u32 = 0;
    /// Generator result: "not initialised".
    pub const ID_VALUE_INIT: u32 = 0;
    /// Generator result: "no token available".
    pub const ID_VALUE_NOT_AVAIL: u32 = 0xff;
}

// ── Queues ───────────────────────────────────────────────────────────────────

/// Command queue head register for hardware queue `index`.
pub const fn queue_head(index: u32) -> u32 {
    0x0010_a4a0 + index * 4
}

/// Command queue tail register for hardware queue `index`.
pub const fn queue_tail(index: u32) -> u32 {
    0x0010_a4b0 + index * 4
}

/// Number of command queue head/tail register pairs.
pub const QUEUE_REG_COUNT: u32 = 4;

/// Message queue head (written by firmware).
pub const MSGQ_HEAD: u32 = 0x0010_a4c8;
/// Message queue tail (written by host).
pub const MSGQ_TAIL: u32 = 0x0010_a4cc;

/// Head/tail address field.
pub const QUEUE_ADDR_MASK: u32 = 0xffff_ffff;

// ── Power gating ─────────────────────────────────────────────────────────────

/// Idle filter threshold for engine `engine`.
pub const fn pg_idlefilth(engine: u32) -> u32 {
    0x0010_a6c0 + engine * 4
}

/// Post-power-up idle filter threshold for engine `engine`.
pub const fn pg_ppuidlefilth(engine: u32) -> u32 {
    0x0010_a6e8 + engine * 4
}

/// Size of the register aperture a transport must cover.
pub const APERTURE_SIZE: usize = 0x0010_b000;
