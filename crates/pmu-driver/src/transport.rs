//! Transport abstraction for the PMU register block and DMEM
//!
//! The channel never touches hardware directly. Everything goes through a
//! [`PmuTransport`]: 32-bit register access plus byte copies into and out of
//! falcon DMEM. The DMEM copies have default implementations that drive the
//! falcon's auto-incrementing DMEMC/DMEMD port, so a transport only needs to
//! provide register access.
//!
//! Polling loops take their notion of time from a [`Clock`] so tests can run
//! them against a [`VirtualClock`] without sleeping.

use crate::error::{PmuError, Result};
use pmu_chip::queue::align;
use pmu_chip::regs::{self, dmemc_bits};
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// DMEM port used by the host driver.
pub const HOST_DMEM_PORT: u32 = 0;

/// Register and DMEM access to one PMU instance.
pub trait PmuTransport: Debug + Send + Sync {
    /// Read a 32-bit register.
    fn read_register(&self, addr: u32) -> u32;

    /// Write a 32-bit register.
    fn write_register(&self, addr: u32, value: u32);

    /// Copy `src` into DMEM at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`PmuError::Alignment`] if `offset` is not word aligned, or a
    /// transport error if the port did not advance by the expected amount.
    fn copy_in(&self, offset: u32, src: &[u8]) -> Result<()> {
        port_copy_in(self, HOST_DMEM_PORT, offset, src)
    }

    /// Copy DMEM at `offset` into `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`PmuError::Alignment`] if `offset` is not word aligned.
    fn copy_out(&self, offset: u32, dst: &mut [u8]) -> Result<()> {
        port_copy_out(self, HOST_DMEM_PORT, offset, dst)
    }
}

/// Write `src` to DMEM through the DMEMC/DMEMD auto-increment port.
///
/// # Errors
///
/// Misaligned offset or a port that did not consume every word.
#[allow(clippy::cast_possible_truncation)]
pub fn port_copy_in<T: PmuTransport + ?Sized>(
    io: &T,
    port: u32,
    offset: u32,
    src: &[u8],
) -> Result<()> {
    if src.is_empty() {
        tracing::trace!("copy_in of zero bytes at {offset:#x} ignored");
        return Ok(());
    }
    if offset & 0x3 != 0 {
        tracing::error!("dst {offset:#010x} not 4-byte aligned");
        return Err(PmuError::Alignment { offset });
    }

    let dst = offset & dmemc_bits::ADDR_MASK;
    io.write_register(regs::dmemc(port), dst | dmemc_bits::AINCW);

    let mut words = src.chunks_exact(4);
    for word in &mut words {
        io.write_register(
            regs::dmemd(port),
            u32::from_le_bytes([word[0], word[1], word[2], word[3]]),
        );
    }
    let tail = words.remainder();
    if !tail.is_empty() {
        let mut last = [0u8; 4];
        last[..tail.len()].copy_from_slice(tail);
        io.write_register(regs::dmemd(port), u32::from_le_bytes(last));
    }

    let size = align(src.len() as u32);
    let reached = io.read_register(regs::dmemc(port)) & dmemc_bits::ADDR_MASK;
    let expected = (dst + size) & dmemc_bits::ADDR_MASK;
    if reached != expected {
        return Err(PmuError::transport(format!(
            "DMEM copy failed: bytes written {}, expected {size}",
            reached.wrapping_sub(dst)
        )));
    }
    Ok(())
}

/// Read DMEM into `dst` through the DMEMC/DMEMD auto-increment port.
///
/// # Errors
///
/// Misaligned offset.
pub fn port_copy_out<T: PmuTransport + ?Sized>(
    io: &T,
    port: u32,
    offset: u32,
    dst: &mut [u8],
) -> Result<()> {
    if dst.is_empty() {
        tracing::trace!("copy_out of zero bytes at {offset:#x} ignored");
        return Ok(());
    }
    if offset & 0x3 != 0 {
        tracing::error!("src {offset:#010x} not 4-byte aligned");
        return Err(PmuError::Alignment { offset });
    }

    io.write_register(
        regs::dmemc(port),
        (offset & dmemc_bits::ADDR_MASK) | dmemc_bits::AINCR,
    );

    let mut words = dst.chunks_exact_mut(4);
    for word in &mut words {
        word.copy_from_slice(&io.read_register(regs::dmemd(port)).to_le_bytes());
    }
    let tail = words.into_remainder();
    if !tail.is_empty() {
        let data = io.read_register(regs::dmemd(port)).to_le_bytes();
        let n = tail.len();
        tail.copy_from_slice(&data[..n]);
    }
    Ok(())
}

/// Transport wrapper that hands the DMEM port to one copy at a time.
///
/// DMEMC holds the port address, so a copy is only correct if nobody
/// reprograms it between the DMEMC write and the last DMEMD access. Every
/// producer and the message consumer share the host port; the channel wraps
/// its transport in one of these.
#[derive(Debug)]
pub struct SerializedPort {
    inner: Arc<dyn PmuTransport>,
    port: Mutex<()>,
}

impl SerializedPort {
    /// Serialize DMEM copies made through `inner`.
    pub fn new(inner: Arc<dyn PmuTransport>) -> Self {
        Self {
            inner,
            port: Mutex::new(()),
        }
    }
}

impl PmuTransport for SerializedPort {
    fn read_register(&self, addr: u32) -> u32 {
        self.inner.read_register(addr)
    }

    fn write_register(&self, addr: u32, value: u32) {
        self.inner.write_register(addr, value);
    }

    fn copy_in(&self, offset: u32, src: &[u8]) -> Result<()> {
        let _port = self.port.lock().unwrap_or_else(PoisonError::into_inner);
        self.inner.copy_in(offset, src)
    }

    fn copy_out(&self, offset: u32, dst: &mut [u8]) -> Result<()> {
        let _port = self.port.lock().unwrap_or_else(PoisonError::into_inner);
        self.inner.copy_out(offset, dst)
    }
}

/// Time source for bounded polling loops.
pub trait Clock: Debug + Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Block the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Clock whose `sleep` advances virtual time instantly.
#[derive(Debug)]
pub struct VirtualClock {
    base: Instant,
    elapsed: Mutex<Duration>,
}

impl VirtualClock {
    /// Start a virtual clock at the current instant.
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    /// Virtual time slept so far.
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        let mut elapsed = self
            .elapsed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *elapsed += duration;
    }
}

/// Poll `attempt` until it yields a value or `timeout` elapses on `clock`.
///
/// `attempt` returns `None` to ask for another round after `interval`.
/// The returned error carries the time actually waited.
pub(crate) fn poll_until<T>(
    clock: &dyn Clock,
    timeout: Duration,
    interval: Duration,
    mut attempt: impl FnMut() -> Result<Option<T>>,
) -> std::result::Result<Result<T>, Duration> {
    let start = clock.now();
    loop {
        match attempt() {
            Ok(Some(value)) => return Ok(Ok(value)),
            Ok(None) => {}
            Err(e) => return Ok(Err(e)),
        }
        let waited = clock.now().saturating_duration_since(start);
        if waited >= timeout {
            return Err(waited);
        }
        clock.sleep(interval);
    }
}
