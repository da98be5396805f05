//! Hardware mutex arbiter
//!
//! The falcon exposes a bank of owner registers shared between the host and
//! the firmware. A requester draws a token from the generator register,
//! writes it into the owner register and reads it back: if the read-back
//! matches, it owns the mutex. Ownership is reentrant for a caller that
//! presents the token it already holds.

use crate::error::{PmuError, Result};
use crate::transport::{poll_until, Clock, PmuTransport};
use pmu_chip::regs::{self, mutex_bits};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct HwMutex {
    ref_count: u32,
}

/// Arbiter for the PMU hardware mutex bank.
#[derive(Debug)]
pub struct MutexArbiter {
    io: Arc<dyn PmuTransport>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    poll_interval: Duration,
    mutexes: Vec<Mutex<HwMutex>>,
}

impl MutexArbiter {
    /// Create an arbiter over all [`MUTEX_COUNT`](regs::MUTEX_COUNT) mutexes.
    pub fn new(
        io: Arc<dyn PmuTransport>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            io,
            clock,
            timeout,
            poll_interval,
            mutexes: (0..regs::MUTEX_COUNT).map(|_| Mutex::default()).collect(),
        }
    }

    fn slot(&self, id: u32) -> Result<std::sync::MutexGuard<'_, HwMutex>> {
        let m = self
            .mutexes
            .get(id as usize)
            .ok_or(PmuError::InvalidMutex { id })?;
        Ok(m.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Forget all host-side reference counts.
    pub fn reset(&self) {
        for m in &self.mutexes {
            m.lock().unwrap_or_else(PoisonError::into_inner).ref_count = 0;
        }
    }

    /// Current reference count of mutex `id`.
    pub fn ref_count(&self, id: u32) -> Option<u32> {
        self.slot(id).ok().map(|m| m.ref_count)
    }

    fn owner(&self, id: u32) -> u32 {
        self.io.read_register(regs::mutex(id)) & mutex_bits::VALUE_MASK
    }

    /// Acquire mutex `id`.
    ///
    /// `held` is the token from a previous acquisition by the same caller; if
    /// it still owns the mutex the reference count is bumped without touching
    /// the hardware.
    ///
    /// # Errors
    ///
    /// [`PmuError::InvalidMutex`] for an id outside the bank,
    /// [`PmuError::MutexTimeout`] if the mutex stays contended.
    pub fn acquire(&self, id: u32, held: Option<u32>) -> Result<u32> {
        let mut m = self.slot(id)?;

        if let Some(token) = held {
            if m.ref_count > 0 && token != mutex_bits::INITIAL_LOCK && self.owner(id) == token {
                m.ref_count += 1;
                tracing::trace!("mutex {id} re-entered, ref_count {}", m.ref_count);
                return Ok(token);
            }
        }

        let outcome = poll_until(&*self.clock, self.timeout, self.poll_interval, || {
            let token = self.io.read_register(regs::MUTEX_ID) & mutex_bits::VALUE_MASK;
            if token == mutex_bits::ID_VALUE_INIT || token == mutex_bits::ID_VALUE_NOT_AVAIL {
                tracing::warn!("mutex {id}: reserved token {token:#x} from generator");
                return Ok(None);
            }

            self.io.write_register(regs::mutex(id), token);
            if self.owner(id) == token {
                return Ok(Some(token));
            }

            tracing::trace!("mutex {id} contended, returning token {token:#x}");
            self.io.write_register(regs::MUTEX_ID_RELEASE, token);
            Ok(None)
        });

        match outcome {
            Ok(Ok(token)) => {
                m.ref_count = 1;
                tracing::debug!("mutex {id} acquired, token {token:#x}");
                Ok(token)
            }
            Ok(Err(e)) => Err(e),
            Err(waited) => {
                let waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!("mutex {id} not acquired after {waited_ms}ms");
                Err(PmuError::MutexTimeout { id, waited_ms })
            }
        }
    }

    /// Release one reference to mutex `id` held with `token`.
    ///
    /// # Errors
    ///
    /// [`PmuError::OwnerMismatch`] if `token` does not own the mutex.
    pub fn release(&self, id: u32, token: u32) -> Result<()> {
        let mut m = self.slot(id)?;

        let owner = self.owner(id);
        if owner != token {
            tracing::error!("mutex {id}: requester {token:#x} does not match owner {owner:#x}");
            return Err(PmuError::OwnerMismatch { id, token, owner });
        }

        m.ref_count = m.ref_count.saturating_sub(1);
        if m.ref_count == 0 {
            self.io.write_register(regs::mutex(id), mutex_bits::INITIAL_LOCK);
            self.io.write_register(regs::MUTEX_ID_RELEASE, token);
            tracing::debug!("mutex {id} released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SoftwareFalcon;
    use crate::transport::{SystemClock, VirtualClock};

    fn arbiter(falcon: &Arc<SoftwareFalcon>) -> MutexArbiter {
        MutexArbiter::new(
            Arc::clone(falcon) as Arc<dyn PmuTransport>,
            Arc::new(VirtualClock::new()),
            Duration::from_millis(5),
            Duration::from_millis(1),
        )
    }

    #[test]
    fn acquire_release_roundtrip() {
        let falcon = Arc::new(SoftwareFalcon::new());
        let arb = arbiter(&falcon);
        let token = arb.acquire(3, None).unwrap();
        assert_eq!(falcon.mutex_owner(3), token);
        arb.release(3, token).unwrap();
        assert_eq!(falcon.mutex_owner(3), mutex_bits::INITIAL_LOCK);
    }

    #[test]
    fn reentrant_with_held_token() {
        let falcon = Arc::new(SoftwareFalcon::new());
        let arb = arbiter(&falcon);
        let token = arb.acquire(0, None).unwrap();
        assert_eq!(arb.acquire(0, Some(token)).unwrap(), token);
        assert_eq!(arb.ref_count(0), Some(2));
        arb.release(0, token).unwrap();
        assert_eq!(falcon.mutex_owner(0), token);
        arb.release(0, token).unwrap();
        assert_eq!(falcon.mutex_owner(0), mutex_bits::INITIAL_LOCK);
    }

    #[test]
    fn contended_mutex_times_out() {
        let falcon = Arc::new(SoftwareFalcon::new());
        falcon.hold_mutex(1, 0x42);
        let arb = arbiter(&falcon);
        assert!(matches!(
            arb.acquire(1, None),
            Err(PmuError::MutexTimeout { id: 1, .. })
        ));
        assert_eq!(falcon.mutex_owner(1), 0x42);
    }

    #[test]
    fn reserved_tokens_are_skipped() {
        let falcon = Arc::new(SoftwareFalcon::new());
        falcon.inject_mutex_tokens(&[mutex_bits::ID_VALUE_NOT_AVAIL, mutex_bits::ID_VALUE_INIT]);
        let arb = arbiter(&falcon);
        let token = arb.acquire(2, None).unwrap();
        assert_ne!(token, mutex_bits::ID_VALUE_NOT_AVAIL);
        assert_ne!(token, mutex_bits::ID_VALUE_INIT);
    }

    #[test]
    fn release_by_non_owner_fails() {
        let falcon = Arc::new(SoftwareFalcon::new());
        let arb = arbiter(&falcon);
        let token = arb.acquire(4, None).unwrap();
        let err = arb.release(4, token ^ 0x1).unwrap_err();
        assert!(matches!(err, PmuError::OwnerMismatch { id: 4, .. }));
        assert_eq!(falcon.mutex_owner(4), token);
    }

    #[test]
    fn second_acquirer_waits_for_the_holder() {
        let falcon = Arc::new(SoftwareFalcon::new());
        let arb = Arc::new(MutexArbiter::new(
            Arc::clone(&falcon) as Arc<dyn PmuTransport>,
            Arc::new(SystemClock),
            Duration::from_millis(20),
            Duration::from_micros(50),
        ));
        let token = arb.acquire(0, None).unwrap();

        // Run the generator all the way round so it revisits `token`.
        for _ in 0..300 {
            let t = falcon.read_register(regs::MUTEX_ID);
            falcon.write_register(regs::MUTEX_ID_RELEASE, t);
        }

        let other = Arc::clone(&arb);
        let contender = std::thread::spawn(move || other.acquire(0, None));
        assert!(matches!(
            contender.join().unwrap(),
            Err(PmuError::MutexTimeout { id: 0, .. })
        ));
        assert_eq!(falcon.mutex_owner(0), token);

        arb.release(0, token).unwrap();
        let other = Arc::clone(&arb);
        let next = std::thread::spawn(move || other.acquire(0, None))
            .join()
            .unwrap()
            .unwrap();
        assert_eq!(falcon.mutex_owner(0), next);
    }

    #[test]
    fn invalid_id() {
        let falcon = Arc::new(SoftwareFalcon::new());
        let arb = arbiter(&falcon);
        assert!(matches!(
            arb.acquire(regs::MUTEX_COUNT, None),
            Err(PmuError::InvalidMutex { .. })
        ));
    }
}
