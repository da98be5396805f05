//! Engine-level power gating (ELPG)
//!
//! The firmware gates the graphics engine once the host sends ALLOW and
//! stops doing so once it sends DISALLOW. Acks arrive as PG messages and are
//! the only thing that moves the state to `On` or `Off`.
//!
//! ```text
//!            enable (gate open)              ALLOW_ACK
//!   Off ───────────────────────▶ OnPending ─────────────▶ On
//!    │ ▲                                                   │
//!    │ └──────────────── DISALLOW_ACK ◀── disable ─────────┘
//!    │ enable (gate closed)
//!    ▼
//!   OffOnPending ── disable ──▶ Off
//!               ── debounce expires ──▶ (re-issue enable)
//! ```
//!
//! After every successful disable the gate stays closed for
//! `enable_allow_delay` so the engine is not gated again immediately.

use crate::channel::Shared;
use crate::error::{PmuError, Result};
use crate::seq::{Completion, Response, SeqDesc};
use crate::wait::WaitOutcome;
use crate::wire::{PgMsg, PmuCmd};
use pmu_chip::queue::{HPQ, LPQ};
use pmu_chip::regs;
use pmu_chip::wire::{pg_cmd, pg_msg, ENGINE_GR};
use std::sync::{PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Power-gating state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElpgState {
    /// Not gated
    #[default]
    Off,
    /// ALLOW sent, ack outstanding
    OnPending,
    /// Gated
    On,
    /// Enable requested while the gate was closed
    OffOnPending,
}

/// Snapshot of the power-gating handshake.
#[derive(Debug, Clone, Default)]
pub struct PgStatus {
    /// ELPG state
    pub state: ElpgState,
    /// ALLOW may be sent
    pub enable_allowed: bool,
    /// Firmware acknowledged ELPG INIT
    pub ready: bool,
    /// DMEM offset of the firmware's statistics block (0 until known)
    pub stat_dmem_offset: u32,
    /// Last engine buffer load succeeded
    pub buf_loaded: bool,
    /// Last engine buffer load failed
    pub buf_failed: bool,
    /// Graphics context that ELPG saves and restores exists
    pub context_ready: bool,
    /// Debounce timer armed
    pub timer_pending: bool,
    /// Bumped to cancel an armed debounce timer
    pub timer_generation: u64,
}

fn waited_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Shared {
    fn pg_completion(&self) -> Box<dyn Completion> {
        let weak: Weak<Shared> = self.self_ref.clone();
        Box::new(move |desc: SeqDesc, result: Result<Response>| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_pg_msg(desc, result);
            }
        })
    }

    fn pg_op(&self) -> std::sync::MutexGuard<'_, ()> {
        self.pg_op.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a PG acknowledgement.
    fn handle_pg_msg(&self, desc: SeqDesc, result: Result<Response>) {
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                error!("PG command {desc} aborted: {e}");
                return;
            }
        };
        let msg = match PgMsg::parse(&resp.msg.body) {
            Ok(msg) => msg,
            Err(e) => {
                error!("PG response {desc}: {e}");
                return;
            }
        };

        match (msg.msg_type, msg.msg) {
            (pg_msg::TYPE_ELPG_MSG, pg_msg::ELPG_INIT_ACK) => {
                debug!("ELPG INIT acknowledged");
                self.pg.update(|s| s.ready = true);
            }
            (pg_msg::TYPE_ELPG_MSG, pg_msg::ELPG_ALLOW_ACK) => {
                debug!("ELPG ALLOW acknowledged");
                self.pg.update(|s| s.state = ElpgState::On);
            }
            (pg_msg::TYPE_ELPG_MSG, pg_msg::ELPG_DISALLOW_ACK) => {
                debug!("ELPG DISALLOW acknowledged");
                self.pg.update(|s| s.state = ElpgState::Off);
            }
            (pg_msg::TYPE_STAT, pg_msg::STAT_RESP_DMEM_OFFSET) => {
                debug!("PG statistics at DMEM {:#x}", msg.data);
                self.pg.update(|s| s.stat_dmem_offset = msg.data);
            }
            (pg_msg::TYPE_ENG_BUF_STAT, pg_msg::ENG_BUF_LOADED) => {
                debug!("engine buffer loaded");
                self.pg.update(|s| s.buf_loaded = true);
            }
            (pg_msg::TYPE_ENG_BUF_STAT, pg_msg::ENG_BUF_FAILED) => {
                error!("engine buffer load failed");
                self.pg.update(|s| s.buf_failed = true);
            }
            (t, m) => error!("unsupported PG message type {t}, msg {m:#06x}"),
        }
    }

    fn post_pg(&self, cmd: PmuCmd, queue: u32) -> Result<SeqDesc> {
        self.post(
            cmd,
            None,
            None,
            queue,
            Some(self.pg_completion()),
            self.config.command_timeout,
        )
    }

    /// Program idle thresholds and start the ELPG boot handshake. Called once
    /// the INIT message has been processed.
    pub(crate) fn init_powergating(&self) -> Result<()> {
        let engine = u32::from(ENGINE_GR);
        self.io
            .write_register(regs::pg_idlefilth(engine), self.config.idle_threshold);
        self.io.write_register(
            regs::pg_ppuidlefilth(engine),
            self.config.ppu_idle_threshold,
        );

        self.post_pg(PmuCmd::elpg(pg_cmd::ELPG_INIT), HPQ)?;

        self.pg.update(|s| s.stat_dmem_offset = 0);
        self.post_pg(PmuCmd::pg_stat_alloc_dmem(), LPQ)?;

        // Firmware wants a DISALLOW before the first ALLOW; its ack settles
        // the state to Off.
        self.pg.update(|s| s.state = ElpgState::On);
        self.post_pg(PmuCmd::elpg(pg_cmd::ELPG_DISALLOW), HPQ)?;
        info!("power gating handshake started");
        Ok(())
    }

    /// Block until the boot handshake has settled, then open the gate.
    pub(crate) fn wait_boot_handshake(&self) -> Result<()> {
        let outcome = self.pg.wait_until(
            |s| s.ready && s.stat_dmem_offset != 0 && s.state == ElpgState::Off,
            self.config.ack_timeout,
        );
        match outcome {
            WaitOutcome::Reached => {
                self.pg.update(|s| s.enable_allowed = true);
                info!("power gating ready");
                Ok(())
            }
            WaitOutcome::TimedOut => Err(PmuError::AckTimeout {
                what: "ELPG boot handshake",
                waited_ms: waited_ms(self.config.ack_timeout),
            }),
            WaitOutcome::Interrupted => Err(PmuError::Interrupted {
                what: "ELPG boot handshake",
            }),
        }
    }

    /// Load engine buffer `buf_idx` from GPU virtual address `dma_addr`.
    pub(crate) fn load_engine_buffer(
        &self,
        buf_idx: u8,
        dma_addr: u64,
        size: u16,
    ) -> Result<()> {
        self.pg.update(|s| {
            s.buf_loaded = false;
            s.buf_failed = false;
        });
        self.post_pg(PmuCmd::eng_buf_load(buf_idx, dma_addr, size), LPQ)?;

        match self
            .pg
            .wait_until(|s| s.buf_loaded || s.buf_failed, self.config.ack_timeout)
        {
            WaitOutcome::Reached if self.pg.with(|s| s.buf_loaded) => Ok(()),
            WaitOutcome::Reached => Err(PmuError::transport(format!(
                "engine buffer {buf_idx} load failed"
            ))),
            WaitOutcome::TimedOut => Err(PmuError::AckTimeout {
                what: "engine buffer load",
                waited_ms: waited_ms(self.config.ack_timeout),
            }),
            WaitOutcome::Interrupted => Err(PmuError::Interrupted {
                what: "engine buffer load",
            }),
        }
    }

    /// Request power gating. Does not wait for the ack.
    pub(crate) fn enable_elpg(&self) -> Result<()> {
        let _op = self.pg_op();
        self.enable_locked()
    }

    fn enable_locked(&self) -> Result<()> {
        let proceed = self.pg.update(|s| {
            if !s.ready || !s.context_ready || s.state != ElpgState::Off {
                return false;
            }
            if !s.enable_allowed {
                s.state = ElpgState::OffOnPending;
                return false;
            }
            // Set before posting so a fast ack is not overwritten.
            s.state = ElpgState::OnPending;
            true
        });
        if !proceed {
            return Ok(());
        }

        if let Err(e) = self.post_pg(PmuCmd::elpg(pg_cmd::ELPG_ALLOW), HPQ) {
            self.pg.update(|s| {
                if s.state == ElpgState::OnPending {
                    s.state = ElpgState::Off;
                }
            });
            return Err(e);
        }
        debug!("ELPG ALLOW sent");
        Ok(())
    }

    /// Stop power gating and wait for the firmware to confirm.
    pub(crate) fn disable_elpg(&self) -> Result<()> {
        let _op = self.pg_op();

        let (ready, state) = self.pg.with(|s| (s.ready, s.state));
        if !ready {
            return Ok(());
        }
        match state {
            ElpgState::OffOnPending => {
                self.pg.update(|s| s.state = ElpgState::Off);
                debug!("pending ELPG enable cancelled");
                return Ok(());
            }
            ElpgState::OnPending => {
                self.wait_state(ElpgState::On, "ELPG_ALLOW_ACK")?;
            }
            ElpgState::Off => return Ok(()),
            ElpgState::On => {}
        }

        self.post_pg(PmuCmd::elpg(pg_cmd::ELPG_DISALLOW), HPQ)?;
        self.wait_state(ElpgState::Off, "ELPG_DISALLOW_ACK")?;

        self.arm_enable_allow_timer();
        debug!("ELPG disabled");
        Ok(())
    }

    fn wait_state(&self, want: ElpgState, what: &'static str) -> Result<()> {
        match self.pg.wait_until(|s| s.state == want, self.config.ack_timeout) {
            WaitOutcome::Reached => Ok(()),
            WaitOutcome::TimedOut => {
                error!("{what} not received within {:?}", self.config.ack_timeout);
                Err(PmuError::AckTimeout {
                    what,
                    waited_ms: waited_ms(self.config.ack_timeout),
                })
            }
            WaitOutcome::Interrupted => Err(PmuError::Interrupted { what }),
        }
    }

    /// Close the gate and reopen it after the debounce delay, unless a timer
    /// is already running.
    fn arm_enable_allow_timer(&self) {
        let generation = self.pg.update(|s| {
            if s.timer_pending {
                return None;
            }
            s.timer_pending = true;
            s.enable_allowed = false;
            Some(s.timer_generation)
        });
        let Some(generation) = generation else {
            return;
        };

        let weak = self.self_ref.clone();
        let delay = self.config.enable_allow_delay;
        let spawned = std::thread::Builder::new()
            .name("pmu-elpg-allow".into())
            .spawn(move || {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let outcome = shared
                    .pg
                    .wait_until(|s| s.timer_generation != generation, delay);
                if outcome == WaitOutcome::TimedOut {
                    shared.enable_allow_expired();
                }
            });

        match spawned {
            Ok(handle) => {
                let mut slot = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(old) = slot.replace(handle) {
                    if old.is_finished() {
                        let _ = old.join();
                    }
                }
            }
            Err(e) => {
                warn!("cannot start ELPG debounce timer: {e}; opening gate now");
                self.pg.update(|s| {
                    s.timer_pending = false;
                    s.enable_allowed = true;
                });
            }
        }
    }

    fn enable_allow_expired(&self) {
        let _op = self.pg_op();
        let reissue = self.pg.update(|s| {
            s.timer_pending = false;
            s.enable_allowed = true;
            if s.state == ElpgState::OffOnPending {
                s.state = ElpgState::Off;
                true
            } else {
                false
            }
        });
        debug!("ELPG enable allowed again");
        if reissue {
            if let Err(e) = self.enable_locked() {
                error!("deferred ELPG enable failed: {e}");
            }
        }
    }

    /// Cancel the debounce timer and wait for its thread.
    pub(crate) fn cancel_enable_allow_timer(&self) {
        self.pg.update(|s| {
            s.timer_generation += 1;
            s.timer_pending = false;
        });
        let handle = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
