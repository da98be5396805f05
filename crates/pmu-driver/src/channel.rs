//! The PMU channel
//!
//! [`PmuChannel`] owns everything the host needs to talk to one PMU: queue
//! descriptors, the sequence table, the DMEM allocator, the mutex arbiter
//! and the power-gating state. It is a cheap handle (`Clone`) over shared
//! state so the notifier thread and any number of producers can use it.
//!
//! # Lifecycle
//!
//! ```text
//! new ─▶ init ─▶ start_notifier ─▶ (firmware boots, INIT arrives)
//!                                  ─▶ wait_boot_handshake ─▶ post / enable / disable
//!                                  ─▶ shutdown
//! ```
//!
//! # Locks
//!
//! One mutex per queue, one for the sequence table and DMEM allocator
//! together, one for power-gating state. A queue lock may be held while
//! taking the sequence lock, never the other way round. Completions run
//! with none of them held. DMEM copies additionally take the port lock of
//! [`SerializedPort`], innermost and only for the length of one copy.

use crate::cmd::Payload;
use crate::config::ChannelConfig;
use crate::dmem::DmemAllocator;
use crate::elpg::{ElpgState, PgStatus};
use crate::error::{PmuError, Result};
use crate::mutex::MutexArbiter;
use crate::queue::PmuQueue;
use crate::seq::{Completion, SeqDesc, SequenceTable};
use crate::transport::{Clock, PmuTransport, SerializedPort, SystemClock};
use crate::wait::WaitQueue;
use crate::wire::PmuCmd;
use pmu_chip::queue::{HPQ, LPQ, MSGQ, QUEUE_COUNT, SWQ};
use pmu_chip::regs::{self, irq, irqdest};
use pmu_chip::wire::gid::GID_SIZE;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often the notifier thread checks for shutdown while idle.
const NOTIFIER_POLL: Duration = Duration::from_millis(20);

/// Sequence table and DMEM allocator, guarded together.
#[derive(Debug)]
pub(crate) struct Dispatch {
    pub(crate) seqs: SequenceTable,
    pub(crate) dmem: Option<Box<dyn DmemAllocator>>,
}

/// State shared between the channel handle, the notifier and the timer.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) self_ref: Weak<Shared>,
    pub(crate) io: Arc<dyn PmuTransport>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: ChannelConfig,
    pub(crate) queues: [Mutex<PmuQueue>; QUEUE_COUNT],
    pub(crate) dispatch: Mutex<Dispatch>,
    pub(crate) custom_allocator: Mutex<Option<Box<dyn DmemAllocator>>>,
    pub(crate) mutexes: MutexArbiter,
    pub(crate) pg: WaitQueue<PgStatus>,
    pub(crate) pg_op: Mutex<()>,
    pub(crate) drain: Mutex<()>,
    pub(crate) pmu_ready: AtomicBool,
    pub(crate) gid: Mutex<Option<[u8; GID_SIZE]>>,
    pub(crate) events: AtomicU64,
    pub(crate) timer: Mutex<Option<JoinHandle<()>>>,
    notifier: Mutex<Option<JoinHandle<()>>>,
    notifier_stop: AtomicBool,
}

impl Shared {
    pub(crate) fn queue(&self, id: u32) -> MutexGuard<'_, PmuQueue> {
        self.queues[id as usize]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn dispatch(&self) -> MutexGuard<'_, Dispatch> {
        self.dispatch.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Host side of the PMU command/response channel.
#[derive(Debug, Clone)]
pub struct PmuChannel {
    shared: Arc<Shared>,
}

impl PmuChannel {
    /// Channel over `io` using the wall clock.
    pub fn new(io: Arc<dyn PmuTransport>, config: ChannelConfig) -> Self {
        Self::with_clock(io, Arc::new(SystemClock), config)
    }

    /// Channel over `io` with an explicit clock for polling loops.
    pub fn with_clock(
        io: Arc<dyn PmuTransport>,
        clock: Arc<dyn Clock>,
        config: ChannelConfig,
    ) -> Self {
        let io: Arc<dyn PmuTransport> = Arc::new(SerializedPort::new(io));
        let mutexes = MutexArbiter::new(
            Arc::clone(&io),
            Arc::clone(&clock),
            config.mutex_timeout,
            config.mutex_poll_interval,
        );
        let pg = WaitQueue::new(PgStatus::default(), Arc::clone(&clock));
        let shared = Arc::new_cyclic(|self_ref| Shared {
            self_ref: self_ref.clone(),
            io,
            clock,
            config,
            queues: [HPQ, LPQ, SWQ, MSGQ].map(|id| Mutex::new(PmuQueue::unconfigured(id))),
            dispatch: Mutex::new(Dispatch {
                seqs: SequenceTable::new(),
                dmem: None,
            }),
            custom_allocator: Mutex::new(None),
            mutexes,
            pg,
            pg_op: Mutex::new(()),
            drain: Mutex::new(()),
            pmu_ready: AtomicBool::new(false),
            gid: Mutex::new(None),
            events: AtomicU64::new(0),
            timer: Mutex::new(None),
            notifier: Mutex::new(None),
            notifier_stop: AtomicBool::new(false),
        });
        Self { shared }
    }

    /// Use `allocator` for payload DMEM instead of the built-in range
    /// allocator. Takes effect when the INIT message is processed.
    pub fn set_allocator(&self, allocator: Box<dyn DmemAllocator>) {
        *self
            .shared
            .custom_allocator
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(allocator);
    }

    /// Reset host state and unmask PMU interrupts. Call before the firmware
    /// starts.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for transports that report
    /// register errors.
    pub fn init(&self) -> Result<()> {
        let s = &self.shared;
        s.pmu_ready.store(false, Ordering::Release);
        {
            let mut d = s.dispatch();
            d.seqs.reset();
            d.dmem = None;
        }
        for (id, q) in (0u32..).zip(s.queues.iter()) {
            *q.lock().unwrap_or_else(PoisonError::into_inner) = PmuQueue::unconfigured(id);
        }
        s.mutexes.reset();
        s.cancel_enable_allow_timer();
        s.pg.update(|p| {
            let generation = p.timer_generation;
            let context_ready = p.context_ready;
            *p = PgStatus {
                timer_generation: generation,
                context_ready,
                ..PgStatus::default()
            };
        });
        s.events.store(0, Ordering::Relaxed);

        s.io.write_register(regs::IRQMCLR, irq::ALL);
        s.io.write_register(regs::IRQDEST, irqdest::HOST_DEFAULT);
        s.io.write_register(regs::IRQMSET, irq::HOST_ENABLED);
        info!("PMU channel initialised, interrupts enabled");
        Ok(())
    }

    /// Spawn the dedicated consumer that services each notification arriving
    /// on `events`.
    ///
    /// # Errors
    ///
    /// [`PmuError::Io`] if the thread cannot be spawned.
    pub fn start_notifier(&self, events: Receiver<()>) -> Result<()> {
        let mut slot = self
            .shared
            .notifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            warn!("notifier already running");
            return Ok(());
        }
        self.shared.notifier_stop.store(false, Ordering::Release);

        let weak = Arc::downgrade(&self.shared);
        let handle = std::thread::Builder::new()
            .name("pmu-notifier".into())
            .spawn(move || loop {
                match events.recv_timeout(NOTIFIER_POLL) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if shared.notifier_stop.load(Ordering::Acquire) {
                    break;
                }
                shared.on_notification();
            })?;
        *slot = Some(handle);
        debug!("notifier started");
        Ok(())
    }

    /// Service a PMU interrupt: drain the message queue on swgen0, log
    /// halts and external errors, clear what was handled.
    pub fn on_notification(&self) {
        self.shared.on_notification();
    }

    /// Stop the notifier and the debounce timer, fail pending waits and mask
    /// PMU interrupts. Further posts return [`PmuError::NotReady`].
    pub fn shutdown(&self) {
        let s = &self.shared;
        s.pmu_ready.store(false, Ordering::Release);
        s.io.write_register(regs::IRQMCLR, irq::ALL);

        s.notifier_stop.store(true, Ordering::Release);
        let notifier = s.notifier.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = notifier {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }

        s.pg.interrupt();
        s.cancel_enable_allow_timer();
        s.pg.update(|p| {
            p.ready = false;
            p.enable_allowed = false;
        });
        info!("PMU channel shut down");
    }

    /// True once the INIT message has been processed.
    pub fn is_ready(&self) -> bool {
        self.shared.pmu_ready.load(Ordering::Acquire)
    }

    /// Post `cmd` on command queue `queue`.
    ///
    /// `response_capacity` bounds the accepted response size; `completion`
    /// runs once with the response. Retries for up to `timeout` while the
    /// queue is full.
    ///
    /// # Errors
    ///
    /// [`PmuError::NotReady`], validation errors
    /// ([`PmuError::InvalidCommand`], [`PmuError::InvalidUnit`]),
    /// [`PmuError::SequenceExhausted`], [`PmuError::DmemExhausted`],
    /// [`PmuError::QueueFull`] after `timeout`, or mutex errors.
    pub fn post_command(
        &self,
        cmd: PmuCmd,
        response_capacity: Option<u32>,
        payload: Option<Payload>,
        queue: u32,
        completion: Option<Box<dyn Completion>>,
        timeout: Duration,
    ) -> Result<SeqDesc> {
        self.shared
            .post(cmd, response_capacity, payload, queue, completion, timeout)
    }

    /// Post with no payload, no size bound and the default timeout.
    ///
    /// # Errors
    ///
    /// As [`post_command`](Self::post_command).
    pub fn post(
        &self,
        cmd: PmuCmd,
        queue: u32,
        completion: impl Completion + 'static,
    ) -> Result<SeqDesc> {
        self.shared.post(
            cmd,
            None,
            None,
            queue,
            Some(Box::new(completion)),
            self.shared.config.command_timeout,
        )
    }

    /// Suppress the completion of in-flight command `desc`.
    ///
    /// # Errors
    ///
    /// [`PmuError::InvalidCommand`] if `desc` is not in flight.
    pub fn cancel(&self, desc: SeqDesc) -> Result<()> {
        self.shared.cancel(desc)
    }

    /// Allow the firmware to power-gate the graphics engine.
    ///
    /// # Errors
    ///
    /// Errors from posting the ALLOW command.
    pub fn enable_power_gating(&self) -> Result<()> {
        self.shared.enable_elpg()
    }

    /// Stop power gating and wait for the firmware to confirm.
    ///
    /// # Errors
    ///
    /// [`PmuError::AckTimeout`] if an ack does not arrive in time,
    /// [`PmuError::Interrupted`] if the wait is cut short by shutdown.
    pub fn disable_power_gating(&self) -> Result<()> {
        self.shared.disable_elpg()
    }

    /// Wait for the ELPG boot handshake and open the enable gate.
    ///
    /// # Errors
    ///
    /// [`PmuError::AckTimeout`] or [`PmuError::Interrupted`].
    pub fn wait_boot_handshake(&self) -> Result<()> {
        self.shared.wait_boot_handshake()
    }

    /// Load a power-gating engine buffer and wait for the firmware.
    ///
    /// # Errors
    ///
    /// Post errors, [`PmuError::AckTimeout`], or a transport error if the
    /// firmware reports the load failed.
    pub fn load_engine_buffer(&self, buf_idx: u8, dma_addr: u64, size: u16) -> Result<()> {
        self.shared.load_engine_buffer(buf_idx, dma_addr, size)
    }

    /// Mark the graphics context ELPG depends on as established (or not).
    pub fn set_context_ready(&self, ready: bool) {
        self.shared.pg.update(|p| p.context_ready = ready);
    }

    /// Current power-gating state.
    pub fn power_gating_state(&self) -> ElpgState {
        self.shared.pg.with(|p| p.state)
    }

    /// Snapshot of the power-gating handshake.
    pub fn power_gating_status(&self) -> PgStatus {
        self.shared.pg.with(Clone::clone)
    }

    /// Firmware GID from the INIT handshake, if it carried a signature.
    pub fn firmware_gid(&self) -> Option<[u8; GID_SIZE]> {
        *self.shared.gid.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Unsolicited events received since `init`.
    pub fn event_count(&self) -> u64 {
        self.shared.events.load(Ordering::Relaxed)
    }

    /// Sequence slots currently not free.
    pub fn sequences_in_use(&self) -> usize {
        self.shared.dispatch().seqs.in_use()
    }

    /// `(offset, size)` of queue `id` as advertised by the firmware.
    ///
    /// # Errors
    ///
    /// [`PmuError::NotReady`] before the INIT message.
    pub fn queue_layout(&self, id: u32) -> Result<(u32, u32)> {
        if id as usize >= self.shared.queues.len() {
            return Err(PmuError::invalid_command(format!("no queue {id}")));
        }
        let q = self.shared.queue(id);
        if !q.is_configured() {
            return Err(PmuError::NotReady);
        }
        Ok((q.offset, q.size))
    }
}
