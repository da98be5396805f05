//! Response dispatch
//!
//! Drains the message queue, matches responses to sequence slots and runs
//! their completions. Before the firmware has announced itself, the only
//! message expected is INIT, which carries the queue layout.

use crate::channel::Shared;
use crate::dmem::RangeAllocator;
use crate::error::{PmuError, Result};
use crate::queue::PmuQueue;
use crate::seq::{Response, SeqState};
use crate::wire::{self, Header, InitMsg, PmuMsg};
use bytes::Bytes;
use pmu_chip::queue::{align, MSGQ};
use pmu_chip::regs::{self, irq};
use pmu_chip::wire::{flags, gid, unit, HDR_SIZE};
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

impl Shared {
    /// Pop one message. `Ok(None)` when the queue is empty.
    ///
    /// A message with an invalid unit is consumed (body skipped) and reported
    /// as [`PmuError::InvalidUnit`] so the drain can move on to the next one.
    fn read_message(&self, q: &mut PmuQueue) -> Result<Option<PmuMsg>> {
        let io = &*self.io;
        if q.is_empty(io) {
            return Ok(None);
        }
        q.open_read(io, &self.mutexes)?;

        match self.read_open_message(q) {
            Ok(msg) => {
                q.close(io, &self.mutexes, true)?;
                Ok(Some(msg))
            }
            Err(e @ PmuError::InvalidUnit { .. }) => {
                q.close(io, &self.mutexes, true)?;
                Err(e)
            }
            Err(e) => {
                q.close(io, &self.mutexes, false)?;
                Err(e)
            }
        }
    }

    fn read_open_message(&self, q: &mut PmuQueue) -> Result<PmuMsg> {
        let io = &*self.io;
        let mut raw = [0u8; HDR_SIZE as usize];

        let mut read = q.pop(io, &mut raw)?;
        if read == raw.len() && raw[pmu_chip::wire::hdr::UNIT_ID] == unit::REWIND {
            q.rewind(io)?;
            read = q.pop(io, &mut raw)?;
        }
        if read != raw.len() {
            error!("queue {}: short header read ({read} bytes)", q.id);
            return Err(PmuError::invalid_message("short header read"));
        }

        let hdr = Header::decode(&raw)?;
        let mut body = vec![0u8; hdr.body_len() as usize];

        if !unit::is_valid(hdr.unit_id) {
            error!("queue {}: invalid unit {:#04x}, skipping", q.id, hdr.unit_id);
            if !body.is_empty() {
                q.pop(io, &mut body)?;
            }
            return Err(PmuError::InvalidUnit { unit: hdr.unit_id });
        }

        if !body.is_empty() {
            let got = q.pop(io, &mut body)?;
            if got != body.len() {
                error!("queue {}: short body read ({got} of {})", q.id, body.len());
                return Err(PmuError::invalid_message("short body read"));
            }
        }

        Ok(PmuMsg {
            hdr,
            body: Bytes::from(body),
        })
    }

    /// Consume the INIT message at the message queue tail and bring the
    /// channel up: queues, firmware GID, DMEM allocator.
    fn process_init_msg(&self) -> Result<()> {
        let io = &*self.io;
        let tail = io.read_register(regs::MSGQ_TAIL) & regs::QUEUE_ADDR_MASK;

        let mut raw = [0u8; HDR_SIZE as usize];
        io.copy_out(tail, &mut raw)?;
        let hdr = Header::decode(&raw)?;
        if hdr.unit_id != unit::INIT {
            return Err(PmuError::invalid_message(format!(
                "expecting INIT message, got unit {:#04x}",
                hdr.unit_id
            )));
        }
        let mut body = vec![0u8; hdr.body_len() as usize];
        io.copy_out(tail + HDR_SIZE, &mut body)?;
        let init = InitMsg::parse(&body)?;

        io.write_register(
            regs::MSGQ_TAIL,
            (tail + align(u32::from(hdr.size))) & regs::QUEUE_ADDR_MASK,
        );

        let mut desc = [0u8; gid::DESC_SIZE];
        io.copy_out(init.sw_managed_area_offset, &mut desc)?;
        let gid = wire::parse_gid(&desc);
        if gid.is_some() {
            debug!("firmware GID recorded");
        } else {
            warn!("no firmware GID signature at {:#x}", init.sw_managed_area_offset);
        }
        *self.gid.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = gid;

        for (id, info) in (0u32..).zip(init.queues.iter()) {
            self.queue(id).configure(*info)?;
        }

        {
            let mut d = self.dispatch();
            let custom = self
                .custom_allocator
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take();
            d.dmem = Some(custom.unwrap_or_else(|| {
                Box::new(RangeAllocator::new(
                    init.sw_managed_area_offset,
                    init.sw_managed_area_size,
                ))
            }));
        }

        self.pmu_ready.store(true, Ordering::Release);
        info!(
            "PMU ready: sw area {:#x}+{:#x}",
            init.sw_managed_area_offset, init.sw_managed_area_size
        );
        Ok(())
    }

    /// Match a response to its slot, free its DMEM, run its completion and
    /// release the slot.
    fn response_handle(&self, msg: PmuMsg) {
        let seq_id = msg.hdr.seq_id;
        let io = &*self.io;

        let (desc, cancelled, capacity, out_region, regions, completion) = {
            let mut d = self.dispatch();
            let slot = d.seqs.get_mut(seq_id);
            if !matches!(slot.state, SeqState::Used | SeqState::Cancelled) {
                error!(
                    "response for seq {seq_id} in state {:?}, dropped",
                    slot.state
                );
                return;
            }
            let out_region = slot.out_region;
            (
                slot.desc,
                slot.state == SeqState::Cancelled,
                slot.response_capacity,
                out_region,
                slot.take_regions(),
                slot.take_completion(),
            )
        };

        let result = if cancelled {
            None
        } else if msg.is_unhandled_cmd() {
            error!("firmware did not handle command on seq {seq_id}");
            Some(Err(PmuError::UnhandledCommand { seq: seq_id }))
        } else {
            match capacity {
                Some(cap) if msg.size() > cap => {
                    error!(
                        "seq {seq_id}: response of {} bytes exceeds buffer of {cap}",
                        msg.size()
                    );
                    Some(Err(PmuError::BufferTooSmall {
                        needed: msg.size(),
                        capacity: cap,
                    }))
                }
                _ => {
                    let out_payload = out_region
                        .map(|r| {
                            let mut buf = vec![0u8; r.size as usize];
                            io.copy_out(r.offset, &mut buf).map(|()| Bytes::from(buf))
                        })
                        .transpose();
                    Some(out_payload.map(|out_payload| Response { msg, out_payload }))
                }
            }
        };

        {
            let mut d = self.dispatch();
            if let Some(dmem) = d.dmem.as_mut() {
                for r in regions {
                    dmem.free(r.offset, r.size);
                }
            }
        }

        match (completion, result) {
            (Some(c), Some(result)) => c.complete(desc, result),
            _ => debug!("seq {seq_id}: no completion to run"),
        }

        self.dispatch().seqs.release(seq_id);
    }

    /// Drain the message queue.
    pub(crate) fn process_messages(&self) {
        let _drain = self
            .drain
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if !self.pmu_ready.load(Ordering::Acquire) {
            if let Err(e) = self.process_init_msg() {
                error!("failed to process PMU INIT message: {e}");
                return;
            }
            if let Err(e) = self.init_powergating() {
                error!("failed to start power gating: {e}");
            }
            return;
        }

        loop {
            let next = {
                let mut q = self.queue(MSGQ);
                self.read_message(&mut q)
            };
            let mut msg = match next {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(PmuError::InvalidUnit { .. }) => continue,
                Err(e) => {
                    error!("message queue drain stopped: {e}");
                    break;
                }
            };

            msg.hdr.ctrl_flags &= !flags::PMU_MASK;
            if msg.is_event() {
                let n = self.events.fetch_add(1, Ordering::Relaxed) + 1;
                info!("event from unit {:#04x} ({n} so far)", msg.hdr.unit_id);
                continue;
            }
            self.response_handle(msg);
        }
    }

    /// Service a PMU interrupt.
    pub(crate) fn on_notification(&self) {
        let io = &*self.io;
        let mask = io.read_register(regs::IRQMASK) & io.read_register(regs::IRQDEST);
        let intr = io.read_register(regs::IRQSTAT) & mask;
        if intr == 0 {
            return;
        }

        if intr & irq::HALT != 0 {
            error!("PMU falcon halted");
        }
        if intr & irq::EXTERR != 0 {
            error!("PMU external error");
        }
        let recheck = intr & irq::SWGEN0 != 0;
        if recheck {
            self.process_messages();
        }

        io.write_register(regs::IRQSCLR, intr);

        if recheck && self.pmu_ready.load(Ordering::Acquire) {
            let empty = self.queue(MSGQ).is_empty(io);
            if !empty {
                io.write_register(regs::IRQSSET, irq::SWGEN0);
            }
        }
    }
}
