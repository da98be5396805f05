//! Command dispatch
//!
//! `post` validates a command, claims a sequence slot, stages any payload in
//! DMEM and writes the command into a command queue. Everything claimed
//! along the way is given back if a later step fails.

use crate::channel::Shared;
use crate::dmem::DmemRegion;
use crate::error::{PmuError, Result};
use crate::seq::{Completion, SeqDesc, SeqState};
use crate::transport::poll_until;
use crate::wire::PmuCmd;
use bytes::Bytes;
use pmu_chip::queue as qid;
use pmu_chip::wire::{flags, unit, ALLOC_SIZE, HDR_SIZE};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, error};

/// Input payload: bytes staged in DMEM before the command is sent.
#[derive(Debug, Clone)]
pub struct PayloadIn {
    /// Bytes to copy in
    pub data: Bytes,
    /// Body offset of the allocation descriptor to patch
    pub offset: u32,
}

/// Output payload: DMEM the firmware fills, copied back with the response.
#[derive(Debug, Clone, Copy)]
pub struct PayloadOut {
    /// Bytes to reserve and copy back
    pub size: u32,
    /// Body offset of the allocation descriptor to patch
    pub offset: u32,
}

/// DMEM payloads attached to a command.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    /// Input payload
    pub input: Option<PayloadIn>,
    /// Output payload
    pub output: Option<PayloadOut>,
    /// Output reuses the input region (sized to the larger of the two)
    pub shared: bool,
}

impl Payload {
    /// Input only.
    pub fn input(data: impl Into<Bytes>, offset: u32) -> Self {
        Self {
            input: Some(PayloadIn {
                data: data.into(),
                offset,
            }),
            ..Self::default()
        }
    }

    /// Add an output payload.
    #[must_use]
    pub fn with_output(mut self, size: u32, offset: u32) -> Self {
        self.output = Some(PayloadOut { size, offset });
        self
    }

    /// Make the output alias the input region.
    #[must_use]
    pub const fn aliased(mut self) -> Self {
        self.shared = true;
        self
    }
}

fn check_alloc_slot(cmd: &PmuCmd, offset: u32, what: &str) -> Result<()> {
    if HDR_SIZE + offset + ALLOC_SIZE > cmd.size() {
        return Err(PmuError::invalid_command(format!(
            "{what} descriptor at body offset {offset} does not fit a {}-byte command",
            cmd.size()
        )));
    }
    Ok(())
}

impl Shared {
    fn validate_cmd(
        &self,
        cmd: &PmuCmd,
        response_capacity: Option<u32>,
        payload: Option<&Payload>,
        queue_id: u32,
    ) -> Result<()> {
        if !qid::is_command_queue(queue_id) {
            return Err(PmuError::invalid_command(format!(
                "queue {queue_id} is not a command queue"
            )));
        }
        let queue_size = self.queue(queue_id).size;
        if cmd.size() < HDR_SIZE || cmd.size() > queue_size / 2 {
            return Err(PmuError::invalid_command(format!(
                "command size {} outside [{HDR_SIZE}, {}] for queue {queue_id}",
                cmd.size(),
                queue_size / 2
            )));
        }
        if let Some(capacity) = response_capacity {
            if capacity < HDR_SIZE {
                return Err(PmuError::invalid_command(format!(
                    "response capacity {capacity} below header size"
                )));
            }
        }
        if !unit::is_valid(cmd.hdr.unit_id) {
            return Err(PmuError::InvalidUnit {
                unit: cmd.hdr.unit_id,
            });
        }

        let Some(payload) = payload else {
            return Ok(());
        };
        if payload.input.is_none() && payload.output.is_none() {
            return Err(PmuError::invalid_command("payload with neither input nor output"));
        }
        if let Some(input) = &payload.input {
            if input.data.is_empty() {
                return Err(PmuError::invalid_command("empty input payload"));
            }
            check_alloc_slot(cmd, input.offset, "input")?;
        }
        if let Some(output) = &payload.output {
            if output.size == 0 {
                return Err(PmuError::invalid_command("zero-sized output payload"));
            }
            check_alloc_slot(cmd, output.offset, "output")?;
        }
        if payload.shared && (payload.input.is_none() || payload.output.is_none()) {
            return Err(PmuError::invalid_command(
                "aliased payload needs both input and output",
            ));
        }
        Ok(())
    }

    /// Post `cmd` on `queue_id`.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn post(
        &self,
        mut cmd: PmuCmd,
        response_capacity: Option<u32>,
        payload: Option<Payload>,
        queue_id: u32,
        completion: Option<Box<dyn Completion>>,
        timeout: Duration,
    ) -> Result<SeqDesc> {
        if !self.pmu_ready.load(Ordering::Acquire) {
            return Err(PmuError::NotReady);
        }
        self.validate_cmd(&cmd, response_capacity, payload.as_ref(), queue_id)?;

        let (id, desc) = {
            let mut d = self.dispatch();
            let id = d.seqs.acquire()?;
            let slot = d.seqs.get_mut(id);
            slot.response_capacity = response_capacity;
            slot.set_completion(completion);
            (id, slot.desc)
        };
        cmd.hdr.seq_id = id;
        cmd.hdr.ctrl_flags = flags::STATUS | flags::INTR;

        let staged = payload
            .as_ref()
            .map_or(Ok(()), |p| self.stage_payload(&mut cmd, id, p))
            .and_then(|()| self.write_cmd(&cmd, queue_id, id, timeout));

        if let Err(e) = staged {
            debug!("post on queue {queue_id} failed: {e}");
            let mut d = self.dispatch();
            let regions = d.seqs.get_mut(id).take_regions();
            if let Some(dmem) = d.dmem.as_mut() {
                for r in regions {
                    dmem.free(r.offset, r.size);
                }
            }
            d.seqs.release(id);
            return Err(e);
        }

        debug!(
            "posted unit {:#04x} size {} on queue {queue_id}, seq {id}, desc {desc}",
            cmd.hdr.unit_id,
            cmd.size()
        );
        Ok(desc)
    }

    /// Allocate payload regions, copy input in and patch the descriptors.
    /// Regions are recorded on the slot as soon as they exist so a failure
    /// later on frees them.
    fn stage_payload(&self, cmd: &mut PmuCmd, id: u8, payload: &Payload) -> Result<()> {
        let mut input_region = None;

        if let Some(input) = &payload.input {
            let in_size = input.data.len() as u32;
            let size = match (&payload.output, payload.shared) {
                (Some(out), true) => in_size.max(out.size),
                _ => in_size,
            };
            let region = self.alloc_region(id, size, true)?;
            self.io.copy_in(region.offset, &input.data)?;
            cmd.patch_alloc(input.offset, region)?;
            input_region = Some(region);
        }

        if let Some(output) = &payload.output {
            let region = match input_region {
                Some(r) if payload.shared => {
                    let region = DmemRegion {
                        offset: r.offset,
                        size: output.size,
                    };
                    let mut d = self.dispatch();
                    let slot = d.seqs.get_mut(id);
                    slot.out_region = Some(region);
                    slot.out_shared = true;
                    region
                }
                _ => self.alloc_region(id, output.size, false)?,
            };
            cmd.patch_alloc(output.offset, region)?;
        }
        Ok(())
    }

    fn alloc_region(&self, id: u8, size: u32, input: bool) -> Result<DmemRegion> {
        let mut d = self.dispatch();
        let dmem = d.dmem.as_mut().ok_or(PmuError::NotReady)?;
        let offset = dmem.alloc(size)?;
        let region = DmemRegion { offset, size };
        let slot = d.seqs.get_mut(id);
        if input {
            slot.in_region = Some(region);
        } else {
            slot.out_region = Some(region);
        }
        Ok(region)
    }

    /// Write `cmd` into `queue_id`, retrying while the queue is full. The
    /// slot turns `Used` before the head is published so a response can
    /// never find it `Pending`.
    fn write_cmd(&self, cmd: &PmuCmd, queue_id: u32, id: u8, timeout: Duration) -> Result<()> {
        let raw = cmd.to_bytes();
        let io = &*self.io;

        let outcome = poll_until(
            &*self.clock,
            timeout,
            self.config.queue_poll_interval,
            || {
                let mut q = self.queue(queue_id);
                match q.open_write(io, &self.mutexes, cmd.size()) {
                    Ok(()) => {}
                    Err(PmuError::QueueFull { .. }) => return Ok(None),
                    Err(e) => return Err(e),
                }
                if let Err(e) = q.push(io, &raw) {
                    error!("queue {queue_id}: push failed: {e}");
                    q.close(io, &self.mutexes, false)?;
                    return Err(e);
                }
                self.dispatch().seqs.get_mut(id).state = SeqState::Used;
                if let Err(e) = q.close(io, &self.mutexes, true) {
                    // Head is already published; the command is in flight.
                    error!("queue {queue_id}: close after commit failed: {e}");
                }
                Ok(Some(()))
            },
        );

        match outcome {
            Ok(result) => result,
            Err(waited) => {
                tracing::warn!(
                    "queue {queue_id} still full after {}ms",
                    waited.as_millis()
                );
                Err(PmuError::QueueFull {
                    queue: queue_id,
                    size: cmd.size(),
                })
            }
        }
    }

    /// Suppress the completion of in-flight command `desc`. Its response
    /// still frees DMEM and the slot.
    pub(crate) fn cancel(&self, desc: SeqDesc) -> Result<()> {
        let mut d = self.dispatch();
        let id = d
            .seqs
            .find_by_desc(desc)
            .filter(|id| d.seqs.get(*id).state == SeqState::Used)
            .ok_or_else(|| PmuError::invalid_command(format!("no in-flight command {desc}")))?;
        let slot = d.seqs.get_mut(id);
        slot.state = SeqState::Cancelled;
        drop(slot.take_completion());
        debug!("desc {desc} (seq {id}) cancelled");
        Ok(())
    }
}
