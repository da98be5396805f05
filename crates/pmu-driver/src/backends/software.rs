// SPDX-License-Identifier: AGPL-3.0-only

//! Software falcon
//!
//! An in-process model of the PMU falcon, good enough to run the whole
//! channel without hardware:
//!
//! - register file with the interrupt set/clear/mask semantics of the real
//!   block, and an interrupt line delivered over an `mpsc` channel
//! - 64 KiB of DMEM behind four DMEMC/DMEMD auto-increment ports
//! - the mutex bank and its token generator
//! - a firmware loop that consumes commands whenever the host writes a
//!   command queue head, and answers them in the message queue
//!
//! ## Firmware behaviour
//!
//! ```text
//! PG   ELPG INIT / ALLOW / DISALLOW  →  matching ack
//!      STAT ALLOC_DMEM               →  RESP_DMEM_OFFSET (geometry.stat_offset)
//!      ENG_BUF_LOAD                  →  LOADED, or FAILED for a zero-sized buffer
//! MEM  copy input region to output region with every byte inverted, status 0
//! any  other unit                    →  status 0
//! ```
//!
//! Units marked with [`SoftwareFalcon::set_unhandled`] are answered with an
//! RC `UNHANDLED_CMD` message instead. With auto-respond off, replies are
//! held until [`SoftwareFalcon::deliver_held`]; commands are still consumed.
//!
//! Replies that do not fit the message queue wait in a backlog that drains
//! as the host advances the message queue tail.

#![allow(clippy::cast_possible_truncation)]

use crate::transport::PmuTransport;
use crate::wire::{read_alloc, Header, InitMsg, PgMsg, PmuMsg, QueueInfo};
use bytes::Bytes;
use pmu_chip::queue::{align, HPQ, LPQ, MSGQ, QUEUE_COUNT, SWQ};
use pmu_chip::regs::{self, dmemc_bits, irq, mutex_bits};
use pmu_chip::wire::{
    flags, gid, hdr, mem_cmd, pg_cmd, pg_msg, rc_msg, unit, ENGINE_GR, HDR_SIZE,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, trace, warn};

/// Size of the simulated DMEM.
pub const DMEM_SIZE: usize = 0x1_0000;

/// Firmware-private flag bit set on every reply, to be stripped by the host.
const FIRMWARE_PRIVATE_FLAG: u8 = 0x10;

/// Highest token the generator hands out before wrapping.
const LAST_TOKEN: u32 = 0xfe;

/// DMEM layout the firmware announces at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FalconGeometry {
    /// Queue placement, indexed by queue id
    pub queues: [QueueInfo; QUEUE_COUNT],
    /// Start of the host-managed DMEM area
    pub sw_area_offset: u32,
    /// Size of the host-managed DMEM area
    pub sw_area_size: u32,
    /// Where the firmware keeps its PG statistics
    pub stat_offset: u32,
    /// GID written at the start of the host-managed area
    pub gid: Option<[u8; gid::GID_SIZE]>,
}

impl Default for FalconGeometry {
    fn default() -> Self {
        let mut queues = [QueueInfo::default(); QUEUE_COUNT];
        queues[HPQ as usize] = QueueInfo { offset: 0x400, size: 0x100, index: 0 };
        queues[LPQ as usize] = QueueInfo { offset: 0x500, size: 0x100, index: 1 };
        queues[SWQ as usize] = QueueInfo { offset: 0x600, size: 0x100, index: 2 };
        queues[MSGQ as usize] = QueueInfo { offset: 0x700, size: 0x200, index: 0 };
        Self {
            queues,
            sw_area_offset: 0x1000,
            sw_area_size: 0x4000,
            stat_offset: 0x0f00,
            gid: Some(*b"falcon-pmu-sim-gid-0"),
        }
    }
}

impl FalconGeometry {
    /// Same layout with command queue `id` resized to `size` bytes.
    #[must_use]
    pub fn with_queue_size(mut self, id: u32, size: u16) -> Self {
        self.queues[id as usize].size = size;
        self
    }
}

/// A command the firmware consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenCommand {
    /// Queue it was read from
    pub queue: u32,
    /// Its header
    pub hdr: Header,
    /// Its body
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, Default)]
struct DmemPort {
    addr: u32,
    aincw: bool,
    aincr: bool,
}

#[derive(Debug)]
struct Falcon {
    regs: HashMap<u32, u32>,
    dmem: Vec<u8>,
    ports: [DmemPort; regs::DMEM_PORT_COUNT as usize],
    owners: [u32; regs::MUTEX_COUNT as usize],
    next_token: u32,
    live_tokens: HashSet<u32>,
    injected_tokens: VecDeque<u32>,
    irq: Option<Sender<()>>,
    geometry: FalconGeometry,
    booted: bool,
    auto_respond: bool,
    held: VecDeque<Bytes>,
    backlog: VecDeque<Bytes>,
    unhandled: HashSet<u8>,
    seen: Vec<SeenCommand>,
}

/// In-process PMU falcon implementing [`PmuTransport`].
#[derive(Debug)]
pub struct SoftwareFalcon {
    state: Mutex<Falcon>,
}

impl Default for SoftwareFalcon {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareFalcon {
    /// Falcon with the default DMEM layout, not yet booted.
    pub fn new() -> Self {
        Self::with_geometry(FalconGeometry::default())
    }

    /// Falcon that will announce `geometry` at boot.
    pub fn with_geometry(geometry: FalconGeometry) -> Self {
        Self {
            state: Mutex::new(Falcon {
                regs: HashMap::new(),
                dmem: vec![0; DMEM_SIZE],
                ports: [DmemPort::default(); regs::DMEM_PORT_COUNT as usize],
                owners: [mutex_bits::INITIAL_LOCK; regs::MUTEX_COUNT as usize],
                next_token: 1,
                live_tokens: HashSet::new(),
                injected_tokens: VecDeque::new(),
                irq: None,
                geometry,
                booted: false,
                auto_respond: true,
                held: VecDeque::new(),
                backlog: VecDeque::new(),
                unhandled: HashSet::new(),
                seen: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Falcon> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Layout announced at boot.
    pub fn geometry(&self) -> FalconGeometry {
        self.lock().geometry.clone()
    }

    /// Attach the interrupt line. Each unmasked interrupt sends one `()`.
    pub fn connect_irq(&self) -> Receiver<()> {
        let (tx, rx) = mpsc::channel();
        self.lock().irq = Some(tx);
        rx
    }

    /// Start the firmware: place the queues, write the GID and send INIT.
    pub fn boot(&self) {
        let mut f = self.lock();
        f.boot();
    }

    /// Answer commands as they are consumed (default), or hold the replies.
    pub fn set_auto_respond(&self, on: bool) {
        self.lock().auto_respond = on;
    }

    /// Replies held back while auto-respond is off.
    pub fn held_count(&self) -> usize {
        self.lock().held.len()
    }

    /// Release up to `n` held replies into the message queue, oldest first.
    /// Returns how many were released.
    pub fn deliver_held(&self, n: usize) -> usize {
        let mut f = self.lock();
        let mut delivered = 0;
        while delivered < n {
            let Some(raw) = f.held.pop_front() else {
                break;
            };
            f.post_message(raw);
            delivered += 1;
        }
        delivered
    }

    /// Write an arbitrary message into the message queue.
    pub fn inject_message(&self, msg: &PmuMsg) {
        self.lock().post_message(msg.to_bytes());
    }

    /// Send an unsolicited event from `unit_id`.
    pub fn inject_event(&self, unit_id: u8, body: &[u8]) {
        let msg = PmuMsg::new(unit_id, flags::EVENT | FIRMWARE_PRIVATE_FLAG, 0, body);
        self.lock().post_message(msg.to_bytes());
    }

    /// Make the firmware reject (or stop rejecting) commands for `unit_id`.
    pub fn set_unhandled(&self, unit_id: u8, unhandled: bool) {
        let mut f = self.lock();
        if unhandled {
            f.unhandled.insert(unit_id);
        } else {
            f.unhandled.remove(&unit_id);
        }
    }

    /// Take mutex `id` on behalf of the firmware. The token is withdrawn
    /// from the generator until it is written to `MUTEX_ID_RELEASE`.
    pub fn hold_mutex(&self, id: u32, token: u32) {
        let mut f = self.lock();
        let token = token & mutex_bits::VALUE_MASK;
        if let Some(owner) = f.owners.get_mut(id as usize) {
            *owner = token;
            f.live_tokens.insert(token);
        }
    }

    /// Current owner of mutex `id` (`INITIAL_LOCK` when free).
    pub fn mutex_owner(&self, id: u32) -> u32 {
        self.lock()
            .owners
            .get(id as usize)
            .copied()
            .unwrap_or(mutex_bits::INITIAL_LOCK)
    }

    /// Make the token generator return `tokens` before resuming its cycle.
    pub fn inject_mutex_tokens(&self, tokens: &[u32]) {
        self.lock().injected_tokens.extend(tokens.iter().copied());
    }

    /// Copy DMEM at `offset` into `buf`. Out-of-range bytes read as zero.
    pub fn read_dmem(&self, offset: u32, buf: &mut [u8]) {
        let f = self.lock();
        match f.dmem_slice(offset, buf.len()) {
            Some(src) => buf.copy_from_slice(src),
            None => buf.fill(0),
        }
    }

    /// Copy `data` into DMEM at `offset`. Out-of-range writes are dropped.
    pub fn write_dmem(&self, offset: u32, data: &[u8]) {
        self.lock().write_dmem(offset, data);
    }

    /// Commands consumed so far, in order.
    pub fn commands_seen(&self) -> Vec<SeenCommand> {
        self.lock().seen.clone()
    }
}

// ── Falcon internals ─────────────────────────────────────────────────────────

impl Falcon {
    fn reg(&self, addr: u32) -> u32 {
        self.regs.get(&addr).copied().unwrap_or(0)
    }

    fn set_reg(&mut self, addr: u32, value: u32) {
        self.regs.insert(addr, value);
    }

    fn dmem_slice(&self, offset: u32, len: usize) -> Option<&[u8]> {
        let start = offset as usize;
        self.dmem.get(start..start.checked_add(len)?)
    }

    fn write_dmem(&mut self, offset: u32, data: &[u8]) {
        let start = offset as usize;
        let Some(dst) = start
            .checked_add(data.len())
            .and_then(|end| self.dmem.get_mut(start..end))
        else {
            error!("DMEM write of {} bytes at {offset:#x} out of range", data.len());
            return;
        };
        dst.copy_from_slice(data);
    }

    fn dmem_word(&self, addr: u32) -> u32 {
        self.dmem_slice(addr, 4)
            .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    // ── Interrupts ──────────────────────────────────────────────────────────

    fn raise(&mut self, bits: u32) {
        let stat = self.reg(regs::IRQSTAT) | bits;
        self.set_reg(regs::IRQSTAT, stat);
        self.fire_if_pending();
    }

    fn fire_if_pending(&self) {
        let pending = self.reg(regs::IRQSTAT) & self.reg(regs::IRQMASK) & self.reg(regs::IRQDEST);
        if pending == 0 {
            return;
        }
        if let Some(tx) = &self.irq {
            if tx.send(()).is_err() {
                trace!("interrupt line disconnected");
            }
        }
    }

    // ── Mutexes ─────────────────────────────────────────────────────────────

    /// Next token not currently handed out, or `ID_VALUE_NOT_AVAIL` when
    /// every token is live.
    fn generate_token(&mut self) -> u32 {
        if let Some(token) = self.injected_tokens.pop_front() {
            let token = token & mutex_bits::VALUE_MASK;
            if token != mutex_bits::ID_VALUE_INIT && token != mutex_bits::ID_VALUE_NOT_AVAIL {
                self.live_tokens.insert(token);
            }
            return token;
        }
        for _ in 0..LAST_TOKEN {
            let token = self.next_token;
            self.next_token = if token >= LAST_TOKEN { 1 } else { token + 1 };
            if self.live_tokens.insert(token) {
                return token;
            }
        }
        warn!("mutex token pool exhausted");
        mutex_bits::ID_VALUE_NOT_AVAIL
    }

    fn release_token(&mut self, token: u32) {
        let token = token & mutex_bits::VALUE_MASK;
        if self.live_tokens.remove(&token) {
            trace!("token {token:#x} released");
        } else {
            warn!("release of token {token:#x} that was not handed out");
        }
    }

    fn write_mutex(&mut self, index: usize, value: u32) {
        let value = value & mutex_bits::VALUE_MASK;
        let owner = &mut self.owners[index];
        if value == mutex_bits::INITIAL_LOCK {
            *owner = mutex_bits::INITIAL_LOCK;
        } else if *owner == mutex_bits::INITIAL_LOCK {
            *owner = value;
        } else {
            trace!("mutex {index} held by {:#x}, write of {value:#x} ignored", *owner);
        }
    }

    // ── DMEM ports ──────────────────────────────────────────────────────────

    fn write_dmemc(&mut self, port: usize, value: u32) {
        self.ports[port] = DmemPort {
            addr: value & dmemc_bits::ADDR_MASK,
            aincw: value & dmemc_bits::AINCW != 0,
            aincr: value & dmemc_bits::AINCR != 0,
        };
    }

    fn read_dmemc(&self, port: usize) -> u32 {
        let p = self.ports[port];
        let mut value = p.addr;
        if p.aincw {
            value |= dmemc_bits::AINCW;
        }
        if p.aincr {
            value |= dmemc_bits::AINCR;
        }
        value
    }

    fn write_dmemd(&mut self, port: usize, value: u32) {
        let p = self.ports[port];
        self.write_dmem(p.addr, &value.to_le_bytes());
        if p.aincw {
            self.ports[port].addr = (p.addr + 4) & dmemc_bits::ADDR_MASK;
        }
    }

    fn read_dmemd(&mut self, port: usize) -> u32 {
        let p = self.ports[port];
        let value = self.dmem_word(p.addr);
        if p.aincr {
            self.ports[port].addr = (p.addr + 4) & dmemc_bits::ADDR_MASK;
        }
        value
    }

    // ── Boot ────────────────────────────────────────────────────────────────

    fn boot(&mut self) {
        let g = self.geometry.clone();
        for (id, q) in (0u32..).zip(g.queues.iter()) {
            if id == MSGQ {
                self.set_reg(regs::MSGQ_HEAD, q.offset);
                self.set_reg(regs::MSGQ_TAIL, q.offset);
            } else {
                let index = u32::from(q.index);
                self.set_reg(regs::queue_head(index), q.offset);
                self.set_reg(regs::queue_tail(index), q.offset);
            }
        }

        if let Some(id) = g.gid {
            let mut desc = Vec::with_capacity(gid::DESC_SIZE);
            desc.extend_from_slice(&gid::SIGNATURE.to_le_bytes());
            desc.extend_from_slice(&id);
            self.write_dmem(g.sw_area_offset, &desc);
        }

        let init = InitMsg {
            queues: g.queues,
            sw_managed_area_offset: g.sw_area_offset,
            sw_managed_area_size: g.sw_area_size,
        };
        self.booted = true;
        self.held.clear();
        self.backlog.clear();
        self.post_message(PmuMsg::new(unit::INIT, 0, 0, &init.encode()).to_bytes());
        debug!("software falcon booted");
    }

    // ── Firmware: command queues ────────────────────────────────────────────

    fn command_queue(&self, index: u32) -> Option<(u32, QueueInfo)> {
        (0u32..)
            .zip(self.geometry.queues.iter())
            .take(MSGQ as usize)
            .find(|(_, q)| u32::from(q.index) == index)
            .map(|(id, q)| (id, *q))
    }

    /// Consume everything between tail and head of command queue `index`.
    fn consume(&mut self, index: u32) {
        if !self.booted {
            return;
        }
        let Some((id, q)) = self.command_queue(index) else {
            return;
        };
        let head = self.reg(regs::queue_head(index));
        let mut tail = self.reg(regs::queue_tail(index));
        let end = q.offset + u32::from(q.size);
        let mut budget = u32::from(q.size) / 4 + 1;

        while tail != head && budget > 0 {
            budget -= 1;
            let raw: [u8; HDR_SIZE as usize] = match self.dmem_slice(tail, HDR_SIZE as usize) {
                Some(b) => [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]],
                None => break,
            };
            if raw[hdr::UNIT_ID] == unit::REWIND {
                tail = q.offset;
                continue;
            }
            let Ok(header) = Header::decode(&raw) else {
                break;
            };
            let size = u32::from(header.size);
            if size < HDR_SIZE || tail + size > end {
                error!("queue {id}: corrupt command of {size} bytes at {tail:#x}, dropping ring");
                tail = head;
                break;
            }
            let body = self
                .dmem_slice(tail + HDR_SIZE, (size - HDR_SIZE) as usize)
                .map(Bytes::copy_from_slice)
                .unwrap_or_default();
            tail += align(size);
            self.handle_command(id, header, body);
        }
        self.set_reg(regs::queue_tail(index), tail);
    }

    fn handle_command(&mut self, queue: u32, header: Header, body: Bytes) {
        trace!(
            "firmware: unit {:#04x} seq {} on queue {queue}",
            header.unit_id,
            header.seq_id
        );
        self.seen.push(SeenCommand {
            queue,
            hdr: header,
            body: body.clone(),
        });
        if header.ctrl_flags & flags::STATUS == 0 {
            return;
        }
        let reply = self.reply(header, &body).to_bytes();
        if self.auto_respond {
            self.post_message(reply);
        } else {
            self.held.push_back(reply);
        }
    }

    fn reply(&mut self, header: Header, body: &[u8]) -> PmuMsg {
        let seq = header.seq_id;
        if self.unhandled.contains(&header.unit_id) {
            return PmuMsg::new(
                unit::RC,
                FIRMWARE_PRIVATE_FLAG,
                seq,
                &[rc_msg::TYPE_UNHANDLED_CMD, 0, 0, 0],
            );
        }
        let reply_body = match header.unit_id {
            unit::PG => self.pg_reply(body),
            unit::MEM => self.mem_reply(body),
            _ => None,
        }
        .unwrap_or_else(|| 0u32.to_le_bytes().to_vec());
        PmuMsg::new(header.unit_id, FIRMWARE_PRIVATE_FLAG, seq, &reply_body)
    }

    fn pg_reply(&self, body: &[u8]) -> Option<Vec<u8>> {
        let cmd_type = *body.first()?;
        let engine = body.get(1).copied().unwrap_or(ENGINE_GR);
        let word = |at: usize| -> Option<u16> {
            body.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
        };

        let msg = match cmd_type {
            pg_cmd::TYPE_ELPG_CMD => {
                let ack = match word(2)? {
                    pg_cmd::ELPG_INIT => pg_msg::ELPG_INIT_ACK,
                    pg_cmd::ELPG_ALLOW => pg_msg::ELPG_ALLOW_ACK,
                    pg_cmd::ELPG_DISALLOW => pg_msg::ELPG_DISALLOW_ACK,
                    other => {
                        warn!("firmware: unknown ELPG command {other}");
                        return None;
                    }
                };
                PgMsg { msg_type: pg_msg::TYPE_ELPG_MSG, engine, msg: ack, data: 0 }
            }
            pg_cmd::TYPE_PG_STAT => PgMsg {
                msg_type: pg_msg::TYPE_STAT,
                engine,
                msg: pg_msg::STAT_RESP_DMEM_OFFSET,
                data: self.geometry.stat_offset,
            },
            pg_cmd::TYPE_ENG_BUF_LOAD => {
                let status = if word(4)? == 0 {
                    pg_msg::ENG_BUF_FAILED
                } else {
                    pg_msg::ENG_BUF_LOADED
                };
                PgMsg { msg_type: pg_msg::TYPE_ENG_BUF_STAT, engine, msg: status, data: 0 }
            }
            other => {
                warn!("firmware: unknown PG command type {other}");
                return None;
            }
        };
        Some(msg.encode().to_vec())
    }

    fn mem_reply(&mut self, body: &[u8]) -> Option<Vec<u8>> {
        let input = read_alloc(body, mem_cmd::IN_ALLOC)?;
        let output = read_alloc(body, mem_cmd::OUT_ALLOC)?;
        let data: Vec<u8> = self
            .dmem_slice(input.offset, input.size as usize)?
            .iter()
            .map(|b| !b)
            .collect();
        let n = data.len().min(output.size as usize);
        self.write_dmem(output.offset, &data[..n]);
        Some(0u32.to_le_bytes().to_vec())
    }

    // ── Firmware: message queue ─────────────────────────────────────────────

    fn post_message(&mut self, raw: Bytes) {
        if !self.backlog.is_empty() || !self.try_write_message(&raw) {
            debug!("message queue full, {} bytes backlogged", raw.len());
            self.backlog.push_back(raw);
        }
    }

    fn flush_backlog(&mut self) {
        while let Some(raw) = self.backlog.front().cloned() {
            if !self.try_write_message(&raw) {
                break;
            }
            self.backlog.pop_front();
        }
    }

    /// Append `raw` at the message queue head, rewinding when it does not
    /// fit before the end of the ring. False if there is no room.
    fn try_write_message(&mut self, raw: &[u8]) -> bool {
        let q = self.geometry.queues[MSGQ as usize];
        let end = q.offset + u32::from(q.size);
        let size = align(raw.len() as u32);
        let mut head = self.reg(regs::MSGQ_HEAD);
        let tail = self.reg(regs::MSGQ_TAIL);

        let mut rewind = false;
        let mut free = 0;
        if head >= tail {
            free = end.saturating_sub(head).saturating_sub(HDR_SIZE);
            if size > free {
                rewind = true;
                head = q.offset;
            }
        }
        if head < tail {
            free = tail - head - 1;
        }
        if size > free {
            return false;
        }

        if rewind {
            let marker = Header {
                unit_id: unit::REWIND,
                size: HDR_SIZE as u16,
                ctrl_flags: 0,
                seq_id: 0,
            };
            let at = self.reg(regs::MSGQ_HEAD);
            self.write_dmem(at, &marker.encode());
        }
        self.write_dmem(head, raw);
        self.set_reg(regs::MSGQ_HEAD, head + size);
        self.raise(irq::SWGEN0);
        true
    }
}

// ── Register map ─────────────────────────────────────────────────────────────

fn find_index(count: u32, reg: impl Fn(u32) -> u32, addr: u32) -> Option<usize> {
    (0..count).find(|&i| reg(i) == addr).map(|i| i as usize)
}

impl PmuTransport for SoftwareFalcon {
    fn read_register(&self, addr: u32) -> u32 {
        let mut f = self.lock();
        match addr {
            regs::MUTEX_ID => f.generate_token(),
            _ => {
                if let Some(i) = find_index(regs::MUTEX_COUNT, regs::mutex, addr) {
                    f.owners[i]
                } else if let Some(p) = find_index(regs::DMEM_PORT_COUNT, regs::dmemc, addr) {
                    f.read_dmemc(p)
                } else if let Some(p) = find_index(regs::DMEM_PORT_COUNT, regs::dmemd, addr) {
                    f.read_dmemd(p)
                } else {
                    f.reg(addr)
                }
            }
        }
    }

    fn write_register(&self, addr: u32, value: u32) {
        let mut f = self.lock();
        match addr {
            regs::IRQSSET => f.raise(value),
            regs::IRQSCLR => {
                let stat = f.reg(regs::IRQSTAT) & !value;
                f.set_reg(regs::IRQSTAT, stat);
            }
            regs::IRQMSET => {
                let mask = f.reg(regs::IRQMASK) | value;
                f.set_reg(regs::IRQMASK, mask);
                f.fire_if_pending();
            }
            regs::IRQMCLR => {
                let mask = f.reg(regs::IRQMASK) & !value;
                f.set_reg(regs::IRQMASK, mask);
            }
            regs::IRQSTAT | regs::IRQMASK | regs::MUTEX_ID => {
                trace!("write to read-only register {addr:#x} ignored");
            }
            regs::MUTEX_ID_RELEASE => f.release_token(value),
            regs::MSGQ_TAIL => {
                f.set_reg(addr, value);
                f.flush_backlog();
            }
            _ => {
                if let Some(i) = find_index(regs::MUTEX_COUNT, regs::mutex, addr) {
                    f.write_mutex(i, value);
                } else if let Some(p) = find_index(regs::DMEM_PORT_COUNT, regs::dmemc, addr) {
                    f.write_dmemc(p, value);
                } else if let Some(p) = find_index(regs::DMEM_PORT_COUNT, regs::dmemd, addr) {
                    f.write_dmemd(p, value);
                } else if let Some(i) = find_index(regs::QUEUE_REG_COUNT, regs::queue_head, addr) {
                    f.set_reg(addr, value);
                    f.consume(i as u32);
                } else {
                    f.set_reg(addr, value);
                }
            }
        }
    }
}
