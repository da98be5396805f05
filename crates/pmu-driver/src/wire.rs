//! Command and message encoding
//!
//! Typed views over the little-endian framing defined in
//! [`pmu_chip::wire`]. Commands are built on the host and copied into a
//! command queue; messages are popped from the message queue and parsed.

use crate::dmem::DmemRegion;
use crate::error::{PmuError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use pmu_chip::queue::QUEUE_COUNT;
use pmu_chip::wire::{self, flags, gid, init, pg_cmd, pg_msg, rc_msg, unit, HDR_SIZE};

/// Common command/message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// Destination or source unit
    pub unit_id: u8,
    /// Header + body size in bytes
    pub size: u16,
    /// `ctrl_flags` bits
    pub ctrl_flags: u8,
    /// Sequence id tying a response to its command
    pub seq_id: u8,
}

impl Header {
    /// Encoded header.
    pub fn encode(&self) -> [u8; HDR_SIZE as usize] {
        let mut out = [0u8; HDR_SIZE as usize];
        let mut buf = &mut out[..];
        buf.put_u8(self.unit_id);
        buf.put_u8(0);
        buf.put_u16_le(self.size);
        buf.put_u8(self.ctrl_flags);
        buf.put_u8(self.seq_id);
        buf.put_u16_le(0);
        out
    }

    /// Decode a header from the first [`HDR_SIZE`] bytes of `raw`.
    ///
    /// # Errors
    ///
    /// [`PmuError::InvalidMessage`] if `raw` is shorter than a header.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < HDR_SIZE as usize {
            return Err(PmuError::invalid_message(format!(
                "header needs {HDR_SIZE} bytes, got {}",
                raw.len()
            )));
        }
        let mut buf = raw;
        let unit_id = buf.get_u8();
        buf.advance(1);
        let size = buf.get_u16_le();
        let ctrl_flags = buf.get_u8();
        let seq_id = buf.get_u8();
        Ok(Self {
            unit_id,
            size,
            ctrl_flags,
            seq_id,
        })
    }

    /// Body length implied by `size`.
    pub fn body_len(&self) -> u32 {
        u32::from(self.size).saturating_sub(HDR_SIZE)
    }
}

// ── Commands ─────────────────────────────────────────────────────────────────

/// A command bound for a command queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmuCmd {
    /// Header. `size` is kept in sync with the body.
    pub hdr: Header,
    body: BytesMut,
}

impl PmuCmd {
    /// Command for `unit_id` with `body`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(unit_id: u8, body: &[u8]) -> Self {
        Self {
            hdr: Header {
                unit_id,
                size: (HDR_SIZE as usize + body.len()).min(usize::from(u16::MAX)) as u16,
                ctrl_flags: 0,
                seq_id: 0,
            },
            body: BytesMut::from(body),
        }
    }

    /// ELPG command (`INIT`, `ALLOW`, `DISALLOW`) for the graphics engine.
    pub fn elpg(cmd: u16) -> Self {
        let mut body = BytesMut::with_capacity(pg_cmd::ELPG_CMD_SIZE as usize);
        body.put_u8(pg_cmd::TYPE_ELPG_CMD);
        body.put_u8(wire::ENGINE_GR);
        body.put_u16_le(cmd);
        Self::new(unit::PG, &body)
    }

    /// Ask the firmware to allocate its statistics block in DMEM.
    pub fn pg_stat_alloc_dmem() -> Self {
        let mut body = BytesMut::with_capacity(pg_cmd::STAT_CMD_SIZE as usize);
        body.put_u8(pg_cmd::TYPE_PG_STAT);
        body.put_u8(wire::ENGINE_GR);
        body.put_u16_le(pg_cmd::STAT_ALLOC_DMEM);
        body.put_u32_le(0);
        Self::new(unit::PG, &body)
    }

    /// Load engine buffer `buf_idx` from the GPU virtual address `dma_addr`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn eng_buf_load(buf_idx: u8, dma_addr: u64, buf_size: u16) -> Self {
        let mut body = BytesMut::with_capacity(pg_cmd::ENG_BUF_LOAD_SIZE as usize);
        body.put_u8(pg_cmd::TYPE_ENG_BUF_LOAD);
        body.put_u8(wire::ENGINE_GR);
        body.put_u8(buf_idx);
        body.put_u8(pg_cmd::DMAIDX_VIRT);
        body.put_u16_le(buf_size);
        body.put_u8((dma_addr & 0xff) as u8);
        body.put_u8(0);
        body.put_u32_le((dma_addr >> 8) as u32);
        Self::new(unit::PG, &body)
    }

    /// MEM loopback: firmware copies the input payload to the output payload.
    pub fn mem_copy() -> Self {
        Self::new(unit::MEM, &[0u8; wire::mem_cmd::BODY_SIZE as usize])
    }

    /// Command body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Declared size (header + body).
    pub fn size(&self) -> u32 {
        u32::from(self.hdr.size)
    }

    /// Write an allocation descriptor for `region` at `offset` within the body.
    ///
    /// # Errors
    ///
    /// [`PmuError::InvalidCommand`] if the descriptor does not fit the body.
    #[allow(clippy::cast_possible_truncation)]
    pub fn patch_alloc(&mut self, offset: u32, region: DmemRegion) -> Result<()> {
        let start = offset as usize;
        let end = start + wire::ALLOC_SIZE as usize;
        if end > self.body.len() {
            return Err(PmuError::invalid_command(format!(
                "allocation descriptor at body offset {offset} overruns {}-byte body",
                self.body.len()
            )));
        }
        let mut slot = &mut self.body[start..end];
        slot.put_u16_le(region.size.min(u32::from(u16::MAX)) as u16);
        slot.put_u16_le(0);
        slot.put_u32_le(region.offset);
        Ok(())
    }

    /// Encoded header followed by the body.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.size() as usize);
        out.put_slice(&self.hdr.encode());
        out.put_slice(&self.body);
        out.freeze()
    }
}

/// Read an allocation descriptor from `body` at `offset`.
pub fn read_alloc(body: &[u8], offset: u32) -> Option<DmemRegion> {
    let mut slot = body.get(offset as usize..(offset + wire::ALLOC_SIZE) as usize)?;
    let size = u32::from(slot.get_u16_le());
    slot.advance(2);
    let offset = slot.get_u32_le();
    Some(DmemRegion { offset, size })
}

// ── Messages ─────────────────────────────────────────────────────────────────

/// A message received from the firmware.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PmuMsg {
    /// Header as received (firmware-private flag bits already stripped)
    pub hdr: Header,
    /// Body bytes (`hdr.size - HDR_SIZE` long)
    pub body: Bytes,
}

impl PmuMsg {
    /// Message for `unit_id` with `body`, as the firmware would emit it.
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(unit_id: u8, ctrl_flags: u8, seq_id: u8, body: &[u8]) -> Self {
        Self {
            hdr: Header {
                unit_id,
                size: (HDR_SIZE as usize + body.len()).min(usize::from(u16::MAX)) as u16,
                ctrl_flags,
                seq_id,
            },
            body: Bytes::copy_from_slice(body),
        }
    }

    /// Declared size (header + body).
    pub fn size(&self) -> u32 {
        u32::from(self.hdr.size)
    }

    /// True for unsolicited firmware events: the public flags are exactly
    /// `EVENT`. Firmware-private bits (`PMU_MASK`) must be cleared first.
    pub const fn is_event(&self) -> bool {
        self.hdr.ctrl_flags == flags::EVENT
    }

    /// True if the firmware reports the command as unhandled.
    pub fn is_unhandled_cmd(&self) -> bool {
        self.hdr.unit_id == unit::RC && self.body.first() == Some(&rc_msg::TYPE_UNHANDLED_CMD)
    }

    /// Encoded header followed by the body.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.size() as usize);
        out.put_slice(&self.hdr.encode());
        out.put_slice(&self.body);
        out.freeze()
    }
}

/// Power-gating message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgMsg {
    /// `TYPE_ELPG_MSG`, `TYPE_STAT` or `TYPE_ENG_BUF_STAT`
    pub msg_type: u8,
    /// Engine id
    pub engine: u8,
    /// ELPG ack, stat sub-message or buffer status
    pub msg: u16,
    /// Payload word (statistics DMEM offset for `STAT_RESP_DMEM_OFFSET`)
    pub data: u32,
}

impl PgMsg {
    /// Parse a PG message body.
    ///
    /// # Errors
    ///
    /// [`PmuError::InvalidMessage`] if the body is too short.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < pg_msg::BODY_SIZE as usize {
            return Err(PmuError::invalid_message(format!(
                "PG message body of {} bytes",
                body.len()
            )));
        }
        let mut buf = body;
        Ok(Self {
            msg_type: buf.get_u8(),
            engine: buf.get_u8(),
            msg: buf.get_u16_le(),
            data: buf.get_u32_le(),
        })
    }

    /// Encoded body.
    pub fn encode(&self) -> [u8; pg_msg::BODY_SIZE as usize] {
        let mut out = [0u8; pg_msg::BODY_SIZE as usize];
        let mut buf = &mut out[..];
        buf.put_u8(self.msg_type);
        buf.put_u8(self.engine);
        buf.put_u16_le(self.msg);
        buf.put_u32_le(self.data);
        out
    }
}

// ── INIT ─────────────────────────────────────────────────────────────────────

/// Queue placement advertised by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueInfo {
    /// DMEM offset of the ring
    pub offset: u32,
    /// Ring size in bytes
    pub size: u16,
    /// Head/tail register index
    pub index: u8,
}

/// Body of the firmware INIT message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InitMsg {
    /// Per-queue placement, indexed by queue id
    pub queues: [QueueInfo; QUEUE_COUNT],
    /// Start of the DMEM area the host allocates payloads from
    pub sw_managed_area_offset: u32,
    /// Size of that area
    pub sw_managed_area_size: u32,
}

impl InitMsg {
    /// Parse an INIT message body.
    ///
    /// # Errors
    ///
    /// [`PmuError::InvalidMessage`] for a short body or a foreign `msg_type`.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < init::BODY_SIZE {
            return Err(PmuError::invalid_message(format!(
                "INIT body of {} bytes, expected {}",
                body.len(),
                init::BODY_SIZE
            )));
        }
        if body[0] != init::MSG_TYPE_PMU_INIT {
            return Err(PmuError::invalid_message(format!(
                "expected PMU_INIT, got msg_type {}",
                body[0]
            )));
        }

        let mut buf = &body[init::QUEUE_INFO..];
        let mut queues = [QueueInfo::default(); QUEUE_COUNT];
        for q in &mut queues {
            q.offset = buf.get_u32_le();
            q.size = buf.get_u16_le();
            q.index = buf.get_u8();
            buf.advance(1);
        }
        let sw_managed_area_offset = buf.get_u32_le();
        let sw_managed_area_size = buf.get_u32_le();
        Ok(Self {
            queues,
            sw_managed_area_offset,
            sw_managed_area_size,
        })
    }

    /// Encoded body.
    pub fn encode(&self) -> [u8; init::BODY_SIZE] {
        let mut out = [0u8; init::BODY_SIZE];
        out[0] = init::MSG_TYPE_PMU_INIT;
        let mut buf = &mut out[init::QUEUE_INFO..];
        for q in &self.queues {
            buf.put_u32_le(q.offset);
            buf.put_u16_le(q.size);
            buf.put_u8(q.index);
            buf.put_u8(0);
        }
        buf.put_u32_le(self.sw_managed_area_offset);
        buf.put_u32_le(self.sw_managed_area_size);
        out
    }
}

/// Parse a firmware GID descriptor; `None` if the signature is absent.
pub fn parse_gid(raw: &[u8]) -> Option<[u8; gid::GID_SIZE]> {
    if raw.len() < gid::DESC_SIZE {
        return None;
    }
    let mut buf = raw;
    if buf.get_u32_le() != gid::SIGNATURE {
        return None;
    }
    let mut out = [0u8; gid::GID_SIZE];
    buf.copy_to_slice(&mut out);
    Some(out)
}
