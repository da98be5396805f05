//! Command and message framing shared with the PMU firmware.
//!
//! Everything is little-endian. Commands and messages share one header:
//!
//! ```text
//! byte 0      unit_id
//! byte 1      reserved
//! bytes 2..4  size (header + body, bytes)
//! byte 4      ctrl_flags
//! byte 5      seq_id
//! bytes 6..8  reserved
//! ```
//!
//! Body layouts below are given as byte offsets relative to the start of the
//! body (i.e. after the header).

/// Header size of both commands and messages.
pub const HDR_SIZE: u32 = 8;

/// Header field offsets.
pub mod hdr {
    /// `unit_id` (u8).
    pub const UNIT_ID: usize = 0;
    /// `size` (u16).
    pub const SIZE: usize = 2;
    /// `ctrl_flags` (u8).
    pub const CTRL_FLAGS: usize = 4;
    /// `seq_id` (u8).
    pub const SEQ_ID: usize = 5;
}

// ── Units ────────────────────────────────────────────────────────────────────

/// Unit identifiers.
pub mod unit {
    /// Queue rewind marker (zero body).
    pub const REWIND: u8 = 0x00;
    /// I2C unit.
    pub const I2C: u8 = 0x01;
    /// Sequencer unit.
    pub const SEQ: u8 = 0x02;
    /// Power gating.
    pub const PG: u8 = 0x03;
    /// DMEM copy / memory unit.
    pub const MEM: u8 = 0x06;
    /// Firmware initialisation message.
    pub const INIT: u8 = 0x07;
    /// Recovery / error reporting.
    pub const RC: u8 = 0x1f;
    /// First invalid unit id.
    pub const END: u8 = 0x23;

    /// A unit id that may appear on the wire outside of the rewind protocol.
    pub const fn is_valid(id: u8) -> bool {
        id != REWIND && id < END
    }
}

// ── Control flags ────────────────────────────────────────────────────────────

/// `ctrl_flags` bits.
pub mod flags {
    /// Sender expects a status message.
    pub const STATUS: u8 = 1 << 0;
    /// Raise an interrupt on completion.
    pub const INTR: u8 = 1 << 1;
    /// Unsolicited event (no matching command).
    pub const EVENT: u8 = 1 << 2;
    /// Queue watermark notification.
    pub const WATERMARK: u8 = 1 << 3;
    /// Bits reserved for firmware-internal use; stripped by the host.
    pub const PMU_MASK: u8 = 0xf0;
}

// ── DMEM allocation descriptor ───────────────────────────────────────────────

/// Size of a DMEM allocation descriptor embedded in a command body.
///
/// ```text
/// bytes 0..2  size (u16)
/// bytes 2..4  reserved
/// bytes 4..8  offset (u32)
/// ```
pub const ALLOC_SIZE: u32 = 8;

/// Alignment of DMEM regions handed out for payloads.
pub const DMEM_ALLOC_ALIGNMENT: u32 = 4;

// ── INIT message ─────────────────────────────────────────────────────────────

/// INIT message body layout.
pub mod init {
    /// `msg_type` value of the PMU INIT message.
    pub const MSG_TYPE_PMU_INIT: u8 = 0;
    /// Offset of the queue info array.
    pub const QUEUE_INFO: usize = 4;
    /// Size of one queue info entry: `offset u32, size u16, index u8, rsvd u8`.
    pub const QUEUE_INFO_SIZE: usize = 8;
    /// Offset of `sw_managed_area_offset` (u32).
    pub const SW_MANAGED_AREA_OFFSET: usize = QUEUE_INFO + QUEUE_INFO_SIZE * crate::queue::QUEUE_COUNT;
    /// Offset of `sw_managed_area_size` (u32).
    pub const SW_MANAGED_AREA_SIZE: usize = SW_MANAGED_AREA_OFFSET + 4;
    /// Body length.
    pub const BODY_SIZE: usize = SW_MANAGED_AREA_SIZE + 4;
}

/// Firmware GID descriptor found at the start of the software-managed area.
pub mod gid {
    /// Signature marking a valid descriptor.
    pub const SIGNATURE: u32 = 0xa7c6_6ad2;
    /// GID length.
    pub const GID_SIZE: usize = 20;
    /// Descriptor size: `signature u32` followed by the GID.
    pub const DESC_SIZE: usize = 4 + GID_SIZE;
}

// ── Power gating ─────────────────────────────────────────────────────────────

/// Graphics engine id used in PG commands.
pub const ENGINE_GR: u8 = 0;

/// PG command bodies.
pub mod pg_cmd {
    /// `cmd_type`: ELPG command (`cmd_type u8, engine u8, cmd u16`).
    pub const TYPE_ELPG_CMD: u8 = 0;
    /// `cmd_type`: engine buffer load.
    pub const TYPE_ENG_BUF_LOAD: u8 = 1;
    /// `cmd_type`: statistics (`cmd_type u8, engine u8, sub_cmd u16, data u32`).
    pub const TYPE_PG_STAT: u8 = 3;

    /// ELPG `cmd`: initialise.
    pub const ELPG_INIT: u16 = 0;
    /// ELPG `cmd`: disallow power gating.
    pub const ELPG_DISALLOW: u16 = 1;
    /// ELPG `cmd`: allow power gating.
    pub const ELPG_ALLOW: u16 = 2;

    /// Stat `sub_cmd`: allocate the statistics block in DMEM.
    pub const STAT_ALLOC_DMEM: u16 = 0;

    /// Body size of an ELPG command.
    pub const ELPG_CMD_SIZE: u32 = 4;
    /// Body size of a stat command.
    pub const STAT_CMD_SIZE: u32 = 8;
    /// Body size of an engine buffer load:
    /// `cmd_type u8, engine u8, buf_idx u8, dma_idx u8, buf_size u16,
    /// dma_offset u8, rsvd u8, dma_base u32`.
    pub const ENG_BUF_LOAD_SIZE: u32 = 12;

    /// Engine buffer index: FECS register list.
    pub const BUF_IDX_FECS: u8 = 0;
    /// Engine buffer index: ZBC sequence.
    pub const BUF_IDX_ZBC: u8 = 1;
    /// DMA index for virtual addressing.
    pub const DMAIDX_VIRT: u8 = 1;
}

/// PG message bodies (`msg_type u8, engine u8, msg u16, data u32`).
pub mod pg_msg {
    /// `msg_type`: ELPG acknowledgement.
    pub const TYPE_ELPG_MSG: u8 = 0;
    /// `msg_type`: statistics response.
    pub const TYPE_STAT: u8 = 1;
    /// `msg_type`: engine buffer status.
    pub const TYPE_ENG_BUF_STAT: u8 = 2;

    /// ELPG `msg`: INIT acknowledged.
    pub const ELPG_INIT_ACK: u16 = 0;
    /// ELPG `msg`: DISALLOW acknowledged.
    pub const ELPG_DISALLOW_ACK: u16 = 1;
    /// ELPG `msg`: ALLOW acknowledged.
    pub const ELPG_ALLOW_ACK: u16 = 2;

    /// Stat `sub_msg`: `data` carries the statistics DMEM offset.
    pub const STAT_RESP_DMEM_OFFSET: u16 = 0;

    /// Engine buffer status: loaded. Carried in the `msg` field.
    pub const ENG_BUF_LOADED: u16 = 1;
    /// Engine buffer status: load failed.
    pub const ENG_BUF_FAILED: u16 = 2;

    /// Body size of every PG message.
    pub const BODY_SIZE: u32 = 8;
}

/// RC message bodies (`msg_type u8`).
pub mod rc_msg {
    /// Firmware could not handle the command.
    pub const TYPE_UNHANDLED_CMD: u8 = 0;
}

/// MEM unit loopback command: copy the input region to the output region.
///
/// Body: input allocation descriptor at 0, output allocation descriptor at
/// [`ALLOC_SIZE`](super::ALLOC_SIZE). Response body: `status u32`.
pub mod mem_cmd {
    /// Offset of the input descriptor in the body.
    pub const IN_ALLOC: u32 = 0;
    /// Offset of the output descriptor in the body.
    pub const OUT_ALLOC: u32 = super::ALLOC_SIZE;
    /// Body size.
    pub const BODY_SIZE: u32 = 2 * super::ALLOC_SIZE;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewind_is_not_a_valid_unit() {
        assert!(!unit::is_valid(unit::REWIND));
        assert!(unit::is_valid(unit::PG));
        assert!(unit::is_valid(unit::RC));
        assert!(!unit::is_valid(unit::END));
    }

    #[test]
    fn init_body_layout() {
        assert_eq!(init::SW_MANAGED_AREA_OFFSET, 36);
        assert_eq!(init::BODY_SIZE, 44);
    }

    #[test]
    fn private_flags_do_not_collide() {
        let public = flags::STATUS | flags::INTR | flags::EVENT | flags::WATERMARK;
        assert_eq!(public & flags::PMU_MASK, 0);
    }
}
