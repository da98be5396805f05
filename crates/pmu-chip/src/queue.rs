//! Queue identifiers and layout constants.
//!
//! The firmware publishes four queues in its INIT message. Two are hardware
//! command queues consumed round-robin by the firmware and arbitrated with
//! the hardware mutexes, one is a driver-local command queue guarded by a
//! host lock, and one carries messages from the firmware to the host.

/// High-priority command queue.
pub const HPQ: u32 = 0;
/// Low-priority command queue.
pub const LPQ: u32 = 1;
/// Software command queue (host lock, no hardware arbitration).
pub const SWQ: u32 = 2;
/// Firmware → host message queue.
pub const MSGQ: u32 = 3;

/// Number of queues described by the INIT message.
pub const QUEUE_COUNT: usize = 4;

/// Every queue element is padded to this many bytes.
pub const QUEUE_ALIGNMENT: u32 = 4;

/// True for queues the host writes commands into.
pub const fn is_command_queue(id: u32) -> bool {
    id < MSGQ
}

/// True for command queues arbitrated through hardware mutexes.
pub const fn is_hw_command_queue(id: u32) -> bool {
    id == HPQ || id == LPQ
}

/// True for the driver-local command queue.
pub const fn is_sw_command_queue(id: u32) -> bool {
    id == SWQ
}

/// True for the message queue.
pub const fn is_message_queue(id: u32) -> bool {
    id == MSGQ
}

/// Round `size` up to the queue alignment unit.
pub const fn align(size: u32) -> u32 {
    (size + QUEUE_ALIGNMENT - 1) & !(QUEUE_ALIGNMENT - 1)
}
