//! Error types for PMU channel operations

use thiserror::Error;

/// Result type alias for PMU operations
pub type Result<T> = std::result::Result<T, PmuError>;

/// Errors that can occur on the PMU command/response channel
#[derive(Debug, Error)]
pub enum PmuError {
    /// DMEM offset not word aligned
    #[error("DMEM offset {offset:#x} not 4-byte aligned")]
    Alignment {
        /// Offending offset
        offset: u32,
    },

    /// Not enough room in a queue for the write (retryable)
    #[error("Queue {queue} full: {size} bytes requested")]
    QueueFull {
        /// Queue id
        queue: u32,
        /// Requested (unaligned) size
        size: u32,
    },

    /// Queue used without being opened in that direction
    #[error("Queue {queue} not open for {op}")]
    QueueNotOpen {
        /// Queue id
        queue: u32,
        /// Attempted operation
        op: &'static str,
    },

    /// Queue opened twice
    #[error("Queue {queue} already open")]
    QueueAlreadyOpen {
        /// Queue id
        queue: u32,
    },

    /// Hardware mutex could not be acquired in time
    #[error("Mutex {id} not acquired after {waited_ms}ms")]
    MutexTimeout {
        /// Mutex id
        id: u32,
        /// Time spent polling
        waited_ms: u64,
    },

    /// Release attempted with a token that does not own the mutex
    #[error("Mutex {id}: requester {token:#x} does not match owner {owner:#x}")]
    OwnerMismatch {
        /// Mutex id
        id: u32,
        /// Caller's token
        token: u32,
        /// Current owner register value
        owner: u32,
    },

    /// Mutex id outside the hardware bank
    #[error("Invalid mutex id {id}")]
    InvalidMutex {
        /// Mutex id
        id: u32,
    },

    /// No free sequence slot (retryable)
    #[error("No free sequence available")]
    SequenceExhausted,

    /// Unit id not valid on the wire
    #[error("Invalid unit id {unit:#04x}")]
    InvalidUnit {
        /// Unit id
        unit: u8,
    },

    /// Command rejected by validation
    #[error("Invalid command: {reason}")]
    InvalidCommand {
        /// Reason for rejection
        reason: String,
    },

    /// Message from firmware could not be parsed
    #[error("Invalid message: {reason}")]
    InvalidMessage {
        /// Reason for rejection
        reason: String,
    },

    /// Response larger than the caller's buffer
    #[error("Response of {needed} bytes exceeds buffer of {capacity} bytes")]
    BufferTooSmall {
        /// Response size
        needed: u32,
        /// Caller's capacity
        capacity: u32,
    },

    /// Firmware reported the command as unhandled
    #[error("Firmware did not handle command on sequence {seq}")]
    UnhandledCommand {
        /// Sequence id
        seq: u8,
    },

    /// Power-gating handshake not acknowledged in time
    #[error("{what} not acknowledged after {waited_ms}ms")]
    AckTimeout {
        /// Which acknowledgement
        what: &'static str,
        /// Time waited
        waited_ms: u64,
    },

    /// Blocking wait interrupted before its condition held
    #[error("Wait interrupted: {what}")]
    Interrupted {
        /// What was being waited for
        what: &'static str,
    },

    /// Channel has not seen the INIT message or was shut down
    #[error("PMU channel not ready")]
    NotReady,

    /// DMEM allocator could not satisfy the request
    #[error("DMEM exhausted: {size} bytes requested")]
    DmemExhausted {
        /// Requested size
        size: u32,
    },

    /// Transport-level failure
    #[error("Transport error: {reason}")]
    Transport {
        /// Reason for failure
        reason: String,
    },

    /// I/O error while setting up a transport
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl PmuError {
    /// Create an invalid command error
    pub fn invalid_command(reason: impl Into<String>) -> Self {
        Self::InvalidCommand {
            reason: reason.into(),
        }
    }

    /// Create an invalid message error
    pub fn invalid_message(reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            reason: reason.into(),
        }
    }

    /// Create a transport error
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the same operation after backing off.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QueueFull { .. } | Self::SequenceExhausted | Self::DmemExhausted { .. }
        )
    }
}
