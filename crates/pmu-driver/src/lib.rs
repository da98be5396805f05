//! Host-side command/response channel for the falcon PMU.
//!
//! The host and the PMU firmware share nothing but falcon DMEM, a bank of
//! hardware mutex registers and one interrupt (swgen0). This crate drives the
//! protocol on top of those: DMEM ring-buffer queues, a sequence table that
//! pairs responses with the commands that caused them, payload staging in a
//! host-managed DMEM area, and the engine-level power-gating handshake.
//!
//! # Layers
//!
//! ```text
//! PmuChannel ── post_command / cancel / enable / disable / shutdown
//!   ├── cmd.rs   validate, claim a slot, stage payload, enqueue
//!   ├── msg.rs   drain the message queue, run completions
//!   ├── elpg.rs  power-gating state machine and debounce timer
//!   ├── queue.rs DMEM rings with rewind
//!   ├── mutex.rs hardware mutex arbiter
//!   └── PmuTransport ── SoftwareFalcon (in-process) | MmioTransport (mmap)
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use pmu_driver::backends::SoftwareFalcon;
//! use pmu_driver::{ChannelConfig, PmuChannel, PmuCmd, Response, SeqDesc};
//! use pmu_chip::queue::SWQ;
//! use pmu_chip::wire::unit;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let falcon = Arc::new(SoftwareFalcon::new());
//! let irq = falcon.connect_irq();
//!
//! let channel = PmuChannel::new(falcon.clone(), ChannelConfig::default());
//! channel.init()?;
//! channel.start_notifier(irq)?;
//! falcon.boot();
//! channel.wait_boot_handshake()?;
//!
//! channel.post(PmuCmd::new(unit::SEQ, &[]), SWQ, |desc: SeqDesc, r: pmu_driver::Result<Response>| {
//!     println!("command {desc}: {:?}", r.map(|resp| resp.status()));
//! })?;
//! channel.shutdown();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod backends;
mod channel;
mod cmd;
mod config;
pub mod dmem;
mod elpg;
mod error;
mod msg;
pub mod mutex;
pub mod queue;
mod seq;
pub mod transport;
pub mod wait;
pub mod wire;

pub use channel::PmuChannel;
pub use cmd::{Payload, PayloadIn, PayloadOut};
pub use config::ChannelConfig;
pub use dmem::{DmemAllocator, DmemRegion, RangeAllocator};
pub use elpg::{ElpgState, PgStatus};
pub use error::{PmuError, Result};
pub use seq::{Completion, Response, SeqDesc, SeqState, MAX_SEQUENCES};
pub use transport::{Clock, PmuTransport, SystemClock, VirtualClock};
pub use wire::{Header, PmuCmd, PmuMsg};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        ChannelConfig, Completion, ElpgState, Payload, PmuChannel, PmuCmd, PmuError, PmuMsg,
        PmuTransport, Response, Result, SeqDesc,
    };
}
