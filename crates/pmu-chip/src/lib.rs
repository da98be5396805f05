//! Silicon model for the falcon power-management unit (PMU).
//!
//! This crate has **no dependencies** and **no hardware access**; it is a
//! pure model of the PMU as the host sees it: the PWR register block, the
//! queue layout and the message/command framing the firmware expects.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regs`] | PWR register block: falcon interrupt, DMEM port, queue, mutex and PG registers |
//! | [`queue`] | Queue identifiers, alignment and queue-class predicates |
//! | [`wire`] | Header layout, unit ids, control flags and unit body layouts |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod queue;
pub mod regs;
pub mod wire;
