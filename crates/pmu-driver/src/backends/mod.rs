//! Transport implementations
//!
//! Two transports are available:
//! - **Software**: in-process falcon model (CI, tests, the `pmu simulate` command)
//! - **MMIO**: `mmap` of a register aperture such as a PCI `resource0` file

pub mod mmio;
pub mod software;

pub use mmio::MmioTransport;
pub use software::{FalconGeometry, SeenCommand, SoftwareFalcon};
