//! Shared utilities: clocks, serde models shared across layers, tracing setup.

pub mod clock;
pub mod serde;
pub mod telemetry;

pub use self::clock::*;
pub use self::serde::*;
pub use self::telemetry::*;
