//! Phase-Boundary Clock
//!
//! Every round lasts two ticks. The clock marks the two boundaries of a
//! round by emitting [`PotEvent::PotStart`] (competition opens) and
//! [`PotEvent::PotOver`] (competition closes, decision phase opens), one
//! tick apart, forever alternating.
//!
//! # Grid
//!
//! Boundaries sit on a grid anchored to a reference block's timestamp:
//!
//! ```text
//!   PotOver          PotStart         PotOver          PotStart
//!      |<---- tick ---->|<---- tick ---->|<---- tick ---->|
//!      O             O + tick        O + 2tick       O + 3tick
//! ```
//!
//! The genesis block's timestamp is itself a `PotOver` point. Every later
//! block is stamped with the `PotStart` boundary it was built on, so its
//! grid origin is one tick earlier.
//!
//! # Modes
//!
//! - [`ClockMode::DriftCorrected`]: [`Clock::trigger`] re-aligns the next
//!   boundary to the grid of each newly decided block (at most once per cycle).
//! - [`ClockMode::FreeRunning`]: the grid chosen at [`Clock::start`] is kept
//!   and `trigger` only validates its anchor.

mod clock;
mod error;

pub use clock::{Clock, ClockConfig, ClockMode, PotEvent, PotTick};
pub use error::{ClockError, Result};
