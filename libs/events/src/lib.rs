//! # lotacao-events
//!
//! Employee lifecycle events as received from the HR system.
//!
//! ## Design Principles
//!
//! - Events are immutable records of one employee transition
//! - The kind of transition is a closed enum; kind-specific data lives on the
//!   variant, so consumers dispatch with an exhaustive `match`
//! - Every event has a stable dedup key so redeliveries can be suppressed
//!
//! ## Event Types
//!
//! - `colaborador.admitido` (admission)
//! - `colaborador.transferido` (transfer between cost centers)
//! - `colaborador.desligado` (termination)
//! - `colaborador.promovido` (promotion to a new role)

mod error;
mod event;
mod types;

pub use error::EventError;
pub use event::*;
pub use types::*;
