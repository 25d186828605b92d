//! Wire and data types shared across the relay workspace.
//!
//! Everything here is plain data: provider tags, the provider-agnostic
//! event stream produced by output normalization, and the sink protocol
//! delivered to clients. No I/O happens in this crate.

mod event;
mod provider;

pub use event::BufferedIncrement;
pub use event::NormalizedEvent;
pub use event::Role;
pub use event::Turn;
pub use event::TurnEvent;
pub use provider::OutputProtocol;
pub use provider::ProviderKind;
pub use provider::UnknownProviderError;
