//! Process orchestration for heterogeneous agent CLIs.
//!
//! The relay drives one external agent process per conversation turn,
//! normalizes three structurally different output protocols into a single
//! event stream, paces that stream for UI consumption, and guarantees that
//! every spawned process and its staged artifacts are cleaned up exactly
//! once — on success, failure, timeout, and abort alike.

pub mod artifacts;
pub mod buffer;
pub mod config;
pub mod error;
pub mod normalize;
pub mod orchestrator;
pub mod providers;
pub mod registry;
pub mod session;
pub mod sink;

pub use error::RelayErr;
pub use error::Result;
pub use orchestrator::Orchestrator;
pub use orchestrator::TurnRequest;
pub use orchestrator::TurnSettings;
pub use registry::ProcessRegistry;
pub use session::InMemorySessionStore;
pub use session::SessionStore;
pub use sink::CollectorSink;
pub use sink::EventSink;
