//! Gateway side of the runner interconnect.

pub mod connection;
pub mod endpoint;
pub mod messages;
pub mod registry;
pub mod socket;

pub use connection::{CloseOutcome, CloseReason, ConnectionState, RunnerConnection, RunnerDeps, WireFrame};
pub use registry::RunnerRegistry;
