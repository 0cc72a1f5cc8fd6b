//! Interconnect: the request/notification RPC spoken between the gateway and
//! each runner process over a single WebSocket.
//!
//! Both sides build an [`Endpoint`] with typed handlers and bind it to a
//! transport with [`Endpoint::connect`]. The resulting [`IcSession`] issues
//! correlated requests, fire-and-forget notifications, and dispatches every
//! inbound frame to the registered handlers.

mod endpoint;
mod error;
mod frame;
mod session;

pub use endpoint::{Endpoint, HandlerError};
pub use error::IcError;
pub use frame::{ErrorPayload, Frame};
pub use session::{IcOptions, IcSession, IcTransport};
