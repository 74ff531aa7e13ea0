//! LSP Infrastructure for Tether
//!
//! Provides race-safe Language Server Protocol communication:
//! - JSON-RPC 2.0 protocol types
//! - Message transport with Content-Length framing
//! - Request multiplexer with timeouts, cancellation and retries
//! - Capability gating with dynamic registration

pub mod capabilities;
pub mod client;
pub mod pending;
pub mod protocol;
pub mod transport;

pub use capabilities::{CapabilityGate, LspFeature};
pub use client::{ConnectionState, LspClient, Mapped};
pub use pending::{PendingRequestTable, RequestHandle, RequestKey, RequestState};
pub use transport::{ChannelTransport, ServerEnd, StdioTransport, SubscriptionId, Transport};
