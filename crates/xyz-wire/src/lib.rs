//! xyz wire layer: name-addressed RPC between microservice nodes.
//!
//! Nodes exchange length-prefixed JSON frames over TCP. A node exposes named
//! actions to its peers and calls actions on the peers listed in its static
//! configuration.
//!
//! ## Architecture
//!
//! - **ActionRegistry**: action name → handler, last registration wins
//! - **PeerDirectory**: service name → address, built once from config
//! - **Transport**: inbound listener plus lazily opened, reused peer links
//! - **Correlator**: matches response frames to pending calls, exactly once
//! - **Node**: the public `register` / `call` surface

pub mod correlator;
pub mod directory;
pub mod message;
pub mod node;
pub mod registry;
pub mod transport;

pub use correlator::{CallResult, Correlator, Reply};
pub use directory::{CallTarget, PeerDescriptor, PeerDirectory};
pub use message::{WireMessage, WireMessageKind, WireRequest, WireResponse};
pub use node::Node;
pub use registry::{ActionHandler, ActionRegistry, Responder};
pub use transport::{PeerLinkInfo, Transport, WireError};
