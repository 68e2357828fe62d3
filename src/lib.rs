//! Atmosphere core: the peer-to-peer capability mesh library — gossip engine,
//! capability registry, five-tier intent router, dynamic cost model, and
//! knowledge-chunk distribution.
//!
//! A deployment constructs a [`config::NodeConfig`], wires its own transport
//! and handler implementations against the seams in [`gossip`], [`router`],
//! and [`dispatcher`], and calls [`node::bootstrap`] once at startup.

pub mod config;
pub mod cost;
pub mod dispatcher;
pub mod error;
pub mod gossip;
pub mod interface;
pub mod knowledge;
pub mod node;
pub mod rag;
pub mod registry;
pub mod router;
pub mod simhash;
pub mod types;

pub use config::NodeConfig;
pub use error::{CoreError, ErrorKind};
pub use interface::{submit_intent, CapabilityFilter, IntentResponse, IntentStatus};
pub use node::{bootstrap, get_node, NodeHandle};
pub use types::{Capability, Intent, Node, RouteDecision, TierHit};
