//! gt-core -- domain types, configuration, prefix routing, and the event
//! feed for the Gas Town dispatch core.
//!
//! Everything here is store-agnostic: the types describe beads, rigs, waves,
//! and findings; the actual issue store lives behind the `gt-store` crate.

pub mod config;
pub mod env;
pub mod events;
pub mod routes;
pub mod types;

pub use env::TownEnv;
pub use types::{Bead, BeadId, BeadStatus, BeadType, DepEdge, EdgeType, Wave};
