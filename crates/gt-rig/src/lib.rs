//! gt-rig -- the rig-side half of the dispatch core: availability state
//! (parked/docked across the wisp and label stores) and the polecat
//! provisioner contract the sling executor consumes.

pub mod availability;
pub mod provision;
pub mod session;

pub use availability::{dock, identity_bead_id, park, rig_availability, undock, unpark, WispStore};
pub use provision::{PolecatProvisioner, ProvisionedPolecat, SpawnOpts};
pub use session::{polecat_address, session_name, SessionHost, TmuxHost};
