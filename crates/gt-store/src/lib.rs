//! gt-store -- access to the bead stores behind the `bd` CLI.
//!
//! The dispatch core never touches issue storage directly: every read and
//! write goes through the [`BeadStore`] trait. Production code uses
//! [`bd::BdCli`], which shells out to `bd` in the owning store's directory;
//! tests use [`memory::MemStore`].

pub mod attach;
pub mod bd;
pub mod context;
pub mod mail;
pub mod memory;
mod store;

pub use store::{
    BeadPatch, BeadStore, MoleculeBond, NewBead, Result, StoreError, StoreScope,
};
