//! Hazard pointer based memory reclamation.
//!
//! A [`HazardPointers`] registry lets many threads each pin a bounded number
//! of addresses against concurrent reclamation ("protect" them), and defer
//! freeing an unlinked node ("retire" it) until no thread still protects its
//! address. See the module-level docs of [`crate::ordered_set`] for the
//! consumer side of this contract.

mod config;
mod registry;

pub use self::config::{Config, ConfigBuilder};
pub use self::registry::HazardPointers;
