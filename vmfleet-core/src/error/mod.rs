//! Error handling for vmfleet
//!
//! Every fallible operation in the core returns [`FleetResult`]. Errors fall
//! into a small taxonomy that callers branch on:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     vmfleet Error Taxonomy                    │
//! ├───────────────────────────────────────────────────────────────┤
//! │  Not Found          │  Wrong Variant      │  Invalid State     │
//! │  • vm               │  • kvm-only ops     │  • kill/start/stop │
//! │  • tap position     │    on containers    │    outside mask    │
//! │  • hotplug disk     │                     │                    │
//! ├───────────────────────────────────────────────────────────────┤
//! │  Malformed Input    │  Environment        │  System            │
//! │  • netspec          │  • missing binary   │  • IO / JSON       │
//! │  • vlan / range     │                     │  • bincode         │
//! │  • vm type          │                     │  • mesh / internal │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Batch operations never fold several failures into one error. They return a
//! list of per-target outcomes instead (see [`crate::target::TargetOutcome`]).

pub mod constructors;
pub mod conversions;
pub mod types;

pub use types::{format_errors, FleetError, FleetResult};

#[cfg(test)]
mod tests;
