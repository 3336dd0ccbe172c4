//! # Capability Registry
//!
//! Explicit startup registration of the capabilities a worker serves.
//!
//! ```text
//! CapabilityCatalog --discover(settings)--> Vec<Arc<dyn Capability>>
//!                   --CapabilityRegistry::build--> method name table
//!                   --global::install--> process-wide, read-only
//! ```

pub mod capability;
pub mod capability_registry;
pub mod discovery;

pub use capability::{Capability, CapabilityError};
pub use capability_registry::{global, CapabilityRegistry, RegisteredCapability, RegistryError};
pub use discovery::{
    capability_name_for, discover, method_name_for, to_snake_case, CapabilityCatalog,
};
