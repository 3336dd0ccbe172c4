//! Built-in capabilities shipped with the worker.

pub mod echo;

pub use echo::EchoService;

use crate::registry::CapabilityCatalog;

/// Catalog holding every built-in capability
pub fn builtin_catalog() -> CapabilityCatalog {
    let mut catalog = CapabilityCatalog::new();
    catalog.register::<EchoService>();
    catalog
}
