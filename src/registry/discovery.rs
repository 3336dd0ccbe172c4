//! # Capability Discovery
//!
//! Capabilities are listed explicitly at startup in a [`CapabilityCatalog`].
//! [`discover`] instantiates each entry and keeps only the ones whose
//! settings have `remote_enabled = true`. A factory that fails is logged and
//! skipped; the remaining capabilities are still discovered.
//!
//! Method names are derived from the capability's type name: a trailing
//! `Service` is stripped, the rest is converted to snake_case and
//! `.execute` is appended (`SomeTestService` -> `some_test.execute`).

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info};

use super::capability::{Capability, CapabilityError};
use crate::config::CapabilitySettingsStore;
use crate::constants::jsonrpc::EXECUTE_SUFFIX;

const SERVICE_SUFFIX: &str = "Service";

type CapabilityFactory =
    Arc<dyn Fn() -> Result<Arc<dyn Capability>, CapabilityError> + Send + Sync>;

#[derive(Clone)]
struct CatalogEntry {
    label: String,
    factory: CapabilityFactory,
}

/// Startup-time list of capability factories
#[derive(Clone, Default)]
pub struct CapabilityCatalog {
    entries: Vec<CatalogEntry>,
}

impl fmt::Debug for CapabilityCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityCatalog")
            .field("entries", &self.labels())
            .finish()
    }
}

impl CapabilityCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability constructed through `Default`
    pub fn register<T>(&mut self) -> &mut Self
    where
        T: Capability + Default + 'static,
    {
        let label = std::any::type_name::<T>()
            .rsplit("::")
            .next()
            .unwrap_or_default()
            .to_string();
        self.register_factory(label, || Ok(Arc::new(T::default()) as Arc<dyn Capability>))
    }

    /// Register a fallible factory under a label used for logging
    pub fn register_factory<F>(&mut self, label: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Result<Arc<dyn Capability>, CapabilityError> + Send + Sync + 'static,
    {
        self.entries.push(CatalogEntry {
            label: label.into(),
            factory: Arc::new(factory),
        });
        self
    }

    pub fn labels(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.label.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Instantiate every catalog entry and keep the remotely enabled ones
pub fn discover(
    catalog: &CapabilityCatalog,
    settings: &CapabilitySettingsStore,
) -> Vec<Arc<dyn Capability>> {
    let mut enabled = Vec::with_capacity(catalog.len());
    let mut failed = 0usize;

    for entry in &catalog.entries {
        let capability = match (entry.factory)() {
            Ok(capability) => capability,
            Err(e) => {
                failed += 1;
                error!(
                    label = %entry.label,
                    code = %e.code,
                    error = %e,
                    "Failed to instantiate capability, skipping"
                );
                continue;
            }
        };
        let name = capability_name_for(capability.type_name());

        if settings.remote_enabled(&name) {
            debug!(
                capability = %name,
                method = %method_name_for(capability.as_ref()),
                "Capability enabled for remote calls"
            );
            enabled.push(capability);
        } else {
            info!(capability = %name, "Capability not remote_enabled, skipping");
        }
    }

    info!(
        discovered = enabled.len(),
        failed,
        catalog = catalog.len(),
        "Capability discovery complete"
    );
    enabled
}

/// `TranslateService` -> `translate`
pub fn capability_name_for(type_name: &str) -> String {
    let base = type_name.strip_suffix(SERVICE_SUFFIX).unwrap_or(type_name);
    to_snake_case(base)
}

/// `TranslateService` -> `translate.execute`
pub fn method_name_for(capability: &dyn Capability) -> String {
    format!(
        "{}{}",
        capability_name_for(capability.type_name()),
        EXECUTE_SUFFIX
    )
}

/// CamelCase to snake_case.
///
/// An underscore goes before an uppercase letter that starts a capitalized
/// word (`TextDetector` -> `text_detector`) and before an uppercase letter
/// that follows a lowercase letter or digit. Runs of capitals stay together
/// (`HTTPClient` -> `http_client`).
pub fn to_snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            let after_lower_or_digit = prev.is_ascii_lowercase() || prev.is_ascii_digit();
            if next_is_lower || after_lower_or_digit {
                out.push('_');
            }
        }
        out.push(c.to_ascii_lowercase());
    }
    out
}
