//! # Capability Registry
//!
//! Immutable `method name -> capability` table built once at startup.
//! Registration fails fast: duplicate method names and stage lists that do
//! not validate are rejected before any request is served.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use super::capability::Capability;
use super::discovery::{capability_name_for, method_name_for};
use crate::constants::jsonrpc::EXECUTE_SUFFIX;
use crate::stages::{StageConfigLoader, StageDefinition, StageError};

#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    #[error("Method '{method}' is provided by both {existing} and {duplicate}")]
    DuplicateMethod {
        method: String,
        existing: String,
        duplicate: String,
    },

    #[error("Capability {capability} has an invalid stage list: {source}")]
    InvalidStages {
        capability: String,
        #[source]
        source: StageError,
    },

    #[error("A capability registry is already installed")]
    AlreadyInstalled,
}

/// One registered capability with its resolved stages
#[derive(Debug, Clone)]
pub struct RegisteredCapability {
    method_name: String,
    name: String,
    capability: Arc<dyn Capability>,
    stages: StageDefinition,
}

impl RegisteredCapability {
    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capability(&self) -> &Arc<dyn Capability> {
        &self.capability
    }

    pub fn stages(&self) -> &StageDefinition {
        &self.stages
    }
}

#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    by_method: HashMap<String, RegisteredCapability>,
}

impl CapabilityRegistry {
    /// Register capabilities using the stages each one declares
    pub fn build(capabilities: Vec<Arc<dyn Capability>>) -> Result<Self, RegistryError> {
        Self::build_with(capabilities, |capability| capability.stages())
    }

    /// Register capabilities, preferring stage files over declared stages
    pub fn build_with_stage_loader(
        capabilities: Vec<Arc<dyn Capability>>,
        loader: &StageConfigLoader,
    ) -> Result<Self, RegistryError> {
        Self::build_with(capabilities, |capability| {
            loader
                .config_for(capability.type_name())
                .map(|file| file.definition())
                .unwrap_or_else(|| capability.stages())
        })
    }

    fn build_with<F>(
        capabilities: Vec<Arc<dyn Capability>>,
        stages_for: F,
    ) -> Result<Self, RegistryError>
    where
        F: Fn(&dyn Capability) -> StageDefinition,
    {
        let mut by_method: HashMap<String, RegisteredCapability> =
            HashMap::with_capacity(capabilities.len());

        for capability in capabilities {
            let method_name = method_name_for(capability.as_ref());
            if let Some(existing) = by_method.get(&method_name) {
                return Err(RegistryError::DuplicateMethod {
                    method: method_name,
                    existing: existing.capability.type_name().to_string(),
                    duplicate: capability.type_name().to_string(),
                });
            }

            let stages = stages_for(capability.as_ref());
            stages
                .validate_sequence()
                .map_err(|source| RegistryError::InvalidStages {
                    capability: capability.type_name().to_string(),
                    source,
                })?;

            debug!(
                method = %method_name,
                stages = ?stages.stage_info(),
                "Registered capability"
            );
            let name = capability_name_for(capability.type_name());
            by_method.insert(
                method_name.clone(),
                RegisteredCapability {
                    method_name,
                    name,
                    capability,
                    stages,
                },
            );
        }

        info!(methods = by_method.len(), "Capability registry built");
        Ok(Self { by_method })
    }

    /// Look up by full method name (`translate.execute`)
    pub fn get(&self, method: &str) -> Option<&RegisteredCapability> {
        self.by_method.get(method)
    }

    /// Look up by short name (`translate`)
    pub fn get_by_name(&self, name: &str) -> Option<&RegisteredCapability> {
        self.by_method.get(&format!("{name}{EXECUTE_SUFFIX}"))
    }

    /// Method name first, then short name
    pub fn resolve(&self, name_or_method: &str) -> Option<&RegisteredCapability> {
        self.get(name_or_method)
            .or_else(|| self.get_by_name(name_or_method))
    }

    pub fn contains(&self, method: &str) -> bool {
        self.by_method.contains_key(method)
    }

    /// Registered method names, sorted
    pub fn list_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.by_method.keys().cloned().collect();
        methods.sort();
        methods
    }

    pub fn len(&self) -> usize {
        self.by_method.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_method.is_empty()
    }
}

/// Process-wide registry, installed once at startup
pub mod global {
    use std::sync::{Arc, OnceLock};

    use super::{CapabilityRegistry, RegistryError};

    static REGISTRY: OnceLock<Arc<CapabilityRegistry>> = OnceLock::new();

    /// Install the registry; fails if one is already installed
    pub fn install(registry: CapabilityRegistry) -> Result<Arc<CapabilityRegistry>, RegistryError> {
        let registry = Arc::new(registry);
        REGISTRY
            .set(Arc::clone(&registry))
            .map_err(|_| RegistryError::AlreadyInstalled)?;
        Ok(registry)
    }

    pub fn get() -> Option<Arc<CapabilityRegistry>> {
        REGISTRY.get().cloned()
    }

    pub fn is_installed() -> bool {
        REGISTRY.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CapabilityError;
    use crate::stages::Stage;
    use async_trait::async_trait;
    use serde_json::Value;

    #[derive(Debug)]
    struct Fake {
        type_name: &'static str,
        stages: StageDefinition,
    }

    impl Fake {
        fn new(type_name: &'static str) -> Arc<dyn Capability> {
            Arc::new(Self {
                type_name,
                stages: StageDefinition::fallback(),
            })
        }
    }

    #[async_trait]
    impl Capability for Fake {
        fn type_name(&self) -> &str {
            self.type_name
        }

        fn stages(&self) -> StageDefinition {
            self.stages.clone()
        }

        async fn execute(&self, input: Value) -> Result<Value, CapabilityError> {
            Ok(input)
        }
    }

    #[test]
    fn test_build_and_lookup() {
        let registry = CapabilityRegistry::build(vec![
            Fake::new("TranslateService"),
            Fake::new("OcrService"),
        ])
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.list_methods(),
            vec!["ocr.execute".to_string(), "translate.execute".to_string()]
        );
        assert_eq!(
            registry.get("translate.execute").unwrap().name(),
            "translate"
        );
        assert!(registry.get_by_name("ocr").is_some());
        assert!(registry.resolve("ocr").is_some());
        assert!(registry.resolve("ocr.execute").is_some());
        assert!(registry.resolve("speech").is_none());
    }

    #[test]
    fn test_duplicate_method_rejected() {
        let err = CapabilityRegistry::build(vec![
            Fake::new("TranslateService"),
            Fake::new("Translate"),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::DuplicateMethod { ref method, .. } if method == "translate.execute"
        ));
    }

    #[test]
    fn test_invalid_stages_rejected() {
        let broken = Arc::new(Fake {
            type_name: "BrokenService",
            stages: StageDefinition::new(vec![
                Stage::new("late", 80).unwrap(),
                Stage::new("early", 10).unwrap(),
            ]),
        });
        let err = CapabilityRegistry::build(vec![broken]).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidStages { .. }));
    }

    #[test]
    fn test_stage_files_override_declared_stages() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("translate_stages.yaml"),
            "stages:\n  - id: loading_model\n    progress: 20\n",
        )
        .unwrap();
        let loader = StageConfigLoader::new(dir.path());

        let registry = CapabilityRegistry::build_with_stage_loader(
            vec![Fake::new("TranslateService"), Fake::new("OcrService")],
            &loader,
        )
        .unwrap();

        let translate = registry.get_by_name("translate").unwrap();
        assert_eq!(translate.stages().progress_for("loading_model"), 20);
        let ocr = registry.get_by_name("ocr").unwrap();
        assert_eq!(ocr.stages(), &StageDefinition::fallback());
    }
}
