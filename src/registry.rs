//! Capability registry.
//!
//! A static table of the components that collaborate with the engine
//! (translators, verifiers, action cores, hard strands). Built-ins are
//! registered at startup; everything else arrives through `register` or a
//! whole-set `reload`. Descriptors are data only: nothing is loaded.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, VoltError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Translator,
    Verifier,
    ActionCore,
    HardStrand,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityDescriptor {
    pub id: String,
    pub display_name: String,
    pub version: String,
    pub kind: CapabilityKind,
}

impl CapabilityDescriptor {
    pub fn new(id: &str, display_name: &str, version: &str, kind: CapabilityKind) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            version: version.to_string(),
            kind,
        }
    }
}

struct Registered {
    descriptor: CapabilityDescriptor,
    builtin: bool,
}

pub struct CapabilityRegistry {
    entries: RwLock<BTreeMap<String, Registered>>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl CapabilityRegistry {
    pub fn empty() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registry holding the capabilities shipped with the engine.
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        {
            let mut entries = registry.entries.write();
            for descriptor in builtins() {
                entries.insert(
                    descriptor.id.clone(),
                    Registered {
                        descriptor,
                        builtin: true,
                    },
                );
            }
        }
        registry
    }

    pub fn register(&self, descriptor: CapabilityDescriptor) -> Result<()> {
        validate(&descriptor)?;
        let mut entries = self.entries.write();
        if entries.contains_key(&descriptor.id) {
            return Err(VoltError::InvalidFormat(format!(
                "capability '{}' is already registered",
                descriptor.id
            )));
        }
        info!(id = %descriptor.id, kind = ?descriptor.kind, "capability registered");
        entries.insert(
            descriptor.id.clone(),
            Registered {
                descriptor,
                builtin: false,
            },
        );
        Ok(())
    }

    /// Replace every non-builtin capability with `descriptors`, all or
    /// nothing. Returns how many were registered.
    pub fn reload(&self, descriptors: Vec<CapabilityDescriptor>) -> Result<usize> {
        let mut entries = self.entries.write();
        let mut seen = std::collections::HashSet::new();
        for d in &descriptors {
            validate(d)?;
            let clashes_builtin = entries.get(&d.id).is_some_and(|r| r.builtin);
            if clashes_builtin || !seen.insert(d.id.as_str()) {
                return Err(VoltError::InvalidFormat(format!("duplicate capability '{}'", d.id)));
            }
        }
        entries.retain(|_, r| r.builtin);
        let count = descriptors.len();
        for descriptor in descriptors {
            entries.insert(
                descriptor.id.clone(),
                Registered {
                    descriptor,
                    builtin: false,
                },
            );
        }
        info!(count, "capabilities reloaded");
        Ok(count)
    }

    pub fn get(&self, id: &str) -> Option<CapabilityDescriptor> {
        self.entries.read().get(id).map(|r| r.descriptor.clone())
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn by_kind(&self, kind: CapabilityKind) -> Vec<CapabilityDescriptor> {
        self.entries
            .read()
            .values()
            .filter(|r| r.descriptor.kind == kind)
            .map(|r| r.descriptor.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

fn validate(d: &CapabilityDescriptor) -> Result<()> {
    if d.id.trim().is_empty() {
        return Err(VoltError::InvalidFormat("capability id is empty".to_string()));
    }
    if d.version.trim().is_empty() {
        return Err(VoltError::InvalidFormat(format!("capability '{}' has no version", d.id)));
    }
    Ok(())
}

fn builtins() -> Vec<CapabilityDescriptor> {
    let version = env!("CARGO_PKG_VERSION");
    vec![
        CapabilityDescriptor::new("text-translator", "Text Translator", version, CapabilityKind::Translator),
        CapabilityDescriptor::new("safety-verifier", "Safety Verifier", version, CapabilityKind::Verifier),
        CapabilityDescriptor::new("memory-action", "Memory Action Core", version, CapabilityKind::ActionCore),
        CapabilityDescriptor::new("math-strand", "Math Hard Strand", version, CapabilityKind::HardStrand),
    ]
}
