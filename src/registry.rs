use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::core::Capability;
use crate::credentials::CredentialStore;
use crate::error::GenerationError;
use crate::providers::ProviderAdapter;

/// Static description of a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderDescriptor {
    pub id: String,
    pub capabilities: Vec<Capability>,
    pub synchronous: bool,
    pub credential_requirement: String,
}

impl ProviderDescriptor {
    pub fn new(id: &str, capability: Capability, synchronous: bool, credential: &str) -> Self {
        Self {
            id: id.to_string(),
            capabilities: vec![capability],
            synchronous,
            credential_requirement: credential.to_string(),
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// A provider that passed capability and credential filtering, together with
/// the credential it will use.
#[derive(Clone)]
pub struct Candidate {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub credential: String,
}

impl Candidate {
    pub fn descriptor(&self) -> &ProviderDescriptor {
        self.adapter.descriptor()
    }

    pub fn id(&self) -> &str {
        &self.adapter.descriptor().id
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Eligibility {
    pub id: String,
    pub capabilities: Vec<Capability>,
    pub synchronous: bool,
    pub credential: String,
    pub credential_present: bool,
}

/// Maps capability to ordered eligible providers. Built once from immutable
/// configuration; lookups never touch the network.
pub struct ProviderRegistry {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    priorities: HashMap<Capability, Vec<String>>,
    credentials: Arc<dyn CredentialStore>,
}

impl ProviderRegistry {
    pub fn new(
        adapters: Vec<Arc<dyn ProviderAdapter>>,
        priorities: HashMap<Capability, Vec<String>>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            adapters,
            priorities,
            credentials,
        }
    }

    pub fn adapter(&self, id: &str) -> Option<&Arc<dyn ProviderAdapter>> {
        self.adapters
            .iter()
            .find(|adapter| adapter.descriptor().id == id)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ProviderDescriptor> {
        self.adapters.iter().map(|adapter| adapter.descriptor())
    }

    pub fn credential_for(&self, id: &str) -> Option<String> {
        let adapter = self.adapter(id)?;
        self.credentials
            .get(&adapter.descriptor().credential_requirement)
    }

    /// Default order for a capability: the configured priority list, then any
    /// registered provider the list does not mention, in registration order.
    pub fn default_chain(&self, capability: Capability) -> Vec<&Arc<dyn ProviderAdapter>> {
        let mut chain: Vec<&Arc<dyn ProviderAdapter>> = self
            .priorities
            .get(&capability)
            .map(|ids| ids.iter().filter_map(|id| self.adapter(id)).collect())
            .unwrap_or_default();
        for adapter in &self.adapters {
            if !chain
                .iter()
                .any(|known| known.descriptor().id == adapter.descriptor().id)
            {
                chain.push(adapter);
            }
        }
        chain
            .into_iter()
            .filter(|adapter| adapter.descriptor().supports(capability))
            .collect()
    }

    pub fn resolve_candidates(
        &self,
        capability: Capability,
        preferred: &[String],
    ) -> Result<Vec<Candidate>, GenerationError> {
        let mut lookups: HashMap<String, Option<String>> = HashMap::new();
        let mut credential = |adapter: &Arc<dyn ProviderAdapter>| -> Option<String> {
            let name = &adapter.descriptor().credential_requirement;
            lookups
                .entry(name.clone())
                .or_insert_with(|| self.credentials.get(name))
                .clone()
        };

        let mut candidates = Vec::new();
        for id in preferred {
            let Some(adapter) = self.adapter(id) else {
                debug!(provider = %id, "preferred provider is not registered");
                continue;
            };
            if !adapter.descriptor().supports(capability) {
                continue;
            }
            if candidates.iter().any(|c: &Candidate| c.id() == id.as_str()) {
                continue;
            }
            if let Some(secret) = credential(adapter) {
                candidates.push(Candidate {
                    adapter: adapter.clone(),
                    credential: secret,
                });
            }
        }

        if candidates.is_empty() {
            if !preferred.is_empty() {
                debug!(
                    %capability,
                    "no preferred provider is eligible, using default chain"
                );
            }
            for adapter in self.default_chain(capability) {
                if let Some(secret) = credential(adapter) {
                    candidates.push(Candidate {
                        adapter: adapter.clone(),
                        credential: secret,
                    });
                }
            }
        }

        if candidates.is_empty() {
            let supporting = self
                .adapters
                .iter()
                .filter(|adapter| adapter.descriptor().supports(capability))
                .map(|adapter| adapter.descriptor().credential_requirement.clone())
                .collect::<Vec<_>>();
            let reason = if supporting.is_empty() {
                "no registered provider supports it".to_string()
            } else {
                format!("missing credentials ({})", supporting.join(", "))
            };
            return Err(GenerationError::NoEligibleProvider { capability, reason });
        }

        debug!(
            %capability,
            chain = %candidates.iter().map(|c| c.id()).collect::<Vec<_>>().join(" -> "),
            "resolved candidates"
        );
        Ok(candidates)
    }

    pub fn eligibility(&self, capability: Option<Capability>) -> Vec<Eligibility> {
        self.adapters
            .iter()
            .map(|adapter| adapter.descriptor())
            .filter(|descriptor| capability.map_or(true, |cap| descriptor.supports(cap)))
            .map(|descriptor| Eligibility {
                id: descriptor.id.clone(),
                capabilities: descriptor.capabilities.clone(),
                synchronous: descriptor.synchronous,
                credential: descriptor.credential_requirement.clone(),
                credential_present: self
                    .credentials
                    .get(&descriptor.credential_requirement)
                    .is_some(),
            })
            .collect()
    }
}
