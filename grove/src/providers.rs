//! The providers available to an operation, and their schemas.

use crate::diagnostics::Diagnostic;
use grove_core::{
    addrs::ProviderAddr,
    schema::{ProviderSchema, Schema},
};
use grove_resource::provider::ResourceProvider;
use std::{collections::BTreeMap, sync::Arc};

/// Provider instances by name. Owned by the operation that uses them and
/// passed down explicitly.
#[derive(Clone, Default)]
pub struct Providers {
    providers: BTreeMap<String, Arc<dyn ResourceProvider>>,
}

impl std::fmt::Debug for Providers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.providers.keys()).finish()
    }
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, provider: Arc<dyn ResourceProvider>) {
        self.providers.insert(name.to_string(), provider);
    }

    pub fn with(mut self, name: &str, provider: Arc<dyn ResourceProvider>) -> Self {
        self.insert(name, provider);
        self
    }

    pub fn get(&self, addr: &ProviderAddr) -> Result<Arc<dyn ResourceProvider>, Diagnostic> {
        self.providers
            .get(&addr.name)
            .cloned()
            .ok_or_else(|| Diagnostic::config(format!("{} is not available", addr)))
    }

    pub fn contains(&self, addr: &ProviderAddr) -> bool {
        self.providers.contains_key(&addr.name)
    }

    /// Fetch every provider's schema, checking that each is well formed.
    pub fn schemas(&self) -> Result<Schemas, Diagnostic> {
        let mut by_provider = BTreeMap::new();
        for (name, provider) in &self.providers {
            let schema = provider.schema();
            for (type_name, s) in &schema.resource_schemas {
                s.block.internal_validate().map_err(|e| {
                    Diagnostic::internal(format!("provider.{} has an invalid schema for {}: {}", name, type_name, e))
                })?;
            }
            by_provider.insert(name.clone(), schema);
        }
        Ok(Schemas { by_provider })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Schemas {
    by_provider: BTreeMap<String, ProviderSchema>,
}

impl Schemas {
    pub fn resource(&self, provider: &ProviderAddr, type_name: &str) -> Result<&Schema, Diagnostic> {
        let schema = self
            .by_provider
            .get(&provider.name)
            .ok_or_else(|| Diagnostic::config(format!("{} is not available", provider)))?;
        schema
            .get_resource_schema(type_name)
            .ok_or_else(|| Diagnostic::config(format!("{} does not support resource type {}", provider, type_name)))
    }

    pub fn provider(&self, provider: &ProviderAddr) -> Option<&Schema> {
        self.by_provider.get(&provider.name).and_then(|s| s.provider.as_ref())
    }
}
