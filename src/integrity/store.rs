//! Storage-root contract lookup.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::Result;
use crate::model::contract::StorageRootContract;

/// Where contracts and root locations come from.
#[async_trait]
pub trait StorageRootStore: Send + Sync {
    /// The single active contract for a root, if one exists.
    async fn active_contract(
        &self,
        provider_key: &str,
        root_key: &str,
    ) -> Result<Option<StorageRootContract>>;

    /// Local mount path of a root.
    async fn root_path(&self, provider_key: &str, root_key: &str) -> Result<Option<PathBuf>>;
}

type RootKey = (String, String);

#[derive(Debug, Default)]
struct Roots {
    contracts: Vec<StorageRootContract>,
    paths: HashMap<RootKey, PathBuf>,
}

/// In-process store. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryRootStore {
    inner: Arc<RwLock<Roots>>,
}

impl MemoryRootStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a contract. Adding an active contract deactivates any other active
    /// contract for the same root.
    pub fn add_contract(&self, contract: StorageRootContract) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if contract.is_active {
            for existing in inner.contracts.iter_mut().filter(|c| {
                c.provider_key == contract.provider_key && c.root_key == contract.root_key
            }) {
                existing.is_active = false;
            }
        }
        inner.contracts.push(contract);
    }

    pub fn set_root_path(&self, provider_key: &str, root_key: &str, path: impl Into<PathBuf>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner
            .paths
            .insert((provider_key.to_string(), root_key.to_string()), path.into());
    }
}

#[async_trait]
impl StorageRootStore for MemoryRootStore {
    async fn active_contract(
        &self,
        provider_key: &str,
        root_key: &str,
    ) -> Result<Option<StorageRootContract>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .contracts
            .iter()
            .find(|c| c.is_active && c.provider_key == provider_key && c.root_key == root_key)
            .cloned())
    }

    async fn root_path(&self, provider_key: &str, root_key: &str) -> Result<Option<PathBuf>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .paths
            .get(&(provider_key.to_string(), root_key.to_string()))
            .cloned())
    }
}
