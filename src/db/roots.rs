//! Storage roots and their integrity contracts.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::Result;
use crate::integrity::store::StorageRootStore;
use crate::model::contract::StorageRootContract;

#[async_trait]
impl StorageRootStore for super::Db {
    async fn active_contract(
        &self,
        provider_key: &str,
        root_key: &str,
    ) -> Result<Option<StorageRootContract>> {
        let row: Option<ContractRow> = sqlx::query_as(
            "SELECT provider_key, root_key, contract_key, required_folders, optional_folders,
                    allowed_extras, allowed_root_files, quarantine_relpath, max_items, max_bytes,
                    is_active
             FROM storage_root_contracts
             WHERE provider_key = $1 AND root_key = $2 AND is_active",
        )
        .bind(provider_key)
        .bind(root_key)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(ContractRow::into_contract))
    }

    async fn root_path(&self, provider_key: &str, root_key: &str) -> Result<Option<PathBuf>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT root_path FROM storage_roots WHERE provider_key = $1 AND root_key = $2",
        )
        .bind(provider_key)
        .bind(root_key)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(path,)| PathBuf::from(path)))
    }
}

impl super::Db {
    /// Register or move a storage root.
    pub async fn upsert_root_path(
        &self,
        provider_key: &str,
        root_key: &str,
        root_path: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO storage_roots (provider_key, root_key, root_path)
             VALUES ($1, $2, $3)
             ON CONFLICT (provider_key, root_key) DO UPDATE SET root_path = EXCLUDED.root_path",
        )
        .bind(provider_key)
        .bind(root_key)
        .bind(root_path)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Store a contract as the active one for its root, deactivating any
    /// previous active contract in the same transaction.
    pub async fn activate_contract(&self, contract: &StorageRootContract) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "UPDATE storage_root_contracts SET is_active = false
             WHERE provider_key = $1 AND root_key = $2 AND is_active",
        )
        .bind(&contract.provider_key)
        .bind(&contract.root_key)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO storage_root_contracts (provider_key, root_key, contract_key,
                 required_folders, optional_folders, allowed_extras, allowed_root_files,
                 quarantine_relpath, max_items, max_bytes, is_active)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, true)",
        )
        .bind(&contract.provider_key)
        .bind(&contract.root_key)
        .bind(&contract.contract_key)
        .bind(&contract.required_folders)
        .bind(&contract.optional_folders)
        .bind(&contract.allowed_extras)
        .bind(&contract.allowed_root_files)
        .bind(&contract.quarantine_relpath)
        .bind(contract.max_items.map(|n| n as i64))
        .bind(contract.max_bytes.map(|n| n as i64))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ContractRow {
    provider_key: String,
    root_key: String,
    contract_key: String,
    required_folders: Vec<String>,
    optional_folders: Vec<String>,
    allowed_extras: Vec<String>,
    allowed_root_files: Vec<String>,
    quarantine_relpath: Option<String>,
    max_items: Option<i64>,
    max_bytes: Option<i64>,
    is_active: bool,
}

impl ContractRow {
    fn into_contract(self) -> StorageRootContract {
        StorageRootContract {
            provider_key: self.provider_key,
            root_key: self.root_key,
            contract_key: self.contract_key,
            required_folders: self.required_folders,
            optional_folders: self.optional_folders,
            allowed_extras: self.allowed_extras,
            allowed_root_files: self.allowed_root_files,
            quarantine_relpath: self.quarantine_relpath,
            max_items: self.max_items.map(|n| n.max(0) as u64),
            max_bytes: self.max_bytes.map(|n| n.max(0) as u64),
            is_active: self.is_active,
        }
    }
}
