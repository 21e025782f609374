// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! Blob storage contract used for `{storage.<path>}` template refs and
//! `on_complete.storage_path` output dumps. Concrete backends (local
//! filesystem, S3-compatible object store) live in `sandcastle-storage`.

use async_trait::async_trait;

#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Returns `None` for a missing key; errors are reserved for actual
    /// I/O failure, not absence.
    async fn read(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn write(&self, key: &str, content: &str) -> anyhow::Result<()>;
    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}
