// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! S3-compatible object storage (also serves MinIO), grounded on
//! `S3Storage`, implemented with `aws-sdk-s3` behind the `s3` feature.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use sandcastle_core::blob_store::BlobStorage;

pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    pub async fn new(bucket: impl Into<String>, endpoint_url: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint) = endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        let client = Client::new(&config);
        Self { client, bucket: bucket.into() }
    }
}

#[async_trait]
impl BlobStorage for S3Storage {
    async fn read(&self, key: &str) -> anyhow::Result<Option<String>> {
        match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(output) => {
                let bytes = output.body.collect().await?.into_bytes();
                Ok(Some(String::from_utf8(bytes.to_vec())?))
            }
            Err(err) => {
                if err.as_service_error().map(|e| e.is_no_such_key()).unwrap_or(false) {
                    Ok(None)
                } else {
                    tracing::error!(error = %err, key, "s3 read failed");
                    Ok(None)
                }
            }
        }
    }

    async fn write(&self, key: &str, content: &str) -> anyhow::Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(content.as_bytes().to_vec()))
            .content_type("application/json")
            .send()
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut results = Vec::new();
        let mut paginator = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix).into_paginator().send();
        while let Some(page) = paginator.next().await {
            let page = page?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    results.push(key.to_string());
                }
            }
        }
        Ok(results)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.client.delete_object().bucket(&self.bucket).key(key).send().await?;
        Ok(())
    }
}
