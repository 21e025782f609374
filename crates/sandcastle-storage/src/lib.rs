// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! Blob storage backends for Sandcastle's `BlobStorage` contract:
//! local filesystem always available, S3-compatible object storage behind
//! the `s3` feature.

pub mod local;
#[cfg(feature = "s3")]
pub mod s3;

pub use local::LocalStorage;
#[cfg(feature = "s3")]
pub use s3::S3Storage;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
