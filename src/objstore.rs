//! Whole-object downloads from S3.
//!
//! We only ever need one call shape: copy an object to a named local file.
//! There's no retry or multipart logic here; if the download fails, start-up
//! fails, and Lambda will try again with a fresh instance.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::{fs::File, io::AsyncWriteExt};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Download `bucket`/`key` into the file at `dest`, creating or
    /// truncating it.
    async fn fetch_to_path(&self, bucket: &str, key: &str, dest: &Path) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct S3Store {
    client: aws_sdk_s3::Client,
}

impl S3Store {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        S3Store {
            client: aws_sdk_s3::Client::new(config),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn fetch_to_path(&self, bucket: &str, key: &str, dest: &Path) -> Result<()> {
        let mut result = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await?;

        let mut file = File::create(dest)
            .await
            .with_context(|| format!("failed to create `{}`", dest.display()))?;

        let mut n_bytes = 0;

        while let Some(bytes) = result.body.try_next().await? {
            file.write_all(&bytes).await?;
            n_bytes += bytes.len();
        }

        // The caller renames this file into place; make sure the data are
        // really there first.
        file.sync_all().await?;

        if let Some(cl) = result.content_length {
            if cl >= 0 && cl as usize != n_bytes {
                anyhow::bail!("expected {cl} bytes from S3 but got {n_bytes}");
            }
        }

        Ok(())
    }
}
