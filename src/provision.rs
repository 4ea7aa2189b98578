//! Getting the SQLite database files onto local disk.
//!
//! The files are either embedded in the deployment package, in which case
//! they're sitting in the task root, or they're objects in the S3 bucket
//! named after the file. Lambda deployment packages have a size limit, so
//! big databases go the S3 route and get copied into `/tmp` on cold start.
//!
//! A warm container keeps its `/tmp` around, so we check for an existing
//! copy of each file before downloading it. Downloads go to a `.tmp` file
//! that is renamed into place, so a half-written file is never picked up.

use lambda_runtime::tracing;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::{config::DbFileSpec, error::ProvisionError, objstore::ObjectStore};

/// A database file that is ready to be opened.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LocalAsset(PathBuf);

impl LocalAsset {
    pub fn into_path(self) -> PathBuf {
        self.0
    }
}

pub struct Provisioner<'a, S: ?Sized> {
    store: &'a S,
    bucket: Option<&'a str>,
    bundle_root: &'a Path,
    scratch_root: &'a Path,
}

impl<'a, S: ObjectStore + ?Sized> Provisioner<'a, S> {
    pub fn new(
        store: &'a S,
        bucket: Option<&'a str>,
        bundle_root: &'a Path,
        scratch_root: &'a Path,
    ) -> Self {
        Provisioner {
            store,
            bucket,
            bundle_root,
            scratch_root,
        }
    }

    /// Resolve every database file to a local path, in the same order as
    /// `db_files`.
    ///
    /// Files are fetched one at a time. Any failure aborts the whole thing:
    /// we'd rather not start than serve half the data.
    pub async fn resolve(
        &self,
        db_files: &DbFileSpec,
    ) -> Result<Vec<LocalAsset>, ProvisionError> {
        let mut bundled = Vec::new();

        for id in db_files.iter() {
            let abs_path = self.bundle_root.join(id);

            if exists(&abs_path).await? {
                bundled.push(abs_path);
            }
        }

        if !bundled.is_empty() {
            if bundled.len() != db_files.len() {
                return Err(ProvisionError::PartialBundle {
                    expected: db_files.to_vec(),
                    found: bundled,
                });
            }

            for p in &bundled {
                tracing::info!("using bundled database {}", p.display());
            }

            return Ok(bundled.into_iter().map(LocalAsset).collect());
        }

        let mut assets = Vec::with_capacity(db_files.len());

        for key in db_files.iter() {
            assets.push(self.ensure_scratch_copy(key).await?);
        }

        Ok(assets)
    }

    async fn ensure_scratch_copy(&self, key: &str) -> Result<LocalAsset, ProvisionError> {
        let db_file = self.scratch_root.join(key);

        if exists(&db_file).await? {
            tracing::info!("reusing cached database {}", db_file.display());
            return Ok(LocalAsset(db_file));
        }

        let bucket = self
            .bucket
            .ok_or_else(|| ProvisionError::NoBucket(key.to_owned()))?;

        let mut staging = db_file.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        tracing::info!("fetching s3://{bucket}/{key} to {}", db_file.display());

        self.store
            .fetch_to_path(bucket, key, &staging)
            .await
            .map_err(|e| ProvisionError::Fetch {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
                source: e.into(),
            })?;

        // If another instance sharing this directory beat us to it, this
        // just replaces its copy with an identical one.
        fs::rename(&staging, &db_file)
            .await
            .map_err(|e| ProvisionError::Io {
                path: db_file.clone(),
                source: e,
            })?;

        Ok(LocalAsset(db_file))
    }
}

async fn exists(path: &Path) -> Result<bool, ProvisionError> {
    fs::try_exists(path).await.map_err(|e| ProvisionError::Io {
        path: path.to_owned(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::{fs, sync::Mutex};

    /// A fake bucket: writes the key name as the file contents and records
    /// each call, including whether the staging file name was used.
    #[derive(Default)]
    struct FakeStore {
        calls: Mutex<Vec<(String, String, PathBuf)>>,
        missing: Vec<&'static str>,
    }

    impl FakeStore {
        fn calls(&self) -> Vec<(String, String, PathBuf)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ObjectStore for FakeStore {
        async fn fetch_to_path(&self, bucket: &str, key: &str, dest: &Path) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((bucket.to_owned(), key.to_owned(), dest.to_owned()));

            if self.missing.iter().any(|m| *m == key) {
                return Err(anyhow!("NoSuchKey"));
            }

            fs::write(dest, key)?;
            Ok(())
        }
    }

    struct Dirs {
        bundle: tempfile::TempDir,
        scratch: tempfile::TempDir,
    }

    impl Dirs {
        fn new() -> Self {
            Dirs {
                bundle: tempfile::tempdir().unwrap(),
                scratch: tempfile::tempdir().unwrap(),
            }
        }

        fn provisioner<'a>(&'a self, store: &'a FakeStore) -> Provisioner<'a, FakeStore> {
            Provisioner::new(
                store,
                Some("bucket"),
                self.bundle.path(),
                self.scratch.path(),
            )
        }
    }

    fn ids(s: &str) -> DbFileSpec {
        DbFileSpec::parse(s).unwrap()
    }

    #[tokio::test]
    async fn fully_bundled_never_fetches() {
        let dirs = Dirs::new();
        fs::write(dirs.bundle.path().join("b.db"), "").unwrap();
        fs::write(dirs.bundle.path().join("a.db"), "").unwrap();
        let store = FakeStore::default();

        let assets = dirs
            .provisioner(&store)
            .resolve(&ids("b.db@a.db"))
            .await
            .unwrap();

        assert_eq!(
            assets,
            [
                LocalAsset(dirs.bundle.path().join("b.db")),
                LocalAsset(dirs.bundle.path().join("a.db")),
            ]
        );
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn partial_bundle_fails_before_fetching() {
        let dirs = Dirs::new();
        fs::write(dirs.bundle.path().join("a.db"), "").unwrap();
        let store = FakeStore::default();

        let e = dirs
            .provisioner(&store)
            .resolve(&ids("a.db@b.db"))
            .await
            .unwrap_err();

        match e {
            ProvisionError::PartialBundle { expected, found } => {
                assert_eq!(expected, ["a.db", "b.db"]);
                assert_eq!(found, [dirs.bundle.path().join("a.db")]);
            }
            other => panic!("unexpected error {other}"),
        }

        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn fetch_stages_then_renames() {
        let dirs = Dirs::new();
        let store = FakeStore::default();
        let final_path = dirs.scratch.path().join("a.db");
        let staging = dirs.scratch.path().join("a.db.tmp");

        let assets = dirs
            .provisioner(&store)
            .resolve(&ids("a.db"))
            .await
            .unwrap();

        assert_eq!(assets, [LocalAsset(final_path.clone())]);
        assert_eq!(
            store.calls(),
            [("bucket".to_owned(), "a.db".to_owned(), staging.clone())]
        );
        assert!(final_path.exists());
        assert!(!staging.exists());
        assert_eq!(fs::read_to_string(&final_path).unwrap(), "a.db");
    }

    #[tokio::test]
    async fn stale_staging_file_is_overwritten() {
        let dirs = Dirs::new();
        let store = FakeStore::default();
        let final_path = dirs.scratch.path().join("a.db");
        let staging = dirs.scratch.path().join("a.db.tmp");
        fs::write(&staging, "junk left by an earlier crash, longer than the real data")
            .unwrap();

        let assets = dirs
            .provisioner(&store)
            .resolve(&ids("a.db"))
            .await
            .unwrap();

        assert_eq!(assets, [LocalAsset(final_path.clone())]);
        assert_eq!(store.calls().len(), 1);
        assert_eq!(fs::read_to_string(&final_path).unwrap(), "a.db");
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn warm_start_reuses_scratch_copy() {
        let dirs = Dirs::new();
        let store = FakeStore::default();
        fs::write(dirs.scratch.path().join("a.db"), "cached").unwrap();

        let p = dirs.provisioner(&store);
        let first = p.resolve(&ids("a.db@b.db")).await.unwrap();
        assert_eq!(store.calls().len(), 1);
        assert_eq!(store.calls()[0].1, "b.db");

        let second = p.resolve(&ids("a.db@b.db")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.calls().len(), 1);
        assert_eq!(
            fs::read_to_string(dirs.scratch.path().join("a.db")).unwrap(),
            "cached"
        );
    }

    #[tokio::test]
    async fn fetch_failure_aborts() {
        let dirs = Dirs::new();
        let store = FakeStore {
            missing: vec!["b.db"],
            ..Default::default()
        };

        let e = dirs
            .provisioner(&store)
            .resolve(&ids("a.db@b.db@c.db"))
            .await
            .unwrap_err();

        assert!(matches!(e, ProvisionError::Fetch { ref key, .. } if key == "b.db"));
        // No attempt on anything after the failure.
        assert_eq!(store.calls().len(), 2);
        assert!(!dirs.scratch.path().join("b.db").exists());
    }

    #[tokio::test]
    async fn fetch_needs_a_bucket() {
        let dirs = Dirs::new();
        let store = FakeStore::default();
        let p = Provisioner::new(&store, None, dirs.bundle.path(), dirs.scratch.path());

        let e = p.resolve(&ids("a.db")).await.unwrap_err();
        assert!(matches!(e, ProvisionError::NoBucket(_)));
        assert!(store.calls().is_empty());
    }
}
