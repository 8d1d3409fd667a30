use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::matcher::Candidate;

const STORE_FILE: &str = "faces.bin";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRecord {
    pub id: String,
    pub name: String,
    pub descriptor: Vec<f32>,
    /// Unix seconds.
    pub created_at: u64,
    /// PNG bytes; empty when no image was captured.
    #[serde(with = "serde_bytes")]
    pub thumbnail: Vec<u8>,
}

impl Candidate for FaceRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn descriptor(&self) -> &[f32] {
        &self.descriptor
    }
}

/// Known faces, persisted as one postcard file in a directory.
#[derive(Debug, Clone)]
pub struct FaceStore {
    dir: PathBuf,
}

impl FaceStore {
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(STORE_FILE)
    }

    pub fn list(&self) -> Result<Vec<FaceRecord>> {
        let file = self.path();
        if !file.exists() {
            return Ok(vec![]);
        }
        let data = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
        postcard::from_bytes(&data).with_context(|| format!("decoding {}", file.display()))
    }

    pub fn get(&self, id: &str) -> Result<Option<FaceRecord>> {
        Ok(self.list()?.into_iter().find(|r| r.id == id))
    }

    /// Store a new face under a fresh id.
    ///
    /// Every stored descriptor has the same length; a descriptor that
    /// disagrees with the existing records is refused.
    pub fn register(
        &self,
        name: &str,
        descriptor: Vec<f32>,
        thumbnail: Vec<u8>,
    ) -> Result<FaceRecord> {
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("name must not be empty");
        }
        if descriptor.is_empty() {
            anyhow::bail!("descriptor must not be empty");
        }
        if descriptor.iter().any(|x| !x.is_finite()) {
            anyhow::bail!("descriptor contains non-finite values");
        }

        let mut records = self.list()?;
        if let Some(existing) = records.first() {
            if existing.descriptor.len() != descriptor.len() {
                anyhow::bail!(
                    "descriptor has {} dimensions but the store holds {}-dimensional faces",
                    descriptor.len(),
                    existing.descriptor.len()
                );
            }
        }

        let record = FaceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            descriptor,
            created_at: unix_now(),
            thumbnail,
        };
        records.push(record.clone());
        self.write(&records)?;
        log::debug!("stored face {} ({} total)", record.id, records.len());
        Ok(record)
    }

    /// Remove the face with `id`. Returns whether it existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut records = self.list()?;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Ok(false);
        }
        self.write(&records)?;
        Ok(true)
    }

    fn write(&self, records: &[FaceRecord]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let file = self.path();
        let tmp = file.with_extension("bin.tmp");
        let data = postcard::to_allocvec(records)?;
        std::fs::write(&tmp, data).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &file).with_context(|| format!("replacing {}", file.display()))?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_store_lists_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FaceStore::open(dir.path().join("never-created"));
        assert!(store.list()?.is_empty());
        assert!(!store.delete("missing")?);
        Ok(())
    }

    #[test]
    fn register_list_delete() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FaceStore::open(dir.path());

        let a = store.register("Ada", vec![0.1, 0.2], vec![1, 2, 3])?;
        let b = store.register("  Bob ", vec![0.3, 0.4], vec![])?;
        assert_ne!(a.id, b.id);
        assert_eq!(b.name, "Bob");

        let listed = store.list()?;
        assert_eq!(listed, vec![a.clone(), b.clone()]);
        assert_eq!(store.get(&a.id)?, Some(a.clone()));

        assert!(store.delete(&a.id)?);
        assert!(!store.delete(&a.id)?);
        assert_eq!(store.list()?, vec![b]);
        Ok(())
    }

    #[test]
    fn dimensionality_is_enforced() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FaceStore::open(dir.path());
        store.register("Ada", vec![0.0; 4], vec![])?;

        let err = store.register("Bob", vec![0.0; 3], vec![]).unwrap_err();
        assert!(err.to_string().contains("dimensions"));
        assert_eq!(store.list()?.len(), 1);
        Ok(())
    }

    #[test]
    fn bad_records_are_refused() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FaceStore::open(dir.path());
        assert!(store.register("   ", vec![1.0], vec![]).is_err());
        assert!(store.register("Ada", vec![], vec![]).is_err());
        assert!(store.register("Ada", vec![f32::NAN], vec![]).is_err());
        assert!(store.list()?.is_empty());
        Ok(())
    }

    #[test]
    fn stored_records_feed_the_matcher() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FaceStore::open(dir.path());
        let ada = store.register("Ada", vec![0.0, 0.0], vec![])?;
        store.register("Bob", vec![3.0, 4.0], vec![])?;

        let r = crate::matcher::match_face(&[0.0, 0.1], &store.list()?, 0.6)?;
        assert!(r.matched);
        assert_eq!(r.id, Some(ada.id));
        Ok(())
    }
}
