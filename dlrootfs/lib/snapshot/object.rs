use std::{
    fmt::{self, Display},
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::{utils, DlrootfsResult, RepositoryError};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Number of hex characters of a hash used as the fan-out directory name.
const FANOUT_PREFIX_LEN: usize = 2;

/// Length of a hex encoded sha256.
const HASH_HEX_LEN: usize = 64;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The hex encoded sha256 of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectHash(String);

/// A content-addressed object store laid out as `<dir>/<first 2 hex>/<remaining hex>`.
///
/// Objects are immutable once written. File contents are stored verbatim; trees and commits
/// are stored as json.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    dir: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ObjectHash {
    /// Wraps a digest produced by [`utils::get_file_hash`] or [`utils::get_bytes_hash`].
    pub(crate) fn from_digest(digest: String) -> Self {
        Self(digest)
    }

    /// Returns the hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short prefix, for log messages.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl ObjectStore {
    /// Creates a store rooted at `dir`. The directory is created lazily.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Where the object with `hash` lives, whether or not it exists yet.
    pub fn object_path(&self, hash: &ObjectHash) -> PathBuf {
        let (fanout, rest) = hash.as_str().split_at(FANOUT_PREFIX_LEN);
        self.dir.join(fanout).join(rest)
    }

    /// Whether the object with `hash` is stored.
    pub fn contains(&self, hash: &ObjectHash) -> bool {
        self.object_path(hash).is_file()
    }

    /// Stores the content of the file at `source` under the already computed `hash`.
    ///
    /// Blocking.
    pub fn write_file(&self, source: &Path, hash: &ObjectHash) -> io::Result<()> {
        if self.contains(hash) {
            return Ok(());
        }

        let mut input = File::open(source)?;
        let mut staged = self.staging_file(hash)?;
        io::copy(&mut input, staged.as_file_mut())?;
        self.persist(staged, hash)
    }

    /// Stores `bytes` and returns their hash.
    ///
    /// Blocking.
    pub fn write_bytes(&self, bytes: &[u8]) -> io::Result<ObjectHash> {
        let hash = ObjectHash(utils::get_bytes_hash(bytes));
        if self.contains(&hash) {
            return Ok(hash);
        }

        let mut staged = self.staging_file(&hash)?;
        staged.write_all(bytes)?;
        self.persist(staged, &hash)?;

        Ok(hash)
    }

    /// Serializes `value` as json, stores it and returns its hash.
    ///
    /// Blocking.
    pub fn write_json<T: Serialize>(&self, value: &T) -> DlrootfsResult<ObjectHash> {
        let bytes = serde_json::to_vec(value)?;
        self.write_bytes(&bytes)
            .map_err(|e| RepositoryError::io("failed to store object", e).into())
    }

    /// Reads back a json object written with [`ObjectStore::write_json`].
    ///
    /// Blocking.
    pub fn read_json<T: DeserializeOwned>(&self, hash: &ObjectHash) -> DlrootfsResult<T> {
        let bytes = fs::read(self.object_path(hash)).map_err(|e| RepositoryError::CorruptObject {
            hash: hash.to_string(),
            reason: e.to_string(),
        })?;

        serde_json::from_slice(&bytes).map_err(|e| {
            RepositoryError::CorruptObject {
                hash: hash.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn staging_file(&self, hash: &ObjectHash) -> io::Result<NamedTempFile> {
        let fanout_dir = self.dir.join(&hash.as_str()[..FANOUT_PREFIX_LEN]);
        fs::create_dir_all(&fanout_dir)?;
        NamedTempFile::new_in(&fanout_dir)
    }

    fn persist(&self, staged: NamedTempFile, hash: &ObjectHash) -> io::Result<()> {
        staged
            .persist(self.object_path(hash))
            .map(|_| ())
            .map_err(|e| e.error)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl TryFrom<String> for ObjectHash {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let valid = value.len() == HASH_HEX_LEN
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));

        if valid {
            Result::Ok(Self(value))
        } else {
            Err(format!("not a sha256 hex digest: {value:?}"))
        }
    }
}

impl From<ObjectHash> for String {
    fn from(hash: ObjectHash) -> Self {
        hash.0
    }
}

impl Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
    }

    #[test]
    fn test_object_store_write_is_content_addressed() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let store = ObjectStore::new(temp.path());

        let first = store.write_bytes(b"hello")?;
        let second = store.write_bytes(b"hello")?;
        assert_eq!(first, second);
        assert_eq!(
            first.as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        let path = store.object_path(&first);
        assert_eq!(path, temp.path().join("2c").join(&first.as_str()[2..]));
        assert_eq!(fs::read(path)?, b"hello");

        Ok(())
    }

    #[test]
    fn test_object_store_json_roundtrip() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let store = ObjectStore::new(temp.path());

        let record = Record {
            name: "layer_0".to_string(),
        };
        let hash = store.write_json(&record)?;
        let read: Record = store.read_json(&hash)?;
        assert_eq!(read, record);

        Ok(())
    }

    #[test]
    fn test_object_store_missing_object_is_corrupt() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let store = ObjectStore::new(temp.path());
        let hash = ObjectHash::try_from("a".repeat(64)).map_err(anyhow::Error::msg)?;

        let result: DlrootfsResult<Record> = store.read_json(&hash);
        assert!(matches!(
            result,
            Err(crate::DlrootfsError::Repository(
                RepositoryError::CorruptObject { .. }
            ))
        ));

        Ok(())
    }

    #[test]
    fn test_object_hash_rejects_non_hex() {
        assert!(ObjectHash::try_from("xyz".to_string()).is_err());
        assert!(ObjectHash::try_from("A".repeat(64)).is_err());
        assert!(ObjectHash::try_from("0".repeat(64)).is_ok());
    }
}
