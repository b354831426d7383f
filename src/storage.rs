// src/storage.rs
//
// Object references and the listing seam for bucket contents.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Bucket {0} does not exist")]
    BucketNotFound(String),

    #[error("Failed to list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid object path: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

/// `<base>/<bucket>/<key>` with exactly one slash at each join.
pub fn object_url(base: &str, object: &ObjectRef) -> String {
    format!(
        "{}/{}/{}",
        base.trim_end_matches('/'),
        object.bucket.trim_matches('/'),
        object.key.trim_start_matches('/')
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Path {
    pub bucket: String,
    pub key: String,
    pub https: bool,
    pub host: String,
    pub port: u16,
}

impl S3Path {
    pub const DEFAULT_HOST: &'static str = "localhost";
    pub const DEFAULT_PORT: u16 = 4569;

    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            https: false,
            host: Self::DEFAULT_HOST.to_string(),
            port: Self::DEFAULT_PORT,
        }
    }

    /// Reads `Bucket`, `Key`, `Https`, `Host` and `Port`. Bucket and key are required.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self, StorageError> {
        let text = |name: &str| map.get(name).and_then(Value::as_str).filter(|v| !v.is_empty());

        let (Some(bucket), Some(key)) = (text("Bucket"), text("Key")) else {
            return Err(StorageError::InvalidPath(
                "'Bucket' and 'Key' must both have a value".into(),
            ));
        };

        let mut path = S3Path::new(bucket, key);
        if let Some(https) = map.get("Https").and_then(Value::as_bool) {
            path.https = https;
        }
        if let Some(host) = text("Host") {
            path.host = host.to_string();
        }
        if let Some(port) = map.get("Port").and_then(Value::as_u64) {
            path.port = u16::try_from(port)
                .map_err(|_| StorageError::InvalidPath(format!("port {} out of range", port)))?;
        }
        Ok(path)
    }

    pub fn object(&self) -> ObjectRef {
        ObjectRef::new(self.bucket.clone(), self.key.clone())
    }

    pub fn to_url(&self) -> String {
        let proto = if self.https { "https" } else { "http" };
        object_url(&format!("{}://{}:{}", proto, self.host, self.port), &self.object())
    }
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ObjectLister: Send + Sync {
    /// Every object in `bucket`, sorted by key.
    async fn list_objects(&self, bucket: &str) -> Result<Vec<ObjectRef>, StorageError>;
}

/// Lists buckets kept on disk as one directory per bucket.
#[derive(Debug, Clone)]
pub struct DirectoryLister {
    root: PathBuf,
}

impl DirectoryLister {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn walk(dir: &Path, prefix: &str, keys: &mut Vec<String>) -> Result<(), StorageError> {
        let io_err = |source| StorageError::Io {
            path: dir.to_path_buf(),
            source,
        };
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let key = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            // Follows symlinks, so a linked directory is listed like a real one.
            let path = entry.path();
            if path.is_dir() {
                Self::walk(&path, &key, keys)?;
            } else {
                keys.push(key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectLister for DirectoryLister {
    async fn list_objects(&self, bucket: &str) -> Result<Vec<ObjectRef>, StorageError> {
        if bucket.is_empty() || bucket.contains(['/', '\\']) || bucket == ".." {
            return Err(StorageError::InvalidPath(format!("bad bucket name {:?}", bucket)));
        }
        let dir = self.root.join(bucket);
        if !dir.is_dir() {
            return Err(StorageError::BucketNotFound(bucket.to_string()));
        }

        let walk_dir = dir.clone();
        let mut keys = tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            DirectoryLister::walk(&walk_dir, "", &mut keys).map(|_| keys)
        })
        .await
        .map_err(|e| StorageError::Io {
            path: dir.clone(),
            source: std::io::Error::other(e),
        })??;
        keys.sort();

        debug!(bucket, objects = keys.len(), "Listed bucket");
        Ok(keys.into_iter().map(|key| ObjectRef::new(bucket, key)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_url_does_not_double_slashes() {
        let object = ObjectRef::new("bucket", "dir/key1");
        assert_eq!(object_url("http://host/", &object), "http://host/bucket/dir/key1");
        assert_eq!(object_url("http://host", &object), "http://host/bucket/dir/key1");
    }

    #[test]
    fn s3_path_defaults() {
        let path = S3Path::from_map(json!({"Bucket": "images", "Key": "a.png"}).as_object().unwrap())
            .unwrap();
        assert_eq!(path.to_url(), "http://localhost:4569/images/a.png");
    }

    #[test]
    fn s3_path_overrides() {
        let map = json!({"Bucket": "b", "Key": "k", "Https": true, "Host": "s3.example", "Port": 443});
        let path = S3Path::from_map(map.as_object().unwrap()).unwrap();
        assert_eq!(path.to_url(), "https://s3.example:443/b/k");
    }

    #[test]
    fn s3_path_requires_bucket_and_key() {
        let empty_key = json!({"Bucket": "b", "Key": ""});
        assert!(S3Path::from_map(empty_key.as_object().unwrap()).is_err());
        let no_bucket = json!({"Key": "k"});
        assert!(S3Path::from_map(no_bucket.as_object().unwrap()).is_err());
    }

    #[tokio::test]
    async fn directory_lister_walks_nested_keys() {
        let root = tempfile::tempdir().unwrap();
        let bucket = root.path().join("images");
        std::fs::create_dir_all(bucket.join("2024/01")).unwrap();
        std::fs::write(bucket.join("b.png"), b"b").unwrap();
        std::fs::write(bucket.join("a.png"), b"a").unwrap();
        std::fs::write(bucket.join("2024/01/c.png"), b"c").unwrap();

        let objects = DirectoryLister::new(root.path()).list_objects("images").await.unwrap();
        let keys: Vec<_> = objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["2024/01/c.png", "a.png", "b.png"]);
        assert!(objects.iter().all(|o| o.bucket == "images"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn directory_lister_follows_symlinked_directories() {
        let root = tempfile::tempdir().unwrap();
        let shared = tempfile::tempdir().unwrap();
        std::fs::write(shared.path().join("c.png"), b"c").unwrap();
        let bucket = root.path().join("images");
        std::fs::create_dir_all(&bucket).unwrap();
        std::fs::write(bucket.join("a.png"), b"a").unwrap();
        std::os::unix::fs::symlink(shared.path(), bucket.join("linked")).unwrap();

        let objects = DirectoryLister::new(root.path()).list_objects("images").await.unwrap();
        let keys: Vec<_> = objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["a.png", "linked/c.png"]);
    }

    #[tokio::test]
    async fn directory_lister_reports_missing_bucket() {
        let root = tempfile::tempdir().unwrap();
        let err = DirectoryLister::new(root.path()).list_objects("nope").await.unwrap_err();
        assert!(matches!(err, StorageError::BucketNotFound(b) if b == "nope"));
    }
}
