//! Local directory backend: `<root>/<bucket>/<key>` stands in for an object.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::RangeBackend;
use crate::error::{ObjfsError, Result};

pub struct LocalFsBackend {
    root: PathBuf,
}

impl LocalFsBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Bucket and key must both stay below the root: plain components only.
    fn path_for(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for part in [bucket, key.trim_start_matches('/')] {
            let rel = Path::new(part);
            let plain = rel.components().all(|c| matches!(c, Component::Normal(_)));
            if part.is_empty() || !plain {
                return Err(ObjfsError::backend(bucket, key, "key escapes the object root"));
            }
            path.push(rel);
        }
        Ok(path)
    }
}

#[async_trait]
impl RangeBackend for LocalFsBackend {
    async fn get_range(&self, bucket: &str, key: &str, start: u64, end: u64) -> Result<Bytes> {
        let path = self.path_for(bucket, key)?;
        let mut file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ObjfsError::backend(bucket, key, "NoSuchKey"));
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        if start >= size {
            return Ok(Bytes::new());
        }
        let want = (end.min(size - 1) - start + 1) as usize;
        file.seek(SeekFrom::Start(start)).await?;
        let mut buf = BytesMut::zeroed(want);
        file.read_exact(&mut buf).await?;
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_localfs_ranges() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("bkt/dir")).unwrap();
        std::fs::write(tmp.path().join("bkt/dir/obj"), b"0123456789").unwrap();
        let backend = LocalFsBackend::new(tmp.path());

        assert_eq!(&backend.get_range("bkt", "dir/obj", 2, 5).await.unwrap()[..], b"2345");
        // Past the end the body is cut short, like S3 does.
        assert_eq!(&backend.get_range("bkt", "dir/obj", 8, 100).await.unwrap()[..], b"89");
        assert!(backend.get_range("bkt", "dir/obj", 10, 20).await.unwrap().is_empty());

        let err = backend.get_range("bkt", "missing", 0, 1).await.unwrap_err();
        assert_eq!(err.errno(), libc::EIO);
    }

    #[tokio::test]
    async fn test_keys_cannot_leave_the_root() {
        let outer = tempfile::tempdir().unwrap();
        std::fs::write(outer.path().join("secret"), b"top secret").unwrap();
        let root = outer.path().join("objects");
        std::fs::create_dir_all(root.join("bkt/dir")).unwrap();
        std::fs::write(root.join("bkt/dir/obj"), b"fine").unwrap();
        let backend = LocalFsBackend::new(&root);

        for (bucket, key) in [
            ("bkt", "../../secret"),
            ("bkt", "dir/../../../secret"),
            ("..", "secret"),
            ("bkt", "./dir/obj"),
            ("", "secret"),
            ("bkt", ""),
        ] {
            let err = backend.get_range(bucket, key, 0, 3).await.unwrap_err();
            assert!(
                matches!(err, ObjfsError::Backend { .. }),
                "{bucket}/{key}: {err}"
            );
        }
        // A leading slash is stripped, not treated as absolute.
        assert_eq!(&backend.get_range("bkt", "/dir/obj", 0, 3).await.unwrap()[..], b"fine");
    }
}
