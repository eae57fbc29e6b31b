use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::{BoxAsyncRead, Url, UrlAccess};
use crate::error::{StoreError, StoreResult};

/// `file:` URLs on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileAccess;

fn local_path(url: &Url) -> StoreResult<PathBuf> {
    url.to_file_path()
        .map_err(|()| StoreError::UnsupportedUrl(url.to_string()))
}

#[async_trait]
impl UrlAccess for LocalFileAccess {
    fn schemes(&self) -> &[&'static str] {
        &["file"]
    }

    async fn exists(&self, url: &Url) -> StoreResult<bool> {
        Ok(tokio::fs::try_exists(local_path(url)?).await?)
    }

    async fn open_read(&self, url: &Url) -> StoreResult<BoxAsyncRead> {
        let path = local_path(url)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NoSuchFile(url.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_from(&self, url: &Url, mut content: BoxAsyncRead) -> StoreResult<u64> {
        let path = local_path(url)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&path).await?;
        let written = tokio::io::copy(&mut content, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_write_then_read_local_url() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::from_file_path(dir.path().join("nested/out.bin")).unwrap();
        let access = LocalFileAccess;

        assert!(!access.exists(&url).await.unwrap());
        let written = access
            .write_from(&url, Box::new(&b"hello"[..]))
            .await
            .unwrap();
        assert_eq!(written, 5);
        assert!(access.exists(&url).await.unwrap());

        let mut out = Vec::new();
        access
            .open_read(&url)
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn test_missing_local_file_is_no_such_file() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::from_file_path(dir.path().join("absent")).unwrap();
        assert!(matches!(
            LocalFileAccess.open_read(&url).await,
            Err(StoreError::NoSuchFile(_))
        ));
    }
}
