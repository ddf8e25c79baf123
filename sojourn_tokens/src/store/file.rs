//! A session store backed by a local file

use std::{io, path::PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};

use super::{SessionStore, StoreError};
use crate::IssuedTokenPair;

/// A session store that keeps the token pair as JSON in a local file
///
/// On unix, the file is created readable by its owner only.
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    /// Constructs a new file session store
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn read_tokens(&self) -> Result<Option<IssuedTokenPair>, io::Error> {
        use tokio::io::AsyncReadExt;

        let mut file = match OpenOptions::new().read(true).open(&self.path).await {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error),
        };
        let mut data = String::new();
        file.read_to_string(&mut data).await?;
        let tokens = serde_json::from_str(&data)?;
        Ok(Some(tokens))
    }

    async fn write_tokens(&self, tokens: &IssuedTokenPair) -> Result<(), io::Error> {
        use tokio::io::AsyncWriteExt;

        let mut file_opts = OpenOptions::new();

        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(&self.path).await?;
        let data = serde_json::to_string_pretty(tokens)?;
        file.write_all(data.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&mut self) -> Result<Option<IssuedTokenPair>, StoreError> {
        Ok(self.read_tokens().await?)
    }

    async fn persist(&mut self, tokens: &IssuedTokenPair) -> Result<(), StoreError> {
        Ok(self.write_tokens(tokens).await?)
    }

    async fn clear(&mut self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}
