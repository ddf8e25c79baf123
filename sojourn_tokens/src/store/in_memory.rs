//! An in-memory session store

use async_trait::async_trait;

use super::{SessionStore, StoreError};
use crate::IssuedTokenPair;

/// An in-memory session store
#[derive(Default, Debug)]
pub struct InMemorySessionStore {
    tokens: Option<IssuedTokenPair>,
}

impl InMemorySessionStore {
    /// Constructs a new, empty in-memory session store
    pub const fn new() -> Self {
        Self { tokens: None }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&mut self) -> Result<Option<IssuedTokenPair>, StoreError> {
        Ok(self.tokens.clone())
    }

    async fn persist(&mut self, tokens: &IssuedTokenPair) -> Result<(), StoreError> {
        self.tokens = Some(tokens.clone());
        Ok(())
    }

    async fn clear(&mut self) -> Result<(), StoreError> {
        self.tokens = None;
        Ok(())
    }
}
