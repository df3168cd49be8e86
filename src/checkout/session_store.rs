use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

use crate::errors::ServiceError;

/// Key/value storage scoped to one shopper session. Survives reloads,
/// not the end of the session.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str);
}

/// JSON helpers on top of any [`SessionStore`].
pub trait SessionStoreExt: SessionStore {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ServiceError> {
        self.get(key)
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(ServiceError::from)
    }

    fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ServiceError> {
        self.set(key, serde_json::to_string(value)?);
        Ok(())
    }
}

impl<S: SessionStore + ?Sized> SessionStoreExt for S {}

#[derive(Clone, Default)]
pub struct InMemorySessionStore(Arc<DashMap<String, String>>);

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl SessionStore for InMemorySessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).map(|v| v.value().clone())
    }

    fn set(&self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.0.remove(key);
    }
}
