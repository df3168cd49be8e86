//! Local order references and the buy-now snapshot, both kept in the
//! session store so a reload or a gateway round trip reattaches to the
//! same checkout attempt.

use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::checkout::model::{CartLine, CartSnapshot};
use crate::checkout::session_store::{SessionStore, SessionStoreExt};
use crate::errors::ServiceError;

pub const ORDER_REF_KEY: &str = "checkout.order_ref";
pub const BUY_NOW_ITEM_KEY: &str = "checkout.buy_now.item";
pub const BUY_NOW_ACTIVE_KEY: &str = "checkout.buy_now.active";

const ORDER_REF_PREFIX: &str = "ORD";
const ORDER_REF_SUFFIX_LEN: usize = 6;

/// `ORD` + epoch millis + random uppercase alphanumerics.
pub fn generate_order_ref() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ORDER_REF_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_uppercase())
        .collect();
    format!("{}{}{}", ORDER_REF_PREFIX, Utc::now().timestamp_millis(), suffix)
}

#[derive(Clone)]
pub struct OrderRefManager {
    store: Arc<dyn SessionStore>,
}

impl OrderRefManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Returns the stored reference, generating and persisting one on first entry.
    pub fn ensure(&self) -> String {
        if let Some(existing) = self.current() {
            debug!(order_ref = %existing, "reusing order reference");
            return existing;
        }
        let fresh = generate_order_ref();
        self.store.set(ORDER_REF_KEY, fresh.clone());
        info!(order_ref = %fresh, "generated order reference");
        fresh
    }

    pub fn current(&self) -> Option<String> {
        self.store
            .get(ORDER_REF_KEY)
            .filter(|r| !r.trim().is_empty())
    }

    /// Forget the reference after an acknowledged order or an abandoned checkout.
    pub fn clear(&self) {
        self.store.remove(ORDER_REF_KEY);
    }
}

/// Transient single-item purchase stored outside the cart.
#[derive(Clone)]
pub struct BuyNowStore {
    store: Arc<dyn SessionStore>,
}

impl BuyNowStore {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub fn put(&self, line: &CartLine) -> Result<(), ServiceError> {
        self.store.set_json(BUY_NOW_ITEM_KEY, line)?;
        self.store.set(BUY_NOW_ACTIVE_KEY, "true".to_string());
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.store.get(BUY_NOW_ACTIVE_KEY).as_deref() == Some("true")
    }

    /// The synthetic snapshot, when buy-now mode is active and readable.
    pub fn snapshot(&self) -> Option<CartSnapshot> {
        if !self.is_active() {
            return None;
        }
        match self.store.get_json::<CartLine>(BUY_NOW_ITEM_KEY) {
            Ok(Some(line)) => Some(CartSnapshot::buy_now(line)),
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "discarding unreadable buy-now item");
                self.clear();
                None
            }
        }
    }

    pub fn clear(&self) {
        self.store.remove(BUY_NOW_ITEM_KEY);
        self.store.remove(BUY_NOW_ACTIVE_KEY);
    }
}
