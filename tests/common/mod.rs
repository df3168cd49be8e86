#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use storefront_checkout::checkout::{
    AddressBook, CardPaymentConfirmation, CartLine, CartStore, CheckoutDeps, InMemorySessionStore,
    ManualAddressInput, OrderAck, OrderDraft, OrderService, ShippingAddress, StaticRegionDirectory,
};
use storefront_checkout::config::{CheckoutConfig, GatewayConfig};
use storefront_checkout::errors::ServiceError;
use storefront_checkout::events::{Event, EventSender};
use storefront_checkout::payments::gateway::{canonical_query, hmac_sha512_hex, GatewayParams};
use storefront_checkout::payments::{PaymentStatus, PaymentStatusClient};
use tokio::sync::mpsc;

pub const MERCHANT: &str = "DEMO1234";
pub const SECRET: &str = "TESTSECRETKEY0123456789";

/// Order service fake that deduplicates by order reference, like the real
/// service is required to.
#[derive(Default)]
pub struct FakeOrderService {
    orders: Mutex<HashMap<String, OrderAck>>,
    drafts: Mutex<Vec<OrderDraft>>,
    confirmations: Mutex<Vec<(String, CardPaymentConfirmation)>>,
    failures: Mutex<Vec<(String, String)>>,
    create_calls: AtomicUsize,
    reject_next: Mutex<Option<String>>,
}

impl FakeOrderService {
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn distinct_orders(&self) -> usize {
        self.orders.lock().unwrap().len()
    }

    pub fn drafts(&self) -> Vec<OrderDraft> {
        self.drafts.lock().unwrap().clone()
    }

    pub fn last_draft(&self) -> Option<OrderDraft> {
        self.drafts.lock().unwrap().last().cloned()
    }

    pub fn confirmations(&self) -> Vec<(String, CardPaymentConfirmation)> {
        self.confirmations.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<(String, String)> {
        self.failures.lock().unwrap().clone()
    }

    pub fn reject_next(&self, message: &str) {
        *self.reject_next.lock().unwrap() = Some(message.to_string());
    }
}

#[async_trait]
impl OrderService for FakeOrderService {
    async fn create_order(&self, draft: &OrderDraft) -> Result<OrderAck, ServiceError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.reject_next.lock().unwrap().take() {
            return Err(ServiceError::TransportError(message));
        }
        self.drafts.lock().unwrap().push(draft.clone());

        let mut orders = self.orders.lock().unwrap();
        let next = orders.len() + 1;
        let ack = orders
            .entry(draft.order_ref.clone())
            .or_insert_with(|| OrderAck {
                id: Some(next.to_string()),
                order_number: format!("SO-{:04}", next),
            })
            .clone();
        Ok(ack)
    }

    async fn confirm_card_payment(
        &self,
        order_number: &str,
        confirmation: &CardPaymentConfirmation,
    ) -> Result<(), ServiceError> {
        self.confirmations
            .lock()
            .unwrap()
            .push((order_number.to_string(), confirmation.clone()));
        Ok(())
    }

    async fn report_card_failure(
        &self,
        order_number: &str,
        response_code: &str,
    ) -> Result<(), ServiceError> {
        self.failures
            .lock()
            .unwrap()
            .push((order_number.to_string(), response_code.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeCart {
    lines: Mutex<Vec<CartLine>>,
    clears: AtomicUsize,
}

impl FakeCart {
    pub fn with_lines(lines: Vec<CartLine>) -> Self {
        Self {
            lines: Mutex::new(lines),
            clears: AtomicUsize::new(0),
        }
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl CartStore for FakeCart {
    async fn lines(&self) -> Result<Vec<CartLine>, ServiceError> {
        Ok(self.lines.lock().unwrap().clone())
    }

    async fn clear(&self) -> Result<(), ServiceError> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.lines.lock().unwrap().clear();
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingAddressBook {
    saved: Mutex<Vec<(String, ShippingAddress)>>,
}

impl RecordingAddressBook {
    pub fn saved(&self) -> Vec<(String, ShippingAddress)> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl AddressBook for RecordingAddressBook {
    async fn save(&self, user_id: &str, address: &ShippingAddress) -> Result<(), ServiceError> {
        self.saved
            .lock()
            .unwrap()
            .push((user_id.to_string(), address.clone()));
        Ok(())
    }
}

/// Status endpoint fake: unpaid until `mark_paid`.
#[derive(Default)]
pub struct FakeStatusClient {
    paid: AtomicBool,
    calls: AtomicUsize,
}

impl FakeStatusClient {
    pub fn mark_paid(&self) {
        self.paid.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentStatusClient for FakeStatusClient {
    async fn check(&self, _order_ref: &str) -> Result<PaymentStatus, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(PaymentStatus {
            success: true,
            is_paid: self.paid.load(Ordering::SeqCst),
        })
    }
}

pub fn line(product_id: &str, unit_price: u64, quantity: u32) -> CartLine {
    CartLine {
        product_id: product_id.to_string(),
        name: format!("Product {}", product_id),
        unit_price,
        quantity,
        image_ref: None,
    }
}

pub fn regions() -> StaticRegionDirectory {
    StaticRegionDirectory::new()
        .with_province("79", "TP Ho Chi Minh")
        .with_district("79", "760", "Quan 1")
        .with_ward("760", "26734", "Phuong Ben Nghe")
}

pub fn manual_address() -> ManualAddressInput {
    ManualAddressInput {
        full_name: "Nguyen Van A".into(),
        phone: "0901234567".into(),
        email: "a@example.com".into(),
        line: "12 Le Loi".into(),
        province_id: Some("79".into()),
        district_id: Some("760".into()),
        ward_id: Some("26734".into()),
        note: None,
    }
}

pub fn test_config() -> CheckoutConfig {
    CheckoutConfig {
        gateway: GatewayConfig {
            return_url: "https://shop.example.com/checkout/payment-return".into(),
            ..GatewayConfig::new(MERCHANT, SECRET)
        },
        ..Default::default()
    }
}

/// Signs `fields` the way the gateway signs its return query.
pub fn signed_return(fields: &[(&str, &str)]) -> GatewayParams {
    let mut params: GatewayParams = fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let signature = hmac_sha512_hex(SECRET, &canonical_query(&params));
    params.insert("vnp_SecureHashType".into(), "HmacSHA512".into());
    params.insert("vnp_SecureHash".into(), signature);
    params
}

/// Everything a checkout talks to, with handles kept for assertions.
pub struct Harness {
    pub store: InMemorySessionStore,
    pub cart: Arc<FakeCart>,
    pub orders: Arc<FakeOrderService>,
    pub address_book: Arc<RecordingAddressBook>,
    pub status: Arc<FakeStatusClient>,
    pub events: mpsc::Receiver<Event>,
    sender: EventSender,
}

impl Harness {
    pub fn with_cart(lines: Vec<CartLine>) -> Self {
        Self::with_event_capacity(lines, 64)
    }

    pub fn with_event_capacity(lines: Vec<CartLine>, capacity: usize) -> Self {
        let (sender, events) = EventSender::channel(capacity);
        Self {
            store: InMemorySessionStore::new(),
            cart: Arc::new(FakeCart::with_lines(lines)),
            orders: Arc::new(FakeOrderService::default()),
            address_book: Arc::new(RecordingAddressBook::default()),
            status: Arc::new(FakeStatusClient::default()),
            events,
            sender,
        }
    }

    pub fn deps(&self) -> CheckoutDeps {
        CheckoutDeps {
            session_store: Arc::new(self.store.clone()),
            cart: self.cart.clone(),
            address_book: self.address_book.clone(),
            regions: Arc::new(regions()),
            orders: self.orders.clone(),
            status_client: self.status.clone(),
            heuristic: None,
            events: Some(self.sender.clone()),
        }
    }

    /// Events delivered so far.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Lets spawned follow-up work (event delivery, address save) run.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
