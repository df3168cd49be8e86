use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::checkout::address::ShippingAddress;
use crate::checkout::model::{CartLine, CustomerContext, OrderDraft, OrderReceipt, PurchaseMode};
use crate::checkout::order_ref::BuyNowStore;
use crate::config::OrderServiceConfig;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// The order service's reply to a created order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub id: Option<String>,
    pub order_number: String,
}

/// Gateway details recorded when a card order is paid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardPaymentConfirmation {
    pub order_ref: String,
    pub amount: u64,
    pub response_code: String,
    pub transaction_no: Option<String>,
    pub bank_code: Option<String>,
    pub pay_date: Option<String>,
}

/// Durable order storage. Creating an order twice with the same
/// `order_ref` must return the original order rather than a duplicate.
#[async_trait]
pub trait OrderService: Send + Sync {
    async fn create_order(&self, draft: &OrderDraft) -> Result<OrderAck, ServiceError>;

    async fn confirm_card_payment(
        &self,
        order_number: &str,
        confirmation: &CardPaymentConfirmation,
    ) -> Result<(), ServiceError>;

    async fn report_card_failure(
        &self,
        order_number: &str,
        response_code: &str,
    ) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait CartStore: Send + Sync {
    async fn lines(&self) -> Result<Vec<CartLine>, ServiceError>;
    async fn clear(&self) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait AddressBook: Send + Sync {
    async fn save(&self, user_id: &str, address: &ShippingAddress) -> Result<(), ServiceError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrderReply {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    order_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorReply {
    message: Option<String>,
}

#[derive(Clone)]
pub struct HttpOrderService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpOrderService {
    pub fn new(config: &OrderServiceConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Turns a non-2xx reply into a transport error carrying the service's message.
    async fn reject(response: reqwest::Response) -> ServiceError {
        let status = response.status();
        let message = response
            .json::<ErrorReply>()
            .await
            .ok()
            .and_then(|body| body.message)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| format!("order service returned {}", status));
        ServiceError::TransportError(message)
    }

    async fn post_payment_update<T: Serialize + ?Sized>(
        &self,
        order_number: &str,
        path: &str,
        body: &T,
    ) -> Result<(), ServiceError> {
        let response = self
            .client
            .post(format!("{}/orders/{}/{}", self.base_url, order_number, path))
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::reject(response).await);
        }
        Ok(())
    }
}

#[async_trait]
impl OrderService for HttpOrderService {
    #[instrument(skip(self, draft), fields(order_ref = %draft.order_ref))]
    async fn create_order(&self, draft: &OrderDraft) -> Result<OrderAck, ServiceError> {
        let response = self
            .client
            .post(format!("{}/orders", self.base_url))
            .json(draft)
            .send()
            .await?;

        if !response.status().is_success() {
            let err = Self::reject(response).await;
            warn!(error = %err, "order service rejected the order");
            return Err(err);
        }

        let reply: CreateOrderReply = response.json().await?;
        let order_number = reply
            .order_number
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| {
                ServiceError::OrderCreation("order service reply has no order number".to_string())
            })?;
        let id = reply.id.map(|v| match v {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });
        Ok(OrderAck { id, order_number })
    }

    #[instrument(skip(self, confirmation))]
    async fn confirm_card_payment(
        &self,
        order_number: &str,
        confirmation: &CardPaymentConfirmation,
    ) -> Result<(), ServiceError> {
        self.post_payment_update(order_number, "payment-confirmation", confirmation)
            .await
    }

    #[instrument(skip(self))]
    async fn report_card_failure(
        &self,
        order_number: &str,
        response_code: &str,
    ) -> Result<(), ServiceError> {
        self.post_payment_update(
            order_number,
            "payment-failure",
            &serde_json::json!({ "responseCode": response_code }),
        )
        .await
    }
}

/// Facts about the shopper needed for the post-create side effects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitContext {
    pub customer: CustomerContext,
    pub used_saved_address: bool,
    pub mode: PurchaseMode,
}

/// Sends drafts to the order service and performs what follows an
/// acknowledged order.
#[derive(Clone)]
pub struct OrderSubmitter {
    orders: Arc<dyn OrderService>,
    cart: Arc<dyn CartStore>,
    address_book: Arc<dyn AddressBook>,
    buy_now: BuyNowStore,
    events: Option<EventSender>,
}

impl OrderSubmitter {
    pub fn new(
        orders: Arc<dyn OrderService>,
        cart: Arc<dyn CartStore>,
        address_book: Arc<dyn AddressBook>,
        buy_now: BuyNowStore,
        events: Option<EventSender>,
    ) -> Self {
        Self {
            orders,
            cart,
            address_book,
            buy_now,
            events,
        }
    }

    pub fn orders(&self) -> &Arc<dyn OrderService> {
        &self.orders
    }

    /// Creates the order and performs every follow-up step.
    #[instrument(skip(self, draft, ctx), fields(order_ref = %draft.order_ref, method = %draft.payment_method))]
    pub async fn submit(
        &self,
        draft: &OrderDraft,
        ctx: &SubmitContext,
    ) -> Result<OrderReceipt, ServiceError> {
        let ack = self.create(draft).await?;
        Ok(self.complete(draft, &ack, ctx).await)
    }

    /// Only the order-service call. Nothing local changes unless it succeeds.
    pub async fn create(&self, draft: &OrderDraft) -> Result<OrderAck, ServiceError> {
        match self.orders.create_order(draft).await {
            Ok(ack) => {
                info!(order_ref = %draft.order_ref, order_number = %ack.order_number, "order created");
                Ok(ack)
            }
            Err(err) => {
                error!(order_ref = %draft.order_ref, error = %err, "order creation failed");
                Err(err)
            }
        }
    }

    /// Side effects of an acknowledged order. Failures here are logged; the
    /// order itself already exists.
    pub async fn complete(
        &self,
        draft: &OrderDraft,
        ack: &OrderAck,
        ctx: &SubmitContext,
    ) -> OrderReceipt {
        if ctx.customer.is_first_order && !ctx.used_saved_address {
            if let Some(user_id) = ctx.customer.user_id.clone() {
                let book = self.address_book.clone();
                let address = draft.shipping_address.clone();
                tokio::spawn(async move {
                    if let Err(err) = book.save(&user_id, &address).await {
                        warn!(error = %err, "could not save first-order address");
                    }
                });
            }
        }

        match ctx.mode {
            PurchaseMode::Cart => {
                if let Err(err) = self.cart.clear().await {
                    warn!(order_number = %ack.order_number, error = %err, "could not clear cart after order");
                }
            }
            PurchaseMode::BuyNow => self.buy_now.clear(),
        }

        let receipt = OrderReceipt {
            order_ref: draft.order_ref.clone(),
            order_number: ack.order_number.clone(),
            method: draft.payment_method,
            total: draft.total,
        };

        if let Some(events) = &self.events {
            events.emit(Event::OrderPlaced {
                order_ref: receipt.order_ref.clone(),
                order_number: receipt.order_number.clone(),
                method: receipt.method,
                total: receipt.total,
                at: Utc::now(),
            });
        }
        receipt
    }
}
