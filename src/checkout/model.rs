use serde::{Deserialize, Serialize};
use std::fmt;

use crate::checkout::address::ShippingAddress;
use crate::config::ShippingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Cod,
    BankTransfer,
    Card,
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PaymentMethod::Cod => "COD",
            PaymentMethod::BankTransfer => "BANK_TRANSFER",
            PaymentMethod::Card => "CARD",
        })
    }
}

/// Payment state recorded on the order service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderPaymentStatus {
    /// Collected on delivery.
    Unpaid,
    Paid,
    /// Card order awaiting the gateway return.
    PendingPayment,
}

/// Where the snapshot came from; decides what gets cleared after the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseMode {
    Cart,
    BuyNow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub product_id: String,
    pub name: String,
    pub unit_price: u64,
    pub quantity: u32,
    #[serde(default)]
    pub image_ref: Option<String>,
}

impl CartLine {
    pub fn line_total(&self) -> u64 {
        self.unit_price.saturating_mul(u64::from(self.quantity))
    }
}

/// Lines captured once at checkout entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartSnapshot {
    lines: Vec<CartLine>,
    mode: PurchaseMode,
}

impl CartSnapshot {
    pub fn from_cart(lines: Vec<CartLine>) -> Self {
        Self {
            lines,
            mode: PurchaseMode::Cart,
        }
    }

    pub fn buy_now(line: CartLine) -> Self {
        Self {
            lines: vec![line],
            mode: PurchaseMode::BuyNow,
        }
    }

    pub fn lines(&self) -> &[CartLine] {
        &self.lines
    }

    pub fn mode(&self) -> PurchaseMode {
        self.mode
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn subtotal(&self) -> u64 {
        self.lines
            .iter()
            .fold(0u64, |acc, line| acc.saturating_add(line.line_total()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderTotals {
    pub subtotal: u64,
    pub shipping_fee: u64,
    pub total: u64,
}

impl OrderTotals {
    pub fn compute(snapshot: &CartSnapshot, shipping: &ShippingConfig) -> Self {
        let subtotal = snapshot.subtotal();
        let shipping_fee = shipping.fee_for(subtotal);
        Self {
            subtotal,
            shipping_fee,
            total: subtotal.saturating_add(shipping_fee),
        }
    }
}

/// The order as sent to the order service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDraft {
    pub order_ref: String,
    pub items: Vec<CartLine>,
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
    pub payment_status: OrderPaymentStatus,
    pub subtotal: u64,
    pub shipping_fee: u64,
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Who is checking out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerContext {
    /// `None` for guests.
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub is_first_order: bool,
}

impl CustomerContext {
    pub fn guest() -> Self {
        Self::default()
    }

    pub fn member(user_id: impl Into<String>, is_first_order: bool) -> Self {
        Self {
            user_id: Some(user_id.into()),
            email: None,
            is_first_order,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

/// The order service's acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderReceipt {
    pub order_ref: String,
    pub order_number: String,
    pub method: PaymentMethod,
    pub total: u64,
}

impl OrderReceipt {
    /// Path of the confirmation view for this order.
    pub fn confirmation_path(&self) -> String {
        format!("/orders/{}/confirmation", self.order_number)
    }
}
