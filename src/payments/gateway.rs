//! Signed redirects to the card-network gateway and verification of the
//! signed parameters it sends back on the return URL.
//!
//! Both directions sign the same canonical string: fields sorted by key,
//! each key and value form-urlencoded, joined as `k=v` pairs with `&`.
//! The digest is HMAC-SHA512 over that string, rendered as lowercase hex.

use chrono::{DateTime, Duration, FixedOffset, Offset, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha512;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::errors::ServiceError;

type HmacSha512 = Hmac<Sha512>;

pub const SECURE_HASH_FIELD: &str = "vnp_SecureHash";
pub const SECURE_HASH_TYPE_FIELD: &str = "vnp_SecureHashType";
pub const SUCCESS_CODE: &str = "00";

const DEFAULT_CLIENT_IP: &str = "127.0.0.1";
const GATEWAY_DATE_FORMAT: &str = "%Y%m%d%H%M%S";

/// Sorted field map. `BTreeMap` iteration order is the canonical order.
pub type GatewayParams = BTreeMap<String, String>;

/// Builds the exact string that gets signed.
pub fn canonical_query(params: &GatewayParams) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn encode(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

/// HMAC-SHA512 of `data` keyed by `secret`, lowercase hex.
pub fn hmac_sha512_hex(secret: &str, data: &str) -> String {
    let mut mac =
        HmacSha512::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

fn gateway_offset(config: &GatewayConfig) -> FixedOffset {
    FixedOffset::east_opt(config.utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix())
}

/// What the shopper is paying for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    pub order_ref: String,
    /// Whole currency units.
    pub amount: u64,
    pub description: String,
    pub bank_code: Option<String>,
    pub locale: Option<String>,
    pub client_ip: Option<String>,
}

impl PaymentRequest {
    pub fn new(order_ref: impl Into<String>, amount: u64, description: impl Into<String>) -> Self {
        Self {
            order_ref: order_ref.into(),
            amount,
            description: description.into(),
            bank_code: None,
            locale: None,
            client_ip: None,
        }
    }
}

/// A fully built gateway redirect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentRedirect {
    pub url: String,
    pub canonical: String,
    pub signature: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct GatewaySigner {
    config: GatewayConfig,
}

impl GatewaySigner {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    /// Protocol fields for `request`, created at `created_at`.
    pub fn build_params(
        &self,
        request: &PaymentRequest,
        created_at: DateTime<Utc>,
    ) -> Result<GatewayParams, ServiceError> {
        if request.amount == 0 {
            return Err(ServiceError::ValidationError(
                "Payment amount must be greater than zero".to_string(),
            ));
        }
        let minor_amount = request.amount.checked_mul(100).ok_or_else(|| {
            ServiceError::ValidationError("Payment amount is too large".to_string())
        })?;

        let offset = gateway_offset(&self.config);
        let expires_at = created_at + Duration::minutes(self.config.expire_minutes);
        let locale = request
            .locale
            .clone()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| self.config.default_locale.clone());

        let mut params = GatewayParams::new();
        params.insert("vnp_Version".into(), self.config.version.clone());
        params.insert("vnp_Command".into(), self.config.command.clone());
        params.insert("vnp_TmnCode".into(), self.config.merchant_code.clone());
        params.insert("vnp_Locale".into(), locale);
        params.insert("vnp_CurrCode".into(), self.config.currency.clone());
        params.insert("vnp_TxnRef".into(), request.order_ref.clone());
        params.insert("vnp_OrderInfo".into(), request.description.clone());
        params.insert("vnp_OrderType".into(), self.config.order_type.clone());
        params.insert("vnp_Amount".into(), minor_amount.to_string());
        params.insert("vnp_ReturnUrl".into(), self.config.return_url.clone());
        params.insert(
            "vnp_IpAddr".into(),
            request
                .client_ip
                .clone()
                .unwrap_or_else(|| DEFAULT_CLIENT_IP.to_string()),
        );
        params.insert(
            "vnp_CreateDate".into(),
            created_at
                .with_timezone(&offset)
                .format(GATEWAY_DATE_FORMAT)
                .to_string(),
        );
        params.insert(
            "vnp_ExpireDate".into(),
            expires_at
                .with_timezone(&offset)
                .format(GATEWAY_DATE_FORMAT)
                .to_string(),
        );
        if let Some(bank) = request.bank_code.as_ref().filter(|b| !b.trim().is_empty()) {
            params.insert("vnp_BankCode".into(), bank.clone());
        }
        Ok(params)
    }

    /// Canonical string and its signature.
    pub fn sign(&self, params: &GatewayParams) -> (String, String) {
        let canonical = canonical_query(params);
        let signature = hmac_sha512_hex(&self.config.hash_secret, &canonical);
        (canonical, signature)
    }

    pub fn redirect(&self, request: &PaymentRequest) -> Result<PaymentRedirect, ServiceError> {
        self.redirect_at(request, Utc::now())
    }

    pub fn redirect_at(
        &self,
        request: &PaymentRequest,
        created_at: DateTime<Utc>,
    ) -> Result<PaymentRedirect, ServiceError> {
        if self.config.has_placeholder_credentials() {
            warn!(order_ref = %request.order_ref, "building gateway redirect with placeholder credentials");
        }
        let params = self.build_params(request, created_at)?;
        let (canonical, signature) = self.sign(&params);
        let url = format!(
            "{}?{}&{}={}",
            self.config.base_url, canonical, SECURE_HASH_FIELD, signature
        );
        debug!(order_ref = %request.order_ref, "built gateway redirect");
        Ok(PaymentRedirect {
            url,
            canonical,
            signature,
            created_at,
            expires_at: created_at + Duration::minutes(self.config.expire_minutes),
        })
    }
}

/// Gateway result code translated for the shopper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResponseCode {
    pub success: bool,
    pub message: &'static str,
}

/// Fixed translation table for gateway response codes.
pub fn describe_response_code(code: &str) -> ResponseCode {
    let (success, message) = match code {
        "00" => (true, "Payment successful"),
        "07" => (
            false,
            "Amount debited but the transaction is flagged as suspicious",
        ),
        "09" => (
            false,
            "Card or account is not enrolled in internet banking",
        ),
        "10" => (false, "Card verification failed more than 3 times"),
        "11" => (false, "The payment window expired"),
        "12" => (false, "Card or account is locked"),
        "13" => (false, "Incorrect one-time password"),
        "24" => (false, "Payment was cancelled"),
        "51" => (false, "Insufficient funds"),
        "65" => (false, "Daily transaction limit exceeded"),
        "75" => (false, "The issuing bank is under maintenance"),
        "79" => (false, "Payment password entered incorrectly too many times"),
        "99" => (false, "The gateway reported an unspecified error"),
        _ => (false, "Payment failed"),
    };
    ResponseCode { success, message }
}

/// An authenticated gateway return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayCallback {
    pub order_ref: String,
    /// Whole currency units (the gateway reports ×100).
    pub amount: u64,
    pub response_code: String,
    pub transaction_status: Option<String>,
    pub transaction_no: Option<String>,
    pub bank_code: Option<String>,
    pub pay_date: Option<String>,
    pub message: &'static str,
}

impl GatewayCallback {
    /// Success requires code `00`, and a `00` transaction status when one is sent.
    pub fn is_success(&self) -> bool {
        self.response_code == SUCCESS_CODE
            && self
                .transaction_status
                .as_deref()
                .map_or(true, |s| s == SUCCESS_CODE)
    }
}

#[derive(Debug, Clone)]
pub struct GatewayVerifier {
    config: GatewayConfig,
}

impl GatewayVerifier {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    /// Checks the signature over every field except the signature fields.
    pub fn verify_signature<'a, I>(&self, params: I) -> bool
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut remaining = GatewayParams::new();
        let mut supplied = None;
        for (key, value) in params {
            match key.as_str() {
                SECURE_HASH_FIELD => supplied = Some(value.to_ascii_lowercase()),
                SECURE_HASH_TYPE_FIELD => {}
                _ => {
                    remaining.insert(key.clone(), value.clone());
                }
            }
        }
        let Some(supplied) = supplied else {
            return false;
        };
        let expected = hmac_sha512_hex(&self.config.hash_secret, &canonical_query(&remaining));
        constant_time_eq(&expected, &supplied)
    }

    /// Verifies and decodes a return query. Any mismatch rejects the whole callback.
    pub fn verify<'a, I>(&self, params: I) -> Result<GatewayCallback, ServiceError>
    where
        I: IntoIterator<Item = (&'a String, &'a String)> + Clone,
    {
        if !self.verify_signature(params.clone()) {
            warn!("gateway callback failed signature verification");
            return Err(ServiceError::SignatureMismatch);
        }

        let fields: GatewayParams = params
            .into_iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let field = |name: &str| fields.get(name).cloned().filter(|v| !v.is_empty());

        let order_ref = field("vnp_TxnRef").ok_or_else(|| {
            ServiceError::ValidationError("Callback is missing the order reference".to_string())
        })?;
        let response_code = field("vnp_ResponseCode").ok_or_else(|| {
            ServiceError::ValidationError("Callback is missing the response code".to_string())
        })?;
        let minor_amount: u64 = field("vnp_Amount")
            .and_then(|a| a.parse().ok())
            .ok_or_else(|| {
                ServiceError::ValidationError("Callback amount is missing or malformed".to_string())
            })?;
        if minor_amount % 100 != 0 {
            warn!(%order_ref, minor_amount, "gateway callback amount has a fractional part");
            return Err(ServiceError::ValidationError(
                "Callback amount is not a whole currency amount".to_string(),
            ));
        }

        let description = describe_response_code(&response_code);
        Ok(GatewayCallback {
            order_ref,
            amount: minor_amount / 100,
            response_code,
            transaction_status: field("vnp_TransactionStatus"),
            transaction_no: field("vnp_TransactionNo"),
            bank_code: field("vnp_BankCode"),
            pay_date: field("vnp_PayDate"),
            message: description.message,
        })
    }
}
