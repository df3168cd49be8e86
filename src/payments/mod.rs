//! Payment rails: card checks, the card-network gateway, and the
//! bank-transfer status endpoint.

pub mod card;
pub mod gateway;
pub mod status;

pub use card::{detect_brand, is_valid_expiry, is_valid_number, CardBrand, CardCheck, CardInput};
pub use gateway::{
    GatewayCallback, GatewayParams, GatewaySigner, GatewayVerifier, PaymentRedirect,
    PaymentRequest,
};
pub use status::{
    ConfirmationHeuristic, HttpPaymentStatusClient, PaymentStatus, PaymentStatusClient,
    RandomConfirmation,
};
