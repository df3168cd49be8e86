use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::config::PaymentStatusConfig;
use crate::errors::ServiceError;

/// Body of `GET /payments/status?orderId=…`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatus {
    pub success: bool,
    #[serde(default)]
    pub is_paid: bool,
}

impl PaymentStatus {
    pub fn paid(&self) -> bool {
        self.success && self.is_paid
    }
}

/// Authoritative source of bank-transfer payment state.
#[async_trait]
pub trait PaymentStatusClient: Send + Sync {
    async fn check(&self, order_ref: &str) -> Result<PaymentStatus, ServiceError>;
}

#[derive(Clone)]
pub struct HttpPaymentStatusClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPaymentStatusClient {
    pub fn new(config: &PaymentStatusConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.poll_interval_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PaymentStatusClient for HttpPaymentStatusClient {
    #[instrument(skip(self))]
    async fn check(&self, order_ref: &str) -> Result<PaymentStatus, ServiceError> {
        let response = self
            .client
            .get(format!("{}/payments/status", self.base_url))
            .query(&[("orderId", order_ref)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ServiceError::TransportError(format!(
                "payment status endpoint returned {}",
                response.status()
            )));
        }

        let status: PaymentStatus = response.json().await?;
        debug!(order_ref, is_paid = status.is_paid, "payment status polled");
        Ok(status)
    }
}

/// Grace period before the simulated confirmation can fire.
const HEURISTIC_GRACE_SECS: u64 = 15;
/// Seconds over which the chance ramps up to its cap.
const HEURISTIC_RAMP_SECS: f64 = 300.0;
const HEURISTIC_MAX_PROBABILITY: f64 = 0.5;

/// Chance the simulated confirmation fires at `elapsed_seconds`.
pub fn heuristic_probability(elapsed_seconds: u64) -> f64 {
    if elapsed_seconds <= HEURISTIC_GRACE_SECS {
        return 0.0;
    }
    ((elapsed_seconds - HEURISTIC_GRACE_SECS) as f64 / HEURISTIC_RAMP_SECS)
        .min(HEURISTIC_MAX_PROBABILITY)
}

/// Simulated confirmation for demo/staging when no status endpoint exists.
/// Never consulted unless degraded confirmation is switched on.
pub trait ConfirmationHeuristic: Send + Sync {
    fn confirms(&self, elapsed_seconds: u64) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RandomConfirmation;

impl ConfirmationHeuristic for RandomConfirmation {
    fn confirms(&self, elapsed_seconds: u64) -> bool {
        let p = heuristic_probability(elapsed_seconds);
        p > 0.0 && rand::thread_rng().gen_bool(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> PaymentStatusConfig {
        PaymentStatusConfig {
            base_url: server.uri(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn polls_status_by_order_ref() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/payments/status"))
            .and(query_param("orderId", "ORD123"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "success": true, "isPaid": true })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpPaymentStatusClient::new(&config_for(&server)).unwrap();
        let status = client.check("ORD123").await.unwrap();
        assert!(status.paid());
    }

    #[tokio::test]
    async fn non_success_status_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/payments/status"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = HttpPaymentStatusClient::new(&config_for(&server)).unwrap();
        assert!(matches!(
            client.check("ORD123").await,
            Err(ServiceError::TransportError(_))
        ));
    }

    #[test]
    fn unpaid_or_unsuccessful_is_not_paid() {
        assert!(!PaymentStatus { success: true, is_paid: false }.paid());
        assert!(!PaymentStatus { success: false, is_paid: true }.paid());
    }

    #[test]
    fn heuristic_probability_ramps_and_caps() {
        assert_eq!(heuristic_probability(0), 0.0);
        assert_eq!(heuristic_probability(15), 0.0);
        assert!((heuristic_probability(75) - 0.2).abs() < 1e-9);
        assert_eq!(heuristic_probability(600), 0.5);
        assert!(!RandomConfirmation.confirms(10));
    }
}
