use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_GATEWAY_URL: &str = "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html";
const DEFAULT_RETURN_URL: &str = "http://localhost:3000/checkout/payment-return";
const DEFAULT_ORDER_SERVICE_URL: &str = "http://localhost:8080/api";
const PLACEHOLDER_CREDENTIALS: [&str; 4] = ["", "CHANGE_ME", "YOUR_TMN_CODE", "YOUR_HASH_SECRET"];

/// Payment gateway credentials and protocol constants.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Gateway payment page the shopper is redirected to
    #[validate(url)]
    #[serde(default = "default_gateway_url")]
    pub base_url: String,

    /// Merchant (terminal) code issued by the gateway
    #[serde(default)]
    pub merchant_code: String,

    /// Shared secret used for the HMAC-SHA512 signature
    #[serde(default)]
    pub hash_secret: String,

    /// Absolute URL the gateway redirects back to
    #[validate(url)]
    #[serde(default = "default_return_url")]
    pub return_url: String,

    #[serde(default = "default_gateway_version")]
    pub version: String,

    #[serde(default = "default_gateway_command")]
    pub command: String,

    #[validate(length(equal = 3))]
    #[serde(default = "default_currency")]
    pub currency: String,

    #[serde(default = "default_order_type")]
    pub order_type: String,

    #[serde(default = "default_locale")]
    pub default_locale: String,

    /// Minutes until the gateway rejects the payment request
    #[validate(range(min = 1, max = 1440))]
    #[serde(default = "default_expire_minutes")]
    pub expire_minutes: i64,

    /// Offset of the gateway's wall clock used in create/expire dates
    #[validate(custom = "validate_utc_offset")]
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_url(),
            merchant_code: String::new(),
            hash_secret: String::new(),
            return_url: default_return_url(),
            version: default_gateway_version(),
            command: default_gateway_command(),
            currency: default_currency(),
            order_type: default_order_type(),
            default_locale: default_locale(),
            expire_minutes: default_expire_minutes(),
            utc_offset_hours: default_utc_offset_hours(),
        }
    }
}

impl GatewayConfig {
    /// Gateway config with explicit credentials and defaults elsewhere.
    pub fn new(merchant_code: impl Into<String>, hash_secret: impl Into<String>) -> Self {
        Self {
            merchant_code: merchant_code.into(),
            hash_secret: hash_secret.into(),
            ..Default::default()
        }
    }

    /// True when the merchant code or secret is missing or left at a placeholder.
    pub fn has_placeholder_credentials(&self) -> bool {
        let is_placeholder =
            |value: &str| PLACEHOLDER_CREDENTIALS.iter().any(|p| value.trim().eq_ignore_ascii_case(p));
        is_placeholder(&self.merchant_code) || is_placeholder(&self.hash_secret)
    }
}

/// Order service endpoint.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct OrderServiceConfig {
    #[validate(url)]
    #[serde(default = "default_order_service_url")]
    pub base_url: String,

    #[validate(range(min = 1, max = 120))]
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OrderServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_order_service_url(),
            timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl OrderServiceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Bank-transfer confirmation timers and the status endpoint.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PaymentStatusConfig {
    #[validate(url)]
    #[serde(default = "default_order_service_url")]
    pub base_url: String,

    #[validate(range(min = 1))]
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    #[validate(range(min = 1))]
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[validate(range(min = 1))]
    #[serde(default = "default_payment_timeout_secs")]
    pub timeout_secs: u64,

    /// Allow the simulated confirmation when the status endpoint is unreachable.
    /// Staging/demo only.
    #[serde(default)]
    pub degraded_confirmation: bool,
}

impl Default for PaymentStatusConfig {
    fn default() -> Self {
        Self {
            base_url: default_order_service_url(),
            tick_interval_secs: default_tick_interval_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            timeout_secs: default_payment_timeout_secs(),
            degraded_confirmation: false,
        }
    }
}

/// Flat-rate shipping with a free-shipping threshold.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ShippingConfig {
    #[serde(default = "default_flat_fee")]
    pub flat_fee: u64,

    #[serde(default = "default_free_shipping_threshold")]
    pub free_shipping_threshold: u64,
}

impl Default for ShippingConfig {
    fn default() -> Self {
        Self {
            flat_fee: default_flat_fee(),
            free_shipping_threshold: default_free_shipping_threshold(),
        }
    }
}

impl ShippingConfig {
    pub fn fee_for(&self, subtotal: u64) -> u64 {
        if subtotal >= self.free_shipping_threshold {
            0
        } else {
            self.flat_fee
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CheckoutConfig {
    #[validate]
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[validate]
    #[serde(default)]
    pub order_service: OrderServiceConfig,

    #[validate]
    #[serde(default)]
    pub payment_status: PaymentStatusConfig,

    #[validate]
    #[serde(default)]
    pub shipping: ShippingConfig,

    /// Application environment
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging level
    #[validate(custom = "validate_log_level")]
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            order_service: OrderServiceConfig::default(),
            payment_status: PaymentStatusConfig::default(),
            shipping: ShippingConfig::default(),
            environment: default_environment(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

impl CheckoutConfig {
    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    fn warn_on_insecure_settings(&self) {
        if self.gateway.has_placeholder_credentials() {
            warn!("Gateway merchant code or hash secret is unset; redirects will be rejected by the gateway");
        }
        if self.payment_status.degraded_confirmation && self.is_production() {
            warn!("Degraded bank-transfer confirmation is enabled in production");
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_gateway_url() -> String {
    DEFAULT_GATEWAY_URL.to_string()
}

fn default_return_url() -> String {
    DEFAULT_RETURN_URL.to_string()
}

fn default_gateway_version() -> String {
    "2.1.0".to_string()
}

fn default_gateway_command() -> String {
    "pay".to_string()
}

fn default_currency() -> String {
    "VND".to_string()
}

fn default_order_type() -> String {
    "other".to_string()
}

fn default_locale() -> String {
    "vn".to_string()
}

fn default_expire_minutes() -> i64 {
    15
}

fn default_utc_offset_hours() -> i32 {
    7
}

fn default_order_service_url() -> String {
    DEFAULT_ORDER_SERVICE_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_tick_interval_secs() -> u64 {
    1
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_payment_timeout_secs() -> u64 {
    600
}

fn default_flat_fee() -> u64 {
    30_000
}

fn default_free_shipping_threshold() -> u64 {
    1_000_000
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_utc_offset(hours: i32) -> Result<(), ValidationError> {
    if (-12..=14).contains(&hours) {
        Ok(())
    } else {
        let mut err = ValidationError::new("utc_offset_hours");
        err.message = Some("utc_offset_hours must be between -12 and 14".into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_checkout={},checkout_cli={}", level, level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<CheckoutConfig, AppConfigError> {
    load_config_from(Path::new(CONFIG_DIR))
}

/// Same as [`load_config`], reading TOML files from `config_dir`.
pub fn load_config_from(config_dir: &Path) -> Result<CheckoutConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !config_dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir.display()
        );
    }

    let config = Config::builder()
        .set_default("environment", run_env.clone())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .add_source(File::from(config_dir.join("default")).required(false))
        .add_source(File::from(config_dir.join(&run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let checkout_config: CheckoutConfig = config.try_deserialize()?;

    checkout_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    checkout_config.warn_on_insecure_settings();

    info!("Configuration loaded successfully");
    Ok(checkout_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn defaults_validate() {
        let cfg = CheckoutConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.payment_status.timeout_secs, 600);
        assert_eq!(cfg.payment_status.poll_interval_secs, 5);
        assert_eq!(cfg.gateway.expire_minutes, 15);
        assert!(!cfg.payment_status.degraded_confirmation);
    }

    #[test]
    fn shipping_fee_is_waived_at_threshold() {
        let shipping = ShippingConfig::default();
        assert_eq!(shipping.fee_for(500_000), 30_000);
        assert_eq!(shipping.fee_for(1_000_000), 0);
        assert_eq!(shipping.fee_for(1_200_000), 0);
    }

    #[test]
    fn placeholder_credentials_are_detected_but_not_rejected() {
        let mut cfg = CheckoutConfig::default();
        assert!(cfg.gateway.has_placeholder_credentials());
        assert!(cfg.validate().is_ok());

        cfg.gateway = GatewayConfig::new("DEMO1234", "SECRETKEY");
        assert!(!cfg.gateway.has_placeholder_credentials());
    }

    #[test]
    fn invalid_log_level_fails_validation() {
        let cfg = CheckoutConfig {
            log_level: "verbose".into(),
            ..Default::default()
        };
        let errors = cfg.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("log_level"));
    }

    #[test]
    fn loads_layered_toml_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            r#"
                log_level = "debug"

                [gateway]
                merchant_code = "DEMO1234"
                hash_secret = "SECRETKEY"
                return_url = "https://shop.example.com/checkout/payment-return"

                [shipping]
                flat_fee = 25000
            "#,
        )
        .unwrap();

        let cfg = load_config_from(dir.path()).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.gateway.merchant_code, "DEMO1234");
        assert_eq!(cfg.shipping.flat_fee, 25_000);
        assert_eq!(cfg.shipping.free_shipping_threshold, 1_000_000);
        assert_eq!(cfg.gateway.currency, "VND");
    }
}
