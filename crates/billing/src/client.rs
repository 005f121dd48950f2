//! T-Bank acquiring client configuration and HTTP client
//!
//! The orchestrator only talks to the gateway through [`PaymentGateway`], so
//! tests can substitute a fake without a network.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::time::Duration;

use crate::error::{BillingError, BillingResult};
use crate::signature;

/// Default T-Bank acquiring API base URL
pub const DEFAULT_API_URL: &str = "https://securepay.tinkoff.ru/v2";

/// Default timeout for every outbound gateway call
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Configuration for the T-Bank gateway
#[derive(Clone)]
pub struct TbankConfig {
    /// Terminal identifier issued by the bank
    pub terminal_key: String,
    /// Shared signing secret ("password" in the bank's terminology)
    pub password: String,
    /// API base URL (no trailing slash)
    pub api_url: String,
    /// Bounded timeout applied to every request
    pub timeout: Duration,
    /// Where the gateway should push status notifications
    pub notification_url: Option<String>,
    /// Redirects after checkout
    pub success_url: Option<String>,
    pub fail_url: Option<String>,
}

impl std::fmt::Debug for TbankConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TbankConfig")
            .field("terminal_key", &self.terminal_key)
            .field("password", &"<redacted>")
            .field("api_url", &self.api_url)
            .field("timeout", &self.timeout)
            .field("notification_url", &self.notification_url)
            .field("success_url", &self.success_url)
            .field("fail_url", &self.fail_url)
            .finish()
    }
}

impl TbankConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let terminal_key = std::env::var("TBANK_TERMINAL_KEY")
            .map_err(|_| BillingError::Config("TBANK_TERMINAL_KEY not set".to_string()))?;
        let password = std::env::var("TBANK_PASSWORD")
            .map_err(|_| BillingError::Config("TBANK_PASSWORD not set".to_string()))?;
        if password.len() < 8 {
            return Err(BillingError::Config(
                "TBANK_PASSWORD must be at least 8 characters".to_string(),
            ));
        }

        let timeout_secs = std::env::var("TBANK_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Ok(Self {
            terminal_key,
            password,
            api_url: std::env::var("TBANK_API_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
            timeout: Duration::from_secs(timeout_secs),
            notification_url: std::env::var("TBANK_NOTIFICATION_URL").ok(),
            success_url: std::env::var("PAYMENT_SUCCESS_URL").ok(),
            fail_url: std::env::var("PAYMENT_FAIL_URL").ok(),
        })
    }
}

/// Parameters for a hosted checkout session
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Local payment id, sent as the gateway order id
    pub order_id: String,
    /// Amount in minor currency units (kopecks)
    pub amount_minor: i64,
    pub description: String,
}

/// Gateway answer to session creation
#[derive(Debug, Clone)]
pub struct GatewaySession {
    pub gateway_payment_id: String,
    pub payment_url: String,
    pub status: String,
    pub raw: Value,
}

/// Gateway answer to a status query
#[derive(Debug, Clone)]
pub struct GatewayState {
    pub gateway_payment_id: String,
    pub order_id: Option<String>,
    pub status: String,
    pub amount_minor: Option<i64>,
    pub raw: Value,
}

/// The narrow contract the billing core needs from a payment gateway
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Open a hosted checkout session
    async fn init_session(&self, request: &SessionRequest) -> BillingResult<GatewaySession>;

    /// Fetch the current status of a gateway payment
    async fn get_state(&self, gateway_payment_id: &str) -> BillingResult<GatewayState>;

    /// Check authenticity of an inbound notification payload
    fn verify_notification(&self, payload: &Value) -> BillingResult<()>;
}

/// T-Bank response envelope shared by Init and GetState
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TbankResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, deserialize_with = "string_or_number")]
    error_code: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    payment_id: Option<String>,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(rename = "PaymentURL", default)]
    payment_url: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

/// The bank sends ids as strings in API responses and as numbers in
/// notifications; accept both.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| json_id(&v)))
}

/// Render a string or numeric JSON id as a string
pub fn json_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// T-Bank acquiring client
#[derive(Clone)]
pub struct TbankClient {
    http: reqwest::Client,
    config: TbankConfig,
}

impl TbankClient {
    /// Create a new client from config
    pub fn new(config: TbankConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    /// Create a new client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::new(TbankConfig::from_env()?)
    }

    /// Get the config
    pub fn config(&self) -> &TbankConfig {
        &self.config
    }

    async fn call(&self, method: &str, mut body: Value) -> BillingResult<(TbankResponse, Value)> {
        signature::sign_json(&mut body, &self.config.password);

        let url = format!("{}/{}", self.config.api_url, method);
        let response = self.http.post(&url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::warn!(
                method = method,
                http_status = %status,
                "T-Bank request failed"
            );
            return Err(BillingError::Gateway(format!(
                "{} returned HTTP {}: {}",
                method,
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        let raw: Value = response.json().await?;
        let parsed: TbankResponse = serde_json::from_value(raw.clone())
            .map_err(|e| BillingError::Gateway(format!("Malformed {} response: {}", method, e)))?;

        if !parsed.success {
            let code = parsed.error_code.clone().unwrap_or_else(|| "unknown".to_string());
            let message = match (&parsed.message, &parsed.details) {
                (Some(m), Some(d)) if !d.is_empty() => format!("{} ({})", m, d),
                (Some(m), _) => m.clone(),
                (None, Some(d)) => d.clone(),
                (None, None) => "no details".to_string(),
            };
            tracing::warn!(method = method, error_code = %code, "T-Bank rejected request");
            return Err(BillingError::GatewayRejected { code, message });
        }

        Ok((parsed, raw))
    }
}

#[async_trait]
impl PaymentGateway for TbankClient {
    async fn init_session(&self, request: &SessionRequest) -> BillingResult<GatewaySession> {
        let mut body = json!({
            "TerminalKey": self.config.terminal_key,
            "Amount": request.amount_minor,
            "OrderId": request.order_id,
            "Description": request.description,
        });
        if let Some(object) = body.as_object_mut() {
            if let Some(url) = &self.config.notification_url {
                object.insert("NotificationURL".to_string(), json!(url));
            }
            if let Some(url) = &self.config.success_url {
                object.insert("SuccessURL".to_string(), json!(url));
            }
            if let Some(url) = &self.config.fail_url {
                object.insert("FailURL".to_string(), json!(url));
            }
        }

        let (parsed, raw) = self.call("Init", body).await?;

        let gateway_payment_id = parsed
            .payment_id
            .ok_or_else(|| BillingError::Gateway("Init response without PaymentId".to_string()))?;
        let payment_url = parsed
            .payment_url
            .ok_or_else(|| BillingError::Gateway("Init response without PaymentURL".to_string()))?;

        Ok(GatewaySession {
            gateway_payment_id,
            payment_url,
            status: parsed.status.unwrap_or_else(|| "NEW".to_string()),
            raw,
        })
    }

    async fn get_state(&self, gateway_payment_id: &str) -> BillingResult<GatewayState> {
        let body = json!({
            "TerminalKey": self.config.terminal_key,
            "PaymentId": gateway_payment_id,
        });

        let (parsed, raw) = self.call("GetState", body).await?;

        Ok(GatewayState {
            gateway_payment_id: parsed
                .payment_id
                .unwrap_or_else(|| gateway_payment_id.to_string()),
            order_id: parsed.order_id,
            status: parsed
                .status
                .ok_or_else(|| BillingError::Gateway("GetState response without Status".to_string()))?,
            amount_minor: parsed.amount,
            raw,
        })
    }

    fn verify_notification(&self, payload: &Value) -> BillingResult<()> {
        let provided = signature::signature_from_json(payload).ok_or_else(|| {
            tracing::warn!("T-Bank notification without Token");
            BillingError::InvalidSignature
        })?;

        let params = signature::params_from_json(payload);
        if !signature::verify(&params, &self.config.password, provided) {
            tracing::warn!(
                token_len = provided.len(),
                "T-Bank notification signature mismatch"
            );
            return Err(BillingError::InvalidSignature);
        }

        let terminal_key = payload.get("TerminalKey").and_then(|v| v.as_str());
        if terminal_key != Some(self.config.terminal_key.as_str()) {
            tracing::warn!(
                terminal_key = ?terminal_key,
                "T-Bank notification for a foreign terminal"
            );
            return Err(BillingError::InvalidSignature);
        }

        Ok(())
    }
}
