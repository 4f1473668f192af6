//! Admin dashboard API client.
//!
//! [`HttpGateway`] is the production [`RemoteGateway`]: it posts queued sales
//! to the admin dashboard, fetches the catalog for the offline cache, and
//! runs the lightweight health check that feeds the connectivity monitor on
//! headless terminals.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::GatewayError;
use crate::gateway::RemoteGateway;
use crate::models::{CachedProduct, PendingSale, ServerId, Session};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight health check.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(5);

const SALES_PATH: &str = "/api/pos/sales";
const PRODUCTS_PATH: &str = "/api/pos/products";
const HEALTH_PATH: &str = "/api/health";

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the admin dashboard URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_admin_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    // Again, in case "/api/" was present
    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

fn connection_string_field(raw: &str, keys: &[&str]) -> Option<String> {
    let payload = decode_connection_string_payload(raw)?;
    str_any(&payload, keys)
}

/// API key carried by a terminal connection string (`{"key": ...}`).
pub fn extract_api_key_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["key"])
}

/// Admin URL carried by a terminal connection string (`{"url": ...}`).
pub fn extract_admin_url_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["url"]).map(|u| normalize_admin_url(&u))
}

/// Terminal id carried by a terminal connection string (`{"tid": ...}`).
pub fn extract_terminal_id_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["tid", "terminalId"])
}

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

fn str_any(v: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match v.get(*key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.trim().to_string()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

fn num_any(v: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        match v.get(*key) {
            Some(Value::Number(n)) => return n.as_f64(),
            Some(Value::String(s)) => {
                if let Ok(parsed) = s.trim().parse::<f64>() {
                    return Some(parsed);
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Map a transport failure. Nothing reached the backend, so it is transient.
fn friendly_error(url: &str, err: &reqwest::Error) -> GatewayError {
    let message = if err.is_connect() {
        format!("Cannot reach admin dashboard at {url}")
    } else if err.is_timeout() {
        format!("Connection to {url} timed out")
    } else if err.is_builder() {
        // Terminal misconfiguration; the sale itself is fine.
        format!("Invalid admin dashboard URL: {url}")
    } else {
        format!("Network error communicating with {url}: {err}")
    };
    GatewayError::transient(message)
}

/// Human-readable description of an HTTP status.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Admin dashboard endpoint not found".to_string(),
        429 => "Admin dashboard is throttling requests".to_string(),
        s if s >= 500 => "Admin dashboard server error".to_string(),
        _ => "Unexpected response from admin dashboard".to_string(),
    }
}

/// Build a classified error from a non-success response, preserving any
/// validation details the backend sent.
fn error_from_response(status: StatusCode, body_text: &str) -> GatewayError {
    let body = body_text.trim();
    let detail = if let Ok(json) = serde_json::from_str::<Value>(body) {
        let message = json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| status_error(status));
        match json.get("details").or_else(|| json.get("errors")) {
            Some(details) => format!("{message} (HTTP {}): {details}", status.as_u16()),
            None => format!("{message} (HTTP {})", status.as_u16()),
        }
    } else if !body.is_empty() {
        format!("{} (HTTP {}): {body}", status_error(status), status.as_u16())
    } else {
        format!("{} (HTTP {})", status_error(status), status.as_u16())
    };
    GatewayError::from_status(status.as_u16(), detail)
}

// ---------------------------------------------------------------------------
// Payload mapping
// ---------------------------------------------------------------------------

/// JSON body for the remote write endpoint.
fn sale_payload(sale: &PendingSale, session: &Session) -> Value {
    let items: Vec<Value> = sale
        .items
        .iter()
        .map(|item| {
            serde_json::json!({
                "product_id": item.product_id,
                "product_name": item.product_name,
                "quantity": item.quantity,
                "unit_price": item.unit_price,
                "cost_price": item.cost_price,
                "total": item.line_total,
                "profit": item.profit(),
            })
        })
        .collect();

    serde_json::json!({
        "client_id": sale.id,
        "items": items,
        "subtotal": sale.subtotal,
        "total": sale.total,
        "discount": sale.discount,
        "tax": sale.tax,
        "profit": sale.profit(),
        "payment_method": sale.payment_method.as_str(),
        "cashier_id": sale.cashier_id,
        "terminal_id": session.terminal_id,
        "notes": sale.notes,
        "created_at": sale.created_at.to_rfc3339(),
    })
}

/// Server id from an accepted-sale response.
fn parse_server_id(resp: &Value) -> Option<ServerId> {
    str_any(resp, &["id", "sale_id", "saleId"])
        .or_else(|| resp.get("data").and_then(|d| str_any(d, &["id", "sale_id"])))
        .or_else(|| resp.get("sale").and_then(|d| str_any(d, &["id"])))
}

/// Catalog rows from a products response. Rows without id or name are skipped.
fn parse_products(resp: &Value) -> Result<Vec<CachedProduct>, GatewayError> {
    let rows = resp
        .as_array()
        .or_else(|| resp.get("products").and_then(Value::as_array))
        .or_else(|| resp.get("data").and_then(Value::as_array))
        .ok_or_else(|| GatewayError::transient("Products response missing product list"))?;

    let mut products = Vec::with_capacity(rows.len());
    for row in rows {
        let (Some(id), Some(name)) = (str_any(row, &["id"]), str_any(row, &["name"])) else {
            debug!("products: skipping row without id or name");
            continue;
        };
        products.push(CachedProduct {
            id,
            name,
            price: num_any(row, &["price", "sell_price", "sellPrice"]).unwrap_or(0.0),
            stock: num_any(row, &["stock", "stock_quantity"])
                .map(|s| s as i64)
                .unwrap_or(0),
            category: str_any(row, &["category", "category_name"]),
            cost_price: num_any(row, &["cost_price", "costPrice", "buy_price"]),
        });
    }
    Ok(products)
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Authenticated client for the admin dashboard.
pub struct HttpGateway {
    client: Client,
    health_client: Client,
    base_url: String,
    api_key: Zeroizing<String>,
    terminal_id: Option<String>,
}

impl HttpGateway {
    /// `request_timeout` bounds every request; the engine applies its own
    /// per-sale timeout on top.
    pub fn new(
        admin_url: &str,
        api_key: Zeroizing<String>,
        terminal_id: Option<String>,
        request_timeout: Option<Duration>,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(request_timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()
            .map_err(|e| GatewayError::permanent(format!("Failed to create HTTP client: {e}")))?;
        let health_client = Client::builder()
            .timeout(CONNECTIVITY_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::permanent(format!("Failed to create HTTP client: {e}")))?;
        let resolved_api_key = extract_api_key_from_connection_string(&api_key)
            .map(Zeroizing::new)
            .unwrap_or(api_key);

        Ok(Self {
            client,
            health_client,
            base_url: normalize_admin_url(admin_url),
            api_key: resolved_api_key,
            terminal_id,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        session: &Session,
    ) -> reqwest::RequestBuilder {
        let terminal_id = session
            .terminal_id
            .as_deref()
            .or(self.terminal_id.as_deref())
            .unwrap_or_default();
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .header("X-POS-API-Key", self.api_key.as_str())
            .header("x-terminal-id", terminal_id)
            .header("x-cashier-id", &session.cashier_id)
    }

    async fn read_json(&self, resp: reqwest::Response) -> Result<Value, GatewayError> {
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(error_from_response(status, &body_text));
        }
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        // The write may have landed; resubmitting is safe because the id is
        // the idempotency key.
        serde_json::from_str(&body_text).map_err(|e| {
            GatewayError::transient(format!("Invalid JSON from admin dashboard: {e}"))
        })
    }

    /// Lightweight reachability check: `HEAD /api/health`.
    pub async fn check_health(&self) -> bool {
        let start = Instant::now();
        match self
            .health_client
            .head(format!("{}{HEALTH_PATH}", self.base_url))
            .header("X-POS-API-Key", self.api_key.as_str())
            .send()
            .await
        {
            Ok(resp) => {
                let ok = resp.status().is_success();
                debug!(
                    latency_ms = start.elapsed().as_millis() as u64,
                    status = resp.status().as_u16(),
                    "health check"
                );
                ok
            }
            Err(e) => {
                debug!(error = %e, "health check failed");
                false
            }
        }
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn submit_sale(
        &self,
        sale: &PendingSale,
        session: &Session,
    ) -> Result<ServerId, GatewayError> {
        let resp = self
            .request(reqwest::Method::POST, SALES_PATH, session)
            .header("Idempotency-Key", &sale.id)
            .json(&sale_payload(sale, session))
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        let body = self.read_json(resp).await.map_err(|e| {
            warn!(sale_id = %sale.id, error = %e, "submit_sale failed");
            e
        })?;
        let server_id = parse_server_id(&body).ok_or_else(|| {
            GatewayError::transient("Sale accepted without a server id in the response")
        })?;
        info!(sale_id = %sale.id, server_id = %server_id, "Sale delivered to admin dashboard");
        Ok(server_id)
    }

    async fn fetch_products(&self, session: &Session) -> Result<Vec<CachedProduct>, GatewayError> {
        let resp = self
            .request(reqwest::Method::GET, PRODUCTS_PATH, session)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let body = self.read_json(resp).await?;
        parse_products(&body)
    }
}
