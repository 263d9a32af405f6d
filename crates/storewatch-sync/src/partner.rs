//! # Partner API Client
//!
//! Paginated shop and item listings from the partner (first-party) API.
//!
//! ## Request Shape
//! ```text
//! GET {base_url}{shop_list_path}?page=1&size=100
//! GET {base_url}{item_list_path}?shopId=S1&page=1&size=100
//!
//!   Corporation-Id: <corporation id>
//!   AppKey:         <app key>
//!   GrantType:      <grant type>
//!   Token:          <access token>
//!   Timestamp:      <unix millis>
//!   TraceId:        <uuid v4>
//!
//! 200 { "code": 0, "message": "ok", "data": { "list": [...], "total": 42 } }
//! ```
//!
//! Header names come from configuration. A 401 (HTTP status or envelope
//! code) forces exactly one token refresh and one retry; a second rejection
//! is an [`SyncError::Auth`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::config::PartnerSettings;
use crate::error::{SyncError, SyncResult};
use crate::token::TokenStore;
use storewatch_core::{ItemObservation, Shop, Source};

/// Envelope codes meaning the access token is invalid or expired.
const INVALID_TOKEN_CODES: [i64; 3] = [401, 40101, 40102];

// =============================================================================
// Shared Request Plumbing
// =============================================================================

/// Builds the reqwest client shared by the token store and the API client.
pub fn build_http_client(settings: &PartnerSettings) -> SyncResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(settings.request_timeout())
        .build()
        .map_err(|e| SyncError::InvalidConfig(format!("failed to build HTTP client: {e}")))
}

/// Joins an endpoint path onto the base URL, keeping any base path prefix.
pub(crate) fn endpoint(base_url: &str, path: &str) -> SyncResult<Url> {
    let joined = format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Ok(Url::parse(&joined)?)
}

/// Request with the partner headers attached.
pub(crate) fn partner_request(
    http: &reqwest::Client,
    method: reqwest::Method,
    url: Url,
    settings: &PartnerSettings,
    token: &str,
    timestamp: &str,
) -> reqwest::RequestBuilder {
    let names = &settings.headers;
    http.request(method, url)
        .header(names.corporation_id.as_str(), settings.corporation_id.as_str())
        .header(names.app_key.as_str(), settings.app_key.as_str())
        .header(names.grant_type.as_str(), settings.grant_type.as_str())
        .header(names.token.as_str(), token)
        .header(names.timestamp.as_str(), timestamp)
        .header(names.trace_id.as_str(), Uuid::new_v4().to_string())
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: i64,
    #[serde(default, alias = "msg")]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// Checks status and envelope code, then decodes `data`.
pub(crate) async fn read_envelope<T: DeserializeOwned>(
    response: reqwest::Response,
) -> SyncResult<T> {
    let status = response.status();
    let body = response.text().await?;

    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(SyncError::Auth(format!("unauthorized: {body}")));
    }
    if !status.is_success() {
        return Err(SyncError::HttpStatus {
            status: status.as_u16(),
            message: body,
        });
    }

    let envelope: Envelope = serde_json::from_str(&body)?;
    let message = envelope.message.unwrap_or_default();
    if INVALID_TOKEN_CODES.contains(&envelope.code) {
        return Err(SyncError::Auth(format!("token rejected: {message}")));
    }
    if envelope.code != 0 {
        return Err(SyncError::HttpStatus {
            status: status.as_u16(),
            message: format!("code {}: {}", envelope.code, message),
        });
    }

    Ok(serde_json::from_value(envelope.data.unwrap_or(Value::Null))?)
}

// =============================================================================
// Page Decoding
// =============================================================================

/// One page of results.
///
/// `rows` counts what the partner sent, before malformed rows were dropped
/// from `items`. Paging decisions use `rows`.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub rows: usize,
    pub total: Option<u64>,
}

/// `data` is either a bare array or `{ list | items | rows, total? }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPage {
    Bare(Vec<Value>),
    Wrapped {
        #[serde(alias = "items", alias = "rows", default)]
        list: Vec<Value>,
        #[serde(default)]
        total: Option<u64>,
    },
    Empty(()),
}

impl RawPage {
    fn into_parts(self) -> (Vec<Value>, Option<u64>) {
        match self {
            RawPage::Bare(rows) => (rows, None),
            RawPage::Wrapped { list, total } => (list, total),
            RawPage::Empty(()) => (Vec::new(), Some(0)),
        }
    }
}

/// Accepts string or numeric ids.
pub(crate) fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid id: {other}"))),
    }
}

pub(crate) fn opt_id_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!("invalid id: {other}"))),
    }
}

#[derive(Debug, Deserialize)]
struct ShopRow {
    #[serde(alias = "shopId", alias = "id", deserialize_with = "id_string")]
    shop_id: String,
    #[serde(default, alias = "shopName")]
    name: Option<String>,
    #[serde(default, alias = "brandName")]
    brand: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ItemRow {
    #[serde(
        default,
        alias = "shopId",
        deserialize_with = "opt_id_string"
    )]
    shop_id: Option<String>,
    #[serde(alias = "itemId", alias = "id", deserialize_with = "id_string")]
    item_id: String,
    #[serde(default, alias = "itemName")]
    name: Option<String>,
    #[serde(default, alias = "itemCode")]
    code: Option<String>,
    #[serde(default, alias = "categoryName")]
    category: Option<String>,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default, alias = "isAvailable", alias = "online")]
    available: Option<bool>,
}

/// Major currency units to cents.
pub(crate) fn price_to_cents(price: f64) -> i64 {
    (price * 100.0).round() as i64
}

fn decode_shops(rows: Vec<Value>) -> Vec<Shop> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value::<ShopRow>(row) {
            Ok(shop) => Some(Shop {
                name: shop.name.unwrap_or_else(|| shop.shop_id.clone()),
                shop_id: shop.shop_id,
                brand: shop.brand,
                has_active_items: false,
                last_synced_at: None,
            }),
            Err(e) => {
                warn!(error = %e, "Skipping malformed shop row");
                None
            }
        })
        .collect()
}

fn decode_items(shop_id: &str, rows: Vec<Value>) -> Vec<ItemObservation> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value::<ItemRow>(row.clone()) {
            Ok(item) => Some(ItemObservation {
                shop_id: item.shop_id.unwrap_or_else(|| shop_id.to_string()),
                item_id: item.item_id,
                source: Source::Partner,
                name: item.name,
                code: item.code,
                category: item.category,
                price_cents: item.price.map(price_to_cents),
                available: item.available.unwrap_or(true),
                payload: row,
            }),
            Err(e) => {
                warn!(shop_id, error = %e, "Skipping malformed item row");
                None
            }
        })
        .collect()
}

// =============================================================================
// PartnerApiClient
// =============================================================================

/// Partner data endpoints with token handling.
pub struct PartnerApiClient {
    http: reqwest::Client,
    settings: PartnerSettings,
    tokens: Arc<TokenStore>,
}

impl PartnerApiClient {
    pub fn new(http: reqwest::Client, settings: PartnerSettings, tokens: Arc<TokenStore>) -> Self {
        PartnerApiClient {
            http,
            settings,
            tokens,
        }
    }

    /// One page of shops.
    pub async fn list_shops(&self, page: u32, size: u32) -> SyncResult<Page<Shop>> {
        let query = [("page", page.to_string()), ("size", size.to_string())];
        let raw: RawPage = self.get_data(&self.settings.shop_list_path, &query).await?;
        let (rows, total) = raw.into_parts();
        Ok(Page {
            rows: rows.len(),
            items: decode_shops(rows),
            total,
        })
    }

    /// One page of a shop's items.
    pub async fn list_items(
        &self,
        shop_id: &str,
        page: u32,
        size: u32,
    ) -> SyncResult<Page<ItemObservation>> {
        let query = [
            ("shopId", shop_id.to_string()),
            ("page", page.to_string()),
            ("size", size.to_string()),
        ];
        let raw: RawPage = self.get_data(&self.settings.item_list_path, &query).await?;
        let (rows, total) = raw.into_parts();
        Ok(Page {
            rows: rows.len(),
            items: decode_items(shop_id, rows),
            total,
        })
    }

    /// Every shop from `start_page` on, stopping at a short page.
    ///
    /// A listing still going at the page cap is incomplete and fails with
    /// `PartialData`.
    pub async fn list_all_shops(&self, start_page: u32, size: u32) -> SyncResult<Vec<Shop>> {
        let mut shops = Vec::new();
        let mut page = start_page.max(1);
        // `total` counts from page 1
        let mut seen = u64::from(page - 1) * u64::from(size);

        for _ in 0..self.settings.max_pages {
            let batch = self.list_shops(page, size).await?;
            seen += batch.rows as u64;
            shops.extend(batch.items);
            if is_last_page(batch.rows, size, seen, batch.total) {
                return Ok(shops);
            }
            page += 1;
        }

        warn!(max_pages = self.settings.max_pages, "Shop listing hit the page cap");
        Err(SyncError::PartialData {
            failed_sources: vec![Source::Partner.as_str().to_string()],
        })
    }

    /// Every item of a shop, stopping at a short page.
    ///
    /// Hitting the page cap fails the shop with `PartialData`.
    pub async fn list_all_items(
        &self,
        shop_id: &str,
        size: u32,
    ) -> SyncResult<Vec<ItemObservation>> {
        let mut items = Vec::new();
        let mut page = 1;
        let mut seen = 0u64;

        for _ in 0..self.settings.max_pages {
            let batch = self.list_items(shop_id, page, size).await?;
            seen += batch.rows as u64;
            items.extend(batch.items);
            if is_last_page(batch.rows, size, seen, batch.total) {
                return Ok(items);
            }
            page += 1;
        }

        warn!(shop_id, max_pages = self.settings.max_pages, "Item listing hit the page cap");
        Err(SyncError::PartialData {
            failed_sources: vec![format!("partner:{shop_id}")],
        })
    }

    /// GET with the current token; one forced refresh and retry on 401.
    async fn get_data<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> SyncResult<T> {
        let token = self.tokens.get_valid_token().await?;

        match self.send_get(path, query, &token.access_token).await {
            Err(SyncError::Auth(reason)) => {
                warn!(path, %reason, "Partner rejected token, refreshing once");
                let fresh = self.tokens.force_refresh(&token.access_token).await?;
                self.send_get(path, query, &fresh.access_token).await
            }
            other => other,
        }
    }

    async fn send_get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        access_token: &str,
    ) -> SyncResult<T> {
        let url = endpoint(&self.settings.base_url, path)?;
        let timestamp = chrono::Utc::now().timestamp_millis().to_string();

        let response = partner_request(
            &self.http,
            reqwest::Method::GET,
            url,
            &self.settings,
            access_token,
            &timestamp,
        )
        .query(query)
        .send()
        .await?;

        debug!(path, status = %response.status(), "Partner response received");
        read_envelope(response).await
    }
}

/// `rows` is this page's raw row count, `seen` the raw rows through it.
fn is_last_page(rows: usize, size: u32, seen: u64, total: Option<u64>) -> bool {
    if rows < size as usize {
        return true;
    }
    matches!(total, Some(total) if seen >= total)
}
