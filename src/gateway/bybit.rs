// =============================================================================
// Bybit V5 REST Adapter — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the API secret is used exclusively for signing and is never
// logged or serialized. Signed requests carry X-BAPI-* headers and a
// recvWindow of 5 000 ms to tolerate minor clock drift against Bybit.
//
// Error mapping: auth/signature retCodes and insufficient balance are
// permanent; 429s, 5xx and transport errors are transient; anything
// unrecognised maps to a transient venue error (safer to retry).
// =============================================================================

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use crate::error::{EngineError, Result};
use crate::gateway::adapter::{
    AssetBalance, CancelOutcome, OrderAck, OrderBook, OrderRequest, SymbolMeta, VenueAdapter,
    VenueCredentials,
};
use crate::types::{BookLevel, Side};

type HmacSha256 = Hmac<Sha256>;

/// Recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: &str = "5000";

/// Bybit V5 REST adapter for linear perpetuals.
#[derive(Clone)]
pub struct BybitAdapter {
    base_url: String,
    client: reqwest::Client,
}

impl BybitAdapter {
    pub fn new() -> Self {
        Self::with_base_url("https://api.bybit.com")
    }

    /// Point at a different host (testnet, local stub).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// V5 signature: HMAC-SHA256 over `timestamp + api_key + recv_window +
    /// payload`, hex-encoded.
    fn sign(secret: &str, timestamp: u64, api_key: &str, payload: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| EngineError::Auth("invalid secret key material".into()))?;
        mac.update(format!("{timestamp}{api_key}{RECV_WINDOW}{payload}").as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// POST a signed JSON body and return the parsed `result` object.
    async fn signed_post(
        &self,
        creds: &VenueCredentials,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let body_str = body.to_string();
        let ts = Self::timestamp_ms();
        let sig = Self::sign(&creds.api_secret, ts, &creds.api_key, &body_str)?;

        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("X-BAPI-API-KEY", &creds.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", sig)
            .header("Content-Type", "application/json")
            .body(body_str)
            .send()
            .await
            .map_err(map_transport_error)?;

        Self::parse_envelope(resp).await
    }

    /// GET a signed query and return the parsed `result` object.
    async fn signed_get(
        &self,
        creds: &VenueCredentials,
        path: &str,
        query: &str,
    ) -> Result<serde_json::Value> {
        let ts = Self::timestamp_ms();
        let sig = Self::sign(&creds.api_secret, ts, &creds.api_key, query)?;

        let resp = self
            .client
            .get(format!("{}{}?{}", self.base_url, path, query))
            .header("X-BAPI-API-KEY", &creds.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", sig)
            .send()
            .await
            .map_err(map_transport_error)?;

        Self::parse_envelope(resp).await
    }

    /// GET a public (unsigned) endpoint.
    async fn public_get(&self, path: &str, query: &str) -> Result<serde_json::Value> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(map_transport_error)?;
        Self::parse_envelope(resp).await
    }

    /// Unpack Bybit's `{retCode, retMsg, result}` envelope, mapping error
    /// codes onto engine kinds.
    async fn parse_envelope(resp: reqwest::Response) -> Result<serde_json::Value> {
        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(EngineError::RateLimited("http 429".into()));
        }
        if status.is_server_error() {
            return Err(EngineError::Network(format!("http {status}")));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Network(format!("malformed response: {e}")))?;

        let ret_code = body["retCode"].as_i64().unwrap_or(-1);
        if ret_code == 0 {
            return Ok(body["result"].clone());
        }

        let ret_msg = body["retMsg"].as_str().unwrap_or("").to_string();
        Err(map_ret_code(ret_code, ret_msg))
    }

    /// Parse a JSON value that may be either a string or a number into f64.
    fn parse_str_f64(val: &serde_json::Value) -> f64 {
        if let Some(s) = val.as_str() {
            s.parse().unwrap_or(0.0)
        } else {
            val.as_f64().unwrap_or(0.0)
        }
    }

    fn parse_levels(raw: Option<&Vec<serde_json::Value>>) -> Vec<BookLevel> {
        raw.map(|levels| {
            levels
                .iter()
                .filter_map(|l| {
                    let pair = l.as_array()?;
                    Some(BookLevel::new(
                        Self::parse_str_f64(pair.first()?),
                        Self::parse_str_f64(pair.get(1)?),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
    }
}

impl Default for BybitAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VenueAdapter for BybitAdapter {
    fn name(&self) -> &str {
        "bybit"
    }

    /// POST /v5/order/create. The idempotency key travels as `orderLinkId`
    /// so a retried request dedupes server-side.
    #[instrument(skip(self, creds, req), fields(symbol = %req.symbol, side = %req.side), name = "bybit::place_order")]
    async fn place_order(
        &self,
        creds: &VenueCredentials,
        req: &OrderRequest,
    ) -> Result<OrderAck> {
        let mut body = serde_json::json!({
            "category": "linear",
            "symbol": req.symbol,
            "side": match req.side { Side::Long => "Buy", Side::Short => "Sell" },
            "orderType": if req.price.is_some() { "Limit" } else { "Market" },
            "qty": req.qty.to_string(),
            "orderLinkId": req.idempotency_key,
        });
        if let Some(price) = req.price {
            body["price"] = serde_json::json!(price.to_string());
        }
        if req.reduce_only {
            body["reduceOnly"] = serde_json::json!(true);
        }

        let result = self.signed_post(creds, "/v5/order/create", body).await?;

        let order_id = result["orderId"].as_str().unwrap_or_default().to_string();
        if order_id.is_empty() {
            return Err(EngineError::Venue("create response missing orderId".into()));
        }

        // Fill fields are present only when the matching engine responded
        // synchronously; zero here means "not yet known" and the caller's
        // reconciliation picks it up.
        let ack = OrderAck {
            order_id,
            filled_qty: Self::parse_str_f64(&result["cumExecQty"]),
            avg_price: Self::parse_str_f64(&result["avgPrice"]),
        };
        debug!(order_id = %ack.order_id, filled = ack.filled_qty, "order placed");
        Ok(ack)
    }

    /// POST /v5/order/cancel. Bybit answers "order not exists or too late"
    /// when the order already filled; that race is a first-class outcome.
    #[instrument(skip(self, creds), name = "bybit::cancel_order")]
    async fn cancel_order(
        &self,
        creds: &VenueCredentials,
        symbol: &str,
        order_id: &str,
    ) -> Result<CancelOutcome> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "orderId": order_id,
        });

        match self.signed_post(creds, "/v5/order/cancel", body).await {
            Ok(_) => Ok(CancelOutcome::Cancelled),
            Err(EngineError::Venue(msg)) if msg.contains("110001") => {
                debug!(order_id, "cancel raced a fill");
                Ok(CancelOutcome::AlreadyFilled)
            }
            Err(e) => Err(e),
        }
    }

    /// GET /v5/market/orderbook (public).
    #[instrument(skip(self), name = "bybit::order_book")]
    async fn order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook> {
        let query = format!("category=linear&symbol={symbol}&limit={depth}");
        let result = self.public_get("/v5/market/orderbook", &query).await?;

        Ok(OrderBook {
            bids: Self::parse_levels(result["b"].as_array()),
            asks: Self::parse_levels(result["a"].as_array()),
        })
    }

    /// GET /v5/account/wallet-balance (signed).
    #[instrument(skip(self, creds), name = "bybit::balance")]
    async fn balance(&self, creds: &VenueCredentials, asset: &str) -> Result<AssetBalance> {
        let query = format!("accountType=UNIFIED&coin={asset}");
        let result = self
            .signed_get(creds, "/v5/account/wallet-balance", &query)
            .await?;

        let coins = result["list"]
            .as_array()
            .and_then(|l| l.first())
            .map(|acct| acct["coin"].clone())
            .unwrap_or_default();

        if let Some(coins) = coins.as_array() {
            for coin in coins {
                if coin["coin"].as_str() == Some(asset) {
                    return Ok(AssetBalance {
                        available: Self::parse_str_f64(&coin["availableToWithdraw"]),
                        total: Self::parse_str_f64(&coin["walletBalance"]),
                    });
                }
            }
        }

        warn!(asset, "asset not present in wallet balance — treating as zero");
        Ok(AssetBalance::default())
    }

    /// GET /v5/market/instruments-info (public). Fee rates are per-account
    /// on Bybit; the defaults stand in until the operator overrides them.
    #[instrument(skip(self), name = "bybit::symbol_meta")]
    async fn symbol_meta(&self, symbol: &str) -> Result<SymbolMeta> {
        let query = format!("category=linear&symbol={symbol}");
        let result = self
            .public_get("/v5/market/instruments-info", &query)
            .await?;

        let qty_step = result["list"]
            .as_array()
            .and_then(|l| l.first())
            .map(|info| Self::parse_str_f64(&info["lotSizeFilter"]["qtyStep"]))
            .unwrap_or(0.0);

        let mut meta = SymbolMeta::default();
        if qty_step > 0.0 {
            meta.lot_step = qty_step;
        }
        debug!(symbol, lot_step = meta.lot_step, "instrument metadata fetched");
        Ok(meta)
    }

    /// GET /v5/market/time (public) as a liveness probe.
    async fn ping(&self) -> Result<()> {
        self.public_get("/v5/market/time", "").await.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn map_transport_error(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::Timeout(e.to_string())
    } else {
        EngineError::Network(e.to_string())
    }
}

/// Map a Bybit retCode onto a semantic kind. Unknown codes stay transient.
fn map_ret_code(code: i64, msg: String) -> EngineError {
    match code {
        // Invalid api key / signature / permissions / expired key.
        10003 | 10004 | 10005 | 33004 => EngineError::Auth(format!("retCode {code}: {msg}")),
        // Too many visits / IP rate limit.
        10006 | 10018 => EngineError::RateLimited(format!("retCode {code}: {msg}")),
        // Insufficient available balance / margin.
        110007 | 110012 | 110052 => {
            EngineError::InsufficientFunds(format!("retCode {code}: {msg}"))
        }
        _ => EngineError::Venue(format!("retCode {code}: {msg}")),
    }
}

impl std::fmt::Debug for BybitAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitAdapter")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ret_code_classification() {
        assert!(map_ret_code(10003, "invalid api key".into()).is_permanent());
        assert!(map_ret_code(110007, "insufficient balance".into()).is_permanent());
        assert!(map_ret_code(10006, "too many visits".into()).is_transient());
        assert!(map_ret_code(-9999, "mystery".into()).is_transient());
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let a = BybitAdapter::sign("secret", 1_700_000_000_000, "key", "payload").unwrap();
        let b = BybitAdapter::sign("secret", 1_700_000_000_000, "key", "payload").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn level_parsing_tolerates_strings_and_numbers() {
        let raw = serde_json::json!([["100.5", "0.25"], [101.0, 0.5]]);
        let levels = BybitAdapter::parse_levels(raw.as_array());
        assert_eq!(levels.len(), 2);
        assert!((levels[0].price - 100.5).abs() < 1e-9);
        assert!((levels[1].volume - 0.5).abs() < 1e-9);
    }
}
