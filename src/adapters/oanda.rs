//! OANDA v20 REST adapter (practice or live account)
//!
//! Orders are FOK market orders carrying the client reference as the
//! client extension id. Open positions are reported per trade, so each
//! fill is its own position and closes by trade id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::broker::{BarStream, Broker, BrokerKind, BrokerResult, PriceSource};
use crate::config::BrokerConfig;
use crate::domain::{BrokerPosition, Granularity, OrderFill, OrderRequest, PriceBar, Quote};
use crate::error::{BrokerError, FxError, Result};

const CANDLE_POLL_COUNT: u32 = 5;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ==================== Wire types ====================

#[derive(Debug, Deserialize)]
struct AccountSummaryResponse {
    account: AccountSummary,
}

#[derive(Debug, Deserialize)]
struct AccountSummary {
    balance: Decimal,
    #[serde(rename = "NAV")]
    nav: Option<Decimal>,
    #[serde(rename = "unrealizedPL", default)]
    unrealized_pl: Decimal,
}

#[derive(Debug, Deserialize)]
struct PricingResponse {
    prices: Vec<ClientPrice>,
}

#[derive(Debug, Deserialize)]
struct PriceBucket {
    price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientPrice {
    instrument: String,
    time: DateTime<Utc>,
    #[serde(default)]
    bids: Vec<PriceBucket>,
    #[serde(default)]
    asks: Vec<PriceBucket>,
    closeout_bid: Option<Decimal>,
    closeout_ask: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_fill_transaction: Option<FillTransaction>,
    order_cancel_transaction: Option<CancelTransaction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FillTransaction {
    id: String,
    instrument: String,
    units: String,
    price: Decimal,
    time: DateTime<Utc>,
    #[serde(rename = "clientOrderID")]
    client_order_id: Option<String>,
    trade_opened: Option<TradeOpened>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TradeOpened {
    #[serde(rename = "tradeID")]
    trade_id: String,
}

#[derive(Debug, Deserialize)]
struct CancelTransaction {
    reason: String,
}

#[derive(Debug, Deserialize)]
struct OrderLookupResponse {
    order: OrderState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderState {
    state: String,
    #[serde(rename = "fillingTransactionID")]
    filling_transaction_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransactionResponse {
    transaction: FillTransaction,
}

#[derive(Debug, Deserialize)]
struct OpenTradesResponse {
    trades: Vec<OpenTrade>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenTrade {
    id: String,
    instrument: String,
    price: Decimal,
    current_units: String,
    #[serde(rename = "unrealizedPL", default)]
    unrealized_pl: Decimal,
}

#[derive(Debug, Deserialize)]
struct CandlesResponse {
    candles: Vec<Candle>,
}

#[derive(Debug, Deserialize)]
struct Candle {
    complete: bool,
    volume: Decimal,
    time: DateTime<Utc>,
    mid: Option<CandleMid>,
}

#[derive(Debug, Deserialize)]
struct CandleMid {
    o: Decimal,
    h: Decimal,
    l: Decimal,
    c: Decimal,
}

fn parse_units(raw: &str) -> BrokerResult<i64> {
    let value: Decimal = raw
        .trim()
        .parse()
        .map_err(|_| BrokerError::Validation(format!("unparseable units '{raw}'")))?;
    value
        .trunc()
        .to_i64()
        .ok_or_else(|| BrokerError::Validation(format!("units out of range '{raw}'")))
}

/// OANDA rejects prices with more precision than the instrument displays
fn format_price(instrument: &str, price: Decimal) -> String {
    let dp = if instrument.to_ascii_uppercase().ends_with("JPY") {
        3
    } else {
        5
    };
    format!("{:.1$}", price.round_dp(dp), dp as usize)
}

impl FillTransaction {
    fn into_fill(self, fallback_reference: &str) -> BrokerResult<OrderFill> {
        Ok(OrderFill {
            order_id: self
                .trade_opened
                .map(|t| t.trade_id)
                .unwrap_or_else(|| self.id.clone()),
            client_reference: self
                .client_order_id
                .unwrap_or_else(|| fallback_reference.to_string()),
            units: parse_units(&self.units)?,
            instrument: self.instrument,
            price: self.price,
            time: self.time,
        })
    }
}

impl Candle {
    fn into_bar(self, instrument: &str, granularity: Granularity) -> Option<PriceBar> {
        let mid = self.mid?;
        Some(PriceBar {
            instrument: instrument.to_string(),
            granularity,
            open_time: self.time,
            open: mid.o,
            high: mid.h,
            low: mid.l,
            close: mid.c,
            volume: self.volume,
        })
    }
}

// ==================== Client ====================

#[derive(Clone)]
pub struct OandaClient {
    http: Client,
    base_url: String,
    account_id: String,
    poll_interval: Duration,
}

impl OandaClient {
    pub fn new(base_url: &str, account_id: &str, api_token: &str, poll_interval: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", api_token))
            .map_err(|e| FxError::Validation(format!("invalid OANDA api token: {}", e)))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = Client::builder()
            .user_agent("fxbot-oanda-adapter/0.1")
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| FxError::Internal(format!("failed to build OANDA HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            account_id: account_id.to_string(),
            poll_interval,
        })
    }

    /// Build from the broker section, falling back to `OANDA_ACCOUNT_ID` / `OANDA_API_TOKEN`
    pub fn from_config(config: &BrokerConfig) -> Result<Self> {
        let account_id = config
            .account_id
            .clone()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| std::env::var("OANDA_ACCOUNT_ID").ok())
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| FxError::Validation("OANDA account id is required".to_string()))?;
        let api_token = config
            .api_token
            .clone()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| std::env::var("OANDA_API_TOKEN").ok())
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| FxError::Validation("OANDA api token is required".to_string()))?;

        Self::new(
            &config.oanda_api_url,
            &account_id,
            &api_token,
            Duration::from_millis(config.poll_interval_ms),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: Option<&[(&str, String)]>,
        body: Option<Value>,
    ) -> BrokerResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.request(method.clone(), &url);

        if let Some(query) = query {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(BrokerError::from_status(
                status.as_u16(),
                format!("OANDA {} {}: {}", method, path, text),
            ));
        }

        serde_json::from_str(&text)
            .map_err(|e| BrokerError::Transient(format!("invalid OANDA response for {}: {}", path, e)))
    }

    fn account_path(&self, suffix: &str) -> String {
        format!("/accounts/{}{}", self.account_id, suffix)
    }

    /// Fill previously produced by an order carrying `client_reference`, if any
    async fn find_fill_by_reference(&self, client_reference: &str) -> BrokerResult<Option<OrderFill>> {
        let path = self.account_path(&format!("/orders/@{}", client_reference));
        let lookup: OrderLookupResponse = match self.request(Method::GET, &path, None, None).await {
            Ok(found) => found,
            Err(BrokerError::Validation(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let Some(tx_id) = lookup
            .order
            .filling_transaction_id
            .filter(|_| lookup.order.state == "FILLED")
        else {
            return Ok(None);
        };

        let path = self.account_path(&format!("/transactions/{}", tx_id));
        let tx: TransactionResponse = self.request(Method::GET, &path, None, None).await?;
        tx.transaction.into_fill(client_reference).map(Some)
    }

    /// Most recent complete candles, oldest first
    pub async fn get_candles(&self, instrument: &str, granularity: Granularity, count: u32) -> BrokerResult<Vec<PriceBar>> {
        let path = format!("/instruments/{}/candles", instrument);
        let query = [
            ("granularity", granularity.as_str().to_string()),
            ("count", count.to_string()),
            ("price", "M".to_string()),
        ];
        let resp: CandlesResponse = self.request(Method::GET, &path, Some(&query), None).await?;
        Ok(candles_to_bars(resp, instrument, granularity))
    }
}

fn candles_to_bars(resp: CandlesResponse, instrument: &str, granularity: Granularity) -> Vec<PriceBar> {
    resp.candles
        .into_iter()
        .filter(|c| c.complete)
        .filter_map(|c| c.into_bar(instrument, granularity))
        .collect()
}

fn order_body(order: &OrderRequest) -> Value {
    let mut body = json!({
        "type": "MARKET",
        "instrument": order.instrument,
        "units": order.units.to_string(),
        "timeInForce": "FOK",
        "positionFill": "DEFAULT",
        "clientExtensions": { "id": order.client_reference },
    });
    if let Some(stop) = order.stop_price {
        body["stopLossOnFill"] = json!({ "price": format_price(&order.instrument, stop) });
    }
    if let Some(tp) = order.take_profit_price {
        body["takeProfitOnFill"] = json!({ "price": format_price(&order.instrument, tp) });
    }
    json!({ "order": body })
}

fn fill_from_response(resp: OrderResponse, client_reference: &str) -> BrokerResult<OrderFill> {
    if let Some(fill) = resp.order_fill_transaction {
        return fill.into_fill(client_reference);
    }
    let reason = resp
        .order_cancel_transaction
        .map(|c| c.reason)
        .unwrap_or_else(|| "no fill transaction".to_string());
    Err(BrokerError::Rejected(reason))
}

#[async_trait]
impl Broker for OandaClient {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Oanda
    }

    async fn account_equity(&self) -> BrokerResult<Decimal> {
        let path = self.account_path("/summary");
        let resp: AccountSummaryResponse = self.request(Method::GET, &path, None, None).await?;
        let account = resp.account;
        Ok(account.nav.unwrap_or(account.balance + account.unrealized_pl))
    }

    async fn current_price(&self, instrument: &str) -> BrokerResult<Quote> {
        let path = self.account_path("/pricing");
        let query = [("instruments", instrument.to_string())];
        let resp: PricingResponse = self.request(Method::GET, &path, Some(&query), None).await?;

        let price = resp
            .prices
            .into_iter()
            .find(|p| p.instrument == instrument)
            .ok_or_else(|| BrokerError::Validation(format!("no pricing for {}", instrument)))?;

        let bid = price.bids.first().map(|b| b.price).or(price.closeout_bid);
        let ask = price.asks.first().map(|a| a.price).or(price.closeout_ask);
        match (bid, ask) {
            (Some(bid), Some(ask)) => Ok(Quote {
                instrument: price.instrument,
                time: price.time,
                bid,
                ask,
            }),
            _ => Err(BrokerError::Transient(format!("empty book for {}", instrument))),
        }
    }

    async fn submit_order(&self, order: &OrderRequest) -> BrokerResult<OrderFill> {
        if let Some(existing) = self.find_fill_by_reference(&order.client_reference).await? {
            debug!("oanda: {} already filled as {}", order.client_reference, existing.order_id);
            return Ok(existing);
        }

        let path = self.account_path("/orders");
        let resp: OrderResponse = self
            .request(Method::POST, &path, None, Some(order_body(order)))
            .await?;
        let fill = fill_from_response(resp, &order.client_reference)?;
        info!(
            "oanda: filled {} {} @ {} (trade {})",
            fill.units, fill.instrument, fill.price, fill.order_id
        );
        Ok(fill)
    }

    async fn open_positions(&self, instrument: &str) -> BrokerResult<Vec<BrokerPosition>> {
        let path = self.account_path("/openTrades");
        let resp: OpenTradesResponse = self.request(Method::GET, &path, None, None).await?;

        resp.trades
            .into_iter()
            .filter(|t| t.instrument == instrument)
            .map(|t| {
                Ok(BrokerPosition {
                    units: parse_units(&t.current_units)?,
                    id: t.id,
                    instrument: t.instrument,
                    average_price: t.price,
                    unrealized_pnl: t.unrealized_pl,
                })
            })
            .collect()
    }

    async fn close_position(&self, position_id: &str) -> BrokerResult<OrderFill> {
        let path = self.account_path(&format!("/trades/{}/close", position_id));
        let resp: OrderResponse = self
            .request(Method::PUT, &path, None, Some(json!({ "units": "ALL" })))
            .await?;
        fill_from_response(resp, &format!("close-{}", position_id))
    }
}

// ==================== Bar stream ====================

struct PollState {
    client: OandaClient,
    instrument: String,
    granularity: Granularity,
    /// Open time of the newest bar already emitted (or skipped at startup)
    watermark: Option<DateTime<Utc>>,
    pending: VecDeque<PriceBar>,
    primed: bool,
    failed: bool,
}

impl PollState {
    async fn poll(&mut self) -> BrokerResult<()> {
        let bars = self
            .client
            .get_candles(&self.instrument, self.granularity, CANDLE_POLL_COUNT)
            .await?;

        if !self.primed {
            // Candles already complete when the stream opens are history, not live bars
            self.watermark = bars.last().map(|b| b.open_time);
            self.primed = true;
            return Ok(());
        }

        for bar in bars {
            if self.watermark.map_or(true, |w| bar.open_time > w) {
                self.watermark = Some(bar.open_time);
                self.pending.push_back(bar);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PriceSource for OandaClient {
    async fn stream_prices(&self, instrument: &str, granularity: Granularity) -> BrokerResult<BarStream> {
        let mut state = PollState {
            client: self.clone(),
            instrument: instrument.to_string(),
            granularity,
            watermark: None,
            pending: VecDeque::new(),
            primed: false,
            failed: false,
        };
        // Surface auth and validation problems to the caller instead of the stream
        state.poll().await?;
        info!("oanda: polling {} {} candles every {:?}", instrument, granularity, self.poll_interval);

        let stream = futures::stream::unfold(state, |mut state| async move {
            if state.failed {
                return None;
            }
            loop {
                if let Some(bar) = state.pending.pop_front() {
                    return Some((Ok(bar), state));
                }
                tokio::time::sleep(state.client.poll_interval).await;
                if let Err(e) = state.poll().await {
                    warn!("oanda: candle poll failed: {}", e);
                    state.failed = true;
                    let err = if e.is_fatal() {
                        e
                    } else {
                        BrokerError::Stream(e.to_string())
                    };
                    return Some((Err(err), state));
                }
            }
        });
        Ok(stream.boxed())
    }
}
