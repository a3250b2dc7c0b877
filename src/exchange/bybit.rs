use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use super::auth::BybitAuth;
use super::{
    ExchangeClient, ExchangeError, MarketSnapshot, OrderAck, OrderRequest, OrderType,
    PositionSide, PositionSnapshot,
};
use crate::config::BybitConfig;

/// Bybit v5 REST client for linear perpetuals.
pub struct BybitClient {
    client: Client,
    auth: Option<BybitAuth>,
    rest_url: String,
    recv_window: u64,
    category: String,
    hedge_mode: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiEnvelope {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    #[serde(default)]
    result: Value,
}

impl ApiEnvelope {
    fn into_result(self) -> Result<Value, ExchangeError> {
        if self.ret_code != 0 {
            return Err(ExchangeError::from_rejection(self.ret_code, self.ret_msg));
        }
        Ok(self.result)
    }
}

/// Which way the mark has to cross the trigger for a protective order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TriggerDirection {
    Rises = 1,
    Falls = 2,
}

impl BybitClient {
    pub fn new(config: &BybitConfig) -> Result<Self, ExchangeError> {
        let auth = match (&config.api_key, &config.api_secret) {
            (Some(key), Some(secret)) if !key.is_empty() => {
                Some(BybitAuth::new(key.clone(), secret.clone()))
            }
            _ => None,
        };

        Ok(Self {
            client: Client::builder()
                .timeout(Duration::from_secs(config.http_timeout_secs))
                .build()?,
            auth,
            rest_url: config.rest_url.trim_end_matches('/').to_string(),
            recv_window: config.recv_window_ms,
            category: config.category.clone(),
            hedge_mode: config.hedge_mode,
        })
    }

    fn position_idx(&self, side: PositionSide) -> u8 {
        position_idx(self.hedge_mode, side)
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, ExchangeError> {
        let url = format!("{}{}", self.rest_url, path);
        let body_str = body.to_string();
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");

        if let Some(auth) = &self.auth {
            let timestamp = chrono::Utc::now().timestamp_millis();
            let sign = auth.sign_request(timestamp, self.recv_window, &body_str);
            request = request
                .header("X-BAPI-API-KEY", auth.api_key())
                .header("X-BAPI-SIGN", sign)
                .header("X-BAPI-SIGN-TYPE", "2")
                .header("X-BAPI-TIMESTAMP", timestamp.to_string())
                .header("X-BAPI-RECV-WINDOW", self.recv_window.to_string());
        }

        debug!(path, body = %body_str, "POST");
        let envelope: ApiEnvelope = request.body(body_str).send().await?.json().await?;
        envelope.into_result()
    }

    async fn get(&self, path: &str, params: &[(&str, &str)]) -> Result<Value, ExchangeError> {
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let url = format!("{}{}?{}", self.rest_url, path, query);
        let mut request = self.client.get(&url);

        if let Some(auth) = &self.auth {
            let timestamp = chrono::Utc::now().timestamp_millis();
            let sign = auth.sign_request(timestamp, self.recv_window, &query);
            request = request
                .header("X-BAPI-API-KEY", auth.api_key())
                .header("X-BAPI-SIGN", sign)
                .header("X-BAPI-SIGN-TYPE", "2")
                .header("X-BAPI-TIMESTAMP", timestamp.to_string())
                .header("X-BAPI-RECV-WINDOW", self.recv_window.to_string());
        }

        debug!(path, query = %query, "GET");
        let envelope: ApiEnvelope = request.send().await?.json().await?;
        envelope.into_result()
    }

    async fn place_protective(
        &self,
        symbol: &str,
        quantity: f64,
        trigger_price: f64,
        position_side: PositionSide,
        direction: TriggerDirection,
    ) -> Result<OrderAck, ExchangeError> {
        let body = protective_order_body(
            &self.category,
            symbol,
            quantity,
            trigger_price,
            position_side,
            direction,
            self.position_idx(position_side),
        )?;
        let result = self.post("/v5/order/create", body).await?;
        order_ack(&result)
    }
}

#[async_trait]
impl ExchangeClient for BybitClient {
    async fn get_market_data(&self, symbol: &str) -> Result<MarketSnapshot, ExchangeError> {
        let result = self
            .get(
                "/v5/market/tickers",
                &[("category", self.category.as_str()), ("symbol", symbol)],
            )
            .await?;
        parse_ticker(symbol, &result)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let body = entry_order_body(
            &self.category,
            request,
            self.position_idx(request.position_side),
        )?;
        let result = self.post("/v5/order/create", body).await?;
        order_ack(&result)
    }

    async fn get_position(&self, symbol: &str) -> Result<PositionSnapshot, ExchangeError> {
        let result = self
            .get(
                "/v5/position/list",
                &[("category", self.category.as_str()), ("symbol", symbol)],
            )
            .await?;
        parse_position(&result)
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        quantity: f64,
        price: f64,
        position_side: PositionSide,
    ) -> Result<OrderAck, ExchangeError> {
        let direction = match position_side {
            PositionSide::Long => TriggerDirection::Rises,
            PositionSide::Short => TriggerDirection::Falls,
        };
        self.place_protective(symbol, quantity, price, position_side, direction)
            .await
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        quantity: f64,
        stop_price: f64,
        position_side: PositionSide,
    ) -> Result<OrderAck, ExchangeError> {
        let direction = match position_side {
            PositionSide::Long => TriggerDirection::Falls,
            PositionSide::Short => TriggerDirection::Rises,
        };
        self.place_protective(symbol, quantity, stop_price, position_side, direction)
            .await
    }

    // Bybit identifies orders by id alone; the side only matters for
    // venues that scope cancels per position side.
    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        _position_side: PositionSide,
    ) -> Result<(), ExchangeError> {
        let body = json!({
            "category": self.category,
            "symbol": symbol,
            "orderId": order_id,
        });
        self.post("/v5/order/cancel", body).await?;
        Ok(())
    }
}

fn position_idx(hedge_mode: bool, side: PositionSide) -> u8 {
    match (hedge_mode, side) {
        (false, _) => 0,
        (true, PositionSide::Long) => 1,
        (true, PositionSide::Short) => 2,
    }
}

fn format_decimal(field: &str, value: f64) -> Result<String, ExchangeError> {
    // Bybit rejects exponent notation ("1e-5").
    let s = format!("{:.8}", value);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if !value.is_finite() || s.is_empty() || s == "0" || s == "-0" {
        return Err(ExchangeError::InvalidParameter(format!(
            "{} {} rounds to zero at 8 decimals",
            field, value
        )));
    }
    Ok(s.to_string())
}

fn entry_order_body(
    category: &str,
    request: &OrderRequest,
    position_idx: u8,
) -> Result<Value, ExchangeError> {
    let mut body = json!({
        "category": category,
        "symbol": request.symbol,
        "side": request.side.as_str(),
        "orderType": request.order_type.as_str(),
        "qty": format_decimal("qty", request.quantity)?,
        "positionIdx": position_idx,
    });

    if request.order_type == OrderType::Limit {
        if let Some(price) = request.price {
            body["price"] = json!(format_decimal("price", price)?);
            body["timeInForce"] = json!("GTC");
        }
    }

    Ok(body)
}

fn protective_order_body(
    category: &str,
    symbol: &str,
    quantity: f64,
    trigger_price: f64,
    position_side: PositionSide,
    direction: TriggerDirection,
    position_idx: u8,
) -> Result<Value, ExchangeError> {
    Ok(json!({
        "category": category,
        "symbol": symbol,
        "side": position_side.exit_side().as_str(),
        "orderType": "Market",
        "qty": format_decimal("qty", quantity)?,
        "triggerPrice": format_decimal("triggerPrice", trigger_price)?,
        "triggerDirection": direction as u8,
        "triggerBy": "LastPrice",
        "reduceOnly": true,
        "closeOnTrigger": true,
        "positionIdx": position_idx,
    }))
}

fn order_ack(result: &Value) -> Result<OrderAck, ExchangeError> {
    match result["orderId"].as_str() {
        Some(id) if !id.is_empty() => Ok(OrderAck::new(id)),
        _ => Err(ExchangeError::Decode(format!(
            "order response without orderId: {}",
            result
        ))),
    }
}

fn parse_number(value: &Value) -> f64 {
    match value {
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn parse_ticker(symbol: &str, result: &Value) -> Result<MarketSnapshot, ExchangeError> {
    let ticker = result["list"]
        .as_array()
        .and_then(|list| list.first())
        .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))?;

    Ok(MarketSnapshot {
        symbol: ticker["symbol"].as_str().unwrap_or(symbol).to_string(),
        last_price: parse_number(&ticker["lastPrice"]),
    })
}

/// In hedge mode Bybit lists both legs; the first one holding size wins.
fn parse_position(result: &Value) -> Result<PositionSnapshot, ExchangeError> {
    let list = result["list"]
        .as_array()
        .ok_or_else(|| ExchangeError::Decode(format!("position list missing: {}", result)))?;

    let Some(entry) = list.iter().find(|p| parse_number(&p["size"]) > 0.0) else {
        return Ok(PositionSnapshot::flat());
    };

    let hold_side = entry["side"].as_str().and_then(|s| match s.parse() {
        Ok(side) => Some(side),
        Err(_) => {
            warn!(side = s, "Unrecognised position side");
            None
        }
    });

    Ok(PositionSnapshot {
        size: parse_number(&entry["size"]),
        hold_side,
        entry_price: parse_number(&entry["avgPrice"]),
        unrealized_pnl: parse_number(&entry["unrealisedPnl"]),
        margin: parse_number(&entry["positionIM"]),
    })
}
