//! Typed payloads for frequently used public topics
//!
//! Payloads stay opaque on the wire; these are opt-in decodings via
//! [`StreamMessage::decode`](crate::StreamMessage::decode).

use rust_decimal::Decimal;
use serde::Deserialize;

/// Payload of `/market/ticker:{symbol}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerData {
    /// Server sequence number
    pub sequence: String,
    /// Last traded price
    pub price: Decimal,
    /// Last traded size
    pub size: Decimal,
    /// Best ask price
    pub best_ask: Decimal,
    /// Best ask size
    pub best_ask_size: Decimal,
    /// Best bid price
    pub best_bid: Decimal,
    /// Best bid size
    pub best_bid_size: Decimal,
    /// Matching engine time in milliseconds
    #[serde(default)]
    pub time: Option<u64>,
}

impl TickerData {
    /// Best ask minus best bid
    pub fn spread(&self) -> Decimal {
        self.best_ask - self.best_bid
    }
}

/// Payload of `/market/match:{symbol}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeMatch {
    /// Server sequence number
    pub sequence: String,
    /// Instrument
    pub symbol: String,
    /// Taker side, "buy" or "sell"
    pub side: String,
    /// Trade size
    pub size: Decimal,
    /// Trade price
    pub price: Decimal,
    /// Taker order id
    #[serde(default)]
    pub taker_order_id: Option<String>,
    /// Maker order id
    #[serde(default)]
    pub maker_order_id: Option<String>,
    /// Trade id
    #[serde(default)]
    pub trade_id: Option<String>,
    /// Trade time in nanoseconds, as a string
    #[serde(default)]
    pub time: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamMessage;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_decode_ticker() {
        let msg = StreamMessage {
            topic: "/market/ticker:BTC-USDT".to_string(),
            subject: Some("trade.ticker".to_string()),
            channel_type: None,
            data: json!({
                "sequence": "1545896668986",
                "bestAsk": "0.08",
                "size": "0.011",
                "bestBidSize": "0.036",
                "price": "0.08",
                "bestAskSize": "0.18",
                "bestBid": "0.049"
            }),
        };

        let ticker: TickerData = msg.decode().unwrap();
        assert_eq!(ticker.price, dec!(0.08));
        assert_eq!(ticker.spread(), dec!(0.031));
        assert_eq!(ticker.time, None);
    }

    #[test]
    fn test_decode_match() {
        let msg = StreamMessage {
            topic: "/market/match:BTC-USDT".to_string(),
            subject: Some("trade.l3match".to_string()),
            channel_type: None,
            data: json!({
                "sequence": "1545896669145",
                "type": "match",
                "symbol": "BTC-USDT",
                "side": "buy",
                "price": "0.08200000000000000000",
                "size": "0.01022222000000000000",
                "tradeId": "5c24c5da03aa673885cd67aa",
                "takerOrderId": "5c24c5d903aa6772d55b371e",
                "makerOrderId": "5c2187d003aa677bd09d5c93",
                "time": "1545913818099033203"
            }),
        };

        let trade: TradeMatch = msg.decode().unwrap();
        assert_eq!(trade.symbol, "BTC-USDT");
        assert_eq!(trade.price, dec!(0.082));
        assert_eq!(trade.trade_id.as_deref(), Some("5c24c5da03aa673885cd67aa"));
    }
}
