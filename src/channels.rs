use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use chrono::{DateTime, Utc};

use crate::models::{MatchType, Side};

#[derive(Debug, Clone, Serialize)]
pub struct NegotiationYourTurn {
    pub asset: String,
    pub best_bid_price: Decimal,
    pub best_offer_price: Decimal,
    pub best_bid_user_id: Uuid,
    pub best_offer_user_id: Uuid,
    pub best_bid_username: String,
    pub best_offer_username: String,
    pub turn: Side,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuantityConfirmationRequest {
    pub confirmation_key: String,
    pub asset: String,
    pub your_order_id: u64,
    pub counterparty_order_id: u64,
    pub your_quantity: u64,
    pub counterparty_quantity: u64,
    pub additional_quantity: u64,
    pub price: Decimal,
    pub side: Side,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuantityPartialFillApproval {
    pub confirmation_key: String,
    pub asset: String,
    pub your_order_id: u64,
    pub counterparty_order_id: u64,
    pub your_quantity: u64,
    pub partial_fill_quantity: u64,
    pub price: Decimal,
    pub side: Side,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeExecuted {
    pub order_id: u64,
    pub asset: String,
    pub price: Decimal,
    pub amount: u64,
    pub trade_id: u64,
    pub side: Side,
    pub is_fully_filled: bool,
    pub is_partial_fill: bool,
    pub remaining_amount: u64,
    pub original_amount: u64,
}

/// Legacy full-match notification, same shape as `TradeExecuted` minus the
/// partial-fill fields.
#[derive(Debug, Clone, Serialize)]
pub struct OrderMatched {
    pub order_id: u64,
    pub asset: String,
    pub price: Decimal,
    pub amount: u64,
    pub trade_id: u64,
    pub side: Side,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketUpdate {
    pub asset: String,
    pub best_bid: Option<Decimal>,
    pub best_offer: Option<Decimal>,
    pub message: String,
}

/// The pub/sub payload published on the `trade:executed` key, carrying the
/// full settlement shape (both sides' fill status) rather than the
/// per-order view a single user receives.
#[derive(Debug, Clone, Serialize)]
pub struct TradeExecutedEvent {
    pub trade_id: u64,
    pub asset: String,
    pub price: Decimal,
    pub amount: u64,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub bid_order_id: u64,
    pub offer_order_id: u64,
    pub bid_fully_matched: bool,
    pub offer_fully_matched: bool,
    pub match_type: MatchType,
    pub partial_fill: bool,
}

/// A realtime event addressed to one user. Named variants, not a
/// dictionary, per the no-bag-of-fields redesign note.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum RealtimeEvent {
    #[serde(rename = "negotiation:your_turn")]
    NegotiationYourTurn(NegotiationYourTurn),
    #[serde(rename = "quantity:confirmation_request")]
    QuantityConfirmationRequest(QuantityConfirmationRequest),
    #[serde(rename = "quantity:partial_fill_approval")]
    QuantityPartialFillApproval(QuantityPartialFillApproval),
    #[serde(rename = "trade:executed")]
    TradeExecuted(TradeExecuted),
    #[serde(rename = "order:matched")]
    OrderMatched(OrderMatched),
}

/// The realtime push channel: per-user addressed events, fire-and-forget.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn notify_user(&self, user_id: Uuid, event: RealtimeEvent);
    async fn broadcast_market_update(&self, update: MarketUpdate);
}

/// The out-of-band secondary channel: best-effort plain-text messages,
/// must never block the serialization domain.
#[async_trait]
pub trait SecondaryChannel: Send + Sync {
    async fn send_message(&self, user_id: Uuid, text: String);
}

/// The order-book projection service, invoked only as "refresh projection
/// for asset A" per scope.
#[async_trait]
pub trait ProjectionService: Send + Sync {
    async fn refresh(&self, asset: &str);
}

/// No-op implementations used when a host process hasn't wired real
/// channels yet, and by tests that don't assert on notification content.
pub struct NullRealtimeChannel;

#[async_trait]
impl RealtimeChannel for NullRealtimeChannel {
    async fn notify_user(&self, _user_id: Uuid, _event: RealtimeEvent) {}
    async fn broadcast_market_update(&self, _update: MarketUpdate) {}
}

pub struct NullSecondaryChannel;

#[async_trait]
impl SecondaryChannel for NullSecondaryChannel {
    async fn send_message(&self, _user_id: Uuid, _text: String) {}
}

pub struct NullProjectionService;

#[async_trait]
impl ProjectionService for NullProjectionService {
    async fn refresh(&self, _asset: &str) {}
}
