use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which side of the book an order sits on. A `Bid` is a buy order, an
/// `Offer` is a sell order — kept as a tagged enum rather than a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Offer,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Bid => Side::Offer,
            Side::Offer => Side::Bid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Active,
    Matched,
    Cancelled,
    Expired,
}

/// A live or resolved order. `price` is a two-decimal `Decimal`, never
/// `f64`: a mispriced trade here is a real-money bug, not a display
/// glitch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub side: Side,
    pub asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    pub original_amount: u64,
    pub remaining: u64,
    pub matched: bool,
    pub status: OrderStatus,
    pub user_id: Uuid,
    pub counterparty_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// 0 <= remaining <= original_amount and (remaining == 0) <=> matched
    /// <=> (status == Matched).
    pub fn check_invariant(&self) -> bool {
        let zero_iff_matched = (self.remaining == 0) == self.matched;
        let matched_iff_status = self.matched == (self.status == OrderStatus::Matched);
        self.remaining <= self.original_amount && zero_iff_matched && matched_iff_status
    }
}

/// How a committed trade relates to the two orders' original sizes. Used to
/// drive both the persisted record and the `trade:executed` event's
/// `partialFill` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchType {
    FullMatch,
    PartialFillBuyer,
    PartialFillSeller,
}

impl MatchType {
    pub fn classify(bid_original: u64, offer_original: u64) -> MatchType {
        use std::cmp::Ordering;
        match bid_original.cmp(&offer_original) {
            Ordering::Equal => MatchType::FullMatch,
            Ordering::Less => MatchType::PartialFillBuyer,
            Ordering::Greater => MatchType::PartialFillSeller,
        }
    }

    pub fn is_partial_fill(self) -> bool {
        self != MatchType::FullMatch
    }
}

/// An immutable record of a committed match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    pub amount: u64,
    pub buyer_order_id: u64,
    pub seller_order_id: u64,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    #[serde(with = "rust_decimal::serde::str")]
    pub commission: Decimal,
    pub match_type: MatchType,
    pub created_at: DateTime<Utc>,
}

/// A registered user as the store knows it — enough for notifications.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub secondary_channel_address: Option<String>,
}
