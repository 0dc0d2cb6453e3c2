use std::sync::Arc;

use rust_decimal::Decimal;

use crate::models::{Order, Side};

/// What the per-asset decision (§4.2) concluded for one tick.
pub enum Decision {
    /// Either side had no active orders.
    NoOrders,
    /// Prices match (or the book is crossed) and quantities agree, or the
    /// book is crossed — either way, commit straight away.
    Commit { bid: Arc<Order>, offer: Arc<Order> },
    /// Prices match but quantities differ: the quantity confirmation
    /// protocol must run before anything commits.
    NeedsConfirmation { bid: Arc<Order>, offer: Arc<Order> },
    /// Best bid is below best offer: the negotiation protocol applies.
    Negotiate { bid: Arc<Order>, offer: Arc<Order> },
}

fn best_bid(orders: &[Arc<Order>]) -> Option<Arc<Order>> {
    orders
        .iter()
        .filter(|o| o.side == Side::Bid)
        .min_by(|a, b| {
            // Highest price first, earliest created_at breaks ties.
            b.price.cmp(&a.price).then(a.created_at.cmp(&b.created_at))
        })
        .cloned()
}

fn best_offer(orders: &[Arc<Order>]) -> Option<Arc<Order>> {
    orders
        .iter()
        .filter(|o| o.side == Side::Offer)
        .min_by(|a, b| a.price.cmp(&b.price).then(a.created_at.cmp(&b.created_at)))
        .cloned()
}

/// The per-asset decision (§4.2), given that asset's active orders.
pub fn decide(orders: &[Arc<Order>]) -> Decision {
    let (Some(bid), Some(offer)) = (best_bid(orders), best_offer(orders)) else {
        return Decision::NoOrders;
    };

    if bid.price == offer.price {
        if bid.remaining == offer.remaining {
            Decision::Commit { bid, offer }
        } else {
            Decision::NeedsConfirmation { bid, offer }
        }
    } else if bid.price < offer.price {
        Decision::Negotiate { bid, offer }
    } else {
        // Crossing book: should not occur given invariants, but the policy
        // is unambiguous — commit defensively at the offer's price.
        Decision::Commit { bid, offer }
    }
}

/// `(asset, bidOrderId, offerOrderId)` — unique identity of a quantity
/// confirmation interaction.
pub fn confirmation_key(asset: &str, bid_order_id: u64, offer_order_id: u64) -> String {
    format!("{asset}:{bid_order_id}:{offer_order_id}")
}

/// Which side of a price-matched, quantity-mismatched pair is smaller, and
/// by how much.
pub struct QuantityMismatch {
    pub smaller_party: Side,
    pub smaller_qty: u64,
    pub larger_qty: u64,
    pub additional_qty: u64,
}

pub fn quantity_mismatch(bid: &Order, offer: &Order) -> QuantityMismatch {
    if bid.remaining < offer.remaining {
        QuantityMismatch {
            smaller_party: Side::Bid,
            smaller_qty: bid.remaining,
            larger_qty: offer.remaining,
            additional_qty: offer.remaining - bid.remaining,
        }
    } else {
        QuantityMismatch {
            smaller_party: Side::Offer,
            smaller_qty: offer.remaining,
            larger_qty: bid.remaining,
            additional_qty: bid.remaining - offer.remaining,
        }
    }
}

/// The competitive-bidding advisory (§4.7): only sent when the spread is
/// within the configured ceiling, and only over the secondary channel.
pub struct Advisory {
    pub spread: Decimal,
    pub spread_pct: Decimal,
}

pub fn competitive_bidding_advisory(
    bid_price: Decimal,
    offer_price: Decimal,
    spread_pct_ceiling: Decimal,
) -> Option<Advisory> {
    if bid_price.is_zero() {
        return None;
    }
    let spread = offer_price - bid_price;
    let spread_pct = spread / bid_price * Decimal::from(100);
    if spread_pct <= spread_pct_ceiling {
        Some(Advisory { spread, spread_pct })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderStatus;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn order(id: u64, side: Side, price: Decimal, remaining: u64) -> Arc<Order> {
        Arc::new(Order {
            id,
            side,
            asset: "BAD".into(),
            price,
            original_amount: remaining,
            remaining,
            matched: false,
            status: OrderStatus::Active,
            user_id: Uuid::new_v4(),
            counterparty_id: None,
            created_at: Utc::now(),
        })
    }

    #[test]
    fn exact_match_commits() {
        let orders = vec![
            order(1, Side::Bid, dec!(100.00), 5),
            order(2, Side::Offer, dec!(100.00), 5),
        ];
        match decide(&orders) {
            Decision::Commit { bid, offer } => {
                assert_eq!(bid.id, 1);
                assert_eq!(offer.id, 2);
            }
            _ => panic!("expected commit"),
        }
    }

    #[test]
    fn quantity_mismatch_needs_confirmation() {
        let orders = vec![
            order(1, Side::Bid, dec!(50.00), 3),
            order(2, Side::Offer, dec!(50.00), 7),
        ];
        match decide(&orders) {
            Decision::NeedsConfirmation { bid, offer } => {
                let m = quantity_mismatch(&bid, &offer);
                assert_eq!(m.smaller_party, Side::Bid);
                assert_eq!(m.smaller_qty, 3);
                assert_eq!(m.larger_qty, 7);
                assert_eq!(m.additional_qty, 4);
            }
            _ => panic!("expected needs confirmation"),
        }
    }

    #[test]
    fn gap_triggers_negotiation() {
        let orders = vec![
            order(1, Side::Bid, dec!(9.50), 1),
            order(2, Side::Offer, dec!(10.00), 1),
        ];
        assert!(matches!(decide(&orders), Decision::Negotiate { .. }));
    }

    #[test]
    fn crossing_book_commits_defensively() {
        let orders = vec![
            order(1, Side::Bid, dec!(101.00), 5),
            order(2, Side::Offer, dec!(100.00), 5),
        ];
        assert!(matches!(decide(&orders), Decision::Commit { .. }));
    }

    #[test]
    fn advisory_suppressed_past_ceiling() {
        assert!(competitive_bidding_advisory(dec!(10), dec!(15), dec!(20)).is_none());
        assert!(competitive_bidding_advisory(dec!(10), dec!(11), dec!(20)).is_some());
    }
}
