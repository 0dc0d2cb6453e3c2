use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::channels::{
    QuantityConfirmationRequest, QuantityPartialFillApproval, RealtimeChannel, RealtimeEvent,
    SecondaryChannel,
};
use crate::matching::{confirmation_key, quantity_mismatch};
use crate::models::{Order, Side};
use crate::timer::{TimerFired, TimerKind, TimerService};

const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitingSmaller,
    AwaitingLarger,
}

struct PendingConfirmation {
    asset: String,
    bid_id: u64,
    offer_id: u64,
    stage: Stage,
    smaller_party: Side,
    smaller_qty: u64,
    larger_qty: u64,
    price: Decimal,
    smaller_user_id: Uuid,
    larger_user_id: Uuid,
    smaller_order_id: u64,
    larger_order_id: u64,
}

/// What a caller must do after `Confirmations` processes a response.
pub enum Resolution {
    /// Nothing actionable yet; the state machine is still waiting.
    Pending,
    /// The smaller side accepted with a new quantity: persist it, reload
    /// both orders, then commit.
    UpsizeAndCommit {
        order_id: u64,
        new_quantity: u64,
        bid_id: u64,
        offer_id: u64,
    },
    /// The larger side accepted a partial fill: commit at `min(remaining)`.
    CommitPartial { bid_id: u64, offer_id: u64 },
    /// Both sides (or a timeout) ended the negotiation with no trade.
    Declined,
    /// The key was unknown or already resolved; ignore.
    Ignored,
}

/// Tracks every in-flight quantity confirmation and the permanent
/// declined-pairs set, keyed by (asset, bidOrderId, offerOrderId).
pub struct Confirmations<T: Send + 'static> {
    pending: HashMap<String, PendingConfirmation>,
    declined: HashSet<String>,
    timers: TimerService<T>,
}

impl<T: Send + 'static> Confirmations<T> {
    pub fn new(timers: TimerService<T>) -> Self {
        Self {
            pending: HashMap::new(),
            declined: HashSet::new(),
            timers,
        }
    }

    pub fn is_declined(&self, key: &str) -> bool {
        self.declined.contains(key)
    }

    pub fn is_pending(&self, bid_id: u64, offer_id: u64, asset: &str) -> bool {
        self.pending
            .contains_key(&confirmation_key(asset, bid_id, offer_id))
    }

    /// Resolves an 8-character order-id prefix (as carried by secondary
    /// channel responses) to the confirmation key soliciting it, by
    /// scanning pending confirmations for a matching side.
    pub fn resolve_prefix(&self, prefix: &str) -> Option<String> {
        self.pending
            .iter()
            .find(|(_, p)| {
                p.bid_id.to_string().starts_with(prefix) || p.offer_id.to_string().starts_with(prefix)
            })
            .map(|(key, _)| key.clone())
    }

    /// Lists the confirmation keys currently soliciting a response from
    /// `user_id`, i.e. whichever side's turn it presently is.
    pub fn pending_for_user(&self, user_id: Uuid) -> Vec<String> {
        self.pending
            .iter()
            .filter(|(_, p)| match p.stage {
                Stage::AwaitingSmaller => p.smaller_user_id == user_id,
                Stage::AwaitingLarger => p.larger_user_id == user_id,
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Opens a new confirmation for a price-matched, quantity-mismatched
    /// pair and notifies the smaller party.
    pub async fn open(
        &mut self,
        bid: &Order,
        offer: &Order,
        realtime: &dyn RealtimeChannel,
        secondary: &dyn SecondaryChannel,
    ) {
        let key = confirmation_key(&bid.asset, bid.id, offer.id);
        if self.declined.contains(&key) || self.pending.contains_key(&key) {
            return;
        }

        let mismatch = quantity_mismatch(bid, offer);
        let (smaller_order, larger_order) = match mismatch.smaller_party {
            Side::Bid => (bid, offer),
            Side::Offer => (offer, bid),
        };

        self.pending.insert(
            key.clone(),
            PendingConfirmation {
                asset: bid.asset.clone(),
                bid_id: bid.id,
                offer_id: offer.id,
                stage: Stage::AwaitingSmaller,
                smaller_party: mismatch.smaller_party,
                smaller_qty: mismatch.smaller_qty,
                larger_qty: mismatch.larger_qty,
                price: bid.price,
                smaller_user_id: smaller_order.user_id,
                larger_user_id: larger_order.user_id,
                smaller_order_id: smaller_order.id,
                larger_order_id: larger_order.id,
            },
        );
        self.timers
            .arm(TimerKind::SmallerTimeout, key.clone(), CONFIRMATION_TIMEOUT);

        let request = QuantityConfirmationRequest {
            confirmation_key: key,
            asset: bid.asset.clone(),
            your_order_id: smaller_order.id,
            counterparty_order_id: larger_order.id,
            your_quantity: mismatch.smaller_qty,
            counterparty_quantity: mismatch.larger_qty,
            additional_quantity: mismatch.additional_qty,
            price: bid.price,
            side: mismatch.smaller_party,
            message: format!(
                "Counterparty has {} lots, you have {}. Accept {} more lots?",
                mismatch.larger_qty, mismatch.smaller_qty, mismatch.additional_qty
            ),
        };
        realtime
            .notify_user(
                smaller_order.user_id,
                RealtimeEvent::QuantityConfirmationRequest(request.clone()),
            )
            .await;
        secondary
            .send_message(smaller_order.user_id, request.message.clone())
            .await;
    }

    /// A response keyed by confirmation key, `accepted`, and (for the
    /// smaller-side acceptance path only) a replacement quantity.
    pub async fn respond(
        &mut self,
        key: &str,
        accepted: bool,
        new_quantity: Option<u64>,
        realtime: &dyn RealtimeChannel,
        secondary: &dyn SecondaryChannel,
    ) -> Resolution {
        let Some(stage) = self.pending.get(key).map(|p| p.stage) else {
            return Resolution::Ignored;
        };

        match stage {
            Stage::AwaitingSmaller => {
                self.timers.cancel(TimerKind::SmallerTimeout, key);
                if accepted {
                    let pending = self.pending.remove(key).expect("checked above");
                    let new_quantity = new_quantity.unwrap_or(pending.larger_qty);
                    info!(confirmation_key = key, new_quantity, "smaller side accepted upsize");
                    Resolution::UpsizeAndCommit {
                        order_id: pending.smaller_order_id,
                        new_quantity,
                        bid_id: pending.bid_id,
                        offer_id: pending.offer_id,
                    }
                } else {
                    self.advance_to_larger(key, realtime, secondary).await;
                    Resolution::Pending
                }
            }
            Stage::AwaitingLarger => {
                self.timers.cancel(TimerKind::LargerTimeout, key);
                let pending = self.pending.remove(key).expect("checked above");
                if accepted {
                    info!(confirmation_key = key, "larger side accepted partial fill");
                    Resolution::CommitPartial {
                        bid_id: pending.bid_id,
                        offer_id: pending.offer_id,
                    }
                } else {
                    self.declined.insert(key.to_string());
                    warn!(confirmation_key = key, "both sides declined, pair blacklisted");
                    Resolution::Declined
                }
            }
        }
    }

    /// Called when a timer fires; resolves exactly as an explicit decline
    /// would at whichever stage is current, or no-ops if the key already
    /// resolved.
    pub async fn handle_timeout(
        &mut self,
        fired: &TimerFired,
        realtime: &dyn RealtimeChannel,
        secondary: &dyn SecondaryChannel,
    ) -> Resolution {
        if !self.pending.contains_key(&fired.key) {
            return Resolution::Ignored;
        }
        self.respond(&fired.key, false, None, realtime, secondary).await
    }

    async fn advance_to_larger(
        &mut self,
        key: &str,
        realtime: &dyn RealtimeChannel,
        secondary: &dyn SecondaryChannel,
    ) {
        let Some(pending) = self.pending.get_mut(key) else {
            return;
        };
        pending.stage = Stage::AwaitingLarger;
        self.timers
            .arm(TimerKind::LargerTimeout, key.to_string(), CONFIRMATION_TIMEOUT);

        let pending = self.pending.get(key).expect("just inserted");
        let larger_party = pending.smaller_party.opposite();
        let message = format!(
            "Counterparty can only fill {} lots. Accept a partial fill?",
            pending.smaller_qty
        );
        let request = QuantityPartialFillApproval {
            confirmation_key: key.to_string(),
            asset: pending.asset.clone(),
            your_order_id: pending.larger_order_id,
            counterparty_order_id: pending.smaller_order_id,
            your_quantity: pending.larger_qty,
            partial_fill_quantity: pending.smaller_qty,
            price: pending.price,
            side: larger_party,
            message: message.clone(),
        };
        let larger_user_id = pending.larger_user_id;

        realtime
            .notify_user(
                larger_user_id,
                RealtimeEvent::QuantityPartialFillApproval(request),
            )
            .await;
        secondary.send_message(larger_user_id, message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{NullRealtimeChannel, NullSecondaryChannel};
    use crate::models::OrderStatus;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    fn order(id: u64, side: Side, remaining: u64) -> Order {
        Order {
            id,
            side,
            asset: "BAD".into(),
            price: dec!(10.00),
            original_amount: remaining,
            remaining,
            matched: false,
            status: OrderStatus::Active,
            user_id: Uuid::new_v4(),
            counterparty_id: None,
            created_at: Utc::now(),
        }
    }

    fn confirmations() -> Confirmations<()> {
        let (tx, _rx) = mpsc::channel(8);
        Confirmations::new(TimerService::new(tx, |_| ()))
    }

    #[tokio::test]
    async fn smaller_accepts_resolves_to_upsize() {
        let mut confirmations = confirmations();
        let bid = order(1, Side::Bid, 3);
        let offer = order(2, Side::Offer, 7);
        let realtime = NullRealtimeChannel;
        let secondary = NullSecondaryChannel;

        confirmations.open(&bid, &offer, &realtime, &secondary).await;
        let key = confirmation_key("BAD", 1, 2);
        assert!(confirmations.is_pending(1, 2, "BAD"));

        match confirmations
            .respond(&key, true, Some(7), &realtime, &secondary)
            .await
        {
            Resolution::UpsizeAndCommit { order_id, new_quantity, bid_id, offer_id } => {
                assert_eq!(order_id, 1);
                assert_eq!(new_quantity, 7);
                assert_eq!(bid_id, 1);
                assert_eq!(offer_id, 2);
            }
            _ => panic!("expected upsize"),
        }
        assert!(!confirmations.is_pending(1, 2, "BAD"));
    }

    #[tokio::test]
    async fn smaller_declines_then_larger_accepts_partial() {
        let mut confirmations = confirmations();
        let bid = order(1, Side::Bid, 2);
        let offer = order(2, Side::Offer, 5);
        let realtime = NullRealtimeChannel;
        let secondary = NullSecondaryChannel;

        confirmations.open(&bid, &offer, &realtime, &secondary).await;
        let key = confirmation_key("BAD", 1, 2);

        confirmations
            .respond(&key, false, None, &realtime, &secondary)
            .await;
        assert!(confirmations.is_pending(1, 2, "BAD"));

        match confirmations
            .respond(&key, true, None, &realtime, &secondary)
            .await
        {
            Resolution::CommitPartial { bid_id, offer_id } => {
                assert_eq!(bid_id, 1);
                assert_eq!(offer_id, 2);
            }
            _ => panic!("expected commit partial"),
        }
    }

    #[tokio::test]
    async fn both_decline_blacklists_pair() {
        let mut confirmations = confirmations();
        let bid = order(1, Side::Bid, 2);
        let offer = order(2, Side::Offer, 5);
        let realtime = NullRealtimeChannel;
        let secondary = NullSecondaryChannel;

        confirmations.open(&bid, &offer, &realtime, &secondary).await;
        let key = confirmation_key("BAD", 1, 2);
        confirmations
            .respond(&key, false, None, &realtime, &secondary)
            .await;
        let resolution = confirmations
            .respond(&key, false, None, &realtime, &secondary)
            .await;
        assert!(matches!(resolution, Resolution::Declined));
        assert!(confirmations.is_declined(&key));

        confirmations.open(&bid, &offer, &realtime, &secondary).await;
        assert!(!confirmations.is_pending(1, 2, "BAD"));
    }
}
