use std::collections::HashMap;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use crate::channels::{NegotiationYourTurn, RealtimeChannel, RealtimeEvent, SecondaryChannel};
use crate::models::{Order, Side};
use crate::timer::{TimerFired, TimerKind, TimerService};

const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

struct NegotiationState {
    bid_id: u64,
    offer_id: u64,
    bid_price: Decimal,
    offer_price: Decimal,
    bid_user_id: Uuid,
    offer_user_id: Uuid,
    turn: Side,
}

/// What the caller must do after `Negotiations` reacts to a tick or a
/// response.
pub enum Outcome {
    /// No action beyond whatever was already emitted.
    None,
    /// The user whose turn it is asked to improve their price.
    ImprovePrice { order_id: u64, new_price: Decimal },
    /// The negotiation ended (pass or timeout); broadcast the update.
    Ended { asset: String, bid_price: Decimal, offer_price: Decimal },
}

/// One negotiation per asset: tracks whose turn it is to close a bid/offer
/// gap, per [`crate::matching::Decision::Negotiate`].
pub struct Negotiations<T: Send + 'static> {
    state: HashMap<String, NegotiationState>,
    timers: TimerService<T>,
}

impl<T: Send + 'static> Negotiations<T> {
    pub fn new(timers: TimerService<T>) -> Self {
        Self {
            state: HashMap::new(),
            timers,
        }
    }

    pub fn is_active(&self, asset: &str) -> bool {
        self.state.contains_key(asset)
    }

    /// Reconciles negotiation state for `asset` against the current best
    /// bid/offer, opening, replacing, or leaving it undisturbed, and
    /// re-notifying whenever the turn changes.
    pub async fn reconcile(
        &mut self,
        asset: &str,
        bid: &Order,
        offer: &Order,
        realtime: &dyn RealtimeChannel,
        secondary: &dyn SecondaryChannel,
    ) {
        match self.state.get(asset) {
            None => {
                self.open(asset, bid, offer, Side::Offer, realtime, secondary).await;
            }
            Some(existing) if existing.bid_id != bid.id => {
                self.open(asset, bid, offer, Side::Offer, realtime, secondary).await;
            }
            Some(existing) if existing.offer_id != offer.id => {
                self.open(asset, bid, offer, Side::Bid, realtime, secondary).await;
            }
            Some(_) => {}
        }
    }

    async fn open(
        &mut self,
        asset: &str,
        bid: &Order,
        offer: &Order,
        turn: Side,
        realtime: &dyn RealtimeChannel,
        secondary: &dyn SecondaryChannel,
    ) {
        self.state.insert(
            asset.to_string(),
            NegotiationState {
                bid_id: bid.id,
                offer_id: offer.id,
                bid_price: bid.price,
                offer_price: offer.price,
                bid_user_id: bid.user_id,
                offer_user_id: offer.user_id,
                turn,
            },
        );
        self.timers
            .arm(TimerKind::NegotiationTimeout, asset.to_string(), NEGOTIATION_TIMEOUT);
        self.notify_turn(asset, bid, offer, realtime, secondary).await;
    }

    async fn notify_turn(
        &self,
        asset: &str,
        bid: &Order,
        offer: &Order,
        realtime: &dyn RealtimeChannel,
        secondary: &dyn SecondaryChannel,
    ) {
        let Some(state) = self.state.get(asset) else {
            return;
        };
        let message = format!(
            "Bid {} / Offer {} on {asset}: your turn to improve or pass.",
            bid.price, offer.price
        );
        let event = NegotiationYourTurn {
            asset: asset.to_string(),
            best_bid_price: bid.price,
            best_offer_price: offer.price,
            best_bid_user_id: bid.user_id,
            best_offer_user_id: offer.user_id,
            best_bid_username: String::new(),
            best_offer_username: String::new(),
            turn: state.turn,
            message: message.clone(),
        };
        let turn_user = match state.turn {
            Side::Bid => state.bid_user_id,
            Side::Offer => state.offer_user_id,
        };
        realtime
            .notify_user(turn_user, RealtimeEvent::NegotiationYourTurn(event))
            .await;
        secondary.send_message(turn_user, message).await;
    }

    /// A response from `user_id`; `improved` with an optional `new_price`,
    /// or a pass when `improved` is false. Ignored if it isn't that user's
    /// turn or the asset has no active negotiation.
    pub async fn respond(
        &mut self,
        asset: &str,
        user_id: Uuid,
        improved: bool,
        new_price: Option<Decimal>,
        realtime: &dyn RealtimeChannel,
        secondary: &dyn SecondaryChannel,
    ) -> Outcome {
        let Some(state) = self.state.get(asset) else {
            return Outcome::None;
        };
        let turn_user = match state.turn {
            Side::Bid => state.bid_user_id,
            Side::Offer => state.offer_user_id,
        };
        if turn_user != user_id {
            return Outcome::None;
        }

        if !improved {
            return self.end(asset);
        }

        if let Some(new_price) = new_price {
            let order_id = match state.turn {
                Side::Bid => state.bid_id,
                Side::Offer => state.offer_id,
            };
            self.timers.cancel(TimerKind::NegotiationTimeout, asset);
            self.state.remove(asset);
            info!(asset, order_id, %new_price, "negotiation price improved");
            Outcome::ImprovePrice { order_id, new_price }
        } else {
            let turn = self.toggle_turn(asset);
            if let Some(turn) = turn {
                let state = self.state.get(asset).unwrap();
                let (bid_price, offer_price) = (state.bid_price, state.offer_price);
                let (bid_user, offer_user) = (state.bid_user_id, state.offer_user_id);
                self.timers
                    .arm(TimerKind::NegotiationTimeout, asset.to_string(), NEGOTIATION_TIMEOUT);
                let turn_user = match turn {
                    Side::Bid => bid_user,
                    Side::Offer => offer_user,
                };
                let message = format!("Bid {bid_price} / Offer {offer_price} on {asset}: your turn.");
                realtime
                    .notify_user(
                        turn_user,
                        RealtimeEvent::NegotiationYourTurn(NegotiationYourTurn {
                            asset: asset.to_string(),
                            best_bid_price: bid_price,
                            best_offer_price: offer_price,
                            best_bid_user_id: bid_user,
                            best_offer_user_id: offer_user,
                            best_bid_username: String::new(),
                            best_offer_username: String::new(),
                            turn,
                            message: message.clone(),
                        }),
                    )
                    .await;
                secondary.send_message(turn_user, message).await;
            }
            Outcome::None
        }
    }

    /// Called when a negotiation timer fires; equivalent to a pass.
    pub fn handle_timeout(&mut self, fired: &TimerFired) -> Outcome {
        if !self.state.contains_key(&fired.key) {
            return Outcome::None;
        }
        self.end(&fired.key)
    }

    fn toggle_turn(&mut self, asset: &str) -> Option<Side> {
        let state = self.state.get_mut(asset)?;
        state.turn = state.turn.opposite();
        Some(state.turn)
    }

    fn end(&mut self, asset: &str) -> Outcome {
        self.timers.cancel(TimerKind::NegotiationTimeout, asset);
        let Some(state) = self.state.remove(asset) else {
            return Outcome::None;
        };
        Outcome::Ended {
            asset: asset.to_string(),
            bid_price: state.bid_price,
            offer_price: state.offer_price,
        }
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

    fn order(id: u64, side: Side, price: Decimal) -> Order {
        Order {
            id,
            side,
            asset: "BAD".into(),
            price,
            original_amount: 1,
            remaining: 1,
            matched: false,
            status: OrderStatus::Active,
            user_id: Uuid::new_v4(),
            counterparty_id: None,
            created_at: Utc::now(),
        }
    }

    fn negotiations() -> Negotiations<()> {
        let (tx, _rx) = mpsc::channel(8);
        Negotiations::new(TimerService::new(tx, |_| ()))
    }

    #[tokio::test]
    async fn pass_ends_with_market_update() {
        let mut negotiations = negotiations();
        let bid = order(1, Side::Bid, dec!(9.50));
        let offer = order(2, Side::Offer, dec!(10.00));
        let realtime = NullRealtimeChannel;
        let secondary = NullSecondaryChannel;

        negotiations
            .reconcile("BAD", &bid, &offer, &realtime, &secondary)
            .await;
        assert!(negotiations.is_active("BAD"));

        let outcome = negotiations
            .respond("BAD", offer.user_id, false, None, &realtime, &secondary)
            .await;
        assert!(matches!(outcome, Outcome::Ended { .. }));
        assert!(!negotiations.is_active("BAD"));
    }

    #[tokio::test]
    async fn improve_with_price_ends_negotiation_for_rescan() {
        let mut negotiations = negotiations();
        let bid = order(1, Side::Bid, dec!(9.50));
        let offer = order(2, Side::Offer, dec!(10.00));
        let realtime = NullRealtimeChannel;
        let secondary = NullSecondaryChannel;

        negotiations
            .reconcile("BAD", &bid, &offer, &realtime, &secondary)
            .await;

        let outcome = negotiations
            .respond("BAD", offer.user_id, true, Some(dec!(9.50)), &realtime, &secondary)
            .await;
        match outcome {
            Outcome::ImprovePrice { order_id, new_price } => {
                assert_eq!(order_id, 2);
                assert_eq!(new_price, dec!(9.50));
            }
            _ => panic!("expected improve price"),
        }
        assert!(!negotiations.is_active("BAD"));
    }

    #[tokio::test]
    async fn wrong_side_response_ignored() {
        let mut negotiations = negotiations();
        let bid = order(1, Side::Bid, dec!(9.50));
        let offer = order(2, Side::Offer, dec!(10.00));
        let realtime = NullRealtimeChannel;
        let secondary = NullSecondaryChannel;

        negotiations
            .reconcile("BAD", &bid, &offer, &realtime, &secondary)
            .await;
        // Turn is OFFER's; bid user's response must be ignored.
        let outcome = negotiations
            .respond("BAD", bid.user_id, false, None, &realtime, &secondary)
            .await;
        assert!(matches!(outcome, Outcome::None));
        assert!(negotiations.is_active("BAD"));
    }
}
