use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::cache::SnapshotCache;
use crate::channels::{MarketUpdate, ProjectionService, RealtimeChannel, SecondaryChannel};
use crate::committer::Committer;
use crate::config::EngineConfig;
use crate::confirmation::{Confirmations, Resolution};
use crate::kv::{KeyValueStore, KEY_HAS_ACTIVE_ORDERS, KEY_LAST_RUN};
use crate::matching::{self, Decision};
use crate::models::Order;
use crate::negotiation::{Negotiations, Outcome as NegotiationOutcome};
use crate::store::OrderStore;
use crate::timer::{TimerFired, TimerService};

/// Top-10 order-book view returned by `getOrderBook`; reconstructed from the
/// store on every call, never cached.
#[derive(Debug, Clone, Serialize)]
pub struct OrderBookLevel {
    pub order_id: u64,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    pub remaining: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderBookView {
    pub asset: String,
    pub bids: Vec<OrderBookLevel>,
    pub offers: Vec<OrderBookLevel>,
    pub total_bid_quantity: u64,
    pub total_offer_quantity: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Messages the actor loop serializes through its single inbox. Every
/// request carries its own `oneshot` reply channel; internal messages
/// (`Tick`, `TimerFired`) have none.
pub enum EngineMessage {
    ProcessAsset {
        asset: String,
        respond_to: oneshot::Sender<()>,
    },
    HandleNegotiationResponse {
        asset: String,
        user_id: Uuid,
        improved: bool,
        new_price: Option<Decimal>,
        respond_to: oneshot::Sender<()>,
    },
    HandleQuantityConfirmationResponse {
        confirmation_key: String,
        accepted: bool,
        new_quantity: Option<u64>,
        respond_to: oneshot::Sender<()>,
    },
    MarkActiveOrders {
        respond_to: oneshot::Sender<()>,
    },
    GetOrderBook {
        asset: String,
        respond_to: oneshot::Sender<OrderBookView>,
    },
    ResolveConfirmationPrefix {
        prefix: String,
        respond_to: oneshot::Sender<Option<String>>,
    },
    PendingConfirmationsForUser {
        user_id: Uuid,
        respond_to: oneshot::Sender<Vec<String>>,
    },
    Tick,
    TimerFired(TimerFired),
}

/// The core's external collaborators, bundled so `MatchingEngine::start`
/// takes one argument per concern instead of a long positional list.
pub struct EngineDeps {
    pub store: Arc<dyn OrderStore>,
    pub kv: Arc<dyn KeyValueStore>,
    pub realtime: Arc<dyn RealtimeChannel>,
    pub secondary: Arc<dyn SecondaryChannel>,
    pub projection: Arc<dyn ProjectionService>,
}

/// A thin handle to the running actor: every call sends a message and
/// awaits its `oneshot` reply, so the core's public API never touches the
/// engine's state directly.
#[derive(Clone)]
pub struct MatchingEngine {
    sender: mpsc::Sender<EngineMessage>,
}

impl MatchingEngine {
    /// Spawns the actor loop and a periodic ticker, and returns the handle.
    pub fn start(deps: EngineDeps, config: EngineConfig) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let tick_tx = tx.clone();
        let tick_interval = config.tick_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            loop {
                interval.tick().await;
                if tick_tx.send(EngineMessage::Tick).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(run_matching_engine(rx, tx.clone(), deps, config));

        Self { sender: tx }
    }

    /// Stops the engine by dropping its sender; the actor loop ends the
    /// next time its inbox drains.
    pub fn stop(self) {
        drop(self.sender);
    }

    pub async fn process_asset(&self, asset: impl Into<String>) {
        let (respond_to, rx) = oneshot::channel();
        let _ = self
            .sender
            .send(EngineMessage::ProcessAsset {
                asset: asset.into(),
                respond_to,
            })
            .await;
        let _ = rx.await;
    }

    pub async fn handle_negotiation_response(
        &self,
        asset: impl Into<String>,
        user_id: Uuid,
        improved: bool,
        new_price: Option<Decimal>,
    ) {
        let (respond_to, rx) = oneshot::channel();
        let _ = self
            .sender
            .send(EngineMessage::HandleNegotiationResponse {
                asset: asset.into(),
                user_id,
                improved,
                new_price,
                respond_to,
            })
            .await;
        let _ = rx.await;
    }

    pub async fn handle_quantity_confirmation_response(
        &self,
        confirmation_key: impl Into<String>,
        accepted: bool,
        new_quantity: Option<u64>,
    ) {
        let (respond_to, rx) = oneshot::channel();
        let _ = self
            .sender
            .send(EngineMessage::HandleQuantityConfirmationResponse {
                confirmation_key: confirmation_key.into(),
                accepted,
                new_quantity,
                respond_to,
            })
            .await;
        let _ = rx.await;
    }

    pub async fn mark_active_orders(&self) {
        let (respond_to, rx) = oneshot::channel();
        let _ = self
            .sender
            .send(EngineMessage::MarkActiveOrders { respond_to })
            .await;
        let _ = rx.await;
    }

    pub async fn get_order_book(&self, asset: impl Into<String>) -> Option<OrderBookView> {
        let (respond_to, rx) = oneshot::channel();
        self.sender
            .send(EngineMessage::GetOrderBook {
                asset: asset.into(),
                respond_to,
            })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Resolves an 8-character order-id prefix carried by a secondary
    /// channel response to the confirmation key soliciting it.
    pub async fn resolve_confirmation_prefix(&self, prefix: impl Into<String>) -> Option<String> {
        let (respond_to, rx) = oneshot::channel();
        self.sender
            .send(EngineMessage::ResolveConfirmationPrefix {
                prefix: prefix.into(),
                respond_to,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Lists the confirmation keys currently soliciting a response from
    /// `user_id`.
    pub async fn pending_confirmations_for_user(&self, user_id: Uuid) -> Vec<String> {
        let (respond_to, rx) = oneshot::channel();
        if self
            .sender
            .send(EngineMessage::PendingConfirmationsForUser { user_id, respond_to })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

struct EngineState {
    store: Arc<dyn OrderStore>,
    kv: Arc<dyn KeyValueStore>,
    realtime: Arc<dyn RealtimeChannel>,
    secondary: Arc<dyn SecondaryChannel>,
    projection: Arc<dyn ProjectionService>,
    config: EngineConfig,
    cache: SnapshotCache,
    confirmations: Confirmations<EngineMessage>,
    negotiations: Negotiations<EngineMessage>,
}

async fn run_matching_engine(
    mut rx: mpsc::Receiver<EngineMessage>,
    self_sender: mpsc::Sender<EngineMessage>,
    deps: EngineDeps,
    config: EngineConfig,
) {
    let confirmation_timers = TimerService::new(self_sender.clone(), EngineMessage::TimerFired);
    let negotiation_timers = TimerService::new(self_sender, EngineMessage::TimerFired);

    let mut state = EngineState {
        store: deps.store,
        kv: deps.kv,
        realtime: deps.realtime,
        secondary: deps.secondary,
        projection: deps.projection,
        cache: SnapshotCache::new(config.snapshot_validity),
        confirmations: Confirmations::new(confirmation_timers),
        negotiations: Negotiations::new(negotiation_timers),
        config,
    };

    info!("matching engine started");

    while let Some(msg) = rx.recv().await {
        match msg {
            EngineMessage::ProcessAsset { asset, respond_to } => {
                process_asset(&mut state, &asset).await;
                state.cache.invalidate();
                let _ = respond_to.send(());
            }
            EngineMessage::HandleNegotiationResponse {
                asset,
                user_id,
                improved,
                new_price,
                respond_to,
            } => {
                handle_negotiation_response(&mut state, &asset, user_id, improved, new_price).await;
                let _ = respond_to.send(());
            }
            EngineMessage::HandleQuantityConfirmationResponse {
                confirmation_key,
                accepted,
                new_quantity,
                respond_to,
            } => {
                handle_confirmation_response(&mut state, &confirmation_key, accepted, new_quantity).await;
                let _ = respond_to.send(());
            }
            EngineMessage::MarkActiveOrders { respond_to } => {
                state
                    .kv
                    .set_with_ttl(KEY_HAS_ACTIVE_ORDERS, "true".into(), state.config.active_orders_flag_ttl)
                    .await;
                let _ = respond_to.send(());
            }
            EngineMessage::GetOrderBook { asset, respond_to } => {
                let view = build_order_book_view(&state, &asset).await;
                let _ = respond_to.send(view);
            }
            EngineMessage::ResolveConfirmationPrefix { prefix, respond_to } => {
                let key = state.confirmations.resolve_prefix(&prefix);
                let _ = respond_to.send(key);
            }
            EngineMessage::PendingConfirmationsForUser { user_id, respond_to } => {
                let keys = state.confirmations.pending_for_user(user_id);
                let _ = respond_to.send(keys);
            }
            EngineMessage::Tick => {
                tick(&mut state).await;
            }
            EngineMessage::TimerFired(fired) => {
                handle_timer_fired(&mut state, fired).await;
            }
        }
    }

    info!("matching engine stopped");
}

#[instrument(skip(state))]
async fn tick(state: &mut EngineState) {
    state
        .kv
        .set_with_ttl(KEY_LAST_RUN, chrono::Utc::now().to_rfc3339(), state.config.heartbeat_ttl)
        .await;

    let had_active_orders_hint = state.kv.get(KEY_HAS_ACTIVE_ORDERS).await;

    let orders = state.cache.get(state.store.as_ref()).await;
    let mut counts: HashMap<&str, u64> = HashMap::new();
    for order in &orders {
        *counts.entry(order.asset.as_str()).or_insert(0) += 1;
    }

    let has_active_orders = !counts.is_empty();
    state
        .kv
        .set_with_ttl(
            KEY_HAS_ACTIVE_ORDERS,
            has_active_orders.to_string(),
            state.config.active_orders_flag_ttl,
        )
        .await;

    if !has_active_orders {
        info!(hint = ?had_active_orders_hint, "no active orders, ending tick early");
        return;
    }

    let mut assets: Vec<(&str, u64)> = counts.into_iter().collect();
    assets.sort_by_key(|&(_, count)| std::cmp::Reverse(count));
    let assets: Vec<String> = assets.into_iter().map(|(asset, _)| asset.to_string()).collect();

    for asset in assets {
        process_asset(state, &asset).await;
    }
}

async fn process_asset(state: &mut EngineState, asset: &str) {
    let all = state.cache.get(state.store.as_ref()).await;
    let orders: Vec<Arc<Order>> = all.into_iter().filter(|o| o.asset == asset).collect();

    match matching::decide(&orders) {
        Decision::NoOrders => {}
        Decision::Commit { bid, offer } => {
            commit_pair(state, &bid, &offer).await;
        }
        Decision::NeedsConfirmation { bid, offer } => {
            let key = matching::confirmation_key(asset, bid.id, offer.id);
            if !state.confirmations.is_declined(&key) && !state.confirmations.is_pending(bid.id, offer.id, asset) {
                state
                    .confirmations
                    .open(&bid, &offer, state.realtime.as_ref(), state.secondary.as_ref())
                    .await;
            }
        }
        Decision::Negotiate { bid, offer } => {
            if let Some(advisory) =
                matching::competitive_bidding_advisory(bid.price, offer.price, state.config.advisory_spread_pct_ceiling)
            {
                let message = format!(
                    "Competitive bidding: spread {} ({:.2}%) on {asset}.",
                    advisory.spread, advisory.spread_pct
                );
                state.secondary.send_message(bid.user_id, message.clone()).await;
                state.secondary.send_message(offer.user_id, message).await;
            }
            state
                .negotiations
                .reconcile(asset, &bid, &offer, state.realtime.as_ref(), state.secondary.as_ref())
                .await;
        }
    }
}

async fn commit_pair(state: &mut EngineState, bid: &Order, offer: &Order) {
    let mut committer = Committer {
        store: state.store.as_ref(),
        cache: &mut state.cache,
        kv: state.kv.clone(),
        realtime: state.realtime.clone(),
        secondary: state.secondary.clone(),
        projection: state.projection.clone(),
        commission_rate: state.config.commission_rate,
    };
    if let Err(err) = committer.commit(bid, offer).await {
        error!(error = %err, bid = bid.id, offer = offer.id, "commit failed, will retry next tick");
    }
}

async fn handle_negotiation_response(
    state: &mut EngineState,
    asset: &str,
    user_id: Uuid,
    improved: bool,
    new_price: Option<Decimal>,
) {
    let outcome = state
        .negotiations
        .respond(asset, user_id, improved, new_price, state.realtime.as_ref(), state.secondary.as_ref())
        .await;

    match outcome {
        NegotiationOutcome::None => {}
        NegotiationOutcome::ImprovePrice { order_id, new_price } => {
            if let Err(err) = state.store.update_order_price(order_id, new_price).await {
                error!(error = %err, order_id, "failed to persist improved price");
                return;
            }
            state.cache.invalidate();
            process_asset(state, asset).await;
        }
        NegotiationOutcome::Ended { asset, bid_price, offer_price } => {
            state
                .realtime
                .broadcast_market_update(MarketUpdate {
                    asset: asset.clone(),
                    best_bid: Some(bid_price),
                    best_offer: Some(offer_price),
                    message: format!("{asset}: bid {bid_price} / offer {offer_price}"),
                })
                .await;
        }
    }
}

async fn handle_confirmation_response(
    state: &mut EngineState,
    confirmation_key: &str,
    accepted: bool,
    new_quantity: Option<u64>,
) {
    let resolution = state
        .confirmations
        .respond(confirmation_key, accepted, new_quantity, state.realtime.as_ref(), state.secondary.as_ref())
        .await;
    apply_resolution(state, resolution).await;
}

async fn apply_resolution(state: &mut EngineState, resolution: Resolution) {
    match resolution {
        Resolution::Pending | Resolution::Ignored | Resolution::Declined => {}
        Resolution::UpsizeAndCommit {
            order_id,
            new_quantity,
            bid_id,
            offer_id,
        } => {
            if let Err(err) = state.store.update_order_amount(order_id, new_quantity).await {
                error!(error = %err, order_id, "failed to persist upsized quantity");
                return;
            }
            state.cache.invalidate();
            reload_and_commit(state, bid_id, offer_id).await;
        }
        Resolution::CommitPartial { bid_id, offer_id } => {
            reload_and_commit(state, bid_id, offer_id).await;
        }
    }
}

async fn reload_and_commit(state: &mut EngineState, bid_id: u64, offer_id: u64) {
    let bid = match state.store.find_order_by_id(bid_id).await {
        Ok(Some(order)) => order,
        Ok(None) => {
            warn!(bid_id, "bid order vanished before confirmed commit");
            return;
        }
        Err(err) => {
            error!(error = %err, bid_id, "failed to reload bid order");
            return;
        }
    };
    let offer = match state.store.find_order_by_id(offer_id).await {
        Ok(Some(order)) => order,
        Ok(None) => {
            warn!(offer_id, "offer order vanished before confirmed commit");
            return;
        }
        Err(err) => {
            error!(error = %err, offer_id, "failed to reload offer order");
            return;
        }
    };
    commit_pair(state, &bid, &offer).await;
}

async fn handle_timer_fired(state: &mut EngineState, fired: TimerFired) {
    use crate::timer::TimerKind;
    match fired.kind {
        TimerKind::NegotiationTimeout => {
            let outcome = state.negotiations.handle_timeout(&fired);
            if let NegotiationOutcome::Ended { asset, bid_price, offer_price } = outcome {
                state
                    .realtime
                    .broadcast_market_update(MarketUpdate {
                        asset: asset.clone(),
                        best_bid: Some(bid_price),
                        best_offer: Some(offer_price),
                        message: format!("{asset}: bid {bid_price} / offer {offer_price}"),
                    })
                    .await;
            }
        }
        TimerKind::SmallerTimeout | TimerKind::LargerTimeout => {
            let resolution = state
                .confirmations
                .handle_timeout(&fired, state.realtime.as_ref(), state.secondary.as_ref())
                .await;
            apply_resolution(state, resolution).await;
        }
    }
}

async fn build_order_book_view(state: &EngineState, asset: &str) -> OrderBookView {
    let orders = match state.store.find_active_orders_for_asset(asset).await {
        Ok(orders) => orders,
        Err(err) => {
            error!(error = %err, asset, "failed to load order book");
            Vec::new()
        }
    };

    let mut bids: Vec<&Order> = orders.iter().filter(|o| o.side == crate::models::Side::Bid).collect();
    let mut offers: Vec<&Order> = orders.iter().filter(|o| o.side == crate::models::Side::Offer).collect();
    bids.sort_by(|a, b| b.price.cmp(&a.price).then(a.created_at.cmp(&b.created_at)));
    offers.sort_by(|a, b| a.price.cmp(&b.price).then(a.created_at.cmp(&b.created_at)));

    let total_bid_quantity = bids.iter().map(|o| o.remaining).sum();
    let total_offer_quantity = offers.iter().map(|o| o.remaining).sum();

    let to_level = |o: &&Order| OrderBookLevel {
        order_id: o.id,
        price: o.price,
        remaining: o.remaining,
    };

    OrderBookView {
        asset: asset.to_string(),
        bids: bids.iter().take(10).map(to_level).collect(),
        offers: offers.iter().take(10).map(to_level).collect(),
        total_bid_quantity,
        total_offer_quantity,
        timestamp: chrono::Utc::now(),
    }
}
