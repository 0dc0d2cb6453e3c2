use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use matching_core::channels::{NullProjectionService, NullRealtimeChannel, NullSecondaryChannel};
use matching_core::config::EngineConfig;
use matching_core::engine::MatchingEngine;
use matching_core::kv::InMemoryKeyValueStore;
use matching_core::models::{Order, OrderStatus, Side};
use matching_core::test_support::FakeStore;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

fn order(id: u64, side: Side, price: Decimal, remaining: u64) -> Order {
    Order {
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
    }
}

fn engine(store: Arc<FakeStore>) -> MatchingEngine {
    let config = EngineConfig {
        tick_interval: Duration::from_secs(3600),
        ..EngineConfig::default()
    };
    MatchingEngine::start(
        matching_core::engine::EngineDeps {
            store,
            kv: Arc::new(InMemoryKeyValueStore::new()),
            realtime: Arc::new(NullRealtimeChannel),
            secondary: Arc::new(NullSecondaryChannel),
            projection: Arc::new(NullProjectionService),
        },
        config,
    )
}

#[tokio::test]
async fn exact_match() {
    let store = Arc::new(FakeStore::new());
    store.insert_order(order(1, Side::Bid, dec!(100.00), 5));
    store.insert_order(order(2, Side::Offer, dec!(100.00), 5));

    engine(store.clone()).process_asset("BAD").await;

    let trades = store.trades();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].amount, 5);
    assert_eq!(trades[0].price, dec!(100.00));
    assert_eq!(trades[0].commission, dec!(0.50));
    assert_eq!(store.order(1).status, OrderStatus::Matched);
    assert_eq!(store.order(2).status, OrderStatus::Matched);
    assert_eq!(store.order(1).remaining, 0);
    assert_eq!(store.order(2).remaining, 0);
}

#[tokio::test]
async fn smaller_buyer_upsize_accepted() {
    let store = Arc::new(FakeStore::new());
    store.insert_order(order(2, Side::Bid, dec!(50.00), 3));
    store.insert_order(order(3, Side::Offer, dec!(50.00), 7));

    let engine = engine(store.clone());
    engine.process_asset("BAD").await;

    let key = matching_core::matching::confirmation_key("BAD", 2, 3);
    engine
        .handle_quantity_confirmation_response(key, true, Some(7))
        .await;

    let trades = store.trades();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].amount, 7);
    assert_eq!(trades[0].price, dec!(50.00));
    assert_eq!(trades[0].commission, dec!(0.35));
    assert_eq!(store.order(2).original_amount, 7);
    assert_eq!(store.order(2).status, OrderStatus::Matched);
    assert_eq!(store.order(3).status, OrderStatus::Matched);
}

#[tokio::test]
async fn smaller_declines_larger_accepts_partial() {
    let store = Arc::new(FakeStore::new());
    store.insert_order(order(3, Side::Bid, dec!(10.00), 2));
    store.insert_order(order(4, Side::Offer, dec!(10.00), 5));

    let engine = engine(store.clone());
    engine.process_asset("BAD").await;

    let key = matching_core::matching::confirmation_key("BAD", 3, 4);
    engine
        .handle_quantity_confirmation_response(key.clone(), false, None)
        .await;
    engine
        .handle_quantity_confirmation_response(key, true, None)
        .await;

    let trades = store.trades();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].amount, 2);
    assert_eq!(trades[0].price, dec!(10.00));
    assert_eq!(trades[0].commission, dec!(0.02));
    assert_eq!(store.order(3).status, OrderStatus::Matched);
    assert_eq!(store.order(4).status, OrderStatus::Active);
    assert_eq!(store.order(4).remaining, 3);
}

#[tokio::test]
async fn both_decline_blacklists_pair_for_the_process_lifetime() {
    let store = Arc::new(FakeStore::new());
    store.insert_order(order(3, Side::Bid, dec!(10.00), 2));
    store.insert_order(order(4, Side::Offer, dec!(10.00), 5));

    let engine = engine(store.clone());
    engine.process_asset("BAD").await;

    let key = matching_core::matching::confirmation_key("BAD", 3, 4);
    engine
        .handle_quantity_confirmation_response(key.clone(), false, None)
        .await;
    engine
        .handle_quantity_confirmation_response(key, false, None)
        .await;

    assert!(store.trades().is_empty());

    // Re-scan: the pair must not reopen a confirmation even though the
    // same price/quantity mismatch still holds.
    engine.process_asset("BAD").await;
    assert!(store.trades().is_empty());
    assert_eq!(store.order(3).status, OrderStatus::Active);
    assert_eq!(store.order(4).status, OrderStatus::Active);
}

#[tokio::test]
async fn negotiation_pass_broadcasts_market_update_without_trade() {
    let store = Arc::new(FakeStore::new());
    let bid = order(4, Side::Bid, dec!(9.50), 1);
    let offer = order(5, Side::Offer, dec!(10.00), 1);
    let bid_user = bid.user_id;
    let offer_user = offer.user_id;
    store.insert_order(bid);
    store.insert_order(offer);

    let engine = engine(store.clone());
    engine.process_asset("BAD").await;

    // Offer's turn first; the bid user's response must be ignored.
    engine
        .handle_negotiation_response("BAD", bid_user, false, None)
        .await;
    assert!(store.trades().is_empty());

    engine
        .handle_negotiation_response("BAD", offer_user, false, None)
        .await;

    assert!(store.trades().is_empty());
    assert_eq!(store.order(4).status, OrderStatus::Active);
    assert_eq!(store.order(5).status, OrderStatus::Active);
}

#[tokio::test]
async fn negotiation_improve_to_cross_commits_immediately() {
    let store = Arc::new(FakeStore::new());
    let bid = order(4, Side::Bid, dec!(9.50), 1);
    let offer = order(5, Side::Offer, dec!(10.00), 1);
    let offer_user = offer.user_id;
    store.insert_order(bid);
    store.insert_order(offer);

    let engine = engine(store.clone());
    engine.process_asset("BAD").await;

    engine
        .handle_negotiation_response("BAD", offer_user, true, Some(dec!(9.50)))
        .await;

    let trades = store.trades();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].amount, 1);
    assert_eq!(trades[0].price, dec!(9.50));
    assert_eq!(trades[0].commission, dec!(0.01));
    assert_eq!(store.order(4).status, OrderStatus::Matched);
    assert_eq!(store.order(5).status, OrderStatus::Matched);
}
