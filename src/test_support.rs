//! An in-memory `OrderStore` test double: a real trait object, no SQL,
//! used by controller-level tests instead of a live `sqlx::SqlitePool`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{MatchType, Order, OrderStatus, Trade, User};
use crate::store::OrderStore;

#[derive(Default)]
pub struct FakeStore {
    orders: Mutex<HashMap<u64, Order>>,
    users: Mutex<HashMap<Uuid, User>>,
    trades: Mutex<Vec<Trade>>,
    next_trade_id: AtomicU64,
    fail_next_find: AtomicBool,
    fail_next_commit: AtomicBool,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_order(&self, order: Order) {
        self.orders.lock().unwrap().insert(order.id, order);
    }

    pub fn insert_user(&self, user: User) {
        self.users.lock().unwrap().insert(user.id, user);
    }

    pub fn fail_next_find(&self) {
        self.fail_next_find.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn order(&self, id: u64) -> Order {
        self.orders.lock().unwrap().get(&id).cloned().unwrap()
    }

    pub fn trades(&self) -> Vec<Trade> {
        self.trades.lock().unwrap().clone()
    }
}

#[async_trait]
impl OrderStore for FakeStore {
    async fn find_active_orders(&self) -> EngineResult<Vec<Order>> {
        if self.fail_next_find.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Invariant("simulated store failure".into()));
        }
        let mut orders: Vec<Order> = self
            .orders
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.status == OrderStatus::Active && o.remaining > 0)
            .cloned()
            .collect();
        orders.sort_by(|a, b| {
            a.asset
                .cmp(&b.asset)
                .then(b.price.cmp(&a.price))
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(orders)
    }

    async fn find_active_orders_for_asset(&self, asset: &str) -> EngineResult<Vec<Order>> {
        Ok(self
            .find_active_orders()
            .await?
            .into_iter()
            .filter(|o| o.asset == asset)
            .collect())
    }

    async fn find_order_by_id(&self, id: u64) -> EngineResult<Option<Order>> {
        Ok(self.orders.lock().unwrap().get(&id).cloned())
    }

    async fn find_user_by_id(&self, id: Uuid) -> EngineResult<Option<User>> {
        Ok(self.users.lock().unwrap().get(&id).cloned())
    }

    async fn update_order_price(&self, id: u64, new_price: Decimal) -> EngineResult<()> {
        let mut orders = self.orders.lock().unwrap();
        let order = orders
            .get_mut(&id)
            .ok_or(EngineError::OrderNotFound(id))?;
        order.price = new_price;
        Ok(())
    }

    async fn update_order_amount(&self, id: u64, new_amount: u64) -> EngineResult<()> {
        let mut orders = self.orders.lock().unwrap();
        let order = orders
            .get_mut(&id)
            .ok_or(EngineError::OrderNotFound(id))?;
        order.original_amount = new_amount;
        order.remaining = new_amount;
        Ok(())
    }

    async fn commit_trade(
        &self,
        bid: &Order,
        offer: &Order,
        amount: u64,
        price: Decimal,
        commission: Decimal,
    ) -> EngineResult<Trade> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Invariant("simulated commit failure".into()));
        }

        let mut orders = self.orders.lock().unwrap();
        let match_type = MatchType::classify(bid.original_amount, offer.original_amount);

        {
            let b = orders.get_mut(&bid.id).ok_or(EngineError::OrderNotFound(bid.id))?;
            b.remaining -= amount;
            if b.remaining == 0 {
                b.matched = true;
                b.status = OrderStatus::Matched;
                b.counterparty_id = Some(offer.user_id);
            }
        }
        {
            let o = orders
                .get_mut(&offer.id)
                .ok_or(EngineError::OrderNotFound(offer.id))?;
            o.remaining -= amount;
            if o.remaining == 0 {
                o.matched = true;
                o.status = OrderStatus::Matched;
                o.counterparty_id = Some(bid.user_id);
            }
        }
        drop(orders);

        let trade = Trade {
            id: self.next_trade_id.fetch_add(1, Ordering::SeqCst) + 1,
            asset: bid.asset.clone(),
            price,
            amount,
            buyer_order_id: bid.id,
            seller_order_id: offer.id,
            buyer_id: bid.user_id,
            seller_id: offer.user_id,
            commission,
            match_type,
            created_at: Utc::now(),
        };
        self.trades.lock().unwrap().push(trade.clone());
        Ok(trade)
    }
}
