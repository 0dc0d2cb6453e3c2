use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{MatchType, Order, OrderStatus, Side, Trade, User};

pub type DbPool = Pool<Sqlite>;

/// The persistent store of users, orders, and trades, treated as an
/// external collaborator per the scope note: the matching core never holds
/// an order or trade beyond a transient snapshot, it always goes back to
/// this trait.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_active_orders(&self) -> EngineResult<Vec<Order>>;
    async fn find_active_orders_for_asset(&self, asset: &str) -> EngineResult<Vec<Order>>;
    async fn find_order_by_id(&self, id: u64) -> EngineResult<Option<Order>>;
    async fn find_user_by_id(&self, id: Uuid) -> EngineResult<Option<User>>;
    async fn update_order_price(&self, id: u64, new_price: Decimal) -> EngineResult<()>;
    async fn update_order_amount(&self, id: u64, new_amount: u64) -> EngineResult<()>;

    /// Atomically: create a Trade; update both orders' remaining, matched,
    /// counterparty, status.
    async fn commit_trade(
        &self,
        bid: &Order,
        offer: &Order,
        amount: u64,
        price: Decimal,
        commission: Decimal,
    ) -> EngineResult<Trade>;
}

/// `sqlx::SqlitePool`-backed implementation, with `users`/`orders`/`trades`
/// tables carrying every column the data model requires (`status`,
/// `remaining`, `original_amount`, `matched`, `counterparty_id`,
/// `match_type`).
pub struct SqlxOrderStore {
    pool: DbPool,
}

impl SqlxOrderStore {
    pub async fn connect(db_path: &str) -> EngineResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite:{}?mode=rwc", db_path))
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn migrate(pool: &DbPool) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                secondary_channel_address TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY,
                side TEXT NOT NULL,
                asset TEXT NOT NULL,
                price TEXT NOT NULL,
                original_amount INTEGER NOT NULL,
                remaining INTEGER NOT NULL,
                matched INTEGER NOT NULL,
                status TEXT NOT NULL,
                user_id TEXT NOT NULL,
                counterparty_id TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                asset TEXT NOT NULL,
                price TEXT NOT NULL,
                amount INTEGER NOT NULL,
                buyer_order_id INTEGER NOT NULL,
                seller_order_id INTEGER NOT NULL,
                buyer_id TEXT NOT NULL,
                seller_id TEXT NOT NULL,
                commission TEXT NOT NULL,
                match_type TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    fn row_to_order(row: &sqlx::sqlite::SqliteRow) -> EngineResult<Order> {
        let side: String = row.try_get("side")?;
        let status: String = row.try_get("status")?;
        let price: String = row.try_get("price")?;
        let user_id: String = row.try_get("user_id")?;
        let counterparty_id: Option<String> = row.try_get("counterparty_id")?;
        let created_at: String = row.try_get("created_at")?;

        Ok(Order {
            id: row.try_get::<i64, _>("id")? as u64,
            side: parse_side(&side)?,
            asset: row.try_get("asset")?,
            price: price
                .parse()
                .map_err(|_| EngineError::Invariant("bad price in store".into()))?,
            original_amount: row.try_get::<i64, _>("original_amount")? as u64,
            remaining: row.try_get::<i64, _>("remaining")? as u64,
            matched: row.try_get::<i64, _>("matched")? != 0,
            status: parse_status(&status)?,
            user_id: Uuid::parse_str(&user_id)
                .map_err(|_| EngineError::Invariant("bad user_id in store".into()))?,
            counterparty_id: counterparty_id
                .map(|s| Uuid::parse_str(&s))
                .transpose()
                .map_err(|_| EngineError::Invariant("bad counterparty_id in store".into()))?,
            created_at: created_at
                .parse::<DateTime<Utc>>()
                .map_err(|_| EngineError::Invariant("bad created_at in store".into()))?,
        })
    }
}

fn parse_side(s: &str) -> EngineResult<Side> {
    match s {
        "BID" => Ok(Side::Bid),
        "OFFER" => Ok(Side::Offer),
        _ => Err(EngineError::Invariant(format!("unknown side {s}"))),
    }
}

fn status_str(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Active => "ACTIVE",
        OrderStatus::Matched => "MATCHED",
        OrderStatus::Cancelled => "CANCELLED",
        OrderStatus::Expired => "EXPIRED",
    }
}

fn parse_status(s: &str) -> EngineResult<OrderStatus> {
    match s {
        "ACTIVE" => Ok(OrderStatus::Active),
        "MATCHED" => Ok(OrderStatus::Matched),
        "CANCELLED" => Ok(OrderStatus::Cancelled),
        "EXPIRED" => Ok(OrderStatus::Expired),
        _ => Err(EngineError::Invariant(format!("unknown status {s}"))),
    }
}

fn match_type_str(mt: MatchType) -> &'static str {
    match mt {
        MatchType::FullMatch => "FULL_MATCH",
        MatchType::PartialFillBuyer => "PARTIAL_FILL_BUYER",
        MatchType::PartialFillSeller => "PARTIAL_FILL_SELLER",
    }
}

#[async_trait]
impl OrderStore for SqlxOrderStore {
    async fn find_active_orders(&self) -> EngineResult<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM orders WHERE status = 'ACTIVE' AND remaining > 0
            ORDER BY asset ASC, price DESC, created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_order).collect()
    }

    async fn find_active_orders_for_asset(&self, asset: &str) -> EngineResult<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM orders WHERE status = 'ACTIVE' AND remaining > 0 AND asset = ?
            ORDER BY price DESC, created_at ASC
            "#,
        )
        .bind(asset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_order).collect()
    }

    async fn find_order_by_id(&self, id: u64) -> EngineResult<Option<Order>> {
        let row = sqlx::query("SELECT * FROM orders WHERE id = ?")
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_order).transpose()
    }

    async fn find_user_by_id(&self, id: Uuid) -> EngineResult<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| User {
            id,
            username: r.get("username"),
            secondary_channel_address: r.get("secondary_channel_address"),
        }))
    }

    async fn update_order_price(&self, id: u64, new_price: Decimal) -> EngineResult<()> {
        sqlx::query("UPDATE orders SET price = ? WHERE id = ?")
            .bind(new_price.to_string())
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_order_amount(&self, id: u64, new_amount: u64) -> EngineResult<()> {
        sqlx::query("UPDATE orders SET original_amount = ?, remaining = ? WHERE id = ?")
            .bind(new_amount as i64)
            .bind(new_amount as i64)
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
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
        let mut tx = self.pool.begin().await?;

        let bid_remaining = bid.remaining - amount;
        let offer_remaining = offer.remaining - amount;
        let match_type = MatchType::classify(bid.original_amount, offer.original_amount);
        let now = Utc::now();

        sqlx::query(
            "UPDATE orders SET remaining = ?, matched = ?, status = ?, counterparty_id = ? WHERE id = ?",
        )
        .bind(bid_remaining as i64)
        .bind(bid_remaining == 0)
        .bind(status_str(if bid_remaining == 0 {
            OrderStatus::Matched
        } else {
            OrderStatus::Active
        }))
        .bind(if bid_remaining == 0 {
            Some(offer.user_id.to_string())
        } else {
            None
        })
        .bind(bid.id as i64)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE orders SET remaining = ?, matched = ?, status = ?, counterparty_id = ? WHERE id = ?",
        )
        .bind(offer_remaining as i64)
        .bind(offer_remaining == 0)
        .bind(status_str(if offer_remaining == 0 {
            OrderStatus::Matched
        } else {
            OrderStatus::Active
        }))
        .bind(if offer_remaining == 0 {
            Some(bid.user_id.to_string())
        } else {
            None
        })
        .bind(offer.id as i64)
        .execute(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO trades (asset, price, amount, buyer_order_id, seller_order_id, buyer_id, seller_id, commission, match_type, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&bid.asset)
        .bind(price.to_string())
        .bind(amount as i64)
        .bind(bid.id as i64)
        .bind(offer.id as i64)
        .bind(bid.user_id.to_string())
        .bind(offer.user_id.to_string())
        .bind(commission.to_string())
        .bind(match_type_str(match_type))
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let trade_id = inserted.last_insert_rowid() as u64;
        tx.commit().await?;

        Ok(Trade {
            id: trade_id,
            asset: bid.asset.clone(),
            price,
            amount,
            buyer_order_id: bid.id,
            seller_order_id: offer.id,
            buyer_id: bid.user_id,
            seller_id: offer.user_id,
            commission,
            match_type,
            created_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn in_memory_store() -> SqlxOrderStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqlxOrderStore::migrate(&pool).await.unwrap();
        SqlxOrderStore::from_pool(pool)
    }

    async fn seed_order(store: &SqlxOrderStore, id: u64, side: Side, price: Decimal, remaining: u64) {
        sqlx::query(
            "INSERT INTO orders (id, side, asset, price, original_amount, remaining, matched, status, user_id, counterparty_id, created_at) VALUES (?, ?, ?, ?, ?, ?, 0, 'ACTIVE', ?, NULL, ?)",
        )
        .bind(id as i64)
        .bind(if side == Side::Bid { "BID" } else { "OFFER" })
        .bind("BAD")
        .bind(price.to_string())
        .bind(remaining as i64)
        .bind(remaining as i64)
        .bind(Uuid::new_v4().to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&store.pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn find_active_orders_round_trips_through_sqlite() {
        let store = in_memory_store().await;
        seed_order(&store, 1, Side::Bid, dec!(100.00), 5).await;
        seed_order(&store, 2, Side::Offer, dec!(100.00), 5).await;

        let orders = store.find_active_orders().await.unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].price, dec!(100.00));
    }

    #[tokio::test]
    async fn commit_trade_updates_both_orders_atomically() {
        let store = in_memory_store().await;
        seed_order(&store, 1, Side::Bid, dec!(100.00), 5).await;
        seed_order(&store, 2, Side::Offer, dec!(100.00), 5).await;

        let bid = store.find_order_by_id(1).await.unwrap().unwrap();
        let offer = store.find_order_by_id(2).await.unwrap().unwrap();

        let trade = store
            .commit_trade(&bid, &offer, 5, dec!(100.00), dec!(0.50))
            .await
            .unwrap();

        assert_eq!(trade.amount, 5);
        let bid_after = store.find_order_by_id(1).await.unwrap().unwrap();
        let offer_after = store.find_order_by_id(2).await.unwrap().unwrap();
        assert_eq!(bid_after.status, OrderStatus::Matched);
        assert_eq!(offer_after.status, OrderStatus::Matched);
        assert_eq!(bid_after.remaining, 0);
    }

    #[tokio::test]
    async fn update_order_amount_resizes_both_fields() {
        let store = in_memory_store().await;
        seed_order(&store, 1, Side::Bid, dec!(50.00), 3).await;

        store.update_order_amount(1, 7).await.unwrap();
        let order = store.find_order_by_id(1).await.unwrap().unwrap();
        assert_eq!(order.original_amount, 7);
        assert_eq!(order.remaining, 7);
    }
}
