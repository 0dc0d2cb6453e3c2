use std::sync::Arc;

use tracing::{info, instrument};

use crate::cache::SnapshotCache;
use crate::channels::{
    OrderMatched, ProjectionService, RealtimeChannel, RealtimeEvent, SecondaryChannel,
    TradeExecuted, TradeExecutedEvent,
};
use crate::commission::calculate_commission;
use crate::error::EngineResult;
use crate::kv::KeyValueStore;
use crate::models::{Order, Side, Trade};
use crate::store::OrderStore;

/// Everything the Trade Committer needs to settle one match and fan its
/// consequences out, bundled so the matching loop can hand it off in one
/// call.
pub struct Committer<'a> {
    pub store: &'a dyn OrderStore,
    pub cache: &'a mut SnapshotCache,
    pub kv: Arc<dyn KeyValueStore>,
    pub realtime: Arc<dyn RealtimeChannel>,
    pub secondary: Arc<dyn SecondaryChannel>,
    pub projection: Arc<dyn ProjectionService>,
    pub commission_rate: rust_decimal::Decimal,
}

impl<'a> Committer<'a> {
    /// Commits one bid/offer pair at `amount`/`price`, then spawns the
    /// post-commit fan-out (projection refresh, pub/sub publish, user
    /// notifications) so none of it can delay or roll back the write.
    #[instrument(skip(self, bid, offer), fields(asset = %bid.asset, bid = bid.id, offer = offer.id))]
    pub async fn commit(&mut self, bid: &Order, offer: &Order) -> EngineResult<Trade> {
        let amount = bid.remaining.min(offer.remaining);
        let price = offer.price;
        let commission = calculate_commission(amount, price, self.commission_rate);

        let trade = self
            .store
            .commit_trade(bid, offer, amount, price, commission)
            .await?;

        self.cache.invalidate();
        info!(trade_id = trade.id, amount, %price, "trade committed");

        self.fan_out(bid, offer, &trade);
        Ok(trade)
    }

    fn fan_out(&self, bid: &Order, offer: &Order, trade: &Trade) {
        let kv = self.kv.clone();
        let realtime = self.realtime.clone();
        let secondary = self.secondary.clone();
        let projection = self.projection.clone();
        let asset = trade.asset.clone();
        let trade = trade.clone();
        let bid = bid.clone();
        let offer = offer.clone();

        tokio::spawn(async move {
            projection.refresh(&asset).await;

            let bid_fully_matched = bid.remaining <= trade.amount;
            let offer_fully_matched = offer.remaining <= trade.amount;
            let executed_event = TradeExecutedEvent {
                trade_id: trade.id,
                asset: asset.clone(),
                price: trade.price,
                amount: trade.amount,
                buyer_id: bid.user_id,
                seller_id: offer.user_id,
                timestamp: trade.created_at,
                bid_order_id: bid.id,
                offer_order_id: offer.id,
                bid_fully_matched,
                offer_fully_matched,
                match_type: trade.match_type,
                partial_fill: trade.match_type.is_partial_fill(),
            };
            let payload = serde_json::to_string(&executed_event).unwrap_or_default();
            kv.publish("trade:executed", payload).await;

            for (order, side) in [(&bid, Side::Bid), (&offer, Side::Offer)] {
                let event = TradeExecuted {
                    order_id: order.id,
                    asset: asset.clone(),
                    price: trade.price,
                    amount: trade.amount,
                    trade_id: trade.id,
                    side,
                    is_fully_filled: order.remaining <= trade.amount,
                    is_partial_fill: trade.match_type.is_partial_fill(),
                    remaining_amount: order.remaining.saturating_sub(trade.amount),
                    original_amount: order.original_amount,
                };
                realtime
                    .notify_user(order.user_id, RealtimeEvent::TradeExecuted(event))
                    .await;

                let matched = OrderMatched {
                    order_id: order.id,
                    asset: asset.clone(),
                    price: trade.price,
                    amount: trade.amount,
                    trade_id: trade.id,
                    side,
                };
                realtime
                    .notify_user(order.user_id, RealtimeEvent::OrderMatched(matched))
                    .await;

                secondary
                    .send_message(
                        order.user_id,
                        format!(
                            "Trade executed: {amount} {asset} @ {price}",
                            amount = trade.amount,
                            price = trade.price
                        ),
                    )
                    .await;
            }
        });
    }
}
