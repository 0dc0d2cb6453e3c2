use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;

/// Every tunable named in §5, with defaults matching the literal values
/// from the design. The host process may override any field before
/// calling `MatchingEngine::start`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick_interval: Duration,
    pub startup_grace: Duration,
    pub snapshot_validity: Duration,
    pub negotiation_timeout: Duration,
    pub confirmation_timeout: Duration,
    pub heartbeat_ttl: Duration,
    pub active_orders_flag_ttl: Duration,
    pub commission_rate: Decimal,
    pub advisory_spread_pct_ceiling: Decimal,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            startup_grace: Duration::from_secs(10),
            snapshot_validity: Duration::from_secs(30),
            negotiation_timeout: Duration::from_secs(30),
            confirmation_timeout: Duration::from_secs(60),
            heartbeat_ttl: Duration::from_secs(600),
            active_orders_flag_ttl: Duration::from_secs(300),
            commission_rate: dec!(0.001),
            advisory_spread_pct_ceiling: dec!(20),
        }
    }
}
