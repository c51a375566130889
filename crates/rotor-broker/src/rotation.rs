//! Signal-to-holding rotation.
//!
//! The account holds at most one of the configured instruments at a
//! time. A rotation runs as two legs through the facade: flatten the
//! old instrument, then size and buy the new one. A failed or partial
//! close leg aborts the cycle; the next signal check retries from the
//! reconciled state.

use rotor_core::{OrderOutcome, OrderSide, Price, Qty, Signal, Symbol, TargetHolding, TradeRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::error::BrokerResult;
use crate::now_ms;

/// Instrument mapping for the rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Held on BUY signals.
    #[serde(default = "default_aggressive")]
    pub aggressive: Symbol,
    /// Held on SELL signals; cash when absent.
    #[serde(default)]
    pub defensive: Option<Symbol>,
}

fn default_aggressive() -> Symbol {
    Symbol::new("TQQQ")
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            aggressive: default_aggressive(),
            defensive: None,
        }
    }
}

impl RotationConfig {
    /// Target holding for a signal, given what is held now.
    pub fn target_for(&self, signal: Signal, current: &TargetHolding) -> TargetHolding {
        match signal {
            Signal::Buy => TargetHolding::Instrument(self.aggressive.clone()),
            Signal::Sell => match &self.defensive {
                Some(symbol) => TargetHolding::Instrument(symbol.clone()),
                None => TargetHolding::Cash,
            },
            Signal::Hold => current.clone(),
        }
    }

    /// Aggressive first: it decides the holding if both are held.
    fn instruments(&self) -> impl Iterator<Item = &Symbol> {
        std::iter::once(&self.aggressive).chain(self.defensive.iter())
    }
}

/// Result of one rotation attempt.
#[derive(Debug)]
pub struct RotationOutcome {
    /// Holding after the attempt, from reconciled positions.
    pub holding: TargetHolding,
    pub changed: bool,
    /// Filled legs, ready for the trade log.
    pub legs: Vec<TradeRecord>,
}

pub struct Rotator {
    config: RotationConfig,
}

impl Rotator {
    #[must_use]
    pub fn new(config: RotationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    /// Which configured instrument the account holds, or cash.
    pub fn current_holding(&self, broker: &dyn Broker) -> TargetHolding {
        for symbol in self.config.instruments() {
            if broker.position(symbol).is_long() {
                return TargetHolding::Instrument(symbol.clone());
            }
        }
        TargetHolding::Cash
    }

    /// Close-then-open rotation into `target`.
    pub async fn rotate_to(
        &self,
        broker: &dyn Broker,
        target: &TargetHolding,
        rationale: &str,
    ) -> BrokerResult<RotationOutcome> {
        let current = self.current_holding(broker);
        if current == *target {
            debug!(holding = %current, "Already at target, no rotation");
            return Ok(RotationOutcome {
                holding: current,
                changed: false,
                legs: Vec::new(),
            });
        }

        info!(from = %current, to = %target, rationale, "Rotating holding");
        let mut legs = Vec::new();

        if let TargetHolding::Instrument(old) = &current {
            match broker.close_position(old).await? {
                OrderOutcome::Filled {
                    side,
                    quantity,
                    avg_fill_price,
                    ..
                } => {
                    legs.push(leg_record(old, side, quantity, avg_fill_price, rationale));
                }
                OrderOutcome::NoChange { .. } => {}
                OrderOutcome::Cancelled {
                    requested, filled, ..
                } => {
                    warn!(
                        symbol = %old,
                        requested = requested.inner(),
                        filled = filled.inner(),
                        "Close leg partially filled, rotation retries next cycle"
                    );
                    return Ok(self.settle(broker, &current, legs));
                }
            }
        }

        if let TargetHolding::Instrument(new) = target {
            let quote = broker.market_data(new).await?;
            let price = match quote.reference_price() {
                Some(price) => price,
                None => {
                    warn!(symbol = %new, "No usable reference price, open leg skipped");
                    return Ok(self.settle(broker, &current, legs));
                }
            };

            let shares = broker.calculate_shares(new, price);
            if shares.is_positive() {
                match broker.place_order(new, OrderSide::Buy, shares).await? {
                    OrderOutcome::Filled {
                        side,
                        quantity,
                        avg_fill_price,
                        ..
                    } => {
                        legs.push(leg_record(new, side, quantity, avg_fill_price, rationale));
                    }
                    OrderOutcome::NoChange { .. } => {}
                    OrderOutcome::Cancelled {
                        requested, filled, ..
                    } => {
                        warn!(
                            symbol = %new,
                            requested = requested.inner(),
                            filled = filled.inner(),
                            "Open leg partially filled"
                        );
                    }
                }
            } else {
                warn!(symbol = %new, %price, "Allocation sizes to zero shares, open leg skipped");
            }
        }

        Ok(self.settle(broker, &current, legs))
    }

    fn settle(
        &self,
        broker: &dyn Broker,
        entered_with: &TargetHolding,
        legs: Vec<TradeRecord>,
    ) -> RotationOutcome {
        let holding = self.current_holding(broker);
        RotationOutcome {
            changed: holding != *entered_with,
            holding,
            legs,
        }
    }
}

fn leg_record(
    symbol: &Symbol,
    side: OrderSide,
    quantity: Qty,
    price: Price,
    rationale: &str,
) -> TradeRecord {
    TradeRecord {
        timestamp_ms: now_ms(),
        symbol: symbol.clone(),
        side,
        quantity,
        price,
        rationale: rationale.to_string(),
    }
}

// ============================================================================
//                                    Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use crate::sim::SimBroker;
    use rotor_risk::RiskConfig;
    use rust_decimal_macros::dec;

    fn rotation() -> RotationConfig {
        RotationConfig {
            aggressive: Symbol::new("TQQQ"),
            defensive: Some(Symbol::new("QQQ")),
        }
    }

    async fn sim() -> SimBroker {
        let mut config = BrokerConfig::default();
        config.seed_prices.insert(Symbol::new("TQQQ"), dec!(450));
        config.seed_prices.insert(Symbol::new("QQQ"), dec!(30));
        let mut broker = SimBroker::new(config, RiskConfig::default());
        broker.connect().await.unwrap();
        broker
    }

    #[test]
    fn test_signals_map_to_targets() {
        let config = rotation();
        let cash = TargetHolding::Cash;

        assert_eq!(
            config.target_for(Signal::Buy, &cash),
            TargetHolding::Instrument(Symbol::new("TQQQ"))
        );
        assert_eq!(
            config.target_for(Signal::Sell, &cash),
            TargetHolding::Instrument(Symbol::new("QQQ"))
        );
        assert_eq!(config.target_for(Signal::Hold, &cash), TargetHolding::Cash);

        let no_defensive = RotationConfig {
            aggressive: Symbol::new("TQQQ"),
            defensive: None,
        };
        assert_eq!(
            no_defensive.target_for(Signal::Sell, &cash),
            TargetHolding::Cash
        );
    }

    #[tokio::test]
    async fn test_rotate_from_cash_buys_sized_allocation() {
        let broker = sim().await;
        let rotator = Rotator::new(rotation());
        let target = TargetHolding::Instrument(Symbol::new("TQQQ"));

        let outcome = rotator
            .rotate_to(&broker, &target, "ma crossover")
            .await
            .unwrap();

        assert!(outcome.changed);
        assert_eq!(outcome.holding, target);
        assert_eq!(outcome.legs.len(), 1);
        assert_eq!(outcome.legs[0].side, OrderSide::Buy);
        assert_eq!(outcome.legs[0].quantity, Qty::new(211));
        assert_eq!(outcome.legs[0].rationale, "ma crossover");
        assert_eq!(broker.position(&Symbol::new("TQQQ")).quantity, Qty::new(211));
    }

    #[tokio::test]
    async fn test_rotation_closes_old_before_opening_new() {
        let broker = sim().await;
        let rotator = Rotator::new(rotation());

        rotator
            .rotate_to(
                &broker,
                &TargetHolding::Instrument(Symbol::new("TQQQ")),
                "uptrend",
            )
            .await
            .unwrap();
        let outcome = rotator
            .rotate_to(
                &broker,
                &TargetHolding::Instrument(Symbol::new("QQQ")),
                "downtrend",
            )
            .await
            .unwrap();

        assert!(outcome.changed);
        assert_eq!(
            outcome.holding,
            TargetHolding::Instrument(Symbol::new("QQQ"))
        );
        assert_eq!(outcome.legs.len(), 2);
        // Sell leg first, then the sized buy.
        assert_eq!(outcome.legs[0].side, OrderSide::Sell);
        assert_eq!(outcome.legs[0].symbol, Symbol::new("TQQQ"));
        assert_eq!(outcome.legs[1].side, OrderSide::Buy);
        assert_eq!(outcome.legs[1].symbol, Symbol::new("QQQ"));
        // Round trip at 450 restores 100k; 95% of it at 30 a share.
        assert_eq!(outcome.legs[1].quantity, Qty::new(3166));
        assert!(broker.position(&Symbol::new("TQQQ")).is_flat());
    }

    #[tokio::test]
    async fn test_rotate_to_current_holding_is_a_noop() {
        let broker = sim().await;
        let rotator = Rotator::new(rotation());
        let target = TargetHolding::Instrument(Symbol::new("TQQQ"));

        rotator.rotate_to(&broker, &target, "uptrend").await.unwrap();
        let outcome = rotator.rotate_to(&broker, &target, "uptrend").await.unwrap();

        assert!(!outcome.changed);
        assert!(outcome.legs.is_empty());
    }

    #[tokio::test]
    async fn test_rotate_to_cash_only_closes() {
        let broker = sim().await;
        let rotator = Rotator::new(rotation());

        rotator
            .rotate_to(
                &broker,
                &TargetHolding::Instrument(Symbol::new("TQQQ")),
                "uptrend",
            )
            .await
            .unwrap();
        let outcome = rotator
            .rotate_to(&broker, &TargetHolding::Cash, "exit")
            .await
            .unwrap();

        assert!(outcome.changed);
        assert_eq!(outcome.holding, TargetHolding::Cash);
        assert_eq!(outcome.legs.len(), 1);
        assert_eq!(outcome.legs[0].side, OrderSide::Sell);
        assert!(broker.all_positions().is_empty());
    }

    #[tokio::test]
    async fn test_current_holding_prefers_aggressive() {
        let broker = sim().await;
        let rotator = Rotator::new(rotation());

        assert_eq!(rotator.current_holding(&broker), TargetHolding::Cash);

        broker
            .place_order(&Symbol::new("QQQ"), OrderSide::Buy, Qty::new(10))
            .await
            .unwrap();
        broker
            .place_order(&Symbol::new("TQQQ"), OrderSide::Buy, Qty::new(10))
            .await
            .unwrap();

        assert_eq!(
            rotator.current_holding(&broker),
            TargetHolding::Instrument(Symbol::new("TQQQ"))
        );
    }
}
