//! Pre-trade risk validation.
//!
//! Every order passes the checks here before it may touch the gateway.
//! All arithmetic is local, against the reconciler's last account
//! snapshot and position table; a validation failure therefore costs no
//! network round trip. When in doubt (no snapshot yet), block.

use crate::error::{ValidationError, ValidationResult};
use rotor_core::{OrderSide, Price, Qty, Symbol};
use rotor_position::ReconcilerHandle;
use rotor_telemetry::Metrics;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Risk thresholds, immutable for the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Max per-symbol position value as a fraction of account value.
    /// 1.0 permits the single-instrument rotation to use the whole book.
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: Decimal,
    /// Max gross exposure across all symbols as a fraction of account
    /// value.
    #[serde(default = "default_max_exposure_pct")]
    pub max_exposure_pct: Decimal,
    /// Fraction of buying power held back from BUY orders.
    #[serde(default = "default_cash_safety_margin_pct")]
    pub cash_safety_margin_pct: Decimal,
}

fn default_max_position_pct() -> Decimal {
    Decimal::ONE
}

fn default_max_exposure_pct() -> Decimal {
    Decimal::ONE
}

fn default_cash_safety_margin_pct() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_pct: default_max_position_pct(),
            max_exposure_pct: default_max_exposure_pct(),
            cash_safety_margin_pct: default_cash_safety_margin_pct(),
        }
    }
}

/// Ordered pre-trade checks.
pub struct RiskValidator {
    config: RiskConfig,
    reconciler: ReconcilerHandle,
}

impl RiskValidator {
    #[must_use]
    pub fn new(config: RiskConfig, reconciler: ReconcilerHandle) -> Self {
        Self { config, reconciler }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Run all checks in order, stopping at the first failure.
    ///
    /// Order: quantity, per-symbol position limit, gross exposure
    /// limit, buying power (BUY only).
    pub fn validate(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        qty: Qty,
        ref_price: Price,
    ) -> ValidationResult<()> {
        let result = self.run_checks(symbol, side, qty, ref_price);

        if let Err(e) = &result {
            debug!(
                %symbol,
                %side,
                qty = qty.inner(),
                price = %ref_price,
                check = e.check_name(),
                error = %e,
                "Order blocked by risk check"
            );
            Metrics::risk_blocked(e.check_name(), symbol.as_str());
        } else {
            trace!(%symbol, %side, qty = qty.inner(), "Order passed risk checks");
        }

        result
    }

    fn run_checks(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        qty: Qty,
        ref_price: Price,
    ) -> ValidationResult<()> {
        self.check_quantity(qty)?;

        let account_value = self.reconciler.account_snapshot().net_liquidation.inner();
        self.check_position_limit(symbol, side, qty, ref_price, account_value)?;
        self.check_exposure_limit(symbol, side, qty, ref_price, account_value)?;
        self.check_buying_power(side, qty, ref_price)?;
        Ok(())
    }

    fn check_quantity(&self, qty: Qty) -> ValidationResult<()> {
        if qty.inner() <= 0 {
            return Err(ValidationError::InvalidQuantity { qty: qty.inner() });
        }
        Ok(())
    }

    /// Projected per-symbol position value must stay under the
    /// configured fraction of account value.
    fn check_position_limit(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        qty: Qty,
        ref_price: Price,
        account_value: Decimal,
    ) -> ValidationResult<()> {
        let projected = self.projected_quantity(symbol, side, qty);
        let projected_value = projected.notional(ref_price);
        let limit = account_value * self.config.max_position_pct;

        if projected_value > limit {
            return Err(ValidationError::ExceedsPositionLimit {
                symbol: symbol.clone(),
                projected: projected_value,
                limit,
            });
        }
        Ok(())
    }

    /// Projected gross exposure (sum of absolute position values) must
    /// stay under the configured fraction of account value. Positions in
    /// other symbols are valued at their entry cost, the freshest price
    /// available without leaving the process.
    fn check_exposure_limit(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        qty: Qty,
        ref_price: Price,
        account_value: Decimal,
    ) -> ValidationResult<()> {
        let projected = self.projected_quantity(symbol, side, qty);
        let mut gross = projected.notional(ref_price);

        for position in self.reconciler.all_positions() {
            if position.symbol != *symbol {
                gross += position.cost_basis();
            }
        }

        let limit = account_value * self.config.max_exposure_pct;
        if gross > limit {
            return Err(ValidationError::ExceedsExposureLimit {
                projected: gross,
                limit,
            });
        }
        Ok(())
    }

    /// BUY orders must fit inside buying power less the safety margin.
    fn check_buying_power(
        &self,
        side: OrderSide,
        qty: Qty,
        ref_price: Price,
    ) -> ValidationResult<()> {
        if side != OrderSide::Buy {
            return Ok(());
        }

        let required = qty.notional(ref_price);
        let buying_power = self.reconciler.account_snapshot().buying_power.inner();
        let available = buying_power * (Decimal::ONE - self.config.cash_safety_margin_pct);

        if required > available {
            return Err(ValidationError::InsufficientBuyingPower {
                required,
                available,
            });
        }
        Ok(())
    }

    /// Signed position quantity after this order fills completely.
    fn projected_quantity(&self, symbol: &Symbol, side: OrderSide, qty: Qty) -> Qty {
        let current = self.reconciler.current_position(symbol).quantity;
        Qty::new(current.inner() + qty.inner() * side.sign())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rotor_core::{AccountSnapshot, Execution, GatewayEvent, OrderId};
    use rotor_position::spawn_reconciler;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn reconciler_with_account(net_liq: Decimal, buying_power: Decimal) -> ReconcilerHandle {
        let (violation_tx, _violation_rx) = mpsc::channel(4);
        let (handle, _join) = spawn_reconciler(32, violation_tx);
        handle
            .apply_event(GatewayEvent::AccountSummary(AccountSnapshot::new(
                Price::new(net_liq),
                Price::new(buying_power),
                Price::new(net_liq),
                1_700_000_000_000,
            )))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle
    }

    async fn seed_position(handle: &ReconcilerHandle, symbol: &str, qty: i64, price: Decimal) {
        let order_id = OrderId::new(1000 + qty as u64);
        handle.register_order(order_id).await;
        handle
            .apply_event(GatewayEvent::Execution(Execution {
                order_id,
                exec_id: format!("seed-{symbol}-{qty}"),
                symbol: Symbol::new(symbol),
                side: OrderSide::Buy,
                quantity: Qty::new(qty),
                price: Price::new(price),
                timestamp_ms: 1_700_000_000_000,
            }))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn config(max_position: Decimal, max_exposure: Decimal, margin: Decimal) -> RiskConfig {
        RiskConfig {
            max_position_pct: max_position,
            max_exposure_pct: max_exposure,
            cash_safety_margin_pct: margin,
        }
    }

    #[test]
    fn test_defaults_allow_full_book_single_position() {
        let config: RiskConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_position_pct, dec!(1));
        assert_eq!(config.max_exposure_pct, dec!(1));
        assert_eq!(config.cash_safety_margin_pct, dec!(0.05));
    }

    #[tokio::test]
    async fn test_rejects_non_positive_quantity() {
        let reconciler = reconciler_with_account(dec!(100000), dec!(400000)).await;
        let validator = RiskValidator::new(RiskConfig::default(), reconciler);

        let err = validator
            .validate(
                &Symbol::new("TQQQ"),
                OrderSide::Buy,
                Qty::new(0),
                Price::new(dec!(450)),
            )
            .unwrap_err();
        assert_eq!(err, ValidationError::InvalidQuantity { qty: 0 });

        let err = validator
            .validate(
                &Symbol::new("TQQQ"),
                OrderSide::Sell,
                Qty::new(-5),
                Price::new(dec!(450)),
            )
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidQuantity { .. }));
    }

    #[tokio::test]
    async fn test_twenty_pct_limit_rejects_thirty_accepts_fifteen() {
        let reconciler = reconciler_with_account(dec!(100000), dec!(400000)).await;
        let validator = RiskValidator::new(
            config(dec!(0.20), dec!(1.0), dec!(0.05)),
            reconciler,
        );

        // 60 shares at $500 = $30,000 = 30% of the account.
        let err = validator
            .validate(
                &Symbol::new("TQQQ"),
                OrderSide::Buy,
                Qty::new(60),
                Price::new(dec!(500)),
            )
            .unwrap_err();
        assert!(matches!(err, ValidationError::ExceedsPositionLimit { .. }));

        // 30 shares at $500 = $15,000 = 15%.
        validator
            .validate(
                &Symbol::new("TQQQ"),
                OrderSide::Buy,
                Qty::new(30),
                Price::new(dec!(500)),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_position_limit_counts_existing_position() {
        let reconciler = reconciler_with_account(dec!(100000), dec!(400000)).await;
        seed_position(&reconciler, "TQQQ", 30, dec!(500)).await;
        let validator = RiskValidator::new(
            config(dec!(0.20), dec!(1.0), dec!(0.05)),
            reconciler,
        );

        // Held 30 + 12 more at $500 projects to $21,000 > $20,000.
        let err = validator
            .validate(
                &Symbol::new("TQQQ"),
                OrderSide::Buy,
                Qty::new(12),
                Price::new(dec!(500)),
            )
            .unwrap_err();
        assert!(matches!(err, ValidationError::ExceedsPositionLimit { .. }));

        // Selling down passes: projection shrinks.
        validator
            .validate(
                &Symbol::new("TQQQ"),
                OrderSide::Sell,
                Qty::new(30),
                Price::new(dec!(500)),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_exposure_limit_spans_symbols() {
        let reconciler = reconciler_with_account(dec!(100000), dec!(400000)).await;
        seed_position(&reconciler, "QQQ", 100, dec!(400)).await; // $40,000 held
        let validator = RiskValidator::new(
            config(dec!(1.0), dec!(0.50), dec!(0.05)),
            reconciler,
        );

        // $40,000 held + $20,000 new = $60,000 gross > $50,000 cap.
        let err = validator
            .validate(
                &Symbol::new("TQQQ"),
                OrderSide::Buy,
                Qty::new(20),
                Price::new(dec!(1000)),
            )
            .unwrap_err();
        assert!(matches!(err, ValidationError::ExceedsExposureLimit { .. }));

        // $40,000 + $9,000 stays under the cap.
        validator
            .validate(
                &Symbol::new("TQQQ"),
                OrderSide::Buy,
                Qty::new(9),
                Price::new(dec!(1000)),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_buying_power_with_safety_margin() {
        // $10,000 buying power, 5% margin: $9,500 usable.
        let reconciler = reconciler_with_account(dec!(100000), dec!(10000)).await;
        let validator = RiskValidator::new(
            config(dec!(1.0), dec!(1.0), dec!(0.05)),
            reconciler,
        );

        let err = validator
            .validate(
                &Symbol::new("TQQQ"),
                OrderSide::Buy,
                Qty::new(20),
                Price::new(dec!(500)),
            )
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::InsufficientBuyingPower {
                required: dec!(10000),
                available: dec!(9500),
            }
        );

        validator
            .validate(
                &Symbol::new("TQQQ"),
                OrderSide::Buy,
                Qty::new(19),
                Price::new(dec!(500)),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_sell_skips_buying_power() {
        // No buying power at all; selling held stock must still pass.
        let reconciler = reconciler_with_account(dec!(100000), dec!(0)).await;
        seed_position(&reconciler, "TQQQ", 50, dec!(500)).await;
        let validator = RiskValidator::new(RiskConfig::default(), reconciler);

        validator
            .validate(
                &Symbol::new("TQQQ"),
                OrderSide::Sell,
                Qty::new(50),
                Price::new(dec!(500)),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_snapshot_blocks_buys() {
        let (violation_tx, _violation_rx) = mpsc::channel(4);
        let (reconciler, _join) = spawn_reconciler(32, violation_tx);
        let validator = RiskValidator::new(RiskConfig::default(), reconciler);

        // Account value is zero until the gateway reports; block.
        let err = validator
            .validate(
                &Symbol::new("TQQQ"),
                OrderSide::Buy,
                Qty::new(1),
                Price::new(dec!(450)),
            )
            .unwrap_err();
        assert!(matches!(err, ValidationError::ExceedsPositionLimit { .. }));
    }
}
