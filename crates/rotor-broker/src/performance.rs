//! Fill accounting and summary performance statistics.

use std::collections::HashMap;

use rotor_core::{EquityPoint, OrderSide, Price, Qty, Symbol, TradeRecord};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

/// Annualization factor for the Sharpe ratio, assuming daily samples.
const TRADING_DAYS_PER_YEAR: f64 = 252.0;

// ============================================================================
//                                   Report
// ============================================================================

/// Summary statistics over the recorded equity curve and fills.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub total_return_pct: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown_pct: f64,
    pub win_rate_pct: f64,
    pub profit_factor: f64,
    pub trade_count: u64,
}

// ============================================================================
//                                   Tracker
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Lot {
    qty: Qty,
    avg_cost: Price,
}

/// Accumulates fills and equity samples into a [`PerformanceReport`].
///
/// Lot accounting is long-only: buys extend the open lot at
/// volume-weighted cost, sells realize pnl against it. A sell with no
/// open lot counts as a trade but realizes nothing.
#[derive(Debug)]
pub struct PerformanceTracker {
    equity: Vec<EquityPoint>,
    open_lots: HashMap<Symbol, Lot>,
    realized: Vec<Decimal>,
    trade_count: u64,
    peak_equity: Price,
    max_drawdown: f64,
}

impl PerformanceTracker {
    #[must_use]
    pub fn new(starting_equity: Price) -> Self {
        Self {
            equity: Vec::new(),
            open_lots: HashMap::new(),
            realized: Vec::new(),
            trade_count: 0,
            peak_equity: starting_equity,
            max_drawdown: 0.0,
        }
    }

    /// Records one fill.
    pub fn record_trade(&mut self, trade: &TradeRecord) {
        self.trade_count += 1;
        match trade.side {
            OrderSide::Buy => {
                let lot = self.open_lots.entry(trade.symbol.clone()).or_insert(Lot {
                    qty: Qty::ZERO,
                    avg_cost: Price::ZERO,
                });
                let combined = lot.qty + trade.quantity;
                if combined.is_positive() {
                    let cost =
                        lot.qty.notional(lot.avg_cost) + trade.quantity.notional(trade.price);
                    lot.avg_cost = Price::new(cost / Decimal::from(combined.inner()));
                }
                lot.qty = combined;
            }
            OrderSide::Sell => {
                let mut exhausted = false;
                if let Some(lot) = self.open_lots.get_mut(&trade.symbol) {
                    let closed = trade.quantity.inner().min(lot.qty.inner());
                    if closed > 0 {
                        let pnl = (trade.price.inner() - lot.avg_cost.inner())
                            * Decimal::from(closed);
                        self.realized.push(pnl);
                    }
                    lot.qty = Qty::new(lot.qty.inner() - closed);
                    exhausted = lot.qty.is_zero();
                } else {
                    debug!(symbol = %trade.symbol, "Sell fill with no open lot, nothing realized");
                }
                if exhausted {
                    self.open_lots.remove(&trade.symbol);
                }
            }
        }
    }

    /// Appends an equity sample and updates peak/drawdown tracking.
    pub fn record_equity(&mut self, timestamp_ms: i64, portfolio_value: Price) -> EquityPoint {
        if portfolio_value > self.peak_equity {
            self.peak_equity = portfolio_value;
        } else if self.peak_equity.is_positive() {
            let drawdown =
                (self.peak_equity.to_f64() - portfolio_value.to_f64()) / self.peak_equity.to_f64();
            if drawdown > self.max_drawdown {
                self.max_drawdown = drawdown;
            }
        }
        let point = EquityPoint {
            timestamp_ms,
            portfolio_value,
        };
        self.equity.push(point.clone());
        point
    }

    #[must_use]
    pub fn equity_len(&self) -> usize {
        self.equity.len()
    }

    /// Summary statistics. Fewer than two equity samples yields an
    /// all-zero report.
    #[must_use]
    pub fn report(&self) -> PerformanceReport {
        if self.equity.len() < 2 {
            return PerformanceReport::default();
        }

        let values: Vec<f64> = self
            .equity
            .iter()
            .map(|p| p.portfolio_value.to_f64())
            .collect();
        let returns: Vec<f64> = values
            .windows(2)
            .filter(|w| w[0] != 0.0)
            .map(|w| (w[1] - w[0]) / w[0])
            .collect();

        let first = values[0];
        let last = values[values.len() - 1];
        let total_return = if first != 0.0 { (last - first) / first } else { 0.0 };

        let sharpe_ratio = if returns.len() > 1 {
            let n = returns.len() as f64;
            let mean = returns.iter().sum::<f64>() / n;
            let std = (returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n).sqrt();
            if std > 0.0 {
                mean / std * TRADING_DAYS_PER_YEAR.sqrt()
            } else {
                0.0
            }
        } else {
            0.0
        };

        let wins = self.realized.iter().filter(|p| **p > Decimal::ZERO).count();
        let win_rate = if self.realized.is_empty() {
            0.0
        } else {
            wins as f64 / self.realized.len() as f64
        };

        let gross_profit: Decimal = self
            .realized
            .iter()
            .filter(|p| **p > Decimal::ZERO)
            .sum();
        let gross_loss: Decimal = -self
            .realized
            .iter()
            .filter(|p| **p < Decimal::ZERO)
            .sum::<Decimal>();
        let profit_factor = if gross_loss > Decimal::ZERO {
            (gross_profit / gross_loss).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };

        PerformanceReport {
            total_return_pct: total_return * 100.0,
            sharpe_ratio,
            max_drawdown_pct: self.max_drawdown * 100.0,
            win_rate_pct: win_rate * 100.0,
            profit_factor,
            trade_count: self.trade_count,
        }
    }
}

// ============================================================================
//                                    Tests
// ============================================================================
