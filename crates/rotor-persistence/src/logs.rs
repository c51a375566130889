//! Domain log files built on the JSON Lines writer.

use crate::error::PersistenceResult;
use crate::writer::JsonLinesWriter;
use rotor_core::{EquityPoint, TradeRecord};
use std::path::Path;

/// File name of the trade-history log.
pub const TRADE_HISTORY_FILE: &str = "trade_history.jsonl";

/// File name of the equity-curve log.
pub const EQUITY_CURVE_FILE: &str = "equity_curve.jsonl";

/// Append-only record of completed trades.
///
/// Trades are rare and valuable, so every record is flushed to disk
/// immediately.
pub struct TradeHistoryLog {
    writer: JsonLinesWriter<TradeRecord>,
}

impl TradeHistoryLog {
    /// Open (or create) the trade-history log under `base_dir`.
    #[must_use]
    pub fn open(base_dir: &Path) -> Self {
        Self {
            writer: JsonLinesWriter::new(base_dir.join(TRADE_HISTORY_FILE), 1),
        }
    }

    /// Append one completed trade.
    pub fn append(&mut self, record: TradeRecord) -> PersistenceResult<()> {
        self.writer.append(record)
    }

    /// Flush and release the file handle.
    pub fn close(&mut self) -> PersistenceResult<()> {
        self.writer.close()
    }
}

/// Append-only equity curve sampled once per strategy cycle.
///
/// Points are buffered in small batches; the application flushes at
/// the end of each cycle and on shutdown.
pub struct EquityCurveLog {
    writer: JsonLinesWriter<EquityPoint>,
}

impl EquityCurveLog {
    const BUFFER_SIZE: usize = 8;

    /// Open (or create) the equity-curve log under `base_dir`.
    #[must_use]
    pub fn open(base_dir: &Path) -> Self {
        Self {
            writer: JsonLinesWriter::new(base_dir.join(EQUITY_CURVE_FILE), Self::BUFFER_SIZE),
        }
    }

    /// Append one equity point.
    pub fn append(&mut self, point: EquityPoint) -> PersistenceResult<()> {
        self.writer.append(point)
    }

    /// Flush buffered points to disk.
    pub fn flush(&mut self) -> PersistenceResult<()> {
        self.writer.flush()
    }

    /// Flush and release the file handle.
    pub fn close(&mut self) -> PersistenceResult<()> {
        self.writer.close()
    }
}
