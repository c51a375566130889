//! Signal-driven rotation trading bot.
//!
//! Ties the stack together: loads configuration, builds the broker
//! facade (live or simulated), tails the external signal feed and
//! rotates the account between the configured instruments, persisting
//! trades and the equity curve as it goes.

pub mod app;
pub mod config;
pub mod error;
pub mod signals;

pub use app::Application;
pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use signals::SignalFeed;
