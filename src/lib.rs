//! Merchant Payment Backend
//!
//! Merchant-side service of a coin-based payment protocol:
//! - Orders become signed contracts when wallets claim them
//! - Coin payments fan out as deposits to the issuing exchanges
//! - Wire-transfer settlement is tracked and reconciled against
//!   exchange-signed aggregate reports
//! - Refunds grow monotonically and are redeemed by wallet pickup
//! - Reserve-backed tips share the exchange withdrawal protocol

pub mod amount;
pub mod api;
pub mod config;
pub mod crypto;
pub mod db;
pub mod exchange;
pub mod instance;
pub mod longpoll;
pub mod order;
pub mod pay;
pub mod refund;
pub mod timestamp;
pub mod tip;
pub mod track;

pub use api::{create_router, AppState};
pub use config::Config;
pub use db::{Database, DbError, DbResult};
