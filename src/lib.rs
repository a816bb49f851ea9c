use std::error::Error;

pub type DynError = Box<dyn Error + Send + Sync>;

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod market;
pub mod venue_parser;

// Export venue connectors for use in binaries
pub mod binance;
pub mod bybit;
pub mod klines;
pub mod okx;
pub mod utils;
