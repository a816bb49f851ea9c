pub mod book;
pub mod candles;
pub mod cvd;
pub mod mtf;
pub mod profile;
pub mod validator;

pub use book::{BookSummary, OrderBookStore};
pub use candles::{Candle, CandleStore};
pub use cvd::{CvdSnapshot, CvdTracker, WhalePrint};
pub use mtf::{MtfCache, MtfEntry, TrendDirection};
pub use profile::VolumeProfile;
pub use validator::{CrossVenueValidator, ValidationReport, ValidationStatus};

use crate::config::CoreConfig;
use std::sync::Arc;

/// Shared handles to the live market state. Venue connectors write into
/// these; the scheduler only reads.
#[derive(Clone)]
pub struct MarketStores {
    pub books: Arc<OrderBookStore>,
    pub cvd: Arc<CvdTracker>,
    pub candles: Arc<CandleStore>,
}

impl MarketStores {
    pub fn new(config: &CoreConfig) -> Self {
        MarketStores {
            books: Arc::new(OrderBookStore::new()),
            cvd: Arc::new(CvdTracker::new(config.whale_notional_usd)),
            candles: Arc::new(CandleStore::new(config.candle_capacity)),
        }
    }
}
