use futures_util::future::BoxFuture;

use crate::DynError;

const BACKOFF_FIRST_MS: u64 = 250;
const BACKOFF_MAX_MS: u64 = 10_000;

/// Milliseconds since the Unix epoch, from the wall clock.
pub fn epoch_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Round a price level to two decimals for emitted signal fields.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Reconnect delay doubling from 250ms to a 10s ceiling. A healthy session
/// resets it so transient blips stay cheap.
#[derive(Debug, Default)]
pub struct Backoff {
    next_ms: u64,
}

impl Backoff {
    pub fn new() -> Self {
        Backoff::default()
    }

    pub fn reset(&mut self) {
        self.next_ms = 0;
    }

    /// Pending delay in milliseconds, zero until the first failure.
    pub fn delay_ms(&self) -> u64 {
        self.next_ms
    }

    /// Sleeps for the pending delay, then doubles it for the next failure.
    /// The first failure returns immediately and only arms the delay.
    pub async fn wait(&mut self) {
        if self.next_ms == 0 {
            self.next_ms = BACKOFF_FIRST_MS;
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(self.next_ms)).await;
        self.next_ms = (self.next_ms * 2).min(BACKOFF_MAX_MS);
    }
}

pub fn chunk_vec<T: Clone>(items: &[T], chunk_size: usize) -> Vec<Vec<T>> {
    if chunk_size == 0 {
        return Vec::new();
    }
    items.chunks(chunk_size).map(<[T]>::to_vec).collect()
}

pub fn interval_secs(secs: u64) -> tokio::time::Interval {
    tokio::time::interval(std::time::Duration::from_secs(secs))
}

/// Issues one subscribe call per chunk, pacing the frames so venues with
/// args-per-request limits accept the whole set.
pub async fn subscribe_in_batches<C, T, F>(
    ctx: &mut C,
    items: &[T],
    batch_size: usize,
    delay_ms: u64,
    mut f: F,
) -> Result<(), DynError>
where
    for<'a> F: FnMut(&'a mut C, &'a [T]) -> BoxFuture<'a, Result<(), DynError>>,
{
    if batch_size == 0 {
        return Ok(());
    }

    let mut first = true;
    for chunk in items.chunks(batch_size) {
        if !first && delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }
        first = false;
        f(ctx, chunk).await?;
    }

    Ok(())
}
