use std::time::Instant;

use once_cell::sync::Lazy;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds since the process-wide epoch. Monotonic, cheap enough for the
/// per-iteration timer checks.
#[inline]
pub(crate) fn now_millis() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}
