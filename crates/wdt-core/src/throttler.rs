//! Rate-limiting capability.

/// Consumed by the send path to pace wire writes.
///
/// `limit` is called with the bytes written since the previous call; the
/// first call of each block includes the header bytes. Over one block, the
/// deltas sum to exactly header bytes plus data bytes. Implementations are
/// internally synchronised: all sender threads share one throttler.
pub trait Throttler: Send + Sync {
    /// Account `delta_bytes` freshly written to the wire, sleeping as
    /// needed to honour the configured rate
    fn limit(&self, delta_bytes: u64);
}
