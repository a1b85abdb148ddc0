/// Milliseconds since the Unix epoch, as observed by this process.
pub fn timestamp_now_ms() -> u64 {
    let dur = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(dur.as_millis()).unwrap_or(u64::MAX)
}

/// Seconds elapsed between two epoch-millisecond timestamps. Clock skew that
/// would make the result negative yields zero.
pub fn elapsed_secs(since_ms: u64, now_ms: u64) -> f64 {
    now_ms.saturating_sub(since_ms) as f64 / 1000.0
}
