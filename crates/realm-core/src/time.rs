/// Milliseconds on the world clock. The control loop passes the current value
/// into every world operation; the simulation never reads the system clock.
pub type Millis = u64;

/// Wall-clock milliseconds since the Unix epoch.
pub fn epoch_millis() -> Millis {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Millis)
        .unwrap_or_default()
}
