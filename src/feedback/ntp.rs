use std::time::Duration;

/// Convert an NTP short format timestamp (16 bit seconds, 16 bit fraction)
/// into a duration since the NTP epoch modulo 2^16 seconds.
pub fn ntp_short_to_duration(v: u32) -> Duration {
    let secs = (v >> 16) as u64;
    let frac = (v & 0xffff) as u64;
    let nanos = frac * 1_000_000_000 / 65_536;

    Duration::new(secs, nanos as u32)
}

/// Convert a duration into NTP short format, truncating seconds to 16 bits.
pub fn duration_to_ntp_short(d: Duration) -> u32 {
    let secs = (d.as_secs() & 0xffff) as u32;
    let frac = (d.subsec_nanos() as u64 * 65_536 / 1_000_000_000) as u32;

    secs << 16 | frac
}
