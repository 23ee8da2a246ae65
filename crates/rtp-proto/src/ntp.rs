//! NTP-format timestamp conversions used by the sender-clock and
//! receiver-clock RTCP extensions (`spec.md` §3, §6).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch
/// (1970-01-01).
const NTP_UNIX_EPOCH_OFFSET: u64 = 2_208_988_800;

/// Encodes a wallclock instant as a 64-bit NTP timestamp (32 bits of
/// seconds since the NTP epoch, 32 bits of fractional seconds).
pub fn to_ntp64(time: SystemTime) -> u64 {
    let since_unix = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);

    let seconds = since_unix.as_secs() + NTP_UNIX_EPOCH_OFFSET;
    let fraction = ((since_unix.subsec_nanos() as u64) << 32) / 1_000_000_000;

    (seconds << 32) | fraction
}

/// Decodes a 64-bit NTP timestamp back into a wallclock instant.
pub fn from_ntp64(value: u64) -> SystemTime {
    let seconds = (value >> 32).saturating_sub(NTP_UNIX_EPOCH_OFFSET);
    let fraction = value & 0xFFFF_FFFF;
    let nanos = (fraction * 1_000_000_000) >> 32;

    UNIX_EPOCH + Duration::new(seconds, nanos as u32)
}

/// Converts a [`Duration`] into the 16.16 fixed-point seconds format used
/// by the receiver-clock `delay_since_receive` field.
pub fn duration_to_16_16(delay: Duration) -> u32 {
    let seconds = delay.as_secs().min(u16::MAX as u64) as u32;
    let fraction = ((delay.subsec_nanos() as u64) << 16) / 1_000_000_000;

    (seconds << 16) | (fraction as u32)
}

/// Converts a 16.16 fixed-point seconds value back into a [`Duration`].
pub fn duration_from_16_16(value: u32) -> Duration {
    let seconds = (value >> 16) as u64;
    let fraction = (value & 0xFFFF) as u64;
    let nanos = (fraction * 1_000_000_000) >> 16;

    Duration::new(seconds, nanos as u32)
}

/// The middle 32 bits of a 64-bit NTP timestamp: 16 bits of seconds (modulo
/// 2^16) followed by 16 bits of fraction. This is the same truncation RTCP
/// sender reports use for their NTP field, and is what CCFB's
/// `report_timestamp` carries (`spec.md` §3, §6).
pub fn to_ntp32_mid(time: SystemTime) -> u32 {
    (to_ntp64(time) >> 16) as u32
}

/// Reconstructs an absolute [`SystemTime`] from a middle-32-bit compact NTP
/// value by borrowing the missing high/low bits from `near`, a wallclock
/// reading known to be within about 18 hours of the original timestamp
/// (half of the 16-bit seconds field's wraparound period). This is the same
/// technique RTCP's `DLSR`/`LSR` fields rely on.
pub fn from_ntp32_mid_near(compact: u32, near: SystemTime) -> SystemTime {
    const KEEP_OUTER_BITS: u64 = 0xFFFF_0000_0000_FFFF;
    let near64 = to_ntp64(near);
    let reconstructed = (near64 & KEEP_OUTER_BITS) | ((compact as u64) << 16);
    from_ntp64(reconstructed)
}
