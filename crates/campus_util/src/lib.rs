#![forbid(unsafe_code)]

pub mod time {
	use std::time::{Duration, SystemTime, UNIX_EPOCH};

	pub const MS_PER_DAY: i64 = 86_400_000;

	/// Current Unix time in milliseconds.
	#[inline]
	pub fn unix_ms_now() -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_millis() as i64
	}

	/// Current Unix time in seconds.
	#[inline]
	pub fn unix_secs_now() -> u64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_secs()
	}

	/// `now_ms` minus whole days, saturating at the epoch.
	pub fn days_before_ms(now_ms: i64, days: u32) -> i64 {
		now_ms.saturating_sub(i64::from(days) * MS_PER_DAY).max(0)
	}

}
