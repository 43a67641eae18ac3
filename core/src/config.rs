use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine tunables. Stored alongside the room configuration as JSON; every
/// field has a default so a partial file keeps working across versions.
///
/// The debounce window and the retry bound trade responsiveness against
/// dependency-resolution success: a longer window packs more causally
/// related records into one batch (fewer deferrals on the receiving side)
/// at the cost of local-edit latency, while a higher retry bound absorbs
/// longer delivery gaps at the cost of keeping stale records alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
	/// How long the batcher waits after the first enqueued record before
	/// flushing.
	#[serde(default = "default_debounce_window_ms")]
	pub debounce_window_ms: u64,
	/// Queue size that forces a flush before the window expires.
	#[serde(default = "default_flush_threshold")]
	pub flush_threshold: usize,
	/// How many retry sweeps a dependency-blocked record survives before it
	/// is dropped as unresolvable.
	#[serde(default = "default_retry_attempts")]
	pub retry_attempts: u32,
	/// Fixed delay between retry sweeps. Dependency gaps are expected to be
	/// short-lived, so there is no backoff.
	#[serde(default = "default_retry_delay_ms")]
	pub retry_delay_ms: u64,
	/// Presence heartbeat period on an attached connection.
	#[serde(default = "default_heartbeat_interval_ms")]
	pub heartbeat_interval_ms: u64,
	/// How long a joining replica waits for a snapshot response before
	/// assuming it is alone in the room.
	#[serde(default = "default_snapshot_timeout_ms")]
	pub snapshot_timeout_ms: u64,
}

const fn default_debounce_window_ms() -> u64 {
	100
}

const fn default_flush_threshold() -> usize {
	256
}

const fn default_retry_attempts() -> u32 {
	2
}

const fn default_retry_delay_ms() -> u64 {
	50
}

const fn default_heartbeat_interval_ms() -> u64 {
	15_000
}

const fn default_snapshot_timeout_ms() -> u64 {
	10_000
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			debounce_window_ms: default_debounce_window_ms(),
			flush_threshold: default_flush_threshold(),
			retry_attempts: default_retry_attempts(),
			retry_delay_ms: default_retry_delay_ms(),
			heartbeat_interval_ms: default_heartbeat_interval_ms(),
			snapshot_timeout_ms: default_snapshot_timeout_ms(),
		}
	}
}

impl SyncConfig {
	#[must_use]
	pub const fn debounce_window(&self) -> Duration {
		Duration::from_millis(self.debounce_window_ms)
	}

	#[must_use]
	pub const fn retry_delay(&self) -> Duration {
		Duration::from_millis(self.retry_delay_ms)
	}

	#[must_use]
	pub const fn heartbeat_interval(&self) -> Duration {
		Duration::from_millis(self.heartbeat_interval_ms)
	}

	#[must_use]
	pub const fn snapshot_timeout(&self) -> Duration {
		Duration::from_millis(self.snapshot_timeout_ms)
	}
}
