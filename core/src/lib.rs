#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc,
	},
};

use sphere_actors::Actors;
use sphere_sync::RecordFactory;
use tokio::sync::{Notify, RwLock};
use uhlc::HLC;
use uuid::Uuid;

pub mod apply;
mod batcher;
pub mod bootstrap;
mod capture;
mod config;
pub mod host;
pub mod ownership;
mod session;
pub mod transport;

pub use apply::{ApplyEngine, ApplyError, ApplyReport};
pub use batcher::order_records;
pub use config::SyncConfig;
pub use host::{
	DocumentHost, HostError, MemoryDocument, MutationEvent, MutationObserver, PermissionDenied,
};
pub use ownership::{OwnershipRecord, OwnershipRegistry, OWNERSHIP_STORE_NAME};
pub use session::SyncSession;
pub use transport::Connection;

pub use sphere_sync::{
	fields, Batch, ChangeData, ChangeRecord, FieldIndex, FieldSlot, FieldValue, Message, NodeKind,
	OwnerScope, PresenceState, RecordKind,
};
pub use uhlc::NTP64;

/// Watermark of the newest applied record timestamp per remote origin.
pub type TimestampPerOrigin = Arc<RwLock<HashMap<Uuid, NTP64>>>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("ownership store error: {0}")]
	OwnershipStore(#[from] ownership::StoreError),
	#[error("transport error: {0}")]
	Transport(#[from] transport::Error),
}

/// What the session broadcasts to the embedding editor.
#[derive(Clone, Debug)]
pub enum SyncEvent {
	/// A local mutation was captured and queued for the room.
	Created,
	/// A remote batch (or a deferred remainder of one) landed in the graph.
	Applied,
	Presence {
		replica: Uuid,
		state: PresenceState,
	},
	Disconnected,
}

/// State shared by capture, batcher, apply engine and session actors.
pub struct SharedState {
	pub host: Arc<dyn DocumentHost>,
	pub registry: Arc<OwnershipRegistry>,
	pub config: SyncConfig,
	pub replica: Uuid,
	pub room: Uuid,
	pub clock: HLC,
	pub sequence: AtomicU64,
	/// Cleared while the apply engine writes remote records into the host,
	/// so capture doesn't echo them back out.
	pub emit_records_flag: Arc<AtomicBool>,
	pub timestamps: TimestampPerOrigin,
	pub actors: Arc<Actors>,
	pub active: AtomicBool,
	pub active_notify: Notify,
}

impl RecordFactory for SharedState {
	fn clock(&self) -> &HLC {
		&self.clock
	}

	fn replica(&self) -> Uuid {
		self.replica
	}

	fn room(&self) -> Uuid {
		self.room
	}

	fn next_sequence(&self) -> u64 {
		self.sequence.fetch_add(1, Ordering::Relaxed) + 1
	}
}
