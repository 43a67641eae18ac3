use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Batch, ChangeRecord, OwnerScope};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresenceState {
	Joined,
	Active,
	Away,
	Left,
}

/// Everything that travels over a room connection, batches and
/// administrative traffic alike. Delivery is ordered per connection,
/// at-least-once; there is no cross-replica global order.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum Message {
	UpdateBatch(Batch),
	SnapshotRequest {
		room: Uuid,
		replica: Uuid,
	},
	SnapshotResponse {
		room: Uuid,
		records: Vec<ChangeRecord>,
	},
	OwnershipClaim {
		room: Uuid,
		scope: OwnerScope,
		node: Uuid,
		owner: Uuid,
	},
	OwnershipRelease {
		room: Uuid,
		scope: OwnerScope,
		node: Uuid,
		owner: Uuid,
	},
	Presence {
		room: Uuid,
		replica: Uuid,
		state: PresenceState,
	},
}

impl Message {
	pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
		rmp_serde::to_vec_named(self)
	}

	pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
		rmp_serde::from_slice(bytes)
	}
}
