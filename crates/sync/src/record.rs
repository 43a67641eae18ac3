use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uhlc::NTP64;
use uuid::Uuid;

/// Fields are addressed by index, not name. Each kind declares which indices
/// exist and whether they hold a primitive or a pointer.
pub type FieldIndex = u16;

/// The two independent ownership namespaces. A logical collaboration unit is
/// a small linked cluster of nodes claimed together; claims are keyed on the
/// cluster's primary, which lives in one of these namespaces.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OwnerScope {
	Tracks,
	Regions,
}

impl fmt::Display for OwnerScope {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Tracks => write!(f, "tracks"),
			Self::Regions => write!(f, "regions"),
		}
	}
}

/// What a field index holds for a given kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldSlot {
	Primitive,
	Pointer,
}

/// Node type vocabulary of the shared document graph.
///
/// `Preview` exists in host documents but is outside the collaboration
/// allow-list: local monitoring state never leaves the replica.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
	Track,
	Region,
	Asset,
	Project,
	ViewState,
	Preview,
}

/// Field indices per kind, so call sites don't carry bare numbers around.
pub mod fields {
	use super::FieldIndex;

	pub mod track {
		use super::FieldIndex;

		pub const NAME: FieldIndex = 0;
		pub const COLOR: FieldIndex = 1;
		pub const MUTED: FieldIndex = 2;
		pub const GAIN: FieldIndex = 3;
		pub const HEAD_REGION: FieldIndex = 4;
	}

	pub mod region {
		use super::FieldIndex;

		pub const NAME: FieldIndex = 0;
		pub const START: FieldIndex = 1;
		pub const LENGTH: FieldIndex = 2;
		pub const SOURCE: FieldIndex = 3;
		pub const NEXT: FieldIndex = 4;
	}

	pub mod asset {
		use super::FieldIndex;

		pub const NAME: FieldIndex = 0;
		pub const DURATION: FieldIndex = 1;
		pub const SAMPLE_RATE: FieldIndex = 2;
	}

	pub mod project {
		use super::FieldIndex;

		pub const TITLE: FieldIndex = 0;
		pub const TEMPO: FieldIndex = 1;
		pub const SIGNATURE: FieldIndex = 2;
		pub const MASTER_TRACK: FieldIndex = 3;
	}

	pub mod view_state {
		use super::FieldIndex;

		pub const ZOOM: FieldIndex = 0;
		pub const SCROLL: FieldIndex = 1;
		pub const FOCUSED_TRACK: FieldIndex = 2;
	}
}

impl NodeKind {
	/// Whether mutations of this kind are captured and synced at all.
	#[must_use]
	pub const fn is_synced(self) -> bool {
		!matches!(self, Self::Preview)
	}

	/// Shared singletons are never owned; writes race last-write-wins.
	#[must_use]
	pub const fn is_shared(self) -> bool {
		matches!(self, Self::Project | Self::ViewState)
	}

	/// The ownership namespace this kind's claims live in, if it is owned
	/// at all.
	#[must_use]
	pub const fn owner_scope(self) -> Option<OwnerScope> {
		match self {
			Self::Track => Some(OwnerScope::Tracks),
			Self::Region | Self::Asset => Some(OwnerScope::Regions),
			Self::Project | Self::ViewState | Self::Preview => None,
		}
	}

	/// The tagged field schema for this kind. `None` means the index does
	/// not exist for the kind and any record addressing it is invalid.
	#[must_use]
	pub const fn field_slot(self, field: FieldIndex) -> Option<FieldSlot> {
		use FieldSlot::{Pointer, Primitive};

		match (self, field) {
			(Self::Track, fields::track::NAME..=fields::track::GAIN)
			| (Self::Region, fields::region::NAME..=fields::region::LENGTH)
			| (Self::Asset, fields::asset::NAME..=fields::asset::SAMPLE_RATE)
			| (Self::Project, fields::project::TITLE..=fields::project::SIGNATURE)
			| (Self::ViewState, fields::view_state::ZOOM..=fields::view_state::SCROLL) => {
				Some(Primitive)
			}
			(Self::Track, fields::track::HEAD_REGION)
			| (Self::Region, fields::region::SOURCE | fields::region::NEXT)
			| (Self::Project, fields::project::MASTER_TRACK)
			| (Self::ViewState, fields::view_state::FOCUSED_TRACK) => Some(Pointer),
			_ => None,
		}
	}
}

impl fmt::Display for NodeKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Track => write!(f, "Track"),
			Self::Region => write!(f, "Region"),
			Self::Asset => write!(f, "Asset"),
			Self::Project => write!(f, "Project"),
			Self::ViewState => write!(f, "ViewState"),
			Self::Preview => write!(f, "Preview"),
		}
	}
}

/// A field's content: either a primitive value or a pointer to another
/// node's identifier.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum FieldValue {
	Primitive(Value),
	Pointer(Option<Uuid>),
}

impl FieldValue {
	#[must_use]
	pub const fn slot(&self) -> FieldSlot {
		match self {
			Self::Primitive(_) => FieldSlot::Primitive,
			Self::Pointer(_) => FieldSlot::Pointer,
		}
	}
}

/// One atomic graph mutation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum ChangeData {
	Create {
		kind: NodeKind,
		fields: BTreeMap<FieldIndex, FieldValue>,
	},
	Delete,
	SetPrimitive {
		field: FieldIndex,
		old: Value,
		new: Value,
	},
	SetPointer {
		field: FieldIndex,
		old: Option<Uuid>,
		new: Option<Uuid>,
	},
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordKind {
	Create,
	Delete,
	SetPrimitive,
	SetPointer,
}

impl RecordKind {
	/// Flush priority inside a batch: creates must precede anything that
	/// addresses the new node, deletes must precede field writes on doomed
	/// nodes, primitives settle before pointers are wired.
	#[must_use]
	pub const fn priority(self) -> u8 {
		match self {
			Self::Create => 0,
			Self::Delete => 1,
			Self::SetPrimitive => 2,
			Self::SetPointer => 3,
		}
	}
}

impl fmt::Display for RecordKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Create => write!(f, "c"),
			Self::Delete => write!(f, "d"),
			Self::SetPrimitive => write!(f, "sp"),
			Self::SetPointer => write!(f, "sx"),
		}
	}
}

impl ChangeData {
	#[must_use]
	pub const fn kind(&self) -> RecordKind {
		match self {
			Self::Create { .. } => RecordKind::Create,
			Self::Delete => RecordKind::Delete,
			Self::SetPrimitive { .. } => RecordKind::SetPrimitive,
			Self::SetPointer { .. } => RecordKind::SetPointer,
		}
	}
}

/// A serialized description of one atomic graph mutation, immutable once
/// emitted. `sequence` is per-origin and monotonic; `timestamp` is the
/// origin's hybrid logical clock at emission.
#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct ChangeRecord {
	pub origin: Uuid,
	pub room: Uuid,
	pub sequence: u64,
	pub timestamp: NTP64,
	pub node: Uuid,
	pub data: ChangeData,
}

impl fmt::Debug for ChangeRecord {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ChangeRecord")
			.field("origin", &self.origin.to_string())
			.field("sequence", &self.sequence)
			.field("node", &self.node.to_string())
			.field("data", &self.data)
			.finish()
	}
}

/// An ordered group of change records sharing one causal window.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Batch {
	pub room: Uuid,
	pub origin: Uuid,
	pub sequence: u64,
	pub is_initial_sync: bool,
	pub records: Vec<ChangeRecord>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn schema_rejects_unknown_indices() {
		assert_eq!(
			NodeKind::Track.field_slot(fields::track::GAIN),
			Some(FieldSlot::Primitive)
		);
		assert_eq!(
			NodeKind::Region.field_slot(fields::region::SOURCE),
			Some(FieldSlot::Pointer)
		);
		assert_eq!(NodeKind::Track.field_slot(99), None);
		assert_eq!(NodeKind::Preview.field_slot(0), None);
	}

	#[test]
	fn shared_kinds_have_no_owner_scope() {
		assert_eq!(NodeKind::Project.owner_scope(), None);
		assert_eq!(NodeKind::ViewState.owner_scope(), None);
		assert_eq!(NodeKind::Track.owner_scope(), Some(OwnerScope::Tracks));
		assert_eq!(NodeKind::Asset.owner_scope(), Some(OwnerScope::Regions));
	}

	#[test]
	fn flush_priority_orders_creates_first() {
		let mut kinds = [
			RecordKind::SetPointer,
			RecordKind::Create,
			RecordKind::SetPrimitive,
			RecordKind::Delete,
		];
		kinds.sort_by_key(|k| k.priority());

		assert_eq!(
			kinds,
			[
				RecordKind::Create,
				RecordKind::Delete,
				RecordKind::SetPrimitive,
				RecordKind::SetPointer,
			]
		);
	}
}
