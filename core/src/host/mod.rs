use std::{collections::BTreeMap, sync::Arc};

use serde_json::Value;
use sphere_sync::{FieldIndex, FieldSlot, FieldValue, NodeKind};
use thiserror::Error;
use uuid::Uuid;

mod memory;

pub use memory::MemoryDocument;

/// Returned by a mutation observer to block a local edit at the source,
/// before the host applies it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("permission denied: node {node} is owned by replica {owner}")]
pub struct PermissionDenied {
	pub node: Uuid,
	pub owner: Uuid,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HostError {
	#[error("node not found: {0}")]
	NodeNotFound(Uuid),
	#[error("node already exists: {0}")]
	DuplicateNode(Uuid),
	#[error("kind {kind} has no field {field}")]
	UnknownField { kind: NodeKind, field: FieldIndex },
	#[error("field {field} of {kind} holds a {expected:?} value")]
	SlotMismatch {
		kind: NodeKind,
		field: FieldIndex,
		expected: FieldSlot,
	},
	#[error(transparent)]
	PermissionDenied(#[from] PermissionDenied),
}

/// One local graph mutation, reported synchronously by the host while it is
/// being applied. The kind rides along so observers can classify without a
/// lookup.
#[derive(Debug, Clone)]
pub enum MutationEvent {
	Created {
		node: Uuid,
		kind: NodeKind,
		fields: BTreeMap<FieldIndex, FieldValue>,
	},
	Deleted {
		node: Uuid,
		kind: NodeKind,
	},
	PrimitiveSet {
		node: Uuid,
		kind: NodeKind,
		field: FieldIndex,
		old: Value,
		new: Value,
	},
	PointerSet {
		node: Uuid,
		kind: NodeKind,
		field: FieldIndex,
		old: Option<Uuid>,
		new: Option<Uuid>,
	},
}

impl MutationEvent {
	#[must_use]
	pub const fn node(&self) -> Uuid {
		match self {
			Self::Created { node, .. }
			| Self::Deleted { node, .. }
			| Self::PrimitiveSet { node, .. }
			| Self::PointerSet { node, .. } => *node,
		}
	}

	#[must_use]
	pub const fn kind(&self) -> NodeKind {
		match self {
			Self::Created { kind, .. }
			| Self::Deleted { kind, .. }
			| Self::PrimitiveSet { kind, .. }
			| Self::PointerSet { kind, .. } => *kind,
		}
	}
}

/// An observer registered on the host's local-mutation stream. Called
/// synchronously before the mutation lands; returning an error vetoes it
/// and propagates to the mutating caller.
pub trait MutationObserver: Send + Sync {
	fn on_mutation(&self, event: &MutationEvent) -> Result<(), PermissionDenied>;
}

/// The capability set the engine consumes from the embedded editor's
/// document. Single-threaded cooperative discipline: the graph is only
/// mutated inside transactions, never concurrently from two paths.
pub trait DocumentHost: Send + Sync {
	fn create_node(
		&self,
		node: Uuid,
		kind: NodeKind,
		fields: BTreeMap<FieldIndex, FieldValue>,
	) -> Result<(), HostError>;

	/// `Ok(false)` when the node was already absent.
	fn delete_node(&self, node: Uuid) -> Result<bool, HostError>;

	fn set_primitive_field(
		&self,
		node: Uuid,
		field: FieldIndex,
		value: Value,
	) -> Result<(), HostError>;

	fn set_pointer_field(
		&self,
		node: Uuid,
		field: FieldIndex,
		target: Option<Uuid>,
	) -> Result<(), HostError>;

	fn find_node(&self, node: Uuid) -> Option<NodeKind>;

	fn node_fields(&self, node: Uuid) -> Option<BTreeMap<FieldIndex, FieldValue>>;

	fn nodes_of_kind(&self, kind: NodeKind) -> Vec<Uuid>;

	fn begin_transaction(&self);

	fn end_transaction(&self);

	fn subscribe_to_mutations(&self, observer: Arc<dyn MutationObserver>);
}
