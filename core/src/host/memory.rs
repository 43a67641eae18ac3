use std::{
	collections::{BTreeMap, HashMap},
	sync::{Arc, Mutex},
};

use serde_json::{json, Value};
use sphere_sync::{fields, FieldIndex, FieldSlot, FieldValue, NodeKind};
use uuid::Uuid;

use super::{DocumentHost, HostError, MutationEvent, MutationObserver};

#[derive(Debug, Clone)]
struct NodeState {
	kind: NodeKind,
	fields: BTreeMap<FieldIndex, FieldValue>,
}

#[derive(Default)]
struct Inner {
	nodes: HashMap<Uuid, NodeState>,
	observers: Vec<Arc<dyn MutationObserver>>,
	transaction_depth: u32,
}

/// In-memory reference implementation of [`DocumentHost`], used by the
/// editor shell and the test suite. Mutations apply eagerly; transactions
/// only track nesting so hosts that batch can substitute their own.
///
/// Observers run under the document lock and must not call back into it.
pub struct MemoryDocument {
	inner: Mutex<Inner>,
}

impl MemoryDocument {
	#[must_use]
	pub fn new() -> Self {
		Self {
			inner: Mutex::new(Inner::default()),
		}
	}

	/// A document with the structural skeleton every host creates on open,
	/// before any mutation observer attaches. Singleton ids are derived
	/// from the room id so that every replica of a room produces the same
	/// skeleton and replayed skeleton creates deduplicate.
	#[must_use]
	pub fn with_skeleton(room: Uuid) -> Self {
		let doc = Self::new();

		{
			let mut inner = doc.lock();

			inner.nodes.insert(
				Self::project_id(room),
				NodeState {
					kind: NodeKind::Project,
					fields: BTreeMap::from([
						(
							fields::project::TITLE,
							FieldValue::Primitive(json!("Untitled")),
						),
						(fields::project::TEMPO, FieldValue::Primitive(json!(120.0))),
						(
							fields::project::SIGNATURE,
							FieldValue::Primitive(json!("4/4")),
						),
						(fields::project::MASTER_TRACK, FieldValue::Pointer(None)),
					]),
				},
			);

			inner.nodes.insert(
				Self::view_state_id(room),
				NodeState {
					kind: NodeKind::ViewState,
					fields: BTreeMap::from([
						(fields::view_state::ZOOM, FieldValue::Primitive(json!(1.0))),
						(fields::view_state::SCROLL, FieldValue::Primitive(json!(0.0))),
						(fields::view_state::FOCUSED_TRACK, FieldValue::Pointer(None)),
					]),
				},
			);
		}

		doc
	}

	#[must_use]
	pub fn project_id(room: Uuid) -> Uuid {
		Uuid::new_v5(&room, b"project")
	}

	#[must_use]
	pub fn view_state_id(room: Uuid) -> Uuid {
		Uuid::new_v5(&room, b"view-state")
	}

	pub fn get_primitive(&self, node: Uuid, field: FieldIndex) -> Option<Value> {
		match self.lock().nodes.get(&node)?.fields.get(&field)? {
			FieldValue::Primitive(value) => Some(value.clone()),
			FieldValue::Pointer(_) => None,
		}
	}

	pub fn get_pointer(&self, node: Uuid, field: FieldIndex) -> Option<Option<Uuid>> {
		match self.lock().nodes.get(&node)?.fields.get(&field)? {
			FieldValue::Pointer(target) => Some(*target),
			FieldValue::Primitive(_) => None,
		}
	}

	#[must_use]
	pub fn node_count(&self) -> usize {
		self.lock().nodes.len()
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
		self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
	}

	fn validate(kind: NodeKind, field: FieldIndex, value: &FieldValue) -> Result<(), HostError> {
		match kind.field_slot(field) {
			None => Err(HostError::UnknownField { kind, field }),
			Some(expected) if expected != value.slot() => Err(HostError::SlotMismatch {
				kind,
				field,
				expected,
			}),
			Some(_) => Ok(()),
		}
	}

	fn notify(inner: &Inner, event: &MutationEvent) -> Result<(), HostError> {
		for observer in &inner.observers {
			observer.on_mutation(event)?;
		}

		Ok(())
	}
}

impl Default for MemoryDocument {
	fn default() -> Self {
		Self::new()
	}
}

impl DocumentHost for MemoryDocument {
	fn create_node(
		&self,
		node: Uuid,
		kind: NodeKind,
		fields: BTreeMap<FieldIndex, FieldValue>,
	) -> Result<(), HostError> {
		let mut inner = self.lock();

		if inner.nodes.contains_key(&node) {
			return Err(HostError::DuplicateNode(node));
		}

		for (&field, value) in &fields {
			Self::validate(kind, field, value)?;
		}

		Self::notify(
			&inner,
			&MutationEvent::Created {
				node,
				kind,
				fields: fields.clone(),
			},
		)?;

		inner.nodes.insert(node, NodeState { kind, fields });

		Ok(())
	}

	fn delete_node(&self, node: Uuid) -> Result<bool, HostError> {
		let mut inner = self.lock();

		let Some(state) = inner.nodes.get(&node) else {
			return Ok(false);
		};
		let kind = state.kind;

		Self::notify(&inner, &MutationEvent::Deleted { node, kind })?;

		inner.nodes.remove(&node);

		Ok(true)
	}

	fn set_primitive_field(
		&self,
		node: Uuid,
		field: FieldIndex,
		value: Value,
	) -> Result<(), HostError> {
		let mut inner = self.lock();

		let state = inner
			.nodes
			.get(&node)
			.ok_or(HostError::NodeNotFound(node))?;
		let kind = state.kind;

		Self::validate(kind, field, &FieldValue::Primitive(value.clone()))?;

		let old = match state.fields.get(&field) {
			Some(FieldValue::Primitive(old)) => old.clone(),
			_ => Value::Null,
		};

		Self::notify(
			&inner,
			&MutationEvent::PrimitiveSet {
				node,
				kind,
				field,
				old,
				new: value.clone(),
			},
		)?;

		if let Some(state) = inner.nodes.get_mut(&node) {
			state.fields.insert(field, FieldValue::Primitive(value));
		}

		Ok(())
	}

	fn set_pointer_field(
		&self,
		node: Uuid,
		field: FieldIndex,
		target: Option<Uuid>,
	) -> Result<(), HostError> {
		let mut inner = self.lock();

		let state = inner
			.nodes
			.get(&node)
			.ok_or(HostError::NodeNotFound(node))?;
		let kind = state.kind;

		Self::validate(kind, field, &FieldValue::Pointer(target))?;

		let old = match state.fields.get(&field) {
			Some(FieldValue::Pointer(old)) => *old,
			_ => None,
		};

		Self::notify(
			&inner,
			&MutationEvent::PointerSet {
				node,
				kind,
				field,
				old,
				new: target,
			},
		)?;

		if let Some(state) = inner.nodes.get_mut(&node) {
			state.fields.insert(field, FieldValue::Pointer(target));
		}

		Ok(())
	}

	fn find_node(&self, node: Uuid) -> Option<NodeKind> {
		self.lock().nodes.get(&node).map(|state| state.kind)
	}

	fn node_fields(&self, node: Uuid) -> Option<BTreeMap<FieldIndex, FieldValue>> {
		self.lock().nodes.get(&node).map(|state| state.fields.clone())
	}

	fn nodes_of_kind(&self, kind: NodeKind) -> Vec<Uuid> {
		self.lock()
			.nodes
			.iter()
			.filter(|(_, state)| state.kind == kind)
			.map(|(&node, _)| node)
			.collect()
	}

	fn begin_transaction(&self) {
		self.lock().transaction_depth += 1;
	}

	fn end_transaction(&self) {
		let mut inner = self.lock();
		inner.transaction_depth = inner.transaction_depth.saturating_sub(1);
	}

	fn subscribe_to_mutations(&self, observer: Arc<dyn MutationObserver>) {
		self.lock().observers.push(observer);
	}
}

#[cfg(test)]
mod tests {
	use sphere_sync::fields::track;

	use super::*;

	#[test]
	fn create_validates_field_schema() {
		let doc = MemoryDocument::new();
		let node = Uuid::new_v4();

		let err = doc
			.create_node(
				node,
				NodeKind::Track,
				BTreeMap::from([(99, FieldValue::Primitive(json!(1)))]),
			)
			.unwrap_err();
		assert!(matches!(err, HostError::UnknownField { field: 99, .. }));

		doc.create_node(
			node,
			NodeKind::Track,
			BTreeMap::from([(track::GAIN, FieldValue::Primitive(json!(0.5)))]),
		)
		.unwrap();

		assert_eq!(doc.get_primitive(node, track::GAIN), Some(json!(0.5)));
	}

	#[test]
	fn pointer_slot_rejects_primitive_value() {
		let doc = MemoryDocument::new();
		let node = Uuid::new_v4();

		doc.create_node(node, NodeKind::Track, BTreeMap::new())
			.unwrap();

		let err = doc
			.set_primitive_field(node, track::HEAD_REGION, json!(1.0))
			.unwrap_err();
		assert!(matches!(err, HostError::SlotMismatch { .. }));
	}

	#[test]
	fn skeleton_ids_are_deterministic_per_room() {
		let room = Uuid::new_v4();
		let a = MemoryDocument::with_skeleton(room);
		let b = MemoryDocument::with_skeleton(room);

		assert_eq!(
			a.nodes_of_kind(NodeKind::Project),
			b.nodes_of_kind(NodeKind::Project)
		);
		assert_eq!(a.node_count(), 2);
	}
}
