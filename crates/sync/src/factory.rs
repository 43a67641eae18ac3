use std::collections::BTreeMap;

use serde_json::Value;
use uhlc::HLC;
use uuid::Uuid;

use crate::{ChangeData, ChangeRecord, FieldIndex, FieldValue, NodeKind};

/// Implemented by whatever hands out change records for a replica: it owns
/// the hybrid logical clock and the per-origin sequence counter, so records
/// come out stamped and ordered.
pub trait RecordFactory {
	fn clock(&self) -> &HLC;
	fn replica(&self) -> Uuid;
	fn room(&self) -> Uuid;
	fn next_sequence(&self) -> u64;

	fn new_record(&self, node: Uuid, data: ChangeData) -> ChangeRecord {
		ChangeRecord {
			origin: self.replica(),
			room: self.room(),
			sequence: self.next_sequence(),
			timestamp: *self.clock().new_timestamp().get_time(),
			node,
			data,
		}
	}

	fn create(
		&self,
		node: Uuid,
		kind: NodeKind,
		fields: BTreeMap<FieldIndex, FieldValue>,
	) -> ChangeRecord {
		self.new_record(node, ChangeData::Create { kind, fields })
	}

	fn delete(&self, node: Uuid) -> ChangeRecord {
		self.new_record(node, ChangeData::Delete)
	}

	fn set_primitive(&self, node: Uuid, field: FieldIndex, old: Value, new: Value) -> ChangeRecord {
		self.new_record(node, ChangeData::SetPrimitive { field, old, new })
	}

	fn set_pointer(
		&self,
		node: Uuid,
		field: FieldIndex,
		old: Option<Uuid>,
		new: Option<Uuid>,
	) -> ChangeRecord {
		self.new_record(node, ChangeData::SetPointer { field, old, new })
	}
}
