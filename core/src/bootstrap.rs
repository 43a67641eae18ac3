use sphere_sync::{Batch, ChangeRecord, NodeKind, RecordFactory};
use uuid::Uuid;

use crate::SharedState;

/// The host creates these silently when a document opens, before any
/// mutation observer attaches, so their create records never reach the
/// wire on their own. Every later record assumes they exist.
const SKELETON_KINDS: [NodeKind; 2] = [NodeKind::Project, NodeKind::ViewState];

/// Ordered create records reconstructing the minimal shared structural
/// skeleton from the local graph, served to joining replicas. Deterministic
/// order: kind rank first, then id.
pub fn skeleton_records(shared: &SharedState) -> Vec<ChangeRecord> {
	let mut records = Vec::new();

	for kind in SKELETON_KINDS {
		let mut nodes = shared.host.nodes_of_kind(kind);
		nodes.sort();

		for node in nodes {
			let Some(fields) = shared.host.node_fields(node) else {
				continue;
			};

			records.push(shared.create(node, kind, fields));
		}
	}

	records
}

/// Wraps a snapshot response for the normal apply path. The records keep
/// the serving replica as origin, so the requester's echo filter leaves
/// them alone.
pub fn snapshot_batch(room: Uuid, records: Vec<ChangeRecord>) -> Option<Batch> {
	let origin = records.first()?.origin;

	Some(Batch {
		room,
		origin,
		sequence: 0,
		is_initial_sync: true,
		records,
	})
}
