
use std::collections::BTreeMap;

use mock_replica::Replica;
use serde_json::json;
use sphere_core::{
	fields::{region, track},
	ApplyError, Batch, ChangeData, ChangeRecord, DocumentHost, FieldValue, HostError,
	MemoryDocument, NodeKind, OwnerScope, NTP64,
};
use tracing_test::traced_test;
use uuid::Uuid;

fn remote_record(
	origin: Uuid,
	room: Uuid,
	sequence: u64,
	node: Uuid,
	data: ChangeData,
) -> ChangeRecord {
	ChangeRecord {
		origin,
		room,
		sequence,
		timestamp: NTP64(sequence),
		node,
		data,
	}
}

fn remote_batch(replica: &Replica, origin: Uuid, sequence: u64, records: Vec<ChangeRecord>) -> Batch {
	Batch {
		room: replica.room,
		origin,
		sequence,
		is_initial_sync: false,
		records,
	}
}

fn create(kind: NodeKind) -> ChangeData {
	ChangeData::Create {
		kind,
		fields: BTreeMap::new(),
	}
}

fn set_gain(value: f64) -> ChangeData {
	ChangeData::SetPrimitive {
		field: track::GAIN,
		old: json!(0.0),
		new: json!(value),
	}
}

// A creates a track and tweaks its gain inside one debounce window; B gets
// one batch with the create applied before the field write and ends up with
// the value and the ownership mirror.
#[tokio::test]
async fn create_and_edit_sync_to_the_peer() {
	let room = Uuid::new_v4();
	let a = Replica::new(room).await;
	let mut b = Replica::new(room).await;
	Replica::pair(&a, &b).await;

	let t1 = Uuid::new_v4();
	a.doc.create_node(t1, NodeKind::Track, BTreeMap::new()).unwrap();
	a.doc.set_primitive_field(t1, track::GAIN, json!(0.9)).unwrap();

	b.wait_applied().await;

	assert_eq!(b.doc.get_primitive(t1, track::GAIN), Some(json!(0.9)));
	assert_eq!(b.session.owners().get(&t1), Some(&a.id));
}

// A pointer write whose target's create arrives in a later batch resolves
// from the deferred list instead of failing.
#[tokio::test]
async fn deferred_pointer_resolves_when_the_create_lands() {
	let room = Uuid::new_v4();
	let a = Replica::new(room).await;
	let peer = Uuid::new_v4();

	let region42 = Uuid::new_v4();
	let file_a = Uuid::new_v4();

	a.session
		.apply
		.apply_batch(&remote_batch(
			&a,
			peer,
			1,
			vec![remote_record(peer, room, 1, region42, create(NodeKind::Region))],
		))
		.await;

	let report = a
		.session
		.apply
		.apply_batch(&remote_batch(
			&a,
			peer,
			2,
			vec![remote_record(
				peer,
				room,
				2,
				region42,
				ChangeData::SetPointer {
					field: region::SOURCE,
					old: None,
					new: Some(file_a),
				},
			)],
		))
		.await;

	assert_eq!(report.deferred, 1);
	assert_eq!(a.doc.get_pointer(region42, region::SOURCE), None);

	a.session
		.apply
		.apply_batch(&remote_batch(
			&a,
			peer,
			3,
			vec![remote_record(peer, room, 3, file_a, create(NodeKind::Asset))],
		))
		.await;

	let resolved = a.session.apply.sweep_deferred(false).await;

	assert_eq!(resolved.applied, 1);
	assert!(!a.session.apply.has_deferred());
	assert_eq!(
		a.doc.get_pointer(region42, region::SOURCE),
		Some(Some(file_a))
	);
}

// A field write racing a delete finds the node gone: the record is dropped
// as unresolvable, the node is not recreated, and the rest of the batch
// still applies.
#[tokio::test]
async fn delete_wins_over_a_concurrent_field_write() {
	let room = Uuid::new_v4();
	let a = Replica::new(room).await;
	let (peer_a, peer_b) = (Uuid::new_v4(), Uuid::new_v4());

	let x = Uuid::new_v4();
	let y = Uuid::new_v4();

	a.session
		.apply
		.apply_batch(&remote_batch(
			&a,
			peer_a,
			1,
			vec![
				remote_record(peer_a, room, 1, x, create(NodeKind::Track)),
				remote_record(peer_a, room, 2, y, create(NodeKind::Track)),
			],
		))
		.await;

	a.session
		.apply
		.apply_batch(&remote_batch(
			&a,
			peer_a,
			2,
			vec![remote_record(peer_a, room, 3, x, ChangeData::Delete)],
		))
		.await;

	let report = a
		.session
		.apply
		.apply_batch(&remote_batch(
			&a,
			peer_b,
			1,
			vec![
				remote_record(peer_b, room, 1, x, set_gain(0.2)),
				remote_record(peer_b, room, 2, y, set_gain(0.4)),
			],
		))
		.await;

	assert_eq!(report.applied, 1);
	assert_eq!(report.dropped.len(), 1);
	assert!(matches!(
		report.dropped[0].1,
		ApplyError::UnresolvableReference { node } if node == x
	));
	assert_eq!(a.doc.find_node(x), None);
	assert_eq!(a.doc.get_primitive(y, track::GAIN), Some(json!(0.4)));
}

#[tokio::test]
#[traced_test]
async fn blocked_record_is_dropped_after_the_retry_bound() {
	let room = Uuid::new_v4();
	let a = Replica::new(room).await;
	let peer = Uuid::new_v4();

	let region42 = Uuid::new_v4();
	let ghost = Uuid::new_v4();

	a.session
		.apply
		.apply_batch(&remote_batch(
			&a,
			peer,
			1,
			vec![remote_record(peer, room, 1, region42, create(NodeKind::Region))],
		))
		.await;

	let report = a
		.session
		.apply
		.apply_batch(&remote_batch(
			&a,
			peer,
			2,
			vec![remote_record(
				peer,
				room,
				2,
				region42,
				ChangeData::SetPointer {
					field: region::SOURCE,
					old: None,
					new: Some(ghost),
				},
			)],
		))
		.await;
	assert_eq!(report.deferred, 1);

	// Two charged sweeps exhaust the default bound.
	let first = a.session.apply.sweep_deferred(true).await;
	assert!(first.dropped.is_empty());
	assert!(a.session.apply.has_deferred());

	let second = a.session.apply.sweep_deferred(true).await;
	assert_eq!(second.dropped.len(), 1);
	assert!(!a.session.apply.has_deferred());
	assert!(matches!(
		second.dropped[0].1,
		ApplyError::UnresolvableReference { node } if node == ghost
	));
	assert!(logs_contain("never resolved within the retry bound"));

	assert_eq!(a.doc.get_pointer(region42, region::SOURCE), None);
}

#[tokio::test]
async fn applying_the_same_batch_twice_is_idempotent() {
	let room = Uuid::new_v4();
	let a = Replica::new(room).await;
	let peer = Uuid::new_v4();

	let t1 = Uuid::new_v4();
	let batch = remote_batch(
		&a,
		peer,
		1,
		vec![
			remote_record(peer, room, 1, t1, create(NodeKind::Track)),
			remote_record(peer, room, 2, t1, set_gain(0.9)),
		],
	);

	a.session.apply.apply_batch(&batch).await;
	let nodes_after_first = a.doc.node_count();

	let report = a.session.apply.apply_batch(&batch).await;

	assert!(report.dropped.is_empty());
	assert_eq!(report.duplicates, 1);
	assert_eq!(a.doc.node_count(), nodes_after_first);
	assert_eq!(a.doc.get_primitive(t1, track::GAIN), Some(json!(0.9)));
}

#[tokio::test]
async fn echo_of_our_own_batch_applies_nothing() {
	let room = Uuid::new_v4();
	let a = Replica::new(room).await;

	let t1 = Uuid::new_v4();
	let echoed = remote_batch(
		&a,
		a.id,
		7,
		vec![remote_record(a.id, room, 1, t1, create(NodeKind::Track))],
	);

	let report = a.session.apply.apply_batch(&echoed).await;

	assert_eq!(report.applied, 0);
	assert_eq!(a.doc.find_node(t1), None);
}

#[tokio::test]
async fn invalid_field_index_is_isolated_from_the_batch() {
	let room = Uuid::new_v4();
	let a = Replica::new(room).await;
	let peer = Uuid::new_v4();

	let t1 = Uuid::new_v4();
	a.session
		.apply
		.apply_batch(&remote_batch(
			&a,
			peer,
			1,
			vec![remote_record(peer, room, 1, t1, create(NodeKind::Track))],
		))
		.await;

	let report = a
		.session
		.apply
		.apply_batch(&remote_batch(
			&a,
			peer,
			2,
			vec![
				remote_record(
					peer,
					room,
					2,
					t1,
					ChangeData::SetPrimitive {
						field: 99,
						old: json!(null),
						new: json!(1),
					},
				),
				remote_record(peer, room, 3, t1, set_gain(0.5)),
			],
		))
		.await;

	assert_eq!(report.applied, 1);
	assert_eq!(report.dropped.len(), 1);
	assert!(matches!(
		report.dropped[0].1,
		ApplyError::Host(HostError::UnknownField { field: 99, .. })
	));
	assert_eq!(a.doc.get_primitive(t1, track::GAIN), Some(json!(0.5)));
}

#[tokio::test]
async fn edits_to_an_unowned_node_are_rejected_at_the_source() {
	let room = Uuid::new_v4();
	let a = Replica::new(room).await;
	let mut b = Replica::new(room).await;
	Replica::pair(&a, &b).await;

	let t1 = Uuid::new_v4();
	a.doc
		.create_node(
			t1,
			NodeKind::Track,
			BTreeMap::from([(track::GAIN, FieldValue::Primitive(json!(0.5)))]),
		)
		.unwrap();

	b.wait_applied().await;

	let err = b
		.doc
		.set_primitive_field(t1, track::GAIN, json!(0.1))
		.unwrap_err();

	assert!(matches!(
		err,
		HostError::PermissionDenied(ref denied) if denied.owner == a.id
	));
	// the veto left the graph untouched
	assert_eq!(b.doc.get_primitive(t1, track::GAIN), Some(json!(0.5)));
}

#[tokio::test]
async fn released_ownership_lets_the_peer_edit() {
	let room = Uuid::new_v4();
	let mut a = Replica::new(room).await;
	let mut b = Replica::new(room).await;
	Replica::pair(&a, &b).await;

	let t1 = Uuid::new_v4();
	a.doc.create_node(t1, NodeKind::Track, BTreeMap::new()).unwrap();
	b.wait_applied().await;

	a.session.release_node(OwnerScope::Tracks, t1).unwrap();
	b.wait_until(|b| !b.session.owners().contains_key(&t1)).await;

	b.doc.set_primitive_field(t1, track::GAIN, json!(0.3)).unwrap();
	a.wait_applied().await;

	assert_eq!(a.doc.get_primitive(t1, track::GAIN), Some(json!(0.3)));
}

// A replica whose host never created the room skeleton receives it through
// snapshot bootstrap, and records addressed to the root resolve afterwards.
#[tokio::test]
async fn snapshot_bootstrap_replays_the_skeleton() {
	let room = Uuid::new_v4();
	let a = Replica::new(room).await;
	let b = Replica::bare(room).await;
	Replica::pair(&a, &b).await;

	let project = MemoryDocument::project_id(room);
	assert_eq!(b.doc.find_node(project), Some(NodeKind::Project));
	assert_eq!(b.doc.node_count(), 2);
	// the replica that already had the skeleton deduplicated it
	assert_eq!(a.doc.node_count(), 2);

	a.doc
		.set_primitive_field(project, sphere_core::fields::project::TEMPO, json!(128.0))
		.unwrap();

	b.wait_until(|b| {
		b.doc.get_primitive(project, sphere_core::fields::project::TEMPO) == Some(json!(128.0))
	})
	.await;
}

#[tokio::test]
async fn detach_surfaces_as_a_disconnect_on_the_peer() {
	let room = Uuid::new_v4();
	let a = Replica::new(room).await;
	let b = Replica::new(room).await;
	Replica::pair(&a, &b).await;

	assert!(a.session.is_active());
	assert!(b.session.is_active());

	a.session.detach().await;

	b.wait_until(|b| !b.session.is_active()).await;
	assert!(!a.session.is_active());
}
