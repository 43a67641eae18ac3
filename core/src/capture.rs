use std::sync::{atomic::Ordering, Arc};

use async_channel as chan;
use sphere_sync::{ChangeRecord, Message, NodeKind, RecordFactory};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::{
	host::{MutationEvent, MutationObserver, PermissionDenied},
	ownership, SharedState, SyncEvent,
};

/// The synchronous observer on the host's local-mutation stream: filters
/// node kinds outside the collaboration allow-list, enforces local write
/// permission against the ownership registry, and emits exactly one change
/// record per accepted mutation into the batcher queue.
///
/// While the apply engine is writing remote records into the host the
/// emit flag is cleared and capture passes everything through untouched.
pub struct ChangeCapture {
	shared: Arc<SharedState>,
	records_tx: chan::Sender<ChangeRecord>,
	admin_tx: chan::Sender<Message>,
	events_tx: broadcast::Sender<SyncEvent>,
}

impl ChangeCapture {
	pub(crate) fn new(
		shared: Arc<SharedState>,
		records_tx: chan::Sender<ChangeRecord>,
		admin_tx: chan::Sender<Message>,
		events_tx: broadcast::Sender<SyncEvent>,
	) -> Arc<Self> {
		Arc::new(Self {
			shared,
			records_tx,
			admin_tx,
			events_tx,
		})
	}

	/// Local writes to an already-existing node are only accepted from its
	/// owner. Shared singletons have no owner and race last-write-wins.
	fn check_write_permission(&self, kind: NodeKind, node: Uuid) -> Result<(), PermissionDenied> {
		let Some(scope) = kind.owner_scope() else {
			return Ok(());
		};

		match self.shared.registry.lookup(self.shared.room, scope, node) {
			Some(owner) if owner != self.shared.replica => Err(PermissionDenied { node, owner }),
			_ => Ok(()),
		}
	}

	fn claim_for_creator(&self, kind: NodeKind, node: Uuid) -> Result<(), PermissionDenied> {
		let Some(scope) = kind.owner_scope() else {
			return Ok(());
		};

		let claimed_at = *self.shared.clock.new_timestamp().get_time();

		self.shared
			.registry
			.claim(self.shared.room, scope, node, self.shared.replica, claimed_at)
			.map_err(|e| {
				let ownership::Error::AlreadyOwned(owner) = e else {
					unreachable!("claim only fails with AlreadyOwned")
				};
				PermissionDenied { node, owner }
			})?;

		if self
			.admin_tx
			.try_send(Message::OwnershipClaim {
				room: self.shared.room,
				scope,
				node,
				owner: self.shared.replica,
			})
			.is_err()
		{
			warn!("Admin channel closed, ownership claim will not be broadcast");
		}

		Ok(())
	}
}

impl MutationObserver for ChangeCapture {
	fn on_mutation(&self, event: &MutationEvent) -> Result<(), PermissionDenied> {
		if !self.shared.emit_records_flag.load(Ordering::Relaxed) {
			// A remote batch is being applied, nothing to capture.
			return Ok(());
		}

		let kind = event.kind();
		if !kind.is_synced() {
			return Ok(());
		}

		let node = event.node();

		let record = match event {
			MutationEvent::Created { fields, .. } => {
				self.claim_for_creator(kind, node)?;
				self.shared.create(node, kind, fields.clone())
			}
			MutationEvent::Deleted { .. } => {
				self.check_write_permission(kind, node)?;
				self.shared.registry.forget_node(self.shared.room, node);
				self.shared.delete(node)
			}
			MutationEvent::PrimitiveSet {
				field, old, new, ..
			} => {
				self.check_write_permission(kind, node)?;
				self.shared
					.set_primitive(node, *field, old.clone(), new.clone())
			}
			MutationEvent::PointerSet {
				field, old, new, ..
			} => {
				self.check_write_permission(kind, node)?;
				self.shared.set_pointer(node, *field, *old, *new)
			}
		};

		if self.records_tx.try_send(record).is_err() {
			warn!("Batcher queue closed, dropping captured record");
			return Ok(());
		}

		self.events_tx.send(SyncEvent::Created).ok();

		Ok(())
	}
}
