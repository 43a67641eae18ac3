use std::{
	collections::{BTreeMap, HashMap, HashSet},
	num::NonZeroU128,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex, MutexGuard,
	},
};

use sphere_sync::{Batch, ChangeData, ChangeRecord, NodeKind, FieldIndex, FieldValue, NTP64};
use tracing::{debug, instrument, trace, warn};
use uhlc::Timestamp;
use uuid::Uuid;

use crate::{host::HostError, SharedState};

/// Per-record failure inside a batch. Failures accumulate into the batch
/// report and are never escalated to a batch or connection error.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ApplyError {
	#[error("reference to {node} never resolved within the retry bound")]
	UnresolvableReference { node: Uuid },
	#[error(transparent)]
	Host(#[from] HostError),
}

#[derive(Debug, Default)]
pub struct ApplyReport {
	pub applied: usize,
	/// Records that were already in effect; duplicate delivery is silent.
	pub duplicates: usize,
	/// Records parked on the deferred list waiting for their dependency.
	pub deferred: usize,
	pub dropped: Vec<(ChangeRecord, ApplyError)>,
}

struct Deferred {
	record: ChangeRecord,
	attempts: u32,
}

enum SetOutcome {
	Applied,
	Blocked,
	Dropped(ApplyError),
}

/// Applies inbound batches to the local graph: one host transaction per
/// batch, creates before deletes before field writes, dependency-blocked
/// records deferred and retried under a fixed bound, every failure isolated
/// to its own record.
pub struct ApplyEngine {
	shared: Arc<SharedState>,
	deferred: Mutex<Vec<Deferred>>,
	/// Ids deleted this session. A record addressed to one is permanently
	/// unresolvable and must never recreate the node.
	tombstones: Mutex<HashSet<Uuid>>,
}

impl ApplyEngine {
	pub(crate) fn new(shared: Arc<SharedState>) -> Arc<Self> {
		Arc::new(Self {
			shared,
			deferred: Mutex::new(Vec::new()),
			tombstones: Mutex::new(HashSet::new()),
		})
	}

	#[instrument(
		skip(self, batch),
		fields(
			origin = %batch.origin,
			sequence = batch.sequence,
			records = batch.records.len(),
			initial = batch.is_initial_sync,
		)
	)]
	pub async fn apply_batch(&self, batch: &Batch) -> ApplyReport {
		let mut report = ApplyReport::default();

		if batch.origin == self.shared.replica {
			trace!("Ignoring echo of our own batch;");
			return report;
		}

		if batch.room != self.shared.room {
			warn!(room = %batch.room, "Batch addressed to another room;");
			return report;
		}

		let mut records = batch
			.records
			.iter()
			.filter(|record| record.origin != self.shared.replica)
			.collect::<Vec<_>>();

		if records.is_empty() {
			return report;
		}

		self.update_clock(&records).await;

		// Don't trust the sender's ordering; regroup locally.
		records.sort_by_key(|record| record.data.kind().priority());

		let _capture = CaptureSuppression::new(&self.shared.emit_records_flag);
		let _transaction = TransactionGuard::begin(&self.shared);

		let mut field_sets = Vec::new();

		for record in records {
			match &record.data {
				ChangeData::Create { kind, fields } => {
					self.apply_create(record, *kind, fields, &mut report);
				}
				ChangeData::Delete => self.apply_delete(record, &mut report),
				ChangeData::SetPrimitive { .. } | ChangeData::SetPointer { .. } => {
					field_sets.push(record);
				}
			}
		}

		for record in field_sets {
			match self.apply_field_set(record) {
				SetOutcome::Applied => report.applied += 1,
				SetOutcome::Blocked => {
					trace!(node = %record.node, "Deferring dependency-blocked record;");
					self.lock_deferred().push(Deferred {
						record: record.clone(),
						attempts: 0,
					});
					report.deferred += 1;
				}
				SetOutcome::Dropped(e) => report.dropped.push((record.clone(), e)),
			}
		}

		debug!(
			applied = report.applied,
			deferred = report.deferred,
			dropped = report.dropped.len(),
			"Batch applied;"
		);

		report
	}

	/// One pass over the deferred list. The opportunistic pass after each
	/// batch does not charge an attempt; the timer-driven sweeps do, and a
	/// record that exhausts the bound is dropped as unresolvable.
	pub async fn sweep_deferred(&self, charge_attempt: bool) -> ApplyReport {
		let queue = std::mem::take(&mut *self.lock_deferred());

		let mut report = ApplyReport::default();

		if queue.is_empty() {
			return report;
		}

		let _capture = CaptureSuppression::new(&self.shared.emit_records_flag);
		let _transaction = TransactionGuard::begin(&self.shared);

		let mut still_blocked = Vec::new();

		for mut item in queue {
			match self.apply_field_set(&item.record) {
				SetOutcome::Applied => report.applied += 1,
				SetOutcome::Blocked => {
					if charge_attempt {
						item.attempts += 1;
					}

					if item.attempts >= self.shared.config.retry_attempts {
						let node = item.record.node;
						warn!(%node, "Reference never resolved within the retry bound, dropping record;");
						report
							.dropped
							.push((item.record, ApplyError::UnresolvableReference { node }));
					} else {
						still_blocked.push(item);
					}
				}
				SetOutcome::Dropped(e) => report.dropped.push((item.record, e)),
			}
		}

		self.lock_deferred().extend(still_blocked);

		report
	}

	#[must_use]
	pub fn has_deferred(&self) -> bool {
		!self.lock_deferred().is_empty()
	}

	fn apply_create(
		&self,
		record: &ChangeRecord,
		kind: NodeKind,
		fields: &BTreeMap<FieldIndex, FieldValue>,
		report: &mut ApplyReport,
	) {
		let node = record.node;

		if self.lock_tombstones().contains(&node) {
			// Delete wins; never recreate.
			report
				.dropped
				.push((record.clone(), ApplyError::UnresolvableReference { node }));
			return;
		}

		if self.shared.host.find_node(node).is_some() {
			report.duplicates += 1;
			return;
		}

		let mut valid = BTreeMap::new();
		for (&field, value) in fields {
			match kind.field_slot(field) {
				Some(slot) if slot == value.slot() => {
					valid.insert(field, value.clone());
				}
				_ => warn!(%node, %kind, field, "Skipping initial field the schema rejects;"),
			}
		}

		match self.shared.host.create_node(node, kind, valid) {
			Ok(()) => {
				report.applied += 1;

				if let Some(scope) = kind.owner_scope() {
					self.shared.registry.mirror_claim(
						self.shared.room,
						scope,
						node,
						record.origin,
						record.timestamp,
					);
				}
			}
			Err(e) => report.dropped.push((record.clone(), e.into())),
		}
	}

	fn apply_delete(&self, record: &ChangeRecord, report: &mut ApplyReport) {
		let node = record.node;

		self.lock_tombstones().insert(node);

		match self.shared.host.delete_node(node) {
			Ok(true) => {
				report.applied += 1;
				self.shared.registry.forget_node(self.shared.room, node);
			}
			Ok(false) => report.duplicates += 1,
			Err(e) => report.dropped.push((record.clone(), e.into())),
		}
	}

	fn apply_field_set(&self, record: &ChangeRecord) -> SetOutcome {
		let node = record.node;

		if self.lock_tombstones().contains(&node) {
			return SetOutcome::Dropped(ApplyError::UnresolvableReference { node });
		}

		let result = match &record.data {
			ChangeData::SetPrimitive { field, new, .. } => {
				self.shared.host.set_primitive_field(node, *field, new.clone())
			}
			ChangeData::SetPointer { field, new, .. } => {
				// The pointed-at node must exist too, or the write waits for
				// its create.
				if let Some(target) = new {
					if self.lock_tombstones().contains(target) {
						return SetOutcome::Dropped(ApplyError::UnresolvableReference {
							node: *target,
						});
					}

					if self.shared.host.find_node(*target).is_none() {
						return SetOutcome::Blocked;
					}
				}

				self.shared.host.set_pointer_field(node, *field, *new)
			}
			ChangeData::Create { .. } | ChangeData::Delete => {
				unreachable!("creates and deletes are applied in their own pass")
			}
		};

		match result {
			Ok(()) => SetOutcome::Applied,
			Err(HostError::NodeNotFound(_)) => SetOutcome::Blocked,
			Err(e) => SetOutcome::Dropped(e.into()),
		}
	}

	async fn update_clock(&self, records: &[&ChangeRecord]) {
		let mut latest: HashMap<Uuid, NTP64> = HashMap::new();

		for record in records {
			// A drifting remote clock is the remote's problem, not a reason
			// to reject its records.
			if let Some(id) = NonZeroU128::new(record.origin.to_u128_le()) {
				if self
					.shared
					.clock
					.update_with_timestamp(&Timestamp::new(record.timestamp, uhlc::ID::from(id)))
					.is_err()
				{
					warn!(origin = %record.origin, "Remote timestamp drifted too far, clock left alone;");
				}
			}

			latest
				.entry(record.origin)
				.and_modify(|ts| *ts = NTP64::max(*ts, record.timestamp))
				.or_insert(record.timestamp);
		}

		let mut timestamps = self.shared.timestamps.write().await;
		for (origin, timestamp) in latest {
			timestamps
				.entry(origin)
				.and_modify(|ts| *ts = NTP64::max(*ts, timestamp))
				.or_insert(timestamp);
		}
	}

	fn lock_deferred(&self) -> MutexGuard<'_, Vec<Deferred>> {
		self.deferred
			.lock()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
	}

	fn lock_tombstones(&self) -> MutexGuard<'_, HashSet<Uuid>> {
		self.tombstones
			.lock()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
	}
}

/// Clears the capture flag for the duration of a remote apply so the
/// observer doesn't re-emit remote mutations as local records.
struct CaptureSuppression<'flag> {
	flag: &'flag AtomicBool,
}

impl<'flag> CaptureSuppression<'flag> {
	fn new(flag: &'flag AtomicBool) -> Self {
		flag.store(false, Ordering::Relaxed);
		Self { flag }
	}
}

impl Drop for CaptureSuppression<'_> {
	fn drop(&mut self) {
		self.flag.store(true, Ordering::Relaxed);
	}
}

/// Commits on drop, so per-record failures and deferrals never roll the
/// rest of the batch back.
struct TransactionGuard<'shared> {
	shared: &'shared SharedState,
}

impl<'shared> TransactionGuard<'shared> {
	fn begin(shared: &'shared SharedState) -> Self {
		shared.host.begin_transaction();
		Self { shared }
	}
}

impl Drop for TransactionGuard<'_> {
	fn drop(&mut self) {
		self.shared.host.end_transaction();
	}
}
