use std::{
	collections::HashMap,
	path::PathBuf,
	sync::{Arc, RwLock},
};

use async_channel as chan;
use serde::{Deserialize, Serialize};
use sphere_actors::Stopper;
use sphere_sync::{OwnerScope, NTP64};
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// File name of the durable ownership store inside the replica's data
/// directory.
pub const OWNERSHIP_STORE_NAME: &str = "ownership.sphereconfig";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
	#[error("node is already owned by replica {0}")]
	AlreadyOwned(Uuid),
	#[error("release denied, node is owned by {0:?}")]
	NotOwner(Option<Uuid>),
}

#[derive(Error, Debug)]
pub enum StoreError {
	#[error("ownership store io: {0}")]
	Io(#[from] std::io::Error),
	#[error("ownership store serialization: {0}")]
	Serialization(#[from] serde_json::Error),
}

/// One durable row: `(room, scope, node) → (owner, claimed_at)`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OwnershipRecord {
	pub room: Uuid,
	pub scope: OwnerScope,
	pub node: Uuid,
	pub owner: Uuid,
	pub claimed_at: NTP64,
}

type Key = (Uuid, OwnerScope, Uuid);

/// The single arbiter of local write permission. Consulted synchronously
/// before a local mutation is accepted and advisorily before a remote one
/// is trusted; at most one active owner per key, absence means
/// unclaimed/shared.
///
/// Rows live in memory and are flushed to disk by the persister actor, so
/// ownership survives reconnects and restarts.
pub struct OwnershipRegistry {
	path: PathBuf,
	rows: RwLock<HashMap<Key, (Uuid, NTP64)>>,
	dirty_tx: chan::Sender<()>,
	dirty_rx: chan::Receiver<()>,
}

impl OwnershipRegistry {
	/// Loads the store from `path`, starting empty if the file does not
	/// exist yet.
	pub async fn load(path: PathBuf) -> Result<Self, StoreError> {
		let rows = match tokio::fs::read(&path).await {
			Ok(bytes) => serde_json::from_slice::<Vec<OwnershipRecord>>(&bytes)?
				.into_iter()
				.map(|r| ((r.room, r.scope, r.node), (r.owner, r.claimed_at)))
				.collect(),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
			Err(e) => return Err(e.into()),
		};

		let (dirty_tx, dirty_rx) = chan::unbounded();

		Ok(Self {
			path,
			rows: RwLock::new(rows),
			dirty_tx,
			dirty_rx,
		})
	}

	/// Claims a node for `owner`. Succeeds when unclaimed or already held
	/// by the same replica; a duplicate claim is a no-op so replayed
	/// creates stay idempotent.
	pub fn claim(
		&self,
		room: Uuid,
		scope: OwnerScope,
		node: Uuid,
		owner: Uuid,
		claimed_at: NTP64,
	) -> Result<(), Error> {
		{
			let mut rows = self.write();

			match rows.get(&(room, scope, node)).copied() {
				Some((current, _)) if current != owner => {
					return Err(Error::AlreadyOwned(current))
				}
				Some(_) => return Ok(()),
				None => {
					rows.insert((room, scope, node), (owner, claimed_at));
				}
			}
		}

		self.mark_dirty();

		Ok(())
	}

	/// Grants ownership to a remote origin in the local mirror. Ownership
	/// is cooperative, so a conflicting grant is logged and the first
	/// writer kept rather than escalated.
	pub fn mirror_claim(
		&self,
		room: Uuid,
		scope: OwnerScope,
		node: Uuid,
		owner: Uuid,
		claimed_at: NTP64,
	) {
		match self.claim(room, scope, node, owner, claimed_at) {
			Ok(()) => {}
			Err(Error::AlreadyOwned(current)) => {
				debug!(%node, %owner, %current, "Conflicting remote claim ignored;");
			}
			Err(e) => warn!(?e, "Unexpected mirror claim failure;"),
		}
	}

	/// Releases a node. Only the current owner may release.
	pub fn release(
		&self,
		room: Uuid,
		scope: OwnerScope,
		node: Uuid,
		owner: Uuid,
	) -> Result<(), Error> {
		{
			let mut rows = self.write();

			match rows.get(&(room, scope, node)).copied() {
				Some((current, _)) if current == owner => {
					rows.remove(&(room, scope, node));
				}
				current => return Err(Error::NotOwner(current.map(|(owner, _)| owner))),
			}
		}

		self.mark_dirty();

		Ok(())
	}

	pub fn mirror_release(&self, room: Uuid, scope: OwnerScope, node: Uuid, owner: Uuid) {
		if let Err(e) = self.release(room, scope, node, owner) {
			debug!(%node, %owner, ?e, "Remote release did not match local mirror;");
		}
	}

	#[must_use]
	pub fn lookup(&self, room: Uuid, scope: OwnerScope, node: Uuid) -> Option<Uuid> {
		self.read().get(&(room, scope, node)).map(|&(owner, _)| owner)
	}

	/// Drops every row for a deleted node, whichever scope it was claimed
	/// under.
	pub fn forget_node(&self, room: Uuid, node: Uuid) {
		let removed = {
			let mut rows = self.write();
			let before = rows.len();
			rows.retain(|&(r, _, n), _| !(r == room && n == node));
			before - rows.len()
		};

		if removed > 0 {
			self.mark_dirty();
		}
	}

	/// `node → owner` for every claimed node in the room; feeds the host
	/// presentation layer's ownership indicators.
	#[must_use]
	pub fn owners_in(&self, room: Uuid) -> HashMap<Uuid, Uuid> {
		self.read()
			.iter()
			.filter(|(&(r, _, _), _)| r == room)
			.map(|(&(_, _, node), &(owner, _))| (node, owner))
			.collect()
	}

	/// Flushes rows to disk whenever a change is signalled; declared as the
	/// "Ownership Persister" actor.
	pub async fn run_persister(self: Arc<Self>, stop: Stopper) {
		loop {
			let stopped = async {
				(&stop).await;
				true
			};
			let dirtied = async { self.dirty_rx.recv().await.is_err() };

			use futures_concurrency::future::Race;

			let closed = (dirtied, stopped).race().await;

			// Collapse a burst of signals into one write.
			while self.dirty_rx.try_recv().is_ok() {}

			if let Err(e) = self.persist().await {
				error!(?e, "Failed to persist ownership store;");
			}

			if closed || stop.check_stop() {
				break;
			}
		}
	}

	async fn persist(&self) -> Result<(), StoreError> {
		let records = self
			.read()
			.iter()
			.map(|(&(room, scope, node), &(owner, claimed_at))| OwnershipRecord {
				room,
				scope,
				node,
				owner,
				claimed_at,
			})
			.collect::<Vec<_>>();

		tokio::fs::write(&self.path, serde_json::to_vec_pretty(&records)?).await?;

		Ok(())
	}

	fn mark_dirty(&self) {
		if self.dirty_tx.try_send(()).is_err() {
			warn!("Ownership persister channel closed, store will go stale");
		}
	}

	fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Key, (Uuid, NTP64)>> {
		self.rows
			.read()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
	}

	fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Key, (Uuid, NTP64)>> {
		self.rows
			.write()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ts() -> NTP64 {
		NTP64(0)
	}

	#[tokio::test]
	async fn second_claim_reports_current_owner() {
		let dir = tempfile::tempdir().unwrap();
		let registry = OwnershipRegistry::load(dir.path().join(OWNERSHIP_STORE_NAME))
			.await
			.unwrap();

		let (room, node) = (Uuid::new_v4(), Uuid::new_v4());
		let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

		registry
			.claim(room, OwnerScope::Tracks, node, a, ts())
			.unwrap();
		// same owner re-claim is a no-op
		registry
			.claim(room, OwnerScope::Tracks, node, a, ts())
			.unwrap();

		assert_eq!(
			registry.claim(room, OwnerScope::Tracks, node, b, ts()),
			Err(Error::AlreadyOwned(a))
		);
		assert_eq!(registry.lookup(room, OwnerScope::Tracks, node), Some(a));
	}

	#[tokio::test]
	async fn release_requires_current_owner() {
		let dir = tempfile::tempdir().unwrap();
		let registry = OwnershipRegistry::load(dir.path().join(OWNERSHIP_STORE_NAME))
			.await
			.unwrap();

		let (room, node) = (Uuid::new_v4(), Uuid::new_v4());
		let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

		registry
			.claim(room, OwnerScope::Regions, node, a, ts())
			.unwrap();

		assert_eq!(
			registry.release(room, OwnerScope::Regions, node, b),
			Err(Error::NotOwner(Some(a)))
		);
		registry.release(room, OwnerScope::Regions, node, a).unwrap();
		assert_eq!(registry.lookup(room, OwnerScope::Regions, node), None);
	}

	#[tokio::test]
	async fn rows_survive_reload() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join(OWNERSHIP_STORE_NAME);

		let (room, node, owner) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

		{
			let registry = OwnershipRegistry::load(path.clone()).await.unwrap();
			registry
				.claim(room, OwnerScope::Tracks, node, owner, ts())
				.unwrap();
			registry.persist().await.unwrap();
		}

		let registry = OwnershipRegistry::load(path).await.unwrap();
		assert_eq!(registry.lookup(room, OwnerScope::Tracks, node), Some(owner));
	}
}
