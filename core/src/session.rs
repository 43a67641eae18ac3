use std::{
	collections::HashMap,
	num::NonZeroU128,
	path::Path,
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc, Mutex,
	},
};

use async_channel as chan;
use futures_concurrency::future::Race;
use sphere_actors::Stopper;
use sphere_sync::{Batch, Message, OwnerScope, PresenceState};
use tokio::{
	io::{AsyncRead, AsyncWrite},
	sync::{broadcast, Notify},
	time::{interval, sleep, timeout},
};
use tracing::{debug, error, instrument, warn};
use uhlc::HLCBuilder;
use uuid::Uuid;

use crate::{
	apply::{ApplyEngine, ApplyReport},
	batcher::Batcher,
	bootstrap,
	capture::ChangeCapture,
	config::SyncConfig,
	host::DocumentHost,
	ownership::{self, OwnershipRegistry, OWNERSHIP_STORE_NAME},
	transport::{self, Connection, RecvHalf, SendHalf},
	Error, SharedState, SyncEvent,
};

const OWNERSHIP_PERSISTER: &str = "Ownership Persister";
const OUTBOUND_BATCHER: &str = "Outbound Batcher";
const OUTBOUND_SENDER: &str = "Outbound Sender";
const INBOUND_RECEIVER: &str = "Inbound Receiver";

type Half<T> = Arc<tokio::sync::Mutex<Option<T>>>;

/// One replica's sync engine for one room: owns the shared state, the
/// capture observer, the batcher, the apply engine and the ownership
/// registry, and wires them to a transport connection per attach.
pub struct SyncSession {
	pub shared: Arc<SharedState>,
	pub apply: Arc<ApplyEngine>,
	events_tx: broadcast::Sender<SyncEvent>,
	batches_rx: chan::Receiver<Batch>,
	admin_tx: chan::Sender<Message>,
	admin_rx: chan::Receiver<Message>,
	presence: Mutex<HashMap<Uuid, PresenceState>>,
	batch_watermarks: Mutex<HashMap<Uuid, u64>>,
}

impl SyncSession {
	/// Builds the engine around a host document and subscribes capture to
	/// its mutation stream. The ownership store is loaded from (and
	/// persisted into) `data_dir`.
	///
	/// # Panics
	/// Panics if `replica` is the zeroed id, which is never handed out.
	pub async fn new(
		host: Arc<dyn DocumentHost>,
		data_dir: impl AsRef<Path>,
		config: SyncConfig,
		room: Uuid,
		replica: Uuid,
	) -> Result<(Arc<Self>, broadcast::Receiver<SyncEvent>), Error> {
		let registry = Arc::new(
			OwnershipRegistry::load(data_dir.as_ref().join(OWNERSHIP_STORE_NAME)).await?,
		);

		let clock = HLCBuilder::new()
			.with_id(uhlc::ID::from(
				NonZeroU128::new(replica.to_u128_le()).expect("Non zero id"),
			))
			.build();

		let shared = Arc::new(SharedState {
			host,
			registry: Arc::clone(&registry),
			config,
			replica,
			room,
			clock,
			sequence: AtomicU64::new(0),
			emit_records_flag: Arc::new(AtomicBool::new(true)),
			timestamps: Arc::default(),
			actors: Arc::default(),
			active: AtomicBool::new(false),
			active_notify: Notify::default(),
		});

		let (records_tx, records_rx) = chan::unbounded();
		let (batches_tx, batches_rx) = chan::unbounded();
		let (admin_tx, admin_rx) = chan::unbounded();
		let (events_tx, events_rx) = broadcast::channel(64);

		let capture = ChangeCapture::new(
			Arc::clone(&shared),
			records_tx,
			admin_tx.clone(),
			events_tx.clone(),
		);
		shared.host.subscribe_to_mutations(capture);

		let batcher = Batcher::new(Arc::clone(&shared), records_rx, batches_tx);
		let apply = ApplyEngine::new(Arc::clone(&shared));

		shared
			.actors
			.declare(
				OWNERSHIP_PERSISTER,
				{
					let registry = Arc::clone(&registry);
					move |stop| Arc::clone(&registry).run_persister(stop)
				},
				true,
			)
			.await;

		shared
			.actors
			.declare(
				OUTBOUND_BATCHER,
				{
					let batcher = Arc::clone(&batcher);
					move |stop| Arc::clone(&batcher).run(stop)
				},
				true,
			)
			.await;

		Ok((
			Arc::new(Self {
				shared,
				apply,
				events_tx,
				batches_rx,
				admin_tx,
				admin_rx,
				presence: Mutex::default(),
				batch_watermarks: Mutex::default(),
			}),
			events_rx,
		))
	}

	pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
		self.events_tx.subscribe()
	}

	/// `node → owner` for the room, for the host's ownership indicators.
	#[must_use]
	pub fn owners(&self) -> HashMap<Uuid, Uuid> {
		self.shared.registry.owners_in(self.shared.room)
	}

	#[must_use]
	pub fn presence(&self) -> HashMap<Uuid, PresenceState> {
		self.lock_presence().clone()
	}

	#[must_use]
	pub fn is_active(&self) -> bool {
		self.shared.active.load(Ordering::Relaxed)
	}

	/// Cooperative hand-off of a cluster primary, broadcast to peers.
	pub fn release_node(&self, scope: OwnerScope, node: Uuid) -> Result<(), ownership::Error> {
		self.shared
			.registry
			.release(self.shared.room, scope, node, self.shared.replica)?;

		if self
			.admin_tx
			.try_send(Message::OwnershipRelease {
				room: self.shared.room,
				scope,
				node,
				owner: self.shared.replica,
			})
			.is_err()
		{
			warn!("Admin channel closed, ownership release will not be broadcast");
		}

		Ok(())
	}

	/// Attaches a room connection: snapshot bootstrap first, then the
	/// steady-state sender/receiver actors. On disconnect the actors stop
	/// and the next attach bootstraps again; steady-state batches from a
	/// previous connection are never assumed to be retransmitted.
	///
	/// A previous connection's actors must have stopped (disconnect or
	/// [`Self::detach`]) before attaching again.
	#[instrument(skip(self, connection), fields(replica = %self.shared.replica, room = %self.shared.room))]
	pub async fn attach<S>(self: Arc<Self>, connection: Connection<S>) -> Result<(), Error>
	where
		S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
	{
		let (mut conn_tx, mut conn_rx) = connection.into_split();

		// Ordering is per connection only; previous watermarks are void.
		self.lock_watermarks().clear();

		conn_tx
			.send(&Message::Presence {
				room: self.shared.room,
				replica: self.shared.replica,
				state: PresenceState::Joined,
			})
			.await?;
		conn_tx
			.send(&Message::SnapshotRequest {
				room: self.shared.room,
				replica: self.shared.replica,
			})
			.await?;

		// Wait for the skeleton before trusting steady-state traffic.
		// Peer snapshot requests are answered inline (two replicas
		// attaching simultaneously would deadlock otherwise); everything
		// else is held back and replayed after the skeleton is in.
		let mut buffered = Vec::new();
		let snapshot = timeout(self.shared.config.snapshot_timeout(), async {
			loop {
				match conn_rx.recv().await {
					Ok(Message::SnapshotResponse { records, .. }) => break Ok(records),
					Ok(Message::SnapshotRequest { replica: peer, .. }) => {
						let records = bootstrap::skeleton_records(&self.shared);
						debug!(%peer, records = records.len(), "Serving snapshot during bootstrap;");

						if let Err(e) = conn_tx
							.send(&Message::SnapshotResponse {
								room: self.shared.room,
								records,
							})
							.await
						{
							break Err(e);
						}
					}
					Ok(other) => buffered.push(other),
					Err(e) => break Err(e),
				}
			}
		})
		.await;

		match snapshot {
			Ok(Ok(records)) => {
				if let Some(batch) = bootstrap::snapshot_batch(self.shared.room, records) {
					let report = self.apply.apply_batch(&batch).await;
					self.report_outcome(&report);
				}
			}
			Ok(Err(e)) => return Err(e.into()),
			Err(_) => debug!("No snapshot peer answered, starting from local state;"),
		}

		for message in buffered {
			self.handle_message(message).await;
		}

		self.shared.active.store(true, Ordering::Relaxed);
		self.shared.active_notify.notify_waiters();

		let conn_tx: Half<SendHalf<S>> = Arc::new(tokio::sync::Mutex::new(Some(conn_tx)));
		let conn_rx: Half<RecvHalf<S>> = Arc::new(tokio::sync::Mutex::new(Some(conn_rx)));

		self.shared
			.actors
			.declare(
				OUTBOUND_SENDER,
				{
					let session = Arc::clone(&self);
					move |stop| Arc::clone(&session).run_sender(Arc::clone(&conn_tx), stop)
				},
				true,
			)
			.await;

		self.shared
			.actors
			.declare(
				INBOUND_RECEIVER,
				{
					let session = Arc::clone(&self);
					move |stop| Arc::clone(&session).run_receiver(Arc::clone(&conn_rx), stop)
				},
				true,
			)
			.await;

		Ok(())
	}

	/// Stops the steady-state actors without tearing the session down; a
	/// later [`Self::attach`] starts over with a fresh bootstrap.
	pub async fn detach(&self) {
		self.shared.actors.stop(INBOUND_RECEIVER).await;
		self.shared.actors.stop(OUTBOUND_SENDER).await;
		self.connection_closed();
	}

	/// Stops everything, flushing the ownership store on the way out.
	pub async fn shutdown(&self) {
		self.detach().await;
		self.shared.actors.stop(OUTBOUND_BATCHER).await;
		self.shared.actors.stop(OWNERSHIP_PERSISTER).await;
	}

	async fn run_sender<S>(self: Arc<Self>, slot: Half<SendHalf<S>>, stop: Stopper)
	where
		S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
	{
		enum Wake {
			Batch(Result<Batch, chan::RecvError>),
			Admin(Result<Message, chan::RecvError>),
			Heartbeat,
			Stop,
		}

		let Some(mut conn) = slot.lock().await.take() else {
			error!("Sender connection already consumed, actor must be re-attached");
			return;
		};

		let mut heartbeat = interval(self.shared.config.heartbeat_interval());

		loop {
			let wake = {
				let batch = async { Wake::Batch(self.batches_rx.recv().await) };
				let admin = async { Wake::Admin(self.admin_rx.recv().await) };
				let tick = async {
					heartbeat.tick().await;
					Wake::Heartbeat
				};
				let stopped = async {
					(&stop).await;
					Wake::Stop
				};

				(batch, admin, tick, stopped).race().await
			};

			let message = match wake {
				Wake::Batch(Ok(batch)) => Message::UpdateBatch(batch),
				Wake::Admin(Ok(message)) => message,
				Wake::Heartbeat => Message::Presence {
					room: self.shared.room,
					replica: self.shared.replica,
					state: PresenceState::Active,
				},
				Wake::Batch(Err(_)) | Wake::Admin(Err(_)) | Wake::Stop => break,
			};

			if let Err(e) = conn.send(&message).await {
				self.connection_lost(&e);
				break;
			}
		}
	}

	async fn run_receiver<S>(self: Arc<Self>, slot: Half<RecvHalf<S>>, stop: Stopper)
	where
		S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
	{
		enum Wake {
			Frame(Result<Message, transport::Error>),
			RetrySweep,
			Stop,
		}

		let Some(mut conn) = slot.lock().await.take() else {
			error!("Receiver connection already consumed, actor must be re-attached");
			return;
		};

		loop {
			let wake = {
				let frame = async { Wake::Frame(conn.recv().await) };
				let retry = async {
					if self.apply.has_deferred() {
						sleep(self.shared.config.retry_delay()).await;
						Wake::RetrySweep
					} else {
						std::future::pending().await
					}
				};
				let stopped = async {
					(&stop).await;
					Wake::Stop
				};

				(frame, retry, stopped).race().await
			};

			match wake {
				Wake::Frame(Ok(message)) => self.handle_message(message).await,
				Wake::RetrySweep => {
					let report = self.apply.sweep_deferred(true).await;
					self.report_outcome(&report);
				}
				Wake::Frame(Err(e)) => {
					self.connection_lost(&e);
					break;
				}
				Wake::Stop => break,
			}
		}
	}

	async fn handle_message(&self, message: Message) {
		match message {
			Message::UpdateBatch(batch) => {
				if !batch.is_initial_sync {
					let mut marks = self.lock_watermarks();

					match marks.get(&batch.origin) {
						Some(&last) if batch.sequence <= last => {
							debug!(
								origin = %batch.origin,
								sequence = batch.sequence,
								"Skipping duplicate batch delivery;"
							);
							return;
						}
						_ => {
							marks.insert(batch.origin, batch.sequence);
						}
					}
				}

				let mut report = self.apply.apply_batch(&batch).await;

				// A just-applied create may unblock earlier deferrals;
				// resolve them now without charging the retry bound.
				let resolved = self.apply.sweep_deferred(false).await;
				report.applied += resolved.applied;
				report.dropped.extend(resolved.dropped);

				self.report_outcome(&report);
			}
			Message::SnapshotRequest { replica: peer, .. } => {
				let records = bootstrap::skeleton_records(&self.shared);
				debug!(%peer, records = records.len(), "Serving snapshot;");

				if self
					.admin_tx
					.try_send(Message::SnapshotResponse {
						room: self.shared.room,
						records,
					})
					.is_err()
				{
					warn!("Admin channel closed, snapshot response dropped");
				}
			}
			Message::SnapshotResponse { .. } => {
				debug!("Snapshot response outside bootstrap ignored;");
			}
			Message::OwnershipClaim {
				room,
				scope,
				node,
				owner,
			} => {
				let claimed_at = *self.shared.clock.new_timestamp().get_time();
				self.shared
					.registry
					.mirror_claim(room, scope, node, owner, claimed_at);
			}
			Message::OwnershipRelease {
				room,
				scope,
				node,
				owner,
			} => {
				self.shared.registry.mirror_release(room, scope, node, owner);
			}
			Message::Presence {
				replica: peer,
				state,
				..
			} => {
				if peer == self.shared.replica {
					return;
				}

				{
					let mut presence = self.lock_presence();
					if state == PresenceState::Left {
						presence.remove(&peer);
					} else {
						presence.insert(peer, state);
					}
				}

				self.events_tx
					.send(SyncEvent::Presence {
						replica: peer,
						state,
					})
					.ok();
			}
		}
	}

	fn report_outcome(&self, report: &ApplyReport) {
		for (record, e) in &report.dropped {
			warn!(?record, %e, "Record dropped;");
		}

		if report.applied > 0 || !report.dropped.is_empty() {
			self.events_tx.send(SyncEvent::Applied).ok();
		}
	}

	fn connection_lost(&self, e: &transport::Error) {
		if e.is_disconnect() {
			debug!("Connection closed;");
		} else {
			error!(?e, "Connection failed;");
		}

		self.connection_closed();
	}

	fn connection_closed(&self) {
		if self.shared.active.swap(false, Ordering::Relaxed) {
			self.shared.active_notify.notify_waiters();
			self.events_tx.send(SyncEvent::Disconnected).ok();
		}
	}

	fn lock_presence(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, PresenceState>> {
		self.presence
			.lock()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
	}

	fn lock_watermarks(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, u64>> {
		self.batch_watermarks
			.lock()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
	}
}
