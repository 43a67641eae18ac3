use std::sync::{
	atomic::{AtomicU64, Ordering},
	Arc,
};

use async_channel as chan;
use futures_concurrency::future::Race;
use sphere_actors::Stopper;
use sphere_sync::{Batch, ChangeRecord};
use tokio::time::{sleep_until, Instant};
use tracing::{trace, warn};

use crate::SharedState;

/// Stable regrouping of a flush into the fixed priority order: Create,
/// Delete, SetPrimitive, SetPointer. Stability preserves arrival order
/// inside each group, so two writes to one field keep their relative order.
pub fn order_records(records: &mut [ChangeRecord]) {
	records.sort_by_key(|record| record.data.kind().priority());
}

/// Coalesces captured records over the debounce window and emits them as
/// ordered batches. The window starts on the first enqueued record and a
/// full queue flushes early; batches from this origin are never reordered
/// relative to each other.
pub struct Batcher {
	shared: Arc<SharedState>,
	records_rx: chan::Receiver<ChangeRecord>,
	batches_tx: chan::Sender<Batch>,
	sequence: AtomicU64,
}

enum Wake {
	Record(Result<ChangeRecord, chan::RecvError>),
	Flush,
	Stop,
}

impl Batcher {
	pub(crate) fn new(
		shared: Arc<SharedState>,
		records_rx: chan::Receiver<ChangeRecord>,
		batches_tx: chan::Sender<Batch>,
	) -> Arc<Self> {
		Arc::new(Self {
			shared,
			records_rx,
			batches_tx,
			sequence: AtomicU64::new(0),
		})
	}

	pub async fn run(self: Arc<Self>, stop: Stopper) {
		let mut pending = Vec::new();
		let mut deadline: Option<Instant> = None;

		loop {
			let wake = {
				let recv = async { Wake::Record(self.records_rx.recv().await) };
				let flush = async {
					match deadline {
						Some(at) => {
							sleep_until(at).await;
							Wake::Flush
						}
						None => std::future::pending().await,
					}
				};
				let stopped = async {
					(&stop).await;
					Wake::Stop
				};

				(recv, flush, stopped).race().await
			};

			match wake {
				Wake::Record(Ok(record)) => {
					if pending.is_empty() {
						deadline = Some(Instant::now() + self.shared.config.debounce_window());
					}

					pending.push(record);

					if pending.len() >= self.shared.config.flush_threshold {
						self.flush(&mut pending).await;
						deadline = None;
					}
				}
				Wake::Flush => {
					self.flush(&mut pending).await;
					deadline = None;
				}
				Wake::Record(Err(_)) | Wake::Stop => {
					// Drain what we have; a pending batch is never cancelled.
					self.flush(&mut pending).await;
					break;
				}
			}
		}
	}

	async fn flush(&self, pending: &mut Vec<ChangeRecord>) {
		if pending.is_empty() {
			return;
		}

		let mut records = std::mem::take(pending);
		order_records(&mut records);

		let batch = Batch {
			room: self.shared.room,
			origin: self.shared.replica,
			sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
			is_initial_sync: false,
			records,
		};

		trace!(
			sequence = batch.sequence,
			records = batch.records.len(),
			"Flushing batch;"
		);

		if self.batches_tx.send(batch).await.is_err() {
			warn!("Outbound channel closed, dropping flushed batch");
		}
	}
}
