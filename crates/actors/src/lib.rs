#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

use std::{
	collections::HashMap,
	future::{Future, IntoFuture},
	panic::AssertUnwindSafe,
	pin::Pin,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	task::{Context, Poll},
	time::Duration,
};

use async_channel as chan;
use futures::{future::BoxFuture, FutureExt};
use tokio::{
	spawn,
	sync::{broadcast, RwLock},
	task::JoinHandle,
	time::timeout,
};
use tracing::{error, instrument, warn};

const ONE_MINUTE: Duration = Duration::from_secs(60);

type ActorFactory = Arc<dyn Fn(Stopper) -> BoxFuture<'static, ()> + Send + Sync>;

struct ActorHandler {
	factory: ActorFactory,
	maybe_handle: Option<JoinHandle<()>>,
	is_running: Arc<AtomicBool>,
	stop_tx: chan::Sender<()>,
	stop_rx: chan::Receiver<()>,
}

/// Holds every long-running loop of one engine instance, keyed by name.
/// Loops are declared once and can be started and stopped independently;
/// a panicking loop is contained and marked stopped instead of taking the
/// process down.
pub struct Actors {
	invalidate_tx: broadcast::Sender<()>,
	actors_map: RwLock<HashMap<&'static str, ActorHandler>>,
}

impl Actors {
	pub async fn declare<F, Fut>(&self, name: &'static str, factory: F, autostart: bool)
	where
		F: Fn(Stopper) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		let (stop_tx, stop_rx) = chan::bounded(1);

		self.actors_map.write().await.insert(
			name,
			ActorHandler {
				factory: Arc::new(move |stop| factory(stop).boxed()),
				maybe_handle: None,
				is_running: Arc::new(AtomicBool::new(false)),
				stop_tx,
				stop_rx,
			},
		);

		if autostart {
			self.start(name).await;
		}
	}

	#[instrument(skip(self))]
	pub async fn start(&self, name: &str) {
		let mut actors_map = self.actors_map.write().await;
		let Some(actor) = actors_map.get_mut(name) else {
			return;
		};

		if actor.is_running.load(Ordering::Acquire) {
			warn!("Actor already running!");
			return;
		}

		let is_running = Arc::clone(&actor.is_running);
		is_running.store(true, Ordering::Release);

		if self.invalidate_tx.send(()).is_err() {
			warn!("Failed to send invalidate signal");
		}

		if let Some(handle) = actor.maybe_handle.take() {
			if handle.await.is_err() {
				// This should never happen, as we're trying to catch the panic below with
				// `catch_unwind`.
				error!("Actor unexpectedly panicked");
			}
		}

		actor.maybe_handle = Some(spawn({
			let fut = (actor.factory)(Stopper(actor.stop_rx.clone()));
			let invalidate_tx = self.invalidate_tx.clone();

			async move {
				if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
					error!("Actor unexpectedly panicked");
				}

				is_running.store(false, Ordering::Release);

				if invalidate_tx.send(()).is_err() {
					warn!("Failed to send invalidate signal");
				}
			}
		}));
	}

	#[instrument(skip(self))]
	pub async fn stop(&self, name: &str) {
		let mut actors_map = self.actors_map.write().await;
		let Some(actor) = actors_map.get_mut(name) else {
			return;
		};

		if !actor.is_running.load(Ordering::Acquire) {
			return;
		}

		if actor.stop_tx.send(()).await.is_err() {
			error!("Failed to send stop signal to actor, will wait for it or abort");
		}

		wait_stop_or_abort(actor.maybe_handle.take()).await;
	}

	pub async fn stop_all(&self) {
		let names = self
			.actors_map
			.read()
			.await
			.keys()
			.copied()
			.collect::<Vec<_>>();

		for name in names {
			self.stop(name).await;
		}
	}

	pub async fn get_state(&self) -> Vec<(String, bool)> {
		self.actors_map
			.read()
			.await
			.iter()
			.map(|(&name, actor)| (name.to_string(), actor.is_running.load(Ordering::Relaxed)))
			.collect()
	}

	/// Fires whenever any actor starts or finishes, for UI invalidation.
	#[must_use]
	pub fn invalidate(&self) -> broadcast::Receiver<()> {
		self.invalidate_tx.subscribe()
	}
}

impl Default for Actors {
	fn default() -> Self {
		let (invalidate_tx, _) = broadcast::channel(1);

		Self {
			invalidate_tx,
			actors_map: RwLock::default(),
		}
	}
}

/// Handed to every actor loop; resolves when the actor is asked to stop.
pub struct Stopper(chan::Receiver<()>);

impl Stopper {
	#[must_use]
	pub fn check_stop(&self) -> bool {
		self.0.try_recv().is_ok()
	}
}

pin_project_lite::pin_project! {
	pub struct StopActorFuture<'recv> {
		#[pin]
		fut: chan::Recv<'recv, ()>,
	}
}

impl Future for StopActorFuture<'_> {
	type Output = ();

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let this = self.project();

		match this.fut.poll(cx) {
			Poll::Ready(res) => {
				if res.is_err() {
					warn!("StopActor channel closed, will stop actor");
				}
				Poll::Ready(())
			}
			Poll::Pending => Poll::Pending,
		}
	}
}

impl<'recv> IntoFuture for &'recv Stopper {
	type Output = ();
	type IntoFuture = StopActorFuture<'recv>;

	fn into_future(self) -> Self::IntoFuture {
		Self::IntoFuture { fut: self.0.recv() }
	}
}

async fn wait_stop_or_abort(maybe_handle: Option<JoinHandle<()>>) {
	if let Some(handle) = maybe_handle {
		let abort_handle = handle.abort_handle();

		match timeout(ONE_MINUTE, handle).await {
			Ok(Ok(())) => { /* Everything is Awesome! */ }
			Ok(Err(e)) => {
				if e.is_panic() {
					// Should be unreachable, the run wrapper catches unwinds.
					error!("Actor panicked past the unwind guard");
				}
			}
			Err(_) => {
				error!("Actor failed to gracefully stop in the allotted time, will force abortion");
				abort_handle.abort();
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[tokio::test]
	async fn declared_actor_runs_until_stopped() {
		let actors = Arc::new(Actors::default());
		let ticks = Arc::new(AtomicUsize::new(0));

		actors
			.declare(
				"Ticker",
				{
					let ticks = Arc::clone(&ticks);
					move |stop| {
						let ticks = Arc::clone(&ticks);
						async move {
							loop {
								if stop.check_stop() {
									break;
								}
								ticks.fetch_add(1, Ordering::Relaxed);
								tokio::time::sleep(Duration::from_millis(1)).await;
							}
						}
					}
				},
				true,
			)
			.await;

		tokio::time::sleep(Duration::from_millis(20)).await;
		actors.stop("Ticker").await;

		assert!(ticks.load(Ordering::Relaxed) > 0);
		let state = actors.get_state().await;
		assert_eq!(state, vec![("Ticker".to_string(), false)]);
	}

	#[tokio::test]
	async fn panicking_actor_is_contained() {
		let actors = Arc::new(Actors::default());

		actors
			.declare("Doomed", |_stop| async { panic!("boom") }, true)
			.await;

		tokio::time::sleep(Duration::from_millis(20)).await;

		let state = actors.get_state().await;
		assert_eq!(state, vec![("Doomed".to_string(), false)]);
	}
}
