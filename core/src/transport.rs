use sphere_sync::Message;
use thiserror::Error;
use tokio::io::{
	AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf,
};
use tracing::trace;

/// Frames larger than this are rejected rather than buffered; a healthy
/// batch is orders of magnitude smaller.
pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum Error {
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("encode error: {0}")]
	Encode(#[from] rmp_serde::encode::Error),
	#[error("decode error: {0}")]
	Decode(#[from] rmp_serde::decode::Error),
	#[error("frame of {0} bytes exceeds the frame limit")]
	FrameTooLarge(u32),
	#[error("connection closed by peer")]
	Disconnected,
}

impl Error {
	#[must_use]
	pub const fn is_disconnect(&self) -> bool {
		matches!(self, Self::Disconnected)
	}
}

/// One full-duplex room connection: length-prefixed msgpack frames over any
/// ordered byte stream (the relay socket in production, an in-process pipe
/// in tests). Ordered per connection, at-least-once; there is no replay log
/// behind it.
pub struct Connection<S> {
	stream: S,
}

impl<S> Connection<S>
where
	S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
	pub const fn new(stream: S) -> Self {
		Self { stream }
	}

	pub fn into_split(self) -> (SendHalf<S>, RecvHalf<S>) {
		let (read, write) = tokio::io::split(self.stream);

		(SendHalf { inner: write }, RecvHalf { inner: read })
	}
}

pub struct SendHalf<S> {
	inner: WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> SendHalf<S> {
	pub async fn send(&mut self, message: &Message) -> Result<(), Error> {
		let payload = message.to_bytes()?;

		let len = u32::try_from(payload.len()).map_err(|_| Error::FrameTooLarge(u32::MAX))?;
		if len > MAX_FRAME_SIZE {
			return Err(Error::FrameTooLarge(len));
		}

		self.inner.write_u32_le(len).await.map_err(map_eof)?;
		self.inner.write_all(&payload).await.map_err(map_eof)?;
		self.inner.flush().await.map_err(map_eof)?;

		trace!(len, "Frame sent;");

		Ok(())
	}
}

pub struct RecvHalf<S> {
	inner: ReadHalf<S>,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> RecvHalf<S> {
	pub async fn recv(&mut self) -> Result<Message, Error> {
		let len = self.inner.read_u32_le().await.map_err(map_eof)?;

		if len > MAX_FRAME_SIZE {
			return Err(Error::FrameTooLarge(len));
		}

		let mut payload = vec![0u8; len as usize];
		self.inner.read_exact(&mut payload).await.map_err(map_eof)?;

		Ok(Message::from_bytes(&payload)?)
	}
}

fn map_eof(e: std::io::Error) -> Error {
	use std::io::ErrorKind;

	if matches!(
		e.kind(),
		ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe
	) {
		Error::Disconnected
	} else {
		Error::Io(e)
	}
}

#[cfg(test)]
mod tests {
	use sphere_sync::PresenceState;
	use uuid::Uuid;

	use super::*;

	#[tokio::test]
	async fn frames_round_trip_in_order() {
		let (left, right) = tokio::io::duplex(1024);
		let (mut tx, _) = Connection::new(left).into_split();
		let (_, mut rx) = Connection::new(right).into_split();

		let room = Uuid::new_v4();
		let replica = Uuid::new_v4();

		for state in [PresenceState::Joined, PresenceState::Active] {
			tx.send(&Message::Presence {
				room,
				replica,
				state,
			})
			.await
			.unwrap();
		}

		for expected in [PresenceState::Joined, PresenceState::Active] {
			let Message::Presence { state, .. } = rx.recv().await.unwrap() else {
				panic!("expected presence frame");
			};
			assert_eq!(state, expected);
		}
	}

	#[tokio::test]
	async fn closed_peer_reads_as_disconnect() {
		let (left, right) = tokio::io::duplex(1024);
		let (_, mut rx) = Connection::new(right).into_split();

		drop(left);

		assert!(rx.recv().await.unwrap_err().is_disconnect());
	}

	#[tokio::test]
	async fn oversized_frame_is_rejected_before_payload() {
		let (client, server) = tokio::io::duplex(64);
		let (_client_read, mut client_write) = tokio::io::split(client);
		let (_, mut rx) = Connection::new(server).into_split();

		client_write.write_u32_le(MAX_FRAME_SIZE + 1).await.unwrap();

		assert!(matches!(rx.recv().await, Err(Error::FrameTooLarge(_))));
	}
}
