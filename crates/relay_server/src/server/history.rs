#![forbid(unsafe_code)]

use std::sync::Arc;

use relay_domain::{Message, RoomName, Username};

use crate::server::store::RelayStore;

/// Maximum number of messages returned by any history query.
pub const HISTORY_LIMIT: usize = 20;

/// Read-only, uncached history queries; every call re-queries the store.
#[derive(Clone)]
pub struct HistoryService {
	store: Arc<dyn RelayStore>,
}

impl HistoryService {
	pub fn new(store: Arc<dyn RelayStore>) -> Self {
		Self { store }
	}

	/// The most recent room messages, oldest first, at most [`HISTORY_LIMIT`].
	pub async fn room_history(&self, room: &RoomName) -> anyhow::Result<Vec<Message>> {
		self.store.room_history(room, HISTORY_LIMIT).await
	}

	/// The most recent direct messages between the pair in either direction,
	/// oldest first, at most [`HISTORY_LIMIT`].
	pub async fn direct_history(&self, a: &Username, b: &Username) -> anyhow::Result<Vec<Message>> {
		self.store.direct_history(a, b, HISTORY_LIMIT).await
	}
}
