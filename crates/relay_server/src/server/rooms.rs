#![forbid(unsafe_code)]

use std::sync::Arc;

use relay_domain::{Room, RoomName, Username};

use crate::server::store::RelayStore;

/// Outcome of a join request against a room's allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDecision {
	Allowed,
	RoomNotFound,
	Forbidden,
}

/// Pure access-control check; re-evaluated on every join attempt.
pub fn can_join(room: Option<&Room>, username: &Username) -> JoinDecision {
	match room {
		None => JoinDecision::RoomNotFound,
		Some(room) if room.allows(username) => JoinDecision::Allowed,
		Some(_) => JoinDecision::Forbidden,
	}
}

/// Read-through accessor over the durable store's room definitions.
///
/// The realtime layer never mutates room membership; positive decisions are
/// not cached across joins.
#[derive(Clone)]
pub struct RoomDirectory {
	store: Arc<dyn RelayStore>,
}

impl RoomDirectory {
	pub fn new(store: Arc<dyn RelayStore>) -> Self {
		Self { store }
	}

	pub async fn find(&self, name: &RoomName) -> anyhow::Result<Option<Room>> {
		self.store.find_room(name).await
	}

	/// Look up the room and apply the allow-list check.
	pub async fn decide(&self, name: &RoomName, username: &Username) -> anyhow::Result<JoinDecision> {
		let room = self.find(name).await?;
		Ok(can_join(room.as_ref(), username))
	}

	pub async fn room_names(&self) -> anyhow::Result<Vec<RoomName>> {
		self.store.room_names().await
	}
}
