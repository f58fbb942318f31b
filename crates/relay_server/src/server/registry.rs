#![forbid(unsafe_code)]

use std::collections::HashMap;

use relay_domain::{RoomName, Username};
use relay_protocol::ServerEvent;
use tokio::sync::mpsc;

/// Opaque connection identifier assigned by the accept loop.
pub type ConnId = u64;

/// Runtime record binding a live connection to an authenticated username and
/// its current room.
#[derive(Debug, Clone)]
pub struct Session {
	pub username: Username,
	pub current_room: Option<RoomName>,
	pub outbound: mpsc::Sender<ServerEvent>,
}

/// Process-wide registry of who is online and where.
///
/// This is the single piece of shared mutable state; callers guard it with a
/// lock and every method appears atomic. Methods never perform I/O.
#[derive(Debug, Default)]
pub struct SessionRegistry {
	sessions: HashMap<ConnId, Session>,
	conn_by_username: HashMap<Username, ConnId>,
}

impl SessionRegistry {
	/// Insert or overwrite the session for a connection.
	///
	/// If `username` already maps to a different connection, that mapping is
	/// superseded (last-registered-wins); the prior connection keeps its
	/// session but is no longer reachable by username until it disconnects.
	pub fn register(&mut self, conn_id: ConnId, username: Username, outbound: mpsc::Sender<ServerEvent>) {
		self.conn_by_username.insert(username.clone(), conn_id);
		self.sessions.insert(
			conn_id,
			Session {
				username,
				current_room: None,
				outbound,
			},
		);
	}

	/// Mutate the current room of an existing session; no-op if unknown.
	/// Returns the previous room when the session exists.
	pub fn set_room(&mut self, conn_id: ConnId, room: Option<RoomName>) -> Option<Option<RoomName>> {
		let session = self.sessions.get_mut(&conn_id)?;
		Some(std::mem::replace(&mut session.current_room, room))
	}

	pub fn session(&self, conn_id: ConnId) -> Option<&Session> {
		self.sessions.get(&conn_id)
	}

	/// Snapshot of usernames currently in `room` (sorted for deterministic
	/// broadcasts; membership is a set, order carries no meaning).
	pub fn users_in_room(&self, room: &RoomName) -> Vec<Username> {
		let mut users: Vec<Username> = self
			.sessions
			.values()
			.filter(|s| s.current_room.as_ref() == Some(room))
			.map(|s| s.username.clone())
			.collect();
		users.sort();
		users
	}

	/// Fan-out snapshot of every connection currently in `room`.
	pub fn room_peers(&self, room: &RoomName) -> Vec<mpsc::Sender<ServerEvent>> {
		self.sessions
			.values()
			.filter(|s| s.current_room.as_ref() == Some(room))
			.map(|s| s.outbound.clone())
			.collect()
	}

	/// O(1) lookup of the authoritative connection for a username.
	pub fn connection_for(&self, username: &Username) -> Option<ConnId> {
		self.conn_by_username.get(username).copied()
	}

	/// Outbound channel of the authoritative connection for a username.
	pub fn sender_for(&self, username: &Username) -> Option<mpsc::Sender<ServerEvent>> {
		let conn_id = self.connection_for(username)?;
		self.sessions.get(&conn_id).map(|s| s.outbound.clone())
	}

	/// Delete the session for a connection.
	///
	/// The username mapping is cleared only if this connection is still its
	/// authoritative holder; a superseded (zombie) connection must not evict
	/// the newer login.
	pub fn remove(&mut self, conn_id: ConnId) -> Option<Session> {
		let session = self.sessions.remove(&conn_id)?;
		if self.conn_by_username.get(&session.username) == Some(&conn_id) {
			self.conn_by_username.remove(&session.username);
		}
		Some(session)
	}

	pub fn len(&self) -> usize {
		self.sessions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.is_empty()
	}
}
