#![forbid(unsafe_code)]

use std::sync::Arc;

use relay_domain::{RoomName, Username};
use relay_protocol::{ServerEvent, WireMessage};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

use crate::server::history::HistoryService;
use crate::server::registry::{ConnId, SessionRegistry};
use crate::server::rooms::{JoinDecision, RoomDirectory};
use crate::server::store::{NewMessage, RelayStore};

/// Orchestrates joins, leaves, room broadcast and direct-message delivery.
///
/// Registry access is always a short lock-scoped snapshot or mutation; store
/// I/O never runs while the lock is held. Delivery is fire-and-forget into
/// each connection's bounded outbound queue.
#[derive(Clone)]
pub struct MessageRouter {
	registry: Arc<RwLock<SessionRegistry>>,
	directory: RoomDirectory,
	history: HistoryService,
	store: Arc<dyn RelayStore>,
}

impl MessageRouter {
	pub fn new(registry: Arc<RwLock<SessionRegistry>>, store: Arc<dyn RelayStore>) -> Self {
		Self {
			registry,
			directory: RoomDirectory::new(Arc::clone(&store)),
			history: HistoryService::new(Arc::clone(&store)),
			store,
		}
	}

	/// Bind a connection to an authenticated username. A repeat login for the
	/// same username supersedes the earlier connection's claim on it.
	pub async fn register(&self, conn_id: ConnId, username: Username, outbound: mpsc::Sender<ServerEvent>) {
		let mut registry = self.registry.write().await;
		registry.register(conn_id, username, outbound);
	}

	/// Best-effort fan-out to a membership snapshot.
	fn deliver_all(&self, peers: &[mpsc::Sender<ServerEvent>], event: &ServerEvent) {
		let mut dropped = 0u64;
		for peer in peers {
			if peer.try_send(event.clone()).is_err() {
				dropped += 1;
			}
		}
		if dropped > 0 {
			metrics::counter!("relay_server_events_dropped_total").increment(dropped);
			debug!(dropped, "dropped events for full or closed outbound queues");
		}
	}

	fn deliver(&self, peer: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
		if peer.try_send(event).is_err() {
			metrics::counter!("relay_server_events_dropped_total").increment(1);
		}
	}

	/// Access control, implicit leave, membership update, history replay and
	/// member-list broadcasts for a join request.
	pub async fn join_room(
		&self,
		conn_id: ConnId,
		reply: &mpsc::Sender<ServerEvent>,
		room: RoomName,
		username: Username,
	) {
		metrics::counter!("relay_server_joins_total").increment(1);

		// Access control short-circuits before any registry mutation.
		let decision = match self.directory.decide(&room, &username).await {
			Ok(d) => d,
			Err(e) => {
				warn!(conn_id, room = %room, error = %e, "room lookup failed");
				self.deliver(
					reply,
					ServerEvent::JoinRoomError {
						msg: "Room lookup failed.".to_string(),
					},
				);
				return;
			}
		};

		match decision {
			JoinDecision::Allowed => {}
			JoinDecision::RoomNotFound => {
				metrics::counter!("relay_server_joins_rejected_total").increment(1);
				self.deliver(
					reply,
					ServerEvent::JoinRoomError {
						msg: "Room does not exist.".to_string(),
					},
				);
				return;
			}
			JoinDecision::Forbidden => {
				metrics::counter!("relay_server_joins_rejected_total").increment(1);
				self.deliver(
					reply,
					ServerEvent::JoinRoomError {
						msg: "You are not allowed to join this room.".to_string(),
					},
				);
				return;
			}
		}

		let (previous_room, new_users, new_peers) = {
			let mut registry = self.registry.write().await;
			let Some(previous) = registry.set_room(conn_id, Some(room.clone())) else {
				// No session: the connection raced a logout. Nothing to mutate.
				debug!(conn_id, room = %room, "join for unknown session ignored");
				return;
			};

			let previous_room = previous.filter(|p| *p != room);
			(
				previous_room,
				registry.users_in_room(&room),
				registry.room_peers(&room),
			)
		};

		self.deliver(reply, ServerEvent::JoinRoomSuccess { room: room.to_string() });

		match self.history.room_history(&room).await {
			Ok(messages) => {
				let batch: Vec<WireMessage> = messages.into_iter().map(WireMessage::from).collect();
				self.deliver(reply, ServerEvent::RoomHistory(batch));
			}
			Err(e) => {
				// Membership already changed; per the at-least-once model it is
				// not rolled back.
				warn!(conn_id, room = %room, error = %e, "failed to load room history");
				self.deliver(
					reply,
					ServerEvent::SendError {
						msg: "Failed to load room history.".to_string(),
					},
				);
			}
		}

		let users: Vec<String> = new_users.iter().map(|u| u.to_string()).collect();
		self.deliver_all(&new_peers, &ServerEvent::RoomUsers(users));

		if let Some(old_room) = previous_room {
			self.broadcast_room_users(&old_room).await;
		}

		debug!(conn_id, room = %room, user = %username, "joined room");
	}

	/// Effective only when the session is currently in `room`; a stale leave
	/// is a no-op.
	pub async fn leave_room(&self, conn_id: ConnId, room: RoomName) {
		let left = {
			let mut registry = self.registry.write().await;
			let in_room = registry
				.session(conn_id)
				.is_some_and(|s| s.current_room.as_ref() == Some(&room));
			if in_room {
				registry.set_room(conn_id, None);
			}
			in_room
		};

		if left {
			self.broadcast_room_users(&room).await;
			debug!(conn_id, room = %room, "left room");
		}
	}

	/// Persist a room message and deliver it to a membership snapshot,
	/// including the author's own connection.
	///
	/// Precondition: the sending session's current room equals `room` and its
	/// username equals `user`. Violations are silently ignored (treated as a
	/// client-protocol bug, no error event).
	pub async fn send_room_message(&self, conn_id: ConnId, room: RoomName, user: Username, text: String) {
		let allowed = {
			let registry = self.registry.read().await;
			registry
				.session(conn_id)
				.is_some_and(|s| s.username == user && s.current_room.as_ref() == Some(&room))
		};
		if !allowed {
			metrics::counter!("relay_server_precondition_violations_total").increment(1);
			debug!(conn_id, room = %room, user = %user, "room message outside current room ignored");
			return;
		}

		let new = NewMessage {
			from: user.clone(),
			to: None,
			room: Some(room.clone()),
			text: text.clone(),
		};
		if let Err(e) = self.store.create_message(new).await {
			warn!(conn_id, room = %room, error = %e, "failed to persist room message");
			let registry = self.registry.read().await;
			if let Some(session) = registry.session(conn_id) {
				self.deliver(
					&session.outbound,
					ServerEvent::SendError {
						msg: "Failed to deliver message.".to_string(),
					},
				);
			}
			return;
		}
		metrics::counter!("relay_server_room_messages_total").increment(1);

		let peers = {
			let registry = self.registry.read().await;
			registry.room_peers(&room)
		};
		self.deliver_all(
			&peers,
			&ServerEvent::RoomMessage {
				room: room.to_string(),
				msg: text,
				user: user.to_string(),
			},
		);
	}

	/// Deliver a direct message to the recipient's connection and echo it to
	/// the sender. Offline recipients get a `dm-error` and nothing persisted.
	pub async fn send_direct_message(
		&self,
		conn_id: ConnId,
		reply: &mpsc::Sender<ServerEvent>,
		to: Username,
		from: Username,
		text: String,
	) {
		let recipient = {
			let registry = self.registry.read().await;
			if !registry.session(conn_id).is_some_and(|s| s.username == from) {
				metrics::counter!("relay_server_precondition_violations_total").increment(1);
				debug!(conn_id, from = %from, "dm with mismatched sender ignored");
				return;
			}
			registry.sender_for(&to)
		};

		let Some(recipient) = recipient else {
			metrics::counter!("relay_server_dm_offline_total").increment(1);
			self.deliver(
				reply,
				ServerEvent::DmError {
					msg: format!("User {to} is not online."),
				},
			);
			return;
		};

		let new = NewMessage {
			from: from.clone(),
			to: Some(to.clone()),
			room: None,
			text: text.clone(),
		};
		if let Err(e) = self.store.create_message(new).await {
			warn!(conn_id, to = %to, error = %e, "failed to persist direct message");
			self.deliver(
				reply,
				ServerEvent::SendError {
					msg: "Failed to deliver message.".to_string(),
				},
			);
			return;
		}
		metrics::counter!("relay_server_direct_messages_total").increment(1);

		let event = ServerEvent::Dm {
			to: to.to_string(),
			from: from.to_string(),
			msg: text,
		};
		// The recipient may have disconnected since the lookup; delivery is
		// then simply lost, not retried.
		self.deliver(&recipient, event.clone());
		self.deliver(reply, event);
	}

	/// Ordered direct-message history between two users.
	pub async fn direct_history(&self, reply: &mpsc::Sender<ServerEvent>, user1: Username, user2: Username) {
		match self.history.direct_history(&user1, &user2).await {
			Ok(messages) => {
				let batch: Vec<WireMessage> = messages.into_iter().map(WireMessage::from).collect();
				self.deliver(reply, ServerEvent::DmHistory(batch));
			}
			Err(e) => {
				warn!(user1 = %user1, user2 = %user2, error = %e, "failed to load dm history");
				self.deliver(
					reply,
					ServerEvent::SendError {
						msg: "Failed to load message history.".to_string(),
					},
				);
			}
		}
	}

	/// Snapshot of usernames in a room; no authentication precondition.
	pub async fn get_users(&self, reply: &mpsc::Sender<ServerEvent>, room: RoomName) {
		let users: Vec<String> = {
			let registry = self.registry.read().await;
			registry.users_in_room(&room).iter().map(|u| u.to_string()).collect()
		};
		self.deliver(reply, ServerEvent::UsersList(users));
	}

	/// Names of all defined rooms.
	pub async fn list_rooms(&self, reply: &mpsc::Sender<ServerEvent>) {
		match self.directory.room_names().await {
			Ok(names) => {
				let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
				self.deliver(reply, ServerEvent::RoomsList(names));
			}
			Err(e) => {
				warn!(error = %e, "failed to list rooms");
				self.deliver(
					reply,
					ServerEvent::SendError {
						msg: "Failed to list rooms.".to_string(),
					},
				);
			}
		}
	}

	/// Explicit logout: session cleanup without closing the transport.
	pub async fn logout(&self, conn_id: ConnId) {
		self.remove_session(conn_id).await;
	}

	/// Implicit leave (if in a room) followed by full session removal.
	pub async fn disconnect(&self, conn_id: ConnId) {
		self.remove_session(conn_id).await;
	}

	async fn remove_session(&self, conn_id: ConnId) {
		let vacated_room = {
			let mut registry = self.registry.write().await;
			registry.remove(conn_id).and_then(|s| s.current_room)
		};

		if let Some(room) = vacated_room {
			self.broadcast_room_users(&room).await;
		}
	}

	/// Broadcast the current member list to everyone in `room`.
	async fn broadcast_room_users(&self, room: &RoomName) {
		let (users, peers) = {
			let registry = self.registry.read().await;
			(registry.users_in_room(room), registry.room_peers(room))
		};
		if peers.is_empty() {
			return;
		}

		let users: Vec<String> = users.iter().map(|u| u.to_string()).collect();
		self.deliver_all(&peers, &ServerEvent::RoomUsers(users));
	}
}
