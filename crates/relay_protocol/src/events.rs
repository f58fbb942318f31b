#![forbid(unsafe_code)]

use relay_domain::{BodyKind, Message, MessageId, RoomName, Username};
use serde::{Deserialize, Serialize};

/// A message as carried on the wire in history batches.
///
/// `kind` is derived server-side so clients render image URLs without
/// re-deriving the classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
	pub id: MessageId,
	pub from: Username,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub to: Option<Username>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub room: Option<RoomName>,
	pub text: String,
	pub timestamp: i64,
	pub kind: BodyKind,
}

impl From<Message> for WireMessage {
	fn from(msg: Message) -> Self {
		let kind = msg.body_kind();
		Self {
			id: msg.id,
			from: msg.from,
			to: msg.to,
			room: msg.room,
			text: msg.text,
			timestamp: msg.sent_at_unix_ms,
			kind,
		}
	}
}

/// Events the server consumes from a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
	/// Signed identity token; must be the first event on a connection.
	Authenticate { token: String },
	JoinRoom { room: String, username: String },
	LeaveRoom { room: String, username: String },
	RoomMessage { room: String, msg: String, user: String },
	Dm { to: String, from: String, msg: String },
	GetDmHistory { user1: String, user2: String },
	GetUsers { room: String },
	ListRooms,
	Logout,
}

/// Events the server emits to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
	Authenticated { username: String },
	AuthError { msg: String },
	JoinRoomSuccess { room: String },
	JoinRoomError { msg: String },
	RoomHistory(Vec<WireMessage>),
	/// Broadcast to all current members on any membership change.
	RoomUsers(Vec<String>),
	RoomMessage { room: String, msg: String, user: String },
	Dm { to: String, from: String, msg: String },
	DmError { msg: String },
	DmHistory(Vec<WireMessage>),
	UsersList(Vec<String>),
	RoomsList(Vec<String>),
	/// Generic durable-store delivery failure, local to the issuing connection.
	SendError { msg: String },
}
