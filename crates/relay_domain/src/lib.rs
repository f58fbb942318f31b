#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown role: {0}")]
	UnknownRole(String),
}

/// Authenticated user role carried in the identity token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	User,
	Admin,
}

impl Role {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Role::User => "user",
			Role::Admin => "admin",
		}
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Role {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"user" => Ok(Role::User),
			"admin" => Ok(Role::Admin),
			other => Err(ParseIdError::UnknownRole(other.to_string())),
		}
	}
}

/// Unique username, the identity a session binds a connection to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
	/// Create a non-empty `Username`.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		if name.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(name))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Username {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Username {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Username::new(s.to_string())
	}
}

/// Unique room name; rooms carry an explicit allow-list of usernames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomName(String);

impl RoomName {
	/// Create a non-empty `RoomName`.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		if name.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(name))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomName::new(s.to_string())
	}
}

/// Server-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// A room definition as owned by the durable store.
///
/// The realtime layer only reads these at join time; membership is never
/// mutated here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
	pub name: RoomName,
	pub allowed_users: Vec<Username>,
}

impl Room {
	pub fn new(name: RoomName, allowed_users: Vec<Username>) -> Self {
		Self { name, allowed_users }
	}

	/// Whether `user` appears in this room's allow-list.
	pub fn allows(&self, user: &Username) -> bool {
		self.allowed_users.iter().any(|u| u == user)
	}
}

/// A persisted chat message. Exactly one of `to` / `room` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub from: Username,
	pub to: Option<Username>,
	pub room: Option<RoomName>,
	pub text: String,
	pub sent_at_unix_ms: i64,
}

impl Message {
	/// How a client should render this message body.
	pub fn body_kind(&self) -> BodyKind {
		classify_body(&self.text)
	}
}

/// Rendering classification for a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyKind {
	Text,
	Image,
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg"];

/// Classify a message body: a single http(s) URL whose path ends in a known
/// image extension renders as an image, everything else is plain text.
pub fn classify_body(text: &str) -> BodyKind {
	let text = text.trim();
	if text.contains(char::is_whitespace) {
		return BodyKind::Text;
	}

	let rest = text
		.strip_prefix("https://")
		.or_else(|| text.strip_prefix("http://"));
	let Some(rest) = rest else {
		return BodyKind::Text;
	};
	if rest.is_empty() {
		return BodyKind::Text;
	}

	// Extension check is on the path only; query/fragment is dropped.
	let path = rest.split(['?', '#']).next().unwrap_or(rest);
	let Some((_, ext)) = path.rsplit_once('.') else {
		return BodyKind::Text;
	};

	let ext = ext.to_ascii_lowercase();
	if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
		BodyKind::Image
	} else {
		BodyKind::Text
	}
}

/// Wrapper that keeps secrets out of `Debug` output and logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	/// Access the underlying secret value.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(***)")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn role_parse_and_display() {
		assert_eq!("user".parse::<Role>().unwrap(), Role::User);
		assert_eq!("Admin".parse::<Role>().unwrap(), Role::Admin);
		assert_eq!(Role::Admin.to_string(), "admin");
		assert!("owner".parse::<Role>().is_err());
	}

	#[test]
	fn rejects_empty_ids() {
		assert!(Username::new("").is_err());
		assert!(RoomName::new("   ").is_err());
		assert!("".parse::<Username>().is_err());
	}

	#[test]
	fn username_roundtrip() {
		let u = "abc".parse::<Username>().unwrap();
		assert_eq!(u.as_str(), "abc");
		assert_eq!(u.to_string(), "abc");
	}

	#[test]
	fn image_urls_classified_as_images() {
		assert_eq!(classify_body("https://cdn.example.com/pic.png"), BodyKind::Image);
		assert_eq!(classify_body("http://x.io/a/b/c.JPEG"), BodyKind::Image);
		assert_eq!(classify_body("https://cdn.example.com/pic.webp?w=640"), BodyKind::Image);
	}

	#[test]
	fn non_image_bodies_classified_as_text() {
		assert_eq!(classify_body("hello there"), BodyKind::Text);
		assert_eq!(classify_body("https://example.com/doc.pdf"), BodyKind::Text);
		assert_eq!(classify_body("see https://x.io/a.png please"), BodyKind::Text);
		assert_eq!(classify_body("ftp://x.io/a.png"), BodyKind::Text);
		assert_eq!(classify_body("https://"), BodyKind::Text);
	}

	#[test]
	fn room_allow_list() {
		let room = Room::new(
			RoomName::new("gen").unwrap(),
			vec![Username::new("abc").unwrap(), Username::new("xyz").unwrap()],
		);
		assert!(room.allows(&Username::new("abc").unwrap()));
		assert!(!room.allows(&Username::new("mno").unwrap()));
	}

	#[test]
	fn secret_string_debug_is_redacted() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s:?}"), "SecretString(***)");
		assert_eq!(s.expose(), "hunter2");
	}
}
