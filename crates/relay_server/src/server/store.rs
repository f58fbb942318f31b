#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{Context, anyhow};
use relay_domain::{Message, MessageId, Room, RoomName, Username};
use tokio::sync::Mutex;

use crate::util::time::unix_ms_now;

/// A message about to be persisted; the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewMessage {
	pub from: Username,
	pub to: Option<Username>,
	pub room: Option<RoomName>,
	pub text: String,
}

/// The durable store collaborator: room definitions and message records.
///
/// All calls are blocking I/O from the caller's point of view and must never
/// run while the session registry lock is held.
#[async_trait::async_trait]
pub trait RelayStore: Send + Sync {
	async fn create_message(&self, new: NewMessage) -> anyhow::Result<Message>;

	/// Most recent messages for a room, returned oldest first, at most `limit`.
	async fn room_history(&self, room: &RoomName, limit: usize) -> anyhow::Result<Vec<Message>>;

	/// Most recent direct messages between the pair in either direction,
	/// returned oldest first, at most `limit`.
	async fn direct_history(&self, a: &Username, b: &Username, limit: usize) -> anyhow::Result<Vec<Message>>;

	async fn find_room(&self, name: &RoomName) -> anyhow::Result<Option<Room>>;

	async fn upsert_room(&self, room: &Room) -> anyhow::Result<()>;

	async fn room_names(&self) -> anyhow::Result<Vec<RoomName>>;
}

fn stamp(new: NewMessage) -> Message {
	Message {
		id: MessageId::new_v4(),
		from: new.from,
		to: new.to,
		room: new.room,
		text: new.text,
		sent_at_unix_ms: unix_ms_now(),
	}
}

/// In-memory store used when persistence is disabled, and by tests.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
	rooms: HashMap<RoomName, Room>,
	messages: Vec<Message>,
}

fn tail<T: Clone>(items: Vec<&T>, limit: usize) -> Vec<T> {
	let start = items.len().saturating_sub(limit);
	items[start..].iter().map(|m| (*m).clone()).collect()
}

#[async_trait::async_trait]
impl RelayStore for MemoryStore {
	async fn create_message(&self, new: NewMessage) -> anyhow::Result<Message> {
		let msg = stamp(new);
		let mut inner = self.inner.lock().await;
		inner.messages.push(msg.clone());
		Ok(msg)
	}

	async fn room_history(&self, room: &RoomName, limit: usize) -> anyhow::Result<Vec<Message>> {
		let inner = self.inner.lock().await;
		let matching: Vec<&Message> = inner.messages.iter().filter(|m| m.room.as_ref() == Some(room)).collect();
		Ok(tail(matching, limit))
	}

	async fn direct_history(&self, a: &Username, b: &Username, limit: usize) -> anyhow::Result<Vec<Message>> {
		let inner = self.inner.lock().await;
		let matching: Vec<&Message> = inner
			.messages
			.iter()
			.filter(|m| {
				(&m.from == a && m.to.as_ref() == Some(b)) || (&m.from == b && m.to.as_ref() == Some(a))
			})
			.collect();
		Ok(tail(matching, limit))
	}

	async fn find_room(&self, name: &RoomName) -> anyhow::Result<Option<Room>> {
		let inner = self.inner.lock().await;
		Ok(inner.rooms.get(name).cloned())
	}

	async fn upsert_room(&self, room: &Room) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		inner.rooms.insert(room.name.clone(), room.clone());
		Ok(())
	}

	async fn room_names(&self) -> anyhow::Result<Vec<RoomName>> {
		let inner = self.inner.lock().await;
		let mut names: Vec<RoomName> = inner.rooms.keys().cloned().collect();
		names.sort();
		Ok(names)
	}
}

/// sqlx-backed store (sqlite or postgres), selected by the database URL.
#[derive(Clone)]
pub struct PersistentStore {
	backend: PersistentBackend,
}

#[derive(Clone)]
enum PersistentBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

type MessageRow = (String, String, Option<String>, Option<String>, String, i64);

fn row_to_message(row: MessageRow) -> anyhow::Result<Message> {
	let (id, sender, recipient, room, body, sent_at_unix_ms) = row;
	Ok(Message {
		id: MessageId(uuid::Uuid::from_str(&id).context("parse message id")?),
		from: Username::new(sender)?,
		to: recipient.map(Username::new).transpose()?,
		room: room.map(RoomName::new).transpose()?,
		text: body,
		sent_at_unix_ms,
	})
}

impl PersistentStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: PersistentBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: PersistentBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}
}

#[async_trait::async_trait]
impl RelayStore for PersistentStore {
	async fn create_message(&self, new: NewMessage) -> anyhow::Result<Message> {
		let msg = stamp(new);

		match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, sender, recipient, room, body, sent_at_unix_ms) VALUES (?, ?, ?, ?, ?, ?)",
				)
				.bind(msg.id.to_string())
				.bind(msg.from.as_str())
				.bind(msg.to.as_ref().map(|u| u.as_str()))
				.bind(msg.room.as_ref().map(|r| r.as_str()))
				.bind(&msg.text)
				.bind(msg.sent_at_unix_ms)
				.execute(pool)
				.await
				.context("insert message (sqlite)")?;
			}
			PersistentBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, sender, recipient, room, body, sent_at_unix_ms) VALUES ($1, $2, $3, $4, $5, $6)",
				)
				.bind(msg.id.to_string())
				.bind(msg.from.as_str())
				.bind(msg.to.as_ref().map(|u| u.as_str()))
				.bind(msg.room.as_ref().map(|r| r.as_str()))
				.bind(&msg.text)
				.bind(msg.sent_at_unix_ms)
				.execute(pool)
				.await
				.context("insert message (postgres)")?;
			}
		}

		Ok(msg)
	}

	async fn room_history(&self, room: &RoomName, limit: usize) -> anyhow::Result<Vec<Message>> {
		let rows: Vec<MessageRow> = match &self.backend {
			PersistentBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT id, sender, recipient, room, body, sent_at_unix_ms FROM messages \
				WHERE room = ? ORDER BY sent_at_unix_ms DESC LIMIT ?",
			)
			.bind(room.as_str())
			.bind(limit as i64)
			.fetch_all(pool)
			.await
			.context("select room history (sqlite)")?,
			PersistentBackend::Postgres(pool) => sqlx::query_as(
				"SELECT id, sender, recipient, room, body, sent_at_unix_ms FROM messages \
				WHERE room = $1 ORDER BY sent_at_unix_ms DESC LIMIT $2",
			)
			.bind(room.as_str())
			.bind(limit as i64)
			.fetch_all(pool)
			.await
			.context("select room history (postgres)")?,
		};

		// Rows come back newest first; callers want oldest first.
		let mut messages = rows.into_iter().map(row_to_message).collect::<anyhow::Result<Vec<_>>>()?;
		messages.reverse();
		Ok(messages)
	}

	async fn direct_history(&self, a: &Username, b: &Username, limit: usize) -> anyhow::Result<Vec<Message>> {
		let rows: Vec<MessageRow> = match &self.backend {
			PersistentBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT id, sender, recipient, room, body, sent_at_unix_ms FROM messages \
				WHERE (sender = ? AND recipient = ?) OR (sender = ? AND recipient = ?) \
				ORDER BY sent_at_unix_ms DESC LIMIT ?",
			)
			.bind(a.as_str())
			.bind(b.as_str())
			.bind(b.as_str())
			.bind(a.as_str())
			.bind(limit as i64)
			.fetch_all(pool)
			.await
			.context("select dm history (sqlite)")?,
			PersistentBackend::Postgres(pool) => sqlx::query_as(
				"SELECT id, sender, recipient, room, body, sent_at_unix_ms FROM messages \
				WHERE (sender = $1 AND recipient = $2) OR (sender = $2 AND recipient = $1) \
				ORDER BY sent_at_unix_ms DESC LIMIT $3",
			)
			.bind(a.as_str())
			.bind(b.as_str())
			.bind(limit as i64)
			.fetch_all(pool)
			.await
			.context("select dm history (postgres)")?,
		};

		let mut messages = rows.into_iter().map(row_to_message).collect::<anyhow::Result<Vec<_>>>()?;
		messages.reverse();
		Ok(messages)
	}

	async fn find_room(&self, name: &RoomName) -> anyhow::Result<Option<Room>> {
		let row: Option<(String,)> = match &self.backend {
			PersistentBackend::Sqlite(pool) => sqlx::query_as("SELECT allowed_users FROM rooms WHERE name = ?")
				.bind(name.as_str())
				.fetch_optional(pool)
				.await
				.context("select room (sqlite)")?,
			PersistentBackend::Postgres(pool) => sqlx::query_as("SELECT allowed_users FROM rooms WHERE name = $1")
				.bind(name.as_str())
				.fetch_optional(pool)
				.await
				.context("select room (postgres)")?,
		};

		let Some((allowed_json,)) = row else {
			return Ok(None);
		};

		let allowed: Vec<String> = serde_json::from_str(&allowed_json).context("parse room allow-list")?;
		let allowed_users = allowed.into_iter().map(Username::new).collect::<Result<Vec<_>, _>>()?;
		Ok(Some(Room::new(name.clone(), allowed_users)))
	}

	async fn upsert_room(&self, room: &Room) -> anyhow::Result<()> {
		let allowed: Vec<&str> = room.allowed_users.iter().map(|u| u.as_str()).collect();
		let allowed_json = serde_json::to_string(&allowed).context("encode room allow-list")?;

		match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO rooms (name, allowed_users) VALUES (?, ?) \
					ON CONFLICT(name) DO UPDATE SET allowed_users = excluded.allowed_users",
				)
				.bind(room.name.as_str())
				.bind(allowed_json)
				.execute(pool)
				.await
				.context("upsert room (sqlite)")?;
			}
			PersistentBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO rooms (name, allowed_users) VALUES ($1, $2) \
					ON CONFLICT (name) DO UPDATE SET allowed_users = EXCLUDED.allowed_users",
				)
				.bind(room.name.as_str())
				.bind(allowed_json)
				.execute(pool)
				.await
				.context("upsert room (postgres)")?;
			}
		}

		Ok(())
	}

	async fn room_names(&self) -> anyhow::Result<Vec<RoomName>> {
		let rows: Vec<(String,)> = match &self.backend {
			PersistentBackend::Sqlite(pool) => sqlx::query_as("SELECT name FROM rooms ORDER BY name")
				.fetch_all(pool)
				.await
				.context("select room names (sqlite)")?,
			PersistentBackend::Postgres(pool) => sqlx::query_as("SELECT name FROM rooms ORDER BY name")
				.fetch_all(pool)
				.await
				.context("select room names (postgres)")?,
		};

		rows.into_iter().map(|(name,)| Ok(RoomName::new(name)?)).collect()
	}
}
