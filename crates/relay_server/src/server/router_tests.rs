#![forbid(unsafe_code)]

use std::sync::Arc;

use relay_domain::{Room, RoomName, Username};
use relay_protocol::ServerEvent;
use tokio::sync::{RwLock, mpsc};

use crate::server::registry::{ConnId, SessionRegistry};
use crate::server::router::MessageRouter;
use crate::server::store::{MemoryStore, NewMessage, RelayStore};

fn user(s: &str) -> Username {
	Username::new(s).unwrap()
}

fn room(s: &str) -> RoomName {
	RoomName::new(s).unwrap()
}

struct Harness {
	registry: Arc<RwLock<SessionRegistry>>,
	store: Arc<MemoryStore>,
	router: MessageRouter,
	next_conn: ConnId,
}

struct Client {
	conn_id: ConnId,
	tx: mpsc::Sender<ServerEvent>,
	rx: mpsc::Receiver<ServerEvent>,
}

impl Client {
	/// Deliveries complete synchronously via `try_send` before the router
	/// method returns, so draining needs no waiting.
	fn drain(&mut self) -> Vec<ServerEvent> {
		let mut out = Vec::new();
		while let Ok(event) = self.rx.try_recv() {
			out.push(event);
		}
		out
	}
}

impl Harness {
	async fn new() -> Self {
		let store = Arc::new(MemoryStore::default());
		store
			.upsert_room(&Room::new(room("gen"), vec![user("xyz"), user("abc")]))
			.await
			.unwrap();
		store
			.upsert_room(&Room::new(room("gen2"), vec![user("xyz"), user("mno")]))
			.await
			.unwrap();

		let registry = Arc::new(RwLock::new(SessionRegistry::default()));
		let router = MessageRouter::new(Arc::clone(&registry), Arc::clone(&store) as Arc<dyn RelayStore>);

		Self {
			registry,
			store,
			router,
			next_conn: 1,
		}
	}

	async fn login(&mut self, username: &str) -> Client {
		let conn_id = self.next_conn;
		self.next_conn += 1;

		let (tx, rx) = mpsc::channel(64);
		self.router.register(conn_id, user(username), tx.clone()).await;
		Client { conn_id, tx, rx }
	}

	async fn current_room(&self, conn_id: ConnId) -> Option<RoomName> {
		let registry = self.registry.read().await;
		registry.session(conn_id).and_then(|s| s.current_room.clone())
	}
}

#[tokio::test]
async fn allowed_join_replies_in_order_then_broadcasts_members() {
	let mut h = Harness::new().await;
	let mut xyz = h.login("xyz").await;

	h.router.join_room(xyz.conn_id, &xyz.tx, room("gen"), user("xyz")).await;

	let events = xyz.drain();
	assert!(matches!(&events[0], ServerEvent::JoinRoomSuccess { room } if room == "gen"));
	assert!(matches!(&events[1], ServerEvent::RoomHistory(batch) if batch.is_empty()));
	assert!(matches!(&events[2], ServerEvent::RoomUsers(users) if users == &["xyz"]));
	assert_eq!(events.len(), 3);
	assert_eq!(h.current_room(xyz.conn_id).await, Some(room("gen")));
}

#[tokio::test]
async fn second_joiner_updates_everyone() {
	let mut h = Harness::new().await;
	let mut xyz = h.login("xyz").await;
	let mut abc = h.login("abc").await;

	h.router.join_room(xyz.conn_id, &xyz.tx, room("gen"), user("xyz")).await;
	xyz.drain();

	h.router.join_room(abc.conn_id, &abc.tx, room("gen"), user("abc")).await;

	let expected = vec!["abc".to_string(), "xyz".to_string()];
	let xyz_events = xyz.drain();
	assert!(matches!(&xyz_events[..], [ServerEvent::RoomUsers(users)] if users == &expected));
	let abc_events = abc.drain();
	assert!(matches!(abc_events.last(), Some(ServerEvent::RoomUsers(users)) if users == &expected));
}

#[tokio::test]
async fn join_outside_allow_list_is_rejected_without_side_effects() {
	let mut h = Harness::new().await;
	let mut xyz = h.login("xyz").await;
	let mut mno = h.login("mno").await;

	h.router.join_room(xyz.conn_id, &xyz.tx, room("gen"), user("xyz")).await;
	xyz.drain();

	h.router.join_room(mno.conn_id, &mno.tx, room("gen"), user("mno")).await;

	let events = mno.drain();
	assert!(
		matches!(&events[..], [ServerEvent::JoinRoomError { msg }] if msg == "You are not allowed to join this room.")
	);
	assert_eq!(h.current_room(mno.conn_id).await, None);
	assert!(xyz.drain().is_empty(), "members must not observe a rejected join");
}

#[tokio::test]
async fn join_unknown_room_is_rejected() {
	let mut h = Harness::new().await;
	let mut xyz = h.login("xyz").await;

	h.router.join_room(xyz.conn_id, &xyz.tx, room("nope"), user("xyz")).await;

	let events = xyz.drain();
	assert!(matches!(&events[..], [ServerEvent::JoinRoomError { msg }] if msg == "Room does not exist."));
	assert_eq!(h.current_room(xyz.conn_id).await, None);
}

#[tokio::test]
async fn switching_rooms_refreshes_the_vacated_room() {
	let mut h = Harness::new().await;
	let mut xyz = h.login("xyz").await;
	let mut abc = h.login("abc").await;

	h.router.join_room(xyz.conn_id, &xyz.tx, room("gen"), user("xyz")).await;
	h.router.join_room(abc.conn_id, &abc.tx, room("gen"), user("abc")).await;
	xyz.drain();
	abc.drain();

	h.router.join_room(xyz.conn_id, &xyz.tx, room("gen2"), user("xyz")).await;

	assert_eq!(h.current_room(xyz.conn_id).await, Some(room("gen2")));
	let abc_events = abc.drain();
	assert!(
		matches!(&abc_events[..], [ServerEvent::RoomUsers(users)] if users == &["abc"]),
		"old room must see the implicit leave, got {abc_events:?}"
	);
}

#[tokio::test]
async fn room_message_is_persisted_and_reaches_every_member() {
	let mut h = Harness::new().await;
	let mut xyz = h.login("xyz").await;
	let mut abc = h.login("abc").await;

	h.router.join_room(xyz.conn_id, &xyz.tx, room("gen"), user("xyz")).await;
	h.router.join_room(abc.conn_id, &abc.tx, room("gen"), user("abc")).await;
	xyz.drain();
	abc.drain();

	h.router
		.send_room_message(xyz.conn_id, room("gen"), user("xyz"), "hello".to_string())
		.await;

	for client in [&mut xyz, &mut abc] {
		let events = client.drain();
		assert!(
			matches!(&events[..], [ServerEvent::RoomMessage { room, msg, user }]
				if room == "gen" && msg == "hello" && user == "xyz")
		);
	}
	assert_eq!(h.store.room_history(&room("gen"), 20).await.unwrap().len(), 1);
}

#[tokio::test]
async fn room_message_from_outside_the_room_is_ignored() {
	let mut h = Harness::new().await;
	let mut xyz = h.login("xyz").await;
	let mut abc = h.login("abc").await;

	h.router.join_room(xyz.conn_id, &xyz.tx, room("gen"), user("xyz")).await;
	xyz.drain();

	// abc never joined gen.
	h.router
		.send_room_message(abc.conn_id, room("gen"), user("abc"), "sneaky".to_string())
		.await;
	// xyz claims someone else's name.
	h.router
		.send_room_message(xyz.conn_id, room("gen"), user("abc"), "forged".to_string())
		.await;

	assert!(xyz.drain().is_empty());
	assert!(abc.drain().is_empty());
	assert!(h.store.room_history(&room("gen"), 20).await.unwrap().is_empty());
}

#[tokio::test]
async fn dm_to_offline_user_fails_without_persisting() {
	let mut h = Harness::new().await;
	let mut xyz = h.login("xyz").await;

	h.router
		.send_direct_message(xyz.conn_id, &xyz.tx, user("ghost"), user("xyz"), "anyone?".to_string())
		.await;

	let events = xyz.drain();
	assert!(matches!(&events[..], [ServerEvent::DmError { msg }] if msg == "User ghost is not online."));
	assert!(
		h.store
			.direct_history(&user("xyz"), &user("ghost"), 20)
			.await
			.unwrap()
			.is_empty()
	);
}

#[tokio::test]
async fn dm_to_online_user_is_persisted_and_echoed() {
	let mut h = Harness::new().await;
	let mut xyz = h.login("xyz").await;
	let mut abc = h.login("abc").await;

	h.router
		.send_direct_message(xyz.conn_id, &xyz.tx, user("abc"), user("xyz"), "hi".to_string())
		.await;

	let to_abc = abc.drain();
	assert!(
		matches!(&to_abc[..], [ServerEvent::Dm { to, from, msg }] if to == "abc" && from == "xyz" && msg == "hi")
	);
	let echo = xyz.drain();
	assert!(matches!(&echo[..], [ServerEvent::Dm { to, from, .. }] if to == "abc" && from == "xyz"));
	assert_eq!(h.store.direct_history(&user("xyz"), &user("abc"), 20).await.unwrap().len(), 1);
}

#[tokio::test]
async fn dm_delivery_follows_the_latest_login() {
	let mut h = Harness::new().await;
	let mut xyz = h.login("xyz").await;
	let mut abc_old = h.login("abc").await;
	let mut abc_new = h.login("abc").await;

	h.router
		.send_direct_message(xyz.conn_id, &xyz.tx, user("abc"), user("xyz"), "which one?".to_string())
		.await;

	assert!(abc_old.drain().is_empty(), "superseded connection must not receive dms");
	assert_eq!(abc_new.drain().len(), 1);
}

#[tokio::test]
async fn stale_leave_is_a_no_op() {
	let mut h = Harness::new().await;
	let mut xyz = h.login("xyz").await;
	let mut abc = h.login("abc").await;

	h.router.join_room(xyz.conn_id, &xyz.tx, room("gen"), user("xyz")).await;
	h.router.join_room(abc.conn_id, &abc.tx, room("gen"), user("abc")).await;
	xyz.drain();
	abc.drain();

	h.router.leave_room(xyz.conn_id, room("gen2")).await;

	assert_eq!(h.current_room(xyz.conn_id).await, Some(room("gen")));
	assert!(xyz.drain().is_empty());
	assert!(abc.drain().is_empty());
}

#[tokio::test]
async fn leave_notifies_remaining_members_only() {
	let mut h = Harness::new().await;
	let mut xyz = h.login("xyz").await;
	let mut abc = h.login("abc").await;

	h.router.join_room(xyz.conn_id, &xyz.tx, room("gen"), user("xyz")).await;
	h.router.join_room(abc.conn_id, &abc.tx, room("gen"), user("abc")).await;
	xyz.drain();
	abc.drain();

	h.router.leave_room(xyz.conn_id, room("gen")).await;

	assert_eq!(h.current_room(xyz.conn_id).await, None);
	assert!(xyz.drain().is_empty(), "the leaver gets no member-list update");
	let abc_events = abc.drain();
	assert!(matches!(&abc_events[..], [ServerEvent::RoomUsers(users)] if users == &["abc"]));
}

#[tokio::test]
async fn disconnect_cleans_up_and_notifies_the_room() {
	let mut h = Harness::new().await;
	let mut xyz = h.login("xyz").await;
	let mut abc = h.login("abc").await;

	h.router.join_room(xyz.conn_id, &xyz.tx, room("gen"), user("xyz")).await;
	h.router.join_room(abc.conn_id, &abc.tx, room("gen"), user("abc")).await;
	xyz.drain();
	abc.drain();

	h.router.disconnect(xyz.conn_id).await;

	{
		let registry = h.registry.read().await;
		assert!(registry.session(xyz.conn_id).is_none());
		assert!(registry.connection_for(&user("xyz")).is_none());
	}
	let abc_events = abc.drain();
	assert!(matches!(&abc_events[..], [ServerEvent::RoomUsers(users)] if users == &["abc"]));
}

#[tokio::test]
async fn join_replays_at_most_twenty_messages_oldest_first() {
	let mut h = Harness::new().await;
	for i in 0..25 {
		h.store
			.create_message(NewMessage {
				from: user("abc"),
				to: None,
				room: Some(room("gen")),
				text: format!("msg-{i}"),
			})
			.await
			.unwrap();
	}

	let mut xyz = h.login("xyz").await;
	h.router.join_room(xyz.conn_id, &xyz.tx, room("gen"), user("xyz")).await;

	let events = xyz.drain();
	let ServerEvent::RoomHistory(batch) = &events[1] else {
		panic!("expected room history, got {:?}", events[1]);
	};
	assert_eq!(batch.len(), 20);
	assert_eq!(batch.first().unwrap().text, "msg-5");
	assert_eq!(batch.last().unwrap().text, "msg-24");
}

#[tokio::test]
async fn get_users_and_list_rooms_answer_without_membership() {
	let mut h = Harness::new().await;
	let mut xyz = h.login("xyz").await;
	let mut abc = h.login("abc").await;

	h.router.join_room(xyz.conn_id, &xyz.tx, room("gen"), user("xyz")).await;
	xyz.drain();

	h.router.get_users(&abc.tx, room("gen")).await;
	h.router.list_rooms(&abc.tx).await;

	let events = abc.drain();
	assert!(matches!(&events[0], ServerEvent::UsersList(users) if users == &["xyz"]));
	assert!(matches!(&events[1], ServerEvent::RoomsList(names) if names == &["gen", "gen2"]));
}

#[tokio::test]
async fn dm_history_is_shared_between_both_directions() {
	let mut h = Harness::new().await;
	for (from, to, text) in [("xyz", "abc", "ping"), ("abc", "xyz", "pong")] {
		h.store
			.create_message(NewMessage {
				from: user(from),
				to: Some(user(to)),
				room: None,
				text: text.to_string(),
			})
			.await
			.unwrap();
	}

	let mut xyz = h.login("xyz").await;
	h.router.direct_history(&xyz.tx, user("xyz"), user("abc")).await;

	let events = xyz.drain();
	let ServerEvent::DmHistory(batch) = &events[0] else {
		panic!("expected dm history, got {:?}", events[0]);
	};
	assert_eq!(batch.len(), 2);
	assert_eq!(batch[0].text, "ping");
	assert_eq!(batch[1].text, "pong");
}
