#![forbid(unsafe_code)]

use std::collections::HashMap;

use proptest::prelude::*;
use relay_domain::{RoomName, Username};
use relay_protocol::ServerEvent;
use tokio::sync::mpsc;

use crate::server::registry::{ConnId, SessionRegistry};

fn user(s: &str) -> Username {
	Username::new(s).unwrap()
}

fn room(s: &str) -> RoomName {
	RoomName::new(s).unwrap()
}

fn sender() -> mpsc::Sender<ServerEvent> {
	mpsc::channel(8).0
}

#[test]
fn register_and_lookup() {
	let mut registry = SessionRegistry::default();
	registry.register(1, user("xyz"), sender());

	assert_eq!(registry.len(), 1);
	assert_eq!(registry.connection_for(&user("xyz")), Some(1));
	assert!(registry.sender_for(&user("xyz")).is_some());
	assert!(registry.connection_for(&user("abc")).is_none());
}

#[test]
fn duplicate_login_supersedes_username_mapping() {
	let mut registry = SessionRegistry::default();
	registry.register(1, user("xyz"), sender());
	registry.register(2, user("xyz"), sender());

	// Both sessions exist but only the newest holds the username.
	assert_eq!(registry.len(), 2);
	assert_eq!(registry.connection_for(&user("xyz")), Some(2));
}

#[test]
fn superseded_connection_removal_keeps_newer_mapping() {
	let mut registry = SessionRegistry::default();
	registry.register(1, user("xyz"), sender());
	registry.register(2, user("xyz"), sender());

	let removed = registry.remove(1).unwrap();
	assert_eq!(removed.username, user("xyz"));
	assert_eq!(registry.connection_for(&user("xyz")), Some(2));

	registry.remove(2).unwrap();
	assert!(registry.connection_for(&user("xyz")).is_none());
	assert!(registry.is_empty());
}

#[test]
fn set_room_reports_previous_room() {
	let mut registry = SessionRegistry::default();
	registry.register(1, user("xyz"), sender());

	assert_eq!(registry.set_room(1, Some(room("gen"))), Some(None));
	assert_eq!(registry.set_room(1, Some(room("gen2"))), Some(Some(room("gen"))));
	assert_eq!(registry.set_room(1, None), Some(Some(room("gen2"))));
	assert_eq!(registry.set_room(99, Some(room("gen"))), None);
}

#[test]
fn users_in_room_is_sorted() {
	let mut registry = SessionRegistry::default();
	registry.register(1, user("xyz"), sender());
	registry.register(2, user("abc"), sender());
	registry.register(3, user("mno"), sender());
	registry.set_room(1, Some(room("gen")));
	registry.set_room(2, Some(room("gen")));
	registry.set_room(3, Some(room("gen2")));

	assert_eq!(registry.users_in_room(&room("gen")), vec![user("abc"), user("xyz")]);
	assert_eq!(registry.room_peers(&room("gen")).len(), 2);
	assert_eq!(registry.users_in_room(&room("gen2")), vec![user("mno")]);
}

#[derive(Debug, Clone)]
enum Op {
	Join(u8, u8),
	Leave(u8),
	Drop(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
	prop_oneof![
		(0u8..8, 0u8..3).prop_map(|(c, r)| Op::Join(c, r)),
		(0u8..8).prop_map(Op::Leave),
		(0u8..8).prop_map(Op::Drop),
	]
}

proptest! {
	/// Membership after any op sequence matches a naive model: the set of
	/// live sessions whose last join targeted the room.
	#[test]
	fn membership_matches_model(ops in proptest::collection::vec(op_strategy(), 0..64)) {
		let mut registry = SessionRegistry::default();
		let mut model: HashMap<ConnId, Option<u8>> = HashMap::new();

		for conn in 0u8..8 {
			registry.register(conn as ConnId, user(&format!("user-{conn}")), sender());
			model.insert(conn as ConnId, None);
		}

		for op in ops {
			match op {
				Op::Join(conn, r) => {
					let conn = conn as ConnId;
					if registry.set_room(conn, Some(room(&format!("room-{r}")))).is_some() {
						model.insert(conn, Some(r));
					}
				}
				Op::Leave(conn) => {
					let conn = conn as ConnId;
					if registry.set_room(conn, None).is_some() {
						model.insert(conn, None);
					}
				}
				Op::Drop(conn) => {
					let conn = conn as ConnId;
					if registry.remove(conn).is_some() {
						model.remove(&conn);
					}
				}
			}
		}

		for r in 0u8..3 {
			let mut expected: Vec<Username> = model
				.iter()
				.filter(|(_, in_room)| **in_room == Some(r))
				.map(|(conn, _)| user(&format!("user-{conn}")))
				.collect();
			expected.sort();
			prop_assert_eq!(registry.users_in_room(&room(&format!("room-{r}"))), expected);
		}
	}
}
