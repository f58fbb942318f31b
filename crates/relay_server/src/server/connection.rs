#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use relay_domain::{RoomName, SecretString, Username};
use relay_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame};
use relay_protocol::{ClientEvent, FramingError, ServerEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::auth::verify_identity_token;
use crate::server::registry::ConnId;
use crate::server::router::MessageRouter;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,

	/// Capacity of the bounded outbound queue feeding the writer task. When
	/// full, further events for this connection are dropped.
	pub outbound_queue_capacity: usize,

	pub auth_hmac_secret: SecretString,
}

impl ConnectionSettings {
	pub fn new(auth_hmac_secret: SecretString) -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			outbound_queue_capacity: 256,
			auth_hmac_secret,
		}
	}
}

/// Drive a single client connection from accept to close.
///
/// One bidirectional stream carries everything: a reader task decodes frames
/// into an unbounded channel, a writer task drains the session's bounded
/// outbound queue onto the stream, and the dispatch loop in between owns the
/// authentication state.
pub async fn handle_connection(
	conn_id: ConnId,
	connection: quinn::Connection,
	router: Arc<MessageRouter>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("relay_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("relay_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut send, mut recv) = connection.accept_bi().await.context("accept bidirectional stream")?;

	let max_frame = settings.max_frame_bytes;
	let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ClientEvent>();
	let reader_task = tokio::spawn(async move {
		let mut buf = Vec::<u8>::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("stream read failed")),
			};

			metrics::counter!("relay_server_bytes_in_total").increment(n as u64);

			buf.extend_from_slice(&tmp[..n]);

			loop {
				match relay_protocol::decode_frame::<ClientEvent>(&buf, max_frame) {
					Ok((msg, used)) => {
						buf.drain(0..used);
						metrics::counter!("relay_server_events_in_total").increment(1);

						if event_tx.send(msg).is_err() {
							return Ok(());
						}
					}
					Err(FramingError::InsufficientData { .. }) => break,
					Err(e) => {
						metrics::counter!("relay_server_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode frame"));
					}
				}
			}
		}
	});

	let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerEvent>(settings.outbound_queue_capacity);
	let writer_task = tokio::spawn(async move {
		while let Some(event) = outbound_rx.recv().await {
			let frame = encode_frame(&event, max_frame).context("encode outbound frame")?;
			metrics::counter!("relay_server_events_out_total").increment(1);
			metrics::counter!("relay_server_bytes_out_total").increment(frame.len() as u64);

			send.write_all(&frame).await.context("stream write failed")?;
		}
		Ok::<(), anyhow::Error>(())
	});

	let loop_result = dispatch_loop(conn_id, &mut event_rx, &outbound_tx, &router, &settings).await;

	// Tear down the session before the writer drains: the membership
	// broadcast triggered by removal must not target this connection.
	router.disconnect(conn_id).await;

	drop(outbound_tx);
	event_rx.close();

	let _ = reader_task.await;
	let _ = writer_task.await;

	loop_result
}

/// Apply client events in arrival order, gating on authentication.
///
/// `authed` holds the session's username once an `authenticate` succeeds.
/// Logout clears it but keeps the transport open; the client may
/// re-authenticate on the same connection.
pub(crate) async fn dispatch_loop(
	conn_id: ConnId,
	event_rx: &mut mpsc::UnboundedReceiver<ClientEvent>,
	outbound_tx: &mpsc::Sender<ServerEvent>,
	router: &MessageRouter,
	settings: &ConnectionSettings,
) -> anyhow::Result<()> {
	let mut authed: Option<Username> = None;

	while let Some(event) = event_rx.recv().await {
		match event {
			ClientEvent::Authenticate { token } => {
				if authed.is_some() {
					debug!(conn_id, "ignoring duplicate authenticate");
					continue;
				}

				match verify_identity_token(token.trim(), settings.auth_hmac_secret.expose()) {
					Ok(claims) => {
						let username = match Username::new(&claims.username) {
							Ok(u) => u,
							Err(e) => {
								warn!(conn_id, error = %e, "token carries unusable username");
								let _ = outbound_tx
									.send(ServerEvent::AuthError {
										msg: "Invalid authentication token.".to_string(),
									})
									.await;
								return Ok(());
							}
						};

						router.register(conn_id, username.clone(), outbound_tx.clone()).await;
						authed = Some(username.clone());

						info!(conn_id, user = %username, role = %claims.role, "authenticated");
						metrics::counter!("relay_server_auth_success_total").increment(1);
						let _ = outbound_tx
							.send(ServerEvent::Authenticated {
								username: username.to_string(),
							})
							.await;
					}
					Err(e) => {
						warn!(conn_id, error = %e, "authentication rejected");
						metrics::counter!("relay_server_auth_failure_total").increment(1);
						let _ = outbound_tx
							.send(ServerEvent::AuthError {
								msg: "Invalid authentication token.".to_string(),
							})
							.await;
						return Ok(());
					}
				}
			}

			// Read-only queries have no authentication precondition.
			ClientEvent::GetUsers { room } => {
				let Ok(room) = RoomName::new(&room) else {
					debug!(conn_id, "get-users with empty room ignored");
					continue;
				};
				router.get_users(outbound_tx, room).await;
			}

			ClientEvent::ListRooms => {
				router.list_rooms(outbound_tx).await;
			}

			ClientEvent::JoinRoom { room, username } => {
				let Some(session_user) = authed.as_ref() else {
					debug!(conn_id, "join-room before authentication ignored");
					continue;
				};
				let (Ok(room), Ok(username)) = (RoomName::new(&room), Username::new(&username)) else {
					debug!(conn_id, "join-room with empty fields ignored");
					continue;
				};
				if username != *session_user {
					metrics::counter!("relay_server_precondition_violations_total").increment(1);
					debug!(conn_id, claimed = %username, "join-room username mismatch ignored");
					continue;
				}
				router.join_room(conn_id, outbound_tx, room, username).await;
			}

			ClientEvent::LeaveRoom { room, username } => {
				let Some(session_user) = authed.as_ref() else {
					debug!(conn_id, "leave-room before authentication ignored");
					continue;
				};
				let (Ok(room), Ok(username)) = (RoomName::new(&room), Username::new(&username)) else {
					debug!(conn_id, "leave-room with empty fields ignored");
					continue;
				};
				if username != *session_user {
					metrics::counter!("relay_server_precondition_violations_total").increment(1);
					debug!(conn_id, claimed = %username, "leave-room username mismatch ignored");
					continue;
				}
				router.leave_room(conn_id, room).await;
			}

			ClientEvent::RoomMessage { room, msg, user } => {
				if authed.is_none() {
					debug!(conn_id, "room-message before authentication ignored");
					continue;
				}
				let (Ok(room), Ok(user)) = (RoomName::new(&room), Username::new(&user)) else {
					debug!(conn_id, "room-message with empty fields ignored");
					continue;
				};
				router.send_room_message(conn_id, room, user, msg).await;
			}

			ClientEvent::Dm { to, from, msg } => {
				if authed.is_none() {
					debug!(conn_id, "dm before authentication ignored");
					continue;
				}
				let (Ok(to), Ok(from)) = (Username::new(&to), Username::new(&from)) else {
					debug!(conn_id, "dm with empty fields ignored");
					continue;
				};
				router.send_direct_message(conn_id, outbound_tx, to, from, msg).await;
			}

			ClientEvent::GetDmHistory { user1, user2 } => {
				if authed.is_none() {
					debug!(conn_id, "get-dm-history before authentication ignored");
					continue;
				}
				let (Ok(user1), Ok(user2)) = (Username::new(&user1), Username::new(&user2)) else {
					debug!(conn_id, "get-dm-history with empty fields ignored");
					continue;
				};
				router.direct_history(outbound_tx, user1, user2).await;
			}

			ClientEvent::Logout => {
				if let Some(user) = authed.take() {
					info!(conn_id, user = %user, "logout");
					router.logout(conn_id).await;
				} else {
					debug!(conn_id, "logout without session ignored");
				}
			}
		}
	}

	Ok(())
}
