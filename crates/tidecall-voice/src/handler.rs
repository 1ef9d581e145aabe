//! Call signaling WebSocket handler.
//!
//! The transport adapter in front of [`CallServer`]:
//!
//! 1. Client connects to /calls/ws
//! 2. Sends `identify` with the user id issued by the auth layer
//! 3. Creates or joins calls, exchanges offers/answers/ICE candidates with
//!    the other participant (relayed through here)
//! 4. Reports network samples; each reply carries the media profile to use
//! 5. Sends `leave_call`/`end_call` or disconnects, which leaves its calls
//!
//! Frames are decoded once, here. Every failure goes back to the client as
//! an `error` frame with the error's numeric and string codes.

use crate::codec::ClientProfile;
use crate::registry::PeerTx;
use crate::signaling::{ClientMessage, RecommendationItem, ServerMessage, Signal};
use crate::CallServer;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tidecall_common::error::{CallResult, ErrorBody};
use tidecall_common::snowflake::{CallId, UserId};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Reason recorded when a participant hangs up.
const HANGUP_REASON: &str = "hangup";

/// Signaling state shared across all connections.
#[derive(Clone)]
pub struct SignalingState {
    pub server: CallServer,
    /// Identified users' outbound channels, used to ring callees.
    connections: Arc<RwLock<HashMap<UserId, PeerTx>>>,
}

impl SignalingState {
    pub fn new(server: CallServer) -> Self {
        Self {
            server,
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

/// Build the call signaling WebSocket router.
pub fn build_router(server: CallServer) -> Router {
    Router::new()
        .route("/calls/ws", get(ws_handler))
        .with_state(Arc::new(SignalingState::new(server)))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<SignalingState>>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Per-connection state, dropped on disconnect.
struct Connection {
    user_id: UserId,
    client: ClientProfile,
    tx: PeerTx,
    joined: HashSet<CallId>,
}

/// Handle a single signaling WebSocket connection.
async fn handle_connection(socket: WebSocket, state: Arc<SignalingState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(state.server.outbound_buffer());

    let session_id = Uuid::new_v4();
    tracing::debug!(session = %session_id, "Call WebSocket connected");

    // Writer: everything bound for this client goes through `tx`, including
    // signals relayed from the other participant.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(session = %session_id, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut conn: Option<Connection> = None;

    // Receive loop
    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(session = %session_id, error = %e, "Call WebSocket receive failed");
                break;
            }
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let frame = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(frame) => frame,
            Err(e) => {
                send_error(&tx, 4000, "INVALID_MESSAGE", format!("Invalid message: {e}")).await;
                continue;
            }
        };

        if let ClientMessage::Identify { user_id, client } = frame {
            state.connections.write().await.insert(user_id, tx.clone());
            conn = Some(Connection {
                user_id,
                client,
                tx: tx.clone(),
                joined: HashSet::new(),
            });
            let _ = tx.send(identified(&state, user_id)).await;
            tracing::info!(session = %session_id, user = %user_id, "Call client identified");
            continue;
        }

        let Some(c) = conn.as_mut() else {
            send_error(&tx, 4003, "NOT_IDENTIFIED", "Not identified".into()).await;
            continue;
        };
        let reply = match dispatch(&state, c, frame).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(
                    session = %session_id,
                    user = %c.user_id,
                    error = %e,
                    "Call operation failed"
                );
                ServerMessage::from(&e)
            }
        };
        let _ = tx.send(reply).await;
    }

    // Cleanup on disconnect
    if let Some(c) = conn {
        {
            let mut connections = state.connections.write().await;
            if connections.get(&c.user_id).is_some_and(|t| t.same_channel(&c.tx)) {
                connections.remove(&c.user_id);
            }
        }
        for call_id in c.joined {
            // The call may have ended already.
            let _ = state.server.leave_call(call_id, c.user_id).await;
        }
    }
    drop(tx);
    let _ = writer.await;

    tracing::info!(session = %session_id, "Call WebSocket disconnected");
}

/// Run one client operation and build its reply.
async fn dispatch(state: &SignalingState, conn: &mut Connection, frame: ClientMessage) -> CallResult<ServerMessage> {
    let server = &state.server;
    let uid = conn.user_id;

    let reply = match frame {
        // Intercepted by the receive loop.
        ClientMessage::Identify { .. } => identified(state, uid),

        ClientMessage::CreateCall { callee_id, call_type } => {
            let call = server.create_call(uid, callee_id, call_type).await?;
            let callee = state.connections.read().await.get(&callee_id).cloned();
            if let Some(callee) = callee {
                let _ = callee.try_send(ServerMessage::IncomingCall { call: call.clone() });
            }
            ServerMessage::CallCreated { call }
        }

        ClientMessage::JoinCall { call_id } => {
            let call = server.join_call(call_id, uid, Some(conn.tx.clone())).await?;
            conn.joined.insert(call_id);
            ServerMessage::Joined { call }
        }

        ClientMessage::AnswerCall { call_id } => {
            server.answer_call(call_id, uid).await?;
            ServerMessage::CallAnswered { call_id, user_id: uid }
        }

        ClientMessage::RejectCall { call_id } => {
            let summary = server.reject_call(call_id, uid).await?;
            ServerMessage::CallEnded {
                call_id,
                duration_secs: summary.duration_secs,
                reason: summary.reason,
            }
        }

        ClientMessage::LeaveCall { call_id } => {
            server.leave_call(call_id, uid).await?;
            conn.joined.remove(&call_id);
            ServerMessage::ParticipantLeft { call_id, user_id: uid }
        }

        ClientMessage::Signal {
            call_id,
            signal_type,
            payload,
        } => {
            let signal = Signal::decode(&signal_type, payload)?;
            let signal_type = signal.signal_type();
            let relayed_to = server.signal(call_id, uid, signal).await?;
            ServerMessage::SignalAccepted {
                call_id,
                signal_type,
                relayed_to,
            }
        }

        ClientMessage::NetworkSample { call_id, mut sample } => {
            sample.user_id = uid;
            let evaluation = server.evaluate(call_id, &sample, &conn.client).await?;
            ServerMessage::ProfileApplied { evaluation }
        }

        ClientMessage::RequestRung { call_id, rung } => {
            let transition = server.request_rung(call_id, rung).await?;
            ServerMessage::RungChanged {
                call_id,
                rung,
                transition,
            }
        }

        ClientMessage::ToggleMute { call_id } => ServerMessage::PeerState {
            call_id,
            peer: server.toggle_mute(call_id, uid).await?,
        },

        ClientMessage::ToggleVideo { call_id } => ServerMessage::PeerState {
            call_id,
            peer: server.toggle_video(call_id, uid).await?,
        },

        ClientMessage::StartScreenShare {
            call_id,
            name,
            quality,
            with_audio,
        } => {
            let share = server
                .start_screen_share(call_id, uid, &name, &quality, with_audio)
                .await?;
            ServerMessage::screen_share_updated(call_id, Some(share))
        }

        ClientMessage::StopScreenShare { call_id } => {
            server.stop_screen_share(call_id, uid).await?;
            ServerMessage::screen_share_updated(call_id, None)
        }

        ClientMessage::ChangeScreenShareQuality { call_id, quality } => {
            let share = server.change_screen_share_quality(call_id, uid, &quality).await?;
            ServerMessage::screen_share_updated(call_id, Some(share))
        }

        ClientMessage::ScreenShareStats {
            call_id,
            speed_kbps,
            cpu_pct,
        } => {
            let (current, recommended) = server
                .recommend_screen_share(call_id, uid, speed_kbps, cpu_pct)
                .await?;
            ServerMessage::ScreenShareRecommendation {
                call_id,
                current,
                recommended,
                change: current != recommended,
            }
        }

        ClientMessage::Recommendations { call_id } => ServerMessage::Recommendations {
            call_id,
            items: server
                .recommendations(call_id)
                .await?
                .into_iter()
                .map(RecommendationItem::from)
                .collect(),
        },

        ClientMessage::EndCall { call_id } => {
            let summary = server.end_call(call_id, HANGUP_REASON).await?;
            conn.joined.remove(&call_id);
            ServerMessage::CallEnded {
                call_id,
                duration_secs: summary.duration_secs,
                reason: summary.reason,
            }
        }
    };
    Ok(reply)
}

fn identified(state: &SignalingState, user_id: UserId) -> ServerMessage {
    ServerMessage::Identified {
        user_id,
        ice_servers: state.server.ice_servers().to_vec(),
    }
}

/// Send a transport-level error to the client.
async fn send_error(tx: &PeerTx, code: u32, error: &str, message: String) {
    let body = ErrorBody {
        code,
        error: error.to_string(),
        message,
    };
    let _ = tx.send(ServerMessage::Error(body)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::fixtures;
    use crate::registry::CallType;
    use serde_json::json;

    fn state() -> SignalingState {
        let config = tidecall_common::config::load(Some(std::path::Path::new("does-not-exist")))
            .unwrap_or_else(|e| panic!("default config: {e}"));
        SignalingState::new(CallServer::from_config(&config))
    }

    async fn connect(state: &SignalingState) -> (Connection, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let user_id = Uuid::now_v7();
        state.connections.write().await.insert(user_id, tx.clone());
        let conn = Connection {
            user_id,
            client: ClientProfile::default(),
            tx,
            joined: HashSet::new(),
        };
        (conn, rx)
    }

    #[tokio::test]
    async fn callee_is_rung_and_signals_are_relayed() {
        let state = state();
        let (mut alice, _alice_rx) = connect(&state).await;
        let (mut bob, mut bob_rx) = connect(&state).await;

        let created = dispatch(
            &state,
            &mut alice,
            ClientMessage::CreateCall {
                callee_id: bob.user_id,
                call_type: CallType::Video,
            },
        )
        .await
        .unwrap();
        let ServerMessage::CallCreated { call } = created else {
            panic!("unexpected reply {created:?}");
        };
        assert!(matches!(bob_rx.recv().await, Some(ServerMessage::IncomingCall { .. })));

        let call_id = call.call_id;
        dispatch(&state, &mut alice, ClientMessage::JoinCall { call_id }).await.unwrap();
        dispatch(&state, &mut bob, ClientMessage::JoinCall { call_id }).await.unwrap();
        assert!(alice.joined.contains(&call_id));

        let reply = dispatch(
            &state,
            &mut alice,
            ClientMessage::Signal {
                call_id,
                signal_type: "offer".into(),
                payload: json!({ "type": "offer", "sdp": fixtures::OFFER_SDP }),
            },
        )
        .await
        .unwrap();
        assert!(matches!(reply, ServerMessage::SignalAccepted { relayed_to: 1, .. }));
        match bob_rx.recv().await {
            Some(ServerMessage::Signal { from_user_id, .. }) => assert_eq!(from_user_id, alice.user_id),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn samples_are_stamped_with_the_connection_user() {
        let state = state();
        let (mut alice, _rx) = connect(&state).await;
        let (bob, _bob_rx) = connect(&state).await;
        let call = state
            .server
            .create_call(alice.user_id, bob.user_id, CallType::Video)
            .await
            .unwrap();

        let sample = serde_json::from_value(json!({
            "rtt_ms": 30.0,
            "packet_loss_pct": 0.5,
            "jitter_ms": 5.0,
            "bandwidth_kbps": 5000.0,
            "signal_pct": 90.0
        }))
        .unwrap();
        let reply = dispatch(
            &state,
            &mut alice,
            ClientMessage::NetworkSample {
                call_id: call.call_id,
                sample,
            },
        )
        .await
        .unwrap();
        let ServerMessage::ProfileApplied { evaluation } = reply else {
            panic!("unexpected reply {reply:?}");
        };
        assert!(evaluation.transition.is_none());
        assert!(evaluation.profile.is_some());
    }

    #[tokio::test]
    async fn screen_share_replies_carry_encode_params() {
        let state = state();
        let (mut alice, _rx) = connect(&state).await;
        let (bob, _bob_rx) = connect(&state).await;
        let call = state
            .server
            .create_call(alice.user_id, bob.user_id, CallType::Video)
            .await
            .unwrap();
        let call_id = call.call_id;
        dispatch(&state, &mut alice, ClientMessage::JoinCall { call_id }).await.unwrap();

        let reply = dispatch(
            &state,
            &mut alice,
            ClientMessage::StartScreenShare {
                call_id,
                name: "Slides".into(),
                quality: "high".into(),
                with_audio: false,
            },
        )
        .await
        .unwrap();
        let ServerMessage::ScreenShareUpdated { params: Some(params), .. } = reply else {
            panic!("unexpected reply {reply:?}");
        };
        assert_eq!((params.width, params.height), (1920, 1080));

        let reply = dispatch(
            &state,
            &mut alice,
            ClientMessage::ChangeScreenShareQuality {
                call_id,
                quality: "low".into(),
            },
        )
        .await
        .unwrap();
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["data"]["params"]["bitrate_kbps"], 500);

        let reply = dispatch(&state, &mut alice, ClientMessage::StopScreenShare { call_id })
            .await
            .unwrap();
        assert!(matches!(
            reply,
            ServerMessage::ScreenShareUpdated { screen_share: None, params: None, .. }
        ));
    }

    #[tokio::test]
    async fn operations_on_ended_calls_fail() {
        let state = state();
        let (mut alice, _rx) = connect(&state).await;
        let (bob, _bob_rx) = connect(&state).await;
        let call = state
            .server
            .create_call(alice.user_id, bob.user_id, CallType::Audio)
            .await
            .unwrap();
        let call_id = call.call_id;

        dispatch(&state, &mut alice, ClientMessage::EndCall { call_id }).await.unwrap();
        let err = dispatch(&state, &mut alice, ClientMessage::ToggleMute { call_id })
            .await
            .unwrap_err();
        let ServerMessage::Error(body) = ServerMessage::from(&err) else {
            unreachable!()
        };
        assert_eq!(body.error, "CALL_NOT_FOUND");
    }
}
