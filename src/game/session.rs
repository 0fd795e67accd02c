//! One live connection and the player state it drives
//!
//! A session runs two duties. A spawned reader task decodes inbound frames
//! and forwards them over a channel. The owner loop is the only code that
//! touches the player state: it applies forwarded messages, answers registry
//! commands, and pushes state to the client on every tick. Whichever duty
//! fails first ends both, and the registration guard clears the registry
//! entry on the way out.

use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::util::rate_limit::InputRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ProtocolError, ServerMsg};

use super::movement::{Direction, MovementPolicy};
use super::player::{PlayerId, PlayerState};
use super::registry::{Registration, SessionCommand};

/// Decoded messages buffered between the reader and the owner
const INBOUND_BUFFER: usize = 64;

/// Why a session stopped
#[derive(Debug, thiserror::Error)]
pub enum SessionEnd {
    #[error("client closed the connection")]
    Closed,

    #[error("server shutdown")]
    Shutdown,

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error(transparent)]
    Malformed(#[from] ProtocolError),
}

impl SessionEnd {
    /// Clean endings are not worth an error line
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Closed | Self::Shutdown)
    }
}

/// A player session, ready to run against a connection
pub struct Session {
    registration: Registration,
    state: PlayerState,
    policy: MovementPolicy,
    broadcast_interval: Duration,
    input_rate_limit: u32,
    write_timeout: Duration,
}

impl Session {
    pub fn new(registration: Registration, config: &SyncConfig) -> Self {
        let state = PlayerState::new(registration.player_id().clone(), config.initial_speed);
        Self {
            registration,
            state,
            policy: MovementPolicy::from_config(config),
            broadcast_interval: config.broadcast_interval,
            input_rate_limit: config.input_rate_limit,
            write_timeout: config.write_timeout,
        }
    }

    /// Drive the session until the connection closes, a duty fails, or the
    /// registry asks it to stop. The registry entry is released and the
    /// outbound half closed before this returns.
    pub async fn run<R, W, E>(self, inbound: R, mut outbound: W) -> SessionEnd
    where
        R: Stream<Item = Result<Message, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
        W: Sink<Message> + Send + Unpin,
        W::Error: Display + Send,
    {
        let Session {
            mut registration,
            mut state,
            policy,
            broadcast_interval,
            input_rate_limit,
            write_timeout,
        } = self;
        let player_id = state.id.clone();

        let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let reader = tokio::spawn(read_inbound(
            player_id.clone(),
            inbound,
            inbound_tx,
            InputRateLimiter::new(input_rate_limit),
        ));

        let welcome = ServerMsg::Welcome {
            player_id: player_id.to_string(),
            server_time: unix_millis(),
            screen_width: policy.screen_width(),
            allowed_delta: policy.allowed_delta(),
            broadcast_interval_ms: broadcast_interval.as_millis() as u64,
        };

        // None once the reader has finished and everything it forwarded is applied
        let owner_end = match send_msg(&mut outbound, &welcome, write_timeout).await {
            Err(e) => Some(SessionEnd::Write(e)),
            Ok(()) => {
                // Dropped with this future, so the timer never outlives the session
                let mut ticker = interval(broadcast_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        inbound = inbound_rx.recv() => match inbound {
                            Some(msg) => apply(&mut state, msg, &policy),
                            None => break None,
                        },
                        command = registration.next_command() => match command {
                            Some(SessionCommand::Snapshot(reply)) => {
                                let _ = reply.send(state.clone());
                            }
                            Some(SessionCommand::Shutdown) | None => {
                                break Some(SessionEnd::Shutdown);
                            }
                        },
                        _ = ticker.tick() => {
                            let msg = ServerMsg::state(&state);
                            if let Err(e) = send_msg(&mut outbound, &msg, write_timeout).await {
                                break Some(SessionEnd::Write(e));
                            }
                        }
                    }
                }
            }
        };

        reader.abort();
        let reader_end = reader.await;
        let end = match owner_end {
            Some(end) => end,
            None => reader_end.unwrap_or_else(|e| SessionEnd::Read(e.to_string())),
        };

        match timeout(write_timeout, outbound.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(player_id = %player_id, error = %e, "Closing connection failed"),
            Err(_) => debug!(player_id = %player_id, "Closing connection timed out"),
        }
        drop(registration);

        if end.is_error() {
            warn!(player_id = %player_id, reason = %end, "Session terminated");
        } else {
            info!(player_id = %player_id, reason = %end, "Session ended");
        }
        end
    }
}

/// Apply one decoded client message on the owner's update path
fn apply(state: &mut PlayerState, msg: ClientMsg, policy: &MovementPolicy) {
    match msg {
        ClientMsg::Position { position } => {
            // Rejections are logged by the state and otherwise dropped
            let _ = state.apply_position(position, policy);
        }
        ClientMsg::Direction { direction } => {
            state.apply_direction(Direction::from(direction), policy);
        }
        ClientMsg::Unknown => {
            debug!(player_id = %state.id, "Ignoring message of unknown type");
        }
    }
}

/// Reader loop: connection -> owner
async fn read_inbound<R, E>(
    player_id: PlayerId,
    mut inbound: R,
    forward: mpsc::Sender<ClientMsg>,
    rate_limiter: InputRateLimiter,
) -> SessionEnd
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    while let Some(frame) = inbound.next().await {
        let decoded = match frame {
            Ok(Message::Text(text)) => ClientMsg::decode(text.as_bytes()),
            Ok(Message::Binary(bytes)) => ClientMsg::decode(&bytes),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => {
                debug!(player_id = %player_id, "Client initiated close");
                return SessionEnd::Closed;
            }
            Err(e) => {
                error!(player_id = %player_id, error = %e, "WebSocket error");
                return SessionEnd::Read(e.to_string());
            }
        };

        let msg = match decoded {
            Ok(msg) => msg,
            Err(e) => {
                warn!(player_id = %player_id, error = %e, "Failed to parse client message");
                return SessionEnd::Malformed(e);
            }
        };

        if !rate_limiter.check() {
            warn!(player_id = %player_id, "Rate limited input message");
            continue;
        }

        if forward.send(msg).await.is_err() {
            // Owner already stopped
            return SessionEnd::Shutdown;
        }
    }

    SessionEnd::Closed
}

/// Serialize and send one message. A client that stops reading stalls the
/// sink; past the deadline that counts as a failed write.
async fn send_msg<W>(sink: &mut W, msg: &ServerMsg, deadline: Duration) -> Result<(), String>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    match timeout(deadline, sink.send(Message::Text(json))).await {
        Ok(sent) => sent.map_err(|e| e.to_string()),
        Err(_) => Err(format!("no progress within {}ms", deadline.as_millis())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::registry::SessionRegistry;
    use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
    use std::io;
    use std::sync::Arc;
    use crate::util::time::millis_f64;
    use tokio::task::JoinHandle;

    type Inbound = UnboundedSender<Result<Message, io::Error>>;
    type Outbound = UnboundedReceiver<Message>;

    const WAIT: Duration = Duration::from_secs(2);

    /// Fast ticks, with speed scaled so one direction step still covers the
    /// reference 200 units
    fn test_config() -> SyncConfig {
        SyncConfig {
            broadcast_interval: Duration::from_millis(20),
            initial_speed: 10.0,
            ..SyncConfig::default()
        }
    }

    fn step(config: &SyncConfig) -> f64 {
        millis_f64(config.broadcast_interval) * config.initial_speed
    }

    fn id(raw: &str) -> PlayerId {
        PlayerId::parse(Some(raw)).unwrap()
    }

    fn start(
        registry: &Arc<SessionRegistry>,
        player: &str,
        config: &SyncConfig,
    ) -> (Inbound, Outbound, JoinHandle<SessionEnd>) {
        let registration = registry.register(id(player)).unwrap();
        let session = Session::new(registration, config);
        let (client_tx, inbound) = unbounded();
        let (outbound, client_rx) = unbounded();
        let handle = tokio::spawn(session.run(inbound, outbound));
        (client_tx, client_rx, handle)
    }

    fn send(client: &Inbound, json: &str) {
        client
            .unbounded_send(Ok(Message::Text(json.to_string())))
            .unwrap();
    }

    async fn next_server_msg(outbound: &mut Outbound) -> ServerMsg {
        loop {
            match timeout(WAIT, outbound.next()).await.unwrap() {
                Some(Message::Text(text)) => return serde_json::from_str(&text).unwrap(),
                Some(_) => continue,
                None => panic!("connection closed"),
            }
        }
    }

    /// Read broadcasts until one reports the expected position, failing if
    /// any broadcast along the way reports a forbidden one
    async fn wait_for_position(outbound: &mut Outbound, expected: f64, forbidden: &[f64]) {
        let seen = timeout(WAIT, async {
            loop {
                if let ServerMsg::Direction { position, .. } = next_server_msg(outbound).await {
                    for bad in forbidden {
                        assert!((position - bad).abs() > 1e-9, "saw rejected position {bad}");
                    }
                    if (position - expected).abs() < 1e-9 {
                        return;
                    }
                }
            }
        })
        .await;
        assert!(seen.is_ok(), "position {expected} never broadcast");
    }

    #[tokio::test]
    async fn welcome_then_periodic_state() {
        let registry = Arc::new(SessionRegistry::new());
        let (_client, mut outbound, _handle) = start(&registry, "alice", &test_config());

        match next_server_msg(&mut outbound).await {
            ServerMsg::Welcome {
                player_id,
                screen_width,
                broadcast_interval_ms,
                ..
            } => {
                assert_eq!(player_id, "alice");
                assert_eq!(screen_width, 400.0);
                assert_eq!(broadcast_interval_ms, 20);
            }
            other => panic!("expected welcome, got {other:?}"),
        }

        for _ in 0..3 {
            assert_eq!(
                next_server_msg(&mut outbound).await,
                ServerMsg::Direction {
                    direction: true,
                    position: 0.0
                }
            );
        }
    }

    #[tokio::test]
    async fn accepted_and_rejected_position_updates() {
        let registry = Arc::new(SessionRegistry::new());
        let config = test_config();
        let (client, mut outbound, _handle) = start(&registry, "alice", &config);

        // 0 + interval * 1 * speed
        assert_eq!(step(&config), 200.0);
        send(&client, r#"{"type":"direction","direction":true}"#);
        wait_for_position(&mut outbound, 200.0, &[]).await;

        send(&client, r#"{"type":"position","position":200.05}"#);
        wait_for_position(&mut outbound, 200.05, &[]).await;

        // 205.0 is too far; 200.1 is only acceptable if 205.0 was dropped
        send(&client, r#"{"type":"position","position":205.0}"#);
        send(&client, r#"{"type":"position","position":200.1}"#);
        wait_for_position(&mut outbound, 200.1, &[205.0]).await;

        let state = registry.snapshot(&id("alice")).await.unwrap();
        assert!((state.position - 200.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn direction_updates_stay_inside_playfield() {
        let registry = Arc::new(SessionRegistry::new());
        let config = test_config();
        let (client, mut outbound, _handle) = start(&registry, "alice", &config);

        let steps = (config.screen_width / step(&config)).ceil() as usize + 1;
        for _ in 0..steps {
            send(&client, r#"{"type":"direction","direction":true}"#);
        }

        let edge = timeout(WAIT, async {
            loop {
                let state = registry.snapshot(&id("alice")).await.unwrap();
                if state.position > 399.0 {
                    return state.position;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(edge < 400.0);

        send(&client, r#"{"type":"direction","direction":false}"#);
        wait_for_position(&mut outbound, edge - step(&config), &[]).await;

        let state = registry.snapshot(&id("alice")).await.unwrap();
        assert_eq!(state.direction, Direction::Backward);
    }

    #[tokio::test]
    async fn unknown_types_are_ignored() {
        let registry = Arc::new(SessionRegistry::new());
        let (client, mut outbound, handle) = start(&registry, "alice", &test_config());

        send(&client, r#"{"type":"emote","name":"wave"}"#);
        send(&client, r#"{"hello":"world"}"#);
        send(&client, r#"{"type":"position","position":0.05}"#);
        wait_for_position(&mut outbound, 0.05, &[]).await;

        assert!(!handle.is_finished());
    }

    #[tokio::test]
    async fn malformed_message_terminates_and_deregisters() {
        let registry = Arc::new(SessionRegistry::new());
        let (client, _outbound, handle) = start(&registry, "alice", &test_config());

        send(&client, r#"{"type":"position","position":"nope"}"#);

        let end = timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(matches!(end, SessionEnd::Malformed(_)));
        assert!(registry.get(&id("alice")).is_none());
    }

    #[tokio::test]
    async fn client_close_releases_within_a_tick() {
        let registry = Arc::new(SessionRegistry::new());
        let config = SyncConfig::default();
        let (client, mut outbound, handle) = start(&registry, "alice", &config);

        next_server_msg(&mut outbound).await;
        drop(client);

        let end = timeout(config.broadcast_interval, handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(end, SessionEnd::Closed));
        assert!(registry.is_empty());

        // Outbound half is closed, so no broadcast task is left behind
        while let Some(msg) = timeout(WAIT, outbound.next()).await.unwrap() {
            assert!(matches!(msg, Message::Text(_)));
        }
    }

    #[tokio::test]
    async fn close_frame_ends_cleanly() {
        let registry = Arc::new(SessionRegistry::new());
        let (client, _outbound, handle) = start(&registry, "alice", &test_config());

        client.unbounded_send(Ok(Message::Close(None))).unwrap();

        let end = timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(matches!(end, SessionEnd::Closed));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn read_error_terminates() {
        let registry = Arc::new(SessionRegistry::new());
        let (client, _outbound, handle) = start(&registry, "alice", &test_config());

        client
            .unbounded_send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            .unwrap();

        let end = timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(matches!(end, SessionEnd::Read(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn write_failure_terminates_both_duties() {
        let registry = Arc::new(SessionRegistry::new());
        let (client, outbound, handle) = start(&registry, "alice", &test_config());

        drop(outbound);

        let end = timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(matches!(end, SessionEnd::Write(_)));
        assert!(registry.is_empty());

        // Reader was aborted, so its end of the inbound stream is gone
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn stalled_client_ends_session_at_write_deadline() {
        let registry = Arc::new(SessionRegistry::new());
        let config = SyncConfig {
            write_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let registration = registry.register(id("alice")).unwrap();
        let (_client, inbound) = unbounded::<Result<Message, io::Error>>();
        // Nobody ever reads, so sends stall once the buffer is full
        let (outbound, _stalled) = futures::channel::mpsc::channel::<Message>(0);
        let handle = tokio::spawn(Session::new(registration, &config).run(inbound, outbound));

        let end = timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(matches!(end, SessionEnd::Write(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn registry_shutdown_stops_session() {
        let registry = Arc::new(SessionRegistry::new());
        let (_client, _outbound, handle) = start(&registry, "alice", &test_config());

        registry.shutdown_all().await;

        let end = timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(matches!(end, SessionEnd::Shutdown));
        assert!(registry.drain(WAIT).await);
    }

    #[tokio::test]
    async fn one_players_rejection_does_not_touch_another() {
        let registry = Arc::new(SessionRegistry::new());
        let config = test_config();
        let (alice, mut alice_out, alice_handle) = start(&registry, "alice", &config);
        let (bob, mut bob_out, bob_handle) = start(&registry, "bob", &config);
        let bob_expected = step(&config);

        send(&alice, r#"{"type":"position","position":350.0}"#);
        send(&bob, r#"{"type":"direction","direction":true}"#);
        send(&alice, r#"{"type":"position","position":0.05}"#);

        wait_for_position(&mut alice_out, 0.05, &[350.0]).await;
        wait_for_position(&mut bob_out, bob_expected, &[]).await;

        // A malformed frame on one stream ends only that session
        send(&alice, "garbage");
        let end = timeout(WAIT, alice_handle).await.unwrap().unwrap();
        assert!(matches!(end, SessionEnd::Malformed(_)));

        assert!(!bob_handle.is_finished());
        assert!(registry.get(&id("bob")).is_some());
        let bob_state = registry.snapshot(&id("bob")).await.unwrap();
        assert_eq!(bob_state.position, bob_expected);
    }
}
