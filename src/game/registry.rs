//! Registry of live sessions, keyed by player id

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::util::time::unix_millis;

use super::player::{PlayerId, PlayerState};

/// Commands buffered per session before senders wait
const COMMAND_BUFFER: usize = 16;

/// How long a snapshot request waits on a session owner
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(1);

/// Requests the registry can make of a running session
#[derive(Debug)]
pub enum SessionCommand {
    /// Reply with a copy of the current player state
    Snapshot(oneshot::Sender<PlayerState>),
    /// Stop the session and release the connection
    Shutdown,
}

/// Registry-side view of one session
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub connected_at: u64,
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// A session is alive while its owner still holds the command receiver
    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("player {0} already has an active session")]
    AlreadyConnected(PlayerId),

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("player {0} is not connected")]
    NotConnected(PlayerId),

    #[error("session for player {0} did not answer in time")]
    Unresponsive(PlayerId),
}

/// Process-wide map of active sessions
pub struct SessionRegistry {
    sessions: DashMap<PlayerId, SessionHandle>,
    closing: AtomicBool,
    released: Notify,
    snapshot_timeout: Duration,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_snapshot_timeout(SNAPSHOT_TIMEOUT)
    }

    pub fn with_snapshot_timeout(snapshot_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            closing: AtomicBool::new(false),
            released: Notify::new(),
            snapshot_timeout,
        }
    }

    /// Admit a player. A live session for the same id wins; a stale entry
    /// is replaced.
    pub fn register(self: &Arc<Self>, player_id: PlayerId) -> Result<Registration, RegistryError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(RegistryError::ShuttingDown);
        }

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = SessionHandle {
            session_id: Uuid::new_v4(),
            connected_at: unix_millis(),
            commands: commands_tx,
        };
        let session_id = handle.session_id;

        match self.sessions.entry(player_id.clone()) {
            Entry::Occupied(entry) if entry.get().is_alive() => {
                return Err(RegistryError::AlreadyConnected(player_id));
            }
            Entry::Occupied(mut entry) => {
                warn!(
                    player_id = %player_id,
                    stale_session = %entry.get().session_id,
                    "Replacing stale session"
                );
                entry.insert(handle);
            }
            Entry::Vacant(entry) => {
                entry.insert(handle);
            }
        }

        info!(player_id = %player_id, session_id = %session_id, "Session registered");

        Ok(Registration {
            registry: Arc::clone(self),
            player_id,
            session_id,
            commands: commands_rx,
        })
    }

    pub fn get(&self, player_id: &PlayerId) -> Option<SessionHandle> {
        self.sessions.get(player_id).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn player_ids(&self) -> Vec<PlayerId> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }

    /// Ask a session for a copy of its player state. An owner stuck on a
    /// slow client is reported as unresponsive rather than waited on.
    pub async fn snapshot(&self, player_id: &PlayerId) -> Result<PlayerState, RegistryError> {
        let handle = self
            .get(player_id)
            .ok_or_else(|| RegistryError::NotConnected(player_id.clone()))?;

        let request = async {
            let (reply_tx, reply_rx) = oneshot::channel();
            handle
                .commands
                .send(SessionCommand::Snapshot(reply_tx))
                .await
                .ok()?;
            reply_rx.await.ok()
        };

        match tokio::time::timeout(self.snapshot_timeout, request).await {
            Ok(Some(state)) => Ok(state),
            // Owner went away between lookup and reply
            Ok(None) => Err(RegistryError::NotConnected(player_id.clone())),
            Err(_) => {
                warn!(player_id = %player_id, "Snapshot request timed out");
                Err(RegistryError::Unresponsive(player_id.clone()))
            }
        }
    }

    /// Refuse new registrations and tell every live session to stop
    pub async fn shutdown_all(&self) {
        self.closing.store(true, Ordering::Release);

        // Collect first so no shard lock is held across an await
        let handles: Vec<(PlayerId, SessionHandle)> = self
            .sessions
            .iter()
            .map(|s| (s.key().clone(), s.value().clone()))
            .collect();

        info!(sessions = handles.len(), "Stopping all sessions");

        for (player_id, handle) in handles {
            if handle.commands.send(SessionCommand::Shutdown).await.is_err() {
                debug!(player_id = %player_id, "Session already gone");
            }
        }
    }

    /// Wait until every session has released its entry. Returns false if
    /// the timeout elapsed first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let released = self.released.notified();
                tokio::pin!(released);
                released.as_mut().enable();

                if self.is_empty() {
                    return;
                }
                released.await;
            }
        };

        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    fn release(&self, player_id: &PlayerId, session_id: Uuid) {
        // Only remove our own entry, never a successor's
        let removed = self
            .sessions
            .remove_if(player_id, |_, handle| handle.session_id == session_id)
            .is_some();

        if removed {
            info!(player_id = %player_id, session_id = %session_id, "Session deregistered");
            self.released.notify_waiters();
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof of admission held by a running session. Dropping it removes the
/// registry entry on every exit path.
pub struct Registration {
    registry: Arc<SessionRegistry>,
    player_id: PlayerId,
    session_id: Uuid,
    commands: mpsc::Receiver<SessionCommand>,
}

impl Registration {
    pub fn player_id(&self) -> &PlayerId {
        &self.player_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Next command from the registry; cancel safe
    pub async fn next_command(&mut self) -> Option<SessionCommand> {
        self.commands.recv().await
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("player_id", &self.player_id)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release(&self.player_id, self.session_id);
    }
}
