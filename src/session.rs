//! Server-side session state: the registered-clients registry and the
//! per-client user-connection table.
//!
//! Ownership is top-down: `ServerState` owns the clients map and the port
//! pool, each `ClientSession` exclusively owns its user table. Tasks hold
//! non-owning `Arc` handles; cleanup removes the session from the registry
//! first, then releases its resources, so a task observing a closed socket
//! or the session shutdown signal can exit quietly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::{AbortHandle, JoinHandle};

use crate::common::MessageWriter;
use crate::error::Result;
use crate::ports::PortPool;
use crate::protocol::ControlMessage;

/// One external user connection tracked by a session.
struct UserEntry {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    /// Abort handle of the user reader task; `None` briefly between accept
    /// and reader spawn.
    abort: Option<AbortHandle>,
}

/// A registered tunnel client, keyed by its assigned public port.
pub struct ClientSession {
    public_port: u16,
    target_host: String,
    target_port: u16,
    peer_addr: SocketAddr,
    control: MessageWriter,
    users: RwLock<HashMap<String, UserEntry>>,
    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl ClientSession {
    pub fn new(
        public_port: u16,
        target_host: String,
        target_port: u16,
        peer_addr: SocketAddr,
        control: MessageWriter,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            public_port,
            target_host,
            target_port,
            peer_addr,
            control,
            users: RwLock::new(HashMap::new()),
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    pub fn public_port(&self) -> u16 {
        self.public_port
    }

    /// The client-declared local target, retained for logging only.
    pub fn target(&self) -> (&str, u16) {
        (&self.target_host, self.target_port)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn control(&self) -> &MessageWriter {
        &self.control
    }

    /// Subscribes to the session shutdown signal.
    ///
    /// Callers must check [`is_closed`] after subscribing: a signal sent
    /// before the subscription existed would otherwise be missed.
    ///
    /// [`is_closed`]: ClientSession::is_closed
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Inserts a freshly accepted user connection.
    ///
    /// Insertion is refused once the session is closed; the closed check
    /// happens under the table lock so a connection racing cleanup is
    /// either drained by it or turned away here.
    pub async fn add_user(&self, user_id: String, mut writer: OwnedWriteHalf) {
        {
            let mut users = self.users.write().await;
            if !self.is_closed() {
                let entry = UserEntry {
                    writer: Arc::new(Mutex::new(writer)),
                    abort: None,
                };
                users.insert(user_id, entry);
                return;
            }
        }
        tracing::debug!(user_id, "refusing user accepted during teardown");
        let _ = writer.shutdown().await;
    }

    /// Records the abort handle of the user reader once it is spawned.
    pub async fn set_user_abort(&self, user_id: &str, abort: AbortHandle) {
        if let Some(entry) = self.users.write().await.get_mut(user_id) {
            entry.abort = Some(abort);
        }
    }

    /// Writes tunnel bytes to one user socket.
    ///
    /// An unknown `user_id` is dropped silently; a write error closes and
    /// removes that single user without touching the rest of the session.
    pub async fn write_to_user(&self, user_id: &str, data: &[u8]) {
        let writer = {
            let users = self.users.read().await;
            users.get(user_id).map(|entry| Arc::clone(&entry.writer))
        };
        let Some(writer) = writer else {
            tracing::debug!(user_id, "dropping data for unknown user");
            return;
        };
        let result = writer.lock().await.write_all(data).await;
        if let Err(e) = result {
            tracing::warn!(user_id, error = %e, "error writing to user, closing connection");
            self.drop_user(user_id).await;
            // Best effort: the peer may already know.
            let _ = self
                .control
                .send(&ControlMessage::Disconnect {
                    user_id: Some(user_id.to_string()),
                })
                .await;
        }
    }

    /// Removes a user entry from within its own reader task.
    ///
    /// Shuts the write half down but leaves the reader alone; the caller is
    /// the reader and is about to return.
    pub async fn remove_user(&self, user_id: &str) -> bool {
        let Some(entry) = self.take_user(user_id).await else {
            return false;
        };
        let _ = entry.writer.lock().await.shutdown().await;
        true
    }

    /// Removes a user entry from outside its reader task, stopping the
    /// reader as well.
    pub async fn drop_user(&self, user_id: &str) -> bool {
        let Some(entry) = self.take_user(user_id).await else {
            return false;
        };
        if let Some(abort) = entry.abort {
            abort.abort();
        }
        let _ = entry.writer.lock().await.shutdown().await;
        true
    }

    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn has_user(&self, user_id: &str) -> bool {
        self.users.read().await.contains_key(user_id)
    }

    async fn take_user(&self, user_id: &str) -> Option<UserEntry> {
        self.users.write().await.remove(user_id)
    }

    /// Tears the session down: signals its tasks, closes the control write
    /// half, and closes every user connection. Invoked only through
    /// [`ServerState::cleanup_session`].
    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());
        let _ = self.control.shutdown().await;
        let drained: Vec<(String, UserEntry)> = self.users.write().await.drain().collect();
        for (user_id, entry) in drained {
            tracing::debug!(user_id, "closing user connection");
            if let Some(abort) = entry.abort {
                abort.abort();
            }
            let _ = entry.writer.lock().await.shutdown().await;
        }
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("public_port", &self.public_port)
            .field("target_host", &self.target_host)
            .field("target_port", &self.target_port)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Server-wide mutable state, passed explicitly to every task.
pub struct ServerState {
    ports: Mutex<PortPool>,
    clients: RwLock<HashMap<u16, Arc<ClientSession>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerState {
    pub fn new(min_port: u16, max_port: u16) -> Self {
        Self {
            ports: Mutex::new(PortPool::new(min_port, max_port)),
            clients: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn allocate_port(&self) -> Result<u16> {
        self.ports.lock().await.allocate()
    }

    pub async fn release_port(&self, port: u16) {
        self.ports.lock().await.release(port);
    }

    pub async fn free_port_count(&self) -> usize {
        self.ports.lock().await.available()
    }

    pub async fn port_is_free(&self, port: u16) -> bool {
        self.ports.lock().await.contains(port)
    }

    pub async fn insert_session(&self, session: Arc<ClientSession>) {
        self.clients
            .write()
            .await
            .insert(session.public_port(), session);
    }

    pub async fn session(&self, port: u16) -> Option<Arc<ClientSession>> {
        self.clients.read().await.get(&port).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Tracks a long-lived session task so server shutdown can await it.
    pub async fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().await.push(handle);
    }

    pub async fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.tasks.lock().await)
    }

    /// Releases everything a session holds: the registry slot, its listener
    /// and control socket (via the session shutdown signal), every user
    /// socket, and the public port.
    ///
    /// Idempotent. The registry removal is guarded by `Arc` identity, so a
    /// second invocation, or one racing a re-registration of the same port,
    /// is a no-op and the port is returned to the pool exactly once.
    pub async fn cleanup_session(&self, session: &Arc<ClientSession>) {
        let port = session.public_port();
        let removed = {
            let mut clients = self.clients.write().await;
            match clients.get(&port) {
                Some(current) if Arc::ptr_eq(current, session) => clients.remove(&port),
                _ => None,
            }
        };
        if removed.is_none() {
            return;
        }
        session.close().await;
        self.release_port(port).await;
        tracing::info!(port, "cleaned up client session");
    }

    /// Tears down every registered session; used at server shutdown.
    pub async fn cleanup_all(&self) {
        let sessions: Vec<Arc<ClientSession>> =
            self.clients.read().await.values().cloned().collect();
        for session in sessions {
            self.cleanup_session(&session).await;
        }
    }
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (client, server) = tokio::join!(connect, accept);
        let (server, _) = server.unwrap();
        (client.unwrap(), server)
    }

    async fn test_session(public_port: u16) -> (Arc<ClientSession>, TcpStream) {
        let (near, far) = socket_pair().await;
        let peer = near.peer_addr().unwrap();
        let (_, write_half) = near.into_split();
        let session = Arc::new(ClientSession::new(
            public_port,
            "localhost".to_string(),
            3000,
            peer,
            MessageWriter::new(write_half),
        ));
        (session, far)
    }

    #[tokio::test]
    async fn user_table_add_and_remove() {
        let (session, _far) = test_session(10000).await;
        let (user_near, _user_far) = socket_pair().await;
        let (_, writer) = user_near.into_split();

        session.add_user("u1".to_string(), writer).await;
        assert_eq!(session.user_count().await, 1);
        assert!(session.has_user("u1").await);

        assert!(session.remove_user("u1").await);
        assert_eq!(session.user_count().await, 0);
        assert!(!session.remove_user("u1").await);
    }

    #[tokio::test]
    async fn drop_user_aborts_reader() {
        let (session, _far) = test_session(10000).await;
        let (user_near, _user_far) = socket_pair().await;
        let (mut read_half, writer) = user_near.into_split();

        session.add_user("u1".to_string(), writer).await;
        let reader = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = [0u8; 16];
            // Blocks until the far end sends or the task is aborted.
            let _ = read_half.read(&mut buf).await;
        });
        session.set_user_abort("u1", reader.abort_handle()).await;

        assert!(session.drop_user("u1").await);
        let join = reader.await;
        assert!(join.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn write_to_unknown_user_is_dropped() {
        let (session, _far) = test_session(10000).await;
        // Nothing to assert beyond "does not panic or alter the table".
        session.write_to_user("nobody", b"data").await;
        assert_eq!(session.user_count().await, 0);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_releases_port_once() {
        let state = ServerState::new(10000, 10000);
        let port = state.allocate_port().await.unwrap();
        assert_eq!(state.free_port_count().await, 0);

        let (session, _far) = test_session(port).await;
        state.insert_session(Arc::clone(&session)).await;
        assert_eq!(state.session_count().await, 1);

        state.cleanup_session(&session).await;
        assert_eq!(state.session_count().await, 0);
        assert_eq!(state.free_port_count().await, 1);
        assert!(session.is_closed());

        state.cleanup_session(&session).await;
        assert_eq!(state.free_port_count().await, 1);
    }

    #[tokio::test]
    async fn cleanup_ignores_stale_session_after_port_reuse() {
        let state = ServerState::new(10000, 10000);
        let port = state.allocate_port().await.unwrap();

        let (old_session, _old_far) = test_session(port).await;
        state.insert_session(Arc::clone(&old_session)).await;
        state.cleanup_session(&old_session).await;

        // The port gets handed to a new registration.
        let port = state.allocate_port().await.unwrap();
        let (new_session, _new_far) = test_session(port).await;
        state.insert_session(Arc::clone(&new_session)).await;

        // A late duplicate cleanup of the old session must not touch it.
        state.cleanup_session(&old_session).await;
        assert_eq!(state.session_count().await, 1);
        assert!(!new_session.is_closed());
        assert_eq!(state.free_port_count().await, 0);
    }

    #[tokio::test]
    async fn subscribe_then_closed_check_sees_prior_shutdown() {
        let state = ServerState::new(10000, 10000);
        let port = state.allocate_port().await.unwrap();
        let (session, _far) = test_session(port).await;
        state.insert_session(Arc::clone(&session)).await;

        state.cleanup_session(&session).await;

        // The pattern every session task uses on startup.
        let _rx = session.subscribe();
        assert!(session.is_closed());
    }
}
