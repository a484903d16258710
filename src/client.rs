//! Tunnel client: registers with the relay and bridges multiplexed user
//! sessions onto the configured local service.
//!
//! The client keeps one control connection open for its whole lifetime. A
//! relay reader dispatches inbound messages, a keepalive task pings every
//! [`PING_INTERVAL_SECS`] seconds, and each active user gets a local reader
//! pumping service replies back through the shared control writer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;

use crate::cli::{ClientArgs, PING_INTERVAL_SECS};
use crate::common::{shutdown_signal, MessageReader, MessageWriter, READ_BUFFER_SIZE};
use crate::error::{Error, Result};
use crate::protocol::{ControlMessage, RegistrationRequest, RegistrationResponse};

/// One connection to the local service, keyed by the relay-minted user id.
struct LocalEntry {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    abort: Option<AbortHandle>,
}

/// A registered tunnel session with the relay.
pub struct TunnelClient {
    local_host: String,
    local_port: u16,
    control: MessageWriter,
    public_port: u16,
    locals: RwLock<HashMap<String, LocalEntry>>,
    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TunnelClient {
    /// Dials the relay, performs the registration handshake, and starts the
    /// relay reader and keepalive tasks.
    pub async fn connect(args: &ClientArgs) -> Result<Arc<TunnelClient>> {
        let stream = TcpStream::connect((args.relay.as_str(), args.relay_port))
            .await
            .map_err(|e| {
                Error::Dial(format!(
                    "relay server {}:{}: {}",
                    args.relay, args.relay_port, e
                ))
            })?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = MessageReader::new(read_half);
        let control = MessageWriter::new(write_half);

        control
            .send(&RegistrationRequest {
                local_host: args.local_host.clone(),
                local_port: args.local_port,
            })
            .await?;

        let response: RegistrationResponse = reader
            .read_message()
            .await?
            .ok_or_else(|| Error::Decode("relay closed connection during registration".into()))?;
        if !response.success {
            return Err(Error::RegistrationRejected(
                response.error.unwrap_or_else(|| "unknown error".into()),
            ));
        }
        let public_port = response
            .public_port
            .ok_or_else(|| Error::Decode("registration response missing public_port".into()))?;

        tracing::info!(
            public_port,
            "registered; service is now reachable at {}:{}",
            args.relay,
            public_port
        );

        let (shutdown, _) = broadcast::channel(1);
        let client = Arc::new(TunnelClient {
            local_host: args.local_host.clone(),
            local_port: args.local_port,
            control,
            public_port,
            locals: RwLock::new(HashMap::new()),
            shutdown,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let relay = tokio::spawn(relay_reader(Arc::clone(&client), reader));
        let ping = tokio::spawn(keepalive(Arc::clone(&client)));
        {
            let mut tasks = client.tasks.lock().await;
            tasks.push(relay);
            tasks.push(ping);
        }

        Ok(client)
    }

    /// The public port the relay assigned to this session.
    pub fn public_port(&self) -> u16 {
        self.public_port
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Resolves once the session has shut down, whether locally initiated
    /// or observed from the relay side.
    pub async fn wait_closed(&self) {
        let mut rx = self.shutdown.subscribe();
        if self.is_closed() {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Tears the session down: stops the keepalive and relay reader, sends
    /// a best-effort whole-tunnel `disconnect`, closes the control socket,
    /// and closes every local connection. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(());
        let _ = self
            .control
            .send(&ControlMessage::Disconnect { user_id: None })
            .await;
        let _ = self.control.shutdown().await;

        let drained: Vec<(String, LocalEntry)> = self.locals.write().await.drain().collect();
        for (user_id, entry) in drained {
            tracing::debug!(user_id, "closing local connection");
            if let Some(abort) = entry.abort {
                abort.abort();
            }
            let _ = entry.writer.lock().await.shutdown().await;
        }
    }

    /// Awaits the spawned tasks; call after [`shutdown`].
    ///
    /// [`shutdown`]: TunnelClient::shutdown
    pub async fn join(&self) {
        let handles = std::mem::take(&mut *self.tasks.lock().await);
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub async fn local_count(&self) -> usize {
        self.locals.read().await.len()
    }

    /// Inserts a freshly dialed local connection.
    ///
    /// Insertion is refused once the client is closed; the closed check
    /// happens under the table lock so a dial racing shutdown is either
    /// drained by it or turned away here.
    async fn add_local(&self, user_id: String, mut writer: OwnedWriteHalf) {
        {
            let mut locals = self.locals.write().await;
            if !self.is_closed() {
                let entry = LocalEntry {
                    writer: Arc::new(Mutex::new(writer)),
                    abort: None,
                };
                locals.insert(user_id, entry);
                return;
            }
        }
        tracing::debug!(user_id, "refusing local connection opened during teardown");
        let _ = writer.shutdown().await;
    }

    async fn set_local_abort(&self, user_id: &str, abort: AbortHandle) {
        if let Some(entry) = self.locals.write().await.get_mut(user_id) {
            entry.abort = Some(abort);
        }
    }

    /// Writes relayed user bytes to the matching local connection.
    ///
    /// Unknown user ids are dropped; a write error closes that one
    /// connection.
    async fn write_to_local(&self, user_id: &str, data: &[u8]) {
        let writer = {
            let locals = self.locals.read().await;
            locals.get(user_id).map(|entry| Arc::clone(&entry.writer))
        };
        let Some(writer) = writer else {
            tracing::debug!(user_id, "dropping data for unknown user");
            return;
        };
        let result = writer.lock().await.write_all(data).await;
        if let Err(e) = result {
            tracing::warn!(user_id, error = %e, "error writing to local service");
            self.drop_local(user_id).await;
            // Best effort: the relay closes the user socket on receipt.
            let _ = self
                .control
                .send(&ControlMessage::Disconnect {
                    user_id: Some(user_id.to_string()),
                })
                .await;
        }
    }

    /// Removes a local entry from within its own reader task.
    async fn remove_local(&self, user_id: &str) -> bool {
        let Some(entry) = self.take_local(user_id).await else {
            return false;
        };
        let _ = entry.writer.lock().await.shutdown().await;
        true
    }

    /// Removes a local entry from outside its reader task, stopping the
    /// reader as well.
    async fn drop_local(&self, user_id: &str) -> bool {
        let Some(entry) = self.take_local(user_id).await else {
            return false;
        };
        if let Some(abort) = entry.abort {
            abort.abort();
        }
        let _ = entry.writer.lock().await.shutdown().await;
        true
    }

    async fn take_local(&self, user_id: &str) -> Option<LocalEntry> {
        self.locals.write().await.remove(user_id)
    }
}

impl std::fmt::Debug for TunnelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelClient")
            .field("local_host", &self.local_host)
            .field("local_port", &self.local_port)
            .field("public_port", &self.public_port)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Runs the tunnel client until SIGINT/SIGTERM or relay-side termination.
pub async fn run_client(args: &ClientArgs) -> Result<()> {
    let client = TunnelClient::connect(args).await?;

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
        _ = client.wait_closed() => {}
    }

    client.shutdown().await;
    client.join().await;
    tracing::info!("tunnel client shutdown complete");
    Ok(())
}

/// Dispatches control messages from the relay until EOF, decode error, or
/// client shutdown. Termination initiates client shutdown.
async fn relay_reader(client: Arc<TunnelClient>, mut reader: MessageReader<OwnedReadHalf>) {
    let mut shutdown_rx = client.subscribe();
    if !client.is_closed() {
        loop {
            let message = tokio::select! {
                message = reader.read_message::<ControlMessage>() => message,
                _ = shutdown_rx.recv() => break,
            };
            match message {
                Ok(Some(ControlMessage::Connect { user_id })) => {
                    tokio::spawn(open_local(Arc::clone(&client), user_id));
                }
                Ok(Some(ControlMessage::Data { user_id, data })) => {
                    client.write_to_local(&user_id, &data).await;
                }
                Ok(Some(ControlMessage::Disconnect { user_id: Some(user_id) })) => {
                    tracing::debug!(user_id, "user disconnected");
                    client.drop_local(&user_id).await;
                }
                Ok(Some(ControlMessage::Disconnect { user_id: None })) => {
                    tracing::info!("relay requested disconnect");
                    break;
                }
                Ok(Some(ControlMessage::Pong)) => {
                    tracing::debug!("received pong from relay");
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::info!("connection to relay closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "error decoding message from relay");
                    break;
                }
            }
        }
    }
    client.shutdown().await;
}

/// Opens the local-service connection for a newly announced user and pumps
/// its replies back toward the relay.
async fn open_local(client: Arc<TunnelClient>, user_id: String) {
    tracing::debug!(user_id, "new user session");

    let stream = match TcpStream::connect((client.local_host.as_str(), client.local_port)).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(
                user_id,
                error = %e,
                "failed to connect to local service {}:{}",
                client.local_host,
                client.local_port
            );
            // Tell the relay so it can close the user socket promptly.
            let _ = client
                .control
                .send(&ControlMessage::Disconnect {
                    user_id: Some(user_id),
                })
                .await;
            return;
        }
    };

    let (read_half, write_half) = stream.into_split();
    client.add_local(user_id.clone(), write_half).await;

    let reader = tokio::spawn(local_reader(Arc::clone(&client), user_id.clone(), read_half));
    client.set_local_abort(&user_id, reader.abort_handle()).await;
}

/// Pumps local-service replies into `data` messages, mirroring the server's
/// user reader.
async fn local_reader(client: Arc<TunnelClient>, user_id: String, mut read_half: OwnedReadHalf) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(user_id, "local service closed connection");
                break;
            }
            Ok(n) => {
                let message = ControlMessage::Data {
                    user_id: user_id.clone(),
                    data: buf[..n].to_vec(),
                };
                if let Err(e) = client.control.send(&message).await {
                    tracing::warn!(user_id, error = %e, "error sending data to relay");
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(user_id, error = %e, "error reading from local service");
                break;
            }
        }
    }

    client.remove_local(&user_id).await;
    let _ = client
        .control
        .send(&ControlMessage::Disconnect {
            user_id: Some(user_id),
        })
        .await;
}

/// Emits a `ping` on the control channel every 30 seconds.
///
/// A failed write is logged only; the relay reader observes a dead channel
/// soon enough.
async fn keepalive(client: Arc<TunnelClient>) {
    let period = Duration::from_secs(PING_INTERVAL_SECS);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    let mut shutdown_rx = client.subscribe();
    if client.is_closed() {
        return;
    }
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match client.control.send(&ControlMessage::Ping).await {
                    Ok(()) => tracing::debug!("ping sent to relay"),
                    Err(e) => tracing::warn!(error = %e, "error sending ping"),
                }
            }
            _ = shutdown_rx.recv() => return,
        }
    }
}
