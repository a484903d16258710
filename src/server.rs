//! Relay server: client registration, public-port listeners, and the
//! per-session forwarding tasks.
//!
//! Each registered client gets two long-lived tasks: a control reader
//! draining its control channel and a user acceptor looping on the assigned
//! public port. Every accepted user connection adds a user reader task that
//! pumps bytes into `data` messages. All control-channel writes from these
//! tasks go through the session's shared [`MessageWriter`], one whole record
//! per write.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::cli::ServerArgs;
use crate::common::{shutdown_signal, MessageReader, MessageWriter, READ_BUFFER_SIZE};
use crate::error::{Error, Result};
use crate::protocol::{ControlMessage, RegistrationRequest, RegistrationResponse};
use crate::session::{ClientSession, ServerState};

/// The relay server: a bound registration listener plus shared state.
pub struct RelayServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl RelayServer {
    /// Binds the registration listener and seeds the port pool.
    ///
    /// Failure here is fatal for the process.
    pub async fn bind(args: &ServerArgs) -> Result<RelayServer> {
        if args.min_port > args.max_port {
            return Err(Error::Config(format!(
                "invalid port range: {}-{}",
                args.min_port, args.max_port
            )));
        }
        let listener = TcpListener::bind(("0.0.0.0", args.port))
            .await
            .map_err(|e| Error::Bind(format!("registration port {}: {}", args.port, e)))?;
        Ok(RelayServer {
            listener,
            state: Arc::new(ServerState::new(args.min_port, args.max_port)),
        })
    }

    /// The bound registration address (useful when `--port 0` was given).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle to the server state, for shutdown coordination and inspection.
    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Accepts registrations until the shutdown signal fires, then tears
    /// down every session and awaits their tasks.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let RelayServer { listener, state } = self;

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(handle_registration(state, stream, peer));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "error accepting registration connection");
                    }
                },
                _ = shutdown_rx.recv() => {
                    tracing::info!("shutting down relay server");
                    break;
                }
            }
        }

        drop(listener);
        state.cleanup_all().await;
        for handle in state.take_tasks().await {
            let _ = handle.await;
        }

        tracing::info!("server shutdown complete");
        Ok(())
    }
}

/// Runs the relay server until SIGINT or SIGTERM.
pub async fn run_server(args: &ServerArgs) -> Result<()> {
    let server = RelayServer::bind(args).await?;
    tracing::info!(
        port = args.port,
        min_port = args.min_port,
        max_port = args.max_port,
        "registration server listening"
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    server.run(shutdown_rx).await
}

/// Processes one inbound registration connection.
///
/// Walks the handshake states in order; any failure before the success
/// response cleans up inline (releasing the port and dropping a
/// partially-created listener). Once the response is sent the session is
/// live and teardown goes through `ServerState::cleanup_session`.
async fn handle_registration(state: Arc<ServerState>, stream: TcpStream, peer: SocketAddr) {
    tracing::info!(%peer, "new client connection");

    let (read_half, write_half) = stream.into_split();
    let mut reader = MessageReader::new(read_half);
    let writer = MessageWriter::new(write_half);

    let request: RegistrationRequest = match reader.read_message().await {
        Ok(Some(request)) => request,
        Ok(None) => {
            tracing::debug!(%peer, "connection closed before registration");
            return;
        }
        Err(e) => {
            tracing::warn!(%peer, error = %e, "error decoding registration request");
            let _ = writer
                .send(&RegistrationResponse::rejected("invalid request format"))
                .await;
            return;
        }
    };

    if request.local_port == 0 {
        let err = Error::InvalidRequest("invalid local port specified".to_string());
        tracing::warn!(%peer, error = %err, "rejecting registration");
        let _ = writer
            .send(&RegistrationResponse::rejected(err.to_string()))
            .await;
        return;
    }

    let port = match state.allocate_port().await {
        Ok(port) => port,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "failed to allocate port");
            let _ = writer
                .send(&RegistrationResponse::rejected(e.to_string()))
                .await;
            return;
        }
    };

    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::warn!(port, error = %e, "failed to bind assigned port");
            state.release_port(port).await;
            let _ = writer
                .send(&RegistrationResponse::rejected(format!(
                    "failed to bind to port {}",
                    port
                )))
                .await;
            return;
        }
    };

    let session = Arc::new(ClientSession::new(
        port,
        request.local_host,
        request.local_port,
        peer,
        writer,
    ));
    state.insert_session(Arc::clone(&session)).await;

    if let Err(e) = session
        .control()
        .send(&RegistrationResponse::granted(port))
        .await
    {
        tracing::warn!(%peer, error = %e, "error sending registration response");
        state.cleanup_session(&session).await;
        return;
    }

    let (target_host, target_port) = session.target();
    tracing::info!(
        port,
        %peer,
        target = %format!("{}:{}", target_host, target_port),
        "assigned public port to client"
    );

    let control = tokio::spawn(control_reader(
        Arc::clone(&state),
        Arc::clone(&session),
        reader,
    ));
    let acceptor = tokio::spawn(user_acceptor(Arc::clone(&session), listener));
    state.track(control).await;
    state.track(acceptor).await;
}

/// Drains control messages from a registered client until EOF, decode
/// error, or session shutdown. Termination always runs session cleanup.
async fn control_reader(
    state: Arc<ServerState>,
    session: Arc<ClientSession>,
    mut reader: MessageReader<OwnedReadHalf>,
) {
    let port = session.public_port();
    let mut shutdown_rx = session.subscribe();
    if !session.is_closed() {
        loop {
            let message = tokio::select! {
                message = reader.read_message::<ControlMessage>() => message,
                _ = shutdown_rx.recv() => break,
            };
            match message {
                Ok(Some(ControlMessage::Data { user_id, data })) => {
                    session.write_to_user(&user_id, &data).await;
                }
                Ok(Some(ControlMessage::Ping)) => {
                    if let Err(e) = session.control().send(&ControlMessage::Pong).await {
                        tracing::warn!(port, error = %e, "error sending pong");
                        break;
                    }
                }
                Ok(Some(ControlMessage::Disconnect { user_id: None })) => {
                    tracing::info!(port, "client requested disconnect");
                    break;
                }
                Ok(Some(ControlMessage::Disconnect { user_id: Some(user_id) })) => {
                    tracing::debug!(port, user_id, "client closed user connection");
                    session.drop_user(&user_id).await;
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::debug!(port, "control channel closed by client");
                    break;
                }
                Err(e) => {
                    tracing::warn!(port, error = %e, "error decoding control message");
                    break;
                }
            }
        }
    }
    state.cleanup_session(&session).await;
}

/// Accepts external users on the session's assigned public port.
async fn user_acceptor(session: Arc<ClientSession>, listener: TcpListener) {
    let port = session.public_port();
    let mut shutdown_rx = session.subscribe();
    if session.is_closed() {
        return;
    }
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown_rx.recv() => break,
        };
        let (stream, user_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                if session.is_closed() {
                    break;
                }
                tracing::warn!(port, error = %e, "error accepting user connection");
                continue;
            }
        };

        let user_id = mint_user_id(user_addr);
        tracing::info!(port, %user_addr, user_id, "new user connection");

        let (read_half, write_half) = stream.into_split();
        session.add_user(user_id.clone(), write_half).await;

        let connect = ControlMessage::Connect {
            user_id: user_id.clone(),
        };
        if let Err(e) = session.control().send(&connect).await {
            tracing::warn!(port, user_id, error = %e, "error notifying client of new user");
            session.drop_user(&user_id).await;
            continue;
        }

        let reader = tokio::spawn(user_reader(Arc::clone(&session), user_id.clone(), read_half));
        session.set_user_abort(&user_id, reader.abort_handle()).await;
    }
    // The listener drops here, so a port freed by cleanup refuses new
    // connections immediately.
    drop(listener);
}

/// Pumps bytes from one user socket into `data` messages.
///
/// A single task per direction keeps the per-user byte stream ordered
/// across the tunnel.
async fn user_reader(session: Arc<ClientSession>, user_id: String, mut read_half: OwnedReadHalf) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(user_id, "user connection closed");
                break;
            }
            Ok(n) => {
                let message = ControlMessage::Data {
                    user_id: user_id.clone(),
                    data: buf[..n].to_vec(),
                };
                if let Err(e) = session.control().send(&message).await {
                    tracing::warn!(user_id, error = %e, "error forwarding user data to client");
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(user_id, error = %e, "error reading from user");
                break;
            }
        }
    }

    session.remove_user(&user_id).await;
    // Best effort: the session may already be tearing down.
    let _ = session
        .control()
        .send(&ControlMessage::Disconnect {
            user_id: Some(user_id),
        })
        .await;
}

/// Mints a user id unique within this server process.
fn mint_user_id(user_addr: SocketAddr) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{}-{}", user_addr, nanos)
}
