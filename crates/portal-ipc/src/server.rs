//! IPC server implementation

use portal_api::{
    ClientInfo, ClientRole, Command, ErrorCode, ErrorInfo, Event, Request, Response,
};
use portal_util::ClientId;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{IpcError, IpcResult};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Message from a client connection to the service
#[derive(Debug)]
pub enum ServerMessage {
    Request {
        client_id: ClientId,
        request: Request,
    },
    ClientConnected {
        client_id: ClientId,
        info: ClientInfo,
    },
    ClientDisconnected {
        client_id: ClientId,
    },
}

/// NDJSON server on a Unix domain socket
pub struct IpcServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    clients: Arc<RwLock<HashMap<ClientId, ClientHandle>>>,
    event_tx: broadcast::Sender<Event>,
    message_tx: mpsc::UnboundedSender<ServerMessage>,
    message_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<ServerMessage>>>>,
}

struct ClientHandle {
    info: ClientInfo,
    response_tx: mpsc::UnboundedSender<String>,
    subscribed: bool,
}

/// Role granted to a peer: root and the service's own user administer,
/// everyone else is a gateway acting for users
pub fn role_for_uid(uid: Option<u32>, service_uid: u32) -> ClientRole {
    match uid {
        Some(0) => ClientRole::Admin,
        Some(u) if u == service_uid => ClientRole::Admin,
        _ => ClientRole::Gateway,
    }
}

impl IpcServer {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
            clients: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            message_tx,
            message_rx: Arc::new(Mutex::new(Some(message_rx))),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket, replacing a stale one
    pub async fn start(&mut self) -> IpcResult<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        // Owner and group only
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o660))?;

        info!(path = %self.socket_path.display(), "IPC server listening");

        self.listener = Some(listener);

        Ok(())
    }

    /// Receiver for client messages. Can be taken once.
    pub async fn take_message_receiver(&self) -> Option<mpsc::UnboundedReceiver<ServerMessage>> {
        self.message_rx.lock().await.take()
    }

    /// Accept connections until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> IpcResult<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| IpcError::ServerError("Server not started".into()))?;
        let service_uid = nix::unistd::getuid().as_raw();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let client_id = ClientId::new();
                        let (uid, pid) = peer_credentials(&stream);
                        let role = role_for_uid(uid, service_uid);

                        let mut info = ClientInfo::new(role);
                        info.client_id = client_id.clone();
                        if let Some(uid) = uid {
                            info = info.with_uid(uid);
                        }
                        if let Some(pid) = pid {
                            info = info.with_pid(pid);
                        }

                        info!(client_id = %client_id, uid = ?uid, role = ?role, "Client connected");
                        self.handle_client(stream, client_id, info).await;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("IPC server stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_client(&self, stream: UnixStream, client_id: ClientId, info: ClientInfo) {
        let (read_half, write_half) = stream.into_split();
        let (response_tx, mut response_rx) = mpsc::unbounded_channel::<String>();

        self.clients.write().await.insert(
            client_id.clone(),
            ClientHandle {
                info: info.clone(),
                response_tx: response_tx.clone(),
                subscribed: false,
            },
        );

        let _ = self.message_tx.send(ServerMessage::ClientConnected {
            client_id: client_id.clone(),
            info,
        });

        // Reader: parse requests, track subscription, forward to the service
        let clients = self.clients.clone();
        let message_tx = self.message_tx.clone();
        let reader_id = client_id.clone();
        let reject_tx = response_tx;
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        debug!(client_id = %reader_id, "Client disconnected (EOF)");
                        break;
                    }
                    Ok(_) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }

                        let request = match serde_json::from_str::<Request>(line) {
                            Ok(request) => request,
                            Err(e) => {
                                warn!(client_id = %reader_id, error = %e, "Invalid request");
                                let response = Response::error(
                                    0,
                                    ErrorInfo::new(ErrorCode::InvalidRequest, e.to_string()),
                                );
                                if let Ok(json) = serde_json::to_string(&response) {
                                    let _ = reject_tx.send(json);
                                }
                                continue;
                            }
                        };

                        let subscribed = match request.command {
                            Command::SubscribeEvents => Some(true),
                            Command::UnsubscribeEvents => Some(false),
                            _ => None,
                        };
                        if let Some(subscribed) = subscribed
                            && let Some(handle) = clients.write().await.get_mut(&reader_id)
                        {
                            handle.subscribed = subscribed;
                        }

                        let _ = message_tx.send(ServerMessage::Request {
                            client_id: reader_id.clone(),
                            request,
                        });
                    }
                    Err(e) => {
                        debug!(client_id = %reader_id, error = %e, "Read error");
                        break;
                    }
                }
            }

            // Dropping the handle closes the writer's response channel
            clients.write().await.remove(&reader_id);
            let _ = message_tx.send(ServerMessage::ClientDisconnected {
                client_id: reader_id,
            });
        });

        // Writer: responses, plus events for subscribed clients
        let mut event_rx = self.event_tx.subscribe();
        let clients = self.clients.clone();
        let writer_id = client_id;
        tokio::spawn(async move {
            let mut writer = write_half;

            loop {
                let line = tokio::select! {
                    response = response_rx.recv() => match response {
                        Some(response) => response,
                        None => break,
                    },
                    event = event_rx.recv() => match event {
                        Ok(event) => {
                            let subscribed = clients
                                .read()
                                .await
                                .get(&writer_id)
                                .is_some_and(|h| h.subscribed);
                            if !subscribed {
                                continue;
                            }
                            match serde_json::to_string(&event) {
                                Ok(json) => json,
                                Err(e) => {
                                    warn!(error = %e, "Failed to serialize event");
                                    continue;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(client_id = %writer_id, missed, "Client lagged, events dropped");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                let mut msg = line;
                msg.push('\n');
                if let Err(e) = writer.write_all(msg.as_bytes()).await {
                    debug!(client_id = %writer_id, error = %e, "Write error");
                    break;
                }
            }
        });
    }

    /// Send a response to a specific client
    pub async fn send_response(&self, client_id: &ClientId, response: Response) -> IpcResult<()> {
        let json = serde_json::to_string(&response)?;

        let clients = self.clients.read().await;
        let handle = clients.get(client_id).ok_or(IpcError::ConnectionClosed)?;
        handle
            .response_tx
            .send(json)
            .map_err(|_| IpcError::ConnectionClosed)
    }

    /// Broadcast an event to all subscribed clients
    pub fn broadcast_event(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }

    pub async fn get_client_info(&self, client_id: &ClientId) -> Option<ClientInfo> {
        self.clients
            .read()
            .await
            .get(client_id)
            .map(|h| h.info.clone())
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Remove the socket file
    pub fn shutdown(&self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Peer uid and pid of a Unix socket connection
fn peer_credentials(stream: &UnixStream) -> (Option<u32>, Option<i32>) {
    use std::os::unix::io::AsFd;

    let fd = stream.as_fd();
    match nix::sys::socket::getsockopt(&fd, nix::sys::socket::sockopt::PeerCredentials) {
        Ok(cred) => (Some(cred.uid()), Some(cred.pid())),
        Err(_) => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IpcClient;
    use portal_api::{EventPayload, ResponsePayload, ResponseResult};
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn peer_roles() {
        assert_eq!(role_for_uid(Some(0), 1000), ClientRole::Admin);
        assert_eq!(role_for_uid(Some(1000), 1000), ClientRole::Admin);
        assert_eq!(role_for_uid(Some(1001), 1000), ClientRole::Gateway);
        assert_eq!(role_for_uid(None, 1000), ClientRole::Gateway);
    }

    #[tokio::test]
    async fn server_start_creates_socket() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("run").join("test.sock");

        let mut server = IpcServer::new(&socket_path);
        server.start().await.unwrap();

        assert!(socket_path.exists());
        let mode = std::fs::metadata(&socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);

        server.shutdown();
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn request_response_and_events() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let mut server = IpcServer::new(&socket_path);
        server.start().await.unwrap();
        let server = Arc::new(server);
        let mut messages = server.take_message_receiver().await.unwrap();
        assert!(server.take_message_receiver().await.is_none());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = {
            let server = server.clone();
            tokio::spawn(async move { server.run(shutdown_rx).await })
        };

        // Echo service: answer every request with Pong
        let responder = {
            let server = server.clone();
            tokio::spawn(async move {
                while let Some(msg) = messages.recv().await {
                    match msg {
                        ServerMessage::ClientConnected { info, .. } => {
                            // Tests run as the service user
                            assert_eq!(info.role, ClientRole::Admin);
                        }
                        ServerMessage::Request { client_id, request } => {
                            let response =
                                Response::success(request.request_id, ResponsePayload::Pong);
                            server.send_response(&client_id, response).await.unwrap();
                        }
                        ServerMessage::ClientDisconnected { .. } => {}
                    }
                }
            })
        };

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        let response = client.send(Command::Ping).await.unwrap();
        assert_eq!(response.request_id, 1);
        assert!(matches!(response.result, ResponseResult::Ok(ResponsePayload::Pong)));

        let mut events = IpcClient::connect(&socket_path)
            .await
            .unwrap()
            .subscribe()
            .await
            .unwrap();
        server.broadcast_event(Event::new(EventPayload::Shutdown));
        let event = events.next().await.unwrap();
        assert!(matches!(event.payload, EventPayload::Shutdown));

        shutdown_tx.send(true).unwrap();
        run.await.unwrap().unwrap();
        responder.abort();
    }

    #[tokio::test]
    async fn subscriber_stays_connected_between_events() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let mut server = IpcServer::new(&socket_path);
        server.start().await.unwrap();
        let server = Arc::new(server);
        let mut messages = server.take_message_receiver().await.unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = server.clone();
        tokio::spawn(async move { runner.run(shutdown_rx).await });

        let responder = server.clone();
        tokio::spawn(async move {
            while let Some(msg) = messages.recv().await {
                if let ServerMessage::Request { client_id, request } = msg {
                    let response = Response::success(request.request_id, ResponsePayload::Pong);
                    let _ = responder.send_response(&client_id, response).await;
                }
            }
        });

        let mut events = IpcClient::connect(&socket_path)
            .await
            .unwrap()
            .subscribe()
            .await
            .unwrap();

        // Long enough for the server to notice a half-closed socket
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.client_count().await, 1);

        for _ in 0..2 {
            server.broadcast_event(Event::new(EventPayload::Shutdown));
            let event = tokio::time::timeout(Duration::from_secs(5), events.next())
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(event.payload, EventPayload::Shutdown));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(server.client_count().await, 1);
    }

    #[tokio::test]
    async fn malformed_request_gets_error_response() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let mut server = IpcServer::new(&socket_path);
        server.start().await.unwrap();
        let server = Arc::new(server);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = server.clone();
        tokio::spawn(async move { runner.run(shutdown_rx).await });

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(b"{not json}\n").await.unwrap();

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let response: Response = serde_json::from_str(line.trim()).unwrap();
        match response.result {
            ResponseResult::Err(e) => assert_eq!(e.code, ErrorCode::InvalidRequest),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
