//! Service wiring and the main event loop

use anyhow::{Context, Result};
use portal_api::{ClientInfo, ClientRole, ErrorCode, ErrorInfo, Event, EventPayload, Response};
use portal_config::{PortalConfig, ProviderConfig, ProviderKind};
use portal_core::{ControllerSettings, DailyShutdown, Reaper, SessionController};
use portal_ipc::{IpcServer, ServerMessage};
use portal_provider_api::{InstanceRef, MockProvider, ProviderAdapter, RetryPolicy, RetryingProvider};
use portal_provider_gpufree::{GpuFreeProvider, GpuFreeSettings};
use portal_store::{AuditEvent, AuditEventType, SqliteStore, Store};
use portal_util::RateLimiter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{Dispatcher, seed_store};

/// Requests per second allowed for each client
const RATE_LIMIT_PER_SECOND: u32 = 30;

/// Path overrides from the command line
#[derive(Debug, Clone, Default)]
pub struct ServicePaths {
    pub socket: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
}

/// Build the provider named by the configuration
pub fn build_provider(config: &PortalConfig) -> Result<Arc<dyn ProviderAdapter>> {
    let provider: Arc<dyn ProviderAdapter> = match config.provider.kind {
        ProviderKind::Gpufree => {
            let settings = gpufree_settings(&config.provider);
            let adapter = GpuFreeProvider::new(settings)
                .context("Failed to build the GPUFree provider")?;
            Arc::new(RetryingProvider::new(adapter, retry_policy(&config.provider)))
        }
        ProviderKind::Mock => {
            let mock = MockProvider::new();
            for seed in &config.instances {
                mock.add_instance(&InstanceRef::new(seed.uuid.clone(), seed.provider_id), false);
            }
            Arc::new(RetryingProvider::new(mock, retry_policy(&config.provider)))
        }
    };

    info!(provider = provider.name(), "Provider initialized");
    Ok(provider)
}

fn gpufree_settings(config: &ProviderConfig) -> GpuFreeSettings {
    GpuFreeSettings {
        base_url: config.base_url.clone(),
        token: config.token_from_env(),
        token_env: config.token_env.clone(),
        start_mode: config.start_mode.clone(),
        page_size: config.page_size,
        request_timeout: config.timeout,
    }
}

fn retry_policy(config: &ProviderConfig) -> RetryPolicy {
    RetryPolicy {
        timeout: config.timeout,
        max_retries: config.max_retries,
        backoff_initial: config.backoff_initial,
        backoff_max: config.backoff_max,
    }
}

/// Main service state
pub struct Service {
    config: PortalConfig,
    controller: Arc<SessionController>,
    reaper: Arc<Reaper>,
    scheduler: Arc<DailyShutdown>,
    ipc: Arc<IpcServer>,
    store: Arc<dyn Store>,
    rate_limiter: Mutex<RateLimiter>,
}

impl Service {
    /// Open the store, seed it and bind the socket, using the provider from
    /// the configuration
    pub async fn new(config: PortalConfig, paths: ServicePaths) -> Result<Self> {
        let provider = build_provider(&config)?;
        Self::with_provider(config, paths, provider).await
    }

    pub async fn with_provider(
        mut config: PortalConfig,
        paths: ServicePaths,
        provider: Arc<dyn ProviderAdapter>,
    ) -> Result<Self> {
        if let Some(socket) = paths.socket {
            config.service.socket_path = socket;
        }
        if let Some(data_dir) = paths.data_dir {
            config.service.data_dir = data_dir;
        }
        let socket_path = config.service.socket_path.clone();
        let data_dir = &config.service.data_dir;

        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

        let db_path = config.service.database_path();
        let store: Arc<dyn Store> = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database {:?}", db_path))?,
        );
        info!(db_path = %db_path.display(), "Store initialized");

        seed_store(store.as_ref(), &config)?;
        store.append_audit(AuditEvent::new(AuditEventType::ConfigLoaded {
            users: config.users.len(),
            instances: config.instances.len(),
        }))?;
        store.append_audit(AuditEvent::new(AuditEventType::ServiceStarted))?;

        let controller = Arc::new(SessionController::new(
            store.clone(),
            provider,
            ControllerSettings::from(&config.controller),
        ));
        let reaper = Arc::new(Reaper::new(controller.clone()));
        let scheduler = Arc::new(DailyShutdown::new(
            controller.clone(),
            config.shutdown.clone(),
            portal_util::now(),
        ));

        let mut ipc = IpcServer::new(&socket_path);
        ipc.start()
            .await
            .with_context(|| format!("Failed to bind socket {:?}", socket_path))?;

        Ok(Self {
            config,
            controller,
            reaper,
            scheduler,
            ipc: Arc::new(ipc),
            store,
            rate_limiter: Mutex::new(RateLimiter::new(
                RATE_LIMIT_PER_SECOND,
                Duration::from_secs(1),
            )),
        })
    }

    pub fn controller(&self) -> &Arc<SessionController> {
        &self.controller
    }

    pub fn socket_path(&self) -> PathBuf {
        self.ipc.socket_path().to_path_buf()
    }

    /// Serve until `shutdown` flips to true, then stop the background tasks
    /// and wait for them. Assigned instances are left as they are.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut messages = self
            .ipc
            .take_message_receiver()
            .await
            .context("IPC message receiver already taken")?;

        let mut tasks: Vec<JoinHandle<()>> = vec![
            self.reaper
                .clone()
                .spawn(self.config.controller.reaper_interval, shutdown.clone()),
            self.scheduler.clone().spawn(shutdown.clone()),
            self.forward_events(shutdown.clone()),
        ];

        let ipc_accept = self.ipc.clone();
        let accept_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = ipc_accept.run(accept_shutdown).await {
                error!(error = %e, "IPC server error");
            }
        }));

        let dispatcher = Arc::new(Dispatcher::new(
            self.controller.clone(),
            self.scheduler.clone(),
        ));

        info!("Service running");

        loop {
            tokio::select! {
                Some(msg) = messages.recv() => {
                    self.handle_ipc_message(&dispatcher, msg).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Shutting down portald");
        self.ipc.broadcast_event(Event::new(EventPayload::Shutdown));

        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        if let Err(e) = self
            .store
            .append_audit(AuditEvent::new(AuditEventType::ServiceStopped))
        {
            warn!(error = %e, "Failed to log service shutdown");
        }

        info!("Shutdown complete");
        Ok(())
    }

    /// Relay controller events to subscribed clients
    fn forward_events(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut events = self.controller.subscribe();
        let ipc = self.ipc.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) => ipc.broadcast_event(Event::new(event.to_payload())),
                        Err(RecvError::Lagged(n)) => {
                            warn!(missed = n, "Event forwarder lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn handle_ipc_message(&self, dispatcher: &Arc<Dispatcher>, msg: ServerMessage) {
        match msg {
            ServerMessage::Request { client_id, request } => {
                if !self.rate_limiter.lock().await.check(&client_id) {
                    let response = Response::error(
                        request.request_id,
                        ErrorInfo::new(ErrorCode::RateLimited, "Too many requests"),
                    );
                    let _ = self.ipc.send_response(&client_id, response).await;
                    return;
                }

                let info = match self.ipc.get_client_info(&client_id).await {
                    Some(info) => info,
                    // Gone already; answer with the least privilege
                    None => ClientInfo::new(ClientRole::Gateway),
                };

                // Provider calls can take a while; keep the loop free
                let dispatcher = dispatcher.clone();
                let ipc = self.ipc.clone();
                tokio::spawn(async move {
                    let response = dispatcher
                        .handle(&info, request.request_id, request.command)
                        .await;
                    if let Err(e) = ipc.send_response(&client_id, response).await {
                        debug!(client_id = %client_id, error = %e, "Response not delivered");
                    }
                });
            }

            ServerMessage::ClientConnected { client_id, info } => {
                info!(
                    client_id = %client_id,
                    role = ?info.role,
                    uid = ?info.uid,
                    "Client connected"
                );

                let _ = self.store.append_audit(AuditEvent::new(
                    AuditEventType::ClientConnected {
                        client_id: client_id.to_string(),
                        role: format!("{:?}", info.role),
                        uid: info.uid,
                    },
                ));
            }

            ServerMessage::ClientDisconnected { client_id } => {
                debug!(client_id = %client_id, "Client disconnected");

                let _ = self.store.append_audit(AuditEvent::new(
                    AuditEventType::ClientDisconnected {
                        client_id: client_id.to_string(),
                    },
                ));

                self.rate_limiter.lock().await.remove(&client_id);
            }
        }
    }
}
