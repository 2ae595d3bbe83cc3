//! Command dispatch: protocol commands to controller operations

use portal_api::{
    ClientInfo, ClientRole, Command, ErrorCode, ErrorInfo, HealthStatus, Response,
    ResponsePayload, StopReason,
};
use portal_core::{DailyShutdown, SessionController};
use portal_util::{PortalError, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Executes commands on behalf of connected clients
pub struct Dispatcher {
    controller: Arc<SessionController>,
    scheduler: Arc<DailyShutdown>,
}

impl Dispatcher {
    pub fn new(controller: Arc<SessionController>, scheduler: Arc<DailyShutdown>) -> Self {
        Self {
            controller,
            scheduler,
        }
    }

    pub async fn handle(&self, client: &ClientInfo, request_id: u64, command: Command) -> Response {
        if command.requires_admin() && client.role != ClientRole::Admin {
            warn!(
                client_id = %client.client_id,
                uid = ?client.uid,
                command = ?command,
                "Admin command refused"
            );
            return Response::error(
                request_id,
                ErrorInfo::new(ErrorCode::PermissionDenied, "Admin role required"),
            );
        }

        match self.execute(client, command).await {
            Ok(payload) => Response::success(request_id, payload),
            Err(e) => {
                if e.is_validation() {
                    debug!(client_id = %client.client_id, error = %e, "Command rejected");
                } else {
                    warn!(client_id = %client.client_id, error = %e, "Command failed");
                }
                Response::error(request_id, ErrorInfo::from(&e))
            }
        }
    }

    async fn execute(&self, client: &ClientInfo, command: Command) -> Result<ResponsePayload> {
        let now = portal_util::now();
        let controller = &self.controller;

        let payload = match command {
            Command::RequestStart { user_id } => ResponsePayload::Start {
                outcome: controller.request_start(&user_id, now).await?,
            },

            Command::RequestStop { user_id } => ResponsePayload::Stop {
                outcome: controller
                    .request_stop(&user_id, StopReason::User, now)
                    .await?,
            },

            Command::Heartbeat { user_id } => ResponsePayload::Heartbeat {
                outcome: controller.record_heartbeat(&user_id, now).await?,
            },

            Command::PollStatus { user_id } => {
                ResponsePayload::Status(controller.poll_status(&user_id, now).await?)
            }

            Command::GetUser { user_id } => ResponsePayload::User(controller.get_user(&user_id)?),

            Command::Lookup { user_id } => ResponsePayload::Instance {
                instance: controller.lookup(&user_id)?,
            },

            Command::GetSchedule => ResponsePayload::Schedule(self.scheduler.view()),

            Command::GetHealth => {
                let provider = controller.provider();
                ResponsePayload::Health(HealthStatus {
                    live: true,
                    ready: true,
                    provider: provider.name().to_string(),
                    provider_ok: provider.is_healthy(),
                    store_ok: controller.store().is_healthy(),
                })
            }

            Command::SubscribeEvents => ResponsePayload::Subscribed {
                client_id: client.client_id.clone(),
            },

            Command::UnsubscribeEvents => ResponsePayload::Unsubscribed,

            Command::ListUsers => ResponsePayload::Users {
                users: controller.list_users()?,
            },

            Command::Assign { user_id, instance } => {
                controller.assign(&user_id, &instance).await?;
                ResponsePayload::Assigned { user_id, instance }
            }

            Command::Release { user_id } => match controller.release(&user_id, now).await? {
                (Some(instance), stop) => ResponsePayload::Released {
                    user_id,
                    instance,
                    stop,
                },
                (None, _) => return Err(PortalError::NoInstanceAssigned(user_id)),
            },

            Command::Ping => ResponsePayload::Pong,
        };

        Ok(payload)
    }
}
