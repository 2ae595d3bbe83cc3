//! Integration tests for portald
//!
//! These run the whole service against the mock provider and talk to it
//! over the Unix socket, the way the HTTP gateway does.

use portal_api::{
    Command, ErrorCode, EventPayload, HeartbeatOutcome, ResponsePayload, SessionState, StartOutcome,
    StopOutcome,
};
use portal_config::{PortalConfig, parse_config};
use portal_ipc::{IpcClient, IpcError};
use portal_provider_api::{InstanceRef, MockOp, MockProvider};
use portal_store::{AuditEventType, SqliteStore, Store};
use portal_util::{InstanceId, UserId};
use portald::{Service, ServicePaths};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const CONFIG: &str = r#"
    config_version = 1

    [provider]
    kind = "mock"

    [[users]]
    id = "admin"
    role = "admin"

    [[users]]
    id = "alice"
    owner = "admin"

    [[users]]
    id = "bob"
    owner = "admin"

    [[instances]]
    uuid = "inst-alice"
    provider_id = 101
    nickname = "alice-box"
    target_url = "https://lab.example.com/alice"
    assigned_to = "alice"

    [[instances]]
    uuid = "inst-spare"
    provider_id = 102
    nickname = "spare-box"
    target_url = "https://lab.example.com/spare"
"#;

struct Harness {
    dir: TempDir,
    socket: PathBuf,
    data_dir: PathBuf,
    mock: Arc<MockProvider>,
    shutdown: watch::Sender<bool>,
    service: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("portald.sock");
        let data_dir = dir.path().join("data");

        let config: PortalConfig = parse_config(CONFIG).unwrap();
        let mock = Arc::new(MockProvider::new());
        for seed in &config.instances {
            mock.add_instance(&InstanceRef::new(seed.uuid.clone(), seed.provider_id), false);
        }

        let service = Service::with_provider(
            config,
            ServicePaths {
                socket: Some(socket.clone()),
                data_dir: Some(data_dir.clone()),
            },
            mock.clone(),
        )
        .await
        .unwrap();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let service = tokio::spawn(service.run(shutdown_rx));

        Self {
            dir,
            socket,
            data_dir,
            mock,
            shutdown,
            service,
        }
    }

    async fn client(&self) -> IpcClient {
        IpcClient::connect(&self.socket).await.unwrap()
    }

    /// Shut the service down. The returned `TempDir` keeps the data
    /// directory alive for inspection.
    async fn stop(self) -> (TempDir, PathBuf) {
        self.shutdown.send(true).unwrap();
        self.service.await.unwrap().unwrap();
        (self.dir, self.data_dir)
    }
}

fn alice() -> UserId {
    UserId::new("alice")
}

#[tokio::test]
async fn test_full_session_lifecycle() {
    let harness = Harness::start().await;
    let mut client = harness.client().await;

    let payload = client
        .call(Command::RequestStart { user_id: alice() })
        .await
        .unwrap();
    assert!(matches!(
        payload,
        ResponsePayload::Start {
            outcome: StartOutcome::Starting
        }
    ));

    // Second start is a no-op
    let payload = client
        .call(Command::RequestStart { user_id: alice() })
        .await
        .unwrap();
    assert!(matches!(
        payload,
        ResponsePayload::Start {
            outcome: StartOutcome::AlreadyInState {
                state: SessionState::Starting
            }
        }
    ));

    match client
        .call(Command::PollStatus { user_id: alice() })
        .await
        .unwrap()
    {
        ResponsePayload::Status(status) => {
            assert!(status.is_running);
            assert_eq!(status.state, SessionState::Active);
            assert_eq!(status.target_url, "https://lab.example.com/alice");
        }
        other => panic!("unexpected payload: {:?}", other),
    }

    let payload = client
        .call(Command::Heartbeat { user_id: alice() })
        .await
        .unwrap();
    assert!(matches!(
        payload,
        ResponsePayload::Heartbeat {
            outcome: HeartbeatOutcome::Recorded { .. }
        }
    ));

    let payload = client
        .call(Command::RequestStop { user_id: alice() })
        .await
        .unwrap();
    assert!(matches!(
        payload,
        ResponsePayload::Stop {
            outcome: StopOutcome::Stopped { .. }
        }
    ));

    assert!(!harness.mock.is_running(&InstanceId::new("inst-alice")));
    assert_eq!(
        harness.mock.actions(),
        vec![MockOp::Start, MockOp::Stop]
    );

    drop(client);
    harness.stop().await;
}

#[tokio::test]
async fn test_user_without_instance_is_rejected() {
    let harness = Harness::start().await;
    let mut client = harness.client().await;

    let err = client
        .call(Command::RequestStart {
            user_id: UserId::new("bob"),
        })
        .await
        .unwrap_err();
    match err {
        IpcError::Remote { code, .. } => {
            assert_eq!(code, ErrorCode::NoInstanceAssigned)
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(harness.mock.call_count(MockOp::Start), 0);

    drop(client);
    harness.stop().await;
}

#[tokio::test]
async fn test_events_are_streamed_to_subscribers() {
    let harness = Harness::start().await;
    let mut events = harness.client().await.subscribe().await.unwrap();
    let mut client = harness.client().await;

    client
        .call(Command::RequestStart { user_id: alice() })
        .await
        .unwrap();
    client
        .call(Command::RequestStop { user_id: alice() })
        .await
        .unwrap();

    let mut edges = Vec::new();
    while edges.len() < 3 {
        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("event within timeout")
            .unwrap();
        if let EventPayload::SessionStateChanged { user_id, to, .. } = event.payload {
            assert_eq!(user_id, alice());
            edges.push(to);
        }
    }
    // Starting was cut short by the stop: Starting -> Stopping -> Inactive
    assert_eq!(
        edges,
        vec![
            SessionState::Starting,
            SessionState::Stopping,
            SessionState::Inactive
        ]
    );

    drop(client);
    harness.stop().await;
}

#[tokio::test]
async fn test_admin_assignment_and_release() {
    let harness = Harness::start().await;
    let mut client = harness.client().await;

    // Same uid as the service, so this client administers
    match client.call(Command::ListUsers).await.unwrap() {
        ResponsePayload::Users { users } => assert_eq!(users.len(), 3),
        other => panic!("unexpected payload: {:?}", other),
    }

    let bob = UserId::new("bob");
    let spare = InstanceId::new("inst-spare");
    client
        .call(Command::Assign {
            user_id: bob.clone(),
            instance: spare.clone(),
        })
        .await
        .unwrap();

    match client
        .call(Command::Lookup {
            user_id: bob.clone(),
        })
        .await
        .unwrap()
    {
        ResponsePayload::Instance {
            instance: Some(view),
        } => assert_eq!(view.uuid, spare),
        other => panic!("unexpected payload: {:?}", other),
    }

    // The spare box is still running from some earlier use
    harness.mock.set_running(&spare, true);
    match client
        .call(Command::Release {
            user_id: bob.clone(),
        })
        .await
        .unwrap()
    {
        ResponsePayload::Released { instance, stop, .. } => {
            assert_eq!(instance, spare);
            assert_eq!(stop, StopOutcome::StopSent);
        }
        other => panic!("unexpected payload: {:?}", other),
    }
    assert!(!harness.mock.is_running(&spare));

    match client.call(Command::Lookup { user_id: bob }).await.unwrap() {
        ResponsePayload::Instance { instance } => assert!(instance.is_none()),
        other => panic!("unexpected payload: {:?}", other),
    }

    drop(client);
    harness.stop().await;
}

#[tokio::test]
async fn test_schedule_and_health() {
    let harness = Harness::start().await;
    let mut client = harness.client().await;

    match client.call(Command::GetSchedule).await.unwrap() {
        ResponsePayload::Schedule(view) => {
            assert!(view.enabled);
            assert_eq!(view.at, "02:00");
            assert_eq!(view.utc_offset, "+08:00");
            assert!(view.next_fire.is_some());
            assert!(view.last_fired.is_none());
        }
        other => panic!("unexpected payload: {:?}", other),
    }

    match client.call(Command::GetHealth).await.unwrap() {
        ResponsePayload::Health(health) => {
            assert!(health.live);
            assert!(health.provider_ok);
            assert!(health.store_ok);
            assert_eq!(health.provider, "mock");
        }
        other => panic!("unexpected payload: {:?}", other),
    }

    assert!(matches!(
        client.call(Command::Ping).await.unwrap(),
        ResponsePayload::Pong
    ));

    drop(client);
    harness.stop().await;
}

#[tokio::test]
async fn test_shutdown_is_audited_and_leaves_instances_alone() {
    let harness = Harness::start().await;
    let mut client = harness.client().await;

    client
        .call(Command::RequestStart { user_id: alice() })
        .await
        .unwrap();
    client
        .call(Command::PollStatus { user_id: alice() })
        .await
        .unwrap();
    drop(client);

    let mock = harness.mock.clone();
    let (_dir, data_dir) = harness.stop().await;

    // Service shutdown is not a stop reason for assigned instances
    assert!(mock.is_running(&InstanceId::new("inst-alice")));
    assert_eq!(mock.call_count(MockOp::Stop), 0);

    let db_path = data_dir.join("portal.db");
    assert!(db_path.exists());
    let store = SqliteStore::open(db_path).unwrap();
    let audits = store.get_recent_audits(50).unwrap();
    assert!(
        audits
            .iter()
            .any(|a| matches!(a.event, AuditEventType::ServiceStopped))
    );
    assert!(audits.iter().any(|a| matches!(
        a.event,
        AuditEventType::SessionTransition {
            to: SessionState::Active,
            ..
        }
    )));

    // Session state survives a restart of the store
    let user = store.get_user(&alice()).unwrap().unwrap();
    assert_eq!(user.session.state, SessionState::Active);
    assert!(user.session.last_heartbeat.is_some());
}
