//! HTTP adapter for the GPUFree instance API

use async_trait::async_trait;
use portal_provider_api::{
    InstanceRef, InstanceStatus, ProviderAction, ProviderAdapter, ProviderError, ProviderResult,
};
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::wire::{API_OK, ActionRequest, ApiEnvelope, InstancePage, RemoteInstance};

/// Public API root
pub const DEFAULT_BASE_URL: &str = "https://www.gpufree.cn/api/v1";

const LIST_PATH: &str = "jupyter/list_instance_pages";
const ACTION_PATH: &str = "inferring-api/webide/";
const ACCEPT_VALUE: &str = "application/json, text/plain, */*";

/// Upper bound on listing pages walked per lookup
const MAX_PAGES: u32 = 100;

/// Error bodies are cut to this many characters in messages
const MAX_ERROR_BODY: usize = 200;

/// Connection settings for the GPUFree API
#[derive(Debug, Clone)]
pub struct GpuFreeSettings {
    pub base_url: String,
    /// Bearer token; `None` makes every call fail with a missing credential
    pub token: Option<String>,
    /// Environment variable the token was read from, for error messages
    pub token_env: String,
    pub start_mode: String,
    pub page_size: u32,
    pub request_timeout: Duration,
}

impl Default for GpuFreeSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: None,
            token_env: "GPUFREE_BEARER_TOKEN".to_string(),
            start_mode: "gpu".to_string(),
            page_size: 50,
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Provider adapter backed by the GPUFree REST API
pub struct GpuFreeProvider {
    client: Client,
    settings: GpuFreeSettings,
}

impl GpuFreeProvider {
    pub fn new(mut settings: GpuFreeSettings) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .connect_timeout(settings.request_timeout)
            .build()
            .map_err(|e| ProviderError::Internal(format!("failed to build HTTP client: {e}")))?;

        settings.base_url = settings.base_url.trim_end_matches('/').to_string();
        if settings.token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            settings.token = None;
        }
        if settings.token.is_none() {
            warn!(env = %settings.token_env, "GPUFree token not set, provider calls will fail");
        }

        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &GpuFreeSettings {
        &self.settings
    }

    fn token(&self) -> ProviderResult<&str> {
        self.settings
            .token
            .as_deref()
            .ok_or_else(|| ProviderError::MissingCredential(self.settings.token_env.clone()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url, path)
    }

    fn map_send_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout(self.settings.request_timeout)
        } else if e.is_connect() {
            ProviderError::Connect(e.to_string())
        } else if e.is_decode() {
            ProviderError::InvalidResponse(e.to_string())
        } else {
            ProviderError::Connect(e.to_string())
        }
    }

    /// Send a request and unwrap the API envelope
    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> ProviderResult<Option<T>> {
        let response = request.send().await.map_err(|e| self.map_send_error(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.map_send_error(e))?;

        if !status.is_success() {
            return Err(http_error(status, &body));
        }

        let envelope: ApiEnvelope<T> = serde_json::from_str(&body)
            .map_err(|e| ProviderError::InvalidResponse(format!("{e}: {}", truncate(&body))))?;

        if envelope.code != API_OK {
            return Err(ProviderError::Rejected(format!(
                "code {}: {}",
                envelope.code,
                envelope.msg.unwrap_or_default()
            )));
        }

        Ok(envelope.data)
    }

    async fn list_page(&self, token: &str, page_no: u32) -> ProviderResult<InstancePage> {
        let page_no = page_no.to_string();
        let page_size = self.settings.page_size.to_string();
        let request = self
            .client
            .get(self.url(LIST_PATH))
            .header(ACCEPT, ACCEPT_VALUE)
            .bearer_auth(token)
            .query(&[
                ("page_no", page_no.as_str()),
                ("page_size", page_size.as_str()),
                ("status", ""),
                ("nick_name", ""),
            ]);

        Ok(self.execute::<InstancePage>(request).await?.unwrap_or_default())
    }

    /// Locate an instance in the paged listing, by uuid first and
    /// provider id second
    async fn find(&self, instance: &InstanceRef) -> ProviderResult<RemoteInstance> {
        let token = self.token()?;
        let page_size = self.settings.page_size.max(1);
        let mut by_id = None;

        for page_no in 1..=MAX_PAGES {
            let page = self.list_page(token, page_no).await?;
            let count = page.data_list.len();

            for remote in page.data_list {
                if remote.webide_instance_uuid == instance.uuid.as_str() {
                    return Ok(remote);
                }
                if by_id.is_none() && remote.webide_instance_id == instance.provider_id {
                    by_id = Some(remote);
                }
            }

            let seen = u64::from(page_no) * u64::from(page_size);
            if count < page_size as usize || page.total_record.is_some_and(|total| seen >= total) {
                break;
            }
        }

        by_id.ok_or_else(|| ProviderError::UnknownInstance(instance.uuid.clone()))
    }

    async fn act(&self, remote: &RemoteInstance, action: &str) -> ProviderResult<()> {
        let token = self.token()?;
        let body = ActionRequest {
            instance_id: remote.webide_instance_id,
            instance_uuid: &remote.webide_instance_uuid,
            start_mode: &self.settings.start_mode,
            action,
        };
        let request = self
            .client
            .put(self.url(ACTION_PATH))
            .header(ACCEPT, ACCEPT_VALUE)
            .bearer_auth(token)
            .json(&body);

        self.execute::<serde_json::Value>(request).await?;
        Ok(())
    }
}

#[async_trait]
impl ProviderAdapter for GpuFreeProvider {
    fn name(&self) -> &str {
        "gpufree"
    }

    async fn start(&self, instance: &InstanceRef) -> ProviderResult<ProviderAction> {
        let remote = self.find(instance).await?;
        if remote.is_running() {
            debug!(instance = %instance, "Instance already running, start skipped");
            return Ok(ProviderAction::Skipped);
        }

        self.act(&remote, "start").await?;
        info!(instance = %instance, "Start sent to GPUFree");
        Ok(ProviderAction::Issued)
    }

    async fn stop(&self, instance: &InstanceRef) -> ProviderResult<ProviderAction> {
        let remote = self.find(instance).await?;
        if remote.is_stopped() {
            debug!(instance = %instance, "Instance already stopped, stop skipped");
            return Ok(ProviderAction::Skipped);
        }

        self.act(&remote, "stop").await?;
        info!(instance = %instance, "Stop sent to GPUFree");
        Ok(ProviderAction::Issued)
    }

    async fn query(&self, instance: &InstanceRef) -> ProviderResult<InstanceStatus> {
        let remote = self.find(instance).await?;
        Ok(InstanceStatus {
            running: remote.is_running(),
            status_code: remote.status,
            url: remote.jupyter_url,
        })
    }

    fn is_healthy(&self) -> bool {
        self.settings.token.is_some()
    }
}

fn http_error(status: StatusCode, body: &str) -> ProviderError {
    ProviderError::Http {
        status: status.as_u16(),
        message: truncate(body),
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(MAX_ERROR_BODY).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[derive(Debug, Clone)]
    struct Captured {
        request_line: String,
        headers: String,
        body: String,
    }

    type Log = Arc<Mutex<Vec<Captured>>>;

    async fn read_request(stream: &mut TcpStream) -> Captured {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let header_end = loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed before sending headers");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default().to_string();
        let headers = lines.collect::<Vec<_>>().join("\n").to_lowercase();
        let content_length = headers
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .map(|v| v.trim().parse::<usize>().unwrap())
            .unwrap_or(0);

        while buf.len() < header_end + content_length {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed mid-body");
            buf.extend_from_slice(&chunk[..n]);
        }

        Captured {
            request_line,
            headers,
            body: String::from_utf8_lossy(&buf[header_end..header_end + content_length]).to_string(),
        }
    }

    /// Answer one connection per scripted response, in order
    async fn serve(responses: Vec<(u16, String)>) -> (SocketAddr, Log) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let server_log = log.clone();

        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                let captured = read_request(&mut stream).await;
                server_log.lock().unwrap().push(captured);

                let response = format!(
                    "HTTP/1.1 {status} Status\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.ok();
            }
        });

        (addr, log)
    }

    fn provider(addr: SocketAddr) -> GpuFreeProvider {
        GpuFreeProvider::new(GpuFreeSettings {
            base_url: format!("http://{addr}/api/v1/"),
            token: Some("secret-token".into()),
            request_timeout: Duration::from_secs(5),
            ..GpuFreeSettings::default()
        })
        .unwrap()
    }

    fn instance() -> InstanceRef {
        InstanceRef::new("gghcmwa6-emgm7485", 7764)
    }

    fn listing(status: u8) -> String {
        format!(
            r#"{{"code":200,"msg":"success","data":{{"totalRecord":2,"dataList":[
                {{"webide_instance_id":1,"webide_instance_uuid":"other","status":5}},
                {{"webide_instance_id":7764,"webide_instance_uuid":"gghcmwa6-emgm7485","status":{status},"jupyter_url":"https://lab.example.com/7764"}}
            ]}}}}"#
        )
    }

    fn ok_action() -> String {
        r#"{"code":200,"msg":"success","data":null}"#.to_string()
    }

    #[tokio::test]
    async fn query_reports_running_instance() {
        let (addr, log) = serve(vec![(200, listing(3))]).await;
        let status = provider(addr).query(&instance()).await.unwrap();

        assert!(status.running);
        assert_eq!(status.status_code, Some(3));
        assert_eq!(status.url.as_deref(), Some("https://lab.example.com/7764"));

        let log = log.lock().unwrap();
        assert!(
            log[0]
                .request_line
                .starts_with("GET /api/v1/jupyter/list_instance_pages?page_no=1&page_size=50"),
            "{}",
            log[0].request_line
        );
        assert!(log[0].headers.contains("authorization: bearer secret-token"));
    }

    #[tokio::test]
    async fn start_is_skipped_when_running() {
        let (addr, log) = serve(vec![(200, listing(3))]).await;
        let action = provider(addr).start(&instance()).await.unwrap();

        assert_eq!(action, ProviderAction::Skipped);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn start_sends_action() {
        let (addr, log) = serve(vec![(200, listing(5)), (200, ok_action())]).await;
        let action = provider(addr).start(&instance()).await.unwrap();
        assert_eq!(action, ProviderAction::Issued);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[1].request_line.starts_with("PUT /api/v1/inferring-api/webide/ "));
        assert!(log[1].headers.contains("authorization: bearer secret-token"));
        assert!(log[1].headers.contains("content-type: application/json"));

        let body: serde_json::Value = serde_json::from_str(&log[1].body).unwrap();
        assert_eq!(body["instance_id"], 7764);
        assert_eq!(body["instance_uuid"], "gghcmwa6-emgm7485");
        assert_eq!(body["start_mode"], "gpu");
        assert_eq!(body["action"], "start");
    }

    #[tokio::test]
    async fn stop_is_skipped_when_stopped() {
        let (addr, _log) = serve(vec![(200, listing(5))]).await;
        let action = provider(addr).stop(&instance()).await.unwrap();
        assert_eq!(action, ProviderAction::Skipped);
    }

    #[tokio::test]
    async fn stop_sends_action() {
        let (addr, log) = serve(vec![(200, listing(3)), (200, ok_action())]).await;
        let action = provider(addr).stop(&instance()).await.unwrap();
        assert_eq!(action, ProviderAction::Issued);

        let body: serde_json::Value = serde_json::from_str(&log.lock().unwrap()[1].body).unwrap();
        assert_eq!(body["action"], "stop");
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let (addr, _log) = serve(vec![(503, "unavailable".into())]).await;
        let err = provider(addr).query(&instance()).await.unwrap_err();

        assert!(matches!(err, ProviderError::Http { status: 503, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn api_rejection_is_permanent() {
        let (addr, _log) = serve(vec![(200, r#"{"code":401,"msg":"token expired"}"#.into())]).await;
        let err = provider(addr).query(&instance()).await.unwrap_err();

        match &err {
            ProviderError::Rejected(msg) => assert!(msg.contains("token expired")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_response() {
        let (addr, _log) = serve(vec![(200, "<html>".into())]).await;
        let err = provider(addr).query(&instance()).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn unlisted_instance_is_unknown() {
        let (addr, _log) = serve(vec![(200, listing(3))]).await;
        let missing = InstanceRef::new("nope", 99);
        let err = provider(addr).stop(&missing).await.unwrap_err();
        assert!(matches!(err, ProviderError::UnknownInstance(_)));
    }

    #[tokio::test]
    async fn provider_id_is_a_fallback_match() {
        let (addr, _log) = serve(vec![(200, listing(3))]).await;
        let renamed = InstanceRef::new("renamed-uuid", 7764);
        let status = provider(addr).query(&renamed).await.unwrap();
        assert!(status.running);
    }

    #[tokio::test]
    async fn listing_walks_full_pages() {
        let first = r#"{"code":200,"data":{"totalRecord":2,"dataList":[{"webide_instance_id":1,"webide_instance_uuid":"other","status":5}]}}"#.to_string();
        let second = r#"{"code":200,"data":{"totalRecord":2,"dataList":[{"webide_instance_id":7764,"webide_instance_uuid":"gghcmwa6-emgm7485","status":3}]}}"#.to_string();
        let (addr, log) = serve(vec![(200, first), (200, second)]).await;

        let provider = GpuFreeProvider::new(GpuFreeSettings {
            base_url: format!("http://{addr}/api/v1"),
            token: Some("secret-token".into()),
            page_size: 1,
            ..GpuFreeSettings::default()
        })
        .unwrap();

        assert!(provider.query(&instance()).await.unwrap().running);
        let log = log.lock().unwrap();
        assert!(log[1].request_line.contains("page_no=2"));
    }

    #[tokio::test]
    async fn missing_token_sends_nothing() {
        let (addr, log) = serve(vec![(200, listing(3))]).await;
        let provider = GpuFreeProvider::new(GpuFreeSettings {
            base_url: format!("http://{addr}/api/v1"),
            token: Some("  ".into()),
            ..GpuFreeSettings::default()
        })
        .unwrap();

        assert!(!provider.is_healthy());
        let err = provider.start(&instance()).await.unwrap_err();
        match err {
            ProviderError::MissingCredential(env) => assert_eq!(env, "GPUFREE_BEARER_TOKEN"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = provider(addr).query(&instance()).await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let provider = GpuFreeProvider::new(GpuFreeSettings {
            base_url: format!("http://{addr}/api/v1"),
            token: Some("secret-token".into()),
            request_timeout: Duration::from_millis(200),
            ..GpuFreeSettings::default()
        })
        .unwrap();

        let err = provider.query(&instance()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)), "{err:?}");
        assert!(err.is_transient());
    }
}
