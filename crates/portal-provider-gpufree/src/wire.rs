//! GPUFree request and response bodies

use serde::{Deserialize, Serialize};

/// Instance status code: running
pub const STATUS_RUNNING: u8 = 3;

/// Instance status code: stopped
pub const STATUS_STOPPED: u8 = 5;

/// API-level success code inside the response envelope
pub const API_OK: i64 = 200;

/// Response envelope shared by every endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    pub code: i64,
    #[serde(default)]
    pub msg: Option<String>,
    pub data: Option<T>,
}

/// One page of `jupyter/list_instance_pages`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstancePage {
    #[serde(rename = "dataList", default)]
    pub data_list: Vec<RemoteInstance>,
    #[serde(rename = "totalRecord", default)]
    pub total_record: Option<u64>,
}

/// Instance as listed by the provider (only the fields we use)
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteInstance {
    pub webide_instance_id: u64,
    pub webide_instance_uuid: String,
    #[serde(default)]
    pub status: Option<u8>,
    #[serde(default)]
    pub nick_name: Option<String>,
    #[serde(default)]
    pub jupyter_url: Option<String>,
}

impl RemoteInstance {
    pub fn is_running(&self) -> bool {
        self.status == Some(STATUS_RUNNING)
    }

    pub fn is_stopped(&self) -> bool {
        self.status == Some(STATUS_STOPPED)
    }
}

/// Body of the `inferring-api/webide/` PUT
#[derive(Debug, Clone, Serialize)]
pub struct ActionRequest<'a> {
    pub instance_id: u64,
    pub instance_uuid: &'a str,
    pub start_mode: &'a str,
    pub action: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_listing() {
        let body = r#"{
            "code": 200,
            "msg": "success",
            "data": {
                "totalRecord": 1,
                "dataList": [{
                    "webide_instance_id": 7764,
                    "webide_instance_uuid": "gghcmwa6-emgm7485",
                    "webide_instance_name": "ignored",
                    "status": 3,
                    "jupyter_url": "https://lab.gpufree.cn/7764"
                }]
            }
        }"#;

        let envelope: ApiEnvelope<InstancePage> = serde_json::from_str(body).unwrap();
        assert_eq!(envelope.code, API_OK);
        let page = envelope.data.unwrap();
        assert_eq!(page.total_record, Some(1));
        assert!(page.data_list[0].is_running());
        assert!(!page.data_list[0].is_stopped());
    }

    #[test]
    fn envelope_without_data() {
        let envelope: ApiEnvelope<InstancePage> =
            serde_json::from_str(r#"{"code": 401, "msg": "token expired"}"#).unwrap();
        assert_eq!(envelope.code, 401);
        assert!(envelope.data.is_none());
    }

    #[test]
    fn action_body_shape() {
        let body = ActionRequest {
            instance_id: 7764,
            instance_uuid: "gghcmwa6-emgm7485",
            start_mode: "gpu",
            action: "start",
        };
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(
            json,
            r#"{"instance_id":7764,"instance_uuid":"gghcmwa6-emgm7485","start_mode":"gpu","action":"start"}"#
        );
    }
}
