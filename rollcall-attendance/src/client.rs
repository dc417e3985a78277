use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;

use crate::model::AttendanceEvent;
use crate::pipeline::Submitter;
use crate::remote::{DeviceIdentity, Endpoint, RemoteConfig, RequestError};
use crate::util::http::InvalidUriError;
use crate::util::types::DeviceId;

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Submission<'a> {
    device_id: &'a DeviceId,
    student_token: &'a str,
    session_id: Option<&'a str>,
    timestamp: DateTime<Utc>,
}

/// Submits attendance events to the server attendance endpoint
#[derive(Debug, Clone)]
pub struct AttendanceClient {
    device_id: DeviceId,
    endpoint: Endpoint,
}

impl AttendanceClient {
    pub fn new(config: &RemoteConfig, identity: &DeviceIdentity) -> Result<Self, InvalidUriError> {
        let endpoint = Endpoint::new(&config.api_endpoint, "/attendance", config.request.timeout)?;
        Ok(Self {
            device_id: identity.device_id.clone(),
            endpoint,
        })
    }
}

impl Submitter for AttendanceClient {
    #[instrument(skip_all, fields(event = %event.id, attempt = event.attempts + 1))]
    async fn submit(&self, event: &AttendanceEvent) -> Result<(), RequestError> {
        let submission = Submission {
            device_id: &self.device_id,
            student_token: &event.student_token,
            session_id: event.session_id.as_deref(),
            timestamp: event.timestamp,
        };
        self.endpoint.post(&submission).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RequestConfig;
    use crate::util::http::Uri;
    use mockito::{Matcher, Server};
    use serde_json::json;
    use std::time::Duration;

    fn test_client(server: &Server) -> AttendanceClient {
        let api_endpoint: Uri = server.url().try_into().unwrap();
        let config = RemoteConfig {
            api_endpoint,
            request: RequestConfig {
                timeout: Duration::from_secs(2),
                ..Default::default()
            },
        };
        let identity = DeviceIdentity {
            device_id: "ESP32_Bridge_001".into(),
            display_name: "CS101_Classroom_Bridge".into(),
            location: "LT1".into(),
            registered: true,
        };
        AttendanceClient::new(&config, &identity).unwrap()
    }

    fn test_event(session_id: Option<&str>) -> AttendanceEvent {
        let timestamp = DateTime::parse_from_rfc3339("2026-03-02T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        AttendanceEvent::new("tok-1".into(), timestamp, session_id.map(String::from))
    }

    #[tokio::test]
    async fn test_submits_the_attendance_record() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/attendance")
            .match_body(Matcher::Json(json!({
                "deviceId": "ESP32_Bridge_001",
                "studentToken": "tok-1",
                "sessionId": "42",
                "timestamp": "2026-03-02T09:00:00Z"
            })))
            .with_status(200)
            .create_async()
            .await;

        test_client(&server)
            .submit(&test_event(Some("42")))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_submits_unattributed_records_with_a_null_session() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/attendance")
            .match_body(Matcher::PartialJson(json!({"sessionId": null})))
            .with_status(201)
            .create_async()
            .await;

        test_client(&server).submit(&test_event(None)).await.unwrap();
        mock.assert_async().await;
    }
}
