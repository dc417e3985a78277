use serde::Serialize;
use thiserror::Error;
use tracing::{Span, field, instrument};

use crate::config::RemoteConfig;
use crate::identity::DeviceIdentity;
use crate::request::{Endpoint, RequestError};
use crate::util::http::{InvalidUriError, StatusCode};
use crate::util::types::DeviceId;

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("invalid remote endpoint URI: {0}")]
    InvalidRemote(#[from] InvalidUriError),

    #[error(transparent)]
    Request(#[from] RequestError),
}

/*
    request {
        deviceId
        displayName
        location
    }
*/
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    device_id: &'a DeviceId,
    display_name: &'a str,
    location: &'a str,
}

impl<'a> From<&'a DeviceIdentity> for RegisterRequest<'a> {
    fn from(identity: &'a DeviceIdentity) -> Self {
        Self {
            device_id: &identity.device_id,
            display_name: &identity.display_name,
            location: &identity.location,
        }
    }
}

/// Register the device with the server registry
///
/// A conflict response means the device is already known to the server,
/// which is as good as a successful registration.
#[instrument(skip_all, fields(device_id = %identity.device_id, result = field::Empty), err)]
pub async fn register(
    config: &RemoteConfig,
    identity: &DeviceIdentity,
) -> Result<(), RegistrationError> {
    let endpoint = Endpoint::new(&config.api_endpoint, "/register", config.request.timeout)?;
    let request = RegisterRequest::from(identity);

    match endpoint.post(&request).await {
        Ok(()) => {
            Span::current().record("result", "registered");
            Ok(())
        }
        Err(RequestError::Rejected {
            status: StatusCode::CONFLICT,
            ..
        }) => {
            Span::current().record("result", "already registered");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RequestConfig;
    use crate::util::http::Uri;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn test_identity() -> DeviceIdentity {
        DeviceIdentity {
            device_id: "ESP32_Bridge_001".into(),
            display_name: "CS101_Classroom_Bridge".into(),
            location: "LT1".into(),
            registered: false,
        }
    }

    fn test_config(server: &Server) -> RemoteConfig {
        let api_endpoint: Uri = server.url().try_into().unwrap();
        RemoteConfig {
            api_endpoint,
            request: RequestConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_registers_the_device() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/register")
            .match_body(Matcher::Json(json!({
                "deviceId": "ESP32_Bridge_001",
                "displayName": "CS101_Classroom_Bridge",
                "location": "LT1"
            })))
            .with_status(201)
            .create_async()
            .await;

        register(&test_config(&server), &test_identity())
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_treats_a_conflict_as_registered() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/register")
            .with_status(409)
            .create_async()
            .await;

        register(&test_config(&server), &test_identity())
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fails_on_other_rejections() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/register")
            .with_status(400)
            .with_body("location unknown")
            .create_async()
            .await;

        let err = register(&test_config(&server), &test_identity())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::Request(RequestError::Rejected { .. })
        ));
    }
}
