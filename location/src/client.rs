//! The two network calls the resolver makes against a server.

use crate::types::{ConnectScope, ConnectionData, ServiceDefinition};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("request timed out")]
    Timeout,
    #[error("server responded with {0}")]
    Status(StatusCode),
    #[error("request failed: {0}")]
    Reqwest(reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Reqwest(e)
        }
    }
}

#[async_trait]
pub trait LocationClient: Send + Sync {
    /// The connect handshake. `last_change_id` lets the server answer with a
    /// delta, or tell the client its cache is still fresh.
    async fn connection_data(
        &self,
        scope: ConnectScope,
        last_change_id: i32,
    ) -> Result<ConnectionData, ClientError>;

    /// Fetches one definition. `Ok(None)` when the server does not have it.
    async fn service_definition(
        &self,
        service_type: &str,
        identifier: Uuid,
    ) -> Result<Option<ServiceDefinition>, ClientError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientSettings {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettings {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

pub struct HttpLocationClient {
    client: reqwest::Client,
    apis_url: Url,
}

impl HttpLocationClient {
    pub fn new(base_url: &Url, settings: &ClientSettings) -> Result<Self, ClientError> {
        let apis_url = Url::parse(&format!("{}/_apis/", base_url.as_str().trim_end_matches('/')))
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .connect_timeout(settings.connect_timeout)
            .build()?;

        Ok(HttpLocationClient { client, apis_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.apis_url
            .join(path)
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))
    }
}

#[async_trait]
impl LocationClient for HttpLocationClient {
    async fn connection_data(
        &self,
        scope: ConnectScope,
        last_change_id: i32,
    ) -> Result<ConnectionData, ClientError> {
        let mut url = self.endpoint("connectionData")?;
        url.query_pairs_mut()
            .append_pair("connectOptions", scope.as_str())
            .append_pair("lastChangeId", &last_change_id.to_string());

        tracing::debug!(%url, "Requesting connection data");
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ClientError::Status(response.status()));
        }

        Ok(response.json::<ConnectionData>().await?)
    }

    async fn service_definition(
        &self,
        service_type: &str,
        identifier: Uuid,
    ) -> Result<Option<ServiceDefinition>, ClientError> {
        let mut url = self.endpoint("ServiceDefinitions")?;
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.apis_url.to_string()))?
            .push(service_type)
            .push(&identifier.to_string());

        let response = self.client.get(url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json::<ServiceDefinition>().await?)),
            status => Err(ClientError::Status(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LOCATION_SERVICE, RelativeTo, ROOT_IDENTIFIER};
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, settings: ClientSettings) -> HttpLocationClient {
        let base = Url::parse(&format!("{}/org/", server.uri())).unwrap();
        HttpLocationClient::new(&base, &settings).unwrap()
    }

    #[tokio::test]
    async fn test_connection_data() {
        let server = MockServer::start().await;
        let instance_id = Uuid::new_v4();

        Mock::given(method("GET"))
            .and(path("/org/_apis/connectionData"))
            .and(query_param("connectOptions", "IncludeServices"))
            .and(query_param("lastChangeId", "-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "instanceId": instance_id,
                "authenticatedUser": { "id": Uuid::nil(), "descriptor": "alice" },
                "locationServiceData": {
                    "serviceOwner": ROOT_IDENTIFIER,
                    "defaultAccessMappingMoniker": "PublicAccessMapping",
                    "lastChangeId": 12,
                    "clientCacheFresh": false,
                    "clientCacheTimeToLive": 600,
                    "accessMappings": [
                        { "moniker": "PublicAccessMapping", "accessPoint": "https://dev.example/", "virtualDirectory": "" }
                    ],
                    "serviceDefinitions": [{
                        "serviceType": LOCATION_SERVICE,
                        "identifier": ROOT_IDENTIFIER,
                        "displayName": "Root",
                        "relativeToSetting": "fullyQualified",
                        "locationMappings": [
                            { "accessMappingMoniker": "PublicAccessMapping", "location": "https://root.example/" }
                        ]
                    }]
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let data = client(&server, ClientSettings::default())
            .connection_data(ConnectScope::IncludeServices, -1)
            .await
            .unwrap();

        assert_eq!(data.instance_id, instance_id);
        assert_eq!(data.authenticated_user.unwrap().descriptor, "alice");
        let snapshot = data.location_service_data.unwrap();
        assert_eq!(snapshot.last_change_id, 12);
        assert_eq!(snapshot.client_cache_time_to_live, 600);
        let definitions = snapshot.service_definitions.unwrap();
        assert_eq!(definitions[0].relative_to, RelativeTo::FullyQualified);
        assert_eq!(definitions[0].location_mappings[0].location, "https://root.example/");
    }

    #[tokio::test]
    async fn test_connection_data_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/org/_apis/connectionData"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server, ClientSettings::default())
            .connection_data(ConnectScope::None, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Status(StatusCode::SERVICE_UNAVAILABLE)));
    }

    #[tokio::test]
    async fn test_connection_data_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/org/_apis/connectionData"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let settings = ClientSettings {
            request_timeout: Duration::from_millis(50),
            ..ClientSettings::default()
        };
        let err = client(&server, settings)
            .connection_data(ConnectScope::None, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
    }

    #[tokio::test]
    async fn test_service_definition() {
        let server = MockServer::start().await;
        let identifier = Uuid::new_v4();

        Mock::given(method("GET"))
            .and(path(format!("/org/_apis/ServiceDefinitions/LocationService2/{identifier}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "serviceType": "LocationService2",
                "identifier": identifier,
                "relativeToSetting": "FullyQualified",
                "locationMappings": [
                    { "accessMappingMoniker": "PublicAccessMapping", "location": "https://svc.example/" }
                ]
            })))
            .mount(&server)
            .await;

        let client = client(&server, ClientSettings::default());
        let definition = client
            .service_definition(LOCATION_SERVICE, identifier)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(definition.identifier, identifier);

        // Unmatched requests get a 404 from the mock server.
        assert!(
            client
                .service_definition(LOCATION_SERVICE, Uuid::new_v4())
                .await
                .unwrap()
                .is_none()
        );
    }
}
