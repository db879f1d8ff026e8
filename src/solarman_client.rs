use crate::config::Credentials;
use crate::error::FetchError;
use crate::value_mapper::ReadingSnapshot;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_derive::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Source of reading snapshots for one device
#[async_trait]
pub trait TelemetryClient: Send {
    async fn current_data(&mut self, device_sn: &str) -> Result<ReadingSnapshot, FetchError>;
}

#[derive(Debug, Error)]
pub enum ClientConstructionError {
    #[error("credential {0} is empty")]
    EmptyCredential(&'static str),

    #[error("invalid API base URL {0:?}")]
    InvalidBaseUrl(String),

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Client for the Solarman OpenAPI.
/// The access token is requested on first use and cached until the API rejects it.
pub struct SolarmanClient {
    endpoint_url: String,
    app_id: String,
    token_request: TokenRequest,
    access_token: Option<String>,
    client: reqwest::Client,
}

impl SolarmanClient {
    pub fn new(
        endpoint_url: &str,
        credentials: &Credentials,
    ) -> Result<Self, ClientConstructionError> {
        for (name, value) in [
            ("APP_ID", &credentials.app_id),
            ("APP_SECRET", &credentials.app_secret),
            ("EMAIL", &credentials.email),
            ("PASSWORD", &credentials.password),
        ] {
            if value.is_empty() {
                return Err(ClientConstructionError::EmptyCredential(name));
            }
        }
        let endpoint_url = endpoint_url.trim_end_matches('/').to_string();
        if !(endpoint_url.starts_with("http://") || endpoint_url.starts_with("https://")) {
            return Err(ClientConstructionError::InvalidBaseUrl(endpoint_url));
        }

        let client = reqwest::Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            endpoint_url,
            app_id: credentials.app_id.clone(),
            token_request: TokenRequest {
                app_secret: credentials.app_secret.clone(),
                email: credentials.email.clone(),
                password: hash_password(&credentials.password),
            },
            access_token: None,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}{}?appId={}&language=en",
            self.endpoint_url, path, self.app_id
        )
    }

    async fn access_token(&mut self) -> Result<String, FetchError> {
        if let Some(token) = &self.access_token {
            return Ok(token.clone());
        }

        debug!("requesting Solarman access token");
        let response = self
            .client
            .post(self.url("/account/v1.0/token"))
            .json(&self.token_request)
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FetchError::Auth {
                message: format!("token request returned HTTP {}", status.as_u16()),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        let token: TokenResponse = decode(response).await?;
        match token.access_token {
            Some(access_token) if token.success => {
                info!("authenticated with Solarman");
                self.access_token = Some(access_token.clone());
                Ok(access_token)
            }
            _ => Err(FetchError::Auth {
                message: token.msg.unwrap_or_else(|| "no access token".into()),
            }),
        }
    }
}

#[async_trait]
impl TelemetryClient for SolarmanClient {
    async fn current_data(&mut self, device_sn: &str) -> Result<ReadingSnapshot, FetchError> {
        let token = self.access_token().await?;

        let response = self
            .client
            .post(self.url("/device/v1.0/currentData"))
            .header(reqwest::header::AUTHORIZATION, format!("bearer {token}"))
            .json(&CurrentDataRequest { device_sn })
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            // Token expired or revoked, fetch a new one on the next attempt
            self.access_token = None;
            return Err(FetchError::Auth {
                message: "access token rejected".to_string(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        let data: CurrentData = decode(response).await?;
        if !data.success {
            return Err(FetchError::Api {
                message: data.msg.unwrap_or_else(|| "request unsuccessful".into()),
            });
        }
        debug!(
            device_sn,
            readings = data.data_list.len(),
            "received current data"
        );

        Ok(data
            .data_list
            .into_iter()
            .map(|reading| (reading.key, reading.value.unwrap_or_default()))
            .collect())
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, FetchError> {
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| FetchError::Decode(e.to_string()))
}

/// The OpenAPI expects the account password as a lowercase SHA-256 hex digest
fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest {
    app_secret: String,
    email: String,
    password: String,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    #[serde(default)]
    success: bool,
    msg: Option<String>,
    #[serde(rename = "access_token")]
    access_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CurrentDataRequest<'a> {
    device_sn: &'a str,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurrentData {
    #[serde(default)]
    success: bool,
    msg: Option<String>,
    #[serde(default)]
    data_list: Vec<DataItem>,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
struct DataItem {
    key: String,
    #[serde(default)]
    value: Option<String>,
}

#[cfg(test)]
mod test_solarman_client {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn credentials() -> Credentials {
        Credentials {
            app_id: "test_app".to_string(),
            app_secret: "test_secret".to_string(),
            email: "owner@example.com".to_string(),
            password: "hunter2".to_string(),
        }
    }

    fn token_query() -> Matcher {
        Matcher::AllOf(vec![
            Matcher::UrlEncoded("appId".into(), "test_app".into()),
            Matcher::UrlEncoded("language".into(), "en".into()),
        ])
    }

    async fn mock_token(server: &mut mockito::ServerGuard, hits: usize) -> mockito::Mock {
        server
            .mock("POST", "/account/v1.0/token")
            .match_query(token_query())
            .match_body(Matcher::Json(json!({
                "appSecret": "test_secret",
                "email": "owner@example.com",
                "password": hash_password("hunter2"),
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"code":null,"msg":null,"success":true,"requestId":"a1",
                    "access_token":"test_token","token_type":"bearer",
                    "expires_in":"5183999","scope":"all","uid":7}"#,
            )
            .expect(hits)
            .create_async()
            .await
    }

    #[test]
    fn test_hash_password() {
        assert_eq!(
            hash_password("hunter2"),
            "f52fbd32b2b3b86ff88ef6c490628285f482af15ddcb29541f94bcf526a3f6c7"
        );
    }

    #[test]
    fn test_construction_rejects_bad_input() {
        let mut creds = credentials();
        creds.password.clear();
        assert!(matches!(
            SolarmanClient::new("https://globalapi.solarmanpv.com", &creds),
            Err(ClientConstructionError::EmptyCredential("PASSWORD"))
        ));

        assert!(matches!(
            SolarmanClient::new("globalapi.solarmanpv.com", &credentials()),
            Err(ClientConstructionError::InvalidBaseUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_current_data() {
        let mut server = mockito::Server::new_async().await;
        let token = mock_token(&mut server, 1).await;
        let data = server
            .mock("POST", "/device/v1.0/currentData")
            .match_query(token_query())
            .match_header("authorization", "bearer test_token")
            .match_body(Matcher::Json(json!({ "deviceSn": "2109876543" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"code":null,"msg":null,"success":true,"requestId":"b2",
                    "deviceSn":"2109876543","deviceId":42,"deviceType":"INVERTER",
                    "deviceState":1,"collectionTime":1700000000,
                    "dataList":[
                        {"key":"T_AC_RDT1","value":"21.5","unit":"℃","name":"AC Radiator Temp"},
                        {"key":"APo_t1","value":"500","unit":"W","name":"Total AC Output Power"},
                        {"key":"Pr1","value":"1000","unit":"W","name":"Rated Power"}
                    ]}"#,
            )
            .expect(2)
            .create_async()
            .await;

        let mut client = SolarmanClient::new(&server.url(), &credentials()).unwrap();
        let snapshot = client.current_data("2109876543").await.unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.reading("T_AC_RDT1"), Some(21.5));
        assert_eq!(snapshot.reading("APo_t1"), Some(500.0));
        assert_eq!(snapshot.reading("Pr1"), Some(1000.0));

        // Second fetch reuses the cached token
        tokio_test::assert_ok!(client.current_data("2109876543").await);

        token.assert_async().await;
        data.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("POST", "/account/v1.0/token")
            .match_query(token_query())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"code":"2101017","msg":"incorrect password","success":false}"#)
            .create_async()
            .await;

        let mut client = SolarmanClient::new(&server.url(), &credentials()).unwrap();
        let err = client.current_data("2109876543").await.unwrap_err();

        assert!(!err.is_transient());
        assert_eq!(
            err.to_string(),
            "authentication rejected: incorrect password"
        );
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let _token = mock_token(&mut server, 1).await;
        let _data = server
            .mock("POST", "/device/v1.0/currentData")
            .match_query(token_query())
            .with_status(503)
            .create_async()
            .await;

        let mut client = SolarmanClient::new(&server.url(), &credentials()).unwrap();
        let err = client.current_data("2109876543").await.unwrap_err();

        assert!(matches!(err, FetchError::Status { status: 503 }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unsuccessful_response() {
        let mut server = mockito::Server::new_async().await;
        let _token = mock_token(&mut server, 1).await;
        let _data = server
            .mock("POST", "/device/v1.0/currentData")
            .match_query(token_query())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"code":"2101019","msg":"device not found","success":false}"#)
            .create_async()
            .await;

        let mut client = SolarmanClient::new(&server.url(), &credentials()).unwrap();
        let err = client.current_data("0000000000").await.unwrap_err();

        assert!(matches!(err, FetchError::Api { ref message } if message == "device not found"));
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed() {
        let mut server = mockito::Server::new_async().await;
        let token = mock_token(&mut server, 2).await;
        let _data = server
            .mock("POST", "/device/v1.0/currentData")
            .match_query(token_query())
            .with_status(401)
            .create_async()
            .await;

        let mut client = SolarmanClient::new(&server.url(), &credentials()).unwrap();
        tokio_test::assert_err!(client.current_data("2109876543").await);
        tokio_test::assert_err!(client.current_data("2109876543").await);

        // Both attempts had to authenticate because the first token was dropped
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let mut server = mockito::Server::new_async().await;
        let _token = mock_token(&mut server, 1).await;
        let _data = server
            .mock("POST", "/device/v1.0/currentData")
            .match_query(token_query())
            .with_status(200)
            .with_body("<html>maintenance</html>")
            .create_async()
            .await;

        let mut client = SolarmanClient::new(&server.url(), &credentials()).unwrap();
        let err = client.current_data("2109876543").await.unwrap_err();

        assert!(matches!(err, FetchError::Decode(_)));
    }
}
