use fleetdeck_core::{RunnerInstance, RunnerSpec, WriteCredential};
use reqwest::Method;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{ApiError, LogChunkSource, RunnerTransport, Session};

/// HTTP implementation of the fleet authority. Cheap to clone; the underlying
/// client is pooled and the session is shared.
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    session: Arc<Session>,
}

impl HttpTransport {
    pub fn new(session: Session) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            session: Arc::new(session),
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = self.session.endpoint(path);
        self.http
            .request(method, url)
            .bearer_auth(self.session.credential().expose())
            .timeout(self.session.request_timeout())
    }
}

#[derive(Serialize)]
struct CreatePayload<'a> {
    #[serde(rename = "runner_name", skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(rename = "github_url")]
    github_url: &'a str,
    token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    labels: Option<&'a str>,
}

#[derive(Serialize)]
struct UpdatePayload<'a> {
    token: &'a str,
}

#[derive(Serialize)]
struct ClonePayload<'a> {
    count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
}

impl RunnerTransport for HttpTransport {
    type LogStream = HttpLogStream;

    async fn list(&self) -> Result<Vec<RunnerInstance>, ApiError> {
        debug!(event = "api_request", method = "GET", path = "runner");
        let resp = self.request(Method::GET, "runner").send().await?;
        Ok(check(resp, "runner").await?.json().await?)
    }

    async fn create(
        &self,
        spec: &RunnerSpec,
        credential: &WriteCredential,
    ) -> Result<RunnerInstance, ApiError> {
        let payload = CreatePayload {
            name: spec.name.as_deref(),
            github_url: &spec.source_repo,
            token: credential.expose(),
            labels: spec.labels.as_deref(),
        };
        debug!(event = "api_request", method = "POST", path = "runner");
        let resp = self
            .request(Method::POST, "runner")
            .json(&payload)
            .send()
            .await?;
        Ok(check(resp, "runner").await?.json().await?)
    }

    async fn update_credential(
        &self,
        id: u64,
        credential: &WriteCredential,
    ) -> Result<RunnerInstance, ApiError> {
        let path = format!("runner/{id}");
        let payload = UpdatePayload {
            token: credential.expose(),
        };
        debug!(event = "api_request", method = "PUT", path = %path);
        let resp = self
            .request(Method::PUT, &path)
            .json(&payload)
            .send()
            .await?;
        Ok(check(resp, &path).await?.json().await?)
    }

    async fn delete(&self, id: u64) -> Result<(), ApiError> {
        let path = format!("runner/{id}");
        debug!(event = "api_request", method = "DELETE", path = %path);
        let resp = self.request(Method::DELETE, &path).send().await?;
        check(resp, &path).await?;
        Ok(())
    }

    async fn start(&self, id: u64) -> Result<RunnerInstance, ApiError> {
        self.lifecycle(id, "start").await
    }

    async fn stop(&self, id: u64) -> Result<RunnerInstance, ApiError> {
        self.lifecycle(id, "stop").await
    }

    async fn restart(&self, id: u64) -> Result<RunnerInstance, ApiError> {
        self.lifecycle(id, "restart").await
    }

    async fn clone_runners(
        &self,
        id: u64,
        count: u32,
        credential: Option<&WriteCredential>,
    ) -> Result<Vec<RunnerInstance>, ApiError> {
        let path = format!("runner/{id}/clone");
        let payload = ClonePayload {
            count,
            token: credential.map(WriteCredential::expose),
        };
        debug!(event = "api_request", method = "POST", path = %path, count = count);
        let resp = self
            .request(Method::POST, &path)
            .json(&payload)
            .send()
            .await?;
        Ok(check(resp, &path).await?.json().await?)
    }

    async fn open_log_stream(&self, id: u64) -> Result<HttpLogStream, ApiError> {
        let path = format!("runner/{id}/logs");
        debug!(event = "api_request", method = "GET", path = %path);
        // no per-request timeout: the stream stays open until closed
        let resp = self
            .http
            .get(self.session.endpoint(&path))
            .bearer_auth(self.session.credential().expose())
            .send()
            .await?;
        let resp = check(resp, &path).await?;
        Ok(HttpLogStream { response: resp })
    }

    async fn clear_logs(&self, id: u64) -> Result<(), ApiError> {
        let path = format!("runner/{id}/logs");
        debug!(event = "api_request", method = "DELETE", path = %path);
        let resp = self.request(Method::DELETE, &path).send().await?;
        check(resp, &path).await?;
        Ok(())
    }
}

impl HttpTransport {
    async fn lifecycle(&self, id: u64, action: &str) -> Result<RunnerInstance, ApiError> {
        let path = format!("runner/{id}/{action}");
        debug!(event = "api_request", method = "POST", path = %path);
        let resp = self.request(Method::POST, &path).send().await?;
        Ok(check(resp, &path).await?.json().await?)
    }
}

pub struct HttpLogStream {
    response: reqwest::Response,
}

impl LogChunkSource for HttpLogStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ApiError> {
        match self.response.chunk().await {
            Ok(Some(bytes)) => Ok(Some(bytes.to_vec())),
            Ok(None) => Ok(None),
            Err(err) => Err(ApiError::Transport(err)),
        }
    }
}

async fn check(resp: reqwest::Response, path: &str) -> Result<reqwest::Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == reqwest::StatusCode::UNAUTHORIZED {
        warn!(event = "api_unauthorized", path = %path);
        return Err(ApiError::Unauthorized);
    }
    let message = read_detail(resp).await.unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    });
    warn!(event = "api_error", path = %path, status = status.as_u16(), message = %message);
    Err(ApiError::Status {
        status: status.as_u16(),
        message,
    })
}

/// Pull the backend's `{"detail": ...}` body out of a failure response, if
/// there is one.
async fn read_detail(resp: reqwest::Response) -> Option<String> {
    let body = resp.text().await.ok()?;
    let value: serde_json::Value = serde_json::from_str(&body).ok()?;
    match value.get("detail") {
        Some(serde_json::Value::String(detail)) => Some(detail.clone()),
        Some(other) if !other.is_null() => Some(other.to_string()),
        _ => None,
    }
}
