//! Console REST client.
//!
//! Every call attaches the current bearer token, unwraps the `ApiResponse`
//! envelope and translates failures into [`ClientError`] in one place.

use std::sync::Arc;

use opman_common::{
    authorization_header, ApiConfig, ApiResponse, AuthResponse, CredentialProvider, LoginRequest,
    PageResponse, RefreshTokenRequest, Task, TaskId, TaskLog, TaskRequest, TaskStatistics,
    TaskStatus, User,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ClientError;

pub const DEFAULT_PAGE_SIZE: u32 = 20;

pub struct ApiClient {
    http: Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl ApiClient {
    pub fn new(
        config: &ApiConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let http = Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()
            .map_err(|err| ClientError::Network(err.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        match authorization_header(self.credentials.as_ref()) {
            Some(header) => builder.header(AUTHORIZATION, header),
            None => builder,
        }
    }

    /// Send and unwrap the envelope; `data` may legitimately be absent.
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Option<T>, ClientError> {
        let response = request.send().await?;
        let status = response.status();
        let url = response.url().path().to_string();
        let body = response.bytes().await?;
        debug!(%status, url = %url, bytes = body.len(), "api response");

        if !status.is_success() {
            let reason = serde_json::from_slice::<ApiResponse<Value>>(&body)
                .ok()
                .and_then(|envelope| envelope.failure_reason().map(str::to_owned));
            if status == StatusCode::UNAUTHORIZED {
                warn!("session rejected by server, clearing credentials");
                self.credentials.clear();
            }
            return Err(ClientError::from_status(status, reason));
        }

        let envelope: ApiResponse<T> = serde_json::from_slice(&body)
            .map_err(|err| ClientError::InvalidResponse(err.to_string()))?;
        if !envelope.success {
            return Err(ClientError::Api {
                status: status.as_u16(),
                message: envelope
                    .failure_reason()
                    .unwrap_or("request failed")
                    .to_string(),
            });
        }
        Ok(envelope.data)
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        self.send(request)
            .await?
            .ok_or_else(|| ClientError::InvalidResponse("response carries no data".to_string()))
    }

    async fn execute(&self, request: RequestBuilder) -> Result<(), ClientError> {
        self.send::<Value>(request).await.map(|_| ())
    }

    fn page_query(status: Option<TaskStatus>, page: u32, size: u32) -> Vec<(&'static str, String)> {
        let mut query = vec![("page", page.to_string()), ("size", size.to_string())];
        if let Some(status) = status {
            query.push(("status", status.as_str().to_string()));
        }
        query
    }

    // Execution

    pub async fn create_task(&self, task: &TaskRequest) -> Result<Task, ClientError> {
        self.fetch(self.request(Method::POST, "/v1/execution/tasks").json(task))
            .await
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task, ClientError> {
        self.fetch(self.request(Method::GET, &format!("/v1/execution/tasks/{}", id)))
            .await
    }

    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        page: u32,
        size: u32,
    ) -> Result<PageResponse<Task>, ClientError> {
        let query = Self::page_query(status, page, size);
        self.fetch(self.request(Method::GET, "/v1/execution/tasks").query(&query))
            .await
    }

    pub async fn my_tasks(
        &self,
        status: Option<TaskStatus>,
        page: u32,
        size: u32,
    ) -> Result<PageResponse<Task>, ClientError> {
        let query = Self::page_query(status, page, size);
        self.fetch(self.request(Method::GET, "/v1/execution/my-tasks").query(&query))
            .await
    }

    /// Persisted log rows; complements the live stream for history.
    pub async fn task_logs(&self, id: TaskId) -> Result<Vec<TaskLog>, ClientError> {
        let logs: Option<Vec<TaskLog>> = self
            .send(self.request(Method::GET, &format!("/v1/execution/tasks/{}/logs", id)))
            .await?;
        Ok(logs.unwrap_or_default())
    }

    pub async fn cancel_task(&self, id: TaskId) -> Result<(), ClientError> {
        self.execute(self.request(Method::POST, &format!("/v1/execution/tasks/{}/cancel", id)))
            .await
    }

    pub async fn retry_task(&self, id: TaskId) -> Result<Task, ClientError> {
        self.fetch(self.request(Method::POST, &format!("/v1/execution/tasks/{}/retry", id)))
            .await
    }

    pub async fn delete_task(&self, id: TaskId) -> Result<(), ClientError> {
        self.execute(self.request(Method::DELETE, &format!("/v1/execution/tasks/{}", id)))
            .await
    }

    pub async fn statistics(&self) -> Result<TaskStatistics, ClientError> {
        self.fetch(self.request(Method::GET, "/v1/execution/statistics"))
            .await
    }

    // Auth

    pub async fn login(&self, username: &str, password: &str) -> Result<AuthResponse, ClientError> {
        let body = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        self.fetch(self.request(Method::POST, "/v1/auth/login").json(&body))
            .await
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> Result<AuthResponse, ClientError> {
        let body = RefreshTokenRequest {
            refresh_token: refresh_token.to_string(),
        };
        self.fetch(self.request(Method::POST, "/v1/auth/refresh").json(&body))
            .await
    }

    pub async fn current_user(&self) -> Result<User, ClientError> {
        self.fetch(self.request(Method::GET, "/v1/auth/me")).await
    }

    /// Ends the server session; local credentials are cleared even if the call fails.
    pub async fn logout(&self) -> Result<(), ClientError> {
        let result = self
            .execute(self.request(Method::POST, "/v1/auth/logout"))
            .await;
        self.credentials.clear();
        result
    }
}
