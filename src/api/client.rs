use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode};
use serde_json::Value;

use crate::api::models::{self, Identity, Message, Peer, UserRecord};
use crate::api::ChatApi;
use crate::{Error, Result};

/// HTTP client for the chat server's REST endpoints.
#[derive(Clone)]
pub struct ApiClient {
    http: HttpClient,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_string() })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn base_api(&self) -> String {
        if self.base_url.ends_with("/api") {
            self.base_url.clone()
        } else {
            format!("{}/api", self.base_url)
        }
    }

    fn with_auth(req: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
        match token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    /// Exchange credentials for a bearer token.
    pub async fn login(&self, email: &str, password: &str) -> Result<String> {
        let endpoint = format!("{}/auth/login", self.base_api());
        let body = serde_json::json!({ "email": email, "password": password });
        let resp = self.http.post(&endpoint).json(&body).send().await?;
        let json = read_json(resp, false).await?;
        json.get("token")
            .or_else(|| json.get("accessToken"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol("token not found in response".into()))
    }

    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<()> {
        let endpoint = format!("{}/auth/register", self.base_api());
        let body = serde_json::json!({ "username": username, "email": email, "password": password });
        let resp = self.http.post(&endpoint).json(&body).send().await?;
        read_json(resp, false).await.map(|_| ())
    }

    /// Resolve the identity behind a persisted token.
    pub async fn me(&self, token: &str) -> Result<Identity> {
        let endpoint = format!("{}/users/me", self.base_api());
        let resp = Self::with_auth(self.http.get(&endpoint), Some(token)).send().await?;
        let mut json = read_json(resp, true).await?;
        let record = match json.get_mut("user") {
            Some(user) => user.take(),
            None => json,
        };
        serde_json::from_value::<UserRecord>(record)?
            .into_identity()
            .ok_or_else(|| Error::Protocol("identity without an id".into()))
    }
}

#[async_trait]
impl ChatApi for ApiClient {
    async fn users(&self, token: &str) -> Result<Vec<Peer>> {
        let endpoint = format!("{}/users", self.base_api());
        let resp = Self::with_auth(self.http.get(&endpoint), Some(token)).send().await?;
        Ok(models::peers_from_value(read_json(resp, true).await?))
    }

    async fn messages(&self, token: &str) -> Result<Vec<Message>> {
        let endpoint = format!("{}/messages", self.base_api());
        let resp = Self::with_auth(self.http.get(&endpoint), Some(token)).send().await?;
        Ok(models::messages_from_value(read_json(resp, true).await?))
    }

    async fn post_message(&self, token: &str, recipient_id: &str, content: &str) -> Result<Message> {
        let endpoint = format!("{}/messages", self.base_api());
        let body = serde_json::json!({ "recipientId": recipient_id, "content": content });
        let resp = Self::with_auth(self.http.post(&endpoint), Some(token))
            .json(&body)
            .send()
            .await?;
        models::message_from_value(read_json(resp, true).await?)
    }
}

/// Turn a response into JSON, mapping failures onto the error taxonomy.
///
/// `authorized` requests treat `401`/`403` as a rejected credential; the auth
/// endpoints themselves report those as ordinary rejections.
async fn read_json(resp: reqwest::Response, authorized: bool) -> Result<Value> {
    let status = resp.status();
    if authorized && (status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN) {
        return Err(Error::Unauthorized);
    }
    if !status.is_success() {
        let body = resp.json::<Value>().await.unwrap_or(Value::Null);
        return Err(Error::Rejected(rejection_message(status, &body)));
    }
    resp.json::<Value>()
        .await
        .map_err(|e| Error::Protocol(e.to_string()))
}

fn rejection_message(status: StatusCode, body: &Value) -> String {
    body.get("message")
        .or_else(|| body.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status))
}
