use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::ResponseCache;
use crate::config::ClientSettings;
use crate::credentials::CredentialStore;
use crate::error::{Error, Result};
use crate::refresh::{parse_issued_tokens, RefreshCoordinator};
use crate::state::{AiModel, ChatMessage, ChatRequest, Conversation};
use crate::transport::{ApiRequest, ApiResponse, ByteStream, FormPart, HttpTransport, Transport, EVENT_STREAM};

/// Envelope codes the backend uses for success.
const SUCCESS_CODES: [i64; 3] = [0, 200, 201];
const MODELS_PATH: &str = "/ai/models";

/// Decodes a JSON body, unwrapping the `{code, message, data}` envelope when present.
pub fn unwrap_envelope<T: DeserializeOwned>(response: &ApiResponse) -> Result<T> {
    let value: Value = if response.body.is_empty() {
        Value::Null
    } else {
        response.json()?
    };
    Ok(serde_json::from_value(envelope_payload(value)?)?)
}

fn envelope_payload(value: Value) -> Result<Value> {
    let code = value.get("code").and_then(Value::as_i64);
    match (code, value) {
        (Some(code), Value::Object(mut map)) => {
            if !SUCCESS_CODES.contains(&code) {
                let message = map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("request rejected")
                    .to_string();
                return Err(Error::Api { code, message });
            }
            Ok(map.remove("data").unwrap_or(Value::Null))
        }
        (_, value) => Ok(value),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub nickname: String,
    pub email: String,
    pub password: String,
    pub code: String,
}

/// A file picked for upload.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub file_name: String,
    pub bytes: bytes::Bytes,
    pub mime: Option<String>,
}

impl FileUpload {
    pub async fn from_path(path: &std::path::Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Error::InvalidInput(format!("{} has no file name", path.display())))?
            .to_string();
        Ok(Self {
            file_name,
            bytes: bytes.into(),
            mime: None,
        })
    }
}

/// Typed backend endpoints. Everything but the auth endpoints goes through
/// the [`RefreshCoordinator`].
#[derive(Clone)]
pub struct ChatApi {
    coordinator: RefreshCoordinator,
    cache: ResponseCache,
}

impl ChatApi {
    pub fn new(coordinator: RefreshCoordinator) -> Self {
        Self {
            coordinator,
            cache: ResponseCache::new(),
        }
    }

    /// Builds the reqwest transport and the endpoint refresher from settings.
    pub fn from_settings(settings: &ClientSettings, credentials: CredentialStore) -> Result<Self> {
        let transport: Arc<dyn Transport> =
            Arc::new(HttpTransport::new(&settings.base_url, settings.timeout)?);
        Ok(Self::new(RefreshCoordinator::with_endpoint_refresh(
            transport,
            credentials,
        )))
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn credentials(&self) -> &CredentialStore {
        self.coordinator.credentials()
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    async fn call<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let response = self.coordinator.send(request).await?;
        unwrap_envelope(&response)
    }

    /// Signs in and stores the issued tokens. Returns the user record as sent.
    pub async fn login(&self, email: &str, password: &str) -> Result<Value> {
        let request = ApiRequest::post("/auth/login").json(json!({
            "email": email.trim(),
            "password": password.trim(),
        }));
        let response = self.coordinator.transport().send(&request, None).await?;
        let user = self.accept_tokens(&response)?;
        info!("signed in");
        Ok(user)
    }

    pub async fn request_register_code(&self, email: &str) -> Result<()> {
        let request = ApiRequest::post("/auth/apply-code").json(json!({ "email": email.trim() }));
        let response = self.coordinator.transport().send(&request, None).await?;
        unwrap_envelope::<Value>(&response).map(|_| ())
    }

    pub async fn register(&self, registration: &Registration) -> Result<()> {
        let request =
            ApiRequest::post("/auth/email-register").json(serde_json::to_value(registration)?);
        let response = self.coordinator.transport().send(&request, None).await?;
        unwrap_envelope::<Value>(&response)?;
        // Some deployments sign the new account in right away.
        if parse_issued_tokens(&response).is_ok() {
            self.accept_tokens(&response)?;
        }
        info!("registered");
        Ok(())
    }

    fn accept_tokens(&self, response: &ApiResponse) -> Result<Value> {
        let payload: Value = unwrap_envelope(response)?;
        let issued = parse_issued_tokens(response)?;
        let credentials = self.credentials();
        credentials.set(issued.credential);
        if issued.refresh_token.is_some() {
            credentials.set_refresh_token(issued.refresh_token);
        }
        Ok(payload.get("user").cloned().unwrap_or(Value::Null))
    }

    /// Forgets the session locally.
    pub fn logout(&self) {
        self.credentials().clear();
        self.cache.clear();
        info!("signed out");
    }

    pub async fn conversations(&self) -> Result<Vec<Conversation>> {
        self.call(ApiRequest::get("/conversations")).await
    }

    pub async fn conversation(&self, id: &str) -> Result<Conversation> {
        self.call(ApiRequest::get(format!("/conversations/{id}"))).await
    }

    pub async fn create_conversation(&self, title: &str) -> Result<Conversation> {
        let value: Value = self
            .call(ApiRequest::post("/conversations").json(json!({ "title": title })))
            .await?;
        let has_id = value
            .get("id")
            .is_some_and(|id| id.as_str().is_some_and(|s| !s.is_empty()) || id.is_number());
        if !has_id {
            return Err(Error::MalformedResponse(
                "created conversation carries no id".into(),
            ));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub async fn rename_conversation(&self, id: &str, title: &str) -> Result<()> {
        let request =
            ApiRequest::patch(format!("/conversations/{id}")).json(json!({ "title": title }));
        self.call::<Value>(request).await.map(|_| ())
    }

    pub async fn delete_conversation(&self, id: &str) -> Result<()> {
        self.call::<Value>(ApiRequest::delete(format!("/conversations/{id}")))
            .await
            .map(|_| ())
    }

    pub async fn delete_conversations(&self, ids: &[String]) -> Result<()> {
        let request = ApiRequest::delete("/conversations/batch").json(json!({ "ids": ids }));
        self.call::<Value>(request).await.map(|_| ())
    }

    pub async fn messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        let value: Value = self
            .call(ApiRequest::get(format!(
                "/conversations/{conversation_id}/messages"
            )))
            .await?;
        // Some backends wrap the list as `{ chatMessages: [...] }`.
        let list = match value {
            Value::Object(mut map) => map.remove("chatMessages").unwrap_or(Value::Null),
            other => other,
        };
        if list.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(list)?)
    }

    /// Enabled-flag-bearing models offered by the backend. Never fails: on any
    /// error the built-in fallback model is returned.
    pub async fn models(&self) -> Vec<AiModel> {
        let key = ResponseCache::key("GET", MODELS_PATH, None);
        if let Some(cached) = self.cache.get(&key) {
            if let Ok(models) = serde_json::from_value(cached) {
                return models;
            }
        }
        match self.call::<Value>(ApiRequest::get(MODELS_PATH)).await {
            Ok(value) => {
                let models = valid_models(&value);
                if models.is_empty() {
                    return vec![AiModel::fallback()];
                }
                if let Ok(encoded) = serde_json::to_value(&models) {
                    self.cache.insert(key, encoded);
                }
                models
            }
            Err(err) => {
                warn!(error = %err, "failed to load models, using fallback");
                vec![AiModel::fallback()]
            }
        }
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<String> {
        let body = serde_json::to_value(request)?;
        let reply: Option<String> = self.call(ApiRequest::post("/ai/chat").json(body)).await?;
        Ok(reply.unwrap_or_default())
    }

    pub async fn open_chat_stream(&self, request: &ChatRequest) -> Result<ByteStream> {
        let body = serde_json::to_value(request)?;
        self.coordinator
            .open_stream(
                ApiRequest::post("/ai/chat/stream")
                    .json(body)
                    .accept(EVENT_STREAM),
            )
            .await
    }

    pub async fn upload_file(&self, conversation_id: &str, upload: &FileUpload) -> Result<ChatMessage> {
        let request = ApiRequest::post("/ai/chat/file").multipart(vec![
            FormPart::file(
                "file",
                upload.file_name.clone(),
                upload.bytes.clone(),
                upload.mime.clone(),
            ),
            FormPart::text("conversationId", conversation_id),
        ]);
        self.call(request).await
    }
}

fn valid_models(value: &Value) -> Vec<AiModel> {
    let Some(entries) = value.as_array() else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let value = entry.get("value")?.as_str().filter(|s| !s.is_empty())?;
            let label = entry.get("label")?.as_str().filter(|s| !s.is_empty())?;
            let enabled = entry.get("enabled")?.as_bool()?;
            Some(AiModel {
                value: value.to_string(),
                label: label.to_string(),
                enabled,
            })
        })
        .collect()
}
