use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::credentials::Credential;
use crate::error::{Error, Result};

pub const EVENT_STREAM: &str = "text/event-stream";

/// Body of a streamed response, chunk by chunk.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Whether a request has already been replayed after a credential refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    Original,
    Replayed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormValue {
    Text(String),
    File {
        bytes: Bytes,
        file_name: String,
        mime: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormPart {
    pub name: String,
    pub value: FormValue,
}

impl FormPart {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: FormValue::Text(value.into()),
        }
    }

    pub fn file(
        name: impl Into<String>,
        file_name: impl Into<String>,
        bytes: impl Into<Bytes>,
        mime: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: FormValue::File {
                bytes: bytes.into(),
                file_name: file_name.into(),
                mime,
            },
        }
    }
}

/// Request bodies are kept as plain data so a request can be sent twice.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Multipart(Vec<FormPart>),
}

/// Everything needed to (re)issue one backend call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: RequestBody,
    pub accept: Option<&'static str>,
    replay: Replay,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: RequestBody::Empty,
            accept: None,
            replay: Replay::Original,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn multipart(mut self, parts: Vec<FormPart>) -> Self {
        self.body = RequestBody::Multipart(parts);
        self
    }

    pub fn accept(mut self, mime: &'static str) -> Self {
        self.accept = Some(mime);
        self
    }

    pub fn replay(&self) -> Replay {
        self.replay
    }

    pub fn is_replayed(&self) -> bool {
        self.replay == Replay::Replayed
    }

    pub(crate) fn into_replay(mut self) -> Self {
        self.replay = Replay::Replayed;
        self
    }
}

/// A buffered 2xx response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// One HTTP round trip. Implementations never retry.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest, credential: Option<&Credential>)
        -> Result<ApiResponse>;

    /// Sends the request and hands back the body as a stream once the status is 2xx.
    async fn open_stream(
        &self,
        request: &ApiRequest,
        credential: Option<&Credential>,
    ) -> Result<ByteStream>;
}

/// Maps a non-2xx status and its body onto the error taxonomy.
pub fn status_error(status: u16, body: &[u8]) -> Error {
    let message = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_owned)
        })
        .unwrap_or_else(|| format!("request failed ({status})"));
    if status == 401 {
        Error::Unauthorized { message }
    } else {
        Error::Http { status, message }
    }
}

/// reqwest-backed transport talking to the chat backend.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(Error::network)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build(
        &self,
        request: &ApiRequest,
        credential: Option<&Credential>,
    ) -> Result<reqwest::RequestBuilder> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.client.request(request.method.clone(), url);
        if let Some(credential) = credential {
            builder = builder.header(AUTHORIZATION, credential.bearer());
        }
        if let Some(accept) = request.accept {
            builder = builder.header(ACCEPT, accept);
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Multipart(parts) => builder.multipart(build_form(parts)?),
        };
        Ok(builder)
    }

    async fn checked(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await.map_err(Error::network)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.bytes().await.unwrap_or_default();
        Err(status_error(status.as_u16(), &body))
    }
}

fn build_form(parts: &[FormPart]) -> Result<Form> {
    let mut form = Form::new();
    for part in parts {
        form = match &part.value {
            FormValue::Text(value) => form.text(part.name.clone(), value.clone()),
            FormValue::File {
                bytes,
                file_name,
                mime,
            } => {
                let mut file = Part::bytes(bytes.to_vec()).file_name(file_name.clone());
                if let Some(mime) = mime {
                    file = file
                        .mime_str(mime)
                        .map_err(|err| Error::InvalidInput(format!("mime type {mime}: {err}")))?;
                }
                form.part(part.name.clone(), file)
            }
        };
    }
    Ok(form)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: &ApiRequest,
        credential: Option<&Credential>,
    ) -> Result<ApiResponse> {
        debug!(method = %request.method, path = %request.path, "sending request");
        let builder = self.build(request, credential)?.timeout(self.timeout);
        let response = self.checked(builder).await?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(Error::network)?;
        Ok(ApiResponse { status, body })
    }

    async fn open_stream(
        &self,
        request: &ApiRequest,
        credential: Option<&Credential>,
    ) -> Result<ByteStream> {
        debug!(method = %request.method, path = %request.path, "opening stream");
        let builder = self.build(request, credential)?;
        let response = self.checked(builder).await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| Error::StreamTransport(err.to_string())))
            .boxed())
    }
}

/// What happens after the scripted chunks of a [`MockReply::Stream`] run out.
#[derive(Debug, Clone)]
pub enum StreamTail {
    End,
    Hang,
    Fail(String),
}

#[derive(Debug, Clone)]
pub enum MockReply {
    Json { status: u16, body: Value },
    Stream { chunks: Vec<Bytes>, tail: StreamTail },
    NetworkFailure(String),
}

impl MockReply {
    pub fn ok(body: Value) -> Self {
        Self::Json { status: 200, body }
    }

    pub fn status(status: u16, body: Value) -> Self {
        Self::Json { status, body }
    }

    pub fn unauthorized() -> Self {
        Self::status(401, serde_json::json!({ "message": "Unauthorized" }))
    }

    pub fn stream<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Bytes>,
    {
        Self::Stream {
            chunks: chunks.into_iter().map(Into::into).collect(),
            tail: StreamTail::End,
        }
    }

    pub fn with_tail(self, tail: StreamTail) -> Self {
        match self {
            Self::Stream { chunks, .. } => Self::Stream { chunks, tail },
            other => other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub bearer: Option<String>,
    pub body: RequestBody,
    pub replay: Replay,
}

type Responder = dyn Fn(&ApiRequest, Option<&Credential>) -> MockReply + Send + Sync;

/// Scripted transport for tests and smoke runs. Every call is recorded.
#[derive(Clone)]
pub struct MockTransport {
    responder: Arc<Responder>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl MockTransport {
    pub fn new(
        responder: impl Fn(&ApiRequest, Option<&Credential>) -> MockReply + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Arc::new(responder),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls.lock().iter().filter(|call| call.path == path).count()
    }

    async fn reply(&self, request: &ApiRequest, credential: Option<&Credential>) -> MockReply {
        // Give other tasks a chance to run, like a real network round trip would.
        tokio::task::yield_now().await;
        self.calls.lock().push(RecordedCall {
            method: request.method.clone(),
            path: request.path.clone(),
            bearer: credential.map(|c| c.access_token.clone()),
            body: request.body.clone(),
            replay: request.replay(),
        });
        trace!(path = %request.path, "mock transport call");
        (self.responder)(request, credential)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        request: &ApiRequest,
        credential: Option<&Credential>,
    ) -> Result<ApiResponse> {
        match self.reply(request, credential).await {
            MockReply::Json { status, body } => {
                let body = Bytes::from(serde_json::to_vec(&body)?);
                if (200..300).contains(&status) {
                    Ok(ApiResponse { status, body })
                } else {
                    Err(status_error(status, &body))
                }
            }
            MockReply::Stream { chunks, .. } => Ok(ApiResponse {
                status: 200,
                body: Bytes::from(chunks.concat()),
            }),
            MockReply::NetworkFailure(message) => Err(Error::Network(message)),
        }
    }

    async fn open_stream(
        &self,
        request: &ApiRequest,
        credential: Option<&Credential>,
    ) -> Result<ByteStream> {
        match self.reply(request, credential).await {
            MockReply::Json { status, body } => {
                let body = Bytes::from(serde_json::to_vec(&body)?);
                if (200..300).contains(&status) {
                    Ok(stream::once(async move { Ok::<Bytes, Error>(body) }).boxed())
                } else {
                    Err(status_error(status, &body))
                }
            }
            MockReply::Stream { chunks, tail } => {
                let tail: ByteStream = match tail {
                    StreamTail::End => stream::empty().boxed(),
                    StreamTail::Hang => stream::pending().boxed(),
                    StreamTail::Fail(message) => {
                        stream::once(async move { Err(Error::StreamTransport(message)) }).boxed()
                    }
                };
                Ok(stream::iter(chunks.into_iter().map(Ok::<Bytes, Error>))
                    .chain(tail)
                    .boxed())
            }
            MockReply::NetworkFailure(message) => Err(Error::Network(message)),
        }
    }
}
