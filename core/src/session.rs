use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{ChatApi, FileUpload};
use crate::error::{Error, Result};
use crate::state::{chat_context, ChatMessage, ChatRequest, MessageKind, MessageRole};
use crate::stream::{CancelHandle, StreamConsumer, StreamEvent};

pub const DEEP_THINK_PREFIX: &str = "[深度思考模式] ";
pub const ABORTED_SUFFIX: &str = "\n\n❌ Stream interrupted";
pub const FAILED_SUFFIX: &str = "\n\n❌ Stream failed";
pub const EMPTY_REPLY: &str = "(no reply)";
pub const NEW_CONVERSATION_TITLE: &str = "New chat";

/// Coarse view of what a [`ChatSession`] is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Sending,
    Streaming,
}

enum SessionPhase {
    Idle,
    Sending,
    Streaming { marker: Uuid, handle: CancelHandle },
}

impl SessionPhase {
    fn kind(&self) -> Phase {
        match self {
            Self::Idle => Phase::Idle,
            Self::Sending => Phase::Sending,
            Self::Streaming { .. } => Phase::Streaming,
        }
    }
}

/// How a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamOutcome {
    Completed,
    Aborted,
    Failed,
}

impl StreamOutcome {
    fn suffix(self) -> Option<&'static str> {
        match self {
            Self::Completed => None,
            Self::Aborted => Some(ABORTED_SUFFIX),
            Self::Failed => Some(FAILED_SUFFIX),
        }
    }
}

struct SessionInner {
    conversation_id: Option<String>,
    user_id: Option<String>,
    messages: Vec<ChatMessage>,
    phase: SessionPhase,
    stream_enabled: bool,
}

/// What a successful send produced.
#[derive(Debug)]
pub enum SendReceipt {
    /// The assistant reply is already in the log.
    Completed { message_id: String },
    /// The assistant reply is growing in place; `updates` mirrors every stream event.
    Streaming {
        message_id: String,
        updates: mpsc::UnboundedReceiver<StreamEvent>,
    },
}

impl SendReceipt {
    pub fn message_id(&self) -> &str {
        match self {
            Self::Completed { message_id } | Self::Streaming { message_id, .. } => message_id,
        }
    }
}

/// Ordered message log of one conversation plus the send state machine.
#[derive(Clone)]
pub struct ChatSession {
    api: ChatApi,
    inner: Arc<RwLock<SessionInner>>,
}

impl ChatSession {
    /// A session for `conversation_id`, or one that creates its conversation on first send.
    pub fn new(api: ChatApi, conversation_id: Option<String>) -> Self {
        Self {
            api,
            inner: Arc::new(RwLock::new(SessionInner {
                conversation_id,
                user_id: None,
                messages: Vec::new(),
                phase: SessionPhase::Idle,
                stream_enabled: true,
            })),
        }
    }

    pub fn api(&self) -> &ChatApi {
        &self.api
    }

    pub fn set_streaming(&self, enabled: bool) {
        self.inner.write().stream_enabled = enabled;
    }

    pub fn set_user_id(&self, user_id: Option<String>) {
        self.inner.write().user_id = user_id;
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.inner.read().messages.clone()
    }

    pub fn phase(&self) -> Phase {
        self.inner.read().phase.kind()
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.inner.read().conversation_id.clone()
    }

    /// Replaces the log with the backend's history of this conversation.
    pub async fn load_messages(&self) -> Result<usize> {
        let Some((conversation_id, guard)) = self.begin()? else {
            return Ok(0);
        };
        let loaded = self.api.messages(&conversation_id).await;
        guard.disarm();
        let mut inner = self.inner.write();
        inner.phase = SessionPhase::Idle;
        let messages: Vec<_> = loaded?
            .into_iter()
            .filter(|m| matches!(m.role, MessageRole::User | MessageRole::Assistant))
            .collect();
        let count = messages.len();
        inner.messages = messages;
        debug!(conversation = %conversation_id, count, "loaded messages");
        Ok(count)
    }

    /// Sends `text` and returns once the reply is in the log (sync) or the
    /// stream is open (streaming). Blank text is ignored.
    pub async fn send_text(&self, text: &str, model: &str) -> Result<Option<SendReceipt>> {
        self.send(text.to_string(), model, MessageKind::Text).await
    }

    pub async fn send_deep_think(&self, text: &str, model: &str) -> Result<Option<SendReceipt>> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        self.send(format!("{DEEP_THINK_PREFIX}{text}"), model, MessageKind::DeepThink)
            .await
    }

    pub async fn send_file(&self, upload: &FileUpload) -> Result<ChatMessage> {
        let guard = self.enter_sending()?;
        let result = async {
            let conversation_id = self.ensure_conversation().await?;
            let mut message = self.api.upload_file(&conversation_id, upload).await?;
            if message.conversation_id.is_empty() {
                message.conversation_id = conversation_id;
            }
            Ok(message)
        }
        .await;

        guard.disarm();
        let mut inner = self.inner.write();
        inner.phase = SessionPhase::Idle;
        match result {
            Ok(message) => {
                info!(file = %upload.file_name, "file uploaded");
                inner.messages.push(message.clone());
                Ok(message)
            }
            Err(err) => {
                warn!(error = %err, file = %upload.file_name, "file upload failed");
                Err(err)
            }
        }
    }

    /// Stops the live stream. Returns false when nothing was streaming.
    pub fn abort_stream(&self) -> bool {
        let (marker, handle) = match &self.inner.read().phase {
            SessionPhase::Streaming { marker, handle } => (*marker, handle.clone()),
            _ => return false,
        };
        // The sink takes the session lock, so cancel without holding it.
        handle.cancel();
        let aborted = finish_stream(&self.inner, marker, StreamOutcome::Aborted);
        if aborted {
            info!(%marker, "stream aborted");
        }
        aborted
    }

    async fn send(
        &self,
        content: String,
        model: &str,
        kind: MessageKind,
    ) -> Result<Option<SendReceipt>> {
        if content.trim().is_empty() {
            return Ok(None);
        }
        let guard = self.enter_sending()?;
        let conversation_id = self.ensure_conversation().await?;

        let (request, streaming) = {
            let mut inner = self.inner.write();
            let user_message = ChatMessage::new(MessageRole::User, content)
                .in_conversation(&conversation_id)
                .with_kind(kind);
            inner.messages.push(user_message);
            let request = ChatRequest {
                user_id: inner.user_id.clone(),
                conversation_id: conversation_id.clone(),
                chat_context: chat_context(&inner.messages),
                model: model.to_string(),
                stream: inner.stream_enabled,
            };
            (request, inner.stream_enabled)
        };

        if streaming {
            self.send_streaming(request, guard).await.map(Some)
        } else {
            self.send_sync(request, guard).await.map(Some)
        }
    }

    async fn send_sync(&self, request: ChatRequest, guard: PhaseGuard) -> Result<SendReceipt> {
        let result = self.api.chat(&request).await;
        guard.disarm();
        let mut inner = self.inner.write();
        inner.phase = SessionPhase::Idle;
        let content = match &result {
            Ok(reply) if reply.trim().is_empty() => EMPTY_REPLY.to_string(),
            Ok(reply) => reply.clone(),
            Err(err) => err.to_string(),
        };
        let mut reply = ChatMessage::new(MessageRole::Assistant, content)
            .in_conversation(&request.conversation_id);
        reply.model_used = Some(request.model.clone());
        let message_id = reply.id.clone();
        inner.messages.push(reply);
        match result {
            Ok(_) => Ok(SendReceipt::Completed { message_id }),
            Err(err) => {
                warn!(error = %err, "chat request failed");
                Err(err)
            }
        }
    }

    async fn send_streaming(&self, request: ChatRequest, mut guard: PhaseGuard) -> Result<SendReceipt> {
        let marker = Uuid::new_v4();
        let handle = CancelHandle::new();
        let message_id = {
            let mut inner = self.inner.write();
            let mut placeholder = ChatMessage::new(MessageRole::Assistant, "")
                .in_conversation(&request.conversation_id);
            placeholder.model_used = Some(request.model.clone());
            placeholder.stream_marker = Some(marker);
            let id = placeholder.id.clone();
            inner.messages.push(placeholder);
            inner.phase = SessionPhase::Streaming {
                marker,
                handle: handle.clone(),
            };
            id
        };
        guard.marker = Some(marker);

        let (tx, updates) = mpsc::unbounded_channel();
        let opened = tokio::select! {
            biased;
            _ = handle.cancelled() => None,
            opened = self.api.open_chat_stream(&request) => Some(opened),
        };
        guard.disarm();
        let body = match opened {
            // Aborted while connecting; the abort already finished the message.
            None => return Ok(SendReceipt::Streaming { message_id, updates }),
            Some(Ok(body)) => body,
            Some(Err(err)) => {
                warn!(error = %err, "failed to open chat stream");
                finish_stream(&self.inner, marker, StreamOutcome::Failed);
                return Err(err);
            }
        };

        debug!(%marker, "chat stream open");
        let inner = self.inner.clone();
        StreamConsumer::open_with(handle, body, move |event| {
            apply_event(&inner, marker, &event);
            // The receiver may have been dropped; the log is still updated.
            let _ = tx.send(event);
        });
        Ok(SendReceipt::Streaming { message_id, updates })
    }

    fn enter_sending(&self) -> Result<PhaseGuard> {
        let mut inner = self.inner.write();
        match inner.phase {
            SessionPhase::Idle => {
                inner.phase = SessionPhase::Sending;
                Ok(PhaseGuard::new(&self.inner))
            }
            _ => Err(Error::ConversationBusy),
        }
    }

    /// Marks the session busy and hands back the conversation id, if any.
    fn begin(&self) -> Result<Option<(String, PhaseGuard)>> {
        let mut inner = self.inner.write();
        if !matches!(inner.phase, SessionPhase::Idle) {
            return Err(Error::ConversationBusy);
        }
        let Some(id) = inner.conversation_id.clone() else {
            return Ok(None);
        };
        inner.phase = SessionPhase::Sending;
        Ok(Some((id, PhaseGuard::new(&self.inner))))
    }

    async fn ensure_conversation(&self) -> Result<String> {
        if let Some(id) = self.conversation_id() {
            return Ok(id);
        }
        let created = self.api.create_conversation(NEW_CONVERSATION_TITLE).await?;
        info!(conversation = %created.id, "created conversation");
        self.inner.write().conversation_id = Some(created.id.clone());
        Ok(created.id)
    }
}

/// Puts the session back to idle when a send future is dropped before it
/// settles. Once a placeholder exists (`marker` is set) the reply is closed
/// as aborted. Disarm before taking the session lock.
struct PhaseGuard {
    inner: Arc<RwLock<SessionInner>>,
    marker: Option<Uuid>,
    armed: bool,
}

impl PhaseGuard {
    fn new(inner: &Arc<RwLock<SessionInner>>) -> Self {
        Self {
            inner: inner.clone(),
            marker: None,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.marker {
            Some(marker) => {
                if finish_stream(&self.inner, marker, StreamOutcome::Aborted) {
                    debug!(%marker, "stream dropped while connecting");
                }
            }
            None => {
                let mut inner = self.inner.write();
                if matches!(inner.phase, SessionPhase::Sending) {
                    inner.phase = SessionPhase::Idle;
                    debug!("send dropped before it settled");
                }
            }
        }
    }
}

fn apply_event(inner: &RwLock<SessionInner>, marker: Uuid, event: &StreamEvent) {
    match event {
        StreamEvent::Delta(text) => {
            let mut inner = inner.write();
            if let Some(message) = inner
                .messages
                .iter_mut()
                .find(|m| m.stream_marker == Some(marker))
            {
                message.content.push_str(text);
            }
        }
        StreamEvent::Done => {
            finish_stream(inner, marker, StreamOutcome::Completed);
        }
        StreamEvent::Error(err) => {
            warn!(error = %err, %marker, "chat stream failed");
            finish_stream(inner, marker, StreamOutcome::Failed);
        }
    }
}

/// Clears `marker` and returns to idle. Only the first caller for a given
/// marker has any effect.
fn finish_stream(inner: &RwLock<SessionInner>, marker: Uuid, outcome: StreamOutcome) -> bool {
    let mut inner = inner.write();
    let live = matches!(&inner.phase, SessionPhase::Streaming { marker: live, .. } if *live == marker);
    if !live {
        return false;
    }
    inner.phase = SessionPhase::Idle;
    if let Some(message) = inner
        .messages
        .iter_mut()
        .find(|m| m.stream_marker == Some(marker))
    {
        if let Some(suffix) = outcome.suffix() {
            message.content.push_str(suffix);
        }
        message.stream_marker = None;
    }
    debug!(%marker, ?outcome, "stream finished");
    true
}
