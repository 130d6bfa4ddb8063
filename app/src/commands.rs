use anyhow::{anyhow, Context, Result};
use chatline_core::api::{ChatApi, FileUpload, Registration};
use chatline_core::session::{ChatSession, SendReceipt, ABORTED_SUFFIX, FAILED_SUFFIX};
use chatline_core::{ClientSettings, CredentialStore, StreamEvent};
use std::io::Write;
use tracing::{debug, info};

use crate::cli::{Command, ConversationAction};

/// Settings plus the API handle every command runs against.
pub struct Client {
    settings: ClientSettings,
    api: ChatApi,
}

impl Client {
    pub fn from_settings(settings: ClientSettings) -> Result<Self> {
        let credentials = match &settings.credentials_path {
            Some(path) => CredentialStore::open(path)
                .with_context(|| format!("failed to open credentials at {}", path.display()))?,
            None => CredentialStore::in_memory(),
        };
        let api = ChatApi::from_settings(&settings, credentials)
            .context("failed to build HTTP client")?;
        Ok(Self { settings, api })
    }

    pub fn with_api(settings: ClientSettings, api: ChatApi) -> Self {
        Self { settings, api }
    }

    pub fn api(&self) -> &ChatApi {
        &self.api
    }
}

pub async fn run<W: Write>(client: &Client, command: Command, out: &mut W) -> Result<()> {
    let api = &client.api;
    match command {
        Command::Login { email, password } => {
            let user = api.login(&email, &password).await.context("login failed")?;
            let name = user
                .get("nickname")
                .and_then(|v| v.as_str())
                .unwrap_or(email.as_str());
            writeln!(out, "Signed in as {name}")?;
        }
        Command::RegisterCode { email } => {
            api.request_register_code(&email)
                .await
                .context("could not request a registration code")?;
            writeln!(out, "Registration code sent to {email}")?;
        }
        Command::Register {
            nickname,
            email,
            password,
            code,
        } => {
            let registration = Registration {
                nickname,
                email,
                password,
                code,
            };
            api.register(&registration).await.context("registration failed")?;
            writeln!(out, "Registered {}", registration.email)?;
        }
        Command::Logout => {
            api.logout();
            writeln!(out, "Signed out")?;
        }
        Command::Conversations { action } => match action.unwrap_or(ConversationAction::List) {
            ConversationAction::List => {
                for conversation in api.conversations().await? {
                    writeln!(out, "{}\t{}", conversation.id, conversation.title)?;
                }
            }
            ConversationAction::Rename { id, title } => {
                api.rename_conversation(&id, &title).await?;
                writeln!(out, "Renamed {id}")?;
            }
            ConversationAction::Delete { ids } => {
                if let [id] = ids.as_slice() {
                    api.delete_conversation(id).await?;
                } else {
                    api.delete_conversations(&ids).await?;
                }
                writeln!(out, "Deleted {} conversation(s)", ids.len())?;
            }
        },
        Command::History { conversation } => {
            let session = ChatSession::new(api.clone(), Some(conversation));
            session.load_messages().await?;
            for message in session.messages() {
                writeln!(out, "{:?}: {}", message.role, message.content)?;
            }
        }
        Command::Models => {
            for model in api.models().await {
                let state = if model.enabled { "" } else { " (disabled)" };
                writeln!(out, "{}\t{}{state}", model.value, model.label)?;
            }
        }
        Command::Send {
            text,
            conversation,
            model,
            no_stream,
            deep_think,
        } => {
            let announce = conversation.is_none();
            let session = ChatSession::new(api.clone(), conversation);
            session.set_streaming(!no_stream);
            let model = model.unwrap_or_else(|| client.settings.default_model.clone());
            let receipt = if deep_think {
                session.send_deep_think(&text, &model).await?
            } else {
                session.send_text(&text, &model).await?
            };
            let Some(receipt) = receipt else {
                return Err(anyhow!("nothing to send"));
            };
            if announce {
                if let Some(id) = session.conversation_id() {
                    writeln!(out, "[conversation {id}]")?;
                }
            }
            match receipt {
                SendReceipt::Completed { message_id } => {
                    let reply = session
                        .messages()
                        .into_iter()
                        .find(|m| m.id == message_id)
                        .map(|m| m.content)
                        .unwrap_or_default();
                    writeln!(out, "{reply}")?;
                }
                SendReceipt::Streaming { updates, .. } => {
                    print_stream(&session, updates, out).await?;
                }
            }
        }
        Command::Upload { path, conversation } => {
            let upload = FileUpload::from_path(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let session = ChatSession::new(api.clone(), conversation);
            let message = session.send_file(&upload).await?;
            info!(conversation = %message.conversation_id, "upload finished");
            writeln!(out, "{}", message.content)?;
        }
    }
    Ok(())
}

async fn print_stream<W: Write>(
    session: &ChatSession,
    mut updates: tokio::sync::mpsc::UnboundedReceiver<StreamEvent>,
    out: &mut W,
) -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            event = updates.recv() => match event {
                Some(StreamEvent::Delta(text)) => {
                    write!(out, "{text}")?;
                    out.flush()?;
                }
                Some(StreamEvent::Done) | None => break,
                Some(StreamEvent::Error(err)) => {
                    writeln!(out, "{FAILED_SUFFIX}")?;
                    return Err(anyhow!(err).context("reply stream failed"));
                }
            },
            _ = &mut ctrl_c => {
                debug!("interrupt received, aborting stream");
                if session.abort_stream() {
                    write!(out, "{ABORTED_SUFFIX}")?;
                }
                break;
            }
        }
    }
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatline_core::{Credential, MockReply, MockTransport, RefreshCoordinator};
    use serde_json::json;
    use std::sync::Arc;

    fn client(transport: MockTransport) -> Client {
        let credentials = CredentialStore::in_memory();
        credentials.set(Credential::new("token"));
        let coordinator = RefreshCoordinator::with_endpoint_refresh(Arc::new(transport), credentials);
        Client::with_api(ClientSettings::default(), ChatApi::new(coordinator))
    }

    async fn output(client: &Client, command: Command) -> Result<String> {
        let mut out = Vec::new();
        run(client, command, &mut out).await?;
        Ok(String::from_utf8(out)?)
    }

    #[tokio::test]
    async fn send_streams_reply_to_output() {
        let client = client(MockTransport::new(|_, _| {
            MockReply::stream(["data: {\"content\":\"Hel\"}\ndata: {\"content\":\"lo\"}\n", "data: [DONE]\n"])
        }));
        let printed = output(
            &client,
            Command::Send {
                text: "hi".into(),
                conversation: Some("c1".into()),
                model: None,
                no_stream: false,
                deep_think: false,
            },
        )
        .await
        .expect("send");
        assert_eq!(printed, "Hello\n");
    }

    #[tokio::test]
    async fn models_lists_fallback_when_backend_fails() {
        let client = client(MockTransport::new(|_, _| {
            MockReply::NetworkFailure("connection refused".into())
        }));
        let printed = output(&client, Command::Models).await.expect("models");
        assert_eq!(printed, "deepseek-chat\tDeepSeek\n");
    }

    #[tokio::test]
    async fn logout_clears_credentials() {
        let client = client(MockTransport::new(|_, _| MockReply::ok(json!({}))));
        output(&client, Command::Logout).await.expect("logout");
        assert!(client.api().credentials().credential().is_none());
    }
}
