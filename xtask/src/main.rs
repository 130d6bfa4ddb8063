use anyhow::{bail, ensure, Result};
use chatline_core::transport::{MockReply, MockTransport};
use chatline_core::{telemetry, ChatApi, ChatSession, CredentialStore, RefreshCoordinator, SendReceipt, StreamEvent};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for Chatline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive login, an expired-token refresh and a streamed reply through the core.
    Smoke,
}

fn main() -> Result<()> {
    telemetry::init_tracing(EnvFilter::new("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
    }
}

/// Backend stand-in: the first access token is rejected once so the
/// refresh path runs before the stream is served.
fn scripted_backend() -> MockTransport {
    let rejected_once = AtomicBool::new(false);
    MockTransport::new(move |request, credential| {
        let token = credential.map(|c| c.access_token.as_str());
        match request.path.as_str() {
            "/auth/login" => MockReply::ok(json!({
                "code": 200,
                "message": "ok",
                "data": {
                    "accessToken": "smoke-access-1",
                    "refreshToken": "smoke-refresh",
                    "user": { "id": 1, "nickname": "smoke" }
                }
            })),
            "/auth/refresh" => MockReply::ok(json!({
                "code": 200,
                "data": { "accessToken": "smoke-access-2" },
                "tokenExpires": 3600
            })),
            "/conversations" => MockReply::ok(json!({
                "code": 201,
                "data": { "id": "smoke-conversation", "title": "New chat" }
            })),
            "/ai/chat/stream" => {
                if token == Some("smoke-access-1") && !rejected_once.swap(true, Ordering::SeqCst) {
                    return MockReply::unauthorized();
                }
                MockReply::stream([
                    "data: {\"content\":\"pong \"}\n",
                    "data: {\"content\":\"from \u{e4}\"}\n",
                    "data: not-json\n",
                    "data: {\"content\":\" xtask\"}\n",
                    "data: [DONE]\n",
                ])
            }
            _ => MockReply::status(404, json!({ "message": "not found" })),
        }
    })
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    let temp_dir = TempDir::new()?;
    let credentials = CredentialStore::open(temp_dir.path().join("credentials.json"))?;
    let transport = Arc::new(scripted_backend());
    let coordinator = RefreshCoordinator::with_endpoint_refresh(transport.clone(), credentials.clone());
    let api = ChatApi::new(coordinator);

    runtime.block_on(async {
        api.login("smoke@example.com", "secret").await?;
        let session = ChatSession::new(api.clone(), None);
        let Some(SendReceipt::Streaming { mut updates, .. }) =
            session.send_text("ping from xtask", "deepseek-chat").await?
        else {
            bail!("expected a streaming reply");
        };
        while let Some(event) = updates.recv().await {
            match event {
                StreamEvent::Delta(_) => {}
                StreamEvent::Done => break,
                StreamEvent::Error(err) => return Err(err.into()),
            }
        }

        let reply = session.messages().pop().map(|m| m.content).unwrap_or_default();
        ensure!(reply == "pong from \u{e4} xtask", "unexpected reply {reply:?}");
        ensure!(
            transport.calls_to("/auth/refresh") == 1,
            "expected exactly one refresh"
        );
        info!(
            "messages" = session.messages().len(),
            "reply" = %reply,
            "smoke test conversation streamed"
        );
        Ok::<(), anyhow::Error>(())
    })?;

    let reopened = CredentialStore::open(temp_dir.path().join("credentials.json"))?;
    ensure!(
        reopened.credential().map(|c| c.access_token) == Some("smoke-access-2".to_string()),
        "refreshed credential was not persisted"
    );
    Ok(())
}
