use bytes::Bytes;
use chatline_core::api::{ChatApi, FileUpload};
use chatline_core::session::{ChatSession, Phase, SendReceipt};
use chatline_core::transport::{MockReply, MockTransport, RequestBody};
use chatline_core::{CredentialStore, MessageKind, RefreshCoordinator, StreamEvent};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

use super::test_runtime;

/// Backend that only accepts `current` and rotates it on every refresh.
fn rotating_backend() -> MockTransport {
    MockTransport::new(|request, credential| {
        let token = credential.map(|c| c.access_token.clone());
        match request.path.as_str() {
            "/auth/login" => MockReply::ok(json!({
                "code": 200,
                "data": { "accessToken": "old", "refreshToken": "r1", "user": { "nickname": "ada" } }
            })),
            "/auth/refresh" => {
                assert_eq!(request.body, RequestBody::Json(json!({ "refreshToken": "r1" })));
                MockReply::ok(json!({ "code": 200, "data": { "accessToken": "current", "refreshToken": "r2" } }))
            }
            _ if token.as_deref() != Some("current") => MockReply::unauthorized(),
            "/ai/chat/stream" => MockReply::stream([
                "data: {\"content\":\"fine\"}\n\ndata: {\"content\":\", thanks\"}\n",
                "data: [DONE]\n",
            ]),
            "/ai/chat/file" => MockReply::ok(json!({
                "code": 200,
                "data": { "id": 99, "role": "assistant", "type": "file", "content": "summary", "fileName": "a.txt" }
            })),
            other => MockReply::status(404, json!({ "message": format!("no route {other}") })),
        }
    })
}

#[test]
fn login_then_stream_survives_an_expired_token() {
    let runtime = test_runtime();
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("credentials.json");

    runtime.block_on(async {
        let transport = Arc::new(rotating_backend());
        let credentials = CredentialStore::open(&path).expect("store");
        let api = ChatApi::new(RefreshCoordinator::with_endpoint_refresh(
            transport.clone(),
            credentials,
        ));
        let user = api.login("ada@example.com", "pw").await.expect("login");
        assert_eq!(user["nickname"], "ada");

        let session = ChatSession::new(api.clone(), Some("c1".into()));
        let receipt = session.send_text("how are you?", "deepseek-chat").await.expect("send");
        let Some(SendReceipt::Streaming { mut updates, message_id }) = receipt else {
            panic!("expected a streaming receipt");
        };
        while let Some(event) = updates.recv().await {
            if matches!(event, StreamEvent::Done) {
                break;
            }
        }

        let reply = session
            .messages()
            .into_iter()
            .find(|m| m.id == message_id)
            .expect("reply");
        assert_eq!(reply.content, "fine, thanks");
        assert_eq!(session.phase(), Phase::Idle);
        assert_eq!(transport.calls_to("/auth/refresh"), 1);
        assert_eq!(transport.calls_to("/ai/chat/stream"), 2);
    });

    let reopened = CredentialStore::open(&path).expect("reopen");
    assert_eq!(reopened.credential().expect("credential").access_token, "current");
    assert_eq!(reopened.refresh_token().as_deref(), Some("r2"));
}

#[test]
fn upload_appends_the_returned_message() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let transport = Arc::new(rotating_backend());
        let credentials = CredentialStore::in_memory();
        let api = ChatApi::new(RefreshCoordinator::with_endpoint_refresh(transport, credentials));
        api.login("ada@example.com", "pw").await.expect("login");

        let session = ChatSession::new(api, Some("c7".into()));
        let upload = FileUpload {
            file_name: "a.txt".into(),
            bytes: Bytes::from_static(b"hello"),
            mime: None,
        };
        let message = session.send_file(&upload).await.expect("upload");
        assert_eq!(message.kind, MessageKind::File);
        assert_eq!(message.conversation_id, "c7");
        assert_eq!(message.file_name.as_deref(), Some("a.txt"));
        assert_eq!(session.messages().len(), 1);
    });
}

#[test]
fn logout_forgets_the_persisted_session() {
    let runtime = test_runtime();
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("nested").join("credentials.json");

    runtime.block_on(async {
        let credentials = CredentialStore::open(&path).expect("store");
        let api = ChatApi::new(RefreshCoordinator::with_endpoint_refresh(
            Arc::new(rotating_backend()),
            credentials,
        ));
        api.login("ada@example.com", "pw").await.expect("login");
        api.logout();
    });

    let reopened = CredentialStore::open(&path).expect("reopen");
    assert!(reopened.credential().is_none());
    assert!(reopened.refresh_token().is_none());
}
