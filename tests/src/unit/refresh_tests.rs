use async_trait::async_trait;
use chatline_core::refresh::{CredentialRefresher, RefreshCoordinator, RefreshState};
use chatline_core::transport::{ApiRequest, MockReply, MockTransport};
use chatline_core::{Credential, CredentialStore, Error, Result};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use super::test_runtime;

/// Hands out `fresh` after the test releases it.
#[derive(Default)]
struct HeldRefresher {
    calls: AtomicUsize,
    release: Notify,
}

#[async_trait]
impl CredentialRefresher for HeldRefresher {
    async fn refresh(&self, _credentials: &CredentialStore) -> Result<Credential> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        Ok(Credential::new("fresh"))
    }
}

/// Refresher that succeeds immediately.
#[derive(Default)]
struct InstantRefresher {
    calls: AtomicUsize,
}

#[async_trait]
impl CredentialRefresher for InstantRefresher {
    async fn refresh(&self, _credentials: &CredentialStore) -> Result<Credential> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Credential::new(format!("fresh-{n}")))
    }
}

fn accepts_fresh() -> MockTransport {
    MockTransport::new(|request, credential| match credential {
        Some(c) if c.access_token == "fresh" => MockReply::ok(json!({ "path": request.path })),
        _ => MockReply::unauthorized(),
    })
}

async fn settle_until(mut done: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if done() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}

#[test]
fn request_failing_during_refresh_joins_the_queue() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let transport = Arc::new(accepts_fresh());
        let credentials = CredentialStore::in_memory();
        credentials.set(Credential::new("stale"));
        let refresher = Arc::new(HeldRefresher::default());
        let coordinator =
            RefreshCoordinator::new(transport.clone(), credentials.clone(), refresher.clone());

        let first = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.send(ApiRequest::get("/first")).await }
        });
        settle_until(|| coordinator.state() == RefreshState::Refreshing).await;

        let second = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.send(ApiRequest::get("/second")).await }
        });
        settle_until(|| coordinator.pending_len() == 2).await;
        refresher.release.notify_one();

        let first = first.await.expect("join").expect("first replayed");
        let second = second.await.expect("join").expect("second replayed");
        assert_eq!(first.json::<serde_json::Value>().unwrap()["path"], "/first");
        assert_eq!(second.json::<serde_json::Value>().unwrap()["path"], "/second");

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.calls_to("/first"), 2);
        assert_eq!(transport.calls_to("/second"), 2);
        assert_eq!(coordinator.state(), RefreshState::Idle);
    });
}

#[test]
fn replays_happen_in_enqueue_order() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let transport = Arc::new(accepts_fresh());
        let credentials = CredentialStore::in_memory();
        credentials.set(Credential::new("stale"));
        let refresher = Arc::new(HeldRefresher::default());
        let coordinator = RefreshCoordinator::new(transport.clone(), credentials, refresher.clone());

        let mut handles = Vec::new();
        for i in 0..4 {
            let coordinator_for_task = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator_for_task
                    .send(ApiRequest::get(format!("/ordered/{i}")))
                    .await
            }));
            settle_until(|| coordinator.pending_len() == i + 1).await;
        }
        refresher.release.notify_one();
        for handle in handles {
            handle.await.expect("join").expect("replayed");
        }

        let replayed: Vec<_> = transport
            .calls()
            .into_iter()
            .filter(|call| call.bearer.as_deref() == Some("fresh"))
            .map(|call| call.path)
            .collect();
        assert_eq!(
            replayed,
            vec!["/ordered/0", "/ordered/1", "/ordered/2", "/ordered/3"]
        );
    });
}

#[test]
fn always_unauthorized_backend_replays_each_request_once() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let transport = Arc::new(MockTransport::new(|_, _| MockReply::unauthorized()));
        let credentials = CredentialStore::in_memory();
        credentials.set(Credential::new("stale"));
        let refresher = Arc::new(InstantRefresher::default());
        let coordinator = RefreshCoordinator::new(transport.clone(), credentials.clone(), refresher);

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.send(ApiRequest::get(format!("/x/{i}"))).await })
            })
            .collect();

        for handle in handles {
            let err = handle.await.expect("join").unwrap_err();
            assert!(matches!(err, Error::SessionExpired));
        }
        for i in 0..3 {
            assert_eq!(transport.calls_to(&format!("/x/{i}")), 2);
        }
    });
}

#[test]
fn streams_recover_from_unauthorized_like_plain_requests() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let transport = Arc::new(MockTransport::new(|_, credential| match credential {
            Some(c) if c.access_token == "fresh" => MockReply::stream(["data: [DONE]\n"]),
            _ => MockReply::unauthorized(),
        }));
        let credentials = CredentialStore::in_memory();
        credentials.set(Credential::new("stale"));
        let refresher = Arc::new(HeldRefresher::default());
        refresher.release.notify_one();
        let coordinator = RefreshCoordinator::new(transport.clone(), credentials, refresher);

        assert!(coordinator.open_stream(ApiRequest::post("/ai/chat/stream")).await.is_ok());
        assert_eq!(transport.calls_to("/ai/chat/stream"), 2);
    });
}
