use bytes::Bytes;
use chatline_core::stream::{CancelHandle, StreamConsumer, StreamEvent};
use chatline_core::transport::ByteStream;
use chatline_core::Error;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;

use super::test_runtime;

#[derive(Debug, PartialEq)]
enum Seen {
    Delta(String),
    Done,
    Error,
}

fn body(chunks: &[&'static [u8]]) -> ByteStream {
    let chunks: Vec<_> = chunks
        .iter()
        .map(|chunk| Ok::<Bytes, Error>(Bytes::from_static(*chunk)))
        .collect();
    stream::iter(chunks).boxed()
}

fn open(body: ByteStream) -> (CancelHandle, mpsc::UnboundedReceiver<Seen>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = StreamConsumer::open(body, move |event| {
        let _ = tx.send(match event {
            StreamEvent::Delta(text) => Seen::Delta(text),
            StreamEvent::Done => Seen::Done,
            StreamEvent::Error(_) => Seen::Error,
        });
    });
    (handle, rx)
}

async fn drain(mut rx: mpsc::UnboundedReceiver<Seen>) -> Vec<Seen> {
    let mut seen = Vec::new();
    while let Some(event) = rx.recv().await {
        seen.push(event);
    }
    seen
}

#[test]
fn deltas_arrive_in_order_and_done_ends_the_stream() {
    let runtime = test_runtime();
    let seen = runtime.block_on(async {
        let (_handle, rx) = open(body(&[
            b"data: {\"content\":\"He\"}\n",
            b"data: {\"content\":\"llo\"}\n",
            b"data: [DONE]\n",
            b"data: {\"content\":\"ignored\"}\n",
        ]));
        drain(rx).await
    });
    assert_eq!(
        seen,
        vec![Seen::Delta("He".into()), Seen::Delta("llo".into()), Seen::Done]
    );
}

#[test]
fn malformed_frame_between_valid_ones_is_skipped() {
    let runtime = test_runtime();
    let seen = runtime.block_on(async {
        let (_handle, rx) = open(body(&[
            b"data: {\"content\":\"a\"}\n",
            b"data: not-json\n",
            b"data: {\"content\":\"b\"}\n",
            b"data: [DONE]\n",
        ]));
        drain(rx).await
    });
    assert_eq!(
        seen,
        vec![Seen::Delta("a".into()), Seen::Delta("b".into()), Seen::Done]
    );
}

#[test]
fn three_byte_character_split_one_plus_two() {
    let runtime = test_runtime();
    let seen = runtime.block_on(async {
        // U+20AC is E2 82 AC.
        let (_handle, rx) = open(body(&[
            b"data: {\"content\":\"\xE2",
            b"\x82\xAC\"}\n",
            b"data: [DONE]\n",
        ]));
        drain(rx).await
    });
    assert_eq!(seen, vec![Seen::Delta("\u{20AC}".into()), Seen::Done]);
}

#[test]
fn cancel_after_first_delta_silences_the_consumer() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let first: ByteStream = stream::iter(vec![Ok::<Bytes, Error>(Bytes::from_static(
            b"data: {\"content\":\"partial\"}\n",
        ))])
        .chain(stream::pending())
        .boxed();
        let (handle, mut rx) = open(first);

        assert_eq!(rx.recv().await, Some(Seen::Delta("partial".into())));
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
        assert_eq!(rx.recv().await, None);
    });
}

#[test]
fn transport_error_is_reported_once() {
    let runtime = test_runtime();
    let seen = runtime.block_on(async {
        let failing: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"data: {\"content\":\"x\"}\n")),
            Err(Error::StreamTransport("reset".into())),
            Ok(Bytes::from_static(b"data: {\"content\":\"y\"}\n")),
        ])
        .boxed();
        let (_handle, rx) = open(failing);
        drain(rx).await
    });
    assert_eq!(seen, vec![Seen::Delta("x".into()), Seen::Error]);
}
