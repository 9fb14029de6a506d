//! Integration tests for Livepull Core

use bytes::Bytes;
use livepull_core::{
    client::ClientAction,
    transport::OutboundFrame,
    BufferController, BufferSink, BufferState, ClientConfig, CloseError, ConnectionState,
    ControlMessage, Error, Fragment, MemoryConnector, MessageKind, PlaybackElement,
    ProtocolClient, PullSession, RemuxEngine, RemuxEvent, RemuxOutput, RemuxQueue, Result,
    SessionEvent, SessionEventKind, MediaEvent,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};
use url::Url;

// =============================================================================
// Helpers
// =============================================================================

fn mp4box(tag: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(tag);
    out.extend_from_slice(payload);
    out
}

fn full_box(tag: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut payload = vec![0u8; 4];
    payload.extend_from_slice(body);
    mp4box(tag, &payload)
}

fn trak(track_id: u32, timescale: u32, handler: &[u8; 4], entry: Vec<u8>) -> Vec<u8> {
    let tkhd = [&[0u8; 8][..], &track_id.to_be_bytes(), &[0u8; 8]].concat();
    let mdhd = [&[0u8; 8][..], &timescale.to_be_bytes(), &[0u8; 4]].concat();
    let hdlr = [&[0u8; 4][..], handler, &[0u8; 13]].concat();
    let stsd = [&1u32.to_be_bytes()[..], &entry].concat();

    let minf = mp4box(b"minf", &mp4box(b"stbl", &full_box(b"stsd", &stsd)));
    let mdia = mp4box(
        b"mdia",
        &[full_box(b"mdhd", &mdhd), full_box(b"hdlr", &hdlr), minf].concat(),
    );
    mp4box(b"trak", &[full_box(b"tkhd", &tkhd), mdia].concat())
}

/// H.264 High 3.1 video only
fn avc_init_segment() -> Vec<u8> {
    let avcc = mp4box(b"avcC", &[1, 0x64, 0x00, 0x1f, 0xff, 0xe1]);
    let entry = mp4box(b"avc1", &[vec![0u8; 78], avcc].concat());
    [
        mp4box(b"ftyp", b"isom\0\0\x02\0"),
        mp4box(b"moov", &trak(1, 90_000, b"vide", entry)),
    ]
    .concat()
}

/// Engine that wraps every fragment in a fake `moof` and answers on flush
struct EchoEngine {
    init: Bytes,
    sent_init: bool,
    pending: Vec<u8>,
    pushes: usize,
}

impl EchoEngine {
    fn new(init: Vec<u8>) -> Self {
        Self {
            init: Bytes::from(init),
            sent_init: false,
            pending: Vec::new(),
            pushes: 0,
        }
    }
}

impl RemuxEngine for EchoEngine {
    fn push(&mut self, data: &[u8]) -> Result<()> {
        self.pushes += 1;
        self.pending = [b"moof:".as_slice(), data].concat();
        Ok(())
    }

    fn flush(&mut self) -> Result<Option<RemuxOutput>> {
        let init_segment = (!self.sent_init).then(|| self.init.clone());
        self.sent_init = true;
        Ok(Some(RemuxOutput {
            init_segment,
            data: Bytes::from(std::mem::take(&mut self.pending)),
        }))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SinkCall {
    AddSourceBuffer(String),
    Append(Bytes),
    Remove(f64, f64),
    EndOfStream,
}

/// Sink that reports every call on a channel
struct ChannelSink {
    calls: mpsc::UnboundedSender<SinkCall>,
}

impl ChannelSink {
    fn new() -> (Self, mpsc::UnboundedReceiver<SinkCall>) {
        let (calls, rx) = mpsc::unbounded_channel();
        (Self { calls }, rx)
    }

    fn record(&self, call: SinkCall) -> Result<()> {
        self.calls
            .send(call)
            .map_err(|_| Error::Sink("observer gone".into()))
    }
}

impl BufferSink for ChannelSink {
    fn add_source_buffer(&mut self, mime_type: &str) -> Result<()> {
        self.record(SinkCall::AddSourceBuffer(mime_type.to_string()))
    }

    fn append_buffer(&mut self, data: Bytes) -> Result<()> {
        self.record(SinkCall::Append(data))
    }

    fn remove(&mut self, start: f64, end: f64) -> Result<()> {
        self.record(SinkCall::Remove(start, end))
    }

    fn end_of_stream(&mut self) -> Result<()> {
        self.record(SinkCall::EndOfStream)
    }

    fn buffered(&self) -> Vec<(f64, f64)> {
        vec![(0.0, 4.0)]
    }
}

/// Playback element that reports seeks on a channel
struct ChannelElement {
    current_time: f64,
    duration: f64,
    seeks: mpsc::UnboundedSender<f64>,
}

impl PlaybackElement for ChannelElement {
    fn current_time(&self) -> f64 {
        self.current_time
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn paused(&self) -> bool {
        false
    }

    fn set_current_time(&mut self, time: f64) {
        self.current_time = time;
        let _ = self.seeks.send(time);
    }
}

fn config() -> ClientConfig {
    ClientConfig::new(Url::parse("ws://cdn.local/ws").unwrap(), "live-1", "secret")
}

fn collect_events(session: &PullSession) -> mpsc::UnboundedReceiver<SessionEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    for kind in [SessionEventKind::Error, SessionEventKind::Close, SessionEventKind::Ended] {
        let tx = tx.clone();
        session.on(kind, move |event| {
            tx.send(event.clone())?;
            Ok(())
        });
    }
    rx
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting")
        .expect("channel closed")
}

// =============================================================================
// Message Codec Tests
// =============================================================================

#[test]
fn test_pull_message_wire_form() {
    let msg = ControlMessage::new("pull")
        .with_param("stream", "live 1")
        .with_param("auth", "a+b/c")
        .with_param("max_initial_fragments", "4");
    let raw = msg.serialize();
    assert_eq!(raw, "PULL:auth=a%2Bb%2Fc&max_initial_fragments=4&stream=live%201");
    assert_eq!(ControlMessage::parse(&raw), msg);
}

#[test]
fn test_server_messages() {
    assert_eq!(ControlMessage::parse("OK").kind(), MessageKind::Ok);
    assert_eq!(ControlMessage::parse("CLOSE").kind(), MessageKind::Close);
    assert_eq!(ControlMessage::parse("WHATEVER:x=1").kind(), MessageKind::Other);

    let msg = ControlMessage::parse("F:duration=4.004");
    assert_eq!(msg.kind(), MessageKind::Fragment);
    assert_eq!(msg.param("duration"), Some("4.004"));
}

// =============================================================================
// Config Tests
// =============================================================================

#[test]
fn test_config_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pull.json");
    std::fs::write(
        &path,
        r#"{
            "server_url": "wss://cdn.example.com/ws",
            "stream_id": "news",
            "auth_token": "t0k3n",
            "delay": 8,
            "max_delay": 12,
            "max_initial_fragments": 6
        }"#,
    )
    .unwrap();

    let config = assert_ok!(ClientConfig::from_file(&path));
    assert_eq!(config.max_delay(), 12.0);
    assert_eq!(config.max_buffer_duration(), 24.0);
    assert_eq!(config.max_initial_fragments, Some(6));
}

#[test]
fn test_config_rejects_http_scheme() {
    let result = ClientConfig::from_json_str(
        r#"{"server_url": "http://cdn.example.com/", "stream_id": "s", "auth_token": "t"}"#,
    );
    assert!(matches!(assert_err!(result), Error::InvalidConfig(_)));
}

// =============================================================================
// Init Segment Tests
// =============================================================================

#[test]
fn test_init_segment_codecs() {
    let init = livepull_core::parse_init_segment(&avc_init_segment()).unwrap();
    assert!(init.audio.is_none());
    assert_eq!(init.video.as_ref().map(|t| t.codec.as_str()), Some("avc1.64001F"));
    assert_eq!(init.codecs().mime_type(), "video/mp4; codecs=\"avc1.64001F\"");
}

#[test]
fn test_box_walk() {
    let data = avc_init_segment();
    let types: Vec<String> = livepull_core::iter_boxes(&data)
        .map(|b| b.type_str())
        .collect();
    assert_eq!(types, vec!["ftyp", "moov"]);
    assert_eq!(livepull_core::find_box(&data, &[b"moov", b"trak", b"mdia"]).len(), 1);
}

// =============================================================================
// Pipeline Tests
// =============================================================================

/// Client, remux queue and buffer controller wired by hand
#[test]
fn test_pipeline_without_runtime() {
    let t0 = Instant::now();
    let config = config();
    let mut client = ProtocolClient::new(&config);
    let mut remux = RemuxQueue::new(EchoEngine::new(avc_init_segment()), 8);
    let (sink, mut calls) = ChannelSink::new();
    let mut media = BufferController::new(sink, &config);
    media.on_sink_open();

    client.start(t0);
    let Some(ClientAction::Connect { socket, .. }) = client.poll_action() else {
        panic!("expected connect");
    };
    client.handle_open(socket, t0);
    client.handle_text(socket, t0, "F:duration=2");
    client.handle_binary(socket, t0, Bytes::from_static(b"ts-1"));
    client.handle_text(socket, t0, "F:duration=3");
    client.handle_binary(socket, t0, Bytes::from_static(b"ts-2"));

    while let Some(action) = client.poll_action() {
        if let ClientAction::Fragment(fragment) = action {
            remux.add_fragment(fragment).unwrap();
        }
    }
    while let Some(event) = remux.poll_event() {
        if let RemuxEvent::Segment(segment) = event {
            media.add_segment(segment).unwrap();
        }
    }

    assert_eq!(
        calls.try_recv().unwrap(),
        SinkCall::AddSourceBuffer("video/mp4; codecs=\"avc1.64001F\"".into())
    );
    let first = [avc_init_segment(), b"moof:ts-1".to_vec()].concat();
    assert_eq!(calls.try_recv().unwrap(), SinkCall::Append(Bytes::from(first)));
    assert!(calls.try_recv().is_err());
    assert_eq!(media.state(), BufferState::Appending);

    media.on_update_end();
    assert_eq!(
        calls.try_recv().unwrap(),
        SinkCall::Append(Bytes::from_static(b"moof:ts-2"))
    );
    media.on_update_end();
    assert_eq!(media.buffered_duration(), 5.0);
    assert_eq!(remux.engine().pushes, 2);
}

#[test]
fn test_backpressure_never_exceeds_capacity() {
    struct Stalled;
    impl RemuxEngine for Stalled {
        fn push(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        fn flush(&mut self) -> Result<Option<RemuxOutput>> {
            Ok(None)
        }
    }

    let mut remux = RemuxQueue::new(Stalled, 4);
    for i in 0..100 {
        assert_ok!(remux.add_fragment(Fragment::new(1.0, vec![i as u8])));
        assert!(remux.len() <= 4);
    }
    assert_eq!(remux.dropped_count(), 100 - 1 - 4);
}

#[test]
fn test_media_end_after_remux_end() {
    let config = config();
    let mut remux = RemuxQueue::new(EchoEngine::new(avc_init_segment()), 8);
    let (sink, _calls) = ChannelSink::new();
    let mut media = BufferController::new(sink, &config);

    remux.end();
    assert!(matches!(remux.poll_event(), Some(RemuxEvent::Ended)));
    media.end();
    assert!(matches!(media.poll_event(), Some(MediaEvent::Ended)));
    assert_eq!(media.state(), BufferState::Ended);
}

// =============================================================================
// Session Tests
// =============================================================================

#[tokio::test]
async fn test_session_end_to_end() {
    let (connector, mut server) = MemoryConnector::new();
    let (sink, mut calls) = ChannelSink::new();
    let mut session = PullSession::new(
        config().with_max_initial_fragments(2),
        Arc::new(connector),
        Box::new(EchoEngine::new(avc_init_segment())),
        Box::new(sink),
    )
    .unwrap();
    let mut events = collect_events(&session);
    let notifier = session.notifier();

    session.start();
    notifier.sink_open();

    let mut socket = server.accept().await.unwrap();
    assert_eq!(socket.url.as_str(), "ws://cdn.local/ws");
    socket.open();

    let OutboundFrame::Text(pull) = socket.recv().await.unwrap() else {
        panic!("expected pull request");
    };
    let pull = ControlMessage::parse(&pull);
    assert_eq!(pull.kind(), MessageKind::Pull);
    assert_eq!(pull.param("stream"), Some("live-1"));
    assert_eq!(pull.param("max_initial_fragments"), Some("2"));

    socket.send_text("OK");
    socket.send_text("F:duration=2");
    socket.send_binary(&b"ts-1"[..]);

    assert_eq!(
        next(&mut calls).await,
        SinkCall::AddSourceBuffer("video/mp4; codecs=\"avc1.64001F\"".into())
    );
    let first = [avc_init_segment(), b"moof:ts-1".to_vec()].concat();
    assert_eq!(next(&mut calls).await, SinkCall::Append(Bytes::from(first)));
    notifier.update_end();

    socket.send_text("CLOSE");
    assert_eq!(next(&mut events).await, SessionEvent::Close { error: None });
    assert_eq!(next(&mut calls).await, SinkCall::EndOfStream);
    assert_eq!(next(&mut events).await, SessionEvent::Ended);
    assert_eq!(socket.recv().await, Some(OutboundFrame::Close));

    assert_eq!(session.state(), ConnectionState::Closed(None));
    session.destroy().await;
}

#[tokio::test]
async fn test_session_auth_error() {
    let (connector, mut server) = MemoryConnector::new();
    let (sink, _calls) = ChannelSink::new();
    let mut session = PullSession::new(
        config(),
        Arc::new(connector),
        Box::new(EchoEngine::new(avc_init_segment())),
        Box::new(sink),
    )
    .unwrap();
    let mut events = collect_events(&session);
    let mut state = session.subscribe_state();
    session.start();

    let socket = server.accept().await.unwrap();
    socket.open();
    socket.send_text("E:code=AUTH_ERROR&message=Invalid+auth+token");

    let SessionEvent::Error { code, .. } = next(&mut events).await else {
        panic!("expected error event");
    };
    assert_eq!(code, "AUTH_REJECTED");
    assert_eq!(
        next(&mut events).await,
        SessionEvent::Close {
            error: Some(CloseError::Auth)
        }
    );
    state
        .wait_for(|s| *s == ConnectionState::Closed(Some(CloseError::Auth)))
        .await
        .unwrap();

    session.destroy().await;
}

#[tokio::test]
async fn test_session_startup_timeout() {
    let (connector, mut server) = MemoryConnector::new();
    let (sink, _calls) = ChannelSink::new();
    let mut session = PullSession::new(
        config().with_timeout_ms(50),
        Arc::new(connector),
        Box::new(EchoEngine::new(avc_init_segment())),
        Box::new(sink),
    )
    .unwrap();
    let mut events = collect_events(&session);
    session.start();

    let socket = server.accept().await.unwrap();
    socket.open();

    let SessionEvent::Error { code, .. } = next(&mut events).await else {
        panic!("expected error event");
    };
    assert_eq!(code, "STARTUP_TIMEOUT");
    assert_eq!(
        next(&mut events).await,
        SessionEvent::Close {
            error: Some(CloseError::Timeout)
        }
    );
    // Nothing was buffered, so the session ends right away
    assert_eq!(next(&mut events).await, SessionEvent::Ended);

    session.destroy().await;
}

#[tokio::test]
async fn test_session_reconnects_after_socket_loss() {
    let (connector, mut server) = MemoryConnector::new();
    let (sink, _calls) = ChannelSink::new();
    let mut session = PullSession::new(
        config().with_reconnect_delay_ms(10),
        Arc::new(connector),
        Box::new(EchoEngine::new(avc_init_segment())),
        Box::new(sink),
    )
    .unwrap();
    session.start();

    let first = server.accept().await.unwrap();
    first.open();
    first.close();

    let mut second = tokio::time::timeout(Duration::from_secs(5), server.accept())
        .await
        .unwrap()
        .unwrap();
    second.open();
    let OutboundFrame::Text(pull) = second.recv().await.unwrap() else {
        panic!("expected pull request");
    };
    assert!(pull.starts_with("PULL:"));

    session.destroy().await;
    assert_eq!(second.recv().await, Some(OutboundFrame::Close));
}

#[tokio::test]
async fn test_session_delay_steering() {
    let (connector, _server) = MemoryConnector::new();
    let (sink, _calls) = ChannelSink::new();
    let mut session = PullSession::new(
        config(),
        Arc::new(connector),
        Box::new(EchoEngine::new(avc_init_segment())),
        Box::new(sink),
    )
    .unwrap();
    let (seeks_tx, mut seeks) = mpsc::unbounded_channel();

    session.attach_media(ChannelElement {
        current_time: 50.0,
        duration: 120.0,
        seeks: seeks_tx,
    });
    session.set_delay_options(10.0, Some(20.0));
    session.start();
    session.notifier().time_update();

    assert_eq!(next(&mut seeks).await, 110.0);
    session.destroy().await;
}

#[tokio::test]
async fn test_destroy_silences_observers() {
    let (connector, mut server) = MemoryConnector::new();
    let (sink, _calls) = ChannelSink::new();
    let mut session = PullSession::new(
        config(),
        Arc::new(connector),
        Box::new(EchoEngine::new(avc_init_segment())),
        Box::new(sink),
    )
    .unwrap();
    let mut events = collect_events(&session);
    session.start();
    let _socket = server.accept().await.unwrap();

    session.destroy().await;
    session.destroy().await;
    // Handlers were dropped with the bus, so the channel is closed and empty
    assert!(events.recv().await.is_none());
}
