//! Full sessions driven over the in-memory channel transport.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::time::timeout;

use tether_core::supervisor::TaskOutcome;
use tether_core::transport::{ChannelPeer, channel};
use tether_core::{
    CancelReason, Connection, ConnectionHandler, ConnectionOptions, ConnectionRequest, Engine,
    Envelope, Frame, LifecycleError, Pipeline, Result, Session, TaskError, from_fn,
};

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq)]
enum Event {
    Open { connected: bool },
    Message(Option<Value>),
    Error(String),
    Close { closed: bool, connected: bool },
    TaskError(String, String),
}

/// Records every hook call. Behavior switches are set per test.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
    ping_on_open: bool,
    close_on_message: bool,
    fail_on_message: bool,
}

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn task_errors(&self) -> Vec<(String, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::TaskError(id, err) => Some((id, err)),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl ConnectionHandler for Recorder {
    async fn on_open(&self, conn: &Connection) -> Result<()> {
        self.push(Event::Open {
            connected: conn.is_connected(),
        });
        if self.ping_on_open {
            conn.start_ping();
        }
        Ok(())
    }

    async fn on_message(&self, conn: &Connection, data: Option<Value>) -> Result<()> {
        self.push(Event::Message(data.clone()));
        if self.fail_on_message {
            return Err(LifecycleError::handler("handler refused message"));
        }
        if self.close_on_message {
            conn.close().await?;
        } else if let Some(data) = data {
            conn.send(&json!({ "echo": data })).await?;
        }
        Ok(())
    }

    async fn on_close(&self, conn: &Connection) {
        self.push(Event::Close {
            closed: conn.is_closed(),
            connected: conn.is_connected(),
        });
    }

    async fn on_error(&self, _conn: &Connection, error: &LifecycleError) {
        self.push(Event::Error(error.to_string()));
    }

    fn on_task_error(&self, task_id: &str, error: &TaskError) {
        self.push(Event::TaskError(task_id.to_string(), error.to_string()));
    }
}

fn fast_heartbeat(process_cancel_errors: bool) -> ConnectionOptions {
    ConnectionOptions {
        heartbeat_cadence: Duration::from_secs(1),
        poll_interval: Duration::from_millis(100),
        process_cancel_errors,
    }
}

fn open(engine: &Engine, handler: Arc<Recorder>) -> (Session, ChannelPeer) {
    let (peer, source, sink) = channel(32);
    let session = engine.create(ConnectionRequest::new("/ws/test"), source, sink, handler);
    (session, peer)
}

async fn run(mut session: Session) -> (Session, Result<()>) {
    let outcome = timeout(TIMEOUT, session.run())
        .await
        .expect("session did not finish");
    (session, outcome)
}

// ── Scenarios ──

#[tokio::test]
async fn connect_accepts_and_opens() {
    let handler = Arc::new(Recorder::default());
    let (session, mut peer) = open(&Engine::default(), Arc::clone(&handler));
    let conn = session.connection().clone();
    let running = tokio::spawn(run(session));

    assert!(peer.connect().await);
    assert_eq!(peer.next_envelope().await, Some(Envelope::Accept));
    // on_open runs right after the accept envelope is queued.
    timeout(TIMEOUT, async {
        while handler.events().is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert!(conn.is_connected());
    assert_eq!(handler.events(), vec![Event::Open { connected: true }]);

    assert!(peer.disconnect().await);
    let (_session, outcome) = running.await.unwrap();
    outcome.unwrap();
}

#[tokio::test]
async fn message_then_disconnect() {
    let handler = Arc::new(Recorder::default());
    let (session, mut peer) = open(&Engine::default(), Arc::clone(&handler));
    assert!(peer.connect().await);
    assert!(peer.text(r#"{"x":1}"#).await);
    assert!(peer.disconnect().await);

    let (session, outcome) = run(session).await;
    outcome.unwrap();

    assert!(session.connection().is_closed());
    assert!(!session.connection().is_connected());
    assert_eq!(
        handler.events(),
        vec![
            Event::Open { connected: true },
            Event::Message(Some(json!({"x": 1}))),
            Event::Close {
                closed: true,
                connected: false
            },
        ]
    );
    assert_eq!(peer.next_envelope().await, Some(Envelope::Accept));
    assert_eq!(
        peer.next_envelope().await,
        Some(Envelope::Send {
            text: r#"{"echo":{"x":1}}"#.into()
        })
    );
}

#[tokio::test]
async fn empty_text_delivers_none() {
    let handler = Arc::new(Recorder::default());
    let (session, peer) = open(&Engine::default(), Arc::clone(&handler));
    assert!(peer.connect().await);
    assert!(peer.text("").await);
    assert!(peer.push(Frame::Receive { text: None }).await);
    assert!(peer.disconnect().await);

    let (_session, outcome) = run(session).await;
    outcome.unwrap();
    let messages: Vec<_> = handler
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::Message(_)))
        .collect();
    assert_eq!(messages, vec![Event::Message(None), Event::Message(None)]);
}

#[tokio::test]
async fn unknown_frame_is_a_protocol_violation() {
    let handler = Arc::new(Recorder::default());
    let (session, peer) = open(&Engine::default(), Arc::clone(&handler));
    assert!(peer.connect().await);
    assert!(
        peer.push(Frame::Unknown {
            kind: "ping-unknown".into()
        })
        .await
    );
    assert!(peer.text("never processed").await);

    let (session, outcome) = run(session).await;
    let err = outcome.unwrap_err();
    assert_matches!(err, LifecycleError::Protocol { ref kind } if kind == "ping-unknown");

    let events = handler.events();
    assert_eq!(
        events,
        vec![
            Event::Open { connected: true },
            Event::Error("unknown websocket event type: ping-unknown".into()),
            Event::Close {
                closed: true,
                connected: false
            },
        ]
    );
    assert!(session.connection().is_closed());
}

#[tokio::test]
async fn hook_failure_runs_error_then_close() {
    let handler = Arc::new(Recorder {
        fail_on_message: true,
        ..Recorder::default()
    });
    let (session, peer) = open(&Engine::default(), Arc::clone(&handler));
    assert!(peer.connect().await);
    assert!(peer.text("1").await);

    let (_session, outcome) = run(session).await;
    assert_matches!(outcome, Err(LifecycleError::Handler(_)));
    let events = handler.events();
    assert_matches!(events[2], Event::Error(ref msg) if msg.contains("handler refused message"));
    assert_matches!(events[3], Event::Close { closed: true, .. });
    assert_eq!(events.len(), 4);
}

// ── Closure handling ──

#[tokio::test]
async fn close_from_hook_stops_processing() {
    let handler = Arc::new(Recorder {
        close_on_message: true,
        ..Recorder::default()
    });
    let (session, mut peer) = open(&Engine::default(), Arc::clone(&handler));
    assert!(peer.connect().await);
    assert!(peer.text("1").await);
    assert!(peer.text("2").await);

    let (_session, outcome) = run(session).await;
    outcome.unwrap();

    let messages = handler
        .events()
        .iter()
        .filter(|e| matches!(e, Event::Message(_)))
        .count();
    assert_eq!(messages, 1);
    assert_eq!(peer.next_envelope().await, Some(Envelope::Accept));
    assert_eq!(
        peer.next_envelope().await,
        Some(Envelope::Close { code: 1000 })
    );
}

#[tokio::test]
async fn background_close_wakes_idle_loop() {
    let handler = Arc::new(Recorder::default());
    let (session, peer) = open(&Engine::default(), Arc::clone(&handler));
    let conn = session.connection().clone();
    assert!(peer.connect().await);

    conn.start_task(
        "closer",
        {
            let conn = conn.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                conn.close_with(4001).await
            }
        },
        None,
    );

    // The peer never sends a disconnect.
    let (_session, outcome) = run(session).await;
    outcome.unwrap();
    assert!(conn.is_closed());
    assert_matches!(handler.events().last(), Some(Event::Close { .. }));
    drop(peer);
}

#[tokio::test]
async fn send_after_close_is_absorbed() {
    let handler = Arc::new(Recorder::default());
    let (session, mut peer) = open(&Engine::default(), Arc::clone(&handler));
    assert!(peer.connect().await);
    assert!(peer.disconnect().await);
    let (session, outcome) = run(session).await;
    outcome.unwrap();

    peer.close_outbound();
    let conn = session.connection();
    conn.send(&json!({"late": true})).await.unwrap();
    conn.send_ping().await.unwrap();
    conn.close().await.unwrap();
    assert!(conn.is_closed());
}

#[tokio::test]
async fn transport_gone_during_send_ends_loop() {
    let handler = Arc::new(Recorder::default());
    let (session, mut peer) = open(&Engine::default(), Arc::clone(&handler));
    peer.close_outbound();
    assert!(peer.connect().await);
    assert!(peer.text("1").await);

    // accept() finds the transport closed, so the loop exits before the text frame.
    let (session, outcome) = run(session).await;
    outcome.unwrap();
    assert!(session.connection().is_closed());
    assert!(
        !handler
            .events()
            .iter()
            .any(|e| matches!(e, Event::Message(_)))
    );
}

// ── Background tasks ──

#[tokio::test(start_paused = true)]
async fn heartbeat_runs_until_disconnect() {
    let handler = Arc::new(Recorder {
        ping_on_open: true,
        ..Recorder::default()
    });
    let engine = Engine::new(Pipeline::empty(), fast_heartbeat(false));
    let (session, mut peer) = open(&engine, Arc::clone(&handler));
    let conn = session.connection().clone();
    let running = tokio::spawn(run(session));

    assert!(peer.connect().await);
    assert_eq!(peer.next_envelope().await, Some(Envelope::Accept));

    tokio::time::sleep(Duration::from_millis(2_150)).await;
    for _ in 0..2 {
        let envelope = peer.try_next_envelope().expect("ping envelope");
        let Envelope::Send { text } = envelope else {
            panic!("unexpected envelope {envelope:?}");
        };
        assert!(text.starts_with(r#"{"ping":"#));
    }
    assert!(peer.try_next_envelope().is_none());
    assert!(conn.tasks().is_active("ping"));

    assert!(peer.disconnect().await);
    let (_session, outcome) = running.await.unwrap();
    outcome.unwrap();
    assert!(conn.tasks().shutdown(TIMEOUT).await);
    assert!(handler.task_errors().is_empty());
}

#[tokio::test]
async fn teardown_cancellation_observed_once_when_enabled() {
    let handler = Arc::new(Recorder {
        ping_on_open: true,
        ..Recorder::default()
    });
    let engine = Engine::new(Pipeline::empty(), fast_heartbeat(true));
    let (session, peer) = open(&engine, Arc::clone(&handler));
    assert!(peer.connect().await);
    assert!(peer.disconnect().await);

    let (session, outcome) = run(session).await;
    outcome.unwrap();
    assert!(session.connection().tasks().shutdown(TIMEOUT).await);

    assert_eq!(
        handler.task_errors(),
        vec![(
            "ping".to_string(),
            format!("task cancelled ({})", CancelReason::ConnectionClosed)
        )]
    );
}

#[tokio::test]
async fn duplicate_ping_cancellation_observed_when_enabled() {
    let handler = Arc::new(Recorder::default());
    let engine = Engine::new(Pipeline::empty(), fast_heartbeat(true));
    let (session, peer) = open(&engine, Arc::clone(&handler));
    let conn = session.connection().clone();

    conn.start_ping();
    conn.start_ping();
    assert!(peer.connect().await);
    assert!(peer.disconnect().await);
    let (_session, outcome) = run(session).await;
    outcome.unwrap();
    assert!(conn.tasks().shutdown(TIMEOUT).await);

    let errors = handler.task_errors();
    assert_eq!(errors.len(), 2);
    assert!(errors.contains(&(
        "ping".to_string(),
        "task cancelled (task-duplicate-started)".to_string()
    )));
    assert!(errors.contains(&(
        "ping".to_string(),
        "task cancelled (task-websocket-closed)".to_string()
    )));
}

#[tokio::test]
async fn failing_task_does_not_end_connection() {
    let handler = Arc::new(Recorder::default());
    let (session, mut peer) = open(&Engine::default(), Arc::clone(&handler));
    let conn = session.connection().clone();
    let running = tokio::spawn(run(session));

    assert!(peer.connect().await);
    let (tx, rx) = tokio::sync::oneshot::channel();
    conn.start_task(
        "job",
        async { Err::<(), _>("job exploded") },
        Some(Box::new(move |outcome: &TaskOutcome| {
            let _ = tx.send(outcome.is_err());
        })),
    );
    assert!(rx.await.unwrap());

    assert!(peer.text(r#""still here""#).await);
    assert_eq!(peer.next_envelope().await, Some(Envelope::Accept));
    assert_eq!(
        peer.next_envelope().await,
        Some(Envelope::Send {
            text: r#"{"echo":"still here"}"#.into()
        })
    );
    assert!(peer.disconnect().await);
    let (_session, outcome) = running.await.unwrap();
    outcome.unwrap();

    assert_eq!(
        handler.task_errors(),
        vec![("job".to_string(), "task failed: job exploded".to_string())]
    );
}

// ── Middleware ──

#[tokio::test]
async fn rejecting_middleware_never_runs_the_loop() {
    let reject = from_fn(|session, _next| {
        let path = session.request().path().to_string();
        async move { Err(LifecycleError::rejected(format!("no access to {path}"))) }.boxed()
    });
    let engine = Engine::new(Pipeline::new(vec![reject]), ConnectionOptions::default());
    let handler = Arc::new(Recorder::default());
    let (session, mut peer) = open(&engine, Arc::clone(&handler));
    assert!(peer.connect().await);

    let (_session, outcome) = run(session).await;
    assert_matches!(outcome, Err(LifecycleError::Rejected(ref reason)) if reason == "no access to /ws/test");
    assert!(handler.events().is_empty());
    assert!(peer.try_next_envelope().is_none());
}

#[tokio::test]
async fn retrying_middleware_sees_finished_session() {
    let attempts = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&attempts);
    let retry = from_fn(move |session, next| {
        let counter = Arc::clone(&counter);
        async move {
            *counter.lock() += 1;
            let first = next.run(session).await;
            if first.is_err() {
                *counter.lock() += 1;
                return next.run(session).await;
            }
            first
        }
        .boxed()
    });
    let engine = Engine::new(Pipeline::new(vec![retry]), ConnectionOptions::default());
    let handler = Arc::new(Recorder::default());
    let (session, peer) = open(&engine, Arc::clone(&handler));
    assert!(peer.connect().await);
    assert!(peer.push(Frame::Unknown { kind: "bad".into() }).await);

    let (session, outcome) = run(session).await;
    assert_matches!(outcome, Err(LifecycleError::Finished));
    assert!(session.is_finished());
    assert_eq!(*attempts.lock(), 2);
    let errors = handler
        .events()
        .iter()
        .filter(|e| matches!(e, Event::Error(_)))
        .count();
    assert_eq!(errors, 1);
    let closes = handler
        .events()
        .iter()
        .filter(|e| matches!(e, Event::Close { .. }))
        .count();
    assert_eq!(closes, 1);
}
