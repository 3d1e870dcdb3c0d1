//! Event model and stream combinators for update runs.
//!
//! Every long-running operation in the engine reports through a per-source
//! event stream: a bounded channel whose sender side belongs to the
//! producing task. Intermediate typed results travel as VALUE events;
//! combinators drain them out of streams while forwarding everything else
//! to the run-wide queue. Cancellation is a channel close.
//!
//! # Example
//!
//! ```
//! use flakeup_events::{EventStream, UpdateEvent, EventPayload};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let stream = EventStream::spawn(|events| async move {
//!     events.status("demo", "working").await;
//!     events.value("demo", EventPayload::Text("done".into())).await;
//!     Ok(())
//! });
//!
//! let (sink, mut seen) = flakeup_events::channel();
//! let value = stream.capture_value(&sink, "missing demo output").await.unwrap();
//! assert_eq!(value.into_text().unwrap(), "done");
//! assert_eq!(seen.recv().await.unwrap().message.unwrap(), "working");
//! # });
//! ```

use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use flakeup_types::{HashCollection, SourceEntry, UpdateError};

mod event;

pub use event::{CommandOutcome, EventKind, EventPayload, StreamLabel, UpdateEvent};

/// Events buffered per stream before the producer backpressures.
const CHANNEL_CAPACITY: usize = 64;

/// Sending half of an event stream.
///
/// Sends never fail: a closed channel means the consumer has gone away
/// (cancellation), and the producer simply stops being heard.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<UpdateEvent>,
}

impl EventSender {
    pub async fn send(&self, event: UpdateEvent) {
        let _ = self.tx.send(event).await;
    }

    pub async fn status(&self, source: &str, message: impl Into<String>) {
        self.send(UpdateEvent::status(source, message)).await;
    }

    pub async fn error(&self, source: &str, message: impl Into<String>) {
        self.send(UpdateEvent::error(source, message)).await;
    }

    pub async fn value(&self, source: &str, payload: EventPayload) {
        self.send(UpdateEvent::value(source, payload)).await;
    }

    pub async fn result(&self, source: &str, payload: Option<EventPayload>) {
        self.send(UpdateEvent::result(source, payload)).await;
    }
}

/// Create a detached event channel, e.g. the run-wide queue.
pub fn channel() -> (EventSender, mpsc::Receiver<UpdateEvent>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    (EventSender { tx }, rx)
}

/// A producing task plus the receiving half of its event channel.
pub struct EventStream {
    rx: mpsc::Receiver<UpdateEvent>,
    task: JoinHandle<Result<(), UpdateError>>,
}

impl EventStream {
    /// Spawn a producer. The future writes events through the given
    /// [`EventSender`]; its `Err` propagates to whichever combinator
    /// consumes the stream.
    pub fn spawn<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(EventSender) -> Fut,
        Fut: Future<Output = Result<(), UpdateError>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(producer(EventSender { tx }));
        Self { rx, task }
    }

    /// Receive the next event, or `None` once the producer is done.
    pub async fn next(&mut self) -> Option<UpdateEvent> {
        self.rx.recv().await
    }

    /// Forward every event into `out`, then propagate the producer's result.
    pub async fn forward(mut self, out: &EventSender) -> Result<(), UpdateError> {
        while let Some(event) = self.rx.recv().await {
            out.send(event).await;
        }
        join_producer(self.task).await
    }

    /// Forward non-VALUE events into `out` and return the last VALUE
    /// payload, if any.
    pub async fn drain_value(mut self, out: &EventSender) -> Result<Option<EventPayload>, UpdateError> {
        let mut captured = None;
        while let Some(event) = self.rx.recv().await {
            if event.kind == EventKind::Value {
                captured = event.payload;
            } else {
                out.send(event).await;
            }
        }
        join_producer(self.task).await?;
        Ok(captured)
    }

    /// Like [`EventStream::drain_value`] but a missing VALUE is an error.
    pub async fn capture_value(
        self,
        out: &EventSender,
        missing: &str,
    ) -> Result<EventPayload, UpdateError> {
        self.drain_value(out)
            .await?
            .ok_or_else(|| UpdateError::message(missing))
    }

    /// Abort the producing task. The stream then yields no further events.
    pub fn abort(&self) {
        self.task.abort();
    }
}

async fn join_producer(task: JoinHandle<Result<(), UpdateError>>) -> Result<(), UpdateError> {
    match task.await {
        Ok(result) => result,
        Err(join) if join.is_cancelled() => Err(UpdateError::Cancelled),
        Err(join) => Err(UpdateError::message(format!("producer panicked: {join}"))),
    }
}

/// Run named producing streams concurrently: forward non-VALUE events as
/// they arrive, collect each stream's VALUE keyed by its name, and return
/// the collected map once every stream finishes. The first failure
/// propagates after all streams settle.
pub async fn gather_event_streams(
    streams: Vec<(String, EventStream)>,
    out: &EventSender,
) -> Result<BTreeMap<String, EventPayload>, UpdateError> {
    let mut tasks: JoinSet<(String, Result<Option<EventPayload>, UpdateError>)> = JoinSet::new();
    for (name, stream) in streams {
        let out = out.clone();
        tasks.spawn(async move {
            let outcome = stream.drain_value(&out).await;
            (name, outcome)
        });
    }

    let mut values = BTreeMap::new();
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(Some(payload)))) => {
                values.insert(name, payload);
            }
            Ok((_, Ok(None))) => {}
            Ok((_, Err(err))) => {
                first_error.get_or_insert(err);
            }
            Err(join) => {
                first_error.get_or_insert_with(|| {
                    if join.is_cancelled() {
                        UpdateError::Cancelled
                    } else {
                        UpdateError::message(format!("gather task panicked: {join}"))
                    }
                });
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(values),
    }
}

/// Run a per-source task, translating failure into a terminal ERROR event
/// so one source can never abort the others.
pub async fn run_source_task<Fut>(source: &str, out: &EventSender, task: Fut)
where
    Fut: Future<Output = Result<(), UpdateError>>,
{
    if let Err(err) = task.await {
        out.error(source, err.to_string()).await;
    }
}

// Re-exported so downstream crates build payloads without importing types.
pub use flakeup_types::SourceHashes;

impl EventPayload {
    pub fn into_text(self) -> Result<String, UpdateError> {
        match self {
            EventPayload::Text(text) => Ok(text),
            other => Err(UpdateError::message(format!(
                "expected text payload, got {}",
                other.kind_name()
            ))),
        }
    }

    pub fn into_map(self) -> Result<BTreeMap<String, String>, UpdateError> {
        match self {
            EventPayload::Map(map) => Ok(map),
            other => Err(UpdateError::message(format!(
                "expected map payload, got {}",
                other.kind_name()
            ))),
        }
    }

    pub fn into_hashes(self) -> Result<HashCollection, UpdateError> {
        match self {
            EventPayload::Hashes(hashes) => Ok(hashes),
            EventPayload::Map(map) => Ok(HashCollection::Mapping(map)),
            other => Err(UpdateError::message(format!(
                "expected hash payload, got {}",
                other.kind_name()
            ))),
        }
    }

    pub fn into_entry(self) -> Result<SourceEntry, UpdateError> {
        match self {
            EventPayload::Entry(entry) => Ok(entry),
            other => Err(UpdateError::message(format!(
                "expected source entry payload, got {}",
                other.kind_name()
            ))),
        }
    }

    pub fn into_command(self) -> Result<CommandOutcome, UpdateError> {
        match self {
            EventPayload::Command(outcome) => Ok(outcome),
            other => Err(UpdateError::message(format!(
                "expected command payload, got {}",
                other.kind_name()
            ))),
        }
    }
}
