//! Event fan-out and shutdown coordination.
//!
//! All inbound events enter through one ingress queue. A single dispatcher
//! thread drains it and forwards each event, in arrival order, to every
//! component subscribed to that event kind, so all subscribers observe the
//! same order. Each component runs its own receive loop on a bounded inbox and
//! may fall behind the others.
//!
//! Inboxes are bounded: when one is full the dispatcher blocks until that
//! component catches up, which in turn holds back ingestion. With a capacity of
//! 0 every hand-off is a rendezvous.
//!
//! The shutdown marker travels through the same ingress, so every event
//! accepted before it is handled before any component flushes. Once the
//! marker is queued the ingress is closed and later publishes are refused.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use histd_protocol::{CollectFragment, SessionInit};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const DELIVERY_RETRY: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Record(CollectFragment),
    SessionInit(SessionInit),
    SessionDrop(String),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Record,
    SessionInit,
    SessionDrop,
}

impl PipelineEvent {
    /// `None` for the shutdown marker, which goes to every component.
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            PipelineEvent::Record(_) => Some(EventKind::Record),
            PipelineEvent::SessionInit(_) => Some(EventKind::SessionInit),
            PipelineEvent::SessionDrop(_) => Some(EventKind::SessionDrop),
            PipelineEvent::Shutdown => None,
        }
    }
}

/// A pipeline stage with its own receive loop.
pub trait Component: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn interests(&self) -> &'static [EventKind];

    fn handle(&self, event: PipelineEvent);

    /// Final flush before the shutdown acknowledgement is sent.
    fn shutdown(&self) {}
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Daemon is shutting down")]
    ShuttingDown,

    #[error("Dispatcher is not running")]
    Stopped,
}

impl PublishError {
    pub fn code(&self) -> &'static str {
        match self {
            PublishError::ShuttingDown => "shutting_down",
            PublishError::Stopped => "dispatcher_unavailable",
        }
    }
}

/// Ingress sender plus the closed flag. Publishers hold the read lock while
/// sending; shutdown takes the write lock to close and queue the marker, so
/// nothing can be accepted behind the marker.
struct Gate {
    closed: bool,
    ingress: Sender<PipelineEvent>,
}

/// Handle used by producers (connection threads, session pollers) to submit
/// events to the dispatcher.
#[derive(Clone)]
pub struct Publisher {
    gate: Arc<RwLock<Gate>>,
}

impl Publisher {
    pub fn publish(&self, event: PipelineEvent) -> Result<(), PublishError> {
        let gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        if gate.closed {
            return Err(PublishError::ShuttingDown);
        }
        gate.ingress.send(event).map_err(|_| PublishError::Stopped)
    }

    /// Closes the ingress and queues the shutdown marker behind everything
    /// already accepted.
    fn close(&self) -> Result<(), PublishError> {
        let mut gate = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        if gate.closed {
            return Err(PublishError::ShuttingDown);
        }
        gate.closed = true;
        gate.ingress
            .send(PipelineEvent::Shutdown)
            .map_err(|_| PublishError::Stopped)
    }
}

struct Subscriber {
    name: &'static str,
    kinds: &'static [EventKind],
    inbox: SyncSender<PipelineEvent>,
}

pub struct DispatcherBuilder {
    capacity: usize,
    subscribers: Vec<Subscriber>,
    publisher: Publisher,
    ingress_rx: Receiver<PipelineEvent>,
    done_tx: Sender<&'static str>,
    done_rx: Receiver<&'static str>,
}

impl DispatcherBuilder {
    pub fn new(capacity: usize) -> Self {
        let (ingress_tx, ingress_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        Self {
            capacity,
            subscribers: Vec::new(),
            publisher: Publisher {
                gate: Arc::new(RwLock::new(Gate {
                    closed: false,
                    ingress: ingress_tx,
                })),
            },
            ingress_rx,
            done_tx,
            done_rx,
        }
    }

    /// Available before `start` so components can publish (e.g. session drops).
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Spawns the component's receive loop and subscribes it.
    pub fn register(&mut self, component: Arc<dyn Component>) {
        let (inbox, receiver) = mpsc::sync_channel(self.capacity);
        let name = component.name();
        let kinds = component.interests();
        let done = self.done_tx.clone();

        let spawned = thread::Builder::new()
            .name(format!("histd-{}", name))
            .spawn(move || run_component(component, receiver, done));
        if let Err(err) = spawned {
            error!(component = name, error = %err, "Failed to spawn component loop");
            return;
        }

        debug!(component = name, kinds = ?kinds, "Component registered");
        self.subscribers.push(Subscriber { name, kinds, inbox });
    }

    pub fn start(self) -> Result<(Publisher, ShutdownOrchestrator), String> {
        let publisher = self.publisher;
        let components = self
            .subscribers
            .iter()
            .map(|subscriber| subscriber.name)
            .collect();
        let subscribers = self.subscribers;
        let ingress = self.ingress_rx;

        thread::Builder::new()
            .name("histd-dispatch".to_string())
            .spawn(move || run_dispatcher(ingress, subscribers))
            .map_err(|err| format!("Failed to spawn dispatcher: {}", err))?;

        let orchestrator = ShutdownOrchestrator {
            publisher: publisher.clone(),
            components,
            done: self.done_rx,
        };
        Ok((publisher, orchestrator))
    }
}

fn run_component(
    component: Arc<dyn Component>,
    inbox: Receiver<PipelineEvent>,
    done: Sender<&'static str>,
) {
    let name = component.name();
    for event in inbox {
        if matches!(event, PipelineEvent::Shutdown) {
            component.shutdown();
            if done.send(name).is_err() {
                warn!(component = name, "Shutdown acknowledgement not delivered");
            }
            debug!(component = name, "Component stopped");
            return;
        }
        component.handle(event);
    }
    debug!(component = name, "Component inbox closed");
}

fn run_dispatcher(ingress: Receiver<PipelineEvent>, subscribers: Vec<Subscriber>) {
    for event in ingress {
        if matches!(event, PipelineEvent::Shutdown) {
            broadcast_shutdown(&subscribers);
            debug!("Dispatcher stopped");
            return;
        }
        fan_out(&subscribers, event);
    }
    debug!("Dispatcher ingress closed");
}

fn fan_out(subscribers: &[Subscriber], event: PipelineEvent) {
    let Some(kind) = event.kind() else {
        return;
    };

    for subscriber in subscribers
        .iter()
        .filter(|subscriber| subscriber.kinds.contains(&kind))
    {
        if subscriber.inbox.send(event.clone()).is_err() {
            warn!(
                component = subscriber.name,
                kind = ?kind,
                "Component inbox closed; event not delivered"
            );
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub acknowledged: Vec<&'static str>,
    pub outstanding: Vec<&'static str>,
}

pub struct ShutdownOrchestrator {
    publisher: Publisher,
    components: Vec<&'static str>,
    done: Receiver<&'static str>,
}

impl ShutdownOrchestrator {
    /// Asks every component to flush and waits for their acknowledgements
    /// until `timeout` elapses. Components that miss the deadline are
    /// abandoned and reported as outstanding.
    pub fn shutdown(self, timeout: Duration) -> ShutdownReport {
        let deadline = Instant::now() + timeout;
        let mut report = ShutdownReport {
            acknowledged: Vec::new(),
            outstanding: self.components.clone(),
        };

        if let Err(err) = self.publisher.close() {
            warn!(error = %err, "Shutdown marker not queued");
            return report;
        }

        while !report.outstanding.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.done.recv_timeout(remaining) {
                Ok(name) => {
                    if let Some(index) = report.outstanding.iter().position(|n| *n == name) {
                        report.outstanding.remove(index);
                        report.acknowledged.push(name);
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if report.outstanding.is_empty() {
            info!(components = ?report.acknowledged, "All components shut down");
        } else {
            warn!(
                outstanding = ?report.outstanding,
                acknowledged = ?report.acknowledged,
                "Shutdown timed out; abandoning components"
            );
        }
        report
    }
}

/// Delivers the marker to every inbox. A full inbox is retried without
/// holding back delivery to the others; the orchestrator's deadline bounds
/// how long anyone waits on the outcome.
fn broadcast_shutdown(subscribers: &[Subscriber]) {
    let mut pending: Vec<&Subscriber> = subscribers.iter().collect();
    while !pending.is_empty() {
        pending.retain(
            |subscriber| match subscriber.inbox.try_send(PipelineEvent::Shutdown) {
                Ok(()) => false,
                Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Disconnected(_)) => {
                    warn!(component = subscriber.name, "Shutdown marker not delivered");
                    false
                }
            },
        );
        if !pending.is_empty() {
            thread::sleep(DELIVERY_RETRY);
        }
    }
}
