//! Blocking facade over [`EventBus`]
//!
//! Spawns a thread with its own single-threaded tokio runtime that owns the
//! bus, and exposes a synchronous API to callers outside of async code. Every
//! call is sent to the worker as a command and waits for its reply.

use std::thread::{self, JoinHandle};

use broker_client::FieldTable;
use tokio::sync::{mpsc, oneshot};

use crate::bus::EventBus;
use crate::envelope::EventEnvelope;
use crate::error::BusError;
use crate::provisioner::ProvisionedQueue;

type Reply<T> = oneshot::Sender<Result<T, BusError>>;

/// Commands sent from [`BlockingEventBus`] to the worker thread
#[derive(Debug)]
enum Command {
    Connect { reply: Reply<()> },
    Connected { reply: oneshot::Sender<bool> },
    Publish { event: EventEnvelope, reply: Reply<()> },
    InitializeNamedQueue {
        queue: String,
        bindings: Vec<FieldTable>,
        reply: Reply<ProvisionedQueue>,
    },
    Close { reply: Reply<()> },
    Shutdown,
}

/// Synchronous handle to an event bus running on its own thread.
///
/// Must not be used from inside an async runtime; the calls block.
///
/// # Example
///
/// ```rust,no_run
/// use headerbus::{BlockingEventBus, EventBus, EventEnvelope, InMemoryBroker};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// fn main() -> headerbus::Result<()> {
///     let bus = EventBus::builder()
///         .broker(Arc::new(InMemoryBroker::new()))
///         .build()?;
///     let bus = BlockingEventBus::new(bus);
///
///     bus.connect()?;
///     bus.publish(EventEnvelope::untagged(json!({"ping": true})))?;
///     bus.shutdown();
///     Ok(())
/// }
/// ```
pub struct BlockingEventBus {
    commands: mpsc::UnboundedSender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl BlockingEventBus {
    /// Move `bus` onto a dedicated worker thread.
    pub fn new(bus: EventBus) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let worker = spawn_bus_worker(bus, command_rx);
        Self {
            commands,
            worker: Some(worker),
        }
    }

    pub fn connect(&self) -> Result<(), BusError> {
        self.request(|reply| Command::Connect { reply })?
    }

    pub fn connected(&self) -> bool {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::Connected { reply }).is_err() {
            return false;
        }
        response.blocking_recv().unwrap_or(false)
    }

    pub fn publish(&self, event: EventEnvelope) -> Result<(), BusError> {
        self.request(|reply| Command::Publish { event, reply })?
    }

    pub fn initialize_named_queue(
        &self,
        queue: impl Into<String>,
        bindings: Vec<FieldTable>,
    ) -> Result<ProvisionedQueue, BusError> {
        let queue = queue.into();
        self.request(|reply| Command::InitializeNamedQueue {
            queue,
            bindings,
            reply,
        })?
    }

    pub fn close(&self) -> Result<(), BusError> {
        self.request(|reply| Command::Close { reply })?
    }

    /// Stop the worker, closing the connection if it is open.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<Result<T, BusError>, BusError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| BusError::WorkerStopped)?;
        response.blocking_recv().map_err(|_| BusError::WorkerStopped)
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.commands.send(Command::Shutdown);
            if worker.join().is_err() {
                tracing::error!("Event bus worker panicked");
            }
        }
    }
}

impl Drop for BlockingEventBus {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_bus_worker(bus: EventBus, command_rx: mpsc::UnboundedReceiver<Command>) -> JoinHandle<()> {
    thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!("Failed to create tokio runtime for event bus worker: {}", e);
                return;
            }
        };

        rt.block_on(run_command_loop(bus, command_rx));
    })
}

async fn run_command_loop(bus: EventBus, mut command_rx: mpsc::UnboundedReceiver<Command>) {
    tracing::info!("Event bus worker started");

    while let Some(command) = command_rx.recv().await {
        match command {
            Command::Connect { reply } => {
                let _ = reply.send(bus.connect().await.map(|_| ()));
            }
            Command::Connected { reply } => {
                let _ = reply.send(bus.connected());
            }
            Command::Publish { event, reply } => {
                let _ = reply.send(bus.publish(&event).await);
            }
            Command::InitializeNamedQueue {
                queue,
                bindings,
                reply,
            } => {
                let _ = reply.send(bus.initialize_named_queue(&queue, bindings).await);
            }
            Command::Close { reply } => {
                let _ = reply.send(bus.close().await);
            }
            Command::Shutdown => {
                tracing::info!("Event bus worker received shutdown command");
                break;
            }
        }
    }

    if bus.connected() {
        if let Err(e) = bus.close().await {
            tracing::warn!("Failed to close event bus on shutdown: {}", e);
        }
    }
    tracing::info!("Event bus worker shut down");
}
