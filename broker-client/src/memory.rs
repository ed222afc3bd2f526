//! In-process broker with headers-exchange routing.
//!
//! `InMemoryBroker` keeps exchanges, queues, bindings and consumers in a single
//! lock-protected state and implements the [`Broker`] and [`Connection`] traits
//! on top of it. It is the test double for the event bus suites; deployments
//! that talk to a real broker use the `amqp` backend.
//!
//! Besides the broker behaviour it exposes controls for exercising failure
//! paths: connection latency and refusal, delayed bind confirmations, one-shot
//! operation failures, simulated network loss and broker restarts. Every
//! operation is appended to an ordered log.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::client::{Broker, Connection, Consumer};
use crate::error::{BrokerError, Result};
use crate::matching::headers_match;
use crate::types::{
    BasicProperties, CloseReason, ConnectParams, ConnectionId, ConsumeOptions, Delivery,
    ExchangeKind, FieldTable, LinkState, OperationKind, PublishOptions, QueueDeclareOptions,
    QueueInfo, ReturnedMessage, REPLY_NO_ROUTE,
};

/// One entry in the broker's operation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerOperation {
    /// Connection that issued the operation (`None` for connection attempts)
    pub connection: Option<ConnectionId>,
    /// The operation
    pub kind: OperationKind,
    /// Exchange, queue, host or consumer the operation targeted
    pub target: String,
}

/// In-process broker implementing headers-exchange routing.
///
/// Cloning the broker yields another handle to the same state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    controls: Mutex<Controls>,
    log: Mutex<Vec<BrokerOperation>>,
    next_connection_id: AtomicU64,
    connections_opened: AtomicU64,
}

#[derive(Default)]
struct Controls {
    connect_latency: Duration,
    refusal: Option<String>,
    bind_delays: Vec<(FieldTable, Duration)>,
    failures: Vec<(OperationKind, String)>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeEntry>,
    queues: HashMap<String, QueueEntry>,
    links: HashMap<ConnectionId, Arc<watch::Sender<LinkState>>>,
    next_delivery_tag: u64,
    next_consumer_tag: u64,
}

struct ExchangeEntry {
    kind: ExchangeKind,
    durable: bool,
}

struct BindingEntry {
    exchange: String,
    arguments: FieldTable,
}

#[derive(Clone)]
struct QueuedMessage {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    body: Bytes,
    redelivered: bool,
}

impl QueuedMessage {
    fn to_delivery(&self, delivery_tag: u64) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            redelivered: self.redelivered,
            properties: self.properties.clone(),
            body: self.body.clone(),
        }
    }
}

struct ConsumerEntry {
    tag: String,
    connection: ConnectionId,
    options: ConsumeOptions,
    sender: mpsc::UnboundedSender<Delivery>,
    unacked: HashMap<u64, QueuedMessage>,
}

impl ConsumerEntry {
    fn has_capacity(&self) -> bool {
        if !self.options.manual_ack {
            return true;
        }
        match self.options.prefetch {
            None | Some(0) => true,
            Some(limit) => self.unacked.len() < usize::from(limit),
        }
    }
}

struct QueueEntry {
    options: QueueDeclareOptions,
    owner: ConnectionId,
    bindings: Vec<BindingEntry>,
    backlog: VecDeque<QueuedMessage>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

impl QueueEntry {
    fn new(options: QueueDeclareOptions, owner: ConnectionId) -> Self {
        Self {
            options,
            owner,
            bindings: Vec::new(),
            backlog: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }

    fn info(&self, name: &str) -> QueueInfo {
        QueueInfo {
            name: name.to_string(),
            message_count: to_u32(self.backlog.len()),
            consumer_count: to_u32(self.consumers.len()),
        }
    }

    fn locked_for(&self, connection: ConnectionId) -> bool {
        self.options.exclusive && self.owner != connection
    }

    /// Hand backlog messages to consumers round-robin until the backlog is empty
    /// or no consumer has capacity left.
    fn dispatch(&mut self, next_delivery_tag: &mut u64) {
        while !self.backlog.is_empty() && !self.consumers.is_empty() {
            let count = self.consumers.len();
            let Some(index) = (0..count)
                .map(|offset| (self.next_consumer + offset) % count)
                .find(|&index| self.consumers[index].has_capacity())
            else {
                break;
            };
            let Some(message) = self.backlog.pop_front() else {
                break;
            };

            *next_delivery_tag += 1;
            let delivery_tag = *next_delivery_tag;

            if self.consumers[index]
                .sender
                .send(message.to_delivery(delivery_tag))
                .is_err()
            {
                // Receiver dropped without cancelling
                let removed = self.consumers.remove(index);
                self.backlog.push_front(message);
                self.requeue(removed.unacked);
                continue;
            }

            let consumer = &mut self.consumers[index];
            if consumer.options.manual_ack {
                consumer.unacked.insert(delivery_tag, message);
            }
            self.next_consumer = index + 1;
        }
    }

    fn requeue(&mut self, unacked: HashMap<u64, QueuedMessage>) {
        let mut pending: Vec<_> = unacked.into_iter().collect();
        pending.sort_by_key(|(tag, _)| *tag);
        for (_, mut message) in pending.into_iter().rev() {
            message.redelivered = true;
            self.backlog.push_front(message);
        }
    }
}

impl BrokerState {
    /// Detach everything a connection owned: its consumers (requeueing their
    /// unacknowledged deliveries) and its exclusive or auto-delete queues.
    fn release_connection(&mut self, id: ConnectionId) {
        for queue in self.queues.values_mut() {
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut queue.consumers)
                .into_iter()
                .partition(|consumer| consumer.connection == id);
            queue.consumers = kept;
            for consumer in gone {
                queue.requeue(consumer.unacked);
            }
            queue.dispatch(&mut self.next_delivery_tag);
        }

        self.queues.retain(|_, queue| {
            !(queue.owner == id && (queue.options.exclusive || queue.options.auto_delete))
        });
    }
}

fn to_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

impl Shared {
    fn record(&self, connection: Option<ConnectionId>, kind: OperationKind, target: &str) {
        self.log.lock().push(BrokerOperation {
            connection,
            kind,
            target: target.to_string(),
        });
    }

    fn check_failure(&self, kind: OperationKind) -> Result<()> {
        let mut controls = self.controls.lock();
        match controls.failures.iter().position(|(op, _)| *op == kind) {
            Some(index) => {
                let (operation, reason) = controls.failures.remove(index);
                Err(BrokerError::OperationFailed { operation, reason })
            }
            None => Ok(()),
        }
    }

    fn bind_delay(&self, arguments: &FieldTable) -> Option<Duration> {
        self.controls
            .lock()
            .bind_delays
            .iter()
            .find(|(pattern, _)| pattern == arguments)
            .map(|(_, delay)| *delay)
    }

    fn terminate(&self, id: ConnectionId, reason: CloseReason) {
        let link = {
            let mut state = self.state.lock();
            let link = state.links.remove(&id);
            state.release_connection(id);
            link
        };

        if let Some(link) = link {
            debug!(connection = %id, reason = ?reason, "Broker connection closed");
            link.send_replace(LinkState::Closed(reason));
        }
    }
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every connection attempt by `latency`.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.shared.controls.lock().connect_latency = latency;
    }

    /// Refuse connection attempts until [`accept_connections`](Self::accept_connections).
    pub fn refuse_connections(&self, reason: impl Into<String>) {
        self.shared.controls.lock().refusal = Some(reason.into());
    }

    /// Accept connection attempts again.
    pub fn accept_connections(&self) {
        self.shared.controls.lock().refusal = None;
    }

    /// Delay the confirmation of binds whose arguments equal `arguments`.
    pub fn delay_bind_confirmation(&self, arguments: FieldTable, delay: Duration) {
        self.shared.controls.lock().bind_delays.push((arguments, delay));
    }

    /// Fail the next operation of the given kind.
    pub fn fail_next(&self, operation: OperationKind, reason: impl Into<String>) {
        self.shared
            .controls
            .lock()
            .failures
            .push((operation, reason.into()));
    }

    /// Number of connections successfully opened since creation.
    pub fn connections_opened(&self) -> u64 {
        self.shared.connections_opened.load(Ordering::Relaxed)
    }

    /// Number of connections currently open.
    pub fn open_connections(&self) -> usize {
        self.shared.state.lock().links.len()
    }

    /// Snapshot of the operation log.
    pub fn operations(&self) -> Vec<BrokerOperation> {
        self.shared.log.lock().clone()
    }

    /// Clear the operation log.
    pub fn clear_operations(&self) {
        self.shared.log.lock().clear();
    }

    /// Whether a queue with this name exists.
    pub fn queue_exists(&self, name: &str) -> bool {
        self.shared.state.lock().queues.contains_key(name)
    }

    /// Names of all queues.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.shared.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Options a queue was declared with.
    pub fn queue_options(&self, name: &str) -> Option<QueueDeclareOptions> {
        self.shared.state.lock().queues.get(name).map(|q| q.options)
    }

    /// Binding arguments of a queue, in the order they were applied.
    pub fn queue_bindings(&self, name: &str) -> Vec<FieldTable> {
        self.shared
            .state
            .lock()
            .queues
            .get(name)
            .map(|q| q.bindings.iter().map(|b| b.arguments.clone()).collect())
            .unwrap_or_default()
    }

    /// Messages waiting in a queue's backlog.
    pub fn message_count(&self, name: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(name)
            .map_or(0, |q| q.backlog.len())
    }

    /// Kind of a declared exchange.
    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.shared.state.lock().exchanges.get(name).map(|e| e.kind)
    }

    /// Drop one connection as if the network failed.
    pub fn sever(&self, id: ConnectionId, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(connection = %id, reason = %reason, "Severing broker connection");
        self.shared.terminate(id, CloseReason::Lost(reason));
    }

    /// Drop every open connection as if the network failed.
    pub fn sever_all(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let ids: Vec<ConnectionId> = self.shared.state.lock().links.keys().copied().collect();
        for id in ids {
            self.sever(id, reason.clone());
        }
    }

    /// Simulate a broker restart: every connection is lost, non-durable
    /// exchanges and queues disappear and transient messages are dropped.
    pub fn restart(&self) {
        self.sever_all("broker restarted");

        let mut guard = self.shared.state.lock();
        let BrokerState {
            exchanges, queues, ..
        } = &mut *guard;

        exchanges.retain(|_, exchange| exchange.durable);
        queues.retain(|_, queue| queue.options.durable);
        for queue in queues.values_mut() {
            queue
                .bindings
                .retain(|binding| exchanges.contains_key(&binding.exchange));
            queue
                .backlog
                .retain(|message| message.properties.is_persistent());
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn Connection>> {
        let latency = self.shared.controls.lock().connect_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        self.shared.record(None, OperationKind::Connect, &params.host);

        let refusal = self.shared.controls.lock().refusal.clone();
        if let Some(reason) = refusal {
            return Err(BrokerError::ConnectionRefused {
                host: params.host.clone(),
                reason,
            });
        }
        self.shared.check_failure(OperationKind::Connect)?;

        let id = ConnectionId::new(self.shared.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (link, _) = watch::channel(LinkState::Open);
        let link = Arc::new(link);
        self.shared.state.lock().links.insert(id, Arc::clone(&link));
        self.shared.connections_opened.fetch_add(1, Ordering::Relaxed);

        let (returns_tx, returns_rx) = mpsc::unbounded_channel();

        debug!(connection = %id, host = %params.host, "Broker connection opened");

        Ok(Arc::new(MemoryConnection {
            id,
            shared: Arc::clone(&self.shared),
            link,
            returns_tx,
            returns_rx: Mutex::new(Some(returns_rx)),
        }))
    }
}

struct MemoryConnection {
    id: ConnectionId,
    shared: Arc<Shared>,
    link: Arc<watch::Sender<LinkState>>,
    returns_tx: mpsc::UnboundedSender<ReturnedMessage>,
    returns_rx: Mutex<Option<mpsc::UnboundedReceiver<ReturnedMessage>>>,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.link.borrow().is_open() {
            Ok(())
        } else {
            Err(BrokerError::ConnectionClosed)
        }
    }

    fn begin(&self, kind: OperationKind, target: &str) -> Result<()> {
        self.ensure_open()?;
        self.shared.record(Some(self.id), kind, target);
        self.shared.check_failure(kind)
    }

    /// Run `f` against the broker state if this connection is still registered.
    fn with_state<T>(&self, f: impl FnOnce(&mut BrokerState) -> Result<T>) -> Result<T> {
        let mut state = self.shared.state.lock();
        if !state.links.contains_key(&self.id) {
            return Err(BrokerError::ConnectionClosed);
        }
        f(&mut state)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.link.borrow().is_open()
    }

    fn state(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        self.begin(OperationKind::DeclareExchange, name)?;
        self.with_state(|state| match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BrokerError::PreconditionFailed(
                format!("exchange '{name}' already declared as {}", existing.kind),
            )),
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(name.to_string(), ExchangeEntry { kind, durable });
                Ok(())
            }
        })
    }

    async fn declare_queue(&self, name: &str, options: QueueDeclareOptions) -> Result<QueueInfo> {
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };
        self.begin(OperationKind::DeclareQueue, &name)?;

        let id = self.id;
        self.with_state(|state| {
            if let Some(queue) = state.queues.get(&name) {
                if queue.locked_for(id) {
                    return Err(BrokerError::ResourceLocked(format!(
                        "queue '{name}' is exclusive to another connection"
                    )));
                }
                if queue.options.durable != options.durable
                    || queue.options.auto_delete != options.auto_delete
                {
                    return Err(BrokerError::PreconditionFailed(format!(
                        "queue '{name}' already declared with different options"
                    )));
                }
                return Ok(queue.info(&name));
            }

            let queue = QueueEntry::new(options, id);
            let info = queue.info(&name);
            state.queues.insert(name.clone(), queue);
            Ok(info)
        })
    }

    async fn delete_queue(&self, name: &str) -> Result<u32> {
        self.begin(OperationKind::DeleteQueue, name)?;

        let id = self.id;
        self.with_state(|state| {
            match state.queues.get(name).map(|queue| queue.locked_for(id)) {
                None => Ok(0),
                Some(true) => Err(BrokerError::ResourceLocked(format!(
                    "queue '{name}' is exclusive to another connection"
                ))),
                Some(false) => {
                    let removed = state.queues.remove(name);
                    Ok(removed.map_or(0, |queue| to_u32(queue.backlog.len())))
                }
            }
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, arguments: FieldTable) -> Result<()> {
        self.begin(OperationKind::Bind, queue)?;

        if let Some(delay) = self.shared.bind_delay(&arguments) {
            tokio::time::sleep(delay).await;
        }

        let id = self.id;
        self.with_state(|state| {
            if !state.exchanges.contains_key(exchange) {
                return Err(BrokerError::ExchangeNotFound(exchange.to_string()));
            }
            let entry = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
            if entry.locked_for(id) {
                return Err(BrokerError::ResourceLocked(format!(
                    "queue '{queue}' is exclusive to another connection"
                )));
            }

            let exists = entry
                .bindings
                .iter()
                .any(|binding| binding.exchange == exchange && binding.arguments == arguments);
            if !exists {
                entry.bindings.push(BindingEntry {
                    exchange: exchange.to_string(),
                    arguments,
                });
            }
            Ok(())
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        properties: BasicProperties,
        body: Bytes,
    ) -> Result<()> {
        self.begin(OperationKind::Publish, exchange)?;

        let message = QueuedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties,
            body,
            redelivered: false,
        };

        let unrouted = self.with_state(|state| {
            let kind = state
                .exchanges
                .get(exchange)
                .map(|entry| entry.kind)
                .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;

            let targets: Vec<String> = state
                .queues
                .iter()
                .filter(|(_, queue)| {
                    queue.bindings.iter().any(|binding| {
                        binding.exchange == exchange
                            && (kind == ExchangeKind::Fanout
                                || headers_match(&binding.arguments, &message.properties.headers))
                    })
                })
                .map(|(name, _)| name.clone())
                .collect();

            for name in &targets {
                if let Some(queue) = state.queues.get_mut(name) {
                    queue.backlog.push_back(message.clone());
                    queue.dispatch(&mut state.next_delivery_tag);
                }
            }
            trace!(exchange = %exchange, queues = ?targets, "Message routed");

            Ok(if targets.is_empty() { Some(message) } else { None })
        })?;

        if let Some(message) = unrouted {
            if options.mandatory {
                let _ = self.returns_tx.send(ReturnedMessage {
                    reply_code: REPLY_NO_ROUTE,
                    reply_text: "NO_ROUTE".to_string(),
                    exchange: message.exchange,
                    routing_key: message.routing_key,
                    properties: message.properties,
                    body: message.body,
                });
            } else {
                trace!(exchange = %exchange, "Unroutable message dropped");
            }
        }

        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer> {
        self.begin(OperationKind::Consume, queue)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.id;
        let tag = self.with_state(|state| {
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::QueueNotFound(queue.to_string()));
            }
            state.next_consumer_tag += 1;
            let tag = format!("ctag-{}.{}", id.as_u64(), state.next_consumer_tag);

            let entry = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
            if entry.locked_for(id) {
                return Err(BrokerError::ResourceLocked(format!(
                    "queue '{queue}' is exclusive to another connection"
                )));
            }
            let in_exclusive_use = entry.consumers.iter().any(|c| c.options.exclusive);
            if in_exclusive_use || (options.exclusive && !entry.consumers.is_empty()) {
                return Err(BrokerError::AccessRefused(format!(
                    "queue '{queue}' is in exclusive use"
                )));
            }

            entry.consumers.push(ConsumerEntry {
                tag: tag.clone(),
                connection: id,
                options,
                sender,
                unacked: HashMap::new(),
            });
            entry.dispatch(&mut state.next_delivery_tag);
            Ok(tag)
        })?;

        Ok(Consumer::new(tag, queue, receiver))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.begin(OperationKind::Cancel, consumer_tag)?;

        let id = self.id;
        self.with_state(|state| {
            for queue in state.queues.values_mut() {
                let position = queue
                    .consumers
                    .iter()
                    .position(|c| c.tag == consumer_tag && c.connection == id);
                if let Some(index) = position {
                    let removed = queue.consumers.remove(index);
                    queue.requeue(removed.unacked);
                    queue.dispatch(&mut state.next_delivery_tag);
                    break;
                }
            }
            Ok(())
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.begin(OperationKind::Ack, &delivery_tag.to_string())?;

        let id = self.id;
        self.with_state(|state| {
            for queue in state.queues.values_mut() {
                let acked = queue
                    .consumers
                    .iter_mut()
                    .find(|c| c.connection == id && c.unacked.contains_key(&delivery_tag))
                    .map(|consumer| consumer.unacked.remove(&delivery_tag))
                    .is_some();
                if acked {
                    queue.dispatch(&mut state.next_delivery_tag);
                    return Ok(());
                }
            }
            Err(BrokerError::UnknownDeliveryTag(delivery_tag))
        })
    }

    fn take_returns(&self) -> Option<mpsc::UnboundedReceiver<ReturnedMessage>> {
        self.returns_rx.lock().take()
    }

    async fn close(&self) -> Result<()> {
        self.begin(OperationKind::Close, "")?;
        self.shared.terminate(self.id, CloseReason::Requested);
        Ok(())
    }
}
