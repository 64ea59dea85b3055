use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

/// AMQP-style failure: a reply code plus a human-readable text.
#[derive(Debug, Clone, Error)]
#[error("broker error {code}: {message}")]
pub struct BrokerError {
    pub code: u16,
    pub message: String,
}

impl BrokerError {
    pub fn not_found(what: &str) -> Self {
        BrokerError {
            code: 404,
            message: format!("no such {what}"),
        }
    }

    pub fn resource_locked(what: &str) -> Self {
        BrokerError {
            code: 405,
            message: format!("{what} is locked exclusively"),
        }
    }
}

/// Basic properties attached to a publication.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub persistent: bool,
}

#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub exclusive: bool,
    pub durable: bool,
    /// Messages older than this are reclaimed instead of delivered.
    pub message_ttl: Option<Duration>,
}

struct RawDelivery {
    body: Vec<u8>,
    properties: Properties,
    enqueued_at: Instant,
}

struct ExchangeState {
    auto_delete: bool,
    /// Queues bound directly to this exchange.
    queues: HashSet<String>,
    /// Destination exchanges of exchange-to-exchange bindings: a publish
    /// here also flows into each of these.
    downstream: HashSet<String>,
    /// Auto-delete only fires once the exchange has held a binding.
    ever_bound: bool,
}

struct QueueState {
    tx: mpsc::UnboundedSender<RawDelivery>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<RawDelivery>>>,
    exclusive: bool,
    message_ttl: Option<Duration>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
}

/// The process-wide broker: a topology of fan-out exchanges and queues with
/// AMQP-flavored semantics (auto-delete, mandatory routing, publisher
/// confirms, `reply_to`/`correlation_id` RPC). Deliveries travel over
/// per-queue unbounded channels.
#[derive(Clone, Default)]
pub struct Broker {
    state: Arc<StdMutex<BrokerState>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection onto this broker.
    pub fn connect(&self) -> Connection {
        Connection {
            broker: self.clone(),
        }
    }
}

/// A single logical broker connection. Connections are handles onto the
/// shared broker; channels are cheap and opened per logical operation.
#[derive(Clone)]
pub struct Connection {
    broker: Broker,
}

impl Connection {
    pub fn channel(&self) -> Channel {
        Channel {
            broker: self.broker.clone(),
            prefetch: Arc::new(StdMutex::new(None)),
        }
    }
}

/// Round-robin pool of broker connections, capped at a configurable size.
pub struct BrokerPool {
    broker: Broker,
    max_connections: usize,
    connections: StdMutex<Vec<Connection>>,
    next: AtomicUsize,
}

impl BrokerPool {
    pub fn new(broker: Broker, max_connections: usize) -> Self {
        BrokerPool {
            broker,
            max_connections: max_connections.max(1),
            connections: StdMutex::new(Vec::new()),
            next: AtomicUsize::new(0),
        }
    }

    pub fn get(&self) -> Connection {
        let mut connections = self.connections.lock().unwrap();
        if connections.len() < self.max_connections {
            let connection = self.broker.connect();
            connections.push(connection.clone());
            return connection;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % connections.len();
        connections[index].clone()
    }
}

/// Channel API: declarations, bindings, publish with confirms, consume.
#[derive(Clone)]
pub struct Channel {
    broker: Broker,
    prefetch: Arc<StdMutex<Option<usize>>>,
}

impl Channel {
    pub fn basic_qos(&self, prefetch_count: usize) {
        *self.prefetch.lock().unwrap() = Some(prefetch_count.max(1));
    }

    /// Declare a fan-out exchange. Idempotent for an existing exchange.
    pub fn exchange_declare(&self, name: &str, auto_delete: bool) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock().unwrap();
        state
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| ExchangeState {
                auto_delete,
                queues: HashSet::new(),
                downstream: HashSet::new(),
                ever_bound: false,
            });
        Ok(())
    }

    /// Passive declare: check existence without creating.
    pub fn exchange_declare_passive(&self, name: &str) -> Result<(), BrokerError> {
        let state = self.broker.state.lock().unwrap();
        if state.exchanges.contains_key(name) {
            Ok(())
        } else {
            Err(BrokerError::not_found("exchange"))
        }
    }

    /// Bind `source` into `destination`: publishes to `source` also route
    /// through `destination`.
    pub fn exchange_bind(&self, destination: &str, source: &str) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock().unwrap();
        if !state.exchanges.contains_key(destination) {
            return Err(BrokerError::not_found("exchange"));
        }
        let Some(src) = state.exchanges.get_mut(source) else {
            return Err(BrokerError::not_found("exchange"));
        };
        src.downstream.insert(destination.to_string());
        src.ever_bound = true;
        state.exchanges.get_mut(destination).unwrap().ever_bound = true;
        Ok(())
    }

    /// Declare a queue. A `None` name gets a generated one, which is
    /// returned.
    pub fn queue_declare(
        &self,
        name: Option<&str>,
        options: QueueOptions,
    ) -> Result<String, BrokerError> {
        let name = match name {
            Some(n) => n.to_string(),
            None => format!("gen-{}", uuid::Uuid::new_v4().simple()),
        };
        let mut state = self.broker.state.lock().unwrap();
        if let Some(existing) = state.queues.get(&name) {
            if existing.exclusive || options.exclusive {
                return Err(BrokerError::resource_locked("queue"));
            }
            return Ok(name);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.queues.insert(
            name.clone(),
            QueueState {
                tx,
                rx: Arc::new(Mutex::new(rx)),
                exclusive: options.exclusive,
                message_ttl: options.message_ttl,
            },
        );
        Ok(name)
    }

    pub fn queue_bind(&self, queue: &str, exchange: &str) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock().unwrap();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::not_found("queue"));
        }
        let Some(ex) = state.exchanges.get_mut(exchange) else {
            return Err(BrokerError::not_found("exchange"));
        };
        ex.queues.insert(queue.to_string());
        ex.ever_bound = true;
        Ok(())
    }

    /// Delete a queue. Auto-delete exchanges left without bindings go with
    /// it, cascading through exchange-to-exchange bindings.
    pub fn queue_delete(&self, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock().unwrap();
        if state.queues.remove(queue).is_none() {
            return Err(BrokerError::not_found("queue"));
        }
        for exchange in state.exchanges.values_mut() {
            exchange.queues.remove(queue);
        }
        sweep_auto_delete(&mut state);
        Ok(())
    }

    /// Publish `body` to `exchange` (or, on the default exchange, straight
    /// to the queue named by `routing_key`). Returns the publisher confirm:
    /// `true` iff the broker accepted the publication and, when `mandatory`,
    /// routed it to at least one queue.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: Properties,
        mandatory: bool,
    ) -> Result<bool, BrokerError> {
        let state = self.broker.state.lock().unwrap();

        let targets: Vec<&QueueState> = if exchange.is_empty() {
            state.queues.get(routing_key).into_iter().collect()
        } else {
            resolve_fanout(&state, exchange)
                .into_iter()
                .filter_map(|name| state.queues.get(&name))
                .collect()
        };

        let mut routed = false;
        for target in targets {
            let delivery = RawDelivery {
                body: body.to_vec(),
                properties: properties.clone(),
                enqueued_at: Instant::now(),
            };
            if target.tx.send(delivery).is_ok() {
                routed = true;
            }
        }

        Ok(routed || !mandatory)
    }

    /// Start consuming from a queue. With `no_ack` the prefetch window does
    /// not apply; otherwise deliveries hold a prefetch slot until acked.
    pub fn consume(&self, queue: &str, no_ack: bool) -> Result<Consumer, BrokerError> {
        let state = self.broker.state.lock().unwrap();
        let Some(q) = state.queues.get(queue) else {
            return Err(BrokerError::not_found("queue"));
        };
        let prefetch = if no_ack {
            None
        } else {
            self.prefetch
                .lock()
                .unwrap()
                .map(|n| Arc::new(Semaphore::new(n)))
        };
        Ok(Consumer {
            rx: q.rx.clone(),
            prefetch,
            message_ttl: q.message_ttl,
        })
    }

    /// Closing a channel releases nothing in-process; kept for lifecycle
    /// symmetry with the AMQP contract.
    pub fn close(&self) {}
}

/// All queues reachable from `exchange` through fan-out and
/// exchange-to-exchange bindings.
fn resolve_fanout(state: &BrokerState, exchange: &str) -> Vec<String> {
    let mut queues = HashSet::new();
    let mut visited = HashSet::new();
    let mut pending = vec![exchange.to_string()];
    while let Some(name) = pending.pop() {
        if !visited.insert(name.clone()) {
            continue;
        }
        if let Some(ex) = state.exchanges.get(&name) {
            queues.extend(ex.queues.iter().cloned());
            pending.extend(ex.downstream.iter().cloned());
        }
    }
    queues.into_iter().collect()
}

/// Remove auto-delete exchanges whose last binding is gone, cascading: an
/// exchange removed here unbinds from its sources, which may fall next.
fn sweep_auto_delete(state: &mut BrokerState) {
    loop {
        let dead: Vec<String> = state
            .exchanges
            .iter()
            .filter(|(_, ex)| {
                ex.auto_delete && ex.ever_bound && ex.queues.is_empty() && ex.downstream.is_empty()
            })
            .map(|(name, _)| name.clone())
            .collect();
        if dead.is_empty() {
            return;
        }
        for name in &dead {
            state.exchanges.remove(name);
        }
        for exchange in state.exchanges.values_mut() {
            for name in &dead {
                exchange.downstream.remove(name);
            }
        }
    }
}

/// An inbound delivery. Dropping it (or calling [`Delivery::ack`]) releases
/// its prefetch slot.
pub struct Delivery {
    pub body: Vec<u8>,
    pub properties: Properties,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Delivery {
    pub fn ack(self) {}
}

/// A consumer over one queue.
pub struct Consumer {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<RawDelivery>>>,
    prefetch: Option<Arc<Semaphore>>,
    message_ttl: Option<Duration>,
}

impl Consumer {
    /// Next live delivery, or `None` once the queue is deleted and drained.
    /// Expired deliveries (queue `message_ttl`) are reclaimed silently.
    ///
    /// The prefetch slot is taken before the queue is popped, so a
    /// cancelled `next` never loses a delivery.
    pub async fn next(&mut self) -> Option<Delivery> {
        loop {
            let permit = match &self.prefetch {
                Some(semaphore) => Some(semaphore.clone().acquire_owned().await.ok()?),
                None => None,
            };
            let raw = self.rx.lock().await.recv().await?;
            if let Some(ttl) = self.message_ttl
                && raw.enqueued_at.elapsed() > ttl
            {
                continue;
            }
            return Some(Delivery {
                body: raw.body,
                properties: raw.properties,
                _permit: permit,
            });
        }
    }
}
