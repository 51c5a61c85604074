//! ---
//! vdev_section: "01-core-functionality"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Device state store and protocol engine."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
//! Protocol engine: ties the codec, the state store and a transport together.
//!
//! The engine runs as one task. Inbound messages are handled strictly in
//! arrival order; a message that fails to decode is logged, counted and
//! dropped without touching the store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use vdev_logging::{tracing_sink, LogRecord, SharedSink};
use vdev_msg::{
    log_message, DecodeError, DeliveryAck, EncodeError, MessageCodec, MessageCounters,
    MessageDirection, MessagingMetrics, Topics, Transport, TransportError, TransportEvent,
    TransportEvents,
};
use vdev_sim::{SchedulerError, StreamQueue, TrafficScheduler};

use crate::store::{DeviceStateStore, ReadRequest, StateSnapshot, StoreError};

const COMPONENT: &str = "engine";

/// Deadline for stream runners to wind down when the engine stops.
const SCHEDULER_SHUTDOWN: Duration = Duration::from_secs(2);

/// What the engine does once the transport is up. Fixed at construction.
pub enum EngineMode {
    /// Subscribe to the inbound topic and answer platform requests.
    Subscribe,
    /// Process one preconfigured plaintext message as if the platform had
    /// sent it, then idle.
    PublishOnce(Vec<u8>),
    /// Publish every item the scheduler's streams produce.
    PublishStream(TrafficScheduler),
}

impl EngineMode {
    fn name(&self) -> &'static str {
        match self {
            EngineMode::Subscribe => "subscribe",
            EngineMode::PublishOnce(_) => "publish-once",
            EngineMode::PublishStream(_) => "publish-stream",
        }
    }
}

impl std::fmt::Debug for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Connecting,
    /// Subscribed and waiting for platform messages.
    Listening,
    /// Publishing local data.
    Sending,
    Stopped,
}

/// Local requests, typically from an operator console.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    /// Validate and write the values, then publish them.
    Update(StateSnapshot),
    /// Publish the full state.
    ReportAll,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("transport closed before the session was established")]
    NotConnected,
    #[error("engine is not running")]
    Stopped,
    #[error("engine task failed: {0}")]
    Join(String),
}

/// Polling budget used by [`EngineHandle::wait_for_delivery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryBudget {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for DeliveryBudget {
    /// 200 polls, 10 ms apart.
    fn default() -> Self {
        Self {
            attempts: 200,
            interval: Duration::from_millis(10),
        }
    }
}

pub struct ProtocolEngine {
    device_id: String,
    topics: Topics,
    loop_mode: bool,
    codec: MessageCodec,
    store: Arc<DeviceStateStore>,
    transport: Arc<dyn Transport>,
    sink: SharedSink,
    registry: Registry,
    mode: EngineMode,
}

/// Everything the engine task needs; shared by reference across awaits.
struct Worker {
    device_id: String,
    topics: Topics,
    loop_mode: bool,
    codec: MessageCodec,
    store: Arc<DeviceStateStore>,
    transport: Arc<dyn Transport>,
    sink: SharedSink,
    counters: MessageCounters,
    delivered: Arc<AtomicU64>,
}

impl ProtocolEngine {
    pub fn new(
        device_id: impl Into<String>,
        codec: MessageCodec,
        store: Arc<DeviceStateStore>,
        transport: Arc<dyn Transport>,
        mode: EngineMode,
    ) -> Self {
        let device_id = device_id.into();
        Self {
            topics: Topics::for_device(&device_id, false),
            device_id,
            loop_mode: false,
            codec,
            store,
            transport,
            sink: tracing_sink(),
            registry: Registry::new(),
            mode,
        }
    }

    /// Swap inbound and outbound topics and stop echoing read requests.
    pub fn with_loop_mode(mut self, loop_mode: bool) -> Self {
        self.loop_mode = loop_mode;
        self.topics = Topics::for_device(&self.device_id, loop_mode);
        self
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Register the message counters here instead of a private registry.
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn store(&self) -> &Arc<DeviceStateStore> {
        &self.store
    }

    /// Connect the transport and spawn the engine task.
    ///
    /// Returns once the session is up and the mode has been entered.
    pub async fn start(self) -> Result<EngineHandle, EngineError> {
        let ProtocolEngine {
            device_id,
            topics,
            loop_mode,
            codec,
            store,
            transport,
            sink,
            registry,
            mode,
        } = self;
        let worker = Worker {
            device_id,
            topics,
            loop_mode,
            codec,
            store,
            transport,
            sink,
            counters: MessageCounters::register(&registry)?,
            delivered: Arc::new(AtomicU64::new(0)),
        };
        let (state_tx, state_rx) = watch::channel(EngineState::Connecting);
        let mut events = worker.transport.connect().await?;
        loop {
            match events.recv().await {
                Some(TransportEvent::Connected) => break,
                Some(TransportEvent::Disconnected { reason }) => {
                    return Err(TransportError::Refused(
                        reason.unwrap_or_else(|| "disconnected".to_owned()),
                    )
                    .into())
                }
                Some(_) => continue,
                None => return Err(EngineError::NotConnected),
            }
        }
        worker.sink.record(
            LogRecord::info(COMPONENT, "transport connected")
                .field("device", &worker.device_id)
                .field("transport", worker.transport.name())
                .field("mode", mode.name()),
        );

        let mut session = Session::default();
        match mode {
            EngineMode::Subscribe => {
                worker.subscribe().await?;
                state_tx.send_replace(EngineState::Listening);
            }
            EngineMode::PublishOnce(payload) => {
                state_tx.send_replace(EngineState::Sending);
                if let Err(err) = worker.process_local(&payload).await {
                    worker.report_error("tx message not sent", &err);
                }
            }
            EngineMode::PublishStream(mut scheduler) => {
                session.queue = scheduler.take_queue();
                scheduler.start()?;
                session.scheduler = Some(scheduler);
                state_tx.send_replace(EngineState::Sending);
            }
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let store = worker.store.clone();
        let counters = worker.counters.clone();
        let delivered = worker.delivered.clone();
        let topics = worker.topics.clone();
        let task = tokio::spawn(worker.run(events, session, commands_rx, shutdown_rx, state_tx));
        Ok(EngineHandle {
            topics,
            state: state_rx,
            commands: commands_tx,
            shutdown: shutdown_tx,
            task,
            store,
            counters,
            delivered,
            registry,
        })
    }
}

impl Worker {
    async fn run(
        self,
        mut events: TransportEvents,
        mut session: Session,
        mut commands: mpsc::UnboundedReceiver<EngineCommand>,
        mut shutdown: watch::Receiver<bool>,
        state: watch::Sender<EngineState>,
    ) -> Result<(), EngineError> {
        let reason = loop {
            tokio::select! {
                _ = shutdown.changed() => break "stop requested".to_owned(),
                event = events.recv() => match event {
                    Some(event) => {
                        if let Some(reason) = self.on_event(event, &state).await {
                            break reason;
                        }
                    }
                    None => break "transport event stream closed".to_owned(),
                },
                Some(command) = commands.recv() => self.on_command(command).await,
                item = next_stream_item(&mut session.queue) => match item {
                    Some(data) => self.publish_stream_item(data).await,
                    None => {
                        session.queue = None;
                        self.sink.record(LogRecord::info(COMPONENT, "all streams ended"));
                    }
                },
            }
        };
        self.sink
            .record(LogRecord::info(COMPONENT, "engine stopping").field("reason", &reason));

        let mut outcome = Ok(());
        if let Some(mut scheduler) = session.scheduler.take() {
            if let Err(err) = scheduler.stop_with_timeout(SCHEDULER_SHUTDOWN).await {
                self.report_error("stream shutdown incomplete", &err);
            }
        }
        if let Err(err) = self.transport.disconnect().await {
            self.report_error("disconnect failed", &err);
            outcome = Err(err.into());
        }
        state.send_replace(EngineState::Stopped);
        self.sink.record(
            LogRecord::info(COMPONENT, "engine stopped")
                .field("device", &self.device_id)
                .field("sent", self.counters.snapshot().sent)
                .field("received", self.counters.snapshot().received)
                .field("dropped", self.counters.snapshot().dropped),
        );
        outcome
    }

    /// Returns a reason when the session is over.
    async fn on_event(
        &self,
        event: TransportEvent,
        state: &watch::Sender<EngineState>,
    ) -> Option<String> {
        match event {
            TransportEvent::Message { topic, payload } => {
                if topic == self.topics.inbound() {
                    if let Err(err) = self.process_inbound(&payload).await {
                        if !matches!(err, EngineError::Decode(_)) {
                            self.report_error("inbound message not answered", &err);
                        }
                    }
                } else {
                    self.sink.record(
                        LogRecord::debug(COMPONENT, "message on foreign topic ignored")
                            .field("topic", topic),
                    );
                }
                None
            }
            TransportEvent::Published(ack) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                self.sink
                    .record(LogRecord::debug(COMPONENT, "publish delivered").field("ack", ack.id));
                None
            }
            TransportEvent::Connected => {
                if *state.borrow() == EngineState::Listening {
                    if let Err(err) = self.subscribe().await {
                        self.report_error("resubscribe failed", &err);
                    }
                }
                None
            }
            TransportEvent::Disconnected { reason } => {
                Some(reason.unwrap_or_else(|| "transport disconnected".to_owned()))
            }
        }
    }

    async fn on_command(&self, command: EngineCommand) {
        let result = match command {
            EngineCommand::Update(values) => match self.store.update(&values) {
                Ok(written) => self.reply(&written).await.map(|_| ()),
                Err(err) => Err(err.into()),
            },
            EngineCommand::ReportAll => {
                self.publish_values(&self.store.get_all()).await.map(|_| ())
            }
        };
        if let Err(err) = result {
            self.report_error("command failed", &err);
        }
    }

    async fn subscribe(&self) -> Result<(), EngineError> {
        self.transport.subscribe(self.topics.inbound()).await?;
        self.sink.record(
            LogRecord::info(COMPONENT, "subscribed").field("topic", self.topics.inbound()),
        );
        Ok(())
    }

    /// Decode, apply and, outside loop mode, echo the read request.
    async fn process_inbound(&self, payload: &[u8]) -> Result<Option<DeliveryAck>, EngineError> {
        log_message(&*self.sink, MessageDirection::Inbound, self.topics.inbound(), payload);
        self.counters.record_received();
        let read = self.apply(&self.codec, payload)?;
        if self.loop_mode {
            return Ok(None);
        }
        self.reply(&read).await.map(Some)
    }

    /// The preconfigured tx message is plaintext and always answered.
    async fn process_local(&self, payload: &[u8]) -> Result<DeliveryAck, EngineError> {
        let plain = MessageCodec::new(self.codec.schema().clone(), None);
        let read = self.apply(&plain, payload)?;
        self.reply(&read).await
    }

    fn apply(&self, codec: &MessageCodec, payload: &[u8]) -> Result<ReadRequest, EngineError> {
        let batches = match codec.decode(payload) {
            Ok(batches) => batches,
            Err(err) => {
                self.counters.record_dropped();
                self.report_drop(&err);
                return Err(err.into());
            }
        };
        Ok(self.store.apply_batches(&batches)?)
    }

    async fn reply(&self, read: &ReadRequest) -> Result<DeliveryAck, EngineError> {
        let values = self.store.get_subset(read.iter().map(String::as_str))?;
        self.publish_values(&values).await
    }

    async fn publish_stream_item(&self, data: StateSnapshot) {
        let result = match self.store.update(&data) {
            Ok(_) => self.publish_values(&data).await.map(|_| ()),
            Err(err) => {
                self.counters.record_dropped();
                Err(err.into())
            }
        };
        if let Err(err) = result {
            self.report_error("stream item not sent", &err);
        }
    }

    async fn publish_values(&self, values: &StateSnapshot) -> Result<DeliveryAck, EngineError> {
        let payload = self.codec.encode_values(values)?;
        let topic = self.topics.outbound();
        log_message(&*self.sink, MessageDirection::Outbound, topic, &payload);
        match self.transport.publish(topic, payload).await {
            Ok(ack) => {
                self.counters.record_sent();
                Ok(ack)
            }
            Err(err) => {
                self.counters.record_dropped();
                Err(err.into())
            }
        }
    }

    fn report_drop(&self, err: &DecodeError) {
        let mut record = LogRecord::warn(COMPONENT, "inbound message dropped")
            .field("device", &self.device_id)
            .field("error", err);
        match err {
            DecodeError::TypeMismatch {
                name,
                expected,
                actual,
            } => {
                record = record
                    .field("attribute", name)
                    .field("expected", expected)
                    .field("actual", actual);
            }
            DecodeError::UnknownAttribute { name } => record = record.field("attribute", name),
            _ => {}
        }
        self.sink.record(record);
    }

    fn report_error(&self, message: &'static str, err: &dyn std::fmt::Display) {
        self.sink.record(
            LogRecord::error(COMPONENT, message)
                .field("device", &self.device_id)
                .field("error", err),
        );
    }
}

#[derive(Default)]
struct Session {
    scheduler: Option<TrafficScheduler>,
    queue: Option<StreamQueue>,
}

async fn next_stream_item(queue: &mut Option<StreamQueue>) -> Option<StateSnapshot> {
    match queue {
        Some(queue) => queue.recv().await,
        None => std::future::pending().await,
    }
}

/// Control surface of a running engine.
pub struct EngineHandle {
    topics: Topics,
    state: watch::Receiver<EngineState>,
    commands: mpsc::UnboundedSender<EngineCommand>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), EngineError>>,
    store: Arc<DeviceStateStore>,
    counters: MessageCounters,
    delivered: Arc<AtomicU64>,
    registry: Registry,
}

impl EngineHandle {
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.state.clone()
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn store(&self) -> &Arc<DeviceStateStore> {
        &self.store
    }

    /// Registry holding the message counters.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn metrics(&self) -> MessagingMetrics {
        self.counters.snapshot()
    }

    /// Publishes acknowledged by the transport so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn send(&self, command: EngineCommand) -> Result<(), EngineError> {
        self.commands.send(command).map_err(|_| EngineError::Stopped)
    }

    /// Poll until at least one publish was acknowledged or the budget runs out.
    pub async fn wait_for_delivery(&self, budget: DeliveryBudget) -> bool {
        for _ in 0..budget.attempts {
            if self.delivered() > 0 {
                return true;
            }
            tokio::time::sleep(budget.interval).await;
        }
        self.delivered() > 0
    }

    /// Resolves once the engine task has ended, for any reason.
    pub async fn stopped(&mut self) {
        let _ = self
            .state
            .wait_for(|state| *state == EngineState::Stopped)
            .await;
    }

    /// Stop streams, disconnect and wait for the engine task.
    pub async fn stop(self) -> Result<MessagingMetrics, EngineError> {
        self.shutdown.send_replace(true);
        self.task
            .await
            .map_err(|err| EngineError::Join(err.to_string()))??;
        Ok(self.counters.snapshot())
    }
}
