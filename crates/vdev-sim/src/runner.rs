//! ---
//! vdev_section: "05-simulation"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Synthetic traffic streams and scheduling."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use vdev_logging::{tracing_sink, LogRecord, SharedSink};

use crate::{StreamData, StreamGenerator};

const COMPONENT: &str = "scheduler";

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler already started")]
    AlreadyStarted,
    #[error("{pending} stream(s) still running at shutdown deadline")]
    ShutdownTimeout { pending: usize },
    #[error("stream {stream} failed: {reason}")]
    RunnerFailed { stream: String, reason: String },
}

/// Drives one generator until it ends or a stop is signalled.
pub struct StreamRunner {
    generator: Box<dyn StreamGenerator>,
    queue: mpsc::UnboundedSender<StreamData>,
    stop: watch::Receiver<bool>,
    sink: SharedSink,
}

impl StreamRunner {
    pub fn new(
        generator: Box<dyn StreamGenerator>,
        queue: mpsc::UnboundedSender<StreamData>,
        stop: watch::Receiver<bool>,
        sink: SharedSink,
    ) -> Self {
        Self {
            generator,
            queue,
            stop,
            sink,
        }
    }

    /// Pull, wait, enqueue, repeat. Returns the number of items enqueued.
    ///
    /// A stop signalled during the wait ends the runner without enqueueing the
    /// pending item.
    pub async fn run(mut self) -> u64 {
        let name = self.generator.name().to_owned();
        let mut emitted = 0u64;
        let reason = loop {
            if *self.stop.borrow() {
                break "stopped";
            }
            let Some(event) = self.generator.produce_next() else {
                break "generator exhausted";
            };
            if event.data.is_empty() {
                break "empty event";
            }
            match event.wait() {
                Some(wait) => {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.stop.changed() => break "stopped",
                    }
                }
                None => tokio::task::yield_now().await,
            }
            if *self.stop.borrow() {
                break "stopped";
            }
            let keys = event.data.keys().cloned().collect::<Vec<_>>().join(",");
            if self.queue.send(event.data).is_err() {
                break "queue closed";
            }
            emitted += 1;
            self.sink.record(
                LogRecord::debug(COMPONENT, "stream item enqueued")
                    .field("stream", &name)
                    .field("attributes", keys),
            );
        };
        self.sink.record(
            LogRecord::info(COMPONENT, "stream finished")
                .field("stream", &name)
                .field("reason", reason)
                .field("emitted", emitted),
        );
        emitted
    }
}

/// Single-consumer end of the shared stream queue.
#[derive(Debug)]
pub struct StreamQueue {
    rx: mpsc::UnboundedReceiver<StreamData>,
}

impl StreamQueue {
    /// Next item; `None` once every runner has finished and the queue is drained.
    pub async fn recv(&mut self) -> Option<StreamData> {
        self.rx.recv().await
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<StreamData> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn try_recv(&mut self) -> Option<StreamData> {
        self.rx.try_recv().ok()
    }
}

/// Runs a fixed set of streams, one task each, feeding one [`StreamQueue`].
pub struct TrafficScheduler {
    pending: Vec<Box<dyn StreamGenerator>>,
    names: Vec<String>,
    tx: Option<mpsc::UnboundedSender<StreamData>>,
    queue: Option<StreamQueue>,
    stop: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<u64>)>,
    sink: SharedSink,
    started: bool,
}

impl TrafficScheduler {
    pub fn new(streams: Vec<Box<dyn StreamGenerator>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);
        let names = streams.iter().map(|stream| stream.name().to_owned()).collect();
        Self {
            pending: streams,
            names,
            tx: Some(tx),
            queue: Some(StreamQueue { rx }),
            stop,
            tasks: Vec::new(),
            sink: tracing_sink(),
            started: false,
        }
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn stream_names(&self) -> &[String] {
        &self.names
    }

    /// Hand out the consumer end. Only the first call returns `Some`.
    pub fn take_queue(&mut self) -> Option<StreamQueue> {
        self.queue.take()
    }

    /// Spawn one runner per stream and return immediately.
    pub fn start(&mut self) -> Result<(), SchedulerError> {
        if self.started {
            return Err(SchedulerError::AlreadyStarted);
        }
        let tx = self.tx.take().ok_or(SchedulerError::AlreadyStarted)?;
        self.started = true;
        for generator in self.pending.drain(..) {
            let name = generator.name().to_owned();
            let runner = StreamRunner::new(
                generator,
                tx.clone(),
                self.stop.subscribe(),
                self.sink.clone(),
            );
            self.tasks.push((name, tokio::spawn(runner.run())));
        }
        self.sink.record(
            LogRecord::info(COMPONENT, "traffic scheduler started")
                .field("streams", self.tasks.len()),
        );
        Ok(())
    }

    /// True while at least one runner is still alive.
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|(_, task)| !task.is_finished())
    }

    /// Signal stop and wait for every runner. Returns items enqueued per stream.
    pub async fn stop(&mut self) -> Result<Vec<(String, u64)>, SchedulerError> {
        self.stop.send_replace(true);
        let mut totals = Vec::with_capacity(self.tasks.len());
        for (name, task) in self.tasks.drain(..) {
            match task.await {
                Ok(emitted) => totals.push((name, emitted)),
                Err(err) => {
                    return Err(SchedulerError::RunnerFailed {
                        stream: name,
                        reason: err.to_string(),
                    })
                }
            }
        }
        self.sink
            .record(LogRecord::info(COMPONENT, "traffic scheduler stopped"));
        Ok(totals)
    }

    /// [`stop`](Self::stop) with a deadline; runners still alive at the
    /// deadline are aborted.
    pub async fn stop_with_timeout(&mut self, timeout: Duration) -> Result<(), SchedulerError> {
        self.stop.send_replace(true);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut pending = 0;
        for (name, mut task) in self.tasks.drain(..) {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    self.sink.record(
                        LogRecord::error(COMPONENT, "stream runner failed")
                            .field("stream", &name)
                            .field("error", err),
                    );
                }
                Err(_) => {
                    task.abort();
                    pending += 1;
                }
            }
        }
        if pending > 0 {
            self.sink.record(
                LogRecord::warn(COMPONENT, "scheduler shutdown timed out")
                    .field("pending", pending),
            );
            return Err(SchedulerError::ShutdownTimeout { pending });
        }
        Ok(())
    }
}

impl Drop for TrafficScheduler {
    fn drop(&mut self) {
        for (_, task) in &self.tasks {
            task.abort();
        }
    }
}
