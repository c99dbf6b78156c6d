//! Per-entity lanes: one FIFO queue and one worker per entity.
//!
//! ```text
//! dispatch(raw) ──► lanes[identity] ──► mpsc ──► worker ──► process_resource_event
//!                        │                          ▲
//!                        └── pressure.raise() ──────┘ (interrupts the gate)
//! ```
//!
//! A lane is created on the first notification for an identity and removed
//! by its own worker, only while the queue is empty. Sending happens under the
//! lane's map entry, so a notification either lands in a live lane or creates
//! a new one; it is never lost between the two.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::consistency::Flag;
use crate::memory::EntityMemory;
use crate::reactor::Reactor;
use crate::resource::{resource_version, EntityIdentity, RawEvent, StreamItem};

struct Lane {
    id: Uuid,
    tx: mpsc::UnboundedSender<StreamItem>,
    pressure: Flag,
}

/// Routes notifications to per-entity workers.
pub struct Multiplexer {
    reactor: Reactor,
    lanes: Arc<DashMap<EntityIdentity, Lane>>,
    workers: Mutex<JoinSet<()>>,
}

impl Multiplexer {
    pub fn new(reactor: Reactor) -> Self {
        Self {
            reactor,
            lanes: Arc::new(DashMap::new()),
            workers: Mutex::new(JoinSet::new()),
        }
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn active_lanes(&self) -> usize {
        self.lanes.len()
    }

    /// Route a notification. Bodies without an identity are dropped.
    pub fn dispatch(&self, raw_event: RawEvent) {
        if self.reactor.shutdown.is_raised() {
            debug!("reactor is shutting down; notification dropped");
            return;
        }
        let Some(identity) = EntityIdentity::from_body(&raw_event.object) else {
            warn!(event_type = ?raw_event.event_type, "notification without an identity dropped");
            return;
        };

        let mut entry = self
            .lanes
            .entry(identity.clone())
            .or_insert_with(|| self.spawn_lane(&identity));
        let item = match entry.tx.send(StreamItem::Event(raw_event)) {
            Ok(()) => {
                entry.pressure.raise();
                return;
            }
            Err(mpsc::error::SendError(item)) => item,
        };

        // The worker is gone without releasing its lane (aborted or panicked).
        warn!(%identity, "replacing a dead lane");
        *entry = self.spawn_lane(&identity);
        if entry.tx.send(item).is_ok() {
            entry.pressure.raise();
        }
    }

    /// Send the end-of-stream marker to an existing lane.
    pub fn end_of_stream(&self, identity: &EntityIdentity) {
        if let Some(lane) = self.lanes.get(identity) {
            if lane.tx.send(StreamItem::EndOfStream).is_ok() {
                lane.pressure.raise();
            }
        }
    }

    /// Stop every lane; abort workers still running after the exit timeout.
    pub async fn shutdown(&self) {
        self.reactor.shutdown.raise();
        for lane in self.lanes.iter() {
            let _ = lane.tx.send(StreamItem::EndOfStream);
            lane.pressure.raise();
        }

        let mut workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let exit_timeout = self.reactor.settings.batching.exit_timeout;
        let drained = timeout(exit_timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = workers.len(), "workers did not exit in time; aborting");
            workers.shutdown().await;
        }
        self.lanes.clear();
        debug!("all lanes stopped");
    }

    fn spawn_lane(&self, identity: &EntityIdentity) -> Lane {
        let (tx, rx) = mpsc::unbounded_channel();
        let lane = Lane {
            id: Uuid::new_v4(),
            tx,
            pressure: Flag::new(),
        };
        let worker = Worker {
            reactor: self.reactor.clone(),
            lanes: Arc::clone(&self.lanes),
            identity: identity.clone(),
            lane_id: lane.id,
            rx,
            pressure: lane.pressure.clone(),
        };
        let span = info_span!(
            "lane",
            kind = %identity.kind,
            namespace = %identity.namespace,
            name = %identity.name,
        );

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(finished) = workers.try_join_next() {
            if let Err(err) = finished {
                if err.is_panic() {
                    error!(error = %err, "worker panicked");
                }
            }
        }
        workers.spawn(worker.run().instrument(span));
        trace!(%identity, lane = %lane.id, "lane spawned");
        lane
    }
}

struct Worker {
    reactor: Reactor,
    lanes: Arc<DashMap<EntityIdentity, Lane>>,
    identity: EntityIdentity,
    lane_id: Uuid,
    rx: mpsc::UnboundedReceiver<StreamItem>,
    pressure: Flag,
}

/// What the worker dequeued.
enum Next {
    Event { raw_event: RawEvent, fresh: bool },
    End,
    Idle,
}

impl Worker {
    async fn run(mut self) {
        let clock = self.reactor.clock;
        let settings = Arc::clone(&self.reactor.settings);
        let mut memory = EntityMemory::new(clock.now());
        let mut carried: Option<RawEvent> = None;
        let mut retry_at: Option<f64> = None;
        let mut expected_version: Option<String> = None;
        let mut consistency_time: Option<f64> = None;

        debug!("worker started");
        loop {
            if self.reactor.shutdown.is_raised() {
                break;
            }

            let next = match carried.take() {
                Some(raw_event) => Next::Event { raw_event, fresh: false },
                None => self.dequeue(&memory, retry_at.take(), settings.batching.idle_timeout).await,
            };
            let (mut raw_event, mut fresh) = match next {
                Next::Event { raw_event, fresh } => (raw_event, fresh),
                Next::End => {
                    if self.release() {
                        break;
                    }
                    continue;
                }
                Next::Idle => {
                    memory.idle = true;
                    if self.release() {
                        debug!("idle lane released");
                        break;
                    }
                    continue;
                }
            };

            // Batching: only the newest notification of a burst is processed.
            let mut ended = false;
            loop {
                match timeout(settings.batching.batch_window, self.rx.recv()).await {
                    Ok(Some(StreamItem::Event(newer))) => {
                        raw_event = newer;
                        fresh = true;
                    }
                    Ok(Some(StreamItem::EndOfStream)) | Ok(None) => {
                        ended = true;
                        break;
                    }
                    Err(_) => break,
                }
            }
            self.pressure.clear();
            if !self.rx.is_empty() {
                self.pressure.raise();
            }

            if let Some(expected) = &expected_version {
                if resource_version(&raw_event.object) == Some(expected.as_str()) {
                    trace!(version = %expected, "own patch observed");
                    expected_version = None;
                    consistency_time = None;
                }
            }

            let result = self
                .reactor
                .process(
                    &self.identity,
                    &mut memory,
                    &raw_event,
                    consistency_time,
                    &self.pressure,
                    fresh,
                )
                .await;

            match result {
                Ok(outcome) => {
                    if outcome.interrupted && !ended {
                        carried = Some(raw_event);
                        continue;
                    }
                    if let Some(version) = outcome.patched_version {
                        consistency_time =
                            Some(clock.now() + settings.persistence.consistency_timeout.as_secs_f64());
                        expected_version = Some(version);
                    }
                    retry_at = outcome.delay.map(|delay| clock.now() + delay);
                }
                Err(err) => {
                    error!(error = %err, "processing failed");
                    let delay = settings.execution.default_backoff.delay(1);
                    retry_at = Some(clock.now() + delay.as_secs_f64());
                }
            }

            if ended && self.release() {
                break;
            }
        }
        debug!("worker stopped");
    }

    /// Wait for the next notification, a retry due, or idleness.
    async fn dequeue(&mut self, memory: &EntityMemory, retry_at: Option<f64>, idle_timeout: Duration) -> Next {
        let wait = match retry_at {
            Some(at) => Duration::try_from_secs_f64((at - self.reactor.clock.now()).max(0.0)).unwrap_or_default(),
            None => idle_timeout,
        };
        match timeout(wait, self.rx.recv()).await {
            Ok(Some(StreamItem::Event(raw_event))) => Next::Event { raw_event, fresh: true },
            Ok(Some(StreamItem::EndOfStream)) | Ok(None) => Next::End,
            Err(_) if retry_at.is_some() => match &memory.latest_body {
                Some(body) => {
                    trace!("retry due; re-running against the latest body");
                    Next::Event {
                        raw_event: RawEvent::new(memory.last_event_type, body.clone()),
                        fresh: false,
                    }
                }
                None => Next::Idle,
            },
            Err(_) => Next::Idle,
        }
    }

    /// Remove this worker's lane if nothing is queued. Returns whether it did.
    fn release(&self) -> bool {
        if self.reactor.shutdown.is_raised() {
            return true;
        }
        self.lanes
            .remove_if(&self.identity, |_, lane| lane.id == self.lane_id && self.rx.is_empty())
            .is_some()
            || !self
                .lanes
                .get(&self.identity)
                .is_some_and(|lane| lane.id == self.lane_id)
    }
}
