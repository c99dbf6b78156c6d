//! In-memory patch and event sink for keel reactors.
//!
//! [`Outbox`] holds object bodies the way a cluster API would: it stamps a
//! new `resourceVersion` on every write, honours finalizers on deletion and
//! broadcasts a notification for every change. Patches and events sent by a
//! reactor are applied and recorded, so tests and demos can run a full
//! notification → handler → patch → notification loop without a cluster.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use keel_core::{
    finalizers, is_deletion_ongoing, Body, EntityIdentity, EventRecord, Patch, PatchSink,
    RawEvent, ReactorHandle, SinkError,
};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

const NOTIFICATION_CAPACITY: usize = 1024;

/// A patch as the reactor sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct SentPatch {
    pub identity: EntityIdentity,
    pub patch: Value,
}

/// An event as the reactor posted it.
#[derive(Debug, Clone, PartialEq)]
pub struct PostedEvent {
    pub identity: EntityIdentity,
    pub record: EventRecord,
}

/// In-memory object holder and reactor sink.
pub struct Outbox {
    objects: DashMap<EntityIdentity, Body>,
    version: AtomicU64,
    patches: Mutex<Vec<SentPatch>>,
    events: Mutex<Vec<PostedEvent>>,
    notifications: broadcast::Sender<RawEvent>,
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Outbox {
    pub fn new() -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            objects: DashMap::new(),
            version: AtomicU64::new(0),
            patches: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            notifications,
        }
    }

    /// Receive every notification from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RawEvent> {
        self.notifications.subscribe()
    }

    /// Feed every notification into a reactor until the outbox is dropped.
    pub fn forward_to(&self, handle: ReactorHandle) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => handle.dispatch(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notifications lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Store a new object.
    pub fn create(&self, mut body: Body) -> anyhow::Result<Body> {
        let identity = EntityIdentity::from_body(&body)
            .ok_or_else(|| anyhow::anyhow!("object has no kind or name"))?;
        if self.objects.contains_key(&identity) {
            anyhow::bail!("{identity} already exists");
        }
        if body.pointer("/metadata/uid").is_none() {
            body["metadata"]["uid"] = json!(Uuid::new_v4().to_string());
        }
        self.stamp(&mut body);
        self.objects.insert(identity, body.clone());
        self.notify(RawEvent::added(body.clone()));
        Ok(body)
    }

    /// Modify a stored object in place.
    pub fn update(&self, identity: &EntityIdentity, f: impl FnOnce(&mut Body)) -> anyhow::Result<Body> {
        let body = {
            let mut entry = self
                .objects
                .get_mut(identity)
                .ok_or_else(|| anyhow::anyhow!("{identity} not found"))?;
            f(entry.value_mut());
            self.stamp(entry.value_mut());
            entry.value().clone()
        };
        self.notify(RawEvent::modified(body.clone()));
        Ok(body)
    }

    /// Delete an object; with finalizers, only mark it for deletion.
    pub fn delete(&self, identity: &EntityIdentity) -> anyhow::Result<()> {
        let has_finalizers = {
            let entry = self
                .objects
                .get(identity)
                .ok_or_else(|| anyhow::anyhow!("{identity} not found"))?;
            let has = finalizers(entry.value()).next().is_some();
            has
        };
        if has_finalizers {
            self.update(identity, |body| {
                body["metadata"]["deletionTimestamp"] = json!(Utc::now().to_rfc3339());
            })?;
        } else if let Some((_, body)) = self.objects.remove(identity) {
            self.notify(RawEvent::deleted(body));
        }
        Ok(())
    }

    pub fn get(&self, identity: &EntityIdentity) -> Option<Body> {
        self.objects.get(identity).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, identity: &EntityIdentity) -> bool {
        self.objects.contains_key(identity)
    }

    pub fn patches(&self) -> Vec<SentPatch> {
        self.patches.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn events(&self) -> Vec<PostedEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn stamp(&self, body: &mut Body) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        body["metadata"]["resourceVersion"] = json!(version.to_string());
    }

    fn notify(&self, event: RawEvent) {
        // No subscribers is fine.
        let _ = self.notifications.send(event);
    }
}

#[async_trait]
impl PatchSink for Outbox {
    async fn patch(&self, identity: &EntityIdentity, patch: &Patch) -> Result<Option<Body>, SinkError> {
        self.patches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentPatch {
                identity: identity.clone(),
                patch: patch.as_value(),
            });

        let body = {
            let mut entry = self.objects.get_mut(identity).ok_or_else(|| SinkError::NotFound {
                entity: identity.to_string(),
            })?;
            patch.apply_to(entry.value_mut());
            self.stamp(entry.value_mut());
            entry.value().clone()
        };
        debug!(%identity, version = ?body.pointer("/metadata/resourceVersion"), "patched");

        if is_deletion_ongoing(&body) && finalizers(&body).next().is_none() {
            self.objects.remove(identity);
            self.notify(RawEvent::deleted(body.clone()));
        } else {
            self.notify(RawEvent::modified(body.clone()));
        }
        Ok(Some(body))
    }

    async fn post_event(&self, identity: &EntityIdentity, record: EventRecord) -> Result<(), SinkError> {
        debug!(%identity, kind = %record.kind, reason = %record.reason, "{}", record.message);
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PostedEvent {
                identity: identity.clone(),
                record,
            });
        Ok(())
    }
}
