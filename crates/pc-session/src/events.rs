use crate::session::SessionStore;
use pc_api_types::ConnectionStatus;
use pc_node_client::{ConnectionHandle, EventRecord};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const EVENT_ICON: &str = "bell";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventEntry {
    pub icon: String,
    pub summary: String,
    pub extra_text: String,
    pub content: String,
}

#[derive(Default)]
struct FeedState {
    entries: VecDeque<EventEntry>,
    sequence: u64,
}

/// Newest-first log of chain events, bounded to `capacity` entries.
pub struct EventFeed {
    capacity: usize,
    state: Mutex<FeedState>,
}

impl EventFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(FeedState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records arrive in block order, so the last one ends up first.
    pub fn push_batch(&self, records: &[EventRecord]) {
        let mut state = self.lock();
        for record in records {
            state.sequence += 1;
            let entry = EventEntry {
                icon: EVENT_ICON.to_owned(),
                summary: format!(
                    "{}:{}:: (phase={})-{}",
                    record.section, record.method, record.phase, state.sequence
                ),
                extra_text: record.docs.join(", "),
                content: record
                    .fields
                    .iter()
                    .map(|field| format!("{}: {}", field.type_name, field.value))
                    .collect::<Vec<_>>()
                    .join(", "),
            };
            state.entries.push_front(entry);
        }

        let capacity = self.capacity;
        state.entries.truncate(capacity);
    }

    pub fn entries(&self) -> Vec<EventEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pause before resubscribing when the event stream of a still-ready
/// connection fails or ends.
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);

type Pump = Option<(Uuid, JoinHandle<()>)>;

/// Subscribes `feed` to chain events during every `Ready` period of the session.
pub fn spawn_follower(feed: Arc<EventFeed>, store: &SessionStore) -> JoinHandle<()> {
    let mut changes = store.watch();

    tokio::spawn(async move {
        let mut pump: Pump = None;

        loop {
            let session = changes.borrow_and_update().clone();
            let ready = session.connection_status == ConnectionStatus::Ready;
            let connection = session.connection.clone().filter(|_| ready);

            let stale = pump.take_if(|(id, task)| {
                task.is_finished() || connection.as_ref().is_none_or(|current| current.id() != *id)
            });
            if let Some((_, task)) = stale {
                task.abort();
                debug!("event subscription stopped");
            }

            if pump.is_none() {
                if let Some(connection) = connection {
                    let id = connection.id();
                    pump = Some((id, tokio::spawn(follow_events(feed.clone(), connection))));
                }
            }

            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = pump_finished(&mut pump) => {
                    tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                }
            }
        }

        if let Some((_, task)) = pump {
            task.abort();
        }
    })
}

async fn pump_finished(pump: &mut Pump) {
    match pump {
        Some((_, task)) => {
            let _ = task.await;
        }
        None => std::future::pending().await,
    }
}

async fn follow_events(feed: Arc<EventFeed>, connection: ConnectionHandle) {
    let mut batches = match connection.subscribe_events().await {
        Ok(batches) => batches,
        Err(err) => {
            warn!(endpoint = connection.endpoint(), "event subscription failed: {}", err);
            return;
        }
    };

    info!(endpoint = connection.endpoint(), "following chain events");
    while let Some(batch) = batches.recv().await {
        feed.push_batch(&batch);
    }
    debug!("event stream ended");
}
