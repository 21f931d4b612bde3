use pc_api_types::{ChainInfo, ConnectionStatus, ContractRef, KeystoreStatus};
use pc_node_client::ConnectionHandle;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub version: u64,
    /// Present once the transport has reported a connect.
    pub connection: Option<ConnectionHandle>,
    pub connection_status: ConnectionStatus,
    pub keystore_status: KeystoreStatus,
    pub chain_info: Option<ChainInfo>,
    pub selected_contract: Option<ContractRef>,
    /// Address that originates calls; empty until one is selected.
    pub caller: String,
    pub last_error: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            version: 0,
            connection: None,
            connection_status: ConnectionStatus::Disconnected,
            keystore_status: KeystoreStatus::NotLoaded,
            chain_info: None,
            selected_contract: None,
            caller: String::new(),
            last_error: None,
        }
    }
}

impl Session {
    pub fn is_ready(&self) -> bool {
        self.connection_status == ConnectionStatus::Ready
            && self.keystore_status == KeystoreStatus::Loaded
    }
}

#[derive(Debug, Clone)]
pub enum Action {
    ConnectRequested,
    ConnectionOpened(ConnectionHandle),
    ConnectionEstablished,
    ConnectionClosed,
    ConnectionFailed(String),
    KeystoreReady,
    KeystoreFailed(String),
    ChainInfoFetched(ChainInfo),
    ContractResolved(Option<ContractRef>),
    CallerSelected(String),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::ConnectRequested => "ConnectRequested",
            Action::ConnectionOpened(_) => "ConnectionOpened",
            Action::ConnectionEstablished => "ConnectionEstablished",
            Action::ConnectionClosed => "ConnectionClosed",
            Action::ConnectionFailed(_) => "ConnectionFailed",
            Action::KeystoreReady => "KeystoreReady",
            Action::KeystoreFailed(_) => "KeystoreFailed",
            Action::ChainInfoFetched(_) => "ChainInfoFetched",
            Action::ContractResolved(_) => "ContractResolved",
            Action::CallerSelected(_) => "CallerSelected",
        }
    }
}

/// Pure transition function. Transitions the state machine does not allow
/// leave the state unchanged. The version counter is owned by the store.
pub fn reduce(state: &Session, action: Action) -> Session {
    use ConnectionStatus as Conn;

    let mut next = state.clone();
    match action {
        Action::ConnectRequested => match state.connection_status {
            Conn::Disconnected | Conn::Error => {
                next.connection_status = Conn::Connecting;
                next.keystore_status = KeystoreStatus::NotLoaded;
            }
            _ => return ignored(state, "ConnectRequested"),
        },
        Action::ConnectionOpened(handle) => match state.connection_status {
            // A transport-level reconnect arrives without a fresh ConnectRequested.
            Conn::Connecting | Conn::Disconnected | Conn::Error => {
                next.connection = Some(handle);
                next.connection_status = Conn::Connected;
                next.keystore_status = KeystoreStatus::NotLoaded;
            }
            _ => return ignored(state, "ConnectionOpened"),
        },
        Action::ConnectionEstablished => match state.connection_status {
            Conn::Connected => {
                next.connection_status = Conn::Ready;
                next.last_error = None;
            }
            _ => return ignored(state, "ConnectionEstablished"),
        },
        Action::ConnectionClosed => {
            next.connection_status = Conn::Disconnected;
            next.keystore_status = KeystoreStatus::NotLoaded;
        }
        Action::ConnectionFailed(message) => {
            next.connection_status = Conn::Error;
            next.keystore_status = KeystoreStatus::NotLoaded;
            next.last_error = Some(message);
        }
        Action::KeystoreReady => match state.connection_status {
            Conn::Ready => next.keystore_status = KeystoreStatus::Loaded,
            _ => return ignored(state, "KeystoreReady"),
        },
        Action::KeystoreFailed(message) => match state.connection_status {
            Conn::Ready => {
                next.keystore_status = KeystoreStatus::Error;
                next.last_error = Some(message);
            }
            _ => return ignored(state, "KeystoreFailed"),
        },
        Action::ChainInfoFetched(info) => next.chain_info = Some(info),
        Action::ContractResolved(contract) => next.selected_contract = contract,
        Action::CallerSelected(caller) => next.caller = caller,
    }
    next
}

fn ignored(state: &Session, action: &str) -> Session {
    debug!(action, status = ?state.connection_status, "ignoring transition");
    state.clone()
}

pub type SubscriberId = u64;
type Subscriber = Box<dyn Fn(&Session) + Send + Sync>;

/// Owns the session. Dispatches are serialized; readers always get a
/// complete post-dispatch snapshot.
pub struct SessionStore {
    current: Mutex<Arc<Session>>,
    dispatching: Mutex<()>,
    subscribers: Mutex<Vec<(SubscriberId, Subscriber)>>,
    next_subscriber: AtomicU64,
    changes: watch::Sender<Arc<Session>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionStore {
    pub fn new() -> Self {
        let initial = Arc::new(Session::default());
        let (changes, _) = watch::channel(initial.clone());
        Self {
            current: Mutex::new(initial),
            dispatching: Mutex::new(()),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
            changes,
        }
    }

    pub fn state(&self) -> Arc<Session> {
        lock(&self.current).clone()
    }

    /// Applies `action` and notifies subscribers before returning.
    /// Subscribers must not dispatch from inside their callback.
    pub fn dispatch(&self, action: Action) -> Arc<Session> {
        let _serial = lock(&self.dispatching);
        let name = action.name();

        let previous = self.state();
        let mut next = reduce(&previous, action);
        next.version = previous.version + 1;
        let next = Arc::new(next);

        *lock(&self.current) = next.clone();
        debug!(
            action = name,
            version = next.version,
            connection = ?next.connection_status,
            keystore = ?next.keystore_status,
            "session dispatch"
        );

        for (_, subscriber) in lock(&self.subscribers).iter() {
            subscriber(&next);
        }
        self.changes.send_replace(next.clone());
        next
    }

    pub fn subscribe(&self, subscriber: impl Fn(&Session) + Send + Sync + 'static) -> SubscriberId {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscribers).push((id, Box::new(subscriber)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        lock(&self.subscribers).retain(|(existing, _)| *existing != id);
    }

    /// Async view of the same snapshots, for collaborators running as tasks.
    pub fn watch(&self) -> watch::Receiver<Arc<Session>> {
        self.changes.subscribe()
    }
}
