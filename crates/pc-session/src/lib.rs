pub mod abi;
pub mod bringup;
pub mod events;
pub mod orchestrator;
pub mod session;
pub mod signer;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use abi::{
    AbiDocument, AbiError, AbiMessage, AbiParam, ContractHandle, ContractHandleCache,
    lookup_message, resolve_contract,
};
pub use bringup::{BringUp, BringUpConfig, RetryPolicy};
pub use events::{EventEntry, EventFeed, spawn_follower};
pub use orchestrator::{CallOrchestrator, CallStatusCell, Invocation, StatusSink, WeakSink};
pub use session::{Action, Session, SessionStore, reduce};
pub use signer::SignerResolver;
