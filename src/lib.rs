pub mod config;
pub mod core;
pub mod error;
pub mod logging;

pub use config::{FilterConfig, NotifyClasses, SyncConfig, WatchConfig, WatchMode};
pub use crate::core::{
    ChangeEvent, ChangeEventSink, ChangeEventStream, ChangeKinds, ItemState, ItemType,
    OperationSummary, RecursiveWatchEngine, ResurrectionMonitor, SyncEventStream,
    SyncLifecycleEvent, SyncOperation, SyncOrchestrator,
};
pub use error::{SyncError, WatchError};
