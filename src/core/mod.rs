pub mod comparator;
pub mod engine;
pub mod events;
pub mod resurrect;
pub mod scanner;
pub mod source;
pub mod watcher;

pub use comparator::{
    compute_operations, diff_trees, summarize_operations, OperationSummary, SyncOperation,
};
pub use engine::{translate_change, SyncEventStream, SyncLifecycleEvent, SyncOrchestrator};
pub use events::{
    relative_to_root, ChangeEvent, ChangeEventStream, ChangeKinds, ItemType, NotifyFlags,
    RawNotification,
};
pub use resurrect::ResurrectionMonitor;
pub use scanner::{enumerate_tree, enumerate_tree_map, ItemState};
pub use source::{ChangeEventSink, DirectoryNotifySource, NotificationSource};
pub use watcher::{RecursiveWatchEngine, WatchedDirectory};
