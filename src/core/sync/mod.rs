mod engine;
mod reconcile;
mod service;

pub use engine::{ServiceSyncReport, SyncEngine, SyncPhase, SyncReport, SyncState};
pub use reconcile::{correlate, entry_from_remote, merge_remote, outbound_delta, Correlation};
pub use service::{
    GameEntryDelta, LibraryService, PushAck, PushItemError, PushReport, RemoteGameRecord,
    ServiceCapabilities, SyncField,
};
