//! recsync Store - Record Store and Staleness Poller
//!
//! A [`RecordStore`] holds one paged, filtered view of a remote collection
//! together with the local edits that have not been written back yet. It
//! reconciles server responses against those edits by client token, so a
//! record created locally keeps its identity once the server assigns it a
//! business key.
//!
//! A [`StalenessPoller`] watches version markers for registered collections
//! and, when one advances, clears the matching read cache and reloads the
//! store.

pub mod events;
pub mod poller;
pub mod store;
pub mod telemetry;

pub use events::{
    EventBus, Listener, ListenerId, SaveHandle, SaveSummary, StoreEvent, StoreEventKind,
};
pub use poller::{PollReport, PollerConfig, PollerHandle, PollerMetrics, PollerSnapshot, StalenessPoller};
pub use store::{first_page_placement, LoadOptions, PlacementFn, RecordStore, Reloadable};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
