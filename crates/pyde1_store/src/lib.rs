//! Pre-sequence ring buffer, write-ahead-logged sequence/event store, and
//! legacy export: the Sequence Recorder subsystem in full. The store's
//! `rusqlite` connection is owned exclusively by a dedicated background
//! thread spawned from [`store::Store::open`]; every other component talks
//! to it only through the [`store::Store`] handle.

pub mod export;
pub mod recorder;
pub mod ring_buffer;
pub mod schema;
pub mod store;

pub use export::{render as render_export, ShotSampleRow};
pub use recorder::{NullResourceSnapshotProvider, ResourceSnapshotProvider, SequenceRecorder};
pub use ring_buffer::RingBuffer;
pub use store::{SequenceClose, SequenceSnapshot, Store, StoreBackedLastUploaded};
