pub mod codec;
pub mod fixed_store;
pub mod length_prefixed_store;
pub mod lock;
pub mod record;
pub mod record_store;

pub use fixed_store::FixedSlotStore;
pub use length_prefixed_store::LengthPrefixedStore;
pub use lock::{AdvisoryLock, ConcurrencyGuard, DefaultLock, FileLock, LockMode, NoopLock};
pub use record::{Key, Offset, Record, RecordLayout, TOMBSTONE_KEY};
pub use record_store::{RecordStore, Replay};
