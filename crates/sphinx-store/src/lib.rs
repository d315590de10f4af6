pub mod records;

pub use records::{AccountLock, RecordStore};
