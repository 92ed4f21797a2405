// Local filesystem helpers: locks, free space, tree walking

pub mod lock;
pub mod space;
pub mod tree;

pub use lock::{Backoff, LockState, ReadLock, WriteState};
pub use tree::{TreeFile, TreeListing};
