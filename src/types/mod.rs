//! Core types shared by the runtime and the primitives.
//!
//! - [`id`]: identifier types (`FibrilId`, primitive handles) and `Time`

pub mod id;

pub use id::{CondvarId, FibrilId, MutexId, RwLockId, SemaphoreId, Time};
