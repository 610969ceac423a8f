//! Job queue adapter (§4.E): enqueue against the opaque "graphile-worker"-
//! shaped `jobs` table with de-dupe keys, priority buckets, and a
//! dead-worker guard.

pub mod queue;

pub use queue::{JobKeyMode, JobQueue, Priority};
