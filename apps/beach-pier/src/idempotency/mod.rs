//! At-most-once admission of mutating requests, keyed by a client-supplied token.
//!
//! The coordinator owns a [`KeyStore`]; the store's check-and-insert is the only
//! source of truth, so any number of coordinators sharing one store (in-process
//! through an `Arc`, or across processes through Redis) accept a key exactly once.

mod coordinator;
mod layer;
mod store;

pub use coordinator::{Acceptance, IdempotencyCoordinator, IdempotencyRecord, Rejection};
pub use layer::{require_idempotency_key, IDEMPOTENCY_KEY_HEADER};
pub use store::{KeyStore, MemoryKeyStore, RedisKeyStore, StoreError};
