//! Store abstractions and implementations.
//!
//! The sync engine sits on top of two externally-synchronized stores:
//!
//! - [`LocalStore`](traits::LocalStore): the device-local persistent store.
//!   Queue records live here so unsent mutations survive restarts.
//! - [`RemoteStore`](traits::RemoteStore): the opaque remote service,
//!   reachable via request/response plus a per-conversation pub/sub channel.
//!
//! `memory.rs` provides DashMap-backed implementations (the remote one with
//! fault injection for tests); `sqlite.rs` provides the durable local store.

pub mod traits;
pub mod memory;
pub mod sqlite;
