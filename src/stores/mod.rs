//! [`SessionStore`](crate::SessionStore) implementations.
//!
//! | Store              | Feature           | Backend                              |
//! |--------------------|-------------------|--------------------------------------|
//! | [`MemoryStore`]    | always            | in-process [`MemoryBackend`]         |
//! | `WebSocketStore`   | `store-websocket` | JSON document gateway over WebSocket |

pub mod memory;

#[cfg(feature = "store-websocket")]
pub mod websocket;

pub use memory::{MemoryBackend, MemoryStore};

#[cfg(feature = "store-websocket")]
pub use websocket::WebSocketStore;
