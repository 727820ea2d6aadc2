//! # forge-collab: real-time collaborative text editing
//!
//! Concurrent editors converge on one shared text buffer:
//!
//! - [`document`]: the convergent document store (Yjs-compatible, via `yrs`)
//! - [`protocol`]: binary wire frames
//! - [`sequencer`]: per-peer causal delivery of deltas
//! - [`transport`]: reconnecting relay client with resync
//! - [`presence`]: cursors, selections and who is in the room
//! - [`binding`]: keeps a visible editor surface and the document in step
//! - [`relay`]: the room-addressed WebSocket relay
//! - [`update_check`]: rejects malformed updates before they reach `yrs`
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐
//! │  Client A    │    │  Client B    │
//! │  (surface)   │    │  (surface)   │
//! └──────┬───────┘    └──────┬───────┘
//!        │ binding            │ binding
//!        ▼                    ▼
//!  DocumentStore        DocumentStore
//!        │ transport          │ transport
//!        └────────┬───────────┘
//!                 ▼
//!        ┌─────────────────┐
//!        │  Relay (rooms)  │
//!        │  doc + fan-out  │
//!        └─────────────────┘
//! ```

pub mod binding;
pub mod broadcast;
pub mod document;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod sequencer;
pub mod transport;
pub mod update_check;

pub use binding::{Binding, BufferSurface, EditorBinding, EditorSurface, SurfaceEdit};
pub use document::{
    ChangeOrigin, DocChange, DocumentError, DocumentStore, LocalUpdate, OriginTag, Subscription,
    TextChange, TextEdit,
};
pub use presence::{AwarenessMessage, CursorPosition, PeerPresence, PresenceRoom, SelectionRange};
pub use protocol::{room_doc_id, MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use relay::{RelayConfig, RelayError, RelayServer};
pub use transport::{
    ConnectionState, RelayTransport, RemoteUpdate, TransportConfig, TransportError,
    TransportEvent, TransportHandle,
};
