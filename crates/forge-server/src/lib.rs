//! The server-side dispatcher (component C13): composes a router, a codec,
//! and a user handler into a request→response task, plus the event-stream
//! splicing helpers §4.13 point 5 calls for.
//!
//! Grounded in the same request-lifecycle shape `control`'s axum handlers
//! follow (decode, invoke, map errors to a wire response), but kept
//! transport-agnostic: this crate never depends on `axum` or `hyper`
//! directly, since concrete HTTP server frameworks are an external
//! collaborator per §1, not something the dispatcher owns.

pub mod codec;
pub mod dispatch;
pub mod eventstream;

pub use codec::{Codec, JsonCodec};
pub use dispatch::{DispatchError, Dispatcher, IncomingRequest, Operation, OperationHandler, OutgoingResponse};
pub use eventstream::{decode_messages, encode_messages};
