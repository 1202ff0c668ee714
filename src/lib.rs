//! A Rust implementation of JSON-RPC 2.0 peer endpoints over framed byte
//! streams.
//!
//! The crate has three load-bearing pieces.  The channel layer turns a raw
//! byte duplex into a sequence of whole JSON message bodies under one of a
//! family of framing disciplines ([`Framing`]).  The [`Server`] reads
//! framed request batches, dispatches them to user-registered handlers with
//! bounded concurrency, and writes one atomic reply per batch.  The
//! [`Client`] assigns request ids, matches inbound responses to pending
//! callers, and supports batches and notifications.
//!
//! Both sides bind to anything that implements `AsyncRead + AsyncWrite`;
//! dialing, listening, and transport security are the caller's business.

/// Re-export the exact async-trait macro we use, for compatibility
#[doc(hidden)]
pub use async_trait::async_trait;

mod channel;
mod client;
mod error;
mod handler;
mod server;
#[cfg(test)]
pub mod testing;
mod types;

pub use channel::{Channel, FrameError, Framing, FramingCodec, LSP_CONTENT_TYPE};
pub use client::{Client, ClientOptions, NotifyFn, Spec};
pub use error::{ErrorCode, HandlerError, Result, RpcError};
pub use handler::{Assigner, Context, Handler, Router, handler_fn, method_fn};
pub use server::{ReqContextFn, Server, ServerOptions};
pub use types::{ErrorObject, JsonValue, Request, Response, VERSION, to_params};
