//! # tegata-cap
//!
//! In-process object-capability runtime with promise pipelining.
//!
//! A capability is a reference to a callable object. This crate lets
//! application code treat every capability the same way regardless of what
//! is behind it: a live local server, a promise that will resolve to one
//! later, or an error. Calls issued against an unresolved capability are
//! buffered and forwarded in submission order once the resolution lands,
//! and results can be pipelined: a call may target a capability sitting
//! inside a response that has not arrived yet.
//!
//! The runtime is single-threaded and cooperative. Everything here is
//! `!Send` and must be created and driven inside a
//! `tokio::task::LocalSet::run_until` context; a remote RPC layer plugs in
//! by supplying its own hook variants behind the same traits.
//!
//! Entry points:
//! - [`new_client`] wraps a [`Server`] as a capability;
//! - [`new_promise_client`] wraps a future hook, queueing calls until it
//!   resolves;
//! - [`new_broken_client`] makes a capability that fails everything with a
//!   fixed error.

pub mod broken;
pub mod capability;
pub mod error;
pub mod payload;
pub mod promise;

mod local;
mod queued;
mod sender_queue;

pub use capability::{
    CallContext, CallContextHook, Client, ClientHook, Pipeline, PipelineHook, PipelineOp,
    RemotePromise, Request, RequestHook, Response, Server, VoidPromiseAndPipeline,
};
pub use error::{CapResult, Error};
pub use promise::{daemonize, promise_and_fulfiller, ForkedPromise, Fulfiller, Promise};

/// Wrap a server object as a capability.
pub fn new_client(server: impl Server + 'static) -> Client {
    Client::new(Box::new(local::LocalClient::new(Box::new(server))))
}

/// Wrap a future hook as a capability. Calls made before the promise
/// resolves are buffered and forwarded in submission order.
pub fn new_promise_client(promise: Promise<Box<dyn ClientHook>>) -> Client {
    Client::new(Box::new(queued::QueuedClient::new(promise)))
}

/// A capability that fails every operation with `error`.
pub fn new_broken_client(error: Error) -> Client {
    Client::new(broken::new_cap(error))
}
