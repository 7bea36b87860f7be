//! The capability hook interface and the handles application code holds.
//!
//! A capability is an unforgeable reference to a callable object. At runtime
//! it is represented by a [`ClientHook`]: local hooks wrap a [`Server`],
//! queued hooks buffer calls for a capability that is still a promise, and
//! broken hooks fail everything with a seeded error. A remote RPC layer can
//! supply further hook variants; everything in this crate goes through the
//! same trait so callers never need to know which variant they hold.
//!
//! ```text
//!   Client ──new_call──▶ Request ──send──▶ RemotePromise
//!                                            │    └── Pipeline ── get_pipelined_cap ──▶ Client
//!                                            └── Promise<Response>
//! ```

use crate::error::CapResult;
use crate::payload::{Payload, PayloadBuilder, PayloadReader};
use crate::promise::Promise;

// ============================================================================
// Hook traits
// ============================================================================

/// The runtime handle behind a capability.
pub trait ClientHook {
    /// Another shared handle to the same hook.
    fn add_ref(&self) -> Box<dyn ClientHook>;

    /// A fresh outbound request whose `send` routes through this hook.
    fn new_call(&self, interface_id: u64, method_id: u16, size_hint: Option<usize>) -> Request {
        crate::local::new_local_request(interface_id, method_id, size_hint, self.add_ref())
    }

    /// Issue a call with an existing context. Returns the void completion
    /// and a pipeline over the not-yet-arrived result.
    fn call(
        &self,
        interface_id: u64,
        method_id: u16,
        context: Box<dyn CallContextHook>,
    ) -> VoidPromiseAndPipeline;

    /// The concrete hook, if resolution has already landed. `Some` exactly
    /// when no further resolution is possible.
    fn get_resolved(&self) -> Option<Box<dyn ClientHook>>;

    /// For promise hooks, the next-resolution hook; `None` for hooks that
    /// will never resolve further.
    fn when_more_resolved(&self) -> Option<Promise<Box<dyn ClientHook>>>;

    /// Completes once no further resolution will occur: the transitive
    /// closure of [`ClientHook::when_more_resolved`].
    fn when_resolved(&self) -> Promise<()> {
        match self.when_more_resolved() {
            Some(promise) => Promise::from_future(async move {
                let resolved = promise.await?;
                resolved.when_resolved().await
            }),
            None => Promise::ok(()),
        }
    }

    /// Identity token for collaborating layers to recognize their own hooks;
    /// `0` for anonymous hooks. Stable for the lifetime of the hook.
    fn get_brand(&self) -> usize {
        0
    }
}

/// Completion-and-pipeline pair returned by [`ClientHook::call`].
pub struct VoidPromiseAndPipeline {
    pub promise: Promise<()>,
    pub pipeline: Box<dyn PipelineHook>,
}

/// One step along the pointer path inside a result message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOp {
    Noop,
    GetPointerField(u16),
}

/// The runtime handle behind a pipeline: resolves sub-capabilities reachable
/// in a result that has not arrived yet.
pub trait PipelineHook {
    fn add_ref(&self) -> Box<dyn PipelineHook>;

    /// The capability at `ops` in the (eventual) result. Implementations
    /// that must defer copy the ops; callers keep ownership of the slice.
    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Box<dyn ClientHook>;
}

/// Server-side state of one in-flight invocation, shared between the
/// request side and the dispatch side.
pub trait CallContextHook {
    fn add_ref(&self) -> Box<dyn CallContextHook>;

    /// Reader over the request message. Fails once params were released.
    fn get_params(&self) -> CapResult<PayloadReader>;

    /// Drop the request message, freeing its arena.
    fn release_params(&self);

    /// Builder over the response message, allocated on first demand. Fails
    /// after this call has been tail-called away.
    fn get_results(&self, size_hint: Option<usize>) -> CapResult<PayloadBuilder>;

    /// Forward this call to another request: the tail request's completion
    /// becomes this call's completion and its pipeline is delivered to the
    /// [`CallContextHook::on_tail_call`] waiter.
    fn tail_call(&self, request: Request) -> Promise<()>;

    /// Like `tail_call`, but hands back the completion-and-pipeline pair
    /// directly instead of going through the waiter. Releases params.
    fn direct_tail_call(&self, request: Request) -> VoidPromiseAndPipeline;

    /// One-shot future firing with the tail-called pipeline, or never if no
    /// tail call occurs.
    fn on_tail_call(&self) -> Promise<Box<dyn PipelineHook>>;

    /// Opt this call into asynchronous cancellation. Params must already be
    /// released.
    fn allow_async_cancellation(&self) -> CapResult<()>;

    /// Whether the client has dropped interest in the result.
    fn is_canceled(&self) -> bool;
}

/// The hook behind an unsent [`Request`].
pub trait RequestHook {
    /// Builder over the params root. Fails once the request was sent.
    fn get(&mut self) -> CapResult<PayloadBuilder>;

    /// Send the call. Consumes the message; a second send fails with a
    /// usage error on the returned promise.
    fn send(&mut self) -> RemotePromise;
}

// ============================================================================
// Application-facing handles
// ============================================================================

/// A capability, as held by application code. Clones share the hook.
pub struct Client {
    pub hook: Box<dyn ClientHook>,
}

impl Client {
    pub fn new(hook: Box<dyn ClientHook>) -> Self {
        Self { hook }
    }

    /// Start building a call on this capability.
    pub fn new_call(&self, interface_id: u64, method_id: u16, size_hint: Option<usize>) -> Request {
        self.hook.new_call(interface_id, method_id, size_hint)
    }

    /// Completes once the capability is fully resolved (or failed).
    pub fn when_resolved(&self) -> Promise<()> {
        self.hook.when_resolved()
    }
}

impl Clone for Client {
    fn clone(&self) -> Self {
        Self {
            hook: self.hook.add_ref(),
        }
    }
}

/// An unsent call: params builder plus the target it will route through.
pub struct Request {
    hook: Box<dyn RequestHook>,
}

impl Request {
    pub(crate) fn from_hook(hook: Box<dyn RequestHook>) -> Self {
        Self { hook }
    }

    /// Builder over the params root.
    pub fn get(&mut self) -> CapResult<PayloadBuilder> {
        self.hook.get()
    }

    /// Send the call, yielding the response promise and a pipeline for
    /// calls on the not-yet-arrived result.
    pub fn send(&mut self) -> RemotePromise {
        self.hook.send()
    }
}

/// What a sent call hands back: the response future and the pipeline.
pub struct RemotePromise {
    pub promise: Promise<Response>,
    pub pipeline: Pipeline,
}

/// An arrived response: an immutable reader plus ownership of the backing
/// arena. Clones are snapshots of the same arena.
#[derive(Clone)]
pub struct Response {
    payload: Payload,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response").finish_non_exhaustive()
    }
}

impl Response {
    pub(crate) fn new(payload: Payload) -> Self {
        Self { payload }
    }

    /// Reader over the response root.
    pub fn get(&self) -> PayloadReader {
        self.payload.root_reader()
    }

    pub(crate) fn builder(&self) -> PayloadBuilder {
        self.payload.root_builder()
    }
}

/// Pipeline over a pending result.
pub struct Pipeline {
    hook: Box<dyn PipelineHook>,
}

impl Pipeline {
    pub fn new(hook: Box<dyn PipelineHook>) -> Self {
        Self { hook }
    }

    /// The capability at `ops` in the eventual result. Calls made on it are
    /// delivered once the result lands; they never overtake it.
    pub fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Client {
        Client::new(self.hook.get_pipelined_cap(ops))
    }

    pub(crate) fn into_hook(self) -> Box<dyn PipelineHook> {
        self.hook
    }
}

impl Clone for Pipeline {
    fn clone(&self) -> Self {
        Self {
            hook: self.hook.add_ref(),
        }
    }
}

/// The server's view of one incoming call.
pub struct CallContext {
    hook: Box<dyn CallContextHook>,
}

impl CallContext {
    pub fn new(hook: Box<dyn CallContextHook>) -> Self {
        Self { hook }
    }

    pub fn get_params(&self) -> CapResult<PayloadReader> {
        self.hook.get_params()
    }

    pub fn release_params(&self) {
        self.hook.release_params()
    }

    pub fn get_results(&self, size_hint: Option<usize>) -> CapResult<PayloadBuilder> {
        self.hook.get_results(size_hint)
    }

    /// Forward this call to `request`; the caller observes exactly one
    /// result, the tail's.
    pub fn tail_call(&self, request: Request) -> Promise<()> {
        self.hook.tail_call(request)
    }

    /// Opt into asynchronous cancellation. Only once both this has been
    /// called and the client has dropped interest may the dispatch future
    /// be dropped.
    pub fn allow_async_cancellation(&self) -> CapResult<()> {
        self.hook.allow_async_cancellation()
    }

    pub fn is_canceled(&self) -> bool {
        self.hook.is_canceled()
    }
}

impl Clone for CallContext {
    fn clone(&self) -> Self {
        Self {
            hook: self.hook.add_ref(),
        }
    }
}

/// A callable object, wrapped into a capability by [`crate::new_client`].
///
/// `dispatch_call` must not block; long work belongs in the returned
/// promise. Dispatch always happens at least one loop turn after the call
/// was issued.
pub trait Server {
    fn dispatch_call(
        &mut self,
        interface_id: u64,
        method_id: u16,
        context: CallContext,
    ) -> Promise<()>;
}
