//! The local call path: wrapping a [`Server`] as a capability, and the
//! per-call machinery shared by every hook variant.
//!
//! A [`LocalCallContext`] carries one invocation's params, results,
//! cancellation state, and tail-call chaining; it is shared between the
//! request side and the dispatch side. [`LocalRequest`] turns a built
//! message into a call through any hook. [`LocalClient`] dispatches into a
//! server on the next loop turn, never synchronously: the server may belong
//! elsewhere on the loop, synchronous dispatch invites re-entrancy
//! deadlocks, and queued forwarding's ordering guarantee rests on this turn
//! boundary.

use std::cell::RefCell;
use std::rc::Rc;

use crate::capability::{
    CallContext, CallContextHook, ClientHook, PipelineHook, PipelineOp, Pipeline, RemotePromise,
    Request, RequestHook, Response, Server, VoidPromiseAndPipeline,
};
use crate::error::{CapResult, Error};
use crate::payload::{Payload, PayloadBuilder, PayloadReader};
use crate::promise::{daemonize, promise_and_fulfiller, Fulfiller, Promise};
use crate::queued::QueuedPipeline;

// ============================================================================
// Call context
// ============================================================================

struct ContextInner {
    /// The request message; present until params are released.
    request: Option<Payload>,
    /// The response, allocated on first demand or taken over from a tail
    /// call. Snapshot-cloned, never moved out, so the return branch and the
    /// pipeline never race over it.
    response: Option<Response>,
    /// Added ref of the target hook, held so the callee outlives the call.
    _client: Box<dyn ClientHook>,
    /// Fired when the server opts into async cancellation.
    cancel_allowed: Option<Fulfiller<()>>,
    /// Waiter for the pipeline of a tail-called request, if anyone asked.
    tail_call_pipeline: Option<Fulfiller<Box<dyn PipelineHook>>>,
    tail_called: bool,
    cancel_requested: bool,
}

/// State of one in-flight invocation, shared by request and dispatch sides.
#[derive(Clone)]
pub(crate) struct LocalCallContext {
    inner: Rc<RefCell<ContextInner>>,
}

impl LocalCallContext {
    pub fn new(
        request: Payload,
        client: Box<dyn ClientHook>,
        cancel_allowed: Fulfiller<()>,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ContextInner {
                request: Some(request),
                response: None,
                _client: client,
                cancel_allowed: Some(cancel_allowed),
                tail_call_pipeline: None,
                tail_called: false,
                cancel_requested: false,
            })),
        }
    }

    /// The response, allocating an empty one if the server never touched
    /// results (a reply must exist even for void methods).
    fn force_response(&self) -> Response {
        self.inner
            .borrow_mut()
            .response
            .get_or_insert_with(|| Response::new(Payload::new()))
            .clone()
    }

    fn set_cancel_requested(&self) {
        self.inner.borrow_mut().cancel_requested = true;
    }
}

impl CallContextHook for LocalCallContext {
    fn add_ref(&self) -> Box<dyn CallContextHook> {
        Box::new(self.clone())
    }

    fn get_params(&self) -> CapResult<PayloadReader> {
        self.inner
            .borrow()
            .request
            .as_ref()
            .map(Payload::root_reader)
            .ok_or_else(|| Error::usage("cannot access params after release_params()"))
    }

    fn release_params(&self) {
        self.inner.borrow_mut().request = None;
    }

    fn get_results(&self, _size_hint: Option<usize>) -> CapResult<PayloadBuilder> {
        let mut inner = self.inner.borrow_mut();
        if inner.tail_called {
            return Err(Error::usage(
                "cannot access results after this call was tail-called",
            ));
        }
        Ok(inner
            .response
            .get_or_insert_with(|| Response::new(Payload::new()))
            .builder())
    }

    fn tail_call(&self, request: Request) -> Promise<()> {
        let VoidPromiseAndPipeline { promise, pipeline } = self.direct_tail_call(request);
        if let Some(fulfiller) = self.inner.borrow_mut().tail_call_pipeline.take() {
            fulfiller.fulfill(pipeline);
        }
        promise
    }

    fn direct_tail_call(&self, mut request: Request) -> VoidPromiseAndPipeline {
        {
            let inner = self.inner.borrow();
            if inner.response.is_some() {
                let error =
                    Error::usage("cannot tail-call after the results struct was initialized");
                return VoidPromiseAndPipeline {
                    promise: Promise::err(error.clone()),
                    pipeline: crate::broken::new_pipeline(error),
                };
            }
            if inner.tail_called {
                let error = Error::usage("a call may only be tail-called once");
                return VoidPromiseAndPipeline {
                    promise: Promise::err(error.clone()),
                    pipeline: crate::broken::new_pipeline(error),
                };
            }
        }
        self.inner.borrow_mut().tail_called = true;
        self.release_params();

        let RemotePromise { promise, pipeline } = request.send();

        // The tail's response becomes this call's response; the caller
        // observes exactly one result.
        let state = self.inner.clone();
        let completion = Promise::from_future(async move {
            let tail_response = promise.await?;
            state.borrow_mut().response = Some(tail_response);
            Ok(())
        });

        VoidPromiseAndPipeline {
            promise: completion,
            pipeline: pipeline.into_hook(),
        }
    }

    fn on_tail_call(&self) -> Promise<Box<dyn PipelineHook>> {
        let (promise, fulfiller) = promise_and_fulfiller();
        self.inner.borrow_mut().tail_call_pipeline = Some(fulfiller);
        promise
    }

    fn allow_async_cancellation(&self) -> CapResult<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.request.is_some() {
            return Err(Error::usage(
                "must call release_params() before allow_async_cancellation()",
            ));
        }
        if let Some(fulfiller) = inner.cancel_allowed.take() {
            fulfiller.fulfill(());
        }
        Ok(())
    }

    fn is_canceled(&self) -> bool {
        self.inner.borrow().cancel_requested
    }
}

/// Drop sentinel attached to the client's response promise: losing it means
/// the client dropped interest.
struct CancelOnDrop {
    context: LocalCallContext,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.context.set_cancel_requested();
    }
}

// ============================================================================
// Request
// ============================================================================

struct LocalRequest {
    /// Consumed by `send`; a spent request refuses further use.
    message: Option<Payload>,
    interface_id: u64,
    method_id: u16,
    client: Box<dyn ClientHook>,
}

/// A fresh outbound request routed through `client`.
pub(crate) fn new_local_request(
    interface_id: u64,
    method_id: u16,
    _size_hint: Option<usize>,
    client: Box<dyn ClientHook>,
) -> Request {
    Request::from_hook(Box::new(LocalRequest {
        message: Some(Payload::new()),
        interface_id,
        method_id,
        client,
    }))
}

impl RequestHook for LocalRequest {
    fn get(&mut self) -> CapResult<PayloadBuilder> {
        self.message
            .as_ref()
            .map(Payload::root_builder)
            .ok_or_else(|| Error::usage("request was already sent"))
    }

    fn send(&mut self) -> RemotePromise {
        let Some(message) = self.message.take() else {
            let error = Error::usage("send() may only be called once per request");
            return RemotePromise {
                promise: Promise::err(error.clone()),
                pipeline: Pipeline::new(crate::broken::new_pipeline(error)),
            };
        };

        let (cancel_allowed_promise, cancel_allowed) = promise_and_fulfiller::<()>();
        let context = LocalCallContext::new(message, self.client.add_ref(), cancel_allowed);

        let VoidPromiseAndPipeline { promise, pipeline } =
            self.client
                .call(self.interface_id, self.method_id, context.add_ref());

        // Fork the completion so the client dropping its copy does not by
        // itself cancel the call.
        let forked = promise.fork();

        // Keepalive branch: holds the context and runs until either the call
        // completes or the server has opted into cancellation. While it
        // lives, so does the dispatched work.
        let keepalive = forked
            .add_branch()
            .attach(context.clone())
            .exclusive_join(cancel_allowed_promise);
        daemonize(keepalive);

        let completion_branch = forked.add_branch();
        let return_context = context.clone();
        let response_promise = Promise::from_future(async move {
            completion_branch.await?;
            Ok(return_context.force_response())
        })
        .attach(CancelOnDrop { context });

        RemotePromise {
            promise: response_promise,
            pipeline: Pipeline::new(pipeline),
        }
    }
}

// ============================================================================
// Local client & pipeline
// ============================================================================

/// A hook wrapping a server object. Terminally resolved from birth.
pub(crate) struct LocalClient {
    server: Rc<RefCell<Box<dyn Server>>>,
}

impl LocalClient {
    pub fn new(server: Box<dyn Server>) -> LocalClient {
        LocalClient {
            server: Rc::new(RefCell::new(server)),
        }
    }
}

impl ClientHook for LocalClient {
    fn add_ref(&self) -> Box<dyn ClientHook> {
        Box::new(LocalClient {
            server: self.server.clone(),
        })
    }

    fn call(
        &self,
        interface_id: u64,
        method_id: u16,
        context: Box<dyn CallContextHook>,
    ) -> VoidPromiseAndPipeline {
        let server = self.server.clone();
        let client_ref = self.add_ref();
        let dispatch_context = context.add_ref();
        let dispatch = Promise::from_future(async move {
            // Never dispatch in the turn that issued the call.
            tokio::task::yield_now().await;
            let promise = server.borrow_mut().dispatch_call(
                interface_id,
                method_id,
                CallContext::new(dispatch_context),
            );
            let result = promise.await;
            // The server must not be destroyed before dispatch completes.
            drop(client_ref);
            result
        });

        let forked = dispatch.fork();

        // Register the tail-call waiter before the server can run.
        let tail_pipeline = context.on_tail_call();

        let pipeline_context = context.add_ref();
        let dispatch_done = forked.add_branch();
        let pipeline_branch = Promise::from_future(async move {
            dispatch_done.await?;
            pipeline_context.release_params();
            Ok(Box::new(LocalPipeline::new(pipeline_context)?) as Box<dyn PipelineHook>)
        });

        // Whichever settles first wins: if the server tail-calls before
        // producing results, pipelining follows the tail call.
        let pipeline_promise = pipeline_branch.exclusive_join(tail_pipeline);

        let completion = forked.add_branch().attach(context);

        VoidPromiseAndPipeline {
            promise: completion,
            pipeline: Box::new(QueuedPipeline::new(pipeline_promise)),
        }
    }

    fn get_resolved(&self) -> Option<Box<dyn ClientHook>> {
        None
    }

    fn when_more_resolved(&self) -> Option<Promise<Box<dyn ClientHook>>> {
        None
    }
}

/// Pipeline over a completed local call's results.
struct LocalPipeline {
    _context: Box<dyn CallContextHook>,
    results: PayloadReader,
}

impl LocalPipeline {
    fn new(context: Box<dyn CallContextHook>) -> CapResult<LocalPipeline> {
        let results = context.get_results(None)?.as_reader();
        Ok(LocalPipeline {
            _context: context,
            results,
        })
    }
}

impl PipelineHook for LocalPipeline {
    fn add_ref(&self) -> Box<dyn PipelineHook> {
        Box::new(LocalPipeline {
            _context: self._context.add_ref(),
            results: self.results.clone(),
        })
    }

    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Box<dyn ClientHook> {
        self.results.get_pipelined_cap(ops)
    }
}
