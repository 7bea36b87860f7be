//! Queued capabilities: hooks and pipelines over a resolution that has not
//! arrived yet.
//!
//! Both variants share the same shape: an `Rc<RefCell<_>>` state block with
//! a `redirect` slot plus FIFO queues of parked work, and a driver task that
//! awaits the resolution future and then drains everything in one fixed
//! order. For the client that order is: write `redirect`, forward queued
//! calls in submission order, fulfill `when_more_resolved` observers. A
//! forwarded local call always crosses at least one further loop turn, so an
//! observer sees the resolution after its earlier calls were forwarded and
//! before any of their completions arrive.
//!
//! The driver holds the resolution future. An abort-on-drop guard is shared
//! between the handle and every promise handed out, so the resolution stays
//! alive exactly as long as anything can still observe it.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tokio::task::JoinHandle;

use crate::broken;
use crate::capability::{
    CallContextHook, ClientHook, PipelineHook, PipelineOp, VoidPromiseAndPipeline,
};
use crate::error::Error;
use crate::promise::{promise_and_fulfiller, Fulfiller, Promise};
use crate::sender_queue::SenderQueue;

/// Aborts the driver task once the last holder is gone.
struct TaskGuard {
    handle: JoinHandle<()>,
}

impl TaskGuard {
    fn new(handle: JoinHandle<()>) -> Rc<Self> {
        Rc::new(Self { handle })
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ============================================================================
// Queued client
// ============================================================================

struct QueuedCall {
    interface_id: u64,
    method_id: u16,
    context: Box<dyn CallContextHook>,
    completion: Fulfiller<Promise<()>>,
    pipeline: Fulfiller<Box<dyn PipelineHook>>,
}

struct ClientInner {
    /// The resolved hook, once known. A failed resolution redirects to a
    /// broken hook carrying the error.
    redirect: Option<Box<dyn ClientHook>>,
    /// Calls parked until resolution; forwarded first, in submission order.
    call_forwarding: Vec<QueuedCall>,
    /// `when_more_resolved` observers; fulfilled after forwarding.
    client_resolution: SenderQueue<(), Box<dyn ClientHook>>,
}

impl ClientInner {
    fn resolve(state: &Rc<RefCell<ClientInner>>, result: Result<Box<dyn ClientHook>, Error>) {
        let client = match result {
            Ok(hook) => hook,
            Err(error) => {
                tracing::debug!(%error, "queued capability resolved to an error");
                broken::new_cap(error)
            }
        };
        state.borrow_mut().redirect = Some(client.add_ref());

        let calls = std::mem::take(&mut state.borrow_mut().call_forwarding);
        for call in calls {
            let VoidPromiseAndPipeline { promise, pipeline } =
                client.call(call.interface_id, call.method_id, call.context);
            call.completion.fulfill(promise);
            call.pipeline.fulfill(pipeline);
        }

        let observers = state.borrow_mut().client_resolution.drain();
        for ((), fulfiller) in observers {
            fulfiller.fulfill(client.add_ref());
        }
    }
}

/// A hook that buffers calls until its resolution future settles, then
/// forwards them in submission order.
pub(crate) struct QueuedClient {
    inner: Rc<RefCell<ClientInner>>,
    driver: Rc<TaskGuard>,
}

impl QueuedClient {
    pub fn new(promise: Promise<Box<dyn ClientHook>>) -> QueuedClient {
        let inner = Rc::new(RefCell::new(ClientInner {
            redirect: None,
            call_forwarding: Vec::new(),
            client_resolution: SenderQueue::new(),
        }));
        // The driver holds the state weakly: once the handle and every
        // handed-out promise are gone, nothing can observe the resolution
        // and the state may die with them.
        let weak = Rc::downgrade(&inner);
        let handle = tokio::task::spawn_local(async move {
            let result = promise.await;
            if let Some(state) = Weak::upgrade(&weak) {
                ClientInner::resolve(&state, result);
            }
        });
        QueuedClient {
            inner,
            driver: TaskGuard::new(handle),
        }
    }

    fn keepalive(&self) -> (Rc<RefCell<ClientInner>>, Rc<TaskGuard>) {
        (self.inner.clone(), self.driver.clone())
    }
}

impl ClientHook for QueuedClient {
    fn add_ref(&self) -> Box<dyn ClientHook> {
        Box::new(QueuedClient {
            inner: self.inner.clone(),
            driver: self.driver.clone(),
        })
    }

    fn call(
        &self,
        interface_id: u64,
        method_id: u16,
        context: Box<dyn CallContextHook>,
    ) -> VoidPromiseAndPipeline {
        if let Some(client) = &self.inner.borrow().redirect {
            return client.call(interface_id, method_id, context);
        }

        // The forwarded call's completion and pipeline go to independent
        // consumers, so each half gets its own one-shot.
        let (completion_promise, completion) = promise_and_fulfiller::<Promise<()>>();
        let (pipeline_promise, pipeline) = promise_and_fulfiller::<Box<dyn PipelineHook>>();
        self.inner.borrow_mut().call_forwarding.push(QueuedCall {
            interface_id,
            method_id,
            context,
            completion,
            pipeline,
        });

        let promise = Promise::from_future(async move { completion_promise.await?.await })
            .attach(self.keepalive());
        let pipeline = QueuedPipeline::new(pipeline_promise.attach(self.keepalive()));
        VoidPromiseAndPipeline {
            promise,
            pipeline: Box::new(pipeline),
        }
    }

    fn get_resolved(&self) -> Option<Box<dyn ClientHook>> {
        self.inner
            .borrow()
            .redirect
            .as_ref()
            .map(|client| client.add_ref())
    }

    fn when_more_resolved(&self) -> Option<Promise<Box<dyn ClientHook>>> {
        if let Some(client) = &self.inner.borrow().redirect {
            return Some(Promise::ok(client.add_ref()));
        }
        let promise = self.inner.borrow_mut().client_resolution.push(());
        Some(promise.attach(self.keepalive()))
    }
}

// ============================================================================
// Queued pipeline
// ============================================================================

struct PipelineInner {
    /// The resolved pipeline, once known; broken on a failed resolution.
    redirect: Option<Box<dyn PipelineHook>>,
    /// Pipelined-cap requests parked until resolution, with their op paths
    /// copied out of the caller's hands.
    clients_to_resolve: SenderQueue<Vec<PipelineOp>, Box<dyn ClientHook>>,
}

impl PipelineInner {
    fn resolve(state: &Rc<RefCell<PipelineInner>>, result: Result<Box<dyn PipelineHook>, Error>) {
        let pipeline = match result {
            Ok(hook) => hook,
            Err(error) => broken::new_pipeline(error),
        };
        state.borrow_mut().redirect = Some(pipeline.add_ref());

        let waiters = state.borrow_mut().clients_to_resolve.drain();
        for (ops, fulfiller) in waiters {
            fulfiller.fulfill(pipeline.get_pipelined_cap(&ops));
        }
    }
}

/// A pipeline that parks `get_pipelined_cap` requests until the real
/// pipeline arrives, then delegates.
pub(crate) struct QueuedPipeline {
    inner: Rc<RefCell<PipelineInner>>,
    driver: Rc<TaskGuard>,
}

impl QueuedPipeline {
    pub fn new(promise: Promise<Box<dyn PipelineHook>>) -> QueuedPipeline {
        let inner = Rc::new(RefCell::new(PipelineInner {
            redirect: None,
            clients_to_resolve: SenderQueue::new(),
        }));
        let weak = Rc::downgrade(&inner);
        let handle = tokio::task::spawn_local(async move {
            let result = promise.await;
            if let Some(state) = Weak::upgrade(&weak) {
                PipelineInner::resolve(&state, result);
            }
        });
        QueuedPipeline {
            inner,
            driver: TaskGuard::new(handle),
        }
    }
}

impl PipelineHook for QueuedPipeline {
    fn add_ref(&self) -> Box<dyn PipelineHook> {
        Box::new(QueuedPipeline {
            inner: self.inner.clone(),
            driver: self.driver.clone(),
        })
    }

    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Box<dyn ClientHook> {
        if let Some(pipeline) = &self.inner.borrow().redirect {
            return pipeline.get_pipelined_cap(ops);
        }
        let promise = self.inner.borrow_mut().clients_to_resolve.push(ops.to_vec());
        let keepalive = (self.inner.clone(), self.driver.clone());
        Box::new(QueuedClient::new(promise.attach(keepalive)))
    }
}
