//! Scenario tests for the capability runtime: local calls, queued
//! forwarding order, tail calls, cancellation, broken capabilities, and
//! pipelining.
//!
//! Everything runs inside a `LocalSet` because the runtime's types are
//! `!Send`.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use futures::FutureExt;

use tegata_cap::{
    new_broken_client, new_client, new_promise_client, promise_and_fulfiller, CallContext, Client,
    ClientHook, Error, PipelineOp, Promise, Server,
};

/// Helper to run async test code that requires a LocalSet.
fn run_local<F: Future<Output = ()>>(f: F) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let local = tokio::task::LocalSet::new();
    rt.block_on(local.run_until(f));
}

// ============================================================================
// Test servers
// ============================================================================

/// Copies its params into its results.
struct EchoServer;

impl Server for EchoServer {
    fn dispatch_call(
        &mut self,
        _interface_id: u64,
        _method_id: u16,
        context: CallContext,
    ) -> Promise<()> {
        Promise::from_future(async move {
            let params = context.get_params()?;
            context.get_results(None)?.set_as(&params);
            context.release_params();
            Ok(())
        })
    }
}

/// Appends every dispatched method id to a shared log.
struct RecordingServer {
    log: Rc<RefCell<Vec<u16>>>,
}

impl Server for RecordingServer {
    fn dispatch_call(
        &mut self,
        _interface_id: u64,
        method_id: u16,
        context: CallContext,
    ) -> Promise<()> {
        self.log.borrow_mut().push(method_id);
        context.release_params();
        Promise::ok(())
    }
}

/// Tail-calls itself until the requested depth, then returns a payload.
struct ChainServer {
    self_client: Rc<RefCell<Option<Client>>>,
    dispatches: Rc<Cell<u32>>,
}

impl Server for ChainServer {
    fn dispatch_call(
        &mut self,
        _interface_id: u64,
        _method_id: u16,
        context: CallContext,
    ) -> Promise<()> {
        let self_client = self.self_client.clone();
        let dispatches = self.dispatches.clone();
        Promise::from_future(async move {
            dispatches.set(dispatches.get() + 1);
            let depth = context.get_params()?.data().unwrap()[0];
            if depth < 2 {
                let client = self_client.borrow().clone().unwrap();
                let mut request = client.new_call(0, 0, None);
                request.get()?.set_data(&[depth + 1]);
                context.tail_call(request).await
            } else {
                context.get_results(None)?.set_data(b"Y");
                context.release_params();
                Ok(())
            }
        })
    }
}

/// Sleeps, then records that it ran to completion.
struct SleepyServer {
    completed: Rc<Cell<bool>>,
    opt_into_cancellation: bool,
    sleep: Duration,
    work_dropped: Rc<Cell<bool>>,
}

struct DropFlag(Rc<Cell<bool>>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.set(true);
    }
}

impl Server for SleepyServer {
    fn dispatch_call(
        &mut self,
        _interface_id: u64,
        _method_id: u16,
        context: CallContext,
    ) -> Promise<()> {
        let completed = self.completed.clone();
        let opt_in = self.opt_into_cancellation;
        let sleep = self.sleep;
        let guard = DropFlag(self.work_dropped.clone());
        Promise::from_future(async move {
            context.release_params();
            if opt_in {
                context.allow_async_cancellation()?;
            }
            tokio::time::sleep(sleep).await;
            completed.set(true);
            drop(guard);
            Ok(())
        })
    }
}

/// Returns a struct whose pointer field 0 holds an echo capability.
struct FactoryServer;

impl Server for FactoryServer {
    fn dispatch_call(
        &mut self,
        _interface_id: u64,
        _method_id: u16,
        context: CallContext,
    ) -> Promise<()> {
        Promise::from_future(async move {
            context.release_params();
            let results = context.get_results(None)?;
            results
                .init_struct(1)
                .get_pointer_field(0)
                .set_capability(new_client(EchoServer).hook);
            Ok(())
        })
    }
}

// ============================================================================
// Local calls
// ============================================================================

#[test]
fn test_echo_round_trip() {
    run_local(async {
        let client = new_client(EchoServer);
        let mut request = client.new_call(0x1111, 3, None);
        request.get().unwrap().set_data(b"X");

        let rp = request.send();
        let mut promise = rp.promise;

        // A local call never completes in the turn that issued it.
        assert!((&mut promise).now_or_never().is_none());

        let response = promise.await.unwrap();
        assert_eq!(response.get().data().unwrap(), b"X");
        assert_eq!(client.hook.get_brand(), 0);
    });
}

#[test]
fn test_send_twice_is_a_usage_error() {
    run_local(async {
        let client = new_client(EchoServer);
        let mut request = client.new_call(0, 0, None);
        let first = request.send();
        let second = request.send();

        first.promise.await.unwrap();
        assert!(matches!(second.promise.await, Err(Error::Usage(_))));
    });
}

#[test]
fn test_void_method_still_produces_a_response() {
    run_local(async {
        let log = Rc::new(RefCell::new(Vec::new()));
        let client = new_client(RecordingServer { log });
        let response = client.new_call(0, 7, None).send().promise.await.unwrap();
        assert!(response.get().is_null());
    });
}

#[test]
fn test_unimplemented_targets_are_reported_in_detail() {
    run_local(async {
        struct StrictServer;

        impl Server for StrictServer {
            fn dispatch_call(
                &mut self,
                interface_id: u64,
                method_id: u16,
                context: CallContext,
            ) -> Promise<()> {
                if interface_id != 0x1111 {
                    return Promise::err(Error::unimplemented_interface("Echo", interface_id));
                }
                match method_id {
                    0 => {
                        context.release_params();
                        Promise::ok(())
                    }
                    other => {
                        Promise::err(Error::unimplemented_method("Echo", 0x1111, other, None))
                    }
                }
            }
        }

        let client = new_client(StrictServer);
        client.new_call(0x1111, 0, None).send().promise.await.unwrap();

        let error = client
            .new_call(0x1111, 9, None)
            .send()
            .promise
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            Error::MethodNotImplemented { method_id: 9, .. }
        ));

        let error = client
            .new_call(0x2222, 0, None)
            .send()
            .promise
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InterfaceNotImplemented { .. }));
    });
}

// ============================================================================
// Queued capabilities
// ============================================================================

#[test]
fn test_queued_calls_forward_in_submission_order() {
    run_local(async {
        let log = Rc::new(RefCell::new(Vec::new()));
        let (promise, fulfiller) = promise_and_fulfiller::<Box<dyn ClientHook>>();
        let client = new_promise_client(promise);

        let mut completions = Vec::new();
        for method_id in [1u16, 2, 3] {
            completions.push(client.new_call(0, method_id, None).send().promise);
        }

        fulfiller.fulfill(new_client(RecordingServer { log: log.clone() }).hook);

        for completion in completions {
            completion.await.unwrap();
        }
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
    });
}

#[test]
fn test_resolution_observer_runs_between_forwarding_and_completion() {
    run_local(async {
        let log = Rc::new(RefCell::new(Vec::new()));
        let (promise, fulfiller) = promise_and_fulfiller::<Box<dyn ClientHook>>();
        let client = new_promise_client(promise);

        let mut completions = Vec::new();
        for method_id in [1u16, 2, 3] {
            completions.push(client.new_call(0, method_id, None).send().promise);
        }

        // Observer submits a fourth call when it sees the resolution.
        let observed = client.hook.when_more_resolved().unwrap();
        let observer_log = log.clone();
        let observer = tokio::task::spawn_local(async move {
            let resolved = observed.await.unwrap();
            observer_log.borrow_mut().push(100);
            resolved.new_call(0, 4, None).send().promise.await.unwrap();
        });

        // Completion watchers mark when each early call finishes.
        let mut watchers = Vec::new();
        for (index, completion) in completions.into_iter().enumerate() {
            let watcher_log = log.clone();
            watchers.push(tokio::task::spawn_local(async move {
                completion.await.unwrap();
                watcher_log.borrow_mut().push(200 + index as u16);
            }));
        }

        fulfiller.fulfill(new_client(RecordingServer { log: log.clone() }).hook);
        observer.await.unwrap();
        for watcher in watchers {
            watcher.await.unwrap();
        }

        let log = log.borrow();
        // Calls were delivered in submission order, with the observer's call
        // last.
        let dispatched: Vec<u16> = log.iter().copied().filter(|id| *id < 100).collect();
        assert_eq!(dispatched, vec![1, 2, 3, 4]);
        // The observer saw the resolution before any earlier call completed.
        let observer_at = log.iter().position(|id| *id == 100).unwrap();
        for marker in [200u16, 201, 202] {
            let completed_at = log.iter().position(|id| *id == marker).unwrap();
            assert!(observer_at < completed_at);
        }
    });
}

#[test]
fn test_queued_client_reports_resolution() {
    run_local(async {
        let (promise, fulfiller) = promise_and_fulfiller::<Box<dyn ClientHook>>();
        let client = new_promise_client(promise);
        assert!(client.hook.get_resolved().is_none());

        let mut resolved = client.when_resolved();
        assert!((&mut resolved).now_or_never().is_none());

        fulfiller.fulfill(new_client(EchoServer).hook);
        resolved.await.unwrap();
        assert!(client.hook.get_resolved().is_some());
    });
}

#[test]
fn test_failed_resolution_breaks_queued_calls() {
    run_local(async {
        let (promise, fulfiller) = promise_and_fulfiller::<Box<dyn ClientHook>>();
        let client = new_promise_client(promise);

        let pending = client.new_call(0, 0, None).send().promise;
        fulfiller.reject(Error::failed("no such capability"));

        assert_eq!(pending.await.unwrap_err(), Error::failed("no such capability"));
    });
}

// ============================================================================
// Tail calls
// ============================================================================

#[test]
fn test_tail_call_chain_returns_final_payload() {
    run_local(async {
        let self_client = Rc::new(RefCell::new(None));
        let dispatches = Rc::new(Cell::new(0));
        let client = new_client(ChainServer {
            self_client: self_client.clone(),
            dispatches: dispatches.clone(),
        });
        *self_client.borrow_mut() = Some(client.clone());

        let mut request = client.new_call(0, 0, None);
        request.get().unwrap().set_data(&[0]);
        let response = request.send().promise.await.unwrap();

        // The caller observes exactly one result: the end of the chain.
        assert_eq!(response.get().data().unwrap(), b"Y");
        assert_eq!(dispatches.get(), 3);
    });
}

// ============================================================================
// Cancellation
// ============================================================================

#[test]
fn test_dropping_the_caller_does_not_cancel_without_opt_in() {
    run_local(async {
        let completed = Rc::new(Cell::new(false));
        let work_dropped = Rc::new(Cell::new(false));
        let client = new_client(SleepyServer {
            completed: completed.clone(),
            opt_into_cancellation: false,
            sleep: Duration::from_millis(50),
            work_dropped: work_dropped.clone(),
        });

        let rp = client.new_call(0, 0, None).send();
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(rp);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(completed.get());
    });
}

#[test]
fn test_opted_in_server_is_cancelled_once_the_caller_leaves() {
    run_local(async {
        let completed = Rc::new(Cell::new(false));
        let work_dropped = Rc::new(Cell::new(false));
        let client = new_client(SleepyServer {
            completed: completed.clone(),
            opt_into_cancellation: true,
            sleep: Duration::from_secs(600),
            work_dropped: work_dropped.clone(),
        });

        let rp = client.new_call(0, 0, None).send();
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(rp);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!completed.get());
        assert!(work_dropped.get());
    });
}

// ============================================================================
// Broken capabilities
// ============================================================================

#[test]
fn test_broken_capability_fails_everything_with_its_seed() {
    run_local(async {
        let client = new_broken_client(Error::broken("boom"));

        let rp = client.new_call(0, 0, None).send();
        assert_eq!(rp.promise.await.unwrap_err(), Error::broken("boom"));

        let pipelined = rp.pipeline.get_pipelined_cap(&[PipelineOp::GetPointerField(0)]);
        let nested = pipelined.new_call(0, 0, None).send().promise.await;
        assert_eq!(nested.unwrap_err(), Error::broken("boom"));

        assert_eq!(client.when_resolved().await, Err(Error::broken("boom")));
        assert!(client.hook.when_more_resolved().is_none());
    });
}

// ============================================================================
// Pipelining
// ============================================================================

#[test]
fn test_pipelined_cap_matches_extracted_cap() {
    run_local(async {
        let factory = new_client(FactoryServer);

        // Pipelined: call through the result before it exists.
        let rp = factory.new_call(0, 0, None).send();
        let early_echo = rp
            .pipeline
            .get_pipelined_cap(&[PipelineOp::Noop, PipelineOp::GetPointerField(0)]);
        let mut early_request = early_echo.new_call(0, 0, None);
        early_request.get().unwrap().set_data(b"ping");
        let early = early_request.send().promise;

        // Extracted: await the result, then pull the capability out of it.
        let response = rp.promise.await.unwrap();
        let late_echo = Client::new(
            response
                .get()
                .as_struct()
                .unwrap()
                .get_pointer_field(0)
                .get_capability(),
        );
        let mut late_request = late_echo.new_call(0, 0, None);
        late_request.get().unwrap().set_data(b"ping");
        let late = late_request.send().promise.await.unwrap();

        let early = early.await.unwrap();
        assert_eq!(early.get().data().unwrap(), b"ping");
        assert_eq!(late.get().data().unwrap(), b"ping");
    });
}

#[test]
fn test_pipelined_calls_do_not_overtake_the_result() {
    run_local(async {
        let log = Rc::new(RefCell::new(Vec::new()));

        struct SlowFactory {
            log: Rc<RefCell<Vec<u16>>>,
        }

        impl Server for SlowFactory {
            fn dispatch_call(
                &mut self,
                _interface_id: u64,
                _method_id: u16,
                context: CallContext,
            ) -> Promise<()> {
                let log = self.log.clone();
                Promise::from_future(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    log.borrow_mut().push(0);
                    context.release_params();
                    let results = context.get_results(None)?;
                    results.init_struct(1).get_pointer_field(0).set_capability(
                        new_client(RecordingServer { log: log.clone() }).hook,
                    );
                    Ok(())
                })
            }
        }

        let factory = new_client(SlowFactory { log: log.clone() });
        let rp = factory.new_call(0, 0, None).send();
        let inner = rp.pipeline.get_pipelined_cap(&[PipelineOp::GetPointerField(0)]);
        inner.new_call(0, 9, None).send().promise.await.unwrap();

        assert_eq!(*log.borrow(), vec![0, 9]);
    });
}
