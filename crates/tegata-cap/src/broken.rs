//! Broken capabilities: terminal hooks that fail every operation with a
//! preset error.
//!
//! Queued capabilities redirect here when their resolution fails, and null
//! pointers in messages read as the null capability. A broken hook is
//! terminally resolved: `get_resolved` returns the hook itself and
//! `when_more_resolved` returns nothing.

use crate::capability::{
    CallContextHook, ClientHook, PipelineHook, PipelineOp, VoidPromiseAndPipeline,
};
use crate::error::Error;
use crate::promise::Promise;

/// A hook whose every operation fails with `error`.
pub fn new_cap(error: Error) -> Box<dyn ClientHook> {
    Box::new(Client { error })
}

/// The capability behind a null message pointer.
pub fn null_cap() -> Box<dyn ClientHook> {
    new_cap(Error::broken("called null capability"))
}

/// A pipeline whose every extracted capability is broken with `error`.
pub fn new_pipeline(error: Error) -> Box<dyn PipelineHook> {
    Box::new(Pipeline { error })
}

struct Client {
    error: Error,
}

impl ClientHook for Client {
    fn add_ref(&self) -> Box<dyn ClientHook> {
        new_cap(self.error.clone())
    }

    fn call(
        &self,
        _interface_id: u64,
        _method_id: u16,
        _context: Box<dyn CallContextHook>,
    ) -> VoidPromiseAndPipeline {
        VoidPromiseAndPipeline {
            promise: Promise::err(self.error.clone()),
            pipeline: new_pipeline(self.error.clone()),
        }
    }

    fn get_resolved(&self) -> Option<Box<dyn ClientHook>> {
        Some(self.add_ref())
    }

    fn when_more_resolved(&self) -> Option<Promise<Box<dyn ClientHook>>> {
        None
    }

    fn when_resolved(&self) -> Promise<()> {
        Promise::err(self.error.clone())
    }
}

struct Pipeline {
    error: Error,
}

impl PipelineHook for Pipeline {
    fn add_ref(&self) -> Box<dyn PipelineHook> {
        new_pipeline(self.error.clone())
    }

    fn get_pipelined_cap(&self, _ops: &[PipelineOp]) -> Box<dyn ClientHook> {
        new_cap(self.error.clone())
    }
}
