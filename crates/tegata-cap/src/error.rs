//! Errors surfaced on call completions and capability operations.
//!
//! Every failure crosses a hook boundary as a value on the returned promise;
//! nothing is thrown past a caller silently. The variants map one-to-one onto
//! the failure kinds the runtime distinguishes: caller contract violations,
//! unimplemented targets, capabilities that were broken from the start, and
//! errors propagated out of server dispatch.

use thiserror::Error;

/// Result alias used throughout the capability runtime.
pub type CapResult<T> = Result<T, Error>;

/// A call or capability failure.
///
/// Errors are `Clone` because a single failure can be observed by several
/// independent branches of the same call (completion, pipeline, keepalive).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The caller violated an API contract (params touched after release,
    /// tail call after results, double send, ...).
    #[error("usage error: {0}")]
    Usage(String),

    /// The server does not implement the requested interface.
    #[error("interface not implemented: {interface_name} ({type_id:#018x})")]
    InterfaceNotImplemented {
        interface_name: String,
        type_id: u64,
    },

    /// The server implements the interface but not the requested method.
    #[error("method not implemented: {interface_name} ({type_id:#018x}) method {method_id}")]
    MethodNotImplemented {
        interface_name: String,
        type_id: u64,
        method_id: u16,
        /// Human-readable method name, when the dispatcher knows it.
        method_name: Option<String>,
    },

    /// The capability was broken at construction; every operation on it
    /// fails with this error.
    #[error("broken capability: {0}")]
    Broken(String),

    /// An error propagated out of application code, or a promise whose
    /// fulfiller went away before delivering a value.
    #[error("{0}")]
    Failed(String),
}

impl Error {
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    pub fn broken(message: impl Into<String>) -> Self {
        Self::Broken(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn unimplemented_interface(interface_name: impl Into<String>, type_id: u64) -> Self {
        Self::InterfaceNotImplemented {
            interface_name: interface_name.into(),
            type_id,
        }
    }

    pub fn unimplemented_method(
        interface_name: impl Into<String>,
        type_id: u64,
        method_id: u16,
        method_name: Option<&str>,
    ) -> Self {
        Self::MethodNotImplemented {
            interface_name: interface_name.into(),
            type_id,
            method_id,
            method_name: method_name.map(str::to_owned),
        }
    }
}
