// SPDX-License-Identifier: GPL-3.0-or-later

//! Adapters that route host operations to the connected client.
//!
//! Each adapter wraps a local implementation of a host trait. Per
//! operation it checks the connection's capability registry: enabled
//! operations go to the client as nested calls, everything else (and, for
//! most operations, an empty reply) falls through to the local
//! implementation.
//!
//! The host traits have no error channel, so a failed call cannot be
//! returned. It unwinds as a [`HostCallFailure`] instead and the
//! dispatcher's recovery turns it into an error envelope for the request
//! that triggered it.

mod fs;
mod resolver;

pub use fs::BridgeFileSystem;
pub use resolver::BridgeResolver;

use std::fmt;
use std::panic;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::server::{CallError, Connection};

/// A nested call that could not complete. Carried as a panic payload from
/// the trait method that issued the call up to the dispatcher.
#[derive(Debug)]
pub struct HostCallFailure {
    /// The method of the failed call.
    pub method: &'static str,
    /// What went wrong.
    pub error: CallError,
}

impl fmt::Display for HostCallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host call {:?} failed: {}", self.method, self.error)
    }
}

/// Issues a nested call, unwinding with [`HostCallFailure`] on any error.
/// Only for use inside trait methods the dispatcher guards.
pub(crate) fn checked_call<P>(conn: &Connection, method: &'static str, payload: &P) -> Vec<u8>
where
    P: Serialize + ?Sized,
{
    match conn.call(method, payload) {
        Ok(reply) => reply,
        Err(error) => escalate(HostCallFailure { method, error }),
    }
}

/// Parses a non-empty JSON reply, unwinding with [`HostCallFailure`] when
/// it does not match the expected shape.
pub(crate) fn parse_reply<T: DeserializeOwned>(method: &'static str, reply: &[u8]) -> T {
    match serde_json::from_slice(reply) {
        Ok(value) => value,
        Err(error) => escalate(HostCallFailure {
            method,
            error: error.into(),
        }),
    }
}

fn escalate(failure: HostCallFailure) -> ! {
    panic::panic_any(failure)
}

/// Shared handle the adapters keep to the connection.
pub(crate) type SharedConnection = Arc<Connection>;
