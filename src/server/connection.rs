// SPDX-License-Identifier: GPL-3.0-or-later

//! Shared ownership of the duplex stream and the blocking call client.
//!
//! The connection owns both directions of the transport behind one mutex.
//! The dispatcher locks it to read the next top-level envelope and to write
//! responses; [`Connection::call`] locks it for exactly one full
//! call/await-reply cycle. That single lock is what linearizes concurrent
//! internal callers onto the one stream — a handler may issue calls from
//! several threads at once, and their envelopes never interleave.

use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace};

use super::capabilities::{Capability, CapabilitySet};
use crate::protocol::{Envelope, MessageKind, ProtocolError, codec};

/// A failure of one nested call. Fatal to the request that issued the call,
/// not (except for protocol violations) to the connection.
#[derive(Debug, Error)]
pub enum CallError {
    /// The peer answered with a call-error envelope; carries its text.
    #[error("client error: {0}")]
    Client(String),

    /// The call payload could not be serialized, or a reply could not be
    /// parsed into the expected shape.
    #[error("invalid call payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The transport or framing failed while the reply was outstanding.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

struct Stream {
    reader: BufReader<Box<dyn Read + Send>>,
    writer: BufWriter<Box<dyn Write + Send>>,
}

/// One client connection: the duplex stream plus per-connection state.
pub struct Connection {
    io: Mutex<Stream>,
    capabilities: CapabilitySet,
}

impl Connection {
    /// Wraps a duplex transport in buffered framing.
    pub fn new(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> Self {
        Self {
            io: Mutex::new(Stream {
                reader: BufReader::new(Box::new(reader)),
                writer: BufWriter::new(Box::new(writer)),
            }),
            capabilities: CapabilitySet::new(),
        }
    }

    /// Whether the client answers the given host operation remotely.
    #[must_use]
    pub fn capability_enabled(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }

    pub(crate) fn enable_capability(&self, capability: Capability) {
        debug!(capability = capability.name(), "capability enabled");
        self.capabilities.enable(capability);
    }

    /// Reads the next top-level envelope. `Ok(None)` means clean EOF.
    ///
    /// Only the dispatcher calls this, and only while no request is in
    /// flight; nested replies are consumed inside [`Connection::call`].
    pub(crate) fn read_next(&self) -> Result<Option<Envelope>, ProtocolError> {
        let mut io = self.lock();
        codec::read_envelope(&mut io.reader)
    }

    /// Writes one envelope under the connection lock and flushes it.
    pub(crate) fn send(
        &self,
        kind: MessageKind,
        method: &str,
        payload: &[u8],
    ) -> std::io::Result<()> {
        let mut io = self.lock();
        trace!(%kind, method, len = payload.len(), "sending envelope");
        codec::write_envelope(&mut io.writer, kind, method, payload)
    }

    /// Performs one synchronous nested call: serializes `payload` as JSON,
    /// sends a call envelope, and blocks until the matching call-response
    /// or call-error arrives.
    ///
    /// The connection lock is held for the whole send+await cycle, so
    /// concurrent callers are serialized and never interleave envelopes.
    ///
    /// # Errors
    ///
    /// [`CallError::Client`] if the peer answered with a call-error;
    /// [`CallError::Protocol`] on any framing violation or transport
    /// failure, which is fatal to the connection.
    pub fn call<P>(&self, method: &str, payload: &P) -> Result<Vec<u8>, CallError>
    where
        P: Serialize + ?Sized,
    {
        let json = serde_json::to_vec(payload)?;

        let mut io = self.lock();
        trace!(method, "issuing nested call");
        codec::write_envelope(&mut io.writer, MessageKind::Call, method, &json)
            .map_err(ProtocolError::from)?;

        let envelope =
            codec::read_envelope(&mut io.reader)?.ok_or(ProtocolError::UnexpectedEof)?;
        drop(io);

        if envelope.method != method {
            return Err(ProtocolError::MethodMismatch {
                expected: method.to_string(),
                actual: envelope.method,
            }
            .into());
        }

        match envelope.kind {
            MessageKind::CallResponse => {
                trace!(method, len = envelope.payload.len(), "call answered");
                Ok(envelope.payload)
            }
            MessageKind::CallError => Err(CallError::Client(
                String::from_utf8_lossy(&envelope.payload).into_owned(),
            )),
            other => Err(ProtocolError::UnexpectedKind {
                expected: "call-response or call-error",
                actual: other,
            }
            .into()),
        }
    }

    // A poisoned lock means another caller panicked mid-exchange; the
    // dispatcher converts that panic into an error response and the stream
    // position is still at an envelope boundary or already beyond saving,
    // so recover the guard rather than compounding the failure.
    fn lock(&self) -> MutexGuard<'_, Stream> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}
