//! The message pump: one strictly-ordered request at a time.
//!
//! The server reads one top-level request envelope, dispatches it — to a
//! built-in connection-management operation or to the embedder's opaque
//! handler table — and writes back a response or error envelope before
//! reading the next request. While a handler runs it may issue nested calls
//! back to the client through [`Connection::call`]; the pump does not touch
//! the stream again until the handler finishes.
//!
//! Handling of each request is isolated: a panic anywhere inside it
//! (including a failed client callback escalated by the bridge adapters) is
//! recovered, reported to the peer as an error envelope carrying the panic
//! message and a backtrace, and the pump keeps serving. Only a failure to
//! deliver that error report aborts the process.

mod capabilities;
mod connection;

pub use capabilities::{Capability, CapabilitySet};
pub use connection::{CallError, Connection};

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Once};

use anyhow::Context as _;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::bridge::HostCallFailure;
use crate::protocol::{MessageKind, ProtocolError};

/// The opaque handler table for everything that is not a built-in
/// connection-management operation — in practice, the analysis and
/// language-service layer.
pub trait RequestHandler: Send + Sync {
    /// Handles one request and returns the response payload.
    ///
    /// `request_id` is a per-connection correlation id for tracing only;
    /// it never appears on the wire.
    ///
    /// # Errors
    ///
    /// Any error becomes an error envelope for this request; the
    /// connection keeps serving.
    fn handle(&self, request_id: u64, method: &str, payload: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Placeholder handler that rejects every method. Stands in until an
/// analysis engine supplies its own table.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHandler;

impl RequestHandler for NullHandler {
    fn handle(&self, _request_id: u64, method: &str, _payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("unknown method: {method}")
    }
}

/// Server construction options.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Working directory all relative paths are resolved against.
    pub cwd: PathBuf,
    /// Where the bundled default libraries live (usually a `bundled://` path).
    pub default_library_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigureParams {
    #[serde(default)]
    callbacks: Vec<String>,
    #[serde(default)]
    log_file: Option<PathBuf>,
}

/// A connection's dispatcher. Owns the pump loop; shares the
/// [`Connection`] with any bridge adapters the embedder constructs.
pub struct Server {
    conn: Arc<Connection>,
    handler: Box<dyn RequestHandler>,
    options: ServerOptions,
    requests_served: u64,
    // Accepted from `configure` but not wired to any logging backend; log
    // routing is fixed at process start.
    log_file: Option<PathBuf>,
}

impl Server {
    /// Creates a server over a duplex transport, with the placeholder
    /// handler installed.
    pub fn new(
        reader: impl std::io::Read + Send + 'static,
        writer: impl std::io::Write + Send + 'static,
        options: ServerOptions,
    ) -> Self {
        Self {
            conn: Arc::new(Connection::new(reader, writer)),
            handler: Box::new(NullHandler),
            options,
            requests_served: 0,
            log_file: None,
        }
    }

    /// Installs the handler table. Handlers typically capture the
    /// [`Connection`] (via [`Server::connection`]) inside bridge adapters.
    #[must_use]
    pub fn with_handler(mut self, handler: Box<dyn RequestHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// The shared connection, for constructing bridge adapters.
    #[must_use]
    pub fn connection(&self) -> Arc<Connection> {
        Arc::clone(&self.conn)
    }

    /// Server options as given at construction.
    #[must_use]
    pub const fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Runs the pump until the client closes the stream.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] on any framing violation or transport
    /// failure — both are fatal to the connection. A clean EOF between
    /// requests returns `Ok(())`.
    pub fn serve(&mut self) -> Result<(), ProtocolError> {
        install_panic_capture();
        info!(cwd = %self.options.cwd.display(), "serving connection");

        loop {
            let Some(envelope) = self.conn.read_next()? else {
                debug!(
                    requests = self.requests_served,
                    "client closed the stream, shutting down"
                );
                return Ok(());
            };

            if envelope.kind != MessageKind::Request {
                return Err(ProtocolError::UnexpectedKind {
                    expected: "request",
                    actual: envelope.kind,
                });
            }

            self.requests_served += 1;
            let request_id = self.requests_served;
            debug!(request_id, method = %envelope.method, "handling request");

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                self.dispatch(request_id, &envelope.method, &envelope.payload)
            }));

            match outcome {
                Ok(Ok(result)) => {
                    self.conn
                        .send(MessageKind::Response, &envelope.method, &result)?;
                }
                Ok(Err(err)) => {
                    warn!(request_id, method = %envelope.method, "request failed: {err:#}");
                    self.conn.send(
                        MessageKind::Error,
                        &envelope.method,
                        format!("{err:#}").as_bytes(),
                    )?;
                }
                Err(payload) => {
                    let report = panic_report(payload.as_ref());
                    error!(request_id, method = %envelope.method, "recovered panic: {report}");
                    if self
                        .conn
                        .send(MessageKind::Error, &envelope.method, report.as_bytes())
                        .is_err()
                    {
                        // Double fault: the panic report itself cannot be
                        // delivered. Nothing left to recover into.
                        error!("failed to deliver panic report, aborting");
                        std::process::abort();
                    }
                }
            }
        }
    }

    fn dispatch(
        &mut self,
        request_id: u64,
        method: &str,
        payload: &[u8],
    ) -> anyhow::Result<Vec<u8>> {
        match method {
            "configure" => {
                self.handle_configure(payload)?;
                Ok(Vec::new())
            }
            "echo" => Ok(payload.to_vec()),
            _ => self.handler.handle(request_id, method, payload),
        }
    }

    fn handle_configure(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        let params: ConfigureParams =
            serde_json::from_slice(payload).context("invalid configure payload")?;

        // Validate the whole list before committing any bit, so a request
        // containing an unknown name enables nothing.
        let mut requested = Vec::with_capacity(params.callbacks.len());
        for name in &params.callbacks {
            let capability = Capability::from_name(name)
                .with_context(|| format!("unknown callback: {name}"))?;
            requested.push(capability);
        }
        for capability in requested {
            self.conn.enable_capability(capability);
        }

        if let Some(path) = params.log_file {
            debug!(path = %path.display(), "client requested a log file");
            self.log_file = Some(path);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("requests_served", &self.requests_served)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_CAPTURE: Once = Once::new();

/// Installs a process-wide panic hook that stashes a backtrace for the
/// panicking thread. `catch_unwind` only yields the payload; the hook runs
/// before unwinding, which is the last moment the stack is intact.
fn install_panic_capture() {
    PANIC_CAPTURE.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            LAST_BACKTRACE.with(|slot| {
                *slot.borrow_mut() = Some(Backtrace::force_capture().to_string());
            });
            // Controlled escalations from the bridge are reported through
            // the error envelope; keep them off stderr.
            if !info.payload().is::<HostCallFailure>() {
                previous(info);
            }
        }));
    });
}

fn panic_report(payload: &(dyn std::any::Any + Send)) -> String {
    let message = payload.downcast_ref::<HostCallFailure>().map_or_else(
        || {
            payload.downcast_ref::<&'static str>().map_or_else(
                || {
                    payload
                        .downcast_ref::<String>()
                        .cloned()
                        .unwrap_or_else(|| "unknown panic payload".to_string())
                },
                |s| (*s).to_string(),
            )
        },
        ToString::to_string,
    );

    LAST_BACKTRACE.with(|slot| slot.borrow_mut().take()).map_or_else(
        || format!("panic handling request: {message}"),
        |backtrace| format!("panic handling request: {message}\n{backtrace}"),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Tests use unwrap for brevity")]
mod tests {
    use std::io::Cursor;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::protocol::{Envelope, codec};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn options() -> ServerOptions {
        ServerOptions {
            cwd: PathBuf::from("/work"),
            default_library_path: "bundled:///libs".to_string(),
        }
    }

    fn request(method: &str, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        codec::write_envelope(&mut bytes, MessageKind::Request, method, payload).unwrap();
        bytes
    }

    fn decode_all(bytes: &[u8]) -> Vec<Envelope> {
        let mut cursor = Cursor::new(bytes.to_vec());
        let mut envelopes = Vec::new();
        while let Some(envelope) = codec::read_envelope(&mut cursor).unwrap() {
            envelopes.push(envelope);
        }
        envelopes
    }

    /// Feeds a scripted input stream to a server and collects the output
    /// envelopes after the pump drains it.
    fn run(
        input: Vec<u8>,
        handler: Box<dyn RequestHandler>,
    ) -> (Result<(), ProtocolError>, Vec<Envelope>, Arc<Connection>) {
        let out = SharedBuf::default();
        let mut server =
            Server::new(Cursor::new(input), out.clone(), options()).with_handler(handler);
        let conn = server.connection();
        let result = server.serve();
        let envelopes = decode_all(&out.0.lock().unwrap());
        (result, envelopes, conn)
    }

    #[test]
    fn echo_returns_payload_byte_identical() {
        let (result, sent, _) = run(request("echo", b"hello"), Box::new(NullHandler));
        result.unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageKind::Response);
        assert_eq!(sent[0].method, "echo");
        assert_eq!(sent[0].payload, b"hello");
    }

    #[test]
    fn configure_enables_exactly_the_named_capabilities() {
        let (result, sent, conn) = run(
            request("configure", br#"{"callbacks":["readFile"]}"#),
            Box::new(NullHandler),
        );
        result.unwrap();
        assert_eq!(sent[0].kind, MessageKind::Response);
        assert!(conn.capability_enabled(Capability::ReadFile));
        assert!(!conn.capability_enabled(Capability::DirectoryExists));
    }

    #[test]
    fn configure_twice_keeps_earlier_bits() {
        let mut input = request("configure", br#"{"callbacks":["fileExists"]}"#);
        input.extend(request("configure", br#"{"callbacks":["realpath"]}"#));
        let (result, sent, conn) = run(input, Box::new(NullHandler));
        result.unwrap();
        assert_eq!(sent.len(), 2);
        assert!(conn.capability_enabled(Capability::FileExists));
        assert!(conn.capability_enabled(Capability::Realpath));
    }

    #[test]
    fn configure_with_unknown_name_enables_nothing() {
        let (result, sent, conn) = run(
            request(
                "configure",
                br#"{"callbacks":["readFile","notACallback","fileExists"]}"#,
            ),
            Box::new(NullHandler),
        );
        result.unwrap();
        assert_eq!(sent[0].kind, MessageKind::Error);
        let text = String::from_utf8(sent[0].payload.clone()).unwrap();
        assert!(text.contains("unknown callback: notACallback"), "{text}");
        // Valid names listed alongside the unknown one are not committed.
        assert!(!conn.capability_enabled(Capability::ReadFile));
        assert!(!conn.capability_enabled(Capability::FileExists));
    }

    #[test]
    fn configure_with_malformed_payload_is_an_error_response() {
        let (result, sent, _) = run(request("configure", b"not json"), Box::new(NullHandler));
        result.unwrap();
        assert_eq!(sent[0].kind, MessageKind::Error);
    }

    #[test]
    fn unknown_method_becomes_error_response_and_pump_continues() {
        let mut input = request("nonsense", b"");
        input.extend(request("echo", b"still here"));
        let (result, sent, _) = run(input, Box::new(NullHandler));
        result.unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].kind, MessageKind::Error);
        assert_eq!(sent[1].kind, MessageKind::Response);
        assert_eq!(sent[1].payload, b"still here");
    }

    struct PanickyHandler;

    impl RequestHandler for PanickyHandler {
        #[allow(clippy::panic, reason = "exercises per-request panic recovery")]
        fn handle(&self, _id: u64, method: &str, _payload: &[u8]) -> anyhow::Result<Vec<u8>> {
            panic!("boom in {method}")
        }
    }

    #[test]
    fn handler_panic_is_recovered_per_request() {
        let mut input = request("explode", b"");
        input.extend(request("echo", b"alive"));
        let (result, sent, _) = run(input, Box::new(PanickyHandler));
        result.unwrap();

        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].kind, MessageKind::Error);
        let report = String::from_utf8(sent[0].payload.clone()).unwrap();
        assert!(report.contains("panic handling request"), "{report}");
        assert!(report.contains("boom in explode"), "{report}");

        assert_eq!(sent[1].kind, MessageKind::Response);
        assert_eq!(sent[1].payload, b"alive");
    }

    #[test]
    fn non_request_envelope_while_idle_is_fatal() {
        let mut input = Vec::new();
        codec::write_envelope(&mut input, MessageKind::Call, "fileExists", b"").unwrap();
        let (result, sent, _) = run(input, Box::new(NullHandler));
        assert!(matches!(
            result,
            Err(ProtocolError::UnexpectedKind { actual: MessageKind::Call, .. })
        ));
        assert!(sent.is_empty());
    }

    #[test]
    fn clean_eof_between_requests_is_ok() {
        let (result, sent, _) = run(Vec::new(), Box::new(NullHandler));
        result.unwrap();
        assert!(sent.is_empty());
    }

    /// Handler that issues one nested call and echoes its reply back.
    struct CallingHandler {
        conn: Arc<Connection>,
    }

    impl RequestHandler for CallingHandler {
        fn handle(&self, _id: u64, _method: &str, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
            let path = String::from_utf8_lossy(payload).into_owned();
            let reply = self.conn.call("readFile", &path)?;
            Ok(reply)
        }
    }

    #[test]
    fn handler_nested_call_consumes_scripted_reply() {
        // Strict ordering lets the reply be scheduled right behind the
        // request in the input stream.
        let mut input = request("loadFile", b"/src/a.ts");
        codec::write_envelope(
            &mut input,
            MessageKind::CallResponse,
            "readFile",
            br#""contents of a""#,
        )
        .unwrap();

        let out = SharedBuf::default();
        let mut server = Server::new(Cursor::new(input), out.clone(), options());
        let conn = server.connection();
        let mut server = server.with_handler(Box::new(CallingHandler { conn }));
        server.serve().unwrap();

        let sent = decode_all(&out.0.lock().unwrap());
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].kind, MessageKind::Call);
        assert_eq!(sent[0].method, "readFile");
        assert_eq!(sent[1].kind, MessageKind::Response);
        assert_eq!(sent[1].method, "loadFile");
        assert_eq!(sent[1].payload, br#""contents of a""#);
    }

    #[test]
    fn nested_call_error_fails_only_that_request() {
        let mut input = request("loadFile", b"/src/a.ts");
        codec::write_envelope(&mut input, MessageKind::CallError, "readFile", b"denied").unwrap();
        input.extend(request("echo", b"next"));

        let out = SharedBuf::default();
        let mut server = Server::new(Cursor::new(input), out.clone(), options());
        let conn = server.connection();
        let mut server = server.with_handler(Box::new(CallingHandler { conn }));
        server.serve().unwrap();

        let sent = decode_all(&out.0.lock().unwrap());
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].kind, MessageKind::Call);
        assert_eq!(sent[1].kind, MessageKind::Error);
        let text = String::from_utf8(sent[1].payload.clone()).unwrap();
        assert!(text.contains("denied"), "{text}");
        assert_eq!(sent[2].kind, MessageKind::Response);
        assert_eq!(sent[2].payload, b"next");
    }

    /// Correlation ids increase across requests on one connection.
    struct IdRecorder(AtomicU64);

    impl RequestHandler for IdRecorder {
        fn handle(&self, id: u64, _method: &str, _payload: &[u8]) -> anyhow::Result<Vec<u8>> {
            let previous = self.0.swap(id, Ordering::SeqCst);
            anyhow::ensure!(id > previous, "ids must increase: {previous} then {id}");
            Ok(id.to_string().into_bytes())
        }
    }

    #[test]
    fn request_ids_increase_monotonically() {
        let mut input = request("first", b"");
        input.extend(request("second", b""));
        input.extend(request("third", b""));
        let (result, sent, _) = run(input, Box::new(IdRecorder(AtomicU64::new(0))));
        result.unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].payload, b"1");
        assert_eq!(sent[1].payload, b"2");
        assert_eq!(sent[2].payload, b"3");
    }
}
