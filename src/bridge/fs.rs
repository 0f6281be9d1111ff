// SPDX-License-Identifier: GPL-3.0-or-later

//! File system adapter that consults the client per operation.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::trace;

use super::{SharedConnection, checked_call, parse_reply};
use crate::host::{BUNDLED_SCHEME, DirEntries, FileMetadata, FileSystem, WalkCallback};
use crate::server::Capability;

/// Wraps a local [`FileSystem`] and routes enabled read operations to the
/// client. The analysis layer reads files through this; write and
/// enumeration operations have no remote analogue.
pub struct BridgeFileSystem {
    conn: SharedConnection,
    local: Arc<dyn FileSystem>,
}

impl BridgeFileSystem {
    /// Creates an adapter over a connection and a local fallback.
    #[must_use]
    pub fn new(conn: SharedConnection, local: Arc<dyn FileSystem>) -> Self {
        Self { conn, local }
    }

    /// Common shape for boolean queries: ask the client if the capability
    /// is enabled, fall back to local on an empty reply.
    fn remote_bool(
        &self,
        capability: Capability,
        method: &'static str,
        path: &str,
        local: impl FnOnce() -> bool,
    ) -> bool {
        if self.conn.capability_enabled(capability) {
            let reply = checked_call(&self.conn, method, path);
            if !reply.is_empty() {
                return reply == b"true";
            }
            trace!(method, path, "empty reply, falling back to local");
        }
        local()
    }
}

impl FileSystem for BridgeFileSystem {
    fn directory_exists(&self, path: &str) -> bool {
        self.remote_bool(Capability::DirectoryExists, "directoryExists", path, || {
            self.local.directory_exists(path)
        })
    }

    fn file_exists(&self, path: &str) -> bool {
        self.remote_bool(Capability::FileExists, "fileExists", path, || {
            self.local.file_exists(path)
        })
    }

    fn accessible_entries(&self, path: &str) -> DirEntries {
        if self.conn.capability_enabled(Capability::GetAccessibleEntries) {
            let reply = checked_call(&self.conn, "getAccessibleEntries", path);
            if !reply.is_empty() {
                // A JSON null reply also means "ask locally".
                if let Some(entries) =
                    parse_reply::<Option<DirEntries>>("getAccessibleEntries", &reply)
                {
                    return entries;
                }
            }
        }
        self.local.accessible_entries(path)
    }

    fn read_file(&self, path: &str) -> Option<String> {
        // Bundled libraries ship with the server; never ask the client
        // for them.
        if self.conn.capability_enabled(Capability::ReadFile) && !path.starts_with(BUNDLED_SCHEME) {
            let reply = checked_call(&self.conn, "readFile", path);
            // An explicit null is a definitive "no such file"; only an
            // empty reply defers to the local file system.
            if reply == b"null" {
                return None;
            }
            if !reply.is_empty() {
                return Some(parse_reply::<String>("readFile", &reply));
            }
        }
        self.local.read_file(path)
    }

    fn realpath(&self, path: &str) -> String {
        if self.conn.capability_enabled(Capability::Realpath) {
            let reply = checked_call(&self.conn, "realpath", path);
            if !reply.is_empty() {
                return parse_reply("realpath", &reply);
            }
        }
        self.local.realpath(path)
    }

    fn use_case_sensitive_file_names(&self) -> bool {
        self.local.use_case_sensitive_file_names()
    }

    fn write_file(
        &self,
        path: &str,
        data: &str,
        write_byte_order_mark: bool,
    ) -> std::io::Result<()> {
        self.local.write_file(path, data, write_byte_order_mark)
    }

    #[allow(clippy::panic, reason = "reaching this adapter is a programming error")]
    fn walk_dir(&self, _root: &str, _visit: WalkCallback<'_>) -> std::io::Result<()> {
        panic!("walk_dir is not supported over the client bridge")
    }

    #[allow(clippy::panic, reason = "reaching this adapter is a programming error")]
    fn stat(&self, _path: &str) -> Option<FileMetadata> {
        panic!("stat is not supported over the client bridge")
    }

    #[allow(clippy::panic, reason = "reaching this adapter is a programming error")]
    fn remove(&self, _path: &str) -> std::io::Result<()> {
        panic!("remove is not supported over the client bridge")
    }

    #[allow(clippy::panic, reason = "reaching this adapter is a programming error")]
    fn set_times(
        &self,
        _path: &str,
        _accessed: SystemTime,
        _modified: SystemTime,
    ) -> std::io::Result<()> {
        panic!("set_times is not supported over the client bridge")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Tests use unwrap for brevity")]
mod tests {
    use std::io::Cursor;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::protocol::{Envelope, MessageKind, codec};
    use crate::server::Connection;

    /// Local fallback that records which of its operations were reached.
    #[derive(Default)]
    struct CountingFs {
        reads: AtomicUsize,
        exists_checks: AtomicUsize,
    }

    impl FileSystem for CountingFs {
        fn directory_exists(&self, _: &str) -> bool {
            self.exists_checks.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn file_exists(&self, _: &str) -> bool {
            self.exists_checks.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn accessible_entries(&self, _: &str) -> DirEntries {
            DirEntries {
                files: vec!["local.ts".to_string()],
                directories: Vec::new(),
            }
        }
        fn read_file(&self, _: &str) -> Option<String> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Some("local contents".to_string())
        }
        fn realpath(&self, path: &str) -> String {
            format!("{path}.canonical")
        }
        fn use_case_sensitive_file_names(&self) -> bool {
            true
        }
        fn write_file(&self, _: &str, _: &str, _: bool) -> std::io::Result<()> {
            Ok(())
        }
        fn walk_dir(&self, _: &str, _: WalkCallback<'_>) -> std::io::Result<()> {
            Ok(())
        }
        fn stat(&self, _: &str) -> Option<FileMetadata> {
            None
        }
        fn remove(&self, _: &str) -> std::io::Result<()> {
            Ok(())
        }
        fn set_times(&self, _: &str, _: SystemTime, _: SystemTime) -> std::io::Result<()> {
            Ok(())
        }
    }

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

    fn scripted_reply(method: &str, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        codec::write_envelope(&mut bytes, MessageKind::CallResponse, method, payload).unwrap();
        bytes
    }

    fn sent_envelopes(buf: &SharedBuf) -> Vec<Envelope> {
        let mut cursor = Cursor::new(buf.0.lock().unwrap().clone());
        let mut envelopes = Vec::new();
        while let Some(envelope) = codec::read_envelope(&mut cursor).unwrap() {
            envelopes.push(envelope);
        }
        envelopes
    }

    struct Fixture {
        bridge: BridgeFileSystem,
        local: Arc<CountingFs>,
        out: SharedBuf,
        conn: Arc<Connection>,
    }

    fn fixture(input: Vec<u8>, enabled: &[Capability]) -> Fixture {
        let out = SharedBuf::default();
        let conn = Arc::new(Connection::new(Cursor::new(input), out.clone()));
        for capability in enabled {
            conn.enable_capability(*capability);
        }
        let local = Arc::new(CountingFs::default());
        let local_fs: Arc<dyn FileSystem> = local.clone();
        let bridge = BridgeFileSystem::new(Arc::clone(&conn), local_fs);
        Fixture {
            bridge,
            local,
            out,
            conn,
        }
    }

    #[test]
    fn disabled_capability_goes_straight_to_local() {
        let f = fixture(Vec::new(), &[]);
        assert_eq!(f.bridge.read_file("/src/a.ts").unwrap(), "local contents");
        assert_eq!(f.local.reads.load(Ordering::SeqCst), 1);
        assert!(sent_envelopes(&f.out).is_empty());
    }

    #[test]
    fn enabled_capability_asks_the_client_and_skips_local() {
        let f = fixture(
            scripted_reply("readFile", br#""remote contents""#),
            &[Capability::ReadFile],
        );
        assert_eq!(f.bridge.read_file("/src/a.ts").unwrap(), "remote contents");
        assert_eq!(f.local.reads.load(Ordering::SeqCst), 0);

        let sent = sent_envelopes(&f.out);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageKind::Call);
        assert_eq!(sent[0].method, "readFile");
        assert_eq!(sent[0].payload, br#""/src/a.ts""#);
    }

    #[test]
    fn empty_reply_falls_back_to_local() {
        let f = fixture(scripted_reply("readFile", b""), &[Capability::ReadFile]);
        assert_eq!(f.bridge.read_file("/src/a.ts").unwrap(), "local contents");
        assert_eq!(f.local.reads.load(Ordering::SeqCst), 1);
        // The client was still consulted first.
        assert_eq!(sent_envelopes(&f.out).len(), 1);
    }

    #[test]
    fn null_reply_is_a_definitive_miss() {
        let f = fixture(scripted_reply("readFile", b"null"), &[Capability::ReadFile]);
        assert!(f.bridge.read_file("/src/a.ts").is_none());
        assert_eq!(f.local.reads.load(Ordering::SeqCst), 0, "no local fallback");
    }

    #[test]
    fn bundled_paths_never_reach_the_client() {
        let f = fixture(Vec::new(), &[Capability::ReadFile]);
        assert_eq!(
            f.bridge.read_file("bundled:///libs/lib.es5.d.ts").unwrap(),
            "local contents"
        );
        assert!(sent_envelopes(&f.out).is_empty());
        assert!(f.conn.capability_enabled(Capability::ReadFile));
    }

    #[test]
    fn disabled_existence_check_never_calls_out() {
        let f = fixture(Vec::new(), &[]);
        assert!(f.bridge.file_exists("/src/a.ts"));
        assert_eq!(f.local.exists_checks.load(Ordering::SeqCst), 1);
        assert!(sent_envelopes(&f.out).is_empty());
    }

    #[test]
    fn empty_existence_reply_falls_back_to_local() {
        let f = fixture(scripted_reply("fileExists", b""), &[Capability::FileExists]);
        assert!(f.bridge.file_exists("/src/a.ts"));
        assert_eq!(f.local.exists_checks.load(Ordering::SeqCst), 1);
        assert_eq!(sent_envelopes(&f.out).len(), 1);
    }

    #[test]
    fn boolean_queries_compare_against_true() {
        let f = fixture(
            scripted_reply("fileExists", b"false"),
            &[Capability::FileExists],
        );
        assert!(!f.bridge.file_exists("/src/a.ts"));
        assert_eq!(f.local.exists_checks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn entries_reply_parses_into_both_kinds() {
        let f = fixture(
            scripted_reply(
                "getAccessibleEntries",
                br#"{"files":["a.ts"],"directories":["sub"]}"#,
            ),
            &[Capability::GetAccessibleEntries],
        );
        let entries = f.bridge.accessible_entries("/src");
        assert_eq!(entries.files, ["a.ts"]);
        assert_eq!(entries.directories, ["sub"]);
    }

    #[test]
    fn null_entries_reply_falls_back_to_local() {
        let f = fixture(
            scripted_reply("getAccessibleEntries", b"null"),
            &[Capability::GetAccessibleEntries],
        );
        assert_eq!(f.bridge.accessible_entries("/src").files, ["local.ts"]);
    }

    #[test]
    fn realpath_parses_a_json_string_reply() {
        let f = fixture(
            scripted_reply("realpath", br#""/real/src/a.ts""#),
            &[Capability::Realpath],
        );
        assert_eq!(f.bridge.realpath("/link/a.ts"), "/real/src/a.ts");
    }

    #[test]
    fn failed_call_unwinds_for_the_dispatcher() {
        // EOF while the reply is outstanding.
        let f = fixture(Vec::new(), &[Capability::FileExists]);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            f.bridge.file_exists("/src/a.ts")
        }));
        let payload = outcome.unwrap_err();
        let failure = payload.downcast_ref::<crate::bridge::HostCallFailure>().unwrap();
        assert_eq!(failure.method, "fileExists");
    }
}
