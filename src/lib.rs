// SPDX-License-Identifier: GPL-3.0-or-later

//! Tether is a language-analysis backend speaking a binary request/callback
//! protocol over a duplex byte stream.
//!
//! An editor-side client sends top-level requests and answers the server's
//! nested callbacks for file system and module resolution queries, letting
//! the analysis engine see the editor's view of the world (unsaved buffers,
//! virtual files) while falling back to the local disk for everything else.

/// Adapters routing host operations to the connected client.
pub mod bridge;
/// Configuration loading and layering.
pub mod config;
/// Host abstractions: file system and module resolution.
pub mod host;
/// Wire protocol: envelopes, framing, and the codec.
pub mod protocol;
/// Connection state, capability registry, and the request dispatcher.
pub mod server;
