// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-connection registry of host operations the client answers remotely.
//!
//! The client opts in to callbacks through the `configure` operation; each
//! recognized name sets one bit. Bits combine with bitwise OR only and are
//! never cleared — the registry is monotonic for the connection's lifetime.

use std::sync::atomic::{AtomicU32, Ordering};

/// A host operation the client may opt to answer remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Capability {
    /// `directoryExists(path)`
    DirectoryExists = 1 << 0,
    /// `fileExists(path)`
    FileExists = 1 << 1,
    /// `getAccessibleEntries(path)`
    GetAccessibleEntries = 1 << 2,
    /// `readFile(path)`
    ReadFile = 1 << 3,
    /// `realpath(path)`
    Realpath = 1 << 4,
    /// `resolveModuleName(request)`
    ResolveModuleName = 1 << 5,
    /// `resolveTypeReferenceDirective(request)`
    ResolveTypeReferenceDirective = 1 << 6,
    /// `getPackageJsonScopeIfApplicable(path)`
    GetPackageJsonScopeIfApplicable = 1 << 7,
    /// `getPackageScopeForPath(directory)`
    GetPackageScopeForPath = 1 << 8,
}

impl Capability {
    /// Looks a capability up by its wire name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "directoryExists" => Some(Self::DirectoryExists),
            "fileExists" => Some(Self::FileExists),
            "getAccessibleEntries" => Some(Self::GetAccessibleEntries),
            "readFile" => Some(Self::ReadFile),
            "realpath" => Some(Self::Realpath),
            "resolveModuleName" => Some(Self::ResolveModuleName),
            "resolveTypeReferenceDirective" => Some(Self::ResolveTypeReferenceDirective),
            "getPackageJsonScopeIfApplicable" => Some(Self::GetPackageJsonScopeIfApplicable),
            "getPackageScopeForPath" => Some(Self::GetPackageScopeForPath),
            _ => None,
        }
    }

    /// The wire name of this capability, which doubles as the method field
    /// of the outbound call envelope.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::DirectoryExists => "directoryExists",
            Self::FileExists => "fileExists",
            Self::GetAccessibleEntries => "getAccessibleEntries",
            Self::ReadFile => "readFile",
            Self::Realpath => "realpath",
            Self::ResolveModuleName => "resolveModuleName",
            Self::ResolveTypeReferenceDirective => "resolveTypeReferenceDirective",
            Self::GetPackageJsonScopeIfApplicable => "getPackageJsonScopeIfApplicable",
            Self::GetPackageScopeForPath => "getPackageScopeForPath",
        }
    }
}

/// Monotonic bitset of enabled capabilities.
///
/// There is deliberately no clear operation: once the client has opted in
/// to answering an operation, the connection relies on it for its lifetime.
#[derive(Debug, Default)]
pub struct CapabilitySet {
    bits: AtomicU32,
}

impl CapabilitySet {
    /// Creates an empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }

    /// ORs a capability bit into the set. Idempotent.
    pub fn enable(&self, capability: Capability) {
        self.bits.fetch_or(capability as u32, Ordering::SeqCst);
    }

    /// Whether the client answers this operation remotely.
    #[must_use]
    pub fn contains(&self, capability: Capability) -> bool {
        self.bits.load(Ordering::SeqCst) & capability as u32 != 0
    }
}
