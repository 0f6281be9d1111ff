// SPDX-License-Identifier: GPL-3.0-or-later

//! Host abstractions the analysis layer runs against.
//!
//! [`FileSystem`] and [`ModuleResolver`] are the seams between the engine
//! and wherever its files actually live. [`local`] implements them against
//! the operating system; the bridge adapters wrap any implementation and
//! route individual operations to the client instead, when the client has
//! opted in to answering them.

pub mod local;

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

pub use local::{LocalResolver, OsFileSystem};

/// Path prefix for files shipped inside the server binary's library bundle.
/// Bundled paths are always read locally, never via the client.
pub const BUNDLED_SCHEME: &str = "bundled://";

/// Listing of one directory, split by entry kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntries {
    /// File names, not full paths.
    #[serde(default)]
    pub files: Vec<String>,
    /// Directory names, not full paths.
    #[serde(default)]
    pub directories: Vec<String>,
}

/// The subset of stat output the engine cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Size in bytes.
    pub size: u64,
    /// Last modification time, when the platform reports one.
    pub modified: Option<SystemTime>,
    /// Whether the path is a directory.
    pub is_directory: bool,
    /// Whether the path is a symbolic link.
    pub is_symlink: bool,
}

/// Module resolution mode of a containing file. Encoded as an integer on
/// the wire; 99 marks ECMAScript modules so new modes can slot in between.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ResolutionMode {
    /// Mode could not be determined from the containing file.
    #[default]
    None = 0,
    /// The containing file is a CommonJS module.
    CommonJs = 1,
    /// The containing file is an ECMAScript module.
    Esm = 99,
}

/// Identity of the package a resolved file belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageId {
    /// Package name as published.
    pub name: String,
    /// Path below the package root, empty when the root itself resolved.
    #[serde(default)]
    pub sub_module_name: String,
    /// Version from the package manifest.
    #[serde(default)]
    pub version: String,
}

/// A successful module name resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedModule {
    /// Absolute path of the file the name resolved to. Empty means the
    /// resolution failed.
    #[serde(default)]
    pub resolved_file_name: String,
    /// Extension of the resolved file, including the dot.
    #[serde(default)]
    pub extension: String,
    /// Whether the resolved file comes from an external library.
    #[serde(default)]
    pub is_external_library_import: bool,
    /// Identity of the owning package, when known.
    #[serde(default)]
    pub package_id: PackageId,
}

impl ResolvedModule {
    /// Whether this resolution actually found a file.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        !self.resolved_file_name.is_empty()
    }
}

/// A successful type reference directive resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedTypeReference {
    /// Absolute path of the declaration file. Empty means unresolved.
    #[serde(default)]
    pub resolved_file_name: String,
    /// Whether the file was found in a primary lookup location.
    #[serde(default)]
    pub primary: bool,
    /// Identity of the owning package, when known.
    #[serde(default)]
    pub package_id: PackageId,
}

/// The package manifest governing a path, found by walking toward the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageScope {
    /// Directory containing the manifest.
    pub package_directory: String,
    /// Whether that directory existed at lookup time.
    #[serde(default)]
    pub directory_exists: bool,
    /// Parsed manifest contents.
    #[serde(default)]
    pub contents: serde_json::Value,
}

/// Callback handed to [`FileSystem::walk_dir`] for each visited entry.
pub type WalkCallback<'a> = &'a mut dyn FnMut(&str, &FileMetadata) -> std::io::Result<()>;

/// File access as the engine sees it.
///
/// Paths are normalized slash-separated strings, absolute or
/// `bundled://`-prefixed. Fallible reads answer with `Option` rather than
/// errors; only mutations carry an error channel.
pub trait FileSystem: Send + Sync {
    /// Whether `path` names an existing directory.
    fn directory_exists(&self, path: &str) -> bool;

    /// Whether `path` names an existing regular file.
    fn file_exists(&self, path: &str) -> bool;

    /// Lists the entries of a directory that can actually be accessed.
    /// Unreadable or nonexistent directories come back empty.
    fn accessible_entries(&self, path: &str) -> DirEntries;

    /// Reads a file to a string. `None` when the file does not exist or
    /// cannot be decoded.
    fn read_file(&self, path: &str) -> Option<String>;

    /// Resolves symlinks to a canonical path. Paths that cannot be
    /// canonicalized come back unchanged.
    fn realpath(&self, path: &str) -> String;

    /// Whether the underlying store distinguishes paths by case.
    fn use_case_sensitive_file_names(&self) -> bool;

    /// Writes a file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    fn write_file(&self, path: &str, data: &str, write_byte_order_mark: bool)
    -> std::io::Result<()>;

    /// Walks a directory tree depth-first, invoking `visit` for every
    /// entry including `root` itself.
    ///
    /// # Errors
    ///
    /// Returns the first error from the walk or from `visit`.
    fn walk_dir(&self, root: &str, visit: WalkCallback<'_>) -> std::io::Result<()>;

    /// Stats a path. `None` when it does not exist.
    fn stat(&self, path: &str) -> Option<FileMetadata>;

    /// Removes a file or an entire directory tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be removed.
    fn remove(&self, path: &str) -> std::io::Result<()>;

    /// Sets a file's access and modification times.
    ///
    /// # Errors
    ///
    /// Returns an error if the times cannot be changed.
    fn set_times(
        &self,
        path: &str,
        accessed: SystemTime,
        modified: SystemTime,
    ) -> std::io::Result<()>;
}

/// Module and type reference resolution as the engine sees it.
///
/// `redirected_reference` carries the project reference redirect in effect,
/// opaque at this layer; resolvers that honor redirects interpret it.
pub trait ModuleResolver: Send + Sync {
    /// Resolves a module name relative to the file importing it. `None`
    /// when nothing matched.
    fn resolve_module_name(
        &self,
        module_name: &str,
        containing_file: &str,
        resolution_mode: ResolutionMode,
        redirected_reference: Option<&serde_json::Value>,
    ) -> Option<ResolvedModule>;

    /// Resolves a `/// <reference types="..." />` directive. `None` when
    /// nothing matched.
    fn resolve_type_reference_directive(
        &self,
        directive_name: &str,
        containing_file: &str,
        resolution_mode: ResolutionMode,
        redirected_reference: Option<&serde_json::Value>,
    ) -> Option<ResolvedTypeReference>;

    /// The package manifest scope governing a file, if module resolution
    /// rules make one applicable to it.
    fn package_json_scope_for_file(&self, path: &str) -> Option<PackageScope>;

    /// The package manifest scope governing a directory.
    fn package_scope_for_directory(&self, directory: &str) -> Option<PackageScope>;
}
