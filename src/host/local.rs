// SPDX-License-Identifier: GPL-3.0-or-later

//! Operating-system implementations of the host traits.
//!
//! [`OsFileSystem`] maps `bundled://` paths onto an optional on-disk bundle
//! root and serves everything else straight from std. [`LocalResolver`] is
//! a deliberately plain Node-style resolver: relative and rooted specifiers
//! resolve by extension probing, bare specifiers walk `node_modules` up the
//! directory tree.

use std::fs::{self, File, FileTimes};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use ignore::WalkBuilder;
use serde_json::Value;
use tracing::trace;

use super::{
    BUNDLED_SCHEME, DirEntries, FileMetadata, FileSystem, ModuleResolver, PackageId, PackageScope,
    ResolutionMode, ResolvedModule, ResolvedTypeReference, WalkCallback,
};

const SOURCE_EXTENSIONS: [&str; 5] = [".ts", ".tsx", ".d.ts", ".js", ".jsx"];
const DECLARATION_EXTENSION: &str = ".d.ts";

/// File access backed by the operating system.
#[derive(Debug, Clone, Default)]
pub struct OsFileSystem {
    bundled_root: Option<PathBuf>,
}

impl OsFileSystem {
    /// Creates a file system with no bundled library root; `bundled://`
    /// paths will not resolve.
    #[must_use]
    pub const fn new() -> Self {
        Self { bundled_root: None }
    }

    /// Creates a file system that serves `bundled://` paths from the given
    /// directory.
    #[must_use]
    pub fn with_bundled_root(root: impl Into<PathBuf>) -> Self {
        Self {
            bundled_root: Some(root.into()),
        }
    }

    /// Maps a protocol path to an on-disk path. `None` for a `bundled://`
    /// path when no bundle root is configured.
    fn locate(&self, path: &str) -> Option<PathBuf> {
        path.strip_prefix(BUNDLED_SCHEME).map_or_else(
            || Some(PathBuf::from(path)),
            |rest| {
                let root = self.bundled_root.as_ref()?;
                Some(root.join(rest.trim_start_matches('/')))
            },
        )
    }
}

impl FileSystem for OsFileSystem {
    fn directory_exists(&self, path: &str) -> bool {
        self.locate(path).is_some_and(|p| p.is_dir())
    }

    fn file_exists(&self, path: &str) -> bool {
        self.locate(path).is_some_and(|p| p.is_file())
    }

    fn accessible_entries(&self, path: &str) -> DirEntries {
        let Some(dir) = self.locate(path) else {
            return DirEntries::default();
        };
        let Ok(read) = fs::read_dir(dir) else {
            return DirEntries::default();
        };

        let mut entries = DirEntries::default();
        for entry in read.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.file_type() {
                Ok(kind) if kind.is_dir() => entries.directories.push(name),
                Ok(_) => entries.files.push(name),
                Err(_) => {}
            }
        }
        entries.files.sort_unstable();
        entries.directories.sort_unstable();
        entries
    }

    fn read_file(&self, path: &str) -> Option<String> {
        let located = self.locate(path)?;
        fs::read_to_string(located).ok()
    }

    fn realpath(&self, path: &str) -> String {
        self.locate(path)
            .and_then(|p| fs::canonicalize(p).ok())
            .map_or_else(|| path.to_string(), |p| p.to_string_lossy().into_owned())
    }

    fn use_case_sensitive_file_names(&self) -> bool {
        !cfg!(any(windows, target_os = "macos"))
    }

    fn write_file(
        &self,
        path: &str,
        data: &str,
        write_byte_order_mark: bool,
    ) -> io::Result<()> {
        let located = self
            .locate(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no bundle root configured"))?;
        if let Some(parent) = located.parent() {
            fs::create_dir_all(parent)?;
        }
        if write_byte_order_mark {
            fs::write(located, format!("\u{feff}{data}"))
        } else {
            fs::write(located, data)
        }
    }

    fn walk_dir(&self, root: &str, visit: WalkCallback<'_>) -> io::Result<()> {
        let Some(located) = self.locate(root) else {
            return Ok(());
        };
        // No ignore-file or hidden-entry filtering; the engine sees the
        // whole tree and applies its own excludes.
        for entry in WalkBuilder::new(located).standard_filters(false).build() {
            let entry = entry.map_err(io::Error::other)?;
            let metadata = entry.metadata().map_err(io::Error::other)?;
            let info = FileMetadata {
                size: metadata.len(),
                modified: metadata.modified().ok(),
                is_directory: metadata.is_dir(),
                is_symlink: metadata.is_symlink(),
            };
            visit(&entry.path().to_string_lossy(), &info)?;
        }
        Ok(())
    }

    fn stat(&self, path: &str) -> Option<FileMetadata> {
        let located = self.locate(path)?;
        let metadata = fs::symlink_metadata(located).ok()?;
        Some(FileMetadata {
            size: metadata.len(),
            modified: metadata.modified().ok(),
            is_directory: metadata.is_dir(),
            is_symlink: metadata.is_symlink(),
        })
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        let located = self
            .locate(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no bundle root configured"))?;
        if located.is_dir() {
            fs::remove_dir_all(located)
        } else {
            fs::remove_file(located)
        }
    }

    fn set_times(
        &self,
        path: &str,
        accessed: SystemTime,
        modified: SystemTime,
    ) -> io::Result<()> {
        let located = self
            .locate(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no bundle root configured"))?;
        let file = File::options().write(true).open(located)?;
        file.set_times(
            FileTimes::new()
                .set_accessed(accessed)
                .set_modified(modified),
        )
    }
}

/// Node-style module resolution over a [`FileSystem`].
pub struct LocalResolver {
    fs: Arc<dyn FileSystem>,
}

impl LocalResolver {
    /// Creates a resolver reading through the given file system.
    #[must_use]
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    /// Probes `base` as-is, then with each source extension appended, then
    /// as a directory with an index file.
    fn probe(&self, base: &str) -> Option<String> {
        if has_source_extension(base) && self.fs.file_exists(base) {
            return Some(base.to_string());
        }
        for extension in SOURCE_EXTENSIONS {
            let candidate = format!("{base}{extension}");
            if self.fs.file_exists(&candidate) {
                return Some(candidate);
            }
        }
        if self.fs.directory_exists(base) {
            for extension in SOURCE_EXTENSIONS {
                let candidate = format!("{base}/index{extension}");
                if self.fs.file_exists(&candidate) {
                    return Some(candidate);
                }
            }
        }
        None
    }

    /// Resolves inside one package directory: manifest entry points first,
    /// then plain probing.
    fn probe_package(&self, package_dir: &str, sub_path: &str) -> Option<(String, PackageId)> {
        let manifest = self
            .fs
            .read_file(&format!("{package_dir}/package.json"))
            .and_then(|text| serde_json::from_str::<Value>(&text).ok());

        let package_id = PackageId {
            name: Path::new(package_dir)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            sub_module_name: sub_path.to_string(),
            version: manifest
                .as_ref()
                .and_then(|m| m.get("version"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        };

        if sub_path.is_empty() {
            // Root import: honor the manifest's entry points before the
            // index fallback.
            if let Some(manifest) = &manifest {
                for key in ["types", "typings", "main"] {
                    if let Some(entry) = manifest.get(key).and_then(Value::as_str) {
                        let base = format!("{package_dir}/{}", entry.trim_start_matches("./"));
                        if let Some(found) = self.probe(trim_extension(&base)) {
                            return Some((found, package_id));
                        }
                        if self.fs.file_exists(&base) {
                            return Some((base, package_id));
                        }
                    }
                }
            }
            return self.probe(package_dir).map(|found| (found, package_id));
        }

        self.probe(&format!("{package_dir}/{sub_path}"))
            .map(|found| (found, package_id))
    }

    /// Splits a bare specifier into package name and sub-path, keeping
    /// scoped names (`@scope/name`) intact.
    fn resolve_bare(&self, specifier: &str, containing_file: &str) -> Option<(String, PackageId)> {
        let (package, sub_path) = split_package_specifier(specifier);
        let mut dir = parent_dir(containing_file);
        loop {
            let package_dir = format!("{dir}/node_modules/{package}");
            if self.fs.directory_exists(&package_dir)
                && let Some(found) = self.probe_package(&package_dir, sub_path)
            {
                return Some(found);
            }
            dir = match parent_of(&dir) {
                Some(parent) => parent,
                None => return None,
            };
        }
    }

    fn scope_for_directory(&self, directory: &str) -> Option<PackageScope> {
        let mut dir = directory.to_string();
        loop {
            let manifest_path = format!("{dir}/package.json");
            if let Some(text) = self.fs.read_file(&manifest_path) {
                let contents = serde_json::from_str(&text).ok()?;
                return Some(PackageScope {
                    package_directory: dir,
                    directory_exists: true,
                    contents,
                });
            }
            dir = parent_of(&dir)?;
        }
    }
}

impl ModuleResolver for LocalResolver {
    fn resolve_module_name(
        &self,
        module_name: &str,
        containing_file: &str,
        _resolution_mode: ResolutionMode,
        _redirected_reference: Option<&Value>,
    ) -> Option<ResolvedModule> {
        trace!(module_name, containing_file, "resolving module name");
        let (resolved, package_id, external) = if is_relative(module_name) {
            let base = join_path(&parent_dir(containing_file), module_name);
            (self.probe(&base)?, PackageId::default(), false)
        } else if module_name.starts_with('/') {
            (self.probe(module_name)?, PackageId::default(), false)
        } else {
            let (found, id) = self.resolve_bare(module_name, containing_file)?;
            (found, id, true)
        };

        Some(ResolvedModule {
            extension: extension_of(&resolved),
            resolved_file_name: resolved,
            is_external_library_import: external,
            package_id,
        })
    }

    fn resolve_type_reference_directive(
        &self,
        directive_name: &str,
        containing_file: &str,
        _resolution_mode: ResolutionMode,
        _redirected_reference: Option<&Value>,
    ) -> Option<ResolvedTypeReference> {
        trace!(directive_name, containing_file, "resolving type reference");
        // Primary lookup is @types; the package's own declarations are the
        // secondary location.
        let mut dir = parent_dir(containing_file);
        loop {
            let types_dir = format!("{dir}/node_modules/@types/{directive_name}");
            if self.fs.directory_exists(&types_dir)
                && let Some((found, package_id)) = self.probe_package(&types_dir, "")
            {
                return Some(ResolvedTypeReference {
                    resolved_file_name: found,
                    primary: true,
                    package_id,
                });
            }
            dir = match parent_of(&dir) {
                Some(parent) => parent,
                None => break,
            };
        }

        let (found, package_id) = self.resolve_bare(directive_name, containing_file)?;
        found.ends_with(DECLARATION_EXTENSION).then(|| ResolvedTypeReference {
            resolved_file_name: found,
            primary: false,
            package_id,
        })
    }

    fn package_json_scope_for_file(&self, path: &str) -> Option<PackageScope> {
        self.scope_for_directory(&parent_dir(path))
    }

    fn package_scope_for_directory(&self, directory: &str) -> Option<PackageScope> {
        self.scope_for_directory(directory)
    }
}

fn is_relative(specifier: &str) -> bool {
    specifier.starts_with("./") || specifier.starts_with("../")
}

fn has_source_extension(path: &str) -> bool {
    SOURCE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

fn extension_of(path: &str) -> String {
    if path.ends_with(DECLARATION_EXTENSION) {
        return DECLARATION_EXTENSION.to_string();
    }
    path.rfind('.')
        .map(|dot| path[dot..].to_string())
        .unwrap_or_default()
}

fn trim_extension(path: &str) -> &str {
    SOURCE_EXTENSIONS
        .iter()
        .find_map(|ext| path.strip_suffix(ext))
        .unwrap_or(path)
}

fn parent_dir(path: &str) -> String {
    parent_of(path).unwrap_or_else(|| "/".to_string())
}

fn parent_of(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    let cut = trimmed.rfind('/')?;
    if cut == 0 {
        (trimmed.len() > 1).then(|| "/".to_string())
    } else {
        Some(trimmed[..cut].to_string())
    }
}

fn join_path(base: &str, relative: &str) -> String {
    let mut segments: Vec<&str> = base.split('/').filter(|s| !s.is_empty()).collect();
    for segment in relative.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

fn split_package_specifier(specifier: &str) -> (String, &str) {
    let mut parts = specifier.splitn(if specifier.starts_with('@') { 3 } else { 2 }, '/');
    let mut package = parts.next().unwrap_or_default().to_string();
    if specifier.starts_with('@')
        && let Some(name) = parts.next()
    {
        package = format!("{package}/{name}");
    }
    (package, parts.next().unwrap_or_default())
}
