// SPDX-License-Identifier: GPL-3.0-or-later

//! Module resolution adapter that consults the client per operation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use super::{SharedConnection, checked_call, parse_reply};
use crate::host::{
    ModuleResolver, PackageScope, ResolutionMode, ResolvedModule, ResolvedTypeReference,
};
use crate::server::Capability;

/// Wraps a local [`ModuleResolver`] and routes enabled operations to the
/// client, falling back to local on an empty reply.
pub struct BridgeResolver {
    conn: SharedConnection,
    local: Arc<dyn ModuleResolver>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ModuleResolutionRequest<'a> {
    module_name: &'a str,
    containing_file: &'a str,
    resolution_mode: ResolutionMode,
    // Serialized even when absent; the client expects an explicit null.
    redirected_reference: Option<&'a Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TypeReferenceResolutionRequest<'a> {
    type_reference_directive_name: &'a str,
    containing_file: &'a str,
    resolution_mode: ResolutionMode,
    redirected_reference: Option<&'a Value>,
}

/// Reply shape of `getPackageJsonScopeIfApplicable`: the manifest arrives
/// as unparsed text rather than a JSON object.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPackageScope {
    package_directory: String,
    #[serde(default)]
    directory_exists: bool,
    #[serde(default)]
    contents: String,
}

impl BridgeResolver {
    /// Creates an adapter over a connection and a local fallback.
    #[must_use]
    pub fn new(conn: SharedConnection, local: Arc<dyn ModuleResolver>) -> Self {
        Self { conn, local }
    }
}

impl ModuleResolver for BridgeResolver {
    fn resolve_module_name(
        &self,
        module_name: &str,
        containing_file: &str,
        resolution_mode: ResolutionMode,
        redirected_reference: Option<&Value>,
    ) -> Option<ResolvedModule> {
        if self.conn.capability_enabled(Capability::ResolveModuleName) {
            let reply = checked_call(
                &self.conn,
                "resolveModuleName",
                &ModuleResolutionRequest {
                    module_name,
                    containing_file,
                    resolution_mode,
                    redirected_reference,
                },
            );
            if !reply.is_empty() {
                // A JSON null reply is a terminal "did not resolve", not
                // an invitation to consult the local resolver.
                return parse_reply::<Option<ResolvedModule>>("resolveModuleName", &reply);
            }
            trace!(module_name, "empty reply, falling back to local resolver");
        }
        self.local.resolve_module_name(
            module_name,
            containing_file,
            resolution_mode,
            redirected_reference,
        )
    }

    fn resolve_type_reference_directive(
        &self,
        directive_name: &str,
        containing_file: &str,
        resolution_mode: ResolutionMode,
        redirected_reference: Option<&Value>,
    ) -> Option<ResolvedTypeReference> {
        if self
            .conn
            .capability_enabled(Capability::ResolveTypeReferenceDirective)
        {
            let reply = checked_call(
                &self.conn,
                "resolveTypeReferenceDirective",
                &TypeReferenceResolutionRequest {
                    type_reference_directive_name: directive_name,
                    containing_file,
                    resolution_mode,
                    redirected_reference,
                },
            );
            if !reply.is_empty() {
                return parse_reply::<Option<ResolvedTypeReference>>(
                    "resolveTypeReferenceDirective",
                    &reply,
                );
            }
        }
        self.local.resolve_type_reference_directive(
            directive_name,
            containing_file,
            resolution_mode,
            redirected_reference,
        )
    }

    fn package_json_scope_for_file(&self, path: &str) -> Option<PackageScope> {
        if self
            .conn
            .capability_enabled(Capability::GetPackageJsonScopeIfApplicable)
        {
            let reply = checked_call(&self.conn, "getPackageJsonScopeIfApplicable", path);
            if !reply.is_empty() {
                let raw: RawPackageScope = parse_reply("getPackageJsonScopeIfApplicable", &reply);
                let contents =
                    parse_reply("getPackageJsonScopeIfApplicable", raw.contents.as_bytes());
                return Some(PackageScope {
                    package_directory: raw.package_directory,
                    directory_exists: raw.directory_exists,
                    contents,
                });
            }
        }
        self.local.package_json_scope_for_file(path)
    }

    fn package_scope_for_directory(&self, directory: &str) -> Option<PackageScope> {
        if self
            .conn
            .capability_enabled(Capability::GetPackageScopeForPath)
        {
            let reply = checked_call(&self.conn, "getPackageScopeForPath", directory);
            if !reply.is_empty() {
                return parse_reply::<Option<PackageScope>>("getPackageScopeForPath", &reply);
            }
        }
        self.local.package_scope_for_directory(directory)
    }
}
