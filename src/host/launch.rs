//! # Launch validation and command construction.
//!
//! Start preconditions for a worker process: the manifest must declare the
//! supported channel protocol, the runtime must resolve to an interpreter,
//! the module API version must fall inside the host's supported range
//! (packaged builds trust their manifest; dev checkouts are resolved
//! dynamically), and the entrypoint must exist on disk. Any failure aborts
//! only the current attempt — the supervisor schedules a delayed retry.

use std::path::PathBuf;

use semver::VersionReq;

use crate::config::HostConfig;
use crate::deps::ModuleResolver;
use crate::error::SpawnError;
use crate::model::{ModuleVersionInfo, RuntimeProtocol};
use crate::process::LaunchCommand;

/// Sentinel file enabling `--inspect` for unpackaged modules.
const DEBUG_INSPECT_FILE: &str = "DEBUG-INSPECT";

/// Environment variable carrying the connection id to the worker.
pub const CONNECTION_ID_ENV: &str = "CONNECTION_ID";
/// Environment variable carrying the single-use handshake token.
pub const VERIFICATION_TOKEN_ENV: &str = "VERIFICATION_TOKEN";
/// Environment variable carrying the manifest path within the module dir.
pub const MODULE_MANIFEST_ENV: &str = "MODULE_MANIFEST";

/// Outcome of the compatibility gate.
#[derive(Debug)]
pub(super) struct ResolvedModule {
    /// Interpreter to launch.
    pub interpreter: PathBuf,
    /// Effective module API version.
    pub api_version: semver::Version,
}

/// Validates runtime support and API-version compatibility.
pub(super) async fn check_module_compatibility(
    resolver: &dyn ModuleResolver,
    api_range: &VersionReq,
    info: &ModuleVersionInfo,
) -> Result<ResolvedModule, SpawnError> {
    if info.manifest.runtime.protocol != RuntimeProtocol::SocketJson {
        return Err(SpawnError::UnsupportedProtocol);
    }

    let kind = &info.manifest.runtime.kind;
    let Some(interpreter) = resolver.interpreter_for(kind) else {
        return Err(SpawnError::UnsupportedRuntime { kind: kind.clone() });
    };

    let api_version = if info.is_packaged {
        info.manifest.runtime.api_version.clone()
    } else {
        // A dev checkout may have been rebuilt against a different library
        // version than its manifest claims.
        resolver.dev_api_version(&info.base_path).await?
    };

    if !api_range.matches(&api_version) {
        return Err(SpawnError::IncompatibleApiVersion {
            version: api_version,
        });
    }

    Ok(ResolvedModule {
        interpreter,
        api_version,
    })
}

/// Verifies the manifest entrypoint exists and returns its full path.
pub(super) async fn resolve_entrypoint(info: &ModuleVersionInfo) -> Result<PathBuf, SpawnError> {
    let full_path = info.base_path.join(&info.manifest.runtime.entrypoint);
    match tokio::fs::try_exists(&full_path).await {
        Ok(true) => Ok(full_path),
        Ok(false) | Err(_) => Err(SpawnError::MissingEntrypoint { path: full_path }),
    }
}

/// Reads the optional `DEBUG-INSPECT` sentinel of an unpackaged module.
pub(super) async fn read_inspect_port(info: &ModuleVersionInfo) -> Option<u16> {
    let contents = tokio::fs::read_to_string(info.base_path.join(DEBUG_INSPECT_FILE))
        .await
        .ok()?;
    contents.trim().parse().ok()
}

/// Builds the launch command for one start attempt.
pub(super) fn build_launch_command(
    cfg: &HostConfig,
    info: &ModuleVersionInfo,
    resolved: &ResolvedModule,
    inspect_port: Option<u16>,
    connection_id: &str,
    auth_token: &str,
) -> LaunchCommand {
    let mut args = Vec::new();
    if let Some(port) = inspect_port {
        args.push(format!("--inspect={port}"));
    }
    args.push(info.manifest.runtime.entrypoint.clone());

    tracing::debug!(
        connection_id,
        interpreter = %resolved.interpreter.display(),
        api_version = %resolved.api_version,
        ?args,
        "resolved worker launch command"
    );

    LaunchCommand {
        program: resolved.interpreter.clone(),
        args,
        env: vec![
            (CONNECTION_ID_ENV.into(), connection_id.into()),
            (VERIFICATION_TOKEN_ENV.into(), auth_token.into()),
            (MODULE_MANIFEST_ENV.into(), "manifest.json".into()),
        ],
        cwd: info.base_path.clone(),
        kill_timeout: cfg.kill_timeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModuleManifest, ModuleRuntime};
    use crate::testing::StaticResolver;

    fn module_info(base_path: PathBuf, is_packaged: bool, api_version: &str) -> ModuleVersionInfo {
        ModuleVersionInfo {
            manifest: ModuleManifest {
                id: "camera".into(),
                name: "Camera".into(),
                runtime: ModuleRuntime {
                    protocol: RuntimeProtocol::SocketJson,
                    kind: "node22".into(),
                    entrypoint: "main.js".into(),
                    api_version: api_version.parse().expect("test version"),
                },
            },
            base_path,
            is_packaged,
            version_id: if is_packaged { "1.2.0".into() } else { "dev".into() },
        }
    }

    fn api_range() -> VersionReq {
        "^1".parse().expect("test range")
    }

    #[tokio::test]
    async fn test_unsupported_protocol_is_rejected() {
        let resolver = StaticResolver::new("/usr/bin/node");
        let mut info = module_info(PathBuf::from("/tmp"), true, "1.0.0");
        info.manifest.runtime.protocol = RuntimeProtocol::Unsupported;

        let err = check_module_compatibility(&*resolver, &api_range(), &info)
            .await
            .expect_err("rejected");
        assert!(matches!(err, SpawnError::UnsupportedProtocol));
    }

    #[tokio::test]
    async fn test_unknown_runtime_kind_is_rejected() {
        let resolver = StaticResolver::new("/usr/bin/node");
        let mut info = module_info(PathBuf::from("/tmp"), true, "1.0.0");
        info.manifest.runtime.kind = "python".into();

        let err = check_module_compatibility(&*resolver, &api_range(), &info)
            .await
            .expect_err("rejected");
        assert!(matches!(err, SpawnError::UnsupportedRuntime { ref kind } if kind == "python"));
    }

    #[tokio::test]
    async fn test_packaged_version_outside_range_is_rejected() {
        let resolver = StaticResolver::new("/usr/bin/node");
        let info = module_info(PathBuf::from("/tmp"), true, "2.0.0");

        let err = check_module_compatibility(&*resolver, &api_range(), &info)
            .await
            .expect_err("rejected");
        assert!(matches!(err, SpawnError::IncompatibleApiVersion { .. }));
    }

    #[tokio::test]
    async fn test_dev_modules_resolve_version_dynamically() {
        let resolver = StaticResolver::new("/usr/bin/node");
        resolver.set_dev_api_version("1.9.0");
        // The manifest claims an incompatible version; the dynamic value wins.
        let info = module_info(PathBuf::from("/tmp"), false, "0.3.0");

        let resolved = check_module_compatibility(&*resolver, &api_range(), &info)
            .await
            .expect("accepted");
        assert_eq!(resolved.api_version, semver::Version::new(1, 9, 0));
    }

    #[tokio::test]
    async fn test_missing_entrypoint_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let info = module_info(dir.path().to_path_buf(), true, "1.0.0");

        let err = resolve_entrypoint(&info).await.expect_err("rejected");
        assert!(matches!(err, SpawnError::MissingEntrypoint { .. }));
    }

    #[tokio::test]
    async fn test_existing_entrypoint_resolves() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("main.js"), "// entry").expect("write");
        let info = module_info(dir.path().to_path_buf(), true, "1.0.0");

        let path = resolve_entrypoint(&info).await.expect("resolves");
        assert_eq!(path, dir.path().join("main.js"));
    }

    #[tokio::test]
    async fn test_inspect_sentinel_is_parsed_and_applied() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(DEBUG_INSPECT_FILE), "9229\n").expect("write");
        let info = module_info(dir.path().to_path_buf(), false, "1.0.0");

        assert_eq!(read_inspect_port(&info).await, Some(9229));

        let resolved = ResolvedModule {
            interpreter: PathBuf::from("/usr/bin/node"),
            api_version: semver::Version::new(1, 0, 0),
        };
        let command = build_launch_command(
            &HostConfig::default(),
            &info,
            &resolved,
            Some(9229),
            "conn-1",
            "secret",
        );
        assert_eq!(command.args, vec!["--inspect=9229", "main.js"]);
        assert_eq!(command.env_value(CONNECTION_ID_ENV), Some("conn-1"));
        assert_eq!(command.env_value(VERIFICATION_TOKEN_ENV), Some("secret"));
    }

    #[tokio::test]
    async fn test_malformed_inspect_sentinel_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(DEBUG_INSPECT_FILE), "not-a-port").expect("write");
        let info = module_info(dir.path().to_path_buf(), false, "1.0.0");

        assert_eq!(read_inspect_port(&info).await, None);
    }
}
