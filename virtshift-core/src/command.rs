//! Secure remote command assembly.
//!
//! Every shell command sent to a remote host is built here. User-derived
//! values pass through a validator and are single-quoted per POSIX rules
//! before interpolation, so a command string never leaves this module with
//! unquoted untrusted input. Validation failures are fatal at construction
//! time.

use crate::error::{Result, ShiftError};
use crate::types::Bandwidth;

/// VM names that must never be used.
const RESERVED_VM_NAMES: &[&str] = &["localhost", "none", "all"];

/// virsh subcommands the builder will emit.
const VIRSH_SUBCOMMANDS: &[&str] = &[
    "list",
    "dominfo",
    "domstate",
    "dumpxml",
    "define",
    "undefine",
    "destroy",
    "start",
    "shutdown",
    "snapshot-create-as",
    "snapshot-delete",
    "pool-list",
    "pool-info",
    "pool-refresh",
    "nodeinfo",
    "nodememstats",
];

/// Quote a value for POSIX sh: wrap in single quotes, escaping embedded
/// single quotes as `'\''`.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Validate a VM name: `[A-Za-z0-9_-]`, 1-64 chars, not reserved.
pub fn validate_vm_name(name: &str) -> Result<&str> {
    if name.is_empty() || name.len() > 64 {
        return Err(ShiftError::InvalidVmName {
            name: name.to_string(),
            reason: "must be 1-64 characters".to_string(),
        });
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(ShiftError::InvalidVmName {
            name: name.to_string(),
            reason: "only letters, digits, underscores and hyphens are allowed".to_string(),
        });
    }
    if RESERVED_VM_NAMES.contains(&name.to_lowercase().as_str()) {
        return Err(ShiftError::InvalidVmName {
            name: name.to_string(),
            reason: "name is reserved".to_string(),
        });
    }
    Ok(name)
}

/// Validate a snapshot name: same character set and length as VM names.
pub fn validate_snapshot_name(name: &str) -> Result<&str> {
    if name.is_empty() || name.len() > 64 {
        return Err(ShiftError::Validation {
            reason: format!("snapshot name must be 1-64 characters: {}", name),
        });
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(ShiftError::Validation {
            reason: format!("snapshot name contains invalid characters: {}", name),
        });
    }
    Ok(name)
}

/// Validate a hostname: DNS-style name up to 255 chars, or an IP literal.
pub fn validate_hostname(host: &str) -> Result<&str> {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return Ok(host);
    }
    if host.is_empty() || host.len() > 255 {
        return Err(ShiftError::InvalidHost {
            host: host.to_string(),
            reason: "must be 1-255 characters".to_string(),
        });
    }
    if !host.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-') {
        return Err(ShiftError::InvalidHost {
            host: host.to_string(),
            reason: "only letters, digits, dots and hyphens are allowed".to_string(),
        });
    }
    Ok(host)
}

/// Validate a remote path: absolute, no `..` segments after normalization,
/// and, when `base_dir` is given, confined to it.
pub fn validate_path<'a>(path: &'a str, base_dir: Option<&str>) -> Result<&'a str> {
    if path.is_empty() {
        return Err(ShiftError::InvalidPath {
            path: path.to_string(),
            reason: "path is empty".to_string(),
        });
    }
    if !path.starts_with('/') {
        return Err(ShiftError::InvalidPath {
            path: path.to_string(),
            reason: "path must be absolute".to_string(),
        });
    }
    if path.contains('\0') || path.contains('\n') {
        return Err(ShiftError::InvalidPath {
            path: path.to_string(),
            reason: "path contains control characters".to_string(),
        });
    }

    let normalized = normalize(path);
    if normalized.split('/').any(|seg| seg == "..") {
        return Err(ShiftError::InvalidPath {
            path: path.to_string(),
            reason: "path traversal detected".to_string(),
        });
    }

    if let Some(base) = base_dir {
        let base = normalize(base);
        let with_slash = format!("{}/", base.trim_end_matches('/'));
        if normalized != base && !normalized.starts_with(&with_slash) {
            return Err(ShiftError::InvalidPath {
                path: path.to_string(),
                reason: format!("path must be under {}", base),
            });
        }
    }

    Ok(path)
}

/// Validate a TCP port.
pub fn validate_port(port: i64) -> Result<u16> {
    if !(1..=65535).contains(&port) {
        return Err(ShiftError::InvalidPort { port });
    }
    Ok(port as u16)
}

/// Collapse `.` segments and duplicate slashes without resolving `..`
/// (a surviving `..` is rejected by the caller, not resolved away).
fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Build a command from a template with `{name}` placeholders. Every
/// parameter value is quoted; placeholders without a parameter, and
/// parameters without a placeholder, are both refused.
pub fn safe(template: &str, params: &[(&str, &str)]) -> Result<String> {
    let mut result = String::new();
    let mut used = vec![false; params.len()];
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        let Some(end_rel) = rest[start..].find('}') else {
            return Err(ShiftError::Validation {
                reason: format!("unclosed placeholder in template: {}", template),
            });
        };
        let end = start + end_rel;
        let key = &rest[start + 1..end];
        result.push_str(&rest[..start]);

        match params.iter().position(|(k, _)| *k == key) {
            Some(idx) => {
                used[idx] = true;
                result.push_str(&quote(params[idx].1));
            }
            None => {
                return Err(ShiftError::Validation {
                    reason: format!("template references unknown key: {}", key),
                });
            }
        }
        rest = &rest[end + 1..];
    }
    result.push_str(rest);

    if let Some(idx) = used.iter().position(|u| !u) {
        return Err(ShiftError::Validation {
            reason: format!("parameter not used by template: {}", params[idx].0),
        });
    }

    Ok(result)
}

/// Build an rsync push command to run on the source host.
///
/// Defaults are sparse-aware, resumable and in-place with no compression:
/// `-avS --partial --inplace --progress`. Additional options must look like
/// rsync flags.
pub fn rsync(
    source_path: &str,
    dest_path: &str,
    dest_host: Option<&str>,
    bandwidth: Option<&Bandwidth>,
    options: &[&str],
) -> Result<String> {
    validate_path(source_path, None)?;
    validate_path(dest_path, None)?;

    let mut parts = vec![
        "rsync".to_string(),
        "-avS".to_string(),
        "--partial".to_string(),
        "--inplace".to_string(),
        "--progress".to_string(),
    ];

    if let Some(bw) = bandwidth {
        parts.push(format!("--bwlimit={}", bw.kib_per_sec()));
    }

    for opt in options {
        let valid = opt.starts_with('-')
            && opt
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '=' || c == '.' || c == '_');
        if !valid {
            return Err(ShiftError::Validation { reason: format!("invalid rsync option: {}", opt) });
        }
        parts.push((*opt).to_string());
    }

    parts.push(quote(source_path));
    match dest_host {
        Some(host) => {
            validate_hostname(host)?;
            parts.push(quote(&format!("{}:{}", host, dest_path)));
        }
        None => parts.push(quote(dest_path)),
    }

    Ok(parts.join(" "))
}

/// Typed, validated argument for a virsh command.
pub enum VirshArg<'a> {
    /// A VM name
    Name(&'a str),
    /// A snapshot name
    Snapshot(&'a str),
    /// An absolute path
    Path(&'a str),
    /// A fixed flag like `--all`; must look like an option
    Flag(&'a str),
    /// Free-form text (quoted), e.g. a snapshot description
    Text(&'a str),
}

/// Build a virsh command against a connection URI. The subcommand is
/// whitelisted and every argument validated by type.
pub fn virsh(uri: &str, subcommand: &str, args: &[VirshArg<'_>]) -> Result<String> {
    if !VIRSH_SUBCOMMANDS.contains(&subcommand) {
        return Err(ShiftError::Validation {
            reason: format!("virsh subcommand not allowed: {}", subcommand),
        });
    }

    let mut parts = vec!["virsh".to_string(), "-c".to_string(), quote(uri), subcommand.to_string()];

    for arg in args {
        match arg {
            VirshArg::Name(name) => {
                validate_vm_name(name)?;
                parts.push(quote(name));
            }
            VirshArg::Snapshot(name) => {
                validate_snapshot_name(name)?;
                parts.push(quote(name));
            }
            VirshArg::Path(path) => {
                validate_path(path, None)?;
                parts.push(quote(path));
            }
            VirshArg::Flag(flag) => {
                let valid = flag.starts_with('-')
                    && flag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '=');
                if !valid {
                    return Err(ShiftError::Validation {
                        reason: format!("invalid virsh flag: {}", flag),
                    });
                }
                parts.push((*flag).to_string());
            }
            VirshArg::Text(text) => parts.push(quote(text)),
        }
    }

    Ok(parts.join(" "))
}

/// Force-stop a VM.
pub fn virsh_destroy(uri: &str, vm_name: &str) -> Result<String> {
    virsh(uri, "destroy", &[VirshArg::Name(vm_name)])
}

/// Remove a VM definition (storage is handled separately).
pub fn virsh_undefine(uri: &str, vm_name: &str) -> Result<String> {
    virsh(uri, "undefine", &[VirshArg::Name(vm_name)])
}

/// Remove a single file.
pub fn rm_file(path: &str) -> Result<String> {
    validate_path(path, None)?;
    Ok(format!("rm -f {}", quote(path)))
}

/// Recursively remove a directory.
pub fn rm_directory(path: &str) -> Result<String> {
    validate_path(path, None)?;
    Ok(format!("rm -rf {}", quote(path)))
}

/// Move a file within a host (rename when on the same filesystem).
pub fn move_file(src: &str, dst: &str) -> Result<String> {
    validate_path(src, None)?;
    validate_path(dst, None)?;
    Ok(format!("mv {} {}", quote(src), quote(dst)))
}

/// Create a directory and parents.
pub fn mkdir(path: &str) -> Result<String> {
    validate_path(path, None)?;
    Ok(format!("mkdir -p {}", quote(path)))
}

/// Report a file's virtual size in bytes.
pub fn stat_size(path: &str) -> Result<String> {
    validate_path(path, None)?;
    Ok(format!("stat --format=%s {}", quote(path)))
}

/// Report a file's allocated size in bytes.
pub fn du_bytes(path: &str) -> Result<String> {
    validate_path(path, None)?;
    Ok(format!("du -B1 {} | cut -f1", quote(path)))
}

/// Compute a SHA-256 digest of a file.
pub fn sha256sum(path: &str) -> Result<String> {
    validate_path(path, None)?;
    Ok(format!("sha256sum {} | cut -d' ' -f1", quote(path)))
}

/// Test whether a regular file exists (exit 0 when it does).
pub fn file_exists(path: &str) -> Result<String> {
    validate_path(path, None)?;
    Ok(format!("test -f {}", quote(path)))
}

/// Resolve a tool on PATH (exit 0 when present).
pub fn which(tool: &str) -> Result<String> {
    if !tool.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.') {
        return Err(ShiftError::Validation { reason: format!("invalid tool name: {}", tool) });
    }
    Ok(format!("command -v {}", quote(tool)))
}

/// Build an scp push command to run on the source host. Bandwidth, when
/// given, becomes scp's cipher-level `-l` limit (Kbit/s).
pub fn scp(
    source_path: &str,
    dest_host: &str,
    dest_path: &str,
    port: Option<u16>,
    bandwidth: Option<&Bandwidth>,
) -> Result<String> {
    validate_path(source_path, None)?;
    validate_path(dest_path, None)?;
    validate_hostname(dest_host)?;

    let mut parts = vec!["scp".to_string(), "-B".to_string()];
    if let Some(bw) = bandwidth {
        if bw.kbit_per_sec() > 0 {
            parts.push(format!("-l {}", bw.kbit_per_sec()));
        }
    }
    if let Some(p) = port {
        parts.push(format!("-P {}", p));
    }
    parts.push(quote(source_path));
    parts.push(quote(&format!("{}:{}", dest_host, dest_path)));
    Ok(parts.join(" "))
}

/// Build a blocksync invocation to run on the source host.
pub fn blocksync(
    source_path: &str,
    dest_host: &str,
    dest_path: &str,
    block_size: u64,
    bandwidth: Option<&Bandwidth>,
) -> Result<String> {
    validate_path(source_path, None)?;
    validate_path(dest_path, None)?;
    validate_hostname(dest_host)?;

    let mut parts = vec![
        "blocksync".to_string(),
        format!("--blocksize {}", block_size),
    ];
    if let Some(bw) = bandwidth {
        if bw.kib_per_sec() > 0 {
            parts.push(format!("--bwlimit {}", bw.kib_per_sec()));
        }
    }
    parts.push(quote(source_path));
    parts.push(quote(dest_host));
    parts.push(quote(dest_path));
    Ok(parts.join(" "))
}
