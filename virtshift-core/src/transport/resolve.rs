//! Connection endpoint resolution.
//!
//! A user-supplied host string is resolved against, in order: explicit call
//! options, the user's `~/.ssh/config` (Host aliases, HostName, User, Port,
//! IdentityFile), environment-derived defaults, and built-in defaults. The
//! first source that provides a value for a field wins.

use crate::command;
use crate::error::{Result, ShiftError};
use std::path::{Path, PathBuf};

/// Explicit per-call connection options (highest precedence).
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub username: Option<String>,
    pub port: Option<u16>,
    pub identity: Option<PathBuf>,
}

/// Fully resolved connection endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    /// The host string as the user supplied it
    pub alias: String,
    /// Hostname or address actually dialed
    pub hostname: String,
    /// Login user; `None` lets OpenSSH pick the current user
    pub user: Option<String>,
    pub port: u16,
    /// Identity key; `None` relies on the agent and default key locations
    pub identity: Option<PathBuf>,
}

/// Options gathered from matching `Host` blocks of an ssh_config file.
#[derive(Debug, Clone, Default)]
pub struct SshConfigOptions {
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
}

/// Resolve `host` into a dialable endpoint.
///
/// `default_port` and `default_identity` are the env/config-derived layer
/// below ssh_config in the precedence order.
pub fn resolve(
    host: &str,
    explicit: &ConnectOptions,
    default_port: u16,
    default_identity: Option<&Path>,
) -> Result<ResolvedEndpoint> {
    command::validate_hostname(host)?;
    let from_config = ssh_config_lookup(host, &ssh_config_path());

    let endpoint = ResolvedEndpoint {
        alias: host.to_string(),
        hostname: from_config.hostname.clone().unwrap_or_else(|| host.to_string()),
        user: explicit.username.clone().or_else(|| from_config.user.clone()),
        port: explicit.port.or(from_config.port).unwrap_or(default_port),
        identity: explicit
            .identity
            .clone()
            .or_else(|| from_config.identity_file.clone())
            .or_else(|| default_identity.map(Path::to_path_buf)),
    };

    if let Some(key) = &endpoint.identity {
        check_identity_file(key)?;
    }

    Ok(endpoint)
}

/// Default ssh_config location for the current user.
fn ssh_config_path() -> PathBuf {
    dirs::home_dir().map(|h| h.join(".ssh").join("config")).unwrap_or_default()
}

/// Look up `host` in an ssh_config file. Missing or unreadable files
/// resolve to an empty entry.
pub fn ssh_config_lookup(host: &str, path: &Path) -> SshConfigOptions {
    let Ok(content) = std::fs::read_to_string(path) else {
        return SshConfigOptions::default();
    };
    parse_ssh_config(&content, host)
}

/// Parse ssh_config content and collect options for `host`.
///
/// OpenSSH semantics: blocks are scanned top to bottom and the first value
/// obtained for each option wins across all matching blocks.
fn parse_ssh_config(content: &str, host: &str) -> SshConfigOptions {
    let mut result = SshConfigOptions::default();
    let mut current = SshConfigOptions::default();
    let mut matching = false;

    let merge = |entry: &SshConfigOptions, into: &mut SshConfigOptions| {
        if into.hostname.is_none() {
            into.hostname = entry.hostname.clone();
        }
        if into.user.is_none() {
            into.user = entry.user.clone();
        }
        if into.port.is_none() {
            into.port = entry.port;
        }
        if into.identity_file.is_none() {
            into.identity_file = entry.identity_file.clone();
        }
    };

    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = match line.split_once(|c: char| c.is_whitespace() || c == '=') {
            Some((k, v)) => (k.trim().to_lowercase(), v.trim().trim_matches('"')),
            None => continue,
        };

        if key == "host" {
            if matching {
                merge(&current, &mut result);
            }
            current = SshConfigOptions::default();
            matching = value.split_whitespace().any(|pattern| pattern_matches(pattern, host));
            continue;
        }

        if !matching {
            continue;
        }

        match key.as_str() {
            "hostname" => current.hostname = Some(value.to_string()),
            "user" => current.user = Some(value.to_string()),
            "port" => current.port = value.parse().ok(),
            "identityfile" => current.identity_file = Some(expand_tilde(value)),
            _ => {}
        }
    }
    if matching {
        merge(&current, &mut result);
    }

    result
}

/// Match an ssh_config `Host` pattern (`*` wildcard and `?` single char).
fn pattern_matches(pattern: &str, host: &str) -> bool {
    fn matches(p: &[u8], h: &[u8]) -> bool {
        match (p.first(), h.first()) {
            (None, None) => true,
            (Some(b'*'), _) => matches(&p[1..], h) || (!h.is_empty() && matches(p, &h[1..])),
            (Some(b'?'), Some(_)) => matches(&p[1..], &h[1..]),
            (Some(a), Some(b)) if a == b => matches(&p[1..], &h[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), host.as_bytes())
}

/// Expand a leading `~/` against the current home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Check that an identity key file exists, is a regular file, and is
/// readable only by its owner (mode 0600 or 0400).
pub fn check_identity_file(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|_| ShiftError::SshKey {
        path: path.to_path_buf(),
        reason: "key file not found".to_string(),
    })?;

    if !metadata.is_file() {
        return Err(ShiftError::SshKey {
            path: path.to_path_buf(),
            reason: "key path is not a regular file".to_string(),
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let mode = metadata.mode() & 0o777;
        if mode & 0o077 != 0 {
            return Err(ShiftError::SshKey {
                path: path.to_path_buf(),
                reason: format!(
                    "insecure permissions {:03o}; key files must be readable only by the owner (chmod 600)",
                    mode
                ),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
# build machines
Host build-*
    User builder
    Port 2201

Host kvm1
    HostName kvm1.internal.example.com
    User virt
    IdentityFile ~/.ssh/id_kvm
    Port 2222

Host *
    User fallback
"#;

    #[test]
    fn test_exact_alias() {
        let entry = parse_ssh_config(SAMPLE, "kvm1");
        assert_eq!(entry.hostname.as_deref(), Some("kvm1.internal.example.com"));
        assert_eq!(entry.user.as_deref(), Some("virt"));
        assert_eq!(entry.port, Some(2222));
        assert!(entry.identity_file.is_some());
    }

    #[test]
    fn test_wildcard_block() {
        let entry = parse_ssh_config(SAMPLE, "build-07");
        assert_eq!(entry.user.as_deref(), Some("builder"));
        assert_eq!(entry.port, Some(2201));
        assert!(entry.hostname.is_none());
    }

    #[test]
    fn test_first_value_wins() {
        // "Host *" matches kvm1 too, but the earlier block already set User.
        let entry = parse_ssh_config(SAMPLE, "kvm1");
        assert_eq!(entry.user.as_deref(), Some("virt"));

        let entry = parse_ssh_config(SAMPLE, "unrelated");
        assert_eq!(entry.user.as_deref(), Some("fallback"));
    }

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("kvm?", "kvm1"));
        assert!(!pattern_matches("kvm?", "kvm12"));
        assert!(pattern_matches("*.example.com", "a.example.com"));
        assert!(!pattern_matches("*.example.com", "a.example.org"));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_permission_check() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_test");
        let mut f = std::fs::File::create(&key).unwrap();
        writeln!(f, "not a real key").unwrap();

        std::fs::set_permissions(&key, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(check_identity_file(&key).is_err());

        std::fs::set_permissions(&key, std::fs::Permissions::from_mode(0o600)).unwrap();
        assert!(check_identity_file(&key).is_ok());

        std::fs::set_permissions(&key, std::fs::Permissions::from_mode(0o400)).unwrap();
        assert!(check_identity_file(&key).is_ok());

        assert!(check_identity_file(&dir.path().join("missing")).is_err());
    }
}
