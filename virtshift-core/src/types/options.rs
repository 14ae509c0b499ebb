//! Operation option types.

use crate::error::{Result, ShiftError};
use serde::{Deserialize, Serialize};

/// Hard bound on concurrent disk transfers.
pub const MAX_PARALLEL_TRANSFERS: u32 = 16;

/// Default operation timeout for clones, in seconds.
pub const DEFAULT_CLONE_TIMEOUT_SECS: u64 = 3600;

/// Default operation timeout for syncs, in seconds.
pub const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 7200;

/// Options for a clone operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneOptions {
    /// Name for the cloned VM; defaults to `{source_name}_clone`
    pub new_name: Option<String>,

    /// Overwrite an existing target VM. Cleanup is total replacement: every
    /// disk referenced by the existing definition is removed, including
    /// disks the source VM does not have.
    pub force: bool,

    /// Perform preflight only and report the plan
    pub dry_run: bool,

    /// Upper bound on concurrent disk transfers (1-16)
    pub parallel: u32,

    /// Verify a SHA-256 checksum of each disk after transfer
    pub verify: bool,

    /// Copy source MAC addresses instead of generating new ones
    pub preserve_mac: bool,

    /// Bandwidth limit; `None` means unlimited
    pub bandwidth_limit: Option<Bandwidth>,

    /// Overall operation deadline in seconds
    pub timeout_secs: u64,

    /// Remove a pre-existing target VM before cloning so that repeated
    /// invocations converge to the same end state
    pub idempotent: bool,

    /// Transfer strategy
    pub transfer_method: TransferMethod,

    /// Logical network renames applied to the clone's definition
    /// (source network or bridge name -> destination name)
    pub network_map: Vec<(String, String)>,
}

impl Default for CloneOptions {
    fn default() -> Self {
        Self {
            new_name: None,
            force: false,
            dry_run: false,
            parallel: 4,
            verify: false,
            preserve_mac: false,
            bandwidth_limit: None,
            timeout_secs: DEFAULT_CLONE_TIMEOUT_SECS,
            idempotent: false,
            transfer_method: TransferMethod::Rsync,
            network_map: Vec::new(),
        }
    }
}

impl CloneOptions {
    /// Validate option ranges.
    pub fn validate(&self) -> Result<()> {
        if self.parallel < 1 || self.parallel > MAX_PARALLEL_TRANSFERS {
            return Err(ShiftError::Validation {
                reason: format!(
                    "parallel must be between 1 and {}, got {}",
                    MAX_PARALLEL_TRANSFERS, self.parallel
                ),
            });
        }
        if self.timeout_secs == 0 {
            return Err(ShiftError::InvalidTimeout { seconds: 0 });
        }
        Ok(())
    }

    /// Target VM name, applying the `{source_name}_clone` default.
    pub fn effective_new_name(&self, source_name: &str) -> String {
        self.new_name.clone().unwrap_or_else(|| format!("{}_clone", source_name))
    }

    /// Whether an existing target VM should be cleaned up rather than
    /// rejected. `idempotent` and `force` behave identically here.
    pub fn overwrite_existing(&self) -> bool {
        self.idempotent || self.force
    }
}

/// Options for a sync operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Target VM name on the destination; defaults to the source name
    pub target_name: Option<String>,

    /// Create a snapshot checkpoint on the destination before syncing
    pub checkpoint: bool,

    /// Compute a delta report before transferring
    pub delta_only: bool,

    /// Bandwidth limit; `None` means unlimited
    pub bandwidth_limit: Option<Bandwidth>,

    /// Overall operation deadline in seconds
    pub timeout_secs: u64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            target_name: None,
            checkpoint: false,
            delta_only: true,
            bandwidth_limit: None,
            timeout_secs: DEFAULT_SYNC_TIMEOUT_SECS,
        }
    }
}

/// Transfer strategy selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMethod {
    /// rsync over SSH: resumable, sparse-aware, general purpose
    #[default]
    Rsync,

    /// One-shot scp copy: fast on stable networks, no resume
    Stream,

    /// Block-level differential sync of an existing destination file
    Blocksync,
}

impl TransferMethod {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rsync => "rsync",
            Self::Stream => "stream",
            Self::Blocksync => "blocksync",
        }
    }

    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "rsync" => Some(Self::Rsync),
            "stream" => Some(Self::Stream),
            "blocksync" => Some(Self::Blocksync),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransferMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A parsed bandwidth limit such as `100M` or `1G`.
///
/// The canonical unit is KiB/s, which is what rsync's `--bwlimit` and scp's
/// `-l` (after conversion to Kbit/s) consume. A value of zero is accepted and
/// means "no throttling" to the underlying tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Bandwidth {
    raw: String,
    kib_per_sec: u64,
}

impl Bandwidth {
    /// Parse a limit string: digits with an optional K/M/G/T suffix.
    /// A bare number is interpreted as KiB/s.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ShiftError::InvalidBandwidth { value: s.to_string() });
        }

        let (digits, suffix) = match s.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
            Some((idx, _)) => s.split_at(idx),
            None => (s, ""),
        };
        if digits.is_empty() || suffix.len() > 1 {
            return Err(ShiftError::InvalidBandwidth { value: s.to_string() });
        }

        let value: u64 = digits
            .parse()
            .map_err(|_| ShiftError::InvalidBandwidth { value: s.to_string() })?;

        let kib_per_sec = match suffix {
            "" | "K" | "k" => value,
            "M" | "m" => value * 1024,
            "G" | "g" => value * 1024 * 1024,
            "T" | "t" => value * 1024 * 1024 * 1024,
            _ => return Err(ShiftError::InvalidBandwidth { value: s.to_string() }),
        };

        Ok(Self { raw: s.to_string(), kib_per_sec })
    }

    /// Parse an optional limit; an empty string means unlimited.
    pub fn parse_opt(s: &str) -> Result<Option<Self>> {
        if s.trim().is_empty() {
            return Ok(None);
        }
        Self::parse(s).map(Some)
    }

    /// Limit in KiB/s (rsync `--bwlimit` unit).
    pub fn kib_per_sec(&self) -> u64 {
        self.kib_per_sec
    }

    /// Limit in Kbit/s (scp `-l` unit).
    pub fn kbit_per_sec(&self) -> u64 {
        self.kib_per_sec * 8
    }

    /// Original string form.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl TryFrom<String> for Bandwidth {
    type Error = ShiftError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Bandwidth> for String {
    fn from(b: Bandwidth) -> Self {
        b.raw
    }
}

impl std::fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}
