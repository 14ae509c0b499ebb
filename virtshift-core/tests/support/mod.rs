//! Test support: an in-memory two-host cluster behind the transport seam.
//!
//! The mock interprets the command strings the engine generates (virsh,
//! stat, rsync, mv, rm) against per-host state, so the orchestrator can be
//! driven end to end without a hypervisor or network.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use virtshift_core::cancel::CancelToken;
use virtshift_core::error::{Result, ShiftError};
use virtshift_core::transport::{Connection, ExecOutput, Transport};

/// A file on a mock host.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub size: u64,
    /// Stands in for content; checksums derive from it
    pub content: String,
}

/// State of one mock host.
#[derive(Debug, Clone)]
pub struct HostState {
    pub vms: HashMap<String, String>,
    pub vm_states: HashMap<String, String>,
    pub files: HashMap<String, FileEntry>,
    pub dirs: HashSet<String>,
    pub snapshots: Vec<String>,
    pub pool_capacity: u64,
    pub pool_available: u64,
    pub memory_total_kib: u64,
    pub memory_free_kib: u64,
    pub cpus: u32,
    pub has_blocksync: bool,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            vms: HashMap::new(),
            vm_states: HashMap::new(),
            files: HashMap::new(),
            dirs: HashSet::new(),
            snapshots: Vec::new(),
            pool_capacity: 500 * GIB,
            pool_available: 400 * GIB,
            memory_total_kib: 32 * 1024 * 1024,
            memory_free_kib: 16 * 1024 * 1024,
            cpus: 8,
            has_blocksync: true,
        }
    }
}

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Shared state of the mock cluster.
pub struct Cluster {
    pub hosts: Mutex<HashMap<String, HostState>>,
    /// (host, command) log of everything executed
    pub executed: Mutex<Vec<(String, String)>>,
    /// Commands containing any of these substrings fail with exit 1
    pub fail_substrings: Mutex<Vec<String>>,
    /// Delay per streamed progress line, to give cancellation a window
    pub stream_delay: Mutex<Duration>,
}

impl Cluster {
    pub fn new(hosts: &[&str]) -> Arc<Self> {
        let map = hosts.iter().map(|h| (h.to_string(), HostState::default())).collect();
        Arc::new(Self {
            hosts: Mutex::new(map),
            executed: Mutex::new(Vec::new()),
            fail_substrings: Mutex::new(Vec::new()),
            stream_delay: Mutex::new(Duration::from_millis(1)),
        })
    }

    pub fn with_host<T>(&self, host: &str, f: impl FnOnce(&mut HostState) -> T) -> T {
        let mut hosts = self.hosts.lock().unwrap();
        f(hosts.get_mut(host).expect("unknown mock host"))
    }

    /// Install a VM with one or more disks on a host.
    pub fn add_vm(&self, host: &str, name: &str, disks: &[(&str, u64)]) {
        let disk_xml: String = disks
            .iter()
            .enumerate()
            .map(|(i, (path, _))| {
                format!(
                    "    <disk type='file' device='disk'>\n      <driver name='qemu' type='qcow2'/>\n      <source file='{}'/>\n      <target dev='vd{}' bus='virtio'/>\n    </disk>\n",
                    path,
                    (b'a' + i as u8) as char
                )
            })
            .collect();
        let xml = format!(
            "<domain type='kvm'>\n  <name>{name}</name>\n  <uuid>9e2b8c4a-0000-4000-8000-00000000{idx:04}</uuid>\n  <memory unit='KiB'>2097152</memory>\n  <vcpu placement='static'>2</vcpu>\n  <devices>\n{disk_xml}    <interface type='network'>\n      <mac address='52:54:00:11:22:33'/>\n      <source network='default'/>\n    </interface>\n  </devices>\n</domain>",
            name = name,
            idx = name.len(),
            disk_xml = disk_xml
        );
        self.with_host(host, |state| {
            for (path, size) in disks {
                state.files.insert(
                    path.to_string(),
                    FileEntry { size: *size, content: format!("{}@{}", path, size) },
                );
            }
            state.vms.insert(name.to_string(), xml.clone());
            state.vm_states.insert(name.to_string(), "shut off".to_string());
        });
    }

    pub fn fail_commands_containing(&self, needle: &str) {
        self.fail_substrings.lock().unwrap().push(needle.to_string());
    }

    pub fn clear_failures(&self) {
        self.fail_substrings.lock().unwrap().clear();
    }

    pub fn executed_commands(&self) -> Vec<(String, String)> {
        self.executed.lock().unwrap().clone()
    }

    /// Paths of files present on a host, sorted.
    pub fn files_on(&self, host: &str) -> Vec<String> {
        let hosts = self.hosts.lock().unwrap();
        let mut files: Vec<_> = hosts[host].files.keys().cloned().collect();
        files.sort();
        files
    }

    pub fn vm_names_on(&self, host: &str) -> Vec<String> {
        let hosts = self.hosts.lock().unwrap();
        let mut names: Vec<_> = hosts[host].vms.keys().cloned().collect();
        names.sort();
        names
    }

    fn should_fail(&self, cmd: &str) -> bool {
        self.fail_substrings.lock().unwrap().iter().any(|s| cmd.contains(s))
    }
}

/// Transport handing out connections into the mock cluster.
pub struct MockTransport {
    cluster: Arc<Cluster>,
}

impl MockTransport {
    pub fn new(cluster: Arc<Cluster>) -> Arc<Self> {
        Arc::new(Self { cluster })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, host: &str) -> Result<Arc<dyn Connection>> {
        if !self.cluster.hosts.lock().unwrap().contains_key(host) {
            return Err(ShiftError::Connection {
                host: host.to_string(),
                reason: "unknown host".to_string(),
            });
        }
        Ok(Arc::new(MockConnection { host: host.to_string(), cluster: self.cluster.clone() }))
    }

    async fn close_all(&self) {}
}

pub struct MockConnection {
    host: String,
    cluster: Arc<Cluster>,
}

impl MockConnection {
    fn ok(stdout: impl Into<String>) -> ExecOutput {
        ExecOutput { exit_code: 0, stdout: stdout.into(), stderr: String::new() }
    }

    fn fail(stderr: impl Into<String>) -> ExecOutput {
        ExecOutput { exit_code: 1, stdout: String::new(), stderr: stderr.into() }
    }

    fn interpret(&self, cmd: &str) -> ExecOutput {
        self.cluster.executed.lock().unwrap().push((self.host.clone(), cmd.to_string()));
        if self.cluster.should_fail(cmd) {
            return Self::fail("injected failure");
        }

        let args = shell_split(cmd);
        let first = args.first().map(String::as_str).unwrap_or("");

        match first {
            "true" => Self::ok(""),
            "mkdir" => {
                let path = args.last().unwrap().clone();
                self.cluster.with_host(&self.host, |s| {
                    s.dirs.insert(path);
                });
                Self::ok("")
            }
            "rm" if args.get(1).map(String::as_str) == Some("-rf") => {
                let path = args.last().unwrap().clone();
                self.cluster.with_host(&self.host, |s| {
                    s.dirs.remove(&path);
                    let prefix = format!("{}/", path);
                    s.files.retain(|p, _| !p.starts_with(&prefix) && p != &path);
                });
                Self::ok("")
            }
            "rm" => {
                let path = args.last().unwrap();
                self.cluster.with_host(&self.host, |s| {
                    s.files.remove(path);
                });
                Self::ok("")
            }
            "mv" => {
                let src = &args[1];
                let dst = &args[2];
                self.cluster.with_host(&self.host, |s| match s.files.remove(src) {
                    Some(entry) => {
                        s.files.insert(dst.clone(), entry);
                        Self::ok("")
                    }
                    None => Self::fail(format!("mv: cannot stat '{}': No such file", src)),
                })
            }
            "stat" => {
                let path = args.last().unwrap();
                self.cluster.with_host(&self.host, |s| match s.files.get(path) {
                    Some(entry) => {
                        if cmd.contains("%s %Y") {
                            Self::ok(format!("{} 1700000000", entry.size))
                        } else {
                            Self::ok(format!("{}", entry.size))
                        }
                    }
                    None => Self::fail(format!("stat: cannot statx '{}': No such file", path)),
                })
            }
            "du" => {
                let path = &args[2];
                self.cluster.with_host(&self.host, |s| match s.files.get(path) {
                    Some(entry) => Self::ok(format!("{}", entry.size)),
                    None => Self::fail("du: No such file"),
                })
            }
            "sha256sum" => {
                let path = &args[1];
                self.cluster.with_host(&self.host, |s| match s.files.get(path) {
                    Some(entry) => Self::ok(format!("digest-{:016x}", fnv(&entry.content))),
                    None => Self::fail("sha256sum: No such file"),
                })
            }
            "test" => {
                let path = args.last().unwrap();
                let exists =
                    self.cluster.with_host(&self.host, |s| s.files.contains_key(path));
                if exists {
                    Self::ok("")
                } else {
                    Self::fail("")
                }
            }
            "command" => {
                let tool = args.last().unwrap();
                let present = tool != "blocksync"
                    || self.cluster.with_host(&self.host, |s| s.has_blocksync);
                if present {
                    Self::ok(format!("/usr/bin/{}", tool))
                } else {
                    Self::fail("")
                }
            }
            "rsync" | "scp" | "blocksync" => self.do_transfer(first, &args),
            "virsh" => self.do_virsh(&args),
            _ => Self::fail(format!("mock: unknown command {}", first)),
        }
    }

    /// Copy a file from this host to `dest:path` named in the final arg.
    fn do_transfer(&self, tool: &str, args: &[String]) -> ExecOutput {
        let (src, dest_host, dest_path) = match tool {
            "blocksync" => {
                let n = args.len();
                (args[n - 3].clone(), args[n - 2].clone(), args[n - 1].clone())
            }
            _ => {
                let n = args.len();
                let src = args[n - 2].clone();
                let target = &args[n - 1];
                let Some((host, path)) = target.split_once(':') else {
                    return Self::fail("mock: transfer target missing host:");
                };
                (src, host.to_string(), path.to_string())
            }
        };

        let entry = self.cluster.with_host(&self.host, |s| s.files.get(&src).cloned());
        let Some(entry) = entry else {
            return Self::fail(format!("{}: {}: No such file", tool, src));
        };

        let mut hosts = self.cluster.hosts.lock().unwrap();
        let Some(dest) = hosts.get_mut(&dest_host) else {
            return Self::fail(format!("{}: unknown host {}", tool, dest_host));
        };
        dest.files.insert(dest_path, entry.clone());
        Self::ok(format!("\nsent {} bytes  received 35 bytes\n", entry.size))
    }

    fn do_virsh(&self, args: &[String]) -> ExecOutput {
        // virsh -c <uri> <subcommand> [args...]
        let sub = args.get(3).map(String::as_str).unwrap_or("");
        let rest: Vec<&String> = args[4.min(args.len())..].iter().collect();
        let positional: Vec<&String> =
            rest.iter().filter(|a| !a.starts_with("--")).copied().collect();

        self.cluster.with_host(&self.host, |s| match sub {
            "list" => {
                let all = rest.iter().any(|a| a.as_str() == "--all");
                let names: Vec<String> = s
                    .vms
                    .keys()
                    .filter(|n| {
                        all || s.vm_states.get(*n).map(String::as_str) == Some("running")
                    })
                    .cloned()
                    .collect();
                Self::ok(names.join("\n"))
            }
            "dumpxml" => match positional.first().and_then(|n| s.vms.get(*n)) {
                Some(xml) => Self::ok(xml.clone()),
                None => Self::fail(format!(
                    "error: failed to get domain '{}'",
                    positional.first().map(|s| s.as_str()).unwrap_or("?")
                )),
            },
            "domstate" => match positional.first().and_then(|n| s.vm_states.get(*n)) {
                Some(state) => Self::ok(state.clone()),
                None => Self::fail("error: failed to get domain"),
            },
            "dominfo" => match positional.first() {
                Some(name) if s.vms.contains_key(*name) => {
                    Self::ok(format!("Name:           {}\nCPU(s):         2\n", name))
                }
                _ => Self::fail("error: failed to get domain"),
            },
            "pool-list" => Self::ok("default\n"),
            "pool-refresh" => Self::ok("Pool default refreshed\n"),
            "pool-info" => Self::ok(format!(
                "Name:           default\nCapacity:       {}\nAllocation:     {}\nAvailable:      {}\n",
                s.pool_capacity,
                s.pool_capacity - s.pool_available,
                s.pool_available
            )),
            "nodeinfo" => Self::ok(format!(
                "CPU model:           x86_64\nCPU(s):              {}\nMemory size:         {} KiB\n",
                s.cpus, s.memory_total_kib
            )),
            "nodememstats" => Self::ok(format!(
                "total  :             {} KiB\nfree   :             {} KiB\n",
                s.memory_total_kib, s.memory_free_kib
            )),
            "define" => {
                let path = positional.first().expect("define needs a path");
                let content = s.files.get(*path).map(|e| e.content.clone());
                match content {
                    Some(xml) => match extract_name(&xml) {
                        Some(name) => {
                            s.vms.insert(name.clone(), xml);
                            s.vm_states.insert(name.clone(), "shut off".to_string());
                            Self::ok(format!("Domain '{}' defined\n", name))
                        }
                        None => Self::fail("error: missing name element"),
                    },
                    None => Self::fail(format!("error: failed to read {}", path)),
                }
            }
            "undefine" => match positional.first() {
                Some(name) if s.vms.remove(*name).is_some() => {
                    s.vm_states.remove(*name);
                    Self::ok("")
                }
                _ => Self::fail("error: failed to get domain"),
            },
            "destroy" => match positional.first() {
                Some(name) if s.vm_states.get(*name).map(String::as_str) == Some("running") => {
                    s.vm_states.insert((*name).clone(), "shut off".to_string());
                    Self::ok("")
                }
                _ => Self::fail("error: domain is not running"),
            },
            "snapshot-create-as" => {
                s.snapshots.push(positional.iter().map(|s| s.as_str()).collect::<Vec<_>>().join("/"));
                Self::ok("")
            }
            "snapshot-delete" => Self::ok(""),
            other => Self::fail(format!("mock: unknown virsh subcommand {}", other)),
        })
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn host(&self) -> &str {
        &self.host
    }

    async fn execute(&self, cmd: &str, _timeout: Option<Duration>) -> Result<ExecOutput> {
        Ok(self.interpret(cmd))
    }

    async fn execute_streamed(
        &self,
        cmd: &str,
        lines: mpsc::Sender<String>,
        cancel: CancelToken,
    ) -> Result<ExecOutput> {
        // Stream synthetic progress for transfers so cancellation has
        // boundaries to land on.
        if cmd.starts_with("rsync") || cmd.starts_with("blocksync") {
            let args = shell_split(cmd);
            let src = if cmd.starts_with("blocksync") {
                args[args.len() - 3].clone()
            } else {
                args[args.len() - 2].clone()
            };
            let size = self
                .cluster
                .with_host(&self.host, |s| s.files.get(&src).map(|e| e.size))
                .unwrap_or(0);
            let delay = *self.cluster.stream_delay.lock().unwrap();

            for step in 1..=10u64 {
                if cancel.is_cancelled() {
                    // Leave a partial file behind, like a killed rsync.
                    let partial = size * step / 10;
                    let args2 = args.clone();
                    let _ = self.partial_write(&args2, partial);
                    return Err(ShiftError::Cancelled { operation_id: String::new() });
                }
                let bytes = size * step / 10;
                let line = if cmd.starts_with("blocksync") {
                    format!("synced {} bytes of {}", bytes, size)
                } else {
                    format!("{} {}%  1.00MB/s", bytes, step * 10)
                };
                let _ = lines.send(line).await;
                tokio::time::sleep(delay).await;
            }
        }
        Ok(self.interpret(cmd))
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let content = std::fs::read_to_string(local)
            .map_err(|e| ShiftError::Io { path: local.to_path_buf(), source: e })?;
        self.cluster.with_host(&self.host, |s| {
            s.files.insert(
                remote.to_string(),
                FileEntry { size: content.len() as u64, content },
            );
        });
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        let content = self
            .cluster
            .with_host(&self.host, |s| s.files.get(remote).map(|e| e.content.clone()))
            .ok_or_else(|| ShiftError::General(format!("no such remote file {}", remote)))?;
        std::fs::write(local, content)
            .map_err(|e| ShiftError::Io { path: local.to_path_buf(), source: e })?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl MockConnection {
    /// Record a partial destination file for a cancelled transfer.
    fn partial_write(&self, args: &[String], partial: u64) -> Option<()> {
        let target = args.last()?;
        let (host, path) = target.split_once(':')?;
        let mut hosts = self.cluster.hosts.lock().unwrap();
        let dest = hosts.get_mut(host)?;
        dest.files.insert(
            path.to_string(),
            FileEntry { size: partial, content: format!("partial-{}", partial) },
        );
        Some(())
    }
}

/// Extract `<name>...</name>` from definition XML.
fn extract_name(xml: &str) -> Option<String> {
    let start = xml.find("<name>")? + "<name>".len();
    let end = xml[start..].find("</name>")?;
    Some(xml[start..start + end].to_string())
}

/// Tiny FNV-1a for deterministic mock digests.
fn fnv(data: &str) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for byte in data.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Minimal POSIX-style splitter matching the builder's quoting.
pub fn shell_split(cmd: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut pending = false;
    let mut chars = cmd.chars();

    while let Some(c) = chars.next() {
        if in_single {
            if c == '\'' {
                in_single = false;
            } else {
                current.push(c);
            }
            continue;
        }
        match c {
            '\'' => {
                in_single = true;
                pending = true;
            }
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    pending = true;
                }
            }
            c if c.is_whitespace() => {
                if pending || !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            other => {
                current.push(other);
                pending = true;
            }
        }
    }
    if pending || !current.is_empty() {
        args.push(current);
    }
    args
}

/// Point the state dir at a shared per-process temp location once.
pub fn init_state_dir() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let dir = std::env::temp_dir().join(format!("virtshift-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("create test state dir");
        std::env::set_var("VIRTSHIFT_STATE_DIR", &dir);
    });
}
