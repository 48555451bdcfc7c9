//! Read-only host context for command generation prompts.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sysinfo::{Disks, System};
use tracing::{debug, instrument};

use crate::io::config::Platform;

/// Environment variables safe to show the model.
const SAFE_ENV_VARS: &[&str] = &[
    "PATH", "HOME", "USER", "SHELL", "LANG", "LC_ALL", "TMPDIR", "TEMP", "TMP", "PWD", "OLDPWD",
];

const MAX_PROCESSES: usize = 50;
const SUMMARY_APPLICATIONS: usize = 60;
const SUMMARY_VALUE_CHARS: usize = 160;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub name: String,
    pub pid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskInfo {
    pub mount_point: PathBuf,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// Snapshot of the host taken once per engine run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SystemInfo {
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub home_dir: Option<PathBuf>,
    /// Standard user directories keyed by short name (`documents`, `downloads`, ...).
    pub directories: BTreeMap<String, PathBuf>,
    pub applications: Vec<String>,
    pub processes: Vec<ProcessInfo>,
    pub environment: BTreeMap<String, String>,
    pub disks: Vec<DiskInfo>,
}

impl SystemInfo {
    /// Plain-text summary embedded in the command generation prompt.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        if let Some(host) = &self.hostname {
            lines.push(format!("Host: {host}"));
        }
        if let Some(os) = &self.os {
            lines.push(format!("OS: {os}"));
        }
        if let Some(home) = &self.home_dir {
            lines.push(format!("Home directory: {}", home.display()));
        }
        if !self.directories.is_empty() {
            lines.push("Directories:".to_string());
            for (name, path) in &self.directories {
                lines.push(format!("- {name}: {}", path.display()));
            }
        }
        if !self.applications.is_empty() {
            let shown: Vec<&str> = self
                .applications
                .iter()
                .take(SUMMARY_APPLICATIONS)
                .map(String::as_str)
                .collect();
            let more = self.applications.len().saturating_sub(shown.len());
            let suffix = if more > 0 {
                format!(" (+{more} more)")
            } else {
                String::new()
            };
            lines.push(format!("Installed applications: {}{suffix}", shown.join(", ")));
        }
        if !self.processes.is_empty() {
            let names: BTreeSet<&str> = self.processes.iter().map(|p| p.name.as_str()).collect();
            lines.push(format!(
                "Running processes: {}",
                names.into_iter().collect::<Vec<_>>().join(", ")
            ));
        }
        if !self.environment.is_empty() {
            lines.push("Environment:".to_string());
            for (key, value) in &self.environment {
                lines.push(format!("- {key}={}", clip(value, SUMMARY_VALUE_CHARS)));
            }
        }
        for disk in &self.disks {
            lines.push(format!(
                "Disk {}: {} GB free of {} GB",
                disk.mount_point.display(),
                disk.available_bytes / 1_000_000_000,
                disk.total_bytes / 1_000_000_000
            ));
        }
        lines.join("\n")
    }
}

fn clip(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut clipped: String = value.chars().take(max_chars).collect();
    clipped.push_str("...");
    clipped
}

/// Source of host context. `None` means no context is available.
pub trait SystemInfoProvider {
    fn snapshot(&self) -> Option<SystemInfo>;
}

/// Reads the current machine via `dirs` and `sysinfo`.
#[derive(Debug, Clone, Copy)]
pub struct HostSystemInfo {
    platform: Platform,
}

impl HostSystemInfo {
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }
}

impl SystemInfoProvider for HostSystemInfo {
    #[instrument(skip_all, fields(platform = %self.platform))]
    fn snapshot(&self) -> Option<SystemInfo> {
        let mut sys = System::new_all();
        sys.refresh_all();

        let mut processes: Vec<ProcessInfo> = sys
            .processes()
            .iter()
            .map(|(pid, process)| ProcessInfo {
                name: process.name().to_string(),
                pid: pid.as_u32(),
            })
            .collect();
        processes.sort_by_key(|process| process.pid);
        processes.truncate(MAX_PROCESSES);

        let disks = Disks::new_with_refreshed_list()
            .iter()
            .map(|disk| DiskInfo {
                mount_point: disk.mount_point().to_path_buf(),
                total_bytes: disk.total_space(),
                available_bytes: disk.available_space(),
            })
            .collect();

        let info = SystemInfo {
            hostname: System::host_name(),
            os: System::long_os_version(),
            home_dir: dirs::home_dir(),
            directories: standard_directories(),
            applications: installed_applications(self.platform),
            processes,
            environment: filtered_environment(),
            disks,
        };
        debug!(
            applications = info.applications.len(),
            processes = info.processes.len(),
            "captured system info"
        );
        Some(info)
    }
}

fn standard_directories() -> BTreeMap<String, PathBuf> {
    [
        ("home", dirs::home_dir()),
        ("documents", dirs::document_dir()),
        ("downloads", dirs::download_dir()),
        ("desktop", dirs::desktop_dir()),
        ("pictures", dirs::picture_dir()),
        ("music", dirs::audio_dir()),
        ("videos", dirs::video_dir()),
    ]
    .into_iter()
    .filter_map(|(name, path)| path.map(|path| (name.to_string(), path)))
    .collect()
}

fn filtered_environment() -> BTreeMap<String, String> {
    SAFE_ENV_VARS
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)))
        .collect()
}

fn installed_applications(platform: Platform) -> Vec<String> {
    let home = dirs::home_dir();
    let mut apps = BTreeSet::new();
    match platform {
        Platform::Macos => {
            let mut roots = vec![PathBuf::from("/Applications")];
            roots.extend(home.map(|home| home.join("Applications")));
            for root in roots {
                apps.extend(entries_with_suffix(&root, ".app", true));
            }
        }
        Platform::Windows => {
            for root in ["C:\\Program Files", "C:\\Program Files (x86)"] {
                apps.extend(entries_with_suffix(Path::new(root), "", true));
            }
        }
        Platform::Linux => {
            let mut roots = vec![PathBuf::from("/usr/share/applications")];
            roots.extend(home.map(|home| home.join(".local/share/applications")));
            for root in roots {
                apps.extend(entries_with_suffix(&root, ".desktop", false));
            }
        }
    }
    apps.into_iter().collect()
}

/// Names of directory entries ending in `suffix`, with the suffix removed.
/// Unreadable directories yield nothing.
fn entries_with_suffix(dir: &Path, suffix: &str, want_dirs: bool) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir() == want_dirs))
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            name.strip_suffix(suffix)
                .filter(|stem| !stem.is_empty())
                .map(str::to_string)
        })
        .collect()
}
