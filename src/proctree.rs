/// Process-tree discovery over the proc filesystem.
///
/// A snapshot is a best-effort listing taken once per termination decision;
/// processes may come and go while it is being read.
use std::collections::{HashMap, HashSet};
use std::path::Path;

pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// One process as seen in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: i32,
    pub parent_pid: i32,
    /// Diagnostic only. Empty when the cmdline could not be read.
    pub command_line: String,
}

/// All processes visible at one instant.
#[derive(Debug, Clone, Default)]
pub struct ProcessSnapshot {
    processes: Vec<ProcessInfo>,
}

impl ProcessSnapshot {
    /// Build a snapshot, dropping self-parented and parentless entries.
    pub fn new(processes: Vec<ProcessInfo>) -> Self {
        let processes = processes
            .into_iter()
            .filter(|p| p.parent_pid != 0 && p.pid != p.parent_pid)
            .collect();
        Self { processes }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn get(&self, pid: i32) -> Option<&ProcessInfo> {
        self.processes.iter().find(|p| p.pid == pid)
    }

    /// Everything to signal for `root`: its descendants depth-first, then
    /// `root` itself.
    ///
    /// Each process comes after all of its own descendants, so leaves are
    /// signaled before their parents. A root missing from the snapshot still
    /// yields whatever descendants were found.
    pub fn kill_order(&self, root: i32) -> Vec<ProcessInfo> {
        let mut children: HashMap<i32, Vec<usize>> = HashMap::new();
        for (idx, process) in self.processes.iter().enumerate() {
            children.entry(process.parent_pid).or_default().push(idx);
        }

        let mut order = Vec::new();
        let mut visited = HashSet::from([root]);
        // (index, children already pushed)
        let mut stack: Vec<(usize, bool)> = Vec::new();
        if let Some(kids) = children.get(&root) {
            stack.extend(kids.iter().rev().map(|&idx| (idx, false)));
        }

        while let Some((idx, expanded)) = stack.pop() {
            let process = &self.processes[idx];
            if expanded {
                order.push(process.clone());
                continue;
            }
            if !visited.insert(process.pid) {
                continue;
            }
            stack.push((idx, true));
            if let Some(kids) = children.get(&process.pid) {
                stack.extend(kids.iter().rev().map(|&idx| (idx, false)));
            }
        }

        if let Some(process) = self.get(root) {
            order.push(process.clone());
        }
        order
    }
}

/// Snapshot every process under the given proc root.
///
/// An unreadable root yields an empty snapshot and a warning; callers fall
/// back to killing only the process they already know about.
pub fn scan_proc_root(root: &Path) -> ProcessSnapshot {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %root.display(),
                "cannot read process table, descendants will not be found"
            );
            return ProcessSnapshot::empty();
        }
    };

    let mut processes = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };
        if pid <= 0 {
            continue;
        }
        if let Some(process) = read_process(&entry.path(), pid) {
            processes.push(process);
        }
    }

    tracing::debug!(count = processes.len(), "scanned process table");
    ProcessSnapshot::new(processes)
}

fn read_process(dir: &Path, pid: i32) -> Option<ProcessInfo> {
    let stat = match std::fs::read_to_string(dir.join("stat")) {
        Ok(stat) => stat,
        Err(e) => {
            // Usually the process exited between listing and reading.
            tracing::debug!(pid, error = %e, "cannot read stat");
            return None;
        }
    };
    let parent_pid = parse_parent_pid(&stat)?;

    let command_line = match std::fs::read(dir.join("cmdline")) {
        Ok(raw) => parse_command_line(&raw),
        Err(e) => {
            tracing::debug!(pid, error = %e, "cannot read cmdline");
            String::new()
        }
    };

    Some(ProcessInfo {
        pid,
        parent_pid,
        command_line,
    })
}

/// Parent pid from a `stat` line: `pid (comm) state ppid ...`.
///
/// The comm field may itself contain spaces and parentheses, so parsing
/// starts after the last `)`.
fn parse_parent_pid(stat: &str) -> Option<i32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

/// NUL-separated argv rendered as one space-separated line.
fn parse_command_line(raw: &[u8]) -> String {
    raw.split(|&b| b == 0)
        .filter(|arg| !arg.is_empty())
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}
