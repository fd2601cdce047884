//! Resource accounting of selected Linux processes.
//!
//! A watch is configured with a string of the form `command,name,argmatch`: a process is watched
//! when its command (the first element of its command line) contains `command` and its arguments,
//! concatenated without separators, match the regular expression `argmatch`. Its measurements are
//! reported under the tag `name=<name>`.
//!
//! Several processes can match the same watch. They are told apart by the `id` tag, a small
//! number that stays stable for as long as the process lives and is handed out again once it
//! exits, which keeps the number of distinct series bounded no matter how often the processes are
//! restarted.
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use regex::Regex;
use tracing::debug;
use tsrelay::{DataPoint, TagSet};

use crate::{add, Collector, CollectorError, CollectorFuture};

const PROC_ROOT: &str = "/proc";

/// A set of processes to watch.
#[derive(Clone, Debug)]
pub struct ProcessWatch {
    command: String,
    name: String,
    arg_match: Regex,
}

impl ProcessWatch {
    /// Substring the command of a watched process must contain.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Value of the `name` tag of the measurements.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, process: &Process) -> bool {
        process.command.contains(&self.command) && self.arg_match.is_match(&process.arguments)
    }
}

impl FromStr for ProcessWatch {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid =
            |reason: String| CollectorError::InvalidConfig { config: s.to_string(), reason };

        let fields: Vec<&str> = s.split(',').collect();
        let [command, name, arg_match] = fields.as_slice() else {
            return Err(invalid(format!(
                "expected 3 fields (command,name,argmatch), found {}",
                fields.len()
            )));
        };
        if name.is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        let arg_match =
            Regex::new(arg_match).map_err(|e| invalid(format!("invalid argmatch: {e}")))?;

        Ok(ProcessWatch { command: (*command).to_string(), name: (*name).to_string(), arg_match })
    }
}

/// Hands out small positive ids, reusing released ones.
///
/// [`IdPool::get`] always returns the smallest released id, or a new id one larger than any handed
/// out so far when none has been released.
#[derive(Debug, Default)]
pub struct IdPool {
    next: u32,
    free: BTreeSet<u32>,
}

impl IdPool {
    /// Creates an empty `IdPool`. The first id handed out is `1`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes an id from the pool.
    pub fn get(&mut self) -> u32 {
        if let Some(id) = self.free.pop_first() {
            return id;
        }
        self.next += 1;
        self.next
    }

    /// Returns an id to the pool.
    pub fn put(&mut self, id: u32) {
        if id > 0 && id <= self.next {
            self.free.insert(id);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Process {
    pid: u32,
    command: String,
    arguments: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ProcessStat {
    utime: u64,
    stime: u64,
    minflt: u64,
    majflt: u64,
    vsize: u64,
    rss: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct ProcessIo {
    rchar: u64,
    wchar: u64,
    syscr: u64,
    syscw: u64,
    read_bytes: u64,
    write_bytes: u64,
}

struct Watched {
    watch: ProcessWatch,
    // pid -> id
    tracked: BTreeMap<u32, u32>,
    ids: IdPool,
}

impl Watched {
    fn check(&mut self, process: &Process) {
        if !self.tracked.contains_key(&process.pid) && self.watch.matches(process) {
            let id = self.ids.get();
            debug!(name = %self.watch.name, pid = process.pid, id, "Tracking process.");
            self.tracked.insert(process.pid, id);
        }
    }

    fn untrack(&mut self, pid: u32) {
        if let Some(id) = self.tracked.remove(&pid) {
            self.ids.put(id);
        }
    }

    fn monitor(&mut self, root: &Path, points: &mut Vec<DataPoint>) {
        let mut gone = Vec::new();
        for (&pid, &id) in &self.tracked {
            match read_process(root, pid) {
                Ok((stat, io)) => {
                    let tags =
                        TagSet::new().with("name", self.watch.name.as_str()).with("id", id.to_string());
                    report(points, &tags, &stat, &io);
                }
                Err(e) => {
                    debug!(name = %self.watch.name, pid, id, error = %e, "Process is gone. Untracking.");
                    gone.push(pid);
                }
            }
        }

        for pid in gone {
            self.untrack(pid);
        }
    }
}

/// Reports CPU, memory and I/O accounting of watched processes.
///
/// Every round emits, per watched process, tagged with `name` and `id`:
///
/// - `linux.proc.cpu` (`type=user|system`): scheduled time, in clock ticks
/// - `linux.proc.mem.fault` (`type=minflt|majflt`): page faults
/// - `linux.proc.mem.virtual`: virtual memory size, in bytes
/// - `linux.proc.mem.rss`: resident set size, in pages
/// - `linux.proc.char_io` (`type=read|write`): bytes passed to read and write system calls
/// - `linux.proc.syscall` (`type=read|write`): read and write system calls
/// - `linux.proc.io_bytes` (`type=read|write`): bytes fetched from or sent to the storage layer
pub struct LinuxProcesses {
    root: PathBuf,
    watched: Vec<Watched>,
}

impl LinuxProcesses {
    /// Creates a new `LinuxProcesses` collector for the given watches.
    pub fn new<I>(watches: I) -> Self
    where
        I: IntoIterator<Item = ProcessWatch>,
    {
        let watched = watches
            .into_iter()
            .map(|watch| Watched { watch, tracked: BTreeMap::new(), ids: IdPool::new() })
            .collect();
        LinuxProcesses { root: PathBuf::from(PROC_ROOT), watched }
    }

    /// Sets the directory the process file system is mounted at.
    ///
    /// Defaults to `/proc`.
    #[must_use]
    pub fn with_proc_root<P>(mut self, root: P) -> Self
    where
        P: Into<PathBuf>,
    {
        self.root = root.into();
        self
    }

    fn collect_now(&mut self) -> Result<Vec<DataPoint>, CollectorError> {
        let processes = list_processes(&self.root)?;
        for watched in &mut self.watched {
            for process in &processes {
                watched.check(process);
            }
        }

        let mut points = Vec::new();
        for watched in &mut self.watched {
            watched.monitor(&self.root, &mut points);
        }
        Ok(points)
    }
}

impl Collector for LinuxProcesses {
    fn name(&self) -> &str {
        "linux_processes"
    }

    fn collect(&mut self) -> CollectorFuture<'_> {
        Box::pin(async move { self.collect_now() })
    }
}

fn report(points: &mut Vec<DataPoint>, tags: &TagSet, stat: &ProcessStat, io: &ProcessIo) {
    let typed = |kind: &str| tags.clone().with("type", kind);

    add(points, "linux.proc.cpu", stat.utime, &typed("user"));
    add(points, "linux.proc.cpu", stat.stime, &typed("system"));
    add(points, "linux.proc.mem.fault", stat.minflt, &typed("minflt"));
    add(points, "linux.proc.mem.fault", stat.majflt, &typed("majflt"));
    add(points, "linux.proc.mem.virtual", stat.vsize, tags);
    add(points, "linux.proc.mem.rss", stat.rss, tags);
    add(points, "linux.proc.char_io", io.rchar, &typed("read"));
    add(points, "linux.proc.char_io", io.wchar, &typed("write"));
    add(points, "linux.proc.syscall", io.syscr, &typed("read"));
    add(points, "linux.proc.syscall", io.syscw, &typed("write"));
    add(points, "linux.proc.io_bytes", io.read_bytes, &typed("read"));
    add(points, "linux.proc.io_bytes", io.write_bytes, &typed("write"));
}

/// Lists every process with a non-empty command line, ordered by pid.
fn list_processes(root: &Path) -> Result<Vec<Process>, CollectorError> {
    let mut processes = Vec::new();
    for entry in fs::read_dir(root)? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse::<u32>().ok()) else {
            continue;
        };
        if !entry.file_type().is_ok_and(|t| t.is_dir()) {
            continue;
        }
        // The process may have exited since the directory was listed.
        let Ok(cmdline) = fs::read(entry.path().join("cmdline")) else { continue };
        if let Some((command, arguments)) = parse_cmdline(&cmdline) {
            processes.push(Process { pid, command, arguments });
        }
    }

    processes.sort_by_key(|p| p.pid);
    Ok(processes)
}

fn read_process(root: &Path, pid: u32) -> Result<(ProcessStat, ProcessIo), CollectorError> {
    let dir = root.join(pid.to_string());
    let stat = parse_stat(&fs::read_to_string(dir.join("stat"))?)?;
    let io = parse_io(&fs::read_to_string(dir.join("io"))?)?;
    Ok((stat, io))
}

/// Splits a NUL-separated command line into the command and its concatenated arguments.
fn parse_cmdline(raw: &[u8]) -> Option<(String, String)> {
    let cmdline = String::from_utf8_lossy(raw);
    let mut parts = cmdline.split('\0');
    let command = parts.next().filter(|c| !c.is_empty())?;
    Some((command.to_string(), parts.collect()))
}

fn parse_stat(content: &str) -> Result<ProcessStat, CollectorError> {
    // The command name is wrapped in parentheses and may itself contain spaces or parentheses,
    // so fields are counted from the last closing one. `rest[0]` is the process state.
    let (_, rest) = content.rsplit_once(')').ok_or_else(|| CollectorError::Parse {
        what: "process stat",
        reason: "missing command name".to_string(),
    })?;
    let rest: Vec<&str> = rest.split_whitespace().collect();

    Ok(ProcessStat {
        minflt: stat_field(&rest, 9, "minflt")?,
        majflt: stat_field(&rest, 11, "majflt")?,
        utime: stat_field(&rest, 13, "utime")?,
        stime: stat_field(&rest, 14, "stime")?,
        vsize: stat_field(&rest, 22, "vsize")?,
        rss: stat_field(&rest, 23, "rss")?,
    })
}

/// Parses field `index` of a stat line, numbered as in proc(5) from zero.
fn stat_field<T: FromStr>(rest: &[&str], index: usize, name: &str) -> Result<T, CollectorError> {
    let invalid = |reason: String| CollectorError::Parse { what: "process stat", reason };
    let value = rest.get(index - 2).ok_or_else(|| invalid(format!("missing field {name}")))?;
    value.parse().map_err(|_| invalid(format!("invalid {name} '{value}'")))
}

fn parse_io(content: &str) -> Result<ProcessIo, CollectorError> {
    let mut io = ProcessIo::default();
    let mut seen = 0;
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else { continue };
        let slot = match key.trim() {
            "rchar" => &mut io.rchar,
            "wchar" => &mut io.wchar,
            "syscr" => &mut io.syscr,
            "syscw" => &mut io.syscw,
            "read_bytes" => &mut io.read_bytes,
            "write_bytes" => &mut io.write_bytes,
            _ => continue,
        };
        *slot = value.trim().parse().map_err(|_| CollectorError::Parse {
            what: "process io",
            reason: format!("invalid value in '{line}'"),
        })?;
        seen += 1;
    }

    if seen < 6 {
        return Err(CollectorError::Parse {
            what: "process io",
            reason: format!("expected 6 counters, found {seen}"),
        });
    }
    Ok(io)
}
