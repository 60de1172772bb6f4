//! Thread classification.
//!
//! The engine only follows threads it has been told about. Discovery happens
//! outside (by scraping the process list on the device); the result is handed
//! in through a [`PidClassifier`]. [`PidTable`] is the file-backed
//! implementation used by the CLI:
//!
//! ```text
//! {
//!   "app":    [{"pid": 100, "process": "com.example", "thread": "main"}],
//!   "system": [{"pid": 300, "process": "system_server", "thread": "ActivityManager"}],
//!   "binder": [{"pid": 201, "parent": 200, "process": "surfaceflinger", "thread": "binder:200_1"}],
//!   "other":  [{"pid": 400, "process": "audioserver", "thread": "audioserver"}]
//! }
//! ```
//!
//! `other` threads are not followed from the start, but can be identified
//! when a binder transaction wakes them.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// The set a followed thread belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadClass {
    App,
    System,
    Binder,
    /// Not followed from the start; discovered through a binder transaction.
    Discovered,
}

impl ThreadClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::App => "app",
            Self::System => "system",
            Self::Binder => "binder",
            Self::Discovered => "discovered",
        }
    }
}

impl fmt::Display for ThreadClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ThreadIdentity {
    pub pid: u32,
    pub process: String,
    pub thread: String,
}

impl ThreadIdentity {
    pub fn new(pid: u32, process: impl Into<String>, thread: impl Into<String>) -> Self {
        Self {
            pid,
            process: process.into(),
            thread: thread.into(),
        }
    }

    /// Identity used when nothing but the pid is known.
    pub fn unnamed(pid: u32) -> Self {
        Self::new(pid, "<unknown>", "<unknown>")
    }
}

/// Source of truth for which threads are followed and how they relate.
pub trait PidClassifier {
    /// Class of a followed thread, `None` for threads that are not of interest.
    fn classify(&self, pid: u32) -> Option<ThreadClass>;

    /// Binder pool threads belonging to process `parent`. `None` when the
    /// process is unknown.
    fn binder_children(&self, parent: u32) -> Option<Vec<u32>>;

    /// Full identity for a pid, including threads discovered mid-trace.
    fn identify(&self, pid: u32) -> Option<ThreadIdentity>;

    fn is_of_interest(&self, pid: u32) -> bool {
        self.classify(pid).is_some()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PidEntry {
    pid: u32,
    #[serde(default)]
    parent: Option<u32>,
    #[serde(default)]
    process: String,
    #[serde(default)]
    thread: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PidTableJson {
    #[serde(default)]
    app: Vec<PidEntry>,
    #[serde(default)]
    system: Vec<PidEntry>,
    #[serde(default)]
    binder: Vec<PidEntry>,
    #[serde(default)]
    other: Vec<PidEntry>,
}

#[derive(Debug, Clone)]
struct PidInfo {
    identity: ThreadIdentity,
    class: Option<ThreadClass>,
}

/// Static classification loaded from a JSON document.
#[derive(Debug, Default, Clone)]
pub struct PidTable {
    pids: HashMap<u32, PidInfo>,
    // parent process pid -> binder pool threads, in file order
    binder_children: HashMap<u32, Vec<u32>>,
}

impl PidTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let parsed: PidTableJson =
            serde_json::from_str(json).context("Failed to parse pid table")?;
        let mut table = PidTable::new();

        for entry in parsed.app {
            table.insert_entry(entry, Some(ThreadClass::App))?;
        }
        for entry in parsed.system {
            table.insert_entry(entry, Some(ThreadClass::System))?;
        }
        for entry in parsed.binder {
            table.insert_entry(entry, Some(ThreadClass::Binder))?;
        }
        for entry in parsed.other {
            table.insert_entry(entry, None)?;
        }
        Ok(table)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read pid table {}", path.display()))?;
        Self::from_json(&json)
    }

    fn insert_entry(&mut self, entry: PidEntry, class: Option<ThreadClass>) -> Result<()> {
        if class == Some(ThreadClass::Binder) && entry.parent.is_none() {
            bail!("Binder thread {} is missing its parent pid", entry.pid);
        }
        let identity = ThreadIdentity::new(entry.pid, entry.process, entry.thread);
        match class {
            Some(ThreadClass::Binder) => {
                if let Some(parent) = entry.parent {
                    self.add_binder(parent, identity)?;
                }
            }
            Some(class) => self.add(class, identity)?,
            None => self.add_known(identity)?,
        }
        Ok(())
    }

    fn check_unique(&self, pid: u32) -> Result<()> {
        if self.pids.contains_key(&pid) {
            bail!("pid {pid} is listed more than once");
        }
        Ok(())
    }

    /// Follow an app or system thread.
    pub fn add(&mut self, class: ThreadClass, identity: ThreadIdentity) -> Result<()> {
        self.check_unique(identity.pid)?;
        self.pids.insert(
            identity.pid,
            PidInfo {
                identity,
                class: Some(class),
            },
        );
        Ok(())
    }

    /// Follow a binder pool thread of process `parent`.
    pub fn add_binder(&mut self, parent: u32, identity: ThreadIdentity) -> Result<()> {
        self.check_unique(identity.pid)?;
        self.binder_children
            .entry(parent)
            .or_default()
            .push(identity.pid);
        self.pids.insert(
            identity.pid,
            PidInfo {
                identity,
                class: Some(ThreadClass::Binder),
            },
        );
        Ok(())
    }

    /// Record the identity of a thread that is not followed.
    pub fn add_known(&mut self, identity: ThreadIdentity) -> Result<()> {
        self.check_unique(identity.pid)?;
        self.pids.insert(
            identity.pid,
            PidInfo {
                identity,
                class: None,
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

impl PidClassifier for PidTable {
    fn classify(&self, pid: u32) -> Option<ThreadClass> {
        self.pids.get(&pid).and_then(|info| info.class)
    }

    fn binder_children(&self, parent: u32) -> Option<Vec<u32>> {
        self.binder_children.get(&parent).cloned()
    }

    fn identify(&self, pid: u32) -> Option<ThreadIdentity> {
        self.pids.get(&pid).map(|info| info.identity.clone())
    }
}
