//! Run numbering ledger, one file per scan identifier.
//!
//! Each line holds a run number, followed by `SUCCESS` or `ABORTED` once the
//! run has been finalized:
//!
//! ```text
//! 0 SUCCESS
//! 1 ABORTED
//! 2
//! ```
//!
//! Every read-modify-write holds an in-process mutex and an exclusive `flock`
//! on a sibling `.lock` file, so controllers in other threads or processes
//! that share the data path are serialized. The ledger itself is replaced by
//! rename, never edited in place, and lines other than the one being changed
//! are written back as they were read.

use crate::{Result, ScanError};
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Success,
    Aborted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Pending => f.write_str("PENDING"),
            RunStatus::Success => f.write_str("SUCCESS"),
            RunStatus::Aborted => f.write_str("ABORTED"),
        }
    }
}

pub type Ledger = BTreeMap<u64, RunStatus>;

#[derive(Debug)]
pub struct ScanRecordStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl ScanRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ledger_path(&self, identifier: &str) -> PathBuf {
        self.dir.join(format!("{identifier}.cfg"))
    }

    /// Assigns one past the highest run number on record (0 for a new
    /// ledger) and records it as pending.
    pub fn next_run_number(&self, identifier: &str) -> Result<u64> {
        self.update(identifier, |ledger| {
            let run_number = match ledger.last_run() {
                None => 0,
                Some(n) => n.checked_add(1).ok_or_else(|| ScanError::RunNumbersExhausted {
                    identifier: identifier.to_owned(),
                })?,
            };
            ledger.append(run_number);
            Ok(run_number)
        })
    }

    /// Marks `run_number` as finished. The run must have been assigned by
    /// [`next_run_number`](Self::next_run_number). Every other line is kept
    /// byte for byte.
    pub fn finalize(&self, identifier: &str, run_number: u64, completed: bool) -> Result<()> {
        let status = if completed {
            RunStatus::Success
        } else {
            RunStatus::Aborted
        };
        self.update(identifier, |ledger| {
            if ledger.set_status(run_number, status) {
                Ok(())
            } else {
                Err(ScanError::UnknownRun {
                    identifier: identifier.to_owned(),
                    run_number,
                })
            }
        })
    }

    /// Current ledger contents; empty when no run was ever recorded.
    pub fn runs(&self, identifier: &str) -> Result<Ledger> {
        let _guard = self.lock.lock();
        fs::create_dir_all(&self.dir)?;
        let _file_lock = FileLock::acquire(&self.lock_path(identifier))?;
        Ok(self.read(identifier)?.runs())
    }

    fn update<T>(
        &self,
        identifier: &str,
        f: impl FnOnce(&mut LedgerFile) -> Result<T>,
    ) -> Result<T> {
        let _guard = self.lock.lock();
        fs::create_dir_all(&self.dir)?;
        let _file_lock = FileLock::acquire(&self.lock_path(identifier))?;

        let mut ledger = self.read(identifier)?;
        let out = f(&mut ledger)?;
        self.write(identifier, &ledger)?;
        Ok(out)
    }

    fn lock_path(&self, identifier: &str) -> PathBuf {
        self.dir.join(format!("{identifier}.cfg.lock"))
    }

    fn read(&self, identifier: &str) -> Result<LedgerFile> {
        let path = self.ledger_path(identifier);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LedgerFile::default()),
            Err(e) => return Err(e.into()),
        };
        LedgerFile::parse(&path, &text)
    }

    fn write(&self, identifier: &str, ledger: &LedgerFile) -> Result<()> {
        let path = self.ledger_path(identifier);
        let tmp = self.dir.join(format!("{identifier}.cfg.tmp"));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(ledger.render().as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        debug!("Wrote {} line(s) to {}", ledger.lines.len(), path.display());
        Ok(())
    }
}

/// One line of the ledger file, terminator included.
#[derive(Debug)]
enum Line {
    Blank(String),
    Run {
        run_number: u64,
        status: RunStatus,
        text: String,
    },
}

/// The ledger as stored. Lines are only re-rendered when their status
/// changes.
#[derive(Debug, Default)]
struct LedgerFile {
    lines: Vec<Line>,
}

impl LedgerFile {
    fn parse(path: &Path, text: &str) -> Result<Self> {
        let mut lines = Vec::new();
        let mut seen = BTreeSet::new();
        for (idx, raw) in text.split_inclusive('\n').enumerate() {
            let content = raw.trim_end_matches(['\r', '\n']);
            if content.trim().is_empty() {
                lines.push(Line::Blank(raw.to_owned()));
                continue;
            }
            let corrupt = || ScanError::LedgerCorruption {
                path: path.to_owned(),
                line: idx + 1,
                content: content.to_owned(),
            };
            let mut fields = content.split_whitespace();
            let run_number = fields
                .next()
                .and_then(|f| f.parse::<u64>().ok())
                .ok_or_else(corrupt)?;
            let status = match fields.next() {
                None => RunStatus::Pending,
                Some("SUCCESS") => RunStatus::Success,
                Some("ABORTED") => RunStatus::Aborted,
                Some(_) => return Err(corrupt()),
            };
            if fields.next().is_some() || !seen.insert(run_number) {
                return Err(corrupt());
            }
            lines.push(Line::Run {
                run_number,
                status,
                text: raw.to_owned(),
            });
        }
        Ok(Self { lines })
    }

    fn runs(&self) -> Ledger {
        self.lines
            .iter()
            .filter_map(|line| match line {
                Line::Run {
                    run_number, status, ..
                } => Some((*run_number, *status)),
                Line::Blank(_) => None,
            })
            .collect()
    }

    fn last_run(&self) -> Option<u64> {
        self.runs().keys().next_back().copied()
    }

    fn append(&mut self, run_number: u64) {
        if let Some(Line::Blank(text) | Line::Run { text, .. }) = self.lines.last_mut() {
            if !text.ends_with('\n') {
                text.push('\n');
            }
        }
        self.lines.push(Line::Run {
            run_number,
            status: RunStatus::Pending,
            text: render_line(run_number, RunStatus::Pending, "\n"),
        });
    }

    /// Rewrites the line of `run_number`, keeping its line ending. Returns
    /// `false` if the run is not on record.
    fn set_status(&mut self, run_number: u64, new_status: RunStatus) -> bool {
        for line in &mut self.lines {
            if let Line::Run {
                run_number: n,
                status,
                text,
            } = line
            {
                if *n == run_number {
                    let ending = if text.ends_with("\r\n") { "\r\n" } else { "\n" };
                    *status = new_status;
                    *text = render_line(run_number, new_status, ending);
                    return true;
                }
            }
        }
        false
    }

    fn render(&self) -> String {
        self.lines
            .iter()
            .map(|line| match line {
                Line::Blank(text) | Line::Run { text, .. } => text.as_str(),
            })
            .collect()
    }
}

fn render_line(run_number: u64, status: RunStatus, ending: &str) -> String {
    match status {
        RunStatus::Pending => format!("{run_number}{ending}"),
        done => format!("{run_number} {done}{ending}"),
    }
}

/// Exclusive advisory lock, released when dropped (the descriptor closes).
struct FileLock {
    _file: File,
}

impl FileLock {
    fn acquire(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        lock_exclusive(&file)?;
        Ok(Self { _file: file })
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    loop {
        // SAFETY: the descriptor is owned by `file` and open for the call.
        let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if res == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> io::Result<()> {
    Ok(())
}
