use std::{
    collections::HashSet,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use crate::error::{Result, SelectionError};

/// One line of the selection trace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceLine {
    /// One-based round index.
    pub round: usize,
    /// Winning score as persisted (three decimals).
    pub score: f64,
}

/// Persisted selection state after loading (and repairing) the artifacts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredSelection {
    /// Committed descriptors in commit order.
    pub features: Vec<String>,
    /// Trace lines, one per committed descriptor.
    pub trace: Vec<TraceLine>,
    /// True when a dangling trace line (an unfinished commit) was dropped.
    pub repaired: bool,
}

/// Trace file plus feature-subset file of one selection run.
///
/// A commit appends the trace line first and then replaces the subset file
/// via a synced sibling temporary and a rename, so an interrupted commit
/// leaves at most one dangling trace line behind.
#[derive(Debug, Clone)]
pub struct SelectionStore {
    trace_path: PathBuf,
    features_path: PathBuf,
}

impl SelectionStore {
    /// Store over the given artifact paths.
    #[must_use]
    pub fn new(trace_path: impl Into<PathBuf>, features_path: impl Into<PathBuf>) -> Self {
        Self {
            trace_path: trace_path.into(),
            features_path: features_path.into(),
        }
    }

    /// Trace file path.
    #[must_use]
    pub fn trace_path(&self) -> &Path {
        &self.trace_path
    }

    /// Feature-subset file path.
    #[must_use]
    pub fn features_path(&self) -> &Path {
        &self.features_path
    }

    /// Persists one committed round.
    pub fn commit(&self, round: usize, score: f64, committed: &[String]) -> Result<()> {
        ensure_parent(&self.trace_path)?;
        ensure_parent(&self.features_path)?;

        let mut trace = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.trace_path)?;
        trace.write_all(format_trace_line(round, score).as_bytes())?;
        trace.sync_all()?;

        let tmp = self.features_path.with_extension("json.tmp");
        let mut file = File::create(&tmp)?;
        serde_json::to_writer(&mut file, committed)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.features_path)?;
        Ok(())
    }

    /// Loads both artifacts without touching them on disk.
    ///
    /// Missing files read as an empty run. A trailing trace line from a
    /// commit still in flight (or interrupted) is dropped from the result and
    /// reported through `repaired`, but left in the file.
    pub fn load(&self) -> Result<StoredSelection> {
        self.read().map(|(stored, _)| stored)
    }

    /// Loads both artifacts and truncates a dangling trace line in place.
    ///
    /// Only the process that owns the run may call this, before resuming:
    /// a concurrent commit would otherwise lose its trace line.
    pub fn repair(&self) -> Result<StoredSelection> {
        let (stored, cut) = self.read()?;
        if let Some(cut) = cut {
            let file = OpenOptions::new().write(true).open(&self.trace_path)?;
            file.set_len(cut as u64)?;
            file.sync_all()?;
        }
        Ok(stored)
    }

    /// Parses both artifacts; the second value is the byte offset the trace
    /// must be cut at to drop a dangling line.
    fn read(&self) -> Result<(StoredSelection, Option<usize>)> {
        let features = if self.features_path.exists() {
            read_features(&self.features_path)?
        } else {
            Vec::new()
        };
        let raw = match fs::read_to_string(&self.trace_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };

        let mut lines: Vec<(usize, TraceLine)> = Vec::new();
        let mut cut = None;
        let mut offset = 0;
        let segments: Vec<&str> = raw.split_inclusive('\n').collect();
        for (idx, segment) in segments.iter().enumerate() {
            let start = offset;
            offset += segment.len();
            if segment.trim().is_empty() {
                continue;
            }
            match self.parse_trace_line(idx, segment.trim_end()) {
                Ok(line) => lines.push((start, line)),
                // Torn final append: no newline was written.
                Err(_) if idx + 1 == segments.len() && !segment.ends_with('\n') => cut = Some(start),
                Err(err) => return Err(err),
            }
        }
        if cut.is_none() && lines.len() == features.len() + 1 {
            cut = lines.pop().map(|(start, _)| start);
        }
        if lines.len() != features.len() {
            return Err(corrupt(
                &self.trace_path,
                format!(
                    "{} trace lines for {} committed features",
                    lines.len(),
                    features.len()
                ),
            ));
        }
        let trace: Vec<TraceLine> = lines.into_iter().map(|(_, line)| line).collect();
        for (idx, line) in trace.iter().enumerate() {
            if line.round != idx + 1 {
                return Err(corrupt(
                    &self.trace_path,
                    format!("line {} records round {}", idx + 1, line.round),
                ));
            }
        }
        Ok((
            StoredSelection {
                features,
                trace,
                repaired: cut.is_some(),
            },
            cut,
        ))
    }

    /// Deletes both artifacts so a run starts from scratch.
    pub fn clear(&self) -> Result<()> {
        for path in [&self.trace_path, &self.features_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn parse_trace_line(&self, idx: usize, line: &str) -> Result<TraceLine> {
        let parsed = line.split_once('\t').and_then(|(round, score)| {
            Some(TraceLine {
                round: round.trim().parse().ok()?,
                score: score.trim().parse().ok()?,
            })
        });
        parsed.ok_or_else(|| {
            corrupt(
                &self.trace_path,
                format!("line {} is not `<round>\\t<score>`: `{line}`", idx + 1),
            )
        })
    }
}

/// Reads a feature-subset file: a JSON array of descriptor names.
pub fn read_features(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let features: Vec<String> =
        serde_json::from_slice(&fs::read(path)?).map_err(|err| corrupt(path, err.to_string()))?;
    let mut seen = HashSet::new();
    if let Some(dup) = features.iter().find(|name| !seen.insert(name.as_str())) {
        return Err(corrupt(path, format!("descriptor `{dup}` listed twice")));
    }
    Ok(features)
}

fn corrupt(path: &Path, reason: String) -> SelectionError {
    SelectionError::CorruptStore {
        path: path.to_path_buf(),
        reason,
    }
}

fn format_trace_line(round: usize, score: f64) -> String {
    format!("{round}\t{score:.3}\n")
}

/// `score` as it reads back from the trace file.
#[must_use]
pub fn persisted_score(score: f64) -> f64 {
    format!("{score:.3}").parse().unwrap_or(score)
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}
