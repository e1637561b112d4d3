use log::warn;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("Failed to read {path:?}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Offset {offset} is outside the {what} ({len} bytes)")]
    OffsetOutOfRange {
        offset: usize,
        what: &'static str,
        len: usize,
    },
}

fn read_file(path: &Path) -> Result<Vec<u8>, InputError> {
    std::fs::read(path).map_err(|e| InputError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Parses a diff listing: one decimal byte offset per line.
///
/// Lines starting with `#` and lines that are not plain numbers are skipped.
/// Repeated offsets keep their first position.
pub fn parse_diff(text: &str) -> Vec<usize> {
    let mut seen = HashSet::new();
    let mut offsets = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.starts_with('#') || line.is_empty() || !line.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let Ok(offset) = line.parse::<usize>() else {
            continue;
        };
        if seen.insert(offset) {
            offsets.push(offset);
        } else {
            warn!("Ignoring duplicated offset {offset} in diff");
        }
    }
    offsets
}

/// The byte-diff minimizer's working state: the evolving template, the
/// offsets still under consideration and the crashing byte at each of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteChangeSet {
    template: Vec<u8>,
    diff: Vec<usize>,
    crash_bytes: HashMap<usize, u8>,
}

impl ByteChangeSet {
    /// Builds the set from a template, the ordered offsets and the crashing file.
    pub fn new(template: Vec<u8>, diff: Vec<usize>, crash: &[u8]) -> Result<Self, InputError> {
        let mut crash_bytes = HashMap::with_capacity(diff.len());
        let mut unique = Vec::with_capacity(diff.len());
        for offset in diff {
            if crash_bytes.contains_key(&offset) {
                continue;
            }
            if offset >= template.len() {
                return Err(InputError::OffsetOutOfRange {
                    offset,
                    what: "template",
                    len: template.len(),
                });
            }
            let byte = *crash.get(offset).ok_or(InputError::OffsetOutOfRange {
                offset,
                what: "crashing file",
                len: crash.len(),
            })?;
            crash_bytes.insert(offset, byte);
            unique.push(offset);
        }
        Ok(Self {
            template,
            diff: unique,
            crash_bytes,
        })
    }

    pub fn load(template: &Path, crash: &Path, diff: &Path) -> Result<Self, InputError> {
        let diff_bytes = read_file(diff)?;
        let offsets = parse_diff(&String::from_utf8_lossy(&diff_bytes));
        Self::new(read_file(template)?, offsets, &read_file(crash)?)
    }

    pub fn template(&self) -> &[u8] {
        &self.template
    }

    pub fn offsets(&self) -> &[usize] {
        &self.diff
    }

    pub fn len(&self) -> usize {
        self.diff.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diff.is_empty()
    }

    pub fn crash_byte(&self, offset: usize) -> Option<u8> {
        self.crash_bytes.get(&offset).copied()
    }

    /// The current template with exactly one more crashing byte applied.
    pub fn candidate_with(&self, offset: usize) -> Option<Vec<u8>> {
        let byte = self.crash_byte(offset)?;
        let mut buf = self.template.clone();
        buf[offset] = byte;
        Some(buf)
    }

    /// Permanently applies the last remaining change to the template and
    /// drops it from the set. Returns the baked offset.
    pub fn bake_last(&mut self) -> Option<usize> {
        let offset = self.diff.pop()?;
        if let Some(byte) = self.crash_bytes.remove(&offset) {
            self.template[offset] = byte;
        }
        Some(offset)
    }
}

/// A file viewed as raw lines, each keeping its own terminator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LineBuffer {
    lines: Vec<Vec<u8>>,
}

fn is_blank(line: &[u8]) -> bool {
    line == b"\n" || line == b"\r\n"
}

impl LineBuffer {
    /// Splits after every `\n`; a trailing unterminated line is kept as is.
    pub fn from_bytes(data: &[u8], strip_empty_lines: bool) -> Self {
        let lines = data
            .split_inclusive(|&b| b == b'\n')
            .filter(|line| !(strip_empty_lines && is_blank(line)))
            .map(<[u8]>::to_vec)
            .collect();
        Self { lines }
    }

    pub fn load(path: &Path, strip_empty_lines: bool) -> Result<Self, InputError> {
        Ok(Self::from_bytes(&read_file(path)?, strip_empty_lines))
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> &[Vec<u8>] {
        &self.lines
    }

    /// A copy without lines `[start, start + count)`, clamped to the buffer.
    pub fn without(&self, start: usize, count: usize) -> LineBuffer {
        let start = start.min(self.lines.len());
        let end = start.saturating_add(count).min(self.lines.len());
        let mut lines = Vec::with_capacity(self.lines.len() - (end - start));
        lines.extend_from_slice(&self.lines[..start]);
        lines.extend_from_slice(&self.lines[end..]);
        LineBuffer { lines }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.lines.concat()
    }
}
