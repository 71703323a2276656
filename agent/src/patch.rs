//! Textual line-level patches.
//!
//! A [`Patch`] is an ordered list of [`Hunk`]s. Each hunk starts with a header
//! naming the line ranges it covers in the old and new text, followed by lines
//! tagged `' '` (context), `'-'` (deletion) or `'+'` (insertion):
//!
//! ```text
//! @@ -1,3 +1,3 @@
//!  first line
//! -Hello World
//! +Hello Go
//!  last line
//! ```
//!
//! Line numbers are 1-based. When a range is empty its start names the line
//! *before* the range (0 at the top of the file). A line without a trailing
//! newline in the source text is followed by [`NO_NEWLINE_MARKER`]. Hunk text
//! is stored literally, never escaped.
//!
//! Patches are only meaningful against the exact text they were computed
//! from: [`Patch::apply_to`] checks every context and deletion line and fails
//! with a [`PatchApplyError`] naming the hunk when the base text differs.
//!
//! # Example
//!
//! ```
//! use tracewrite_agent::diff::diff;
//! use tracewrite_agent::patch::apply;
//!
//! let patch = diff("Hello World\n", "Hello Go\n");
//! assert_eq!(patch.to_string(), "@@ -1,1 +1,1 @@\n-Hello World\n+Hello Go\n");
//!
//! let rebuilt = apply(&patch.to_string(), "Hello World\n").unwrap();
//! assert_eq!(rebuilt, "Hello Go\n");
//! ```

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Marker line following a hunk line that has no trailing newline.
pub const NO_NEWLINE_MARKER: &str = "\\ No newline at end of file";

/// Prefix of every hunk header line.
const HUNK_HEADER_PREFIX: &str = "@@";

/// Errors that can occur when parsing or applying a patch.
///
/// Hunk indices are 0-based positions within the patch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchApplyError {
    /// Non-empty text appeared before the first hunk header.
    #[error("unexpected text before first hunk header: {0:?}")]
    UnexpectedPreamble(String),

    /// The hunk header could not be parsed.
    #[error("hunk {hunk}: malformed header {header:?}")]
    MalformedHeader { hunk: usize, header: String },

    /// A hunk body line has an unknown tag.
    #[error("hunk {hunk}: malformed line {line}: {reason}")]
    MalformedLine {
        hunk: usize,
        line: usize,
        reason: String,
    },

    /// The header line counts disagree with the hunk body.
    #[error("hunk {hunk}: header declares -{old_len} +{new_len} lines but body has -{old_actual} +{new_actual}")]
    LengthMismatch {
        hunk: usize,
        old_len: usize,
        new_len: usize,
        old_actual: usize,
        new_actual: usize,
    },

    /// The base text does not contain what the hunk expects at its position.
    #[error("hunk {hunk}: base text does not match at line {line}")]
    Mismatch { hunk: usize, line: usize },
}

impl PatchApplyError {
    /// Returns the index of the hunk that failed, if the error is tied to one.
    #[must_use]
    pub fn hunk(&self) -> Option<usize> {
        match self {
            Self::UnexpectedPreamble(_) => None,
            Self::MalformedHeader { hunk, .. }
            | Self::MalformedLine { hunk, .. }
            | Self::LengthMismatch { hunk, .. }
            | Self::Mismatch { hunk, .. } => Some(*hunk),
        }
    }
}

/// Result type for patch operations.
pub type Result<T> = std::result::Result<T, PatchApplyError>;

/// Tag of a single hunk line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineTag {
    Context,
    Delete,
    Insert,
}

impl LineTag {
    fn as_char(self) -> char {
        match self {
            Self::Context => ' ',
            Self::Delete => '-',
            Self::Insert => '+',
        }
    }

    fn from_char(c: char) -> Option<Self> {
        match c {
            ' ' => Some(Self::Context),
            '-' => Some(Self::Delete),
            '+' => Some(Self::Insert),
            _ => None,
        }
    }
}

/// One tagged line inside a hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HunkLine {
    pub tag: LineTag,
    /// Line content without its `\n` terminator.
    pub text: String,
    /// Whether the source line ended with `\n`.
    pub newline: bool,
}

impl HunkLine {
    /// Builds a hunk line from a line token that may end with `\n`.
    pub(crate) fn from_token(tag: LineTag, token: &str) -> Self {
        match token.strip_suffix('\n') {
            Some(text) => Self {
                tag,
                text: text.to_string(),
                newline: true,
            },
            None => Self {
                tag,
                text: token.to_string(),
                newline: false,
            },
        }
    }

    /// Returns the line as it appears in the text, terminator included.
    fn token(&self) -> String {
        if self.newline {
            format!("{}\n", self.text)
        } else {
            self.text.clone()
        }
    }
}

/// A contiguous block of a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    /// Builds a hunk whose first line sits at the given 0-based positions.
    ///
    /// The header counts are derived from the lines.
    pub(crate) fn from_lines(old_index: usize, new_index: usize, lines: Vec<HunkLine>) -> Self {
        let old_len = lines.iter().filter(|l| l.tag != LineTag::Insert).count();
        let new_len = lines.iter().filter(|l| l.tag != LineTag::Delete).count();

        Self {
            old_start: header_start(old_index, old_len),
            old_len,
            new_start: header_start(new_index, new_len),
            new_len,
            lines,
        }
    }

    /// Formats the `@@ -a,b +c,d @@` header line.
    #[must_use]
    pub fn header(&self) -> String {
        format!(
            "@@ -{},{} +{},{} @@",
            self.old_start, self.old_len, self.new_start, self.new_len
        )
    }

    /// Applies this hunk to `lines` in place.
    ///
    /// `lines` holds the text produced by every earlier hunk of the same
    /// patch, so the hunk is located by its new-text position.
    fn apply(&self, index: usize, lines: &mut Vec<String>) -> Result<()> {
        let out_of_range = PatchApplyError::Mismatch {
            hunk: index,
            line: lines.len() + 1,
        };

        // A non-empty range starting at line 0 is malformed.
        let position = if self.new_len == 0 {
            Some(self.new_start)
        } else {
            self.new_start.checked_sub(1)
        };
        let Some(position) = position.filter(|&p| p <= lines.len()) else {
            return Err(out_of_range);
        };

        let expected: Vec<String> = self
            .lines
            .iter()
            .filter(|l| l.tag != LineTag::Insert)
            .map(HunkLine::token)
            .collect();

        let end = match position.checked_add(expected.len()) {
            Some(end) if end <= lines.len() => end,
            _ => {
                return Err(PatchApplyError::Mismatch {
                    hunk: index,
                    line: position + 1,
                })
            }
        };

        if let Some(offset) = lines[position..end]
            .iter()
            .zip(&expected)
            .position(|(actual, wanted)| actual != wanted)
        {
            return Err(PatchApplyError::Mismatch {
                hunk: index,
                line: position + offset + 1,
            });
        }

        let replacement: Vec<String> = self
            .lines
            .iter()
            .filter(|l| l.tag != LineTag::Delete)
            .map(HunkLine::token)
            .collect();

        lines.splice(position..end, replacement);
        Ok(())
    }
}

impl fmt::Display for Hunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.header())?;
        for line in &self.lines {
            writeln!(f, "{}{}", line.tag.as_char(), line.text)?;
            if !line.newline {
                writeln!(f, "{NO_NEWLINE_MARKER}")?;
            }
        }
        Ok(())
    }
}

/// Summary of what a patch changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PatchStats {
    /// Number of inserted lines.
    pub lines_added: u32,

    /// Number of deleted lines.
    pub lines_removed: u32,

    /// Characters on inserted lines, terminators excluded.
    pub chars_added: u64,
}

impl PatchStats {
    /// Returns the total number of changed lines (added + removed).
    #[must_use]
    pub fn total_changes(&self) -> u32 {
        self.lines_added + self.lines_removed
    }

    /// Returns true if there are no changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines_added == 0 && self.lines_removed == 0
    }
}

/// A full line-level patch: zero or more hunks.
///
/// The text form is produced by [`Display`](fmt::Display) and read back by
/// [`Patch::parse`]. An empty patch has no hunks and renders as `""`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Patch {
    pub hunks: Vec<Hunk>,
}

impl Patch {
    /// Parses patch text into hunks.
    ///
    /// The text is split at `@@` header boundaries first; each hunk is then
    /// parsed on its own, so errors carry the hunk index.
    ///
    /// # Errors
    ///
    /// Returns a [`PatchApplyError`] if a header or line is malformed or a
    /// hunk body disagrees with its header.
    pub fn parse(text: &str) -> Result<Self> {
        let (preamble, chunks) = split_hunks(text);
        if !preamble.trim().is_empty() {
            return Err(PatchApplyError::UnexpectedPreamble(preamble.to_string()));
        }

        let hunks = chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| parse_hunk(index, chunk))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { hunks })
    }

    /// Returns true if the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    /// Applies every hunk in order to `base`.
    ///
    /// # Errors
    ///
    /// Returns [`PatchApplyError::Mismatch`] naming the first hunk whose
    /// context or deleted lines are not found at the expected position.
    pub fn apply_to(&self, base: &str) -> Result<String> {
        let mut lines: Vec<String> = split_lines(base).into_iter().map(String::from).collect();

        for (index, hunk) in self.hunks.iter().enumerate() {
            hunk.apply(index, &mut lines)?;
        }

        Ok(lines.concat())
    }

    /// Counts inserted and deleted lines.
    #[must_use]
    pub fn stats(&self) -> PatchStats {
        let mut stats = PatchStats::default();
        for line in self.hunks.iter().flat_map(|h| &h.lines) {
            match line.tag {
                LineTag::Insert => {
                    stats.lines_added += 1;
                    stats.chars_added += line.text.chars().count() as u64;
                }
                LineTag::Delete => stats.lines_removed += 1,
                LineTag::Context => {}
            }
        }
        stats
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for hunk in &self.hunks {
            write!(f, "{hunk}")?;
        }
        Ok(())
    }
}

impl FromStr for Patch {
    type Err = PatchApplyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Parses `patch` and applies it to `base`.
///
/// # Errors
///
/// See [`Patch::parse`] and [`Patch::apply_to`].
pub fn apply(patch: &str, base: &str) -> Result<String> {
    Patch::parse(patch)?.apply_to(base)
}

/// Splits text into lines, each keeping its `\n` terminator.
///
/// The last line has no terminator when the text does not end with `\n`.
/// Empty text has no lines.
pub(crate) fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

/// Converts a 0-based line index into a header start for a range of `len`.
fn header_start(index: usize, len: usize) -> usize {
    if len == 0 {
        index
    } else {
        index + 1
    }
}

/// Splits patch text at hunk header lines.
///
/// Returns any text before the first header plus one slice per hunk, each
/// beginning with its `@@` line.
fn split_hunks(text: &str) -> (&str, Vec<&str>) {
    let mut starts = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.starts_with(HUNK_HEADER_PREFIX) {
            starts.push(offset);
        }
        offset += line.len();
    }

    let Some(&first) = starts.first() else {
        return (text, Vec::new());
    };

    let mut hunks = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(text.len());
        hunks.push(&text[start..end]);
    }

    (&text[..first], hunks)
}

fn parse_hunk(index: usize, text: &str) -> Result<Hunk> {
    let mut raw_lines = text
        .split_inclusive('\n')
        .map(|l| l.strip_suffix('\n').unwrap_or(l));

    let header = raw_lines.next().unwrap_or_default();
    let (old_start, old_len, new_start, new_len) =
        parse_header(header).ok_or_else(|| PatchApplyError::MalformedHeader {
            hunk: index,
            header: header.to_string(),
        })?;

    if new_len > 0 && new_start == 0 {
        return Err(PatchApplyError::MalformedHeader {
            hunk: index,
            header: header.to_string(),
        });
    }

    let mut lines: Vec<HunkLine> = Vec::new();
    for (line_no, raw) in raw_lines.enumerate() {
        if raw == NO_NEWLINE_MARKER {
            let Some(previous) = lines.last_mut() else {
                return Err(PatchApplyError::MalformedLine {
                    hunk: index,
                    line: line_no + 1,
                    reason: "no-newline marker without a preceding line".to_string(),
                });
            };
            previous.newline = false;
            continue;
        }

        let mut chars = raw.chars();
        let tag = match chars.next() {
            // Blank context lines lose their leading space in some editors.
            None => LineTag::Context,
            Some(c) => LineTag::from_char(c).ok_or_else(|| PatchApplyError::MalformedLine {
                hunk: index,
                line: line_no + 1,
                reason: format!("unknown line tag {c:?}"),
            })?,
        };

        lines.push(HunkLine {
            tag,
            text: chars.as_str().to_string(),
            newline: true,
        });
    }

    let old_actual = lines.iter().filter(|l| l.tag != LineTag::Insert).count();
    let new_actual = lines.iter().filter(|l| l.tag != LineTag::Delete).count();
    if old_actual != old_len || new_actual != new_len {
        return Err(PatchApplyError::LengthMismatch {
            hunk: index,
            old_len,
            new_len,
            old_actual,
            new_actual,
        });
    }

    Ok(Hunk {
        old_start,
        old_len,
        new_start,
        new_len,
        lines,
    })
}

/// Parses `@@ -a,b +c,d @@`. A missing length means 1.
fn parse_header(header: &str) -> Option<(usize, usize, usize, usize)> {
    let inner = header
        .strip_prefix(HUNK_HEADER_PREFIX)?
        .trim_start()
        .split(HUNK_HEADER_PREFIX)
        .next()?
        .trim();

    let mut parts = inner.split_whitespace();
    let old = parts.next()?.strip_prefix('-')?;
    let new = parts.next()?.strip_prefix('+')?;
    if parts.next().is_some() {
        return None;
    }

    let (old_start, old_len) = parse_range(old)?;
    let (new_start, new_len) = parse_range(new)?;
    Some((old_start, old_len, new_start, new_len))
}

fn parse_range(range: &str) -> Option<(usize, usize)> {
    match range.split_once(',') {
        Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}
