//! Line-level diff computation.
//!
//! [`Differ::diff`] turns two text states into a [`Patch`] in four steps:
//!
//! 1. Both texts are split into lines. Each line keeps its `\n`, so CRLF
//!    endings and a missing final newline survive a round trip.
//! 2. A minimal edit script is computed with the linear-space variant of
//!    Myers' O(ND) algorithm. Each split searches at most
//!    [`MAX_EDIT_STEPS`] rounds; a range whose halves do not meet by then
//!    is recorded as one change, so rewriting a large file stays cheap.
//! 3. Two cleanup passes make the script easier to read:
//!    - *semantic*: an equal run that is no longer than the changes on both
//!      sides of it is folded into those changes, and pure insertions or
//!      deletions are slid to end on a blank line when the text allows it;
//!    - *efficiency*: changes separated by a short equal run are merged when
//!      keeping them apart costs more than the run itself
//!      ([`DiffOptions::edit_cost`]).
//! 4. The script is encoded as hunks with [`DiffOptions::context_lines`]
//!    lines of context.
//!
//! The result always satisfies `apply(diff(a, b), a) == b`.
//!
//! # Example
//!
//! ```
//! use tracewrite_agent::diff::Differ;
//!
//! let differ = Differ::default();
//! let patch = differ.diff("one\ntwo\nthree\n", "one\n2\nthree\n");
//! assert_eq!(patch.stats().lines_added, 1);
//! assert_eq!(patch.apply_to("one\ntwo\nthree\n").unwrap(), "one\n2\nthree\n");
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::patch::{split_lines, Hunk, HunkLine, LineTag, Patch};

/// Default number of context lines around each change.
pub const DEFAULT_CONTEXT_LINES: usize = 3;

/// Default cost, in lines, of starting a separate change block.
pub const DEFAULT_EDIT_COST: usize = 4;

/// Search rounds allowed per split before a range is replaced wholesale.
pub const MAX_EDIT_STEPS: usize = 1024;

/// Errors that can occur while diffing.
///
/// The event handler never propagates these: a failed diff is recorded as an
/// event with an empty patch.
#[derive(Error, Debug)]
pub enum DiffError {
    /// One of the inputs could not be read from disk.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The input is not valid UTF-8.
    #[error("input is not UTF-8 text (invalid byte at offset {offset})")]
    InvalidUtf8 { offset: usize },

    /// The input contains NUL bytes and is treated as binary.
    #[error("input looks binary (NUL byte at offset {offset})")]
    Binary { offset: usize },
}

impl DiffError {
    /// Returns true if the error came from reading the input rather than
    /// from its content.
    #[must_use]
    pub fn is_read_error(&self) -> bool {
        matches!(self, Self::Read { .. })
    }
}

/// Result type for diff operations.
pub type Result<T> = std::result::Result<T, DiffError>;

/// Tuning knobs for patch generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffOptions {
    /// Unchanged lines kept around each change.
    pub context_lines: usize,

    /// Equal runs shorter than this between two changes are merged into them
    /// by the efficiency pass.
    pub edit_cost: usize,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            context_lines: DEFAULT_CONTEXT_LINES,
            edit_cost: DEFAULT_EDIT_COST,
        }
    }
}

/// A run of the edit script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Chunk<'a> {
    /// Lines present in both texts.
    Equal(Vec<&'a str>),
    /// Lines removed from the old text and lines inserted in their place.
    Change {
        deleted: Vec<&'a str>,
        inserted: Vec<&'a str>,
    },
}

impl Chunk<'_> {
    fn is_empty(&self) -> bool {
        match self {
            Chunk::Equal(lines) => lines.is_empty(),
            Chunk::Change { deleted, inserted } => deleted.is_empty() && inserted.is_empty(),
        }
    }
}

/// Computes line-level patches.
#[derive(Debug, Clone, Default)]
pub struct Differ {
    options: DiffOptions,
}

impl Differ {
    /// Creates a differ with the given options.
    #[must_use]
    pub fn new(options: DiffOptions) -> Self {
        Self { options }
    }

    /// Computes the patch that turns `old` into `new`.
    ///
    /// Identical texts give an empty patch.
    #[must_use]
    pub fn diff(&self, old: &str, new: &str) -> Patch {
        if old == new {
            return Patch::default();
        }

        let old_lines = split_lines(old);
        let new_lines = split_lines(new);

        let mut chunks = line_diff(&old_lines, &new_lines);
        cleanup_semantic(&mut chunks);
        cleanup_efficiency(&mut chunks, self.options.edit_cost);

        encode(&chunks, self.options.context_lines)
    }

    /// Decodes both inputs as text and diffs them.
    ///
    /// # Errors
    ///
    /// Returns [`DiffError::InvalidUtf8`] or [`DiffError::Binary`] if either
    /// input is not text.
    pub fn diff_bytes(&self, old: &[u8], new: &[u8]) -> Result<Patch> {
        let old = decode_text(old)?;
        let new = decode_text(new)?;
        Ok(self.diff(old, new))
    }

    /// Reads `path` and diffs `old` against its current content.
    ///
    /// Returns the patch together with the new content.
    ///
    /// # Errors
    ///
    /// Returns [`DiffError::Read`] if the file cannot be read, or a content
    /// error if it is not text.
    pub fn diff_file(&self, old: &str, path: &Path) -> Result<(Patch, String)> {
        let new = read_text(path)?;
        let patch = self.diff(old, &new);
        Ok((patch, new))
    }
}

/// Diffs two texts with default options.
#[must_use]
pub fn diff(old: &str, new: &str) -> Patch {
    Differ::default().diff(old, new)
}

/// Validates that `bytes` is text: UTF-8 with no NUL bytes.
///
/// # Errors
///
/// Returns [`DiffError::Binary`] or [`DiffError::InvalidUtf8`].
pub fn decode_text(bytes: &[u8]) -> Result<&str> {
    if let Some(offset) = bytes.iter().position(|&b| b == 0) {
        return Err(DiffError::Binary { offset });
    }
    std::str::from_utf8(bytes).map_err(|e| DiffError::InvalidUtf8 {
        offset: e.valid_up_to(),
    })
}

/// Reads a file and validates it as text.
///
/// # Errors
///
/// Returns [`DiffError::Read`] on I/O failure, or a content error.
pub fn read_text(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|source| DiffError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    decode_text(&bytes)?;
    // Validated above.
    String::from_utf8(bytes).map_err(|e| DiffError::InvalidUtf8 {
        offset: e.utf8_error().valid_up_to(),
    })
}

// =============================================================================
// Myers line diff
// =============================================================================

/// Computes a minimal edit script between two line sequences.
///
/// The returned chunks alternate between [`Chunk::Equal`] and
/// [`Chunk::Change`], and every change lists deletions before insertions.
pub(crate) fn line_diff<'a>(old: &[&'a str], new: &[&'a str]) -> Vec<Chunk<'a>> {
    let mut script = Script::default();
    diff_range(old, new, &mut script);
    normalize(script.chunks)
}

#[derive(Default)]
struct Script<'a> {
    chunks: Vec<Chunk<'a>>,
}

impl<'a> Script<'a> {
    fn equal(&mut self, lines: &[&'a str]) {
        if lines.is_empty() {
            return;
        }
        match self.chunks.last_mut() {
            Some(Chunk::Equal(existing)) => existing.extend_from_slice(lines),
            _ => self.chunks.push(Chunk::Equal(lines.to_vec())),
        }
    }

    fn change(&mut self, deleted: &[&'a str], inserted: &[&'a str]) {
        if deleted.is_empty() && inserted.is_empty() {
            return;
        }
        match self.chunks.last_mut() {
            Some(Chunk::Change {
                deleted: d,
                inserted: i,
            }) => {
                d.extend_from_slice(deleted);
                i.extend_from_slice(inserted);
            }
            _ => self.chunks.push(Chunk::Change {
                deleted: deleted.to_vec(),
                inserted: inserted.to_vec(),
            }),
        }
    }
}

fn diff_range<'a>(old: &[&'a str], new: &[&'a str], script: &mut Script<'a>) {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let (old_rest, new_rest) = (&old[prefix..], &new[prefix..]);
    let suffix = old_rest
        .iter()
        .rev()
        .zip(new_rest.iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let old_mid = &old_rest[..old_rest.len() - suffix];
    let new_mid = &new_rest[..new_rest.len() - suffix];

    script.equal(&old[..prefix]);

    if old_mid.is_empty() || new_mid.is_empty() {
        script.change(old_mid, new_mid);
    } else if let Some((x, y)) = bisect(old_mid, new_mid) {
        diff_range(&old_mid[..x], &new_mid[..y], script);
        diff_range(&old_mid[x..], &new_mid[y..], script);
    } else {
        script.change(old_mid, new_mid);
    }

    script.equal(&old_rest[old_rest.len() - suffix..]);
}

/// Finds a point on a shortest edit path where the forward and backward
/// searches meet.
///
/// Both inputs are non-empty and share no common prefix or suffix. Returns
/// `None` when the texts have nothing in common or the searches have not met
/// within [`MAX_EDIT_STEPS`] rounds.
fn bisect(a: &[&str], b: &[&str]) -> Option<(usize, usize)> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max_d = ((n + m + 1) / 2).min(MAX_EDIT_STEPS as isize);
    let offset = max_d;
    let len = 2 * max_d + 2;

    let mut forward = vec![-1isize; len as usize];
    let mut backward = vec![-1isize; len as usize];
    forward[(offset + 1) as usize] = 0;
    backward[(offset + 1) as usize] = 0;

    let delta = n - m;
    // With an odd delta the paths can only meet during a forward step.
    let front = delta % 2 != 0;

    // Diagonals that ran off the grid are skipped in later rounds.
    let (mut f_start, mut f_end, mut b_start, mut b_end) = (0, 0, 0, 0);

    for d in 0..max_d {
        let mut k = -d + f_start;
        while k <= d - f_end {
            let at = offset + k;
            let mut x = if k == -d
                || (k != d && forward[(at - 1) as usize] < forward[(at + 1) as usize])
            {
                forward[(at + 1) as usize]
            } else {
                forward[(at - 1) as usize] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            forward[at as usize] = x;

            if x > n {
                f_end += 2;
            } else if y > m {
                f_start += 2;
            } else if front {
                let other = offset + delta - k;
                if other >= 0 && other < len && backward[other as usize] != -1 {
                    let reached = n - backward[other as usize];
                    if x >= reached {
                        return Some((x as usize, y as usize));
                    }
                }
            }
            k += 2;
        }

        let mut k = -d + b_start;
        while k <= d - b_end {
            let at = offset + k;
            let mut x = if k == -d
                || (k != d && backward[(at - 1) as usize] < backward[(at + 1) as usize])
            {
                backward[(at + 1) as usize]
            } else {
                backward[(at - 1) as usize] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[(n - x - 1) as usize] == b[(m - y - 1) as usize] {
                x += 1;
                y += 1;
            }
            backward[at as usize] = x;

            if x > n {
                b_end += 2;
            } else if y > m {
                b_start += 2;
            } else if !front {
                let other = offset + delta - k;
                if other >= 0 && other < len && forward[other as usize] != -1 {
                    let fx = forward[other as usize];
                    let fy = offset + fx - other;
                    if fx >= n - x {
                        return Some((fx as usize, fy as usize));
                    }
                }
            }
            k += 2;
        }
    }

    None
}

// =============================================================================
// Cleanup passes
// =============================================================================

/// Drops empty chunks and merges neighbours of the same kind.
fn normalize(chunks: Vec<Chunk<'_>>) -> Vec<Chunk<'_>> {
    let mut script = Script::default();
    for chunk in chunks.into_iter().filter(|c| !c.is_empty()) {
        match chunk {
            Chunk::Equal(lines) => script.equal(&lines),
            Chunk::Change { deleted, inserted } => script.change(&deleted, &inserted),
        }
    }
    script.chunks
}

/// Folds `chunks[i]` (an equal run) and the changes on both sides into one change.
fn absorb_equality(chunks: &mut Vec<Chunk<'_>>, i: usize) {
    let next = chunks.remove(i + 1);
    let equal = chunks.remove(i);

    let (Chunk::Equal(equal), Chunk::Change { deleted: next_del, inserted: next_ins }) =
        (equal, next)
    else {
        return;
    };

    if let Chunk::Change { deleted, inserted } = &mut chunks[i - 1] {
        deleted.extend_from_slice(&equal);
        deleted.extend(next_del);
        inserted.extend_from_slice(&equal);
        inserted.extend(next_ins);
    }
}

/// Returns `(deleted, inserted)` lengths if `chunk` is a change.
fn change_lens(chunk: &Chunk<'_>) -> Option<(usize, usize)> {
    match chunk {
        Chunk::Change { deleted, inserted } => Some((deleted.len(), inserted.len())),
        Chunk::Equal(_) => None,
    }
}

/// Semantic cleanup: fold coincidental equalities, then align boundaries.
pub(crate) fn cleanup_semantic(chunks: &mut Vec<Chunk<'_>>) {
    let mut i = 1;
    while i + 1 < chunks.len() {
        let folded = match (&chunks[i], change_lens(&chunks[i - 1]), change_lens(&chunks[i + 1])) {
            (Chunk::Equal(equal), Some((pd, pi)), Some((nd, ni))) => {
                equal.len() <= pd.max(pi) && equal.len() <= nd.max(ni)
            }
            _ => false,
        };

        if folded {
            absorb_equality(chunks, i);
            // The grown change may now swallow the equality before it.
            i = i.saturating_sub(2).max(1);
        } else {
            i += 1;
        }
    }

    align_to_blank_lines(chunks);
}

/// Slides pure insertions and deletions so they end on a blank line.
///
/// A block of inserted (or deleted) lines between two equal runs can move up
/// or down while the line it leaves behind equals the line it takes over; the
/// text is the same either way. The block moves to the furthest-down valid
/// position whose last line is blank. Without such a position it stays put.
fn align_to_blank_lines(chunks: &mut Vec<Chunk<'_>>) {
    for i in 1..chunks.len().saturating_sub(1) {
        let (Chunk::Equal(before), Chunk::Equal(after)) = (&chunks[i - 1], &chunks[i + 1]) else {
            continue;
        };
        let block = match &chunks[i] {
            Chunk::Change { deleted, inserted } if inserted.is_empty() => deleted,
            Chunk::Change { deleted, inserted } if deleted.is_empty() => inserted,
            _ => continue,
        };

        let original = before.len();
        let block_len = block.len();
        let lines: Vec<&str> = before
            .iter()
            .chain(block.iter())
            .chain(after.iter())
            .copied()
            .collect();

        let mut low = original;
        while low > 0 && lines[low - 1] == lines[low + block_len - 1] {
            low -= 1;
        }
        let mut high = original;
        while high + block_len < lines.len() && lines[high] == lines[high + block_len] {
            high += 1;
        }

        let Some(start) = (low..=high)
            .rev()
            .find(|&s| lines[s + block_len - 1].trim().is_empty())
        else {
            continue;
        };
        if start == original {
            continue;
        }

        let split_block = start + block_len;
        chunks[i - 1] = Chunk::Equal(lines[..start].to_vec());
        chunks[i + 1] = Chunk::Equal(lines[split_block..].to_vec());
        if let Chunk::Change { deleted, inserted } = &mut chunks[i] {
            let moved = lines[start..split_block].to_vec();
            if inserted.is_empty() {
                *deleted = moved;
            } else {
                *inserted = moved;
            }
        }
    }

    let normalized = normalize(std::mem::take(chunks));
    *chunks = normalized;
}

/// Efficiency cleanup: merge changes separated by cheap equalities.
///
/// An equal run shorter than `edit_cost` is folded into its neighbours when
/// both neighbours delete and insert, or when three of the four sides change
/// and the run is shorter than half the cost.
pub(crate) fn cleanup_efficiency(chunks: &mut Vec<Chunk<'_>>, edit_cost: usize) {
    let mut i = 1;
    while i + 1 < chunks.len() {
        let folded = match (&chunks[i], change_lens(&chunks[i - 1]), change_lens(&chunks[i + 1])) {
            (Chunk::Equal(equal), Some((pd, pi)), Some((nd, ni))) if equal.len() < edit_cost => {
                let sides = [pd > 0, pi > 0, nd > 0, ni > 0]
                    .into_iter()
                    .filter(|&s| s)
                    .count();
                sides == 4 || (sides == 3 && equal.len() * 2 < edit_cost)
            }
            _ => false,
        };

        if folded {
            absorb_equality(chunks, i);
            i = i.saturating_sub(2).max(1);
        } else {
            i += 1;
        }
    }
}

// =============================================================================
// Hunk encoding
// =============================================================================

/// Open hunk being filled while walking the edit script.
struct HunkBuilder {
    old_index: usize,
    new_index: usize,
    lines: Vec<HunkLine>,
}

impl HunkBuilder {
    fn push_all(&mut self, tag: LineTag, tokens: &[&str]) {
        self.lines
            .extend(tokens.iter().map(|t| HunkLine::from_token(tag, t)));
    }

    fn finish(self) -> Hunk {
        Hunk::from_lines(self.old_index, self.new_index, self.lines)
    }
}

/// Encodes an edit script as hunks with `context` lines around each change.
fn encode(chunks: &[Chunk<'_>], context: usize) -> Patch {
    let mut hunks = Vec::new();
    let mut current: Option<HunkBuilder> = None;
    let (mut old_pos, mut new_pos) = (0usize, 0usize);

    for (index, chunk) in chunks.iter().enumerate() {
        match chunk {
            Chunk::Equal(lines) => {
                if let Some(mut builder) = current.take() {
                    let is_last = index + 1 == chunks.len();
                    if !is_last && lines.len() <= 2 * context {
                        builder.push_all(LineTag::Context, lines);
                        current = Some(builder);
                    } else {
                        let take = context.min(lines.len());
                        builder.push_all(LineTag::Context, &lines[..take]);
                        hunks.push(builder.finish());
                    }
                }
                old_pos += lines.len();
                new_pos += lines.len();
            }
            Chunk::Change { deleted, inserted } => {
                let builder = current.get_or_insert_with(|| {
                    let lead: &[&str] = match index.checked_sub(1).map(|p| &chunks[p]) {
                        Some(Chunk::Equal(prev)) => &prev[prev.len() - context.min(prev.len())..],
                        _ => &[],
                    };
                    let mut builder = HunkBuilder {
                        old_index: old_pos - lead.len(),
                        new_index: new_pos - lead.len(),
                        lines: Vec::new(),
                    };
                    builder.push_all(LineTag::Context, lead);
                    builder
                });

                builder.push_all(LineTag::Delete, deleted);
                builder.push_all(LineTag::Insert, inserted);
                old_pos += deleted.len();
                new_pos += inserted.len();
            }
        }
    }

    if let Some(builder) = current {
        hunks.push(builder.finish());
    }

    Patch { hunks }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::apply;

    fn round_trip(old: &str, new: &str) {
        let patch = diff(old, new);
        let text = patch.to_string();
        let rebuilt = apply(&text, old).unwrap_or_else(|e| {
            panic!("apply failed for {old:?} -> {new:?}: {e}\npatch:\n{text}")
        });
        assert_eq!(rebuilt, new, "patch:\n{text}");
    }

    fn counts(chunks: &[Chunk<'_>]) -> (usize, usize) {
        chunks.iter().fold((0, 0), |(d, i), c| match c {
            Chunk::Change { deleted, inserted } => (d + deleted.len(), i + inserted.len()),
            Chunk::Equal(_) => (d, i),
        })
    }

    #[test]
    fn identical_texts_give_empty_patch() {
        let patch = diff("same\ntext\n", "same\ntext\n");
        assert!(patch.is_empty());
        assert_eq!(patch.to_string(), "");
        assert_eq!(patch.apply_to("same\ntext\n").unwrap(), "same\ntext\n");
    }

    #[test]
    fn hello_world_to_hello_go() {
        let patch = diff("Hello World", "Hello Go");
        assert_eq!(
            patch.to_string(),
            "@@ -1,1 +1,1 @@\n-Hello World\n\\ No newline at end of file\n+Hello Go\n\\ No newline at end of file\n"
        );
    }

    #[test]
    fn baseline_from_empty() {
        let patch = diff("", "a\nb\n");
        assert_eq!(patch.to_string(), "@@ -0,0 +1,2 @@\n+a\n+b\n");
    }

    #[test]
    fn delete_everything() {
        let patch = diff("a\nb\n", "");
        assert_eq!(patch.to_string(), "@@ -1,2 +0,0 @@\n-a\n-b\n");
    }

    #[test]
    fn context_lines_surround_change() {
        let old = "1\n2\n3\n4\n5\n6\n7\n8\n9\n";
        let new = "1\n2\n3\n4\nFIVE\n6\n7\n8\n9\n";
        let patch = diff(old, new);

        assert_eq!(
            patch.to_string(),
            "@@ -2,7 +2,7 @@\n 2\n 3\n 4\n-5\n+FIVE\n 6\n 7\n 8\n"
        );
    }

    #[test]
    fn distant_changes_produce_separate_hunks() {
        let old: String = (1..=30).map(|n| format!("line {n}\n")).collect();
        let new = old.replace("line 2\n", "line two\n").replace("line 28\n", "line 28b\n");

        let patch = diff(&old, &new);
        assert_eq!(patch.hunks.len(), 2);
        round_trip(&old, &new);
    }

    #[test]
    fn nearby_changes_share_a_hunk() {
        let old = "a\nb\nc\nd\ne\nf\ng\nh\n";
        let new = "A\nb\nc\nd\ne\nf\nG\nh\n";

        let patch = diff(old, new);
        assert_eq!(patch.hunks.len(), 1);
        round_trip(old, new);
    }

    #[test]
    fn round_trips() {
        let cases = [
            ("", ""),
            ("", "x"),
            ("x", ""),
            ("a\nb\nc\n", "a\nc\n"),
            ("a\nb\nc\n", "a\nb\nc"),
            ("a\nb\nc", "a\nb\nc\n"),
            ("a\r\nb\r\n", "a\r\nB\r\n"),
            ("one\ntwo\nthree\n", "zero\none\ntwo\nthree\nfour\n"),
            ("x\ny\nz\n", "z\ny\nx\n"),
            ("\n\n\n", "\n\n"),
            ("fn a() {}\n\nfn b() {}\n", "fn a() {}\n\nfn c() {}\n\nfn b() {}\n"),
            ("@@ not a header\n", "@@ still not\n"),
            ("+plus\n-minus\n", "-minus\n+plus\n"),
            ("unicode é ü\n", "unicode ß\n"),
        ];
        for (old, new) in cases {
            round_trip(old, new);
        }
    }

    #[test]
    fn round_trips_generated_edit_sequences() {
        let mut text = String::new();
        for step in 0..40usize {
            let mut lines: Vec<String> = text.lines().map(String::from).collect();
            match step % 4 {
                0 => lines.push(format!("appended {step}")),
                1 => lines.insert(lines.len() / 2, format!("middle {step}")),
                2 if !lines.is_empty() => {
                    lines.remove(0);
                }
                _ => {
                    if let Some(last) = lines.last_mut() {
                        *last = format!("edited {step}");
                    }
                }
            }
            let next = lines.join("\n") + "\n";
            round_trip(&text, &next);
            text = next;
        }
    }

    #[test]
    fn myers_finds_minimal_script() {
        let old = split_lines("a\nb\nc\na\nb\nb\na\n");
        let new = split_lines("c\nb\na\nb\na\nc\n");
        let chunks = line_diff(&old, &new);

        let (deleted, inserted) = counts(&chunks);
        assert_eq!(deleted + inserted, 5);
    }

    #[test]
    fn myers_matches_reference_edit_distance() {
        use similar::{ChangeTag, TextDiff};

        let cases = [
            ("a\nb\nc\nd\ne\n", "a\nc\nd\nx\ne\n"),
            ("1\n2\n3\n4\n5\n6\n", "6\n5\n4\n3\n2\n1\n"),
            ("x\nx\nx\ny\n", "y\nx\nx\nx\n"),
            ("alpha\nbeta\ngamma\n", "beta\ngamma\ndelta\nalpha\n"),
            ("", "a\nb\n"),
        ];

        for (old, new) in cases {
            let reference = TextDiff::from_lines(old, new)
                .iter_all_changes()
                .filter(|c| c.tag() != ChangeTag::Equal)
                .count();

            let chunks = line_diff(&split_lines(old), &split_lines(new));
            let (deleted, inserted) = counts(&chunks);
            assert_eq!(deleted + inserted, reference, "{old:?} -> {new:?}");
        }
    }

    fn rewrite_around_shared_line(half: usize) -> (String, String) {
        let side = |tag: &str| {
            let mut text = String::new();
            for i in 0..half {
                text.push_str(&format!("{tag} {i}\n"));
            }
            text.push_str("shared\n");
            for i in half..2 * half {
                text.push_str(&format!("{tag} {i}\n"));
            }
            text
        };
        (side("old"), side("new"))
    }

    #[test]
    fn short_rewrite_keeps_common_line() {
        let (old, new) = rewrite_around_shared_line(100);
        let (old_lines, new_lines) = (split_lines(&old), split_lines(&new));
        let chunks = line_diff(&old_lines, &new_lines);

        assert!(chunks.contains(&Chunk::Equal(vec!["shared\n"])), "{chunks:?}");
        assert_eq!(counts(&chunks), (200, 200));
    }

    #[test]
    fn long_rewrite_is_one_change() {
        let (old, new) = rewrite_around_shared_line(MAX_EDIT_STEPS * 2);
        let (old_lines, new_lines) = (split_lines(&old), split_lines(&new));
        let chunks = line_diff(&old_lines, &new_lines);

        assert_eq!(chunks.len(), 1);
        assert_eq!(counts(&chunks), (old_lines.len(), new_lines.len()));

        let patch = diff(&old, &new);
        assert_eq!(patch.hunks.len(), 1);
        assert_eq!(patch.apply_to(&old).unwrap(), new);
    }

    #[test]
    fn script_alternates_and_orders_deletes_first() {
        let old = split_lines("a\nb\nc\n");
        let new = split_lines("x\nb\ny\n");
        let chunks = line_diff(&old, &new);

        for pair in chunks.windows(2) {
            let same_kind = matches!(
                pair,
                [Chunk::Equal(_), Chunk::Equal(_)] | [Chunk::Change { .. }, Chunk::Change { .. }]
            );
            assert!(!same_kind, "{chunks:?}");
        }
    }

    #[test]
    fn semantic_cleanup_folds_coincidental_equality() {
        let mut chunks = vec![
            Chunk::Change {
                deleted: vec!["a\n", "b\n"],
                inserted: vec!["x\n", "y\n"],
            },
            Chunk::Equal(vec!["}\n"]),
            Chunk::Change {
                deleted: vec!["c\n"],
                inserted: vec!["z\n"],
            },
        ];
        cleanup_semantic(&mut chunks);

        assert_eq!(
            chunks,
            vec![Chunk::Change {
                deleted: vec!["a\n", "b\n", "}\n", "c\n"],
                inserted: vec!["x\n", "y\n", "}\n", "z\n"],
            }]
        );
    }

    #[test]
    fn semantic_cleanup_keeps_long_equality() {
        let mut chunks = vec![
            Chunk::Change {
                deleted: vec!["a\n"],
                inserted: vec!["x\n"],
            },
            Chunk::Equal(vec!["k1\n", "k2\n"]),
            Chunk::Change {
                deleted: vec!["c\n"],
                inserted: vec!["z\n"],
            },
        ];
        let before = chunks.clone();
        cleanup_semantic(&mut chunks);
        assert_eq!(chunks, before);
    }

    #[test]
    fn insertion_slides_to_end_on_blank_line() {
        // Inserting "fn c() {}\n\n" between two functions: Myers may place the
        // block one line off, straddling the blank separator.
        let mut chunks = vec![
            Chunk::Equal(vec!["fn a() {}\n"]),
            Chunk::Change {
                deleted: vec![],
                inserted: vec!["\n", "fn c() {}\n"],
            },
            Chunk::Equal(vec!["\n", "fn b() {}\n"]),
        ];
        cleanup_semantic(&mut chunks);

        assert_eq!(
            chunks,
            vec![
                Chunk::Equal(vec!["fn a() {}\n", "\n"]),
                Chunk::Change {
                    deleted: vec![],
                    inserted: vec!["fn c() {}\n", "\n"],
                },
                Chunk::Equal(vec!["fn b() {}\n"]),
            ]
        );
    }

    #[test]
    fn efficiency_cleanup_merges_short_gap() {
        let mut chunks = vec![
            Chunk::Change {
                deleted: vec!["a\n"],
                inserted: vec!["A\n"],
            },
            Chunk::Equal(vec!["k\n", "l\n", "m\n"]),
            Chunk::Change {
                deleted: vec!["b\n"],
                inserted: vec!["B\n"],
            },
        ];
        cleanup_efficiency(&mut chunks, DEFAULT_EDIT_COST);
        assert_eq!(chunks.len(), 1);

        let mut chunks = vec![
            Chunk::Change {
                deleted: vec!["a\n"],
                inserted: vec!["A\n"],
            },
            Chunk::Equal(vec!["k\n", "l\n", "m\n", "n\n"]),
            Chunk::Change {
                deleted: vec!["b\n"],
                inserted: vec!["B\n"],
            },
        ];
        cleanup_efficiency(&mut chunks, DEFAULT_EDIT_COST);
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn efficiency_cleanup_three_sides_needs_shorter_gap() {
        let make = |gap: Vec<&'static str>| {
            vec![
                Chunk::Change {
                    deleted: vec!["a\n"],
                    inserted: vec!["A\n"],
                },
                Chunk::Equal(gap),
                Chunk::Change {
                    deleted: vec![],
                    inserted: vec!["B\n"],
                },
            ]
        };

        let mut short = make(vec!["k\n"]);
        cleanup_efficiency(&mut short, DEFAULT_EDIT_COST);
        assert_eq!(short.len(), 1);

        let mut longer = make(vec!["k\n", "l\n"]);
        cleanup_efficiency(&mut longer, DEFAULT_EDIT_COST);
        assert_eq!(longer.len(), 3);
    }

    #[test]
    fn zero_context_round_trips() {
        let differ = Differ::new(DiffOptions {
            context_lines: 0,
            edit_cost: 1,
        });
        let old = "a\nb\nc\nd\n";
        let new = "a\nc\nd\ne\n";

        let patch = differ.diff(old, new);
        assert_eq!(patch.apply_to(old).unwrap(), new);
    }

    #[test]
    fn diff_bytes_rejects_binary_and_invalid_utf8() {
        let differ = Differ::default();

        let err = differ.diff_bytes(b"text", b"bin\0ary").unwrap_err();
        assert!(matches!(err, DiffError::Binary { offset: 3 }));

        let err = differ.diff_bytes(&[0x66, 0xff, 0xfe], b"text").unwrap_err();
        assert!(matches!(err, DiffError::InvalidUtf8 { offset: 1 }));
        assert!(!err.is_read_error());

        let patch = differ.diff_bytes(b"a\n", b"b\n").unwrap();
        assert_eq!(patch.stats().total_changes(), 2);
    }

    #[test]
    fn diff_file_reads_new_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        fs::write(&path, "new\n").unwrap();

        let (patch, content) = Differ::default().diff_file("old\n", &path).unwrap();
        assert_eq!(content, "new\n");
        assert_eq!(patch.apply_to("old\n").unwrap(), "new\n");
    }

    #[test]
    fn diff_file_missing_is_read_error() {
        let err = Differ::default()
            .diff_file("", Path::new("/nonexistent/tracewrite/file"))
            .unwrap_err();
        assert!(err.is_read_error());
        assert!(err.to_string().contains("failed to read"));
    }
}
