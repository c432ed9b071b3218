use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content-derived identifier of a patch: SHA-256 over the normalized
/// message and the normalized diff. Stable across rebases that do not
/// change the patch's content, independent of commit topology.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatchId(pub String);

impl PatchId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One hunk of a diff: the added and removed lines, without context lines
/// and without line numbers. Hunks are keyed by the heading text of their
/// `@@` header (the section/function context), which is what makes the
/// comparison tolerant of line-number shifts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub insertions: Vec<String>,
    pub deletions: Vec<String>,
}

impl Hunk {
    pub fn lines(&self) -> usize {
        self.insertions.len() + self.deletions.len()
    }
}

/// Parsed diff of a patch: file path -> hunk heading -> hunk.
/// BTreeMaps keep iteration (and thus identifier hashing) deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub files: BTreeMap<String, BTreeMap<String, Hunk>>,
    /// Total number of changed (added + removed) lines.
    pub lines: usize,
}

impl Diff {
    pub fn add_line(&mut self, file: &str, heading: &str, insertion: bool, content: String) {
        let hunk = self
            .files
            .entry(file.to_string())
            .or_default()
            .entry(heading.to_string())
            .or_default();
        if insertion {
            hunk.insertions.push(content);
        } else {
            hunk.deletions.push(content);
        }
        self.lines += 1;
    }

    pub fn affected_files(&self) -> impl Iterator<Item = &String> {
        self.files.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.lines == 0
    }
}

/// One logical source change. Immutable once created; a reworked version of
/// "the same" change is a distinct Patch related only through equivalence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub id: PatchId,
    pub author: String,
    pub author_email: String,
    /// Author date, seconds since the epoch (UTC).
    pub author_date: i64,
    /// Normalized message lines: empty lines and tag lines
    /// (Signed-off-by etc.) filtered out. First line is the subject.
    pub message: Vec<String>,
    pub is_revert: bool,
    pub diff: Diff,
    /// Name of the stack snapshot this patch was loaded from, if any.
    pub stack: Option<String>,
    /// The git commit this patch was parsed from, if any.
    pub commit: Option<String>,
}

impl Patch {
    pub fn new(
        author: impl Into<String>,
        author_email: impl Into<String>,
        author_date: i64,
        message: Vec<String>,
        diff: Diff,
        stack: Option<String>,
        commit: Option<String>,
    ) -> Self {
        let id = Self::content_id(&message, &diff);
        let is_revert = message.iter().any(|l| l.to_lowercase().contains("revert"));
        Patch {
            id,
            author: author.into(),
            author_email: author_email.into(),
            author_date,
            message,
            is_revert,
            diff,
            stack,
            commit,
        }
    }

    pub fn subject(&self) -> &str {
        self.message.first().map(String::as_str).unwrap_or("")
    }

    fn content_id(message: &[String], diff: &Diff) -> PatchId {
        let mut hasher = Sha256::new();
        for line in message {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        for (file, hunks) in &diff.files {
            hasher.update(file.as_bytes());
            hasher.update(b"\0");
            for (heading, hunk) in hunks {
                hasher.update(heading.as_bytes());
                hasher.update(b"\0");
                for line in &hunk.insertions {
                    hasher.update(b"+");
                    hasher.update(line.as_bytes());
                    hasher.update(b"\n");
                }
                for line in &hunk.deletions {
                    hasher.update(b"-");
                    hasher.update(line.as_bytes());
                    hasher.update(b"\n");
                }
            }
        }
        PatchId(format!("{:x}", hasher.finalize()))
    }
}

/// The universe of loaded patches, keyed by id.
pub type PatchMap = HashMap<PatchId, Patch>;

/// One version of a maintained branch at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchStack {
    pub name: String,
    /// Patch ids in application order (oldest first).
    pub patches: Vec<PatchId>,
}

/// Raw rater output before weighting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimRating {
    /// Message similarity in [0, 1].
    pub msg: f64,
    /// Diff similarity in [0, 1].
    pub diff: f64,
    /// Ratio of shorter to longer diff length in [0, 1].
    pub diff_lines_ratio: f64,
}

impl SimRating {
    pub const IDENTICAL: SimRating = SimRating {
        msg: 1.0,
        diff: 1.0,
        diff_lines_ratio: 1.0,
    };

    /// Combined score: `w * msg + (1 - w) * diff`.
    pub fn combined(&self, message_diff_weight: f64) -> f64 {
        message_diff_weight * self.msg + (1.0 - message_diff_weight) * self.diff
    }

    pub fn is_valid(&self) -> bool {
        let ok = |v: f64| (0.0..=1.0).contains(&v);
        ok(self.msg) && ok(self.diff) && ok(self.diff_lines_ratio)
    }
}

/// Why a comparison could not produce a rating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownReason {
    /// One side's diff exceeded the configured size cutoff.
    TooLarge,
    /// One side could not be parsed into a usable representation.
    Malformed,
}

/// Outcome of rating a pair. Callers must handle the unknown case
/// explicitly; it is data, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    Rated { rating: SimRating },
    Unknown { reason: UnknownReason },
}

impl Verdict {
    pub fn rating(&self) -> Option<SimRating> {
        match self {
            Verdict::Rated { rating } => Some(*rating),
            Verdict::Unknown { .. } => None,
        }
    }

    pub fn combined(&self, message_diff_weight: f64) -> Option<f64> {
        self.rating().map(|r| r.combined(message_diff_weight))
    }
}

/// Canonical unordered pair of patch ids: the smaller id always comes
/// first, so (a, b) and (b, a) share one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    pub a: PatchId,
    pub b: PatchId,
}

impl PairKey {
    pub fn new(x: &PatchId, y: &PatchId) -> Self {
        if x <= y {
            PairKey {
                a: x.clone(),
                b: y.clone(),
            }
        } else {
            PairKey {
                a: y.clone(),
                b: x.clone(),
            }
        }
    }

    pub fn references(&self, id: &PatchId) -> bool {
        &self.a == id || &self.b == id
    }
}

/// A memoized comparison between two patches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub key: PairKey,
    pub verdict: Verdict,
    /// Seconds since the epoch at which the rating was computed.
    pub computed_at: i64,
}

/// Upstream integration record for one equivalence class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamEntry {
    /// Git commit hash of the earliest matching upstream commit.
    pub commit: String,
    /// Author date of that upstream commit.
    pub integrated_at: i64,
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Build a patch from a message and (file, heading, insertions,
    /// deletions) tuples.
    pub fn patch(message: &[&str], date: i64, hunks: &[(&str, &str, &[&str], &[&str])]) -> Patch {
        let mut diff = Diff::default();
        for (file, heading, ins, del) in hunks {
            for line in *ins {
                diff.add_line(file, heading, true, line.to_string());
            }
            for line in *del {
                diff.add_line(file, heading, false, line.to_string());
            }
        }
        Patch::new(
            "Test Author",
            "test@example.com",
            date,
            message.iter().map(|s| s.to_string()).collect(),
            diff,
            None,
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::patch;
    use super::*;

    #[test]
    fn content_id_ignores_author_and_date() {
        let a = patch(&["fix a thing"], 100, &[("a.c", "foo()", &["x = 1;"], &[])]);
        let mut b = patch(&["fix a thing"], 2000, &[("a.c", "foo()", &["x = 1;"], &[])]);
        b.author = "Someone Else".into();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn content_id_changes_with_diff() {
        let a = patch(&["fix a thing"], 100, &[("a.c", "foo()", &["x = 1;"], &[])]);
        let b = patch(&["fix a thing"], 100, &[("a.c", "foo()", &["x = 2;"], &[])]);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn pair_key_is_order_independent() {
        let a = PatchId("aaa".into());
        let b = PatchId("bbb".into());
        assert_eq!(PairKey::new(&a, &b), PairKey::new(&b, &a));
    }

    #[test]
    fn revert_detection() {
        let p = patch(&["Revert \"fix a thing\""], 0, &[]);
        assert!(p.is_revert);
        let q = patch(&["fix a thing"], 0, &[]);
        assert!(!q.is_revert);
    }
}
