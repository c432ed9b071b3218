//! The similarity rater: a pure, deterministic, symmetric function from two
//! patches to a rating (or an explicit unknown). It never touches cache or
//! cluster state; memoization happens a layer above.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::RaterConfig;
use crate::model::{Diff, Hunk, Patch, SimRating, UnknownReason, Verdict};

/// Rate two patches. Identical ids short-circuit to a perfect rating; a
/// diff larger than the configured cutoff yields `Unknown` instead of
/// unbounded work.
pub fn rate(cfg: &RaterConfig, a: &Patch, b: &Patch) -> Verdict {
    if a.id == b.id {
        return Verdict::Rated {
            rating: SimRating::IDENTICAL,
        };
    }

    if a.diff.lines > cfg.max_diff_lines || b.diff.lines > cfg.max_diff_lines {
        return Verdict::Unknown {
            reason: UnknownReason::TooLarge,
        };
    }

    if a.diff.is_empty() || b.diff.is_empty() {
        return Verdict::Unknown {
            reason: UnknownReason::Malformed,
        };
    }

    let msg = token_sort_ratio(&a.message.join("\n"), &b.message.join("\n"));

    let shorter = a.diff.lines.min(b.diff.lines) as f64;
    let longer = a.diff.lines.max(b.diff.lines) as f64;
    let diff_lines_ratio = shorter / longer;

    // A size mismatch this extreme cannot be the same change.
    let diff = if diff_lines_ratio < cfg.min_line_ratio {
        0.0
    } else {
        rate_diffs(cfg, &a.diff, &b.diff)
    };

    Verdict::Rated {
        rating: SimRating {
            msg,
            diff,
            diff_lines_ratio,
        },
    }
}

/// Diff similarity: map file paths onto each other, then hunks within each
/// mapped file pair by their headings, then compare matched hunk bodies.
/// Mean over hunks per file, mean over files.
fn rate_diffs(cfg: &RaterConfig, l: &Diff, r: &Diff) -> f64 {
    let l_files: Vec<&str> = l.files.keys().map(String::as_str).collect();
    let r_files: Vec<&str> = r.files.keys().map(String::as_str).collect();
    let file_pairs = best_string_mapping(cfg.filename_threshold, &l_files, &r_files);

    let mut file_ratings = Vec::new();

    for (l_file, r_file) in file_pairs {
        let l_hunks = &l.files[l_file];
        let r_hunks = &r.files[r_file];

        let l_headings: Vec<&str> = l_hunks.keys().map(String::as_str).collect();
        let r_headings: Vec<&str> = r_hunks.keys().map(String::as_str).collect();
        let hunk_pairs = best_string_mapping(cfg.heading_threshold, &l_headings, &r_headings);

        let mut hunk_ratings = Vec::new();
        for (l_heading, r_heading) in hunk_pairs {
            let lh = &l_hunks[l_heading];
            let rh = &r_hunks[r_heading];

            if !lh.deletions.is_empty() && !rh.deletions.is_empty() {
                hunk_ratings.push(compare_lines(&lh.deletions, &rh.deletions));
            }
            if !lh.insertions.is_empty() && !rh.insertions.is_empty() {
                hunk_ratings.push(compare_lines(&lh.insertions, &rh.insertions));
            }
        }

        if !hunk_ratings.is_empty() {
            file_ratings.push(mean(&hunk_ratings));
        }
    }

    if file_ratings.is_empty() {
        return 0.0;
    }
    mean(&file_ratings)
}

fn compare_lines(left: &[String], right: &[String]) -> f64 {
    // Happens e.g. when both hunks remove the same empty lines.
    if left == right {
        return 1.0;
    }
    token_sort_ratio(&left.join("\n"), &right.join("\n"))
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Injective best-weight mapping between two string lists, in both
/// directions. An entry of one list is mapped to the most similar entry of
/// the other, provided the similarity reaches `threshold`; at a threshold
/// of 1.0 or above only exact matches are considered.
fn best_string_mapping<'a>(
    threshold: f64,
    left: &[&'a str],
    right: &[&'a str],
) -> BTreeSet<(&'a str, &'a str)> {
    fn injective<'a>(
        threshold: f64,
        from: &[&'a str],
        to: &[&'a str],
        inverse: bool,
    ) -> BTreeSet<(&'a str, &'a str)> {
        let mut best: BTreeMap<&str, (&str, f64)> = BTreeMap::new();
        for &f in from {
            for &t in to {
                let sim = if f == t {
                    1.0
                } else if threshold >= 1.0 {
                    continue;
                } else {
                    token_sort_ratio(f, t)
                };
                if sim < threshold {
                    continue;
                }
                match best.get(f) {
                    Some(&(_, old)) if sim < old => {}
                    _ => {
                        best.insert(f, (t, sim));
                    }
                }
            }
        }
        best.into_iter()
            .map(|(f, (t, _))| if inverse { (t, f) } else { (f, t) })
            .collect()
    }

    let mut pairs = injective(threshold, left, right, false);
    pairs.extend(injective(threshold, right, left, true));
    pairs
}

/// Token-sort similarity: lowercase, split on non-alphanumerics, sort the
/// tokens, and take the normalized Levenshtein similarity of the rejoined
/// strings. Insensitive to word order and punctuation.
pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    let sa = sorted_tokens(a);
    let sb = sorted_tokens(b);
    similarity(&sa, &sb)
}

fn sorted_tokens(s: &str) -> String {
    let mut tokens: Vec<String> = s
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longer = a.len().max(b.len());
    1.0 - levenshtein(&a, &b) as f64 / longer as f64
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Used by reports to show the hunk-level structure of a rating.
pub fn hunk_count(diff: &Diff) -> usize {
    diff.files.values().map(BTreeMap::<String, Hunk>::len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testutil::patch;

    fn default_cfg() -> RaterConfig {
        RaterConfig::default()
    }

    #[test]
    fn levenshtein_basics() {
        let c = |s: &str| s.chars().collect::<Vec<_>>();
        assert_eq!(levenshtein(&c("kitten"), &c("sitting")), 3);
        assert_eq!(levenshtein(&c(""), &c("abc")), 3);
        assert_eq!(levenshtein(&c("abc"), &c("abc")), 0);
    }

    #[test]
    fn token_sort_ignores_word_order() {
        assert_eq!(token_sort_ratio("null fix check", "fix null check"), 1.0);
        assert!(token_sort_ratio("fix null check", "rewrite scheduler") < 0.5);
    }

    #[test]
    fn rating_is_symmetric() {
        let cfg = default_cfg();
        let a = patch(
            &["fix null check"],
            100,
            &[("a.c", "foo()", &["if (!p) return;"], &["use(p);"])],
        );
        let b = patch(
            &["add null guard"],
            200,
            &[("a.c", "foo()", &["if (!p) return;"], &["use(p);"])],
        );
        assert_eq!(rate(&cfg, &a, &b), rate(&cfg, &b, &a));
    }

    #[test]
    fn identical_patch_is_perfect() {
        let cfg = default_cfg();
        let a = patch(&["fix"], 0, &[("a.c", "foo()", &["x"], &[])]);
        let v = rate(&cfg, &a, &a.clone());
        assert_eq!(v.rating().unwrap(), SimRating::IDENTICAL);
    }

    #[test]
    fn reworded_message_same_diff_exceeds_threshold() {
        let cfg = default_cfg();
        let hunks: &[(&str, &str, &[&str], &[&str])] = &[(
            "a.c",
            "foo()",
            &["if (ptr == NULL)", "        return -EINVAL;"],
            &["use(ptr);"],
        )];
        let p1 = patch(&["fix null check"], 100, hunks);
        let p2 = patch(&["add null guard"], 200, hunks);
        let rating = rate(&cfg, &p1, &p2).rating().unwrap();
        assert_eq!(rating.diff, 1.0);
        assert!(rating.combined(cfg.message_diff_weight) >= 0.8);
    }

    #[test]
    fn unrelated_patch_stays_below_threshold() {
        let cfg = default_cfg();
        let p1 = patch(
            &["fix null check"],
            100,
            &[("a.c", "foo()", &["if (ptr == NULL)"], &["use(ptr);"])],
        );
        let p3 = patch(
            &["rework scheduler queue"],
            150,
            &[("b.c", "sched()", &["queue_push(q, t);"], &["run(t);"])],
        );
        let rating = rate(&cfg, &p1, &p3).rating().unwrap();
        assert_eq!(rating.diff, 0.0, "no file overlap, no diff similarity");
        assert!(rating.combined(cfg.message_diff_weight) < 0.8);
    }

    #[test]
    fn tolerates_line_number_shift() {
        // Same change, one extra context line above: the hunk heading and
        // the changed lines are unchanged, only @@ line numbers move.
        let cfg = default_cfg();
        let p1 = patch(
            &["fix null check"],
            100,
            &[("a.c", "foo()", &["if (ptr == NULL)"], &["use(ptr);"])],
        );
        let p4 = patch(
            &["fix null check v2"],
            400,
            &[("a.c", "foo()", &["if (ptr == NULL)"], &["use(ptr);"])],
        );
        let rating = rate(&cfg, &p1, &p4).rating().unwrap();
        assert_eq!(rating.diff, 1.0);
        assert!(rating.combined(cfg.message_diff_weight) >= 0.8);
    }

    #[test]
    fn oversized_diff_is_unknown() {
        let mut cfg = default_cfg();
        cfg.max_diff_lines = 1;
        let a = patch(&["big"], 0, &[("a.c", "f()", &["1", "2", "3"], &[])]);
        let b = patch(&["big too"], 0, &[("a.c", "f()", &["1", "2"], &[])]);
        assert_eq!(
            rate(&cfg, &a, &b),
            Verdict::Unknown {
                reason: UnknownReason::TooLarge
            }
        );
    }

    #[test]
    fn empty_diff_is_malformed() {
        let cfg = default_cfg();
        let a = patch(&["message only"], 0, &[]);
        let b = patch(&["something"], 0, &[("a.c", "f()", &["x"], &[])]);
        assert_eq!(
            rate(&cfg, &a, &b),
            Verdict::Unknown {
                reason: UnknownReason::Malformed
            }
        );
    }

    #[test]
    fn degenerate_size_ratio_pins_diff_to_zero() {
        let mut cfg = default_cfg();
        cfg.min_line_ratio = 0.5;
        let small = patch(&["change"], 0, &[("a.c", "f()", &["x"], &[])]);
        let big = patch(
            &["change"],
            0,
            &[("a.c", "f()", &["x", "y", "z", "w"], &[])],
        );
        let rating = rate(&cfg, &small, &big).rating().unwrap();
        assert_eq!(rating.diff, 0.0);
        assert!(rating.diff_lines_ratio < 0.5);
    }

    #[test]
    fn fuzzy_filename_mapping_bridges_renames() {
        let mut cfg = default_cfg();
        cfg.filename_threshold = 0.8;
        let a = patch(
            &["move helper"],
            0,
            &[("drivers/net/helper.c", "f()", &["x = 1;"], &[])],
        );
        let b = patch(
            &["move helper"],
            0,
            &[("drivers/net/helpers.c", "f()", &["x = 1;"], &[])],
        );
        let rating = rate(&cfg, &a, &b).rating().unwrap();
        assert!(rating.diff > 0.9);
    }
}
