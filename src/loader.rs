//! Loads patch stacks and upstream history out of a git repository: one
//! revwalk per configured rev range, one `Patch` per non-merge commit.

use std::path::Path;

use git2::{Commit, DiffOptions, Repository, Sort};
use indicatif::ProgressBar;
use regex::Regex;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{Diff, Patch, PatchMap, PatchStack};

/// Tag lines carry process metadata, not patch content; they change freely
/// between stack versions and would poison the message similarity.
const TAG_LINES: &str = r"(?i)^(Signed-off-by|Acked-by|Link|CC|Reviewed-by|Reported-by|Tested-by|Suggested-by|Fixes|Patchwork|From|Commit|Author|AuthorDate|Committer|CommitDate|Merge|Gitweb):";

pub struct Loader<'a> {
    cfg: &'a Config,
    repo: Repository,
    tag_lines: Regex,
}

impl<'a> Loader<'a> {
    pub fn open(cfg: &'a Config) -> Result<Self> {
        let repo = Repository::open(&cfg.paths.repo)?;
        log::debug!("opened repository at {}", cfg.paths.repo.display());
        Ok(Loader {
            cfg,
            repo,
            tag_lines: Regex::new(TAG_LINES).expect("tag line pattern is valid"),
        })
    }

    pub fn open_at(cfg: &'a Config, path: &Path) -> Result<Self> {
        let repo = Repository::open(path)?;
        Ok(Loader {
            cfg,
            repo,
            tag_lines: Regex::new(TAG_LINES).expect("tag line pattern is valid"),
        })
    }

    /// Load one named stack snapshot from the config.
    pub fn load_stack(&self, name: &str) -> Result<(PatchStack, Vec<Patch>)> {
        let range = self
            .cfg
            .stacks
            .get(name)
            .ok_or_else(|| Error::UnknownStack(name.to_string()))?;
        let patches = self.load_range(range, Some(name))?;
        let stack = PatchStack {
            name: name.to_string(),
            patches: patches.iter().map(|p| p.id.clone()).collect(),
        };
        Ok((stack, patches))
    }

    /// Load every configured stack into one universe.
    pub fn load_all_stacks(&self) -> Result<(Vec<PatchStack>, PatchMap)> {
        let mut stacks = Vec::new();
        let mut universe = PatchMap::new();
        for name in self.cfg.stacks.keys() {
            let (stack, patches) = self.load_stack(name)?;
            for patch in patches {
                universe.entry(patch.id.clone()).or_insert(patch);
            }
            stacks.push(stack);
        }
        log::info!(
            "loaded {} stacks, {} distinct patches",
            stacks.len(),
            universe.len()
        );
        Ok((stacks, universe))
    }

    /// Load the upstream history configured as `upstream`.
    pub fn load_upstream(&self) -> Result<Vec<Patch>> {
        let range = self.cfg.upstream.as_deref().ok_or(Error::NoUpstream)?;
        let patches = self.load_range(range, None)?;
        log::info!("loaded {} upstream commits", patches.len());
        Ok(patches)
    }

    /// Walk a rev range (`base..tip`, or a single rev for the full history
    /// below it) and parse each commit into a Patch, oldest first.
    /// Malformed commits are skipped with a warning, never fatal.
    pub fn load_range(&self, range: &str, stack: Option<&str>) -> Result<Vec<Patch>> {
        let mut revwalk = self.repo.revwalk()?;
        revwalk.set_sorting(Sort::TIME | Sort::REVERSE)?;
        if let Some((base, tip)) = range.split_once("..") {
            revwalk.push(self.repo.revparse_single(tip)?.id())?;
            revwalk.hide(self.repo.revparse_single(base)?.id())?;
        } else {
            revwalk.push(self.repo.revparse_single(range)?.id())?;
        }

        let oids: Vec<git2::Oid> = revwalk.collect::<std::result::Result<_, _>>()?;
        let bar = ProgressBar::new(oids.len() as u64);
        bar.set_message(format!("Parsing {}", stack.unwrap_or(range)));

        let mut patches = Vec::new();
        for oid in oids {
            bar.inc(1);
            let commit = self.repo.find_commit(oid)?;
            if commit.parent_count() > 1 {
                log::debug!("skipping merge commit {}", oid);
                continue;
            }
            match self.parse_commit(&commit, stack) {
                Ok(patch) => patches.push(patch),
                Err(Error::MalformedPatch { commit, reason }) => {
                    log::warn!("skipping malformed patch {}: {}", commit, reason);
                }
                Err(e) => return Err(e),
            }
        }
        bar.finish_and_clear();
        Ok(patches)
    }

    fn parse_commit(&self, commit: &Commit, stack: Option<&str>) -> Result<Patch> {
        let malformed = |reason: &str| Error::MalformedPatch {
            commit: commit.id().to_string(),
            reason: reason.to_string(),
        };

        let raw = commit.message().ok_or_else(|| malformed("non-utf8 message"))?;
        let message = self.normalize_message(raw);
        if message.is_empty() {
            return Err(malformed("empty message"));
        }

        let parent_tree = match commit.parent_count() {
            0 => None,
            _ => Some(commit.parent(0)?.tree()?),
        };
        let tree = commit.tree()?;

        let mut diff_opts = DiffOptions::new();
        diff_opts.ignore_filemode(true).context_lines(0);
        let git_diff = self.repo.diff_tree_to_tree(
            parent_tree.as_ref(),
            Some(&tree),
            Some(&mut diff_opts),
        )?;

        let mut diff = Diff::default();
        git_diff.foreach(
            &mut |_, _| true,
            None,
            None,
            Some(&mut |delta, hunk, line| {
                let path = delta
                    .new_file()
                    .path()
                    .or_else(|| delta.old_file().path())
                    .and_then(Path::to_str);
                let (path, hunk) = match (path, hunk) {
                    (Some(p), Some(h)) => (p, h),
                    _ => return true,
                };
                let heading = hunk_heading(hunk.header());
                match line.origin() {
                    '+' | '-' => {
                        let content = String::from_utf8_lossy(line.content())
                            .trim_end_matches('\n')
                            .to_string();
                        diff.add_line(path, &heading, line.origin() == '+', content);
                    }
                    _ => {}
                }
                true
            }),
        )?;

        let author = commit.author();
        Ok(Patch::new(
            author.name().unwrap_or("Unknown"),
            author.email().unwrap_or(""),
            author.when().seconds(),
            message,
            diff,
            stack.map(str::to_string),
            Some(commit.id().to_string()),
        ))
    }

    pub fn normalize_message(&self, raw: &str) -> Vec<String> {
        normalize_message(&self.tag_lines, raw)
    }
}

/// Split the raw commit message into lines, dropping empty lines and tag
/// lines. A subject duplicated as the first body line is collapsed. If
/// filtering would leave nothing, the unfiltered lines are kept so a
/// tags-only message still has a subject.
fn normalize_message(tag_lines: &Regex, raw: &str) -> Vec<String> {
    let lines: Vec<String> = raw
        .lines()
        .map(|l| l.trim_end().to_string())
        .filter(|l| !l.is_empty())
        .collect();

    let mut filtered: Vec<String> = lines
        .iter()
        .filter(|l| !tag_lines.is_match(l))
        .cloned()
        .collect();

    if filtered.len() > 1 && filtered[0] == filtered[1] {
        filtered.remove(0);
    }

    if filtered.is_empty() {
        lines
    } else {
        filtered
    }
}

/// The heading of a hunk is the context text after the second `@@` of its
/// header, with the line-number ranges stripped. Two versions of the same
/// change shifted by context edits keep the same heading.
fn hunk_heading(header: &[u8]) -> String {
    let header = String::from_utf8_lossy(header);
    match header.rfind("@@") {
        Some(pos) => header[pos + 2..].trim().to_string(),
        None => header.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_re() -> Regex {
        Regex::new(TAG_LINES).unwrap()
    }

    #[test]
    fn heading_strips_line_numbers() {
        assert_eq!(
            hunk_heading(b"@@ -10,3 +10,4 @@ static int foo(void)"),
            "static int foo(void)"
        );
        assert_eq!(hunk_heading(b"@@ -1,2 +1,2 @@"), "");
    }

    #[test]
    fn shifted_hunks_share_a_heading() {
        assert_eq!(
            hunk_heading(b"@@ -10,3 +10,3 @@ static int foo(void)"),
            hunk_heading(b"@@ -12,3 +13,4 @@ static int foo(void)"),
        );
    }

    #[test]
    fn message_normalization_filters_tags_and_blanks() {
        let message = normalize_message(
            &tag_re(),
            "fix null check\n\nGuard against NULL pointers.\n\nSigned-off-by: A <a@example.com>\nReviewed-by: B <b@example.com>\n",
        );
        assert_eq!(
            message,
            vec!["fix null check", "Guard against NULL pointers."]
        );
    }

    #[test]
    fn duplicated_subject_is_collapsed() {
        let message = normalize_message(&tag_re(), "fix thing\n\nfix thing\n\nbody\n");
        assert_eq!(message, vec!["fix thing", "body"]);
    }

    #[test]
    fn tags_only_message_keeps_its_lines() {
        let message = normalize_message(&tag_re(), "Fixes: deadbeef (\"old change\")\n");
        assert_eq!(message.len(), 1);
    }
}
