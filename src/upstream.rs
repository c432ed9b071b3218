//! Resolves each equivalence class against the upstream history: did any
//! member get integrated, and when? A matched upstream commit is merged
//! into at most one class and tagged; further classes it satisfies are
//! annotated without being restructured. The timeline itself is derived
//! state and is recomputed on every run.

use std::collections::HashMap;

use crate::engine::Engine;
use crate::error::Result;
use crate::model::{Patch, PatchId, UpstreamEntry};

/// Upstream status of one equivalence class.
#[derive(Debug, Clone)]
pub struct ClassTimeline {
    /// Earliest-authored stack-side member.
    pub representative: PatchId,
    /// Stack-side (untagged) members.
    pub members: Vec<PatchId>,
    /// Author date of the earliest stack-side member.
    pub first_authored: i64,
    /// Earliest matching upstream commit, or None if not yet upstream.
    pub entry: Option<UpstreamEntry>,
}

impl ClassTimeline {
    /// Seconds from the first authored version to upstream integration.
    pub fn duration_secs(&self) -> Option<i64> {
        self.entry
            .as_ref()
            .map(|e| e.integrated_at - self.first_authored)
    }
}

/// Match the current classes against the upstream history and produce one
/// timeline entry per class that has stack-side members. Matching uses the
/// same rating contract as stack clustering, but without the time-window
/// bound: integration may happen long after a patch was written.
pub fn resolve(engine: &mut Engine, upstream: &[Patch]) -> Result<Vec<ClassTimeline>> {
    // Integration facts keyed by content id; kept separately because an
    // upstream commit may be byte-identical to a stack patch and then
    // shares its id.
    let upstream_info: HashMap<PatchId, UpstreamEntry> = upstream
        .iter()
        .map(|p| {
            (
                p.id.clone(),
                UpstreamEntry {
                    commit: p.commit.clone().unwrap_or_else(|| p.id.to_string()),
                    integrated_at: p.author_date,
                },
            )
        })
        .collect();

    for patch in upstream {
        engine
            .patches
            .entry(patch.id.clone())
            .or_insert_with(|| patch.clone());
    }

    let mut stack_ids: Vec<PatchId> = engine
        .cluster()
        .members()
        .filter(|m| !engine.cluster().is_tagged(m))
        .cloned()
        .collect();
    stack_ids.sort();
    let mut upstream_ids: Vec<PatchId> = upstream_info.keys().cloned().collect();
    upstream_ids.sort();

    // An upstream commit with the same content id as a stack patch is
    // integrated by definition.
    let mut matches: Vec<(PatchId, PatchId)> = stack_ids
        .iter()
        .filter(|id| upstream_info.contains_key(id))
        .map(|id| (id.clone(), id.clone()))
        .collect();

    let pairs = engine.candidate_pairs(&stack_ids, &upstream_ids, Some(0));
    engine.rate_pairs(&pairs)?;
    let threshold = engine.threshold();
    for (a, b) in &pairs {
        if let Some(score) = engine.score(a, b)? {
            if score >= threshold {
                let (member, up) = if upstream_info.contains_key(b) {
                    (a.clone(), b.clone())
                } else {
                    (b.clone(), a.clone())
                };
                matches.push((member, up));
            }
        }
    }

    // Integration facts per stack member. Kept outside the cluster so a
    // match can annotate a class without restructuring it.
    let mut matched_entries: HashMap<PatchId, Vec<UpstreamEntry>> = HashMap::new();
    for (member, up) in &matches {
        if let Some(entry) = upstream_info.get(up) {
            matched_entries
                .entry(member.clone())
                .or_default()
                .push(entry.clone());
        }
        // One squashed upstream commit can satisfy two unrelated classes;
        // uniting it into both would merge them through it. The first
        // class absorbs the commit, later ones keep only the annotation.
        if engine.cluster().contains(up) && !engine.cluster().is_related(member, up) {
            log::debug!(
                "upstream commit {} already belongs to another class, not merging {}",
                up.short(),
                member.short()
            );
            continue;
        }
        engine.cluster_mut().union(member, up);
        engine.cluster_mut().tag(up);
    }
    log::info!(
        "upstream resolution matched {} pairs against {} upstream commits",
        matches.len(),
        upstream.len()
    );

    let stack_set: std::collections::HashSet<&PatchId> = stack_ids.iter().collect();
    let mut timelines = Vec::new();
    for class in engine.cluster().classes() {
        // An upstream commit byte-identical to a stack patch shares its
        // id, so a member can be stack-side and integrated at once.
        let stack_members: Vec<PatchId> = class
            .iter()
            .filter(|m| stack_set.contains(m))
            .cloned()
            .collect();
        if stack_members.is_empty() {
            continue;
        }

        let first_authored = stack_members
            .iter()
            .filter_map(|m| engine.patches.get(m).map(|p| p.author_date))
            .min();
        let first_authored = match first_authored {
            Some(t) => t,
            None => continue,
        };

        // Tagged members from an earlier run may fall outside the current
        // upstream range; they simply do not contribute a date this run.
        let entry = class
            .iter()
            .filter_map(|m| upstream_info.get(m))
            .cloned()
            .chain(
                class
                    .iter()
                    .filter_map(|m| matched_entries.get(m))
                    .flatten()
                    .cloned(),
            )
            .min_by_key(|e| e.integrated_at);

        let representative =
            crate::cluster::Cluster::representative(&stack_members, &engine.patches);
        timelines.push(ClassTimeline {
            representative,
            members: stack_members,
            first_authored,
            entry,
        });
    }
    timelines.sort_by(|a, b| {
        a.first_authored
            .cmp(&b.first_authored)
            .then_with(|| a.representative.cmp(&b.representative))
    });
    Ok(timelines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::testutil::patch;
    use crate::model::PatchMap;
    use pretty_assertions::assert_eq;

    const NULL_HUNK: (&str, &str, &[&str], &[&str]) = (
        "a.c",
        "static int foo(void)",
        &["if (ptr == NULL)", "        return -EINVAL;"],
        &["use(ptr);"],
    );

    fn universe(patches: &[crate::model::Patch]) -> PatchMap {
        patches
            .iter()
            .map(|p| (p.id.clone(), p.clone()))
            .collect()
    }

    #[test]
    fn reports_integration_time_and_duration() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.paths.state_dir = dir.path().to_path_buf();

        let p1 = patch(&["fix null check"], 1_000, &[NULL_HUNK]);
        let p2 = patch(&["add null guard"], 2_000, &[NULL_HUNK]);
        let p3 = patch(
            &["rework scheduler queue"],
            1_500,
            &[("b.c", "static void sched(void)", &["queue_push(q, t);"], &["run(t);"])],
        );
        let mut integrated = patch(&["add null guard to foo"], 50_000, &[NULL_HUNK]);
        integrated.commit = Some("cafe0001".to_string());

        let mut engine =
            Engine::open(&cfg, universe(&[p1.clone(), p2.clone(), p3.clone()])).unwrap();
        engine.build().unwrap();

        let timelines = resolve(&mut engine, &[integrated.clone()]).unwrap();
        assert_eq!(timelines.len(), 2);

        let guarded = &timelines[0];
        assert_eq!(guarded.representative, p1.id);
        assert_eq!(guarded.first_authored, 1_000);
        let entry = guarded.entry.as_ref().expect("class must be integrated");
        assert_eq!(entry.commit, "cafe0001");
        assert_eq!(entry.integrated_at, 50_000);
        assert_eq!(guarded.duration_secs(), Some(49_000));

        let scheduler = &timelines[1];
        assert_eq!(scheduler.representative, p3.id);
        assert!(scheduler.entry.is_none());
        assert_eq!(scheduler.duration_secs(), None);

        // Resolution tags, it never dissolves stack-side classes.
        assert!(engine.cluster().is_related(&p1.id, &p2.id));
        assert!(engine.cluster().is_tagged(&integrated.id));
    }

    #[test]
    fn squashed_upstream_commit_does_not_merge_distinct_classes() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.paths.state_dir = dir.path().to_path_buf();

        let pa = patch(
            &["add null guard"],
            1_000,
            &[("a.c", "foo()", &["if (!p) return;"], &[])],
        );
        let pb = patch(
            &["add overflow guard"],
            1_200,
            &[("b.c", "bar()", &["if (x > MAX) return;"], &[])],
        );
        // Upstream took both changes as one commit.
        let mut squashed = patch(
            &["add null and overflow guard"],
            9_000,
            &[
                ("a.c", "foo()", &["if (!p) return;"], &[]),
                ("b.c", "bar()", &["if (x > MAX) return;"], &[]),
            ],
        );
        squashed.commit = Some("cafe0003".to_string());

        let mut engine = Engine::open(&cfg, universe(&[pa.clone(), pb.clone()])).unwrap();
        engine.build().unwrap();

        let timelines = resolve(&mut engine, &[squashed]).unwrap();
        assert!(
            !engine.cluster().is_related(&pa.id, &pb.id),
            "unrelated changes must not merge through a shared upstream commit"
        );
        assert_eq!(timelines.len(), 2);
        for timeline in &timelines {
            let entry = timeline.entry.as_ref().expect("both classes integrated");
            assert_eq!(entry.commit, "cafe0003");
            assert_eq!(entry.integrated_at, 9_000);
        }
    }

    #[test]
    fn identical_upstream_commit_matches_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.paths.state_dir = dir.path().to_path_buf();

        let p1 = patch(&["fix null check"], 1_000, &[NULL_HUNK]);
        let mut integrated = patch(&["fix null check"], 9_000, &[NULL_HUNK]);
        integrated.commit = Some("cafe0002".to_string());
        assert_eq!(p1.id, integrated.id, "same content, same id");

        let mut engine = Engine::open(&cfg, universe(&[p1.clone()])).unwrap();
        engine.build().unwrap();
        let timelines = resolve(&mut engine, &[integrated]).unwrap();

        // The lone member is itself the integrated commit; the class still
        // surfaces with its integration time.
        assert_eq!(timelines.len(), 1);
        let entry = timelines[0].entry.as_ref().unwrap();
        assert_eq!(entry.integrated_at, 9_000);
    }
}
