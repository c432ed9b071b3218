//! The coordinating path of the clustering engine: candidate-pair
//! selection, cache-backed rating, sequential union application, the
//! chain-artifact optimisation pass, and incremental maintenance. Only the
//! rating computations run in parallel (inside the cache); every merge and
//! split decision happens on this single path, so the partition is
//! deterministic for a fixed cache and threshold.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::cache::ComparisonCache;
use crate::cluster::{Cluster, ClusterState};
use crate::config::Config;
use crate::error::Result;
use crate::model::{PairKey, PatchId, PatchMap, PatchStack, Verdict};
use crate::rater;

pub struct Engine<'a> {
    cfg: &'a Config,
    pub patches: PatchMap,
    pub cache: ComparisonCache,
    cluster: Cluster,
}

#[derive(Debug, Default)]
pub struct UpdateStats {
    pub added: usize,
    pub removed: usize,
    pub invalidated_comparisons: usize,
    pub classes: usize,
}

#[derive(Debug)]
pub struct StackComparison {
    pub matched: Vec<(PatchId, PatchId)>,
    pub only_left: Vec<PatchId>,
    pub only_right: Vec<PatchId>,
}

impl<'a> Engine<'a> {
    /// Open the engine over a loaded universe, restoring the comparison
    /// cache and the persisted partition. A partition built under a
    /// different merge policy is ripped up; the policy fingerprint covers
    /// the rater constants, so a rater change discards both cache and
    /// partition, while a threshold or window change keeps the cache.
    pub fn open(cfg: &'a Config, patches: PatchMap) -> Result<Self> {
        let cache = ComparisonCache::open(&cfg.cache_path(), cfg.rater_fingerprint())?;
        let cluster = match ClusterState::load(&cfg.cluster_path())? {
            Some(state) if state.policy_fingerprint == cfg.cluster_fingerprint() => {
                Cluster::from_state(&state)
            }
            Some(_) => {
                log::warn!("merge policy changed, ripping up derived cluster state");
                Cluster::new()
            }
            None => Cluster::new(),
        };
        Ok(Engine {
            cfg,
            patches,
            cache,
            cluster,
        })
    }

    /// An engine with no persisted partition, for ad-hoc comparisons. The
    /// comparison cache is still the shared persistent one.
    pub fn ephemeral(cfg: &'a Config, patches: PatchMap) -> Result<Self> {
        let cache = ComparisonCache::open(&cfg.cache_path(), cfg.rater_fingerprint())?;
        Ok(Engine {
            cfg,
            patches,
            cache,
            cluster: Cluster::new(),
        })
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn rate_pair(&mut self, a: &PatchId, b: &PatchId) -> Result<Verdict> {
        self.cache.get_or_compute(&self.cfg.rater, &self.patches, a, b)
    }

    /// Candidate-pair policy: two patches are worth rating only if their
    /// diffs overlap in file paths (fuzzily, unless the filename threshold
    /// demands exact matches), their author dates fall within the
    /// configured window, and their revert flags agree. Everything else is
    /// assumed non-equivalent without being rated; this bound is what
    /// keeps the engine off the full O(n^2) sweep.
    pub fn candidate_pairs(
        &self,
        left: &[PatchId],
        right: &[PatchId],
        window_days: Option<u64>,
    ) -> Vec<(PatchId, PatchId)> {
        let window = window_days.unwrap_or(self.cfg.window_days);
        let window_secs = window.checked_mul(86_400).unwrap_or(0) as i64;

        let left_files = self.file_map(left);
        let right_files = self.file_map(right);

        let mut pairs: BTreeSet<PairKey> = BTreeSet::new();
        for (l_file, l_ids) in &left_files {
            for (r_file, r_ids) in &right_files {
                let file_match = if self.cfg.rater.filename_threshold >= 1.0 {
                    l_file == r_file
                } else {
                    l_file == r_file
                        || rater::token_sort_ratio(l_file, r_file)
                            >= self.cfg.rater.filename_threshold
                };
                if !file_match {
                    continue;
                }
                for l_id in l_ids {
                    for r_id in r_ids {
                        if l_id == r_id {
                            continue;
                        }
                        let (pl, pr) = match (self.patches.get(l_id), self.patches.get(r_id)) {
                            (Some(a), Some(b)) => (a, b),
                            _ => continue,
                        };
                        if pl.is_revert != pr.is_revert {
                            continue;
                        }
                        if window_secs > 0
                            && (pl.author_date - pr.author_date).abs() > window_secs
                        {
                            continue;
                        }
                        pairs.insert(PairKey::new(l_id, r_id));
                    }
                }
            }
        }
        pairs.into_iter().map(|k| (k.a, k.b)).collect()
    }

    fn file_map<'b>(&'b self, ids: &[PatchId]) -> HashMap<&'b str, Vec<PatchId>> {
        let mut map: HashMap<&str, Vec<PatchId>> = HashMap::new();
        for id in ids {
            if let Some(patch) = self.patches.get(id) {
                for file in patch.diff.affected_files() {
                    map.entry(file.as_str()).or_default().push(id.clone());
                }
            }
        }
        map
    }

    pub fn threshold(&self) -> f64 {
        self.cfg.equivalence_threshold
    }

    /// Rate a batch of pairs on the worker pool, filling the cache.
    pub fn rate_pairs(&mut self, pairs: &[(PatchId, PatchId)]) -> Result<()> {
        self.cache.rate_all(&self.cfg.rater, &self.patches, pairs)
    }

    /// Combined score of a pair, through the cache. `None` for unknown
    /// verdicts or when either patch's content is not loaded.
    pub fn score(&mut self, a: &PatchId, b: &PatchId) -> Result<Option<f64>> {
        let weight = self.cfg.rater.message_diff_weight;
        if let Some(verdict) = self.cache.get(a, b) {
            return Ok(verdict.combined(weight));
        }
        if !self.patches.contains_key(a) || !self.patches.contains_key(b) {
            return Ok(None);
        }
        Ok(self
            .cache
            .get_or_compute(&self.cfg.rater, &self.patches, a, b)?
            .combined(weight))
    }

    /// Full build of the partition from the current universe. Existing
    /// cluster state is discarded; the cache is reused.
    pub fn build(&mut self) -> Result<()> {
        self.cluster = Cluster::new();
        let mut ids: Vec<PatchId> = self.patches.keys().cloned().collect();
        ids.sort();
        for id in &ids {
            self.cluster.insert(id);
        }

        let pairs = self.candidate_pairs(&ids, &ids, None);
        log::info!(
            "clustering {} patches over {} candidate pairs",
            ids.len(),
            pairs.len()
        );
        self.cache.rate_all(&self.cfg.rater, &self.patches, &pairs)?;
        self.apply_pairs(&pairs)?;
        self.optimise_classes(self.cluster.classes())?;
        Ok(())
    }

    /// Union every rated pair that reaches the threshold and flag patches
    /// whose every candidate comparison came back unknown.
    fn apply_pairs(&mut self, pairs: &[(PatchId, PatchId)]) -> Result<()> {
        let threshold = self.cfg.equivalence_threshold;
        let mut candidates: HashMap<PatchId, usize> = HashMap::new();
        let mut rated: HashSet<PatchId> = HashSet::new();

        for (a, b) in pairs {
            *candidates.entry(a.clone()).or_default() += 1;
            *candidates.entry(b.clone()).or_default() += 1;
            match self.cache.get_or_compute(&self.cfg.rater, &self.patches, a, b)? {
                Verdict::Rated { rating } => {
                    rated.insert(a.clone());
                    rated.insert(b.clone());
                    if rating.combined(self.cfg.rater.message_diff_weight) >= threshold {
                        self.cluster.union(a, b);
                    }
                }
                Verdict::Unknown { .. } => {}
            }
        }

        // A rated comparison supersedes an unrated mark carried over from
        // an earlier run.
        for id in &rated {
            self.cluster.clear_unrated(id);
        }
        for (id, _) in candidates {
            let still_singleton = self
                .cluster
                .class_of(&id)
                .map_or(true, |c| c.len() == 1);
            if !rated.contains(&id) && still_singleton {
                log::debug!("patch {} has only unknown comparisons", id.short());
                self.cluster.mark_unrated(&id);
            }
        }
        Ok(())
    }

    /// Incremental maintenance against the persisted partition: invalidate
    /// and re-evaluate what the removed patches touched, rate and merge the
    /// added ones, and optimise only the classes that changed. Classes the
    /// update does not touch are never re-scanned.
    pub fn update(&mut self) -> Result<UpdateStats> {
        let mut stats = UpdateStats::default();

        let known: Vec<PatchId> = self.cluster.members().cloned().collect();
        let removed: Vec<PatchId> = known
            .iter()
            .filter(|id| !self.patches.contains_key(id) && !self.cluster.is_tagged(id))
            .cloned()
            .collect();
        let added: Vec<PatchId> = {
            let mut v: Vec<PatchId> = self
                .patches
                .keys()
                .filter(|id| !self.cluster.contains(id))
                .cloned()
                .collect();
            v.sort();
            v
        };
        stats.removed = removed.len();
        stats.added = added.len();

        // Retire removed patches: drop their comparisons and re-evaluate
        // the classes they held together.
        let removed_set: HashSet<&PatchId> = removed.iter().collect();
        let mut touched_classes: Vec<Vec<PatchId>> = Vec::new();
        let mut untouched: Vec<Vec<PatchId>> = Vec::new();
        for class in self.cluster.classes() {
            if class.iter().any(|m| removed_set.contains(m)) {
                let survivors: Vec<PatchId> = class
                    .into_iter()
                    .filter(|m| !removed_set.contains(m))
                    .collect();
                if !survivors.is_empty() {
                    touched_classes.push(survivors);
                }
            } else {
                untouched.push(class);
            }
        }
        for id in &removed {
            stats.invalidated_comparisons += self.cache.invalidate(id);
        }

        // A class that lost a member may have been held together by it;
        // re-split the survivors along their actual score edges.
        let mut rebuilt = untouched;
        for survivors in touched_classes {
            rebuilt.extend(self.connected_components(survivors)?);
        }
        self.rebuild(rebuilt);

        // Fold in the new patches.
        let mut universe: Vec<PatchId> = self.patches.keys().cloned().collect();
        universe.sort();
        for id in &added {
            self.cluster.insert(id);
        }
        if !added.is_empty() {
            let pairs = self.candidate_pairs(&added, &universe, None);
            self.cache.rate_all(&self.cfg.rater, &self.patches, &pairs)?;
            self.apply_pairs(&pairs)?;

            // Local optimisation, restricted to classes an addition grew.
            let added_set: HashSet<&PatchId> = added.iter().collect();
            let grown: Vec<Vec<PatchId>> = self
                .cluster
                .classes()
                .into_iter()
                .filter(|c| c.len() > 2 && c.iter().any(|m| added_set.contains(m)))
                .collect();
            self.optimise_classes(grown)?;
        }

        stats.classes = self.cluster.classes().len();
        log::info!(
            "update: {} added, {} removed, {} comparisons invalidated, {} classes",
            stats.added,
            stats.removed,
            stats.invalidated_comparisons,
            stats.classes
        );
        Ok(stats)
    }

    /// Forced rebuild of derived state. Keeps the comparison cache unless
    /// `cold`, which is reserved for corpus integrity repair.
    pub fn ripup(&mut self, cold: bool) -> Result<()> {
        if cold {
            log::warn!("cold rebuild: clearing the comparison cache");
            self.cache.clear();
        }
        self.cluster = Cluster::new();
        self.build()
    }

    /// Run the optimisation pass on the class containing `id`. Returns the
    /// resulting class sizes (original class, then any split-off parts).
    pub fn optimise_class(&mut self, id: &PatchId) -> Result<Vec<Vec<PatchId>>> {
        let class = self
            .cluster
            .class_of(id)
            .ok_or_else(|| crate::error::Error::UnknownPatch(id.to_string()))?;
        self.optimise_classes(vec![class.clone()])?;
        let mut result = vec![self.cluster.class_of(id).unwrap_or_default()];
        for member in &class {
            if !self.cluster.is_related(id, member) {
                if let Some(split) = self.cluster.class_of(member) {
                    if !result.contains(&split) {
                        result.push(split);
                    }
                }
            }
        }
        Ok(result)
    }

    /// Chain-artifact repair: single-linkage merging can chain A~B~C with A
    /// and C dissimilar. Detach every member of an oversized class whose
    /// best in-class similarity is under threshold, then reattach it to the
    /// class it actually fits, or leave it a singleton.
    fn optimise_classes(&mut self, classes: Vec<Vec<PatchId>>) -> Result<usize> {
        let threshold = self.cfg.equivalence_threshold;
        let targets: HashSet<Vec<PatchId>> = classes.into_iter().collect();
        let mut detached: Vec<PatchId> = Vec::new();
        let mut rebuilt: Vec<Vec<PatchId>> = Vec::new();

        for class in self.cluster.classes() {
            if !targets.contains(&class) || class.len() <= 2 {
                rebuilt.push(class);
                continue;
            }
            let mut members = class;
            loop {
                let mut dropped = Vec::new();
                let mut kept = Vec::new();
                for i in 0..members.len() {
                    let mut best: Option<f64> = None;
                    for j in 0..members.len() {
                        if i == j {
                            continue;
                        }
                        if let Some(s) = self.score(&members[i], &members[j])? {
                            best = Some(best.map_or(s, |b: f64| b.max(s)));
                        }
                    }
                    if best.map_or(true, |b| b < threshold) {
                        dropped.push(members[i].clone());
                    } else {
                        kept.push(members[i].clone());
                    }
                }
                if dropped.is_empty() {
                    break;
                }
                detached.extend(dropped);
                members = kept;
                if members.len() <= 1 {
                    break;
                }
            }
            rebuilt.push(members);
        }

        let split_off = detached.len();
        for id in detached {
            let mut best: Option<(usize, f64)> = None;
            for (ci, class) in rebuilt.iter().enumerate() {
                for member in class {
                    if let Some(s) = self.score(&id, member)? {
                        if s >= threshold && best.map_or(true, |(_, b)| s > b) {
                            best = Some((ci, s));
                        }
                    }
                }
            }
            match best {
                Some((ci, _)) => rebuilt[ci].push(id),
                None => rebuilt.push(vec![id]),
            }
        }

        self.rebuild(rebuilt);
        if split_off > 0 {
            log::info!("optimisation detached {} chained members", split_off);
        }
        Ok(split_off)
    }

    /// Split a member list into connected components along score edges at
    /// or above the threshold.
    fn connected_components(&mut self, members: Vec<PatchId>) -> Result<Vec<Vec<PatchId>>> {
        if members.len() <= 1 {
            return Ok(vec![members]);
        }
        let mut scratch = Cluster::new();
        for m in &members {
            scratch.insert(m);
        }
        for i in 0..members.len() {
            for j in (i + 1)..members.len() {
                if let Some(s) = self.score(&members[i], &members[j])? {
                    if s >= self.cfg.equivalence_threshold {
                        scratch.union(&members[i], &members[j]);
                    }
                }
            }
        }
        Ok(scratch.classes())
    }

    /// Replace the partition with the given class lists, carrying the
    /// tagged/unrated marks over for members that survive.
    fn rebuild(&mut self, classes: Vec<Vec<PatchId>>) {
        let old = std::mem::take(&mut self.cluster);
        let mut new = Cluster::new();
        for class in &classes {
            let mut iter = class.iter();
            if let Some(first) = iter.next() {
                new.insert(first);
                for member in iter {
                    new.union(first, member);
                }
            }
        }
        for id in old.members() {
            if !new.contains(id) {
                continue;
            }
            if old.is_tagged(id) {
                new.tag(id);
            }
            if old.is_unrated(id) {
                new.mark_unrated(id);
            }
        }
        self.cluster = new;
    }

    /// Report which patches of two stacks found an equivalent on the other
    /// side, after a build over their combined universe.
    pub fn compare_stacks(&self, left: &PatchStack, right: &PatchStack) -> StackComparison {
        let mut matched = Vec::new();
        let mut only_left = Vec::new();
        let mut matched_right: HashSet<&PatchId> = HashSet::new();

        for l in &left.patches {
            let partner = right
                .patches
                .iter()
                .find(|r| self.cluster.is_related(l, r));
            match partner {
                Some(r) => {
                    matched_right.insert(r);
                    matched.push((l.clone(), r.clone()));
                }
                None => only_left.push(l.clone()),
            }
        }
        let only_right = right
            .patches
            .iter()
            .filter(|r| !matched_right.contains(r))
            .cloned()
            .collect();
        StackComparison {
            matched,
            only_left,
            only_right,
        }
    }

    /// Persist both the cache and the partition.
    pub fn save(&mut self) -> Result<()> {
        self.save_cache()?;
        self.cluster
            .to_state(self.cfg.cluster_fingerprint())
            .save(&self.cfg.cluster_path())
    }

    /// Persist only the cache; used by ad-hoc commands that must not
    /// overwrite the maintained partition.
    pub fn save_cache(&mut self) -> Result<()> {
        self.cache.save()
    }

    pub fn cluster_mut(&mut self) -> &mut Cluster {
        &mut self.cluster
    }
}
