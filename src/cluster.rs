//! Equivalence classes over patch ids, backed by an arena union-find:
//! interned ids with parent/rank vectors instead of pointer-linked nodes.
//! The structure is purely mechanical; merge policy lives in the engine.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{PatchId, PatchMap};

const STATE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Default)]
pub struct Cluster {
    ids: Vec<PatchId>,
    index: HashMap<PatchId, usize>,
    parent: Vec<usize>,
    rank: Vec<u8>,
    /// Members known to be integrated upstream.
    tagged: Vec<bool>,
    /// Members whose every candidate comparison came back unknown.
    unrated: Vec<bool>,
}

impl Cluster {
    pub fn new() -> Self {
        Cluster::default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &PatchId) -> bool {
        self.index.contains_key(id)
    }

    pub fn members(&self) -> impl Iterator<Item = &PatchId> {
        self.ids.iter()
    }

    /// Intern a patch id as its own singleton class. Idempotent.
    pub fn insert(&mut self, id: &PatchId) -> usize {
        if let Some(&i) = self.index.get(id) {
            return i;
        }
        let i = self.ids.len();
        self.ids.push(id.clone());
        self.index.insert(id.clone(), i);
        self.parent.push(i);
        self.rank.push(0);
        self.tagged.push(false);
        self.unrated.push(false);
        i
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            // Path halving.
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn root_of(&self, mut i: usize) -> usize {
        while self.parent[i] != i {
            i = self.parent[i];
        }
        i
    }

    /// Merge the classes of two ids, inserting either if unknown.
    pub fn union(&mut self, a: &PatchId, b: &PatchId) {
        let ia = self.insert(a);
        let ib = self.insert(b);
        let ra = self.find(ia);
        let rb = self.find(ib);
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }

    pub fn is_related(&self, a: &PatchId, b: &PatchId) -> bool {
        match (self.index.get(a), self.index.get(b)) {
            (Some(&ia), Some(&ib)) => self.root_of(ia) == self.root_of(ib),
            _ => false,
        }
    }

    pub fn tag(&mut self, id: &PatchId) {
        let i = self.insert(id);
        self.tagged[i] = true;
    }

    pub fn is_tagged(&self, id: &PatchId) -> bool {
        self.index.get(id).map_or(false, |&i| self.tagged[i])
    }

    pub fn mark_unrated(&mut self, id: &PatchId) {
        let i = self.insert(id);
        self.unrated[i] = true;
    }

    pub fn clear_unrated(&mut self, id: &PatchId) {
        if let Some(&i) = self.index.get(id) {
            self.unrated[i] = false;
        }
    }

    pub fn is_unrated(&self, id: &PatchId) -> bool {
        self.index.get(id).map_or(false, |&i| self.unrated[i])
    }

    /// The full partition, deterministically ordered: members sorted
    /// within each class, classes sorted by their first member.
    pub fn classes(&self) -> Vec<Vec<PatchId>> {
        let mut by_root: HashMap<usize, Vec<PatchId>> = HashMap::new();
        for i in 0..self.ids.len() {
            by_root
                .entry(self.root_of(i))
                .or_default()
                .push(self.ids[i].clone());
        }
        let mut classes: Vec<Vec<PatchId>> = by_root.into_values().collect();
        for class in &mut classes {
            class.sort();
        }
        classes.sort();
        classes
    }

    /// The class containing `id`, sorted, or None if the id is unknown.
    pub fn class_of(&self, id: &PatchId) -> Option<Vec<PatchId>> {
        let &i = self.index.get(id)?;
        let root = self.root_of(i);
        let mut class: Vec<PatchId> = (0..self.ids.len())
            .filter(|&j| self.root_of(j) == root)
            .map(|j| self.ids[j].clone())
            .collect();
        class.sort();
        Some(class)
    }

    /// Earliest-authored member of a class; ties break on the id.
    pub fn representative(class: &[PatchId], patches: &PatchMap) -> PatchId {
        class
            .iter()
            .min_by_key(|id| {
                patches
                    .get(id)
                    .map(|p| (p.author_date, (*id).clone()))
                    .unwrap_or((i64::MAX, (*id).clone()))
            })
            .cloned()
            .unwrap_or_else(|| PatchId(String::new()))
    }

    pub fn to_state(&self, policy_fingerprint: String) -> ClusterState {
        let classes = self
            .classes()
            .into_iter()
            .map(|members| {
                let tagged = members.iter().filter(|m| self.is_tagged(m)).cloned().collect();
                let unrated = members.iter().filter(|m| self.is_unrated(m)).cloned().collect();
                ClassState {
                    members,
                    tagged,
                    unrated,
                }
            })
            .collect();
        ClusterState {
            version: STATE_FORMAT_VERSION,
            policy_fingerprint,
            classes,
        }
    }

    pub fn from_state(state: &ClusterState) -> Self {
        let mut cluster = Cluster::new();
        for class in &state.classes {
            let mut iter = class.members.iter();
            if let Some(first) = iter.next() {
                cluster.insert(first);
                for member in iter {
                    cluster.union(first, member);
                }
            }
            for id in &class.tagged {
                cluster.tag(id);
            }
            for id in &class.unrated {
                cluster.mark_unrated(id);
            }
        }
        cluster
    }
}

/// One persisted equivalence class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassState {
    pub members: Vec<PatchId>,
    #[serde(default)]
    pub tagged: Vec<PatchId>,
    #[serde(default)]
    pub unrated: Vec<PatchId>,
}

/// Persisted form of the partition. Derived state: cheap to throw away
/// (rip-up), unlike the comparison cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterState {
    pub version: u32,
    /// Fingerprint of the merge policy these classes were built under.
    pub policy_fingerprint: String,
    pub classes: Vec<ClassState>,
}

impl ClusterState {
    pub fn load(path: &Path) -> Result<Option<ClusterState>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        let state: ClusterState = serde_json::from_str(&raw)
            .map_err(|e| Error::CacheCorruption(format!("{}: {}", path.display(), e)))?;
        if state.version != STATE_FORMAT_VERSION {
            return Err(Error::CacheCorruption(format!(
                "unsupported cluster state version {}",
                state.version
            )));
        }
        Ok(Some(state))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn all_members(&self) -> BTreeSet<PatchId> {
        self.classes
            .iter()
            .flat_map(|c| c.members.iter().cloned())
            .collect()
    }
}

/// Difference between two partitions, as reported by `compare-clusters`.
#[derive(Debug, Default)]
pub struct PartitionDiff {
    pub unchanged: usize,
    /// Classes present only in the newer partition.
    pub added: Vec<Vec<PatchId>>,
    /// Classes present only in the older partition.
    pub removed: Vec<Vec<PatchId>>,
    /// Classes sharing members but differing: (old members, new members).
    pub changed: Vec<(Vec<PatchId>, Vec<PatchId>)>,
}

/// Diff two persisted partitions. A new class is matched to the old class
/// it overlaps most; identical member sets count as unchanged.
pub fn diff_partitions(old: &ClusterState, new: &ClusterState) -> PartitionDiff {
    let old_sets: Vec<BTreeSet<PatchId>> = old
        .classes
        .iter()
        .map(|c| c.members.iter().cloned().collect())
        .collect();
    let mut consumed = vec![false; old_sets.len()];
    let mut diff = PartitionDiff::default();

    for class in &new.classes {
        let new_set: BTreeSet<PatchId> = class.members.iter().cloned().collect();
        let mut best: Option<(usize, usize)> = None;
        for (i, old_set) in old_sets.iter().enumerate() {
            if consumed[i] {
                continue;
            }
            let overlap = old_set.intersection(&new_set).count();
            if overlap > 0 && best.map_or(true, |(_, b)| overlap > b) {
                best = Some((i, overlap));
            }
        }
        match best {
            Some((i, _)) if old_sets[i] == new_set => {
                consumed[i] = true;
                diff.unchanged += 1;
            }
            Some((i, _)) => {
                consumed[i] = true;
                diff.changed
                    .push((old.classes[i].members.clone(), class.members.clone()));
            }
            None => diff.added.push(class.members.clone()),
        }
    }

    for (i, class) in old.classes.iter().enumerate() {
        if !consumed[i] {
            diff.removed.push(class.members.clone());
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn id(s: &str) -> PatchId {
        PatchId(s.to_string())
    }

    #[test]
    fn every_member_is_in_exactly_one_class() {
        let mut cluster = Cluster::new();
        let ids: Vec<PatchId> = (0..6).map(|i| id(&format!("p{}", i))).collect();
        for p in &ids {
            cluster.insert(p);
        }
        cluster.union(&ids[0], &ids[1]);
        cluster.union(&ids[1], &ids[2]);
        cluster.union(&ids[4], &ids[5]);

        let classes = cluster.classes();
        let total: usize = classes.iter().map(Vec::len).sum();
        assert_eq!(total, ids.len());
        let mut seen = BTreeSet::new();
        for class in &classes {
            for member in class {
                assert!(seen.insert(member.clone()), "{} in two classes", member);
            }
        }
    }

    #[test]
    fn union_is_transitive() {
        let mut cluster = Cluster::new();
        cluster.union(&id("a"), &id("b"));
        cluster.union(&id("b"), &id("c"));
        assert!(cluster.is_related(&id("a"), &id("c")));
        assert!(!cluster.is_related(&id("a"), &id("d")));
    }

    #[test]
    fn state_round_trip_preserves_partition_and_marks() {
        let mut cluster = Cluster::new();
        cluster.union(&id("a"), &id("b"));
        cluster.insert(&id("c"));
        cluster.tag(&id("b"));
        cluster.mark_unrated(&id("c"));

        let state = cluster.to_state("fp".into());
        let restored = Cluster::from_state(&state);
        assert_eq!(restored.classes(), cluster.classes());
        assert!(restored.is_tagged(&id("b")));
        assert!(!restored.is_tagged(&id("a")));
        assert!(restored.is_unrated(&id("c")));
    }

    #[test]
    fn state_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusters.json");
        let mut cluster = Cluster::new();
        cluster.union(&id("a"), &id("b"));
        cluster.to_state("fp".into()).save(&path).unwrap();

        let loaded = ClusterState::load(&path).unwrap().unwrap();
        assert_eq!(loaded.policy_fingerprint, "fp");
        assert_eq!(loaded.classes.len(), 1);
        assert_eq!(loaded.classes[0].members, vec![id("a"), id("b")]);
    }

    #[test]
    fn partition_diff_classifies_changes() {
        let mut old = Cluster::new();
        old.union(&id("a"), &id("b"));
        old.union(&id("c"), &id("d"));
        old.insert(&id("e"));
        let old = old.to_state("fp".into());

        let mut new = Cluster::new();
        new.union(&id("a"), &id("b"));
        new.union(&id("c"), &id("d"));
        new.union(&id("c"), &id("x"));
        new.insert(&id("y"));
        let new = new.to_state("fp".into());

        let diff = diff_partitions(&old, &new);
        assert_eq!(diff.unchanged, 1); // {a,b}
        assert_eq!(diff.changed, vec![(
            vec![id("c"), id("d")],
            vec![id("c"), id("d"), id("x")],
        )]);
        assert_eq!(diff.added, vec![vec![id("y")]]);
        assert_eq!(diff.removed, vec![vec![id("e")]]);
    }
}
