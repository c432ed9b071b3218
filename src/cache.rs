//! Persistent memo of rater outputs. Comparisons scale quadratically with
//! the corpus, so the cache file is authoritative across runs: it is grown
//! and selectively pruned, never rebuilt wholesale except on an explicit
//! cold rip-up or when the rater policy itself changed.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use indicatif::{ParallelProgressIterator, ProgressBar};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::RaterConfig;
use crate::error::{Error, Result};
use crate::model::{PairKey, PatchId, PatchMap, Verdict};
use crate::rater;

const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedComparison {
    verdict: Verdict,
    computed_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    rater_fingerprint: String,
    entries: Vec<FileEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileEntry {
    a: PatchId,
    b: PatchId,
    verdict: Verdict,
    computed_at: i64,
}

pub struct ComparisonCache {
    path: PathBuf,
    rater_fingerprint: String,
    entries: HashMap<PairKey, CachedComparison>,
    dirty: bool,
    hits: u64,
    misses: u64,
}

impl ComparisonCache {
    /// Open the cache file, or start empty if it does not exist. A cache
    /// computed under different rater constants is discarded: its raw
    /// scores are stale. An unreadable or unparsable file is a corpus-wide
    /// integrity failure and is fatal.
    pub fn open(path: &Path, rater_fingerprint: String) -> Result<Self> {
        let mut cache = ComparisonCache {
            path: path.to_path_buf(),
            rater_fingerprint,
            entries: HashMap::new(),
            dirty: false,
            hits: 0,
            misses: 0,
        };

        if !path.exists() {
            log::debug!("no comparison cache at {}", path.display());
            return Ok(cache);
        }

        let raw = fs::read_to_string(path)?;
        let file: CacheFile = serde_json::from_str(&raw)
            .map_err(|e| Error::CacheCorruption(format!("{}: {}", path.display(), e)))?;

        if file.version != CACHE_FORMAT_VERSION {
            return Err(Error::CacheCorruption(format!(
                "unsupported cache format version {}",
                file.version
            )));
        }

        if file.rater_fingerprint != cache.rater_fingerprint {
            log::warn!("rater policy changed, discarding {} cached comparisons", file.entries.len());
            cache.dirty = true;
            return Ok(cache);
        }

        let mut dropped = 0usize;
        for entry in file.entries {
            // Entry-level corruption is recoverable: treat as a miss.
            let valid = match &entry.verdict {
                Verdict::Rated { rating } => rating.is_valid(),
                Verdict::Unknown { .. } => true,
            };
            if !valid {
                dropped += 1;
                continue;
            }
            cache.entries.insert(
                PairKey::new(&entry.a, &entry.b),
                CachedComparison {
                    verdict: entry.verdict,
                    computed_at: entry.computed_at,
                },
            );
        }
        if dropped > 0 {
            log::warn!("dropped {} corrupt cache entries, they will be recomputed", dropped);
            cache.dirty = true;
        }
        log::info!("loaded {} cached comparisons", cache.entries.len());
        Ok(cache)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ratings computed since the cache was opened.
    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn get(&self, a: &PatchId, b: &PatchId) -> Option<Verdict> {
        let key = PairKey::new(a, b);
        self.entries.get(&key).map(|c| c.verdict)
    }

    /// Memoized rating of one pair. On a hit the rater is not invoked.
    pub fn get_or_compute(
        &mut self,
        cfg: &RaterConfig,
        patches: &PatchMap,
        a: &PatchId,
        b: &PatchId,
    ) -> Result<Verdict> {
        let key = PairKey::new(a, b);
        if let Some(cached) = self.entries.get(&key) {
            self.hits += 1;
            return Ok(cached.verdict);
        }

        let pa = patches.get(a).ok_or_else(|| Error::UnknownPatch(a.to_string()))?;
        let pb = patches.get(b).ok_or_else(|| Error::UnknownPatch(b.to_string()))?;

        let verdict = rater::rate(cfg, pa, pb);
        self.misses += 1;
        self.dirty = true;
        self.entries.insert(
            key,
            CachedComparison {
                verdict,
                computed_at: chrono::Utc::now().timestamp(),
            },
        );
        Ok(verdict)
    }

    /// Rate every not-yet-cached pair of `pairs` on the worker pool. Each
    /// rating is independent; results are merged on the calling thread, so
    /// duplicate pairs are harmless (the rater is deterministic).
    pub fn rate_all(
        &mut self,
        cfg: &RaterConfig,
        patches: &PatchMap,
        pairs: &[(PatchId, PatchId)],
    ) -> Result<()> {
        let missing: Vec<PairKey> = pairs
            .iter()
            .map(|(a, b)| PairKey::new(a, b))
            .filter(|key| !self.entries.contains_key(key))
            .collect();

        self.hits += (pairs.len() - missing.len()) as u64;
        if missing.is_empty() {
            return Ok(());
        }
        log::info!(
            "rating {} of {} candidate pairs ({} cached)",
            missing.len(),
            pairs.len(),
            pairs.len() - missing.len()
        );

        let bar = ProgressBar::new(missing.len() as u64);
        bar.set_message("Rating candidate pairs");

        let rated: Vec<(PairKey, Verdict)> = missing
            .par_iter()
            .progress_with(bar)
            .map(|key| {
                let verdict = match (patches.get(&key.a), patches.get(&key.b)) {
                    (Some(pa), Some(pb)) => rater::rate(cfg, pa, pb),
                    // Skip-and-continue: a vanished patch rates unknown.
                    _ => Verdict::Unknown {
                        reason: crate::model::UnknownReason::Malformed,
                    },
                };
                (key.clone(), verdict)
            })
            .collect();

        let now = chrono::Utc::now().timestamp();
        for (key, verdict) in rated {
            self.misses += 1;
            self.entries.insert(
                key,
                CachedComparison {
                    verdict,
                    computed_at: now,
                },
            );
        }
        self.dirty = true;
        Ok(())
    }

    /// Drop every cached comparison that references `id`. Used when a
    /// patch is retired from the universe.
    pub fn invalidate(&mut self, id: &PatchId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.references(id));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.dirty = true;
            log::debug!("invalidated {} comparisons referencing {}", removed, id.short());
        }
        removed
    }

    /// Discard everything. Reserved for cold rebuilds.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.dirty = true;
        }
        self.entries.clear();
    }

    /// Write the cache back if it changed. Atomic: write a sibling temp
    /// file, then rename over the target.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut entries: Vec<FileEntry> = self
            .entries
            .iter()
            .map(|(key, cached)| FileEntry {
                a: key.a.clone(),
                b: key.b.clone(),
                verdict: cached.verdict,
                computed_at: cached.computed_at,
            })
            .collect();
        entries.sort_by(|x, y| (&x.a, &x.b).cmp(&(&y.a, &y.b)));

        let file = CacheFile {
            version: CACHE_FORMAT_VERSION,
            rater_fingerprint: self.rater_fingerprint.clone(),
            entries,
        };

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string(&file)?)?;
        fs::rename(&tmp, &self.path)?;
        self.dirty = false;
        log::debug!("saved {} comparisons to {}", self.entries.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testutil::patch;
    use pretty_assertions::assert_eq;

    fn universe() -> PatchMap {
        let p1 = patch(
            &["fix null check"],
            100,
            &[("a.c", "foo()", &["if (!p) return;"], &["use(p);"])],
        );
        let p2 = patch(
            &["add null guard"],
            200,
            &[("a.c", "foo()", &["if (!p) return;"], &["use(p);"])],
        );
        let mut map = PatchMap::new();
        map.insert(p1.id.clone(), p1);
        map.insert(p2.id.clone(), p2);
        map
    }

    fn ids(map: &PatchMap) -> Vec<PatchId> {
        let mut v: Vec<PatchId> = map.keys().cloned().collect();
        v.sort();
        v
    }

    #[test]
    fn second_lookup_is_a_pure_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RaterConfig::default();
        let map = universe();
        let ids = ids(&map);

        let mut cache =
            ComparisonCache::open(&dir.path().join("c.json"), "fp".into()).unwrap();
        let first = cache.get_or_compute(&cfg, &map, &ids[0], &ids[1]).unwrap();
        assert_eq!(cache.misses(), 1);
        let second = cache.get_or_compute(&cfg, &map, &ids[1], &ids[0]).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.misses(), 1, "rater must run at most once per pair");
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        let cfg = RaterConfig::default();
        let map = universe();
        let ids = ids(&map);

        let mut cache = ComparisonCache::open(&path, "fp".into()).unwrap();
        let verdict = cache.get_or_compute(&cfg, &map, &ids[0], &ids[1]).unwrap();
        cache.save().unwrap();

        let mut reopened = ComparisonCache::open(&path, "fp".into()).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get(&ids[0], &ids[1]), Some(verdict));
        assert_eq!(reopened.misses(), 0);
    }

    #[test]
    fn rater_policy_change_discards_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        let cfg = RaterConfig::default();
        let map = universe();
        let ids = ids(&map);

        let mut cache = ComparisonCache::open(&path, "fp-old".into()).unwrap();
        cache.get_or_compute(&cfg, &map, &ids[0], &ids[1]).unwrap();
        cache.save().unwrap();

        let reopened = ComparisonCache::open(&path, "fp-new".into()).unwrap();
        assert_eq!(reopened.len(), 0);
    }

    #[test]
    fn unparsable_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        fs::write(&path, "not json at all").unwrap();
        match ComparisonCache::open(&path, "fp".into()) {
            Err(Error::CacheCorruption(_)) => {}
            other => panic!("expected CacheCorruption, got {:?}", other.map(|c| c.len())),
        }
    }

    #[test]
    fn invalidate_removes_only_referencing_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RaterConfig::default();
        let mut map = universe();
        let p3 = patch(
            &["rework scheduler"],
            300,
            &[("b.c", "sched()", &["push(q);"], &[])],
        );
        let p3_id = p3.id.clone();
        map.insert(p3_id.clone(), p3);
        let ids = ids(&map);

        let mut cache =
            ComparisonCache::open(&dir.path().join("c.json"), "fp".into()).unwrap();
        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                cache.get_or_compute(&cfg, &map, &ids[i], &ids[j]).unwrap();
            }
        }
        assert_eq!(cache.len(), 3);

        let removed = cache.invalidate(&p3_id);
        assert_eq!(removed, 2);
        let survivors: Vec<&PatchId> = ids.iter().filter(|id| **id != p3_id).collect();
        assert!(cache.get(survivors[0], survivors[1]).is_some());
    }

    #[test]
    fn rate_all_fills_missing_pairs_once() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RaterConfig::default();
        let map = universe();
        let ids = ids(&map);
        let pairs = vec![(ids[0].clone(), ids[1].clone())];

        let mut cache =
            ComparisonCache::open(&dir.path().join("c.json"), "fp".into()).unwrap();
        cache.rate_all(&cfg, &map, &pairs).unwrap();
        assert_eq!(cache.misses(), 1);
        cache.rate_all(&cfg, &map, &pairs).unwrap();
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 1);
    }
}
