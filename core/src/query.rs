//! QueryEngine: search and similarity operations over the Catalog and
//! HashTrie (spec §4.5).

use crate::catalog::{Catalog, Field};
use crate::hash::Hash;
use crate::{ImgcatError, Result};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Exact-match filters accepted by [`QueryEngine::query`]. An empty string
/// in any field means "this column IS NULL" (spec §4.5).
#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    pub author: Option<String>,
    pub caption: Option<String>,
    pub source: Option<String>,
    pub rating: Option<String>,
    pub keyword: Vec<String>,
    pub not_keyword: Vec<String>,
    pub limit: Option<usize>,
    pub random: bool,
}

/// A uid paired with its similarity to some probe hash, `1 - distance/H`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityMatch {
    pub uid: Uuid,
    pub similarity: f64,
}

pub struct QueryEngine<'a> {
    pub catalog: &'a Catalog,
    pub trie: &'a parking_lot::ReentrantMutex<std::cell::RefCell<crate::trie::HashTrie>>,
}

impl<'a> QueryEngine<'a> {
    pub fn new(
        catalog: &'a Catalog,
        trie: &'a parking_lot::ReentrantMutex<std::cell::RefCell<crate::trie::HashTrie>>,
    ) -> Self {
        Self { catalog, trie }
    }

    /// `query(…)`: intersects the whole-catalog scan with every provided
    /// filter and keyword/not_keyword clause, truncates to `limit`, and
    /// returns the surviving uids in the scan's order (spec §4.5).
    ///
    /// When `random` is set, the initial order is a one-time shuffle, and
    /// every subsequent intersection filters that fixed order rather than
    /// re-sorting — an order-preserving set, as the spec's Open Question (b)
    /// is pinned here: "random" describes the *starting* scan order, not a
    /// fresh shuffle applied at each step.
    pub fn query(&self, filters: &QueryFilters) -> Result<Vec<Uuid>> {
        let mut ordered: Vec<Uuid> = if filters.random {
            self.catalog.list_all_uids_random()?
        } else {
            self.catalog.list_all_uids()?
        };

        let mut keep = |set: &BTreeSet<Uuid>| {
            ordered.retain(|u| set.contains(u));
        };

        if let Some(author) = &filters.author {
            keep(&self.catalog.uids_where(Field::Author, author)?);
        }
        if let Some(caption) = &filters.caption {
            keep(&self.catalog.uids_where(Field::Caption, caption)?);
        }
        if let Some(source) = &filters.source {
            keep(&self.catalog.uids_where(Field::Source, source)?);
        }
        if let Some(rating) = &filters.rating {
            keep(&self.catalog.uids_where(Field::Rating, rating)?);
        }
        for k in &filters.keyword {
            keep(&self.catalog.uids_with_keyword(k)?);
        }
        for k in &filters.not_keyword {
            let excluded = self.catalog.uids_with_keyword(k)?;
            ordered.retain(|u| !excluded.contains(u));
        }

        if let Some(limit) = filters.limit {
            ordered.truncate(limit);
        }
        Ok(ordered)
    }

    /// `similar_by_hash(h, threshold, limit)`: temporarily inserts `h` into
    /// the trie if absent, runs a bounded radius search, then removes the
    /// probe again. `d := ceil(H * (1 - threshold))`.
    pub fn similar_by_hash(&self, h: &Hash, threshold: f64, limit: usize) -> Result<Vec<SimilarityMatch>> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ImgcatError::UserError {
                message: format!("threshold {threshold} out of range [0, 1]"),
            });
        }
        let limit = limit.clamp(1, 100);

        let guard = self.trie.lock();
        let mut trie = guard.borrow_mut();
        let bits = trie.hash_bits() as f64;
        let d = (bits * (1.0 - threshold)).ceil() as u32;

        let already_present = trie.contains(h);
        if !already_present {
            trie.add(h)?;
        }
        let hits = trie.radius_search(h, d, limit + 1)?;
        if !already_present {
            trie.remove(h)?;
        }
        drop(trie);
        drop(guard);

        let mut out = Vec::new();
        for (distance, hit_hash) in hits {
            for uid in self.catalog.uids_with_hash(&hit_hash)? {
                out.push(SimilarityMatch {
                    uid,
                    similarity: 1.0 - (distance as f64) / bits,
                });
            }
        }
        out.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.uid.cmp(&b.uid))
        });
        out.truncate(limit);
        Ok(out)
    }

    /// `similar(uid, threshold, limit)`: the same search seeded from an
    /// existing record's hash.
    pub fn similar(&self, uid: &Uuid, threshold: f64, limit: usize) -> Result<Vec<SimilarityMatch>> {
        let record = self.catalog.get(uid)?.ok_or_else(|| ImgcatError::NoSuchUid {
            message: format!("uid {uid} not present"),
        })?;
        self.similar_by_hash(&record.hash, threshold, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Rating, Record};
    use crate::trie::HashTrie;
    use parking_lot::ReentrantMutex;
    use std::cell::RefCell;
    use std::collections::BTreeSet;
    use time::OffsetDateTime;

    fn record(uid: Uuid, hash: &str, keywords: &[&str]) -> Record {
        let mut r = Record {
            uid,
            hash: Hash::from_hex(hash, 8).unwrap(),
            caption: None,
            authors: None,
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            source: None,
            group_id: None,
            collections: BTreeSet::new(),
            rating: Some(Rating::Safe),
            date: OffsetDateTime::now_utc(),
            last_updated: OffsetDateTime::now_utc(),
            source_other: BTreeSet::new(),
            source_via: BTreeSet::new(),
        };
        r.regenerate_keywords();
        r
    }

    fn setup() -> (Catalog, ReentrantMutex<RefCell<HashTrie>>, Vec<Uuid>) {
        let catalog = Catalog::open_in_memory(r"[!-)+-9;-~]+", 8).unwrap();
        let trie = ReentrantMutex::new(RefCell::new(HashTrie::new(8)));
        let uids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let records = [
            record(uids[0], "00", &["sunset", "beach"]),
            record(uids[1], "ff", &["sunset"]),
            record(uids[2], "0f", &["beach"]),
        ];
        for r in &records {
            catalog.insert(r).unwrap();
            trie.lock().borrow_mut().add(&r.hash).unwrap();
        }
        (catalog, trie, uids)
    }

    #[test]
    fn query_intersects_keyword_filters() {
        let (catalog, trie, uids) = setup();
        let engine = QueryEngine::new(&catalog, &trie);
        let hits = engine
            .query(&QueryFilters {
                keyword: vec!["sunset".to_string(), "beach".to_string()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits, vec![uids[0]]);
    }

    #[test]
    fn query_not_keyword_excludes() {
        let (catalog, trie, uids) = setup();
        let engine = QueryEngine::new(&catalog, &trie);
        let hits = engine
            .query(&QueryFilters {
                not_keyword: vec!["sunset".to_string()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits, vec![uids[2]]);
    }

    #[test]
    fn similar_by_hash_excludes_probe_when_not_a_member() {
        let (catalog, trie, _uids) = setup();
        let engine = QueryEngine::new(&catalog, &trie);
        let probe = Hash::from_hex("08", 8).unwrap();
        let hits = engine.similar_by_hash(&probe, 0.5, 10).unwrap();
        assert!(!trie.lock().borrow().contains(&probe));
        assert!(!hits.is_empty());
    }

    #[test]
    fn similar_rejects_out_of_range_threshold() {
        let (catalog, trie, _uids) = setup();
        let engine = QueryEngine::new(&catalog, &trie);
        let probe = Hash::from_hex("08", 8).unwrap();
        assert!(engine.similar_by_hash(&probe, 1.5, 10).is_err());
    }
}
