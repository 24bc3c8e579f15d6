//! Record type: the metadata of one image (spec §3).

use crate::hash::Hash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use time::OffsetDateTime;
use uuid::Uuid;

/// Content-rating enum (`s`/`n`/`q`/`e`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rating {
    Safe,
    Nudity,
    Questionable,
    Explicit,
}

impl Rating {
    pub fn code(self) -> char {
        match self {
            Rating::Safe => 's',
            Rating::Nudity => 'n',
            Rating::Questionable => 'q',
            Rating::Explicit => 'e',
        }
    }

    pub fn from_code(c: char) -> Option<Self> {
        match c {
            's' => Some(Rating::Safe),
            'n' => Some(Rating::Nudity),
            'q' => Some(Rating::Questionable),
            'e' => Some(Rating::Explicit),
            _ => None,
        }
    }
}

/// The metadata of one image (spec §3). `authors` is the pinned list form
/// (Open Question c): `author` is a derived accessor of `authors[0]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub uid: Uuid,
    pub hash: Hash,
    pub caption: Option<String>,
    pub authors: Option<Vec<String>>,
    pub keywords: BTreeSet<String>,
    pub source: Option<String>,
    pub group_id: Option<Uuid>,
    pub collections: BTreeSet<String>,
    pub rating: Option<Rating>,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
    pub source_other: BTreeSet<String>,
    pub source_via: BTreeSet<String>,
}

impl Record {
    /// The canonical "author": the first element of `authors`, if any.
    pub fn author(&self) -> Option<&str> {
        self.authors.as_ref().and_then(|a| a.first()).map(|s| s.as_str())
    }

    /// Runs the keyword-regeneration pass (spec §4.5): strips any
    /// previously-derived `missing:`/`collection:`/`author:` tokens and
    /// rebuilds them from the record's current fields. Returns `true` iff
    /// the keyword set changed.
    pub fn regenerate_keywords(&mut self) -> bool {
        let before = self.keywords.clone();

        self.keywords
            .retain(|k| !(k.starts_with("missing:") || k.starts_with("collection:") || k.starts_with("author:")));

        if self.author().is_none() {
            self.keywords.insert("missing:author".to_string());
        }
        if self.source.is_none() {
            self.keywords.insert("missing:source".to_string());
        }
        if self.caption.is_none() {
            self.keywords.insert("missing:caption".to_string());
        }
        if self.rating.is_none() {
            self.keywords.insert("missing:rating".to_string());
        }
        for c in &self.collections {
            self.keywords.insert(format!("collection:{c}"));
        }
        if let Some(authors) = &self.authors {
            for a in authors {
                self.keywords.insert(format!("author:{a}"));
            }
        }

        self.keywords != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_record() -> Record {
        Record {
            uid: Uuid::nil(),
            hash: Hash::from_hex("00", 8).unwrap(),
            caption: None,
            authors: None,
            keywords: BTreeSet::new(),
            source: None,
            group_id: None,
            collections: BTreeSet::new(),
            rating: None,
            date: OffsetDateTime::UNIX_EPOCH,
            last_updated: OffsetDateTime::UNIX_EPOCH,
            source_other: BTreeSet::new(),
            source_via: BTreeSet::new(),
        }
    }

    #[test]
    fn derives_missing_keywords_for_empty_fields() {
        let mut r = base_record();
        assert!(r.regenerate_keywords());
        assert!(r.keywords.contains("missing:author"));
        assert!(r.keywords.contains("missing:source"));
        assert!(r.keywords.contains("missing:caption"));
        assert!(r.keywords.contains("missing:rating"));
    }

    #[test]
    fn derives_author_and_collection_keywords() {
        let mut r = base_record();
        r.authors = Some(vec!["alice".to_string(), "bob".to_string()]);
        r.collections.insert("vacation".to_string());
        r.regenerate_keywords();
        assert!(r.keywords.contains("author:alice"));
        assert!(r.keywords.contains("author:bob"));
        assert!(r.keywords.contains("collection:vacation"));
        assert!(!r.keywords.contains("missing:author"));
        assert_eq!(r.author(), Some("alice"));
    }

    #[test]
    fn regenerate_is_idempotent_and_reports_no_change_on_second_call() {
        let mut r = base_record();
        assert!(r.regenerate_keywords());
        assert!(!r.regenerate_keywords());
    }
}
