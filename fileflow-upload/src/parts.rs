use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{types::ReportedPart, UploadError, UploadResult};

/// One part of a multipart session. Seeded as a placeholder at activation,
/// completed once its ETag is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub presigned_url: String,
    pub etag: Option<String>,
    pub size: Option<u64>,
    pub recorded_at: Option<DateTime<Utc>>,
}

impl CompletedPart {
    pub fn placeholder<S: Into<String>>(part_number: u32, presigned_url: S) -> Self {
        Self {
            part_number,
            presigned_url: presigned_url.into(),
            etag: None,
            size: None,
            recorded_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.etag.is_some()
    }
}

/// (part number, ETag) pair handed to storage on finalize
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartTag {
    pub part_number: u32,
    pub etag: String,
}

/// The declared parts of one multipart session, keyed by part number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartSet {
    total: u32,
    parts: BTreeMap<u32, CompletedPart>,
}

impl PartSet {
    /// Placeholders for parts `1..=urls.len()`.
    pub fn seed(urls: Vec<String>) -> Self {
        let parts: BTreeMap<u32, CompletedPart> = urls
            .into_iter()
            .enumerate()
            .map(|(i, url)| {
                let n = i as u32 + 1;
                (n, CompletedPart::placeholder(n, url))
            })
            .collect();
        Self {
            total: parts.len() as u32,
            parts,
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn get(&self, part_number: u32) -> Option<&CompletedPart> {
        self.parts.get(&part_number)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompletedPart> {
        self.parts.values()
    }

    pub fn completed_count(&self) -> u32 {
        self.parts.values().filter(|p| p.is_completed()).count() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.completed_count() == self.total
    }

    pub fn missing(&self) -> Vec<u32> {
        self.parts
            .values()
            .filter(|p| !p.is_completed())
            .map(|p| p.part_number)
            .collect()
    }

    /// Check a part may be recorded without changing anything.
    pub fn check_recordable(&self, part_number: u32) -> UploadResult<()> {
        match self.parts.get(&part_number) {
            None => Err(UploadError::InvalidPartNumber {
                part_number,
                total: self.total,
            }),
            Some(part) if part.is_completed() => Err(UploadError::DuplicatePartNumber { part_number }),
            Some(_) => Ok(()),
        }
    }

    /// Record ETag and size. A completed part is never overwritten.
    pub fn record<S: Into<String>>(
        &mut self,
        part_number: u32,
        etag: S,
        size: u64,
        now: DateTime<Utc>,
    ) -> UploadResult<&CompletedPart> {
        self.check_recordable(part_number)?;
        let etag = etag.into();
        if etag.trim().is_empty() {
            return Err(UploadError::validation("part etag must not be empty"));
        }
        let part = self
            .parts
            .get_mut(&part_number)
            .ok_or(UploadError::InvalidPartNumber {
                part_number,
                total: self.total,
            })?;
        part.etag = Some(etag);
        part.size = Some(size);
        part.recorded_at = Some(now);
        Ok(part)
    }

    /// Ordered list for the storage finalize call.
    pub fn ordered_tags(&self) -> UploadResult<Vec<PartTag>> {
        if !self.is_complete() {
            return Err(UploadError::IncompleteParts {
                completed: self.completed_count(),
                total: self.total,
            });
        }
        Ok(self
            .parts
            .values()
            .filter_map(|p| {
                p.etag.as_ref().map(|etag| PartTag {
                    part_number: p.part_number,
                    etag: etag.clone(),
                })
            })
            .collect())
    }

    /// Client-reported ETags must agree with what was recorded.
    pub fn verify_reported(&self, reported: &[ReportedPart]) -> UploadResult<()> {
        for r in reported {
            let recorded = self
                .parts
                .get(&r.part_number)
                .ok_or(UploadError::InvalidPartNumber {
                    part_number: r.part_number,
                    total: self.total,
                })?;
            if let Some(etag) = &recorded.etag {
                if normalize_etag(etag) != normalize_etag(&r.etag) {
                    return Err(UploadError::validation(format!(
                        "ETag mismatch for part {}",
                        r.part_number
                    )));
                }
            }
        }
        Ok(())
    }
}

/// S3 returns ETags quoted; clients often strip them.
fn normalize_etag(etag: &str) -> &str {
    etag.trim().trim_matches('"')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(n: u32) -> PartSet {
        PartSet::seed((1..=n).map(|i| format!("https://part/{i}")).collect())
    }

    #[test]
    fn seed_numbers_parts_from_one() {
        let set = seeded(3);
        assert_eq!(set.total(), 3);
        assert_eq!(set.missing(), vec![1, 2, 3]);
        assert_eq!(set.get(2).unwrap().presigned_url, "https://part/2");
        assert!(set.get(0).is_none());
    }

    #[test]
    fn duplicate_record_keeps_first_etag() {
        let now = Utc::now();
        let mut set = seeded(2);
        set.record(1, "etag-a", 10, now).unwrap();

        let err = set.record(1, "etag-b", 10, now).unwrap_err();
        assert_eq!(err, UploadError::DuplicatePartNumber { part_number: 1 });
        assert_eq!(set.get(1).unwrap().etag.as_deref(), Some("etag-a"));
    }

    #[test]
    fn out_of_range_part_is_rejected() {
        let mut set = seeded(2);
        for n in [0, 3] {
            assert_eq!(
                set.record(n, "e", 1, Utc::now()).unwrap_err(),
                UploadError::InvalidPartNumber { part_number: n, total: 2 }
            );
        }
    }

    #[test]
    fn ordered_tags_require_every_part() {
        let now = Utc::now();
        let mut set = seeded(5);
        for n in [1, 2, 4, 5] {
            set.record(n, format!("e{n}"), 5, now).unwrap();
        }
        let err = set.ordered_tags().unwrap_err();
        assert_eq!(err.to_string(), "Not all parts uploaded: 4/5");

        set.record(3, "e3", 5, now).unwrap();
        let tags = set.ordered_tags().unwrap();
        let numbers: Vec<u32> = tags.iter().map(|t| t.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn reported_etags_are_compared_unquoted() {
        let now = Utc::now();
        let mut set = seeded(2);
        set.record(1, "\"abc\"", 1, now).unwrap();
        set.record(2, "def", 1, now).unwrap();

        assert!(set
            .verify_reported(&[ReportedPart::new(1, "abc"), ReportedPart::new(2, "\"def\"")])
            .is_ok());
        assert!(matches!(
            set.verify_reported(&[ReportedPart::new(2, "zzz")]),
            Err(UploadError::Validation { .. })
        ));
    }
}
