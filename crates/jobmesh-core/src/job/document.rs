//! Shape of a document in the `jobs` collection.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    hashing::{JobId, Parameters},
    lock::LockState,
    store, Error, Result,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDocument {
    #[serde(rename = "_id")]
    pub id: JobId,
    /// Absent only in damaged documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
    /// Worker instances holding the job open.
    #[serde(default)]
    pub executing: BTreeSet<String>,
    /// Last heartbeat per worker instance.
    #[serde(default)]
    pub pulse: BTreeMap<String, DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<LockState>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub develop: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_false(b: &bool) -> bool {
    !*b
}

impl JobDocument {
    #[must_use]
    pub fn new(parameters: Parameters, develop: bool, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::from_parameters(&parameters),
            parameters: Some(parameters),
            executing: BTreeSet::new(),
            pulse: BTreeMap::new(),
            lock: None,
            develop,
            created_at: Some(now),
        }
    }

    /// Parameters, or `CorruptedState` when the field is missing.
    pub fn parameters(&self) -> Result<&Parameters> {
        self.parameters.as_ref().ok_or_else(|| {
            Error::corrupted(store::JOBS, self.id.as_str(), "document has no parameters")
        })
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.executing.is_empty()
    }

    /// Whether every key of `filter` is present in the parameters with an
    /// equal value.
    #[must_use]
    pub fn matches(&self, filter: &Parameters) -> bool {
        self.parameters
            .as_ref()
            .is_some_and(|params| filter.iter().all(|(k, v)| params.get(k) == Some(v)))
    }

    /// Workers whose last beat is older than `cutoff`, plus `executing`
    /// members that never wrote a pulse.
    #[must_use]
    pub fn stale_workers(
        &self,
        now: DateTime<Utc>,
        cutoff: chrono::Duration,
    ) -> Vec<(String, Option<DateTime<Utc>>)> {
        let mut stale: Vec<_> = self
            .pulse
            .iter()
            .filter(|(_, beat)| now.signed_duration_since(**beat) > cutoff)
            .map(|(worker, beat)| (worker.clone(), Some(*beat)))
            .collect();
        stale.extend(
            self.executing
                .iter()
                .filter(|worker| !self.pulse.contains_key(*worker))
                .map(|worker| (worker.clone(), None)),
        );
        stale
    }

    /// Drop a worker from both `executing` and `pulse`.
    pub fn forget_worker(&mut self, worker: &str) -> bool {
        let in_executing = self.executing.remove(worker);
        let in_pulse = self.pulse.remove(worker).is_some();
        in_executing || in_pulse
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;

    fn params(value: serde_json::Value) -> Parameters {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn test_id_is_derived_from_parameters() {
        let now = Utc::now();
        let doc = JobDocument::new(params(json!({"a": 1, "b": 2})), false, now);
        let same = JobDocument::new(params(json!({"b": 2, "a": 1})), false, now);
        assert_eq!(doc.id, same.id);
    }

    #[test]
    fn test_serialized_shape_uses_underscore_id_and_omits_defaults() -> Result<()> {
        let doc = JobDocument::new(params(json!({"a": 1})), false, Utc::now());
        let body = store::encode(&doc)?;
        assert_eq!(body["_id"], json!(doc.id.as_str()));
        assert!(body.get("lock").is_none());
        assert!(body.get("develop").is_none());
        Ok(())
    }

    #[test]
    fn test_matches_requires_every_filter_pair() {
        let doc = JobDocument::new(params(json!({"a": 1, "b": "x"})), false, Utc::now());
        assert!(doc.matches(&params(json!({"a": 1}))));
        assert!(doc.matches(&params(json!({}))));
        assert!(!doc.matches(&params(json!({"a": 2}))));
        assert!(!doc.matches(&params(json!({"c": 1}))));
    }

    #[test]
    fn test_stale_workers_includes_executing_without_pulse() {
        let now = Utc::now();
        let mut doc = JobDocument::new(params(json!({"a": 1})), false, now);
        doc.executing.extend(["old".to_owned(), "fresh".to_owned(), "ghost".to_owned()]);
        doc.pulse.insert("old".to_owned(), now - Duration::seconds(301));
        doc.pulse.insert("fresh".to_owned(), now - Duration::seconds(100));

        let stale: Vec<String> = doc
            .stale_workers(now, Duration::seconds(300))
            .into_iter()
            .map(|(w, _)| w)
            .collect();
        assert_eq!(stale, vec!["old".to_owned(), "ghost".to_owned()]);
    }

    #[test]
    fn test_missing_parameters_is_corrupted() {
        let mut doc = JobDocument::new(params(json!({"a": 1})), false, Utc::now());
        doc.parameters = None;
        assert!(matches!(doc.parameters(), Err(Error::CorruptedState { .. })));
    }
}
