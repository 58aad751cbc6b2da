#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use camino::Utf8PathBuf;
use tempfile::TempDir;

use commongroups::domain::{Cid, MaterialId};
use commongroups::error::CmgError;
use commongroups::params::{GroupDefinition, SearchQuery};
use commongroups::pubchem::{PropertyClient, SearchClient};
use commongroups::scheduler::Throttle;
use commongroups::store::{CompoundRecord, Store};

pub fn cid(value: u64) -> Cid {
    Cid::new(value).unwrap()
}

pub fn cids(values: &[u64]) -> Vec<Cid> {
    values.iter().copied().map(cid).collect()
}

pub fn materialid(value: &str) -> MaterialId {
    value.parse().unwrap()
}

pub fn definition(id: &str, searchstring: &str) -> GroupDefinition {
    GroupDefinition::new(materialid(id), &format!("group {id}"), searchstring)
}

/// A store rooted in a fresh temporary directory. Keep the `TempDir` alive
/// for the duration of the test.
pub fn temp_store() -> (TempDir, Store) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("default")).unwrap();
    let store = Store::new_with_root(root);
    store.ensure_layout().unwrap();
    (temp, store)
}

/// Answers searches from a table keyed by search string.
#[derive(Default)]
pub struct MockSearch {
    results: HashMap<String, Vec<u64>>,
    failing: HashSet<String>,
    pub calls: Mutex<Vec<String>>,
}

impl MockSearch {
    pub fn with(mut self, searchstring: &str, cids: &[u64]) -> Self {
        self.results.insert(searchstring.to_string(), cids.to_vec());
        self
    }

    pub fn failing(mut self, searchstring: &str) -> Self {
        self.failing.insert(searchstring.to_string());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl SearchClient for MockSearch {
    fn search(&self, query: &SearchQuery, _limit: Option<usize>) -> Result<Vec<Cid>, CmgError> {
        self.calls.lock().unwrap().push(query.searchstring.clone());
        if self.failing.contains(&query.searchstring) {
            return Err(CmgError::PubchemStatus {
                status: 503,
                message: "service unavailable".to_string(),
            });
        }
        let found = self
            .results
            .get(&query.searchstring)
            .cloned()
            .unwrap_or_default();
        Ok(cids(&found))
    }
}

/// Builds a record for any CID except the ones marked as failing.
#[derive(Default)]
pub struct MockProperties {
    failing: Mutex<HashSet<u64>>,
    pub calls: Mutex<Vec<Cid>>,
}

impl MockProperties {
    pub fn failing(cids: &[u64]) -> Self {
        Self {
            failing: Mutex::new(cids.iter().copied().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn recover(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn fetched(&self) -> Vec<Cid> {
        self.calls.lock().unwrap().clone()
    }
}

impl PropertyClient for MockProperties {
    fn fetch(&self, cid: Cid) -> Result<CompoundRecord, CmgError> {
        self.calls.lock().unwrap().push(cid);
        if self.failing.lock().unwrap().contains(&cid.get()) {
            return Err(CmgError::PubchemHttp("connection reset".to_string()));
        }
        let mut record = CompoundRecord::new(cid);
        record.iupac_name = Some(format!("compound-{cid}"));
        Ok(record)
    }
}

impl PropertyClient for &MockProperties {
    fn fetch(&self, cid: Cid) -> Result<CompoundRecord, CmgError> {
        (**self).fetch(cid)
    }
}

/// Records every requested pause without sleeping.
#[derive(Default)]
pub struct RecordingThrottle {
    pub pauses: Mutex<Vec<Duration>>,
}

impl Throttle for RecordingThrottle {
    fn pause(&self, wait: Duration) {
        self.pauses.lock().unwrap().push(wait);
    }
}

impl Throttle for &RecordingThrottle {
    fn pause(&self, wait: Duration) {
        (**self).pause(wait);
    }
}
