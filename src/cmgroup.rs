//! Lifecycle of a single chemical/material group.
//!
//! A group moves through `uninitialized -> searching -> updating -> idle`.
//! Every step reads its starting point from the [`GroupStore`], so an update
//! interrupted at any moment resumes from what was durably merged: CIDs that
//! already have a record are never fetched again, and CIDs that were not
//! fetched yet are still missing on the next run.

use std::mem;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{Cid, MaterialId};
use crate::error::CmgError;
use crate::params::{GroupDefinition, Params};
use crate::pubchem::{PropertyClient, SearchClient};
use crate::store::{GroupStore, IdentifierSet, RecordSet};

/// Number of fetched records collected before each merge into the store.
pub const MERGE_CHUNK: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    Uninitialized,
    Searching,
    Updating,
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchFailure {
    pub cid: Cid,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateOutcome {
    pub materialid: MaterialId,
    pub record_count: usize,
    pub fetched: usize,
    pub failures: Vec<FetchFailure>,
}

impl UpdateOutcome {
    /// True when no CID of the search result is left without a record.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub materialid: MaterialId,
    pub name: Option<String>,
    pub state: GroupState,
    pub identifiers: usize,
    pub records: usize,
    pub missing: usize,
}

#[derive(Debug, Clone)]
pub struct CmGroup {
    params: Params,
    store: GroupStore,
}

impl CmGroup {
    /// Loads the group's params snapshot, creating it from `definition` on
    /// first use.
    pub fn new(definition: &GroupDefinition, store: GroupStore) -> Result<Self, CmgError> {
        let params = store.load_params(definition)?;
        debug!(materialid = %params.materialid, "created group");
        Ok(Self { params, store })
    }

    pub fn materialid(&self) -> &MaterialId {
        &self.params.materialid
    }

    pub fn name(&self) -> Option<&str> {
        self.params.name.as_deref()
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Runs the group's structure search and replaces its identifier set
    /// with the result. Returns the number of CIDs saved.
    ///
    /// The search marker is persisted before the remote call and only
    /// cleared once the result is written, so a failed search leaves it set.
    pub fn init_search(
        &mut self,
        search: &dyn SearchClient,
        result_limit: Option<usize>,
    ) -> Result<usize, CmgError> {
        self.params.current_update = Some(Utc::now());
        self.store.save_params(&self.params)?;

        info!(materialid = %self.materialid(), "initiating structure search");
        let cids = search
            .search(&self.params.query(), result_limit)
            .map_err(|err| match err {
                CmgError::SearchFailed(_) => err,
                other => CmgError::SearchFailed(other.to_string()),
            })?;

        let mut identifiers = IdentifierSet::from_cids(cids);
        if let Some(limit) = result_limit {
            identifiers.truncate(limit);
        }
        self.store.write_identifiers(self.materialid(), &identifiers)?;

        self.params.current_update = None;
        self.store.save_params(&self.params)?;
        info!(
            materialid = %self.materialid(),
            count = identifiers.len(),
            "saved search results"
        );
        Ok(identifiers.len())
    }

    /// Fetches a record for every CID of the identifier set that has none
    /// yet and merges the results. A failed lookup is reported in the
    /// outcome and leaves that CID missing for the next call; records
    /// outside the identifier set are kept untouched.
    pub fn update_from_identifiers(
        &self,
        properties: &dyn PropertyClient,
    ) -> Result<UpdateOutcome, CmgError> {
        let id = self.materialid();
        let identifiers = self.store.read_identifiers(id)?;
        let mut records = self.store.read_records(id)?;

        if identifiers.is_empty() {
            warn!(materialid = %id, "no CIDs to update group");
            return Ok(UpdateOutcome {
                materialid: id.clone(),
                record_count: records.len(),
                fetched: 0,
                failures: Vec::new(),
            });
        }

        let missing = records.missing_from(&identifiers);
        if records.is_empty() {
            info!(materialid = %id, count = missing.len(), "starting update from search results");
        } else {
            info!(
                materialid = %id,
                existing = records.len(),
                count = missing.len(),
                "resuming update"
            );
        }

        let mut fetched = 0;
        let mut failures = Vec::new();
        let mut batch = Vec::with_capacity(MERGE_CHUNK);
        for cid in missing {
            match properties.fetch(cid) {
                Ok(record) if record.cid == cid => batch.push(record),
                Ok(record) => {
                    warn!(materialid = %id, %cid, returned = %record.cid, "lookup returned a different CID");
                    failures.push(FetchFailure {
                        cid,
                        message: format!("lookup returned CID {}", record.cid),
                    });
                }
                Err(err) => {
                    let err = match err {
                        CmgError::FetchFailed { .. } => err,
                        other => CmgError::FetchFailed {
                            cid: cid.get(),
                            message: other.to_string(),
                        },
                    };
                    warn!(materialid = %id, %cid, error = %err, "compound lookup failed");
                    failures.push(FetchFailure {
                        cid,
                        message: err.to_string(),
                    });
                }
            }
            if batch.len() >= MERGE_CHUNK {
                fetched += self
                    .store
                    .append_records(id, &mut records, mem::take(&mut batch))?;
            }
        }
        if !batch.is_empty() {
            fetched += self.store.append_records(id, &mut records, batch)?;
        }

        let record_count = records.len();
        info!(
            materialid = %id,
            fetched,
            failed = failures.len(),
            total = record_count,
            "completed update"
        );
        Ok(UpdateOutcome {
            materialid: id.clone(),
            record_count,
            fetched,
            failures,
        })
    }

    /// Search followed by update, exactly as if both were called in turn.
    pub fn pubchem_update(
        &mut self,
        search: &dyn SearchClient,
        properties: &dyn PropertyClient,
        result_limit: Option<usize>,
    ) -> Result<UpdateOutcome, CmgError> {
        self.init_search(search, result_limit)?;
        self.update_from_identifiers(properties)
    }

    pub fn get_compounds(&self) -> Result<RecordSet, CmgError> {
        self.store.read_records(self.materialid())
    }

    pub fn get_returned_identifiers(&self) -> Result<IdentifierSet, CmgError> {
        self.store.read_identifiers(self.materialid())
    }

    pub fn clear_data(&mut self) -> Result<(), CmgError> {
        self.store.clear(self.materialid())?;
        self.params.current_update = None;
        Ok(())
    }

    pub fn state(&self) -> Result<GroupState, CmgError> {
        Ok(self.status()?.state)
    }

    pub fn status(&self) -> Result<GroupStatus, CmgError> {
        let identifiers = self.get_returned_identifiers()?;
        let records = self.get_compounds()?;
        let missing = records.missing_from(&identifiers).len();
        let state = if self.params.search_in_flight() {
            GroupState::Searching
        } else if missing > 0 {
            GroupState::Updating
        } else if identifiers.is_empty() && records.is_empty() {
            GroupState::Uninitialized
        } else {
            GroupState::Idle
        };
        Ok(GroupStatus {
            materialid: self.materialid().clone(),
            name: self.params.name.clone(),
            state,
            identifiers: identifiers.len(),
            records: records.len(),
            missing,
        })
    }
}
