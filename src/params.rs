use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{MaterialId, SearchType, StructType};
use crate::error::CmgError;

/// One group as supplied by the external params source. Only the keys below
/// are recognized; anything else is rejected when the file is parsed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GroupDefinition {
    pub materialid: MaterialId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub searchtype: SearchType,
    #[serde(default)]
    pub structtype: StructType,
    pub searchstring: String,
    #[serde(default)]
    pub last_updated: Option<NaiveDate>,
}

impl GroupDefinition {
    pub fn new(materialid: MaterialId, name: &str, searchstring: &str) -> Self {
        Self {
            materialid,
            name: Some(name.to_string()),
            searchtype: SearchType::default(),
            structtype: StructType::default(),
            searchstring: searchstring.to_string(),
            last_updated: None,
        }
    }

    pub fn validate(&self) -> Result<(), CmgError> {
        if self.searchstring.trim().is_empty() {
            return Err(CmgError::InvalidParams(format!(
                "group {} has an empty searchstring",
                self.materialid
            )));
        }
        Ok(())
    }
}

/// Structure query handed to a [`crate::pubchem::SearchClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub searchtype: SearchType,
    pub structtype: StructType,
    pub searchstring: String,
}

/// Persisted parameter snapshot of a group.
///
/// `current_update` is the only field the group lifecycle changes: it is set
/// when a search starts and cleared once the search result is committed, so
/// a snapshot that still carries it marks an incomplete search.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Params {
    pub materialid: MaterialId,
    pub name: Option<String>,
    pub searchtype: SearchType,
    pub structtype: StructType,
    pub searchstring: String,
    pub last_updated: Option<NaiveDate>,
    pub current_update: Option<DateTime<Utc>>,
}

impl Params {
    pub fn from_definition(definition: &GroupDefinition) -> Self {
        Self {
            materialid: definition.materialid.clone(),
            name: definition.name.clone(),
            searchtype: definition.searchtype,
            structtype: definition.structtype,
            searchstring: definition.searchstring.clone(),
            last_updated: definition.last_updated,
            current_update: None,
        }
    }

    pub fn query(&self) -> SearchQuery {
        SearchQuery {
            searchtype: self.searchtype,
            structtype: self.structtype,
            searchstring: self.searchstring.clone(),
        }
    }

    pub fn search_in_flight(&self) -> bool {
        self.current_update.is_some()
    }
}
