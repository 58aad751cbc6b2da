use std::collections::HashSet;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use tempfile::Builder;
use tracing::{debug, warn};

use crate::domain::{Casrn, Cid, MaterialId};
use crate::error::CmgError;
use crate::params::{GroupDefinition, Params};

/// Project environment on disk: `<root>/<project>/{data,results,log}`.
#[derive(Debug, Clone)]
pub struct Store {
    project_root: Utf8PathBuf,
}

impl Store {
    /// Resolves the environment root from `env_path`, then `CMG_HOME`, then
    /// `~/commongroups_data`.
    pub fn new(env_path: Option<&str>, project: &str) -> Result<Self, CmgError> {
        let project = project.trim();
        if project.is_empty() || project.contains(['/', '\\']) || project == ".." {
            return Err(CmgError::InvalidParams(format!(
                "invalid project name: {project:?}"
            )));
        }

        let env_root = match env_path {
            Some(path) => Utf8PathBuf::from(path),
            None => match std::env::var("CMG_HOME") {
                Ok(home) if !home.trim().is_empty() => Utf8PathBuf::from(home.trim()),
                _ => BaseDirs::new()
                    .and_then(|dirs| {
                        Utf8PathBuf::from_path_buf(dirs.home_dir().join("commongroups_data")).ok()
                    })
                    .ok_or_else(|| {
                        CmgError::Filesystem("unable to resolve home directory".to_string())
                    })?,
            },
        };

        Ok(Self {
            project_root: env_root.join(project),
        })
    }

    pub fn new_with_root(project_root: Utf8PathBuf) -> Self {
        Self { project_root }
    }

    pub fn project_root(&self) -> &Utf8Path {
        &self.project_root
    }

    pub fn data_dir(&self) -> Utf8PathBuf {
        self.project_root.join("data")
    }

    pub fn results_dir(&self) -> Utf8PathBuf {
        self.project_root.join("results")
    }

    pub fn log_dir(&self) -> Utf8PathBuf {
        self.project_root.join("log")
    }

    /// Default location of the group definitions file.
    pub fn params_path(&self) -> Utf8PathBuf {
        self.project_root.join("params.json")
    }

    pub fn ensure_layout(&self) -> Result<(), CmgError> {
        for dir in [self.data_dir(), self.results_dir(), self.log_dir()] {
            fs::create_dir_all(dir.as_std_path())
                .map_err(|err| CmgError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    pub fn group_store(&self) -> GroupStore {
        GroupStore::new(self.data_dir())
    }
}

/// Ordered CIDs returned by the latest search of a group, without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct IdentifierSet(Vec<Cid>);

impl IdentifierSet {
    /// Keeps the first occurrence of every CID.
    pub fn from_cids<I: IntoIterator<Item = Cid>>(cids: I) -> Self {
        let mut seen = HashSet::new();
        Self(cids.into_iter().filter(|cid| seen.insert(*cid)).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, cid: Cid) -> bool {
        self.0.contains(&cid)
    }

    pub fn iter(&self) -> impl Iterator<Item = Cid> + '_ {
        self.0.iter().copied()
    }

    pub fn as_slice(&self) -> &[Cid] {
        &self.0
    }

    pub fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }
}

/// Property data for one compound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompoundRecord {
    pub cid: Cid,
    /// Best CAS number first.
    #[serde(default)]
    pub casrns: Vec<Casrn>,
    #[serde(default)]
    pub iupac_name: Option<String>,
    #[serde(default)]
    pub creation_date: Option<NaiveDate>,
}

impl CompoundRecord {
    pub fn new(cid: Cid) -> Self {
        Self {
            cid,
            casrns: Vec::new(),
            iupac_name: None,
            creation_date: None,
        }
    }
}

/// Records of a group keyed by CID, kept in append order.
#[derive(Debug, Clone, Default)]
pub struct RecordSet {
    records: Vec<CompoundRecord>,
    cids: HashSet<Cid>,
}

impl RecordSet {
    /// Adds `record` unless its CID is already present; the first record
    /// stored for a CID always wins.
    pub fn insert(&mut self, record: CompoundRecord) -> bool {
        if !self.cids.insert(record.cid) {
            return false;
        }
        self.records.push(record);
        true
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, cid: Cid) -> bool {
        self.cids.contains(&cid)
    }

    pub fn get(&self, cid: Cid) -> Option<&CompoundRecord> {
        if !self.contains(cid) {
            return None;
        }
        self.records.iter().find(|record| record.cid == cid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompoundRecord> {
        self.records.iter()
    }

    pub fn cids(&self) -> impl Iterator<Item = Cid> + '_ {
        self.records.iter().map(|record| record.cid)
    }

    /// CIDs of `identifiers` that have no record yet, in search order.
    pub fn missing_from(&self, identifiers: &IdentifierSet) -> Vec<Cid> {
        identifiers.iter().filter(|cid| !self.contains(*cid)).collect()
    }

    pub fn into_records(self) -> Vec<CompoundRecord> {
        self.records
    }
}

/// Persistence of one group's params snapshot, identifier set and record set,
/// each addressed by materialid inside the project data directory.
///
/// Callers must ensure a single writer per materialid; nothing here locks.
#[derive(Debug, Clone)]
pub struct GroupStore {
    data_dir: Utf8PathBuf,
}

impl GroupStore {
    pub fn new(data_dir: Utf8PathBuf) -> Self {
        Self { data_dir }
    }

    pub fn data_dir(&self) -> &Utf8Path {
        &self.data_dir
    }

    pub fn params_path(&self, id: &MaterialId) -> Utf8PathBuf {
        self.data_dir.join(format!("{id}_params.json"))
    }

    pub fn identifiers_path(&self, id: &MaterialId) -> Utf8PathBuf {
        self.data_dir.join(format!("{id}_cids.json"))
    }

    pub fn records_path(&self, id: &MaterialId) -> Utf8PathBuf {
        self.data_dir.join(format!("{id}_cpds.jsonl"))
    }

    /// Returns the persisted snapshot for the group, or materializes one from
    /// `definition` and persists it right away.
    pub fn load_params(&self, definition: &GroupDefinition) -> Result<Params, CmgError> {
        let path = self.params_path(&definition.materialid);
        if let Some(content) = read_optional(&path)? {
            let params: Params = serde_json::from_str(&content).map_err(|err| corrupt(&path, err))?;
            if params.materialid != definition.materialid {
                return Err(CmgError::StoreCorrupt {
                    path: path.to_string(),
                    reason: format!(
                        "snapshot belongs to materialid {}, expected {}",
                        params.materialid, definition.materialid
                    ),
                });
            }
            if params.searchstring != definition.searchstring {
                warn!(
                    materialid = %params.materialid,
                    "group definition changed since the snapshot was taken; keeping the snapshot"
                );
            }
            debug!(materialid = %params.materialid, "loaded params snapshot");
            return Ok(params);
        }

        let params = Params::from_definition(definition);
        self.save_params(&params)?;
        debug!(materialid = %params.materialid, "created params snapshot");
        Ok(params)
    }

    pub fn save_params(&self, params: &Params) -> Result<(), CmgError> {
        let content = serde_json::to_vec_pretty(params)
            .map_err(|err| CmgError::Filesystem(err.to_string()))?;
        write_bytes_atomic(&self.params_path(&params.materialid), &content)
    }

    /// Replaces the identifier set wholesale.
    pub fn write_identifiers(
        &self,
        id: &MaterialId,
        identifiers: &IdentifierSet,
    ) -> Result<(), CmgError> {
        debug!(materialid = %id, count = identifiers.len(), "saving search results");
        let content = serde_json::to_vec(identifiers)
            .map_err(|err| CmgError::Filesystem(err.to_string()))?;
        write_bytes_atomic(&self.identifiers_path(id), &content)
    }

    pub fn read_identifiers(&self, id: &MaterialId) -> Result<IdentifierSet, CmgError> {
        let path = self.identifiers_path(id);
        let Some(content) = read_optional(&path)? else {
            debug!(materialid = %id, "no saved search results");
            return Ok(IdentifierSet::default());
        };
        let cids: Vec<Cid> = serde_json::from_str(&content).map_err(|err| corrupt(&path, err))?;
        let identifiers = IdentifierSet::from_cids(cids.iter().copied());
        if identifiers.len() != cids.len() {
            return Err(CmgError::StoreCorrupt {
                path: path.to_string(),
                reason: "duplicate CIDs in search results".to_string(),
            });
        }
        Ok(identifiers)
    }

    pub fn read_records(&self, id: &MaterialId) -> Result<RecordSet, CmgError> {
        let path = self.records_path(id);
        let file = match fs::File::open(path.as_std_path()) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(materialid = %id, "no saved compounds");
                return Ok(RecordSet::default());
            }
            Err(err) => return Err(CmgError::Filesystem(err.to_string())),
        };

        let mut records = RecordSet::default();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|err| CmgError::Filesystem(err.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: CompoundRecord =
                serde_json::from_str(&line).map_err(|err| CmgError::StoreCorrupt {
                    path: path.to_string(),
                    reason: format!("line {}: {err}", idx + 1),
                })?;
            let cid = record.cid;
            if !records.insert(record) {
                return Err(CmgError::StoreCorrupt {
                    path: path.to_string(),
                    reason: format!("duplicate record for CID {cid}"),
                });
            }
        }
        Ok(records)
    }

    /// Appends the records whose CID is not stored yet and returns how many
    /// were added. Loads the stored records first; use [`Self::append_records`]
    /// when they are already in memory.
    pub fn merge_records(
        &self,
        id: &MaterialId,
        new_records: Vec<CompoundRecord>,
    ) -> Result<usize, CmgError> {
        let mut records = self.read_records(id)?;
        self.append_records(id, &mut records, new_records)
    }

    /// Like [`Self::merge_records`], against `records` as last read or
    /// appended. Only the new lines are serialized; the stored bytes are
    /// copied as they are. The file is replaced through a temporary file, so
    /// either every new record lands or none does. `records` is updated only
    /// after the commit.
    pub fn append_records(
        &self,
        id: &MaterialId,
        records: &mut RecordSet,
        new_records: Vec<CompoundRecord>,
    ) -> Result<usize, CmgError> {
        let mut seen = HashSet::new();
        let added: Vec<CompoundRecord> = new_records
            .into_iter()
            .filter(|record| !records.contains(record.cid) && seen.insert(record.cid))
            .collect();
        if added.is_empty() {
            return Ok(0);
        }

        let path = self.records_path(id);
        let mut content = match fs::read(path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(CmgError::Filesystem(err.to_string())),
        };
        if !content.is_empty() && !content.ends_with(b"\n") {
            content.push(b'\n');
        }
        for record in &added {
            serde_json::to_writer(&mut content, record)
                .map_err(|err| CmgError::Filesystem(err.to_string()))?;
            content.push(b'\n');
        }
        write_bytes_atomic(&path, &content)?;

        let count = added.len();
        for record in added {
            records.insert(record);
        }
        debug!(materialid = %id, added = count, total = records.len(), "merged compounds");
        Ok(count)
    }

    /// Removes the identifier and record sets and resets the search marker.
    pub fn clear(&self, id: &MaterialId) -> Result<(), CmgError> {
        debug!(materialid = %id, "removing group data");
        remove_if_exists(&self.identifiers_path(id))?;
        remove_if_exists(&self.records_path(id))?;

        let params_path = self.params_path(id);
        if let Some(content) = read_optional(&params_path)? {
            let mut params: Params =
                serde_json::from_str(&content).map_err(|err| corrupt(&params_path, err))?;
            if params.current_update.take().is_some() {
                self.save_params(&params)?;
            }
        }
        Ok(())
    }
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), CmgError> {
    let parent = path
        .parent()
        .ok_or_else(|| CmgError::Filesystem(format!("invalid destination path: {path}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| CmgError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".cmg-write")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| CmgError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| CmgError::Filesystem(err.to_string()))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| CmgError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| CmgError::Filesystem(err.to_string()))?;
    Ok(())
}

fn read_optional(path: &Utf8Path) -> Result<Option<String>, CmgError> {
    match fs::read_to_string(path.as_std_path()) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(CmgError::Filesystem(err.to_string())),
    }
}

fn remove_if_exists(path: &Utf8Path) -> Result<(), CmgError> {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(CmgError::Filesystem(err.to_string())),
    }
}

fn corrupt(path: &Utf8Path, err: serde_json::Error) -> CmgError {
    CmgError::StoreCorrupt {
        path: path.to_string(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let store = Store::new(Some("/tmp/cmg-home"), "test").unwrap();
        assert!(store.data_dir().ends_with("test/data"));
        assert!(store.params_path().ends_with("test/params.json"));

        let groups = store.group_store();
        let id: MaterialId = "1012".parse().unwrap();
        assert!(groups.identifiers_path(&id).ends_with("data/1012_cids.json"));
        assert!(groups.records_path(&id).ends_with("data/1012_cpds.jsonl"));
    }

    #[test]
    fn project_name_cannot_escape_root() {
        assert!(Store::new(Some("/tmp/cmg-home"), "../elsewhere").is_err());
        assert!(Store::new(Some("/tmp/cmg-home"), " ").is_err());
    }

    #[test]
    fn identifier_set_drops_repeats() {
        let cids = [5, 3, 5, 9, 3].map(|value| Cid::new(value).unwrap());
        let set = IdentifierSet::from_cids(cids);
        let values: Vec<u64> = set.iter().map(|cid| cid.get()).collect();
        assert_eq!(values, vec![5, 3, 9]);
    }
}
