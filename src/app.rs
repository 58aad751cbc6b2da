use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::cmgroup::{CmGroup, GroupStatus};
use crate::config::ResolvedConfig;
use crate::domain::MaterialId;
use crate::error::CmgError;
use crate::export::{export_group, export_html};
use crate::params::GroupDefinition;
use crate::pubchem::{PropertyClient, SearchClient};
use crate::scheduler::{BatchOptions, BatchReport, BatchScheduler, GroupFailure, Throttle};
use crate::store::Store;

pub use crate::scheduler::{ProgressEvent, ProgressSink};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Delete every selected group's saved data before searching.
    pub clean_start: bool,
    pub resume: bool,
    pub wait: Duration,
    pub result_limit: Option<usize>,
    /// Restrict the run to these groups; empty means all of them.
    pub materialids: Vec<MaterialId>,
}

#[derive(Debug, Serialize)]
pub struct RunResult {
    pub project_root: String,
    #[serde(flatten)]
    pub report: BatchReport,
    pub exported: Vec<String>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.report.is_success()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub project_root: String,
    pub groups: Vec<GroupStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearResult {
    pub cleared: Vec<MaterialId>,
}

pub struct App<S: SearchClient, P: PropertyClient, T: Throttle> {
    store: Store,
    search: S,
    properties: P,
    scheduler: BatchScheduler<T>,
}

impl<S: SearchClient, P: PropertyClient, T: Throttle> App<S, P, T> {
    pub fn new(store: Store, search: S, properties: P, throttle: T) -> Self {
        Self {
            store,
            search,
            properties,
            scheduler: BatchScheduler::new(throttle),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Batch update of the selected groups, followed by a JSON and an HTML
    /// results export for every group that updated successfully.
    pub fn run(
        &self,
        config: &ResolvedConfig,
        options: &RunOptions,
        sink: &dyn ProgressSink,
    ) -> Result<RunResult, CmgError> {
        self.store.ensure_layout()?;
        let definitions = select_groups(config, &options.materialids)?;

        let mut groups = Vec::with_capacity(definitions.len());
        let mut failures = Vec::new();
        for definition in definitions {
            match CmGroup::new(definition, self.store.group_store()) {
                Ok(group) => groups.push(group),
                Err(error) => {
                    warn!(materialid = %definition.materialid, %error, "unable to load group");
                    failures.push(GroupFailure {
                        materialid: definition.materialid.clone(),
                        error,
                    });
                }
            }
        }

        if options.clean_start {
            sink.event(ProgressEvent {
                message: format!("clearing saved data of {} groups", groups.len()),
                elapsed: None,
            });
            for group in &mut groups {
                group.clear_data()?;
            }
        }

        let batch_options = BatchOptions {
            wait: options.wait,
            result_limit: options.result_limit,
            resume: options.resume,
        };
        let mut report = self.scheduler.run(
            &mut groups,
            &self.search,
            &self.properties,
            &batch_options,
            sink,
        );
        report.failures.splice(0..0, failures);

        let results_dir = self.store.results_dir();
        let mut exported = Vec::new();
        for outcome in &report.updated {
            let Some(group) = groups
                .iter()
                .find(|group| group.materialid() == &outcome.materialid)
            else {
                continue;
            };
            let written = export_group(group, &results_dir)
                .and_then(|json| Ok([json, export_html(group, &results_dir)?]));
            match written {
                Ok(paths) => exported.extend(paths.iter().map(|path| path.to_string())),
                Err(error) => {
                    warn!(materialid = %outcome.materialid, %error, "unable to export results");
                    report.failures.push(GroupFailure {
                        materialid: outcome.materialid.clone(),
                        error,
                    });
                }
            }
        }

        info!(
            updated = report.updated.len(),
            failed = report.failures.len(),
            exported = exported.len(),
            "run finished"
        );
        Ok(RunResult {
            project_root: self.store.project_root().to_string(),
            report,
            exported,
        })
    }

    pub fn status(
        &self,
        config: &ResolvedConfig,
        sink: &dyn ProgressSink,
    ) -> Result<StatusResult, CmgError> {
        sink.event(ProgressEvent {
            message: format!("reading {} groups", config.groups.len()),
            elapsed: None,
        });
        let mut groups = Vec::with_capacity(config.groups.len());
        for definition in &config.groups {
            let group = CmGroup::new(definition, self.store.group_store())?;
            groups.push(group.status()?);
        }
        Ok(StatusResult {
            project_root: self.store.project_root().to_string(),
            groups,
        })
    }

    /// Deletes the saved search results and records of the selected groups
    /// (all groups when `materialids` is empty).
    pub fn clear(
        &self,
        config: &ResolvedConfig,
        materialids: &[MaterialId],
        sink: &dyn ProgressSink,
    ) -> Result<ClearResult, CmgError> {
        let definitions = select_groups(config, materialids)?;
        let mut cleared = Vec::with_capacity(definitions.len());
        for definition in definitions {
            sink.event(ProgressEvent {
                message: format!("clearing {}", definition.materialid),
                elapsed: None,
            });
            let mut group = CmGroup::new(definition, self.store.group_store())?;
            group.clear_data()?;
            cleared.push(definition.materialid.clone());
        }
        Ok(ClearResult { cleared })
    }
}

/// Definitions in config order, narrowed to `materialids` when given.
fn select_groups<'a>(
    config: &'a ResolvedConfig,
    materialids: &[MaterialId],
) -> Result<Vec<&'a GroupDefinition>, CmgError> {
    if materialids.is_empty() {
        return Ok(config.groups.iter().collect());
    }
    let known: HashSet<&MaterialId> = config.groups.iter().map(|group| &group.materialid).collect();
    if let Some(unknown) = materialids.iter().find(|id| !known.contains(id)) {
        return Err(CmgError::GroupNotFound(unknown.to_string()));
    }
    Ok(config
        .groups
        .iter()
        .filter(|group| materialids.contains(&group.materialid))
        .collect())
}
