mod common;

use std::fs;

use assert_matches::assert_matches;
use serde_json::Value;

use commongroups::app::{App, RunOptions};
use commongroups::cmgroup::GroupState;
use commongroups::config::ResolvedConfig;
use commongroups::domain::{Casrn, Cid};
use commongroups::error::CmgError;
use commongroups::output::JsonOutput;
use commongroups::pubchem::PropertyClient;
use commongroups::store::CompoundRecord;

use common::{MockProperties, MockSearch, RecordingThrottle, definition, materialid, temp_store};

fn config() -> ResolvedConfig {
    ResolvedConfig {
        schema_version: 1,
        groups: vec![definition("1012", "[Hg]"), definition("1013", "[Pb]")],
    }
}

fn search() -> MockSearch {
    MockSearch::default()
        .with("[Hg]", &[23931, 24085])
        .with("[Pb]", &[5352425])
}

struct CasProperties;

impl PropertyClient for CasProperties {
    fn fetch(&self, cid: Cid) -> Result<CompoundRecord, CmgError> {
        let mut record = CompoundRecord::new(cid);
        if cid.get() == 23931 {
            record.casrns = vec![
                "7439-97-6".parse::<Casrn>().unwrap(),
                "7732-18-5".parse::<Casrn>().unwrap(),
            ];
            record.iupac_name = Some("mercury".to_string());
        }
        Ok(record)
    }
}

#[test]
fn run_writes_results_summary() {
    let (_temp, store) = temp_store();
    let results_dir = store.results_dir();
    let app = App::new(store, search(), CasProperties, RecordingThrottle::default());

    let result = app
        .run(&config(), &RunOptions::default(), &JsonOutput)
        .unwrap();
    assert!(result.is_success());
    assert_eq!(result.exported.len(), 4);
    assert!(result.exported.iter().any(|path| path.ends_with("1013.html")));

    let summary: Value =
        serde_json::from_str(&fs::read_to_string(results_dir.join("1012.json")).unwrap())
            .unwrap();
    assert_eq!(summary["num_compounds"], 2);
    assert_eq!(summary["num_casrn"], 1);
    assert_eq!(summary["params"]["materialid"], "1012");
    let first = &summary["compounds"][0];
    assert_eq!(first["cid"], 23931);
    assert_eq!(first["casrn"], "7439-97-6");
    assert_eq!(first["casrn_list"], "7439-97-6 7732-18-5");
    assert_eq!(first["cmg_id"], "1012");
    assert_eq!(first["action"], "add");
    assert_eq!(summary["compounds"][1]["casrn"], Value::Null);

    let page = fs::read_to_string(results_dir.join("1012.html")).unwrap();
    assert!(page.contains("<h1>1012"));
    assert!(page.contains("imagefly.cgi?cid=23931&amp;width=500&amp;height=500"));
    assert!(page.contains("https://pubchem.ncbi.nlm.nih.gov/compound/24085"));
    assert!(!page.contains("5352425"));
}

#[test]
fn run_selected_groups_only() {
    let (_temp, store) = temp_store();
    let search = search();
    let app = App::new(store, search, MockProperties::default(), RecordingThrottle::default());
    let options = RunOptions {
        materialids: vec![materialid("1013")],
        ..RunOptions::default()
    };

    let result = app.run(&config(), &options, &JsonOutput).unwrap();

    assert_eq!(result.report.updated.len(), 1);
    assert_eq!(result.report.updated[0].materialid, materialid("1013"));
}

#[test]
fn run_unknown_group_is_not_found() {
    let (_temp, store) = temp_store();
    let app = App::new(
        store,
        search(),
        MockProperties::default(),
        RecordingThrottle::default(),
    );
    let options = RunOptions {
        materialids: vec![materialid("9999")],
        ..RunOptions::default()
    };

    let err = app.run(&config(), &options, &JsonOutput).unwrap_err();
    assert_matches!(err, CmgError::GroupNotFound(_));
}

#[test]
fn corrupt_snapshot_fails_only_its_group() {
    let (_temp, store) = temp_store();
    let params_path = store.group_store().params_path(&materialid("1012"));
    fs::write(params_path.as_std_path(), "{\"materialid\": ").unwrap();
    let app = App::new(
        store,
        search(),
        MockProperties::default(),
        RecordingThrottle::default(),
    );

    let result = app
        .run(&config(), &RunOptions::default(), &JsonOutput)
        .unwrap();

    assert!(!result.is_success());
    assert_eq!(result.report.failures[0].materialid, materialid("1012"));
    assert_matches!(result.report.failures[0].error, CmgError::StoreCorrupt { .. });
    assert_eq!(result.report.updated.len(), 1);
}

#[test]
fn status_and_clear() {
    let (_temp, store) = temp_store();
    let app = App::new(
        store,
        search(),
        MockProperties::default(),
        RecordingThrottle::default(),
    );
    let before = app.status(&config(), &JsonOutput).unwrap();
    assert!(
        before
            .groups
            .iter()
            .all(|group| group.state == GroupState::Uninitialized)
    );

    app.run(&config(), &RunOptions::default(), &JsonOutput)
        .unwrap();
    let after = app.status(&config(), &JsonOutput).unwrap();
    assert_eq!(after.groups[0].state, GroupState::Idle);
    assert_eq!(after.groups[0].records, 2);

    let cleared = app
        .clear(&config(), &[materialid("1012")], &JsonOutput)
        .unwrap();
    assert_eq!(cleared.cleared, vec![materialid("1012")]);
    let status = app.status(&config(), &JsonOutput).unwrap();
    assert_eq!(status.groups[0].state, GroupState::Uninitialized);
    assert_eq!(status.groups[1].state, GroupState::Idle);
}

#[test]
fn clean_start_refetches_everything() {
    let (_temp, store) = temp_store();
    let properties = MockProperties::default();
    let app = App::new(store, search(), &properties, RecordingThrottle::default());

    app.run(&config(), &RunOptions::default(), &JsonOutput)
        .unwrap();
    app.run(&config(), &RunOptions::default(), &JsonOutput)
        .unwrap();
    assert_eq!(properties.fetched().len(), 3);

    let options = RunOptions {
        clean_start: true,
        ..RunOptions::default()
    };
    app.run(&config(), &options, &JsonOutput).unwrap();
    assert_eq!(properties.fetched().len(), 6);
}
