use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

use crate::cmgroup::CmGroup;
use crate::domain::{Cid, MaterialId};
use crate::error::CmgError;
use crate::params::Params;
use crate::pubchem::{compound_page_url, structure_image_url};
use crate::store::{CompoundRecord, write_bytes_atomic};

#[derive(Debug, Serialize)]
pub struct GroupExport {
    pub params: Params,
    pub num_compounds: usize,
    pub num_casrn: usize,
    /// Compounds created on or after the group's `last_updated` date.
    pub num_new: usize,
    pub compounds: Vec<ExportedCompound>,
}

#[derive(Debug, Serialize)]
pub struct ExportedCompound {
    pub casrn: Option<String>,
    pub iupac_name: Option<String>,
    pub cmg_id: MaterialId,
    pub action: &'static str,
    pub casrn_list: String,
    pub cid: Cid,
    pub creation_date: Option<NaiveDate>,
    pub is_new: bool,
}

impl ExportedCompound {
    fn from_record(record: &CompoundRecord, params: &Params) -> Self {
        // Same-day compounds count as new.
        let is_new = match (params.last_updated, record.creation_date) {
            (Some(last_updated), Some(created)) => created >= last_updated,
            _ => true,
        };
        Self {
            casrn: record.casrns.first().map(|casrn| casrn.to_string()),
            iupac_name: record.iupac_name.clone(),
            cmg_id: params.materialid.clone(),
            action: "add",
            casrn_list: record
                .casrns
                .iter()
                .map(|casrn| casrn.as_str())
                .collect::<Vec<_>>()
                .join(" "),
            cid: record.cid,
            creation_date: record.creation_date,
            is_new,
        }
    }
}

pub fn build_export(group: &CmGroup) -> Result<GroupExport, CmgError> {
    let params = group.params().clone();
    let compounds: Vec<ExportedCompound> = group
        .get_compounds()?
        .iter()
        .map(|record| ExportedCompound::from_record(record, &params))
        .collect();
    Ok(GroupExport {
        num_compounds: compounds.len(),
        num_casrn: compounds.iter().filter(|cpd| cpd.casrn.is_some()).count(),
        num_new: compounds.iter().filter(|cpd| cpd.is_new).count(),
        params,
        compounds,
    })
}

/// Writes `<results_dir>/<materialid>.json` and returns its path.
pub fn export_group(group: &CmGroup, results_dir: &Utf8Path) -> Result<Utf8PathBuf, CmgError> {
    let export = build_export(group)?;
    let path = results_dir.join(format!("{}.json", group.materialid()));
    let content = serde_json::to_vec_pretty(&export)
        .map_err(|err| CmgError::Filesystem(err.to_string()))?;
    write_bytes_atomic(&path, &content)?;
    info!(materialid = %group.materialid(), path = %path, "wrote results");
    Ok(path)
}

pub const IMAGE_SIZE: u32 = 500;

const PAGE_STYLE: &str = "body {font-family: monospace;} \
h1 {position: fixed; top: 8px; left: 8px;} \
table {width: 100%;} \
td {text-align: center; padding: 8px;}";

/// One linked structure image per CID, in the order given.
pub fn render_html(title: &str, cids: impl IntoIterator<Item = Cid>) -> Result<String, CmgError> {
    let title = escape_html(title);
    let mut html = format!(
        "<!doctype html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{title}</title>\n\
         <style>{PAGE_STYLE}</style>\n</head>\n<body>\n<h1>{title}</h1>\n<table>\n"
    );
    for cid in cids {
        let page = compound_page_url(cid)?;
        let image = structure_image_url(cid, IMAGE_SIZE)?;
        html.push_str(&format!(
            "<tr><td><a href=\"{}\"><img src=\"{}\" alt=\"CID {cid}\"></a></td></tr>\n",
            escape_html(page.as_str()),
            escape_html(image.as_str())
        ));
    }
    html.push_str("</table>\n</body>\n</html>\n");
    Ok(html)
}

/// Writes `<results_dir>/<materialid>.html` showing the group's compounds.
pub fn export_html(group: &CmGroup, results_dir: &Utf8Path) -> Result<Utf8PathBuf, CmgError> {
    let records = group.get_compounds()?;
    let title = match group.name() {
        Some(name) => format!("{}: {name}", group.materialid()),
        None => group.materialid().to_string(),
    };
    let html = render_html(&title, records.cids())?;
    let path = results_dir.join(format!("{}.html", group.materialid()));
    write_bytes_atomic(&path, html.as_bytes())?;
    info!(materialid = %group.materialid(), path = %path, "wrote structure page");
    Ok(path)
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::GroupDefinition;

    #[test]
    fn compounds_older_than_last_update_are_not_new() {
        let mut definition =
            GroupDefinition::new("1012".parse().unwrap(), "Mercury compounds", "[Hg]");
        definition.last_updated = NaiveDate::from_ymd_opt(2016, 8, 1);
        let params = Params::from_definition(&definition);

        let mut old = CompoundRecord::new(Cid::new(23931).unwrap());
        old.creation_date = NaiveDate::from_ymd_opt(2005, 3, 26);
        let mut same_day = CompoundRecord::new(Cid::new(24085).unwrap());
        same_day.creation_date = NaiveDate::from_ymd_opt(2016, 8, 1);
        let undated = CompoundRecord::new(Cid::new(24086).unwrap());

        assert!(!ExportedCompound::from_record(&old, &params).is_new);
        assert!(ExportedCompound::from_record(&same_day, &params).is_new);
        assert!(ExportedCompound::from_record(&undated, &params).is_new);
    }

    #[test]
    fn html_page_links_structure_images() {
        let cids = [Cid::new(23931).unwrap(), Cid::new(24085).unwrap()];
        let html = render_html("1012: Hg & <salts>", cids).unwrap();

        assert!(html.starts_with("<!doctype html>"));
        assert!(html.contains("<h1>1012: Hg &amp; &lt;salts&gt;</h1>"));
        assert!(html.contains(
            "<a href=\"https://pubchem.ncbi.nlm.nih.gov/compound/23931\">\
             <img src=\"https://pubchem.ncbi.nlm.nih.gov/image/imagefly.cgi?cid=23931&amp;width=500&amp;height=500\""
        ));
        assert_eq!(html.matches("<tr>").count(), 2);
        assert!(html.find("cid=23931").unwrap() < html.find("cid=24085").unwrap());
    }

    #[test]
    fn empty_group_renders_empty_table() {
        let html = render_html("1013", Vec::<Cid>::new()).unwrap();
        assert!(html.contains("<table>\n</table>"));
    }
}
