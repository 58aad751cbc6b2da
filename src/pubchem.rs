use std::thread;
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::Url;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::casrn;
use crate::domain::{Casrn, Cid};
use crate::error::CmgError;
use crate::params::SearchQuery;
use crate::store::CompoundRecord;

pub const PUG_BASE: &str = "https://pubchem.ncbi.nlm.nih.gov/rest/pug";
pub const PUG_VIEW_BASE: &str = "https://pubchem.ncbi.nlm.nih.gov/rest/pug_view";
pub const SITE_BASE: &str = "https://pubchem.ncbi.nlm.nih.gov";

/// Resolves a structure query into candidate CIDs.
pub trait SearchClient: Send + Sync {
    /// Returns at most `limit` CIDs when a limit is given.
    fn search(&self, query: &SearchQuery, limit: Option<usize>) -> Result<Vec<Cid>, CmgError>;
}

/// Looks up the property record of a single CID.
pub trait PropertyClient: Send + Sync {
    fn fetch(&self, cid: Cid) -> Result<CompoundRecord, CmgError>;
}

/// Answer of the search and ListKey endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListKeyStatus {
    Waiting(String),
    Ready(Vec<Cid>),
}

#[derive(Clone)]
pub struct PubchemHttpClient {
    client: Client,
    pug_base: String,
    pug_view_base: String,
    poll_interval: Duration,
    max_polls: usize,
    request_pause: Duration,
}

impl PubchemHttpClient {
    pub fn new() -> Result<Self, CmgError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("commongroups/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| CmgError::PubchemHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| CmgError::PubchemHttp(err.to_string()))?;
        Ok(Self {
            client,
            pug_base: PUG_BASE.to_string(),
            pug_view_base: PUG_VIEW_BASE.to_string(),
            poll_interval: Duration::from_secs(10),
            max_polls: 30,
            request_pause: Duration::from_millis(200),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration, max_polls: usize) -> Self {
        self.poll_interval = poll_interval;
        self.max_polls = max_polls;
        self
    }

    pub fn search_url(&self, query: &SearchQuery) -> Result<Url, CmgError> {
        let searchtype = query.searchtype.to_string();
        let structtype = query.structtype.to_string();
        pug_url(
            &self.pug_base,
            &[
                "compound",
                &searchtype,
                &structtype,
                &query.searchstring,
                "JSON",
            ],
        )
    }

    pub fn listkey_url(&self, listkey: &str, limit: Option<usize>) -> Result<Url, CmgError> {
        let mut url = pug_url(
            &self.pug_base,
            &["compound", "listkey", listkey, "cids", "JSON"],
        )?;
        if let Some(limit) = limit {
            url.query_pairs_mut()
                .append_pair("listkey_count", &limit.to_string());
        }
        Ok(url)
    }

    fn compound_url(&self, cid: Cid, tail: &[&str]) -> Result<Url, CmgError> {
        let cid = cid.to_string();
        let mut segments = vec!["compound", "cid", cid.as_str()];
        segments.extend_from_slice(tail);
        pug_url(&self.pug_base, &segments)
    }

    fn cas_view_url(&self, cid: Cid) -> Result<Url, CmgError> {
        let cid = cid.to_string();
        let mut url = pug_url(&self.pug_view_base, &["data", "compound", &cid, "JSON"])?;
        url.query_pairs_mut().append_pair("heading", "CAS");
        Ok(url)
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, CmgError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        debug!(status, delay_ms = delay, "PubChem busy; retrying");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(CmgError::PubchemHttp(err.to_string()));
                }
            }
        }
    }

    fn get_json(&self, url: &Url) -> Result<Option<Value>, CmgError> {
        debug!(%url, "PubChem request");
        let response = self.send_with_retries(|| self.client.get(url.clone()))?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let response = handle_status(response)?;
        let value = response
            .json()
            .map_err(|err| CmgError::PubchemHttp(err.to_string()))?;
        Ok(Some(value))
    }

    fn creation_date(&self, cid: Cid) -> Result<Option<NaiveDate>, CmgError> {
        let url = self.compound_url(cid, &["dates", "JSON"])?;
        let created = self.get_json(&url)?.as_ref().and_then(extract_creation_date);
        if created.is_none() {
            warn!(%cid, "could not retrieve creation date");
        }
        Ok(created)
    }

    fn known_casrns(&self, cid: Cid) -> Result<Vec<Casrn>, CmgError> {
        let url = self.cas_view_url(cid)?;
        Ok(self
            .get_json(&url)?
            .map(|value| extract_known_casrns(&value))
            .unwrap_or_default())
    }

    fn synonym_casrns(&self, cid: Cid) -> Result<Vec<Casrn>, CmgError> {
        let url = self.compound_url(cid, &["synonyms", "JSON"])?;
        let synonyms = self
            .get_json(&url)?
            .map(|value| extract_synonyms(&value))
            .unwrap_or_default();
        Ok(casrn::find_valid(&synonyms.join(" ")))
    }

    fn iupac_name(&self, cid: Cid) -> Result<Option<String>, CmgError> {
        let url = self.compound_url(cid, &["property", "IUPACName", "JSON"])?;
        Ok(self.get_json(&url)?.as_ref().and_then(extract_iupac_name))
    }

    /// Calls `poll` up to `max_polls` times, sleeping `poll_interval` before
    /// each call, until the ListKey results are ready.
    fn poll_listkey<F>(&self, listkey: &str, mut poll: F) -> Result<Vec<Cid>, CmgError>
    where
        F: FnMut() -> Result<Value, CmgError>,
    {
        for attempt in 1..=self.max_polls {
            thread::sleep(self.poll_interval);
            match parse_listkey_response(&poll()?)? {
                ListKeyStatus::Ready(cids) => return Ok(cids),
                ListKeyStatus::Waiting(_) => {
                    debug!(%listkey, attempt, "search results not ready");
                }
            }
        }
        Err(CmgError::SearchFailed(format!(
            "results for ListKey {listkey} not ready after {} polls",
            self.max_polls
        )))
    }

    fn pause(&self) {
        if !self.request_pause.is_zero() {
            thread::sleep(self.request_pause);
        }
    }
}

impl SearchClient for PubchemHttpClient {
    fn search(&self, query: &SearchQuery, limit: Option<usize>) -> Result<Vec<Cid>, CmgError> {
        let url = self.search_url(query)?;
        info!(searchtype = %query.searchtype, query = %query.searchstring, "starting PubChem search");
        let response = self.send_with_retries(|| self.client.get(url.clone()))?;
        let body = search_body(response)?;

        let listkey = match parse_listkey_response(&body)? {
            ListKeyStatus::Ready(cids) => return Ok(truncate(cids, limit)),
            ListKeyStatus::Waiting(listkey) => listkey,
        };
        debug!(%listkey, "search accepted");

        let url = self.listkey_url(&listkey, limit)?;
        let cids = self.poll_listkey(&listkey, || {
            let response = self.send_with_retries(|| self.client.get(url.clone()))?;
            search_body(response)
        })?;
        info!(count = cids.len(), "PubChem search returned results");
        Ok(truncate(cids, limit))
    }
}

impl PropertyClient for PubchemHttpClient {
    fn fetch(&self, cid: Cid) -> Result<CompoundRecord, CmgError> {
        let creation_date = self.creation_date(cid)?;
        self.pause();
        let mut casrns = self.known_casrns(cid)?;
        self.pause();
        for found in self.synonym_casrns(cid)? {
            if !casrns.contains(&found) {
                casrns.push(found);
            }
        }
        self.pause();
        let iupac_name = self.iupac_name(cid)?;
        self.pause();

        debug!(%cid, casrns = casrns.len(), "retrieved compound");
        Ok(CompoundRecord {
            cid,
            casrns,
            iupac_name,
            creation_date,
        })
    }
}

pub fn compound_page_url(cid: Cid) -> Result<Url, CmgError> {
    pug_url(SITE_BASE, &["compound", &cid.to_string()])
}

/// Square structure depiction rendered by PubChem, `size` pixels wide.
pub fn structure_image_url(cid: Cid, size: u32) -> Result<Url, CmgError> {
    let mut url = pug_url(SITE_BASE, &["image", "imagefly.cgi"])?;
    url.query_pairs_mut()
        .append_pair("cid", &cid.to_string())
        .append_pair("width", &size.to_string())
        .append_pair("height", &size.to_string());
    Ok(url)
}

fn pug_url(base: &str, segments: &[&str]) -> Result<Url, CmgError> {
    let mut url = Url::parse(base).map_err(|err| CmgError::PubchemHttp(err.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| CmgError::PubchemHttp(format!("cannot extend base URL {base}")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn handle_status(response: Response) -> Result<Response, CmgError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response
        .text()
        .unwrap_or_else(|_| "PubChem request failed".to_string());
    Err(CmgError::PubchemStatus { status, message })
}

/// PubChem answers a search without hits with 404 and a `PUGREST.NotFound`
/// fault, so that body is read instead of being turned into a status error.
fn search_body(response: Response) -> Result<Value, CmgError> {
    let response = if response.status().as_u16() == 404 {
        response
    } else {
        handle_status(response)?
    };
    response
        .json()
        .map_err(|err| CmgError::PubchemHttp(err.to_string()))
}

fn truncate(mut cids: Vec<Cid>, limit: Option<usize>) -> Vec<Cid> {
    if let Some(limit) = limit {
        cids.truncate(limit);
    }
    cids
}

/// Interprets a search or ListKey response body.
pub fn parse_listkey_response(body: &Value) -> Result<ListKeyStatus, CmgError> {
    if let Some(fault) = body.get("Fault") {
        if fault.get("Code").and_then(|value| value.as_str()) == Some("PUGREST.NotFound") {
            return Ok(ListKeyStatus::Ready(Vec::new()));
        }
        let message = fault
            .get("Message")
            .and_then(|value| value.as_str())
            .unwrap_or("unknown fault");
        let details = fault
            .get("Details")
            .and_then(|value| value.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str())
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .unwrap_or_default();
        return Err(CmgError::SearchFailed(if details.is_empty() {
            message.to_string()
        } else {
            format!("{message}: {details}")
        }));
    }

    if let Some(listkey) = body.get("Waiting").and_then(|value| value.get("ListKey")) {
        let listkey = match listkey {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        return Ok(ListKeyStatus::Waiting(listkey));
    }

    let Some(items) = body
        .get("IdentifierList")
        .and_then(|value| value.get("CID"))
        .and_then(|value| value.as_array())
    else {
        return Err(CmgError::SearchFailed(format!(
            "unexpected search response: {body}"
        )));
    };
    let cids = items
        .iter()
        .filter_map(|item| item.as_u64())
        .filter_map(|value| Cid::new(value).ok())
        .collect();
    Ok(ListKeyStatus::Ready(cids))
}

pub fn extract_creation_date(body: &Value) -> Option<NaiveDate> {
    let date = body
        .get("InformationList")?
        .get("Information")?
        .as_array()?
        .first()?
        .get("CreationDate")?;
    let part = |key: &str| date.get(key).and_then(|value| value.as_u64());
    NaiveDate::from_ymd_opt(
        i32::try_from(part("Year")?).ok()?,
        u32::try_from(part("Month")?).ok()?,
        u32::try_from(part("Day")?).ok()?,
    )
}

pub fn extract_synonyms(body: &Value) -> Vec<String> {
    body.get("InformationList")
        .and_then(|value| value.get("Information"))
        .and_then(|value| value.as_array())
        .and_then(|items| items.first())
        .and_then(|item| item.get("Synonym"))
        .and_then(|value| value.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str())
                .map(|item| item.to_string())
                .collect()
        })
        .unwrap_or_default()
}

pub fn extract_iupac_name(body: &Value) -> Option<String> {
    body.get("PropertyTable")?
        .get("Properties")?
        .as_array()?
        .first()?
        .get("IUPACName")?
        .as_str()
        .map(|value| value.to_string())
}

/// Collects the CAS numbers PubChem designates explicitly, i.e. the strings
/// found under any section headed `CAS`. Invalid numbers are dropped.
pub fn extract_known_casrns(body: &Value) -> Vec<Casrn> {
    let mut found = Vec::new();
    collect_cas_sections(body, false, &mut found);
    let mut casrns: Vec<Casrn> = Vec::new();
    for value in found {
        match value.parse::<Casrn>() {
            Ok(casrn) if !casrns.contains(&casrn) => casrns.push(casrn),
            Ok(_) => {}
            Err(_) => debug!(value = %value, "ignoring invalid CAS number"),
        }
    }
    casrns
}

fn collect_cas_sections(node: &Value, in_cas: bool, found: &mut Vec<String>) {
    match node {
        Value::Object(map) => {
            let heading = map.get("TOCHeading").and_then(|value| value.as_str());
            let in_cas = in_cas || heading == Some("CAS");
            if in_cas {
                if let Some(text) = map.get("String").and_then(|value| value.as_str()) {
                    found.push(text.to_string());
                }
            }
            for value in map.values() {
                collect_cas_sections(value, in_cas, found);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_cas_sections(item, in_cas, found);
            }
        }
        _ => {}
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::domain::{SearchType, StructType};

    fn query(searchstring: &str) -> SearchQuery {
        SearchQuery {
            searchtype: SearchType::Substructure,
            structtype: StructType::Smiles,
            searchstring: searchstring.to_string(),
        }
    }

    #[test]
    fn search_url_encodes_query() {
        let client = PubchemHttpClient::new().unwrap();
        let url = client.search_url(&query("C/C=C/Cl")).unwrap();
        assert_eq!(
            url.as_str(),
            "https://pubchem.ncbi.nlm.nih.gov/rest/pug/compound/substructure/smiles/C%2FC=C%2FCl/JSON"
        );
    }

    #[test]
    fn listkey_url_carries_limit() {
        let client = PubchemHttpClient::new().unwrap();
        let url = client.listkey_url("123456789", Some(5)).unwrap();
        assert_eq!(
            url.as_str(),
            "https://pubchem.ncbi.nlm.nih.gov/rest/pug/compound/listkey/123456789/cids/JSON?listkey_count=5"
        );
    }

    #[test]
    fn site_urls_for_compound() {
        let cid = Cid::new(23931).unwrap();
        assert_eq!(
            compound_page_url(cid).unwrap().as_str(),
            "https://pubchem.ncbi.nlm.nih.gov/compound/23931"
        );
        assert_eq!(
            structure_image_url(cid, 500).unwrap().as_str(),
            "https://pubchem.ncbi.nlm.nih.gov/image/imagefly.cgi?cid=23931&width=500&height=500"
        );
    }

    #[test]
    fn parse_waiting_and_ready() {
        let waiting = json!({"Waiting": {"ListKey": 2769838442146036512u64, "Message": "Your search is running"}});
        assert_eq!(
            parse_listkey_response(&waiting).unwrap(),
            ListKeyStatus::Waiting("2769838442146036512".to_string())
        );

        let ready = json!({"IdentifierList": {"CID": [23931, 24085, 0]}});
        let ListKeyStatus::Ready(cids) = parse_listkey_response(&ready).unwrap() else {
            panic!("expected ready results");
        };
        assert_eq!(cids.iter().map(|cid| cid.get()).collect::<Vec<_>>(), vec![23931, 24085]);
    }

    #[test]
    fn parse_fault() {
        let fault = json!({"Fault": {"Code": "PUGREST.BadRequest", "Message": "Unable to standardize the given structure", "Details": ["bad SMILES"]}});
        assert_matches!(parse_listkey_response(&fault), Err(CmgError::SearchFailed(message)) if message.contains("bad SMILES"));
    }

    #[test]
    fn polling_stops_after_max_polls() {
        let client = PubchemHttpClient::new()
            .unwrap()
            .with_poll_interval(Duration::ZERO, 3);
        let mut calls = 0;
        let err = client
            .poll_listkey("42", || {
                calls += 1;
                Ok(json!({"Waiting": {"ListKey": "42"}}))
            })
            .unwrap_err();
        assert_eq!(calls, 3);
        assert_matches!(err, CmgError::SearchFailed(message) if message.ends_with("after 3 polls"));

        let mut calls = 0;
        let cids = client
            .poll_listkey("42", || {
                calls += 1;
                if calls < 2 {
                    Ok(json!({"Waiting": {"ListKey": "42"}}))
                } else {
                    Ok(json!({"IdentifierList": {"CID": [702]}}))
                }
            })
            .unwrap();
        assert_eq!(calls, 2);
        assert_eq!(cids, vec![Cid::new(702).unwrap()]);
    }

    #[test]
    fn not_found_fault_means_no_hits() {
        let fault = json!({"Fault": {"Code": "PUGREST.NotFound", "Message": "No CID found"}});
        assert_eq!(
            parse_listkey_response(&fault).unwrap(),
            ListKeyStatus::Ready(Vec::new())
        );
    }

    #[test]
    fn unrecognized_response_is_an_error() {
        assert_matches!(
            parse_listkey_response(&json!({})),
            Err(CmgError::SearchFailed(message)) if message.starts_with("unexpected search response")
        );
        assert_matches!(
            parse_listkey_response(&json!({"IdentifierList": {"Size": 3}})),
            Err(CmgError::SearchFailed(_))
        );
        assert_eq!(
            parse_listkey_response(&json!({"IdentifierList": {"CID": []}})).unwrap(),
            ListKeyStatus::Ready(Vec::new())
        );
    }

    #[test]
    fn extract_compound_fields() {
        let dates = json!({"InformationList": {"Information": [{"CID": 712, "CreationDate": {"Year": 2005, "Month": 3, "Day": 26}}]}});
        assert_eq!(
            extract_creation_date(&dates),
            NaiveDate::from_ymd_opt(2005, 3, 26)
        );

        let props = json!({"PropertyTable": {"Properties": [{"CID": 712, "IUPACName": "formaldehyde"}]}});
        assert_eq!(extract_iupac_name(&props).as_deref(), Some("formaldehyde"));

        let synonyms = json!({"InformationList": {"Information": [{"CID": 712, "Synonym": ["formaldehyde", "50-00-0", "Formalin"]}]}});
        assert_eq!(extract_synonyms(&synonyms).len(), 3);
    }

    #[test]
    fn known_casrns_come_from_cas_sections() {
        let view = json!({
            "Record": {
                "Section": [{
                    "TOCHeading": "Names and Identifiers",
                    "Section": [{
                        "TOCHeading": "Other Identifiers",
                        "Section": [{
                            "TOCHeading": "CAS",
                            "Information": [
                                {"Value": {"StringWithMarkup": [{"String": "50-00-0"}]}},
                                {"Value": {"StringWithMarkup": [{"String": "50-00-5"}]}},
                                {"Value": {"StringWithMarkup": [{"String": "50-00-0"}]}}
                            ]
                        }]
                    }, {
                        "TOCHeading": "Synonyms",
                        "Information": [{"Value": {"StringWithMarkup": [{"String": "7732-18-5"}]}}]
                    }]
                }]
            }
        });
        let casrns = extract_known_casrns(&view);
        assert_eq!(casrns.len(), 1);
        assert_eq!(casrns[0].as_str(), "50-00-0");
    }
}
