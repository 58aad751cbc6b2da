use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::CmgError;

/// Stable key of a chemical/material group. Every persisted artifact of a
/// group is addressed by it, so it must be usable as a file name stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MaterialId(String);

impl MaterialId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MaterialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MaterialId {
    type Err = CmgError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
        if !is_valid {
            return Err(CmgError::InvalidMaterialId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for MaterialId {
    type Error = CmgError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MaterialId> for String {
    fn from(value: MaterialId) -> Self {
        value.0
    }
}

/// PubChem compound identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "u64", into = "u64")]
pub struct Cid(u64);

impl Cid {
    pub fn new(value: u64) -> Result<Self, CmgError> {
        if value == 0 {
            return Err(CmgError::InvalidCid(value.to_string()));
        }
        Ok(Self(value))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u64> for Cid {
    type Error = CmgError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Cid> for u64 {
    fn from(value: Cid) -> Self {
        value.0
    }
}

impl FromStr for Cid {
    type Err = CmgError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parsed = value
            .trim()
            .parse::<u64>()
            .map_err(|_| CmgError::InvalidCid(value.to_string()))?;
        Self::new(parsed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    #[default]
    Substructure,
    Superstructure,
    Similarity,
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchType::Substructure => write!(f, "substructure"),
            SearchType::Superstructure => write!(f, "superstructure"),
            SearchType::Similarity => write!(f, "similarity"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StructType {
    #[default]
    Smiles,
    Smarts,
    Inchi,
}

impl fmt::Display for StructType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructType::Smiles => write!(f, "smiles"),
            StructType::Smarts => write!(f, "smarts"),
            StructType::Inchi => write!(f, "inchi"),
        }
    }
}

/// A CAS Registry Number that passed check-digit validation, stored in the
/// canonical `NNNNNNN-NN-N` hyphenation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Casrn(String);

impl Casrn {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Casrn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Casrn {
    type Err = CmgError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        crate::casrn::normalize(value)
            .map(Self)
            .ok_or_else(|| CmgError::InvalidParams(format!("invalid CAS number: {value}")))
    }
}

impl TryFrom<String> for Casrn {
    type Error = CmgError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Casrn> for String {
    fn from(value: Casrn) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_materialid_trims() {
        let id: MaterialId = " 1012 ".parse().unwrap();
        assert_eq!(id.as_str(), "1012");
    }

    #[test]
    fn parse_materialid_rejects_path_separators() {
        let err = "../1012".parse::<MaterialId>().unwrap_err();
        assert_matches!(err, CmgError::InvalidMaterialId(_));
        assert!("".parse::<MaterialId>().is_err());
    }

    #[test]
    fn parse_cid() {
        let cid: Cid = "2244".parse().unwrap();
        assert_eq!(cid.get(), 2244);
        assert_matches!("0".parse::<Cid>(), Err(CmgError::InvalidCid(_)));
        assert_matches!("aspirin".parse::<Cid>(), Err(CmgError::InvalidCid(_)));
    }

    #[test]
    fn cid_serializes_as_number() {
        let cid: Cid = "702".parse().unwrap();
        assert_eq!(serde_json::to_string(&cid).unwrap(), "702");
        assert_eq!(serde_json::from_str::<Cid>("702").unwrap(), cid);
        assert!(serde_json::from_str::<Cid>("0").is_err());
    }

    #[test]
    fn casrn_normalizes_hyphenation() {
        let casrn: Casrn = "50--00--0 ".parse().unwrap();
        assert_eq!(casrn.as_str(), "50-00-0");
        assert!("50-00-5".parse::<Casrn>().is_err());
    }
}
