use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CmgError;
use crate::params::GroupDefinition;

/// Group definitions document. A bare JSON array of definitions is accepted
/// as well and treated as schema version 1.
#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub groups: Vec<GroupDefinition>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub groups: Vec<GroupDefinition>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads definitions from `path`, or from `default_path` (the project's
    /// `params.json`) when no explicit path is given.
    pub fn resolve(path: Option<&str>, default_path: &Utf8Path) -> Result<ResolvedConfig, CmgError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => default_path.as_std_path().to_path_buf(),
        };

        if path.is_none() && !config_path.exists() {
            return Err(CmgError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| CmgError::ConfigRead(config_path.clone()))?;
        let config = Self::parse(&content)?;

        Self::resolve_config(config)
    }

    pub fn parse(content: &str) -> Result<Config, CmgError> {
        let value: Value =
            serde_json::from_str(content).map_err(|err| CmgError::ConfigParse(err.to_string()))?;
        let config = if value.is_array() {
            Config {
                schema_version: None,
                groups: serde_json::from_value(value)
                    .map_err(|err| CmgError::ConfigParse(err.to_string()))?,
            }
        } else {
            serde_json::from_value(value).map_err(|err| CmgError::ConfigParse(err.to_string()))?
        };
        Ok(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, CmgError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(CmgError::ConfigParse(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let mut seen = HashSet::new();
        for group in &config.groups {
            group.validate()?;
            if !seen.insert(group.materialid.clone()) {
                return Err(CmgError::InvalidParams(format!(
                    "materialid {} is defined more than once",
                    group.materialid
                )));
            }
        }

        Ok(ResolvedConfig {
            schema_version,
            groups: config.groups,
        })
    }
}
