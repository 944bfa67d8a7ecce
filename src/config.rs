use std::collections::BTreeMap;
use std::fs;
use std::sync::LazyLock;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{
    Archiver, CatalogEndpoint, Credentials, FormatParams, OutputFormat, PackageOptions, QuerySpec,
};
use crate::error::ExportError;

pub const STORAGE_ENV: &str = "CATALOG_EXPORT_STORAGE";
pub const DEFAULT_CATALOG_ID: &str = "1";

static SCHEME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*://").expect("valid scheme regex"));

#[derive(Debug, Deserialize, Serialize)]
pub struct JobConfig {
    pub catalog: Option<CatalogConfig>,
    #[serde(default)]
    pub bag: Option<BagConfig>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CatalogConfig {
    pub host: Option<String>,
    pub path: Option<String>,
    #[serde(default)]
    pub catalog_id: Option<Value>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub queries: Option<Vec<QueryConfig>>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct QueryConfig {
    pub query_path: Option<String>,
    #[serde(default)]
    pub output_name: Option<String>,
    pub output_path: Option<String>,
    pub output_format: Option<String>,
    #[serde(default)]
    pub output_format_params: Option<Value>,
    #[serde(default)]
    pub schema_path: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BagConfig {
    #[serde(default)]
    pub bag_name: Option<String>,
    #[serde(default = "default_archiver_value")]
    pub bag_archiver: Option<String>,
    #[serde(default)]
    pub bag_metadata: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub create_ro_metadata: Option<bool>,
}

impl Default for BagConfig {
    fn default() -> Self {
        Self {
            bag_name: None,
            bag_archiver: default_archiver_value(),
            bag_metadata: None,
            create_ro_metadata: None,
        }
    }
}

fn default_archiver_value() -> Option<String> {
    Some("zip".to_string())
}

/// A job configuration that has passed every check that can be made without
/// touching the network.
#[derive(Debug, Clone)]
pub struct ResolvedJob {
    pub endpoint: CatalogEndpoint,
    pub credentials: Credentials,
    pub queries: Vec<QuerySpec>,
    pub package: PackageOptions,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: &str) -> Result<ResolvedJob, ExportError> {
        let content = fs::read_to_string(path)
            .map_err(|err| ExportError::Configuration(format!("read {path}: {err}")))?;
        Self::resolve_str(&content)
    }

    pub fn resolve_str(content: &str) -> Result<ResolvedJob, ExportError> {
        let config: JobConfig = serde_json::from_str(content)
            .map_err(|err| ExportError::Configuration(err.to_string()))?;
        Self::resolve_config(config)
    }

    pub fn resolve_config(config: JobConfig) -> Result<ResolvedJob, ExportError> {
        let catalog = config.catalog.ok_or_else(|| missing("catalog"))?;
        let host = catalog
            .host
            .filter(|host| !host.trim().is_empty())
            .ok_or_else(|| missing("catalog.host"))?;
        let path = catalog.path.ok_or_else(|| missing("catalog.path"))?;
        let catalog_id = match catalog.catalog_id {
            None | Some(Value::Null) => DEFAULT_CATALOG_ID.to_string(),
            Some(Value::String(id)) => id,
            Some(Value::Number(id)) => id.to_string(),
            Some(other) => {
                return Err(ExportError::Configuration(format!(
                    "catalog.catalog_id must be a string or number, got {other}"
                )));
            }
        };

        let credentials = match (catalog.username, catalog.password, catalog.token) {
            (Some(username), Some(password), _) => Credentials::Login { username, password },
            (Some(_), None, _) | (None, Some(_), _) => {
                return Err(ExportError::Configuration(
                    "catalog.username and catalog.password must be supplied together".to_string(),
                ));
            }
            (None, None, Some(token)) => Credentials::Token(token),
            (None, None, None) => Credentials::Anonymous,
        };

        let queries = catalog
            .queries
            .ok_or_else(|| missing("catalog.queries"))?
            .into_iter()
            .enumerate()
            .map(|(index, query)| resolve_query(index, query))
            .collect::<Result<Vec<_>, ExportError>>()?;

        let bag = config.bag.unwrap_or_default();
        let archiver = match bag.bag_archiver {
            Some(value) => Some(value.parse::<Archiver>()?),
            None => None,
        };
        let metadata = bag
            .bag_metadata
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::String(text) => text,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect();

        Ok(ResolvedJob {
            endpoint: CatalogEndpoint {
                host: normalize_host(&host),
                path,
                catalog_id,
            },
            credentials,
            queries,
            package: PackageOptions {
                name: bag.bag_name.unwrap_or_else(default_package_name),
                archiver,
                metadata,
                create_ro_metadata: bag.create_ro_metadata.unwrap_or(true),
            },
        })
    }
}

fn resolve_query(index: usize, query: QueryConfig) -> Result<QuerySpec, ExportError> {
    let query_path = query
        .query_path
        .ok_or_else(|| missing(&format!("queries[{index}].query_path")))?;
    let output_path = query
        .output_path
        .filter(|path| !path.trim().is_empty())
        .ok_or_else(|| missing(&format!("queries[{index}].output_path")))?;
    let output_format: OutputFormat = query
        .output_format
        .ok_or_else(|| missing(&format!("queries[{index}].output_format")))?
        .parse()?;
    let format_params = match query.output_format_params {
        None | Some(Value::Null) => FormatParams::default(),
        Some(value) => serde_json::from_value(value).map_err(|err| {
            ExportError::Configuration(format!(
                "queries[{index}].output_format_params: {err}"
            ))
        })?,
    };
    Ok(QuerySpec {
        query_path,
        output_name: query.output_name,
        output_path,
        output_format,
        format_params,
        schema_path: query.schema_path,
    })
}

fn missing(field: &str) -> ExportError {
    ExportError::Configuration(format!("missing required field {field}"))
}

pub fn normalize_host(host: &str) -> String {
    let trimmed = host.trim().trim_end_matches('/');
    if SCHEME_RE.is_match(trimmed) {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

pub fn default_package_name() -> String {
    format!("export_{}", chrono::Local::now().format("%Y-%m-%d_%H.%M.%S"))
}

/// Service-level settings shared by every job.
#[derive(Debug, Clone)]
pub struct Settings {
    pub storage_root: Utf8PathBuf,
    pub authentication: bool,
}

impl Settings {
    pub fn new(storage_override: Option<&str>, authentication: bool) -> Result<Self, ExportError> {
        let storage_root = match storage_override
            .map(str::to_string)
            .or_else(|| std::env::var(STORAGE_ENV).ok())
            .filter(|value| !value.trim().is_empty())
        {
            Some(path) => Utf8PathBuf::from(path),
            None => BaseDirs::new()
                .and_then(|dirs| {
                    Utf8PathBuf::from_path_buf(
                        dirs.home_dir().join("catalog-export").join("data"),
                    )
                    .ok()
                })
                .ok_or_else(|| {
                    ExportError::Storage("unable to resolve storage directory".to_string())
                })?,
        };
        Ok(Self {
            storage_root,
            authentication,
        })
    }
}
