use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::ExportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Csv,
    Json,
    Fasta,
    Prefetch,
    Fetch,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Csv => write!(f, "csv"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Fasta => write!(f, "fasta"),
            OutputFormat::Prefetch => write!(f, "prefetch"),
            OutputFormat::Fetch => write!(f, "fetch"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = ExportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "csv" => Ok(OutputFormat::Csv),
            "json" => Ok(OutputFormat::Json),
            "fasta" => Ok(OutputFormat::Fasta),
            "prefetch" => Ok(OutputFormat::Prefetch),
            "fetch" => Ok(OutputFormat::Fetch),
            _ => Err(ExportError::UnsupportedFormat(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Archiver {
    Zip,
    Tar,
    Tgz,
}

impl Archiver {
    pub fn extension(&self) -> &'static str {
        match self {
            Archiver::Zip => "zip",
            Archiver::Tar => "tar",
            Archiver::Tgz => "tgz",
        }
    }
}

impl fmt::Display for Archiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

impl FromStr for Archiver {
    type Err = ExportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "zip" => Ok(Archiver::Zip),
            "tar" => Ok(Archiver::Tar),
            "tgz" | "gz" | "tar.gz" => Ok(Archiver::Tgz),
            _ => Err(ExportError::Configuration(format!(
                "unknown bag archiver: {value}"
            ))),
        }
    }
}

/// A remote file described by a prefetch or fetch manifest line.
///
/// Fields other than `url`, `length` and `filename` are preserved so that a
/// deferred reference can be written back out unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFileRef {
    pub url: String,
    #[serde(deserialize_with = "length_from_number_or_string")]
    pub length: u64,
    pub filename: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RemoteFileRef {
    pub fn new(url: impl Into<String>, length: u64, filename: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            length,
            filename: filename.into(),
            extra: Map::new(),
        }
    }
}

fn length_from_number_or_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(number) => number
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom(format!("invalid length: {number}"))),
        Value::String(text) => text
            .trim()
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom(format!("invalid length: {text}"))),
        other => Err(serde::de::Error::custom(format!("invalid length: {other}"))),
    }
}

/// Resolved caller identity as handed over by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            full_name: None,
            display_name: None,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    Cookie(String),
    Token(String),
    Login { username: String, password: String },
}

impl Credentials {
    pub fn username(&self) -> Option<&str> {
        match self {
            Credentials::Login { username, .. } => Some(username.as_str()),
            _ => None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Anonymous => write!(f, "Anonymous"),
            Credentials::Cookie(_) => write!(f, "Cookie(***)"),
            Credentials::Token(_) => write!(f, "Token(***)"),
            Credentials::Login { username, .. } => write!(f, "Login({username})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEndpoint {
    pub host: String,
    pub path: String,
    pub catalog_id: String,
}

impl CatalogEndpoint {
    pub fn url_for(&self, query_path: &str) -> String {
        format!("{}{}{}", self.host, self.path, query_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnRole {
    Comment,
    Data,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatParams {
    #[serde(default)]
    pub column_map: Option<BTreeMap<String, ColumnRole>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub query_path: String,
    pub output_name: Option<String>,
    pub output_path: String,
    pub output_format: OutputFormat,
    pub format_params: FormatParams,
    pub schema_path: Option<String>,
}

impl QuerySpec {
    /// `<output_path>/<output_name><ext>` when a name is set, `<output_path><ext>` otherwise.
    pub fn final_output_path(&self, ext: &str) -> String {
        match &self.output_name {
            Some(name) => format!("{}/{}{}", self.output_path.trim_end_matches('/'), name, ext),
            None => format!("{}{}", self.output_path, ext),
        }
    }

    pub fn schema_file_name(&self) -> String {
        format!("{}-schema.json", self.output_path)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PackageOptions {
    pub name: String,
    pub archiver: Option<Archiver>,
    pub metadata: BTreeMap<String, String>,
    pub create_ro_metadata: bool,
}
