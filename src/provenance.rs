use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::Identity;
use crate::error::ExportError;

pub const RO_CONTEXT: &str = "https://w3id.org/bundle/context";
pub const RO_PROFILE_ID: &str =
    "https://raw.githubusercontent.com/fair-research/bdbag/master/profiles/bdbag-ro-profile.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Creator {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mediatype: Option<String>,
    #[serde(rename = "conformsTo", skip_serializing_if = "Option::is_none")]
    pub conforms_to: Option<String>,
    #[serde(rename = "retrievedFrom")]
    pub retrieved_from: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub uri: String,
    pub about: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceDocument {
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "createdOn")]
    pub created_on: String,
    #[serde(rename = "createdBy", skip_serializing_if = "Option::is_none")]
    pub created_by: Option<Creator>,
    pub aggregates: Vec<Aggregate>,
    pub annotations: Vec<Annotation>,
}

impl ProvenanceDocument {
    pub fn write(&self, path: &Path) -> Result<(), ExportError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| ExportError::Storage(err.to_string()))?;
        }
        let content = serde_json::to_vec_pretty(self)
            .map_err(|err| ExportError::Storage(err.to_string()))?;
        fs::write(path, content).map_err(|err| ExportError::Storage(err.to_string()))
    }
}

/// Picks the name recorded as the document's creator.
///
/// Precedence: full name, display name, identity id, then the username used to
/// log in. With none of these the creator is omitted.
pub fn resolve_creator(identity: Option<&Identity>, username: Option<&str>) -> Option<String> {
    let from_identity = identity.and_then(|identity| {
        identity
            .full_name
            .clone()
            .or_else(|| identity.display_name.clone())
            .or_else(|| (!identity.id.is_empty()).then(|| identity.id.clone()))
    });
    from_identity
        .or_else(|| username.map(str::to_string))
        .filter(|name| !name.trim().is_empty())
}

/// URI of a payload file relative to the metadata directory.
pub fn payload_uri(relative: &str) -> String {
    format!("../data/{}", relative.trim_start_matches('/'))
}

/// Accumulates the provenance document for one job.
#[derive(Debug, Clone)]
pub struct ProvenanceRecorder {
    document: ProvenanceDocument,
}

impl ProvenanceRecorder {
    pub fn new(creator: Option<String>) -> Self {
        Self {
            document: ProvenanceDocument {
                context: vec![RO_CONTEXT.to_string()],
                id: "../".to_string(),
                created_on: chrono::Utc::now().to_rfc3339(),
                created_by: creator.map(|name| Creator { name }),
                aggregates: Vec::new(),
                annotations: Vec::new(),
            },
        }
    }

    pub fn for_caller(identity: Option<&Identity>, username: Option<&str>) -> Self {
        Self::new(resolve_creator(identity, username))
    }

    pub fn add_aggregate(
        &mut self,
        uri: String,
        mediatype: Option<String>,
        conforms_to: Option<String>,
        source_url: &str,
    ) {
        self.document.aggregates.push(Aggregate {
            uri,
            mediatype,
            conforms_to,
            retrieved_from: source_url.to_string(),
        });
    }

    pub fn add_annotation(&mut self, about: String, content: String) {
        self.document.annotations.push(Annotation {
            uri: format!("urn:uuid:{}", Uuid::new_v4()),
            about,
            content,
        });
    }

    pub fn document(&self) -> &ProvenanceDocument {
        &self.document
    }

    pub fn into_document(self) -> ProvenanceDocument {
        self.document
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creator_precedence() {
        let mut identity = Identity {
            id: "https://auth/u/1".to_string(),
            full_name: Some("Ada Lovelace".to_string()),
            display_name: Some("ada".to_string()),
        };
        assert_eq!(
            resolve_creator(Some(&identity), Some("login")).as_deref(),
            Some("Ada Lovelace")
        );
        identity.full_name = None;
        assert_eq!(resolve_creator(Some(&identity), None).as_deref(), Some("ada"));
        identity.display_name = None;
        assert_eq!(
            resolve_creator(Some(&identity), None).as_deref(),
            Some("https://auth/u/1")
        );
        assert_eq!(resolve_creator(None, Some("login")).as_deref(), Some("login"));
        assert_eq!(resolve_creator(None, None), None);
    }

    #[test]
    fn document_serializes_ro_keys() {
        let mut recorder = ProvenanceRecorder::new(Some("ada".to_string()));
        recorder.add_aggregate(
            payload_uri("a.csv"),
            Some("text/csv".to_string()),
            None,
            "https://h/e/A",
        );
        recorder.add_annotation(payload_uri("a.csv"), payload_uri("a-schema.json"));
        let value = serde_json::to_value(recorder.document()).unwrap();
        assert_eq!(value["@id"], "../");
        assert_eq!(value["createdBy"]["name"], "ada");
        assert_eq!(value["aggregates"][0]["uri"], "../data/a.csv");
        assert_eq!(value["aggregates"][0]["retrievedFrom"], "https://h/e/A");
        assert!(value["aggregates"][0].get("conformsTo").is_none());
        assert!(value["annotations"][0]["uri"]
            .as_str()
            .unwrap()
            .starts_with("urn:uuid:"));
    }
}
