use assert_matches::assert_matches;

use catalog_export::config::{ConfigLoader, Settings};
use catalog_export::domain::{Archiver, ColumnRole, Credentials, OutputFormat};
use catalog_export::error::ExportError;

#[test]
fn resolve_job_file_from_disk() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("job.json");
    std::fs::write(
        &path,
        r#"{
            "catalog": {
                "host": "https://data.example.org/",
                "path": "/ermrest/catalog/",
                "catalog_id": 42,
                "username": "alice",
                "password": "secret",
                "token": "ignored",
                "queries": [
                    {"query_path": "entity/S", "output_path": "seqs", "output_name": "all",
                     "output_format": "fasta",
                     "output_format_params": {"column_map": {"RID": "comment", "sequence": "data"}},
                     "schema_path": "schema/S"},
                    {"query_path": "attribute/F", "output_path": "files", "output_format": "fetch"}
                ]
            },
            "bag": {"bag_name": "release", "bag_archiver": "tgz", "create_ro_metadata": false}
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str().unwrap()).unwrap();
    assert_eq!(resolved.endpoint.host, "https://data.example.org");
    assert_eq!(resolved.endpoint.catalog_id, "42");
    assert_eq!(
        resolved.endpoint.url_for(&resolved.queries[0].query_path),
        "https://data.example.org/ermrest/catalog/entity/S"
    );
    assert_eq!(
        resolved.credentials,
        Credentials::Login {
            username: "alice".to_string(),
            password: "secret".to_string(),
        }
    );

    let fasta = &resolved.queries[0];
    assert_eq!(fasta.output_format, OutputFormat::Fasta);
    assert_eq!(fasta.final_output_path(".fasta"), "seqs/all.fasta");
    let column_map = fasta.format_params.column_map.as_ref().unwrap();
    assert_eq!(column_map.get("RID"), Some(&ColumnRole::Comment));
    assert_eq!(column_map.get("sequence"), Some(&ColumnRole::Data));
    assert_eq!(resolved.queries[1].output_format, OutputFormat::Fetch);

    assert_eq!(resolved.package.name, "release");
    assert_eq!(resolved.package.archiver, Some(Archiver::Tgz));
    assert!(!resolved.package.create_ro_metadata);
}

#[test]
fn token_used_when_no_login() {
    let resolved = ConfigLoader::resolve_str(
        r#"{"catalog": {"host": "h", "path": "/p", "token": "abc", "queries": []}}"#,
    )
    .unwrap();
    assert_eq!(resolved.credentials, Credentials::Token("abc".to_string()));
}

#[test]
fn missing_pieces_are_configuration_errors() {
    for job in [
        r#"{}"#,
        r#"{"catalog": {"path": "/p", "queries": []}}"#,
        r#"{"catalog": {"host": "h", "path": "/p"}}"#,
        r#"{"catalog": {"host": "h", "path": "/p", "queries": [
            {"query_path": "/q", "output_path": "", "output_format": "csv"}]}}"#,
        r#"{"catalog": {"host": "h", "path": "/p", "queries": []},
            "bag": {"bag_archiver": "rar"}}"#,
        "not json",
    ] {
        assert_matches!(
            ConfigLoader::resolve_str(job),
            Err(ExportError::Configuration(_)),
            "{job}"
        );
    }
}

#[test]
fn missing_job_file_is_configuration_error() {
    let err = ConfigLoader::resolve("/nonexistent/job.json").unwrap_err();
    assert_matches!(err, ExportError::Configuration(_));
}

#[test]
fn storage_override_wins() {
    let settings = Settings::new(Some("/srv/exports"), true).unwrap();
    assert_eq!(settings.storage_root.as_str(), "/srv/exports");
    assert!(settings.authentication);
}
