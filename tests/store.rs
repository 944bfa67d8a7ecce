use camino::Utf8PathBuf;

use catalog_export::domain::Identity;
use catalog_export::store::Store;

fn job_dir() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let (_, dir) = Store::new_with_root(root).create_job_dir().unwrap();
    (temp, dir)
}

#[test]
fn access_descriptor_owner_precedence() {
    let (_temp, dir) = job_dir();
    let identity = Identity::new("https://auth/u/1");

    Store::write_access_descriptor(&dir, Some(&identity), Some("alice")).unwrap();
    assert_eq!(std::fs::read_to_string(dir.join(".access")).unwrap(), "https://auth/u/1\n");

    Store::write_access_descriptor(&dir, None, Some("alice")).unwrap();
    assert_eq!(std::fs::read_to_string(dir.join(".access")).unwrap(), "alice\n");

    Store::write_access_descriptor(&dir, None, None).unwrap();
    assert_eq!(std::fs::read_to_string(dir.join(".access")).unwrap(), "*\n");
}

#[test]
fn access_checks() {
    let (_temp, dir) = job_dir();
    let caller = vec!["https://auth/u/1".to_string(), "https://auth/g/curators".to_string()];

    assert!(!Store::check_access(&dir, &caller, true).unwrap());
    assert!(Store::check_access(&dir, &caller, false).unwrap());

    Store::write_access_descriptor(&dir, Some(&Identity::new("https://auth/u/2")), None).unwrap();
    assert!(!Store::check_access(&dir, &caller, true).unwrap());

    Store::write_access_descriptor(&dir, Some(&Identity::new("https://auth/u/1")), None).unwrap();
    assert!(Store::check_access(&dir, &caller, true).unwrap());

    Store::write_access_descriptor(&dir, None, None).unwrap();
    assert!(Store::check_access(&dir, &[], true).unwrap());
}
