use std::time::Duration;

use assert_matches::assert_matches;

use ott_enricher::config::ConfigLoader;
use ott_enricher::error::OttError;

#[test]
fn explicit_missing_config_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("missing.json");
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, OttError::ConfigRead(_));
}

#[test]
fn config_file_overrides_defaults() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("ott-enricher.json");
    let data_dir = temp.path().join("data");
    std::fs::write(
        &path,
        serde_json::json!({
            "release": "14.7",
            "data_dir": data_dir.to_str().unwrap(),
            "rate_limit_ms": 250,
            "checkpoint_interval": 0,
            "batch_size": 50
        })
        .to_string(),
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.release, "14.7");
    assert_eq!(resolved.rate_limit, Duration::from_millis(250));
    assert_eq!(resolved.checkpoint_interval, 1);
    assert_eq!(resolved.batch_size, 50);
    assert!(resolved.store_path().as_str().ends_with("taxa-14.7.db"));
    assert!(resolved.tree_url.contains("opentree14.7"));
}

#[test]
fn invalid_json_is_reported() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("bad.json");
    std::fs::write(&path, "{ release: ").unwrap();
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, OttError::ConfigParse(_));
}
