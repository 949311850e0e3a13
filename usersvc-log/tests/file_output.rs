//! File output end to end. A global subscriber can only be installed once
//! per process, so everything runs in one test.

use std::fs;
use std::path::Path;
use std::time::Duration;
use usersvc_log::*;

fn read_logs(dir: &Path) -> String {
    let mut contents = String::new();
    for entry in fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        if entry.file_name().to_string_lossy().starts_with("app.log") {
            contents.push_str(&fs::read_to_string(entry.path()).unwrap());
        }
    }
    contents
}

#[test]
fn test_json_file_logging() {
    let root = tempfile::tempdir().unwrap();

    // a stale file from an earlier run
    let dir = root.path().join("tars").join("user");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("app.log.2020-01-01-00"), b"stale\n").unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let guard = LogConfig::for_server(root.path(), "tars", "user")
        .with_env_filter("info")
        .lifetime(Duration::from_millis(10))
        .init()
        .unwrap();
    assert_eq!(guard.directory(), Some(dir.as_path()));
    assert!(!dir.join("app.log.2020-01-01-00").exists());

    info!(port = 17191, "server listening");
    debug!("filtered out");

    // flushes the writer
    drop(guard);

    let contents = read_logs(&dir);
    let line = contents
        .lines()
        .find(|line| line.contains("server listening"))
        .expect("record written");

    let record: serde_json::Value = serde_json::from_str(line).unwrap();
    assert_eq!(record["level"], "INFO");
    assert_eq!(record["fields"]["message"], "server listening");
    assert_eq!(record["fields"]["port"], 17191);
    assert!(record.get("filename").is_some());
    assert!(!contents.contains("filtered out"));

    // second install fails instead of panicking
    let err = LogConfig::new()
        .output(LogOutput::Stderr)
        .init()
        .unwrap_err();
    assert!(matches!(err, LogError::AlreadyInitialized(_)));
}
