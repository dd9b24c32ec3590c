mod common;

use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

use common::{MixedBatch, meter_document, write_file};

fn audit(workdir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_xml-tag-audit"))
        .args(args)
        .current_dir(workdir)
        .env("XDG_CONFIG_HOME", workdir)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute xml-tag-audit")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_cli_help_output() {
    let dir = TempDir::new().unwrap();
    let output = audit(dir.path(), &["--help"]);

    assert!(output.status.success());
    let help = stdout(&output);
    for flag in ["--manifest", "--tags", "--policy", "--workers", "--export", "--events"] {
        assert!(help.contains(flag), "help is missing {flag}");
    }
}

#[test]
fn test_cli_missing_path_is_usage_error() {
    let dir = TempDir::new().unwrap();
    let output = audit(dir.path(), &["/definitely/not/a/real/path"]);

    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("Path does not exist"));
}

#[test]
fn test_cli_json_summary() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let batch = runtime.block_on(MixedBatch::new());

    let output = audit(
        batch.path(),
        &[batch.path().to_str().unwrap(), "--format", "json", "--workers", "2"],
    );

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(json["total"], 4);
    assert_eq!(json["faulty"], 2);
    assert_eq!(json["normal"], 2);
    assert_eq!(json["files"].as_array().unwrap().len(), 4);
}

#[test]
fn test_cli_policy_flag_changes_classification() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let batch = runtime.block_on(MixedBatch::new());

    let output = audit(
        batch.path(),
        &[
            batch.path().to_str().unwrap(),
            "--format",
            "json",
            "--policy",
            "tag-completeness",
        ],
    );

    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    let faulty: Vec<_> = json["files"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|f| f["is_faulty"] == true)
        .map(|f| f["file_name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(faulty.len(), 2);
    assert!(faulty.contains(&"gaps.xml".to_string()));
    assert!(!faulty.contains(&"anonymous.xml".to_string()));
}

#[test]
fn test_cli_event_stream() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let batch = runtime.block_on(MixedBatch::new());

    let output = audit(batch.path(), &[batch.path().to_str().unwrap(), "--events"]);

    assert!(output.status.success());
    let text = stdout(&output);
    let frames: Vec<_> = text
        .split("\n\n")
        .filter(|frame| !frame.is_empty())
        .collect();
    assert_eq!(frames.len(), 5);
    assert!(frames.iter().all(|f| f.starts_with("data: ")));

    let last: serde_json::Value =
        serde_json::from_str(frames[4].trim_start_matches("data: ")).unwrap();
    assert_eq!(last["complete"], true);
    assert_eq!(last["total_processed"], 4);
    assert_eq!(last["table_data"].as_array().unwrap().len(), 4);
}

#[test]
fn test_cli_export_writes_csv() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let batch = runtime.block_on(MixedBatch::new());
    let exports = TempDir::new().unwrap();

    let output = audit(
        batch.path(),
        &[
            batch.path().to_str().unwrap(),
            "--export",
            "faulty",
            "--export",
            "all",
            "--export-dir",
            exports.path().to_str().unwrap(),
        ],
    );

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(exports.path().join("faulty_xml_files.csv").is_file());
    assert!(exports.path().join("all_xml_files.csv").is_file());
    assert!(stdout(&output).contains("Exported faulty files to"));
}

#[test]
fn test_cli_empty_export_subset_fails() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = TempDir::new().unwrap();
    runtime.block_on(write_file(
        dir.path(),
        "data/ok.xml",
        &meter_document(Some("MTR-1"), &[]),
    ));
    let exports = dir.path().join("exports");

    let output = audit(
        dir.path(),
        &[
            "data",
            "--export",
            "faulty",
            "--export-dir",
            exports.to_str().unwrap(),
        ],
    );

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("No faulty files to export"));
    assert!(!exports.join("faulty_xml_files.csv").exists());
}

#[test]
fn test_cli_manifest_without_path_column_rejects_batch() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = TempDir::new().unwrap();
    runtime.block_on(write_file(dir.path(), "manifest.csv", "meter,site\nM1,north\n"));

    let output = audit(dir.path(), &["--manifest", "manifest.csv", "--events"]);

    assert_eq!(output.status.code(), Some(1));
    let text = stdout(&output);
    assert!(text.starts_with("data: {\"error\":"));
    assert_eq!(text.matches("data: ").count(), 1);
}

#[test]
fn test_cli_manifest_batch() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = TempDir::new().unwrap();
    runtime.block_on(async {
        write_file(dir.path(), "in/a.xml", &meter_document(Some("MTR-1"), &[])).await;
        write_file(dir.path(), "in/b.xml", &meter_document(None, &[])).await;
        write_file(
            dir.path(),
            "manifest.csv",
            "id,File Path\n1,in/a.xml\n2,in/b.xml\n3,in/gone.xml\n",
        )
        .await;
    });

    let output = audit(dir.path(), &["--manifest", "manifest.csv", "--format", "json"]);

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(json["total"], 2);
    assert_eq!(json["faulty"], 1);
}

#[test]
fn test_cli_config_file_sets_required_tags() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = TempDir::new().unwrap();
    runtime.block_on(async {
        write_file(
            dir.path(),
            "data/m.xml",
            "<Meter><MeterNo>9</MeterNo><Serial>x</Serial></Meter>",
        )
        .await;
        write_file(
            dir.path(),
            "xml-tag-audit.toml",
            "[schema]\nrequired_tags = [\"Serial\", \"Reading\"]\nidentifier_field = \"MeterNo\"\npolicy = \"tag-completeness\"\n",
        )
        .await;
    });

    let output = audit(dir.path(), &["data", "--format", "json"]);

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(json["faulty"], 1);
    assert_eq!(json["files"][0]["identifier"], "9");
    assert_eq!(json["files"][0]["missing_tags"][0], "Reading");
}

#[test]
fn test_cli_config_verbosity_reaches_log_output() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = TempDir::new().unwrap();
    runtime.block_on(async {
        write_file(dir.path(), "data/ok.xml", &meter_document(Some("MTR-1"), &[])).await;
        write_file(dir.path(), "xml-tag-audit.toml", "[output]\nverbose = true\n").await;
    });
    let exports = dir.path().join("exports");
    let args = [
        "data",
        "--export",
        "normal",
        "--export-dir",
        exports.to_str().unwrap(),
    ];

    let output = audit(dir.path(), &args);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stderr(&output).contains("exported"));

    std::fs::write(dir.path().join("xml-tag-audit.toml"), "[output]\nquiet = true\n").unwrap();
    let output = audit(dir.path(), &args);
    assert!(output.status.success());
    assert!(!stderr(&output).contains("exported"));
}
