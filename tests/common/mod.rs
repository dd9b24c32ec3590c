#![allow(dead_code)]

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio::fs;

use xml_tag_audit::BatchEvent;
use xml_tag_audit::aggregator::BatchResultSet;
use xml_tag_audit::validator::DEFAULT_REQUIRED_TAGS;

/// A meter document with the default tag set, minus `omit`
pub fn meter_document(identifier: Option<&str>, omit: &[&str]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<MeterData>\n");
    if let Some(id) = identifier {
        xml.push_str(&format!("  <Header>\n    <G1>{id}</G1>\n  </Header>\n"));
    }
    xml.push_str("  <Readings>\n");
    for tag in DEFAULT_REQUIRED_TAGS {
        if !omit.contains(&tag) {
            xml.push_str(&format!("    <{tag}>42</{tag}>\n"));
        }
    }
    xml.push_str("  </Readings>\n</MeterData>\n");
    xml
}

/// Bytes libxml2 cannot turn into a document even when recovering
pub const UNPARSEABLE: &str = "this is not markup at all";

pub async fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.unwrap();
    }
    fs::write(&path, content).await.unwrap();
    path
}

/// A directory holding one file of each kind the auditor distinguishes
pub struct MixedBatch {
    pub dir: TempDir,
}

impl MixedBatch {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "complete.xml", &meter_document(Some("MTR-001"), &[])).await;
        write_file(
            dir.path(),
            "gaps.xml",
            &meter_document(Some("MTR-002"), &["D3", "D7", "D1300"]),
        )
        .await;
        write_file(dir.path(), "anonymous.xml", &meter_document(None, &[])).await;
        write_file(dir.path(), "garbage.xml", UNPARSEABLE).await;
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// The result set carried by the last event, if it is a completion
pub fn completed(events: &[BatchEvent]) -> &BatchResultSet {
    match events.last() {
        Some(BatchEvent::Complete(results)) => &**results,
        other => panic!("expected a completion event, got {:?}", other),
    }
}
