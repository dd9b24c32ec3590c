//! Required-Tag File Validator
//!
//! Classifies one document as conformant or faulty:
//! - **Identifier**: the first element named by the schema's identifier field,
//!   trimmed; blank text counts as not found
//! - **Markers**: presence of every required tag anywhere in the tree, in
//!   declaration order
//! - **Policy**: [`ValidationPolicy`] decides which of the two makes a file faulty
//!
//! Any failure to read or parse a file is turned into a faulty [`FileResult`]
//! carrying a `parse_error`; validation itself never returns an error.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::FileFault;
use crate::libxml2::{LibXml2Wrapper, XmlDocument};

/// Rendering of an identifier that could not be found
pub const IDENTIFIER_NOT_FOUND: &str = "N/A";

/// Tags every meter document is expected to carry
pub const DEFAULT_REQUIRED_TAGS: [&str; 13] = [
    "D1", "D2", "D3", "D4", "D5", "D6", "D7", "D8", "D9", "D10", "D11", "D1251", "D1300",
];

/// Element holding the meter number
pub const DEFAULT_IDENTIFIER_FIELD: &str = "G1";

/// Which condition makes a file faulty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationPolicy {
    /// Faulty iff the identifier is not found; tag completeness is informational
    #[default]
    IdentifierRequired,
    /// Faulty iff at least one required tag is absent
    TagCompleteness,
}

impl ValidationPolicy {
    /// Derive the faulty flag for a successfully parsed document
    pub fn is_faulty(self, identifier: Option<&str>, missing_tags: &[String]) -> bool {
        match self {
            ValidationPolicy::IdentifierRequired => identifier.is_none(),
            ValidationPolicy::TagCompleteness => !missing_tags.is_empty(),
        }
    }
}

impl fmt::Display for ValidationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationPolicy::IdentifierRequired => f.write_str("identifier-required"),
            ValidationPolicy::TagCompleteness => f.write_str("tag-completeness"),
        }
    }
}

/// What a conformant document must contain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSchema {
    /// Required markers, in declaration order
    pub required_tags: Vec<String>,
    /// Element whose text identifies the document
    pub identifier_field: String,
    /// Faulty-classification rule
    pub policy: ValidationPolicy,
    /// Check markers even when the identifier is missing
    pub check_tags_without_identifier: bool,
}

impl Default for TagSchema {
    fn default() -> Self {
        Self {
            required_tags: DEFAULT_REQUIRED_TAGS.iter().map(|t| t.to_string()).collect(),
            identifier_field: DEFAULT_IDENTIFIER_FIELD.to_string(),
            policy: ValidationPolicy::default(),
            check_tags_without_identifier: true,
        }
    }
}

impl TagSchema {
    pub fn with_policy(mut self, policy: ValidationPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Presence of one required marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Presence {
    Present,
    Absent,
}

impl Presence {
    /// `yes`/`no`, as shown in exported tag values
    pub fn as_flag(self) -> &'static str {
        match self {
            Presence::Present => "yes",
            Presence::Absent => "no",
        }
    }
}

/// One entry of a file's tag status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCheck {
    pub tag: String,
    pub presence: Presence,
}

/// A file to be validated
#[derive(Debug, Clone)]
pub enum FileRef {
    /// A file on disk
    Path(PathBuf),
    /// Bytes already in memory, under a display name
    Memory { name: String, data: Arc<[u8]> },
}

impl FileRef {
    pub fn memory(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        FileRef::Memory {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Basename used to report this file
    pub fn file_name(&self) -> String {
        match self {
            FileRef::Path(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            FileRef::Memory { name, .. } => name.clone(),
        }
    }

    /// Load the raw bytes
    pub fn read(&self) -> std::io::Result<Arc<[u8]>> {
        match self {
            FileRef::Path(path) => Ok(std::fs::read(path)?.into()),
            FileRef::Memory { data, .. } => Ok(Arc::clone(data)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            FileRef::Path(path) => Some(path),
            FileRef::Memory { .. } => None,
        }
    }
}

impl From<PathBuf> for FileRef {
    fn from(path: PathBuf) -> Self {
        FileRef::Path(path)
    }
}

/// Outcome of validating one file.
///
/// Fields are private so that `missing_tags` and `is_faulty` can only ever
/// be derived from `tag_status`, the identifier and the policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileResult {
    file_name: String,
    identifier: Option<String>,
    tag_status: Vec<TagCheck>,
    missing_tags: Vec<String>,
    is_faulty: bool,
    parse_error: Option<String>,
}

impl FileResult {
    /// Result for a parsed document
    pub fn evaluated(
        file_name: String,
        identifier: Option<String>,
        tag_status: Vec<TagCheck>,
        policy: ValidationPolicy,
    ) -> Self {
        let missing_tags: Vec<String> = tag_status
            .iter()
            .filter(|check| check.presence == Presence::Absent)
            .map(|check| check.tag.clone())
            .collect();
        let is_faulty = policy.is_faulty(identifier.as_deref(), &missing_tags);

        Self {
            file_name,
            identifier,
            tag_status,
            missing_tags,
            is_faulty,
            parse_error: None,
        }
    }

    /// Result for a file that could not be read, parsed or finished
    pub fn failed(file_name: String, fault: &FileFault) -> Self {
        Self {
            file_name,
            identifier: None,
            tag_status: Vec::new(),
            missing_tags: Vec::new(),
            is_faulty: true,
            parse_error: Some(fault.to_string()),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    /// Identifier, or the `N/A` sentinel
    pub fn identifier_or_sentinel(&self) -> &str {
        self.identifier.as_deref().unwrap_or(IDENTIFIER_NOT_FOUND)
    }

    pub fn tag_status(&self) -> &[TagCheck] {
        &self.tag_status
    }

    pub fn presence_of(&self, tag: &str) -> Option<Presence> {
        self.tag_status
            .iter()
            .find(|check| check.tag == tag)
            .map(|check| check.presence)
    }

    pub fn missing_tags(&self) -> &[String] {
        &self.missing_tags
    }

    pub fn is_faulty(&self) -> bool {
        self.is_faulty
    }

    pub fn parse_error(&self) -> Option<&str> {
        self.parse_error.as_deref()
    }

    /// Whether markers were checked for this file
    pub fn tags_evaluated(&self) -> bool {
        !self.tag_status.is_empty()
    }
}

/// Validates single files against a [`TagSchema`]
#[derive(Debug, Clone)]
pub struct FileValidator {
    schema: TagSchema,
    parser: LibXml2Wrapper,
}

impl FileValidator {
    pub fn new(schema: TagSchema) -> Self {
        Self::with_parser(schema, LibXml2Wrapper::new())
    }

    pub fn with_parser(schema: TagSchema, parser: LibXml2Wrapper) -> Self {
        Self { schema, parser }
    }

    pub fn schema(&self) -> &TagSchema {
        &self.schema
    }

    /// Read and validate one file
    pub fn validate(&self, file: &FileRef) -> FileResult {
        let file_name = file.file_name();
        match file.read() {
            Ok(data) => self.validate_bytes(file_name, &data),
            Err(e) => {
                let fault = FileFault::from(e);
                debug!(file = %file_name, error = %fault, "file unreadable");
                FileResult::failed(file_name, &fault)
            }
        }
    }

    /// Validate a document already in memory
    pub fn validate_bytes(&self, file_name: String, data: &[u8]) -> FileResult {
        let document = match self.parser.parse_document(data) {
            Ok(document) => document,
            Err(e) => {
                let fault = FileFault::from(e);
                debug!(file = %file_name, error = %fault, "file unparseable");
                return FileResult::failed(file_name, &fault);
            }
        };

        if let Some(cause) = document.recovered_from() {
            debug!(file = %file_name, cause, "recovered from malformed markup");
        }

        let result = self.classify(file_name, &document);
        debug!(
            file = %result.file_name(),
            faulty = result.is_faulty(),
            missing = result.missing_tags().len(),
            "file classified"
        );
        result
    }

    fn classify(&self, file_name: String, document: &XmlDocument) -> FileResult {
        let identifier = document
            .find_first(&self.schema.identifier_field)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());

        // Tag completeness is the classification itself, so it is never skipped
        let check_tags = identifier.is_some()
            || self.schema.check_tags_without_identifier
            || self.schema.policy == ValidationPolicy::TagCompleteness;

        let tag_status = if check_tags {
            self.schema
                .required_tags
                .iter()
                .map(|tag| TagCheck {
                    tag: tag.clone(),
                    presence: if document.exists(tag) {
                        Presence::Present
                    } else {
                        Presence::Absent
                    },
                })
                .collect()
        } else {
            Vec::new()
        };

        FileResult::evaluated(file_name, identifier, tag_status, self.schema.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParseError;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn meter_document(identifier: Option<&str>, omit: &[&str]) -> String {
        let mut xml = String::from("<?xml version=\"1.0\"?>\n<MeterData>\n");
        if let Some(id) = identifier {
            xml.push_str(&format!("  <G1>{id}</G1>\n"));
        }
        xml.push_str("  <Readings>\n");
        for tag in DEFAULT_REQUIRED_TAGS {
            if !omit.contains(&tag) {
                xml.push_str(&format!("    <{tag}>1</{tag}>\n"));
            }
        }
        xml.push_str("  </Readings>\n</MeterData>\n");
        xml
    }

    fn validator(policy: ValidationPolicy) -> FileValidator {
        FileValidator::new(TagSchema::default().with_policy(policy))
    }

    #[test]
    fn test_complete_document_is_normal() {
        let xml = meter_document(Some("MTR-1"), &[]);

        for policy in [
            ValidationPolicy::IdentifierRequired,
            ValidationPolicy::TagCompleteness,
        ] {
            let result = validator(policy).validate_bytes("a.xml".into(), xml.as_bytes());
            assert!(!result.is_faulty());
            assert!(result.missing_tags().is_empty());
            assert_eq!(result.identifier(), Some("MTR-1"));
            assert_eq!(result.tag_status().len(), 13);
            assert!(result.parse_error().is_none());
        }
    }

    #[test]
    fn test_missing_identifier_depends_on_policy() {
        let xml = meter_document(None, &[]);

        let a = validator(ValidationPolicy::IdentifierRequired)
            .validate_bytes("a.xml".into(), xml.as_bytes());
        assert!(a.is_faulty());
        assert_eq!(a.identifier_or_sentinel(), IDENTIFIER_NOT_FOUND);
        assert_eq!(a.tag_status().len(), 13);

        let b = validator(ValidationPolicy::TagCompleteness)
            .validate_bytes("a.xml".into(), xml.as_bytes());
        assert!(!b.is_faulty());
    }

    #[test]
    fn test_missing_tags_in_declared_order() {
        let xml = meter_document(Some("MTR-2"), &["D1300", "D4", "D10"]);

        let result = validator(ValidationPolicy::TagCompleteness)
            .validate_bytes("b.xml".into(), xml.as_bytes());

        assert!(result.is_faulty());
        assert_eq!(result.missing_tags(), ["D4", "D10", "D1300"]);
        assert_eq!(result.presence_of("D4"), Some(Presence::Absent));
        assert_eq!(result.presence_of("D5"), Some(Presence::Present));

        let advisory = validator(ValidationPolicy::IdentifierRequired)
            .validate_bytes("b.xml".into(), xml.as_bytes());
        assert!(!advisory.is_faulty());
        assert_eq!(advisory.missing_tags().len(), 3);
    }

    #[test]
    fn test_blank_identifier_is_not_found() {
        let xml = meter_document(Some("   \n\t "), &[]);
        let result = validator(ValidationPolicy::IdentifierRequired)
            .validate_bytes("c.xml".into(), xml.as_bytes());

        assert_eq!(result.identifier(), None);
        assert!(result.is_faulty());
    }

    #[test]
    fn test_skip_tags_without_identifier() {
        let schema = TagSchema {
            check_tags_without_identifier: false,
            ..TagSchema::default()
        };
        let xml = meter_document(None, &["D1"]);
        let result = FileValidator::new(schema).validate_bytes("d.xml".into(), xml.as_bytes());

        assert!(result.is_faulty());
        assert!(!result.tags_evaluated());
        assert!(result.missing_tags().is_empty());
    }

    #[test]
    fn test_tag_completeness_always_checks_tags() {
        let schema = TagSchema {
            policy: ValidationPolicy::TagCompleteness,
            check_tags_without_identifier: false,
            ..TagSchema::default()
        };
        let result =
            FileValidator::new(schema).validate_bytes("empty.xml".into(), b"<MeterData/>");

        assert!(result.is_faulty());
        assert!(result.parse_error().is_none());
        assert_eq!(result.tag_status().len(), DEFAULT_REQUIRED_TAGS.len());
        assert_eq!(result.missing_tags().len(), DEFAULT_REQUIRED_TAGS.len());
    }

    #[test]
    fn test_unparseable_bytes() {
        let result = validator(ValidationPolicy::TagCompleteness)
            .validate_bytes("junk.xml".into(), b"no markup here at all");

        assert!(result.is_faulty());
        assert!(result.parse_error().is_some());
        assert!(result.tag_status().is_empty());
        assert!(result.missing_tags().is_empty());
        assert_eq!(result.identifier(), None);
    }

    #[test]
    fn test_unreadable_file() {
        let file = FileRef::Path(PathBuf::from("/nonexistent/meter.xml"));
        let result = validator(ValidationPolicy::IdentifierRequired).validate(&file);

        assert_eq!(result.file_name(), "meter.xml");
        assert!(result.is_faulty());
        assert!(result.parse_error().unwrap().contains("failed to read file"));
    }

    #[test]
    fn test_validate_from_disk() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", meter_document(Some("MTR-9"), &["D2"])).unwrap();
        file.flush().unwrap();

        let file_ref = FileRef::Path(file.path().to_path_buf());
        let result = validator(ValidationPolicy::TagCompleteness).validate(&file_ref);

        assert_eq!(result.identifier(), Some("MTR-9"));
        assert_eq!(result.missing_tags(), ["D2"]);
    }

    #[test]
    fn test_revalidation_is_identical() {
        let xml = meter_document(Some("MTR-3"), &["D7"]);
        let v = validator(ValidationPolicy::TagCompleteness);

        let first = v.validate_bytes("e.xml".into(), xml.as_bytes());
        let second = v.validate_bytes("e.xml".into(), xml.as_bytes());

        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[test]
    fn test_failed_result_constructors() {
        let timed_out = FileResult::failed(
            "slow.xml".into(),
            &FileFault::TimedOut(Duration::from_secs(2)),
        );
        assert!(timed_out.is_faulty());
        assert!(timed_out.parse_error().unwrap().contains("timed out"));

        let empty = FileResult::failed("e.xml".into(), &ParseError::EmptyDocument.into());
        assert_eq!(empty.parse_error(), Some("document is empty"));
    }

    #[test]
    fn test_policy_display_and_serde() {
        assert_eq!(
            ValidationPolicy::TagCompleteness.to_string(),
            "tag-completeness"
        );
        let parsed: ValidationPolicy = serde_json::from_str("\"identifier-required\"").unwrap();
        assert_eq!(parsed, ValidationPolicy::IdentifierRequired);
    }

    #[test]
    fn test_memory_file_ref() {
        let file = FileRef::memory("upload.xml", b"<a/>".to_vec());
        assert_eq!(file.file_name(), "upload.xml");
        assert!(file.path().is_none());
        assert_eq!(&*file.read().unwrap(), b"<a/>");
    }
}
