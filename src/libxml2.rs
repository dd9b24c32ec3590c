//! LibXML2 FFI Document Parser
//!
//! Parses one raw document into a navigable libxml2 tree and answers the two
//! questions the validator asks of it: the text of the first element with a
//! given name, and whether an element with a given name exists anywhere.
//!
//! ## Why libxml2
//!
//! Pure Rust parsers (roxmltree, quick-xml, xml-rs) stop at the first
//! well-formedness error. Meter exports in the field are routinely truncated
//! or carry mismatched end tags, and libxml2's `XML_PARSE_RECOVER` mode keeps
//! every node it managed to build, which is what a presence check needs.
//!
//! ## Thread Safety
//!
//! libxml2 document parsing is thread-safe once `xmlInitParser()` has run and
//! each call uses its own parser context (`xmlReadMemory` creates one per
//! call). The last-error slot read after a parse is thread-local. A parsed
//! [`XmlDocument`] is deliberately `!Send`: it is created, queried and freed
//! on the same worker thread.

use std::ffi::CStr;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::Once;

use libc::{c_char, c_int, c_void};

use crate::error::{ParseError, ParseResult};

/// Global initialization flag for libxml2
///
/// libxml2's initialization functions are NOT thread-safe, so they run
/// exactly once behind `std::sync::Once`.
static LIBXML2_INIT: Once = Once::new();

/// Recover on errors
pub const XML_PARSE_RECOVER: c_int = 1 << 0;
/// Suppress error reports
pub const XML_PARSE_NOERROR: c_int = 1 << 5;
/// Suppress warning reports
pub const XML_PARSE_NOWARNING: c_int = 1 << 6;
/// Forbid network access
pub const XML_PARSE_NONET: c_int = 1 << 11;

const XML_ELEMENT_NODE: c_int = 1;
const XML_TEXT_NODE: c_int = 3;
const XML_CDATA_SECTION_NODE: c_int = 4;

/// Opaque libxml2 document
#[repr(C)]
pub struct XmlDoc {
    _private: [u8; 0],
}

/// Leading fields of libxml2's `struct _xmlNode`.
///
/// Only ever read through pointers handed out by libxml2, so declaring the
/// prefix we use is enough.
#[repr(C)]
pub struct XmlNode {
    pub _private: *mut c_void,
    pub node_type: c_int,
    pub name: *const u8,
    pub children: *mut XmlNode,
    pub last: *mut XmlNode,
    pub parent: *mut XmlNode,
    pub next: *mut XmlNode,
    pub prev: *mut XmlNode,
    pub doc: *mut XmlDoc,
    pub ns: *mut c_void,
    pub content: *mut u8,
}

#[repr(C)]
pub struct xmlError {
    pub domain: c_int,
    pub code: c_int,
    pub message: *const c_char,
    pub level: c_int,
    pub file: *const c_char,
    pub line: c_int,
    pub str1: *const c_char,
    pub str2: *const c_char,
    pub str3: *const c_char,
    pub int1: c_int,
    pub int2: c_int,
    pub ctxt: *mut c_void,
    pub node: *mut c_void,
}

// External libxml2 FFI declarations
#[cfg_attr(target_os = "windows", link(name = "libxml2"))]
#[cfg_attr(not(target_os = "windows"), link(name = "xml2"))]
unsafe extern "C" {
    pub fn xmlInitParser();

    pub fn xmlReadMemory(
        buffer: *const c_char,
        size: c_int,
        url: *const c_char,
        encoding: *const c_char,
        options: c_int,
    ) -> *mut XmlDoc;
    pub fn xmlFreeDoc(doc: *mut XmlDoc);
    pub fn xmlDocGetRootElement(doc: *const XmlDoc) -> *mut XmlNode;

    pub fn xmlGetLastError() -> *const xmlError;
    pub fn xmlResetLastError();
}

/// Read and clear the calling thread's last libxml2 error message
unsafe fn take_last_error() -> Option<String> {
    let message = unsafe {
        let error = xmlGetLastError();
        if error.is_null() || (*error).code == 0 || (*error).message.is_null() {
            None
        } else {
            Some(
                CStr::from_ptr((*error).message)
                    .to_string_lossy()
                    .trim()
                    .to_string(),
            )
        }
    };
    unsafe { xmlResetLastError() };
    message
}

/// Compare a libxml2 node name with a Rust string without allocating
unsafe fn name_matches(node: *const XmlNode, name: &str) -> bool {
    let raw = unsafe { (*node).name };
    if raw.is_null() {
        return false;
    }
    unsafe { CStr::from_ptr(raw as *const c_char) }.to_bytes() == name.as_bytes()
}

/// A parsed document tree, freed on drop
pub struct XmlDocument {
    doc: NonNull<XmlDoc>,
    root: *const XmlNode,
    recovered_from: Option<String>,
    _not_send: PhantomData<*mut XmlDoc>,
}

impl XmlDocument {
    /// Name of the root element
    pub fn root_name(&self) -> String {
        unsafe { CStr::from_ptr((*self.root).name as *const c_char) }
            .to_string_lossy()
            .into_owned()
    }

    /// The first error libxml2 recovered from, if the input was malformed
    pub fn recovered_from(&self) -> Option<&str> {
        self.recovered_from.as_deref()
    }

    /// Text of the first element named `name`, depth-first from the root.
    ///
    /// The text is the character data that precedes the element's first
    /// child element, untrimmed. `None` when no such element exists.
    pub fn find_first(&self, name: &str) -> Option<String> {
        self.find_element(name).map(|node| unsafe { leading_text(node) })
    }

    /// Whether an element named `name` exists anywhere in the tree
    pub fn exists(&self, name: &str) -> bool {
        self.find_element(name).is_some()
    }

    /// Pre-order walk over element nodes without recursion.
    ///
    /// Only element nodes are descended into; entity reference children
    /// point into the DTD and their parent links do not lead back here.
    fn find_element(&self, name: &str) -> Option<*const XmlNode> {
        let root = self.root;
        let mut node = root;

        unsafe {
            loop {
                if (*node).node_type == XML_ELEMENT_NODE {
                    if name_matches(node, name) {
                        return Some(node);
                    }
                    if !(*node).children.is_null() {
                        node = (*node).children;
                        continue;
                    }
                }

                loop {
                    if node == root {
                        return None;
                    }
                    if !(*node).next.is_null() {
                        node = (*node).next;
                        break;
                    }
                    node = (*node).parent;
                    if node.is_null() {
                        return None;
                    }
                }
            }
        }
    }
}

/// Character data before the first child element (text and CDATA)
unsafe fn leading_text(element: *const XmlNode) -> String {
    let mut text = String::new();
    let mut child = unsafe { (*element).children } as *const XmlNode;

    while !child.is_null() {
        let node_type = unsafe { (*child).node_type };
        if node_type == XML_ELEMENT_NODE {
            break;
        }
        if node_type == XML_TEXT_NODE || node_type == XML_CDATA_SECTION_NODE {
            let content = unsafe { (*child).content };
            if !content.is_null() {
                text.push_str(&unsafe { CStr::from_ptr(content as *const c_char) }.to_string_lossy());
            }
        }
        child = unsafe { (*child).next };
    }

    text
}

impl Drop for XmlDocument {
    fn drop(&mut self) {
        unsafe { xmlFreeDoc(self.doc.as_ptr()) };
    }
}

/// Safe entry point to libxml2 document parsing
#[derive(Debug, Clone, Copy)]
pub struct LibXml2Wrapper {
    options: c_int,
}

impl LibXml2Wrapper {
    /// Create a wrapper that recovers from malformed markup
    ///
    /// This initializes the libxml2 parser if not already initialized.
    /// It's safe to call this multiple times - initialization happens exactly once.
    pub fn new() -> Self {
        Self::with_recovery(true)
    }

    /// Create a wrapper, choosing whether malformed markup is recovered
    pub fn with_recovery(recover: bool) -> Self {
        LIBXML2_INIT.call_once(|| unsafe {
            xmlInitParser();
        });

        let mut options = XML_PARSE_NOERROR | XML_PARSE_NOWARNING | XML_PARSE_NONET;
        if recover {
            options |= XML_PARSE_RECOVER;
        }

        Self { options }
    }

    /// Whether this wrapper parses in recovery mode
    pub fn recovers(&self) -> bool {
        self.options & XML_PARSE_RECOVER != 0
    }

    /// Parse a document from memory.
    ///
    /// In recovery mode unparseable fragments are skipped and whatever tree
    /// libxml2 built is returned. A document without a root element is a
    /// failure in either mode.
    pub fn parse_document(&self, data: &[u8]) -> ParseResult<XmlDocument> {
        if data.is_empty() {
            return Err(ParseError::EmptyDocument);
        }
        let size =
            c_int::try_from(data.len()).map_err(|_| ParseError::TooLarge { size: data.len() })?;

        unsafe {
            xmlResetLastError();
            let raw = xmlReadMemory(
                data.as_ptr() as *const c_char,
                size,
                ptr::null(),
                ptr::null(),
                self.options,
            );
            let last_error = take_last_error();

            let Some(doc) = NonNull::new(raw) else {
                return Err(ParseError::Unrecoverable {
                    details: last_error.unwrap_or_else(|| "parser returned no document".to_string()),
                });
            };

            let mut document = XmlDocument {
                doc,
                root: ptr::null(),
                recovered_from: last_error,
                _not_send: PhantomData,
            };

            document.root = xmlDocGetRootElement(doc.as_ptr());
            if document.root.is_null() {
                return Err(ParseError::NoRootElement);
            }

            Ok(document)
        }
    }
}

impl Default for LibXml2Wrapper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const METER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MeterData>
    <Header><G1>  MTR-0042  </G1></Header>
    <Readings>
        <D1>230.1</D1>
        <D2/>
        <Block><D1251>7</D1251></Block>
    </Readings>
</MeterData>"#;

    #[test]
    fn test_parse_well_formed_document() {
        let wrapper = LibXml2Wrapper::new();
        let doc = wrapper.parse_document(METER_XML.as_bytes()).unwrap();

        assert_eq!(doc.root_name(), "MeterData");
        assert!(doc.recovered_from().is_none());
    }

    #[test]
    fn test_find_first_returns_untrimmed_text() {
        let wrapper = LibXml2Wrapper::new();
        let doc = wrapper.parse_document(METER_XML.as_bytes()).unwrap();

        assert_eq!(doc.find_first("G1").as_deref(), Some("  MTR-0042  "));
        assert_eq!(doc.find_first("D2").as_deref(), Some(""));
        assert_eq!(doc.find_first("G9"), None);
    }

    #[test]
    fn test_find_first_is_depth_first() {
        let xml = r#"<root><a><id>first</id></a><id>second</id></root>"#;
        let doc = LibXml2Wrapper::new().parse_document(xml.as_bytes()).unwrap();

        assert_eq!(doc.find_first("id").as_deref(), Some("first"));
    }

    #[test]
    fn test_find_first_stops_at_child_element() {
        let xml = r#"<root><G1>head<inner>x</inner>tail</G1></root>"#;
        let doc = LibXml2Wrapper::new().parse_document(xml.as_bytes()).unwrap();

        assert_eq!(doc.find_first("G1").as_deref(), Some("head"));
    }

    #[test]
    fn test_cdata_counts_as_text() {
        let xml = r#"<root><G1><![CDATA[ 42 ]]></G1></root>"#;
        let doc = LibXml2Wrapper::new().parse_document(xml.as_bytes()).unwrap();

        assert_eq!(doc.find_first("G1").as_deref(), Some(" 42 "));
    }

    #[test]
    fn test_exists_anywhere_in_tree() {
        let wrapper = LibXml2Wrapper::new();
        let doc = wrapper.parse_document(METER_XML.as_bytes()).unwrap();

        assert!(doc.exists("D1"));
        assert!(doc.exists("D2"));
        assert!(doc.exists("D1251"));
        assert!(doc.exists("MeterData"));
        assert!(!doc.exists("D3"));
        assert!(!doc.exists("d1"));
    }

    #[test]
    fn test_recovers_truncated_document() {
        let xml = r#"<MeterData><G1>7</G1><D1>1</D1><D2>"#;
        let doc = LibXml2Wrapper::new().parse_document(xml.as_bytes()).unwrap();

        assert_eq!(doc.find_first("G1").as_deref(), Some("7"));
        assert!(doc.exists("D1"));
        assert!(!doc.exists("D3"));
    }

    #[test]
    fn test_strict_mode_rejects_truncated_document() {
        let xml = r#"<MeterData><G1>7</G1><D1>1</D1><D2>"#;
        let wrapper = LibXml2Wrapper::with_recovery(false);

        assert!(!wrapper.recovers());
        assert!(matches!(
            wrapper.parse_document(xml.as_bytes()),
            Err(ParseError::Unrecoverable { .. })
        ));
    }

    #[test]
    fn test_empty_input() {
        let result = LibXml2Wrapper::new().parse_document(&[]);
        assert_eq!(result.err(), Some(ParseError::EmptyDocument));
    }

    #[test]
    fn test_non_markup_input_fails() {
        let result = LibXml2Wrapper::new().parse_document(b"this is plainly not a document");
        assert!(result.is_err());
    }

    #[test]
    fn test_concurrent_parsing() {
        use rayon::prelude::*;

        let wrapper = LibXml2Wrapper::new();

        let identifiers: Vec<_> = (0..64)
            .into_par_iter()
            .map(|i| {
                let xml = format!("<MeterData><G1>MTR-{i}</G1><D1/></MeterData>");
                let doc = wrapper.parse_document(xml.as_bytes()).unwrap();
                assert!(doc.exists("D1"));
                doc.find_first("G1").unwrap()
            })
            .collect();

        assert_eq!(identifiers.len(), 64);
        assert_eq!(identifiers[17], "MTR-17");
    }
}
