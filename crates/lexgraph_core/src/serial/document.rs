//! Whole-repository document reading and writing.
//!
//! Layout: XML declaration, `<languageproject version="..">`, the optional
//! custom-field block, then one `<rt>` record per object ascending by guid.
//! Records are routed through [`ExternalSorter`] so the writer never holds
//! the whole repository.

use super::custom_fields::{custom_fields_element, BLOCK_ELEMENT};
use super::record::RECORD_ELEMENT;
use super::sort::ExternalSorter;
use super::{parse_element, write_element, Element, SerialError, SerialResult};
use crate::model::id::ObjectId;
use crate::model::meta::CustomFieldDef;
use log::info;
use std::io::Write;

pub const DOCUMENT_ELEMENT: &str = "languageproject";
const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="utf-8"?>"#;

/// Parsed repository document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryDocument {
    pub version: String,
    pub custom_fields: Option<Element>,
    pub records: Vec<Element>,
}

pub fn read_document(xml: &str) -> SerialResult<RepositoryDocument> {
    let root = parse_element(xml)?;
    if root.name != DOCUMENT_ELEMENT {
        return Err(SerialError::Malformed(format!(
            "expected `{DOCUMENT_ELEMENT}` root, found `{}`",
            root.name
        )));
    }
    let version = root.required_attr("version")?.to_string();
    let mut custom_fields = None;
    let mut records = Vec::new();
    for child in root.children {
        match child.name.as_str() {
            BLOCK_ELEMENT => custom_fields = Some(child),
            RECORD_ELEMENT => records.push(child),
            other => {
                return Err(SerialError::Malformed(format!(
                    "unexpected `{other}` element in document"
                )))
            }
        }
    }
    Ok(RepositoryDocument {
        version,
        custom_fields,
        records,
    })
}

/// Streaming document writer over any byte sink.
pub struct DocumentWriter<W: Write> {
    out: W,
    version: String,
    custom_fields: Vec<CustomFieldDef>,
    sorter: ExternalSorter,
    records: usize,
}

impl<W: Write> DocumentWriter<W> {
    pub fn new(out: W, version: &str, sorter: ExternalSorter) -> Self {
        Self {
            out,
            version: version.to_string(),
            custom_fields: Vec::new(),
            sorter,
            records: 0,
        }
    }

    pub fn with_custom_fields(mut self, defs: Vec<CustomFieldDef>) -> Self {
        self.custom_fields = defs;
        self
    }

    /// Queues one already-canonical record keyed by its guid.
    pub fn push_record(&mut self, id: ObjectId, record_xml: String) -> SerialResult<()> {
        self.records += 1;
        self.sorter
            .push(id.to_canonical_string(), record_xml.into_bytes())?;
        Ok(())
    }

    /// Writes the document and hands the sink back.
    pub fn finish(mut self) -> SerialResult<W> {
        let spills = self.sorter.spill_count();
        let root = Element::new(DOCUMENT_ELEMENT).with_attr("version", self.version.as_str());
        let open_tag = write_element(&root)?;
        let open_tag = open_tag.trim_end_matches("/>").to_string() + ">";

        let mut emit = |bytes: &[u8]| -> SerialResult<()> {
            self.out.write_all(bytes).map_err(io_error)?;
            self.out.write_all(b"\n").map_err(io_error)
        };
        emit(XML_DECLARATION.as_bytes())?;
        emit(open_tag.as_bytes())?;
        if let Some(block) = custom_fields_element(&self.custom_fields) {
            emit(write_element(&block)?.as_bytes())?;
        }
        for entry in self.sorter.finish()? {
            let (_, record) = entry?;
            emit(&record)?;
        }
        emit(format!("</{DOCUMENT_ELEMENT}>").as_bytes())?;
        self.out.flush().map_err(io_error)?;

        info!(
            "event=document_write module=serial status=ok records={} spills={}",
            self.records, spills
        );
        Ok(self.out)
    }
}

fn io_error(err: std::io::Error) -> SerialError {
    SerialError::Sort(err.into())
}

#[cfg(test)]
mod tests {
    use super::{read_document, DocumentWriter};
    use crate::model::id::ObjectId;
    use crate::model::meta::{CustomFieldDef, FieldKind};
    use crate::serial::sort::ExternalSorter;

    #[test]
    fn records_are_written_ascending_by_guid() {
        let low = ObjectId::parse("00000000-0000-4000-8000-000000000001").unwrap();
        let high = ObjectId::parse("ffffffff-0000-4000-8000-000000000001").unwrap();
        let mut writer = DocumentWriter::new(Vec::new(), "7000072", ExternalSorter::new(0))
            .with_custom_fields(vec![CustomFieldDef::new(
                "LexEntry",
                "Note",
                FieldKind::MultiString,
            )]);
        writer
            .push_record(high, format!(r#"<rt class="LexDb" guid="{high}"/>"#))
            .unwrap();
        writer
            .push_record(low, format!(r#"<rt class="LexDb" guid="{low}"/>"#))
            .unwrap();
        let text = String::from_utf8(writer.finish().unwrap()).unwrap();

        assert!(text.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<languageproject version=\"7000072\">\n"));
        assert!(text.find(&low.to_string()).unwrap() < text.find(&high.to_string()).unwrap());

        let document = read_document(&text).unwrap();
        assert_eq!(document.version, "7000072");
        assert_eq!(document.records.len(), 2);
        assert!(document.custom_fields.is_some());
    }
}
