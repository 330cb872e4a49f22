//! Canonicalization of serialized records and whole documents.
//!
//! A record is canonicalized by decoding it against the catalog and
//! re-encoding it, so canonical text is exactly what the encoder emits for
//! the same content.

use super::custom_fields::parse_custom_fields;
use super::document::{read_document, DocumentWriter};
use super::record::{decode_record, encode_record, record_header, OBJECT_MEMBER_ELEMENT};
use super::sort::ExternalSorter;
use super::{parse_element, write_element, Element, SerialError, SerialResult};
use crate::model::id::{Handle, ObjectId};
use crate::model::meta::MetaCatalog;
use std::collections::HashMap;

/// Canonical form of one `<rt>` element.
pub fn canonical_record_element(catalog: &MetaCatalog, record: &Element) -> SerialResult<Element> {
    let members = MemberTable::collect(record)?;
    let decoded = decode_record(catalog, record, |id| members.handle_of(id))?;
    encode_record(
        catalog,
        decoded.class,
        decoded.id,
        decoded.owner,
        |field| decoded.fields.get(&field),
        |handle| members.id_of(handle),
    )
}

/// Canonical text of one record.
pub fn canonicalize_record(catalog: &MetaCatalog, xml: &str) -> SerialResult<String> {
    let record = parse_element(xml)?;
    write_element(&canonical_record_element(catalog, &record)?)
}

/// Canonical text of a whole repository document.
///
/// Custom fields declared by the document are merged into a copy of
/// `catalog` before its records are decoded.
pub fn canonicalize_document(
    catalog: &MetaCatalog,
    xml: &str,
    sorter: ExternalSorter,
) -> SerialResult<String> {
    let document = read_document(xml)?;
    let mut catalog = catalog.clone();
    let custom_fields = match &document.custom_fields {
        Some(block) => parse_custom_fields(block)?,
        None => Vec::new(),
    };
    catalog.merge_custom_fields(&custom_fields)?;

    let mut writer = DocumentWriter::new(Vec::new(), document.version.as_str(), sorter)
        .with_custom_fields(catalog.custom_fields());
    for record in &document.records {
        let (_, id, _) = record_header(record)?;
        let canonical = canonical_record_element(&catalog, record)?;
        writer.push_record(id, write_element(&canonical)?)?;
    }
    let bytes = writer.finish()?;
    String::from_utf8(bytes)
        .map_err(|err| SerialError::Xml(format!("document is not valid utf-8: {err}")))
}

/// Stand-in handles for every object member a record mentions.
struct MemberTable {
    ids: Vec<ObjectId>,
    handles: HashMap<ObjectId, Handle>,
}

impl MemberTable {
    fn collect(record: &Element) -> SerialResult<Self> {
        let mut table = Self {
            ids: Vec::new(),
            handles: HashMap::new(),
        };
        for property in &record.children {
            for member in &property.children {
                if member.name != OBJECT_MEMBER_ELEMENT {
                    continue;
                }
                let raw = member.required_attr("guid")?;
                let id = ObjectId::parse(raw).map_err(|_| SerialError::InvalidValue {
                    field: property.name.clone(),
                    value: raw.to_string(),
                })?;
                if !table.handles.contains_key(&id) {
                    let handle = Handle(table.ids.len() as u32);
                    table.ids.push(id);
                    table.handles.insert(id, handle);
                }
            }
        }
        Ok(table)
    }

    fn handle_of(&self, id: ObjectId) -> Option<Handle> {
        self.handles.get(&id).copied()
    }

    fn id_of(&self, handle: Handle) -> Option<ObjectId> {
        self.ids.get(handle.index()).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::canonicalize_record;
    use crate::model::meta::MetaCatalog;

    const MESSY: &str = r#"<rt ownerguid="00000000-0000-4000-8000-0000000000AA" guid="00000000-0000-4000-8000-000000000001" class="LexSense">
  <SemanticDomains>
    <objsur t="r" guid="00000000-0000-4000-8000-00000000000C"/>
    <objsur t="r" guid="00000000-0000-4000-8000-00000000000b"/>
    <objsur t="r" guid="00000000-0000-4000-8000-00000000000c"/>
  </SemanticDomains>
  <Gloss>
    <AUni ws="fr">chat</AUni>
    <AUni ws="en">cat</AUni>
  </Gloss>
</rt>"#;

    #[test]
    fn canonical_record_orders_attributes_fields_and_members() {
        let catalog = MetaCatalog::builtin();
        let canonical = canonicalize_record(&catalog, MESSY).unwrap();
        let expected = r#"<rt class="LexSense" guid="00000000-0000-4000-8000-000000000001" ownerguid="00000000-0000-4000-8000-0000000000aa">
  <Gloss>
    <AUni ws="en">cat</AUni>
    <AUni ws="fr">chat</AUni>
  </Gloss>
  <SemanticDomains>
    <objsur guid="00000000-0000-4000-8000-00000000000b" t="r"/>
    <objsur guid="00000000-0000-4000-8000-00000000000c" t="r"/>
  </SemanticDomains>
</rt>"#;
        assert_eq!(canonical, expected);
        assert_eq!(canonicalize_record(&catalog, &canonical).unwrap(), canonical);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let catalog = MetaCatalog::builtin();
        let xml = r#"<rt class="LexDb" guid="00000000-0000-4000-8000-000000000001"><Bogus/></rt>"#;
        assert!(canonicalize_record(&catalog, xml).is_err());
    }
}
