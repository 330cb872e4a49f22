//! Repository-level custom-field declaration block.

use super::{Element, SerialError, SerialResult};
use crate::model::id::ObjectId;
use crate::model::meta::{CustomFieldDef, FieldKind};

pub const BLOCK_ELEMENT: &str = "AdditionalFields";
pub const ENTRY_ELEMENT: &str = "CustomField";

/// Builds the `<AdditionalFields>` block; `None` when there is nothing to
/// declare. Entries are ordered by (class, name), attributes by name.
pub fn custom_fields_element(defs: &[CustomFieldDef]) -> Option<Element> {
    if defs.is_empty() {
        return None;
    }
    let mut sorted: Vec<&CustomFieldDef> = defs.iter().collect();
    sorted.sort_by(|a, b| (a.class.as_str(), a.name.as_str()).cmp(&(b.class.as_str(), b.name.as_str())));

    let mut block = Element::new(BLOCK_ELEMENT);
    for def in sorted {
        let mut entry = Element::new(ENTRY_ELEMENT)
            .with_attr("class", def.class.as_str())
            .with_attr("name", def.name.as_str())
            .with_attr("type", def.kind.type_name());
        if def.kind.takes_ws_selector() {
            if let Some(ws) = def.ws_selector {
                entry = entry.with_attr("wsSelector", ws.to_string());
            }
        }
        if def.kind.is_object() {
            if let Some(dest) = &def.dest_class {
                entry = entry.with_attr("destclass", dest.as_str());
            }
            if let Some(root) = def.list_root {
                entry = entry.with_attr("listRoot", root.to_canonical_string());
            }
        }
        entry.attributes.sort();
        block.children.push(entry);
    }
    Some(block)
}

pub fn parse_custom_fields(block: &Element) -> SerialResult<Vec<CustomFieldDef>> {
    if block.name != BLOCK_ELEMENT {
        return Err(SerialError::Malformed(format!(
            "expected `{BLOCK_ELEMENT}` element, found `{}`",
            block.name
        )));
    }
    block
        .children
        .iter()
        .filter(|entry| entry.name == ENTRY_ELEMENT)
        .map(parse_entry)
        .collect()
}

fn parse_entry(entry: &Element) -> SerialResult<CustomFieldDef> {
    let name = entry.required_attr("name")?;
    let type_name = entry.required_attr("type")?;
    let kind = FieldKind::parse_type_name(type_name).ok_or_else(|| SerialError::InvalidValue {
        field: name.to_string(),
        value: type_name.to_string(),
    })?;
    let mut def = CustomFieldDef::new(entry.required_attr("class")?, name, kind);
    def.ws_selector = entry
        .attr("wsSelector")
        .map(|raw| {
            raw.parse::<i32>().map_err(|_| SerialError::InvalidValue {
                field: name.to_string(),
                value: raw.to_string(),
            })
        })
        .transpose()?;
    def.dest_class = entry.attr("destclass").map(str::to_string);
    def.list_root = entry
        .attr("listRoot")
        .map(|raw| {
            ObjectId::parse(raw).map_err(|_| SerialError::InvalidValue {
                field: name.to_string(),
                value: raw.to_string(),
            })
        })
        .transpose()?;
    Ok(def)
}

#[cfg(test)]
mod tests {
    use super::{custom_fields_element, parse_custom_fields};
    use crate::model::meta::{CustomFieldDef, FieldKind};

    #[test]
    fn block_attributes_are_sorted_by_name() {
        let mut def = CustomFieldDef::new("LexSense", "Register", FieldKind::ReferenceAtomic);
        def.dest_class = Some("CmPossibility".to_string());
        let block = custom_fields_element(&[def.clone()]).unwrap();
        let names: Vec<_> = block.children[0]
            .attributes
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(names, vec!["class", "destclass", "name", "type"]);
        assert_eq!(parse_custom_fields(&block).unwrap(), vec![def]);
    }

    #[test]
    fn empty_declarations_produce_no_block() {
        assert!(custom_fields_element(&[]).is_none());
    }
}
