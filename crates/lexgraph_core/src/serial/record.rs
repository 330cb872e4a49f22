//! `<rt>` record encoding and decoding.
//!
//! # Responsibility
//! - Project one domain object to its record element in canonical form.
//! - Decode a record element back into class, identity, owner and fields.
//!
//! # Invariants
//! - Record attributes are `class`, `guid`, `ownerguid`, ascending by name.
//! - Property elements follow the catalog's schema order.
//! - Collection members are ascending by guid with duplicates collapsed;
//!   sequence members keep their order.
//! - Object members carry `t="o"` when owned and `t="r"` when referenced.

use super::{Element, SerialError, SerialResult};
use crate::model::id::{Handle, ObjectId};
use crate::model::meta::{Cardinality, ClassId, FieldDescriptor, FieldId, FieldKind, MetaCatalog, ScalarType};
use crate::model::value::{FieldValue, FormattedText, ScalarValue};
use log::warn;
use std::collections::{BTreeMap, BTreeSet};

pub const RECORD_ELEMENT: &str = "rt";
pub const CUSTOM_PROPERTY_ELEMENT: &str = "Custom";
pub const OBJECT_MEMBER_ELEMENT: &str = "objsur";
pub const ALTERNATIVE_ELEMENT: &str = "AUni";
pub const UNICODE_ELEMENT: &str = "Uni";
pub const FORMATTED_TEXT_ELEMENT: &str = "Str";

const OWNING_TAG: &str = "o";
const REFERENCE_TAG: &str = "r";

/// Field content of one decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub class: ClassId,
    pub id: ObjectId,
    pub owner: Option<ObjectId>,
    pub fields: BTreeMap<FieldId, FieldValue>,
}

/// Encodes one object's content as a canonical record element.
///
/// `id_of` maps handles held in object-valued fields back to identities;
/// unresolvable handles are skipped.
pub fn encode_record<'a>(
    catalog: &MetaCatalog,
    class: ClassId,
    id: ObjectId,
    owner: Option<ObjectId>,
    fields: impl Fn(FieldId) -> Option<&'a FieldValue>,
    id_of: impl Fn(Handle) -> Option<ObjectId>,
) -> SerialResult<Element> {
    let class_name = catalog
        .class_name(class)
        .ok_or_else(|| SerialError::UnknownClass(format!("#{class}")))?;

    let mut record = Element::new(RECORD_ELEMENT)
        .with_attr("class", class_name)
        .with_attr("guid", id.to_canonical_string());
    if let Some(owner) = owner {
        record = record.with_attr("ownerguid", owner.to_canonical_string());
    }

    for descriptor in catalog.fields_of(class) {
        let Some(value) = fields(descriptor.id) else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        let mut property = property_element(descriptor);
        encode_value(descriptor, value, &id_of, &mut property)?;
        if property.children.is_empty() && property.attributes.len() == usize::from(descriptor.is_custom()) {
            continue;
        }
        record.children.push(property);
    }
    Ok(record)
}

fn property_element(descriptor: &FieldDescriptor) -> Element {
    if descriptor.is_custom() {
        Element::new(CUSTOM_PROPERTY_ELEMENT).with_attr("name", descriptor.name.as_str())
    } else {
        Element::new(descriptor.name.as_str())
    }
}

fn encode_value(
    descriptor: &FieldDescriptor,
    value: &FieldValue,
    id_of: &impl Fn(Handle) -> Option<ObjectId>,
    property: &mut Element,
) -> SerialResult<()> {
    match (descriptor.kind, value) {
        (FieldKind::Scalar(_), FieldValue::Scalar(scalar)) => {
            match scalar {
                ScalarValue::Boolean(flag) => {
                    property
                        .attributes
                        .push(("val".to_string(), if *flag { "True" } else { "False" }.to_string()));
                }
                ScalarValue::Integer(number) | ScalarValue::Time(number) => {
                    property.attributes.push(("val".to_string(), number.to_string()));
                }
                ScalarValue::Guid(guid) => {
                    property
                        .attributes
                        .push(("val".to_string(), guid.to_canonical_string()));
                }
                ScalarValue::Unicode(text) => {
                    property
                        .children
                        .push(Element::new(UNICODE_ELEMENT).with_text(text.as_str()));
                }
                ScalarValue::Text(text) => {
                    property
                        .children
                        .push(Element::new(FORMATTED_TEXT_ELEMENT).with_text(text.as_str()));
                }
            }
            Ok(())
        }
        (FieldKind::MultiString, FieldValue::Multi(alternatives)) => {
            for (ws, text) in alternatives {
                property.children.push(
                    Element::new(ALTERNATIVE_ELEMENT)
                        .with_attr("ws", ws.as_str())
                        .with_text(text.as_str()),
                );
            }
            Ok(())
        }
        (kind, FieldValue::Atomic(_) | FieldValue::Vector(_)) if kind.is_object() => {
            let tag = if kind.is_owning() { OWNING_TAG } else { REFERENCE_TAG };
            let mut ids: Vec<ObjectId> = value.targets().into_iter().filter_map(id_of).collect();
            if kind.cardinality() == Some(Cardinality::Collection) {
                ids.sort();
                ids.dedup();
            }
            for id in ids {
                property.children.push(
                    Element::new(OBJECT_MEMBER_ELEMENT)
                        .with_attr("guid", id.to_canonical_string())
                        .with_attr("t", tag),
                );
            }
            Ok(())
        }
        _ => Err(SerialError::InvalidValue {
            field: descriptor.name.clone(),
            value: format!("{value:?}"),
        }),
    }
}

/// Reads class, identity and owner without decoding fields.
pub fn record_header(record: &Element) -> SerialResult<(String, ObjectId, Option<ObjectId>)> {
    if record.name != RECORD_ELEMENT {
        return Err(SerialError::Malformed(format!(
            "expected `{RECORD_ELEMENT}` element, found `{}`",
            record.name
        )));
    }
    let class = record.required_attr("class")?.to_string();
    let id = parse_guid(record.required_attr("guid")?, "guid")?;
    let owner = record
        .attr("ownerguid")
        .map(|value| parse_guid(value, "ownerguid"))
        .transpose()?;
    Ok((class, id, owner))
}

/// Decodes a record; `resolve` maps member guids to session handles.
/// Members that do not resolve are dropped with a warning.
pub fn decode_record(
    catalog: &MetaCatalog,
    record: &Element,
    resolve: impl Fn(ObjectId) -> Option<Handle>,
) -> SerialResult<DecodedRecord> {
    let (class_name, id, owner) = record_header(record)?;
    let class = catalog
        .class_id(&class_name)
        .ok_or_else(|| SerialError::UnknownClass(class_name.clone()))?;

    let mut fields = BTreeMap::new();
    for property in &record.children {
        let field_name = if property.name == CUSTOM_PROPERTY_ELEMENT {
            property.required_attr("name")?
        } else {
            property.name.as_str()
        };
        let descriptor = catalog
            .field_by_name(class, field_name)
            .ok_or_else(|| SerialError::UnknownField {
                class: class_name.clone(),
                field: field_name.to_string(),
            })?;
        if let Some(value) = decode_value(descriptor, property, id, &resolve)? {
            fields.insert(descriptor.id, value);
        }
    }

    Ok(DecodedRecord {
        class,
        id,
        owner,
        fields,
    })
}

fn decode_value(
    descriptor: &FieldDescriptor,
    property: &Element,
    record_id: ObjectId,
    resolve: &impl Fn(ObjectId) -> Option<Handle>,
) -> SerialResult<Option<FieldValue>> {
    let value = match descriptor.kind {
        FieldKind::Scalar(scalar_type) => {
            Some(FieldValue::Scalar(decode_scalar(descriptor, scalar_type, property)?))
        }
        FieldKind::MultiString => {
            let mut alternatives = BTreeMap::new();
            for alternative in &property.children {
                let ws = alternative.required_attr("ws")?;
                alternatives
                    .entry(ws.to_string())
                    .or_insert_with(|| alternative.text_or_empty().to_string());
            }
            (!alternatives.is_empty()).then_some(FieldValue::Multi(alternatives))
        }
        kind => {
            let mut handles = Vec::new();
            let mut seen = BTreeSet::new();
            for member in &property.children {
                let target = parse_guid(member.required_attr("guid")?, &descriptor.name)?;
                let Some(handle) = resolve(target) else {
                    warn!(
                        "event=record_decode module=serial status=dangling record={} field={} target={}",
                        record_id, descriptor.name, target
                    );
                    continue;
                };
                if kind.cardinality() == Some(Cardinality::Collection) && !seen.insert(handle) {
                    continue;
                }
                handles.push(handle);
            }
            match kind.cardinality() {
                Some(Cardinality::Atomic) => handles.first().copied().map(FieldValue::Atomic),
                _ => (!handles.is_empty()).then_some(FieldValue::Vector(handles)),
            }
        }
    };
    Ok(value)
}

fn decode_scalar(
    descriptor: &FieldDescriptor,
    scalar_type: ScalarType,
    property: &Element,
) -> SerialResult<ScalarValue> {
    let invalid = |value: &str| SerialError::InvalidValue {
        field: descriptor.name.clone(),
        value: value.to_string(),
    };
    let value = match scalar_type {
        ScalarType::Boolean => match property.required_attr("val")? {
            "True" => ScalarValue::Boolean(true),
            "False" => ScalarValue::Boolean(false),
            other => return Err(invalid(other)),
        },
        ScalarType::Integer => {
            let raw = property.required_attr("val")?;
            ScalarValue::Integer(raw.parse().map_err(|_| invalid(raw))?)
        }
        ScalarType::Time => {
            let raw = property.required_attr("val")?;
            ScalarValue::Time(raw.parse().map_err(|_| invalid(raw))?)
        }
        ScalarType::Guid => ScalarValue::Guid(parse_guid(
            property.required_attr("val")?,
            &descriptor.name,
        )?),
        ScalarType::Unicode => ScalarValue::Unicode(child_text(property, UNICODE_ELEMENT)),
        ScalarType::FormattedText => {
            ScalarValue::Text(FormattedText::new(child_text(property, FORMATTED_TEXT_ELEMENT)))
        }
    };
    Ok(value)
}

fn child_text(property: &Element, name: &str) -> String {
    property
        .children
        .iter()
        .find(|child| child.name == name)
        .map(|child| child.text_or_empty().to_string())
        .unwrap_or_default()
}

fn parse_guid(value: &str, field: &str) -> SerialResult<ObjectId> {
    ObjectId::parse(value).map_err(|_| SerialError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    })
}
