//! XML reading and writing for the element tree.
//!
//! Elements without children and without text are written self-closed, so an
//! empty text and a missing text read back identically.

use super::{Element, SerialError, SerialResult};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;

const INDENT_WIDTH: usize = 2;

/// Serializes one element subtree with two-space indentation.
pub fn write_element(element: &Element) -> SerialResult<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', INDENT_WIDTH);
    write_into(&mut writer, element)?;
    String::from_utf8(writer.into_inner())
        .map_err(|err| SerialError::Xml(format!("writer produced invalid utf-8: {err}")))
}

fn write_into(writer: &mut Writer<Vec<u8>>, element: &Element) -> SerialResult<()> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    let text = element.text.as_deref().filter(|value| !value.is_empty());
    if element.children.is_empty() && text.is_none() {
        writer
            .write_event(Event::Empty(start))
            .map_err(xml_error)?;
        return Ok(());
    }

    writer.write_event(Event::Start(start)).map_err(xml_error)?;
    if let Some(text) = text {
        writer
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(xml_error)?;
    }
    for child in &element.children {
        write_into(writer, child)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(element.name.as_str())))
        .map_err(xml_error)?;
    Ok(())
}

/// Parses the first root element of `xml`, skipping declarations and
/// comments. Text of elements that also have child elements is dropped.
pub fn parse_element(xml: &str) -> SerialResult<Element> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Element> = Vec::new();

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(start) => stack.push(element_from_start(&start)?),
            Event::Empty(start) => {
                let element = element_from_start(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(element),
                }
            }
            Event::End(_) => {
                let mut element = stack
                    .pop()
                    .ok_or_else(|| SerialError::Malformed("unbalanced end tag".to_string()))?;
                if !element.children.is_empty() {
                    element.text = None;
                }
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(element),
                }
            }
            Event::Text(text) => {
                if let Some(current) = stack.last_mut() {
                    let value = text.unescape().map_err(xml_error)?;
                    current
                        .text
                        .get_or_insert_with(String::new)
                        .push_str(&value);
                }
            }
            Event::CData(data) => {
                if let Some(current) = stack.last_mut() {
                    let value = String::from_utf8(data.into_inner().into_owned()).map_err(|err| {
                        SerialError::Xml(format!("cdata is not valid utf-8: {err}"))
                    })?;
                    current
                        .text
                        .get_or_insert_with(String::new)
                        .push_str(&value);
                }
            }
            Event::Eof => {
                return Err(SerialError::Malformed(
                    "document ended before root element closed".to_string(),
                ))
            }
            _ => {}
        }
    }
}

fn element_from_start(start: &BytesStart<'_>) -> SerialResult<Element> {
    let name = std::str::from_utf8(start.name().as_ref())
        .map_err(|err| SerialError::Xml(format!("element name is not utf-8: {err}")))?
        .to_string();
    let mut element = Element::new(name);
    for attribute in start.attributes() {
        let attribute = attribute.map_err(xml_error)?;
        let key = std::str::from_utf8(attribute.key.as_ref())
            .map_err(|err| SerialError::Xml(format!("attribute name is not utf-8: {err}")))?
            .to_string();
        let value = attribute.unescape_value().map_err(xml_error)?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn xml_error(err: impl std::fmt::Display) -> SerialError {
    SerialError::Xml(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::{parse_element, write_element};
    use crate::serial::Element;

    #[test]
    fn write_then_parse_preserves_tree() {
        let element = Element::new("rt")
            .with_attr("class", "LexEntry")
            .with_child(
                Element::new("CitationForm").with_child(
                    Element::new("AUni")
                        .with_attr("ws", "en")
                        .with_text("a < b & \"c\""),
                ),
            )
            .with_child(Element::new("Senses"));

        let xml = write_element(&element).unwrap();
        let parsed = parse_element(&xml).unwrap();
        assert_eq!(parsed, element);
    }

    #[test]
    fn empty_text_is_written_self_closed() {
        let xml = write_element(&Element::new("Uni").with_text("")).unwrap();
        assert_eq!(xml, "<Uni/>");
    }

    #[test]
    fn unterminated_document_is_malformed() {
        assert!(parse_element("<rt><Name>").is_err());
    }
}
