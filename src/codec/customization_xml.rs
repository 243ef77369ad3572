use anyhow::Result;
use quick_xml::events::{BytesCData, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::model::{Value, Values};

pub const ATTRIBUTE_PREFIX: &str = "@_";
pub const TEXT_KEY: &str = "#text";

/// A customization record exchanged with the service as an XML document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomizationInfo {
    /// Name of the document's root tag
    pub type_name: String,
    pub values: Values,
}

fn xml_error(message: impl Into<String>) -> anyhow::Error {
    EngineError::Xml(message.into()).into()
}

/// Element being parsed.
struct OpenNode {
    name: String,
    attributes: Values,
    children: Values,
    text: String,
}

impl OpenNode {
    fn new(start: &BytesStart<'_>) -> Result<Self> {
        let name = std::str::from_utf8(start.name().as_ref())
            .map_err(|e| xml_error(format!("Invalid tag name: {}", e)))?
            .to_string();
        let mut attributes = Values::new();
        for attribute in start.attributes() {
            let attribute = attribute.map_err(|e| xml_error(format!("Invalid attribute in <{}>: {}", name, e)))?;
            let key = std::str::from_utf8(attribute.key.as_ref())
                .map_err(|e| xml_error(format!("Invalid attribute name in <{}>: {}", name, e)))?;
            let value = attribute
                .unescape_value()
                .map_err(|e| xml_error(format!("Invalid value of attribute {} in <{}>: {}", key, name, e)))?;
            attributes.insert(format!("{}{}", ATTRIBUTE_PREFIX, key), Value::string(value.into_owned()));
        }
        Ok(Self {
            name,
            attributes,
            children: Values::new(),
            text: String::new(),
        })
    }

    /// Text-only nodes (including CDATA-only ones) become plain strings.
    fn into_value(self) -> Value {
        if self.attributes.is_empty() && self.children.is_empty() {
            return Value::String(self.text);
        }
        let mut values = self.attributes;
        values.extend(self.children);
        if !self.text.is_empty() {
            values.insert(TEXT_KEY.to_string(), Value::String(self.text));
        }
        Value::Object(values)
    }

    /// Repeated tags collect into a list.
    fn add_child(&mut self, name: String, value: Value) {
        match self.children.remove(&name) {
            None => {
                self.children.insert(name, value);
            }
            Some(Value::Array(mut items)) => {
                items.push(value);
                self.children.insert(name, Value::Array(items));
            }
            Some(existing) => {
                self.children.insert(name, Value::Array(vec![existing, value]));
            }
        }
    }
}

/// Parse a single-root XML document.
pub fn convert_to_customization_info(xml: &str) -> Result<CustomizationInfo> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<OpenNode> = Vec::new();
    let mut root: Option<(String, Value)> = None;

    let mut close = |node: OpenNode, stack: &mut Vec<OpenNode>| -> Result<()> {
        let name = node.name.clone();
        let value = node.into_value();
        match stack.last_mut() {
            Some(parent) => parent.add_child(name, value),
            None if root.is_none() => root = Some((name, value)),
            None => return Err(xml_error(format!("Document has more than one root element (<{}>)", name))),
        }
        Ok(())
    };

    loop {
        let event = reader
            .read_event()
            .map_err(|e| xml_error(format!("{} at position {}", e, reader.buffer_position())))?;
        match event {
            Event::Start(start) => stack.push(OpenNode::new(&start)?),
            Event::Empty(start) => {
                let node = OpenNode::new(&start)?;
                close(node, &mut stack)?;
            }
            Event::Text(text) => {
                let text = text
                    .unescape()
                    .map_err(|e| xml_error(format!("Invalid text: {}", e)))?;
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&text);
                }
            }
            Event::CData(cdata) => {
                let text = String::from_utf8(cdata.into_inner().into_owned())
                    .map_err(|e| xml_error(format!("Invalid CDATA: {}", e)))?;
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&text);
                }
            }
            Event::End(_) => {
                let node = stack.pop().ok_or_else(|| xml_error("Unexpected closing tag"))?;
                close(node, &mut stack)?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(unclosed) = stack.last() {
        return Err(xml_error(format!("Unclosed element <{}>", unclosed.name)));
    }
    match root {
        Some((type_name, Value::Object(values))) => Ok(CustomizationInfo { type_name, values }),
        Some((type_name, Value::String(text))) => {
            let mut values = Values::new();
            if !text.is_empty() {
                values.insert(TEXT_KEY.to_string(), Value::String(text));
            }
            Ok(CustomizationInfo { type_name, values })
        }
        Some((type_name, _)) => Ok(CustomizationInfo {
            type_name,
            values: Values::new(),
        }),
        None => Err(xml_error("Document has no root element")),
    }
}

fn primitive_text(value: &Value, name: &str) -> Result<String> {
    match value {
        Value::Null => Ok(String::new()),
        other => other
            .to_primitive_string()
            .ok_or_else(|| xml_error(format!("Value of {} cannot be written as text", name))),
    }
}

/// Text with leading or trailing whitespace goes out as CDATA, since the
/// reader trims plain text. A `]]>` inside is split across two sections.
fn write_text(writer: &mut Writer<Vec<u8>>, text: &str) -> Result<()> {
    if text.is_empty() {
        return Ok(());
    }
    if text.trim() == text {
        writer.write_event(Event::Text(BytesText::new(text)))?;
        return Ok(());
    }
    let mut rest = text;
    while let Some(pos) = rest.find("]]>") {
        writer.write_event(Event::CData(BytesCData::new(&rest[..pos + 2])))?;
        rest = &rest[pos + 2..];
    }
    writer.write_event(Event::CData(BytesCData::new(rest)))?;
    Ok(())
}

fn write_node(writer: &mut Writer<Vec<u8>>, name: &str, value: &Value) -> Result<()> {
    match value {
        Value::Array(items) => {
            for item in items {
                if item.is_array() {
                    return Err(xml_error(format!("Nested lists cannot be written as <{}>", name)));
                }
                write_node(writer, name, item)?;
            }
        }
        Value::Object(map) => {
            let mut start = BytesStart::new(name);
            for (key, attribute) in map {
                if let Some(attribute_name) = key.strip_prefix(ATTRIBUTE_PREFIX) {
                    start.push_attribute((attribute_name, primitive_text(attribute, key)?.as_str()));
                }
            }
            writer.write_event(Event::Start(start))?;
            if let Some(text) = map.get(TEXT_KEY) {
                write_text(writer, &primitive_text(text, name)?)?;
            }
            for (key, child) in map {
                if key.starts_with(ATTRIBUTE_PREFIX) || key == TEXT_KEY {
                    continue;
                }
                write_node(writer, key, child)?;
            }
            writer.write_event(Event::End(BytesEnd::new(name)))?;
        }
        Value::Reference(reference) => {
            return Err(xml_error(format!(
                "Reference to {} must be resolved before writing <{}>",
                reference.elem_id(),
                name
            )));
        }
        primitive => {
            writer.write_event(Event::Start(BytesStart::new(name)))?;
            write_text(writer, &primitive_text(primitive, name)?)?;
            writer.write_event(Event::End(BytesEnd::new(name)))?;
        }
    }
    Ok(())
}

/// Render a customization record as an unformatted XML document. Text is
/// escaped unless its surrounding whitespace has to survive the round trip.
pub fn convert_to_xml_content(info: &CustomizationInfo) -> Result<String> {
    let mut writer = Writer::new(Vec::new());
    write_node(&mut writer, &info.type_name, &Value::Object(info.values.clone()))?;
    String::from_utf8(writer.into_inner()).map_err(|e| xml_error(format!("Rendered XML is not UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::values_from_json;
    use serde_json::json;

    const ENTRY_FORM: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<entryForm scriptid="custform_1" standard="STANDARDCUSTOMERFORM">
  <name><![CDATA[Customer <Main> Form]]></name>
  <mainFields>
    <fieldGroup scriptid="fg_1"><label>Primary</label></fieldGroup>
    <fieldGroup scriptid="fg_2"><label>Secondary &amp; more</label></fieldGroup>
  </mainFields>
  <inactive>F</inactive>
  <description/>
</entryForm>"#;

    #[test]
    fn test_convert_to_customization_info() {
        let info = convert_to_customization_info(ENTRY_FORM).unwrap();
        assert_eq!(info.type_name, "entryForm");
        assert_eq!(
            Value::Object(info.values),
            Value::from(json!({
                "@_scriptid": "custform_1",
                "@_standard": "STANDARDCUSTOMERFORM",
                "name": "Customer <Main> Form",
                "mainFields": {
                    "fieldGroup": [
                        {"@_scriptid": "fg_1", "label": "Primary"},
                        {"@_scriptid": "fg_2", "label": "Secondary & more"},
                    ]
                },
                "inactive": "F",
                "description": "",
            }))
        );
        println!("✓ CDATA nodes flattened, attributes prefixed, repeated tags listed");
    }

    #[test]
    fn test_round_trip_keeps_values() {
        let info = convert_to_customization_info(ENTRY_FORM).unwrap();
        let xml = convert_to_xml_content(&info).unwrap();
        assert!(xml.starts_with("<entryForm scriptid=\"custform_1\" standard=\"STANDARDCUSTOMERFORM\">"));
        assert!(xml.contains("<name>Customer &lt;Main&gt; Form</name>"));
        assert_eq!(convert_to_customization_info(&xml).unwrap(), info);
    }

    #[test]
    fn test_text_next_to_attributes() {
        let info = convert_to_customization_info(r#"<role id="3">Admin<![CDATA[ & co]]></role>"#).unwrap();
        assert_eq!(
            Value::Object(info.values.clone()),
            Value::from(json!({"@_id": "3", "#text": "Admin & co"}))
        );
        let xml = convert_to_xml_content(&info).unwrap();
        assert_eq!(xml, r#"<role id="3">Admin &amp; co</role>"#);
    }

    #[test]
    fn test_surrounding_whitespace_survives_round_trip() {
        let xml = "<clientScript><code><![CDATA[  var x = 1;\n]]></code></clientScript>";
        let mut info = convert_to_customization_info(xml).unwrap();
        assert_eq!(info.values["code"], Value::string("  var x = 1;\n"));
        info.values.insert("note".to_string(), Value::string(" a ]]> b"));

        let written = convert_to_xml_content(&info).unwrap();
        assert!(written.contains("<![CDATA[  var x = 1;\n]]>"), "{}", written);
        assert_eq!(convert_to_customization_info(&written).unwrap(), info);
        println!("✓ Whitespace around text written as CDATA");
    }

    #[test]
    fn test_text_only_root() {
        let info = convert_to_customization_info("<script><![CDATA[alert(1)]]></script>").unwrap();
        assert_eq!(info.type_name, "script");
        assert_eq!(Value::Object(info.values.clone()), Value::from(json!({"#text": "alert(1)"})));
        let xml = convert_to_xml_content(&info).unwrap();
        assert_eq!(xml, "<script>alert(1)</script>");
        assert_eq!(convert_to_customization_info(&xml).unwrap(), info);

        let empty = convert_to_customization_info("<script/>").unwrap();
        assert!(empty.values.is_empty());
    }

    #[test]
    fn test_invalid_documents() {
        for xml in ["", "<a><b></a>", "<a/><b/>", "<a>"] {
            let err = convert_to_customization_info(xml).unwrap_err();
            assert!(
                matches!(err.downcast_ref::<EngineError>(), Some(EngineError::Xml(_))),
                "{:?} should fail with an XML error",
                xml
            );
        }
    }

    #[test]
    fn test_unwritable_values() {
        let info = CustomizationInfo {
            type_name: "savedSearch".to_string(),
            values: values_from_json(json!({"dependencies": [[1, 2]]})),
        };
        assert!(convert_to_xml_content(&info).is_err());
    }
}
