//! ESB wire envelope: `<MSG><META>...</META><body>...</body></MSG>`.
//!
//! The bus speaks XML with a fixed META block whose field order is part of
//! the wire contract. META is a struct so serialization order never depends
//! on map iteration; bodies are free-form JSON trees written recursively.

use std::io::Cursor;

use chrono::Local;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use sw_common::{nested_value, DispatchError, EsbConfig, ParsedMessage, Result};

/// Timestamp format in META.DDTM.
const DDTM_FORMAT: &str = "%Y%m%d%H%M%S";

/// The META block, in wire order.
#[derive(Debug, Clone)]
pub struct EsbMeta {
    pub sndr: String,
    pub rcvr: Option<String>,
    pub seqn: Option<u64>,
    pub ddtm: String,
    pub msg_type: String,
    pub styp: String,
    pub mgid: String,
    pub rmid: Option<String>,
    pub apot: String,
}

impl EsbMeta {
    /// Fresh META for an outbound message: now-timestamp, dashless uuid
    /// message id, no sequence yet (the publisher stamps it on send).
    pub fn new(sender: &str, airport: &str, msg_type: &str, subtype: &str) -> Self {
        Self {
            sndr: sender.to_string(),
            rcvr: None,
            seqn: None,
            ddtm: Local::now().format(DDTM_FORMAT).to_string(),
            msg_type: msg_type.to_string(),
            styp: subtype.to_string(),
            mgid: Uuid::new_v4().simple().to_string(),
            rmid: None,
            apot: airport.to_string(),
        }
    }
}

/// A complete outbound envelope, ready to serialize.
#[derive(Debug, Clone)]
pub struct OutboundEnvelope {
    pub meta: EsbMeta,
    /// Body object: one element per key (`RQST`, `RQDF`, `INFO`, ...).
    pub body: Value,
}

impl OutboundEnvelope {
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));

        write_start(&mut writer, "MSG")?;
        write_start(&mut writer, "META")?;
        write_text_field(&mut writer, "SNDR", Some(&self.meta.sndr))?;
        write_text_field(&mut writer, "RCVR", self.meta.rcvr.as_deref())?;
        write_text_field(
            &mut writer,
            "SEQN",
            self.meta.seqn.map(|s| s.to_string()).as_deref(),
        )?;
        write_text_field(&mut writer, "DDTM", Some(&self.meta.ddtm))?;
        write_text_field(&mut writer, "TYPE", Some(&self.meta.msg_type))?;
        write_text_field(&mut writer, "STYP", Some(&self.meta.styp))?;
        write_text_field(&mut writer, "MGID", Some(&self.meta.mgid))?;
        write_text_field(&mut writer, "RMID", self.meta.rmid.as_deref())?;
        write_text_field(&mut writer, "APOT", Some(&self.meta.apot))?;
        write_end(&mut writer, "META")?;

        if let Value::Object(fields) = &self.body {
            for (name, value) in fields {
                write_value(&mut writer, name, value)?;
            }
        }
        write_end(&mut writer, "MSG")?;

        String::from_utf8(writer.into_inner().into_inner())
            .map_err(|e| DispatchError::Handler(format!("xml encode: {e}")))
    }
}

fn write_start<W: std::io::Write>(writer: &mut Writer<W>, name: &str) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(|e| DispatchError::Handler(format!("xml write: {e}")))
}

fn write_end<W: std::io::Write>(writer: &mut Writer<W>, name: &str) -> Result<()> {
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(|e| DispatchError::Handler(format!("xml write: {e}")))
}

fn write_text<W: std::io::Write>(writer: &mut Writer<W>, text: &str) -> Result<()> {
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(|e| DispatchError::Handler(format!("xml write: {e}")))
}

/// An element with optional text content. `None` serializes as an empty
/// element, matching the peer's treatment of null fields.
fn write_text_field<W: std::io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    text: Option<&str>,
) -> Result<()> {
    write_start(writer, name)?;
    if let Some(text) = text {
        write_text(writer, text)?;
    }
    write_end(writer, name)
}

/// Recursively write a JSON value as XML. Arrays repeat the element name
/// once per item.
fn write_value<W: std::io::Write>(writer: &mut Writer<W>, name: &str, value: &Value) -> Result<()> {
    match value {
        Value::Null => write_text_field(writer, name, None),
        Value::String(s) => write_text_field(writer, name, Some(s)),
        Value::Bool(b) => write_text_field(writer, name, Some(if *b { "true" } else { "false" })),
        Value::Number(n) => write_text_field(writer, name, Some(&n.to_string())),
        Value::Array(items) => {
            for item in items {
                write_value(writer, name, item)?;
            }
            Ok(())
        }
        Value::Object(fields) => {
            write_start(writer, name)?;
            for (child_name, child) in fields {
                write_value(writer, child_name, child)?;
            }
            write_end(writer, name)
        }
    }
}

/// Parse an inbound XML document into the same tree shape handlers see for
/// JSON subsystems. Repeated sibling elements fold into an array.
pub fn parse_xml(input: &[u8]) -> Result<ParsedMessage> {
    let text = std::str::from_utf8(input)
        .map_err(|e| DispatchError::Parse(format!("xml not utf-8: {e}")))?;

    let mut reader = Reader::from_str(text);
    reader.trim_text(true);

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = element_name(&start);
                let value = parse_element(&mut reader)?;
                return Ok(json!({ name: value }));
            }
            Ok(Event::Empty(start)) => {
                let name = element_name(&start);
                return Ok(json!({ name: Value::Null }));
            }
            Ok(Event::Eof) => {
                return Err(DispatchError::Parse("empty xml document".to_string()))
            }
            Ok(_) => continue,
            Err(e) => return Err(DispatchError::Parse(format!("xml decode: {e}"))),
        }
    }
}

fn element_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.name().as_ref()).to_string()
}

fn parse_element(reader: &mut Reader<&[u8]>) -> Result<Value> {
    let mut children: Vec<(String, Value)> = Vec::new();
    let mut text: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = element_name(&start);
                let child = parse_element(reader)?;
                children.push((name, child));
            }
            Ok(Event::Empty(start)) => {
                children.push((element_name(&start), Value::Null));
            }
            Ok(Event::Text(t)) => {
                let unescaped = t
                    .unescape()
                    .map_err(|e| DispatchError::Parse(format!("xml decode: {e}")))?;
                text = Some(unescaped.into_owned());
            }
            Ok(Event::End(_)) => break,
            Ok(Event::Eof) => {
                return Err(DispatchError::Parse("truncated xml document".to_string()))
            }
            Ok(_) => continue,
            Err(e) => return Err(DispatchError::Parse(format!("xml decode: {e}"))),
        }
    }

    if children.is_empty() {
        return Ok(text.map(Value::String).unwrap_or(Value::Null));
    }

    let mut object = Map::new();
    for (name, value) in children {
        match object.get_mut(&name) {
            None => {
                object.insert(name, value);
            }
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
        }
    }
    Ok(Value::Object(object))
}

/// Extract the subtype from a parsed inbound envelope.
pub fn subtype(message: &ParsedMessage) -> Result<String> {
    nested_value(message, &["MSG", "META", "STYP"])
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DispatchError::InvalidField("MSG.META.STYP".to_string()))
}

/// Body of a basic REQE request. Airport/resource requests carry the origin
/// airport; anything else is a flight-data request.
pub fn basic_request_body(code: &str, airport: &str) -> Value {
    match code {
        "RQAP" | "RQAR" | "RQAW" => json!({ "RQST": null }),
        "RQGT" | "RQST" | "RQBL" | "RQCC" => json!({ "RQST": { "BAPT": airport } }),
        _ => json!({ "RQDF": { "RQTP": null, "BAPT": airport } }),
    }
}

/// A message on the outbound queue, before META stamping.
#[derive(Debug, Clone)]
pub struct EsbOutboundMessage {
    pub msg_type: String,
    pub subtype: String,
    pub body: Value,
}

/// The startup data-load requests configured for this deployment.
pub fn initial_requests(config: &EsbConfig) -> Vec<EsbOutboundMessage> {
    config
        .initial_request_codes
        .iter()
        .map(|code| EsbOutboundMessage {
            msg_type: "REQE".to_string(),
            subtype: code.clone(),
            body: basic_request_body(code, &config.origin_airport),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> EsbMeta {
        let mut meta = EsbMeta::new("T3SIP", "ZUGY", "REQE", "RQAP");
        meta.seqn = Some(7);
        meta
    }

    #[test]
    fn meta_fields_serialize_in_wire_order() {
        let envelope = OutboundEnvelope {
            meta: sample_meta(),
            body: json!({}),
        };
        let xml = envelope.to_xml().unwrap();

        let order = ["SNDR", "RCVR", "SEQN", "DDTM", "TYPE", "STYP", "MGID", "RMID", "APOT"];
        let positions: Vec<usize> = order
            .iter()
            .map(|f| xml.find(&format!("<{f}>")).expect(f))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{xml}");
    }

    #[test]
    fn null_meta_fields_are_empty_elements() {
        let envelope = OutboundEnvelope {
            meta: sample_meta(),
            body: json!({}),
        };
        let xml = envelope.to_xml().unwrap();

        assert!(xml.contains("<RCVR></RCVR>"));
        assert!(xml.contains("<SEQN>7</SEQN>"));
        assert!(xml.contains("<SNDR>T3SIP</SNDR>"));
    }

    #[test]
    fn message_id_is_dashless_uuid() {
        let meta = EsbMeta::new("T3SIP", "ZUGY", "REQE", "RQAP");
        assert_eq!(meta.mgid.len(), 32);
        assert!(!meta.mgid.contains('-'));
    }

    #[test]
    fn serialized_envelope_parses_back() {
        let envelope = OutboundEnvelope {
            meta: sample_meta(),
            body: json!({ "RQST": { "BAPT": "ZUGY" } }),
        };
        let xml = envelope.to_xml().unwrap();
        let parsed = parse_xml(xml.as_bytes()).unwrap();

        assert_eq!(subtype(&parsed).unwrap(), "RQAP");
        assert_eq!(parsed["MSG"]["META"]["SEQN"], "7");
        assert_eq!(parsed["MSG"]["RQST"]["BAPT"], "ZUGY");
    }

    #[test]
    fn repeated_siblings_fold_into_array() {
        let xml = "<MSG><DFLT><FLNO>CA1001</FLNO></DFLT><DFLT><FLNO>CA1002</FLNO></DFLT></MSG>";
        let parsed = parse_xml(xml.as_bytes()).unwrap();

        let flights = parsed["MSG"]["DFLT"].as_array().unwrap();
        assert_eq!(flights.len(), 2);
        assert_eq!(flights[1]["FLNO"], "CA1002");
    }

    #[test]
    fn malformed_xml_is_a_parse_error() {
        let err = parse_xml(b"<MSG><META>").unwrap_err();
        assert!(err.is_business());
    }

    #[test]
    fn basic_request_bodies_split_by_code() {
        assert_eq!(basic_request_body("RQAP", "ZUGY"), json!({ "RQST": null }));
        assert_eq!(
            basic_request_body("RQGT", "ZUGY"),
            json!({ "RQST": { "BAPT": "ZUGY" } })
        );
        assert_eq!(
            basic_request_body("RQDF", "ZUGY"),
            json!({ "RQDF": { "RQTP": null, "BAPT": "ZUGY" } })
        );
    }

    #[test]
    fn initial_requests_follow_configured_codes() {
        let config = EsbConfig {
            initial_request_codes: vec!["RQAP".to_string(), "RQDF".to_string()],
            ..EsbConfig::default()
        };

        let requests = initial_requests(&config);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].msg_type, "REQE");
        assert_eq!(requests[0].subtype, "RQAP");
        assert_eq!(requests[1].body["RQDF"]["BAPT"], "ZUGY");
    }
}
