use std::fmt::Write as _;
use std::str;

use anyhow::anyhow;
use quick_xml::Reader;
use quick_xml::escape::{escape, unescape};
use quick_xml::events::Event;

use crate::error::{Error, Result};

/// A SOAP 1.1 action request or response: the action element lives in the
/// service-type namespace and carries one child element per argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapMessage {
    service_type: String,
    name: String,
    args: Vec<(String, String)>,
}

impl SoapMessage {
    pub fn new(service_type: &str, name: &str) -> Self {
        Self {
            service_type: service_type.to_owned(),
            name: name.to_owned(),
            args: Vec::new(),
        }
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> impl Iterator<Item = (&str, &str)> {
        self.args.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn get_arg(&self, name: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_arg(&mut self, name: &str, value: &str) {
        match self.args.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => value.clone_into(v),
            None => self.args.push((name.to_owned(), value.to_owned())),
        }
    }

    /// The quoted `serviceType#Action` value of the `SOAPAction` header.
    pub fn soap_action_header(&self) -> String {
        format!("\"{}#{}\"", self.service_type, self.name)
    }

    pub fn to_xml(&self) -> String {
        let mut args = String::new();
        for (name, value) in &self.args {
            let _ = write!(args, "<{name}>{value}</{name}>", value = escape(value.as_str()));
        }
        format!(
            include_str!("resources/templates/soap_envelope.tmpl.xml"),
            action = self.name,
            service_type = self.service_type,
            args = args
        )
    }
}

/// A UPnP error reported inside a `<s:Fault>` envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapFault {
    pub code: u32,
    pub description: String,
}

impl SoapFault {
    pub fn new(code: u32, description: &str) -> Self {
        Self {
            code,
            description: description.to_owned(),
        }
    }

    pub fn to_xml(&self) -> String {
        format!(
            include_str!("resources/templates/soap_fault.tmpl.xml"),
            code = self.code,
            description = escape(self.description.as_str())
        )
    }
}

/// Either of the two things a renderer legally answers a SOAP request with.
/// The discriminator is the first child of `<s:Body>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoapResponse {
    Message(SoapMessage),
    Fault(SoapFault),
}

impl SoapResponse {
    pub fn parse(xml: &str) -> Result<SoapResponse> {
        let mut reader = Reader::from_str(xml);

        loop {
            match reader.read_event().map_err(Error::protocol)? {
                Event::Start(e) if e.local_name().as_ref() == b"Body" => break,
                Event::Eof => return Err(Error::protocol(anyhow!("missing SOAP Body"))),
                _ => {}
            }
        }

        let start = loop {
            match reader.read_event().map_err(Error::protocol)? {
                Event::Start(e) => break e.into_owned(),
                // An action response with no out-args can be self-closing.
                Event::Empty(e) => {
                    let name = str::from_utf8(e.local_name().as_ref())
                        .map_err(Error::protocol)?
                        .to_owned();
                    let mut service_type = String::new();
                    for attr in e.attributes() {
                        let attr = attr.map_err(Error::protocol)?;
                        if attr.key.as_ref().starts_with(b"xmlns") {
                            service_type =
                                attr.unescape_value().map_err(Error::protocol)?.into_owned();
                        }
                    }
                    return Ok(SoapResponse::Message(SoapMessage::new(&service_type, &name)));
                }
                Event::Eof => return Err(Error::protocol(anyhow!("empty SOAP Body"))),
                _ => {}
            }
        };

        if start.local_name().as_ref() == b"Fault" {
            let mut code = None;
            let mut description = String::new();
            loop {
                match reader.read_event().map_err(Error::protocol)? {
                    Event::Start(e) => {
                        if e.local_name().as_ref() == b"errorCode" {
                            let text =
                                reader.read_text(e.to_end().name()).map_err(Error::protocol)?;
                            code = Some(text.trim().parse::<u32>().map_err(Error::protocol)?);
                        } else if e.local_name().as_ref() == b"errorDescription" {
                            let text =
                                reader.read_text(e.to_end().name()).map_err(Error::protocol)?;
                            description = text.trim().to_owned();
                        }
                    }
                    Event::End(e) if e.local_name().as_ref() == b"Fault" => break,
                    Event::Eof => return Err(Error::protocol(anyhow!("truncated SOAP fault"))),
                    _ => {}
                }
            }
            let code = code.ok_or_else(|| Error::protocol(anyhow!("fault without errorCode")))?;
            return Ok(SoapResponse::Fault(SoapFault { code, description }));
        }

        let name = str::from_utf8(start.local_name().as_ref())
            .map_err(Error::protocol)?
            .to_owned();
        let mut service_type = String::new();
        for attr in start.attributes() {
            let attr = attr.map_err(Error::protocol)?;
            if attr.key.as_ref().starts_with(b"xmlns") {
                service_type = attr.unescape_value().map_err(Error::protocol)?.into_owned();
            }
        }
        let mut msg = SoapMessage::new(&service_type, &name);
        loop {
            match reader.read_event().map_err(Error::protocol)? {
                Event::Start(e) => {
                    let arg = str::from_utf8(e.local_name().as_ref())
                        .map_err(Error::protocol)?
                        .to_owned();
                    let text = reader.read_text(e.to_end().name()).map_err(Error::protocol)?;
                    // Values may or may not still carry entities depending on
                    // how they were read; a failed unescape means the text was
                    // already plain.
                    let value = match unescape(&text) {
                        Ok(v) => v.into_owned(),
                        Err(_) => text.into_owned(),
                    };
                    msg.set_arg(&arg, &value);
                }
                Event::Empty(e) => {
                    let arg = str::from_utf8(e.local_name().as_ref())
                        .map_err(Error::protocol)?
                        .to_owned();
                    msg.set_arg(&arg, "");
                }
                Event::End(e) if e.local_name().as_ref() == start.local_name().as_ref() => break,
                Event::Eof => return Err(Error::protocol(anyhow!("truncated SOAP response"))),
                _ => {}
            }
        }
        Ok(SoapResponse::Message(msg))
    }
}

/// Log rendering of a message as `Action(Arg1=a, Arg2=b)`.
pub fn format_soap_message(msg: &SoapMessage) -> String {
    let mut out = format!("{}(", msg.name());
    for (i, (name, value)) in msg.args().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{name}={value}");
    }
    out.push(')');
    out
}

#[cfg(test)]
mod tests {
    use super::{SoapFault, SoapMessage, SoapResponse, format_soap_message};

    const CM_TYPE: &str = "urn:schemas-upnp-org:service:ConnectionManager:1";

    #[test]
    fn test_soap_action_header() {
        let msg = SoapMessage::new(CM_TYPE, "GetCurrentConnectionIDs");
        assert_eq!(
            msg.soap_action_header(),
            "\"urn:schemas-upnp-org:service:ConnectionManager:1#GetCurrentConnectionIDs\""
        );
    }

    #[test]
    fn test_encode_envelope() {
        let mut msg = SoapMessage::new(CM_TYPE, "GetCurrentConnectionInfo");
        msg.set_arg("ConnectionID", "0");
        let xml = msg.to_xml();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>"));
        assert!(xml.contains(&format!("<u:GetCurrentConnectionInfo xmlns:u=\"{CM_TYPE}\">")));
        assert!(xml.contains("<ConnectionID>0</ConnectionID>"));
    }

    #[test]
    fn test_set_arg_replaces() {
        let mut msg = SoapMessage::new(CM_TYPE, "AnOperation");
        msg.set_arg("Arg", "1");
        msg.set_arg("Arg", "2");
        assert_eq!(msg.get_arg("Arg"), Some("2"));
        assert_eq!(msg.args().count(), 1);
    }

    #[test]
    fn test_parse_message_round_trip() {
        let mut msg = SoapMessage::new(CM_TYPE, "GetCurrentConnectionIDsResponse");
        msg.set_arg("ConnectionIDs", "0,1");
        msg.set_arg("Empty", "");
        match SoapResponse::parse(&msg.to_xml()).unwrap() {
            SoapResponse::Message(parsed) => assert_eq!(parsed, msg),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_escaped_value() {
        let mut msg = SoapMessage::new(CM_TYPE, "AnOperationResponse");
        msg.set_arg("Value", "a & b <c>");
        match SoapResponse::parse(&msg.to_xml()).unwrap() {
            SoapResponse::Message(parsed) => {
                assert_eq!(parsed.get_arg("Value"), Some("a & b <c>"))
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_fault() {
        let fault = SoapFault::new(501, "Action Failed");
        match SoapResponse::parse(&fault.to_xml()).unwrap() {
            SoapResponse::Fault(parsed) => {
                assert_eq!(parsed.code, 501);
                assert_eq!(parsed.description, "Action Failed");
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_bodyless_document() {
        assert!(SoapResponse::parse("<root><child/></root>").is_err());
    }

    #[test]
    fn test_format_soap_message() {
        let mut msg = SoapMessage::new(CM_TYPE, "AnOperation");
        assert_eq!(format_soap_message(&msg), "AnOperation()");
        msg.set_arg("Arg1", "0");
        assert_eq!(format_soap_message(&msg), "AnOperation(Arg1=0)");
        msg.set_arg("Arg2", "0");
        assert_eq!(format_soap_message(&msg), "AnOperation(Arg1=0, Arg2=0)");
    }
}
