use std::collections::HashMap;
use std::fmt;
use std::str;
use std::sync::Arc;

use anyhow::anyhow;
use quick_xml::Reader;
use quick_xml::events::Event;
use tokio::sync::oneshot;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::scpd::{ActionDescriptor, parse_scpd};
use crate::soap::{SoapMessage, SoapResponse, format_soap_message};
use crate::transport::SoapSender;

/// A UPnP device built from its description document. Immutable after
/// construction apart from service initialization.
///
/// Every direct child element of `<device>` lands in an attribute bag keyed
/// by local name, so vendor extensions stay reachable without a schema.
pub struct Device {
    base_url: Url,
    attributes: HashMap<String, String>,
    services: Vec<Service>,
}

impl Device {
    /// Parses a device description. Relative service URLs resolve against
    /// `<URLBase>` when the description carries one, else against `location`
    /// (the URL the description was fetched from).
    pub fn from_description_xml(xml: &str, location: &Url) -> Result<Device> {
        let base_url = find_url_base(xml)?.unwrap_or_else(|| location.clone());

        let mut reader = Reader::from_str(xml);
        loop {
            match reader.read_event().map_err(Error::protocol)? {
                Event::Start(e) if e.local_name().as_ref() == b"device" => {
                    let device = parse_device(&mut reader, &base_url)?;
                    if device.attributes.get("UDN").is_none_or(|u| u.is_empty()) {
                        return Err(Error::protocol(anyhow!("device description without UDN")));
                    }
                    if !device.attributes.contains_key("deviceType") {
                        return Err(Error::protocol(anyhow!(
                            "device description without deviceType"
                        )));
                    }
                    return Ok(device);
                }
                Event::Eof => {
                    return Err(Error::protocol(anyhow!("no <device> element found")));
                }
                _ => {}
            }
        }
    }

    pub fn udn(&self) -> &str {
        self.attributes.get("UDN").map(String::as_str).unwrap_or("")
    }

    pub fn friendly_name(&self) -> &str {
        self.attributes
            .get("friendlyName")
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn device_type(&self) -> &str {
        self.attributes
            .get("deviceType")
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn manufacturer(&self) -> &str {
        self.attributes
            .get("manufacturer")
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn model_name(&self) -> &str {
        self.attributes
            .get("modelName")
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Looks up any child element of `<device>` by its local name.
    pub fn attribute(&self, name: &str) -> Result<&str> {
        self.attributes
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| Error::UnknownAttribute(name.to_owned()))
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.iter()
    }

    pub fn service_by_id(&self, service_id: &str) -> Result<&Service> {
        self.services
            .iter()
            .find(|s| s.service_id == service_id)
            .ok_or_else(|| Error::UnknownService(service_id.to_owned()))
    }

    pub fn service_by_id_mut(&mut self, service_id: &str) -> Result<&mut Service> {
        self.services
            .iter_mut()
            .find(|s| s.service_id == service_id)
            .ok_or_else(|| Error::UnknownService(service_id.to_owned()))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [UDN={}]", self.friendly_name(), self.udn())
    }
}

/// A service of a [`Device`]. URLs are absolute from construction; the action
/// set only exists after [`Service::initialize`] has seen the SCPD.
pub struct Service {
    service_type: String,
    service_id: String,
    scpd_url: Url,
    control_url: Url,
    event_sub_url: Option<Url>,
    actions: HashMap<String, ActionDescriptor>,
    sender: Option<Arc<dyn SoapSender>>,
}

impl Service {
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn scpd_url(&self) -> &Url {
        &self.scpd_url
    }

    pub fn control_url(&self) -> &Url {
        &self.control_url
    }

    pub fn event_sub_url(&self) -> Option<&Url> {
        self.event_sub_url.as_ref()
    }

    /// Parses the SCPD into callable actions and installs the transport the
    /// actions will go through.
    pub fn initialize(&mut self, scpd_xml: &str, sender: Arc<dyn SoapSender>) -> Result<()> {
        self.actions = parse_scpd(scpd_xml)?;
        self.sender = Some(sender);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.sender.is_some()
    }

    pub fn has_action(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn action(&self, name: &str) -> Option<&ActionDescriptor> {
        self.actions.get(name)
    }

    pub fn actions(&self) -> impl Iterator<Item = &ActionDescriptor> {
        self.actions.values()
    }

    /// Invokes an action and blocks until the renderer answered. The caller
    /// must supply exactly the in-args the SCPD declares. The result maps
    /// out-arg names to their string values; a SOAP fault comes back as
    /// [`Error::Command`].
    pub async fn call(
        &self,
        action: &str,
        args: &[(&str, &str)],
    ) -> Result<HashMap<String, String>> {
        let msg = self.build_message(action, args)?;
        let sender = self.sender()?;
        debug!(service = %self.service_id, request = %format_soap_message(&msg), "invoking action");
        into_out_args(sender.send(&self.control_url, &msg).await?)
    }

    /// Fire-and-collect variant of [`Service::call`]: argument validation
    /// happens synchronously, the exchange itself runs in a spawned task.
    /// With a caller-supplied `deferred` the result is delivered there and
    /// `None` is returned; otherwise the fresh receiving half is handed back.
    pub fn call_deferred(
        &self,
        action: &str,
        args: &[(&str, &str)],
        deferred: Option<oneshot::Sender<Result<HashMap<String, String>>>>,
    ) -> Result<Option<oneshot::Receiver<Result<HashMap<String, String>>>>> {
        let msg = self.build_message(action, args)?;
        let sender = self.sender()?.clone();
        let control_url = self.control_url.clone();
        let (tx, rx) = match deferred {
            Some(tx) => (tx, None),
            None => {
                let (tx, rx) = oneshot::channel();
                (tx, Some(rx))
            }
        };
        tokio::spawn(async move {
            let result = match sender.send(&control_url, &msg).await {
                Ok(response) => into_out_args(response),
                Err(e) => Err(e),
            };
            let _ = tx.send(result);
        });
        Ok(rx)
    }

    fn sender(&self) -> Result<&Arc<dyn SoapSender>> {
        self.sender
            .as_ref()
            .ok_or_else(|| Error::ServiceNotInitialized(self.service_id.clone()))
    }

    fn build_message(&self, action: &str, args: &[(&str, &str)]) -> Result<SoapMessage> {
        let desc = self
            .actions
            .get(action)
            .ok_or_else(|| Error::UnknownAction(action.to_owned()))?;
        for (name, _) in args {
            if !desc.in_args.iter().any(|a| a.name == *name) {
                return Err(Error::UnexpectedArgument((*name).to_owned()));
            }
        }
        let mut msg = SoapMessage::new(&self.service_type, action);
        for arg in &desc.in_args {
            let value = args
                .iter()
                .find(|(name, _)| *name == arg.name)
                .map(|(_, value)| *value)
                .ok_or_else(|| Error::MissingArgument(arg.name.clone()))?;
            msg.set_arg(&arg.name, value);
        }
        Ok(msg)
    }
}

fn into_out_args(response: SoapResponse) -> Result<HashMap<String, String>> {
    match response {
        SoapResponse::Message(msg) => Ok(msg
            .args()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect()),
        SoapResponse::Fault(fault) => Err(Error::Command {
            code: fault.code,
            description: fault.description,
        }),
    }
}

fn find_url_base(xml: &str) -> Result<Option<Url>> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event().map_err(Error::protocol)? {
            Event::Start(e) if e.local_name().as_ref() == b"URLBase" => {
                let text = reader.read_text(e.to_end().name()).map_err(Error::protocol)?;
                return Ok(Some(Url::parse(text.trim()).map_err(Error::protocol)?));
            }
            // URLBase precedes <device> per UPnP 1.0.
            Event::Start(e) if e.local_name().as_ref() == b"device" => return Ok(None),
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

fn parse_device(reader: &mut Reader<&[u8]>, base_url: &Url) -> Result<Device> {
    let mut attributes = HashMap::new();
    let mut services = Vec::new();
    loop {
        match reader.read_event().map_err(Error::protocol)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"serviceList" => services = parse_service_list(reader, base_url)?,
                // Embedded devices and icons are not interesting to the bridge.
                b"deviceList" | b"iconList" => {
                    reader
                        .read_to_end(e.to_end().name())
                        .map_err(Error::protocol)?;
                }
                name => {
                    let name = str::from_utf8(name).map_err(Error::protocol)?.to_owned();
                    let text = reader.read_text(e.to_end().name()).map_err(Error::protocol)?;
                    attributes.insert(name, text.trim().to_owned());
                }
            },
            Event::Empty(e) => {
                let name = str::from_utf8(e.local_name().as_ref())
                    .map_err(Error::protocol)?
                    .to_owned();
                attributes.insert(name, String::new());
            }
            Event::End(e) if e.local_name().as_ref() == b"device" => break,
            Event::Eof => return Err(Error::protocol(anyhow!("truncated <device> element"))),
            _ => {}
        }
    }
    Ok(Device {
        base_url: base_url.clone(),
        attributes,
        services,
    })
}

fn parse_service_list(reader: &mut Reader<&[u8]>, base_url: &Url) -> Result<Vec<Service>> {
    let mut services = Vec::new();
    loop {
        match reader.read_event().map_err(Error::protocol)? {
            Event::Start(e) if e.local_name().as_ref() == b"service" => {
                services.push(parse_service(reader, base_url)?);
            }
            Event::End(e) if e.local_name().as_ref() == b"serviceList" => break,
            Event::Eof => return Err(Error::protocol(anyhow!("truncated <serviceList>"))),
            _ => {}
        }
    }
    Ok(services)
}

fn parse_service(reader: &mut Reader<&[u8]>, base_url: &Url) -> Result<Service> {
    let mut fields: HashMap<String, String> = HashMap::new();
    loop {
        match reader.read_event().map_err(Error::protocol)? {
            Event::Start(e) => {
                let name = str::from_utf8(e.local_name().as_ref())
                    .map_err(Error::protocol)?
                    .to_owned();
                let text = reader.read_text(e.to_end().name()).map_err(Error::protocol)?;
                fields.insert(name, text.trim().to_owned());
            }
            Event::End(e) if e.local_name().as_ref() == b"service" => break,
            Event::Eof => return Err(Error::protocol(anyhow!("truncated <service>"))),
            _ => {}
        }
    }

    let required = |key: &str| -> Result<String> {
        fields
            .get(key)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| Error::protocol(anyhow!("service without {key}")))
    };
    let resolve = |path: &str| -> Result<Url> {
        base_url
            .join(path)
            .map_err(|e| Error::protocol(anyhow!("bad service URL {path:?}: {e}")))
    };

    Ok(Service {
        service_type: required("serviceType")?,
        service_id: required("serviceId")?,
        scpd_url: resolve(&required("SCPDURL")?)?,
        control_url: resolve(&required("controlURL")?)?,
        event_sub_url: match fields.get("eventSubURL").filter(|v| !v.is_empty()) {
            Some(path) => Some(resolve(path)?),
            None => None,
        },
        actions: HashMap::new(),
        sender: None,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use url::Url;

    use super::Device;
    use crate::error::{Error, Result};
    use crate::soap::{SoapFault, SoapMessage, SoapResponse};
    use crate::transport::SoapSender;

    const DEVICE_ROOT_XML: &str = include_str!("resources/test/device_root.xml");
    const SERVICE_SCPD_XML: &str = include_str!("resources/test/service_scpd.xml");
    const AVTRANSPORT_ID: &str = "urn:upnp-org:serviceId:AVTransport";

    struct FakeSender {
        requests: Mutex<Vec<(Url, SoapMessage)>>,
        response: Mutex<Option<SoapResponse>>,
    }

    impl FakeSender {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                response: Mutex::new(None),
            })
        }

        fn respond_with(&self, response: SoapResponse) {
            *self.response.lock() = Some(response);
        }
    }

    #[async_trait]
    impl SoapSender for FakeSender {
        async fn send(&self, control_url: &Url, msg: &SoapMessage) -> Result<SoapResponse> {
            self.requests.lock().push((control_url.clone(), msg.clone()));
            Ok(self.response.lock().clone().unwrap_or_else(|| {
                SoapResponse::Message(SoapMessage::new(
                    msg.service_type(),
                    &format!("{}Response", msg.name()),
                ))
            }))
        }
    }

    fn parse_device() -> Device {
        let base = Url::parse("http://www.base.com").unwrap();
        Device::from_description_xml(DEVICE_ROOT_XML, &base).unwrap()
    }

    fn initialized_device(sender: Arc<FakeSender>) -> Device {
        let mut device = parse_device();
        device
            .service_by_id_mut(AVTRANSPORT_ID)
            .unwrap()
            .initialize(SERVICE_SCPD_XML, sender)
            .unwrap();
        device
    }

    #[test]
    fn test_device_attributes() {
        let device = parse_device();
        assert_eq!(device.friendly_name(), "WDTVLIVE");
        assert_eq!(
            device.device_type(),
            "urn:schemas-upnp-org:device:MediaRenderer:1"
        );
        assert_eq!(device.manufacturer(), "Western Digital Corporation");
        assert_eq!(device.model_name(), "WD TV HD Live");
        assert_eq!(device.attribute("modelNumber").unwrap(), "1.0");
    }

    #[test]
    fn test_device_to_string() {
        assert_eq!(
            parse_device().to_string(),
            "WDTVLIVE [UDN=uuid:67ff722f-0090-a976-17db-e9396986c234]"
        );
    }

    #[test]
    fn test_error_on_unknown_attribute() {
        match parse_device().attribute("modelBlob") {
            Err(Error::UnknownAttribute(name)) => assert_eq!(name, "modelBlob"),
            other => panic!("expected unknown attribute error, got {other:?}"),
        }
    }

    #[test]
    fn test_service_count() {
        assert_eq!(parse_device().services().count(), 3);
    }

    #[test]
    fn test_getting_service_by_id() {
        let device = parse_device();
        let service = device.service_by_id(AVTRANSPORT_ID).unwrap();
        assert_eq!(
            service.service_type(),
            "urn:schemas-upnp-org:service:AVTransport:1"
        );
        assert!(matches!(
            device.service_by_id("urn:upnp-org:serviceId:Nonsense"),
            Err(Error::UnknownService(_))
        ));
    }

    #[test]
    fn test_resolution_of_urls() {
        let device = parse_device();
        let service = device.service_by_id(AVTRANSPORT_ID).unwrap();
        assert_eq!(
            service.scpd_url().as_str(),
            "http://www.base.com/MediaRenderer_AVTransport/scpd.xml"
        );
        assert_eq!(
            service.control_url().as_str(),
            "http://www.base.com/MediaRenderer_AVTransport/control"
        );
        assert_eq!(
            service.event_sub_url().unwrap().as_str(),
            "http://www.base.com/MediaRenderer_AVTransport/event"
        );
    }

    #[test]
    fn test_url_base_element_wins_over_location() {
        let xml = DEVICE_ROOT_XML.replace(
            "<device>",
            "<URLBase>http://10.0.0.9:5000/</URLBase><device>",
        );
        let location = Url::parse("http://www.base.com/desc.xml").unwrap();
        let device = Device::from_description_xml(&xml, &location).unwrap();
        let service = device.service_by_id(AVTRANSPORT_ID).unwrap();
        assert_eq!(
            service.control_url().as_str(),
            "http://10.0.0.9:5000/MediaRenderer_AVTransport/control"
        );
    }

    #[test]
    fn test_action_existence_after_initialize() {
        let device = initialized_device(FakeSender::new());
        let service = device.service_by_id(AVTRANSPORT_ID).unwrap();
        assert!(service.has_action("GetCurrentTransportActions"));
        assert!(!service.has_action("Levitate"));
    }

    #[tokio::test]
    async fn test_action_sends_message_to_control_url() {
        let sender = FakeSender::new();
        let device = initialized_device(sender.clone());
        let service = device.service_by_id(AVTRANSPORT_ID).unwrap();

        service
            .call("GetCurrentTransportActions", &[("InstanceID", "0")])
            .await
            .unwrap();

        let requests = sender.requests.lock();
        assert_eq!(requests.len(), 1);
        let (url, msg) = &requests[0];
        assert_eq!(url, service.control_url());
        assert_eq!(msg.name(), "GetCurrentTransportActions");
        assert_eq!(
            msg.service_type(),
            "urn:schemas-upnp-org:service:AVTransport:1"
        );
        assert_eq!(msg.get_arg("InstanceID"), Some("0"));
    }

    #[tokio::test]
    async fn test_action_rejects_missing_argument() {
        let device = initialized_device(FakeSender::new());
        let service = device.service_by_id(AVTRANSPORT_ID).unwrap();
        match service.call("GetCurrentTransportActions", &[]).await {
            Err(Error::MissingArgument(name)) => assert_eq!(name, "InstanceID"),
            other => panic!("expected missing argument error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_action_rejects_unexpected_argument() {
        let device = initialized_device(FakeSender::new());
        let service = device.service_by_id(AVTRANSPORT_ID).unwrap();
        let result = service
            .call(
                "GetCurrentTransportActions",
                &[("InstanceID", "0"), ("Color", "red")],
            )
            .await;
        assert!(matches!(result, Err(Error::UnexpectedArgument(_))));
    }

    #[tokio::test]
    async fn test_action_response_becomes_out_arg_map() {
        let sender = FakeSender::new();
        let mut response = SoapMessage::new(
            "urn:schemas-upnp-org:service:AVTransport:1",
            "GetCurrentTransportActionsResponse",
        );
        response.set_arg("Actions", "Play,Stop");
        sender.respond_with(SoapResponse::Message(response));

        let device = initialized_device(sender);
        let service = device.service_by_id(AVTRANSPORT_ID).unwrap();
        let out = service
            .call("GetCurrentTransportActions", &[("InstanceID", "0")])
            .await
            .unwrap();
        assert_eq!(out.get("Actions").unwrap(), "Play,Stop");
    }

    #[tokio::test]
    async fn test_action_fault_becomes_command_error() {
        let sender = FakeSender::new();
        sender.respond_with(SoapResponse::Fault(SoapFault::new(718, "Invalid InstanceID")));

        let device = initialized_device(sender);
        let service = device.service_by_id(AVTRANSPORT_ID).unwrap();
        match service
            .call("GetCurrentTransportActions", &[("InstanceID", "9")])
            .await
        {
            Err(Error::Command { code, description }) => {
                assert_eq!(code, 718);
                assert_eq!(description, "Invalid InstanceID");
            }
            other => panic!("expected command error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_on_uninitialized_service_fails() {
        let device = parse_device();
        let service = device.service_by_id(AVTRANSPORT_ID).unwrap();
        assert!(matches!(
            service.call("GetCurrentTransportActions", &[]).await,
            Err(Error::UnknownAction(_))
        ));
    }

    #[tokio::test]
    async fn test_call_deferred_resolves_to_out_args() {
        let sender = FakeSender::new();
        let device = initialized_device(sender);
        let service = device.service_by_id(AVTRANSPORT_ID).unwrap();

        let rx = service
            .call_deferred("GetCurrentTransportActions", &[("InstanceID", "0")], None)
            .unwrap()
            .unwrap();
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_call_deferred_validates_synchronously() {
        let device = initialized_device(FakeSender::new());
        let service = device.service_by_id(AVTRANSPORT_ID).unwrap();
        assert!(matches!(
            service.call_deferred("GetCurrentTransportActions", &[], None),
            Err(Error::MissingArgument(_))
        ));
    }
}
