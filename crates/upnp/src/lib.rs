mod compat;
mod device;
mod duration;
mod error;
mod scpd;
mod soap;

pub mod discovery;
pub mod transport;

pub use compat::{are_service_types_compatible, split_usn};
pub use device::{Device, Service};
pub use duration::{parse_duration, to_duration};
pub use error::{Error, Result};
pub use scpd::{ActionArgument, ActionDescriptor};
pub use soap::{SoapFault, SoapMessage, SoapResponse, format_soap_message};
pub use transport::{SoapClient, SoapSender};

pub const SERVICE_TYPE_AVTRANSPORT: &str = "urn:schemas-upnp-org:service:AVTransport:1";
pub const SERVICE_TYPE_CONNECTION_MANAGER: &str =
    "urn:schemas-upnp-org:service:ConnectionManager:1";
pub const SERVICE_ID_AVTRANSPORT: &str = "urn:upnp-org:serviceId:AVTransport";
pub const SERVICE_ID_CONNECTION_MANAGER: &str = "urn:upnp-org:serviceId:ConnectionManager";

pub const SSDP_SEARCH_ROOT_ST: &str = "upnp:rootdevice";
pub const SSDP_SEARCH_MEDIARENDERER_ST: &str = "urn:schemas-upnp-org:device:MediaRenderer:1";

pub const UPNP_USER_AGENT: &str = "OS/1.0 UPnP/1.0 airpnp/1.0";
pub const CONTENT_TYPE_XML_UTF8: &str = "text/xml; charset=\"utf-8\"";
