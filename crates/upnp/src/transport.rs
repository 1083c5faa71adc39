use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, header};
use tokio::sync::oneshot;
use tracing::{debug, trace};
use url::Url;

use crate::error::{Error, Result};
use crate::soap::{SoapMessage, SoapResponse};
use crate::{CONTENT_TYPE_XML_UTF8, UPNP_USER_AGENT};

const SOAP_ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const SOAP_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_IDLE_CONNS_PER_RENDERER: usize = 2;

/// The seam between the device/action layer and the wire. Production code
/// uses [`SoapClient`]; tests substitute recording fakes.
#[async_trait]
pub trait SoapSender: Send + Sync {
    async fn send(&self, control_url: &Url, msg: &SoapMessage) -> Result<SoapResponse>;
}

/// HTTP transport for UPnP control requests.
///
/// Sends `POST`, falls back to `M-POST` exactly once on 405, and decodes an
/// HTTP 500 body as a SOAP fault value rather than an error. Renderers are
/// slow, embedded and sometimes ancient; the M-POST dance is required by some
/// of them.
pub struct SoapClient {
    client: reqwest::Client,
}

impl SoapClient {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(SOAP_TIMEOUT)
            .pool_max_idle_per_host(MAX_IDLE_CONNS_PER_RENDERER)
            .build()?;
        Ok(Self { client })
    }

    async fn request(
        &self,
        control_url: &Url,
        msg: &SoapMessage,
        mpost: bool,
    ) -> Result<reqwest::Response> {
        let builder = if mpost {
            self.client
                .request(
                    Method::from_bytes(b"M-POST").expect("M-POST is a valid method"),
                    control_url.clone(),
                )
                .header("MAN", format!("\"{SOAP_ENVELOPE_NS}\"; ns=01"))
                .header("01-SOAPACTION", msg.soap_action_header())
        } else {
            self.client
                .post(control_url.clone())
                .header("SOAPAction", msg.soap_action_header())
        };
        builder
            .header(header::CONTENT_TYPE, CONTENT_TYPE_XML_UTF8)
            .header(header::USER_AGENT, UPNP_USER_AGENT)
            .body(msg.to_xml())
            .send()
            .await
            .map_err(Error::transport)
    }

    /// Spawned variant of [`SoapSender::send`]. The result is delivered into
    /// `deferred` when one is supplied, otherwise into a freshly created
    /// channel whose receiving half is returned.
    pub fn send_deferred(
        self: &std::sync::Arc<Self>,
        control_url: Url,
        msg: SoapMessage,
        deferred: Option<oneshot::Sender<Result<SoapResponse>>>,
    ) -> Option<oneshot::Receiver<Result<SoapResponse>>> {
        let (tx, rx) = match deferred {
            Some(tx) => (tx, None),
            None => {
                let (tx, rx) = oneshot::channel();
                (tx, Some(rx))
            }
        };
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.send(&control_url, &msg).await;
            // The caller may have lost interest; that's fine.
            let _ = tx.send(result);
        });
        rx
    }
}

#[async_trait]
impl SoapSender for SoapClient {
    async fn send(&self, control_url: &Url, msg: &SoapMessage) -> Result<SoapResponse> {
        let mut response = self.request(control_url, msg, false).await?;
        if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            debug!(url = %control_url, "POST not allowed, retrying as M-POST");
            response = self.request(control_url, msg, true).await?;
        }

        let status = response.status();
        let body = response.text().await.map_err(Error::transport)?;
        trace!(%status, body, "SOAP response");

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            return match SoapResponse::parse(&body)? {
                fault @ SoapResponse::Fault(_) => Ok(fault),
                SoapResponse::Message(_) => Err(Error::Http(status.as_u16())),
            };
        }
        if !status.is_success() {
            return Err(Error::Http(status.as_u16()));
        }
        SoapResponse::parse(&body)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, Method as AxumMethod, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::any;
    use parking_lot::Mutex;
    use url::Url;

    use super::{SoapClient, SoapSender};
    use crate::soap::{SoapFault, SoapMessage, SoapResponse};

    const CM_TYPE: &str = "urn:schemas-upnp-org:service:ConnectionManager:1";

    #[derive(Debug, Clone)]
    struct Captured {
        method: String,
        headers: HashMap<String, String>,
    }

    #[derive(Clone)]
    struct ServerState {
        captured: Arc<Mutex<Vec<Captured>>>,
        // One (status, body) per expected request, in order.
        replies: Arc<Mutex<Vec<(StatusCode, String)>>>,
    }

    async fn control_handler(
        State(state): State<ServerState>,
        method: AxumMethod,
        headers: HeaderMap,
        _body: Bytes,
    ) -> impl IntoResponse {
        state.captured.lock().push(Captured {
            method: method.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| {
                    (
                        k.as_str().to_ascii_lowercase(),
                        String::from_utf8_lossy(v.as_bytes()).into_owned(),
                    )
                })
                .collect(),
        });
        let (status, body) = state.replies.lock().remove(0);
        (status, body)
    }

    async fn spawn_server(replies: Vec<(StatusCode, String)>) -> (Url, ServerState) {
        let state = ServerState {
            captured: Arc::new(Mutex::new(Vec::new())),
            replies: Arc::new(Mutex::new(replies)),
        };
        let app = axum::Router::new()
            .route("/control", any(control_handler))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let url = Url::parse(&format!("http://{addr}/control")).unwrap();
        (url, state)
    }

    fn response_xml() -> String {
        SoapMessage::new(CM_TYPE, "GetCurrentConnectionIDsResponse").to_xml()
    }

    fn request_msg() -> SoapMessage {
        SoapMessage::new(CM_TYPE, "GetCurrentConnectionIDs")
    }

    #[tokio::test]
    async fn test_request_headers() {
        let (url, state) = spawn_server(vec![(StatusCode::OK, response_xml())]).await;
        let client = SoapClient::new().unwrap();
        client.send(&url, &request_msg()).await.unwrap();

        let captured = state.captured.lock();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].method, "POST");
        assert_eq!(
            captured[0].headers.get("content-type").unwrap(),
            "text/xml; charset=\"utf-8\""
        );
        assert_eq!(
            captured[0].headers.get("user-agent").unwrap(),
            "OS/1.0 UPnP/1.0 airpnp/1.0"
        );
        assert_eq!(
            captured[0].headers.get("soapaction").unwrap(),
            "\"urn:schemas-upnp-org:service:ConnectionManager:1#GetCurrentConnectionIDs\""
        );
    }

    #[tokio::test]
    async fn test_soap_response_is_parsed() {
        let (url, _state) = spawn_server(vec![(StatusCode::OK, response_xml())]).await;
        let client = SoapClient::new().unwrap();
        match client.send(&url, &request_msg()).await.unwrap() {
            SoapResponse::Message(msg) => {
                assert_eq!(msg.name(), "GetCurrentConnectionIDsResponse")
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_soap_error_on_500_response() {
        let (url, _state) = spawn_server(vec![(
            StatusCode::INTERNAL_SERVER_ERROR,
            SoapFault::new(501, "Action Failed").to_xml(),
        )])
        .await;
        let client = SoapClient::new().unwrap();
        match client.send(&url, &request_msg()).await.unwrap() {
            SoapResponse::Fault(fault) => {
                assert_eq!(fault.code, 501);
                assert_eq!(fault.description, "Action Failed");
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_other_http_errors_propagate() {
        let (url, _state) =
            spawn_server(vec![(StatusCode::NOT_FOUND, "Not Found".to_owned())]).await;
        let client = SoapClient::new().unwrap();
        match client.send(&url, &request_msg()).await {
            Err(crate::Error::Http(404)) => {}
            other => panic!("expected HTTP 404 error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fallback_to_mpost() {
        let (url, state) = spawn_server(vec![
            (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed".into()),
            (StatusCode::OK, response_xml()),
        ])
        .await;
        let client = SoapClient::new().unwrap();
        client.send(&url, &request_msg()).await.unwrap();

        let captured = state.captured.lock();
        assert_eq!(captured.len(), 2);
        assert_eq!(captured[0].method, "POST");
        assert_eq!(captured[1].method, "M-POST");
        assert_eq!(
            captured[1].headers.get("man").unwrap(),
            "\"http://schemas.xmlsoap.org/soap/envelope/\"; ns=01"
        );
        assert_eq!(
            captured[1].headers.get("01-soapaction").unwrap(),
            "\"urn:schemas-upnp-org:service:ConnectionManager:1#GetCurrentConnectionIDs\""
        );
        assert!(!captured[1].headers.contains_key("soapaction"));
    }

    #[tokio::test]
    async fn test_send_deferred_creates_channel() {
        let (url, _state) = spawn_server(vec![(StatusCode::OK, response_xml())]).await;
        let client = Arc::new(SoapClient::new().unwrap());
        let rx = client.send_deferred(url, request_msg(), None).unwrap();
        match rx.await.unwrap().unwrap() {
            SoapResponse::Message(msg) => {
                assert_eq!(msg.name(), "GetCurrentConnectionIDsResponse")
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_deferred_uses_supplied_channel() {
        let (url, _state) = spawn_server(vec![(StatusCode::OK, response_xml())]).await;
        let client = Arc::new(SoapClient::new().unwrap());
        let (tx, rx) = tokio::sync::oneshot::channel();
        assert!(client.send_deferred(url, request_msg(), Some(tx)).is_none());
        assert!(rx.await.unwrap().is_ok());
    }
}
