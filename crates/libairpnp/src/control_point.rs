use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use airplay_serve::{AirPlayBackend, AirPlayError};
use upnp::{
    Device, SERVICE_ID_AVTRANSPORT, SERVICE_ID_CONNECTION_MANAGER, parse_duration, to_duration,
};

/// Everything tied to the current AirPlay client. Lives behind one async
/// mutex which is held across a whole operation including its SOAP
/// exchanges, so AVTransport calls for a session are totally ordered on the
/// wire.
#[derive(Default)]
struct SessionState {
    session_id: Option<String>,
    /// Renderer-side AVTransport instance; exists exactly while a session
    /// does.
    instance_id: Option<String>,
    /// ConnectionManager connection to complete on release, for renderers
    /// that do `PrepareForConnection`.
    connection_id: Option<String>,
    /// Set once playback of a URI has been started.
    uri: Option<String>,
    /// Scrub position received before `play`; replayed as a Seek right
    /// after playback starts.
    pre_scrub: Option<f64>,
}

/// The per-renderer brain: implements the AirPlay server's backend contract
/// by driving AVTransport/ConnectionManager on one UPnP MediaRenderer.
pub struct AVControlPoint {
    device: Arc<Device>,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
}

impl AVControlPoint {
    /// Fails unless the device exposes both AVTransport and
    /// ConnectionManager; the bridge never admits anything else.
    pub fn new(device: Arc<Device>, cancel: CancellationToken) -> upnp::Result<Self> {
        device.service_by_id(SERVICE_ID_AVTRANSPORT)?;
        device.service_by_id(SERVICE_ID_CONNECTION_MANAGER)?;
        Ok(Self {
            device,
            state: Mutex::new(SessionState::default()),
            cancel,
        })
    }

    /// All renderer traffic funnels through here so that device removal
    /// fails pending operations fast.
    async fn call(
        &self,
        service_id: &str,
        action: &str,
        args: &[(&str, &str)],
    ) -> upnp::Result<HashMap<String, String>> {
        let service = self.device.service_by_id(service_id)?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(upnp::Error::DeviceGone),
            result = service.call(action, args) => result,
        }
    }

    async fn allocate_instance_id(&self) -> upnp::Result<(String, Option<String>)> {
        let connmgr = self.device.service_by_id(SERVICE_ID_CONNECTION_MANAGER)?;
        if !connmgr.has_action("PrepareForConnection") {
            // The renderer does not multiplex; instance 0 is implicit.
            return Ok(("0".to_owned(), None));
        }
        let out = self
            .call(
                SERVICE_ID_CONNECTION_MANAGER,
                "PrepareForConnection",
                &[
                    ("RemoteProtocolInfo", ""),
                    ("PeerConnectionManager", ""),
                    ("PeerConnectionID", "-1"),
                    ("Direction", "Input"),
                ],
            )
            .await?;
        let instance_id = out
            .get("AVTransportID")
            .cloned()
            .unwrap_or_else(|| "0".to_owned());
        Ok((instance_id, out.get("ConnectionID").cloned()))
    }

    async fn release_instance_id(&self, connection_id: &str) {
        let supported = self
            .device
            .service_by_id(SERVICE_ID_CONNECTION_MANAGER)
            .is_ok_and(|s| s.has_action("ConnectionComplete"));
        if !supported {
            return;
        }
        if let Err(e) = self
            .call(
                SERVICE_ID_CONNECTION_MANAGER,
                "ConnectionComplete",
                &[("ConnectionID", connection_id)],
            )
            .await
        {
            warn!("error completing renderer connection: {e:#}");
        }
    }

    async fn query_playing(&self, instance_id: &str) -> upnp::Result<bool> {
        let out = self
            .call(
                SERVICE_ID_AVTRANSPORT,
                "GetTransportInfo",
                &[("InstanceID", instance_id)],
            )
            .await?;
        Ok(out
            .get("CurrentTransportState")
            .is_some_and(|s| s == "PLAYING"))
    }
}

fn upnp_error(e: upnp::Error) -> AirPlayError {
    match e {
        upnp::Error::DeviceGone => AirPlayError::NotFound,
        other => AirPlayError::Internal(other.into()),
    }
}

// Renderers report times like NOT_IMPLEMENTED; treat anything unparsable
// as zero rather than failing the whole status request.
fn parse_time(out: &HashMap<String, String>, key: &str) -> f64 {
    match out.get(key).map(|raw| (raw, parse_duration(raw))) {
        Some((_, Ok(seconds))) => seconds,
        Some((raw, Err(_))) => {
            debug!(key, value = %raw, "renderer reported unparsable time");
            0.0
        }
        None => 0.0,
    }
}

pub(crate) fn get_image_type(data: &[u8]) -> (&'static str, &'static str) {
    if data.starts_with(&[0xff, 0xd8]) {
        ("image/jpeg", ".jpg")
    } else {
        ("image/unknown", ".bin")
    }
}

#[async_trait]
impl AirPlayBackend for AVControlPoint {
    async fn set_session_id(&self, new: Option<String>) -> Result<(), AirPlayError> {
        let mut state = self.state.lock().await;
        match (state.session_id.clone(), new) {
            (None, Some(new)) => {
                let (instance_id, connection_id) =
                    self.allocate_instance_id().await.map_err(upnp_error)?;
                debug!(%instance_id, "session established");
                *state = SessionState {
                    session_id: Some(new),
                    instance_id: Some(instance_id),
                    connection_id,
                    uri: None,
                    pre_scrub: None,
                };
            }
            // The bridge is single-session: a different client is rejected
            // until the current one lets go.
            (Some(current), Some(new)) if current != new => {
                debug!(new, "rejecting session, another one is active");
                return Err(AirPlayError::SessionRejected);
            }
            (Some(_), None) => {
                if let Some(connection_id) = state.connection_id.take() {
                    self.release_instance_id(&connection_id).await;
                }
                *state = SessionState::default();
                debug!("session released");
            }
            _ => {}
        }
        Ok(())
    }

    async fn play(&self, location: String, start_position: f64) -> Result<(), AirPlayError> {
        let mut state = self.state.lock().await;
        let instance_id = state
            .instance_id
            .clone()
            .ok_or_else(|| AirPlayError::BadRequest(anyhow!("play without a session")))?;
        // start_position is a fraction of a duration the client has not told
        // us; actual positioning arrives through scrub.
        let _ = start_position;

        self.call(
            SERVICE_ID_AVTRANSPORT,
            "SetAVTransportURI",
            &[
                ("InstanceID", &instance_id),
                ("CurrentURI", &location),
                ("CurrentURIMetaData", ""),
            ],
        )
        .await
        .map_err(upnp_error)?;
        self.call(
            SERVICE_ID_AVTRANSPORT,
            "Play",
            &[("InstanceID", &instance_id), ("Speed", "1")],
        )
        .await
        .map_err(upnp_error)?;

        if let Some(pre_scrub) = state.pre_scrub.take() {
            self.call(
                SERVICE_ID_AVTRANSPORT,
                "Seek",
                &[
                    ("InstanceID", &instance_id),
                    ("Unit", "REL_TIME"),
                    ("Target", &to_duration(pre_scrub)),
                ],
            )
            .await
            .map_err(upnp_error)?;
        }

        info!(uri = %location, "playback started");
        state.uri = Some(location);
        Ok(())
    }

    async fn stop(&self) -> Result<(), AirPlayError> {
        let mut state = self.state.lock().await;
        if let Some(instance_id) = state.instance_id.clone() {
            self.call(
                SERVICE_ID_AVTRANSPORT,
                "Stop",
                &[("InstanceID", &instance_id)],
            )
            .await
            .map_err(upnp_error)?;
        }
        state.uri = None;
        Ok(())
    }

    async fn set_scrub(&self, position: f64) -> Result<(), AirPlayError> {
        let mut state = self.state.lock().await;
        if state.uri.is_some() {
            let instance_id = state
                .instance_id
                .clone()
                .ok_or_else(|| AirPlayError::Internal(anyhow!("uri set without instance id")))?;
            self.call(
                SERVICE_ID_AVTRANSPORT,
                "Seek",
                &[
                    ("InstanceID", &instance_id),
                    ("Unit", "REL_TIME"),
                    ("Target", &to_duration(position)),
                ],
            )
            .await
            .map_err(upnp_error)?;
        } else {
            debug!(position, "remembering scrub position until play");
            state.pre_scrub = Some(position);
        }
        Ok(())
    }

    async fn get_scrub(&self) -> Result<(f64, f64), AirPlayError> {
        let state = self.state.lock().await;
        let (Some(instance_id), Some(_)) = (&state.instance_id, &state.uri) else {
            return Ok((0.0, 0.0));
        };
        let out = self
            .call(
                SERVICE_ID_AVTRANSPORT,
                "GetPositionInfo",
                &[("InstanceID", instance_id)],
            )
            .await
            .map_err(upnp_error)?;
        Ok((parse_time(&out, "TrackDuration"), parse_time(&out, "RelTime")))
    }

    async fn is_playing(&self) -> Result<bool, AirPlayError> {
        let state = self.state.lock().await;
        match (&state.instance_id, &state.uri) {
            (Some(instance_id), Some(_)) => {
                self.query_playing(instance_id).await.map_err(upnp_error)
            }
            _ => Ok(false),
        }
    }

    async fn rate(&self, value: f64) -> Result<(), AirPlayError> {
        let state = self.state.lock().await;
        let (Some(instance_id), Some(_)) = (state.instance_id.clone(), &state.uri) else {
            return Ok(());
        };
        let playing = self.query_playing(&instance_id).await.map_err(upnp_error)?;
        if value >= 1.0 && !playing {
            self.call(
                SERVICE_ID_AVTRANSPORT,
                "Play",
                &[("InstanceID", &instance_id), ("Speed", "1")],
            )
            .await
            .map_err(upnp_error)?;
        } else if value < 1.0 && playing {
            let has_pause = self
                .device
                .service_by_id(SERVICE_ID_AVTRANSPORT)
                .is_ok_and(|s| s.has_action("Pause"));
            let action = if has_pause { "Pause" } else { "Stop" };
            self.call(
                SERVICE_ID_AVTRANSPORT,
                action,
                &[("InstanceID", &instance_id)],
            )
            .await
            .map_err(upnp_error)?;
        }
        Ok(())
    }

    /// The event channel over the upgraded connection is not implemented;
    /// the HTTP layer alone answers the handshake.
    async fn reverse(&self) -> Result<(), AirPlayError> {
        Ok(())
    }

    async fn photo(&self, data: Bytes, transition: Option<String>) -> Result<(), AirPlayError> {
        let (mime, _) = get_image_type(&data);
        debug!(
            size = data.len(),
            mime,
            transition = transition.as_deref().unwrap_or(""),
            "accepted photo"
        );
        Ok(())
    }
}
