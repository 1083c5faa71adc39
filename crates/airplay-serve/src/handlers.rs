use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use serde_derive::Deserialize;
use tracing::trace;

use crate::plist::{PlistValue, binary, xml};
use crate::state::{
    AirPlayBackend, AirPlayError, AirPlayState, AirPlayStateInner, PROTOCOL_VERSION, ServerInfo,
    SOURCE_VERSION,
};

pub const CT_TEXT_PLIST: &str = "text/x-apple-plist+xml";
pub const CT_BINARY_PLIST: &str = "application/x-apple-binary-plist";

const SESSION_ID_HEADER: &str = "x-apple-session-id";

pub fn make_router(backend: Arc<dyn AirPlayBackend>, info: ServerInfo) -> axum::Router {
    let state: AirPlayState = Arc::new(AirPlayStateInner { backend, info });
    axum::Router::new()
        .route("/server-info", get(server_info))
        .route("/playback-info", get(playback_info))
        .route("/play", post(play))
        .route("/stop", post(stop))
        .route("/scrub", get(scrub_get).post(scrub_post))
        .route("/rate", post(rate))
        .route("/reverse", post(reverse))
        .route("/photo", put(photo))
        .route("/slideshow-features", get(slideshow_features))
        .with_state(state)
}

fn plist_response(value: PlistValue) -> Response {
    (
        [(header::CONTENT_TYPE, CT_TEXT_PLIST)],
        xml::encode(&value),
    )
        .into_response()
}

/// Each state-changing request carries the client's session in a header; it
/// must be bound (or rejected) before the backing operation runs.
async fn bind_session(state: &AirPlayState, headers: &HeaderMap) -> Result<(), AirPlayError> {
    if let Some(session_id) = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        state
            .backend
            .set_session_id(Some(session_id.to_owned()))
            .await?;
    }
    Ok(())
}

async fn server_info(State(state): State<AirPlayState>) -> Response {
    let mut dict = BTreeMap::new();
    dict.insert(
        "deviceid".to_owned(),
        PlistValue::String(state.info.device_id.clone()),
    );
    dict.insert(
        "features".to_owned(),
        PlistValue::Integer(state.info.features as i64),
    );
    dict.insert(
        "model".to_owned(),
        PlistValue::String(state.info.model.clone()),
    );
    dict.insert(
        "protovers".to_owned(),
        PlistValue::String(PROTOCOL_VERSION.to_owned()),
    );
    dict.insert(
        "srcvers".to_owned(),
        PlistValue::String(SOURCE_VERSION.to_owned()),
    );
    plist_response(dict.into())
}

async fn playback_info(State(state): State<AirPlayState>) -> Result<Response, AirPlayError> {
    let (duration, position) = state.backend.get_scrub().await?;
    let playing = state.backend.is_playing().await?;
    let (buffer_empty, ready_to_play) = if duration + position == 0.0 {
        (true, false)
    } else {
        (false, true)
    };

    let time_range = || {
        let mut range = BTreeMap::new();
        range.insert("duration".to_owned(), PlistValue::Real(duration));
        range.insert("start".to_owned(), PlistValue::Real(0.0));
        PlistValue::Array(vec![range.into()])
    };

    let mut dict = BTreeMap::new();
    dict.insert("duration".to_owned(), PlistValue::Real(duration));
    dict.insert("position".to_owned(), PlistValue::Real(position));
    dict.insert("rate".to_owned(), PlistValue::Integer(i64::from(playing)));
    dict.insert(
        "playbackBufferEmpty".to_owned(),
        PlistValue::Boolean(buffer_empty),
    );
    dict.insert("playbackBufferFull".to_owned(), PlistValue::Boolean(false));
    dict.insert(
        "playbackLikelyToKeepUp".to_owned(),
        PlistValue::Boolean(true),
    );
    dict.insert("readyToPlay".to_owned(), PlistValue::Boolean(ready_to_play));
    dict.insert("loadedTimeRanges".to_owned(), time_range());
    dict.insert("seekableTimeRanges".to_owned(), time_range());
    Ok(plist_response(dict.into()))
}

async fn play(
    State(state): State<AirPlayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(), AirPlayError> {
    bind_session(&state, &headers).await?;
    let (location, start_position) = parse_play_body(&headers, &body)?;
    trace!(%location, start_position, "play request");
    state.backend.play(location, start_position).await
}

fn parse_play_body(headers: &HeaderMap, body: &[u8]) -> Result<(String, f64), AirPlayError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type == CT_BINARY_PLIST {
        let value =
            binary::decode(body).map_err(|e| AirPlayError::BadRequest(e.into()))?;
        let location = value
            .get("Content-Location")
            .and_then(PlistValue::as_str)
            .ok_or_else(|| AirPlayError::BadRequest(anyhow!("play body without Content-Location")))?
            .to_owned();
        // Position may be absent for streaming media.
        let position = value
            .get("Start-Position")
            .and_then(PlistValue::as_f64)
            .unwrap_or(0.0);
        Ok((location, position))
    } else {
        parse_play_text_body(body)
    }
}

// Legacy clients send the parameters as an RFC822-ish header block.
fn parse_play_text_body(body: &[u8]) -> Result<(String, f64), AirPlayError> {
    let mut buf = Vec::with_capacity(body.len() + 4);
    buf.extend_from_slice(body);
    buf.extend_from_slice(b"\r\n\r\n");

    let mut headers = [httparse::EMPTY_HEADER; 16];
    let headers = match httparse::parse_headers(&buf, &mut headers) {
        Ok(httparse::Status::Complete((_, headers))) => headers,
        Ok(httparse::Status::Partial) | Err(_) => {
            return Err(AirPlayError::BadRequest(anyhow!("unparsable play body")));
        }
    };

    let find = |name: &str| {
        headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .map(str::trim)
    };
    let location = find("Content-Location")
        .ok_or_else(|| AirPlayError::BadRequest(anyhow!("play body without Content-Location")))?
        .to_owned();
    let position = match find("Start-Position") {
        Some(raw) => raw
            .parse()
            .map_err(|_| AirPlayError::BadRequest(anyhow!("bad Start-Position {raw:?}")))?,
        None => 0.0,
    };
    Ok((location, position))
}

async fn stop(
    State(state): State<AirPlayState>,
    headers: HeaderMap,
) -> Result<(), AirPlayError> {
    bind_session(&state, &headers).await?;
    state.backend.stop().await?;
    // An explicit stop ends the client's session.
    state.backend.set_session_id(None).await
}

async fn scrub_get(State(state): State<AirPlayState>) -> Result<String, AirPlayError> {
    let (duration, position) = state.backend.get_scrub().await?;
    Ok(format!(
        "duration: {}\nposition: {}",
        xml::format_real(duration),
        xml::format_real(position)
    ))
}

#[derive(Deserialize)]
struct ScrubQuery {
    position: f64,
}

async fn scrub_post(
    State(state): State<AirPlayState>,
    headers: HeaderMap,
    Query(query): Query<ScrubQuery>,
) -> Result<(), AirPlayError> {
    bind_session(&state, &headers).await?;
    state.backend.set_scrub(query.position).await
}

#[derive(Deserialize)]
struct RateQuery {
    value: f64,
}

async fn rate(
    State(state): State<AirPlayState>,
    headers: HeaderMap,
    Query(query): Query<RateQuery>,
) -> Result<(), AirPlayError> {
    bind_session(&state, &headers).await?;
    state.backend.rate(query.value).await
}

async fn reverse(
    State(state): State<AirPlayState>,
    headers: HeaderMap,
) -> Result<Response, AirPlayError> {
    bind_session(&state, &headers).await?;
    state.backend.reverse().await?;
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "PTTH/1.0")
        .header(header::CONNECTION, "Upgrade")
        .body(Body::empty())
        .map_err(|e| AirPlayError::Internal(e.into()))
}

async fn photo(
    State(state): State<AirPlayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(), AirPlayError> {
    bind_session(&state, &headers).await?;
    let transition = headers
        .get("x-apple-transition")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    state.backend.photo(body, transition).await
}

async fn slideshow_features() -> Response {
    let mut theme = BTreeMap::new();
    theme.insert("key".to_owned(), PlistValue::String("UPnP".to_owned()));
    theme.insert("name".to_owned(), PlistValue::String("UPnP".to_owned()));
    let mut dict = BTreeMap::new();
    dict.insert(
        "themes".to_owned(),
        PlistValue::Array(vec![theme.into()]),
    );
    plist_response(dict.into())
}
