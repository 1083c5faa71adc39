/// Splits a USN into `(UDN, kind)`, where kind is the part after `::`
/// (empty when the USN is a bare UDN).
pub fn split_usn(usn: &str) -> (&str, &str) {
    usn.split_once("::").unwrap_or((usn, ""))
}

fn parse_urn(s: &str) -> Option<(&str, &str, &str, u32)> {
    let mut parts = s.split(':');
    if parts.next()? != "urn" {
        return None;
    }
    let vendor = parts.next()?;
    let kind = parts.next()?;
    if kind != "service" && kind != "device" {
        return None;
    }
    let name = parts.next()?;
    let version: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((vendor, kind, name, version))
}

/// UPnP type compatibility: versioned `urn:` types are compatible when vendor,
/// kind and name match and the actual version is at least the required one.
/// Bare tokens (`upnp:rootdevice`) must match exactly. A side that looks like
/// a URN but does not parse as one is never compatible.
pub fn are_service_types_compatible(required: &str, actual: &str) -> bool {
    match (parse_urn(required), parse_urn(actual)) {
        (Some((req_vendor, req_kind, req_name, req_ver)), Some((vendor, kind, name, ver))) => {
            req_vendor == vendor && req_kind == kind && req_name == name && ver >= req_ver
        }
        (None, None) => {
            !required.starts_with("urn:") && !actual.starts_with("urn:") && required == actual
        }
        _ => false,
    }
}
