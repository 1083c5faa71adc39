use crypto_hash::{Algorithm, hex_digest};
use uuid::Uuid;

/// Derives the stable MAC-style AirPlay device id for a renderer from its
/// UDN. UUID-shaped UDNs contribute their leading hex digits directly;
/// anything else goes through SHA-1 first. Deterministic, so the id survives
/// bridge restarts.
pub fn create_device_id(udn: &str) -> String {
    let hex = udn
        .strip_prefix("uuid:")
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .map(|uuid| uuid.simple().to_string())
        .unwrap_or_else(|| hex_digest(Algorithm::SHA1, udn.as_bytes()));

    let mut out = String::with_capacity(17);
    for (i, pair) in hex.as_bytes()[..12].chunks(2).enumerate() {
        if i > 0 {
            out.push(':');
        }
        out.push(pair[0].to_ascii_uppercase() as char);
        out.push(pair[1].to_ascii_uppercase() as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::create_device_id;

    #[test]
    fn test_create_id_from_uuid() {
        let id = create_device_id("uuid:f8ecf350-8691-4639-a735-c10ee6ad15c1");
        assert_eq!(id, "F8:EC:F3:50:86:91");
        assert_eq!(id.len(), 17);
        assert_eq!(id.split(':').count(), 6);
    }

    #[test]
    fn test_create_id_from_non_uuid() {
        let id = create_device_id("uuid:media_renderer_xyz");
        assert_eq!(id.len(), 17);
        assert_eq!(id.split(':').count(), 6);
        assert!(
            id.chars()
                .all(|c| c == ':' || c.is_ascii_hexdigit())
        );
    }

    #[test]
    fn test_create_id_is_not_random() {
        for udn in ["uuid:f8ecf350-8691-4639-a735-c10ee6ad15c1", "arbitrary"] {
            assert_eq!(create_device_id(udn), create_device_id(udn));
        }
    }
}
