use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use quick_xml::escape::escape;

use super::PlistValue;

const HEADER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
<plist version=\"1.0\">\n";

/// Renders a value as an Apple XML property list document.
pub fn encode(value: &PlistValue) -> String {
    let mut out = String::with_capacity(256);
    out.push_str(HEADER);
    write_value(&mut out, value);
    out.push_str("</plist>\n");
    out
}

// Reals keep a decimal point so they stay reals on the way back in.
pub(crate) fn format_real(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

fn write_value(out: &mut String, value: &PlistValue) {
    match value {
        PlistValue::Boolean(true) => out.push_str("<true/>\n"),
        PlistValue::Boolean(false) => out.push_str("<false/>\n"),
        PlistValue::Integer(i) => {
            out.push_str(&format!("<integer>{i}</integer>\n"));
        }
        PlistValue::Real(r) => {
            out.push_str(&format!("<real>{}</real>\n", format_real(*r)));
        }
        PlistValue::String(s) => {
            out.push_str(&format!("<string>{}</string>\n", escape(s.as_str())));
        }
        PlistValue::Data(d) => {
            out.push_str(&format!("<data>{}</data>\n", BASE64.encode(d)));
        }
        PlistValue::Array(items) => {
            out.push_str("<array>\n");
            for item in items {
                write_value(out, item);
            }
            out.push_str("</array>\n");
        }
        PlistValue::Dictionary(dict) => {
            out.push_str("<dict>\n");
            for (key, value) in dict {
                out.push_str(&format!("<key>{}</key>\n", escape(key.as_str())));
                write_value(out, value);
            }
            out.push_str("</dict>\n");
        }
    }
}
