use bytes::Bytes;
use serde_json::Value;

/// Response encodings the gateway can re-encode a JSON backend body into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Json,
    Xml,
    Yaml,
}

impl MediaType {
    pub fn content_type(&self) -> &'static str {
        match self {
            MediaType::Json => "application/json",
            MediaType::Xml => "application/xml",
            MediaType::Yaml => "application/yaml",
        }
    }
}

/// Pick the best supported media type from an `Accept` header.
///
/// Quality values are honoured (`application/xml;q=0` will not select XML);
/// ties prefer JSON, then XML, then YAML. `None` means nothing supported was
/// asked for — the response passes through untouched.
pub fn negotiate(accept: &str) -> Option<MediaType> {
    let mut best: Option<(MediaType, f32, usize)> = None;

    for part in accept.split(',') {
        let part = part.trim();
        let mut tokens = part.splitn(2, ';');
        let media = tokens.next().unwrap_or("").trim().to_ascii_lowercase();

        let q: f32 = tokens
            .next()
            .and_then(|params| {
                params.split(';').find_map(|p| {
                    p.trim()
                        .strip_prefix("q=")
                        .and_then(|v| v.trim().parse::<f32>().ok())
                })
            })
            .unwrap_or(1.0);
        if q <= 0.0 {
            continue;
        }

        let candidate = match media.as_str() {
            "application/json" | "text/json" => Some((MediaType::Json, 0)),
            "application/xml" | "text/xml" => Some((MediaType::Xml, 1)),
            "application/yaml" | "application/x-yaml" | "text/yaml" => Some((MediaType::Yaml, 2)),
            "*/*" | "application/*" => Some((MediaType::Json, 0)),
            _ => None,
        };

        if let Some((media_type, rank)) = candidate {
            let better = match best {
                None => true,
                Some((_, best_q, best_rank)) => q > best_q || (q == best_q && rank < best_rank),
            };
            if better {
                best = Some((media_type, q, rank));
            }
        }
    }

    best.map(|(media_type, _, _)| media_type)
}

/// Re-encode a JSON body into the negotiated type. Returns `None` when no
/// transcoding applies (target is JSON, or the body is not JSON) — the
/// caller passes the original response through.
pub fn transcode(body: &[u8], target: MediaType) -> Option<(Bytes, &'static str)> {
    if target == MediaType::Json {
        return None;
    }
    let value: Value = serde_json::from_slice(body).ok()?;
    match target {
        MediaType::Json => None,
        MediaType::Yaml => {
            let yaml = serde_yaml::to_string(&value).ok()?;
            Some((Bytes::from(yaml), MediaType::Yaml.content_type()))
        }
        MediaType::Xml => {
            let mut out = String::with_capacity(body.len() * 2);
            out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
            write_xml(&mut out, "response", &value);
            Some((Bytes::from(out), MediaType::Xml.content_type()))
        }
    }
}

fn write_xml(out: &mut String, name: &str, value: &Value) {
    let tag = sanitize_tag(name);
    match value {
        Value::Object(map) => {
            out.push('<');
            out.push_str(&tag);
            out.push('>');
            for (key, child) in map {
                write_xml(out, key, child);
            }
            out.push_str("</");
            out.push_str(&tag);
            out.push('>');
        }
        Value::Array(items) => {
            for item in items {
                write_xml(out, &tag, item);
            }
        }
        Value::Null => {
            out.push('<');
            out.push_str(&tag);
            out.push_str("/>");
        }
        scalar => {
            out.push('<');
            out.push_str(&tag);
            out.push('>');
            let text = match scalar {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push_str(&escape_xml(&text));
            out.push_str("</");
            out.push_str(&tag);
            out.push('>');
        }
    }
}

fn sanitize_tag(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.starts_with(|c: char| c.is_ascii_digit()) {
        format!("_{}", cleaned)
    } else {
        cleaned
    }
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_basics() {
        assert_eq!(negotiate("application/json"), Some(MediaType::Json));
        assert_eq!(negotiate("application/xml"), Some(MediaType::Xml));
        assert_eq!(negotiate("text/yaml"), Some(MediaType::Yaml));
        assert_eq!(negotiate("image/png"), None);
        assert_eq!(negotiate(""), None);
    }

    #[test]
    fn test_negotiate_quality_ordering() {
        assert_eq!(
            negotiate("application/json;q=0.5, application/xml;q=0.9"),
            Some(MediaType::Xml)
        );
        // q=0 disables a type entirely.
        assert_eq!(
            negotiate("application/xml;q=0, application/yaml"),
            Some(MediaType::Yaml)
        );
    }

    #[test]
    fn test_negotiate_tie_prefers_json() {
        assert_eq!(
            negotiate("application/xml, application/json"),
            Some(MediaType::Json)
        );
        assert_eq!(negotiate("*/*"), Some(MediaType::Json));
    }

    #[test]
    fn test_transcode_json_is_passthrough() {
        assert!(transcode(br#"{"a":1}"#, MediaType::Json).is_none());
    }

    #[test]
    fn test_transcode_non_json_body_is_passthrough() {
        assert!(transcode(b"<html></html>", MediaType::Xml).is_none());
    }

    #[test]
    fn test_transcode_to_yaml() {
        let (body, content_type) = transcode(br#"{"name":"alice","count":2}"#, MediaType::Yaml).unwrap();
        assert_eq!(content_type, "application/yaml");
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("name: alice"));
        assert!(text.contains("count: 2"));
    }

    #[test]
    fn test_transcode_to_xml() {
        let (body, content_type) =
            transcode(br#"{"user":{"name":"a<b","tags":["x","y"]}}"#, MediaType::Xml).unwrap();
        assert_eq!(content_type, "application/xml");
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("<user><name>a&lt;b</name><tags>x</tags><tags>y</tags></user>"));
    }

    #[test]
    fn test_xml_tag_sanitization() {
        let (body, _) = transcode(br#"{"weird key!":1}"#, MediaType::Xml).unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("<weird_key_>1</weird_key_>"));
    }
}
