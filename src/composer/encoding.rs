use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::{json, Map, Value};

/// Decode a backend response body into the JSON-shaped value later steps
/// template against.
///
/// - `no-op` keeps body, status and headers verbatim;
/// - `string` keeps the text content;
/// - `xml` / `rss` and `yaml` convert to a JSON-shaped map;
/// - `safejson` and the default parse JSON.
///
/// A body that fails to parse becomes `{"_raw": <text>}` rather than failing
/// the step — a downstream service sending malformed data should surface in
/// the template output, not abort the chain.
pub fn decode_body(
    encoding: &str,
    body: &[u8],
    status: u16,
    headers: &http::HeaderMap,
) -> Value {
    match encoding {
        "no-op" => {
            let mut header_map = Map::new();
            for (name, value) in headers {
                if let Ok(v) = value.to_str() {
                    header_map.insert(name.as_str().to_string(), Value::String(v.to_string()));
                }
            }
            json!({
                "body": String::from_utf8_lossy(body),
                "status": status,
                "headers": header_map,
            })
        }
        "string" => Value::String(String::from_utf8_lossy(body).into_owned()),
        "xml" | "rss" => match xml_to_value(body) {
            Ok(value) => value,
            Err(_) => raw_fallback(body),
        },
        "yaml" => match serde_yaml::from_slice::<serde_yaml::Value>(body) {
            Ok(value) => serde_json::to_value(value).unwrap_or_else(|_| raw_fallback(body)),
            Err(_) => raw_fallback(body),
        },
        // "safejson", "json", and anything else: parse as JSON.
        _ => match serde_json::from_slice::<Value>(body) {
            Ok(value) => value,
            Err(_) => raw_fallback(body),
        },
    }
}

fn raw_fallback(body: &[u8]) -> Value {
    json!({ "_raw": String::from_utf8_lossy(body) })
}

/// Convert an XML document to a JSON-shaped value: child elements become
/// keys (repeated names become arrays), attributes are prefixed with `@`,
/// and text-only elements collapse to strings.
pub fn xml_to_value(xml: &[u8]) -> anyhow::Result<Value> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();

    // Stack of (element name, accumulated object, text chunks).
    let mut stack: Vec<(String, Map<String, Value>, String)> = Vec::new();
    let mut root: Option<(String, Value)> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                let mut object = Map::new();
                for attr in e.attributes().flatten() {
                    let key =
                        format!("@{}", String::from_utf8_lossy(attr.key.local_name().as_ref()));
                    object.insert(
                        key,
                        Value::String(String::from_utf8_lossy(&attr.value).into_owned()),
                    );
                }
                stack.push((name, object, String::new()));
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                let mut object = Map::new();
                for attr in e.attributes().flatten() {
                    let key =
                        format!("@{}", String::from_utf8_lossy(attr.key.local_name().as_ref()));
                    object.insert(
                        key,
                        Value::String(String::from_utf8_lossy(&attr.value).into_owned()),
                    );
                }
                let value = if object.is_empty() {
                    Value::Null
                } else {
                    Value::Object(object)
                };
                attach(&mut stack, &mut root, name, value);
            }
            Ok(Event::Text(t)) => {
                if let Some((_, _, text)) = stack.last_mut() {
                    text.push_str(t.unescape().unwrap_or_default().trim());
                }
            }
            Ok(Event::End(_)) => {
                let Some((name, object, text)) = stack.pop() else {
                    anyhow::bail!("unbalanced XML");
                };
                let value = if object.is_empty() && !text.is_empty() {
                    Value::String(text)
                } else if object.is_empty() {
                    Value::Null
                } else {
                    let mut object = object;
                    if !text.is_empty() {
                        object.insert("#text".to_string(), Value::String(text));
                    }
                    Value::Object(object)
                };
                attach(&mut stack, &mut root, name, value);
            }
            Ok(Event::Eof) => break,
            Err(e) => anyhow::bail!("XML parse error: {}", e),
            _ => {}
        }
        buf.clear();
    }

    match root {
        Some((name, value)) => Ok(json!({ name: value })),
        None => anyhow::bail!("empty XML document"),
    }
}

fn attach(
    stack: &mut [(String, Map<String, Value>, String)],
    root: &mut Option<(String, Value)>,
    name: String,
    value: Value,
) {
    if let Some((_, parent, _)) = stack.last_mut() {
        match parent.get_mut(&name) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                parent.insert(name, Value::Array(vec![first, value]));
            }
            None => {
                parent.insert(name, value);
            }
        }
    } else if root.is_none() {
        *root = Some((name, value));
    }
}
