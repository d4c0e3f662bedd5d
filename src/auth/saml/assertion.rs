use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;

/// The parts of a SAML assertion the SP acts on. Signature verification is
/// the listener-side XML-DSig layer's job; this parser extracts identity and
/// validity data from an already-trusted document.
#[derive(Debug, Clone, Default)]
pub struct Assertion {
    pub id: String,
    pub issuer: Option<String>,
    pub name_id: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub session_index: Option<String>,
    /// Attribute name → values, in document order.
    pub attributes: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct LogoutRequest {
    pub id: String,
    pub issuer: Option<String>,
    pub name_id: Option<String>,
}

/// IdP endpoints discovered from metadata.
#[derive(Debug, Clone, Default)]
pub struct IdpMetadata {
    pub entity_id: String,
    pub sso_url: Option<String>,
    pub slo_url: Option<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum Capture {
    None,
    Issuer,
    NameId,
    AttributeValue,
    SessionIndex,
}

/// Parse the first `<Assertion>` in the document (a bare assertion or a full
/// `<Response>` wrapper both work).
pub fn parse_assertion(xml: &[u8]) -> Result<Assertion> {
    let mut reader = Reader::from_reader(xml);

    let mut assertion = Assertion::default();
    let mut in_assertion = false;
    let mut seen_assertion = false;
    let mut capture = Capture::None;
    let mut current_attribute: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = e.local_name();
                match name.as_ref() {
                    b"Assertion" if !seen_assertion => {
                        in_assertion = true;
                        seen_assertion = true;
                        for attr in e.attributes().flatten() {
                            if attr.key.local_name().as_ref() == b"ID" {
                                assertion.id =
                                    String::from_utf8_lossy(&attr.value).into_owned();
                            }
                        }
                    }
                    b"Conditions" if in_assertion => {
                        for attr in e.attributes().flatten() {
                            let value = String::from_utf8_lossy(&attr.value);
                            match attr.key.local_name().as_ref() {
                                b"NotBefore" => {
                                    assertion.not_before = parse_instant(&value);
                                }
                                b"NotOnOrAfter" => {
                                    assertion.not_on_or_after = parse_instant(&value);
                                }
                                _ => {}
                            }
                        }
                    }
                    b"AuthnStatement" if in_assertion => {
                        for attr in e.attributes().flatten() {
                            if attr.key.local_name().as_ref() == b"SessionIndex" {
                                assertion.session_index =
                                    Some(String::from_utf8_lossy(&attr.value).into_owned());
                            }
                        }
                    }
                    b"Issuer" if in_assertion => capture = Capture::Issuer,
                    b"NameID" if in_assertion => capture = Capture::NameId,
                    b"SessionIndex" if in_assertion => capture = Capture::SessionIndex,
                    b"Attribute" if in_assertion => {
                        current_attribute = e.attributes().flatten().find_map(|attr| {
                            (attr.key.local_name().as_ref() == b"Name")
                                .then(|| String::from_utf8_lossy(&attr.value).into_owned())
                        });
                    }
                    b"AttributeValue" if in_assertion && current_attribute.is_some() => {
                        capture = Capture::AttributeValue;
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().unwrap_or_default().trim().to_string();
                if text.is_empty() {
                    buf.clear();
                    continue;
                }
                match capture {
                    Capture::Issuer => assertion.issuer = Some(text),
                    Capture::NameId => assertion.name_id = Some(text),
                    Capture::SessionIndex => assertion.session_index = Some(text),
                    Capture::AttributeValue => {
                        if let Some(name) = &current_attribute {
                            assertion
                                .attributes
                                .entry(name.clone())
                                .or_default()
                                .push(text);
                        }
                    }
                    Capture::None => {}
                }
                capture = Capture::None;
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Assertion" => in_assertion = false,
                    b"Attribute" => current_attribute = None,
                    _ => {}
                }
                capture = Capture::None;
            }
            Ok(Event::Eof) => break,
            Err(e) => bail!("malformed SAML document: {}", e),
            _ => {}
        }
        buf.clear();
    }

    if !seen_assertion {
        bail!("no assertion in document");
    }
    if assertion.id.is_empty() {
        bail!("assertion has no ID");
    }
    Ok(assertion)
}

pub fn parse_logout_request(xml: &[u8]) -> Result<LogoutRequest> {
    let mut reader = Reader::from_reader(xml);

    let mut request = LogoutRequest::default();
    let mut seen = false;
    let mut capture = Capture::None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"LogoutRequest" => {
                    seen = true;
                    for attr in e.attributes().flatten() {
                        if attr.key.local_name().as_ref() == b"ID" {
                            request.id = String::from_utf8_lossy(&attr.value).into_owned();
                        }
                    }
                }
                b"Issuer" if seen => capture = Capture::Issuer,
                b"NameID" if seen => capture = Capture::NameId,
                _ => {}
            },
            Ok(Event::Text(t)) => {
                let text = t.unescape().unwrap_or_default().trim().to_string();
                if text.is_empty() {
                    buf.clear();
                    continue;
                }
                match capture {
                    Capture::Issuer => request.issuer = Some(text),
                    Capture::NameId => request.name_id = Some(text),
                    _ => {}
                }
                capture = Capture::None;
            }
            Ok(Event::End(_)) => capture = Capture::None,
            Ok(Event::Eof) => break,
            Err(e) => bail!("malformed logout request: {}", e),
            _ => {}
        }
        buf.clear();
    }

    if !seen {
        bail!("no LogoutRequest in document");
    }
    Ok(request)
}

/// Pull the SSO/SLO endpoints out of IdP metadata.
pub fn parse_idp_metadata(xml: &[u8]) -> Result<IdpMetadata> {
    let mut reader = Reader::from_reader(xml);

    let mut metadata = IdpMetadata::default();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"EntityDescriptor" => {
                    for attr in e.attributes().flatten() {
                        if attr.key.local_name().as_ref() == b"entityID" {
                            metadata.entity_id =
                                String::from_utf8_lossy(&attr.value).into_owned();
                        }
                    }
                }
                b"SingleSignOnService" => {
                    if metadata.sso_url.is_none() {
                        metadata.sso_url = location_attr(&e);
                    }
                }
                b"SingleLogoutService" => {
                    if metadata.slo_url.is_none() {
                        metadata.slo_url = location_attr(&e);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => bail!("malformed IdP metadata: {}", e),
            _ => {}
        }
        buf.clear();
    }

    if metadata.entity_id.is_empty() && metadata.sso_url.is_none() {
        bail!("document is not IdP metadata");
    }
    Ok(metadata)
}

fn location_attr(e: &quick_xml::events::BytesStart<'_>) -> Option<String> {
    e.attributes().flatten().find_map(|attr| {
        (attr.key.local_name().as_ref() == b"Location")
            .then(|| String::from_utf8_lossy(&attr.value).into_owned())
    })
}

fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_ASSERTION: &str = r#"<?xml version="1.0"?>
<saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_abc123" IssueInstant="2026-01-01T00:00:00Z">
  <saml:Issuer>https://idp.example.com</saml:Issuer>
  <saml:Subject>
    <saml:NameID Format="urn:oasis:names:tc:SAML:2.0:nameid-format:persistent">user-77</saml:NameID>
  </saml:Subject>
  <saml:Conditions NotBefore="2026-01-01T00:00:00Z" NotOnOrAfter="2026-01-01T01:00:00Z"/>
  <saml:AuthnStatement SessionIndex="sess-1"/>
  <saml:AttributeStatement>
    <saml:Attribute Name="email">
      <saml:AttributeValue>alice@example.com</saml:AttributeValue>
    </saml:Attribute>
    <saml:Attribute Name="groups">
      <saml:AttributeValue>admins</saml:AttributeValue>
      <saml:AttributeValue>ops</saml:AttributeValue>
    </saml:Attribute>
  </saml:AttributeStatement>
</saml:Assertion>"#;

    #[test]
    fn test_parse_assertion_fields() {
        let a = parse_assertion(SAMPLE_ASSERTION.as_bytes()).unwrap();
        assert_eq!(a.id, "_abc123");
        assert_eq!(a.issuer.as_deref(), Some("https://idp.example.com"));
        assert_eq!(a.name_id.as_deref(), Some("user-77"));
        assert_eq!(a.session_index.as_deref(), Some("sess-1"));
        assert!(a.not_before.is_some());
        assert!(a.not_on_or_after.is_some());
        assert_eq!(a.attributes["email"], vec!["alice@example.com"]);
        assert_eq!(a.attributes["groups"], vec!["admins", "ops"]);
    }

    #[test]
    fn test_parse_assertion_inside_response() {
        let xml = format!(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_resp">
                 <samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status>
                 {}
               </samlp:Response>"#,
            SAMPLE_ASSERTION.trim_start_matches("<?xml version=\"1.0\"?>")
        );
        let a = parse_assertion(xml.as_bytes()).unwrap();
        assert_eq!(a.id, "_abc123");
        assert_eq!(a.name_id.as_deref(), Some("user-77"));
    }

    #[test]
    fn test_missing_assertion_errors() {
        let err = parse_assertion(b"<samlp:Response xmlns:samlp=\"x\"/>").unwrap_err();
        assert!(err.to_string().contains("no assertion"));
    }

    #[test]
    fn test_assertion_without_id_errors() {
        let xml = r#"<Assertion xmlns="urn:oasis:names:tc:SAML:2.0:assertion"><Issuer>x</Issuer></Assertion>"#;
        assert!(parse_assertion(xml.as_bytes()).is_err());
    }

    #[test]
    fn test_parse_logout_request() {
        let xml = r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"
                       xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_lo9">
                       <saml:Issuer>https://idp.example.com</saml:Issuer>
                       <saml:NameID>user-77</saml:NameID>
                     </samlp:LogoutRequest>"#;
        let lr = parse_logout_request(xml.as_bytes()).unwrap();
        assert_eq!(lr.id, "_lo9");
        assert_eq!(lr.name_id.as_deref(), Some("user-77"));
    }

    #[test]
    fn test_parse_idp_metadata() {
        let xml = r#"<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="https://idp.example.com">
                       <md:IDPSSODescriptor>
                         <md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="https://idp.example.com/sso"/>
                         <md:SingleLogoutService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="https://idp.example.com/slo"/>
                       </md:IDPSSODescriptor>
                     </md:EntityDescriptor>"#;
        let md = parse_idp_metadata(xml.as_bytes()).unwrap();
        assert_eq!(md.entity_id, "https://idp.example.com");
        assert_eq!(md.sso_url.as_deref(), Some("https://idp.example.com/sso"));
        assert_eq!(md.slo_url.as_deref(), Some("https://idp.example.com/slo"));
    }

    #[test]
    fn test_non_metadata_errors() {
        assert!(parse_idp_metadata(b"<other/>").is_err());
    }
}
