use super::AuthError;
use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::HeaderMap;
use std::path::Path;
use x509_parser::prelude::{FromDer, X509Certificate};
use x509_parser::time::ASN1Time;

/// Header carrying the client certificate forwarded by the TLS-terminating
/// listener: base64 DER, or percent-encoded PEM (possibly a chain).
pub const DEFAULT_CERT_HEADER: &str = "x-forwarded-client-cert";

/// Maximum chain length walked during verification.
const MAX_CHAIN_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtlsMode {
    /// Certificate optional; parsed when present, never verified.
    Request,
    /// Certificate mandatory; presence only, no chain verification.
    Require,
    /// Certificate mandatory and verified against the route CA pool.
    Verify,
}

impl MtlsMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "request" => Some(MtlsMode::Request),
            "require" => Some(MtlsMode::Require),
            "verify" => Some(MtlsMode::Verify),
            _ => None,
        }
    }
}

/// Facts extracted from a presented client certificate.
#[derive(Debug, Clone)]
pub struct ClientCertificate {
    pub subject: String,
    pub issuer: String,
    pub serial: String,
}

/// Route-scoped client-certificate verifier.
pub struct MtlsVerifier {
    mode: MtlsMode,
    header_name: String,
    /// DER-encoded trust anchors (route CA pool).
    ca_pool: Vec<Vec<u8>>,
    allow_expired: bool,
}

impl MtlsVerifier {
    pub fn new(
        mode: MtlsMode,
        ca_files: &[impl AsRef<Path>],
        allow_expired: bool,
        header_name: Option<String>,
    ) -> Result<Self> {
        let mut ca_pool = Vec::new();
        for file in ca_files {
            let pem = std::fs::read(file.as_ref())
                .with_context(|| format!("reading CA file {}", file.as_ref().display()))?;
            ca_pool.extend(parse_pem_chain(&pem)?);
        }

        if mode == MtlsMode::Verify {
            if ca_files.is_empty() {
                bail!("verify mode requires at least one CA file");
            }
            if ca_pool.is_empty() {
                bail!("CA files contained no certificates");
            }
        }

        Ok(Self {
            mode,
            header_name: header_name.unwrap_or_else(|| DEFAULT_CERT_HEADER.to_string()),
            ca_pool,
            allow_expired,
        })
    }

    /// Build a verifier from in-memory PEM CA material (tests, inline config).
    pub fn from_pem(mode: MtlsMode, ca_pem: &[u8], allow_expired: bool) -> Result<Self> {
        let ca_pool = parse_pem_chain(ca_pem)?;
        if mode == MtlsMode::Verify && ca_pool.is_empty() {
            bail!("CA material contained no certificates");
        }
        Ok(Self {
            mode,
            header_name: DEFAULT_CERT_HEADER.to_string(),
            ca_pool,
            allow_expired,
        })
    }

    /// Run the configured check against the forwarded-cert header.
    pub fn verify(&self, headers: &HeaderMap) -> Result<Option<ClientCertificate>, AuthError> {
        let chain = match self.extract_chain(headers)? {
            Some(chain) => chain,
            None => {
                return match self.mode {
                    MtlsMode::Request => Ok(None),
                    MtlsMode::Require | MtlsMode::Verify => Err(AuthError::Forbidden(
                        "client certificate required".into(),
                    )),
                }
            }
        };

        let leaf_der = &chain[0];
        let (_, leaf) = X509Certificate::from_der(leaf_der)
            .map_err(|_| AuthError::Forbidden("unparsable client certificate".into()))?;
        let info = ClientCertificate {
            subject: leaf.subject().to_string(),
            issuer: leaf.issuer().to_string(),
            serial: leaf.raw_serial_as_string(),
        };

        if self.mode == MtlsMode::Verify {
            self.verify_chain(leaf_der, &chain[1..])?;
        }
        Ok(Some(info))
    }

    fn extract_chain(&self, headers: &HeaderMap) -> Result<Option<Vec<Vec<u8>>>, AuthError> {
        let Some(value) = headers.get(self.header_name.as_str()) else {
            return Ok(None);
        };
        let value = value
            .to_str()
            .map_err(|_| AuthError::Forbidden("bad certificate header".into()))?;
        if value.is_empty() {
            return Ok(None);
        }

        // Percent-encoded PEM (possibly a chain), else a single base64 DER.
        let decoded = percent_decode_header(value);
        if decoded.contains("-----BEGIN") {
            let chain = parse_pem_chain(decoded.as_bytes())
                .map_err(|_| AuthError::Forbidden("bad certificate PEM".into()))?;
            if chain.is_empty() {
                return Err(AuthError::Forbidden("bad certificate PEM".into()));
            }
            return Ok(Some(chain));
        }

        let der = BASE64
            .decode(value.trim())
            .map_err(|_| AuthError::Forbidden("bad certificate encoding".into()))?;
        Ok(Some(vec![der]))
    }

    fn verify_chain(
        &self,
        leaf_der: &[u8],
        intermediates_der: &[Vec<u8>],
    ) -> Result<(), AuthError> {
        let (_, leaf) = X509Certificate::from_der(leaf_der)
            .map_err(|_| AuthError::Forbidden("unparsable client certificate".into()))?;

        // Expired-cert tolerance: evaluate just before the leaf's own
        // NotAfter instead of now.
        let at = if self.allow_expired {
            let just_before = leaf.validity().not_after.timestamp() - 1;
            ASN1Time::from_timestamp(just_before.min(now_ts()))
                .unwrap_or(leaf.validity().not_after)
        } else {
            ASN1Time::from_timestamp(now_ts())
                .map_err(|_| AuthError::Forbidden("clock error".into()))?
        };
        if !leaf.validity().is_valid_at(at) {
            return Err(AuthError::Forbidden("client certificate expired".into()));
        }

        if let Ok(Some(eku)) = leaf.extended_key_usage() {
            if !eku.value.client_auth && !eku.value.any {
                return Err(AuthError::Forbidden(
                    "certificate not valid for client authentication".into(),
                ));
            }
        }
        drop(leaf);

        // Walk issuers through provided intermediates up to the CA pool.
        let mut current_der = leaf_der.to_vec();
        for _ in 0..MAX_CHAIN_DEPTH {
            let (_, current) = X509Certificate::from_der(&current_der)
                .map_err(|_| AuthError::Forbidden("unparsable certificate chain".into()))?;

            for ca_der in &self.ca_pool {
                if let Ok((_, ca)) = X509Certificate::from_der(ca_der) {
                    if ca.subject().as_raw() == current.issuer().as_raw()
                        && current.verify_signature(Some(ca.public_key())).is_ok()
                    {
                        return Ok(());
                    }
                }
            }

            let mut advanced = false;
            for inter_der in intermediates_der {
                if let Ok((_, inter)) = X509Certificate::from_der(inter_der) {
                    if inter.subject().as_raw() == current.issuer().as_raw()
                        && current.verify_signature(Some(inter.public_key())).is_ok()
                    {
                        current_der = inter_der.clone();
                        advanced = true;
                        break;
                    }
                }
            }
            if !advanced {
                break;
            }
        }

        Err(AuthError::Forbidden(
            "certificate chain not trusted".into(),
        ))
    }
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

fn parse_pem_chain(pem: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut reader = std::io::BufReader::new(pem);
    let mut chain = Vec::new();
    for cert in rustls_pemfile::certs(&mut reader) {
        chain.push(cert.context("parsing PEM certificate")?.as_ref().to_vec());
    }
    Ok(chain)
}

fn percent_decode_header(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(DEFAULT_CERT_HEADER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(MtlsMode::parse("request"), Some(MtlsMode::Request));
        assert_eq!(MtlsMode::parse("require"), Some(MtlsMode::Require));
        assert_eq!(MtlsMode::parse("verify"), Some(MtlsMode::Verify));
        assert_eq!(MtlsMode::parse("strict"), None);
    }

    #[test]
    fn test_request_mode_allows_absent_cert() {
        let verifier = MtlsVerifier::from_pem(MtlsMode::Request, b"", false).unwrap();
        assert!(verifier.verify(&HeaderMap::new()).unwrap().is_none());
    }

    #[test]
    fn test_require_mode_rejects_absent_cert() {
        let verifier = MtlsVerifier::from_pem(MtlsMode::Require, b"", false).unwrap();
        let err = verifier.verify(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.status(), 403);
    }

    #[test]
    fn test_verify_mode_requires_ca_material() {
        assert!(MtlsVerifier::from_pem(MtlsMode::Verify, b"", false).is_err());
        let no_files: &[&Path] = &[];
        assert!(MtlsVerifier::new(MtlsMode::Verify, no_files, false, None).is_err());
    }

    #[test]
    fn test_garbage_cert_value_rejected() {
        let verifier = MtlsVerifier::from_pem(MtlsMode::Require, b"", false).unwrap();
        let err = verifier
            .verify(&headers_with("!!!not-base64!!!"))
            .unwrap_err();
        assert_eq!(err.status(), 403);
    }

    #[test]
    fn test_empty_header_treated_as_absent() {
        let verifier = MtlsVerifier::from_pem(MtlsMode::Request, b"", false).unwrap();
        assert!(verifier.verify(&headers_with("")).unwrap().is_none());
    }

    #[test]
    fn test_percent_decode_header_round_trip() {
        assert_eq!(
            percent_decode_header("-----BEGIN%20CERTIFICATE-----%0A"),
            "-----BEGIN CERTIFICATE-----\n"
        );
        assert_eq!(percent_decode_header("plain"), "plain");
    }

    #[test]
    fn test_pem_without_certs_rejected_in_require() {
        let verifier = MtlsVerifier::from_pem(MtlsMode::Require, b"", false).unwrap();
        let err = verifier
            .verify(&headers_with("-----BEGIN%20CERTIFICATE-----%0A-----END%20CERTIFICATE-----"))
            .unwrap_err();
        assert_eq!(err.status(), 403);
    }
}
