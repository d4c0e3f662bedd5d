use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use http::HeaderMap;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha256, Sha512};
use std::time::{SystemTime, UNIX_EPOCH};

/// Default prefix for the emitted signature headers.
pub const DEFAULT_HEADER_PREFIX: &str = "X-Runway-";

/// Methods whose requests carry no signable body.
const BODYLESS_METHODS: &[&str] = &["GET", "HEAD", "OPTIONS", "TRACE", "CONNECT"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignAlgorithm {
    HmacSha256,
    HmacSha512,
    RsaSha256,
    RsaSha512,
    RsaPssSha256,
}

impl SignAlgorithm {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hmac-sha256" => Some(Self::HmacSha256),
            "hmac-sha512" => Some(Self::HmacSha512),
            "rsa-sha256" => Some(Self::RsaSha256),
            "rsa-sha512" => Some(Self::RsaSha512),
            "rsa-pss-sha256" => Some(Self::RsaPssSha256),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HmacSha256 => "hmac-sha256",
            Self::HmacSha512 => "hmac-sha512",
            Self::RsaSha256 => "rsa-sha256",
            Self::RsaSha512 => "rsa-sha512",
            Self::RsaPssSha256 => "rsa-pss-sha256",
        }
    }
}

enum SigningKey {
    Hmac(Vec<u8>),
    Rsa(Box<RsaPrivateKey>),
}

#[derive(Debug, Clone, Default)]
pub struct SignerConfig {
    /// One of `hmac-sha256 | hmac-sha512 | rsa-sha256 | rsa-sha512 |
    /// rsa-pss-sha256`.
    pub algorithm: String,
    pub key_id: String,
    /// Base64 HMAC secret (≥ 32 bytes decoded).
    pub hmac_secret: Option<String>,
    /// PEM RSA key, inline.
    pub rsa_key_pem: Option<String>,
    /// Path to a PEM RSA key file.
    pub rsa_key_file: Option<String>,
    /// Additional headers folded into the signing string.
    pub signed_headers: Vec<String>,
    pub include_body: bool,
    pub header_prefix: Option<String>,
}

/// Headers to attach to the outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureHeaders {
    pub signature: (String, String),
    pub timestamp: (String, String),
    pub key_id: (String, String),
    pub signed_headers: (String, String),
}

impl SignatureHeaders {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        [
            (self.signature.0.as_str(), self.signature.1.as_str()),
            (self.timestamp.0.as_str(), self.timestamp.1.as_str()),
            (self.key_id.0.as_str(), self.key_id.1.as_str()),
            (
                self.signed_headers.0.as_str(),
                self.signed_headers.1.as_str(),
            ),
        ]
        .into_iter()
    }
}

/// Signs outbound requests over a canonical request line + header subset.
///
/// The signing string is
/// `METHOD\nrequest-target\ntimestamp\nhex(sha256(body))` followed by one
/// `name:value` line per configured header, lowercased and sorted. The body
/// digest degrades to the empty digest for bodyless methods or when body
/// signing is off, so verifiers never need to buffer uploads.
pub struct RequestSigner {
    algorithm: SignAlgorithm,
    key_id: String,
    key: SigningKey,
    /// Lowercased, lexicographically sorted.
    signed_headers: Vec<String>,
    include_body: bool,
    header_prefix: String,
}

impl RequestSigner {
    pub fn new(config: SignerConfig) -> Result<Self> {
        let algorithm = SignAlgorithm::parse(&config.algorithm)
            .with_context(|| format!("unknown signing algorithm {:?}", config.algorithm))?;

        let key = match algorithm {
            SignAlgorithm::HmacSha256 | SignAlgorithm::HmacSha512 => {
                let secret = config
                    .hmac_secret
                    .as_deref()
                    .context("hmac algorithms require a secret")?;
                let secret = BASE64
                    .decode(secret.trim())
                    .context("hmac secret is not valid base64")?;
                if secret.len() < 32 {
                    bail!("hmac secret must decode to at least 32 bytes");
                }
                SigningKey::Hmac(secret)
            }
            SignAlgorithm::RsaSha256 | SignAlgorithm::RsaSha512 | SignAlgorithm::RsaPssSha256 => {
                let pem = match (&config.rsa_key_pem, &config.rsa_key_file) {
                    (Some(pem), _) => pem.clone(),
                    (None, Some(file)) => std::fs::read_to_string(file)
                        .with_context(|| format!("reading RSA key file {}", file))?,
                    (None, None) => bail!("rsa algorithms require a key (inline or file)"),
                };
                SigningKey::Rsa(Box::new(parse_rsa_key(&pem)?))
            }
        };

        let mut signed_headers: Vec<String> = config
            .signed_headers
            .iter()
            .map(|h| h.to_ascii_lowercase())
            .collect();
        signed_headers.sort();
        signed_headers.dedup();

        Ok(Self {
            algorithm,
            key_id: config.key_id,
            key,
            signed_headers,
            include_body: config.include_body,
            header_prefix: config
                .header_prefix
                .unwrap_or_else(|| DEFAULT_HEADER_PREFIX.to_string()),
        })
    }

    /// Sign a request. `host` is the request authority (used for the `host`
    /// pseudo-header); `body` is the already-buffered payload, if any.
    pub fn sign(
        &self,
        method: &str,
        request_target: &str,
        host: &str,
        headers: &HeaderMap,
        body: Option<&[u8]>,
    ) -> Result<SignatureHeaders> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            .to_string();

        let signing_string =
            self.signing_string(method, request_target, &timestamp, host, headers, body);
        let signature = self.compute(&signing_string)?;

        let p = &self.header_prefix;
        Ok(SignatureHeaders {
            signature: (
                format!("{}Signature", p),
                format!("{}={}", self.algorithm.as_str(), signature),
            ),
            timestamp: (format!("{}Timestamp", p), timestamp),
            key_id: (format!("{}Key-ID", p), self.key_id.clone()),
            signed_headers: (
                format!("{}Signed-Headers", p),
                self.signed_headers.join(";"),
            ),
        })
    }

    /// The canonical byte sequence a verifier must reproduce.
    pub fn signing_string(
        &self,
        method: &str,
        request_target: &str,
        timestamp: &str,
        host: &str,
        headers: &HeaderMap,
        body: Option<&[u8]>,
    ) -> String {
        let method = method.to_ascii_uppercase();
        let body_hash = if !self.include_body
            || body.is_none()
            || BODYLESS_METHODS.contains(&method.as_str())
        {
            hex::encode(Sha256::digest(b""))
        } else {
            hex::encode(Sha256::digest(body.unwrap_or_default()))
        };

        let mut s = format!("{}\n{}\n{}\n{}", method, request_target, timestamp, body_hash);
        for name in &self.signed_headers {
            let value = if name == "host" {
                host.to_string()
            } else {
                headers
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            };
            s.push('\n');
            s.push_str(name);
            s.push(':');
            s.push_str(&value);
        }
        s
    }

    fn compute(&self, signing_string: &str) -> Result<String> {
        let bytes = signing_string.as_bytes();
        let signature = match (&self.key, self.algorithm) {
            (SigningKey::Hmac(secret), SignAlgorithm::HmacSha256) => {
                let mut mac = Hmac::<Sha256>::new_from_slice(secret)
                    .expect("hmac accepts any key length");
                mac.update(bytes);
                mac.finalize().into_bytes().to_vec()
            }
            (SigningKey::Hmac(secret), SignAlgorithm::HmacSha512) => {
                let mut mac = Hmac::<Sha512>::new_from_slice(secret)
                    .expect("hmac accepts any key length");
                mac.update(bytes);
                mac.finalize().into_bytes().to_vec()
            }
            (SigningKey::Rsa(key), SignAlgorithm::RsaSha256) => {
                let hashed = Sha256::digest(bytes);
                key.sign(Pkcs1v15Sign::new::<Sha256>(), &hashed)
                    .context("rsa-sha256 signing failed")?
            }
            (SigningKey::Rsa(key), SignAlgorithm::RsaSha512) => {
                let hashed = Sha512::digest(bytes);
                key.sign(Pkcs1v15Sign::new::<Sha512>(), &hashed)
                    .context("rsa-sha512 signing failed")?
            }
            (SigningKey::Rsa(key), SignAlgorithm::RsaPssSha256) => {
                let hashed = Sha256::digest(bytes);
                key.sign_with_rng(
                    &mut rand::thread_rng(),
                    rsa::Pss::new::<Sha256>(),
                    &hashed,
                )
                .context("rsa-pss signing failed")?
            }
            _ => bail!("key material does not match algorithm"),
        };
        Ok(hex::encode(signature))
    }

    pub fn algorithm(&self) -> SignAlgorithm {
        self.algorithm
    }
}

fn parse_rsa_key(pem: &str) -> Result<RsaPrivateKey> {
    if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(pem) {
        return Ok(key);
    }
    RsaPrivateKey::from_pkcs1_pem(pem).context("RSA key is neither PKCS#8 nor PKCS#1 PEM")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn hmac_signer(signed_headers: &[&str]) -> RequestSigner {
        RequestSigner::new(SignerConfig {
            algorithm: "hmac-sha256".into(),
            key_id: "key-1".into(),
            hmac_secret: Some(BASE64.encode([7u8; 32])),
            signed_headers: signed_headers.iter().map(|s| s.to_string()).collect(),
            include_body: true,
            ..SignerConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_signing_string_shape() {
        let signer = hmac_signer(&["Host", "Content-Type"]);
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let body = br#"{"data":true}"#;
        let s = signer.signing_string(
            "POST",
            "/api/resource",
            "1700000000",
            "api.example.com",
            &headers,
            Some(body),
        );

        let expected = format!(
            "POST\n/api/resource\n1700000000\n{}\ncontent-type:application/json\nhost:api.example.com",
            hex::encode(Sha256::digest(body)),
        );
        assert_eq!(s, expected);
    }

    #[test]
    fn test_signature_is_reproducible() {
        let signer = hmac_signer(&["Host", "Content-Type"]);
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let body = br#"{"data":true}"#;

        let emitted = signer
            .sign("POST", "/api/resource", "api.example.com", &headers, Some(body))
            .unwrap();

        assert_eq!(emitted.key_id.1, "key-1");
        assert_eq!(emitted.signed_headers.1, "content-type;host");
        assert!(emitted.signature.1.starts_with("hmac-sha256="));

        // Recompute with the same timestamp and compare.
        let signing_string = signer.signing_string(
            "POST",
            "/api/resource",
            &emitted.timestamp.1,
            "api.example.com",
            &headers,
            Some(body),
        );
        let recomputed = signer.compute(&signing_string).unwrap();
        assert_eq!(emitted.signature.1, format!("hmac-sha256={}", recomputed));
    }

    #[test]
    fn test_bodyless_method_uses_empty_digest() {
        let signer = hmac_signer(&[]);
        let s_get = signer.signing_string(
            "GET",
            "/x",
            "1",
            "h",
            &HeaderMap::new(),
            Some(b"ignored"),
        );
        let s_none = signer.signing_string("GET", "/x", "1", "h", &HeaderMap::new(), None);
        assert_eq!(s_get, s_none);
        assert!(s_get.ends_with(&hex::encode(Sha256::digest(b""))));
    }

    #[test]
    fn test_include_body_false_uses_empty_digest() {
        let signer = RequestSigner::new(SignerConfig {
            algorithm: "hmac-sha256".into(),
            key_id: "k".into(),
            hmac_secret: Some(BASE64.encode([1u8; 32])),
            include_body: false,
            ..SignerConfig::default()
        })
        .unwrap();
        let s = signer.signing_string("POST", "/x", "1", "h", &HeaderMap::new(), Some(b"body"));
        assert!(s.ends_with(&hex::encode(Sha256::digest(b""))));
    }

    #[test]
    fn test_signed_headers_sorted_and_deduped() {
        let signer = hmac_signer(&["X-B", "x-a", "X-B"]);
        let headers = signer
            .sign("POST", "/", "h", &HeaderMap::new(), None)
            .unwrap();
        assert_eq!(headers.signed_headers.1, "x-a;x-b");
    }

    #[test]
    fn test_short_hmac_secret_rejected() {
        let result = RequestSigner::new(SignerConfig {
            algorithm: "hmac-sha256".into(),
            key_id: "k".into(),
            hmac_secret: Some(BASE64.encode([1u8; 16])),
            ..SignerConfig::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let result = RequestSigner::new(SignerConfig {
            algorithm: "ed25519".into(),
            ..SignerConfig::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_hmac_sha512_signs() {
        let signer = RequestSigner::new(SignerConfig {
            algorithm: "hmac-sha512".into(),
            key_id: "k".into(),
            hmac_secret: Some(BASE64.encode([2u8; 32])),
            include_body: true,
            ..SignerConfig::default()
        })
        .unwrap();
        let headers = signer
            .sign("PUT", "/y", "h", &HeaderMap::new(), Some(b"payload"))
            .unwrap();
        assert!(headers.signature.1.starts_with("hmac-sha512="));
        // SHA-512 HMAC is 64 bytes → 128 hex chars.
        assert_eq!(headers.signature.1.len(), "hmac-sha512=".len() + 128);
    }

    #[test]
    fn test_custom_header_prefix() {
        let signer = RequestSigner::new(SignerConfig {
            algorithm: "hmac-sha256".into(),
            key_id: "k".into(),
            hmac_secret: Some(BASE64.encode([3u8; 32])),
            header_prefix: Some("X-Gw-".into()),
            ..SignerConfig::default()
        })
        .unwrap();
        let headers = signer.sign("GET", "/", "h", &HeaderMap::new(), None).unwrap();
        assert_eq!(headers.signature.0, "X-Gw-Signature");
        assert_eq!(headers.timestamp.0, "X-Gw-Timestamp");
        assert_eq!(headers.key_id.0, "X-Gw-Key-ID");
        assert_eq!(headers.signed_headers.0, "X-Gw-Signed-Headers");
    }
}
