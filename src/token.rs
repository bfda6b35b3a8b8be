use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use jsonwebtoken::jwk::{
    AlgorithmParameters, CommonParameters, EllipticCurve, EllipticCurveKeyParameters,
    EllipticCurveKeyType, Jwk,
};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::EncodePrivateKey;
use p256::SecretKey;
use rand_core::OsRng;
use serde::Serialize;
use tracing::debug;

use crate::MERCARI_SEARCH_URL;

/// Opaque marketplace access credential.
///
/// Mercari's search API authenticates each request with a DPoP proof JWT.
/// The token has an externally-determined lifetime; the engine replaces it
/// wholesale when the marketplace rejects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MercariToken(String);

impl MercariToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// External token-issuance mechanism.
pub trait TokenIssuer {
    fn issue(&self) -> Result<MercariToken>;
}

/// DPoP claim set sent with each minted proof.
#[derive(Serialize)]
struct DpopClaims {
    iat: i64,
    jti: String,
    htu: String,
    htm: String,
}

/// Production issuer: mints a DPoP proof JWT signed with a fresh P-256 key.
///
/// The public key rides along in the `jwk` header so the server can verify
/// the proof without any prior key exchange.
pub struct DpopIssuer {
    htu: String,
    htm: String,
}

impl DpopIssuer {
    pub fn new() -> Self {
        Self {
            htu: MERCARI_SEARCH_URL.to_string(),
            htm: "POST".to_string(),
        }
    }
}

impl Default for DpopIssuer {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenIssuer for DpopIssuer {
    fn issue(&self) -> Result<MercariToken> {
        let secret = SecretKey::random(&mut OsRng);
        let der = secret
            .to_pkcs8_der()
            .context("failed to encode signing key")?;
        let encoding_key = EncodingKey::from_ec_der(der.as_bytes());

        let point = secret.public_key().to_encoded_point(false);
        let x = point
            .x()
            .context("public key missing x coordinate")?;
        let y = point
            .y()
            .context("public key missing y coordinate")?;

        let jwk = Jwk {
            common: CommonParameters::default(),
            algorithm: AlgorithmParameters::EllipticCurve(EllipticCurveKeyParameters {
                key_type: EllipticCurveKeyType::EC,
                curve: EllipticCurve::P256,
                x: URL_SAFE_NO_PAD.encode(x.as_slice()),
                y: URL_SAFE_NO_PAD.encode(y.as_slice()),
            }),
        };

        let mut header = Header::new(Algorithm::ES256);
        header.typ = Some("dpop+jwt".to_string());
        header.jwk = Some(jwk);

        let claims = DpopClaims {
            iat: chrono::Utc::now().timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
            htu: self.htu.clone(),
            htm: self.htm.clone(),
        };

        let token = jsonwebtoken::encode(&header, &claims, &encoding_key)
            .context("failed to sign DPoP proof")?;
        debug!("Minted fresh DPoP token");
        Ok(MercariToken(token))
    }
}

/// Holds the single live credential, issuing lazily and replacing reactively.
///
/// No expiry is tracked; `refresh` is called only after the marketplace
/// rejects the current token.
pub struct TokenManager<I: TokenIssuer> {
    issuer: I,
    current: Option<MercariToken>,
}

impl<I: TokenIssuer> TokenManager<I> {
    pub fn new(issuer: I) -> Self {
        Self {
            issuer,
            current: None,
        }
    }

    /// The live token, issued lazily on first use.
    pub fn current(&mut self) -> Result<&MercariToken> {
        if self.current.is_none() {
            self.current = Some(self.issuer.issue()?);
        }
        Ok(self.current.as_ref().unwrap())
    }

    /// Discard the current token and obtain a new one.
    pub fn refresh(&mut self) -> Result<&MercariToken> {
        self.current = Some(self.issuer.issue()?);
        Ok(self.current.as_ref().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountingIssuer {
        issued: Cell<u32>,
    }

    impl CountingIssuer {
        fn new() -> Self {
            Self {
                issued: Cell::new(0),
            }
        }
    }

    impl TokenIssuer for CountingIssuer {
        fn issue(&self) -> Result<MercariToken> {
            let n = self.issued.get();
            self.issued.set(n + 1);
            Ok(MercariToken::new(format!("token-{n}")))
        }
    }

    #[test]
    fn current_issues_lazily_and_once() {
        let mut manager = TokenManager::new(CountingIssuer::new());
        assert_eq!(manager.issuer.issued.get(), 0);
        assert_eq!(manager.current().unwrap().as_str(), "token-0");
        assert_eq!(manager.current().unwrap().as_str(), "token-0");
        assert_eq!(manager.issuer.issued.get(), 1);
    }

    #[test]
    fn refresh_replaces_unconditionally() {
        let mut manager = TokenManager::new(CountingIssuer::new());
        assert_eq!(manager.current().unwrap().as_str(), "token-0");
        assert_eq!(manager.refresh().unwrap().as_str(), "token-1");
        assert_eq!(manager.current().unwrap().as_str(), "token-1");
        assert_eq!(manager.issuer.issued.get(), 2);
    }

    #[test]
    fn dpop_proof_has_expected_header() {
        let token = DpopIssuer::new().issue().unwrap();
        let header = jsonwebtoken::decode_header(token.as_str()).unwrap();
        assert_eq!(header.alg, Algorithm::ES256);
        assert_eq!(header.typ.as_deref(), Some("dpop+jwt"));
        assert!(header.jwk.is_some());
    }

    #[test]
    fn dpop_proof_claims_bind_method_and_url() {
        let token = DpopIssuer::new().issue().unwrap();
        let payload = token.as_str().split('.').nth(1).unwrap();
        let decoded = URL_SAFE_NO_PAD.decode(payload).unwrap();
        let claims: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(claims["htu"], MERCARI_SEARCH_URL);
        assert_eq!(claims["htm"], "POST");
        assert!(claims["jti"].as_str().is_some());
    }

    #[test]
    fn fresh_proofs_are_distinct() {
        let issuer = DpopIssuer::new();
        let a = issuer.issue().unwrap();
        let b = issuer.issue().unwrap();
        assert_ne!(a, b);
    }
}
