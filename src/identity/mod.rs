//! RSA keypair holder and per-request JWT issuance for sandbox-bound
//! invocations. Cluster persistence of the keypair lives in [`k8s`].

mod k8s;

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Serialize;
use tokio::sync::OnceCell;

const ISSUER: &str = "agentcube-router";
const TOKEN_TTL_SECS: i64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("keypair generation failed: {0}")]
    KeyGen(rsa::Error),

    #[error("PEM encoding failed: {0}")]
    Pem(#[from] rsa::pkcs8::Error),

    #[error("JWT signing failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// The generated RSA keypair plus its PEM encodings, ready for signing.
pub struct JwtKeyMaterial {
    private_key_pem: String,
    public_key_pem: String,
}

impl JwtKeyMaterial {
    fn generate() -> Result<Self, IdentityError> {
        let private_key =
            RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).map_err(IdentityError::KeyGen)?;
        Self::from_private_key(&private_key)
    }

    fn from_private_key(private_key: &RsaPrivateKey) -> Result<Self, IdentityError> {
        let private_key_pem = private_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
        let public_key = RsaPublicKey::from(private_key);
        let public_key_pem = public_key.to_public_key_pem(LineEnding::LF)?;
        Ok(Self {
            private_key_pem,
            public_key_pem,
        })
    }

    fn from_private_key_pem(pem: &str) -> Result<Self, IdentityError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem).map_err(rsa::pkcs8::Error::from)?;
        Self::from_private_key(&private_key)
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }
}

#[derive(Debug, Serialize)]
struct Claims {
    iss: &'static str,
    iat: i64,
    exp: i64,
    session_id: String,
}

/// Process-scoped JWT signer. Constructed once in `main`, which awaits the
/// cluster persistence attempt before the first request can be served; the
/// `OnceCell` then only ever serves reads on the request path.
pub struct IdentityManager {
    key: OnceCell<JwtKeyMaterial>,
}

impl IdentityManager {
    /// Generates a fresh keypair, then best-effort persists/loads it against
    /// the cluster. Outside a cluster this silently keeps the freshly
    /// generated key — cluster persistence is an optimization, not a
    /// correctness requirement.
    pub async fn init(namespace: &str) -> Result<Self, IdentityError> {
        let generated = JwtKeyMaterial::generate()?;
        let key = match k8s::persist_or_load(namespace, &generated).await {
            Ok(Some(loaded)) => loaded,
            Ok(None) => generated,
            Err(e) => {
                tracing::debug!(error = %e, "cluster identity persistence skipped");
                generated
            }
        };
        Ok(Self {
            key: OnceCell::new_with(Some(key)),
        })
    }

    pub fn public_key_pem(&self) -> &str {
        self.key.get().expect("identity manager initialized").public_key_pem()
    }

    /// Issues a short-lived RS256 token scoped to `session_id`.
    pub fn issue_token(&self, session_id: &str, now: i64) -> Result<String, IdentityError> {
        let key = self.key.get().expect("identity manager initialized");
        let claims = Claims {
            iss: ISSUER,
            iat: now,
            exp: now + TOKEN_TTL_SECS,
            session_id: session_id.to_string(),
        };
        let token = encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &EncodingKey::from_rsa_pem(key.private_key_pem.as_bytes())?,
        )?;
        Ok(token)
    }
}
