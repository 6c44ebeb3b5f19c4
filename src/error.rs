use thiserror::Error;

use crate::response::{Status, StatusCode};

pub type SamlResult<T> = Result<T, SamlError>;

#[derive(Debug, Error)]
pub enum SamlError {
    #[error("unknown issuer: {0}")]
    UnknownIssuer(String),

    #[error("unknown identity: {0}")]
    UnknownIdentity(String),

    #[error("authentication failed for {0}")]
    AuthnFailed(String),

    #[error("invalid audience: {0}")]
    InvalidAudience(String),

    #[error("replay detected for ID {0}")]
    ReplayDetected(String),

    #[error("signature mismatch: {0}")]
    SignatureMismatch(String),

    #[error("untrusted certificate")]
    UntrustedCertificate,

    #[error("certificate is expired or not yet valid")]
    ExpiredCertificate,

    #[error("clock skew exceeded: {0}")]
    ClockSkewExceeded(String),

    #[error("algorithm is denied: {0}")]
    DeniedAlgorithm(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("missing signature on {0}")]
    MissingSignature(String),

    #[error("assertion consumer service {actual} is not registered for {entity_id}")]
    AcsUrlMismatch { entity_id: String, actual: String },

    #[error("invalid XML: {0}")]
    InvalidXml(String),

    #[error("malformed XML: {0}")]
    MalformedXml(String),

    #[error("invalid AuthnRequest: {0}")]
    InvalidRequest(String),

    #[error("invalid Response: {0}")]
    InvalidResponse(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid assertion: {0}")]
    InvalidAssertion(String),

    #[error("condition not met: {0}")]
    ConditionNotMet(String),

    #[error("response status is {0}")]
    StatusNotSuccess(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("key error: {0}")]
    Key(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Crypto(#[from] openssl::error::ErrorStack),
}

impl SamlError {
    /// Status reported to the SP when this error ends a flow.
    pub fn status(&self) -> Status {
        let (code, sub) = match self {
            SamlError::UnknownIdentity(_) | SamlError::AuthnFailed(_) => {
                (StatusCode::Responder, Some(StatusCode::AuthnFailed))
            }
            SamlError::ReplayDetected(_)
            | SamlError::ClockSkewExceeded(_)
            | SamlError::SignatureMismatch(_)
            | SamlError::UntrustedCertificate
            | SamlError::ExpiredCertificate
            | SamlError::DeniedAlgorithm(_)
            | SamlError::MissingSignature(_) => {
                (StatusCode::Requester, Some(StatusCode::RequestDenied))
            }
            SamlError::UnknownIssuer(_)
            | SamlError::InvalidAudience(_)
            | SamlError::AcsUrlMismatch { .. }
            | SamlError::InvalidRequest(_)
            | SamlError::InvalidXml(_)
            | SamlError::MalformedXml(_)
            | SamlError::UnsupportedAlgorithm(_) => (StatusCode::Requester, None),
            _ => (StatusCode::Responder, None),
        };
        Status {
            code,
            sub_code: sub,
            message: Some(self.to_string()),
        }
    }
}
