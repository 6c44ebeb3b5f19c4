//! SAML 2.0 identity-provider core: attribute resolution, assertion issuance,
//! XML signatures and the response protocol flow.

mod assertion;
mod attributes;
mod authn_request;
mod c14n;
mod config;
mod error;
mod flow;
mod idp_metadata;
mod replay;
mod response;
mod signature;
mod sp_metadata;
mod utils;
mod xml;

pub use assertion::{Assertion, AssertionBuilder, AuthnContext, Subject, ValidityWindow};
pub use attributes::{friendly_name, AttributeFilter, AttributeMap, AttributeResolver, ResolvedIdentity};
pub use authn_request::{
    decode_post_request, decode_redirect_request, parse_authn_request, read_authn_request,
    AuthnRequest,
    AuthnRequestBuilder, ProtocolBinding,
};
pub use c14n::{canonicalize, CanonicalizationMethod};
pub use config::{
    ConfigProvider, IdentityRecord, IdpConfig, NameIdPolicy, ServiceProvider,
    ServiceProviderConfig, StaticConfig,
};
pub use error::{SamlError, SamlResult};
pub use flow::{FlowOutcome, FlowState, IdentityProvider, ReceivedRequest};
pub use idp_metadata::IdpMetadataBuilder;
pub use replay::{ReplayCache, SweeperHandle};
pub use response::{
    decode_response, extract_response_issuer, ResponseDocument, ResponseValidator, SignedResponse,
    Status, StatusCode, ValidatedResponse,
};
pub use signature::{
    DigestAlgorithm, SignatureAlgorithm, SignatureEngine, SignatureOptions, SignedDocument,
    SigningKey, TrustStore, VerifiedSignature,
};
pub use sp_metadata::parse_sp_metadata;
pub use xml::{parse_document, Element, QName, XmlNode};

use time::format_description::well_known::iso8601::{self, TimePrecision};

pub const SAMLP_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
pub const SAML_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const MD_NS: &str = "urn:oasis:names:tc:SAML:2.0:metadata";
pub const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";

pub const NAME_ID_FORMAT_EMAIL_ADDRESS: &str =
    "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";
pub const NAME_ID_FORMAT_UNSPECIFIED: &str =
    "urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified";
pub const NAME_ID_FORMAT_PERSISTENT: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:persistent";
pub const NAME_ID_FORMAT_ENTITY: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:entity";

pub const AUTHN_CONTEXT_PASSWORD_PROTECTED: &str =
    "urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport";

// xs:dateTime isn't actually ISO8601, because implementors often don't support higher precisions
// or six digit years.
pub const DATE_TIME_FORMAT: iso8601::Iso8601<
    {
        iso8601::Config::DEFAULT
            .set_year_is_six_digits(false)
            .set_time_precision(TimePrecision::Second {
                decimal_digits: None,
            })
            .encode()
    },
> = iso8601::Iso8601;
