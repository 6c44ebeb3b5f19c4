use std::{
    fmt::Display,
    io::{self, Read},
    str::FromStr,
};

use base64::{prelude::BASE64_STANDARD, Engine};
use deflate::deflate_bytes;
use flate2::read::DeflateDecoder;
use libxml::tree::Document;
use time::{format_description::well_known::Iso8601, OffsetDateTime};
use tracing::debug;

use crate::{
    signature::{SignatureEngine, SignatureOptions, SigningKey},
    utils::{decode_xml_base64, find_value, format_instant, saml_context},
    xml::{children_named, is_element, parse_document, root_element, Element},
    SamlError, SamlResult, DS_NS, NAME_ID_FORMAT_ENTITY, SAMLP_NS, SAML_NS,
};

/// Upper bound on an inflated HTTP-Redirect request.
const MAX_INFLATED_REQUEST: u64 = 256 * 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolBinding {
    #[default]
    Post,
    Redirect,
}

impl Display for ProtocolBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ProtocolBinding::Post => write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"),
            ProtocolBinding::Redirect => {
                write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect")
            }
        }
    }
}

impl FromStr for ProtocolBinding {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" => Ok(ProtocolBinding::Post),
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" => Ok(ProtocolBinding::Redirect),
            _ => Err(()),
        }
    }
}

/// Builds SP-side AuthnRequests, mostly useful to drive an IdP in tests.
#[derive(Default)]
pub struct AuthnRequestBuilder {
    id: Option<String>,
    issue_instant: Option<OffsetDateTime>,
    issuer: Option<String>,
    destination: Option<String>,
    protocol_binding: ProtocolBinding,
    consumer_url: Option<String>,
    name_format: Option<String>,
    deny_create: bool,
    subject: Option<String>,
}

impl AuthnRequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(self, id: &str) -> Self {
        AuthnRequestBuilder {
            id: Some(id.into()),
            ..self
        }
    }

    pub fn issue_instant(self, instant: OffsetDateTime) -> Self {
        AuthnRequestBuilder {
            issue_instant: Some(instant),
            ..self
        }
    }

    pub fn issuer(self, issuer: &str) -> Self {
        AuthnRequestBuilder {
            issuer: Some(issuer.into()),
            ..self
        }
    }

    pub fn destination(self, destination: &str) -> Self {
        AuthnRequestBuilder {
            destination: Some(destination.into()),
            ..self
        }
    }

    pub fn protocol_binding(self, binding: ProtocolBinding) -> Self {
        AuthnRequestBuilder {
            protocol_binding: binding,
            ..self
        }
    }

    pub fn consumer_url(self, url: &str) -> Self {
        AuthnRequestBuilder {
            consumer_url: Some(url.into()),
            ..self
        }
    }

    pub fn name_format(self, format: &str) -> Self {
        AuthnRequestBuilder {
            name_format: Some(format.into()),
            ..self
        }
    }

    pub fn allow_create(self, allow: bool) -> Self {
        AuthnRequestBuilder {
            deny_create: !allow,
            ..self
        }
    }

    pub fn subject(self, subject: &str) -> Self {
        AuthnRequestBuilder {
            subject: Some(subject.into()),
            ..self
        }
    }

    pub fn to_element(self) -> SamlResult<Element> {
        let required = |value: Option<String>, what: &str| {
            value.ok_or_else(|| SamlError::InvalidRequest(format!("{what} is required")))
        };
        let name_format = required(self.name_format, "name format")?;
        let issue_instant = self
            .issue_instant
            .ok_or_else(|| SamlError::InvalidRequest("IssueInstant is required".into()))?;

        let mut request = Element::new("samlp:AuthnRequest")
            .with_namespace(Some("samlp"), SAMLP_NS)
            .with_namespace(Some("saml"), SAML_NS)
            .with_attribute("ID", required(self.id, "ID")?)
            .with_attribute("Version", "2.0")
            .with_attribute("IssueInstant", format_instant(issue_instant)?)
            .with_attribute("Destination", required(self.destination, "Destination")?)
            .with_attribute("ProtocolBinding", self.protocol_binding.to_string())
            .with_attribute(
                "AssertionConsumerServiceURL",
                required(self.consumer_url, "consumer URL")?,
            )
            .with_child(
                Element::new("saml:Issuer")
                    .with_attribute("Format", NAME_ID_FORMAT_ENTITY)
                    .with_text(required(self.issuer, "Issuer")?),
            );
        if let Some(subject) = self.subject {
            request = request.with_child(
                Element::new("saml:Subject").with_child(
                    Element::new("saml:NameID")
                        .with_attribute("Format", name_format.as_str())
                        .with_text(subject),
                ),
            );
        }
        Ok(request.with_child(
            Element::new("samlp:NameIDPolicy")
                .with_attribute("Format", name_format)
                .with_attribute("AllowCreate", (!self.deny_create).to_string()),
        ))
    }

    pub fn build(self) -> SamlResult<String> {
        Ok(self.to_element()?.to_document())
    }

    /// The request with an enveloped signature, as an SP that signs its
    /// requests would send it.
    pub fn build_signed(
        self,
        engine: &SignatureEngine,
        key: &SigningKey,
        options: &SignatureOptions,
    ) -> SamlResult<String> {
        Ok(engine.sign(self.to_element()?, key, options)?.to_document())
    }

    /// Deflated and base64 encoded for the HTTP-Redirect binding. URL
    /// encoding is left to the caller.
    pub fn build_and_encode(self) -> SamlResult<String> {
        let xml = self.build()?;
        let compressed = deflate_bytes(xml.as_bytes());
        Ok(BASE64_STANDARD.encode(compressed))
    }
}

/// The fields of an inbound AuthnRequest the IdP acts on.
#[derive(Debug, Clone)]
pub struct AuthnRequest {
    pub id: String,
    pub issue_instant: OffsetDateTime,
    pub issuer: String,
    pub acs_url: Option<String>,
    pub destination: Option<String>,
    pub protocol_binding: Option<ProtocolBinding>,
    pub name_id_format: Option<String>,
    /// Whether the request carries an enveloped signature. Checking it is the
    /// flow's job, since the trusted certificate depends on the issuer.
    pub signed: bool,
}

/// Decodes a `SAMLRequest` received over HTTP-POST.
pub fn decode_post_request(input: &str) -> SamlResult<Vec<u8>> {
    decode_xml_base64(input).map_err(|e| SamlError::InvalidRequest(format!("base64: {e}")))
}

/// Decodes a `SAMLRequest` received over HTTP-Redirect (already URL decoded).
pub fn decode_redirect_request(input: &str) -> SamlResult<Vec<u8>> {
    let compressed = decode_post_request(input)?;
    let mut inflated = Vec::new();
    DeflateDecoder::new(compressed.as_slice())
        .take(MAX_INFLATED_REQUEST + 1)
        .read_to_end(&mut inflated)
        .map_err(|e: io::Error| SamlError::InvalidRequest(format!("inflate: {e}")))?;
    if inflated.len() as u64 > MAX_INFLATED_REQUEST {
        return Err(SamlError::InvalidRequest("inflated request is too large".into()));
    }
    Ok(inflated)
}

pub fn parse_authn_request(input: &[u8]) -> SamlResult<AuthnRequest> {
    read_authn_request(&parse_document(input)?)
}

/// Reads the fields of an AuthnRequest from an already parsed document.
pub fn read_authn_request(document: &Document) -> SamlResult<AuthnRequest> {
    let root = root_element(document)?;
    if !is_element(&root, SAMLP_NS, "AuthnRequest") {
        return Err(SamlError::InvalidRequest(format!(
            "root element is {}",
            root.get_name()
        )));
    }
    let mut context = saml_context(document)?;

    let id = find_value(&mut context, "/saml2p:AuthnRequest/@ID", None)
        .ok_or_else(|| SamlError::InvalidRequest("missing ID".into()))?;
    let version = find_value(&mut context, "/saml2p:AuthnRequest/@Version", None);
    if version.as_deref() != Some("2.0") {
        return Err(SamlError::InvalidRequest(format!(
            "unsupported version {}",
            version.unwrap_or_default()
        )));
    }
    let issue_instant = find_value(&mut context, "/saml2p:AuthnRequest/@IssueInstant", None)
        .ok_or_else(|| SamlError::InvalidRequest("missing IssueInstant".into()))
        .and_then(|instant| {
            OffsetDateTime::parse(&instant, &Iso8601::DEFAULT)
                .map_err(|e| SamlError::InvalidRequest(format!("IssueInstant: {e}")))
        })?;
    let issuer = find_value(&mut context, "/saml2p:AuthnRequest/saml2:Issuer/text()", None)
        .ok_or_else(|| SamlError::InvalidRequest("missing Issuer".into()))?;

    let acs_url = find_value(
        &mut context,
        "/saml2p:AuthnRequest/@AssertionConsumerServiceURL",
        None,
    );
    let destination = find_value(&mut context, "/saml2p:AuthnRequest/@Destination", None);
    let protocol_binding = find_value(&mut context, "/saml2p:AuthnRequest/@ProtocolBinding", None)
        .and_then(|binding| binding.parse().ok());
    let name_id_format = find_value(
        &mut context,
        "/saml2p:AuthnRequest/saml2p:NameIDPolicy/@Format",
        None,
    );
    let signed = !children_named(&root, DS_NS, "Signature").is_empty();

    debug!(id = %id, issuer = %issuer, signed, "parsed AuthnRequest");

    Ok(AuthnRequest {
        id,
        issue_instant,
        issuer,
        acs_url,
        destination,
        protocol_binding,
        name_id_format,
        signed,
    })
}

#[cfg(test)]
mod tests {
    use crate::NAME_ID_FORMAT_EMAIL_ADDRESS;
    use time::macros::datetime;

    use super::*;

    fn builder() -> AuthnRequestBuilder {
        AuthnRequestBuilder::new()
            .id("_req1")
            .issue_instant(datetime!(2030-01-01 12:00:00 UTC))
            .issuer("https://sp.example")
            .destination("https://idp.example/sso")
            .consumer_url("https://sp.example/acs")
            .name_format(NAME_ID_FORMAT_EMAIL_ADDRESS)
    }

    #[test]
    fn can_build_and_parse_authn_request() {
        let xml = builder().subject("sally@example.org").build().unwrap();
        let request = parse_authn_request(xml.as_bytes()).unwrap();

        assert_eq!(request.id, "_req1");
        assert_eq!(request.issuer, "https://sp.example");
        assert_eq!(request.issue_instant, datetime!(2030-01-01 12:00:00 UTC));
        assert_eq!(request.acs_url.as_deref(), Some("https://sp.example/acs"));
        assert_eq!(request.protocol_binding, Some(ProtocolBinding::Post));
        assert_eq!(
            request.name_id_format.as_deref(),
            Some(NAME_ID_FORMAT_EMAIL_ADDRESS)
        );
        assert!(!request.signed);
    }

    #[test]
    fn missing_fields_fail_the_build() {
        let err = AuthnRequestBuilder::new().id("_x").build().unwrap_err();
        assert!(matches!(err, SamlError::InvalidRequest(_)));
    }

    #[test]
    fn subject_precedes_name_id_policy() {
        let element = builder().subject("sally@example.org").to_element().unwrap();
        let names: Vec<_> = element
            .child_elements()
            .map(|child| child.name.local.as_str())
            .collect();
        assert_eq!(names, ["Issuer", "Subject", "NameIDPolicy"]);
    }

    #[test]
    fn signed_request_is_flagged() {
        const SP_KEY: &[u8] = include_bytes!("../static/sp.key");
        const SP_CERT: &[u8] = include_bytes!("../static/sp.crt");
        let key = SigningKey::from_pem(SP_KEY, SP_CERT).unwrap();
        let xml = builder()
            .build_signed(&SignatureEngine::default(), &key, &SignatureOptions::default())
            .unwrap();
        let request = parse_authn_request(xml.as_bytes()).unwrap();
        assert!(request.signed);
        assert_eq!(request.issuer, "https://sp.example");
    }

    #[test]
    fn redirect_binding_round_trips() {
        let encoded = builder().build_and_encode().unwrap();
        let decoded = decode_redirect_request(&encoded).unwrap();
        assert_eq!(parse_authn_request(&decoded).unwrap().id, "_req1");
    }

    #[test]
    fn post_binding_decodes_plain_base64() {
        let xml = builder().build().unwrap();
        let encoded = BASE64_STANDARD.encode(xml.as_bytes());
        assert_eq!(decode_post_request(&encoded).unwrap(), xml.as_bytes());
    }

    #[test]
    fn rejects_other_documents() {
        let err = parse_authn_request(
            br#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_r"/>"#,
        )
        .unwrap_err();
        assert!(matches!(err, SamlError::InvalidRequest(_)));
    }

    #[test]
    fn rejects_missing_issuer() {
        let err = parse_authn_request(
            br#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"
                ID="_r" Version="2.0" IssueInstant="2030-01-01T00:00:00Z"/>"#,
        )
        .unwrap_err();
        assert!(matches!(err, SamlError::InvalidRequest(_)));
    }
}
