use std::{fmt, sync::Arc};

use base64::{prelude::BASE64_STANDARD, Engine};
use libxml::{tree::Node, xpath::Context};
use time::{format_description::well_known::Iso8601, Duration, OffsetDateTime};
use tracing::{debug, warn};

use crate::{
    assertion::Subject,
    attributes::AttributeMap,
    replay::ReplayCache,
    signature::{SignatureEngine, TrustStore},
    utils::{decode_xml_base64, find_value, format_instant, saml_context, single_node},
    xml::{children_named, id_attribute, is_element, parse_document, root_element, Element},
    SamlError, SamlResult, DS_NS, NAME_ID_FORMAT_UNSPECIFIED, SAMLP_NS, SAML_NS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Success,
    Requester,
    Responder,
    VersionMismatch,
    AuthnFailed,
    RequestDenied,
    UnknownPrincipal,
}

impl StatusCode {
    const ALL: [StatusCode; 7] = [
        StatusCode::Success,
        StatusCode::Requester,
        StatusCode::Responder,
        StatusCode::VersionMismatch,
        StatusCode::AuthnFailed,
        StatusCode::RequestDenied,
        StatusCode::UnknownPrincipal,
    ];

    pub fn uri(&self) -> &'static str {
        match self {
            StatusCode::Success => "urn:oasis:names:tc:SAML:2.0:status:Success",
            StatusCode::Requester => "urn:oasis:names:tc:SAML:2.0:status:Requester",
            StatusCode::Responder => "urn:oasis:names:tc:SAML:2.0:status:Responder",
            StatusCode::VersionMismatch => "urn:oasis:names:tc:SAML:2.0:status:VersionMismatch",
            StatusCode::AuthnFailed => "urn:oasis:names:tc:SAML:2.0:status:AuthnFailed",
            StatusCode::RequestDenied => "urn:oasis:names:tc:SAML:2.0:status:RequestDenied",
            StatusCode::UnknownPrincipal => "urn:oasis:names:tc:SAML:2.0:status:UnknownPrincipal",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.uri() == uri)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub sub_code: Option<StatusCode>,
    pub message: Option<String>,
}

impl Status {
    pub fn success() -> Self {
        Status {
            code: StatusCode::Success,
            sub_code: None,
            message: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == StatusCode::Success
    }

    fn to_element(&self) -> Element {
        let mut code = Element::new("samlp:StatusCode").with_attribute("Value", self.code.uri());
        if let Some(sub_code) = self.sub_code {
            code = code
                .with_child(Element::new("samlp:StatusCode").with_attribute("Value", sub_code.uri()));
        }
        let mut status = Element::new("samlp:Status").with_child(code);
        if let Some(message) = &self.message {
            status = status.with_child(Element::new("samlp:StatusMessage").with_text(message.clone()));
        }
        status
    }
}

/// An unsigned `<samlp:Response>`.
#[derive(Debug, Clone)]
pub struct ResponseDocument {
    pub id: String,
    pub issuer: String,
    pub issue_instant: OffsetDateTime,
    pub destination: Option<String>,
    pub in_response_to: Option<String>,
    pub status: Status,
    pub assertion: Option<Element>,
}

impl ResponseDocument {
    pub fn to_element(&self) -> SamlResult<Element> {
        let mut response = Element::new("samlp:Response")
            .with_namespace(Some("samlp"), SAMLP_NS)
            .with_namespace(Some("saml"), SAML_NS)
            .with_attribute("ID", self.id.clone())
            .with_attribute("Version", "2.0")
            .with_attribute("IssueInstant", format_instant(self.issue_instant)?);
        if let Some(destination) = &self.destination {
            response.set_attribute("Destination", destination.clone());
        }
        if let Some(request_id) = &self.in_response_to {
            response.set_attribute("InResponseTo", request_id.clone());
        }
        response = response
            .with_child(Element::new("saml:Issuer").with_text(self.issuer.clone()))
            .with_child(self.status.to_element());
        if let Some(assertion) = &self.assertion {
            response = response.with_child(assertion.clone());
        }
        Ok(response)
    }
}

/// A finished Response, ready to be posted to the SP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedResponse {
    pub response_id: String,
    pub in_response_to: Option<String>,
    pub destination: Option<String>,
    pub assertion_id: Option<String>,
    pub status: Status,
    pub xml: String,
}

impl SignedResponse {
    /// The `SAMLResponse` form value of the HTTP-POST binding.
    pub fn encode_post(&self) -> String {
        BASE64_STANDARD.encode(self.xml.as_bytes())
    }
}

pub fn decode_response(input: &str) -> SamlResult<Vec<u8>> {
    decode_xml_base64(input).map_err(|e| SamlError::InvalidResponse(format!("base64: {e}")))
}

pub fn extract_response_issuer(input: &[u8]) -> SamlResult<String> {
    let document = parse_document(input)?;
    let mut context = saml_context(&document)?;
    find_value(&mut context, "//saml2p:Response/saml2:Issuer/text()", None)
        .ok_or_else(|| SamlError::InvalidResponse("missing Issuer".into()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedResponse {
    pub response_id: String,
    pub issuer: String,
    pub in_response_to: Option<String>,
    pub subject: Subject,
    pub attributes: AttributeMap,
    pub assertion_id: String,
    pub session_index: Option<String>,
}

/// SP-side validation of a Response issued by a trusted IdP.
#[derive(Debug)]
pub struct ResponseValidator {
    engine: SignatureEngine,
    trust: TrustStore,
    audience: String,
    clock_skew: Duration,
    recipient: Option<String>,
    replay: Option<Arc<ReplayCache>>,
}

impl ResponseValidator {
    pub fn new(trust: TrustStore, audience: &str) -> Self {
        ResponseValidator {
            engine: SignatureEngine::default(),
            trust,
            audience: audience.into(),
            clock_skew: Duration::seconds(60),
            recipient: None,
            replay: None,
        }
    }

    pub fn engine(self, engine: SignatureEngine) -> Self {
        ResponseValidator { engine, ..self }
    }

    pub fn clock_skew(self, clock_skew: Duration) -> Self {
        ResponseValidator { clock_skew, ..self }
    }

    /// The SP's own assertion consumer URL. When set, a Response Destination
    /// must match it and the subject confirmation must name it as Recipient.
    pub fn recipient(self, acs_url: &str) -> Self {
        ResponseValidator {
            recipient: Some(acs_url.into()),
            ..self
        }
    }

    /// Refuses an assertion ID already accepted before its expiry.
    pub fn replay_cache(self, replay: Arc<ReplayCache>) -> Self {
        ResponseValidator {
            replay: Some(replay),
            ..self
        }
    }

    pub fn validate(
        &self,
        input: &[u8],
        expected_in_response_to: Option<&str>,
        now: OffsetDateTime,
    ) -> SamlResult<ValidatedResponse> {
        let document = parse_document(input)?;
        let root = root_element(&document)?;
        if !is_element(&root, SAMLP_NS, "Response") {
            return Err(SamlError::InvalidResponse(format!(
                "root element is {}",
                root.get_name()
            )));
        }
        let response_id = id_attribute(&root)
            .ok_or_else(|| SamlError::InvalidResponse("missing ID".into()))?;
        if !children_named(&root, DS_NS, "Signature").is_empty() {
            self.engine
                .verify_document(&document, &response_id, &self.trust, now)?;
        }

        let in_response_to = root.get_property_no_ns("InResponseTo");
        if let Some(expected) = expected_in_response_to {
            if in_response_to.as_deref() != Some(expected) {
                return Err(SamlError::InvalidResponse(format!(
                    "InResponseTo {} does not answer {expected}",
                    in_response_to.unwrap_or_default()
                )));
            }
        }
        if let (Some(expected), Some(destination)) =
            (&self.recipient, root.get_property_no_ns("Destination"))
        {
            if destination != *expected {
                return Err(SamlError::InvalidResponse(format!(
                    "response is destined to {destination}"
                )));
            }
        }

        let mut context = saml_context(&document)?;

        let status = find_value(
            &mut context,
            "/saml2p:Response/saml2p:Status/saml2p:StatusCode/@Value",
            None,
        )
        .ok_or_else(|| SamlError::InvalidResponse("missing StatusCode".into()))?;
        if StatusCode::from_uri(&status) != Some(StatusCode::Success) {
            let sub_status = find_value(
                &mut context,
                "/saml2p:Response/saml2p:Status/saml2p:StatusCode/saml2p:StatusCode/@Value",
                None,
            );
            return Err(SamlError::StatusNotSuccess(match sub_status {
                Some(sub_status) => format!("{status} ({sub_status})"),
                None => status,
            }));
        }

        let assertions = children_named(&root, SAML_NS, "Assertion");
        let assertion_id = match assertions.as_slice() {
            [assertion] => id_attribute(assertion)
                .ok_or_else(|| SamlError::InvalidAssertion("assertion has no ID".into()))?,
            _ => {
                return Err(SamlError::InvalidAssertion(format!(
                    "expected exactly one assertion, found {}",
                    assertions.len()
                )))
            }
        };
        self.engine
            .verify_document(&document, &assertion_id, &self.trust, now)?;

        // The assertion read below must be the one whose signature was checked.
        let all_assertions = context
            .evaluate("//saml2:Assertion")
            .map_err(|_| SamlError::InvalidAssertion("assertion lookup failed".into()))?
            .get_nodes_as_vec();
        let assertion = single_node(all_assertions, "assertion")?;
        if assertion.get_attribute("ID").as_deref() != Some(assertion_id.as_str()) {
            warn!(verified = %assertion_id, "assertion selected for reading was not the verified one");
            return Err(SamlError::InvalidAssertion(
                "assertion does not match the verified signature".into(),
            ));
        }

        let expires_at = self.check_conditions(&mut context, &assertion, now)?;
        self.check_confirmation(&mut context, &assertion, expected_in_response_to, now)?;

        let assertion_issuer = find_value(&mut context, "saml2:Issuer/text()", Some(&assertion))
            .ok_or_else(|| SamlError::InvalidAssertion("missing Issuer".into()))?;
        if let Some(response_issuer) =
            find_value(&mut context, "/saml2p:Response/saml2:Issuer/text()", None)
        {
            if response_issuer != assertion_issuer {
                return Err(SamlError::InvalidResponse(format!(
                    "response issued by {response_issuer} carries an assertion from {assertion_issuer}"
                )));
            }
        }

        let name_id = find_value(&mut context, "saml2:Subject/saml2:NameID/text()", Some(&assertion))
            .ok_or_else(|| SamlError::InvalidAssertion("missing NameID".into()))?;
        let format = find_value(&mut context, "saml2:Subject/saml2:NameID/@Format", Some(&assertion))
            .unwrap_or_else(|| NAME_ID_FORMAT_UNSPECIFIED.to_string());

        let attributes = read_attributes(&mut context, &assertion)?;
        let session_index = find_value(
            &mut context,
            "saml2:AuthnStatement/@SessionIndex",
            Some(&assertion),
        );

        if let Some(replay) = &self.replay {
            let expires_at = expires_at.ok_or_else(|| {
                SamlError::InvalidAssertion("assertion without NotOnOrAfter".into())
            })?;
            if !replay.observe_at(&assertion_id, expires_at + self.clock_skew, now) {
                return Err(SamlError::ReplayDetected(assertion_id));
            }
        }

        debug!(response = %response_id, assertion = %assertion_id, "validated response");

        Ok(ValidatedResponse {
            response_id,
            issuer: assertion_issuer,
            in_response_to,
            subject: Subject { name_id, format },
            attributes,
            assertion_id,
            session_index,
        })
    }

    /// Checks the assertion Conditions, returning its NotOnOrAfter.
    fn check_conditions(
        &self,
        context: &mut Context,
        assertion: &Node,
        now: OffsetDateTime,
    ) -> SamlResult<Option<OffsetDateTime>> {
        let conditions = context
            .findnodes("saml2:Conditions", Some(assertion))
            .map_err(|_| SamlError::InvalidAssertion("conditions lookup failed".into()))?;
        let conditions = single_node(conditions, "Conditions")?;

        if let Some(not_before) = find_value(context, "@NotBefore", Some(&conditions)) {
            if now + self.clock_skew < parse_instant(&not_before)? {
                return Err(SamlError::ConditionNotMet(format!(
                    "assertion not valid before {not_before}"
                )));
            }
        }

        let not_on_or_after = find_value(context, "@NotOnOrAfter", Some(&conditions))
            .map(|value| parse_instant(&value).map(|instant| (value, instant)))
            .transpose()?;
        if let Some((value, instant)) = &not_on_or_after {
            if now - self.clock_skew >= *instant {
                return Err(SamlError::ConditionNotMet(format!(
                    "assertion expired at {value}"
                )));
            }
        }

        let audiences = context
            .findnodes(
                "saml2:AudienceRestriction/saml2:Audience",
                Some(&conditions),
            )
            .map_err(|_| SamlError::InvalidAssertion("audience lookup failed".into()))?;
        if !audiences.is_empty()
            && !audiences
                .iter()
                .any(|audience| audience.get_content().trim() == self.audience)
        {
            return Err(SamlError::InvalidAudience(format!(
                "assertion is not addressed to {}",
                self.audience
            )));
        }

        Ok(not_on_or_after.map(|(_, instant)| instant))
    }

    fn check_confirmation(
        &self,
        context: &mut Context,
        assertion: &Node,
        expected_in_response_to: Option<&str>,
        now: OffsetDateTime,
    ) -> SamlResult<()> {
        let data = "saml2:Subject/saml2:SubjectConfirmation/saml2:SubjectConfirmationData";

        if let Some(not_on_or_after) =
            find_value(context, &format!("{data}/@NotOnOrAfter"), Some(assertion))
        {
            if now - self.clock_skew >= parse_instant(&not_on_or_after)? {
                return Err(SamlError::ConditionNotMet(format!(
                    "subject confirmation expired at {not_on_or_after}"
                )));
            }
        }

        if let Some(expected) = &self.recipient {
            let recipient = find_value(context, &format!("{data}/@Recipient"), Some(assertion));
            if recipient.as_deref() != Some(expected.as_str()) {
                return Err(SamlError::InvalidAssertion(format!(
                    "subject confirmed for recipient {}, expected {expected}",
                    recipient.unwrap_or_default()
                )));
            }
        }

        let confirmed = find_value(context, &format!("{data}/@InResponseTo"), Some(assertion));
        if let (Some(expected), Some(confirmed)) = (expected_in_response_to, confirmed) {
            if confirmed != expected {
                return Err(SamlError::InvalidAssertion(format!(
                    "subject confirmed for {confirmed}, expected {expected}"
                )));
            }
        }

        Ok(())
    }
}

fn read_attributes(context: &mut Context, assertion: &Node) -> SamlResult<AttributeMap> {
    let nodes = context
        .findnodes("saml2:AttributeStatement/saml2:Attribute", Some(assertion))
        .map_err(|_| SamlError::InvalidAssertion("attribute lookup failed".into()))?;

    let mut attributes = AttributeMap::new();
    for node in nodes {
        let name = node
            .get_attribute("Name")
            .ok_or_else(|| SamlError::InvalidAssertion("attribute without Name".into()))?;
        let values = context
            .findnodes("saml2:AttributeValue", Some(&node))
            .map_err(|_| SamlError::InvalidAssertion("attribute value lookup failed".into()))?
            .iter()
            .map(|value| value.get_content())
            .collect();
        attributes.insert(name, values);
    }
    Ok(attributes)
}

fn parse_instant(value: &str) -> SamlResult<OffsetDateTime> {
    OffsetDateTime::parse(value, &Iso8601::DEFAULT)
        .map_err(|e| SamlError::InvalidAssertion(format!("instant {value}: {e}")))
}
