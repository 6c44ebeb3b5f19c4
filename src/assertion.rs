use time::{Duration, OffsetDateTime};

use crate::{
    attributes::{friendly_name, AttributeMap},
    utils::{format_instant, random_id, whole_seconds},
    xml::Element,
    SamlError, SamlResult, AUTHN_CONTEXT_PASSWORD_PROTECTED, SAML_NS,
};

const ATTRNAME_FORMAT_URI: &str = "urn:oasis:names:tc:SAML:2.0:attrname-format:uri";
const ATTRNAME_FORMAT_BASIC: &str = "urn:oasis:names:tc:SAML:2.0:attrname-format:basic";
const BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityWindow {
    pub validity: Duration,
    pub clock_skew: Duration,
}

impl Default for ValidityWindow {
    fn default() -> Self {
        ValidityWindow {
            validity: Duration::seconds(300),
            clock_skew: Duration::seconds(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthnContext {
    pub class_ref: String,
    /// When the user actually authenticated; defaults to the issue instant.
    pub authn_instant: Option<OffsetDateTime>,
    pub session_index: Option<String>,
}

impl Default for AuthnContext {
    fn default() -> Self {
        AuthnContext {
            class_ref: AUTHN_CONTEXT_PASSWORD_PROTECTED.to_string(),
            authn_instant: None,
            session_index: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub name_id: String,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    pub id: String,
    pub issuer: String,
    pub subject: Subject,
    pub issue_instant: OffsetDateTime,
    pub not_before: OffsetDateTime,
    pub not_on_or_after: OffsetDateTime,
    pub audiences: Vec<String>,
    pub attributes: AttributeMap,
    pub authn_instant: OffsetDateTime,
    pub authn_context_class: String,
    pub session_index: String,
    pub in_response_to: Option<String>,
    pub recipient: Option<String>,
}

impl Assertion {
    pub fn in_response_to(self, request_id: &str) -> Self {
        Assertion {
            in_response_to: Some(request_id.into()),
            ..self
        }
    }

    pub fn recipient(self, acs_url: &str) -> Self {
        Assertion {
            recipient: Some(acs_url.into()),
            ..self
        }
    }

    pub fn to_element(&self) -> SamlResult<Element> {
        let issue_instant = format_instant(self.issue_instant)?;
        let not_on_or_after = format_instant(self.not_on_or_after)?;

        let mut confirmation_data = Element::new("saml:SubjectConfirmationData")
            .with_attribute("NotOnOrAfter", not_on_or_after.clone());
        if let Some(recipient) = &self.recipient {
            confirmation_data.set_attribute("Recipient", recipient.clone());
        }
        if let Some(request_id) = &self.in_response_to {
            confirmation_data.set_attribute("InResponseTo", request_id.clone());
        }

        let subject = Element::new("saml:Subject")
            .with_child(
                Element::new("saml:NameID")
                    .with_attribute("Format", self.subject.format.clone())
                    .with_text(self.subject.name_id.clone()),
            )
            .with_child(
                Element::new("saml:SubjectConfirmation")
                    .with_attribute("Method", BEARER)
                    .with_child(confirmation_data),
            );

        let mut restriction = Element::new("saml:AudienceRestriction");
        for audience in &self.audiences {
            restriction = restriction.with_child(Element::new("saml:Audience").with_text(audience.clone()));
        }
        let conditions = Element::new("saml:Conditions")
            .with_attribute("NotBefore", format_instant(self.not_before)?)
            .with_attribute("NotOnOrAfter", not_on_or_after)
            .with_child(restriction);

        let authn_statement = Element::new("saml:AuthnStatement")
            .with_attribute("AuthnInstant", format_instant(self.authn_instant)?)
            .with_attribute("SessionIndex", self.session_index.clone())
            .with_child(
                Element::new("saml:AuthnContext").with_child(
                    Element::new("saml:AuthnContextClassRef")
                        .with_text(self.authn_context_class.clone()),
                ),
            );

        let mut assertion = Element::new("saml:Assertion")
            .with_namespace(Some("saml"), SAML_NS)
            .with_attribute("ID", self.id.clone())
            .with_attribute("Version", "2.0")
            .with_attribute("IssueInstant", issue_instant)
            .with_child(Element::new("saml:Issuer").with_text(self.issuer.clone()))
            .with_child(subject)
            .with_child(conditions)
            .with_child(authn_statement);

        if !self.attributes.is_empty() {
            let mut statement = Element::new("saml:AttributeStatement");
            for (name, values) in self.attributes.iter() {
                statement = statement.with_child(attribute_element(name, values));
            }
            assertion = assertion.with_child(statement);
        }

        Ok(assertion)
    }
}

fn attribute_element(name: &str, values: &[String]) -> Element {
    let format = if name.starts_with("urn:") {
        ATTRNAME_FORMAT_URI
    } else {
        ATTRNAME_FORMAT_BASIC
    };
    let mut attribute = Element::new("saml:Attribute")
        .with_attribute("Name", name)
        .with_attribute("NameFormat", format);
    if let Some(friendly) = friendly_name(name) {
        attribute.set_attribute("FriendlyName", friendly);
    }
    for value in values {
        attribute = attribute.with_child(Element::new("saml:AttributeValue").with_text(value.clone()));
    }
    attribute
}

pub struct AssertionBuilder {
    issuer: String,
}

impl AssertionBuilder {
    pub fn new(issuer: &str) -> Self {
        AssertionBuilder {
            issuer: issuer.into(),
        }
    }

    pub fn build(
        &self,
        subject: Subject,
        attributes: AttributeMap,
        audiences: &[String],
        window: ValidityWindow,
        authn_context: &AuthnContext,
        now: OffsetDateTime,
    ) -> SamlResult<Assertion> {
        if audiences.is_empty() || audiences.iter().any(|audience| audience.trim().is_empty()) {
            return Err(SamlError::InvalidAudience(
                "assertion needs at least one audience".into(),
            ));
        }
        let now = whole_seconds(now);

        Ok(Assertion {
            id: random_id(),
            issuer: self.issuer.clone(),
            subject,
            issue_instant: now,
            not_before: now - window.clock_skew,
            not_on_or_after: now + window.validity,
            audiences: audiences.to_vec(),
            attributes,
            authn_instant: authn_context.authn_instant.map_or(now, whole_seconds),
            authn_context_class: authn_context.class_ref.clone(),
            session_index: authn_context
                .session_index
                .clone()
                .unwrap_or_else(random_id),
            in_response_to: None,
            recipient: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        xml::{children_named, parse_document, root_element},
        NAME_ID_FORMAT_UNSPECIFIED,
    };
    use time::macros::datetime;

    fn subject() -> Subject {
        Subject {
            name_id: "user1".into(),
            format: NAME_ID_FORMAT_UNSPECIFIED.into(),
        }
    }

    fn attributes() -> AttributeMap {
        [
            ("urn:oid:2.5.4.42".to_string(), vec!["Sally".to_string()]),
            ("role".to_string(), vec!["a".to_string(), "b".to_string()]),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn builds_validity_window_around_now() {
        let now = datetime!(2030-01-01 12:00:00.250 UTC);
        let assertion = AssertionBuilder::new("https://idp.example")
            .build(
                subject(),
                attributes(),
                &["https://sp.example".to_string()],
                ValidityWindow::default(),
                &AuthnContext::default(),
                now,
            )
            .unwrap();

        assert_eq!(assertion.issue_instant, datetime!(2030-01-01 12:00:00 UTC));
        assert_eq!(assertion.not_before, datetime!(2030-01-01 11:59:00 UTC));
        assert_eq!(assertion.not_on_or_after, datetime!(2030-01-01 12:05:00 UTC));
        assert!(assertion.id.starts_with('_'));
        assert_ne!(assertion.id, assertion.session_index);
    }

    #[test]
    fn empty_audience_is_rejected() {
        let result = AssertionBuilder::new("https://idp.example").build(
            subject(),
            attributes(),
            &[],
            ValidityWindow::default(),
            &AuthnContext::default(),
            OffsetDateTime::now_utc(),
        );
        assert!(matches!(result, Err(SamlError::InvalidAudience(_))));
    }

    #[test]
    fn element_carries_statements() {
        let assertion = AssertionBuilder::new("https://idp.example")
            .build(
                subject(),
                attributes(),
                &["https://sp.example".to_string()],
                ValidityWindow::default(),
                &AuthnContext::default(),
                datetime!(2030-01-01 12:00:00 UTC),
            )
            .unwrap()
            .in_response_to("_req")
            .recipient("https://sp.example/acs");
        let element = assertion.to_element().unwrap();

        let names: Vec<_> = element
            .child_elements()
            .map(|child| child.name.local.as_str())
            .collect();
        assert_eq!(
            names,
            ["Issuer", "Subject", "Conditions", "AuthnStatement", "AttributeStatement"]
        );

        let document = parse_document(element.to_xml().as_bytes()).unwrap();
        let root = root_element(&document).unwrap();
        let conditions = children_named(&root, SAML_NS, "Conditions");
        assert_eq!(
            conditions[0].get_property_no_ns("NotOnOrAfter").as_deref(),
            Some("2030-01-01T12:05:00Z")
        );

        let statement = children_named(&root, SAML_NS, "AttributeStatement");
        let attributes = children_named(&statement[0], SAML_NS, "Attribute");
        assert_eq!(attributes.len(), 2);
        assert_eq!(
            attributes[0].get_property_no_ns("FriendlyName").as_deref(),
            Some("givenName")
        );
        assert_eq!(
            attributes[0].get_property_no_ns("NameFormat").as_deref(),
            Some(ATTRNAME_FORMAT_URI)
        );
        assert_eq!(
            attributes[1].get_property_no_ns("NameFormat").as_deref(),
            Some(ATTRNAME_FORMAT_BASIC)
        );
        assert_eq!(children_named(&attributes[1], SAML_NS, "AttributeValue").len(), 2);

        let xml = element.to_xml();
        assert!(xml.contains(r#"InResponseTo="_req""#));
        assert!(xml.contains(r#"Recipient="https://sp.example/acs""#));
    }
}
