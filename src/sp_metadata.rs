use openssl::x509::X509;
use tracing::debug;

use crate::{
    authn_request::ProtocolBinding,
    config::ServiceProvider,
    utils::{decode_xml_base64, find_value, saml_context},
    xml::parse_document,
    SamlError, SamlResult,
};

/// Reads an SP `EntityDescriptor` into a [`ServiceProvider`]. Only HTTP-POST
/// assertion consumer services are kept, the default one first.
pub fn parse_sp_metadata(input: &[u8]) -> SamlResult<ServiceProvider> {
    let document = parse_document(input)?;
    let mut context = saml_context(&document)?;

    let entity_id = find_value(&mut context, "/md:EntityDescriptor/@entityID", None)
        .ok_or_else(|| SamlError::InvalidMetadata("missing entityID".into()))?;

    let descriptor = "/md:EntityDescriptor/md:SPSSODescriptor";
    let acs_nodes = context
        .evaluate(&format!("{descriptor}/md:AssertionConsumerService"))
        .map_err(|_| SamlError::InvalidMetadata("AssertionConsumerService lookup failed".into()))?
        .get_nodes_as_vec();

    let mut endpoints = Vec::new();
    for node in acs_nodes {
        let binding = node
            .get_attribute("Binding")
            .ok_or_else(|| SamlError::InvalidMetadata("AssertionConsumerService without Binding".into()))?;
        if binding.parse::<ProtocolBinding>() != Ok(ProtocolBinding::Post) {
            continue;
        }
        let location = node
            .get_attribute("Location")
            .ok_or_else(|| SamlError::InvalidMetadata("AssertionConsumerService without Location".into()))?;
        let index = node
            .get_attribute("index")
            .and_then(|index| index.parse::<u32>().ok())
            .unwrap_or(u32::MAX);
        let is_default = node.get_attribute("isDefault").as_deref() == Some("true");
        endpoints.push((!is_default, index, location));
    }
    if endpoints.is_empty() {
        return Err(SamlError::InvalidMetadata(format!(
            "{entity_id} has no HTTP-POST assertion consumer service"
        )));
    }
    endpoints.sort_by_key(|(not_default, index, _)| (*not_default, *index));

    let signing_certificate = find_value(
        &mut context,
        &format!(
            "{descriptor}/md:KeyDescriptor[@use=\"signing\" or not(@use)]/ds:KeyInfo/ds:X509Data/ds:X509Certificate/text()"
        ),
        None,
    )
    .map(|encoded| -> SamlResult<Vec<u8>> {
        let der = decode_xml_base64(&encoded)
            .map_err(|e| SamlError::InvalidMetadata(format!("X509Certificate: {e}")))?;
        X509::from_der(&der)
            .map_err(|e| SamlError::InvalidMetadata(format!("X509Certificate: {e}")))?;
        Ok(der)
    })
    .transpose()?;

    let authn_requests_signed = matches!(
        find_value(&mut context, &format!("{descriptor}/@AuthnRequestsSigned"), None).as_deref(),
        Some("true" | "1")
    );
    if authn_requests_signed && signing_certificate.is_none() {
        return Err(SamlError::InvalidMetadata(format!(
            "{entity_id} signs requests but publishes no signing certificate"
        )));
    }

    debug!(entity_id = %entity_id, endpoints = endpoints.len(), "parsed SP metadata");

    Ok(ServiceProvider {
        entity_id,
        acs_urls: endpoints
            .into_iter()
            .map(|(_, _, location)| location)
            .collect(),
        signing_certificate,
        authn_requests_signed,
    })
}
