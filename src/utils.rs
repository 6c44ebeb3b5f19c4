use base64::{prelude::BASE64_STANDARD, Engine};
use libxml::{tree::Node, xpath::Context};
use rand::RngCore;
use time::{Duration, OffsetDateTime, UtcOffset};

use crate::{SamlError, SamlResult, DATE_TIME_FORMAT, DS_NS, MD_NS, SAMLP_NS, SAML_NS};

/// 128 random bits, hex encoded behind a leading underscore so the value is a
/// valid xs:ID (which may not start with a digit).
pub fn random_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("_{}", hex::encode(bytes))
}

pub fn single_node(nodes: Vec<Node>, what: &str) -> SamlResult<Node> {
    let mut nodes = nodes;
    if nodes.len() != 1 {
        return Err(SamlError::InvalidAssertion(format!(
            "expected exactly one {what}, found {}",
            nodes.len()
        )));
    }
    Ok(nodes.remove(0))
}

pub fn decode_xml_base64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let stripped = input.replace([' ', '\n', '\r', '\t'], "");
    BASE64_STANDARD.decode(stripped)
}

pub fn saml_context(document: &libxml::tree::Document) -> SamlResult<Context> {
    let context = Context::new(document)
        .map_err(|_| SamlError::InvalidXml("failed to create XPath context".into()))?;
    for (prefix, href) in [
        ("saml2p", SAMLP_NS),
        ("saml2", SAML_NS),
        ("md", MD_NS),
        ("ds", DS_NS),
    ] {
        context
            .register_namespace(prefix, href)
            .map_err(|_| SamlError::InvalidXml(format!("failed to register {prefix}")))?;
    }
    Ok(context)
}

/// `findvalue` yields an empty string when nothing matches.
pub fn find_value(context: &mut Context, xpath: &str, node: Option<&Node>) -> Option<String> {
    context
        .findvalue(xpath, node)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn format_instant(instant: OffsetDateTime) -> SamlResult<String> {
    instant
        .to_offset(UtcOffset::UTC)
        .format(&DATE_TIME_FORMAT)
        .map_err(|e| SamlError::Serialization(e.to_string()))
}

/// Drops sub-second precision, which the wire format cannot carry.
pub fn whole_seconds(instant: OffsetDateTime) -> OffsetDateTime {
    instant - Duration::nanoseconds(i64::from(instant.nanosecond()))
}

pub fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}
