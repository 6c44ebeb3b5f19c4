//! Enveloped XML signatures over libxml-canonicalized bytes.

use std::{cmp::Ordering, collections::HashSet, fmt};

use base64::{prelude::BASE64_STANDARD, Engine};
use libxml::tree::{Document, Node};
use openssl::{
    asn1::Asn1Time,
    hash::{hash, MessageDigest},
    memcmp,
    pkey::{PKey, Private},
    sign::{Signer, Verifier},
    x509::{X509Ref, X509},
};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::{
    c14n::{canonicalize, CanonicalizationMethod},
    utils::decode_xml_base64,
    xml::{
        children_named, find_by_id, id_attribute, parse_document, root_element, Element, XmlNode,
        XML_DECLARATION,
    },
    SamlError, SamlResult, DS_NS,
};

pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
const EXC_C14N_NS: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    RsaSha1,
    #[default]
    RsaSha256,
    RsaSha384,
    RsaSha512,
}

impl SignatureAlgorithm {
    pub fn uri(&self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaSha1 => "http://www.w3.org/2000/09/xmldsig#rsa-sha1",
            SignatureAlgorithm::RsaSha256 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
            SignatureAlgorithm::RsaSha384 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384",
            SignatureAlgorithm::RsaSha512 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        [
            Self::RsaSha1,
            Self::RsaSha256,
            Self::RsaSha384,
            Self::RsaSha512,
        ]
        .into_iter()
        .find(|alg| alg.uri() == uri)
    }

    fn message_digest(&self) -> MessageDigest {
        match self {
            SignatureAlgorithm::RsaSha1 => MessageDigest::sha1(),
            SignatureAlgorithm::RsaSha256 => MessageDigest::sha256(),
            SignatureAlgorithm::RsaSha384 => MessageDigest::sha384(),
            SignatureAlgorithm::RsaSha512 => MessageDigest::sha512(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha1,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn uri(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "http://www.w3.org/2000/09/xmldsig#sha1",
            DigestAlgorithm::Sha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
            DigestAlgorithm::Sha384 => "http://www.w3.org/2001/04/xmldsig-more#sha384",
            DigestAlgorithm::Sha512 => "http://www.w3.org/2001/04/xmlenc#sha512",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        [Self::Sha1, Self::Sha256, Self::Sha384, Self::Sha512]
            .into_iter()
            .find(|alg| alg.uri() == uri)
    }

    fn message_digest(&self) -> MessageDigest {
        match self {
            DigestAlgorithm::Sha1 => MessageDigest::sha1(),
            DigestAlgorithm::Sha256 => MessageDigest::sha256(),
            DigestAlgorithm::Sha384 => MessageDigest::sha384(),
            DigestAlgorithm::Sha512 => MessageDigest::sha512(),
        }
    }
}

/// The IdP's private key and its certificate. Loaded once, shared read-only.
pub struct SigningKey {
    key: PKey<Private>,
    certificate: X509,
}

impl SigningKey {
    pub fn from_pem(key_pem: &[u8], cert_pem: &[u8]) -> SamlResult<Self> {
        let key = PKey::private_key_from_pem(key_pem)
            .map_err(|e| SamlError::Key(format!("invalid private key: {e}")))?;
        let certificate = X509::from_pem(cert_pem)
            .map_err(|e| SamlError::Key(format!("invalid certificate: {e}")))?;
        if !certificate.public_key()?.public_eq(&key) {
            return Err(SamlError::Key(
                "private key does not match the certificate".into(),
            ));
        }
        Ok(SigningKey { key, certificate })
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    pub fn certificate_der(&self) -> SamlResult<Vec<u8>> {
        Ok(self.certificate.to_der()?)
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey").finish_non_exhaustive()
    }
}

/// Certificates whose signatures are accepted.
#[derive(Default)]
pub struct TrustStore {
    certificates: Vec<(X509, Vec<u8>)>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, certificate: X509) -> SamlResult<()> {
        let der = certificate.to_der()?;
        if !self.certificates.iter().any(|(_, known)| *known == der) {
            self.certificates.push((certificate, der));
        }
        Ok(())
    }

    pub fn add_der(&mut self, der: &[u8]) -> SamlResult<()> {
        let certificate = X509::from_der(der)
            .map_err(|e| SamlError::Key(format!("invalid certificate: {e}")))?;
        self.add(certificate)
    }

    pub fn add_pem(&mut self, pem: &[u8]) -> SamlResult<()> {
        let certificate = X509::from_pem(pem)
            .map_err(|e| SamlError::Key(format!("invalid certificate: {e}")))?;
        self.add(certificate)
    }

    pub fn contains(&self, der: &[u8]) -> bool {
        self.certificates.iter().any(|(_, known)| known == der)
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    fn certificates(&self) -> impl Iterator<Item = &X509> {
        self.certificates.iter().map(|(certificate, _)| certificate)
    }
}

impl fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustStore")
            .field("certificates", &self.certificates.len())
            .finish()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SignatureOptions {
    pub canonicalization: CanonicalizationMethod,
    pub signature_algorithm: SignatureAlgorithm,
    pub digest_algorithm: DigestAlgorithm,
}


/// An element carrying its own enveloped signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDocument {
    pub element: Element,
    pub reference_id: String,
    pub signature_value: String,
    pub certificate: Vec<u8>,
    pub canonicalization: CanonicalizationMethod,
    pub signature_algorithm: SignatureAlgorithm,
    pub digest_algorithm: DigestAlgorithm,
}

impl SignedDocument {
    pub fn to_xml(&self) -> String {
        self.element.to_xml()
    }

    pub fn to_document(&self) -> String {
        format!("{XML_DECLARATION}{}", self.to_xml())
    }

    pub fn into_element(self) -> Element {
        self.element
    }
}

#[derive(Debug)]
pub struct VerifiedSignature {
    pub reference_id: String,
    pub certificate: X509,
    pub signature_algorithm: SignatureAlgorithm,
    pub digest_algorithm: DigestAlgorithm,
}

#[derive(Debug, Clone)]
pub struct SignatureEngine {
    denied: HashSet<String>,
}

impl Default for SignatureEngine {
    fn default() -> Self {
        SignatureEngine::new([
            SignatureAlgorithm::RsaSha1.uri().to_string(),
            DigestAlgorithm::Sha1.uri().to_string(),
        ])
    }
}

impl SignatureEngine {
    pub fn new(denied_algorithms: impl IntoIterator<Item = String>) -> Self {
        SignatureEngine {
            denied: denied_algorithms.into_iter().collect(),
        }
    }

    pub fn is_denied(&self, uri: &str) -> bool {
        self.denied.contains(uri)
    }

    fn ensure_allowed(&self, uri: &str) -> SamlResult<()> {
        if self.is_denied(uri) {
            warn!(algorithm = uri, "refusing denied algorithm");
            return Err(SamlError::DeniedAlgorithm(uri.to_string()));
        }
        Ok(())
    }


    /// Signs `element` (which must carry an `ID` attribute) with an enveloped
    /// signature inserted right after its `<Issuer>`, or first when it has none.
    ///
    /// Digest and SignedInfo are both computed over the serialized form as
    /// libxml reads it back, which is exactly what a verifier will see.
    pub fn sign(
        &self,
        element: Element,
        key: &SigningKey,
        options: &SignatureOptions,
    ) -> SamlResult<SignedDocument> {
        self.ensure_allowed(options.signature_algorithm.uri())?;
        self.ensure_allowed(options.digest_algorithm.uri())?;
        self.ensure_allowed(options.canonicalization.uri())?;

        let mut element = element;
        let reference_id = element
            .attribute("ID")
            .ok_or_else(|| SamlError::MalformedXml("element to sign has no ID".into()))?
            .to_string();
        if element.child_elements().any(|child| child.name.local == "Signature") {
            return Err(SamlError::MalformedXml(format!("{reference_id} is already signed")));
        }

        let unsigned = parse_document(element.to_xml().as_bytes())?;
        let canonical = canonicalize(&root_element(&unsigned)?, options.canonicalization, &[])?;
        let digest = hash(options.digest_algorithm.message_digest(), &canonical)?;
        let digest_value = BASE64_STANDARD.encode(&*digest);

        let certificate = key.certificate_der()?;
        let position = element
            .children
            .iter()
            .position(|child| matches!(child, XmlNode::Element(e) if e.name.local == "Issuer"))
            .map_or(0, |index| index + 1);
        element.children.insert(
            position,
            XmlNode::Element(signature_template(
                &reference_id,
                &digest_value,
                &certificate,
                options,
            )),
        );

        let staged = parse_document(element.to_xml().as_bytes())?;
        let signed_info = children_named(&root_element(&staged)?, DS_NS, "Signature")
            .first()
            .and_then(|signature| first_child(signature, "SignedInfo"))
            .ok_or_else(|| SamlError::MalformedXml("staged signature has no SignedInfo".into()))?;
        let canonical_signed_info = canonicalize(&signed_info, options.canonicalization, &[])?;

        let mut signer = Signer::new(options.signature_algorithm.message_digest(), &key.key)?;
        signer.update(&canonical_signed_info)?;
        let signature_value = BASE64_STANDARD.encode(signer.sign_to_vec()?);

        let value = match element.children.get_mut(position) {
            Some(XmlNode::Element(signature)) => signature
                .child_elements_mut()
                .find(|child| child.name.local == "SignatureValue"),
            _ => None,
        }
        .ok_or_else(|| SamlError::MalformedXml("signature template has no SignatureValue".into()))?;
        value.set_text(signature_value.clone());

        debug!(reference = %reference_id, algorithm = options.signature_algorithm.uri(), "signed element");

        Ok(SignedDocument {
            element,
            reference_id,
            signature_value,
            certificate,
            canonicalization: options.canonicalization,
            signature_algorithm: options.signature_algorithm,
            digest_algorithm: options.digest_algorithm,
        })
    }

    pub fn verify(
        &self,
        signed: &SignedDocument,
        trusted: &TrustStore,
        now: OffsetDateTime,
    ) -> SamlResult<()> {
        self.verify_xml(&signed.to_xml(), trusted, now).map(|_| ())
    }

    /// Verifies the signature enveloped in the root element of `xml`.
    pub fn verify_xml(
        &self,
        xml: &str,
        trusted: &TrustStore,
        now: OffsetDateTime,
    ) -> SamlResult<VerifiedSignature> {
        let document = parse_document(xml.as_bytes())?;
        let id = id_attribute(&root_element(&document)?)
            .ok_or_else(|| SamlError::MalformedXml("root element has no ID".into()))?;
        self.verify_document(&document, &id, trusted, now)
    }

    /// Verifies the enveloped signature of the element identified by `id`
    /// somewhere inside `document`. The document itself is left untouched.
    pub fn verify_document(
        &self,
        document: &Document,
        id: &str,
        trusted: &TrustStore,
        now: OffsetDateTime,
    ) -> SamlResult<VerifiedSignature> {
        let target = find_by_id(document, id)?
            .ok_or_else(|| SamlError::MalformedXml(format!("no element with ID {id}")))?;
        let signature = match children_named(&target, DS_NS, "Signature").as_slice() {
            [] => return Err(SamlError::MissingSignature(id.to_string())),
            [only] => only.clone(),
            _ => return Err(SamlError::MalformedXml(format!("{id} carries several signatures"))),
        };

        let signed_info = first_child(&signature, "SignedInfo")
            .ok_or_else(|| SamlError::MalformedXml("signature has no SignedInfo".into()))?;
        let info = SignedInfoView::read(&signed_info)?;

        for uri in info.algorithm_uris() {
            self.ensure_allowed(uri)?;
        }
        let canonicalization = CanonicalizationMethod::from_uri(&info.canonicalization)
            .ok_or_else(|| SamlError::UnsupportedAlgorithm(info.canonicalization.clone()))?;
        let signature_algorithm = SignatureAlgorithm::from_uri(&info.signature_method)
            .ok_or_else(|| SamlError::UnsupportedAlgorithm(info.signature_method.clone()))?;
        let digest_algorithm = DigestAlgorithm::from_uri(&info.digest_method)
            .ok_or_else(|| SamlError::UnsupportedAlgorithm(info.digest_method.clone()))?;

        if info.reference_uri != format!("#{id}") {
            return Err(SamlError::SignatureMismatch(format!(
                "reference {} does not point at {id}",
                info.reference_uri
            )));
        }
        let mut enveloped = false;
        let mut reference_c14n = None;
        for transform in &info.transforms {
            if transform == ENVELOPED_SIGNATURE {
                enveloped = true;
            } else if let Some(method) = CanonicalizationMethod::from_uri(transform) {
                reference_c14n = Some(method);
            } else {
                return Err(SamlError::UnsupportedAlgorithm(transform.clone()));
            }
        }
        if !enveloped {
            return Err(SamlError::UnsupportedAlgorithm(
                "signature is not enveloped".into(),
            ));
        }
        // Without an explicit transform the reference falls back to inclusive C14N 1.0.
        let reference_c14n = reference_c14n.unwrap_or(CanonicalizationMethod::InclusiveC14n);

        let signature_value = first_child(&signature, "SignatureValue")
            .map(|value| value.get_content())
            .ok_or_else(|| SamlError::MalformedXml("signature has no SignatureValue".into()))
            .and_then(|value| {
                decode_xml_base64(&value)
                    .map_err(|e| SamlError::MalformedXml(format!("SignatureValue: {e}")))
            })?;

        let candidates = match embedded_certificate(&signature)? {
            Some(der) => {
                if !trusted.contains(&der) {
                    warn!(reference = %id, "signature made with an untrusted certificate");
                    return Err(SamlError::UntrustedCertificate);
                }
                vec![X509::from_der(&der)
                    .map_err(|e| SamlError::Key(format!("invalid certificate: {e}")))?]
            }
            None => trusted.certificates().cloned().collect(),
        };
        if candidates.is_empty() {
            return Err(SamlError::UntrustedCertificate);
        }

        let canonical =
            canonical_without_signature(document, id, reference_c14n, &info.inclusive_prefixes)?;
        let digest = hash(digest_algorithm.message_digest(), &canonical)?;
        let expected = decode_xml_base64(&info.digest_value)
            .map_err(|e| SamlError::MalformedXml(format!("DigestValue: {e}")))?;
        if expected.len() != digest.len() || !memcmp::eq(&expected, &digest) {
            return Err(SamlError::SignatureMismatch(format!("digest of {id} differs")));
        }

        let canonical_signed_info =
            canonicalize(&signed_info, canonicalization, &info.signed_info_prefixes)?;

        let mut validity_error = None;
        for certificate in candidates {
            if let Err(e) = check_validity(&certificate, now) {
                validity_error = Some(e);
                continue;
            }
            let public_key = certificate.public_key()?;
            let mut verifier = Verifier::new(signature_algorithm.message_digest(), &public_key)?;
            verifier.update(&canonical_signed_info)?;
            // openssl reports malformed signature blobs as errors, which is still a mismatch.
            if verifier.verify(&signature_value).unwrap_or(false) {
                debug!(reference = %id, "signature verified");
                return Ok(VerifiedSignature {
                    reference_id: id.to_string(),
                    certificate,
                    signature_algorithm,
                    digest_algorithm,
                });
            }
        }

        Err(validity_error
            .unwrap_or_else(|| SamlError::SignatureMismatch(format!("signature value of {id}"))))
    }
}

/// The enveloped-signature transform: canonical bytes of the element `id`
/// minus its own Signature, taken from a copy of `document`.
fn canonical_without_signature(
    document: &Document,
    id: &str,
    method: CanonicalizationMethod,
    inclusive_prefixes: &[String],
) -> SamlResult<Vec<u8>> {
    let copy = document
        .dup()
        .map_err(|()| SamlError::MalformedXml("document could not be copied".into()))?;
    let mut target = find_by_id(&copy, id)?
        .ok_or_else(|| SamlError::MalformedXml(format!("no element with ID {id}")))?;
    let mut signature = children_named(&target, DS_NS, "Signature")
        .into_iter()
        .next()
        .ok_or_else(|| SamlError::MissingSignature(id.to_string()))?;

    signature.unlink();
    let canonical = canonicalize(&target, method, inclusive_prefixes);
    // Re-attached so the copy frees it with the rest of its tree.
    target.add_child(&mut signature).map_err(SamlError::MalformedXml)?;
    canonical
}

fn first_child(node: &Node, local: &str) -> Option<Node> {
    children_named(node, DS_NS, local).into_iter().next()
}

fn signature_template(
    reference_id: &str,
    digest_value: &str,
    certificate: &[u8],
    options: &SignatureOptions,
) -> Element {
    let mut transforms = Element::new("ds:Transforms").with_child(
        Element::new("ds:Transform").with_attribute("Algorithm", ENVELOPED_SIGNATURE),
    );
    // Inclusive C14N 1.0 is what a reference implies after the enveloped transform.
    if options.canonicalization.is_exclusive() {
        transforms = transforms.with_child(
            Element::new("ds:Transform").with_attribute("Algorithm", options.canonicalization.uri()),
        );
    }

    let signed_info = Element::new("ds:SignedInfo")
        .with_child(
            Element::new("ds:CanonicalizationMethod")
                .with_attribute("Algorithm", options.canonicalization.uri()),
        )
        .with_child(
            Element::new("ds:SignatureMethod")
                .with_attribute("Algorithm", options.signature_algorithm.uri()),
        )
        .with_child(
            Element::new("ds:Reference")
                .with_attribute("URI", format!("#{reference_id}"))
                .with_child(transforms)
                .with_child(
                    Element::new("ds:DigestMethod")
                        .with_attribute("Algorithm", options.digest_algorithm.uri()),
                )
                .with_child(Element::new("ds:DigestValue").with_text(digest_value)),
        );

    Element::new("ds:Signature")
        .with_namespace(Some("ds"), DS_NS)
        .with_child(signed_info)
        .with_child(Element::new("ds:SignatureValue"))
        .with_child(
            Element::new("ds:KeyInfo").with_child(
                Element::new("ds:X509Data").with_child(
                    Element::new("ds:X509Certificate")
                        .with_text(BASE64_STANDARD.encode(certificate)),
                ),
            ),
        )
}

struct SignedInfoView {
    canonicalization: String,
    signed_info_prefixes: Vec<String>,
    signature_method: String,
    reference_uri: String,
    transforms: Vec<String>,
    inclusive_prefixes: Vec<String>,
    digest_method: String,
    digest_value: String,
}

impl SignedInfoView {
    fn read(signed_info: &Node) -> SamlResult<Self> {
        let algorithm = |node: Option<Node>, what: &str| -> SamlResult<String> {
            node.and_then(|n| n.get_property_no_ns("Algorithm"))
                .ok_or_else(|| SamlError::MalformedXml(format!("{what} has no Algorithm")))
        };

        let canonicalization_method = first_child(signed_info, "CanonicalizationMethod");
        let signed_info_prefixes = canonicalization_method
            .as_ref()
            .map(prefix_list)
            .unwrap_or_default();
        let canonicalization = algorithm(canonicalization_method, "CanonicalizationMethod")?;
        let signature_method =
            algorithm(first_child(signed_info, "SignatureMethod"), "SignatureMethod")?;

        let reference = match children_named(signed_info, DS_NS, "Reference").as_slice() {
            [only] => only.clone(),
            _ => {
                return Err(SamlError::MalformedXml(
                    "SignedInfo must hold exactly one Reference".into(),
                ))
            }
        };
        let reference_uri = reference.get_property_no_ns("URI").unwrap_or_default();

        let mut transforms = Vec::new();
        let mut inclusive_prefixes = Vec::new();
        if let Some(list) = first_child(&reference, "Transforms") {
            for transform in children_named(&list, DS_NS, "Transform") {
                inclusive_prefixes.extend(prefix_list(&transform));
                transforms.push(algorithm(Some(transform), "Transform")?);
            }
        }

        let digest_method = algorithm(first_child(&reference, "DigestMethod"), "DigestMethod")?;
        let digest_value = first_child(&reference, "DigestValue")
            .map(|value| value.get_content())
            .ok_or_else(|| SamlError::MalformedXml("Reference has no DigestValue".into()))?;

        Ok(SignedInfoView {
            canonicalization,
            signed_info_prefixes,
            signature_method,
            reference_uri,
            transforms,
            inclusive_prefixes,
            digest_method,
            digest_value,
        })
    }

    fn algorithm_uris(&self) -> impl Iterator<Item = &str> {
        [
            self.canonicalization.as_str(),
            self.signature_method.as_str(),
            self.digest_method.as_str(),
        ]
        .into_iter()
        .chain(self.transforms.iter().map(String::as_str))
    }
}

fn prefix_list(method: &Node) -> Vec<String> {
    children_named(method, EXC_C14N_NS, "InclusiveNamespaces")
        .first()
        .and_then(|inclusive| inclusive.get_property_no_ns("PrefixList"))
        .map(|list| list.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn embedded_certificate(signature: &Node) -> SamlResult<Option<Vec<u8>>> {
    let certificate = first_child(signature, "KeyInfo")
        .and_then(|key_info| first_child(&key_info, "X509Data"))
        .and_then(|data| first_child(&data, "X509Certificate"));
    let Some(certificate) = certificate else {
        return Ok(None);
    };
    decode_xml_base64(&certificate.get_content())
        .map(Some)
        .map_err(|e| SamlError::MalformedXml(format!("X509Certificate: {e}")))
}

fn check_validity(certificate: &X509Ref, now: OffsetDateTime) -> SamlResult<()> {
    let at = Asn1Time::from_unix(now.unix_timestamp() as _)?;
    let started = certificate.not_before().compare(&at)? != Ordering::Greater;
    let ended = certificate.not_after().compare(&at)? != Ordering::Greater;
    if !started || ended {
        return Err(SamlError::ExpiredCertificate);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SAML_NS;
    use time::macros::datetime;

    const IDP_KEY: &[u8] = include_bytes!("../static/idp.key");
    const IDP_CERT: &[u8] = include_bytes!("../static/idp.crt");
    const ROGUE_KEY: &[u8] = include_bytes!("../static/rogue.key");
    const ROGUE_CERT: &[u8] = include_bytes!("../static/rogue.crt");

    fn now() -> OffsetDateTime {
        datetime!(2030-01-01 00:00:00 UTC)
    }

    fn idp_key() -> SigningKey {
        SigningKey::from_pem(IDP_KEY, IDP_CERT).unwrap()
    }

    fn trust_idp() -> TrustStore {
        let mut trust = TrustStore::new();
        trust.add_pem(IDP_CERT).unwrap();
        trust
    }

    fn sample() -> Element {
        Element::new("saml:Assertion")
            .with_namespace(Some("saml"), SAML_NS)
            .with_attribute("ID", "_sample")
            .with_attribute("Version", "2.0")
            .with_child(Element::new("saml:Issuer").with_text("https://idp.example"))
            .with_child(
                Element::new("saml:Subject")
                    .with_child(Element::new("saml:NameID").with_text("user1")),
            )
    }

    #[test]
    fn sign_then_verify() {
        let engine = SignatureEngine::default();
        let signed = engine.sign(sample(), &idp_key(), &SignatureOptions::default()).unwrap();
        engine.verify(&signed, &trust_idp(), now()).unwrap();

        let verified = engine.verify_xml(&signed.to_xml(), &trust_idp(), now()).unwrap();
        assert_eq!(verified.reference_id, "_sample");
        assert_eq!(verified.signature_algorithm, SignatureAlgorithm::RsaSha256);
    }

    #[test]
    fn signature_follows_issuer() {
        let signed = SignatureEngine::default()
            .sign(sample(), &idp_key(), &SignatureOptions::default())
            .unwrap();
        let names: Vec<_> = signed
            .element
            .child_elements()
            .map(|child| child.name.local.as_str())
            .collect();
        assert_eq!(names, ["Issuer", "Signature", "Subject"]);
    }

    #[test]
    fn any_altered_content_is_a_mismatch() {
        let engine = SignatureEngine::default();
        let xml = engine
            .sign(sample(), &idp_key(), &SignatureOptions::default())
            .unwrap()
            .to_xml();
        let tampered = xml.replace(">user1<", ">user2<");
        assert_ne!(xml, tampered);
        assert!(matches!(
            engine.verify_xml(&tampered, &trust_idp(), now()),
            Err(SamlError::SignatureMismatch(_))
        ));
    }

    #[test]
    fn reformatted_document_still_verifies() {
        let engine = SignatureEngine::default();
        let xml = engine
            .sign(sample(), &idp_key(), &SignatureOptions::default())
            .unwrap()
            .to_xml();
        let reordered = xml.replace(
            r#"ID="_sample" Version="2.0""#,
            r#"Version='2.0'   ID='_sample'"#,
        );
        assert_ne!(xml, reordered);
        engine.verify_xml(&reordered, &trust_idp(), now()).unwrap();
    }

    #[test]
    fn untrusted_certificate_is_refused() {
        let engine = SignatureEngine::default();
        let rogue = SigningKey::from_pem(ROGUE_KEY, ROGUE_CERT).unwrap();
        let signed = engine.sign(sample(), &rogue, &SignatureOptions::default()).unwrap();
        assert!(matches!(
            engine.verify(&signed, &trust_idp(), now()),
            Err(SamlError::UntrustedCertificate)
        ));
    }

    #[test]
    fn expired_certificate_is_refused() {
        let engine = SignatureEngine::default();
        let signed = engine.sign(sample(), &idp_key(), &SignatureOptions::default()).unwrap();
        assert!(matches!(
            engine.verify(&signed, &trust_idp(), datetime!(2200-01-01 00:00:00 UTC)),
            Err(SamlError::ExpiredCertificate)
        ));
    }

    #[test]
    fn denied_algorithms_are_fatal() {
        let permissive = SignatureEngine::new(Vec::new());
        let options = SignatureOptions {
            signature_algorithm: SignatureAlgorithm::RsaSha1,
            digest_algorithm: DigestAlgorithm::Sha1,
            ..SignatureOptions::default()
        };
        let signed = permissive.sign(sample(), &idp_key(), &options).unwrap();
        permissive.verify(&signed, &trust_idp(), now()).unwrap();

        let strict = SignatureEngine::default();
        assert!(matches!(
            strict.verify(&signed, &trust_idp(), now()),
            Err(SamlError::DeniedAlgorithm(_))
        ));
        assert!(matches!(
            strict.sign(sample(), &idp_key(), &options),
            Err(SamlError::DeniedAlgorithm(_))
        ));
    }

    #[test]
    fn unsigned_element_reports_missing_signature() {
        let xml = sample().to_xml();
        assert!(matches!(
            SignatureEngine::default().verify_xml(&xml, &trust_idp(), now()),
            Err(SamlError::MissingSignature(_))
        ));
    }

    #[test]
    fn mismatched_key_and_certificate_are_rejected() {
        assert!(matches!(
            SigningKey::from_pem(IDP_KEY, ROGUE_CERT),
            Err(SamlError::Key(_))
        ));
    }

    #[test]
    fn inclusive_reference_relies_on_the_implied_transform() {
        let engine = SignatureEngine::default();
        let options = SignatureOptions {
            canonicalization: CanonicalizationMethod::InclusiveC14n,
            ..SignatureOptions::default()
        };
        let xml = engine.sign(sample(), &idp_key(), &options).unwrap().to_xml();
        assert_eq!(xml.matches("<ds:Transform ").count(), 1);
        engine.verify_xml(&xml, &trust_idp(), now()).unwrap();

        let tampered = xml.replace(">user1<", ">user2<");
        assert!(matches!(
            engine.verify_xml(&tampered, &trust_idp(), now()),
            Err(SamlError::SignatureMismatch(_))
        ));
    }

    #[test]
    fn unknown_transform_is_refused() {
        let engine = SignatureEngine::default();
        let xml = engine
            .sign(sample(), &idp_key(), &SignatureOptions::default())
            .unwrap()
            .to_xml()
            .replace(
                CanonicalizationMethod::ExclusiveC14n.uri(),
                "http://www.w3.org/TR/1999/REC-xslt-19991116",
            );
        assert!(matches!(
            engine.verify_xml(&xml, &trust_idp(), now()),
            Err(SamlError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn line_end_variants_verify_alike() {
        let engine = SignatureEngine::default();
        let element = sample().with_child(Element::new("saml:Note").with_text("one\ntwo"));
        let xml = engine
            .sign(element, &idp_key(), &SignatureOptions::default())
            .unwrap()
            .to_xml();
        let crlf = xml.replace("one\ntwo", "one\r\ntwo");
        assert_ne!(xml, crlf);
        engine.verify_xml(&crlf, &trust_idp(), now()).unwrap();
    }

    #[test]
    fn verification_leaves_the_document_intact() {
        let engine = SignatureEngine::default();
        let xml = engine
            .sign(sample(), &idp_key(), &SignatureOptions::default())
            .unwrap()
            .to_xml();
        let document = parse_document(xml.as_bytes()).unwrap();
        engine.verify_document(&document, "_sample", &trust_idp(), now()).unwrap();
        engine.verify_document(&document, "_sample", &trust_idp(), now()).unwrap();
        let root = root_element(&document).unwrap();
        assert_eq!(children_named(&root, DS_NS, "Signature").len(), 1);
    }

    #[test]
    fn already_signed_element_is_refused() {
        let engine = SignatureEngine::default();
        let signed = engine
            .sign(sample(), &idp_key(), &SignatureOptions::default())
            .unwrap()
            .into_element();
        assert!(matches!(
            engine.sign(signed, &idp_key(), &SignatureOptions::default()),
            Err(SamlError::MalformedXml(_))
        ));
    }
}
