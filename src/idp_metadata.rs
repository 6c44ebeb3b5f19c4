use base64::{prelude::BASE64_STANDARD, Engine};
use yaserde::YaSerialize;

use crate::{authn_request::ProtocolBinding, SamlError, SamlResult, SAMLP_NS};

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "md" = "urn:oasis:names:tc:SAML:2.0:metadata",
    "ds" = "http://www.w3.org/2000/09/xmldsig#",
  },
  prefix = "md"
)]
struct EntityDescriptor {
    #[yaserde(attribute = true, rename = "entityID")]
    entity_id: String,
    #[yaserde(rename = "IDPSSODescriptor", prefix = "md")]
    idp_sso_descriptor: IDPSSODescriptor,
}

#[derive(YaSerialize)]
struct IDPSSODescriptor {
    #[yaserde(attribute = true, rename = "WantAuthnRequestsSigned")]
    want_authn_requests_signed: bool,
    #[yaserde(attribute = true, rename = "protocolSupportEnumeration")]
    protocol_support_enumeration: String,
    #[yaserde(rename = "KeyDescriptor", prefix = "md")]
    key_descriptor: KeyDescriptor,
    #[yaserde(rename = "NameIDFormat", prefix = "md")]
    name_id_formats: Vec<NameIdFormat>,
    #[yaserde(rename = "SingleSignOnService", prefix = "md")]
    single_sign_on_services: Vec<SingleSignOnService>,
}

#[derive(YaSerialize)]
struct KeyDescriptor {
    #[yaserde(attribute = true, rename = "use")]
    key_use: String,
    #[yaserde(rename = "KeyInfo", prefix = "ds")]
    key_info: KeyInfo,
}

#[derive(YaSerialize)]
struct KeyInfo {
    #[yaserde(rename = "X509Data", prefix = "ds")]
    x509_data: X509Data,
}

#[derive(YaSerialize)]
struct X509Data {
    #[yaserde(rename = "X509Certificate", prefix = "ds")]
    x509_certificate: X509Certificate,
}

#[derive(YaSerialize)]
struct X509Certificate {
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct NameIdFormat {
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct SingleSignOnService {
    #[yaserde(attribute = true, rename = "Binding")]
    binding: String,
    #[yaserde(attribute = true, rename = "Location")]
    location: String,
}

/// Builds the IdP's metadata document for SPs to import.
#[derive(Default)]
pub struct IdpMetadataBuilder {
    entity_id: Option<String>,
    signing_certificate: Option<Vec<u8>>,
    sso_locations: Vec<(ProtocolBinding, String)>,
    name_id_formats: Vec<String>,
    want_authn_requests_signed: bool,
}

impl IdpMetadataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_id(self, entity_id: &str) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            ..self
        }
    }

    /// DER encoded certificate of the assertion signing key.
    pub fn signing_certificate(self, der: &[u8]) -> Self {
        Self {
            signing_certificate: Some(der.to_vec()),
            ..self
        }
    }

    pub fn sso_location(mut self, binding: ProtocolBinding, location: &str) -> Self {
        self.sso_locations.retain(|(known, _)| *known != binding);
        self.sso_locations.push((binding, location.into()));
        self
    }

    pub fn name_id_format(mut self, format: &str) -> Self {
        if !self.name_id_formats.iter().any(|known| known == format) {
            self.name_id_formats.push(format.into());
        }
        self
    }

    pub fn want_authn_requests_signed(self, want: bool) -> Self {
        Self {
            want_authn_requests_signed: want,
            ..self
        }
    }

    pub fn build(self) -> SamlResult<String> {
        let entity_id = self
            .entity_id
            .ok_or_else(|| SamlError::Config("metadata needs an entity_id".into()))?;
        let certificate = self
            .signing_certificate
            .ok_or_else(|| SamlError::Config("metadata needs a signing certificate".into()))?;
        if self.sso_locations.is_empty() {
            return Err(SamlError::Config(
                "metadata needs a SingleSignOnService location".into(),
            ));
        }

        let metadata = EntityDescriptor {
            entity_id,
            idp_sso_descriptor: IDPSSODescriptor {
                want_authn_requests_signed: self.want_authn_requests_signed,
                protocol_support_enumeration: SAMLP_NS.into(),
                key_descriptor: KeyDescriptor {
                    key_use: "signing".into(),
                    key_info: KeyInfo {
                        x509_data: X509Data {
                            x509_certificate: X509Certificate {
                                content: BASE64_STANDARD.encode(certificate),
                            },
                        },
                    },
                },
                name_id_formats: self
                    .name_id_formats
                    .into_iter()
                    .map(|content| NameIdFormat { content })
                    .collect(),
                single_sign_on_services: self
                    .sso_locations
                    .into_iter()
                    .map(|(binding, location)| SingleSignOnService {
                        binding: binding.to_string(),
                        location,
                    })
                    .collect(),
            },
        };
        yaserde::ser::to_string(&metadata).map_err(SamlError::Serialization)
    }
}
