use std::{collections::HashMap, fmt};

use serde::{
    de::{MapAccess, Visitor},
    Deserialize, Deserializer,
};
use time::Duration;

use crate::{
    attributes::{AttributeFilter, AttributeMap},
    signature::{DigestAlgorithm, SignatureAlgorithm},
    utils::seconds,
    SamlError, SamlResult, AUTHN_CONTEXT_PASSWORD_PROTECTED, NAME_ID_FORMAT_UNSPECIFIED,
};

/// A configured test identity: the lookup key (`username:password`) and the
/// attributes released for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub key: String,
    pub attributes: AttributeMap,
}

/// A relying party the IdP issues assertions for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceProvider {
    pub entity_id: String,
    /// Assertion consumer endpoints, the first one being the default.
    pub acs_urls: Vec<String>,
    /// DER certificate used to verify signed AuthnRequests.
    pub signing_certificate: Option<Vec<u8>>,
    pub authn_requests_signed: bool,
}

impl ServiceProvider {
    pub fn default_acs_url(&self) -> Option<&str> {
        self.acs_urls.first().map(String::as_str)
    }

    pub fn accepts_acs_url(&self, url: &str) -> bool {
        self.acs_urls.iter().any(|known| known == url)
    }
}

/// What the identity layer is exposed as to the rest of the IdP.
pub trait ConfigProvider: Send + Sync {
    fn lookup_identity(&self, key: &str) -> Option<&IdentityRecord>;

    fn known_service_providers(&self) -> &[ServiceProvider];

    fn service_provider(&self, entity_id: &str) -> Option<&ServiceProvider> {
        self.known_service_providers()
            .iter()
            .find(|sp| sp.entity_id == entity_id)
    }
}

/// Immutable in-memory configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticConfig {
    identities: Vec<IdentityRecord>,
    index: HashMap<String, usize>,
    service_providers: Vec<ServiceProvider>,
}

impl StaticConfig {
    pub fn new(identities: Vec<IdentityRecord>, service_providers: Vec<ServiceProvider>) -> Self {
        let index = identities
            .iter()
            .enumerate()
            .map(|(position, record)| (record.key.clone(), position))
            .collect();
        StaticConfig {
            identities,
            index,
            service_providers,
        }
    }

    pub fn identities(&self) -> &[IdentityRecord] {
        &self.identities
    }
}

impl ConfigProvider for StaticConfig {
    fn lookup_identity(&self, key: &str) -> Option<&IdentityRecord> {
        self.index
            .get(key)
            .and_then(|position| self.identities.get(*position))
    }

    fn known_service_providers(&self) -> &[ServiceProvider] {
        &self.service_providers
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceProviderConfig {
    pub entity_id: String,
    pub acs_urls: Vec<String>,
    #[serde(default)]
    pub certificate_pem: Option<String>,
    #[serde(default)]
    pub authn_requests_signed: bool,
}

impl ServiceProviderConfig {
    fn into_service_provider(self) -> SamlResult<ServiceProvider> {
        let signing_certificate = self
            .certificate_pem
            .map(|pem| {
                openssl::x509::X509::from_pem(pem.as_bytes())
                    .and_then(|cert| cert.to_der())
                    .map_err(|e| {
                        SamlError::Config(format!("certificate of {}: {e}", self.entity_id))
                    })
            })
            .transpose()?;
        if self.authn_requests_signed && signing_certificate.is_none() {
            return Err(SamlError::Config(format!(
                "{} requires signed requests but has no certificate",
                self.entity_id
            )));
        }
        Ok(ServiceProvider {
            entity_id: self.entity_id,
            acs_urls: self.acs_urls,
            signing_certificate,
            authn_requests_signed: self.authn_requests_signed,
        })
    }
}

/// How the NameID of issued assertions is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NameIdPolicy {
    /// Attribute whose first value becomes the NameID. The username part of
    /// the identity key is used when unset.
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default = "default_name_id_format")]
    pub format: String,
}

impl Default for NameIdPolicy {
    fn default() -> Self {
        NameIdPolicy {
            attribute: None,
            format: default_name_id_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdpConfig {
    pub entity_id: String,
    #[serde(default)]
    pub sso_url: Option<String>,
    #[serde(default = "default_validity")]
    pub assertion_validity_secs: u64,
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,
    /// How long consumed request IDs are remembered. Defaults to the
    /// assertion validity.
    #[serde(default)]
    pub replay_window_secs: Option<u64>,
    /// Oldest IssueInstant accepted on an inbound AuthnRequest.
    #[serde(default = "default_max_request_age")]
    pub max_request_age_secs: u64,
    #[serde(default = "default_true")]
    pub sign_response: bool,
    #[serde(default = "default_denied_algorithms")]
    pub denied_algorithms: Vec<String>,
    #[serde(default = "default_authn_context")]
    pub authn_context_class: String,
    #[serde(default)]
    pub name_id: NameIdPolicy,
    #[serde(default)]
    pub attribute_filters: Vec<AttributeFilter>,
    #[serde(default)]
    pub service_providers: Vec<ServiceProviderConfig>,
    #[serde(default)]
    pub identities: IdentityTable,
}

impl IdpConfig {
    pub fn from_json(input: &str) -> SamlResult<Self> {
        let config: IdpConfig =
            serde_json::from_str(input).map_err(|e| SamlError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SamlResult<()> {
        if self.entity_id.trim().is_empty() {
            return Err(SamlError::Config("entity_id is empty".into()));
        }
        if self.assertion_validity_secs == 0 {
            return Err(SamlError::Config(
                "assertion_validity_secs must be positive".into(),
            ));
        }
        let mut seen = Vec::new();
        for sp in &self.service_providers {
            if seen.contains(&sp.entity_id.as_str()) {
                return Err(SamlError::Config(format!(
                    "service provider {} is listed twice",
                    sp.entity_id
                )));
            }
            if sp.acs_urls.is_empty() {
                return Err(SamlError::Config(format!(
                    "service provider {} has no acs_urls",
                    sp.entity_id
                )));
            }
            seen.push(sp.entity_id.as_str());
        }
        Ok(())
    }

    pub fn assertion_validity(&self) -> Duration {
        seconds(self.assertion_validity_secs)
    }

    pub fn clock_skew(&self) -> Duration {
        seconds(self.clock_skew_secs)
    }

    pub fn replay_window(&self) -> Duration {
        seconds(
            self.replay_window_secs
                .unwrap_or(self.assertion_validity_secs),
        )
    }

    pub fn max_request_age(&self) -> Duration {
        seconds(self.max_request_age_secs)
    }

    /// Splits the configuration into the provider the resolver consumes.
    pub fn to_provider(&self) -> SamlResult<StaticConfig> {
        let service_providers = self
            .service_providers
            .iter()
            .cloned()
            .map(ServiceProviderConfig::into_service_provider)
            .collect::<SamlResult<Vec<_>>>()?;
        Ok(StaticConfig::new(
            self.identities.0.clone(),
            service_providers,
        ))
    }
}

/// Identities keyed by `username:password`, kept in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityTable(pub Vec<IdentityRecord>);

impl<'de> Deserialize<'de> for IdentityTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdentityTableVisitor;

        impl<'de> Visitor<'de> for IdentityTableVisitor {
            type Value = IdentityTable;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of identity keys to attribute maps")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut records: Vec<IdentityRecord> = Vec::new();
                while let Some((key, attributes)) = access.next_entry::<String, AttributeMap>()? {
                    if records.iter().any(|record| record.key == key) {
                        return Err(serde::de::Error::custom(format!(
                            "identity {key} is listed twice"
                        )));
                    }
                    records.push(IdentityRecord { key, attributes });
                }
                Ok(IdentityTable(records))
            }
        }

        deserializer.deserialize_map(IdentityTableVisitor)
    }
}

fn default_validity() -> u64 {
    300
}

fn default_clock_skew() -> u64 {
    60
}

fn default_max_request_age() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_denied_algorithms() -> Vec<String> {
    vec![
        SignatureAlgorithm::RsaSha1.uri().to_string(),
        DigestAlgorithm::Sha1.uri().to_string(),
    ]
}

fn default_authn_context() -> String {
    AUTHN_CONTEXT_PASSWORD_PROTECTED.to_string()
}

fn default_name_id_format() -> String {
    NAME_ID_FORMAT_UNSPECIFIED.to_string()
}
