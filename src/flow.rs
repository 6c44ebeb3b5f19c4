//! The IdP side of the Web Browser SSO profile.
//!
//! A flow moves `Idle → RequestReceived → IdentityResolved → AssertionIssued →
//! ResponseSigned` and ends in `Success` or `Rejected`. Nothing is emitted
//! before `ResponseSigned`; a flow rejected after its request was accepted
//! still yields a signed Response carrying an error status.

use std::{fmt, sync::Arc};

use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::{
    assertion::{AssertionBuilder, AuthnContext, Subject, ValidityWindow},
    attributes::{AttributeResolver, ResolvedIdentity},
    authn_request::{decode_post_request, decode_redirect_request, read_authn_request, ProtocolBinding},
    config::{ConfigProvider, IdpConfig, NameIdPolicy, ServiceProvider},
    idp_metadata::IdpMetadataBuilder,
    replay::ReplayCache,
    response::{ResponseDocument, SignedResponse, Status},
    signature::{SignatureEngine, SignatureOptions, SigningKey, TrustStore},
    utils::{random_id, whole_seconds},
    xml::parse_document,
    SamlError, SamlResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    RequestReceived,
    IdentityResolved,
    AssertionIssued,
    ResponseSigned,
    Success,
    Rejected,
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowState::Idle => "idle",
            FlowState::RequestReceived => "request_received",
            FlowState::IdentityResolved => "identity_resolved",
            FlowState::AssertionIssued => "assertion_issued",
            FlowState::ResponseSigned => "response_signed",
            FlowState::Success => "success",
            FlowState::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// An AuthnRequest that passed issuer, endpoint, signature and freshness
/// checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedRequest {
    pub(crate) request_id: String,
    pub(crate) issuer: String,
    pub(crate) acs_url: String,
    pub(crate) issue_instant: OffsetDateTime,
    pub(crate) name_id_format: Option<String>,
}

impl ReceivedRequest {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// The endpoint the Response will be delivered to.
    pub fn acs_url(&self) -> &str {
        &self.acs_url
    }

    pub fn issue_instant(&self) -> OffsetDateTime {
        self.issue_instant
    }

    pub fn name_id_format(&self) -> Option<&str> {
        self.name_id_format.as_deref()
    }
}

#[derive(Debug)]
pub enum FlowOutcome {
    Success(SignedResponse),
    Rejected {
        error: SamlError,
        /// Error Response for the SP, absent only if it could not be signed.
        response: Option<SignedResponse>,
    },
}

impl FlowOutcome {
    pub fn state(&self) -> FlowState {
        match self {
            FlowOutcome::Success(_) => FlowState::Success,
            FlowOutcome::Rejected { .. } => FlowState::Rejected,
        }
    }

    pub fn response(&self) -> Option<&SignedResponse> {
        match self {
            FlowOutcome::Success(response) => Some(response),
            FlowOutcome::Rejected { response, .. } => response.as_ref(),
        }
    }

    pub fn into_result(self) -> SamlResult<SignedResponse> {
        match self {
            FlowOutcome::Success(response) => Ok(response),
            FlowOutcome::Rejected { error, .. } => Err(error),
        }
    }
}

pub struct IdentityProvider {
    entity_id: String,
    sso_url: Option<String>,
    provider: Arc<dyn ConfigProvider>,
    resolver: AttributeResolver,
    builder: AssertionBuilder,
    engine: SignatureEngine,
    options: SignatureOptions,
    key: Arc<SigningKey>,
    replay: Arc<ReplayCache>,
    window: ValidityWindow,
    replay_window: Duration,
    max_request_age: Duration,
    sign_response: bool,
    name_id: NameIdPolicy,
    authn_context_class: String,
}

impl IdentityProvider {
    pub fn from_config(config: &IdpConfig, key: Arc<SigningKey>) -> SamlResult<Self> {
        config.validate()?;
        let provider: Arc<dyn ConfigProvider> = Arc::new(config.to_provider()?);
        info!(
            entity_id = %config.entity_id,
            service_providers = provider.known_service_providers().len(),
            "identity provider configured"
        );

        Ok(IdentityProvider {
            entity_id: config.entity_id.clone(),
            sso_url: config.sso_url.clone(),
            resolver: AttributeResolver::new(Arc::clone(&provider), config.attribute_filters.clone()),
            provider,
            builder: AssertionBuilder::new(&config.entity_id),
            engine: SignatureEngine::new(config.denied_algorithms.iter().cloned()),
            options: SignatureOptions::default(),
            key,
            replay: Arc::new(ReplayCache::new()),
            window: ValidityWindow {
                validity: config.assertion_validity(),
                clock_skew: config.clock_skew(),
            },
            replay_window: config.replay_window(),
            max_request_age: config.max_request_age(),
            sign_response: config.sign_response,
            name_id: config.name_id.clone(),
            authn_context_class: config.authn_context_class.clone(),
        })
    }

    /// Shares a replay cache between several providers.
    pub fn with_replay_cache(self, replay: Arc<ReplayCache>) -> Self {
        IdentityProvider { replay, ..self }
    }

    pub fn with_signature_options(self, options: SignatureOptions) -> Self {
        IdentityProvider { options, ..self }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn replay_cache(&self) -> &Arc<ReplayCache> {
        &self.replay
    }

    /// The IdP's own EntityDescriptor.
    pub fn metadata(&self) -> SamlResult<String> {
        let sso_url = self
            .sso_url
            .as_deref()
            .ok_or_else(|| SamlError::Config("sso_url is required for metadata".into()))?;
        IdpMetadataBuilder::new()
            .entity_id(&self.entity_id)
            .signing_certificate(&self.key.certificate_der()?)
            .sso_location(ProtocolBinding::Post, sso_url)
            .sso_location(ProtocolBinding::Redirect, sso_url)
            .name_id_format(&self.name_id.format)
            .want_authn_requests_signed(
                self.provider
                    .known_service_providers()
                    .iter()
                    .any(|sp| sp.authn_requests_signed),
            )
            .build()
    }

    /// Decodes a `SAMLRequest` parameter of the given binding and receives it.
    pub fn receive_encoded(
        &self,
        binding: ProtocolBinding,
        saml_request: &str,
        now: OffsetDateTime,
    ) -> SamlResult<ReceivedRequest> {
        let xml = match binding {
            ProtocolBinding::Post => decode_post_request(saml_request)?,
            ProtocolBinding::Redirect => decode_redirect_request(saml_request)?,
        };
        self.receive_authn_request(&xml, now)
    }

    /// `Idle → RequestReceived`. A rejected request gets no Response since its
    /// sender is not trusted yet.
    pub fn receive_authn_request(
        &self,
        xml: &[u8],
        now: OffsetDateTime,
    ) -> SamlResult<ReceivedRequest> {
        match self.check_request(xml, now) {
            Ok(received) => {
                transition(FlowState::Idle, FlowState::RequestReceived, &received.request_id);
                Ok(received)
            }
            Err(error) => {
                warn!(%error, "rejected AuthnRequest");
                Err(error)
            }
        }
    }

    fn check_request(&self, xml: &[u8], now: OffsetDateTime) -> SamlResult<ReceivedRequest> {
        let document = parse_document(xml)?;
        let request = read_authn_request(&document)?;
        let sp = self
            .provider
            .service_provider(&request.issuer)
            .ok_or_else(|| SamlError::UnknownIssuer(request.issuer.clone()))?;

        let acs_url = match &request.acs_url {
            Some(url) if sp.accepts_acs_url(url) => url.clone(),
            Some(url) => {
                return Err(SamlError::AcsUrlMismatch {
                    entity_id: sp.entity_id.clone(),
                    actual: url.clone(),
                })
            }
            None => default_acs_url(sp)?.to_string(),
        };

        if let (Some(destination), Some(sso_url)) = (&request.destination, &self.sso_url) {
            if destination != sso_url {
                return Err(SamlError::InvalidRequest(format!(
                    "request is destined to {destination}"
                )));
            }
        }

        if request.signed || sp.authn_requests_signed {
            if !request.signed {
                return Err(SamlError::MissingSignature(request.id));
            }
            let certificate = sp
                .signing_certificate
                .as_deref()
                .ok_or(SamlError::UntrustedCertificate)?;
            let mut trust = TrustStore::new();
            trust.add_der(certificate)?;
            self.engine
                .verify_document(&document, &request.id, &trust, now)?;
        }

        self.check_freshness(&request.id, request.issue_instant, now)?;

        Ok(ReceivedRequest {
            request_id: request.id,
            issuer: request.issuer,
            acs_url,
            issue_instant: request.issue_instant,
            name_id_format: request.name_id_format,
        })
    }

    /// The last instant at which a request issued at `issue_instant` is
    /// still accepted.
    fn accepted_until(&self, issue_instant: OffsetDateTime) -> OffsetDateTime {
        issue_instant + self.max_request_age + self.window.clock_skew
    }

    fn check_freshness(
        &self,
        request_id: &str,
        issue_instant: OffsetDateTime,
        now: OffsetDateTime,
    ) -> SamlResult<()> {
        if issue_instant > now + self.window.clock_skew {
            return Err(SamlError::ClockSkewExceeded(format!(
                "request {request_id} issued in the future"
            )));
        }
        if self.accepted_until(issue_instant) < now {
            return Err(SamlError::ClockSkewExceeded(format!(
                "request {request_id} is too old"
            )));
        }
        Ok(())
    }

    /// Answers an accepted request for the authenticated `identity_key`. The
    /// request must still be fresh at `now`.
    pub fn respond(
        &self,
        request: &ReceivedRequest,
        identity_key: &str,
        now: OffsetDateTime,
    ) -> FlowOutcome {
        let issued = self
            .check_freshness(&request.request_id, request.issue_instant, now)
            .and_then(|()| self.issue(request, true, identity_key, now));
        match issued {
            Ok(response) => FlowOutcome::Success(response),
            Err(error) => {
                transition(FlowState::RequestReceived, FlowState::Rejected, &request.request_id);
                let response = self
                    .error_response(&request.request_id, &request.acs_url, &error, now)
                    .map_err(|e| warn!(error = %e, "could not sign error response"))
                    .ok();
                FlowOutcome::Rejected { error, response }
            }
        }
    }

    /// IdP-initiated SSO to the default endpoint of `audience`.
    pub fn authenticate(&self, identity_key: &str, audience: &str) -> SamlResult<SignedResponse> {
        self.authenticate_at(identity_key, audience, OffsetDateTime::now_utc())
    }

    pub fn authenticate_at(
        &self,
        identity_key: &str,
        audience: &str,
        now: OffsetDateTime,
    ) -> SamlResult<SignedResponse> {
        let sp = self
            .provider
            .service_provider(audience)
            .ok_or_else(|| SamlError::InvalidAudience(format!("{audience} is not a known service provider")))?;
        let request = ReceivedRequest {
            request_id: random_id(),
            issuer: audience.to_string(),
            acs_url: default_acs_url(sp)?.to_string(),
            issue_instant: now,
            name_id_format: None,
        };
        transition(FlowState::Idle, FlowState::RequestReceived, &request.request_id);

        self.issue(&request, false, identity_key, now)
            .map_err(|error| {
                warn!(%error, audience, "unsolicited response rejected");
                error
            })
    }

    fn issue(
        &self,
        request: &ReceivedRequest,
        solicited: bool,
        identity_key: &str,
        now: OffsetDateTime,
    ) -> SamlResult<SignedResponse> {
        let audience = request.issuer.as_str();
        let acs_url = request.acs_url.as_str();
        let request_id = request.request_id.as_str();
        let identity = self.resolver.resolve_identity(identity_key).map_err(|e| match e {
            SamlError::UnknownIdentity(user) => SamlError::AuthnFailed(user),
            other => other,
        })?;
        transition(FlowState::RequestReceived, FlowState::IdentityResolved, request_id);

        // Remembered for as long as the request itself would be accepted.
        let expires_at =
            (now + self.replay_window).max(self.accepted_until(request.issue_instant));
        if !self.replay.observe_at(request_id, expires_at, now) {
            return Err(SamlError::ReplayDetected(request_id.to_string()));
        }

        let authn_context = AuthnContext {
            class_ref: self.authn_context_class.clone(),
            authn_instant: Some(now),
            session_index: None,
        };
        let mut assertion = self
            .builder
            .build(
                self.subject(&identity),
                identity.attributes,
                &[audience.to_string()],
                self.window,
                &authn_context,
                now,
            )?
            .recipient(acs_url);
        if solicited {
            assertion = assertion.in_response_to(request_id);
        }
        if !self
            .replay
            .observe_at(&assertion.id, assertion.not_on_or_after, now)
        {
            return Err(SamlError::ReplayDetected(assertion.id));
        }
        transition(FlowState::IdentityResolved, FlowState::AssertionIssued, request_id);

        let signed_assertion = self
            .engine
            .sign(assertion.to_element()?, &self.key, &self.options)?;
        let document = ResponseDocument {
            id: random_id(),
            issuer: self.entity_id.clone(),
            issue_instant: assertion.issue_instant,
            destination: Some(acs_url.to_string()),
            in_response_to: solicited.then(|| request_id.to_string()),
            status: Status::success(),
            assertion: Some(signed_assertion.into_element()),
        };
        let response = self.finish(&document, self.sign_response)?;
        transition(FlowState::AssertionIssued, FlowState::ResponseSigned, request_id);
        transition(FlowState::ResponseSigned, FlowState::Success, request_id);
        info!(
            request = request_id,
            assertion = %assertion.id,
            audience,
            subject = %assertion.subject.name_id,
            "issued assertion"
        );
        Ok(SignedResponse {
            assertion_id: Some(assertion.id),
            ..response
        })
    }

    fn error_response(
        &self,
        request_id: &str,
        acs_url: &str,
        error: &SamlError,
        now: OffsetDateTime,
    ) -> SamlResult<SignedResponse> {
        let document = ResponseDocument {
            id: random_id(),
            issuer: self.entity_id.clone(),
            issue_instant: whole_seconds(now),
            destination: Some(acs_url.to_string()),
            in_response_to: Some(request_id.to_string()),
            status: error.status(),
            assertion: None,
        };
        self.finish(&document, true)
    }

    fn finish(&self, document: &ResponseDocument, sign: bool) -> SamlResult<SignedResponse> {
        let mut element = document.to_element()?;
        if sign {
            element = self.engine.sign(element, &self.key, &self.options)?.into_element();
        }
        Ok(SignedResponse {
            response_id: document.id.clone(),
            in_response_to: document.in_response_to.clone(),
            destination: document.destination.clone(),
            assertion_id: None,
            status: document.status.clone(),
            xml: element.to_document(),
        })
    }

    /// NameID per policy: the configured attribute's first value, else the
    /// username.
    fn subject(&self, identity: &ResolvedIdentity) -> Subject {
        let name_id = self
            .name_id
            .attribute
            .as_deref()
            .and_then(|name| {
                identity
                    .attributes
                    .first(name)
                    .or_else(|| identity.raw.first(name))
            })
            .map(str::to_string)
            .unwrap_or_else(|| {
                debug!(identity = %identity.username, "NameID falls back to the username");
                identity.username.clone()
            });
        Subject {
            name_id,
            format: self.name_id.format.clone(),
        }
    }
}

impl fmt::Debug for IdentityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityProvider")
            .field("entity_id", &self.entity_id)
            .field("window", &self.window)
            .field("sign_response", &self.sign_response)
            .finish_non_exhaustive()
    }
}

fn default_acs_url(sp: &ServiceProvider) -> SamlResult<&str> {
    sp.default_acs_url().ok_or_else(|| {
        SamlError::Config(format!("{} has no assertion consumer service", sp.entity_id))
    })
}

fn transition(from: FlowState, to: FlowState, request: &str) {
    debug!(%from, %to, request, "flow transition");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        authn_request::AuthnRequestBuilder,
        response::{ResponseValidator, StatusCode},
        NAME_ID_FORMAT_UNSPECIFIED,
    };
    use time::macros::datetime;

    const CONFIG: &str = include_str!("../static/authsources.json");
    const IDP_KEY: &[u8] = include_bytes!("../static/idp.key");
    const IDP_CERT: &[u8] = include_bytes!("../static/idp.crt");

    fn now() -> OffsetDateTime {
        datetime!(2030-01-01 12:00:00 UTC)
    }

    fn idp() -> IdentityProvider {
        let config = IdpConfig::from_json(CONFIG).unwrap();
        let key = Arc::new(SigningKey::from_pem(IDP_KEY, IDP_CERT).unwrap());
        IdentityProvider::from_config(&config, key).unwrap()
    }

    fn request(id: &str, acs: &str) -> String {
        AuthnRequestBuilder::new()
            .id(id)
            .issue_instant(now())
            .issuer("https://sp.example")
            .destination("http://localhost:8090/simplesaml/saml2/idp/SSOService.php")
            .consumer_url(acs)
            .name_format(NAME_ID_FORMAT_UNSPECIFIED)
            .build()
            .unwrap()
    }

    #[test]
    fn accepts_known_request() {
        let received = idp()
            .receive_authn_request(request("_r1", "https://sp.example/acs/alt").as_bytes(), now())
            .unwrap();
        assert_eq!(received.request_id(), "_r1");
        assert_eq!(received.issuer(), "https://sp.example");
        assert_eq!(received.acs_url(), "https://sp.example/acs/alt");
        assert_eq!(received.issue_instant(), now());
        assert_eq!(received.name_id_format(), Some(NAME_ID_FORMAT_UNSPECIFIED));
    }

    #[test]
    fn unregistered_acs_is_rejected() {
        let err = idp()
            .receive_authn_request(request("_r1", "https://evil.example/acs").as_bytes(), now())
            .unwrap_err();
        assert!(matches!(err, SamlError::AcsUrlMismatch { .. }));
    }

    #[test]
    fn unknown_issuer_is_rejected() {
        let xml = request("_r1", "https://sp.example/acs").replace(
            ">https://sp.example</saml:Issuer>",
            ">https://unknown.example</saml:Issuer>",
        );
        let err = idp().receive_authn_request(xml.as_bytes(), now()).unwrap_err();
        assert!(matches!(err, SamlError::UnknownIssuer(_)));
    }

    #[test]
    fn stale_and_future_requests_are_rejected() {
        let idp = idp();
        let xml = request("_r1", "https://sp.example/acs");
        for at in [now() - Duration::minutes(5), now() + Duration::minutes(10)] {
            assert!(matches!(
                idp.receive_authn_request(xml.as_bytes(), at),
                Err(SamlError::ClockSkewExceeded(_))
            ));
        }
        // Within the skew allowance.
        idp.receive_authn_request(xml.as_bytes(), now() - Duration::seconds(30))
            .unwrap();
    }

    #[test]
    fn failed_login_yields_signed_error_response() {
        let idp = idp();
        let received = idp
            .receive_authn_request(request("_r1", "https://sp.example/acs").as_bytes(), now())
            .unwrap();
        let outcome = idp.respond(&received, "user1:wrong", now());
        assert_eq!(outcome.state(), FlowState::Rejected);

        let response = outcome.response().unwrap().clone();
        assert_eq!(response.status.sub_code, Some(StatusCode::AuthnFailed));
        assert_eq!(response.assertion_id, None);
        assert!(!response.xml.contains("Assertion"));

        let mut trust = TrustStore::new();
        trust.add_pem(IDP_CERT).unwrap();
        let verified = SignatureEngine::default()
            .verify_xml(&response.xml, &trust, now())
            .unwrap();
        assert_eq!(verified.reference_id, response.response_id);
        let err = ResponseValidator::new(trust, "https://sp.example")
            .validate(response.xml.as_bytes(), Some("_r1"), now())
            .unwrap_err();
        match err {
            SamlError::StatusNotSuccess(status) => {
                assert!(status.contains("Responder"), "{status}");
                assert!(status.contains("AuthnFailed"), "{status}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(outcome.into_result(), Err(SamlError::AuthnFailed(_))));

        // A failed login does not consume the request.
        assert_eq!(
            idp.respond(&received, "user1:password", now()).state(),
            FlowState::Success
        );
    }

    #[test]
    fn replayed_request_is_refused() {
        let idp = idp();
        let received = idp
            .receive_authn_request(request("_r1", "https://sp.example/acs").as_bytes(), now())
            .unwrap();
        assert_eq!(
            idp.respond(&received, "user1:password", now()).state(),
            FlowState::Success
        );
        let replay = idp.respond(&received, "user1:password", now() + Duration::seconds(5));
        let status = replay.response().unwrap().status.clone();
        assert_eq!(status.sub_code, Some(StatusCode::RequestDenied));
        assert!(matches!(replay.into_result(), Err(SamlError::ReplayDetected(_))));
    }

    #[test]
    fn stale_request_is_refused_when_answered() {
        let idp = idp();
        let received = idp
            .receive_authn_request(request("_r1", "https://sp.example/acs").as_bytes(), now())
            .unwrap();
        let late = idp.respond(&received, "user1:password", now() + Duration::minutes(7));
        assert_eq!(late.state(), FlowState::Rejected);
        assert_eq!(
            late.response().unwrap().status.sub_code,
            Some(StatusCode::RequestDenied)
        );
        assert!(matches!(late.into_result(), Err(SamlError::ClockSkewExceeded(_))));
        assert!(idp.replay_cache().is_empty());
    }

    #[test]
    fn unsolicited_response_has_no_in_response_to() {
        let response = idp()
            .authenticate_at("user2:password", "https://sp.example", now())
            .unwrap();
        assert_eq!(response.in_response_to, None);
        assert_eq!(response.destination.as_deref(), Some("https://sp.example/acs"));
        assert!(!response.xml.contains("InResponseTo"));
    }

    #[test]
    fn unknown_audience_is_rejected() {
        let err = idp()
            .authenticate_at("user1:password", "https://unknown.example", now())
            .unwrap_err();
        assert!(matches!(err, SamlError::InvalidAudience(_)));
    }

    #[test]
    fn publishes_metadata() {
        let metadata = idp().metadata().unwrap();
        assert!(metadata.contains("http://localhost:8090/simplesaml/saml2/idp/metadata.php"));
        assert!(metadata.contains("SingleSignOnService"));
    }
}
