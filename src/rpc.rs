use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::util::truncate;

pub const METHOD_LIST_TRAJECTORIES: &str = "GetAllCascadeTrajectories";
pub const METHOD_TRAJECTORY_STEPS: &str = "GetCascadeTrajectorySteps";
pub const METHOD_USER_STATUS: &str = "GetUserStatus";
pub const METHOD_PROBE: &str = "GetUnleashData";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_RESPONSE_BYTES: usize = 50 * 1024 * 1024;
pub const MAX_PROBE_RESPONSE_BYTES: usize = 1024 * 1024;

const SERVICE_PATH: &str = "/exa.language_server_pb.LanguageServerService";
const ERROR_BODY_PREVIEW: usize = 200;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("{method} returned HTTP {status}: {body}")]
    Status {
        method: String,
        status: u16,
        body: String,
    },

    #[error("{method} transport error: {message}")]
    Transport { method: String, message: String },

    #[error("{method} returned a malformed body: {message}")]
    Malformed { method: String, message: String },

    #[error("{method} response exceeded {limit} bytes")]
    Oversize { method: String, limit: usize },

    #[error("request cancelled")]
    Cancelled,
}

impl RpcError {
    pub fn transport(method: &str, message: impl Into<String>) -> Self {
        Self::Transport {
            method: method.to_string(),
            message: message.into(),
        }
    }

    pub fn malformed(method: &str, message: impl Into<String>) -> Self {
        Self::Malformed {
            method: method.to_string(),
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn class(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Transport { .. } => "transport",
            Self::Malformed { .. } => "malformed",
            Self::Oversize { .. } => "oversize",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<(), RpcError> {
        if self.is_cancelled() {
            Err(RpcError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub pid: u32,
    pub port: u16,
    #[serde(skip)]
    pub csrf_token: String,
    pub use_tls: bool,
}

impl Endpoint {
    pub fn method_url(&self, method: &str) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{scheme}://127.0.0.1:{}{SERVICE_PATH}/{method}", self.port)
    }

    pub fn describe(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("pid {} | {scheme} port {}", self.pid, self.port)
    }
}

pub trait RpcTransport: Send + Sync {
    fn call(
        &self,
        method: &str,
        payload: &Value,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Value, RpcError>;
}

#[derive(Clone)]
pub struct HttpRpcClient {
    endpoint: Endpoint,
    agent: ureq::Agent,
}

impl HttpRpcClient {
    pub fn new(endpoint: Endpoint, agent: ureq::Agent) -> Self {
        Self { endpoint, agent }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn call_with_limit(
        &self,
        method: &str,
        payload: &Value,
        timeout: Duration,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<Value, RpcError> {
        cancel.check()?;

        let url = self.endpoint.method_url(method);
        let result = self
            .agent
            .post(&url)
            .timeout(timeout)
            .set("Content-Type", "application/json")
            .set("Connect-Protocol-Version", "1")
            .set("x-codeium-csrf-token", &self.endpoint.csrf_token)
            .send_string(&payload.to_string());

        cancel.check()?;

        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                let body = read_capped(response, ERROR_BODY_PREVIEW)
                    .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
                    .unwrap_or_default();
                return Err(RpcError::Status {
                    method: method.to_string(),
                    status,
                    body: truncate(&body, ERROR_BODY_PREVIEW),
                });
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(RpcError::transport(method, transport.to_string()));
            }
        };

        let bytes = read_capped(response, limit)
            .map_err(|err| RpcError::transport(method, err.to_string()))?;
        if bytes.len() > limit {
            return Err(RpcError::Oversize {
                method: method.to_string(),
                limit,
            });
        }

        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|err| RpcError::malformed(method, err.to_string()))?;
        if !value.is_object() {
            return Err(RpcError::malformed(method, "expected a JSON object"));
        }
        Ok(value)
    }
}

impl RpcTransport for HttpRpcClient {
    fn call(
        &self,
        method: &str,
        payload: &Value,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Value, RpcError> {
        self.call_with_limit(method, payload, timeout, MAX_RESPONSE_BYTES, cancel)
    }
}

/// Reads at most `limit + 1` bytes so oversize bodies are detectable without buffering them.
fn read_capped(response: ureq::Response, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(limit as u64 + 1)
        .read_to_end(&mut bytes)?;
    Ok(bytes)
}

pub fn loopback_agent() -> ureq::Agent {
    match loopback_tls_config() {
        Ok(config) => ureq::AgentBuilder::new()
            .tls_config(Arc::new(config))
            .build(),
        Err(err) => {
            warn!(error = %err, "failed to build loopback TLS config; https probes will fail");
            ureq::AgentBuilder::new().build()
        }
    }
}

fn loopback_tls_config() -> Result<ClientConfig, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = LoopbackCertVerifier {
        provider: Arc::clone(&provider),
    };
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(config)
}

#[derive(Debug)]
struct LoopbackCertVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for LoopbackCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
