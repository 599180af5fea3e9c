use crate::types::RegistrationSpec;
use reqwest::redirect::Policy;

/// HTTP client used to reach one record's backend, configured with the
/// record's TLS settings. Built once per record update.
#[derive(Clone, Debug)]
pub struct BackendTransport {
    client: reqwest::Client,
}

impl BackendTransport {
    pub fn build(spec: &RegistrationSpec) -> Result<Self, String> {
        let mut builder = reqwest::Client::builder()
            // Redirects are handed back to the caller, never followed.
            .redirect(Policy::none())
            .no_proxy()
            .danger_accept_invalid_certs(spec.insecure_skip_tls_verify);

        if let Some(pem) = spec.ca_bundle.as_deref().filter(|pem| !pem.trim().is_empty()) {
            let certificate = reqwest::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| format!("invalid CA bundle: {e}"))?;
            builder = builder.add_root_certificate(certificate);
        }

        let client = builder
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;

        Ok(BackendTransport { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}
