use crate::kobold::config::KoboldConfig;
use crate::kobold::genkeys::{generate_genkey, GenKeyRegistry};
use crate::kobold::request::{
    abort_succeeded, build_generate_body, endpoint_url, is_json, parse_extra_version,
    parse_generate_response, ABORT_PATH, EXTRA_VERSION_PATH, GENERATE_PATH, V1_VERSION_PATH,
};
use gen_core::llm::{GenError, GenOpts, TextGenerator};
use reqwest::{Client, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Which server family is answering on the endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    /// KoboldAI: generate only.
    Basic,
    /// koboldcpp: accepts a genkey per generation and can abort it.
    Extended,
}

/// Why an abort request did not go through. Only ever reported, never fatal.
#[derive(Error, Debug)]
pub enum CancelFailure {
    #[error("server dialect does not support aborts")] Unsupported,
    #[error("no genkey registered for channel {0}")] NoGenKey(String),
    #[error("abort rejected: {0}")] Rejected(String),
    #[error("abort transport: {0}")] Transport(String),
}

pub struct KoboldClient {
    http: Client,
    blocking: OnceLock<reqwest::blocking::Client>,
    cfg: KoboldConfig,
    genkeys: Arc<GenKeyRegistry>,
    extended: AtomicBool,
}

impl KoboldClient {
    pub fn new(cfg: KoboldConfig) -> anyhow::Result<Self> {
        Self::with_genkeys(cfg, Arc::new(GenKeyRegistry::new()))
    }

    /// Builds a client that records genkeys into a caller-owned registry.
    pub fn with_genkeys(cfg: KoboldConfig, genkeys: Arc<GenKeyRegistry>) -> anyhow::Result<Self> {
        let mut builder = Client::builder().use_rustls_tls();
        if let Some(t) = cfg.timeout {
            builder = builder.timeout(t);
        }
        if let Some(p) = &cfg.proxy {
            builder = builder.proxy(reqwest::Proxy::all(p)?);
        }
        let http = builder.build()?;
        Ok(Self {
            http,
            blocking: OnceLock::new(),
            cfg,
            genkeys,
            extended: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &KoboldConfig {
        &self.cfg
    }

    pub fn genkeys(&self) -> &Arc<GenKeyRegistry> {
        &self.genkeys
    }

    pub fn dialect(&self) -> Dialect {
        if self.extended.load(Ordering::Acquire) {
            Dialect::Extended
        } else {
            Dialect::Basic
        }
    }

    pub fn set_dialect(&self, dialect: Dialect) {
        self.extended
            .store(dialect == Dialect::Extended, Ordering::Release);
    }

    fn url(&self, path: &str) -> String {
        endpoint_url(&self.cfg.endpoint, path)
    }

    // Built on first use so async-only callers never create it inside a runtime.
    fn blocking_http(&self) -> Result<&reqwest::blocking::Client, GenError> {
        if let Some(c) = self.blocking.get() {
            return Ok(c);
        }
        // The blocking builder defaults to a 30s timeout; the async one has none.
        let mut builder = reqwest::blocking::Client::builder()
            .use_rustls_tls()
            .timeout(self.cfg.timeout);
        if let Some(p) = &self.cfg.proxy {
            builder = builder.proxy(reqwest::Proxy::all(p).map_err(map_reqwest_err)?);
        }
        let client = builder.build().map_err(map_reqwest_err)?;
        Ok(self.blocking.get_or_init(|| client))
    }

    /// Request body for one generation. In the extended dialect this also
    /// mints the genkey and registers it for the channel before anything is sent.
    fn prepare_generate(&self, prompt: &str, opts: &GenOpts) -> Result<serde_json::Value, GenError> {
        let genkey = match self.dialect() {
            Dialect::Basic => None,
            Dialect::Extended => Some(match opts.channel() {
                Some(channel) => {
                    let key = self.genkeys.register(channel);
                    debug!(target:"providers::kobold","registered genkey={} channel={}", key, channel);
                    key
                }
                None => generate_genkey(),
            }),
        };
        build_generate_body(
            prompt,
            &self.cfg.generation,
            opts.stop_sequences(),
            genkey.as_deref(),
        )
    }

    async fn get_text_async(&self, path: &str) -> Result<String, GenError> {
        let resp = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let status = resp.status();
        let raw = resp.text().await.map_err(map_reqwest_err)?;
        if !status.is_success() {
            return Err(map_status_err(status, &raw));
        }
        Ok(raw)
    }

    fn get_text_blocking(&self, path: &str) -> Result<String, GenError> {
        let resp = self
            .blocking_http()?
            .get(self.url(path))
            .send()
            .map_err(map_reqwest_err)?;
        let status = resp.status();
        let raw = resp.text().map_err(map_reqwest_err)?;
        if !status.is_success() {
            return Err(map_status_err(status, &raw));
        }
        Ok(raw)
    }

    /// Detects the server dialect and returns its version.
    ///
    /// The extended dialect is tried first and reports its real version; the
    /// basic dialect has no meaningful version and yields `0.0`. The detected
    /// dialect replaces whatever a previous probe found.
    pub async fn check_version_async(&self) -> Result<f64, GenError> {
        let extended = self.get_text_async(EXTRA_VERSION_PATH).await;
        if let Some(v) = self.accept_extended(extended) {
            return Ok(v);
        }
        let basic = self.get_text_async(V1_VERSION_PATH).await;
        self.accept_basic(basic)
    }

    /// Blocking form of [`KoboldClient::check_version_async`].
    pub fn check_version(&self) -> Result<f64, GenError> {
        let extended = self.get_text_blocking(EXTRA_VERSION_PATH);
        if let Some(v) = self.accept_extended(extended) {
            return Ok(v);
        }
        let basic = self.get_text_blocking(V1_VERSION_PATH);
        self.accept_basic(basic)
    }

    fn accept_extended(&self, res: Result<String, GenError>) -> Option<f64> {
        let version = match res {
            Ok(raw) => parse_extra_version(&raw),
            Err(e) => {
                debug!(target:"providers::kobold","extended version probe failed: {}", e);
                None
            }
        }?;
        self.set_dialect(Dialect::Extended);
        info!(target:"providers::kobold","endpoint runs koboldcpp version={}; pass --multiuser to it when using several channels", version);
        Some(version)
    }

    fn accept_basic(&self, res: Result<String, GenError>) -> Result<f64, GenError> {
        match res {
            Ok(raw) if is_json(&raw) => {
                self.set_dialect(Dialect::Basic);
                info!(target:"providers::kobold","endpoint runs KoboldAI");
                Ok(0.0)
            }
            other => {
                let reason = match other {
                    Err(e) => e.to_string(),
                    Ok(raw) => format!("non-json version reply: {}", raw),
                };
                error!(target:"providers::kobold","no known dialect at {}: {}", self.cfg.endpoint, reason);
                Err(GenError::EndpointUnavailable(format!(
                    "{} is not running KoboldAI or koboldcpp ({})",
                    self.cfg.endpoint, reason
                )))
            }
        }
    }

    fn abort_key(&self, channel: &str) -> Result<String, CancelFailure> {
        if self.dialect() != Dialect::Extended {
            return Err(CancelFailure::Unsupported);
        }
        self.genkeys
            .get(channel)
            .ok_or_else(|| CancelFailure::NoGenKey(channel.to_string()))
    }

    /// Asks the server to stop the generation last started on `channel`.
    ///
    /// Best effort: the generation may already be done, or the server may not
    /// know the key. Failures are logged and returned for inspection only.
    pub async fn abort(&self, channel: &str) -> Result<(), CancelFailure> {
        let outcome = match self.abort_key(channel) {
            Ok(genkey) => {
                let sent = self
                    .http
                    .post(self.url(ABORT_PATH))
                    .json(&serde_json::json!({ "genkey": genkey }))
                    .send()
                    .await;
                match sent {
                    Ok(resp) => {
                        let status = resp.status();
                        let raw = resp.text().await.unwrap_or_default();
                        abort_outcome(status, &raw)
                    }
                    Err(e) => Err(CancelFailure::Transport(e.to_string())),
                }
            }
            Err(e) => Err(e),
        };
        report_abort(channel, outcome)
    }

    /// Blocking form of [`KoboldClient::abort`].
    pub fn abort_blocking(&self, channel: &str) -> Result<(), CancelFailure> {
        let outcome = self.abort_key(channel).and_then(|genkey| {
            let http = self
                .blocking_http()
                .map_err(|e| CancelFailure::Transport(e.to_string()))?;
            let resp = http
                .post(self.url(ABORT_PATH))
                .json(&serde_json::json!({ "genkey": genkey }))
                .send()
                .map_err(|e| CancelFailure::Transport(e.to_string()))?;
            let status = resp.status();
            let raw = resp.text().unwrap_or_default();
            abort_outcome(status, &raw)
        });
        report_abort(channel, outcome)
    }
}

impl TextGenerator for KoboldClient {
    fn llm_type(&self) -> &'static str {
        "koboldai"
    }

    fn generate(&self, prompt: &str, opts: &GenOpts) -> Result<String, GenError> {
        let url = self.url(GENERATE_PATH);
        let body = self.prepare_generate(prompt, opts)?;
        info!(target:"providers::kobold","generate (blocking) url={} prompt_len={}", url, prompt.len());
        let resp = self
            .blocking_http()?
            .post(&url)
            .json(&body)
            .send()
            .map_err(map_reqwest_err)?;
        let status = resp.status();
        let raw = resp.text().map_err(map_reqwest_err)?;
        if !status.is_success() {
            error!(target:"providers::kobold","generate non-200 status={} body={:?}", status, raw);
            return Err(map_status_err(status, &raw));
        }
        parse_generate_response(&raw, opts.stop_sequences())
    }

    async fn agenerate(&self, prompt: &str, opts: &GenOpts) -> Result<String, GenError> {
        let url = self.url(GENERATE_PATH);
        let body = self.prepare_generate(prompt, opts)?;
        info!(target:"providers::kobold","generate url={} prompt_len={}", url, prompt.len());
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let status = resp.status();
        let raw = resp.text().await.map_err(map_reqwest_err)?;
        if !status.is_success() {
            error!(target:"providers::kobold","generate non-200 status={} body={:?}", status, raw);
            return Err(map_status_err(status, &raw));
        }
        parse_generate_response(&raw, opts.stop_sequences())
    }
}

fn abort_outcome(status: StatusCode, raw: &str) -> Result<(), CancelFailure> {
    if status == StatusCode::OK && abort_succeeded(raw) {
        Ok(())
    } else {
        Err(CancelFailure::Rejected(format!("{} {}", status.as_u16(), raw)))
    }
}

fn report_abort(channel: &str, outcome: Result<(), CancelFailure>) -> Result<(), CancelFailure> {
    match &outcome {
        Ok(()) => info!(target:"providers::kobold","aborted generation channel={}", channel),
        Err(e) => warn!(target:"providers::kobold","error aborting generation channel={}: {}", channel, e),
    }
    outcome
}

fn map_reqwest_err(e: reqwest::Error) -> GenError {
    if e.is_timeout() {
        GenError::Transport(format!("timeout: {}", e))
    } else if e.is_connect() {
        GenError::Transport(format!("connect: {}", e))
    } else {
        GenError::Transport(e.to_string())
    }
}

fn map_status_err(status: StatusCode, body: &str) -> GenError {
    GenError::Transport(format!("{} {}", status.as_u16(), body))
}
