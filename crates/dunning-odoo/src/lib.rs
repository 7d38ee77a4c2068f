//! Odoo JSON-RPC client + cache-aware batch enrichment of overdue invoices.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use dunning_core::{
    company_from_invoice_number, days_overdue, parse_erp_date, FetchOutcome, InvoiceRecord,
    DEFAULT_CURRENCY_SYMBOL, UNKNOWN_CLIENT, UNKNOWN_COMPANY,
};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::de::{DeserializeOwned, Deserializer, Error as _};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "dunning-odoo";

const AUTHENTICATE_PATH: &str = "/web/session/authenticate";
const CALL_KW_PATH: &str = "/web/dataset/call_kw";
const REPORT_PDF_PATH: &str = "/report/pdf";

/// QWeb report that prints customer invoices.
pub const INVOICE_REPORT: &str = "account.report_invoice";

const SESSION_EXPIRED_CODE: i64 = 100;
const SESSION_EXPIRED_EXCEPTION: &str = "SessionExpiredException";

const INVOICE_MODEL: &str = "account.move";
const INVOICE_FIELDS: [&str; 11] = [
    "id",
    "name",
    "partner_id",
    "amount_total",
    "amount_residual",
    "invoice_date",
    "invoice_date_due",
    "payment_state",
    "currency_id",
    "company_id",
    "invoice_origin",
];

#[derive(Debug, Error)]
pub enum OdooError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("odoo rpc error: {message}")]
    Rpc { message: String },
    #[error("odoo session expired")]
    SessionExpired,
    #[error("authentication rejected for {login} on database {database}")]
    AuthenticationRejected { database: String, login: String },
    #[error("malformed odoo payload: {0}")]
    Malformed(String),
    #[error("incomplete odoo configuration: {0}")]
    Configuration(String),
}

impl From<serde_json::Error> for OdooError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl OdooError {
    /// Rate limits, gateway errors and dropped connections may clear up on
    /// a resend; everything else is final for this request.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || (500..600).contains(status)
            }
            _ => false,
        }
    }
}

/// Resend budget for transient transport failures. Delays double from
/// `base_delay` up to `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    pub fn delay_before_retry(&self, retry: usize) -> Duration {
        let exponent = u32::try_from(retry).unwrap_or(u32::MAX);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

#[derive(Clone)]
pub struct OdooCredentials {
    pub url: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl OdooCredentials {
    pub fn is_complete(&self) -> bool {
        [&self.url, &self.database, &self.username, &self.password]
            .iter()
            .all(|value| !value.trim().is_empty())
    }
}

impl fmt::Debug for OdooCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OdooCredentials")
            .field("url", &self.url)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct OdooClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for OdooClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// The slice of Odoo's RPC surface the fetcher depends on.
#[async_trait]
pub trait OdooRpc: Send + Sync {
    /// Opens a session and returns the numeric user id.
    async fn authenticate(&self) -> Result<i64, OdooError>;

    /// `call_kw` on `model.method(*args, **kwargs)`, returning the raw result.
    async fn call_kw(
        &self,
        model: &str,
        method: &str,
        args: Value,
        kwargs: Value,
    ) -> Result<Value, OdooError>;

    /// Renders a QWeb report for `ids` as PDF bytes over the open session.
    async fn download_report(&self, report: &str, ids: &[i64]) -> Result<Vec<u8>, OdooError>;
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorPayload>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorPayload {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<RpcErrorData>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorData {
    #[serde(default)]
    name: String,
    #[serde(default)]
    message: String,
}

impl RpcErrorPayload {
    fn into_error(self) -> OdooError {
        let expired_name = self
            .data
            .as_ref()
            .is_some_and(|data| data.name.ends_with(SESSION_EXPIRED_EXCEPTION));
        if self.code == SESSION_EXPIRED_CODE || expired_name {
            return OdooError::SessionExpired;
        }
        let message = match &self.data {
            Some(data) if !data.message.is_empty() => {
                format!("{} ({}: {})", self.message, data.name, data.message)
            }
            _ => self.message,
        };
        OdooError::Rpc { message }
    }
}

/// JSON-RPC transport over Odoo's web endpoints. The session cookie set by
/// `authenticate` is kept by the client's cookie store and reused by report
/// downloads.
#[derive(Debug)]
pub struct JsonRpcClient {
    client: reqwest::Client,
    credentials: OdooCredentials,
    retry: RetryPolicy,
}

impl JsonRpcClient {
    pub fn new(credentials: OdooCredentials, config: OdooClientConfig) -> Result<Self, OdooError> {
        let mut builder = reqwest::Client::builder()
            .cookie_store(true)
            .gzip(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let credentials = OdooCredentials {
            url: credentials.url.trim_end_matches('/').to_string(),
            ..credentials
        };

        Ok(Self {
            client: builder.build()?,
            credentials,
            retry: config.retry,
        })
    }

    pub fn credentials(&self) -> &OdooCredentials {
        &self.credentials
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.credentials.url, path)
    }

    /// Sends the request built by `request`, resending on transient failures
    /// until the retry budget runs out. Non-2xx answers become `HttpStatus`.
    async fn send_with_retry<F>(&self, request: F) -> Result<reqwest::Response, OdooError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut retry = 0usize;
        loop {
            let err = match request().send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => OdooError::HttpStatus {
                    status: resp.status().as_u16(),
                    url: resp.url().to_string(),
                },
                Err(err) => OdooError::Request(err),
            };
            if retry >= self.retry.max_retries || !err.is_transient() {
                return Err(err);
            }
            debug!(error = %err, retry, "resending odoo request");
            tokio::time::sleep(self.retry.delay_before_retry(retry)).await;
            retry += 1;
        }
    }

    async fn fetch_pdf(&self, url: &str) -> Result<Vec<u8>, OdooError> {
        let resp = self.send_with_retry(|| self.client.get(url)).await?;
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let bytes = resp.bytes().await?;
        if content_type.contains("application/pdf") || bytes.starts_with(b"%PDF") {
            debug!(bytes = bytes.len(), "report rendered");
            Ok(bytes.to_vec())
        } else {
            Err(OdooError::Malformed(format!(
                "report at {url} answered with {content_type:?} instead of a PDF"
            )))
        }
    }

    async fn post_rpc(&self, path: &str, params: Value) -> Result<Value, OdooError> {
        let url = self.endpoint(path);
        let body = json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": params,
        });

        let resp = self
            .send_with_retry(|| self.client.post(&url).json(&body))
            .await?;
        let envelope: RpcEnvelope = resp.json().await?;
        match envelope.error {
            Some(error) => Err(error.into_error()),
            None => Ok(envelope.result.unwrap_or(Value::Null)),
        }
    }
}

#[async_trait]
impl OdooRpc for JsonRpcClient {
    async fn authenticate(&self) -> Result<i64, OdooError> {
        let params = json!({
            "db": self.credentials.database,
            "login": self.credentials.username,
            "password": self.credentials.password,
        });
        let span = info_span!("odoo_authenticate", database = %self.credentials.database);
        let result = self.post_rpc(AUTHENTICATE_PATH, params).instrument(span).await;

        let rejected = || OdooError::AuthenticationRejected {
            database: self.credentials.database.clone(),
            login: self.credentials.username.clone(),
        };
        match result {
            Ok(value) => value.get("uid").and_then(Value::as_i64).ok_or_else(rejected),
            Err(OdooError::Rpc { message }) => {
                warn!(%message, "odoo refused authentication");
                Err(rejected())
            }
            Err(err) => Err(err),
        }
    }

    async fn call_kw(
        &self,
        model: &str,
        method: &str,
        args: Value,
        kwargs: Value,
    ) -> Result<Value, OdooError> {
        let params = json!({
            "model": model,
            "method": method,
            "args": args,
            "kwargs": kwargs,
        });
        let span = info_span!("odoo_call_kw", model, method);
        self.post_rpc(CALL_KW_PATH, params).instrument(span).await
    }

    async fn download_report(&self, report: &str, ids: &[i64]) -> Result<Vec<u8>, OdooError> {
        let ids = ids
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let url = self.endpoint(&format!("{REPORT_PDF_PATH}/{report}/{ids}"));
        let span = info_span!("odoo_report", report, %ids);
        self.fetch_pdf(&url).instrument(span).await
    }
}

/// Odoo renders unset scalars as `false`.
fn optional_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null | Value::Bool(false) => Ok(None),
        Value::String(text) => Ok(Some(text)),
        other => Err(D::Error::custom(format!("expected text or false, got {other}"))),
    }
}

/// Many2one fields arrive as `[id, "display name"]`, a bare id, or `false`.
fn many2one_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null | Value::Bool(false) => Ok(None),
        Value::Number(number) => number
            .as_i64()
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("non-integer many2one id {number}"))),
        Value::Array(items) => items
            .first()
            .and_then(Value::as_i64)
            .map(Some)
            .ok_or_else(|| D::Error::custom("many2one pair without integer id")),
        other => Err(D::Error::custom(format!("unexpected many2one value {other}"))),
    }
}

/// One `account.move` row as returned by `search_read`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawInvoice {
    pub id: i64,
    pub name: String,
    #[serde(default, deserialize_with = "many2one_id")]
    pub partner_id: Option<i64>,
    pub amount_total: f64,
    pub amount_residual: f64,
    #[serde(default, deserialize_with = "optional_text")]
    pub invoice_date: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub invoice_date_due: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub payment_state: Option<String>,
    #[serde(default, deserialize_with = "many2one_id")]
    pub currency_id: Option<i64>,
    #[serde(default, deserialize_with = "many2one_id")]
    pub company_id: Option<i64>,
    #[serde(default, deserialize_with = "optional_text")]
    pub invoice_origin: Option<String>,
}

impl RawInvoice {
    pub fn has_positive_amounts(&self) -> bool {
        self.amount_total > 0.0 && self.amount_residual > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Partner,
    Currency,
    Company,
}

impl EntityKind {
    pub fn model(self) -> &'static str {
        match self {
            Self::Partner => "res.partner",
            Self::Currency => "res.currency",
            Self::Company => "res.company",
        }
    }

    pub fn fields(self) -> &'static [&'static str] {
        match self {
            Self::Partner => &["name", "email"],
            Self::Currency => &["name", "symbol"],
            Self::Company => &["name"],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.model())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Partner {
    pub id: i64,
    #[serde(default, deserialize_with = "optional_text")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Currency {
    pub id: i64,
    #[serde(default, deserialize_with = "optional_text")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Company {
    pub id: i64,
    #[serde(default, deserialize_with = "optional_text")]
    pub name: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct CacheState {
    partners: HashMap<i64, Partner>,
    currencies: HashMap<i64, Currency>,
    companies: HashMap<i64, Company>,
    populated_at: Option<Instant>,
}

impl CacheState {
    fn is_valid(&self, ttl: Duration) -> bool {
        self.populated_at
            .is_some_and(|populated_at| populated_at.elapsed() < ttl)
    }

    fn evict(&mut self) {
        if self.populated_at.take().is_some() {
            debug!("entity cache expired");
        }
        self.partners.clear();
        self.currencies.clear();
        self.companies.clear();
    }
}

pub(crate) trait CachedEntity: DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> i64;
    fn slot(state: &mut CacheState) -> &mut HashMap<i64, Self>;
}

impl CachedEntity for Partner {
    const KIND: EntityKind = EntityKind::Partner;

    fn id(&self) -> i64 {
        self.id
    }

    fn slot(state: &mut CacheState) -> &mut HashMap<i64, Self> {
        &mut state.partners
    }
}

impl CachedEntity for Currency {
    const KIND: EntityKind = EntityKind::Currency;

    fn id(&self) -> i64 {
        self.id
    }

    fn slot(state: &mut CacheState) -> &mut HashMap<i64, Self> {
        &mut state.currencies
    }
}

impl CachedEntity for Company {
    const KIND: EntityKind = EntityKind::Company;

    fn id(&self) -> i64 {
        self.id
    }

    fn slot(state: &mut CacheState) -> &mut HashMap<i64, Self> {
        &mut state.companies
    }
}

/// Partner/currency/company cache sharing a single TTL timestamp. Every
/// validity check, read and merge happens under one lock.
#[derive(Debug)]
pub struct EntityCache {
    ttl: Duration,
    state: Mutex<CacheState>,
}

impl EntityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn is_valid(&self) -> bool {
        self.state.lock().await.is_valid(self.ttl)
    }

    /// Splits `ids` into cached entries and ids that must go to the remote.
    /// Finding the cache expired empties all three maps, so a sibling lookup
    /// that refreshes the timestamp cannot revive entries from before expiry.
    async fn split<E: CachedEntity>(&self, ids: &[i64]) -> (HashMap<i64, E>, Vec<i64>) {
        let mut state = self.state.lock().await;
        if !state.is_valid(self.ttl) {
            state.evict();
            return (HashMap::new(), ids.to_vec());
        }
        let slot = E::slot(&mut state);
        let mut cached = HashMap::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match slot.get(id) {
                Some(entry) => {
                    cached.insert(*id, entry.clone());
                }
                None => missing.push(*id),
            }
        }
        (cached, missing)
    }

    async fn merge<E: CachedEntity>(&self, entries: &[E]) {
        let mut state = self.state.lock().await;
        let slot = E::slot(&mut state);
        for entry in entries {
            slot.insert(entry.id(), entry.clone());
        }
        state.populated_at = Some(Instant::now());
    }
}

/// Receives coarse progress while invoice records are assembled.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, message: &str, percent: f64);
}

impl<F> ProgressObserver for F
where
    F: Fn(&str, f64) + Send + Sync,
{
    fn on_progress(&self, message: &str, percent: f64) {
        self(message, percent)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub lookup_timeout: Duration,
    pub cache_ttl: Duration,
    pub invoice_limit: usize,
    pub progress_every: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            lookup_timeout: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(300),
            invoice_limit: 1000,
            progress_every: 20,
        }
    }
}

/// Connection settings read from the environment.
#[derive(Debug, Clone)]
pub struct OdooConfig {
    pub credentials: OdooCredentials,
    pub client: OdooClientConfig,
    pub connector: ConnectorConfig,
}

impl OdooConfig {
    pub fn from_env() -> Self {
        let connector_defaults = ConnectorConfig::default();
        Self {
            credentials: OdooCredentials {
                url: std::env::var("ODOO_URL").unwrap_or_default(),
                database: std::env::var("ODOO_DB").unwrap_or_default(),
                username: std::env::var("ODOO_USERNAME").unwrap_or_default(),
                password: std::env::var("ODOO_PASSWORD").unwrap_or_default(),
            },
            client: OdooClientConfig {
                timeout: env_secs("ODOO_HTTP_TIMEOUT_SECS", OdooClientConfig::default().timeout),
                user_agent: Some(format!("{CRATE_NAME}/{}", env!("CARGO_PKG_VERSION"))),
                retry: RetryPolicy::default(),
            },
            connector: ConnectorConfig {
                lookup_timeout: env_secs(
                    "ODOO_LOOKUP_TIMEOUT_SECS",
                    connector_defaults.lookup_timeout,
                ),
                cache_ttl: env_secs("ODOO_CACHE_TTL_SECS", connector_defaults.cache_ttl),
                ..connector_defaults
            },
        }
    }

    pub fn connect_http(&self) -> Result<OdooConnector, OdooError> {
        if !self.credentials.is_complete() {
            return Err(OdooError::Configuration(
                "ODOO_URL, ODOO_DB, ODOO_USERNAME and ODOO_PASSWORD must all be set".into(),
            ));
        }
        let client = JsonRpcClient::new(self.credentials.clone(), self.client.clone())?;
        Ok(OdooConnector::new(Arc::new(client), self.connector.clone()))
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Entities resolved for one fetch, keyed by remote id.
#[derive(Debug, Clone, Default)]
pub struct ResolvedEntities {
    pub partners: HashMap<i64, Partner>,
    pub currencies: HashMap<i64, Currency>,
    pub companies: HashMap<i64, Company>,
}

/// One authenticated Odoo connection plus the entity cache it owns.
pub struct OdooConnector {
    rpc: Arc<dyn OdooRpc>,
    cache: EntityCache,
    uid: Mutex<Option<i64>>,
    config: ConnectorConfig,
}

impl OdooConnector {
    pub fn new(rpc: Arc<dyn OdooRpc>, config: ConnectorConfig) -> Self {
        Self {
            rpc,
            cache: EntityCache::new(config.cache_ttl),
            uid: Mutex::new(None),
            config,
        }
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    /// Authenticates once; later calls reuse the session uid.
    pub async fn connect(&self) -> Result<i64, OdooError> {
        let mut uid = self.uid.lock().await;
        if let Some(uid) = *uid {
            return Ok(uid);
        }
        let fresh = self.rpc.authenticate().await?;
        info!(uid = fresh, "authenticated with odoo");
        *uid = Some(fresh);
        Ok(fresh)
    }

    /// Forgets `stale` so the next `connect` logs in again. A uid already
    /// replaced by a concurrent re-login is left alone.
    async fn invalidate_session(&self, stale: i64) {
        let mut uid = self.uid.lock().await;
        if *uid == Some(stale) {
            *uid = None;
        }
    }

    /// Runs `call` on an authenticated session. An expired session is
    /// re-opened and the call repeated once.
    async fn with_session<T, F, Fut>(&self, call: F) -> Result<T, OdooError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, OdooError>>,
    {
        let uid = self.connect().await?;
        match call().await {
            Err(OdooError::SessionExpired) => {
                warn!(uid, "odoo session expired; logging in again");
                self.invalidate_session(uid).await;
                self.connect().await?;
                call().await
            }
            other => other,
        }
    }

    /// Prints `invoice_ids` through Odoo's invoice report. `None` when there
    /// is nothing to print.
    pub async fn download_invoice_pdf(
        &self,
        invoice_ids: &[i64],
    ) -> Result<Option<Vec<u8>>, OdooError> {
        if invoice_ids.is_empty() {
            return Ok(None);
        }
        let pdf = self
            .with_session(|| self.rpc.download_report(INVOICE_REPORT, invoice_ids))
            .await?;
        info!(invoices = invoice_ids.len(), bytes = pdf.len(), "invoice pdf downloaded");
        Ok(Some(pdf))
    }

    /// Fetches and enriches every overdue customer invoice. Failures are
    /// logged and reported as `FetchOutcome::Failed`, never as an empty list.
    pub async fn fetch_overdue_invoices(
        &self,
        progress: Option<&dyn ProgressObserver>,
    ) -> FetchOutcome {
        let today = Local::now().date_naive();
        match self.try_fetch_overdue_invoices_at(progress, today).await {
            Ok(records) => {
                info!(invoices = records.len(), "overdue invoice fetch complete");
                FetchOutcome::from_records(records)
            }
            Err(err) => {
                warn!(error = %err, "overdue invoice fetch failed");
                FetchOutcome::failed(err.to_string())
            }
        }
    }

    pub async fn try_fetch_overdue_invoices_at(
        &self,
        progress: Option<&dyn ProgressObserver>,
        today: NaiveDate,
    ) -> Result<Vec<InvoiceRecord>, OdooError> {
        let rows = self.search_overdue_rows().await?;
        let fetched = rows.len();
        let rows: Vec<RawInvoice> = rows
            .into_iter()
            .filter(RawInvoice::has_positive_amounts)
            .collect();
        if rows.len() < fetched {
            debug!(
                dropped = fetched - rows.len(),
                "dropped invoices with non-positive amounts"
            );
        }

        let partner_ids = distinct_ids(rows.iter().map(|row| row.partner_id));
        let currency_ids = distinct_ids(rows.iter().map(|row| row.currency_id));
        let company_ids = distinct_ids(rows.iter().map(|row| row.company_id));
        info!(
            invoices = rows.len(),
            partners = partner_ids.len(),
            currencies = currency_ids.len(),
            companies = company_ids.len(),
            "resolving related entities"
        );

        let (partners, currencies, companies) = tokio::join!(
            self.lookup_or_empty::<Partner>(&partner_ids),
            self.lookup_or_empty::<Currency>(&currency_ids),
            self.lookup_or_empty::<Company>(&company_ids),
        );
        let resolved = ResolvedEntities {
            partners,
            currencies,
            companies,
        };

        assemble_records(&rows, &resolved, today, progress, self.config.progress_every)
    }

    pub async fn lookup_partners(&self, ids: &[i64]) -> Result<HashMap<i64, Partner>, OdooError> {
        self.batch_lookup(ids).await
    }

    pub async fn lookup_currencies(
        &self,
        ids: &[i64],
    ) -> Result<HashMap<i64, Currency>, OdooError> {
        self.batch_lookup(ids).await
    }

    pub async fn lookup_companies(&self, ids: &[i64]) -> Result<HashMap<i64, Company>, OdooError> {
        self.batch_lookup(ids).await
    }

    async fn search_overdue_rows(&self) -> Result<Vec<RawInvoice>, OdooError> {
        let domain = json!([[
            ["move_type", "=", "out_invoice"],
            ["amount_residual", ">", 0]
        ]]);
        let kwargs = json!({
            "fields": INVOICE_FIELDS,
            "limit": self.config.invoice_limit,
        });
        let result = self
            .with_session(|| {
                self.rpc
                    .call_kw(INVOICE_MODEL, "search_read", domain.clone(), kwargs.clone())
            })
            .await?;
        match result {
            Value::Null | Value::Bool(false) => Ok(Vec::new()),
            value => Ok(serde_json::from_value(value)?),
        }
    }

    /// Time-boxed lookup that degrades to an empty mapping.
    async fn lookup_or_empty<E: CachedEntity>(&self, ids: &[i64]) -> HashMap<i64, E> {
        match tokio::time::timeout(self.config.lookup_timeout, self.batch_lookup::<E>(ids)).await
        {
            Ok(Ok(entries)) => entries,
            Ok(Err(err)) => {
                warn!(kind = %E::KIND, error = %err, "batch lookup failed; using fallbacks");
                HashMap::new()
            }
            Err(_) => {
                warn!(
                    kind = %E::KIND,
                    timeout_secs = self.config.lookup_timeout.as_secs_f64(),
                    "batch lookup timed out; using fallbacks"
                );
                HashMap::new()
            }
        }
    }

    async fn batch_lookup<E: CachedEntity>(&self, ids: &[i64]) -> Result<HashMap<i64, E>, OdooError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let (mut resolved, missing) = self.cache.split::<E>(ids).await;
        if missing.is_empty() {
            debug!(kind = %E::KIND, count = resolved.len(), "served batch from cache");
            return Ok(resolved);
        }

        let args = json!([missing]);
        let kwargs = json!({ "fields": E::KIND.fields() });
        let value = self
            .with_session(|| {
                self.rpc
                    .call_kw(E::KIND.model(), "read", args.clone(), kwargs.clone())
            })
            .await?;
        let fetched: Vec<E> = match value {
            Value::Null | Value::Bool(false) => Vec::new(),
            value => serde_json::from_value(value)?,
        };

        self.cache.merge(&fetched).await;
        debug!(
            kind = %E::KIND,
            cached = resolved.len(),
            fetched = fetched.len(),
            "batch lookup complete"
        );
        resolved.extend(fetched.into_iter().map(|entry| (entry.id(), entry)));
        Ok(resolved)
    }
}

/// Distinct ids in first-seen order.
pub fn distinct_ids(ids: impl IntoIterator<Item = Option<i64>>) -> Vec<i64> {
    let mut seen = HashSet::new();
    ids.into_iter()
        .flatten()
        .filter(|id| seen.insert(*id))
        .collect()
}

/// Builds invoice records in row order, applying display fallbacks for
/// anything the lookups could not resolve.
pub fn assemble_records(
    rows: &[RawInvoice],
    resolved: &ResolvedEntities,
    today: NaiveDate,
    progress: Option<&dyn ProgressObserver>,
    progress_every: usize,
) -> Result<Vec<InvoiceRecord>, OdooError> {
    let total = rows.len();
    let every = progress_every.max(1);
    let mut records = Vec::with_capacity(total);

    for (index, row) in rows.iter().enumerate() {
        records.push(assemble_record(row, resolved, today)?);

        if let Some(observer) = progress {
            if index % every == 0 {
                let done = index + 1;
                observer.on_progress(
                    &format!("Processing invoice {done}/{total}"),
                    done as f64 / total as f64 * 100.0,
                );
            }
        }
    }

    Ok(records)
}

fn assemble_record(
    row: &RawInvoice,
    resolved: &ResolvedEntities,
    today: NaiveDate,
) -> Result<InvoiceRecord, OdooError> {
    let due_text = row.invoice_date_due.as_deref().ok_or_else(|| {
        OdooError::Malformed(format!("invoice {} has no invoice_date_due", row.name))
    })?;
    let due_date = parse_erp_date(due_text).ok_or_else(|| {
        OdooError::Malformed(format!(
            "invoice {} has unparseable due date {due_text:?}",
            row.name
        ))
    })?;

    let partner = row
        .partner_id
        .and_then(|id| resolved.partners.get(&id));
    let client_name = partner
        .and_then(|p| p.name.clone())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string());
    let client_email = partner.and_then(|p| p.email.clone()).unwrap_or_default();

    let currency_symbol = row
        .currency_id
        .and_then(|id| resolved.currencies.get(&id))
        .and_then(|c| c.symbol.clone())
        .unwrap_or_else(|| DEFAULT_CURRENCY_SYMBOL.to_string());

    let company_name = match row.company_id {
        Some(id) => resolved
            .companies
            .get(&id)
            .and_then(|c| c.name.clone())
            .unwrap_or_else(|| UNKNOWN_COMPANY.to_string()),
        None => company_from_invoice_number(&row.name).to_string(),
    };

    Ok(InvoiceRecord {
        id: row.id,
        invoice_number: row.name.clone(),
        client_name,
        client_email,
        amount_total: row.amount_total,
        amount_due: row.amount_residual,
        invoice_date: row.invoice_date.as_deref().and_then(parse_erp_date),
        due_date,
        days_overdue: days_overdue(due_date, today),
        payment_state: row.payment_state.clone().unwrap_or_default(),
        currency_symbol,
        company_name,
        origin: row.invoice_origin.clone().unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn row(id: i64, name: &str, partner: Option<i64>, company: Option<i64>) -> RawInvoice {
        RawInvoice {
            id,
            name: name.to_string(),
            partner_id: partner,
            amount_total: 100.0,
            amount_residual: 40.0,
            invoice_date: Some("2024-01-01".into()),
            invoice_date_due: Some("2024-01-31".into()),
            payment_state: Some("partial".into()),
            currency_id: Some(2),
            company_id: company,
            invoice_origin: None,
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, 10).unwrap()
    }

    #[test]
    fn raw_invoice_accepts_odoo_false_values() {
        let value = json!({
            "id": 7,
            "name": "PLAD/2024/0007",
            "partner_id": [11, "Acme Corp"],
            "amount_total": 1500.0,
            "amount_residual": 500.5,
            "invoice_date": "2024-01-02",
            "invoice_date_due": "2024-02-01",
            "payment_state": "partial",
            "currency_id": [3, "AED"],
            "company_id": false,
            "invoice_origin": false
        });
        let raw: RawInvoice = serde_json::from_value(value).expect("decode");
        assert_eq!(raw.partner_id, Some(11));
        assert_eq!(raw.currency_id, Some(3));
        assert_eq!(raw.company_id, None);
        assert_eq!(raw.invoice_origin, None);
        assert_eq!(raw.invoice_date_due.as_deref(), Some("2024-02-01"));
    }

    #[test]
    fn raw_invoice_rejects_missing_amounts() {
        let value = json!({"id": 1, "name": "INV/1", "amount_total": 10.0});
        assert!(serde_json::from_value::<RawInvoice>(value).is_err());
    }

    #[test]
    fn many2one_accepts_bare_ids() {
        let raw: Partner = serde_json::from_value(json!({
            "id": 4, "name": "Globex", "email": false
        }))
        .expect("decode");
        assert_eq!(raw.email, None);

        let invoice: RawInvoice = serde_json::from_value(json!({
            "id": 1, "name": "INV/1", "amount_total": 1.0, "amount_residual": 1.0,
            "partner_id": 9
        }))
        .expect("decode");
        assert_eq!(invoice.partner_id, Some(9));
        assert_eq!(invoice.company_id, None);
    }

    #[test]
    fn distinct_ids_keep_first_seen_order() {
        let ids = distinct_ids([Some(5), None, Some(3), Some(5), Some(1), Some(3)]);
        assert_eq!(ids, vec![5, 3, 1]);
    }

    #[test]
    fn unresolved_entities_use_fallbacks() {
        let rows = vec![
            row(1, "PLFZ/2024/001", Some(10), None),
            row(2, "INV/2024/002", None, Some(99)),
            row(3, "XYZ/2024/003", None, None),
        ];
        let records =
            assemble_records(&rows, &ResolvedEntities::default(), today(), None, 20).expect("ok");

        assert_eq!(records[0].company_name, "Prezlab FZ LLC");
        assert_eq!(records[0].client_name, "Unknown");
        assert_eq!(records[0].client_email, "");
        assert_eq!(records[0].currency_symbol, "$");
        assert_eq!(records[1].company_name, "Unknown Company");
        assert_eq!(records[2].company_name, "Unknown Company");
    }

    #[test]
    fn resolved_entities_fill_display_fields() {
        let mut resolved = ResolvedEntities::default();
        resolved.partners.insert(
            10,
            Partner {
                id: 10,
                name: Some("Acme Corp".into()),
                email: Some("ap@acme.test".into()),
            },
        );
        resolved.currencies.insert(
            2,
            Currency {
                id: 2,
                name: Some("AED".into()),
                symbol: Some("AED".into()),
            },
        );
        resolved.companies.insert(
            1,
            Company {
                id: 1,
                name: Some("Prezlab Digital Design".into()),
            },
        );

        let records = assemble_records(
            &[row(1, "PLFZ/2024/001", Some(10), Some(1))],
            &resolved,
            today(),
            None,
            20,
        )
        .expect("ok");
        let record = &records[0];
        assert_eq!(record.client_name, "Acme Corp");
        assert_eq!(record.client_email, "ap@acme.test");
        assert_eq!(record.currency_symbol, "AED");
        // The company reference wins over the invoice-number prefix.
        assert_eq!(record.company_name, "Prezlab Digital Design");
        assert_eq!(record.amount_due, 40.0);
        assert_eq!(record.days_overdue, 10);
        assert_eq!(record.payment_state, "partial");
        assert_eq!(record.invoice_date, NaiveDate::from_ymd_opt(2024, 1, 1));
    }

    #[test]
    fn malformed_due_date_fails_assembly() {
        let mut bad = row(1, "INV/1", None, None);
        bad.invoice_date_due = Some("31/01/2024".into());
        let err = assemble_records(&[bad], &ResolvedEntities::default(), today(), None, 20)
            .expect_err("must fail");
        assert!(matches!(err, OdooError::Malformed(_)));

        let mut missing = row(2, "INV/2", None, None);
        missing.invoice_date_due = None;
        assert!(
            assemble_records(&[missing], &ResolvedEntities::default(), today(), None, 20).is_err()
        );
    }

    #[test]
    fn progress_reports_every_twentieth_record() {
        let rows = (0..45)
            .map(|i| row(i, &format!("INV/{i}"), None, None))
            .collect::<Vec<_>>();
        let calls = StdMutex::new(Vec::new());
        let observer = |message: &str, percent: f64| {
            calls.lock().unwrap().push((message.to_string(), percent));
        };

        assemble_records(
            &rows,
            &ResolvedEntities::default(),
            today(),
            Some(&observer),
            20,
        )
        .expect("ok");

        let calls = calls.into_inner().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].0, "Processing invoice 1/45");
        assert_eq!(calls[1].0, "Processing invoice 21/45");
        assert_eq!(calls[2].0, "Processing invoice 41/45");
        assert!((calls[2].1 - 41.0 / 45.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn retry_delays_double_until_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_millis(900),
        };

        let delays: Vec<_> = (0..4).map(|retry| policy.delay_before_retry(retry)).collect();
        assert_eq!(
            delays,
            [
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_millis(900),
                Duration::from_millis(900),
            ]
        );
        assert_eq!(policy.delay_before_retry(usize::MAX), Duration::from_millis(900));
    }

    #[test]
    fn only_throttling_and_server_statuses_are_transient() {
        let status = |status| OdooError::HttpStatus {
            status,
            url: "https://erp.example.test/web/dataset/call_kw".into(),
        };
        assert!(status(429).is_transient());
        assert!(status(502).is_transient());
        assert!(!status(404).is_transient());
        assert!(!OdooError::SessionExpired.is_transient());
        assert!(!OdooError::Rpc { message: "boom".into() }.is_transient());
    }

    #[test]
    fn session_expiry_is_recognised_by_code_or_exception_name() {
        let by_code: RpcErrorPayload = serde_json::from_value(json!({
            "code": 100,
            "message": "Odoo Session Expired"
        }))
        .expect("decode");
        assert!(matches!(by_code.into_error(), OdooError::SessionExpired));

        let by_name: RpcErrorPayload = serde_json::from_value(json!({
            "code": 200,
            "message": "Odoo Server Error",
            "data": {"name": "odoo.http.SessionExpiredException", "message": "Session expired"}
        }))
        .expect("decode");
        assert!(matches!(by_name.into_error(), OdooError::SessionExpired));

        let other: RpcErrorPayload = serde_json::from_value(json!({
            "code": 200,
            "message": "Odoo Server Error",
            "data": {"name": "odoo.exceptions.AccessError", "message": "nope"}
        }))
        .expect("decode");
        match other.into_error() {
            OdooError::Rpc { message } => {
                assert_eq!(message, "Odoo Server Error (odoo.exceptions.AccessError: nope)")
            }
            err => panic!("unexpected {err:?}"),
        }
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let credentials = OdooCredentials {
            url: "https://erp.example.test".into(),
            database: "prod".into(),
            username: "bot@example.test".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{credentials:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(credentials.is_complete());
    }

    #[test]
    fn entity_kinds_name_their_models() {
        assert_eq!(EntityKind::Partner.model(), "res.partner");
        assert_eq!(EntityKind::Currency.fields(), &["name", "symbol"]);
        assert_eq!(EntityKind::Company.to_string(), "res.company");
    }
}
