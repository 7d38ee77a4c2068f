//! Follow-up pipelines: daily overdue report, client reminders, cron scheduling.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use dunning_core::{format_amount, FetchOutcome, InvoiceRecord};
use dunning_odoo::{OdooConfig, OdooConnector};
use dunning_storage::{ThreadManager, DEFAULT_THREAD_FILE};
use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "dunning-sync";

/// Thread identity used for the finance team's daily report mail.
pub const REPORT_THREAD_CLIENT: &str = "Finance Team";
pub const REPORT_THREAD_COMPANY: &str = "Daily Reports";

const TOP_CLIENT_COUNT: usize = 3;
const SEVERE_AFTER_DAYS: i64 = 30;
const MODERATE_AFTER_DAYS: i64 = 15;

const IBAN_LETTERS: [(&str, &str); 2] = [
    ("Prezlab FZ LLC", "IBAN Letter _ Prezlab FZ LLC .pdf"),
    (
        "Prezlab Advanced Design Company",
        "IBAN Letter _ Prezlab Advanced Design Company .pdf",
    ),
];

#[derive(Clone)]
pub struct SmtpSettings {
    pub server: String,
    pub port: u16,
    pub sender_email: String,
    pub sender_password: String,
}

impl fmt::Debug for SmtpSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpSettings")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("sender_email", &self.sender_email)
            .field("sender_password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct FollowUpConfig {
    pub thread_store_path: PathBuf,
    pub reports_dir: PathBuf,
    pub iban_letters_dir: PathBuf,
    pub smtp: SmtpSettings,
    pub report_recipient: Option<String>,
    /// Copied on every client reminder.
    pub reminder_cc: Vec<String>,
    pub attach_invoice_pdf: bool,
    pub scheduler_enabled: bool,
    pub report_cron: String,
}

impl FollowUpConfig {
    pub fn from_env() -> Self {
        Self {
            thread_store_path: std::env::var("THREAD_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_THREAD_FILE)),
            reports_dir: std::env::var("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            iban_letters_dir: std::env::var("IBAN_LETTERS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            smtp: SmtpSettings {
                server: std::env::var("SMTP_SERVER")
                    .unwrap_or_else(|_| "smtp.gmail.com".to_string()),
                port: std::env::var("SMTP_PORT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(587),
                sender_email: std::env::var("SENDER_EMAIL").unwrap_or_default(),
                sender_password: std::env::var("SENDER_PASSWORD").unwrap_or_default(),
            },
            report_recipient: std::env::var("REPORT_RECIPIENT")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            reminder_cc: std::env::var("REMINDER_CC")
                .map(|v| split_addresses(&v))
                .unwrap_or_default(),
            attach_invoice_pdf: env_flag("REMINDER_ATTACH_INVOICES", true),
            scheduler_enabled: env_flag("FOLLOWUP_SCHEDULER_ENABLED", false),
            report_cron: std::env::var("FOLLOWUP_REPORT_CRON")
                .unwrap_or_else(|_| "0 0 9 * * *".to_string()),
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

/// Comma-separated address list; blanks are dropped.
pub fn split_addresses(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|address| !address.is_empty())
        .map(str::to_string)
        .collect()
}

/// Invoices of one client, in the order they were fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientGroup {
    pub client_name: String,
    pub invoices: Vec<InvoiceRecord>,
}

pub fn group_by_client(records: &[InvoiceRecord]) -> Vec<ClientGroup> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<ClientGroup> = Vec::new();
    for record in records {
        match index.get(record.client_name.as_str()) {
            Some(&slot) => groups[slot].invoices.push(record.clone()),
            None => {
                index.insert(&record.client_name, groups.len());
                groups.push(ClientGroup {
                    client_name: record.client_name.clone(),
                    invoices: vec![record.clone()],
                });
            }
        }
    }
    groups
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientSummary {
    pub client_name: String,
    pub total_amount: f64,
    pub max_days_overdue: i64,
    /// Rounded to one decimal for display.
    pub avg_days_overdue: f64,
    pub invoice_count: usize,
    pub priority_score: f64,
}

pub fn summarize_client(group: &ClientGroup) -> ClientSummary {
    let invoice_count = group.invoices.len();
    let total_amount: f64 = group.invoices.iter().map(|i| i.amount_due).sum();
    let max_days_overdue = group
        .invoices
        .iter()
        .map(|i| i.days_overdue)
        .max()
        .unwrap_or_default();
    let avg_days = if invoice_count == 0 {
        0.0
    } else {
        group.invoices.iter().map(|i| i.days_overdue as f64).sum::<f64>() / invoice_count as f64
    };

    ClientSummary {
        client_name: group.client_name.clone(),
        total_amount,
        max_days_overdue,
        avg_days_overdue: (avg_days * 10.0).round() / 10.0,
        invoice_count,
        priority_score: priority_score(max_days_overdue, avg_days, total_amount),
    }
}

pub fn priority_score(max_days_overdue: i64, avg_days_overdue: f64, total_amount: f64) -> f64 {
    max_days_overdue as f64 * 0.6 + avg_days_overdue * 0.3 + total_amount / 1000.0 * 0.1
}

pub fn summarize_clients(groups: &[ClientGroup]) -> Vec<ClientSummary> {
    groups.iter().map(summarize_client).collect()
}

/// Highest priority first; ties keep their grouping order.
pub fn top_clients(summaries: &[ClientSummary], limit: usize) -> Vec<ClientSummary> {
    let mut ranked = summaries.to_vec();
    ranked.sort_by(|a, b| b.priority_score.total_cmp(&a.priority_score));
    ranked.truncate(limit);
    ranked
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeverityBuckets {
    pub severe: Vec<ClientSummary>,
    pub moderate: Vec<ClientSummary>,
}

pub fn severity_buckets(summaries: &[ClientSummary]) -> SeverityBuckets {
    let mut buckets = SeverityBuckets::default();
    for summary in summaries {
        if summary.max_days_overdue > SEVERE_AFTER_DAYS {
            buckets.severe.push(summary.clone());
        } else if summary.max_days_overdue > MODERATE_AFTER_DAYS {
            buckets.moderate.push(summary.clone());
        }
    }
    let by_amount = |a: &ClientSummary, b: &ClientSummary| b.total_amount.total_cmp(&a.total_amount);
    buckets.severe.sort_by(by_amount);
    buckets.moderate.sort_by(by_amount);
    buckets
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyReport {
    pub report_date: NaiveDate,
    pub total_invoices: usize,
    pub total_amount: f64,
    pub total_clients: usize,
    pub top_clients: Vec<ClientSummary>,
    pub severe_clients: Vec<ClientSummary>,
    pub moderate_clients: Vec<ClientSummary>,
}

impl DailyReport {
    pub fn build(groups: &[ClientGroup], report_date: NaiveDate) -> Self {
        let summaries = summarize_clients(groups);
        let buckets = severity_buckets(&summaries);
        Self {
            report_date,
            total_invoices: groups.iter().map(|g| g.invoices.len()).sum(),
            total_amount: summaries.iter().map(|s| s.total_amount).sum(),
            total_clients: groups.len(),
            top_clients: top_clients(&summaries, TOP_CLIENT_COUNT),
            severe_clients: buckets.severe,
            moderate_clients: buckets.moderate,
        }
    }
}

pub fn report_file_name(report_date: NaiveDate) -> String {
    format!("invoice_followup_report_{}.csv", report_date.format("%Y%m%d"))
}

/// Invoice rows grouped by client, a blank line, then the follow-up ranking.
pub fn render_report_csv(groups: &[ClientGroup], top: &[ClientSummary]) -> Result<String> {
    let mut invoices = csv::Writer::from_writer(Vec::new());
    invoices.write_record([
        "Client Name",
        "Invoice Number",
        "Invoice Date",
        "Due Date",
        "Origin",
        "Amount Due",
        "Currency",
        "Days Overdue",
        "Company",
    ])?;
    for invoice in groups.iter().flat_map(|g| g.invoices.iter()) {
        invoices.write_record([
            invoice.client_name.clone(),
            invoice.invoice_number.clone(),
            invoice
                .invoice_date
                .map(|d| d.to_string())
                .unwrap_or_default(),
            invoice.due_date.to_string(),
            invoice.origin.clone(),
            format!("{:.2}", invoice.amount_due),
            invoice.currency_symbol.clone(),
            invoice.days_overdue.to_string(),
            invoice.company_name.clone(),
        ])?;
    }
    let mut buffer = invoices
        .into_inner()
        .map_err(|err| anyhow!("flushing invoice rows: {}", err.error()))?;
    buffer.push(b'\n');

    let mut ranking = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(buffer);
    ranking.write_record(["TOP 3 CLIENTS TO FOLLOW UP ON"])?;
    ranking.write_record([
        "Client Name",
        "Total Amount",
        "Max Days Overdue",
        "Average Days Overdue",
        "Invoice Count",
        "Priority Score",
    ])?;
    for client in top {
        ranking.write_record([
            client.client_name.clone(),
            format!("{:.2}", client.total_amount),
            client.max_days_overdue.to_string(),
            format!("{:.1}", client.avg_days_overdue),
            client.invoice_count.to_string(),
            format!("{:.2}", client.priority_score),
        ])?;
    }
    let buffer = ranking
        .into_inner()
        .map_err(|err| anyhow!("flushing ranking rows: {}", err.error()))?;

    String::from_utf8(buffer).context("report csv is not utf-8")
}

pub fn render_daily_brief(report: &DailyReport) -> String {
    let list = |clients: &[ClientSummary]| {
        if clients.is_empty() {
            "- none".to_string()
        } else {
            clients
                .iter()
                .map(|c| {
                    format!(
                        "- {}: ${} across {} invoice(s), max {} days overdue",
                        c.client_name,
                        format_amount(c.total_amount),
                        c.invoice_count,
                        c.max_days_overdue
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
    };

    format!(
        "# Overdue Invoice Daily Brief\n\n- Report date: {}\n- Overdue invoices: {}\n- Outstanding amount: ${}\n- Clients: {}\n\n## Top Clients To Follow Up\n{}\n\n## Severe (> {} days)\n{}\n\n## Moderate ({}-{} days)\n{}\n",
        report.report_date,
        report.total_invoices,
        format_amount(report.total_amount),
        report.total_clients,
        list(&report.top_clients),
        SEVERE_AFTER_DAYS,
        list(&report.severe_clients),
        MODERATE_AFTER_DAYS + 1,
        SEVERE_AFTER_DAYS,
        list(&report.moderate_clients),
    )
}

pub fn render_report_email(report: &DailyReport) -> EmailContent {
    let date = report.report_date.format("%Y-%m-%d");
    let mut body = format!(
        "Dear Finance Team,\n\nPlease find attached the daily invoice follow-up report for {date}.\n\nSummary:\n- Total Overdue Invoices: {}\n- Total Outstanding Amount: ${}\n- Clients with Overdue Invoices: {}\n\nTop 3 Clients to Follow Up On:\n",
        report.total_invoices,
        format_amount(report.total_amount),
        report.total_clients,
    );
    if report.top_clients.is_empty() {
        body.push_str("No clients identified for follow-up at this time.\n");
    }
    for (rank, client) in report.top_clients.iter().enumerate() {
        body.push_str(&format!(
            "\n{}. {}\n   - Total Amount: ${}\n   - Max Days Overdue: {} days\n   - Average Days Overdue: {} days\n   - Invoice Count: {}\n",
            rank + 1,
            client.client_name,
            format_amount(client.total_amount),
            client.max_days_overdue,
            client.avg_days_overdue,
            client.invoice_count,
        ));
    }
    body.push_str("\nThe detailed report is attached as a CSV file.\n\nBest regards,\nInvoice Follow-Up System\n");

    EmailContent {
        subject: format!("Daily Invoice Follow-Up Report - {date}"),
        body,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReminderTemplate {
    Initial,
    Second,
    Final,
}

impl ReminderTemplate {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Second => "second",
            Self::Final => "final",
        }
    }
}

impl fmt::Display for ReminderTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReminderTemplate {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "initial" => Ok(Self::Initial),
            "second" => Ok(Self::Second),
            "final" => Ok(Self::Final),
            other => Err(format!(
                "unknown reminder template {other:?}; expected initial, second or final"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailContent {
    pub subject: String,
    pub body: String,
}

/// All templates share one subject so that replies stay in a single thread.
pub fn render_reminder(
    template: ReminderTemplate,
    client_name: &str,
    invoices: &[InvoiceRecord],
) -> EmailContent {
    let total: f64 = invoices.iter().map(|i| i.amount_due).sum();
    let days = invoices.iter().map(|i| i.days_overdue).max().unwrap_or_default();
    let total = format_amount(total);

    let (opening, closing) = match template {
        ReminderTemplate::Initial => (
            format!(
                "We hope this email finds you well. We would like to bring to your attention that you have {} invoice(s) that are currently overdue for payment.",
                invoices.len()
            ),
            "Please arrange for payment at your earliest convenience. If you have any questions or concerns, please don't hesitate to contact us.\n\nThank you for your prompt attention to this matter.".to_string(),
        ),
        ReminderTemplate::Second => (
            "This is our second reminder regarding your overdue invoice(s). We have not yet received payment for the following:".to_string(),
            "Please note that continued non-payment may result in additional charges or suspension of services.\n\nWe kindly request immediate payment or contact us to discuss payment arrangements.".to_string(),
        ),
        ReminderTemplate::Final => (
            "This is our final notice regarding your overdue invoice(s). Payment is now urgently required:".to_string(),
            "Failure to make immediate payment may result in:\n- Additional late fees\n- Suspension of services\n- Legal action\n\nPlease contact us immediately to resolve this matter.".to_string(),
        ),
    };

    let lines = invoices
        .iter()
        .map(|i| {
            format!(
                "- {} (due {}): {} {}",
                i.invoice_number,
                i.due_date,
                i.currency_symbol,
                format_amount(i.amount_due)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    EmailContent {
        subject: format!("Invoice notice - outstanding balance of ${total}"),
        body: format!(
            "Dear {client_name},\n\n{opening}\n\nTotal Outstanding Amount: ${total}\nDays Overdue: {days}\n\n{lines}\n\n{closing}\n\nBest regards,\nAccounts Receivable"
        ),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: String,
    pub cc: Vec<String>,
    pub content: EmailContent,
    /// Thread token, angle brackets included.
    pub thread_id: Option<String>,
    pub attachments: Vec<EmailAttachment>,
}

#[derive(Debug, Clone)]
struct XThreadId(String);

impl Header for XThreadId {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-Thread-ID")
    }

    fn parse(s: &str) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

pub fn build_message(email: &OutgoingEmail) -> Result<Message> {
    let from: Mailbox = email
        .from
        .parse()
        .with_context(|| format!("parsing sender address {:?}", email.from))?;
    let to: Mailbox = email
        .to
        .parse()
        .with_context(|| format!("parsing recipient address {:?}", email.to))?;

    let mut builder = Message::builder()
        .from(from)
        .to(to)
        .subject(email.content.subject.clone());
    for address in &email.cc {
        let cc: Mailbox = address
            .parse()
            .with_context(|| format!("parsing cc address {address:?}"))?;
        builder = builder.cc(cc);
    }

    if let Some(token) = &email.thread_id {
        builder = builder
            .message_id(Some(token.clone()))
            .in_reply_to(token.clone())
            .references(token.clone())
            .header(XThreadId(
                token.trim_start_matches('<').trim_end_matches('>').to_string(),
            ));
    }

    let message = if email.attachments.is_empty() {
        builder
            .header(ContentType::TEXT_PLAIN)
            .body(email.content.body.clone())?
    } else {
        let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(email.content.body.clone()));
        for attachment in &email.attachments {
            let content_type = ContentType::parse(&attachment.content_type)
                .with_context(|| format!("content type for {}", attachment.filename))?;
            parts = parts.singlepart(
                Attachment::new(attachment.filename.clone())
                    .body(attachment.data.clone(), content_type),
            );
        }
        builder.multipart(parts)?
    };
    Ok(message)
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: Message) -> Result<()>;
}

/// SMTP submission with STARTTLS.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn new(settings: &SmtpSettings) -> Result<Self> {
        let credentials = Credentials::new(
            settings.sender_email.clone(),
            settings.sender_password.clone(),
        );
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.server)
            .with_context(|| format!("configuring smtp relay {}", settings.server))?
            .port(settings.port)
            .credentials(credentials)
            .build();
        Ok(Self { transport })
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, message: Message) -> Result<()> {
        self.transport
            .send(message)
            .await
            .context("smtp delivery failed")?;
        Ok(())
    }
}

/// Loads the bank-details letter for companies that have one on disk.
pub async fn iban_letter_for(dir: &Path, company_name: &str) -> Option<EmailAttachment> {
    let (_, filename) = IBAN_LETTERS
        .iter()
        .find(|(company, _)| *company == company_name)?;
    let path = dir.join(filename);
    match fs::read(&path).await {
        Ok(data) => Some(EmailAttachment {
            filename: filename.to_string(),
            content_type: "application/pdf".to_string(),
            data,
        }),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "iban letter unavailable");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportArtifacts {
    pub report: DailyReport,
    pub reports_dir: PathBuf,
    pub csv_path: PathBuf,
    pub summary_path: PathBuf,
    pub brief_path: PathBuf,
    pub emailed_to: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReminderRun {
    pub sent: Vec<String>,
    pub previewed: Vec<String>,
    pub skipped_without_email: Vec<String>,
    pub failed: Vec<String>,
}

/// One reminder's worth of invoices. Clients are keyed by name; the
/// address is the first non-blank email among their invoices and the
/// company is that of their first invoice.
#[derive(Debug, Clone)]
struct RecipientGroup {
    client_name: String,
    client_email: String,
    company_name: String,
    invoices: Vec<InvoiceRecord>,
}

impl RecipientGroup {
    /// Invoices already past due, the ones worth printing.
    fn overdue_invoice_ids(&self) -> Vec<i64> {
        self.invoices
            .iter()
            .filter(|invoice| invoice.days_overdue > 0)
            .map(|invoice| invoice.id)
            .collect()
    }

    fn invoice_pdf_name(&self) -> String {
        format!("Invoices_{}.pdf", self.client_name.replace(' ', "_"))
    }
}

fn group_by_recipient(records: &[InvoiceRecord]) -> Vec<RecipientGroup> {
    group_by_client(records)
        .into_iter()
        .map(|group| {
            let client_email = group
                .invoices
                .iter()
                .map(|invoice| invoice.client_email.trim())
                .find(|email| !email.is_empty())
                .unwrap_or_default()
                .to_string();
            let company_name = group
                .invoices
                .first()
                .map(|invoice| invoice.company_name.clone())
                .unwrap_or_default();
            RecipientGroup {
                client_name: group.client_name,
                client_email,
                company_name,
                invoices: group.invoices,
            }
        })
        .collect()
}

pub struct FollowUpPipeline {
    config: FollowUpConfig,
    connector: Arc<OdooConnector>,
    threads: Mutex<ThreadManager>,
    mailer: Arc<dyn MailTransport>,
}

impl FollowUpPipeline {
    /// Builds the pipeline and loads the thread store it writes to.
    pub async fn open(
        config: FollowUpConfig,
        connector: Arc<OdooConnector>,
        mailer: Arc<dyn MailTransport>,
    ) -> Self {
        let threads = ThreadManager::open(config.thread_store_path.clone()).await;
        Self {
            config,
            connector,
            threads: Mutex::new(threads),
            mailer,
        }
    }

    pub fn config(&self) -> &FollowUpConfig {
        &self.config
    }

    pub fn threads(&self) -> &Mutex<ThreadManager> {
        &self.threads
    }

    pub async fn fetch(&self) -> FetchOutcome {
        let progress = |message: &str, percent: f64| {
            debug!(percent = format!("{percent:.0}"), "{message}");
        };
        self.connector.fetch_overdue_invoices(Some(&progress)).await
    }

    /// Builds today's report. Returns `None` when nothing is overdue.
    pub async fn run_daily_report(&self, send_email: bool) -> Result<Option<ReportArtifacts>> {
        self.run_daily_report_for(Local::now().date_naive(), send_email)
            .await
    }

    pub async fn run_daily_report_for(
        &self,
        report_date: NaiveDate,
        send_email: bool,
    ) -> Result<Option<ReportArtifacts>> {
        let span = info_span!("daily_report", %report_date);
        self.build_daily_report(report_date, send_email)
            .instrument(span)
            .await
    }

    async fn build_daily_report(
        &self,
        report_date: NaiveDate,
        send_email: bool,
    ) -> Result<Option<ReportArtifacts>> {
        let records = match self.fetch().await {
            FetchOutcome::Invoices(records) => records,
            FetchOutcome::NoneOverdue => {
                info!("no overdue invoices; skipping report");
                return Ok(None);
            }
            FetchOutcome::Failed { reason } => {
                bail!("fetching overdue invoices failed: {reason}")
            }
        };

        let groups = group_by_client(&records);
        let report = DailyReport::build(&groups, report_date);
        let csv = render_report_csv(&groups, &report.top_clients)?;
        let mut artifacts = self.write_report_artifacts(&report, &csv).await?;
        info!(
            invoices = report.total_invoices,
            clients = report.total_clients,
            total = %format_amount(report.total_amount),
            dir = %artifacts.reports_dir.display(),
            "daily report written"
        );

        if send_email {
            let recipient = self
                .config
                .report_recipient
                .clone()
                .context("REPORT_RECIPIENT must be set to email the daily report")?;
            self.send_report_email(&report, &recipient, csv).await?;
            artifacts.emailed_to = Some(recipient);
        }

        Ok(Some(artifacts))
    }

    pub async fn send_client_reminders(
        &self,
        template: ReminderTemplate,
        dry_run: bool,
    ) -> Result<ReminderRun> {
        let records = self
            .fetch()
            .await
            .into_records()
            .map_err(|reason| anyhow!("fetching overdue invoices failed: {reason}"))?;

        let mut run = ReminderRun::default();
        for group in group_by_recipient(&records) {
            let label = format!("{} <{}>", group.client_name, group.client_email);
            if group.client_email.trim().is_empty() {
                warn!(client = %group.client_name, "no email on file; skipping reminder");
                run.skipped_without_email.push(group.client_name.clone());
                continue;
            }

            match self.send_reminder(&group, template, dry_run).await {
                Ok(()) if dry_run => run.previewed.push(label),
                Ok(()) => run.sent.push(label),
                Err(err) => {
                    warn!(client = %group.client_name, error = %format!("{err:#}"), "reminder failed");
                    run.failed.push(label);
                }
            }
        }

        info!(
            %template,
            dry_run,
            sent = run.sent.len(),
            previewed = run.previewed.len(),
            skipped = run.skipped_without_email.len(),
            failed = run.failed.len(),
            "reminder run complete"
        );
        Ok(run)
    }

    async fn send_reminder(
        &self,
        group: &RecipientGroup,
        template: ReminderTemplate,
        dry_run: bool,
    ) -> Result<()> {
        let content = render_reminder(template, &group.client_name, &group.invoices);
        let company = Some(group.company_name.as_str());

        let thread_id = {
            let mut threads = self.threads.lock().await;
            if dry_run {
                threads
                    .get_thread_info(&group.client_name, &group.client_email, company)
                    .map(|record| record.thread_id.clone())
            } else {
                let token = threads
                    .get_thread_id(&group.client_name, &group.client_email, company)
                    .await;
                threads
                    .update_thread_subject(
                        &group.client_name,
                        &group.client_email,
                        &content.subject,
                        company,
                    )
                    .await;
                Some(token)
            }
        };

        let mut attachments: Vec<EmailAttachment> =
            iban_letter_for(&self.config.iban_letters_dir, &group.company_name)
                .await
                .into_iter()
                .collect();
        if self.config.attach_invoice_pdf && !dry_run {
            attachments.extend(self.invoice_pdf_for(group).await);
        }

        let message = build_message(&OutgoingEmail {
            from: self.config.smtp.sender_email.clone(),
            to: group.client_email.clone(),
            cc: self.config.reminder_cc.clone(),
            content,
            thread_id,
            attachments,
        })?;

        if dry_run {
            info!(client = %group.client_name, invoices = group.invoices.len(), "dry run; reminder not sent");
            return Ok(());
        }
        self.mailer.send(message).await
    }

    /// A failed download only costs the attachment; the reminder still goes.
    async fn invoice_pdf_for(&self, group: &RecipientGroup) -> Option<EmailAttachment> {
        match self
            .connector
            .download_invoice_pdf(&group.overdue_invoice_ids())
            .await
        {
            Ok(Some(data)) => Some(EmailAttachment {
                filename: group.invoice_pdf_name(),
                content_type: "application/pdf".to_string(),
                data,
            }),
            Ok(None) => None,
            Err(err) => {
                warn!(client = %group.client_name, error = %err, "invoice pdf unavailable");
                None
            }
        }
    }

    async fn send_report_email(&self, report: &DailyReport, recipient: &str, csv: String) -> Result<()> {
        let content = render_report_email(report);
        let thread_id = {
            let mut threads = self.threads.lock().await;
            let company = Some(REPORT_THREAD_COMPANY);
            let token = threads
                .get_thread_id(REPORT_THREAD_CLIENT, recipient, company)
                .await;
            threads
                .update_thread_subject(REPORT_THREAD_CLIENT, recipient, &content.subject, company)
                .await;
            token
        };

        let message = build_message(&OutgoingEmail {
            from: self.config.smtp.sender_email.clone(),
            to: recipient.to_string(),
            cc: Vec::new(),
            content,
            thread_id: Some(thread_id),
            attachments: vec![EmailAttachment {
                filename: report_file_name(report.report_date),
                content_type: "text/csv".to_string(),
                data: csv.into_bytes(),
            }],
        })?;
        self.mailer
            .send(message)
            .await
            .with_context(|| format!("emailing daily report to {recipient}"))?;
        info!(%recipient, "daily report emailed");
        Ok(())
    }

    async fn write_report_artifacts(&self, report: &DailyReport, csv: &str) -> Result<ReportArtifacts> {
        let reports_dir = self
            .config
            .reports_dir
            .join(report.report_date.format("%Y%m%d").to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let csv_path = reports_dir.join(report_file_name(report.report_date));
        fs::write(&csv_path, csv)
            .await
            .with_context(|| format!("writing {}", csv_path.display()))?;

        let summary_path = reports_dir.join("summary.json");
        let summary = serde_json::to_vec_pretty(report).context("serializing report summary")?;
        fs::write(&summary_path, summary)
            .await
            .context("writing summary.json")?;

        let brief_path = reports_dir.join("daily_brief.md");
        fs::write(&brief_path, render_daily_brief(report))
            .await
            .context("writing daily_brief.md")?;

        Ok(ReportArtifacts {
            report: report.clone(),
            reports_dir,
            csv_path,
            summary_path,
            brief_path,
            emailed_to: None,
        })
    }
}

/// Registers the daily report job when scheduling is enabled. The job emails
/// the report whenever a recipient is configured.
pub async fn maybe_build_scheduler(pipeline: Arc<FollowUpPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = &pipeline.config.report_cron;
    let job_pipeline = Arc::clone(&pipeline);
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&job_pipeline);
        Box::pin(async move {
            let send_email = pipeline.config.report_recipient.is_some();
            match pipeline.run_daily_report(send_email).await {
                Ok(Some(artifacts)) => {
                    info!(dir = %artifacts.reports_dir.display(), "scheduled report complete")
                }
                Ok(None) => info!("scheduled report found nothing overdue"),
                Err(err) => warn!(error = %format!("{err:#}"), "scheduled report failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn pipeline_from_env() -> Result<FollowUpPipeline> {
    let config = FollowUpConfig::from_env();
    let connector = OdooConfig::from_env()
        .connect_http()
        .context("building odoo connector")?;
    let mailer = SmtpMailer::new(&config.smtp)?;
    Ok(FollowUpPipeline::open(config, Arc::new(connector), Arc::new(mailer)).await)
}
