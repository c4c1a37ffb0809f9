// src/report.rs

use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::AppConfig;

const REPORT_SUBJECT: &str = "Report: Leave Migration to Xero";
const REPORT_ATTACHMENT_NAME: &str = "report.csv";
const NO_ERRORS_BODY: &str =
    "No errors found during processing leaves. Please check attached report for audit trail.";

const REPORT_HEADER: [&str; 6] = [
    "Employee",
    "Leave Requested",
    "Leave Applied (Xero)",
    "Leave Date",
    "Hours",
    "Org",
];

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to render report CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid email address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("failed to build email: {0}")]
    Message(#[from] lettre::error::Error),

    #[error("invalid attachment content type: {0}")]
    ContentType(#[from] lettre::message::header::ContentTypeErr),

    #[error("SMTP send failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Emails the run's audit report. When SMTP is not configured the reporter
/// degrades to a log line so local runs and tests work without a mail server.
#[derive(Clone)]
pub struct Reporter {
    mailer: Option<Arc<AsyncSmtpTransport<Tokio1Executor>>>,
    to: String,
    from: String,
}

impl Reporter {
    pub fn from_config(config: &AppConfig) -> Self {
        let mailer = match &config.smtp_host {
            Some(host) => match Self::build_mailer(host, config) {
                Ok(mailer) => {
                    info!(host = %host, port = config.smtp_port, "report email transport initialized");
                    Some(Arc::new(mailer))
                }
                Err(e) => {
                    warn!("report email transport unavailable: {}", e);
                    None
                }
            },
            None => {
                warn!("SMTP_HOST not set; run reports will be logged, not emailed");
                None
            }
        };

        Self {
            mailer,
            to: config.email_to.clone(),
            from: config.email_from.clone(),
        }
    }

    /// A reporter that never sends anything.
    pub fn disabled() -> Self {
        Self {
            mailer: None,
            to: String::new(),
            from: String::new(),
        }
    }

    fn build_mailer(
        host: &str,
        config: &AppConfig,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, ReportError> {
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?.port(config.smtp_port);
        if let (Some(user), Some(password)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }
        Ok(builder.build())
    }

    /// Fire-and-forget dispatch of the status report. The run's outcome never
    /// depends on whether the email made it out.
    pub fn dispatch(&self, errors: Vec<String>, successes: Vec<String>) {
        let reporter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = reporter.send(&errors, &successes).await {
                error!("failed to send migration report: {}", e);
            }
        });
    }

    async fn send(&self, errors: &[String], successes: &[String]) -> Result<(), ReportError> {
        let Some(mailer) = &self.mailer else {
            info!(
                errors = errors.len(),
                successes = successes.len(),
                "report email disabled; skipping send"
            );
            return Ok(());
        };

        let body = if errors.is_empty() {
            NO_ERRORS_BODY.to_string()
        } else {
            errors.join("\n")
        };

        let attachment = Attachment::new(REPORT_ATTACHMENT_NAME.to_string())
            .body(render_report_csv(successes)?, ContentType::parse("text/csv")?);

        let from: Mailbox = self.from.parse()?;
        let mut builder = Message::builder().from(from).subject(REPORT_SUBJECT);
        for recipient in self.to.split(',') {
            builder = builder.to(recipient.trim().parse()?);
        }

        let email = builder.multipart(
            MultiPart::mixed()
                .singlepart(
                    SinglePart::builder()
                        .header(ContentType::TEXT_PLAIN)
                        .body(body),
                )
                .singlepart(attachment),
        )?;

        mailer.send(email).await?;
        info!("migration report emailed");
        Ok(())
    }
}

/// Renders the success lines (one comma-joined audit entry per submission)
/// into the CSV attachment.
pub fn render_report_csv(successes: &[String]) -> Result<Vec<u8>, csv::Error> {
    let mut buffer = Vec::new();
    {
        let mut writer = csv::Writer::from_writer(&mut buffer);
        writer.write_record(REPORT_HEADER)?;
        for line in successes {
            writer.write_record(line.split(','))?;
        }
        writer.flush().map_err(csv::Error::from)?;
    }
    Ok(buffer)
}
