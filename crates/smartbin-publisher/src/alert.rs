//! Operator alerts.
//!
//! When uploads start failing with a new status code the publisher sends
//! one alert through an [`Alerter`].  [`SmtpAlerter`] mails the configured
//! recipients over implicit TLS (port 465) using `AUTH LOGIN`, with the
//! credentials taken from the [`SecretStore`] at send time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::ClientConfig;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::error::{PublishError, Result};
use crate::secrets::SecretStore;

const CONNECT_TIMEOUT_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Alert
// ---------------------------------------------------------------------------

/// One upload failure worth telling a human about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorAlert {
    pub device_id: String,
    pub uid: String,
    /// HTTP status, `None` when the server was unreachable.
    pub status: Option<u16>,
    pub detail: String,
}

impl OperatorAlert {
    pub fn subject(&self) -> String {
        match self.status {
            Some(status) => format!("[smartbin {}] upload failed with status {status}", self.device_id),
            None => format!("[smartbin {}] upload failed, server unreachable", self.device_id),
        }
    }

    pub fn body(&self) -> String {
        let status = self
            .status
            .map_or_else(|| "none".to_string(), |s| s.to_string());
        format!(
            "Device: {}\nSample: {}\nStatus: {status}\nResponse: {}\n",
            self.device_id, self.uid, self.detail
        )
    }
}

/// Delivery channel for operator alerts.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn alert(&self, alert: &OperatorAlert) -> Result<()>;
}

// ---------------------------------------------------------------------------
// SMTP command builders
// ---------------------------------------------------------------------------

pub fn smtp_ehlo_command(domain: &str) -> String {
    format!("EHLO {domain}\r\n")
}

pub fn smtp_auth_login_command() -> String {
    "AUTH LOGIN\r\n".to_string()
}

/// Base64 line for an `AUTH LOGIN` challenge.
pub fn smtp_auth_line(input: &str) -> String {
    use base64::Engine;
    format!("{}\r\n", base64::engine::general_purpose::STANDARD.encode(input))
}

pub fn smtp_mail_from_command(from: &str) -> String {
    format!("MAIL FROM:<{from}>\r\n")
}

pub fn smtp_rcpt_to_command(to: &str) -> String {
    format!("RCPT TO:<{to}>\r\n")
}

pub fn smtp_data_command() -> String {
    "DATA\r\n".to_string()
}

/// Message for the `DATA` phase, terminated by the lone dot.  Body lines
/// starting with a dot are dot-stuffed.
pub fn smtp_message(from: &str, to: &[String], subject: &str, body: &str) -> String {
    let stuffed: Vec<String> = body
        .lines()
        .map(|line| {
            if line.starts_with('.') {
                format!(".{line}")
            } else {
                line.to_string()
            }
        })
        .collect();
    format!(
        "From: {from}\r\n\
         To: {}\r\n\
         Subject: {subject}\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: text/plain; charset=UTF-8\r\n\
         \r\n\
         {}\r\n\
         .\r\n",
        to.join(", "),
        stuffed.join("\r\n")
    )
}

pub fn smtp_quit_command() -> String {
    "QUIT\r\n".to_string()
}

// ---------------------------------------------------------------------------
// TLS session
// ---------------------------------------------------------------------------

type Reader = BufReader<tokio::io::ReadHalf<TlsStream<TcpStream>>>;
type Writer = tokio::io::WriteHalf<TlsStream<TcpStream>>;

fn alert_error(reason: impl Into<String>) -> PublishError {
    PublishError::Alert {
        reason: reason.into(),
    }
}

fn timeout_error(reason: impl Into<String>) -> PublishError {
    PublishError::Timeout {
        seconds: CONNECT_TIMEOUT_SECS,
        reason: reason.into(),
    }
}

async fn connect_tls(host: &str, port: u16) -> Result<TlsStream<TcpStream>> {
    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = rustls::pki_types::ServerName::try_from(host.to_owned())
        .map_err(|e| alert_error(format!("invalid server name '{host}': {e}")))?;

    let addr = format!("{host}:{port}");
    let limit = Duration::from_secs(CONNECT_TIMEOUT_SECS);
    let tcp = tokio::time::timeout(limit, TcpStream::connect(&addr))
        .await
        .map_err(|_| timeout_error(format!("TCP connection to {addr} timed out")))?
        .map_err(|e| alert_error(format!("TCP connection to {addr} failed: {e}")))?;

    tokio::time::timeout(limit, connector.connect(server_name, tcp))
        .await
        .map_err(|_| timeout_error(format!("TLS handshake with {host} timed out")))?
        .map_err(|e| alert_error(format!("TLS handshake with {host} failed: {e}")))
}

/// Read one (possibly multi-line) SMTP reply.
async fn read_reply(reader: &mut Reader) -> Result<(u16, Vec<String>)> {
    let mut lines = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(CONNECT_TIMEOUT_SECS);

    loop {
        let mut line = String::new();
        match tokio::time::timeout_at(deadline, reader.read_line(&mut line)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {
                let trimmed = line.trim_end().to_string();
                tracing::trace!(smtp_line = %trimmed, "SMTP reply line");
                // "NNN-text" continues, "NNN text" ends the reply.
                let last = trimmed.as_bytes().get(3).is_none_or(|b| *b == b' ');
                lines.push(trimmed);
                if last {
                    break;
                }
            }
            Ok(Err(e)) => return Err(alert_error(format!("SMTP read error: {e}"))),
            Err(_) => return Err(timeout_error("SMTP reply timed out")),
        }
    }

    let status = lines
        .first()
        .and_then(|l| l.get(..3))
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);
    Ok((status, lines))
}

/// Send `command` and require a reply in the `expected` hundred.
async fn exchange(writer: &mut Writer, reader: &mut Reader, command: &str, expected: u16) -> Result<()> {
    writer
        .write_all(command.as_bytes())
        .await
        .map_err(|e| alert_error(format!("SMTP write error: {e}")))?;
    let (status, lines) = read_reply(reader).await?;
    if status / 100 != expected / 100 {
        return Err(alert_error(format!(
            "SMTP error: expected {}xx, got {status}: {}",
            expected / 100,
            lines.join("; ")
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SMTP alerter
// ---------------------------------------------------------------------------

/// Mails alerts to the recipients listed in the secret store.
pub struct SmtpAlerter {
    secrets: Arc<SecretStore>,
    helo_domain: String,
}

impl std::fmt::Debug for SmtpAlerter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpAlerter")
            .field("helo_domain", &self.helo_domain)
            .finish()
    }
}

impl SmtpAlerter {
    pub fn new(secrets: Arc<SecretStore>) -> Self {
        Self {
            secrets,
            helo_domain: "smartbin.local".to_string(),
        }
    }
}

#[async_trait]
impl Alerter for SmtpAlerter {
    async fn alert(&self, alert: &OperatorAlert) -> Result<()> {
        let smtp = self
            .secrets
            .current()?
            .alert
            .ok_or_else(|| PublishError::MissingSecret {
                key: "alert".into(),
            })?;
        if smtp.recipients.is_empty() {
            return Err(PublishError::MissingSecret {
                key: "alert.recipients".into(),
            });
        }

        tracing::info!(host = %smtp.smtp_host, recipients = smtp.recipients.len(), "sending operator alert");
        let tls = connect_tls(&smtp.smtp_host, smtp.smtp_port).await?;
        let (read_half, mut writer) = tokio::io::split(tls);
        let mut reader = BufReader::new(read_half);

        let (greeting, _) = read_reply(&mut reader).await?;
        if greeting / 100 != 2 {
            return Err(alert_error(format!("SMTP server rejected connection with status {greeting}")));
        }

        exchange(&mut writer, &mut reader, &smtp_ehlo_command(&self.helo_domain), 250).await?;
        exchange(&mut writer, &mut reader, &smtp_auth_login_command(), 334).await?;
        exchange(&mut writer, &mut reader, &smtp_auth_line(&smtp.username), 334).await?;
        exchange(&mut writer, &mut reader, &smtp_auth_line(&smtp.password), 235).await?;
        exchange(&mut writer, &mut reader, &smtp_mail_from_command(&smtp.username), 250).await?;
        for to in &smtp.recipients {
            exchange(&mut writer, &mut reader, &smtp_rcpt_to_command(to), 250).await?;
        }
        exchange(&mut writer, &mut reader, &smtp_data_command(), 354).await?;
        let message = smtp_message(&smtp.username, &smtp.recipients, &alert.subject(), &alert.body());
        exchange(&mut writer, &mut reader, &message, 250).await?;

        let _ = writer.write_all(smtp_quit_command().as_bytes()).await;
        Ok(())
    }
}
