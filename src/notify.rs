use std::time::Duration;

use serde::Serialize;
use tracing::{error, info};

use crate::config::{EmailConfig, Settings, TelegramConfig, WebhookConfig};
use crate::error::{Error, Result};

// ======================================================
// CONSTANTS
// ======================================================

/// Telegram rejects longer messages.
const TELEGRAM_MAX_CHARS: usize = 4096;
const TELEGRAM_TIMEOUT: Duration = Duration::from_secs(20);
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

// ======================================================
// TYPES
// ======================================================

/// Why a notification is being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyEvent {
    Availabilities,
    NoLongerAvailable,
    NothingDetected,
    Test,
}

impl NotifyEvent {
    pub fn label(&self) -> &'static str {
        match self {
            NotifyEvent::Availabilities    => "Availabilities",
            NotifyEvent::NoLongerAvailable => "No Longer Available",
            NotifyEvent::NothingDetected   => "Nothing Detected",
            NotifyEvent::Test              => "Test Notification",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub event: NotifyEvent,
    pub message: String,
    /// Number of listings the message covers.
    pub found: usize,
}

/// A configured delivery transport.
#[derive(Debug, Clone)]
pub enum Channel {
    Telegram(TelegramConfig),
    Webhook(WebhookConfig),
    Email(EmailConfig),
}

impl Channel {
    pub fn label(&self) -> &'static str {
        match self {
            Channel::Telegram(_) => "telegram",
            Channel::Webhook(_)  => "webhook",
            Channel::Email(_)    => "email",
        }
    }
}

/// Outcome of one channel.
#[derive(Debug)]
pub struct Delivery {
    pub channel: &'static str,
    pub result: Result<()>,
}

#[derive(Debug, Default)]
pub struct Report {
    pub deliveries: Vec<Delivery>,
    /// No channel configured; the message went to stdout.
    pub console_only: bool,
}

impl Report {
    pub fn ok(&self) -> bool {
        self.deliveries.iter().all(|d| d.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &Delivery> {
        self.deliveries.iter().filter(|d| d.result.is_err())
    }
}

#[derive(Debug, Serialize)]
struct TelegramMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

/// The JSON body posted to a webhook.
#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    pub source: &'static str,
    pub event: NotifyEvent,
    pub message: &'a str,
    pub found: usize,
    pub timestamp: String,
}

// ======================================================
// NOTIFIER
// ======================================================

#[derive(Debug, Clone)]
pub struct Notifier {
    client: reqwest::Client,
    channels: Vec<Channel>,
}

impl Notifier {
    pub fn new(channels: Vec<Channel>) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, channels })
    }

    /// Every transport that is fully configured in `settings`.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut channels = Vec::new();
        if settings.telegram.is_configured() {
            channels.push(Channel::Telegram(settings.telegram.clone()));
        }
        if settings.webhook.is_configured() {
            channels.push(Channel::Webhook(settings.webhook.clone()));
        }
        if settings.email.is_configured() {
            channels.push(Channel::Email(settings.email.clone()));
        }
        Notifier::new(channels)
    }

    pub fn channel_labels(&self) -> Vec<&'static str> {
        self.channels.iter().map(Channel::label).collect()
    }

    /// Attempt every channel. Failures are logged and reported, never raised.
    pub async fn deliver(&self, note: &Notification) -> Report {
        if self.channels.is_empty() {
            info!("no notification channel configured, printing message only");
            println!("{}", note.message);
            return Report {
                deliveries: Vec::new(),
                console_only: true,
            };
        }

        let mut report = Report::default();

        for channel in &self.channels {
            let result = match channel {
                Channel::Telegram(cfg) => self.send_telegram(cfg, &note.message).await,
                Channel::Webhook(cfg)  => self.send_webhook(cfg, note).await,
                Channel::Email(cfg)    => send_email(cfg.clone(), note).await,
            };

            match &result {
                Ok(()) => info!(channel = channel.label(), event = note.event.label(), "notification sent"),
                Err(e) => error!(channel = channel.label(), event = note.event.label(), error = %e, "notification failed"),
            }

            report.deliveries.push(Delivery {
                channel: channel.label(),
                result,
            });
        }

        report
    }

    // ==================================================
    // TELEGRAM
    // ==================================================

    async fn send_telegram(&self, cfg: &TelegramConfig, text: &str) -> Result<()> {
        let (Some(token), Some(chat_id)) = (cfg.token.as_deref(), cfg.chat_id.as_deref()) else {
            return Err(notify_err("telegram", "bot token and chat id are required"));
        };

        let url = format!("{}/bot{}/sendMessage", cfg.api_base.trim_end_matches('/'), token);

        for chunk in split_message(text, TELEGRAM_MAX_CHARS) {
            let payload = TelegramMessage {
                chat_id,
                text: &chunk,
                disable_web_page_preview: true,
            };

            // without_url(): the request URL carries the bot token.
            self.client
                .post(&url)
                .timeout(TELEGRAM_TIMEOUT)
                .json(&payload)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| notify_err("telegram", e.without_url()))?;
        }

        Ok(())
    }

    // ==================================================
    // WEBHOOK
    // ==================================================

    async fn send_webhook(&self, cfg: &WebhookConfig, note: &Notification) -> Result<()> {
        let Some(url) = cfg.url.as_deref() else {
            return Ok(());
        };

        let payload = WebhookPayload {
            source: "doctobot",
            event: note.event,
            message: &note.message,
            found: note.found,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        let mut request = self.client.post(url).timeout(WEBHOOK_TIMEOUT).json(&payload);
        if let Some(secret) = &cfg.secret {
            request = request.header("X-Doctobot-Secret", secret);
        }

        request
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| notify_err("webhook", e))?;

        Ok(())
    }
}

// ======================================================
// EMAIL (SMTP via lettre)
// ======================================================

async fn send_email(cfg: EmailConfig, note: &Notification) -> Result<()> {
    let subject = format!("[Doctobot] {}", note.event.label());
    let body = note.message.clone();

    tokio::task::spawn_blocking(move || send_smtp(&cfg, &subject, &body))
        .await
        .map_err(|e| notify_err("email", e))?
}

fn send_smtp(cfg: &EmailConfig, subject: &str, body: &str) -> Result<()> {
    use lettre::message::header::ContentType;
    use lettre::transport::smtp::authentication::Credentials;
    use lettre::transport::smtp::client::{Tls, TlsParameters};
    use lettre::{Message, SmtpTransport, Transport};

    let host = cfg
        .smtp_host
        .as_deref()
        .ok_or_else(|| notify_err("email", "smtp_host is required"))?;
    let from = cfg
        .from
        .as_deref()
        .ok_or_else(|| notify_err("email", "from address is required"))?;

    let mut builder = Message::builder()
        .from(from.parse().map_err(|e| notify_err("email", format!("invalid from address: {}", e)))?)
        .subject(subject)
        .header(ContentType::TEXT_PLAIN);

    for addr in &cfg.to {
        builder = builder.to(addr
            .parse()
            .map_err(|e| notify_err("email", format!("invalid to address '{}': {}", addr, e)))?);
    }

    let email = builder
        .body(body.to_owned())
        .map_err(|e| notify_err("email", format!("failed to build email: {}", e)))?;

    let tls = if cfg.starttls {
        let params = TlsParameters::new(host.to_owned())
            .map_err(|e| notify_err("email", format!("TLS configuration error: {}", e)))?;
        Tls::Required(params)
    } else {
        Tls::None
    };

    let mut transport = SmtpTransport::builder_dangerous(host)
        .port(cfg.smtp_port)
        .tls(tls);

    if let (Some(username), Some(password)) = (&cfg.smtp_username, &cfg.smtp_password) {
        transport = transport.credentials(Credentials::new(username.clone(), password.clone()));
    }

    transport
        .build()
        .send(&email)
        .map_err(|e| notify_err("email", format!("SMTP delivery failed: {}", e)))?;

    Ok(())
}

// ======================================================
// HELPERS
// ======================================================

fn notify_err(channel: &'static str, reason: impl ToString) -> Error {
    Error::Notify {
        channel,
        reason: reason.to_string(),
    }
}

/// Split on line boundaries so each chunk has at most `max` characters.
/// A single line longer than `max` is cut on character boundaries.
pub fn split_message(text: &str, max: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split('\n') {
        let line_len = line.chars().count();
        let sep = usize::from(!current.is_empty());

        if current_len + sep + line_len <= max {
            if sep == 1 {
                current.push('\n');
            }
            current.push_str(line);
            current_len += sep + line_len;
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }

        let mut chars = line.chars().peekable();
        while chars.peek().is_some() {
            let piece: String = chars.by_ref().take(max).collect();
            let piece_len = piece.chars().count();
            if piece_len == max {
                chunks.push(piece);
            } else {
                current = piece;
                current_len = piece_len;
            }
        }
    }

    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}
