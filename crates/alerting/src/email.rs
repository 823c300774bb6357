//! Mail sink -- one report message per run over SMTP.

use lettre::message::header::ContentType;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use driftwatch_core::AlertTuple;
use driftwatch_core::config::MailSettings;
use driftwatch_core::error::AlertError;

use crate::Sink;
use crate::console::format_alert;

pub struct MailSink {
    settings: MailSettings,
    html: bool,
}

impl MailSink {
    pub fn plain(settings: MailSettings) -> Self {
        Self {
            settings,
            html: false,
        }
    }

    pub fn html(settings: MailSettings) -> Self {
        Self {
            settings,
            html: true,
        }
    }

    fn delivery_error(&self, reason: impl ToString) -> AlertError {
        AlertError::Delivery {
            sink: Sink::name(self).to_owned(),
            reason: reason.to_string(),
        }
    }

    fn compose(&self, tuples: &[AlertTuple]) -> Result<Message, AlertError> {
        let body = compose_body(tuples, self.html);
        let mut builder = Message::builder()
            .from(
                self.settings
                    .from
                    .parse()
                    .map_err(|e| self.delivery_error(e))?,
            )
            .subject(self.settings.subject.clone());
        for recipient in &self.settings.to {
            builder = builder.to(recipient.parse().map_err(|e| self.delivery_error(e))?);
        }
        let content_type = if self.html {
            ContentType::TEXT_HTML
        } else {
            ContentType::TEXT_PLAIN
        };
        builder
            .header(content_type)
            .body(body)
            .map_err(|e| self.delivery_error(e))
    }
}

/// The report body: block-formatted tuples, `<br />`-joined for html.
pub fn compose_body(tuples: &[AlertTuple], html: bool) -> String {
    let text = tuples
        .iter()
        .map(|t| format_alert(t, false))
        .collect::<Vec<_>>()
        .join("\n");
    if html {
        text.replace('\n', "<br />")
    } else {
        text
    }
}

impl Sink for MailSink {
    fn name(&self) -> &'static str {
        if self.html { "mail_html" } else { "mail_txt" }
    }

    async fn deliver(&self, tuples: &[AlertTuple]) -> Result<(), AlertError> {
        let message = self.compose(tuples)?;
        let transport: AsyncSmtpTransport<Tokio1Executor> =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.settings.smtp_host)
                .build();
        transport
            .send(message)
            .await
            .map_err(|e| self.delivery_error(e))?;
        Ok(())
    }
}
