//! Out-of-band notifications: the password-change alert that fires after
//! `change_password` succeeds. Tries the user's preferred contact method
//! first and falls back to the other channel on failure; if neither
//! channel is configured, logs a warning and gives up silently (the
//! caller never blocks a password change on notification delivery).

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::{Settings, SmtpSettings, TwilioSettings};
use crate::model::{PreferredContactMethod, User};

pub async fn send_password_changed_notification(settings: &Settings, user: &User) -> bool {
    let subject = "Your password was changed";
    let body = format!(
        "The password for your {} account was just changed. If this wasn't you, contact support immediately.",
        settings.app_name
    );

    let (primary, fallback) = match user.preferred_contact_method {
        PreferredContactMethod::Email => (Channel::Email, Channel::Sms),
        PreferredContactMethod::Sms => (Channel::Sms, Channel::Email),
    };

    if try_channel(primary, settings, user, subject, &body).await {
        return true;
    }
    if try_channel(fallback, settings, user, subject, &body).await {
        return true;
    }

    tracing::warn!(
        target: "securevault::notify",
        user_id = %user.id,
        "no contact method succeeded; password-change notification not delivered"
    );
    false
}

#[derive(Clone, Copy)]
enum Channel {
    Email,
    Sms,
}

async fn try_channel(channel: Channel, settings: &Settings, user: &User, subject: &str, body: &str) -> bool {
    match channel {
        Channel::Email => {
            let (Some(smtp), Some(to)) = (settings.smtp(), user.email.as_ref()) else {
                return false;
            };
            match send_email(&smtp, to, subject, body).await {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(target: "securevault::notify", %err, "email notification failed");
                    false
                }
            }
        }
        Channel::Sms => {
            let (Some(twilio), Some(to)) = (settings.twilio(), user.phone.as_ref()) else {
                return false;
            };
            match send_sms(&twilio, to, body).await {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(target: "securevault::notify", %err, "SMS notification failed");
                    false
                }
            }
        }
    }
}

async fn send_email(smtp: &SmtpSettings, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
    let from = smtp.from_address.clone().unwrap_or_else(|| smtp.username.clone());
    let message = Message::builder()
        .from(from.parse::<Mailbox>()?)
        .to(to.parse::<Mailbox>()?)
        .subject(subject)
        .body(body.to_string())?;

    let creds = Credentials::new(smtp.username.clone(), smtp.password.clone());
    let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.server)?
        .port(smtp.port)
        .credentials(creds)
        .build();

    transport.send(message).await?;
    Ok(())
}

async fn send_sms(twilio: &TwilioSettings, to: &str, body: &str) -> anyhow::Result<()> {
    let url = format!(
        "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
        twilio.account_sid
    );
    let client = reqwest::Client::new();
    let response = client
        .post(url)
        .basic_auth(&twilio.account_sid, Some(&twilio.auth_token))
        .form(&[
            ("To", to),
            ("From", twilio.phone_number.as_str()),
            ("Body", body),
        ])
        .send()
        .await?;

    if response.status().is_success() {
        Ok(())
    } else {
        anyhow::bail!("twilio responded with status {}", response.status())
    }
}
