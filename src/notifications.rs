use crate::report::{SessionReport, UpdateRecord};
use chatterbox::message::{Dispatcher, Message};
use log::{debug, error, info, warn};
use std::env;

fn paired_env(key: &str, companion: &str) -> Option<(String, String)> {
    let Ok(value) = env::var(key) else {
        info!("{key} not defined");
        return None;
    };
    match env::var(companion) {
        Ok(companion_value) => Some((value, companion_value)),
        Err(_) => {
            warn!("{key} is set but {companion} is not defined");
            None
        }
    }
}

pub fn setup_dispatcher() -> Dispatcher {
    let slack = paired_env("REFIT_SLACK_WEBHOOK_URL", "REFIT_SLACK_CHANNEL").map(
        |(webhook_url, channel)| {
            info!("Using Slack dispatcher");
            chatterbox::dispatcher::slack::Slack {
                webhook_url,
                channel,
            }
        },
    );
    let telegram = paired_env("REFIT_TELEGRAM_BOT_TOKEN", "REFIT_TELEGRAM_CHAT_ID").map(
        |(bot_token, chat_id)| {
            info!("Using Telegram dispatcher");
            chatterbox::dispatcher::telegram::Telegram { bot_token, chat_id }
        },
    );
    let discord = paired_env("REFIT_DISCORD_BOT_TOKEN", "REFIT_DISCORD_CHANNEL_ID").map(
        |(bot_token, channel_id)| {
            info!("Using Discord dispatcher");
            chatterbox::dispatcher::discord::Discord {
                bot_token,
                channel_id,
            }
        },
    );
    let sender = chatterbox::dispatcher::Sender {
        slack,
        telegram,
        discord,
        email: None,
    };

    Dispatcher::new(sender)
}

impl From<&UpdateRecord> for Message {
    fn from(record: &UpdateRecord) -> Self {
        Message::new(record.outcome.to_string(), record.to_string())
    }
}

/// Sends one message per container that did not stay as it was.
pub fn send_report(report: &SessionReport, dispatcher: &Dispatcher) {
    let mut sent = 0;
    for record in report.changes() {
        let message: Message = record.into();
        match dispatcher.dispatch(&message) {
            Ok(_) => sent += 1,
            Err(e) => error!("failed to dispatch message for {}: {e}", record.name),
        }
    }
    for entry in report.malformed() {
        let message = Message::new(
            "Container skipped ❌".to_string(),
            format!("container {}\nerror: {}", entry.container, entry.error),
        );
        if let Err(e) = dispatcher.dispatch(&message) {
            error!("failed to dispatch message for {}: {e}", entry.container);
        }
    }
    debug!("dispatched {sent} notifications");
}
