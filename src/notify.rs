// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Notification hook
//!
//! When the configuration carries `notify: <URL>/<token>`, messages are
//! posted there as JSON. Failing notifications are never a reason to
//! crash anything; they are swallowed with a warning.

use base64::Engine;
use serde::Serialize;

use crate::config::ConfigModel;

#[derive(Serialize)]
struct NotifyPayload<'a> {
    token: &'a str,
    message: &'a str,

    #[serde(skip_serializing_if = "Option::is_none")]
    attachment_name: Option<&'a str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    attachment_data: Option<String>,
}

/// Print a message and deliver it to the configured notification channel,
/// if any.
pub async fn notify(config: &ConfigModel, message: &str, attachment: Option<(&str, &[u8])>) {
    println!("{}", message);

    let Some(target) = &config.notify else {
        return;
    };
    let re = regex::Regex::new(r"^(https?://\S+)/([a-z0-9]+)$").expect("notify pattern");
    let Some(caps) = re.captures(target) else {
        tracing::warn!(
            "Could not split '{}' into http(s)://host/token for notification",
            target
        );
        return;
    };
    let url = caps.get(1).expect("url group").as_str();
    let token = caps.get(2).expect("token group").as_str();

    let payload = NotifyPayload {
        token,
        message,
        attachment_name: attachment.map(|(name, _)| name),
        attachment_data: attachment
            .map(|(_, data)| base64::engine::general_purpose::STANDARD.encode(data)),
    };

    let client = reqwest::Client::new();
    match client.post(url).json(&payload).send().await {
        Ok(response) if response.status().is_success() => {}
        Ok(response) => {
            tracing::warn!("Notification to '{}' failed with status {}", url, response.status());
        }
        Err(e) => {
            tracing::warn!("Notification to '{}' failed: {}", url, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_notify(dir: &std::path::Path, notify: &str) -> ConfigModel {
        let yaml = format!(
            "destination_path: {}\nsteps: {{}}\nnotify: \"{}\"\n",
            dir.display(),
            notify
        );
        ConfigModel::from_yaml(&yaml, dir, "test.yaml").unwrap()
    }

    #[tokio::test]
    async fn test_malformed_notify_target_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_notify(dir.path(), "not-a-url");
        // Must not panic or error.
        notify(&config, "hello", None).await;
    }

    #[tokio::test]
    async fn test_unreachable_notify_target_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_notify(dir.path(), "http://127.0.0.1:1/abc123");
        notify(&config, "hello", Some(("log.txt", b"data"))).await;
    }
}
