//! Notification dispatch - chat webhook delivery
//!
//! A detected change is turned into a one-line message plus a link and posted to the
//! configured chat receiver. Messages that cannot be delivered are appended to a JSON
//! spool file so they can be resent by hand.

use async_trait::async_trait;
use chrono::Local;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::NotifyError;
use crate::model::{ChangeKind, TrackedRepository};
use crate::provider::USER_AGENT;

/// Delivery of change notifications
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        repo: &TrackedRepository,
        kind: ChangeKind,
        value: &str,
    ) -> Result<(), NotifyError>;
}

/// Chat service receiving the webhook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
#[value(rename_all = "lower")]
pub enum Receiver {
    RocketChat,
    Slack,
    Discord,
    MsTeams,
}

impl Receiver {
    pub fn as_str(&self) -> &'static str {
        match self {
            Receiver::RocketChat => "rocketchat",
            Receiver::Slack => "slack",
            Receiver::Discord => "discord",
            Receiver::MsTeams => "msteams",
        }
    }

    /// Environment variable conventionally holding this receiver's webhook URL
    pub fn default_webhook_env(&self) -> String {
        format!("{}_WEBHOOK", self.as_str().to_uppercase())
    }

    /// JSON body understood by the receiver's incoming webhook
    pub fn payload(&self, message: &str) -> Value {
        match self {
            Receiver::MsTeams => json!({ "Text": message }),
            Receiver::Slack => json!({ "text": message }),
            Receiver::Discord => json!({ "content": message }),
            Receiver::RocketChat => json!({
                "emoji": ":chipmunk:",
                "attachments": [{
                    "title": "ratatoskr notify",
                    "text": message,
                    "color": "#764FA5",
                }],
            }),
        }
    }
}

impl fmt::Display for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human readable announcement of a change
pub fn format_message(repo: &TrackedRepository, kind: ChangeKind, value: &str) -> String {
    format!(
        "New {} for repository {}: {}\n{}",
        kind,
        repo.full_name(),
        value,
        repo.web_link(kind, value)
    )
}

/// Posts notifications to a chat webhook
#[derive(Debug)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    receiver: Receiver,
    webhook_url: String,
    backoff: Duration,
    spool_path: PathBuf,
}

impl WebhookNotifier {
    pub fn new(
        receiver: Receiver,
        webhook_url: impl Into<String>,
        backoff: Duration,
        spool_dir: &Path,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            receiver,
            webhook_url: webhook_url.into(),
            backoff,
            spool_path: spool_dir.join(spool_file_name()),
        })
    }

    /// Build a notifier whose webhook URL is read from the environment variable `env_name`
    pub fn from_env(
        receiver: Receiver,
        env_name: &str,
        backoff: Duration,
        spool_dir: &Path,
    ) -> Result<Self, NotifyError> {
        let webhook_url = std::env::var(env_name)
            .ok()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| NotifyError::MissingWebhook(env_name.to_string()))?;

        Self::new(receiver, webhook_url, backoff, spool_dir)
    }

    pub fn receiver(&self) -> Receiver {
        self.receiver
    }

    pub fn spool_path(&self) -> &Path {
        &self.spool_path
    }

    async fn post(&self, payload: &Value) -> Result<(), NotifyError> {
        let response = self.client.post(&self.webhook_url).json(payload).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    async fn deliver(&self, message: &str) -> Result<(), NotifyError> {
        let payload = self.receiver.payload(message);

        match self.post(&payload).await {
            Err(NotifyError::Rejected { status, .. })
                if status == StatusCode::TOO_MANY_REQUESTS.as_u16() =>
            {
                warn!(
                    "{} webhook answered 429, backing off for {}s",
                    self.receiver,
                    self.backoff.as_secs()
                );
                tokio::time::sleep(self.backoff).await;
                self.post(&payload).await
            }
            other => other,
        }
    }

    /// Append an undelivered message to the spool file
    async fn spool(&self, message: &str) -> Result<(), NotifyError> {
        let mut pending: Vec<String> = match tokio::fs::read_to_string(&self.spool_path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(pending) => pending,
                Err(e) => {
                    let aside = self.spool_path.with_extension("json.corrupt");
                    warn!(
                        "Spool file {} is not a JSON array ({}), moving it to {}",
                        self.spool_path.display(),
                        e,
                        aside.display()
                    );
                    tokio::fs::rename(&self.spool_path, &aside)
                        .await
                        .map_err(|e| NotifyError::Spool(format!("{}: {}", aside.display(), e)))?;
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(NotifyError::Spool(e.to_string())),
        };

        pending.push(message.to_string());

        let content =
            serde_json::to_string(&pending).map_err(|e| NotifyError::Spool(e.to_string()))?;
        tokio::fs::write(&self.spool_path, content)
            .await
            .map_err(|e| NotifyError::Spool(format!("{}: {}", self.spool_path.display(), e)))?;

        info!("Wrote undelivered message to {}", self.spool_path.display());
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(
        &self,
        repo: &TrackedRepository,
        kind: ChangeKind,
        value: &str,
    ) -> Result<(), NotifyError> {
        let message = format_message(repo, kind, value);
        debug!("Notifying {}: {}", self.receiver, message);

        match self.deliver(&message).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.spool(&message).await?;
                Err(err)
            }
        }
    }
}

/// `ratatoskr_<YYYY-MM-DD>_<pid>.json`
fn spool_file_name() -> String {
    format!(
        "ratatoskr_{}_{}.json",
        Local::now().format("%Y-%m-%d"),
        std::process::id()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Provider, TrackedSignal};
    use assert_matches::assert_matches;
    use serial_test::serial;
    use tempfile::TempDir;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn repo() -> TrackedRepository {
        TrackedRepository {
            id: 1,
            url: "https://github.com/outflanknl/RedELK".into(),
            provider: Provider::GitHub,
            owner: "outflanknl".into(),
            name: "RedELK".into(),
            category: Some("C2".into()),
            added_date: None,
            signal: TrackedSignal::Unknown,
            last_checked: None,
        }
    }

    fn notifier(server: &MockServer, receiver: Receiver, spool: &TempDir) -> WebhookNotifier {
        WebhookNotifier::new(
            receiver,
            format!("{}/hook", server.uri()),
            Duration::from_millis(10),
            spool.path(),
        )
        .unwrap()
    }

    #[test]
    fn test_format_message() {
        let message = format_message(&repo(), ChangeKind::Release, "v3.0.1");
        assert_eq!(
            message,
            "New release for repository outflanknl/RedELK: v3.0.1\n\
             https://github.com/outflanknl/RedELK/releases/tag/v3.0.1"
        );
    }

    #[test]
    fn test_payload_shapes() {
        assert_eq!(Receiver::MsTeams.payload("m"), json!({"Text": "m"}));
        assert_eq!(Receiver::Slack.payload("m"), json!({"text": "m"}));
        assert_eq!(Receiver::Discord.payload("m"), json!({"content": "m"}));
        assert_eq!(
            Receiver::RocketChat.payload("m")["attachments"][0]["color"],
            "#764FA5"
        );
    }

    #[test]
    fn test_receiver_names() {
        assert_eq!(Receiver::RocketChat.default_webhook_env(), "ROCKETCHAT_WEBHOOK");
        assert_eq!(
            serde_yaml::from_str::<Receiver>("msteams").unwrap(),
            Receiver::MsTeams
        );
        assert_eq!(
            <Receiver as clap::ValueEnum>::from_str("rocketchat", true).unwrap(),
            Receiver::RocketChat
        );
    }

    #[test]
    fn test_spool_file_name() {
        let name = spool_file_name();
        assert!(name.starts_with("ratatoskr_"));
        assert!(name.ends_with(&format!("_{}.json", std::process::id())));
    }

    #[tokio::test]
    async fn test_delivers_slack_payload() {
        let server = MockServer::start().await;
        let spool = TempDir::new().unwrap();
        let expected = format_message(&repo(), ChangeKind::Commit, "abc123");

        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_json(json!({ "text": expected })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        notifier(&server, Receiver::Slack, &spool)
            .notify(&repo(), ChangeKind::Commit, "abc123")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_discord_no_content_is_success() {
        let server = MockServer::start().await;
        let spool = TempDir::new().unwrap();
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let notifier = notifier(&server, Receiver::Discord, &spool);
        notifier
            .notify(&repo(), ChangeKind::Release, "v1")
            .await
            .unwrap();
        assert!(!notifier.spool_path().exists());
    }

    #[tokio::test]
    async fn test_retries_once_after_too_many_requests() {
        let server = MockServer::start().await;
        let spool = TempDir::new().unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = notifier(&server, Receiver::MsTeams, &spool);
        notifier
            .notify(&repo(), ChangeKind::Release, "v1")
            .await
            .unwrap();
        assert!(!notifier.spool_path().exists());
    }

    #[tokio::test]
    async fn test_failed_delivery_is_spooled() {
        let server = MockServer::start().await;
        let spool = TempDir::new().unwrap();
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let notifier = notifier(&server, Receiver::RocketChat, &spool);
        let first = notifier.notify(&repo(), ChangeKind::Release, "v1").await;
        let second = notifier.notify(&repo(), ChangeKind::Release, "v2").await;

        assert_matches!(first, Err(NotifyError::Rejected { status: 500, .. }));
        assert_matches!(second, Err(NotifyError::Rejected { .. }));

        let content = std::fs::read_to_string(notifier.spool_path()).unwrap();
        let spooled: Vec<String> = serde_json::from_str(&content).unwrap();
        assert_eq!(spooled.len(), 2);
        assert!(spooled[0].contains("v1"));
        assert!(spooled[1].contains("v2"));
    }

    #[tokio::test]
    async fn test_unreadable_spool_file_is_kept_aside() {
        let server = MockServer::start().await;
        let spool = TempDir::new().unwrap();
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = notifier(&server, Receiver::Slack, &spool);
        std::fs::write(notifier.spool_path(), "[\"earlier message\"").unwrap();

        let result = notifier.notify(&repo(), ChangeKind::Commit, "abc123").await;
        assert_matches!(result, Err(NotifyError::Rejected { status: 500, .. }));

        let aside = notifier.spool_path().with_extension("json.corrupt");
        assert_eq!(std::fs::read_to_string(aside).unwrap(), "[\"earlier message\"");

        let content = std::fs::read_to_string(notifier.spool_path()).unwrap();
        let spooled: Vec<String> = serde_json::from_str(&content).unwrap();
        assert_eq!(spooled.len(), 1);
        assert!(spooled[0].contains("abc123"));
    }

    #[test]
    #[serial]
    fn test_from_env_requires_webhook() {
        let spool = TempDir::new().unwrap();
        std::env::remove_var("TEST_RATATOSKR_WEBHOOK");

        let result = WebhookNotifier::from_env(
            Receiver::Slack,
            "TEST_RATATOSKR_WEBHOOK",
            Duration::from_secs(1),
            spool.path(),
        );
        assert_matches!(result, Err(NotifyError::MissingWebhook(name)) if name == "TEST_RATATOSKR_WEBHOOK");

        std::env::set_var("TEST_RATATOSKR_WEBHOOK", "https://hooks.example.org/x");
        let notifier = WebhookNotifier::from_env(
            Receiver::Slack,
            "TEST_RATATOSKR_WEBHOOK",
            Duration::from_secs(1),
            spool.path(),
        )
        .unwrap();
        assert_eq!(notifier.receiver(), Receiver::Slack);
        std::env::remove_var("TEST_RATATOSKR_WEBHOOK");
    }
}
