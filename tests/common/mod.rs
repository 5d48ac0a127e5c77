/// Common test utilities and helpers for Ratatoskr tests
use async_trait::async_trait;
use ratatoskr::{ChangeKind, Notifier, NotifyError, TrackedRepository};
use std::path::PathBuf;
use std::sync::Mutex;
use tempfile::TempDir;

/// Isolated directory holding a config file, a database and a reference list
pub struct TestEnvironment {
    pub temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        Self { temp_dir }
    }

    pub fn database_path(&self) -> PathBuf {
        self.temp_dir.path().join("tracker.db")
    }

    pub fn reference_list_path(&self) -> PathBuf {
        self.temp_dir.path().join("GitHub_Tools_List.csv")
    }

    pub fn create_test_config(&self, content: &str) -> PathBuf {
        let config_path = self.temp_dir.path().join("config.yml");
        std::fs::write(&config_path, content).expect("Failed to write test config");
        config_path
    }

    /// Config pointing every path into the temp dir. Token variables are chosen so they are
    /// never set, keeping the binary away from real credentials.
    pub fn create_minimal_config(&self) -> PathBuf {
        let config_content = format!(
            r#"
database: "{db}"
reference_list: "{list}"
github:
  api_url: "http://127.0.0.1:9"
  token_env: "RATATOSKR_TEST_UNSET_GITHUB_TOKEN"
gitlab:
  api_url: "http://127.0.0.1:9"
  token_env: "RATATOSKR_TEST_UNSET_GITLAB_TOKEN"
notify:
  spool_dir: "{dir}"
"#,
            db = self.database_path().display(),
            list = self.reference_list_path().display(),
            dir = self.temp_dir.path().display(),
        );
        self.create_test_config(&config_content)
    }

    pub fn create_reference_list(&self, urls: &[&str]) -> PathBuf {
        let mut content = String::from("URL,Category,Date Added\n");
        for url in urls {
            content.push_str(&format!("{},testing,2024-01-01\n", url));
        }
        let path = self.reference_list_path();
        std::fs::write(&path, content).expect("Failed to write reference list");
        path
    }
}

/// A notification captured by [`RecordingNotifier`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub repository: String,
    pub kind: ChangeKind,
    pub value: String,
}

/// Notifier that remembers every notification instead of sending it
#[derive(Default)]
pub struct RecordingNotifier {
    delivered: Mutex<Vec<Delivered>>,
}

#[allow(dead_code)]
impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        repo: &TrackedRepository,
        kind: ChangeKind,
        value: &str,
    ) -> Result<(), NotifyError> {
        self.delivered.lock().unwrap().push(Delivered {
            repository: repo.full_name(),
            kind,
            value: value.to_string(),
        });
        Ok(())
    }
}

/// Assertion helpers for test validation
#[allow(dead_code)]
pub fn assert_contains_all(text: &str, expected: &[&str]) {
    for item in expected {
        assert!(
            text.contains(item),
            "Expected text to contain '{}', but it didn't. Text: {}",
            item,
            text
        );
    }
}
