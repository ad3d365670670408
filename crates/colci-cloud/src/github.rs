//! Run summary reporters

use crate::adapter::{CollaboratorError, RunReporter};
use crate::dbt_cloud::map_http_status;
use colci_core::{GithubConfig, RunReport};
use serde_json::json;
use tracing::{info, warn};

const GITHUB_API: &str = "https://api.github.com";

/// Posts the summary as a pull request comment
#[derive(Clone)]
pub struct GithubReporter {
    client: reqwest::Client,
    token: String,
    repository: String,
    pull_request: u64,
}

impl GithubReporter {
    pub fn new(token: impl Into<String>, repository: impl Into<String>, pull_request: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.into(),
            repository: repository.into(),
            pull_request,
        }
    }

    /// Reporter for the pull request in `config`, if token, repository and PR
    /// number are all known
    pub fn from_config(config: &GithubConfig) -> Option<Self> {
        let token = config.token.as_ref()?;
        let repository = config.repository.as_ref()?;
        let pull_request = config.pull_request_number()?;
        Some(Self::new(token.clone(), repository.clone(), pull_request))
    }

    pub fn comments_url(&self) -> String {
        format!(
            "{}/repos/{}/issues/{}/comments",
            GITHUB_API,
            self.repository.trim_matches('/'),
            self.pull_request
        )
    }
}

#[async_trait::async_trait]
impl RunReporter for GithubReporter {
    fn name(&self) -> &'static str {
        "GitHub"
    }

    async fn publish(&self, report: &RunReport) -> Result<(), CollaboratorError> {
        let response = self
            .client
            .post(self.comments_url())
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github.v3+json")
            .header(reqwest::header::USER_AGENT, concat!("colci/", env!("CARGO_PKG_VERSION")))
            .json(&json!({ "body": report.to_markdown() }))
            .send()
            .await
            .map_err(|err| CollaboratorError::Network(format!("http post failed: {err}")))?;

        if response.status().is_success() {
            info!(repository = %self.repository, pull_request = self.pull_request, "Posted PR comment");
            return Ok(());
        }
        let status = response.status();
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        Err(map_http_status(status, text))
    }
}

/// Logs the summary instead of publishing it
#[derive(Clone, Debug, Default)]
pub struct ConsoleReporter;

#[async_trait::async_trait]
impl RunReporter for ConsoleReporter {
    fn name(&self) -> &'static str {
        "Console"
    }

    async fn publish(&self, report: &RunReport) -> Result<(), CollaboratorError> {
        info!("Run summary:\n{}", report.to_markdown());
        Ok(())
    }
}

/// GitHub reporter when the pull request context is complete, console otherwise
pub fn reporter_from_config(config: &GithubConfig) -> Box<dyn RunReporter> {
    match GithubReporter::from_config(config) {
        Some(reporter) => Box::new(reporter),
        None => {
            warn!("No GitHub token, repository or pull request; the summary will only be logged");
            Box::new(ConsoleReporter)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn github(git_ref: &str) -> GithubConfig {
        GithubConfig {
            token: Some("ghp_test".to_string()),
            repository: Some("acme/analytics".to_string()),
            git_ref: Some(git_ref.to_string()),
            head_ref: Some("feature/orders".to_string()),
        }
    }

    #[test]
    fn comments_url_for_pull_request() {
        let reporter = GithubReporter::from_config(&github("refs/pull/42/merge")).unwrap();
        assert_eq!(
            reporter.comments_url(),
            "https://api.github.com/repos/acme/analytics/issues/42/comments"
        );
    }

    #[test]
    fn push_builds_fall_back_to_console() {
        assert!(GithubReporter::from_config(&github("refs/heads/main")).is_none());
        assert_eq!(reporter_from_config(&github("refs/heads/main")).name(), "Console");
        assert_eq!(reporter_from_config(&github("refs/pull/7/merge")).name(), "GitHub");
    }

    #[tokio::test]
    async fn console_reporter_never_fails() {
        let report = RunReport::new(Vec::new(), colci_core::CiSelection::unpruned("state:modified+"), true);
        assert!(ConsoleReporter.publish(&report).await.is_ok());
    }
}
