//! GitOps HTTP surface's Git provider client (spec §6): GitHub REST calls
//! backing commit listing and the revert-commit algorithm, each step gated
//! independently by the shared [`RateLimiter`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::GitopsConfig;
use crate::errors::GitProviderError;
use crate::ratelimit::RateLimiter;
use crate::secret::Secret;

const GITHUB_API_BASE: &str = "https://api.github.com";
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitSummary {
    pub sha: String,
    pub message: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevertResult {
    pub revert_sha: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct CommitAuthor {
    name: Option<String>,
    date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    message: String,
    author: CommitAuthor,
}

#[derive(Debug, Deserialize)]
struct CommitParent {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct CommitListItem {
    sha: String,
    commit: CommitDetail,
}

#[derive(Debug, Deserialize)]
struct GetCommitResponse {
    sha: String,
    commit: CommitDetail,
    parents: Vec<CommitParent>,
}

#[derive(Debug, Deserialize)]
struct TreeRef {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GetCommitTreeResponse {
    tree: TreeRef,
}

#[derive(Debug, Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GetRefResponse {
    object: RefObject,
}

#[derive(Debug, Serialize)]
struct CreateCommitBody {
    message: String,
    tree: String,
    parents: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CreateCommitResponse {
    sha: String,
}

#[derive(Debug, Serialize)]
struct UpdateRefBody {
    sha: String,
}

pub struct GitProvider {
    http: Client,
    api_base: String,
    owner: String,
    repo: String,
    branch: String,
    token: Secret<String>,
    limiter: Arc<RateLimiter>,
}

impl GitProvider {
    pub fn new(config: &GitopsConfig, token: Secret<String>, limiter: Arc<RateLimiter>) -> Result<Self, GitProviderError> {
        let (owner, repo) = config
            .repository
            .split_once('/')
            .ok_or_else(|| GitProviderError::Api {
                status: 400,
                message: format!("malformed repository {:?}, expected owner/repo", config.repository),
            })?;

        Ok(Self {
            http: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            api_base: GITHUB_API_BASE.to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            branch: config.branch.clone(),
            token,
            limiter,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}{path}", self.api_base, self.owner, self.repo)
    }

    async fn gated_request<T: for<'de> Deserialize<'de>>(
        &self,
        step: &'static str,
        build: impl FnOnce(&Client) -> reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<T, GitProviderError> {
        self.limiter
            .wait(cancel)
            .await
            .map_err(|_| GitProviderError::RateLimited(std::time::Duration::from_millis(100)))?;

        let resp = build(&self.http)
            .header("Authorization", format!("Bearer {}", self.token.expose()))
            .header("User-Agent", "cluster-sentinel")
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(GitProviderError::Request)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GitProviderError::Api {
                status: status.as_u16(),
                message: format!("{step}: {body}"),
            });
        }

        resp.json::<T>()
            .await
            .map_err(|e| GitProviderError::Api { status: status.as_u16(), message: format!("{step}: {e}") })
    }

    /// `GET /api/gitops/commits` backing call: the most recent commits on
    /// the configured branch.
    pub async fn list_commits(&self, cancel: &CancellationToken) -> Result<Vec<CommitSummary>, GitProviderError> {
        let url = self.url(&format!("/commits?sha={}&per_page=20", self.branch));
        let items: Vec<CommitListItem> = self
            .gated_request("list commits", |c| c.get(&url), cancel)
            .await?;

        Ok(items
            .into_iter()
            .map(|c| CommitSummary {
                sha: c.sha,
                message: c.commit.message,
                author: c.commit.author.name.unwrap_or_else(|| "unknown".to_string()),
                timestamp: c.commit.author.date.unwrap_or_else(Utc::now),
            })
            .collect())
    }

    /// The revert-commit algorithm (spec §6): fetch commit, fetch its
    /// parent, fetch branch HEAD, create a new commit carrying the parent's
    /// tree with HEAD as its sole parent, then move the branch ref to it.
    /// Each step is independently rate-limited and failures surface with
    /// step context so an operator can tell which GitHub call failed.
    pub async fn revert_commit(&self, sha: &str, cancel: &CancellationToken) -> Result<RevertResult, GitProviderError> {
        let commit: GetCommitResponse = self
            .gated_request("fetch commit", |c| c.get(self.url(&format!("/commits/{sha}"))), cancel)
            .await?;

        let parent_sha = commit
            .parents
            .first()
            .map(|p| p.sha.clone())
            .ok_or_else(|| GitProviderError::Api {
                status: 422,
                message: format!("fetch commit: {sha} has no parent to revert onto"),
            })?;

        let parent_tree: GetCommitTreeResponse = self
            .gated_request(
                "fetch parent commit",
                |c| c.get(self.url(&format!("/git/commits/{parent_sha}"))),
                cancel,
            )
            .await?;

        let head_ref: GetRefResponse = self
            .gated_request(
                "fetch branch ref",
                |c| c.get(self.url(&format!("/git/refs/heads/{}", self.branch))),
                cancel,
            )
            .await?;

        let message = format!(
            "Revert \"{}\"\n\nThis reverts commit {}.",
            commit.commit.message, commit.sha
        );
        let body = CreateCommitBody {
            message: message.clone(),
            tree: parent_tree.tree.sha,
            parents: vec![head_ref.object.sha],
        };

        let created: CreateCommitResponse = self
            .gated_request(
                "create revert commit",
                |c| c.post(self.url("/git/commits")).json(&body),
                cancel,
            )
            .await?;

        self.update_branch_ref(&created.sha, cancel).await?;

        Ok(RevertResult { revert_sha: created.sha, message })
    }

    async fn update_branch_ref(&self, new_sha: &str, cancel: &CancellationToken) -> Result<(), GitProviderError> {
        self.limiter
            .wait(cancel)
            .await
            .map_err(|_| GitProviderError::RateLimited(std::time::Duration::from_millis(100)))?;

        let body = UpdateRefBody { sha: new_sha.to_string() };
        let resp = self
            .http
            .patch(self.url(&format!("/git/refs/heads/{}", self.branch)))
            .header("Authorization", format!("Bearer {}", self.token.expose()))
            .header("User-Agent", "cluster-sentinel")
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await
            .map_err(GitProviderError::Request)?;

        if resp.status() == StatusCode::OK {
            Ok(())
        } else {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            Err(GitProviderError::Api { status, message: format!("update branch ref: {body}") })
        }
    }
}
