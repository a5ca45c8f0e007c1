//! Pull request creation, branch naming, and issue updates over REST.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::{GitHubClient, IssueDetail, NativeMerge, PullRequest};

/// Longest slug segment allowed in a branch name.
const MAX_SLUG_LEN: usize = 40;

/// Convert a title to a branch-safe slug: lowercased, non-alphanumerics
/// stripped, whitespace/underscores collapsed to single hyphens,
/// length-bounded.
pub fn slugify(text: &str, max_len: usize) -> String {
    let lowered = text.to_lowercase();
    let mapped: String = lowered
        .chars()
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                Some(c)
            } else if c.is_whitespace() || c == '_' {
                Some(' ')
            } else {
                None
            }
        })
        .collect();

    let slug = mapped
        .split([' ', '-'])
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    // Slug is pure ASCII at this point, so byte slicing is safe.
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// Branch name for an issue: `feature/<n>-<slug>` or `bug/<n>-<slug>` when a
/// `bug` label is present.
pub fn branch_name_for(issue_number: u64, title: &str, labels: &[String]) -> String {
    let prefix = if labels.iter().any(|l| l.eq_ignore_ascii_case("bug")) {
        "bug"
    } else {
        "feature"
    };
    format!("{}/{}-{}", prefix, issue_number, slugify(title, MAX_SLUG_LEN))
}

#[derive(Debug, Deserialize)]
struct RestIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    state: String,
    #[serde(default)]
    labels: Vec<RestLabel>,
}

#[derive(Debug, Deserialize)]
struct RestLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RestPull {
    number: u64,
    head: RestRef,
    base: RestRef,
}

#[derive(Debug, Deserialize)]
struct RestRef {
    #[serde(rename = "ref")]
    branch: String,
}

#[derive(Debug, Deserialize)]
struct RestReview {
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct RestMergeError {
    #[serde(default)]
    message: String,
}

/// Production `IssueHost` backed by the GitHub REST API.
pub struct RepoHost {
    client: Arc<GitHubClient>,
}

impl RepoHost {
    pub fn new(client: Arc<GitHubClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl super::IssueHost for RepoHost {
    async fn issue(&self, number: u64) -> Result<IssueDetail> {
        let issue: RestIssue = self
            .client
            .get_json(&format!("/issues/{}", number))
            .await
            .with_context(|| format!("Failed to fetch issue #{}", number))?;
        Ok(IssueDetail {
            number: issue.number,
            title: issue.title,
            body: issue.body.unwrap_or_default(),
            labels: issue.labels.into_iter().map(|l| l.name).collect(),
            state: issue.state,
        })
    }

    async fn comment_on_issue(&self, number: u64, body: &str) -> Result<()> {
        let _: serde_json::Value = self
            .client
            .post_json(
                &format!("/issues/{}/comments", number),
                &serde_json::json!({ "body": body }),
            )
            .await
            .with_context(|| format!("Failed to comment on issue #{}", number))?;
        tracing::info!(issue_number = number, "issue.commented");
        Ok(())
    }

    async fn create_pull(
        &self,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
        issue_number: Option<u64>,
    ) -> Result<u64> {
        let mut full_body = body.to_string();
        if let Some(n) = issue_number {
            full_body.push_str(&format!("\n\nCloses #{}", n));
        }

        let pull: RestPull = self
            .client
            .post_json(
                "/pulls",
                &serde_json::json!({
                    "title": title,
                    "body": full_body,
                    "head": head,
                    "base": base,
                }),
            )
            .await
            .with_context(|| format!("Failed to create PR {} -> {}", head, base))?;
        tracing::info!(pr_number = pull.number, head, base, "pr.created");
        Ok(pull.number)
    }

    async fn open_pulls(&self, base: &str) -> Result<Vec<PullRequest>> {
        let pulls: Vec<RestPull> = self
            .client
            .get_json(&format!("/pulls?state=open&base={}&per_page=100", base))
            .await
            .context("Failed to list open pull requests")?;
        Ok(pulls
            .into_iter()
            .map(|p| PullRequest {
                number: p.number,
                head: p.head.branch,
                base: p.base.branch,
            })
            .collect())
    }

    async fn pull(&self, number: u64) -> Result<PullRequest> {
        let pull: RestPull = self
            .client
            .get_json(&format!("/pulls/{}", number))
            .await
            .with_context(|| format!("Failed to fetch PR #{}", number))?;
        Ok(PullRequest {
            number: pull.number,
            head: pull.head.branch,
            base: pull.base.branch,
        })
    }

    async fn is_approved(&self, number: u64) -> Result<bool> {
        let reviews: Vec<RestReview> = self
            .client
            .get_json(&format!("/pulls/{}/reviews?per_page=100", number))
            .await
            .with_context(|| format!("Failed to list reviews for PR #{}", number))?;
        Ok(reviews.iter().any(|r| r.state == "APPROVED"))
    }

    async fn rebase_merge(&self, number: u64) -> Result<NativeMerge> {
        let resp = self
            .client
            .put(
                &format!("/pulls/{}/merge", number),
                &serde_json::json!({ "merge_method": "rebase" }),
            )
            .await?;

        let status = resp.status();
        if status.is_success() {
            tracing::info!(pr_number = number, "pr.rebase_merged");
            return Ok(NativeMerge::Merged);
        }

        // 405 (not mergeable), 409 (head moved), 422: the host said no.
        // Anything else is a transport/auth problem and should propagate.
        if matches!(status.as_u16(), 405 | 409 | 422) {
            let reason = resp
                .json::<RestMergeError>()
                .await
                .map(|e| e.message)
                .unwrap_or_else(|_| format!("merge rejected with status {}", status));
            tracing::warn!(pr_number = number, %reason, "pr.rebase_merge_rejected");
            return Ok(NativeMerge::Rejected { reason });
        }

        anyhow::bail!("merge of PR #{} failed with status {}", number, status)
    }

    async fn comment_on_pull(&self, number: u64, body: &str) -> Result<()> {
        // PRs are issues for the comments endpoint.
        self.comment_on_issue(number, body).await
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let found: Option<serde_json::Value> = self
            .client
            .get_json_opt(&format!("/branches/{}", branch))
            .await
            .with_context(|| format!("Failed to check branch {}", branch))?;
        Ok(found.is_some())
    }
}
