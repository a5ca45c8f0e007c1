//! GitHub Projects V2 board access via GraphQL.
//!
//! Items come back in board order, which the poller treats as priority
//! order. Status field metadata (field id + option ids) is loaded once and
//! cached for the life of the client.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use super::GitHubClient;
use crate::errors::BoardError;
use crate::models::{BoardStatus, WorkItem};

const QUERY_PROJECT_ITEMS: &str = r#"
query($login: String!, $projectNumber: Int!, $first: Int!) {
  user(login: $login) {
    projectV2(number: $projectNumber) {
      id
      title
      items(first: $first) {
        nodes {
          id
          fieldValues(first: 10) {
            nodes {
              ... on ProjectV2ItemFieldSingleSelectValue {
                name
                field { ... on ProjectV2FieldCommon { name } }
              }
            }
          }
          content {
            ... on Issue {
              number
              title
              body
              state
              labels(first: 10) {
                nodes { name }
              }
            }
          }
        }
      }
    }
  }
}
"#;

const QUERY_PROJECT_FIELDS: &str = r#"
query($login: String!, $projectNumber: Int!) {
  user(login: $login) {
    projectV2(number: $projectNumber) {
      id
      fields(first: 20) {
        nodes {
          ... on ProjectV2SingleSelectField {
            id
            name
            options { id name }
          }
        }
      }
    }
  }
}
"#;

const MUTATION_UPDATE_STATUS: &str = r#"
mutation($projectId: ID!, $itemId: ID!, $fieldId: ID!, $optionId: String!) {
  updateProjectV2ItemFieldValue(
    input: {
      projectId: $projectId
      itemId: $itemId
      fieldId: $fieldId
      value: { singleSelectOptionId: $optionId }
    }
  ) {
    projectV2Item { id }
  }
}
"#;

/// Cached status field metadata for one project.
#[derive(Debug, Clone)]
struct FieldMeta {
    project_id: String,
    status_field_id: String,
    /// (display name, option id) pairs as the board defines them.
    options: Vec<(String, String)>,
}

pub struct ProjectBoard {
    client: Arc<GitHubClient>,
    owner: String,
    project_number: u32,
    meta: OnceCell<FieldMeta>,
}

impl ProjectBoard {
    pub fn new(client: Arc<GitHubClient>, owner: impl Into<String>, project_number: u32) -> Self {
        Self {
            client,
            owner: owner.into(),
            project_number,
            meta: OnceCell::new(),
        }
    }

    async fn field_meta(&self) -> Result<&FieldMeta, BoardError> {
        self.meta
            .get_or_try_init(|| self.load_field_meta())
            .await
    }

    async fn load_field_meta(&self) -> Result<FieldMeta, BoardError> {
        let data = self
            .client
            .graphql(
                QUERY_PROJECT_FIELDS,
                serde_json::json!({
                    "login": self.owner,
                    "projectNumber": self.project_number,
                }),
            )
            .await?;

        let project = &data["user"]["projectV2"];
        let project_id = project["id"]
            .as_str()
            .ok_or_else(|| BoardError::MissingField("projectV2.id".into()))?
            .to_string();

        let fields = project["fields"]["nodes"]
            .as_array()
            .ok_or_else(|| BoardError::MissingField("projectV2.fields".into()))?;

        for field in fields {
            if field["name"].as_str() == Some("Status")
                && let Some(raw_options) = field["options"].as_array()
            {
                let options: Vec<(String, String)> = raw_options
                    .iter()
                    .filter_map(|opt| {
                        Some((
                            opt["name"].as_str()?.to_string(),
                            opt["id"].as_str()?.to_string(),
                        ))
                    })
                    .collect();
                let status_field_id = field["id"]
                    .as_str()
                    .ok_or_else(|| BoardError::MissingField("Status field id".into()))?
                    .to_string();
                tracing::info!(
                    options = ?options.iter().map(|(n, _)| n).collect::<Vec<_>>(),
                    "board.loaded_status_options"
                );
                return Ok(FieldMeta {
                    project_id,
                    status_field_id,
                    options,
                });
            }
        }

        Err(BoardError::MissingField("Status field".into()))
    }
}

#[async_trait]
impl super::Board for ProjectBoard {
    async fn items(&self) -> Result<Vec<WorkItem>, BoardError> {
        let data = self
            .client
            .graphql(
                QUERY_PROJECT_ITEMS,
                serde_json::json!({
                    "login": self.owner,
                    "projectNumber": self.project_number,
                    "first": 50,
                }),
            )
            .await?;

        let nodes = data["user"]["projectV2"]["items"]["nodes"]
            .as_array()
            .ok_or_else(|| BoardError::MissingField("projectV2.items".into()))?;

        let mut items = Vec::new();
        for node in nodes {
            let content = &node["content"];
            // Drafts and non-issue content have no issue number yet; skip them.
            let Some(number) = content["number"].as_u64() else {
                continue;
            };

            let mut status_label = String::new();
            if let Some(field_values) = node["fieldValues"]["nodes"].as_array() {
                for fv in field_values {
                    if fv["field"]["name"].as_str() == Some("Status")
                        && let Some(label) = fv["name"].as_str()
                    {
                        status_label = label.to_string();
                    }
                }
            }
            let status = BoardStatus::parse_label(&status_label);

            let labels = content["labels"]["nodes"]
                .as_array()
                .map(|nodes| {
                    nodes
                        .iter()
                        .filter_map(|l| l["name"].as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();

            items.push(WorkItem {
                item_id: node["id"].as_str().unwrap_or_default().to_string(),
                issue_number: number,
                title: content["title"].as_str().unwrap_or_default().to_string(),
                body: content["body"].as_str().unwrap_or_default().to_string(),
                status,
                status_label,
                labels,
            });
        }

        tracing::debug!(count = items.len(), "board.fetched_items");
        Ok(items)
    }

    async fn set_status(&self, item_id: &str, status: BoardStatus) -> Result<(), BoardError> {
        let meta = self.field_meta().await?;

        // Match the enum's display name against the board's options
        // case-insensitively; an unmatched status is a configuration error
        // and must not be swallowed.
        let option_id = meta
            .options
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(status.display_name()))
            .map(|(_, id)| id.clone())
            .ok_or_else(|| BoardError::UnknownStatus {
                status: status.display_name().to_string(),
                available: meta.options.iter().map(|(n, _)| n.clone()).collect(),
            })?;

        self.client
            .graphql(
                MUTATION_UPDATE_STATUS,
                serde_json::json!({
                    "projectId": meta.project_id,
                    "itemId": item_id,
                    "fieldId": meta.status_field_id,
                    "optionId": option_id,
                }),
            )
            .await?;

        tracing::info!(item_id, status = %status, "board.status_updated");
        Ok(())
    }
}
