//! Persistent agent memory with LLM-powered compression.
//!
//! The memory file is markdown that travels with the service, not the
//! repository. After every completed story the pipeline merges new facts
//! into it via the completion service, holding the file under a soft token
//! budget so stale detail does not eat the agent's context window.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::llm::{Completions, MEMORY_COMPRESSION_SYSTEM};

/// Approximate chars-per-token for budget estimation (conservative).
const CHARS_PER_TOKEN: usize = 4;

#[derive(Clone)]
pub struct MemoryStore {
    path: PathBuf,
    max_tokens: usize,
}

impl MemoryStore {
    pub fn new(path: impl Into<PathBuf>, max_tokens: usize) -> Self {
        Self {
            path: path.into(),
            max_tokens,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Approximate character limit derived from the token budget.
    pub fn max_chars(&self) -> usize {
        self.max_tokens * CHARS_PER_TOKEN
    }

    /// Load the current memory. A missing file is an empty memory, not an
    /// error.
    pub async fn load(&self) -> String {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "memory.load_error");
                String::new()
            }
        }
    }

    pub async fn save(&self, content: &str) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create memory directory")?;
        }
        tokio::fs::write(&self.path, content)
            .await
            .with_context(|| format!("Failed to write memory file {}", self.path.display()))?;
        tracing::info!(path = %self.path.display(), size = content.len(), "memory.saved");
        Ok(())
    }

    /// Write the default template if no memory file exists yet.
    pub async fn seed_default(&self, repo: &str, base_branch: &str, max_passes: u32) -> Result<()> {
        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(());
        }
        self.save(&default_memory(repo, base_branch, max_passes))
            .await?;
        tracing::info!(path = %self.path.display(), "memory.seeded");
        Ok(())
    }

    pub async fn is_over_budget(&self) -> bool {
        self.load().await.len() > self.max_chars()
    }

    /// Context string handed to the coding agent: memory followed by the
    /// story itself.
    pub async fn build_story_context(
        &self,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> String {
        let memory = self.load().await;
        let mut sections = Vec::new();

        if !memory.is_empty() {
            sections.push("## Project Memory\n".to_string());
            sections.push(memory);
            sections.push(String::new());
        }

        sections.push("## Current Story\n".to_string());
        sections.push(format!("**Title:** {}\n", title));
        sections.push(format!("**Description:**\n{}\n", body));

        if !labels.is_empty() {
            sections.push(format!("**Labels:** {}\n", labels.join(", ")));
        }

        sections.join("\n")
    }

    /// Merge new facts into the memory via the completion service and save
    /// the result. Compression failures are logged, never fatal — losing a
    /// memory update must not fail the story.
    pub async fn compress_and_save(&self, llm: &dyn Completions, new_facts: &str) {
        let current = self.load().await;
        let system = format!(
            "{}\n\nStay under roughly {} tokens (~{} characters).",
            MEMORY_COMPRESSION_SYSTEM,
            self.max_tokens,
            self.max_chars()
        );
        let prompt = format!(
            "## Current Memory\n\n{}\n\n## New Facts to Integrate\n\n{}\n\n\
             Return the complete updated memory file content.",
            current, new_facts
        );

        match llm.complete(&prompt, &system).await {
            Ok(updated) => {
                tracing::info!(
                    old_size = current.len(),
                    new_size = updated.len(),
                    budget_chars = self.max_chars(),
                    "memory.compressed"
                );
                if let Err(e) = self.save(&updated).await {
                    tracing::error!(error = %format!("{:#}", e), "memory.save_error");
                }
            }
            Err(e) => {
                tracing::error!(error = %format!("{:#}", e), "memory.compress_error");
            }
        }
    }
}

/// Default memory content for a fresh deployment.
fn default_memory(repo: &str, base_branch: &str, max_passes: u32) -> String {
    format!(
        "# Coding Agent Memory\n\n\
         > Persistent context for the AI coding agent.\n\
         > Updated automatically as stories are completed.\n\n\
         ---\n\n\
         ## Project Info\n\n\
         **Repository:** {}\n\
         **Base Branch:** {}\n\
         **Max Agent Passes:** {}\n\n\
         ---\n\n\
         ## Architecture\n\n\
         _No facts recorded yet. This file will be updated as stories are completed._\n\n\
         ## Conventions\n\n\
         _Will be populated after the first coding run._\n",
        repo, base_branch, max_passes
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> MemoryStore {
        MemoryStore::new(dir.path().join("MEMORY.md"), 2000)
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(store(&dir).load().await, "");
    }

    #[tokio::test]
    async fn test_save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mem = store(&dir);
        mem.save("# Memory\n\nfact one\n").await.unwrap();
        assert_eq!(mem.load().await, "# Memory\n\nfact one\n");
    }

    #[tokio::test]
    async fn test_seed_default_does_not_clobber_existing() {
        let dir = tempfile::tempdir().unwrap();
        let mem = store(&dir);
        mem.save("existing facts").await.unwrap();
        mem.seed_default("acme/widgets", "develop", 5).await.unwrap();
        assert_eq!(mem.load().await, "existing facts");
    }

    #[tokio::test]
    async fn test_seed_default_writes_template() {
        let dir = tempfile::tempdir().unwrap();
        let mem = store(&dir);
        mem.seed_default("acme/widgets", "develop", 5).await.unwrap();
        let content = mem.load().await;
        assert!(content.contains("acme/widgets"));
        assert!(content.contains("develop"));
    }

    #[tokio::test]
    async fn test_story_context_includes_memory_and_labels() {
        let dir = tempfile::tempdir().unwrap();
        let mem = store(&dir);
        mem.save("remember: tests live in tests/").await.unwrap();
        let ctx = mem
            .build_story_context("Add login", "As a user...", &["bug".to_string()])
            .await;
        assert!(ctx.contains("## Project Memory"));
        assert!(ctx.contains("remember: tests live in tests/"));
        assert!(ctx.contains("**Title:** Add login"));
        assert!(ctx.contains("**Labels:** bug"));
    }

    #[tokio::test]
    async fn test_story_context_without_memory_omits_section() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = store(&dir)
            .build_story_context("Add login", "body", &[])
            .await;
        assert!(!ctx.contains("## Project Memory"));
        assert!(ctx.contains("## Current Story"));
    }

    #[tokio::test]
    async fn test_budget_math() {
        let dir = tempfile::tempdir().unwrap();
        let mem = MemoryStore::new(dir.path().join("MEMORY.md"), 10);
        assert_eq!(mem.max_chars(), 40);
        mem.save(&"x".repeat(41)).await.unwrap();
        assert!(mem.is_over_budget().await);
        mem.save(&"x".repeat(40)).await.unwrap();
        assert!(!mem.is_over_budget().await);
    }
}
