// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use conduit_events::{FileStore, Observation};
use conduit_runtime::McpConfig;

/// A named fragment of guidance text, triggered by keyword match against a
/// `RecallAction` query. Loaded from a directory of markdown files with a
/// YAML frontmatter block:
///
/// ```markdown
/// ---
/// name: git-commit-style
/// triggers: [commit, git]
/// mcp_servers: [github]
/// ---
/// Commit messages in this repo use the imperative mood...
/// ```
#[derive(Debug, Clone, serde::Deserialize)]
pub struct MicroagentFrontmatter {
    pub name: String,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub mcp_servers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Microagent {
    pub name: String,
    pub triggers: Vec<String>,
    pub mcp_servers: Vec<String>,
    pub content: String,
}

#[derive(thiserror::Error, Debug)]
pub enum MicroagentError {
    #[error("microagent file {path:?} has no frontmatter block")]
    MissingFrontmatter { path: String },
    #[error("microagent file {path:?} has invalid frontmatter: {source}")]
    InvalidFrontmatter { path: String, #[source] source: serde_yaml::Error },
    #[error(transparent)]
    FileStore(#[from] conduit_events::FileStoreError),
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
}

const FRONTMATTER_DELIM: &str = "---";

/// Splits a `---\nyaml\n---\nbody` document into its frontmatter and body.
fn split_frontmatter(raw: &str, path: &str) -> Result<(MicroagentFrontmatter, String), MicroagentError> {
    let rest = raw.strip_prefix(FRONTMATTER_DELIM).ok_or_else(|| MicroagentError::MissingFrontmatter { path: path.into() })?;
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let end = rest.find("\n---").ok_or_else(|| MicroagentError::MissingFrontmatter { path: path.into() })?;
    let yaml = &rest[..end];
    let body = rest[end + 4..].trim_start_matches('\n').to_string();
    let frontmatter: MicroagentFrontmatter =
        serde_yaml::from_str(yaml).map_err(|source| MicroagentError::InvalidFrontmatter { path: path.into(), source })?;
    Ok((frontmatter, body))
}

/// In-memory collection of loaded microagents, consulted when the agent
/// issues a `RecallAction`.
#[derive(Debug, Default, Clone)]
pub struct MicroagentRepo {
    agents: Vec<Microagent>,
}

impl MicroagentRepo {
    pub fn new(agents: Vec<Microagent>) -> Self {
        Self { agents }
    }

    /// Loads every `*.md` file under `dir` in the given file store.
    pub async fn load_dir(store: &dyn FileStore, dir: &str) -> Result<Self, MicroagentError> {
        let mut agents = Vec::new();
        for path in store.list(dir).await? {
            if !path.ends_with(".md") {
                continue;
            }
            let raw = String::from_utf8(store.read(&path).await?)?;
            let (frontmatter, body) = split_frontmatter(&raw, &path)?;
            agents.push(Microagent {
                name: frontmatter.name,
                triggers: frontmatter.triggers,
                mcp_servers: frontmatter.mcp_servers,
                content: body,
            });
        }
        Ok(Self { agents })
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Microagents whose trigger list contains a word from `query`
    /// (case-insensitive, whole-word match against the lowercased query).
    pub fn matching(&self, query: &str) -> Vec<&Microagent> {
        let query_lower = query.to_lowercase();
        let query_words: std::collections::HashSet<&str> = query_lower.split_whitespace().collect();
        self.agents
            .iter()
            .filter(|a| a.triggers.iter().any(|t| query_words.contains(t.to_lowercase().as_str())))
            .collect()
    }

    /// Synthesizes the `RecallObservation` content and merged MCP config for
    /// a recall query, concatenating every matching microagent's body and
    /// unioning their declared MCP server names onto `extra`.
    pub fn recall(&self, query: &str, extra: &McpConfig) -> (Observation, McpConfig) {
        let matches = self.matching(query);
        let content = if matches.is_empty() {
            format!("no microagent matched query: {query}")
        } else {
            matches.iter().map(|a| format!("# {}\n{}", a.name, a.content)).collect::<Vec<_>>().join("\n\n")
        };

        let mut server_names = extra.server_names.clone();
        for agent in &matches {
            for server in &agent.mcp_servers {
                if !server_names.contains(server) {
                    server_names.push(server.clone());
                }
            }
        }

        (Observation::Recall { content }, McpConfig { server_names })
    }
}
