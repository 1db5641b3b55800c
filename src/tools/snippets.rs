use super::{Args, Tool, ToolResult, arg_str, arg_str_vec};
use crate::util::{truncate_with_ellipsis, write_json_atomic};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snippet {
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
    created_at: String,
    updated_at: String,
}

/// Reusable code snippets and text fragments, a name → snippet map in
/// `snippets.json`. Same update semantics as notes: saving an existing
/// name keeps its `created_at`.
pub struct SnippetTool {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SnippetTool {
    pub fn new(workspace: &Path) -> Self {
        Self {
            path: workspace.join("snippets.json"),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<BTreeMap<String, Snippet>> {
        match std::fs::read(&self.path) {
            Ok(data) => serde_json::from_slice(&data).context("parse snippets file"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(error) => Err(error).context("read snippets file"),
        }
    }

    fn store(&self, snippets: &BTreeMap<String, Snippet>) -> Result<()> {
        write_json_atomic(&self.path, snippets)
    }

    fn save(&self, args: &Args) -> Result<ToolResult> {
        let (Some(name), Some(content)) = (arg_str(args, "name"), arg_str(args, "content")) else {
            return Ok(ToolResult::error("name and content are required for save"));
        };
        let tags = arg_str_vec(args, "tags");

        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut snippets = self.load()?;
        let now = Local::now().to_rfc3339();

        let existing = snippets.get(name).map(|s| s.created_at.clone());
        let updated = existing.is_some();
        snippets.insert(
            name.to_string(),
            Snippet {
                content: content.to_string(),
                tags,
                created_at: existing.unwrap_or_else(|| now.clone()),
                updated_at: now,
            },
        );

        self.store(&snippets)?;
        if updated {
            Ok(ToolResult::silent(format!("Snippet '{name}' updated")))
        } else {
            Ok(ToolResult::silent(format!("Snippet '{name}' saved")))
        }
    }

    fn get(&self, args: &Args) -> Result<ToolResult> {
        let Some(name) = arg_str(args, "name") else {
            return Ok(ToolResult::error("name is required for get"));
        };

        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let snippets = self.load()?;
        let Some(snippet) = snippets.get(name) else {
            return Ok(ToolResult::silent(format!(
                "No snippet found with name '{name}'"
            )));
        };

        let mut result = format!("Snippet '{name}':\n{}", snippet.content);
        if !snippet.tags.is_empty() {
            result.push_str(&format!("\nTags: {}", snippet.tags.join(", ")));
        }
        Ok(ToolResult::silent(result))
    }

    fn list(&self) -> Result<ToolResult> {
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let snippets = self.load()?;
        if snippets.is_empty() {
            return Ok(ToolResult::silent("No snippets saved"));
        }

        let lines: Vec<String> = snippets
            .iter()
            .map(|(name, s)| {
                let mut line = format!("- {name}");
                if !s.tags.is_empty() {
                    line.push_str(&format!(" [{}]", s.tags.join(", ")));
                }
                line.push_str(&format!(": {}", truncate_with_ellipsis(&s.content, 60)));
                line
            })
            .collect();
        Ok(ToolResult::silent(format!(
            "{} snippet(s):\n{}",
            snippets.len(),
            lines.join("\n")
        )))
    }

    fn delete(&self, args: &Args) -> Result<ToolResult> {
        let Some(name) = arg_str(args, "name") else {
            return Ok(ToolResult::error("name is required for delete"));
        };

        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut snippets = self.load()?;
        if snippets.remove(name).is_none() {
            return Ok(ToolResult::silent(format!(
                "No snippet found with name '{name}'"
            )));
        }
        self.store(&snippets)?;
        Ok(ToolResult::silent(format!("Snippet '{name}' deleted")))
    }

    fn search(&self, args: &Args) -> Result<ToolResult> {
        let Some(query) = arg_str(args, "query") else {
            return Ok(ToolResult::error("query is required for search"));
        };

        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let snippets = self.load()?;
        let q = query.to_lowercase();

        let matches: Vec<String> = snippets
            .iter()
            .filter(|(name, s)| {
                let haystack =
                    format!("{} {} {}", name, s.content, s.tags.join(" ")).to_lowercase();
                haystack.contains(&q)
            })
            .map(|(name, s)| format!("- {name}: {}", truncate_with_ellipsis(&s.content, 80)))
            .collect();

        if matches.is_empty() {
            return Ok(ToolResult::silent(format!(
                "No snippets matching '{query}'"
            )));
        }
        Ok(ToolResult::silent(format!(
            "Found {} snippet(s):\n{}",
            matches.len(),
            matches.join("\n")
        )))
    }
}

#[async_trait]
impl Tool for SnippetTool {
    fn name(&self) -> &str {
        "snippet"
    }

    fn description(&self) -> &str {
        "Save, retrieve, list, delete, or search reusable code snippets and text fragments by name."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["save", "get", "list", "delete", "search"],
                    "description": "Action to perform"
                },
                "name": {
                    "type": "string",
                    "description": "Snippet name (required for save, get, delete)"
                },
                "content": {
                    "type": "string",
                    "description": "Snippet content (required for save)"
                },
                "tags": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Optional tags"
                },
                "query": {
                    "type": "string",
                    "description": "Search query (for search action, searches in name+content+tags)"
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: Args) -> Result<ToolResult> {
        match arg_str(&args, "action") {
            Some("save") => self.save(&args),
            Some("get") => self.get(&args),
            Some("list") => self.list(),
            Some("delete") => self.delete(&args),
            Some("search") => self.search(&args),
            other => Ok(ToolResult::error(format!(
                "unknown action: {}",
                other.unwrap_or_default()
            ))),
        }
    }
}
