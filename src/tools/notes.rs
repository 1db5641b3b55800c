use super::{Args, Tool, ToolResult, arg_str, arg_str_vec};
use crate::util::write_json_atomic;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Note {
    key: String,
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
    created_at: String,
    updated_at: String,
}

/// Persistent notes storage backed by `memory/notes.json`. Keys are
/// unique; saving an existing key updates in place and preserves
/// `created_at`.
pub struct NotesTool {
    path: PathBuf,
    lock: Mutex<()>,
}

impl NotesTool {
    pub fn new(workspace: &Path) -> Self {
        Self {
            path: workspace.join("memory").join("notes.json"),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<Vec<Note>> {
        match std::fs::read(&self.path) {
            Ok(data) => serde_json::from_slice(&data).context("parse notes file"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(error) => Err(error).context("read notes file"),
        }
    }

    fn store(&self, notes: &[Note]) -> Result<()> {
        write_json_atomic(&self.path, &notes)
    }

    fn save(&self, args: &Args) -> Result<ToolResult> {
        let (Some(key), Some(content)) = (arg_str(args, "key"), arg_str(args, "content")) else {
            return Ok(ToolResult::error("key and content are required for save"));
        };
        let tags = arg_str_vec(args, "tags");

        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut notes = self.load()?;
        let now = Local::now().to_rfc3339();

        let updated = if let Some(existing) = notes.iter_mut().find(|n| n.key == key) {
            existing.content = content.to_string();
            existing.tags = tags;
            existing.updated_at = now;
            true
        } else {
            notes.push(Note {
                key: key.to_string(),
                content: content.to_string(),
                tags,
                created_at: now.clone(),
                updated_at: now,
            });
            false
        };

        self.store(&notes)?;
        if updated {
            Ok(ToolResult::silent(format!("Note '{key}' updated")))
        } else {
            Ok(ToolResult::silent(format!("Note '{key}' saved")))
        }
    }

    fn recall(&self, args: &Args) -> Result<ToolResult> {
        let Some(key) = arg_str(args, "key") else {
            return Ok(ToolResult::error("key is required for recall"));
        };

        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let notes = self.load()?;
        let Some(note) = notes.iter().find(|n| n.key == key) else {
            return Ok(ToolResult::silent(format!("No note found with key '{key}'")));
        };

        let mut result = format!("Key: {}\nContent: {}", note.key, note.content);
        if !note.tags.is_empty() {
            result.push_str(&format!("\nTags: {}", note.tags.join(", ")));
        }
        Ok(ToolResult::silent(result))
    }

    fn search(&self, args: &Args) -> Result<ToolResult> {
        let Some(query) = arg_str(args, "query") else {
            return Ok(ToolResult::error("query is required for search"));
        };

        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let notes = self.load()?;
        let q = query.to_lowercase();

        let matches: Vec<String> = notes
            .iter()
            .filter(|n| {
                let haystack =
                    format!("{} {} {}", n.key, n.content, n.tags.join(" ")).to_lowercase();
                haystack.contains(&q)
            })
            .map(|n| format!("- {}: {}", n.key, n.content))
            .collect();

        if matches.is_empty() {
            return Ok(ToolResult::silent(format!("No notes matching '{query}'")));
        }
        Ok(ToolResult::silent(format!(
            "Found {} note(s):\n{}",
            matches.len(),
            matches.join("\n")
        )))
    }

    fn list(&self) -> Result<ToolResult> {
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let notes = self.load()?;
        if notes.is_empty() {
            return Ok(ToolResult::silent("No notes saved"));
        }

        let lines: Vec<String> = notes
            .iter()
            .map(|n| {
                if n.tags.is_empty() {
                    format!("- {}", n.key)
                } else {
                    format!("- {} [{}]", n.key, n.tags.join(", "))
                }
            })
            .collect();
        Ok(ToolResult::silent(format!(
            "{} note(s):\n{}",
            notes.len(),
            lines.join("\n")
        )))
    }

    fn delete(&self, args: &Args) -> Result<ToolResult> {
        let Some(key) = arg_str(args, "key") else {
            return Ok(ToolResult::error("key is required for delete"));
        };

        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut notes = self.load()?;
        let before = notes.len();
        notes.retain(|n| n.key != key);

        if notes.len() == before {
            return Ok(ToolResult::silent(format!("No note found with key '{key}'")));
        }
        self.store(&notes)?;
        Ok(ToolResult::silent(format!("Note '{key}' deleted")))
    }
}

#[async_trait]
impl Tool for NotesTool {
    fn name(&self) -> &str {
        "memory"
    }

    fn description(&self) -> &str {
        "Persistent notes storage. Save, recall, search, list, or delete notes by key. \
         Use this to remember things for the user across conversations."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["save", "recall", "search", "list", "delete"],
                    "description": "Action to perform"
                },
                "key": {
                    "type": "string",
                    "description": "Note key (required for save, recall, delete)"
                },
                "content": {
                    "type": "string",
                    "description": "Note content (required for save)"
                },
                "tags": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Optional tags for the note"
                },
                "query": {
                    "type": "string",
                    "description": "Search query (for search action, searches in key+content+tags)"
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: Args) -> Result<ToolResult> {
        match arg_str(&args, "action") {
            Some("save") => self.save(&args),
            Some("recall") => self.recall(&args),
            Some("search") => self.search(&args),
            Some("list") => self.list(),
            Some("delete") => self.delete(&args),
            other => Ok(ToolResult::error(format!(
                "unknown action: {}",
                other.unwrap_or_default()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(value: Value) -> Args {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn note_round_trip() {
        let tmp = TempDir::new().unwrap();
        let tool = NotesTool::new(tmp.path());

        let saved = tool
            .execute(args(json!({
                "action": "save", "key": "pw", "content": "hunter2", "tags": ["x"]
            })))
            .await
            .unwrap();
        assert_eq!(saved, ToolResult::silent("Note 'pw' saved"));

        let listed = tool.execute(args(json!({"action": "list"}))).await.unwrap();
        assert!(listed.text().contains("- pw [x]"));

        let recalled = tool
            .execute(args(json!({"action": "recall", "key": "pw"})))
            .await
            .unwrap();
        assert!(recalled.text().contains("hunter2"));

        let deleted = tool
            .execute(args(json!({"action": "delete", "key": "pw"})))
            .await
            .unwrap();
        assert_eq!(deleted, ToolResult::silent("Note 'pw' deleted"));

        let empty = tool.execute(args(json!({"action": "list"}))).await.unwrap();
        assert_eq!(empty, ToolResult::silent("No notes saved"));
    }

    #[tokio::test]
    async fn save_on_existing_key_preserves_created_at() {
        let tmp = TempDir::new().unwrap();
        let tool = NotesTool::new(tmp.path());

        tool.execute(args(json!({"action": "save", "key": "k", "content": "v1"})))
            .await
            .unwrap();
        let first: Vec<Note> =
            serde_json::from_slice(&std::fs::read(&tool.path).unwrap()).unwrap();

        let updated = tool
            .execute(args(json!({"action": "save", "key": "k", "content": "v2"})))
            .await
            .unwrap();
        assert_eq!(updated, ToolResult::silent("Note 'k' updated"));

        let second: Vec<Note> =
            serde_json::from_slice(&std::fs::read(&tool.path).unwrap()).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].content, "v2");
        assert_eq!(second[0].created_at, first[0].created_at);
    }

    #[tokio::test]
    async fn second_delete_is_a_noop_success() {
        let tmp = TempDir::new().unwrap();
        let tool = NotesTool::new(tmp.path());

        tool.execute(args(json!({"action": "save", "key": "k", "content": "v"})))
            .await
            .unwrap();
        tool.execute(args(json!({"action": "delete", "key": "k"})))
            .await
            .unwrap();

        let second = tool
            .execute(args(json!({"action": "delete", "key": "k"})))
            .await
            .unwrap();
        assert!(!second.is_error());
        assert!(second.text().contains("No note found"));
    }

    #[tokio::test]
    async fn search_is_case_insensitive_over_all_fields() {
        let tmp = TempDir::new().unwrap();
        let tool = NotesTool::new(tmp.path());

        tool.execute(args(json!({
            "action": "save", "key": "router", "content": "WPA Pass", "tags": ["Casa"]
        })))
        .await
        .unwrap();

        for query in ["wpa", "ROUTER", "casa"] {
            let found = tool
                .execute(args(json!({"action": "search", "query": query})))
                .await
                .unwrap();
            assert!(found.text().contains("Found 1 note(s)"), "query {query}");
        }

        let none = tool
            .execute(args(json!({"action": "search", "query": "missing"})))
            .await
            .unwrap();
        assert!(none.text().contains("No notes matching"));
    }

    #[tokio::test]
    async fn missing_key_for_save_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let tool = NotesTool::new(tmp.path());

        let result = tool
            .execute(args(json!({"action": "save", "content": "v"})))
            .await
            .unwrap();
        assert!(result.is_error());
    }
}
