use super::{Args, Tool, ToolResult, arg_str, arg_str_vec};
use crate::util::write_json_atomic;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Task {
    id: String,
    title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    description: String,
    status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    priority: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    due_date: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    notes: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    goal_id: String,
    created_at: String,
    updated_at: String,
}

impl Task {
    fn is_active(&self) -> bool {
        self.status != "done" && self.status != "cancelled"
    }

    fn is_overdue(&self, today: &str) -> bool {
        !self.due_date.is_empty() && self.due_date.as_str() < today && self.is_active()
    }
}

/// Task and goal tracking over `tasks/tasks.json`. A corrupt file is an
/// error, never a reason to truncate user data.
pub struct TasksTool {
    path: PathBuf,
    lock: Mutex<()>,
}

fn generate_task_id() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

impl TasksTool {
    pub fn new(workspace: &Path) -> Self {
        Self {
            path: workspace.join("tasks").join("tasks.json"),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<Vec<Task>> {
        match std::fs::read(&self.path) {
            Ok(data) => serde_json::from_slice(&data).context("corrupted tasks file"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(error) => Err(error).context("read tasks file"),
        }
    }

    fn store(&self, tasks: &[Task]) -> Result<()> {
        write_json_atomic(&self.path, &tasks)
    }

    fn add(&self, args: &Args) -> Result<ToolResult> {
        let Some(title) = arg_str(args, "title") else {
            return Ok(ToolResult::error("title is required for add"));
        };

        let priority = arg_str(args, "priority").unwrap_or("medium");
        let due_date = arg_str(args, "due_date").unwrap_or_default();

        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut tasks = self.load()?;

        let now = Local::now().to_rfc3339();
        let task = Task {
            id: generate_task_id(),
            title: title.to_string(),
            description: arg_str(args, "description").unwrap_or_default().to_string(),
            status: "pending".to_string(),
            priority: priority.to_string(),
            due_date: due_date.to_string(),
            tags: arg_str_vec(args, "tags"),
            notes: arg_str(args, "notes").unwrap_or_default().to_string(),
            goal_id: arg_str(args, "goal_id").unwrap_or_default().to_string(),
            created_at: now.clone(),
            updated_at: now,
        };

        let mut result = format!(
            "Task created: {} (ID: {}, priority: {}",
            task.title, task.id, task.priority
        );
        if !due_date.is_empty() {
            result.push_str(&format!(", due: {due_date}"));
        }
        result.push(')');

        tasks.push(task);
        self.store(&tasks)?;
        Ok(ToolResult::silent(result))
    }

    fn list(&self) -> Result<ToolResult> {
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let tasks = self.load()?;
        if tasks.is_empty() {
            return Ok(ToolResult::silent("No tasks found"));
        }

        let today = today();
        let mut lines = Vec::new();
        let mut overdue_count = 0;

        for task in tasks.iter().filter(|t| t.is_active()) {
            let overdue = if task.is_overdue(&today) {
                overdue_count += 1;
                " [OVERDUE]"
            } else {
                ""
            };

            let mut line = format!(
                "- [{}] {} (ID: {}, status: {}, priority: {}",
                task.status.to_uppercase(),
                task.title,
                task.id,
                task.status,
                task.priority
            );
            if !task.due_date.is_empty() {
                line.push_str(&format!(", due: {}", task.due_date));
            }
            if !task.goal_id.is_empty() {
                line.push_str(&format!(", goal: {}", task.goal_id));
            }
            line.push(')');
            line.push_str(overdue);
            lines.push(line);
        }

        if lines.is_empty() {
            return Ok(ToolResult::silent("No active tasks"));
        }

        let mut header = format!("{} active task(s)", lines.len());
        if overdue_count > 0 {
            header.push_str(&format!(" ({overdue_count} overdue)"));
        }
        Ok(ToolResult::silent(format!(
            "{header}:\n{}",
            lines.join("\n")
        )))
    }

    fn get(&self, args: &Args) -> Result<ToolResult> {
        let Some(id) = arg_str(args, "id") else {
            return Ok(ToolResult::error("id is required for get"));
        };

        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let tasks = self.load()?;
        match tasks.iter().find(|t| t.id == id) {
            Some(task) => Ok(ToolResult::silent(format_task(task))),
            None => Ok(ToolResult::silent(format!("No task found with ID '{id}'"))),
        }
    }

    fn update(&self, args: &Args) -> Result<ToolResult> {
        let Some(id) = arg_str(args, "id") else {
            return Ok(ToolResult::error("id is required for update"));
        };

        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut tasks = self.load()?;
        let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
            return Ok(ToolResult::silent(format!("No task found with ID '{id}'")));
        };

        if let Some(title) = arg_str(args, "title") {
            task.title = title.to_string();
        }
        if let Some(description) = args.get("description").and_then(Value::as_str) {
            task.description = description.to_string();
        }
        if let Some(status) = arg_str(args, "status") {
            task.status = status.to_string();
        }
        if let Some(priority) = arg_str(args, "priority") {
            task.priority = priority.to_string();
        }
        if let Some(due_date) = args.get("due_date").and_then(Value::as_str) {
            task.due_date = due_date.to_string();
        }
        if let Some(notes) = args.get("notes").and_then(Value::as_str) {
            task.notes = notes.to_string();
        }
        if let Some(goal_id) = args.get("goal_id").and_then(Value::as_str) {
            task.goal_id = goal_id.to_string();
        }
        if args.get("tags").is_some_and(Value::is_array) {
            task.tags = arg_str_vec(args, "tags");
        }
        task.updated_at = Local::now().to_rfc3339();

        self.store(&tasks)?;
        Ok(ToolResult::silent(format!("Task '{id}' updated")))
    }

    fn set_status(&self, args: &Args, status: &str, action: &str) -> Result<ToolResult> {
        if arg_str(args, "id").is_none() {
            return Ok(ToolResult::error(format!("id is required for {action}")));
        }
        let mut args = args.clone();
        args.insert("status".to_string(), Value::String(status.to_string()));
        self.update(&args)
    }

    fn delete(&self, args: &Args) -> Result<ToolResult> {
        let Some(id) = arg_str(args, "id") else {
            return Ok(ToolResult::error("id is required for delete"));
        };

        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut tasks = self.load()?;
        let before = tasks.len();
        tasks.retain(|t| t.id != id);

        if tasks.len() == before {
            return Ok(ToolResult::silent(format!("No task found with ID '{id}'")));
        }
        self.store(&tasks)?;
        Ok(ToolResult::silent(format!("Task '{id}' deleted")))
    }

    fn search(&self, args: &Args) -> Result<ToolResult> {
        let Some(query) = arg_str(args, "query") else {
            return Ok(ToolResult::error("query is required for search"));
        };

        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let tasks = self.load()?;
        let q = query.to_lowercase();

        let matches: Vec<String> = tasks
            .iter()
            .filter(|t| {
                let haystack =
                    format!("{} {} {}", t.title, t.description, t.tags.join(" ")).to_lowercase();
                haystack.contains(&q)
            })
            .map(|t| {
                format!(
                    "- [{}] {} (ID: {}, status: {})",
                    t.priority.to_uppercase(),
                    t.title,
                    t.id,
                    t.status
                )
            })
            .collect();

        if matches.is_empty() {
            return Ok(ToolResult::silent(format!("No tasks matching '{query}'")));
        }
        Ok(ToolResult::silent(format!(
            "Found {} task(s):\n{}",
            matches.len(),
            matches.join("\n")
        )))
    }
}

fn format_task(task: &Task) -> String {
    let mut lines = vec![
        format!("ID: {}", task.id),
        format!("Title: {}", task.title),
        format!("Status: {}", task.status),
        format!("Priority: {}", task.priority),
    ];
    if !task.description.is_empty() {
        lines.push(format!("Description: {}", task.description));
    }
    if !task.due_date.is_empty() {
        lines.push(format!("Due Date: {}", task.due_date));
        if task.is_overdue(&today()) {
            lines.push("** OVERDUE **".to_string());
        }
    }
    if !task.tags.is_empty() {
        lines.push(format!("Tags: {}", task.tags.join(", ")));
    }
    if !task.notes.is_empty() {
        lines.push(format!("Notes: {}", task.notes));
    }
    if !task.goal_id.is_empty() {
        lines.push(format!("Goal ID: {}", task.goal_id));
    }
    lines.push(format!("Created: {}", task.created_at));
    lines.push(format!("Updated: {}", task.updated_at));
    lines.join("\n")
}

#[async_trait]
impl Tool for TasksTool {
    fn name(&self) -> &str {
        "tasks"
    }

    fn description(&self) -> &str {
        "Task and goal tracking. Add, list, update, complete, cancel, delete, or search tasks. \
         Use this to track goals, projects, and to-dos across sessions."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["add", "list", "get", "update", "complete", "cancel", "delete", "search"],
                    "description": "Action to perform"
                },
                "id": {
                    "type": "string",
                    "description": "Task ID (required for get, update, complete, cancel, delete)"
                },
                "title": {
                    "type": "string",
                    "description": "Task title (required for add)"
                },
                "description": {
                    "type": "string",
                    "description": "Task description"
                },
                "status": {
                    "type": "string",
                    "enum": ["pending", "in_progress", "done", "cancelled"],
                    "description": "Task status (for update)"
                },
                "priority": {
                    "type": "string",
                    "enum": ["high", "medium", "low"],
                    "description": "Task priority"
                },
                "due_date": {
                    "type": "string",
                    "description": "Due date in YYYY-MM-DD format"
                },
                "tags": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Tags for the task"
                },
                "notes": {
                    "type": "string",
                    "description": "Additional notes"
                },
                "goal_id": {
                    "type": "string",
                    "description": "Parent task/goal ID to link this task to"
                },
                "query": {
                    "type": "string",
                    "description": "Search query (for search action)"
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: Args) -> Result<ToolResult> {
        match arg_str(&args, "action") {
            Some("add") => self.add(&args),
            Some("list") => self.list(),
            Some("get") => self.get(&args),
            Some("update") => self.update(&args),
            Some("complete") => self.set_status(&args, "done", "complete"),
            Some("cancel") => self.set_status(&args, "cancelled", "cancel"),
            Some("delete") => self.delete(&args),
            Some("search") => self.search(&args),
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

    fn task_id_from(result: &ToolResult) -> String {
        let text = result.text();
        let start = text.find("ID: ").unwrap() + 4;
        text[start..start + 12].to_string()
    }

    #[test]
    fn generated_ids_are_twelve_hex_chars() {
        let id = generate_task_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_task_id());
    }

    #[tokio::test]
    async fn add_then_list_shows_the_task() {
        let tmp = TempDir::new().unwrap();
        let tool = TasksTool::new(tmp.path());

        tool.execute(args(json!({"action": "add", "title": "pay bill"})))
            .await
            .unwrap();
        let listed = tool.execute(args(json!({"action": "list"}))).await.unwrap();
        assert!(listed.text().starts_with("1 active task(s)"));
        assert!(listed.text().contains("[PENDING] pay bill"));
        assert!(listed.text().contains("priority: medium"));
    }

    #[tokio::test]
    async fn overdue_tasks_are_tagged_and_counted() {
        let tmp = TempDir::new().unwrap();
        let tool = TasksTool::new(tmp.path());

        tool.execute(args(json!({
            "action": "add", "title": "pay bill", "due_date": "2001-06-09"
        })))
        .await
        .unwrap();

        let listed = tool.execute(args(json!({"action": "list"}))).await.unwrap();
        assert!(listed.text().contains("(1 overdue)"));
        let line = listed.text().lines().nth(1).unwrap();
        assert!(line.ends_with("[OVERDUE]"));
    }

    #[tokio::test]
    async fn done_tasks_are_never_overdue_or_listed() {
        let tmp = TempDir::new().unwrap();
        let tool = TasksTool::new(tmp.path());

        let added = tool
            .execute(args(json!({
                "action": "add", "title": "old chore", "due_date": "2001-01-01"
            })))
            .await
            .unwrap();
        let id = task_id_from(&added);

        tool.execute(args(json!({"action": "complete", "id": id})))
            .await
            .unwrap();

        let listed = tool.execute(args(json!({"action": "list"}))).await.unwrap();
        assert_eq!(listed, ToolResult::silent("No active tasks"));
    }

    #[tokio::test]
    async fn complete_and_cancel_defer_to_update() {
        let tmp = TempDir::new().unwrap();
        let tool = TasksTool::new(tmp.path());

        let a = task_id_from(
            &tool
                .execute(args(json!({"action": "add", "title": "a"})))
                .await
                .unwrap(),
        );
        let b = task_id_from(
            &tool
                .execute(args(json!({"action": "add", "title": "b"})))
                .await
                .unwrap(),
        );

        tool.execute(args(json!({"action": "complete", "id": a})))
            .await
            .unwrap();
        tool.execute(args(json!({"action": "cancel", "id": b})))
            .await
            .unwrap();

        let got_a = tool
            .execute(args(json!({"action": "get", "id": a})))
            .await
            .unwrap();
        let got_b = tool
            .execute(args(json!({"action": "get", "id": b})))
            .await
            .unwrap();
        assert!(got_a.text().contains("Status: done"));
        assert!(got_b.text().contains("Status: cancelled"));
    }

    #[tokio::test]
    async fn update_changes_only_supplied_fields() {
        let tmp = TempDir::new().unwrap();
        let tool = TasksTool::new(tmp.path());

        let id = task_id_from(
            &tool
                .execute(args(json!({
                    "action": "add", "title": "draft", "priority": "low", "notes": "keep me"
                })))
                .await
                .unwrap(),
        );

        tool.execute(args(json!({"action": "update", "id": id, "priority": "high"})))
            .await
            .unwrap();

        let got = tool
            .execute(args(json!({"action": "get", "id": id})))
            .await
            .unwrap();
        assert!(got.text().contains("Priority: high"));
        assert!(got.text().contains("Title: draft"));
        assert!(got.text().contains("Notes: keep me"));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let tool = TasksTool::new(tmp.path());

        let id = task_id_from(
            &tool
                .execute(args(json!({"action": "add", "title": "x"})))
                .await
                .unwrap(),
        );
        tool.execute(args(json!({"action": "delete", "id": id})))
            .await
            .unwrap();

        let second = tool
            .execute(args(json!({"action": "delete", "id": id})))
            .await
            .unwrap();
        assert!(!second.is_error());
        assert!(second.text().contains("No task found"));
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error_not_a_truncation() {
        let tmp = TempDir::new().unwrap();
        let tool = TasksTool::new(tmp.path());
        std::fs::create_dir_all(tool.path.parent().unwrap()).unwrap();
        std::fs::write(&tool.path, b"[{broken").unwrap();

        let error = tool
            .execute(args(json!({"action": "add", "title": "x"})))
            .await
            .unwrap_err();
        assert!(error.to_string().contains("corrupted tasks file"));

        // The broken payload is still on disk, untouched.
        assert_eq!(std::fs::read(&tool.path).unwrap(), b"[{broken");
    }

    #[tokio::test]
    async fn search_matches_title_description_and_tags() {
        let tmp = TempDir::new().unwrap();
        let tool = TasksTool::new(tmp.path());

        tool.execute(args(json!({
            "action": "add", "title": "Renew passport", "tags": ["tramites"]
        })))
        .await
        .unwrap();

        let by_tag = tool
            .execute(args(json!({"action": "search", "query": "TRAMITES"})))
            .await
            .unwrap();
        assert!(by_tag.text().contains("Found 1 task(s)"));

        let none = tool
            .execute(args(json!({"action": "search", "query": "zzz"})))
            .await
            .unwrap();
        assert!(none.text().contains("No tasks matching"));
    }
}
