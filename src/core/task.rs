//! Task data model.
//!
//! A `Task` is an immutable unit of work carrying everything a worker needs
//! to execute it: its context, declared dependencies, and the quality
//! thresholds its output must meet. The scheduler never looks inside the
//! context payload.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use crate::error::{ConfigError, GraphError};

/// Task identifiers are restricted to ASCII word characters and dashes.
static TASK_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// Default priority for tasks that do not specify one.
pub const DEFAULT_PRIORITY: u8 = 50;

/// Duration assumed for tasks without an estimate, in minutes.
pub const DEFAULT_DURATION_MINUTES: u32 = 60;

/// Unique identifier for a task within a scheduling run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    /// Parse and validate a task identifier.
    pub fn parse(s: &str) -> Result<Self, GraphError> {
        let trimmed = s.trim();
        if !TASK_ID_RE.is_match(trimmed) {
            return Err(GraphError::InvalidTask {
                task_id: s.to_string(),
                reason: "id must match ^[A-Za-z0-9_-]+$".to_string(),
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = GraphError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TaskId {
    type Error = GraphError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

/// Embedded execution context for a task.
///
/// `file_locations` maps a path to a free-text description of what the task
/// does with it ("create the user model", "reads settings"). Dependency
/// inference reads those descriptions; everything else is opaque payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub file_locations: BTreeMap<String, String>,
    #[serde(default)]
    pub architecture: serde_json::Value,
    #[serde(default)]
    pub requirements: serde_json::Value,
    #[serde(default)]
    pub guidance: serde_json::Value,
    /// Arbitrary structured data handed to the worker untouched.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Per-task quality thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityRequirements {
    /// Minimum test coverage percentage. Falls back to the configured default.
    #[serde(default)]
    pub min_coverage: Option<f64>,
    /// Whether red-green-refactor evidence is required.
    #[serde(default = "default_true")]
    pub red_green_refactor: bool,
    /// Whether performance ceilings are enforced for this task.
    #[serde(default)]
    pub benchmark: bool,
}

fn default_true() -> bool {
    true
}

impl Default for QualityRequirements {
    fn default() -> Self {
        Self {
            min_coverage: None,
            red_green_refactor: true,
            benchmark: false,
        }
    }
}

/// A single schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub context: TaskContext,
    /// Identifiers of tasks that must complete before this one starts.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub estimated_duration_minutes: Option<u32>,
    /// Capability tags used to match the task to a worker.
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub quality: QualityRequirements,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub test_cases: Vec<String>,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl Task {
    /// Create a task with default context and requirements.
    pub fn new(id: TaskId, title: &str) -> Self {
        Self {
            id,
            title: title.to_string(),
            description: String::new(),
            context: TaskContext::default(),
            depends_on: Vec::new(),
            priority: DEFAULT_PRIORITY,
            estimated_duration_minutes: None,
            categories: Vec::new(),
            quality: QualityRequirements::default(),
            acceptance_criteria: Vec::new(),
            test_cases: Vec::new(),
        }
    }

    pub fn with_dependency(mut self, dep: TaskId) -> Self {
        self.depends_on.push(dep);
        self
    }

    pub fn with_duration(mut self, minutes: u32) -> Self {
        self.estimated_duration_minutes = Some(minutes);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_background(mut self, background: &str) -> Self {
        self.context.background = background.to_string();
        self
    }

    pub fn with_file(mut self, path: &str, description: &str) -> Self {
        self.context
            .file_locations
            .insert(path.to_string(), description.to_string());
        self
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.categories.push(category.to_string());
        self
    }

    pub fn with_quality(mut self, quality: QualityRequirements) -> Self {
        self.quality = quality;
        self
    }

    /// Estimated duration, falling back to [`DEFAULT_DURATION_MINUTES`].
    pub fn duration_minutes(&self) -> u32 {
        self.estimated_duration_minutes
            .unwrap_or(DEFAULT_DURATION_MINUTES)
    }

    /// Check structural invariants that do not depend on other tasks.
    pub fn validate(&self) -> Result<(), GraphError> {
        let invalid = |reason: &str| GraphError::InvalidTask {
            task_id: self.id.to_string(),
            reason: reason.to_string(),
        };

        if self.title.trim().is_empty() {
            return Err(invalid("title must not be empty"));
        }
        if self.priority > 100 {
            return Err(invalid("priority must be within 0-100"));
        }
        if self.estimated_duration_minutes == Some(0) {
            return Err(invalid("estimated duration must be positive"));
        }
        if let Some(min) = self.quality.min_coverage {
            if !(0.0..=100.0).contains(&min) {
                return Err(invalid("min_coverage must be within 0-100"));
            }
        }
        if self.depends_on.contains(&self.id) {
            return Err(invalid("task cannot depend on itself"));
        }
        Ok(())
    }

    /// Fraction of the eight context components that are present.
    pub fn completeness_score(&self) -> f64 {
        let present = |v: &serde_json::Value| !(v.is_null() || v == &serde_json::json!({}));
        let checks = [
            !self.context.background.trim().is_empty(),
            present(&self.context.architecture),
            present(&self.context.requirements),
            present(&self.context.guidance),
            !self.context.file_locations.is_empty(),
            !self.test_cases.is_empty(),
            !self.acceptance_criteria.is_empty(),
            self.quality.min_coverage.is_some() || self.quality.red_green_refactor,
        ];
        checks.iter().filter(|c| **c).count() as f64 / checks.len() as f64
    }

    /// Lowercased title and background, used by keyword heuristics.
    pub(crate) fn search_text(&self) -> (String, String) {
        (
            self.title.to_lowercase(),
            self.context.background.to_lowercase(),
        )
    }
}

/// TOML task files wrap the list in a `[[tasks]]` table array.
#[derive(Debug, Deserialize)]
struct TaskFile {
    #[serde(default)]
    tasks: Vec<Task>,
}

/// Read tasks from a `.json` array or a `.toml` file with `[[tasks]]`.
pub fn load_tasks(path: &Path) -> crate::Result<Vec<Task>> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(serde_json::from_str(&content)?),
        Some("toml") => Ok(toml::from_str::<TaskFile>(&content)?.tasks),
        other => Err(ConfigError::Invalid(format!(
            "unsupported task file extension {:?} for {}",
            other.unwrap_or(""),
            path.display()
        ))
        .into()),
    }
}
