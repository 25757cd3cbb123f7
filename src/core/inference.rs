//! Implicit dependency inference.
//!
//! Each strategy reads the task list and proposes extra edges. The builder
//! unions them with the explicit ones, so strategies can be swapped or
//! disabled without touching graph construction.

use crate::core::graph::{DependencyEdge, EdgeKind};
use crate::core::task::{Task, TaskId};
use std::collections::BTreeMap;

/// A pluggable source of inferred dependency edges.
pub trait DependencyStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Propose edges over `tasks`. Edges must only reference tasks in the slice.
    fn infer(&self, tasks: &[Task]) -> Vec<DependencyEdge>;
}

/// Consumers of a file depend on the task that creates it.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStrategy;

impl FileStrategy {
    fn creates(description: &str) -> bool {
        let description = description.to_lowercase();
        description.contains("creat") || description.contains("implement")
    }
}

impl DependencyStrategy for FileStrategy {
    fn name(&self) -> &'static str {
        "file"
    }

    fn infer(&self, tasks: &[Task]) -> Vec<DependencyEdge> {
        let mut creators: BTreeMap<&str, &TaskId> = BTreeMap::new();
        let mut consumers: BTreeMap<&str, Vec<&TaskId>> = BTreeMap::new();

        for task in tasks {
            for (path, description) in &task.context.file_locations {
                if Self::creates(description) {
                    // Last creator wins; overlapping writers show up in conflict detection.
                    creators.insert(path.as_str(), &task.id);
                } else {
                    consumers.entry(path.as_str()).or_default().push(&task.id);
                }
            }
        }

        let mut edges = Vec::new();
        for (path, creator) in creators {
            for consumer in consumers.get(path).into_iter().flatten() {
                if *consumer == creator {
                    continue;
                }
                edges.push(DependencyEdge::new(
                    (*consumer).clone(),
                    creator.clone(),
                    EdgeKind::File,
                    true,
                    format!("{} needs {} created by {}", consumer, path, creator),
                ));
            }
        }
        edges
    }
}

/// Category precedence inferred from title and background keywords.
///
/// Edges are advisory: they never block layering.
#[derive(Debug, Clone)]
pub struct KeywordStrategy {
    precedence: Vec<(&'static str, Vec<&'static str>)>,
}

impl Default for KeywordStrategy {
    fn default() -> Self {
        Self {
            precedence: vec![
                ("model", vec!["api", "service", "test"]),
                ("database", vec!["model", "api"]),
                ("test", vec![]),
                ("config", vec!["model", "api", "service"]),
            ],
        }
    }
}

impl KeywordStrategy {
    /// Categories a task matches, in table order.
    fn categories_of(&self, task: &Task) -> Vec<&'static str> {
        let (title, background) = task.search_text();
        self.precedence
            .iter()
            .map(|(keyword, _)| *keyword)
            .filter(|keyword| title.contains(keyword) || background.contains(keyword))
            .collect()
    }
}

impl DependencyStrategy for KeywordStrategy {
    fn name(&self) -> &'static str {
        "keyword"
    }

    fn infer(&self, tasks: &[Task]) -> Vec<DependencyEdge> {
        let mut by_category: BTreeMap<&str, Vec<&TaskId>> = BTreeMap::new();
        for task in tasks {
            for category in self.categories_of(task) {
                by_category.entry(category).or_default().push(&task.id);
            }
        }

        let mut edges = Vec::new();
        for (dependent_kind, prereq_kinds) in &self.precedence {
            let dependents = by_category.get(dependent_kind).cloned().unwrap_or_default();
            for prereq_kind in prereq_kinds {
                let Some(prereqs) = by_category.get(prereq_kind) else {
                    continue;
                };
                for dependent in &dependents {
                    for prereq in prereqs {
                        if dependent == prereq {
                            continue;
                        }
                        edges.push(DependencyEdge::new(
                            (*dependent).clone(),
                            (*prereq).clone(),
                            EdgeKind::Logical,
                            false,
                            format!("{} tasks depend on {}", dependent_kind, prereq_kind),
                        ));
                    }
                }
            }
        }
        edges
    }
}

/// Architectural phase of a task, classified from its title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Foundation,
    Implementation,
    Integration,
}

impl Phase {
    /// First matching phase wins.
    pub fn classify(task: &Task) -> Option<Phase> {
        let title = task.title.to_lowercase();
        let any = |words: &[&str]| words.iter().any(|w| title.contains(w));

        if any(&["setup", "config", "foundation", "basic"]) {
            Some(Phase::Foundation)
        } else if any(&["implement", "create", "build"]) {
            Some(Phase::Implementation)
        } else if any(&["integrat", "connect", "coordin"]) {
            Some(Phase::Integration)
        } else {
            None
        }
    }
}

/// Implementation follows foundation, integration follows implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseStrategy;

impl DependencyStrategy for PhaseStrategy {
    fn name(&self) -> &'static str {
        "phase"
    }

    fn infer(&self, tasks: &[Task]) -> Vec<DependencyEdge> {
        let of_phase = |phase: Phase| -> Vec<&TaskId> {
            tasks
                .iter()
                .filter(|t| Phase::classify(t) == Some(phase))
                .map(|t| &t.id)
                .collect()
        };
        let foundation = of_phase(Phase::Foundation);
        let implementation = of_phase(Phase::Implementation);
        let integration = of_phase(Phase::Integration);

        let mut edges = Vec::new();
        let mut link = |dependents: &[&TaskId], prereqs: &[&TaskId], what: &str| {
            for dependent in dependents {
                for prereq in prereqs {
                    edges.push(DependencyEdge::new(
                        (*dependent).clone(),
                        (*prereq).clone(),
                        EdgeKind::Architectural,
                        true,
                        what.to_string(),
                    ));
                }
            }
        };
        link(&implementation, &foundation, "implementation depends on foundation");
        link(&integration, &implementation, "integration depends on implementation");
        edges
    }
}
