/// Activity Tracker - append-only log of grading statements
///
/// **Core Responsibility:**
/// Record one immutable statement per grading event, with collision-free ids
/// and parent linkage by id.
///
/// **Shape of the log:**
/// - one root statement per job
/// - one child per dispatched test case (parent = the job's root)
/// - any number of grandchildren created inside a run callback
///   (parent = that case's statement)
///
/// The store is constructed explicitly and shared through an `Arc`; `clear`
/// isolates successive jobs without touching snapshots already handed out.

use chrono::{DateTime, Utc};
use grader_common::types::Extensions;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Prefix for verb and activity URIs
pub const CONCEPT_DOMAIN: &str = "http://grader.local";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verb {
    pub id: String,
}

impl Verb {
    /// Build a verb URI under the concept domain
    pub fn named(name: &str) -> Self {
        Self {
            id: format!("{}/verb#{}", CONCEPT_DOMAIN, name),
        }
    }

    /// Verb of a job's root statement
    pub fn graded() -> Self {
        Self::named("graded")
    }

    /// Verb of a per-case statement
    pub fn tested() -> Self {
        Self::named("tested")
    }

    pub fn executed() -> Self {
        Self::named("executed")
    }
}

/// Activity id for a whole job
pub fn job_activity(job_id: &Uuid) -> String {
    format!("{}/job/{}", CONCEPT_DOMAIN, job_id)
}

/// Activity id for one test case
pub fn case_activity(name: &str) -> String {
    format!("{}/testcase/{}", CONCEPT_DOMAIN, name)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementContext {
    /// Back-reference to the parent statement; never an owning pointer
    pub parent: Option<Uuid>,
    #[serde(default)]
    pub extensions: Extensions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementResult {
    pub score: Option<f64>,
    #[serde(default)]
    pub extensions: Extensions,
}

/// An immutable analytics record of one grading event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub id: Uuid,
    pub verb: Verb,
    pub actor: String,
    pub object_activity: String,
    pub context: StatementContext,
    pub result: StatementResult,
    pub timestamp: DateTime<Utc>,
}

/// Everything about a statement except its id and timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct StatementDraft {
    pub verb: Verb,
    pub actor: String,
    pub object_activity: String,
    pub context: StatementContext,
    pub result: StatementResult,
}

impl StatementDraft {
    pub fn new(verb: Verb, actor: impl Into<String>, object_activity: impl Into<String>) -> Self {
        Self {
            verb,
            actor: actor.into(),
            object_activity: object_activity.into(),
            context: StatementContext::default(),
            result: StatementResult::default(),
        }
    }

    pub fn parent(mut self, parent: Uuid) -> Self {
        self.context.parent = Some(parent);
        self
    }

    pub fn score(mut self, score: f64) -> Self {
        self.result.score = Some(score);
        self
    }

    pub fn context_extension(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.extensions.insert(key.into(), value.into());
        self
    }

    pub fn context_extensions(mut self, extensions: Extensions) -> Self {
        self.context.extensions.extend(extensions);
        self
    }

    pub fn result_extension(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.result.extensions.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Default)]
pub struct ActivityTracker {
    statements: Mutex<Vec<Arc<Statement>>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience for the common `Arc<ActivityTracker>` sharing pattern
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Statement>>> {
        // A panicked writer can only have pushed a complete statement
        self.statements
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve a fresh statement id ahead of recording it
    pub fn allocate_id(&self) -> Uuid {
        Uuid::new_v4()
    }

    /// Allocate a fresh id, stamp the draft and append it
    pub fn new_statement(&self, draft: StatementDraft) -> Arc<Statement> {
        self.record(self.allocate_id(), draft)
    }

    /// Append a statement under an id obtained from `allocate_id`
    pub fn record(&self, id: Uuid, draft: StatementDraft) -> Arc<Statement> {
        let statement = Arc::new(Statement {
            id,
            verb: draft.verb,
            actor: draft.actor,
            object_activity: draft.object_activity,
            context: draft.context,
            result: draft.result,
            timestamp: Utc::now(),
        });
        self.lock().push(Arc::clone(&statement));
        statement
    }

    /// Point-in-time snapshot of everything recorded since the last clear
    pub fn get_statements_queue(&self) -> Vec<Arc<Statement>> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Reset the store; snapshots already returned are unaffected
    pub fn clear_statements_queue(&self) {
        self.lock().clear();
    }
}

/// Build an id → statement index, the starting point for walking the tree
pub fn index_by_id(statements: &[Arc<Statement>]) -> HashMap<Uuid, Arc<Statement>> {
    statements
        .iter()
        .map(|statement| (statement.id, Arc::clone(statement)))
        .collect()
}

/// Statements whose parent is `parent`
pub fn children_of(statements: &[Arc<Statement>], parent: Uuid) -> Vec<Arc<Statement>> {
    statements
        .iter()
        .filter(|statement| statement.context.parent == Some(parent))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn draft(name: &str) -> StatementDraft {
        StatementDraft::new(Verb::tested(), "tester", case_activity(name))
    }

    #[test]
    fn test_new_statement_appends() {
        let tracker = ActivityTracker::new();
        let statement = tracker.new_statement(draft("a").score(3.0).result_extension("k", "v"));

        let queue = tracker.get_statements_queue();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, statement.id);
        assert_eq!(queue[0].result.score, Some(3.0));
        assert_eq!(queue[0].result.extensions["k"], "v");
        assert_eq!(queue[0].object_activity, "http://grader.local/testcase/a");
    }

    #[test]
    fn test_sequential_ids_unique() {
        let tracker = ActivityTracker::new();
        for i in 0..10_000 {
            tracker.new_statement(draft(&i.to_string()));
        }
        let ids: HashSet<Uuid> = tracker.get_statements_queue().iter().map(|s| s.id).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_concurrent_ids_unique() {
        let tracker = ActivityTracker::shared();
        let handles: Vec<_> = (0..10)
            .map(|worker| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for i in 0..1_000 {
                        tracker.new_statement(draft(&format!("{worker}-{i}")));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let queue = tracker.get_statements_queue();
        assert_eq!(queue.len(), 10_000);
        let ids: HashSet<Uuid> = queue.iter().map(|s| s.id).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_clear_leaves_snapshots_intact() {
        let tracker = ActivityTracker::new();
        tracker.new_statement(draft("a"));
        tracker.new_statement(draft("b"));

        let snapshot = tracker.get_statements_queue();
        tracker.clear_statements_queue();

        assert!(tracker.is_empty());
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn test_parent_linkage_by_id() {
        let tracker = ActivityTracker::new();
        let root_id = tracker.allocate_id();
        let child = tracker.new_statement(draft("a").parent(root_id));
        let grandchild = tracker.new_statement(
            StatementDraft::new(Verb::executed(), "tester", "cmd").parent(child.id),
        );
        tracker.record(
            root_id,
            StatementDraft::new(Verb::graded(), "tester", "job"),
        );

        let queue = tracker.get_statements_queue();
        let index = index_by_id(&queue);
        assert_eq!(index.len(), 3);

        let parent_of_grandchild = grandchild.context.parent.unwrap();
        let parent_of_child = index[&parent_of_grandchild].context.parent.unwrap();
        assert_eq!(parent_of_child, root_id);
        assert!(index[&root_id].context.parent.is_none());

        assert_eq!(children_of(&queue, root_id).len(), 1);
        assert_eq!(children_of(&queue, child.id)[0].id, grandchild.id);
    }

    #[test]
    fn test_verb_uri() {
        assert_eq!(Verb::graded().id, "http://grader.local/verb#graded");
        let encoded = serde_json::to_string(&Verb::named("x")).unwrap();
        assert_eq!(encoded, r#"{"id":"http://grader.local/verb#x"}"#);
    }
}
