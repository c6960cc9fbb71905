//! Execution tree
//!
//! A context may ask for child contexts. Each child runs as its own tokio
//! task, bounded per parent by `max_children` concurrent children and
//! globally by `max_depth`, and sends exactly one `ChildReport` back to its
//! direct parent. Requests outside the bounds come back as failed reports.

use super::collaborator::{ExecutionCollaborator, TurnRequest, TurnStatus};
use crate::task::Task;
use futures::future::BoxFuture;
use hive_foundation::{with_retry, InProcessSettings, RetryConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Root context id
pub const ROOT_CONTEXT: &str = "root";

/// Bounds on the tree
#[derive(Debug, Clone)]
pub struct TreeLimits {
    /// Concurrent children per parent
    pub max_children: usize,
    /// Deepest allowed child (root = 0)
    pub max_depth: u32,
    /// Turn budget per context
    pub max_turns: u32,
}

impl From<&InProcessSettings> for TreeLimits {
    fn from(settings: &InProcessSettings) -> Self {
        Self {
            max_children: settings.max_children,
            max_depth: settings.max_depth,
            max_turns: settings.max_turns,
        }
    }
}

/// Request for a child context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSpec {
    pub title: String,
    pub instructions: String,
}

impl ChildSpec {
    pub fn new(title: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            instructions: instructions.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildStatus {
    Completed,
    Failed,
}

/// Final message from a child to its parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildReport {
    pub child_id: String,
    pub title: String,
    pub status: ChildStatus,
    pub summary: String,
}

impl ChildReport {
    fn failed(child_id: impl Into<String>, title: impl Into<String>, why: impl Into<String>) -> Self {
        Self {
            child_id: child_id.into(),
            title: title.into(),
            status: ChildStatus::Failed,
            summary: why.into(),
        }
    }
}

// ============================================================================
// ChildSupervisor
// ============================================================================

/// Spawns and collects the direct children of one context
pub struct ChildSupervisor {
    task: Task,
    parent_id: String,
    depth: u32,
    limits: TreeLimits,
    collaborator: Arc<dyn ExecutionCollaborator>,
    retry: RetryConfig,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<ChildReport>,
    rx: mpsc::UnboundedReceiver<ChildReport>,
    rejected: Vec<ChildReport>,
    outstanding: usize,
    next_index: usize,
}

impl ChildSupervisor {
    /// Supervisor for the context `parent_id` at `depth`; children are
    /// cancelled with `parent_cancel` or when the supervisor is dropped
    pub fn new(
        task: Task,
        parent_id: &str,
        depth: u32,
        limits: TreeLimits,
        collaborator: Arc<dyn ExecutionCollaborator>,
        retry: RetryConfig,
        parent_cancel: &CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            task,
            parent_id: parent_id.to_string(),
            depth,
            limits,
            collaborator,
            retry,
            cancel: parent_cancel.child_token(),
            tx,
            rx,
            rejected: Vec::new(),
            outstanding: 0,
            next_index: 0,
        }
    }

    /// Children started and not yet reported
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Start a child, or queue a failed report if the bounds forbid it
    pub fn spawn(&mut self, spec: ChildSpec) {
        self.next_index += 1;
        let child_id = format!("{}.{}", self.parent_id, self.next_index);

        if self.depth + 1 > self.limits.max_depth {
            self.rejected.push(ChildReport::failed(
                child_id,
                spec.title,
                format!("rejected: depth limit {} reached", self.limits.max_depth),
            ));
            return;
        }
        if self.outstanding >= self.limits.max_children {
            self.rejected.push(ChildReport::failed(
                child_id,
                spec.title,
                format!(
                    "rejected: {} children already running",
                    self.limits.max_children
                ),
            ));
            return;
        }

        debug!(task_id = %self.task.id, child_id = %child_id, "Spawning child context");
        let child = ChildContext {
            task: self.task.clone(),
            child_id,
            spec,
            depth: self.depth + 1,
            limits: self.limits.clone(),
            collaborator: Arc::clone(&self.collaborator),
            retry: self.retry.clone(),
            cancel: self.cancel.child_token(),
        };
        let tx = self.tx.clone();
        self.outstanding += 1;
        tokio::spawn(async move {
            let report = run_child(child).await;
            let _ = tx.send(report);
        });
    }

    /// Reports available right now (never waits)
    pub fn drain(&mut self) -> Vec<ChildReport> {
        let mut reports = std::mem::take(&mut self.rejected);
        while let Ok(report) = self.rx.try_recv() {
            self.outstanding = self.outstanding.saturating_sub(1);
            reports.push(report);
        }
        reports
    }

    /// Wait for the next report from a running child
    pub async fn next(&mut self) -> Option<ChildReport> {
        if self.outstanding == 0 {
            return None;
        }
        let report = self.rx.recv().await?;
        self.outstanding = self.outstanding.saturating_sub(1);
        Some(report)
    }
}

impl Drop for ChildSupervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Child context
// ============================================================================

struct ChildContext {
    task: Task,
    child_id: String,
    spec: ChildSpec,
    depth: u32,
    limits: TreeLimits,
    collaborator: Arc<dyn ExecutionCollaborator>,
    retry: RetryConfig,
    cancel: CancellationToken,
}

fn run_child(ctx: ChildContext) -> BoxFuture<'static, ChildReport> {
    Box::pin(async move {
        let ChildContext {
            task,
            child_id,
            spec,
            depth,
            limits,
            collaborator,
            retry,
            cancel,
        } = ctx;
        let mut children = ChildSupervisor::new(
            task.clone(),
            &child_id,
            depth,
            limits.clone(),
            Arc::clone(&collaborator),
            retry.clone(),
            &cancel,
        );
        let mut session_id = None;
        let mut awaiting_children = false;

        for turn in 1..=limits.max_turns {
            let mut child_reports = children.drain();
            if awaiting_children && child_reports.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return ChildReport::failed(child_id, spec.title, "cancelled");
                    }
                    report = children.next() => child_reports.extend(report),
                }
            }

            let request = TurnRequest {
                task: task.clone(),
                context_id: child_id.clone(),
                depth,
                instructions: spec.instructions.clone(),
                session_id: session_id.clone(),
                turn,
                messages: Vec::new(),
                child_reports,
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    return ChildReport::failed(child_id, spec.title, "cancelled");
                }
                result = with_retry(&retry, "child turn", || {
                    let collaborator = Arc::clone(&collaborator);
                    let request = request.clone();
                    async move { collaborator.run_turn(request).await }
                }) => result,
            };
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => return ChildReport::failed(child_id, spec.title, e.to_string()),
            };
            if outcome.session_id.is_some() {
                session_id = outcome.session_id.clone();
            }
            for grandchild in outcome.spawn {
                children.spawn(grandchild);
            }

            match outcome.status {
                TurnStatus::Completed => {
                    return ChildReport {
                        child_id,
                        title: spec.title,
                        status: ChildStatus::Completed,
                        summary: outcome.summary,
                    };
                }
                TurnStatus::Failed => {
                    return ChildReport::failed(child_id, spec.title, outcome.summary);
                }
                TurnStatus::WaitingForHuman => {
                    let question = outcome.question.unwrap_or(outcome.summary);
                    return ChildReport::failed(
                        child_id,
                        spec.title,
                        format!("needs human input: {}", question),
                    );
                }
                TurnStatus::Continue => {
                    awaiting_children = children.outstanding() > 0;
                }
            }
        }

        ChildReport::failed(
            child_id,
            spec.title,
            format!("turn limit {} reached", limits.max_turns),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::collaborator::TurnOutcome;
    use crate::task::TaskSpec;
    use async_trait::async_trait;

    /// Children complete on their first turn, echoing their instructions
    struct EchoCollaborator;

    #[async_trait]
    impl ExecutionCollaborator for EchoCollaborator {
        fn name(&self) -> &str {
            "echo"
        }

        async fn run_turn(&self, request: TurnRequest) -> hive_foundation::Result<TurnOutcome> {
            Ok(TurnOutcome::completed(format!("done: {}", request.instructions)))
        }
    }

    fn supervisor(limits: TreeLimits, cancel: &CancellationToken) -> ChildSupervisor {
        ChildSupervisor::new(
            Task::from_spec(TaskSpec::new("parent", "")),
            ROOT_CONTEXT,
            0,
            limits,
            Arc::new(EchoCollaborator),
            RetryConfig::no_retry(),
            cancel,
        )
    }

    #[tokio::test]
    async fn test_child_reports_flow_to_parent() {
        let cancel = CancellationToken::new();
        let mut sup = supervisor(
            TreeLimits {
                max_children: 4,
                max_depth: 2,
                max_turns: 5,
            },
            &cancel,
        );
        sup.spawn(ChildSpec::new("a", "write intro"));
        sup.spawn(ChildSpec::new("b", "write outro"));
        assert_eq!(sup.outstanding(), 2);

        let mut reports = Vec::new();
        while let Some(report) = sup.next().await {
            reports.push(report);
        }
        reports.sort_by(|x, y| x.child_id.cmp(&y.child_id));
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].child_id, "root.1");
        assert_eq!(reports[0].status, ChildStatus::Completed);
        assert_eq!(reports[0].summary, "done: write intro");
        assert_eq!(sup.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_bounds_reject_children() {
        let cancel = CancellationToken::new();
        let mut sup = supervisor(
            TreeLimits {
                max_children: 1,
                max_depth: 1,
                max_turns: 5,
            },
            &cancel,
        );
        sup.spawn(ChildSpec::new("a", "x"));
        sup.spawn(ChildSpec::new("b", "y"));

        let rejected = sup.drain();
        assert!(rejected
            .iter()
            .any(|r| r.title == "b" && r.status == ChildStatus::Failed));

        let mut deep = ChildSupervisor::new(
            Task::from_spec(TaskSpec::new("parent", "")),
            "root.1",
            1,
            TreeLimits {
                max_children: 4,
                max_depth: 1,
                max_turns: 5,
            },
            Arc::new(EchoCollaborator),
            RetryConfig::no_retry(),
            &cancel,
        );
        deep.spawn(ChildSpec::new("too deep", "z"));
        let reports = deep.drain();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].summary.contains("depth limit"));
        assert_eq!(deep.outstanding(), 0);
    }
}
