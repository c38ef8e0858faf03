//! In-memory [`ResourceStore`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use v2t_core::{Branch, BranchId, Workspace, WorkspaceId};

use super::{BranchUpdate, ResourceStore, WorkspaceUpdate};
use crate::errors::EngineError;

#[derive(Default)]
struct Inner {
    workspaces: HashMap<WorkspaceId, Workspace>,
    branches: HashMap<BranchId, Branch>,
    /// Branch IDs per workspace, in creation order.
    by_workspace: HashMap<WorkspaceId, Vec<BranchId>>,
}

impl Inner {
    fn expired(&self, cutoff: DateTime<Utc>) -> Vec<WorkspaceId> {
        self.workspaces
            .values()
            .filter(|ws| ws.last_accessed_at < cutoff && !ws.stage().is_in_flight())
            .filter(|ws| {
                self.by_workspace.get(&ws.id).is_none_or(|ids| {
                    ids.iter().all(|b| {
                        self.branches
                            .get(b)
                            .is_none_or(|br| br.state().is_terminal())
                    })
                })
            })
            .map(|ws| ws.id.clone())
            .collect()
    }

    fn remove(&mut self, id: &WorkspaceId) -> Vec<BranchId> {
        let _ = self.workspaces.remove(id);
        let ids = self.by_workspace.remove(id).unwrap_or_default();
        for branch_id in &ids {
            let _ = self.branches.remove(branch_id);
        }
        ids
    }
}

/// Process-local store backed by hash maps.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored workspaces.
    pub fn workspace_count(&self) -> usize {
        self.inner.read().workspaces.len()
    }

    /// Number of stored branches.
    pub fn branch_count(&self) -> usize {
        self.inner.read().branches.len()
    }
}

impl ResourceStore for MemoryStore {
    fn insert_workspace(&self, workspace: Workspace) {
        let mut inner = self.inner.write();
        let _ = inner
            .by_workspace
            .insert(workspace.id.clone(), Vec::new());
        let _ = inner.workspaces.insert(workspace.id.clone(), workspace);
    }

    fn workspace(&self, id: &WorkspaceId) -> Option<Workspace> {
        self.inner.read().workspaces.get(id).cloned()
    }

    fn update_workspace(
        &self,
        id: &WorkspaceId,
        update: WorkspaceUpdate<'_>,
    ) -> Result<Workspace, EngineError> {
        let mut inner = self.inner.write();
        let stored = inner
            .workspaces
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("workspace {id}")))?;
        let mut draft = stored.clone();
        update(&mut draft)?;
        *stored = draft.clone();
        Ok(draft)
    }

    fn insert_branch(&self, branch: Branch) -> Result<(), EngineError> {
        let mut inner = self.inner.write();
        let Some(ids) = inner.by_workspace.get_mut(&branch.workspace_id) else {
            return Err(EngineError::NotFound(format!(
                "workspace {}",
                branch.workspace_id
            )));
        };
        ids.push(branch.id.clone());
        let _ = inner.branches.insert(branch.id.clone(), branch);
        Ok(())
    }

    fn branch(&self, id: &BranchId) -> Option<Branch> {
        self.inner.read().branches.get(id).cloned()
    }

    fn update_branch(&self, id: &BranchId, update: BranchUpdate<'_>) -> Result<Branch, EngineError> {
        let mut inner = self.inner.write();
        let stored = inner
            .branches
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("branch {id}")))?;
        let mut draft = stored.clone();
        update(&mut draft)?;
        *stored = draft.clone();
        Ok(draft)
    }

    fn branches_of(&self, workspace_id: &WorkspaceId) -> Vec<Branch> {
        let inner = self.inner.read();
        inner
            .by_workspace
            .get(workspace_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.branches.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn append_content(&self, id: &BranchId, delta: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.write();
        let stored = inner
            .branches
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("branch {id}")))?;
        stored.append(delta)?;
        Ok(())
    }

    fn remove_workspace(&self, id: &WorkspaceId) -> Vec<BranchId> {
        self.inner.write().remove(id)
    }

    fn expired(&self, cutoff: DateTime<Utc>) -> Vec<WorkspaceId> {
        self.inner.read().expired(cutoff)
    }

    fn remove_expired(&self, cutoff: DateTime<Utc>) -> Vec<(WorkspaceId, Vec<BranchId>)> {
        let mut inner = self.inner.write();
        inner
            .expired(cutoff)
            .into_iter()
            .map(|id| {
                let branches = inner.remove(&id);
                (id, branches)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Duration;
    use v2t_core::{BranchKind, ModelError, PromptParams, WorkspaceStage};

    fn ready_workspace(store: &MemoryStore) -> WorkspaceId {
        let ws = Workspace::new("http://x/video");
        let id = ws.id.clone();
        store.insert_workspace(ws);
        let _ = store
            .update_workspace(&id, &mut |ws| {
                ws.advance(WorkspaceStage::Downloading)?;
                ws.advance(WorkspaceStage::Transcribing)?;
                ws.set_transcript("hello world")?;
                ws.advance(WorkspaceStage::Ready)
            })
            .unwrap();
        id
    }

    #[test]
    fn rejected_update_leaves_record_unchanged() {
        let store = MemoryStore::new();
        let ws = Workspace::new("http://x/video");
        let id = ws.id.clone();
        store.insert_workspace(ws);

        let err = store
            .update_workspace(&id, &mut |ws| {
                ws.advance(WorkspaceStage::Downloading)?;
                ws.advance(WorkspaceStage::Ready)
            })
            .unwrap_err();
        assert_matches!(err, EngineError::InvalidTransition(ModelError::IllegalTransition { .. }));
        assert_eq!(store.workspace(&id).unwrap().stage(), WorkspaceStage::Pending);
    }

    #[test]
    fn update_unknown_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update_branch(&BranchId::from("br_missing"), &mut |_| Ok(()))
            .unwrap_err();
        assert_matches!(err, EngineError::NotFound(_));
    }

    #[test]
    fn branches_listed_in_creation_order_and_removed_with_workspace() {
        let store = MemoryStore::new();
        let ws = ready_workspace(&store);
        let a = Branch::new(ws.clone(), BranchKind::Outline, PromptParams::default());
        let b = Branch::new(ws.clone(), BranchKind::Article, PromptParams::default());
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        store.insert_branch(a).unwrap();
        store.insert_branch(b).unwrap();

        let ids: Vec<_> = store.branches_of(&ws).into_iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![a_id.clone(), b_id.clone()]);

        assert_eq!(store.remove_workspace(&ws), vec![a_id, b_id]);
        assert_eq!(store.workspace_count(), 0);
        assert_eq!(store.branch_count(), 0);
    }

    #[test]
    fn branch_requires_workspace() {
        let store = MemoryStore::new();
        let orphan = Branch::new(
            WorkspaceId::from("ws_missing"),
            BranchKind::Outline,
            PromptParams::default(),
        );
        assert_matches!(store.insert_branch(orphan), Err(EngineError::NotFound(_)));
    }

    #[test]
    fn expired_skips_in_flight_work() {
        let store = MemoryStore::new();
        let settled = ready_workspace(&store);
        let busy = ready_workspace(&store);
        let pending = Workspace::new("http://x/other");
        let pending_id = pending.id.clone();
        store.insert_workspace(pending);

        let mut streaming = Branch::new(busy.clone(), BranchKind::Outline, PromptParams::default());
        streaming.begin(None).unwrap();
        store.insert_branch(streaming).unwrap();

        let future = Utc::now() + Duration::seconds(5);
        let expired = store.expired(future);
        assert_eq!(expired, vec![settled.clone()]);
        assert!(!expired.contains(&pending_id));

        let past = Utc::now() - Duration::hours(1);
        assert!(store.expired(past).is_empty());
    }

    #[test]
    fn remove_expired_takes_only_settled_workspaces() {
        let store = MemoryStore::new();
        let settled = ready_workspace(&store);
        let busy = ready_workspace(&store);
        let mut done = Branch::new(settled.clone(), BranchKind::Outline, PromptParams::default());
        done.begin(None).unwrap();
        done.complete().unwrap();
        let done_id = done.id.clone();
        store.insert_branch(done).unwrap();
        let mut streaming = Branch::new(busy.clone(), BranchKind::Outline, PromptParams::default());
        streaming.begin(None).unwrap();
        store.insert_branch(streaming).unwrap();

        let removed = store.remove_expired(Utc::now() + Duration::seconds(5));
        assert_eq!(removed, vec![(settled.clone(), vec![done_id])]);
        assert!(store.workspace(&settled).is_none());
        assert!(store.workspace(&busy).is_some());
        assert_eq!(store.branch_count(), 1);
    }

    #[test]
    fn append_content_grows_streaming_branch_in_place() {
        let store = MemoryStore::new();
        let ws = ready_workspace(&store);
        let mut branch = Branch::new(ws, BranchKind::Article, PromptParams::default());
        branch.begin(None).unwrap();
        let id = branch.id.clone();
        store.insert_branch(branch).unwrap();

        for delta in ["Once ", "upon ", "a time"] {
            store.append_content(&id, delta).unwrap();
        }
        assert_eq!(store.branch(&id).unwrap().content(), "Once upon a time");

        let _ = store.update_branch(&id, &mut |b| b.complete()).unwrap();
        assert_matches!(
            store.append_content(&id, "more"),
            Err(EngineError::InvalidTransition(ModelError::ContentFrozen(_)))
        );
        assert_eq!(store.branch(&id).unwrap().content(), "Once upon a time");
        assert_matches!(
            store.append_content(&BranchId::from("br_missing"), "x"),
            Err(EngineError::NotFound(_))
        );
    }
}
