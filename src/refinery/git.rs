//! Git operations for the merge queue.
//!
//! One `GitWorkspace` wraps the refinery's checkout of a rig. All merge
//! strategies are built from the primitives here: fetch, rebase with
//! abort-on-conflict, fast-forward-only merge, squash merge, branch
//! cleanup, and push.

use std::path::{Path, PathBuf};

use git2::{BranchType, ErrorClass, Oid, RebaseOptions, Repository, Signature, build::CheckoutBuilder};
use tracing::debug;

use crate::errors::MergeError;

/// Result of a rebase attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseOutcome {
    Clean,
    /// Conflicting paths; the working tree is restored to its pre-rebase
    /// state before this is returned.
    Conflict { files: Vec<String> },
}

pub struct GitWorkspace {
    repo: Repository,
    path: PathBuf,
}

impl GitWorkspace {
    pub fn open(path: &Path) -> Result<Self, MergeError> {
        let repo = Repository::open(path)?;
        Ok(Self {
            repo,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn signature(&self) -> Result<Signature<'static>, MergeError> {
        Ok(Signature::now("gastown-refinery", "refinery@gastown.local")?)
    }

    // ── Remotes ───────────────────────────────────────────────────────

    /// Fetch one branch from a remote.
    pub fn fetch(&self, remote: &str, branch: &str) -> Result<(), MergeError> {
        let mut remote = self.repo.find_remote(remote)?;
        remote.fetch(&[branch], None, None)?;
        Ok(())
    }

    /// Push a branch to a remote.
    pub fn push(&self, remote: &str, branch: &str) -> Result<(), MergeError> {
        let mut remote = self.repo.find_remote(remote)?;
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote.push(&[refspec.as_str()], None)?;
        Ok(())
    }

    /// Delete a branch on the remote.
    pub fn delete_remote_branch(&self, remote: &str, branch: &str) -> Result<(), MergeError> {
        let mut remote = self.repo.find_remote(remote)?;
        let refspec = format!(":refs/heads/{branch}");
        remote.push(&[refspec.as_str()], None)?;
        Ok(())
    }

    pub fn delete_local_branch(&self, branch: &str) -> Result<(), MergeError> {
        let mut b = self.repo.find_branch(branch, BranchType::Local)?;
        b.delete()?;
        Ok(())
    }

    // ── Working tree ──────────────────────────────────────────────────

    pub fn checkout_branch(&self, branch: &str) -> Result<(), MergeError> {
        self.repo.set_head(&format!("refs/heads/{branch}"))?;
        let mut co = CheckoutBuilder::new();
        co.force();
        self.repo.checkout_head(Some(&mut co))?;
        Ok(())
    }

    pub fn branch_tip(&self, branch: &str) -> Result<Oid, MergeError> {
        Ok(self.repo.refname_to_id(&format!("refs/heads/{branch}"))?)
    }

    /// Resolve any revision string (`main`, `origin/main`, a SHA).
    pub fn resolve(&self, rev: &str) -> Result<Oid, MergeError> {
        Ok(self.repo.revparse_single(rev)?.id())
    }

    /// Create (or move) a local branch at a revision.
    pub fn create_branch_at(&self, name: &str, rev: &str) -> Result<(), MergeError> {
        let commit = self.repo.find_commit(self.resolve(rev)?)?;
        self.repo.branch(name, &commit, true)?;
        Ok(())
    }

    /// Fast-forward `branch` to `rev` when `rev` is ahead; a no-op when the
    /// branch is already at or past it.
    pub fn fast_forward_to(&self, branch: &str, rev: &str) -> Result<(), MergeError> {
        let target = self.resolve(rev)?;
        let current = self.branch_tip(branch)?;
        if target == current || self.repo.graph_descendant_of(current, target)? {
            return Ok(());
        }
        if !self.repo.graph_descendant_of(target, current)? {
            return Err(MergeError::Infra(format!(
                "{branch} and {rev} have diverged"
            )));
        }
        self.repo.reference(
            &format!("refs/heads/{branch}"),
            target,
            true,
            "gastown: fast-forward update",
        )?;
        self.checkout_branch(branch)?;
        Ok(())
    }

    // ── Rebase ────────────────────────────────────────────────────────

    /// Rebase `source_branch` onto `onto_rev`. On conflict the rebase is
    /// aborted in place and the conflicting paths are reported; the branch
    /// and working tree are left exactly as they were.
    pub fn rebase_onto(
        &self,
        source_branch: &str,
        onto_rev: &str,
    ) -> Result<RebaseOutcome, MergeError> {
        self.checkout_branch(source_branch)?;
        let source = self.repo.find_branch(source_branch, BranchType::Local)?;
        let source_ann = self.repo.reference_to_annotated_commit(source.get())?;
        let onto_ann = self.repo.find_annotated_commit(self.resolve(onto_rev)?)?;

        let mut opts = RebaseOptions::new();
        let mut rebase =
            self.repo
                .rebase(Some(&source_ann), Some(&onto_ann), None, Some(&mut opts))?;
        let sig = self.signature()?;
        let mut last_commit: Option<Oid> = None;

        while let Some(op) = rebase.next() {
            op?;
            let index = self.repo.index()?;
            if index.has_conflicts() {
                let files = conflicted_paths(&index);
                rebase.abort()?;
                self.checkout_branch(source_branch)?;
                debug!(branch = source_branch, ?files, "rebase conflict, aborted");
                return Ok(RebaseOutcome::Conflict { files });
            }
            match rebase.commit(None, &sig, None) {
                Ok(oid) => last_commit = Some(oid),
                // A patch already contained upstream becomes an empty
                // commit attempt; skip it.
                Err(e) if e.class() == ErrorClass::Rebase => continue,
                Err(e) => return Err(e.into()),
            }
        }
        rebase.finish(Some(&sig))?;

        // finish() re-points the source ref when the rebase started from a
        // branch; pin it explicitly so detached starts behave the same.
        let tip = last_commit.unwrap_or(onto_ann.id());
        if self.branch_tip(source_branch).ok() != Some(tip) {
            self.repo.reference(
                &format!("refs/heads/{source_branch}"),
                tip,
                true,
                "gastown: rebase",
            )?;
        }
        self.checkout_branch(source_branch)?;
        Ok(RebaseOutcome::Clean)
    }

    // ── Merging ───────────────────────────────────────────────────────

    /// Fast-forward `target_branch` to `source_branch`. Anything that is
    /// not a fast-forward is an error by design.
    pub fn ff_merge(&self, target_branch: &str, source_branch: &str) -> Result<(), MergeError> {
        let source_oid = self.branch_tip(source_branch)?;
        let target_oid = self.branch_tip(target_branch)?;
        if source_oid != target_oid && !self.repo.graph_descendant_of(source_oid, target_oid)? {
            return Err(MergeError::Infra(format!(
                "{source_branch} is not a fast-forward of {target_branch}"
            )));
        }
        self.repo.reference(
            &format!("refs/heads/{target_branch}"),
            source_oid,
            true,
            "gastown: fast-forward merge",
        )?;
        self.checkout_branch(target_branch)?;
        Ok(())
    }

    /// Dry-run merge of `source` into `target`; returns conflicting paths
    /// without touching the working tree.
    pub fn conflict_check(
        &self,
        target_branch: &str,
        source_branch: &str,
    ) -> Result<Vec<String>, MergeError> {
        let target = self.repo.find_commit(self.branch_tip(target_branch)?)?;
        let source = self.repo.find_commit(self.branch_tip(source_branch)?)?;
        let index = self.repo.merge_commits(&target, &source, None)?;
        if index.has_conflicts() {
            Ok(conflicted_paths(&index))
        } else {
            Ok(Vec::new())
        }
    }

    /// Squash `source` into `target` as a single commit.
    pub fn squash_merge(
        &self,
        target_branch: &str,
        source_branch: &str,
        message: &str,
    ) -> Result<Oid, MergeError> {
        let target = self.repo.find_commit(self.branch_tip(target_branch)?)?;
        let source = self.repo.find_commit(self.branch_tip(source_branch)?)?;
        let mut index = self.repo.merge_commits(&target, &source, None)?;
        if index.has_conflicts() {
            return Err(MergeError::Infra(format!(
                "squash of {source_branch} into {target_branch} conflicts"
            )));
        }
        let tree_id = index.write_tree_to(&self.repo)?;
        let tree = self.repo.find_tree(tree_id)?;
        let sig = self.signature()?;
        let oid = self.repo.commit(
            Some(&format!("refs/heads/{target_branch}")),
            &sig,
            &sig,
            message,
            &tree,
            &[&target],
        )?;
        self.checkout_branch(target_branch)?;
        Ok(oid)
    }

    // ── History ───────────────────────────────────────────────────────

    /// Commit messages on `source` that are not on `target_rev`, oldest
    /// first. The refinery scans these for structured change blocks.
    pub fn messages_ahead(
        &self,
        source_branch: &str,
        target_rev: &str,
    ) -> Result<Vec<String>, MergeError> {
        let mut walk = self.repo.revwalk()?;
        walk.push(self.branch_tip(source_branch)?)?;
        walk.hide(self.resolve(target_rev)?)?;
        let mut messages = Vec::new();
        for oid in walk {
            let commit = self.repo.find_commit(oid?)?;
            messages.push(commit.message().unwrap_or_default().to_string());
        }
        messages.reverse();
        Ok(messages)
    }
}

fn conflicted_paths(index: &git2::Index) -> Vec<String> {
    let mut files: Vec<String> = index
        .conflicts()
        .map(|conflicts| {
            conflicts
                .filter_map(|c| c.ok())
                .filter_map(|c| c.our.or(c.their).or(c.ancestor))
                .filter_map(|entry| String::from_utf8(entry.path).ok())
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files.dedup();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn init_repo(dir: &Path) -> Repository {
        let mut opts = git2::RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(dir, &opts).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.local").unwrap();
        repo
    }

    fn commit_file(repo_dir: &Path, name: &str, content: &str, msg: &str) -> Oid {
        let repo = Repository::open(repo_dir).unwrap();
        fs::write(repo_dir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("test", "test@test.local").unwrap();
        let parents: Vec<git2::Commit<'_>> = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .into_iter()
            .collect();
        let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &parent_refs)
            .unwrap()
    }

    fn create_branch(repo_dir: &Path, name: &str) {
        let repo = Repository::open(repo_dir).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch(name, &head, false).unwrap();
    }

    /// Repo with an initial commit on main and a `feature` branch.
    fn setup() -> (tempfile::TempDir, GitWorkspace) {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        commit_file(dir.path(), "base.txt", "base\n", "initial");
        create_branch(dir.path(), "feature");
        let ws = GitWorkspace::open(dir.path()).unwrap();
        (dir, ws)
    }

    #[test]
    fn clean_rebase_linearizes_history() {
        let (dir, ws) = setup();
        // main advances in one file, feature in another.
        commit_file(dir.path(), "main.txt", "from main\n", "main work");
        ws.checkout_branch("feature").unwrap();
        commit_file(dir.path(), "feature.txt", "from feature\n", "feature work");

        let outcome = ws.rebase_onto("feature", "main").unwrap();
        assert_eq!(outcome, RebaseOutcome::Clean);

        // Feature now descends from main's tip and carries both files.
        let main_tip = ws.branch_tip("main").unwrap();
        let feature_tip = ws.branch_tip("feature").unwrap();
        let repo = Repository::open(dir.path()).unwrap();
        assert!(repo.graph_descendant_of(feature_tip, main_tip).unwrap());
        assert!(dir.path().join("main.txt").exists());
        assert!(dir.path().join("feature.txt").exists());
    }

    #[test]
    fn conflicting_rebase_aborts_and_restores() {
        let (dir, ws) = setup();
        commit_file(dir.path(), "shared.txt", "main version\n", "main edit");
        ws.checkout_branch("feature").unwrap();
        let before = commit_file(dir.path(), "shared.txt", "feature version\n", "feature edit");

        let outcome = ws.rebase_onto("feature", "main").unwrap();
        match outcome {
            RebaseOutcome::Conflict { files } => {
                assert_eq!(files, vec!["shared.txt"]);
            }
            RebaseOutcome::Clean => panic!("expected a conflict"),
        }
        // Branch tip unchanged; repository is out of rebase state.
        assert_eq!(ws.branch_tip("feature").unwrap(), before);
        let repo = Repository::open(dir.path()).unwrap();
        assert_eq!(repo.state(), git2::RepositoryState::Clean);
    }

    #[test]
    fn ff_merge_moves_target_to_source_tip() {
        let (dir, ws) = setup();
        ws.checkout_branch("feature").unwrap();
        let tip = commit_file(dir.path(), "feature.txt", "x\n", "feature work");

        ws.ff_merge("main", "feature").unwrap();
        assert_eq!(ws.branch_tip("main").unwrap(), tip);
    }

    #[test]
    fn ff_merge_refuses_divergent_branches() {
        let (dir, ws) = setup();
        commit_file(dir.path(), "main.txt", "m\n", "main work");
        ws.checkout_branch("feature").unwrap();
        commit_file(dir.path(), "feature.txt", "f\n", "feature work");

        let err = ws.ff_merge("main", "feature").unwrap_err();
        assert!(matches!(err, MergeError::Infra(_)));
    }

    #[test]
    fn conflict_check_reports_paths_without_merging() {
        let (dir, ws) = setup();
        commit_file(dir.path(), "shared.txt", "main\n", "main edit");
        ws.checkout_branch("feature").unwrap();
        commit_file(dir.path(), "shared.txt", "feature\n", "feature edit");

        let conflicts = ws.conflict_check("main", "feature").unwrap();
        assert_eq!(conflicts, vec!["shared.txt"]);
        // Clean pair reports nothing.
        let main_tip = ws.branch_tip("main").unwrap();
        assert_eq!(ws.resolve("main").unwrap(), main_tip);
    }

    #[test]
    fn squash_merge_produces_single_commit_on_target() {
        let (dir, ws) = setup();
        ws.checkout_branch("feature").unwrap();
        commit_file(dir.path(), "a.txt", "a\n", "step one");
        commit_file(dir.path(), "b.txt", "b\n", "step two");
        let main_before = ws.branch_tip("main").unwrap();

        let oid = ws
            .squash_merge("main", "feature", "squash: feature work")
            .unwrap();
        let repo = Repository::open(dir.path()).unwrap();
        let commit = repo.find_commit(oid).unwrap();
        assert_eq!(commit.parent_count(), 1);
        assert_eq!(commit.parent_id(0).unwrap(), main_before);
        assert!(dir.path().join("a.txt").exists());
        assert!(dir.path().join("b.txt").exists());
    }

    #[test]
    fn push_and_delete_remote_branch_round_trip() {
        let (dir, _ws) = setup();
        let remote_dir = tempdir().unwrap();
        Repository::init_bare(remote_dir.path()).unwrap();
        {
            let repo = Repository::open(dir.path()).unwrap();
            repo.remote("origin", remote_dir.path().to_str().unwrap())
                .unwrap();
        }
        let ws = GitWorkspace::open(dir.path()).unwrap();

        ws.push("origin", "main").unwrap();
        ws.checkout_branch("feature").unwrap();
        commit_file(dir.path(), "f.txt", "f\n", "feature work");
        ws.push("origin", "feature").unwrap();

        let bare = Repository::open_bare(remote_dir.path()).unwrap();
        assert!(bare.refname_to_id("refs/heads/feature").is_ok());

        ws.delete_remote_branch("origin", "feature").unwrap();
        let bare = Repository::open_bare(remote_dir.path()).unwrap();
        assert!(bare.refname_to_id("refs/heads/feature").is_err());

        ws.checkout_branch("main").unwrap();
        ws.delete_local_branch("feature").unwrap();
        assert!(ws.branch_tip("feature").is_err());
    }

    #[test]
    fn messages_ahead_lists_unmerged_commits_oldest_first() {
        let (dir, ws) = setup();
        ws.checkout_branch("feature").unwrap();
        commit_file(dir.path(), "a.txt", "a\n", "first change");
        commit_file(dir.path(), "b.txt", "b\n", "second change");

        let messages = ws.messages_ahead("feature", "main").unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].starts_with("first change"));
        assert!(messages[1].starts_with("second change"));
    }
}
