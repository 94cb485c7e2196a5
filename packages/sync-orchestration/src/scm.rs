//! SCM layer (C6): git CLI wrapper, commit/PR flow, and provider retry
//! ladder (spec §4.4, §6 "Git CLI contract").

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::ScmServiceConfig;
use crate::error::{OrchestratorError, Result};
use crate::kg::{Entity, KnowledgeGraph, Relationship};
use graph_storage::{CommitStatus, SCMCommitRecord, SyncStore};

const DEFAULT_MAX_BUFFER_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Thin wrapper around the `git` CLI (spec §6 "Git CLI contract").
pub struct GitService {
    repo_path: PathBuf,
    max_buffer_bytes: usize,
}

impl GitService {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
        }
    }

    /// Runs `git <args>` in the configured working directory. Command
    /// failures surface as `GitCommandFailed` carrying both streams, per
    /// the spec's combined-message contract.
    pub async fn run_git(&self, args: &[&str], env: &[(String, String)]) -> Result<GitOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.repo_path);
        for (k, v) in env {
            cmd.env(k, v);
        }

        let output = cmd.output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if stdout.len() + stderr.len() > self.max_buffer_bytes {
            warn!(
                bytes = stdout.len() + stderr.len(),
                limit = self.max_buffer_bytes,
                "git output exceeded configured maxBuffer"
            );
        }

        if !output.status.success() {
            return Err(OrchestratorError::GitCommandFailed {
                args: args.join(" "),
                stdout,
                stderr,
                message: format!("git exited with status {}", output.status),
            });
        }

        Ok(GitOutput { stdout, stderr })
    }

    pub async fn is_inside_work_tree(&self) -> Result<bool> {
        match self
            .run_git(&["rev-parse", "--is-inside-work-tree"], &[])
            .await
        {
            Ok(out) => Ok(out.stdout.trim() == "true"),
            Err(_) => Ok(false),
        }
    }

    pub async fn current_branch(&self) -> Result<String> {
        let out = self
            .run_git(&["rev-parse", "--abbrev-ref", "HEAD"], &[])
            .await?;
        Ok(out.stdout.trim().to_string())
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let ref_arg = format!("refs/heads/{branch}");
        let out = self
            .run_git(&["show-ref", "--verify", "--quiet", ref_arg.as_str()], &[])
            .await;
        Ok(out.is_ok())
    }

    pub async fn switch(&self, branch: &str) -> Result<()> {
        self.run_git(&["switch", branch], &[]).await?;
        Ok(())
    }

    pub async fn switch_create(&self, branch: &str, base: Option<&str>) -> Result<()> {
        let mut args = vec!["switch", "-c", branch];
        if let Some(base) = base {
            args.push(base);
        }
        self.run_git(&args, &[]).await?;
        Ok(())
    }

    pub async fn stash_push(&self, message: &str, include_untracked: bool) -> Result<()> {
        let mut args = vec!["stash", "push", "-m", message];
        if include_untracked {
            args.push("-u");
        }
        self.run_git(&args, &[]).await?;
        Ok(())
    }

    pub async fn stash_apply(&self) -> Result<()> {
        self.run_git(&["stash", "apply"], &[]).await?;
        Ok(())
    }

    pub async fn stash_drop(&self) -> Result<()> {
        self.run_git(&["stash", "drop"], &[]).await?;
        Ok(())
    }

    pub async fn staged_files(&self) -> Result<Vec<String>> {
        let out = self
            .run_git(&["diff", "--cached", "--name-only"], &[])
            .await?;
        Ok(out
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    pub async fn add(&self, paths: &[String]) -> Result<()> {
        let mut args = vec!["add", "--"];
        let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
        args.extend(path_refs);
        self.run_git(&args, &[]).await?;
        Ok(())
    }

    pub async fn reset_staged(&self) -> Result<()> {
        self.run_git(&["reset"], &[]).await?;
        Ok(())
    }

    pub async fn commit(
        &self,
        title: &str,
        body: Option<&str>,
        env: &[(String, String)],
    ) -> Result<String> {
        let mut args = vec!["commit", "--no-verify", "-m", title];
        if let Some(body) = body {
            args.push("-m");
            args.push(body);
        }
        self.run_git(&args, env).await?;
        let rev = self.run_git(&["rev-parse", "HEAD"], &[]).await?;
        Ok(rev.stdout.trim().to_string())
    }

    pub async fn remote_get_url(&self, remote: &str) -> Result<String> {
        let out = self.run_git(&["remote", "get-url", remote], &[]).await?;
        Ok(out.stdout.trim().to_string())
    }

    pub async fn push(&self, remote: &str, branch: &str, force: bool) -> Result<()> {
        let mut args = vec!["push", remote, branch];
        if force {
            args.push("--force-with-lease");
        }
        self.run_git(&args, &[]).await?;
        Ok(())
    }

    /// Runs `git log` with an ASCII Unit Separator pretty-format and parses
    /// the result into structured entries (spec §6).
    pub async fn log(&self, max_count: usize, path: Option<&str>) -> Result<Vec<CommitLogEntry>> {
        let max_count_arg = format!("--max-count={max_count}");
        let mut args = vec![
            "log",
            max_count_arg.as_str(),
            "--pretty=format:%H\x1f%an\x1f%ae\x1f%ad",
            "--date=iso-strict",
        ];
        if let Some(path) = path {
            args.push("--");
            args.push(path);
        }
        let out = self.run_git(&args, &[]).await?;
        Ok(parse_git_log(&out.stdout))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitLogEntry {
    pub hash: String,
    pub author_name: String,
    pub author_email: String,
    pub author_date: String,
}

/// Parses `--pretty=format:%H\x1f%an\x1f%ae\x1f%ad` output, one entry per
/// line, fields split on the ASCII Unit Separator (spec §6).
pub fn parse_git_log(output: &str) -> Vec<CommitLogEntry> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let mut fields = line.split('\x1f');
            Some(CommitLogEntry {
                hash: fields.next()?.to_string(),
                author_name: fields.next()?.to_string(),
                author_email: fields.next()?.to_string(),
                author_date: fields.next()?.to_string(),
            })
        })
        .collect()
}

/// Resolves a repo-relative path and rejects anything escaping the repo
/// root (spec §4.4 step 5).
pub fn safe_repo_path(repo_root: &Path, candidate: &str) -> Result<PathBuf> {
    let joined = repo_root.join(candidate);
    let normalized = normalize_path(&joined);
    if !normalized.starts_with(repo_root) {
        return Err(OrchestratorError::Validation(vec![format!(
            "path escapes repository root: {candidate}"
        )]));
    }
    Ok(normalized)
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub remote: Option<String>,
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct CreateCommitRequest {
    pub title: String,
    pub description: Option<String>,
    pub changes: Vec<String>,
    pub branch_name: Option<String>,
    pub base_branch: Option<String>,
    pub related_spec_id: Option<String>,
    pub create_pr: Option<bool>,
    pub preserve_paths: Vec<String>,
    pub push: Option<PushOptions>,
}

#[derive(Debug, Clone)]
pub struct PreparePullRequestRequest {
    pub branch: String,
    pub base_branch: Option<String>,
    pub commit_hash: String,
    pub title: String,
    pub description: Option<String>,
    pub changes: Vec<String>,
    pub metadata: Option<Value>,
    pub push: Option<PushOptions>,
}

#[derive(Debug, Clone)]
pub struct PullRequestResult {
    pub provider: String,
    pub remote: Option<String>,
    pub pushed: bool,
    pub message: Option<String>,
    pub pr_url: Option<String>,
    pub metadata: Option<Value>,
}

/// The SCM provider interface this core consumes (spec §6).
#[async_trait]
pub trait ScmProvider: Send + Sync {
    async fn prepare_pull_request(
        &self,
        request: PreparePullRequestRequest,
    ) -> std::result::Result<PullRequestResult, String>;
}

/// Resolves the remote via `git remote get-url`, pushes, and builds
/// `prUrl = <cleanedRemote>#<encodedBranch>:<commitHash>` (spec §6).
pub struct LocalGitProvider {
    git: Arc<GitService>,
}

impl LocalGitProvider {
    pub fn new(git: Arc<GitService>) -> Self {
        Self { git }
    }

    fn clean_remote(url: &str) -> String {
        url.trim_end_matches(".git").to_string()
    }

    fn encode_branch(branch: &str) -> String {
        branch.replace('/', "%2F")
    }
}

#[async_trait]
impl ScmProvider for LocalGitProvider {
    async fn prepare_pull_request(
        &self,
        request: PreparePullRequestRequest,
    ) -> std::result::Result<PullRequestResult, String> {
        let remote_name = request
            .push
            .as_ref()
            .and_then(|p| p.remote.clone())
            .unwrap_or_else(|| "origin".to_string());
        let force = request.push.as_ref().map(|p| p.force).unwrap_or(false);

        let remote_url = self
            .git
            .remote_get_url(&remote_name)
            .await
            .map_err(|e| e.to_string())?;

        self.git
            .push(&remote_name, &request.branch, force)
            .await
            .map_err(|e| e.to_string())?;

        let cleaned = Self::clean_remote(&remote_url);
        let pr_url = format!(
            "{}#{}:{}",
            cleaned,
            Self::encode_branch(&request.branch),
            request.commit_hash
        );

        Ok(PullRequestResult {
            provider: "local-git".to_string(),
            remote: Some(remote_name),
            pushed: true,
            message: None,
            pr_url: Some(pr_url),
            metadata: request.metadata,
        })
    }
}

fn author_identity() -> (String, String) {
    let actor = std::env::var("GIT_AUTHOR_NAME")
        .or_else(|_| std::env::var("GITHUB_ACTOR"))
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "memento-bot".to_string());
    let email = std::env::var("GIT_AUTHOR_EMAIL")
        .unwrap_or_else(|_| format!("{actor}@users.noreply.github.com"));
    (actor, email)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderFailure {
    pub message: String,
    pub attempts: u32,
}

/// C6: `createCommitAndMaybePR`, serialized per instance by a git mutex
/// (spec §4.4).
pub struct SCMService {
    git: Arc<GitService>,
    provider: Option<Arc<dyn ScmProvider>>,
    store: Arc<dyn SyncStore>,
    config: ScmServiceConfig,
    git_mutex: Mutex<()>,
}

impl SCMService {
    pub fn new(
        git: Arc<GitService>,
        provider: Option<Arc<dyn ScmProvider>>,
        store: Arc<dyn SyncStore>,
        config: ScmServiceConfig,
    ) -> Self {
        Self {
            git,
            provider,
            store,
            config,
            git_mutex: Mutex::new(()),
        }
    }

    pub async fn create_commit_and_maybe_pr(
        &self,
        request: CreateCommitRequest,
        kg: &dyn KnowledgeGraph,
    ) -> Result<SCMCommitRecord> {
        let _guard = self.git_mutex.lock().await;

        // Step 1: validate.
        let title = request.title.trim();
        if title.is_empty() {
            return Err(OrchestratorError::Validation(vec![
                "title must be non-empty".to_string(),
            ]));
        }
        let changes: Vec<String> = request
            .changes
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if changes.is_empty() {
            return Err(OrchestratorError::Validation(vec![
                "changes must contain at least one non-empty path".to_string(),
            ]));
        }

        // Step 2: must be a working tree.
        if !self.git.is_inside_work_tree().await? {
            return Err(OrchestratorError::Validation(vec![
                "not a git working tree".to_string(),
            ]));
        }

        let original_branch = self.git.current_branch().await?;
        let branch = request
            .branch_name
            .clone()
            .unwrap_or_else(|| original_branch.clone());

        // Step 3: ensure the target branch exists / is checked out.
        let result = self
            .ensure_branch(&branch, &original_branch, request.base_branch.as_deref(), &request.preserve_paths)
            .await;
        if let Err(e) = result {
            self.try_switch_back(&original_branch, &branch).await;
            return Err(e);
        }

        let outcome = self.commit_flow(&request, &changes, kg).await;

        if branch != original_branch {
            self.try_switch_back(&original_branch, &branch).await;
        }

        outcome
    }

    async fn try_switch_back(&self, original_branch: &str, current_branch: &str) {
        if original_branch != current_branch {
            if let Err(e) = self.git.switch(original_branch).await {
                warn!(error = %e, "failed to switch back to original branch");
            }
        }
    }

    async fn ensure_branch(
        &self,
        branch: &str,
        original_branch: &str,
        base: Option<&str>,
        preserve_paths: &[String],
    ) -> Result<()> {
        if branch == original_branch {
            return Ok(());
        }

        if self.git.branch_exists(branch).await? {
            match self.git.switch(branch).await {
                Ok(()) => Ok(()),
                Err(OrchestratorError::GitCommandFailed { stderr, .. })
                    if stderr.contains("would be overwritten by checkout") =>
                {
                    self.git
                        .stash_push("memento-scm-service-temp", true)
                        .await?;
                    self.git.switch(branch).await?;
                    for path in preserve_paths {
                        let _ = self
                            .git
                            .run_git(&["rm", "-f", "--", path.as_str()], &[])
                            .await;
                    }
                    match self.git.stash_apply().await {
                        Ok(()) => {
                            self.git.stash_drop().await?;
                            Ok(())
                        }
                        Err(e) => Err(OrchestratorError::Validation(vec![format!(
                            "stash left in place: failed to reapply after branch switch: {e}"
                        )])),
                    }
                }
                Err(e) => Err(e),
            }
        } else {
            self.git.switch_create(branch, base).await
        }
    }

    async fn commit_flow(
        &self,
        request: &CreateCommitRequest,
        changes: &[String],
        kg: &dyn KnowledgeGraph,
    ) -> Result<SCMCommitRecord> {
        // Step 4: reject if other files are already staged.
        let staged = self.git.staged_files().await.unwrap_or_default();
        let unexpected: Vec<&String> = staged
            .iter()
            .filter(|s| !changes.iter().any(|c| c == *s))
            .take(5)
            .collect();
        if !unexpected.is_empty() {
            return Err(OrchestratorError::Validation(vec![format!(
                "staged files outside requested changes: {:?}",
                unexpected
            )]));
        }

        // Step 5: stage paths, resolved safely inside the repo root.
        let repo_root = self.git_repo_root();
        for change in changes {
            safe_repo_path(&repo_root, change)?;
        }
        self.git.add(changes).await?;
        let now_staged = self.git.staged_files().await.unwrap_or_default();
        if now_staged.is_empty() {
            return Err(OrchestratorError::Validation(vec![
                "nothing staged for commit".to_string(),
            ]));
        }

        // Step 6: commit.
        let (author_name, author_email) = author_identity();
        let env = vec![
            ("GIT_AUTHOR_NAME".to_string(), author_name.clone()),
            ("GIT_AUTHOR_EMAIL".to_string(), author_email.clone()),
            ("GIT_COMMITTER_NAME".to_string(), author_name.clone()),
            ("GIT_COMMITTER_EMAIL".to_string(), author_email.clone()),
        ];
        let commit_result = self
            .git
            .commit(&request.title, request.description.as_deref(), &env)
            .await;
        let commit_hash = match commit_result {
            Ok(hash) => hash,
            Err(OrchestratorError::GitCommandFailed { stdout, stderr, .. })
                if stdout.contains("nothing to commit") || stderr.contains("nothing to commit") =>
            {
                self.git.reset_staged().await.ok();
                return Err(OrchestratorError::Validation(vec![
                    "nothing to commit".to_string(),
                ]));
            }
            Err(e) => return Err(e),
        };

        // Step 7: record a Change graph entity.
        let mut change_entity = Entity::new(format!("change:{commit_hash}"), "Change");
        change_entity
            .fields
            .insert("title".to_string(), Value::String(request.title.clone()));
        change_entity.fields.insert(
            "changes".to_string(),
            Value::Array(changes.iter().cloned().map(Value::String).collect()),
        );
        if let Err(e) = kg.create_entity(&change_entity, true).await {
            warn!(error = %e, "failed to record Change entity for commit");
        }
        if let Some(spec_id) = &request.related_spec_id {
            let rel = Relationship::new(
                format!("rel:{commit_hash}:spec"),
                "MODIFIED_IN",
                change_entity.id.clone(),
                spec_id.clone(),
            );
            if let Err(e) = kg.create_relationship(&rel, false).await {
                warn!(error = %e, "failed to link commit to related spec");
            }
        }

        let mut record = SCMCommitRecord::new(
            commit_hash.clone(),
            request.branch_name.clone().unwrap_or_default(),
            request.title.clone(),
            author_name.clone(),
        );
        record.description = request.description.clone();
        record.changes = changes.to_vec();
        record.related_spec_id = request.related_spec_id.clone();

        // Step 8: provider retry ladder.
        let want_pr = request.create_pr.unwrap_or(true);
        if want_pr {
            match &self.provider {
                None => return Err(OrchestratorError::ScmProviderNotConfigured),
                Some(provider) => {
                    let pr_request = PreparePullRequestRequest {
                        branch: request.branch_name.clone().unwrap_or_default(),
                        base_branch: request.base_branch.clone(),
                        commit_hash: commit_hash.clone(),
                        title: request.title.clone(),
                        description: request.description.clone(),
                        changes: changes.to_vec(),
                        metadata: None,
                        push: request.push.clone(),
                    };
                    self.run_provider_with_retry(provider.as_ref(), pr_request, &mut record)
                        .await;
                }
            }
        } else {
            record.status = CommitStatus::Committed;
        }

        // Step 9: persist.
        self.store.record_scm_commit(&record).await?;
        Ok(record)
    }

    async fn run_provider_with_retry(
        &self,
        provider: &dyn ScmProvider,
        request: PreparePullRequestRequest,
        record: &mut SCMCommitRecord,
    ) {
        let mut attempts = 0;
        let mut last_error = String::new();
        loop {
            attempts += 1;
            match provider.prepare_pull_request(request.clone()).await {
                Ok(result) => {
                    record.status = CommitStatus::Pending;
                    record.pr_url = result.pr_url;
                    record.provider = Some(result.provider);
                    record.metadata = serde_json::json!({
                        "providerAttempts": attempts,
                        "retryAttempts": attempts,
                    });
                    return;
                }
                Err(e) => {
                    last_error = e;
                    if attempts >= self.config.max_retries {
                        break;
                    }
                    info!(attempt = attempts, error = %last_error, "provider retry scheduled");
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.config.retry_delay_ms * attempts as u64,
                    ))
                    .await;
                }
            }
        }

        record.status = CommitStatus::Failed;
        record.metadata = serde_json::json!({
            "providerAttempts": attempts,
            "providerFailure": ProviderFailure {
                message: last_error,
                attempts,
            },
            "escalationRequired": true,
        });
    }

    fn git_repo_root(&self) -> PathBuf {
        self.git.repo_path.clone()
    }
}

#[derive(Default)]
struct GitStatusLine {
    index: char,
    worktree: char,
    path: String,
}

#[derive(Debug, Clone, Default)]
pub struct GitStatus {
    pub branch: String,
    pub ahead: u32,
    pub behind: u32,
    pub staged: Vec<String>,
    pub unstaged: Vec<String>,
    pub untracked: Vec<String>,
}

/// Parses `git status --short --branch` output (spec §6): the first line
/// carries `## branch...[ahead N][behind M]`; body lines are classified by
/// their two-character status code.
pub fn parse_git_status(output: &str) -> GitStatus {
    let mut status = GitStatus::default();
    let mut lines = output.lines();

    if let Some(header) = lines.next() {
        let header = header.trim_start_matches("## ");
        if let Some(branch_part) = header.split(['.', ' ', '[']).next() {
            status.branch = branch_part.to_string();
        }
        if let Some(start) = header.find("ahead ") {
            let rest = &header[start + 6..];
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            status.ahead = digits.parse().unwrap_or(0);
        }
        if let Some(start) = header.find("behind ") {
            let rest = &header[start + 7..];
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            status.behind = digits.parse().unwrap_or(0);
        }
    }

    for line in lines {
        if line.len() < 3 {
            continue;
        }
        let mut chars = line.chars();
        let index = chars.next().unwrap_or(' ');
        let worktree = chars.next().unwrap_or(' ');
        let path = line[3..].to_string();
        let parsed = GitStatusLine { index, worktree, path };

        if parsed.index == '?' && parsed.worktree == '?' {
            status.untracked.push(parsed.path);
        } else {
            if parsed.index != ' ' {
                status.staged.push(parsed.path.clone());
            }
            if parsed.worktree != ' ' {
                status.unstaged.push(parsed.path);
            }
        }
    }

    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_safe_repo_path_rejects_escape() {
        let root = PathBuf::from("/tmp/repo");
        let err = safe_repo_path(&root, "../outside.txt").unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[test]
    fn test_safe_repo_path_allows_nested() {
        let root = PathBuf::from("/tmp/repo");
        let resolved = safe_repo_path(&root, "src/a.ts").unwrap();
        assert_eq!(resolved, PathBuf::from("/tmp/repo/src/a.ts"));
    }

    #[test]
    fn test_parse_git_status_header_and_body() {
        let raw = "## main...origin/main [ahead 2]\n M src/a.ts\n?? new_file.txt\n";
        let status = parse_git_status(raw);
        assert_eq!(status.branch, "main");
        assert_eq!(status.ahead, 2);
        assert_eq!(status.unstaged, vec!["src/a.ts".to_string()]);
        assert_eq!(status.untracked, vec!["new_file.txt".to_string()]);
    }

    #[test]
    fn test_local_git_provider_clean_remote_strips_git_suffix() {
        assert_eq!(
            LocalGitProvider::clean_remote("git@github.com:org/repo.git"),
            "git@github.com:org/repo"
        );
    }

    #[test]
    fn test_local_git_provider_encodes_branch_slashes() {
        assert_eq!(
            LocalGitProvider::encode_branch("feature/foo"),
            "feature%2Ffoo"
        );
    }

    #[test]
    fn test_parse_git_log_splits_on_unit_separator() {
        let raw = "abc123\x1fAlice\x1falice@example.com\x1f2024-01-01T00:00:00Z\ndef456\x1fBob\x1fbob@example.com\x1f2024-01-02T00:00:00Z\n";
        let entries = parse_git_log(raw);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].hash, "abc123");
        assert_eq!(entries[0].author_name, "Alice");
        assert_eq!(entries[1].author_email, "bob@example.com");
    }

    #[tokio::test]
    async fn test_provider_retry_escalates_after_max_attempts() {
        struct AlwaysFails;
        #[async_trait]
        impl ScmProvider for AlwaysFails {
            async fn prepare_pull_request(
                &self,
                _request: PreparePullRequestRequest,
            ) -> std::result::Result<PullRequestResult, String> {
                Err("rate limited".to_string())
            }
        }

        let git = Arc::new(GitService::new("/tmp/repo"));
        let store = Arc::new(graph_storage::InMemorySyncStore::new());
        let service = SCMService::new(
            git,
            Some(Arc::new(AlwaysFails)),
            store,
            ScmServiceConfig {
                max_retries: 2,
                retry_delay_ms: 1,
            },
        );

        let mut record = SCMCommitRecord::new("abc123", "main", "t", "author");
        let request = PreparePullRequestRequest {
            branch: "main".to_string(),
            base_branch: None,
            commit_hash: "abc123".to_string(),
            title: "t".to_string(),
            description: None,
            changes: vec!["a.ts".to_string()],
            metadata: None,
            push: None,
        };
        service
            .run_provider_with_retry(&AlwaysFails, request, &mut record)
            .await;

        assert_eq!(record.status, CommitStatus::Failed);
        assert_eq!(record.metadata["providerAttempts"], 2);
        assert_eq!(record.metadata["escalationRequired"], true);
    }
}
