//! Backend that shells out to configured commands.
//!
//! Templates may reference `{id}`, `{name}`, `{url}`, `{dir}` for repository
//! operations and `{ids}` for changeset syncs. Placeholders are never pasted
//! into the script: each one becomes a quoted positional parameter (`"$1"`..,
//! or `"$@"` for `{ids}`) and the values are passed as arguments to `sh -c`.
//! Templates must therefore not quote placeholders themselves.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use crate::backend::ExecutionBackend;
use crate::domain::{ChangesetId, FetchResult, OperationKind, RepoId, RepoRecord};
use crate::error::Result;
use crate::store::RepoStore;

/// Longest stderr excerpt kept in an error detail.
const MAX_STDERR_LEN: usize = 2000;

/// `$0` of every script.
const SCRIPT_NAME: &str = "repo-updater";

/// Repository placeholders and the positional parameter each expands to.
const REPO_PLACEHOLDERS: [(&str, &str); 4] = [
    ("{id}", "\"$1\""),
    ("{name}", "\"$2\""),
    ("{url}", "\"$3\""),
    ("{dir}", "\"$4\""),
];

/// Command templates for each operation.
#[derive(Debug, Clone)]
pub struct CommandBackendConfig {
    pub update_command: String,
    pub reclone_command: String,
    pub sync_command: String,
    /// Parent directory of the working copies.
    pub repos_dir: PathBuf,
}

impl Default for CommandBackendConfig {
    fn default() -> Self {
        Self {
            update_command: "git -C {dir} fetch --prune".to_string(),
            reclone_command: "rm -rf {dir} && git clone --mirror {url} {dir}".to_string(),
            sync_command: "echo {ids}".to_string(),
            repos_dir: PathBuf::from("/var/lib/repo-updater/repos"),
        }
    }
}

/// Runs each operation as `sh -c <template>`.
pub struct CommandBackend {
    config: CommandBackendConfig,
    store: Arc<dyn RepoStore>,
}

impl CommandBackend {
    pub fn new(config: CommandBackendConfig, store: Arc<dyn RepoStore>) -> Self {
        Self { config, store }
    }

    fn template(&self, kind: OperationKind) -> &str {
        match kind {
            OperationKind::Update => &self.config.update_command,
            OperationKind::Reclone => &self.config.reclone_command,
            OperationKind::ChangesetSync => &self.config.sync_command,
        }
    }

    /// Working copy directory for a repository, always inside `repos_dir`.
    pub fn repo_dir(&self, repo: &RepoRecord) -> Result<PathBuf> {
        repo.validate()?;
        Ok(self.config.repos_dir.join(repo.name.as_str()))
    }

    /// Script and positional arguments for a repository operation.
    fn render_repo(&self, template: &str, repo: &RepoRecord) -> Result<(String, Vec<String>)> {
        let dir = self.repo_dir(repo)?;
        let script = REPO_PLACEHOLDERS
            .iter()
            .fold(template.to_string(), |script, (placeholder, param)| script.replace(placeholder, param));
        let args = vec![
            repo.id.to_string(),
            repo.name.as_str().to_string(),
            repo.url.clone(),
            dir.display().to_string(),
        ];
        Ok((script, args))
    }

    async fn run(&self, script: &str, args: &[String]) -> FetchResult {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script).arg(SCRIPT_NAME).args(args);
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let output = match cmd.spawn() {
            Ok(child) => child.wait_with_output().await,
            Err(e) => return FetchResult::failed(format!("failed to spawn command: {}", e)),
        };

        match output {
            Ok(output) if output.status.success() => FetchResult::ok(),
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let mut detail = format!("command exited with {:?}", output.status.code());
                let stderr = stderr.trim();
                if !stderr.is_empty() {
                    let excerpt: String = stderr.chars().take(MAX_STDERR_LEN).collect();
                    detail.push_str(": ");
                    detail.push_str(&excerpt);
                }
                FetchResult::failed(detail)
            }
            Err(e) => FetchResult::failed(format!("command error: {}", e)),
        }
    }
}

#[async_trait]
impl ExecutionBackend for CommandBackend {
    async fn fetch(&self, repo_id: RepoId, kind: OperationKind) -> FetchResult {
        let repo = match self.store.get(repo_id) {
            Ok(Some(repo)) => repo,
            Ok(None) => return FetchResult::failed(format!("repo {} is not registered", repo_id)),
            Err(e) => return FetchResult::failed(format!("repo lookup failed: {}", e)),
        };

        let (script, args) = match self.render_repo(self.template(kind), &repo) {
            Ok(rendered) => rendered,
            Err(e) => return FetchResult::failed(format!("refusing to run command for repo {}: {}", repo_id, e)),
        };
        tracing::debug!(repo_id = %repo_id, kind = %kind, script = %script, args = ?args, "Running backend command");
        self.run(&script, &args).await
    }

    async fn sync_changesets(&self, ids: &[ChangesetId]) -> FetchResult {
        let args: Vec<String> = ids.iter().map(ChangesetId::to_string).collect();
        let script = self.template(OperationKind::ChangesetSync).replace("{ids}", "\"$@\"");
        tracing::debug!(script = %script, args = ?args, "Running sync command");
        self.run(&script, &args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRepoStore;

    fn backend(config: CommandBackendConfig) -> CommandBackend {
        let store = MemoryRepoStore::with_records([
            RepoRecord::new(1, "github.com/a/b", "github.com").with_url("https://github.com/a/b"),
        ]);
        CommandBackend::new(config, Arc::new(store))
    }

    #[test]
    fn test_render_repo_template() {
        let backend = backend(CommandBackendConfig {
            repos_dir: PathBuf::from("/srv/repos"),
            ..Default::default()
        });
        let repo = RepoRecord::new(1, "github.com/a/b", "github.com").with_url("https://github.com/a/b");

        let (script, args) = backend.render_repo("clone {url} {dir} # {id} {name}", &repo).unwrap();
        assert_eq!(script, "clone \"$3\" \"$4\" # \"$1\" \"$2\"");
        assert_eq!(
            args,
            vec!["1", "github.com/a/b", "https://github.com/a/b", "/srv/repos/github.com/a/b"]
        );
    }

    #[test]
    fn test_repo_dir_stays_inside_repos_dir() {
        let backend = backend(CommandBackendConfig {
            repos_dir: PathBuf::from("/srv/repos"),
            ..Default::default()
        });
        let repo = RepoRecord::new(1, "github.com/a/b", "github.com");
        assert_eq!(backend.repo_dir(&repo).unwrap(), PathBuf::from("/srv/repos/github.com/a/b"));

        for name in ["../../outside", "/etc", "github.com/../.."] {
            assert!(backend.repo_dir(&RepoRecord::new(2, name, "h")).is_err(), "accepted {}", name);
        }
    }

    #[tokio::test]
    async fn test_unsafe_name_never_reaches_the_shell() {
        let temp = tempfile::tempdir().unwrap();
        let marker = temp.path().join("marker");
        let store = MemoryRepoStore::with_records([RepoRecord::new(
            3,
            format!("x; touch {}", marker.display()),
            "h",
        )]);
        let backend = CommandBackend::new(
            CommandBackendConfig {
                update_command: "true {name}".to_string(),
                ..Default::default()
            },
            Arc::new(store),
        );

        let result = backend.fetch(RepoId(3), OperationKind::Update).await;
        assert!(!result.success);
        assert!(result.error_detail.unwrap().contains("refusing"));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_values_are_passed_as_arguments() {
        let temp = tempfile::tempdir().unwrap();
        let marker = temp.path().join("marker");
        let url = format!("https://h/x;touch${{IFS}}{}", marker.display());
        let store = MemoryRepoStore::with_records([RepoRecord::new(4, "github.com/a/b", "github.com").with_url(url.clone())]);
        let backend = CommandBackend::new(
            CommandBackendConfig {
                update_command: "test {url} = '$EXPECTED'".replace("$EXPECTED", &url),
                ..Default::default()
            },
            Arc::new(store),
        );

        let result = backend.fetch(RepoId(4), OperationKind::Update).await;
        assert!(result.success, "{:?}", result.error_detail);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let backend = backend(CommandBackendConfig {
            update_command: "exit 0".to_string(),
            ..Default::default()
        });
        let result = backend.fetch(RepoId(1), OperationKind::Update).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_fetch_failure_captures_stderr() {
        let backend = backend(CommandBackendConfig {
            update_command: "echo 'remote hung up' >&2; exit 128".to_string(),
            ..Default::default()
        });
        let result = backend.fetch(RepoId(1), OperationKind::Update).await;
        assert!(!result.success);
        let detail = result.error_detail.unwrap();
        assert!(detail.contains("128"));
        assert!(detail.contains("remote hung up"));
    }

    #[tokio::test]
    async fn test_fetch_unknown_repo_fails() {
        let backend = backend(CommandBackendConfig::default());
        let result = backend.fetch(RepoId(99), OperationKind::Update).await;
        assert!(!result.success);
        assert!(result.error_detail.unwrap().contains("not registered"));
    }

    #[tokio::test]
    async fn test_sync_renders_ids() {
        let backend = backend(CommandBackendConfig {
            sync_command: "test \"$(printf '%s,' {ids})\" = 1,2,".to_string(),
            ..Default::default()
        });
        let result = backend.sync_changesets(&[ChangesetId(1), ChangesetId(2)]).await;
        assert!(result.success);
    }
}
