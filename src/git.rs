use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use git2::{ErrorCode, Repository, Signature, TreeWalkMode, TreeWalkResult};

use crate::Result;

/// Version-control handle for the generated project.
///
/// All methods are blocking; async callers go through `util::blocking`.
/// Clones share one commit lock, so concurrent agents never race on the
/// index.
#[derive(Debug, Clone)]
pub struct RepoManager {
    repo_path: PathBuf,
    commit_lock: Arc<Mutex<()>>,
}

impl RepoManager {
    /// Create a manager for `repo_path`, creating the directory if needed.
    pub fn new(repo_path: &Path) -> Result<Self> {
        tracing::debug!(path = %repo_path.display(), "RepoManager::new");
        std::fs::create_dir_all(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
            commit_lock: Arc::new(Mutex::new(())),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Initialize a repository. Opening an existing one is not an error.
    pub fn init(&self) -> Result<()> {
        match Repository::open(&self.repo_path) {
            Ok(_) => {
                tracing::debug!(path = %self.repo_path.display(), "repository already initialized");
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                Repository::init(&self.repo_path)?;
                tracing::info!(path = %self.repo_path.display(), "initialized repository");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Stage `files` and commit them with `message`.
    ///
    /// Paths may be absolute (inside the repository) or relative to its
    /// root. Returns the new commit id, or `None` when the staged tree is
    /// identical to `HEAD`.
    pub fn commit_files<P: AsRef<Path>>(&self, files: &[P], message: &str) -> Result<Option<String>> {
        let _guard = self.commit_lock.lock().unwrap_or_else(|e| e.into_inner());
        let repo = self.repo()?;
        let mut index = repo.index()?;
        for file in files {
            let rel = self.relative(file.as_ref());
            tracing::trace!(file = %rel.display(), "staging");
            index.add_path(&rel)?;
        }
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
                None
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(parent) = &parent {
            if parent.tree_id() == tree_id {
                tracing::debug!("nothing to commit");
                return Ok(None);
            }
        }

        let sig = repo
            .signature()
            .or_else(|_| Signature::now("agentflow", "agentflow@localhost"))?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        tracing::debug!(commit = %commit_id, files = files.len(), "commit created");
        Ok(Some(commit_id.to_string()))
    }

    /// Recursive listing of `HEAD` in `git ls-tree -r` format.
    ///
    /// An empty repository yields an empty string.
    pub fn tree(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = match repo.head() {
            Ok(head) => head,
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
                return Ok(String::new())
            }
            Err(e) => return Err(e.into()),
        };
        let tree = head.peel_to_tree()?;

        let mut out = String::new();
        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() == Some(git2::ObjectType::Blob) {
                out.push_str(&format!(
                    "{:06o} blob {}\t{}{}\n",
                    entry.filemode(),
                    entry.id(),
                    root,
                    entry.name().unwrap_or_default()
                ));
            }
            TreeWalkResult::Ok
        })?;
        Ok(out)
    }

    fn relative(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            let root = self
                .repo_path
                .canonicalize()
                .unwrap_or_else(|_| self.repo_path.clone());
            let file = file.canonicalize().unwrap_or_else(|_| file.to_path_buf());
            if let Ok(rel) = file.strip_prefix(&root) {
                return rel.to_path_buf();
            }
        }
        file.to_path_buf()
    }
}
