//! Event notifications
//!
//! Downstream caches and integrations learn about repository changes through
//! an [`EventSink`]. Notifications are fire-and-forget: the repository never
//! waits for, or fails because of, a consumer.
//!
//! [`HookEventSink`] forwards notifications to executable scripts in
//! `<repo>/hooks/`, one script per event name, with the event data on stdin.
//! Scripts run one at a time on a worker thread, in notification order.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;

use crate::object::{RunId, StructureId, TreeKind};
use crate::storage::{RepoError, Result};

/// A repository event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    ResourceModified {
        tree: TreeKind,
        structure_id: StructureId,
        path: String,
    },
    ResourceDeleted {
        tree: TreeKind,
        structure_id: StructureId,
        path: String,
    },
    CachesCleared,
    PublishFinished {
        run_id: RunId,
        publish_tag: u64,
        published: usize,
        failed: usize,
    },
}

impl Notification {
    /// Hook script name for this event
    pub fn name(&self) -> &'static str {
        match self {
            Notification::ResourceModified { .. } => "resource-modified",
            Notification::ResourceDeleted { .. } => "resource-deleted",
            Notification::CachesCleared => "caches-cleared",
            Notification::PublishFinished { .. } => "post-publish",
        }
    }

    /// `KEY: value` lines handed to hook scripts
    pub fn to_hook_data(&self) -> String {
        let mut data = format!("EVENT: {}\n", self.name());
        match self {
            Notification::ResourceModified { tree, structure_id, path }
            | Notification::ResourceDeleted { tree, structure_id, path } => {
                data.push_str(&format!("TREE: {}\n", tree));
                data.push_str(&format!("ID: {}\n", structure_id));
                data.push_str(&format!("PATH: {}\n", path));
            }
            Notification::CachesCleared => {}
            Notification::PublishFinished { run_id, publish_tag, published, failed } => {
                data.push_str(&format!("RUN: {}\n", run_id));
                data.push_str(&format!("TAG: {}\n", publish_tag));
                data.push_str(&format!("PUBLISHED: {}\n", published));
                data.push_str(&format!("FAILED: {}\n", failed));
            }
        }
        data
    }
}

/// Consumer of repository notifications
pub trait EventSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Discards every notification
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn notify(&self, _notification: Notification) {}
}

/// Keeps notifications in memory for inspection
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<Notification>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Notification> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EventSink for RecordingEventSink {
    fn notify(&self, notification: Notification) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification);
    }
}

/// Runs `<repo>/hooks/<event-name>` for every notification
///
/// Dropping the sink waits for the hooks already queued.
pub struct HookEventSink {
    hooks_dir: PathBuf,
    worker: Mutex<Option<HookWorker>>,
}

struct HookWorker {
    sender: Sender<Notification>,
    handle: JoinHandle<()>,
}

impl HookEventSink {
    /// Hooks are expected in `<repo_root>/hooks/`.
    pub fn new(repo_path: &Path) -> Self {
        Self {
            hooks_dir: repo_path.join("hooks"),
            worker: Mutex::new(None),
        }
    }

    pub fn hook_path(&self, name: &str) -> PathBuf {
        self.hooks_dir.join(name)
    }

    /// Execute a hook script, piping `stdin_data` to its stdin and waiting
    /// for it. A missing hook succeeds; a non-zero exit is an error carrying
    /// the script's output.
    pub fn run_hook(&self, name: &str, stdin_data: &str) -> Result<()> {
        let hook_path = self.hook_path(name);
        if !hook_path.exists() {
            return Ok(());
        }

        let mut child = Command::new(&hook_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env(
                "DUALSTORE_REPO",
                self.hooks_dir.parent().unwrap_or(Path::new(".")),
            )
            .spawn()
            .map_err(|e| RepoError::backend("hook_spawn", format!("{}: {}", name, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(stdin_data.as_bytes());
        }

        let output = child
            .wait_with_output()
            .map_err(|e| RepoError::backend("hook_wait", format!("{}: {}", name, e)))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let msg = if !stderr.is_empty() {
            stderr.to_string()
        } else if !stdout.is_empty() {
            stdout.to_string()
        } else {
            format!("exited with code {}", output.status.code().unwrap_or(-1))
        };
        Err(RepoError::backend("hook", format!("{}: {}", name, msg.trim())))
    }

    pub fn ensure_hooks_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.hooks_dir)?;
        Ok(())
    }
}

impl EventSink for HookEventSink {
    fn notify(&self, notification: Notification) {
        let hook_path = self.hook_path(notification.name());
        if !hook_path.exists() {
            return;
        }
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_none() {
            match self.spawn_worker() {
                Ok(spawned) => *worker = Some(spawned),
                Err(e) => {
                    tracing::warn!("{} hook skipped: {}", notification.name(), e);
                    return;
                }
            }
        }
        if let Some(worker) = worker.as_ref() {
            if let Err(mpsc::SendError(lost)) = worker.sender.send(notification) {
                tracing::warn!("{} hook skipped: hook worker stopped", lost.name());
            }
        }
    }
}

impl HookEventSink {
    fn spawn_worker(&self) -> std::io::Result<HookWorker> {
        let (sender, receiver) = mpsc::channel::<Notification>();
        let runner = HookEventSink::new(self.hooks_dir.parent().unwrap_or(Path::new(".")));
        let handle = std::thread::Builder::new()
            .name("dualstore-hooks".into())
            .spawn(move || {
                for notification in receiver {
                    if let Err(e) = runner.run_hook(notification.name(), &notification.to_hook_data()) {
                        tracing::warn!("{} hook error (ignored): {}", notification.name(), e);
                    }
                }
            })?;
        Ok(HookWorker { sender, handle })
    }
}

impl Drop for HookEventSink {
    fn drop(&mut self) {
        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(HookWorker { sender, handle }) = worker {
            drop(sender);
            if handle.join().is_err() {
                tracing::warn!("hook worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn make_hook(dir: &Path, name: &str, script: &str) {
        let hooks_dir = dir.join("hooks");
        fs::create_dir_all(&hooks_dir).unwrap();
        let hook_path = hooks_dir.join(name);
        fs::write(&hook_path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&hook_path, fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    #[test]
    fn test_missing_hook_is_ok() {
        let tmp = TempDir::new().unwrap();
        let sink = HookEventSink::new(tmp.path());
        assert!(sink.run_hook("post-publish", "EVENT: post-publish\n").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_hook_reports_stderr() {
        let tmp = TempDir::new().unwrap();
        make_hook(tmp.path(), "post-publish", "#!/bin/sh\necho 'cache offline' >&2\nexit 1\n");
        let sink = HookEventSink::new(tmp.path());
        let err = sink.run_hook("post-publish", "").unwrap_err();
        assert!(err.to_string().contains("cache offline"), "got: {}", err);
    }

    #[cfg(unix)]
    #[test]
    fn test_hook_receives_event_data() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("seen.txt");
        make_hook(
            tmp.path(),
            "resource-deleted",
            &format!("#!/bin/sh\ncat > {}\n", out.display()),
        );
        let sink = HookEventSink::new(tmp.path());
        let event = Notification::ResourceDeleted {
            tree: TreeKind::Live,
            structure_id: StructureId::BROKEN,
            path: "/news/a.html".into(),
        };
        sink.run_hook(event.name(), &event.to_hook_data()).unwrap();
        let seen = fs::read_to_string(out).unwrap();
        assert!(seen.contains("TREE: live"));
        assert!(seen.contains("PATH: /news/a.html"));
    }

    #[test]
    fn test_recording_sink() {
        let sink = RecordingEventSink::new();
        sink.notify(Notification::CachesCleared);
        assert_eq!(sink.events(), vec![Notification::CachesCleared]);
        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_notifications_run_hooks_in_order() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("paths.txt");
        make_hook(
            tmp.path(),
            "resource-deleted",
            &format!("#!/bin/sh\ngrep PATH >> {}\n", out.display()),
        );
        let sink = HookEventSink::new(tmp.path());
        for path in ["/a.html", "/b.html", "/c.html"] {
            sink.notify(Notification::ResourceDeleted {
                tree: TreeKind::Live,
                structure_id: StructureId::BROKEN,
                path: path.into(),
            });
        }
        drop(sink);
        let seen = fs::read_to_string(out).unwrap();
        assert_eq!(
            seen.lines().collect::<Vec<_>>(),
            vec!["PATH: /a.html", "PATH: /b.html", "PATH: /c.html"]
        );
    }

    #[test]
    fn test_ensure_hooks_dir() {
        let tmp = TempDir::new().unwrap();
        let sink = HookEventSink::new(tmp.path());
        sink.ensure_hooks_dir().unwrap();
        assert!(tmp.path().join("hooks").exists());
    }
}
