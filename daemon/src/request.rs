//! Request validation and isolation spec construction.
//!
//! Turns an [`ExecutionRequest`] into a [`PreparedExecution`]: the
//! [`IsolationSpec`] handed to the backend plus the workspace it mounts.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::debug;
use uuid::Uuid;

use crate::config::{Config, ImageConfig, ResourceLimits};
use crate::error::ExecutionError;
use crate::workspace::Workspace;

/// Entry points probed in a project workspace, in precedence order.
const PROJECT_ENTRY_POINTS: [(&str, Language); 2] = [
    ("main.py", Language::Python),
    ("index.js", Language::JavaScript),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    JavaScript,
}

impl Language {
    const fn extension(self) -> &'static str {
        match self {
            Self::Python => "py",
            Self::JavaScript => "js",
        }
    }

    const fn interpreter(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "node",
        }
    }

    fn image(self, images: &ImageConfig) -> &str {
        match self {
            Self::Python => &images.python,
            Self::JavaScript => &images.javascript,
        }
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Self::Python),
            "javascript" => Ok(Self::JavaScript),
            other => Err(format!(
                "Unsupported language: '{other}'. Available: [\"python\", \"javascript\"]"
            )),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
        })
    }
}

/// What the caller asked to run.
#[derive(Debug)]
pub enum ExecutionRequest {
    /// A single inline source file.
    Snippet { source_code: String, language: Language },
    /// An already extracted multi-file project.
    Project { workspace: Workspace },
}

/// Everything the isolation runtime needs for one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct IsolationSpec {
    /// Unique container name, used to kill the container on timeout.
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    /// Host directory bind-mounted into the container.
    pub mount_source: PathBuf,
    pub mount_target: String,
    pub limits: ResourceLimits,
}

impl IsolationSpec {
    /// Always `none`: containers never get a network.
    pub const fn network_mode(&self) -> &'static str {
        "none"
    }

    /// Always true: the bind mount is the only writable surface.
    pub const fn read_only_root(&self) -> bool {
        true
    }
}

/// A validated request, ready to run.
///
/// The workspace lives exactly as long as this value.
#[derive(Debug)]
pub struct PreparedExecution {
    pub spec: IsolationSpec,
    pub workspace: Workspace,
    /// Source text recorded in the audit log.
    pub source_snapshot: String,
}

/// Validates requests and builds isolation specs from configuration.
#[derive(Debug, Clone)]
pub struct ExecutionRequestBuilder {
    images: ImageConfig,
    limits: ResourceLimits,
    mount_target: String,
    workspace_root: PathBuf,
    max_code_chars: usize,
}

impl ExecutionRequestBuilder {
    pub fn new(config: &Config, workspace_root: PathBuf) -> Self {
        Self {
            images: config.images.clone(),
            limits: config.limits,
            mount_target: config.runtime.mount_target.clone(),
            workspace_root,
            max_code_chars: config.max_code_chars,
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Check a snippet without touching the filesystem.
    pub fn validate_snippet(&self, source_code: &str) -> Result<(), ExecutionError> {
        if source_code.chars().count() > self.max_code_chars {
            return Err(ExecutionError::input(format!(
                "Code too long. Max {} chars allowed.",
                self.max_code_chars
            )));
        }
        Ok(())
    }

    pub fn build(&self, request: ExecutionRequest) -> Result<PreparedExecution, ExecutionError> {
        match request {
            ExecutionRequest::Snippet {
                source_code,
                language,
            } => self.build_snippet(source_code, language),
            ExecutionRequest::Project { workspace } => self.build_project(workspace),
        }
    }

    fn build_snippet(
        &self,
        source_code: String,
        language: Language,
    ) -> Result<PreparedExecution, ExecutionError> {
        self.validate_snippet(&source_code)?;

        let workspace = Workspace::create(&self.workspace_root)?;
        let file_name = format!("temp_{}.{}", Uuid::new_v4().simple(), language.extension());
        std::fs::write(workspace.path().join(&file_name), &source_code)?;
        debug!(%language, file = %file_name, "Materialized snippet");

        let spec = self.spec(language, &file_name, workspace.path());
        Ok(PreparedExecution {
            spec,
            workspace,
            source_snapshot: source_code,
        })
    }

    fn build_project(&self, workspace: Workspace) -> Result<PreparedExecution, ExecutionError> {
        let (entry, language) = PROJECT_ENTRY_POINTS
            .iter()
            .find(|(file, _)| is_regular_file(&workspace.path().join(file)))
            .copied()
            .ok_or_else(|| ExecutionError::input("Archive must contain main.py or index.js"))?;

        let source = std::fs::read(workspace.path().join(entry))?;
        debug!(%language, entry, "Detected project entry point");

        let spec = self.spec(language, entry, workspace.path());
        Ok(PreparedExecution {
            spec,
            workspace,
            source_snapshot: String::from_utf8_lossy(&source).into_owned(),
        })
    }

    fn spec(&self, language: Language, entry: &str, mount_source: &Path) -> IsolationSpec {
        IsolationSpec {
            name: format!("sandbox-run-{}", Uuid::new_v4().simple()),
            image: language.image(&self.images).to_string(),
            command: vec![
                language.interpreter().to_string(),
                format!("{}/{entry}", self.mount_target.trim_end_matches('/')),
            ],
            mount_source: mount_source.to_path_buf(),
            mount_target: self.mount_target.clone(),
            limits: self.limits,
        }
    }
}

/// True only for a regular file; symlinks are never followed.
fn is_regular_file(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok_and(|meta| meta.file_type().is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder(root: &Path) -> ExecutionRequestBuilder {
        ExecutionRequestBuilder::new(&Config::default(), root.to_path_buf())
    }

    fn snippet(code: &str, language: Language) -> ExecutionRequest {
        ExecutionRequest::Snippet {
            source_code: code.to_string(),
            language,
        }
    }

    #[test]
    fn parse_language() {
        assert_eq!("python".parse::<Language>(), Ok(Language::Python));
        assert_eq!("javascript".parse::<Language>(), Ok(Language::JavaScript));
        assert!("ruby".parse::<Language>().unwrap_err().contains("ruby"));
    }

    #[test]
    fn python_snippet_spec() {
        let root = tempfile::tempdir().unwrap();
        let prepared = builder(root.path())
            .build(snippet("print('hello')", Language::Python))
            .unwrap();
        let spec = &prepared.spec;

        assert_eq!(spec.image, "python:3.11-slim");
        assert_eq!(spec.command[0], "python");
        assert!(spec.command[1].starts_with("/app/temp_"));
        assert!(spec.command[1].ends_with(".py"));
        assert_eq!(spec.mount_source, prepared.workspace.path());
        assert_eq!(spec.mount_target, "/app");
        assert_eq!(spec.network_mode(), "none");
        assert!(spec.read_only_root());
        assert_eq!(spec.limits.memory_mb, 128);
        assert_eq!(spec.limits.cpu_time_seconds, 10);

        let file_name = spec.command[1].trim_start_matches("/app/");
        let written = std::fs::read_to_string(prepared.workspace.path().join(file_name)).unwrap();
        assert_eq!(written, "print('hello')");
        assert_eq!(prepared.source_snapshot, "print('hello')");
    }

    #[test]
    fn javascript_snippet_spec() {
        let root = tempfile::tempdir().unwrap();
        let prepared = builder(root.path())
            .build(snippet("console.log(1)", Language::JavaScript))
            .unwrap();

        assert_eq!(prepared.spec.image, "node:18-slim");
        assert_eq!(prepared.spec.command[0], "node");
        assert!(prepared.spec.command[1].ends_with(".js"));
    }

    #[test]
    fn oversized_snippet_is_input_error_and_writes_nothing() {
        let root = tempfile::tempdir().unwrap();
        let code = "x".repeat(5001);

        let err = builder(root.path())
            .build(snippet(&code, Language::Python))
            .unwrap_err();

        assert!(matches!(err, ExecutionError::Input(_)));
        assert_eq!(err.to_string(), "Code too long. Max 5000 chars allowed.");
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn limit_counts_characters_not_bytes() {
        let root = tempfile::tempdir().unwrap();
        // 5000 two-byte characters is exactly at the limit
        let code = "é".repeat(5000);
        assert!(builder(root.path())
            .build(snippet(&code, Language::Python))
            .is_ok());
    }

    #[test]
    fn snippets_get_distinct_workspaces_and_containers() {
        let root = tempfile::tempdir().unwrap();
        let b = builder(root.path());
        let first = b.build(snippet("1", Language::Python)).unwrap();
        let second = b.build(snippet("1", Language::Python)).unwrap();

        assert_ne!(first.spec.mount_source, second.spec.mount_source);
        assert_ne!(first.spec.name, second.spec.name);
        assert_ne!(first.spec.command[1], second.spec.command[1]);
    }

    #[test]
    fn project_prefers_main_py() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path()).unwrap();
        std::fs::write(workspace.path().join("main.py"), "print('py')").unwrap();
        std::fs::write(workspace.path().join("index.js"), "console.log('js')").unwrap();

        let prepared = builder(root.path())
            .build(ExecutionRequest::Project { workspace })
            .unwrap();

        assert_eq!(prepared.spec.image, "python:3.11-slim");
        assert_eq!(prepared.spec.command, vec!["python", "/app/main.py"]);
        assert_eq!(prepared.source_snapshot, "print('py')");
    }

    #[test]
    fn project_falls_back_to_index_js() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path()).unwrap();
        std::fs::write(workspace.path().join("index.js"), "console.log('js')").unwrap();

        let prepared = builder(root.path())
            .build(ExecutionRequest::Project { workspace })
            .unwrap();

        assert_eq!(prepared.spec.image, "node:18-slim");
        assert_eq!(prepared.spec.command, vec!["node", "/app/index.js"]);
    }

    #[test]
    fn project_without_entry_point_is_input_error() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path()).unwrap();
        let path = workspace.path().to_path_buf();
        std::fs::write(path.join("app.py"), "print(1)").unwrap();
        std::fs::create_dir(path.join("main.py.d")).unwrap();

        let err = builder(root.path())
            .build(ExecutionRequest::Project { workspace })
            .unwrap_err();

        assert!(matches!(err, ExecutionError::Input(_)));
        assert!(err.to_string().contains("main.py"));
        assert!(err.to_string().contains("index.js"));
        // The workspace was consumed and cleaned up
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_entry_point_is_not_followed() {
        let root = tempfile::tempdir().unwrap();
        let secret = root.path().join("secret.txt");
        std::fs::write(&secret, "host-only contents").unwrap();
        let workspace = Workspace::create(&root.path().join("runs")).unwrap();
        std::os::unix::fs::symlink(&secret, workspace.path().join("main.py")).unwrap();

        let err = builder(root.path())
            .build(ExecutionRequest::Project { workspace })
            .unwrap_err();

        assert!(matches!(err, ExecutionError::Input(_)));
        assert!(!err.to_string().contains("host-only"));
    }

    #[test]
    fn custom_mount_target_and_images() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::from_json(
            r#"{"runtime": {"mount_target": "/work/"}, "images": {"javascript": "node:20"}}"#,
        )
        .unwrap();
        let b = ExecutionRequestBuilder::new(&config, root.path().to_path_buf());

        let prepared = b.build(snippet("1", Language::JavaScript)).unwrap();
        assert_eq!(prepared.spec.image, "node:20");
        assert!(prepared.spec.command[1].starts_with("/work/temp_"));
    }
}
