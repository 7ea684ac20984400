//! Configuration file loading and validation.
//!
//! The configuration is a YAML document listing projects and their command
//! stages. Command lines may reference variables with `{{ .name }}`
//! placeholders; these are substituted once, here, and the rest of the system
//! only ever sees rendered command strings.
//!
//! ```yaml
//! cache: .monorun
//! timeout: 600
//! vars:
//!   out: "{{ .dir }}/dist"
//! projects:
//!   api:
//!     path: services/api
//!     build: ["make build OUT={{ .out }}"]
//!     test: ["make test"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::project::{Project, StageKind};

/// Default configuration file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "monorun.yml";

/// Default cache directory, resolved against the working directory.
pub const DEFAULT_CACHE_DIR: &str = ".monorun";

/// Name of the cache document inside the cache directory.
pub const CACHE_FILE_NAME: &str = "cache.yml";

/// Global variable holding the absolute working directory.
pub const DIR_VAR: &str = "dir";

/// Configuration errors. All of them are fatal before execution starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found at {0}")]
    NotFound(PathBuf),

    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("configuration has invalid variable {name}: {reason}")]
    InvalidVariable { name: String, reason: String },

    #[error("project {project} has invalid {stage} commands: {reason}")]
    InvalidCommand {
        project: String,
        stage: StageKind,
        reason: String,
    },

    #[error("invalid project {project}: {reason}")]
    InvalidProject { project: String, reason: String },

    #[error("project {0} not found")]
    UnknownProject(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigDraft {
    #[serde(default)]
    cache: Option<String>,
    #[serde(default)]
    only_changed: bool,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    vars: BTreeMap<String, String>,
    /// Kept as a raw mapping so that file order survives deserialization.
    #[serde(default)]
    projects: serde_yaml::Mapping,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ProjectDraft {
    path: String,
    #[serde(default)]
    before_build: Vec<String>,
    #[serde(default)]
    build: Vec<String>,
    #[serde(default)]
    after_build: Vec<String>,
    #[serde(default)]
    test: Vec<String>,
    #[serde(default)]
    deploy: Vec<String>,
}

impl ProjectDraft {
    fn commands(&self, stage: StageKind) -> &[String] {
        match stage {
            StageKind::BeforeBuild => &self.before_build,
            StageKind::Build => &self.build,
            StageKind::AfterBuild => &self.after_build,
            StageKind::Test => &self.test,
            StageKind::Deploy => &self.deploy,
        }
    }
}

/// Validated configuration with every template already rendered.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cache directory, relative to the working directory unless absolute.
    pub cache_dir: PathBuf,

    /// Informational flag carried over from the file.
    pub only_changed: bool,

    /// Per-command timeout. `None` means commands may run forever.
    pub command_timeout: Option<Duration>,

    /// Rendered variables, globals included.
    pub vars: BTreeMap<String, String>,

    /// Projects in file order.
    pub projects: Vec<Project>,
}

impl Config {
    /// Read and validate the configuration file at `path`.
    ///
    /// `work_dir` is exposed to templates as `{{ .dir }}`.
    pub fn load(path: &Path, work_dir: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;

        let config = Self::from_yaml(&source, work_dir)?;
        tracing::debug!(
            path = %path.display(),
            projects = config.projects.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate a configuration document.
    pub fn from_yaml(source: &str, work_dir: &Path) -> Result<Self> {
        let draft: ConfigDraft = serde_yaml::from_str(source)?;

        let mut globals = BTreeMap::new();
        globals.insert(DIR_VAR.to_string(), work_dir.to_string_lossy().into_owned());

        let mut vars = BTreeMap::new();
        for (name, value) in &draft.vars {
            let rendered =
                render_template(value, &globals).map_err(|reason| ConfigError::InvalidVariable {
                    name: name.clone(),
                    reason,
                })?;
            vars.insert(name.clone(), rendered);
        }
        // Globals shadow user variables of the same name.
        vars.extend(globals);

        let mut projects = Vec::with_capacity(draft.projects.len());
        for (key, value) in draft.projects {
            let name = match key {
                serde_yaml::Value::String(name) => name,
                other => {
                    return Err(ConfigError::InvalidProject {
                        project: format!("{other:?}"),
                        reason: "project names must be strings".to_string(),
                    })
                }
            };
            let project: ProjectDraft = serde_yaml::from_value(value)?;
            projects.push(build_project(name, &project, &vars)?);
        }

        Ok(Self {
            cache_dir: PathBuf::from(draft.cache.unwrap_or_else(|| DEFAULT_CACHE_DIR.to_string())),
            only_changed: draft.only_changed,
            command_timeout: draft.timeout.filter(|s| *s > 0).map(Duration::from_secs),
            vars,
            projects,
        })
    }

    /// Look up a project by name.
    pub fn project(&self, name: &str) -> Result<&Project> {
        self.projects
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| ConfigError::UnknownProject(name.to_string()))
    }

    /// Location of the commit cache document.
    pub fn cache_file(&self, work_dir: &Path) -> PathBuf {
        work_dir.join(&self.cache_dir).join(CACHE_FILE_NAME)
    }
}

fn build_project(
    name: String,
    draft: &ProjectDraft,
    vars: &BTreeMap<String, String>,
) -> Result<Project> {
    if draft.path.trim().is_empty() {
        return Err(ConfigError::InvalidProject {
            project: name,
            reason: "path must not be empty".to_string(),
        });
    }

    let mut project = Project::new(name.clone(), draft.path.clone());
    for stage in StageKind::ALL {
        let mut rendered = Vec::with_capacity(draft.commands(stage).len());
        for line in draft.commands(stage) {
            let line = render_template(line, vars).map_err(|reason| ConfigError::InvalidCommand {
                project: name.clone(),
                stage,
                reason,
            })?;
            rendered.push(line);
        }
        project = project.with_stage(stage, rendered);
    }
    Ok(project)
}

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder regex is valid")
    })
}

/// Substitute `{{ .name }}` placeholders.
///
/// Unknown variables and stray `{{` are errors.
pub fn render_template(
    text: &str,
    vars: &BTreeMap<String, String>,
) -> std::result::Result<String, String> {
    let re = placeholder_regex();
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for caps in re.captures_iter(text) {
        let whole = caps.get(0).expect("capture 0 always present");
        let name = &caps[1];
        let value = vars
            .get(name)
            .ok_or_else(|| format!("undefined variable \"{name}\""))?;

        let literal = &text[last..whole.start()];
        if literal.contains("{{") {
            return Err(format!("malformed placeholder in \"{text}\""));
        }
        out.push_str(literal);
        out.push_str(value);
        last = whole.end();
    }

    let tail = &text[last..];
    if tail.contains("{{") {
        return Err(format!("malformed placeholder in \"{text}\""));
    }
    out.push_str(tail);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
cache: .build-cache
timeout: 30
vars:
  out: "{{ .dir }}/dist"
projects:
  web:
    path: ./apps/web
    build: ["npm run build -- --out {{ .out }}"]
    test: ["npm test"]
  api:
    path: services/api
    beforeBuild: ["make deps"]
    build: ["make build"]
    afterBuild: ["echo done in {{.dir}}"]
    deploy: ["make deploy"]
"#;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_from_yaml_keeps_file_order_and_renders() {
        let config = Config::from_yaml(SAMPLE, Path::new("/work")).unwrap();

        let names: Vec<_> = config.projects.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["web", "api"]);

        let web = config.project("web").unwrap();
        assert_eq!(
            web.stage(StageKind::Build).commands(),
            &["npm run build -- --out /work/dist".to_string()]
        );

        let api = config.project("api").unwrap();
        assert_eq!(
            api.stage(StageKind::AfterBuild).commands(),
            &["echo done in /work".to_string()]
        );
        assert!(api.stage(StageKind::Test).is_empty());
    }

    #[test]
    fn test_from_yaml_settings() {
        let config = Config::from_yaml(SAMPLE, Path::new("/work")).unwrap();
        assert_eq!(config.cache_dir, PathBuf::from(".build-cache"));
        assert_eq!(config.command_timeout, Some(Duration::from_secs(30)));
        assert_eq!(
            config.cache_file(Path::new("/work")),
            PathBuf::from("/work/.build-cache/cache.yml")
        );
        assert_eq!(config.vars.get("dir").map(String::as_str), Some("/work"));
    }

    #[test]
    fn test_defaults_when_optional_fields_missing() {
        let config = Config::from_yaml("projects:\n  a:\n    path: a\n", Path::new("/w")).unwrap();
        assert_eq!(config.cache_dir, PathBuf::from(DEFAULT_CACHE_DIR));
        assert!(config.command_timeout.is_none());
        assert!(!config.only_changed);
        assert_eq!(config.projects.len(), 1);
    }

    #[test]
    fn test_unknown_variable_in_command_names_project_and_stage() {
        let src = "projects:\n  a:\n    path: a\n    test: [\"run {{ .nope }}\"]\n";
        let err = Config::from_yaml(src, Path::new("/w")).unwrap_err();
        match err {
            ConfigError::InvalidCommand { project, stage, .. } => {
                assert_eq!(project, "a");
                assert_eq!(stage, StageKind::Test);
            }
            other => panic!("expected InvalidCommand, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_variable_reported() {
        let src = "vars:\n  bad: \"{{ .missing }}\"\nprojects: {}\n";
        let err = Config::from_yaml(src, Path::new("/w")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVariable { ref name, .. } if name == "bad"));
    }

    #[test]
    fn test_empty_path_rejected() {
        let src = "projects:\n  a:\n    path: \"\"\n";
        let err = Config::from_yaml(src, Path::new("/w")).unwrap_err();
        assert!(err.to_string().contains("path must not be empty"));
    }

    #[test]
    fn test_unknown_stage_key_rejected() {
        let src = "projects:\n  a:\n    path: a\n    lint: [\"x\"]\n";
        assert!(matches!(
            Config::from_yaml(src, Path::new("/w")),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_project_lookup_unknown() {
        let config = Config::from_yaml(SAMPLE, Path::new("/work")).unwrap();
        assert!(matches!(
            config.project("missing"),
            Err(ConfigError::UnknownProject(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monorun.yml");
        assert!(matches!(
            Config::load(&path, dir.path()),
            Err(ConfigError::NotFound(p)) if p == path
        ));
    }

    #[test]
    fn test_render_template() {
        let v = vars(&[("dir", "/w"), ("tag", "v1")]);
        assert_eq!(render_template("plain", &v).unwrap(), "plain");
        assert_eq!(
            render_template("{{.dir}}/x:{{ .tag }}", &v).unwrap(),
            "/w/x:v1"
        );
        assert!(render_template("{{ .other }}", &v).is_err());
        assert!(render_template("echo {{ oops", &v).is_err());
    }
}
