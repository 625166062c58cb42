use devloop::runner::DevLoopConfig;
use devloop::verify::{DEFAULT_INFRA_SIGNATURES, ToolKind, VerifyStepSpec};
use eyre::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    /// Repository the loop works in; defaults to the current directory
    pub project_root: Option<PathBuf>,
    /// Where run directories go; defaults to `<project_root>/.devloop/runs`
    pub runs_dir: Option<PathBuf>,
    pub max_attempts: u32,
    pub default_timeout_secs: u64,
    pub commands: BTreeMap<String, CommandSpec>,
    pub verify_chain: Vec<String>,
    pub infra_signatures: Vec<String>,
    pub generator: GeneratorConfig,
    pub prompt: PromptConfig,
    pub context: ContextConfig,
}

/// A named verify command: either a bare shell string or a detailed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Shell(String),
    Detailed(CommandDetail),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDetail {
    pub command: String,
    #[serde(default)]
    pub tool: ToolKind,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Repo-relative working directory
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Shell command that reads a request on stdin and prints a diff
    pub command: Option<String>,
    pub timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Handlebars template file replacing the built-in prompt
    pub template: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_file_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self { max_file_chars: 120_000 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            project_root: None,
            runs_dir: None,
            max_attempts: 3,
            default_timeout_secs: 600,
            commands: BTreeMap::new(),
            verify_chain: Vec::new(),
            infra_signatures: DEFAULT_INFRA_SIGNATURES.iter().map(|s| s.to_string()).collect(),
            generator: GeneratorConfig::default(),
            prompt: PromptConfig::default(),
            context: ContextConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let project_name = env!("CARGO_PKG_NAME");
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config = Self::parse(&content)?;
        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Consistency checks that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        for name in &self.verify_chain {
            if !self.commands.contains_key(name) {
                bail!("verify_chain references unknown command '{}'", name);
            }
        }
        for (name, spec) in &self.commands {
            if spec.command().trim().is_empty() {
                bail!("command '{}' is empty", name);
            }
            if let CommandSpec::Detailed(CommandDetail { cwd: Some(cwd), .. }) = spec
                && !is_repo_relative(cwd)
            {
                bail!("command '{}' has cwd {:?} outside the repository", name, cwd);
            }
        }
        Ok(())
    }

    /// Repository root, resolved against the current directory.
    pub fn repo_root(&self, override_root: Option<&Path>) -> Result<PathBuf> {
        let root = match override_root.or(self.project_root.as_deref()) {
            Some(root) => root.to_path_buf(),
            None => std::env::current_dir().context("Failed to read current directory")?,
        };
        root.canonicalize()
            .context(format!("Repository root {} is not accessible", root.display()))
    }

    pub fn runs_dir(&self, repo_root: &Path) -> PathBuf {
        match &self.runs_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => repo_root.join(dir),
            None => repo_root.join(".devloop").join("runs"),
        }
    }

    /// The verify chain in order, with defaults filled in.
    pub fn verify_steps(&self) -> Result<Vec<VerifyStepSpec>> {
        self.verify_chain
            .iter()
            .map(|name| {
                let Some(spec) = self.commands.get(name) else {
                    bail!("verify_chain references unknown command '{}'", name);
                };
                let default_timeout = Duration::from_secs(self.default_timeout_secs);
                let step = match spec {
                    CommandSpec::Shell(command) => VerifyStepSpec::new(name, command).with_timeout(default_timeout),
                    CommandSpec::Detailed(detail) => {
                        let mut step = VerifyStepSpec::new(name, &detail.command)
                            .with_tool(detail.tool)
                            .with_timeout(detail.timeout_secs.map_or(default_timeout, Duration::from_secs));
                        if let Some(cwd) = &detail.cwd {
                            step = step.with_cwd(cwd);
                        }
                        step
                    }
                };
                Ok(step)
            })
            .collect()
    }

    /// Settings for a `DevLoop` in `repo_root`.
    pub fn devloop_config(&self, repo_root: &Path, max_attempts: Option<u32>) -> Result<DevLoopConfig> {
        let mut config = DevLoopConfig::new(repo_root, self.runs_dir(repo_root));
        config.max_attempts = max_attempts.unwrap_or(self.max_attempts);
        if config.max_attempts == 0 {
            bail!("max attempts must be at least 1");
        }
        config.max_file_chars = self.context.max_file_chars;
        config.verify_steps = self.verify_steps()?;
        config.infra_signatures = self.infra_signatures.clone();
        config.snapshot = serde_json::to_value(self).context("Failed to snapshot config")?;
        Ok(config)
    }
}

impl CommandSpec {
    pub fn command(&self) -> &str {
        match self {
            CommandSpec::Shell(command) => command,
            CommandSpec::Detailed(detail) => &detail.command,
        }
    }
}

fn is_repo_relative(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
