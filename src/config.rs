use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name of the configuration inside the config directory.
pub const CONFIG_FILE: &str = "procwarden.toml";

/// Top‑level on‑disk configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
}

/// Timing knobs handed to the supervisor at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// A process still alive after this long is considered Running.
    pub startup_timeout_ms: u64,
    /// Liveness poll interval while Starting.
    pub startup_poll_ms: u64,
    /// Liveness poll interval once Running.
    pub running_poll_ms: u64,
    /// Time between the graceful stop signal and the forced kill.
    pub stop_grace_ms: u64,
    /// Pause between the stop and start halves of a restart.
    pub restart_settle_ms: u64,
    /// Pause between services in start_all / stop_all.
    pub batch_delay_ms: u64,
    /// Pause between services in restart_all.
    pub restart_batch_delay_ms: u64,
    /// Lines of stdout/stderr kept per process.
    pub output_tail_lines: usize,
    pub restart: RestartPolicy,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 10_000,
            startup_poll_ms: 500,
            running_poll_ms: 1_000,
            stop_grace_ms: 5_000,
            restart_settle_ms: 1_000,
            batch_delay_ms: 500,
            restart_batch_delay_ms: 1_000,
            output_tail_lines: 200,
            restart: RestartPolicy::default(),
        }
    }
}

impl SupervisorSettings {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn startup_poll(&self) -> Duration {
        Duration::from_millis(self.startup_poll_ms.max(1))
    }

    pub fn running_poll(&self) -> Duration {
        Duration::from_millis(self.running_poll_ms.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn restart_batch_delay(&self) -> Duration {
        Duration::from_millis(self.restart_batch_delay_ms)
    }
}

/// Automatic restart after a crash. Off unless enabled explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub enabled: bool,
    pub delay_ms: u64,
    /// Consecutive restarts allowed before giving up on a service.
    pub max_attempts: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_ms: 1_000,
            max_attempts: 5,
        }
    }
}

impl RestartPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// On‑disk TOML description of a single service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    pub display_name: Option<String>,
    /// Executable path, relative to the config directory, or a bare command on `PATH`.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

impl ServiceDefinition {
    fn new(name: &str, display_name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            display_name: Some(display_name.to_string()),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            working_dir: None,
            env_vars: HashMap::new(),
        }
    }

    /// Turn the on-disk entry into a launchable spec.
    ///
    /// Relative paths, and arguments starting with `./` or `../`, are taken
    /// relative to `base_dir`. Without an explicit working directory the
    /// executable's own directory is used.
    pub fn resolve(&self, base_dir: &Path) -> ServiceSpec {
        let executable = resolve_executable(&self.command, base_dir);

        let args = self
            .args
            .iter()
            .map(|arg| {
                if arg.starts_with("./") || arg.starts_with("../") {
                    base_dir.join(arg).to_string_lossy().into_owned()
                } else {
                    arg.clone()
                }
            })
            .collect();

        let working_dir = match &self.working_dir {
            Some(dir) => base_dir.join(dir),
            None => executable
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| base_dir.to_path_buf()),
        };

        let mut env: Vec<(String, String)> = self
            .env_vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();

        ServiceSpec {
            display_name: self.display_name.clone().unwrap_or_else(|| self.name.clone()),
            name: self.name.clone(),
            executable,
            args,
            working_dir,
            env,
        }
    }
}

fn resolve_executable(command: &str, base_dir: &Path) -> PathBuf {
    let path = Path::new(command);
    if path.is_absolute() {
        return path.to_path_buf();
    }

    let local = base_dir.join(path);
    let bare = !command.contains('/') && !command.contains('\\');
    if bare && !local.exists() {
        if let Ok(found) = which::which(command) {
            return found;
        }
    }
    local
}

impl ServiceConfig {
    /// Read and parse a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Resolve every definition against `base_dir`, keeping file order.
    pub fn specs(&self, base_dir: &Path) -> Result<Vec<ServiceSpec>, ConfigError> {
        let specs: Vec<ServiceSpec> = self.services.iter().map(|d| d.resolve(base_dir)).collect();
        validate_specs(&specs)?;
        Ok(specs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorSettings::default(),
            services: vec![
                ServiceDefinition::new(
                    "game-server",
                    "Game Server",
                    "releases/launcher/launcher",
                    &["./releases/game/gameserver"],
                ),
                ServiceDefinition::new(
                    "dispatch",
                    "Dispatch Server",
                    "releases/launcher/launcher",
                    &["./releases/game/dispatch"],
                ),
                ServiceDefinition::new("sdk", "SDK Server", "releases/sdk/sdk-server", &[]),
            ],
        }
    }
}

/// Default config path: `<config dir>/procwarden/procwarden.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("procwarden").join(CONFIG_FILE))
}

/// Names must be non-empty and unique.
pub fn validate_specs(specs: &[ServiceSpec]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for spec in specs {
        if spec.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(ConfigError::DuplicateService(spec.name.clone()));
        }
    }
    Ok(())
}

/// Resolved launch description of one service. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    name: String,
    display_name: String,
    executable: PathBuf,
    args: Vec<String>,
    working_dir: PathBuf,
    env: Vec<(String, String)>,
}

impl ServiceSpec {
    /// Create a spec running `executable` from its own directory.
    pub fn new(name: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        let name = name.into();
        let executable = executable.into();
        let working_dir = executable
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            display_name: name.clone(),
            name,
            executable,
            args: Vec::new(),
            working_dir,
            env: Vec::new(),
        }
    }

    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> &str {
        &self.display_name
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn cwd(&self) -> &Path {
        &self.working_dir
    }

    pub fn env_vars(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn executable_exists(&self) -> bool {
        self.executable.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let cfg: ServiceConfig = toml::from_str(
            r#"
[[services]]
name = "dispatch"
command = "bin/dispatch"
"#,
        )
        .unwrap();

        assert_eq!(cfg.supervisor, SupervisorSettings::default());
        assert_eq!(cfg.services.len(), 1);
        assert!(cfg.services[0].args.is_empty());
        assert!(!cfg.supervisor.restart.enabled);
    }

    #[test]
    fn partial_supervisor_table_keeps_other_defaults() {
        let cfg: ServiceConfig = toml::from_str(
            r#"
[supervisor]
startup_timeout_ms = 250

[supervisor.restart]
enabled = true
"#,
        )
        .unwrap();

        assert_eq!(cfg.supervisor.startup_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.supervisor.stop_grace_ms, 5_000);
        assert!(cfg.supervisor.restart.enabled);
        assert_eq!(cfg.supervisor.restart.max_attempts, 5);
    }

    #[test]
    fn resolves_relative_paths_against_base_dir() {
        let def = ServiceDefinition {
            name: "game".into(),
            display_name: None,
            command: "releases/launcher/launcher".into(),
            args: vec!["./releases/game/gameserver".into(), "--verbose".into()],
            working_dir: None,
            env_vars: HashMap::new(),
        };

        let spec = def.resolve(Path::new("/srv/fleet"));
        assert_eq!(spec.executable(), Path::new("/srv/fleet/releases/launcher/launcher"));
        assert_eq!(spec.arguments()[0], "/srv/fleet/./releases/game/gameserver");
        assert_eq!(spec.arguments()[1], "--verbose");
        assert_eq!(spec.cwd(), Path::new("/srv/fleet/releases/launcher"));
        assert_eq!(spec.label(), "game");
    }

    #[test]
    fn explicit_working_dir_wins() {
        let def = ServiceDefinition {
            name: "sdk".into(),
            display_name: Some("SDK".into()),
            command: "/opt/sdk/sdk".into(),
            args: vec![],
            working_dir: Some("data".into()),
            env_vars: HashMap::from([("PORT".to_string(), "21000".to_string())]),
        };

        let spec = def.resolve(Path::new("/srv/fleet"));
        assert_eq!(spec.executable(), Path::new("/opt/sdk/sdk"));
        assert_eq!(spec.cwd(), Path::new("/srv/fleet/data"));
        assert_eq!(spec.env_vars(), &[("PORT".to_string(), "21000".to_string())]);
    }

    #[test]
    fn rejects_duplicate_and_empty_names() {
        let dup = vec![ServiceSpec::new("a", "/bin/true"), ServiceSpec::new("a", "/bin/false")];
        assert!(matches!(validate_specs(&dup), Err(ConfigError::DuplicateService(n)) if n == "a"));

        let empty = vec![ServiceSpec::new(" ", "/bin/true")];
        assert!(matches!(validate_specs(&empty), Err(ConfigError::EmptyName)));
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let raw = ServiceConfig::default().to_toml().unwrap();
        let back: ServiceConfig = toml::from_str(&raw).unwrap();
        assert_eq!(back.services.len(), 3);
        assert_eq!(back.services[1].name, "dispatch");
    }
}
