use crate::errors::ConfigError;

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OutpostConfig {
    pub server: ServerConfig,
    pub login: LoginConfig,
    pub shell: ShellConfig,
    pub output: OutputConfig,
    pub console: ConsoleConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub max_connections: usize,
}

#[derive(Debug, Clone)]
pub struct LoginConfig {
    pub banner: String,
    pub timeout: Duration,
    pub max_tries: u32,
}

#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub command_prefix: char,
    pub default_prompt: String,
    pub command_path: Vec<PathBuf>,
    pub reload_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub max_history_size: usize,
}

#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    pub enabled: bool,
}

impl Default for OutpostConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 4848,
                max_connections: 50,
            },
            login: LoginConfig {
                banner: "Welcome to Outpost.".to_string(),
                timeout: Duration::from_secs(600), // 10 minutes
                max_tries: 3,
            },
            shell: ShellConfig {
                command_prefix: '/',
                default_prompt: "outpost> ".to_string(),
                command_path: vec![PathBuf::from("commands")],
                reload_interval: Duration::from_secs(600),
            },
            output: OutputConfig {
                max_history_size: 10,
            },
            console: ConsoleConfig { enabled: false },
        }
    }
}

impl OutpostConfig {
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(content) => Self::parse_config(&content),
            Err(_) => {
                // Create default config file if it doesn't exist
                let default_config = Self::default();
                let config_content = default_config.to_config_file_format();
                if let Err(e) = fs::write(path, config_content) {
                    tracing::warn!("could not create default config file: {}", e);
                }
                Ok(default_config)
            }
        }
    }

    pub fn parse_config(content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let mut current_section = String::new();

        for line in content.lines() {
            let line = line.trim();

            // Skip comments and empty lines
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // Handle sections
            if line.starts_with('[') && line.ends_with(']') {
                current_section = line[1..line.len() - 1].to_string();
                continue;
            }

            // Handle key-value pairs
            if let Some(eq_pos) = line.find('=') {
                let key = line[..eq_pos].trim();
                let value = line[eq_pos + 1..].trim().trim_matches('"');

                match current_section.as_str() {
                    "server" => config.parse_server_config(key, value)?,
                    "login" => config.parse_login_config(key, value)?,
                    "shell" => config.parse_shell_config(key, value)?,
                    "output" => config.parse_output_config(key, value)?,
                    "console" => config.parse_console_config(key, value)?,
                    _ => return Err(ConfigError::UnknownSection(current_section.clone())),
                }
            }
        }

        Ok(config)
    }

    fn parse_server_config(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "bind_address" => self.server.bind_address = value.to_string(),
            "port" => {
                self.server.port = value
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue(key.to_string(), value.to_string()))?;
            }
            "max_connections" => {
                self.server.max_connections = value
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue(key.to_string(), value.to_string()))?;
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    fn parse_login_config(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "banner" => self.login.banner = value.to_string(),
            "timeout" => {
                let seconds: u64 = value
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue(key.to_string(), value.to_string()))?;
                self.login.timeout = Duration::from_secs(seconds);
            }
            "max_tries" => {
                self.login.max_tries = value
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue(key.to_string(), value.to_string()))?;
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    fn parse_shell_config(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "command_prefix" => {
                let mut chars = value.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => self.shell.command_prefix = c,
                    _ => {
                        return Err(ConfigError::InvalidValue(
                            key.to_string(),
                            value.to_string(),
                        ));
                    }
                }
            }
            "default_prompt" => self.shell.default_prompt = value.to_string(),
            "command_path" => {
                self.shell.command_path = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect();
                if self.shell.command_path.is_empty() {
                    return Err(ConfigError::InvalidValue(
                        key.to_string(),
                        value.to_string(),
                    ));
                }
            }
            "reload_interval" => {
                let seconds: u64 = value
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue(key.to_string(), value.to_string()))?;
                self.shell.reload_interval = Duration::from_secs(seconds);
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    fn parse_output_config(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "max_history_size" => {
                self.output.max_history_size = value
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue(key.to_string(), value.to_string()))?;
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    fn parse_console_config(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "enabled" => {
                self.console.enabled = value
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue(key.to_string(), value.to_string()))?;
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    fn to_config_file_format(&self) -> String {
        format!(
            r#"# Outpost server configuration
# Lines starting with # are comments

[server]
# Network configuration
bind_address = "{}"
port = {}
max_connections = {}

[login]
# Greeting shown before the username prompt
banner = "{}"
# Seconds before an unauthenticated connection is dropped
timeout = {}
max_tries = {}

[shell]
# Single character that introduces a command
command_prefix = "{}"
default_prompt = "{}"
# Comma-separated directories searched for *.cmd files
command_path = "{}"
# Seconds between automatic command file rescans
reload_interval = {}

[output]
# Output lines kept for reconnection replay
max_history_size = {}

[console]
# Attach a session to the host terminal
enabled = {}
"#,
            self.server.bind_address,
            self.server.port,
            self.server.max_connections,
            self.login.banner,
            self.login.timeout.as_secs(),
            self.login.max_tries,
            self.shell.command_prefix,
            self.shell.default_prompt,
            self.shell
                .command_path
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(","),
            self.shell.reload_interval.as_secs(),
            self.output.max_history_size,
            self.console.enabled,
        )
    }
}
