//! Settings shared by all subcommands.
//!
//! Values come from an optional toml file, then from `SPINDLE_*`
//! environment variables, then from command line arguments, each layer
//! overriding the previous one.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use spindle::machine::DEFAULT_PORT;
use spindle::Machine;
use spindle_net::{ClientConfig, CompressionPolicy, Encoding, Secret, ServerConfig, SocketConfig};

pub const CONFIG_FILE: &str = "spindle.toml";
pub const ENV_PREFIX: &str = "SPINDLE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub port: u16,
    pub secret: String,
    /// Connection attempts per call
    pub trials: u32,
    /// Time limit for a single call, all attempts included
    pub timeout_ms: u64,
    pub cpu: Option<usize>,
    pub gpu: Option<usize>,
    pub job_dir: Option<PathBuf>,
    /// One of `bincode`, `msgpack` or `json`, the latter two only if
    /// built with the matching feature
    pub encoding: Option<String>,
    /// `none`, `all` or `only_larger_than:<bytes>`
    pub compression: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            secret: String::new(),
            trials: 5,
            timeout_ms: 10_000,
            cpu: None,
            gpu: None,
            job_dir: None,
            encoding: None,
            compression: None,
        }
    }
}

impl Settings {
    /// Loads settings from the file, if given or present in the working
    /// directory, and applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(CONFIG_FILE).is_file() => Self::from_file(Path::new(CONFIG_FILE))?,
            None => Self::default(),
        };
        settings.apply_vars(std::env::vars())?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed reading settings from {}", path.display()))?;
        let settings = toml::from_str(&content)
            .with_context(|| format!("failed parsing settings at {}", path.display()))?;
        debug!("loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Applies `SPINDLE_*` variables, ignoring everything else.
    pub fn apply_vars<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let name = match key.strip_prefix(ENV_PREFIX) {
                Some(name) => name,
                None => continue,
            };
            let parsed = match name {
                "PORT" => value.parse::<u16>().map(|v| self.port = v).map_err(|e| e.to_string()),
                "SECRET" => {
                    self.secret = value.clone();
                    Ok(())
                }
                "TRIALS" => value.parse::<u32>().map(|v| self.trials = v).map_err(|e| e.to_string()),
                "TIMEOUT_MS" => value
                    .parse::<u64>()
                    .map(|v| self.timeout_ms = v)
                    .map_err(|e| e.to_string()),
                "CPU" => value
                    .parse::<usize>()
                    .map(|v| self.cpu = Some(v))
                    .map_err(|e| e.to_string()),
                "GPU" => value
                    .parse::<usize>()
                    .map(|v| self.gpu = Some(v))
                    .map_err(|e| e.to_string()),
                "JOB_DIR" => {
                    self.job_dir = Some(PathBuf::from(&value));
                    Ok(())
                }
                "ENCODING" => value
                    .parse::<Encoding>()
                    .map(|_| self.encoding = Some(value.clone()))
                    .map_err(|e| e.to_string()),
                "COMPRESSION" => value
                    .parse::<CompressionPolicy>()
                    .map(|_| self.compression = Some(value.clone()))
                    .map_err(|e| e.to_string()),
                // worker variables and the like
                _ => continue,
            };
            if let Err(e) = parsed {
                return Err(anyhow::Error::msg(format!("invalid {}: {}", key, e)));
            }
        }
        Ok(())
    }

    /// Socket options, clients and servers must agree on these.
    pub fn socket_config(&self) -> Result<SocketConfig> {
        let mut config = SocketConfig::default();
        if let Some(encoding) = &self.encoding {
            config.encoding = encoding
                .parse()
                .with_context(|| format!("invalid encoding: {}", encoding))?;
        }
        if let Some(compression) = &self.compression {
            config.compression = compression
                .parse()
                .with_context(|| format!("invalid compression: {}", compression))?;
        }
        Ok(config)
    }

    pub fn client_config(&self) -> Result<ClientConfig> {
        Ok(ClientConfig {
            secret: Secret::new(&self.secret),
            trials: self.trials,
            timeout: Duration::from_millis(self.timeout_ms),
            socket: self.socket_config()?,
            ..ClientConfig::default()
        })
    }

    pub fn server_config(&self) -> Result<ServerConfig> {
        let mut config = ServerConfig {
            address: format!("0.0.0.0:{}", self.port),
            secret: Secret::new(&self.secret),
            cpu: self.cpu,
            gpu: self.gpu,
            socket: self.socket_config()?,
            ..ServerConfig::default()
        };
        if let Some(dir) = &self.job_dir {
            config.job_dir = dir.clone();
        }
        Ok(config)
    }

    /// Server on this machine, at the configured port.
    pub fn local_machine(&self) -> Machine {
        Machine::local(self.port)
    }

    /// Parses a machine, filling in the configured port if missing.
    pub fn machine(&self, s: &str) -> Result<Machine> {
        let s = s.trim();
        let has_port = if s.starts_with('[') {
            s.contains("]:")
        } else {
            s.contains(':')
        };
        let mut machine: Machine = s.parse()?;
        if !has_port {
            machine.port = self.port;
        }
        Ok(machine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn env_overrides_file() {
        let mut settings: Settings = toml::from_str("port = 3000\nsecret = \"abc\"\ncpu = 2").unwrap();
        settings
            .apply_vars(vars(&[
                ("SPINDLE_PORT", "4000"),
                ("SPINDLE_GPU", "1"),
                ("SPINDLE_WORKER_SLOT", "3"),
                ("HOME", "/root"),
            ]))
            .unwrap();
        assert_eq!(settings.port, 4000);
        assert_eq!(settings.secret, "abc");
        assert_eq!(settings.cpu, Some(2));
        assert_eq!(settings.gpu, Some(1));
        assert_eq!(settings.trials, 5);
    }

    #[test]
    fn invalid_values_are_reported() {
        let mut settings = Settings::default();
        let err = settings
            .apply_vars(vars(&[("SPINDLE_TRIALS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("SPINDLE_TRIALS"));
    }

    #[test]
    fn socket_options_reach_both_configs() {
        let mut settings: Settings = toml::from_str("compression = \"all\"").unwrap();
        settings
            .apply_vars(vars(&[("SPINDLE_ENCODING", "bincode")]))
            .unwrap();
        let client = settings.client_config().unwrap();
        let server = settings.server_config().unwrap();
        assert_eq!(client.socket.compression, CompressionPolicy::Everything);
        assert_eq!(server.socket.compression, CompressionPolicy::Everything);
        assert_eq!(server.socket.encoding, Encoding::Bincode);

        assert!(settings
            .apply_vars(vars(&[("SPINDLE_COMPRESSION", "sometimes")]))
            .is_err());
        settings.encoding = Some("yaml".to_string());
        assert!(settings.client_config().is_err());
    }

    #[test]
    fn missing_port_is_filled_in() {
        let settings = Settings {
            port: 4000,
            ..Settings::default()
        };
        assert_eq!(settings.machine("10.0.0.1").unwrap(), Machine::new("10.0.0.1", 4000));
        assert_eq!(settings.machine("10.0.0.1:5").unwrap(), Machine::new("10.0.0.1", 5));
    }
}
