use engine_session::{EngineConfig, EngineFamily, MarkerProfile};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Bridge config (figment-deserialized from defaults / engine-bridge.toml / env)
// =============================================================================
//
//   engine-bridge.toml:   [engines.eleeye]
//                         binary = "/opt/engines/eleeye"
//
//   env var:              ENGINE_BRIDGE_ENGINES__ELEEYE__BINARY=/opt/engines/eleeye
//                         (double underscore = nesting)

/// Default config file name, resolved against the working directory
pub const DEFAULT_CONFIG_FILE: &str = "engine-bridge.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "ENGINE_BRIDGE_";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default)]
    pub engines: EnginesFileConfig,
}

/// Session tunables shared by every engine (lives under `[session]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_queue_high_water")]
    pub queue_high_water: usize,
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: default_shutdown_grace_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            queue_high_water: default_queue_high_water(),
            max_line_len: default_max_line_len(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// One section per engine family (`[engines.challenger]`, ...).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EnginesFileConfig {
    #[serde(default)]
    pub challenger: EngineFileConfig,
    #[serde(default)]
    pub eleeye: EngineFileConfig,
    #[serde(default)]
    pub pikafish: EngineFileConfig,
}

impl EnginesFileConfig {
    pub fn get(&self, family: EngineFamily) -> &EngineFileConfig {
        match family {
            EngineFamily::Challenger => &self.challenger,
            EngineFamily::Eleeye => &self.eleeye,
            EngineFamily::Pikafish => &self.pikafish,
        }
    }

    pub fn get_mut(&mut self, family: EngineFamily) -> &mut EngineFileConfig {
        match family {
            EngineFamily::Challenger => &mut self.challenger,
            EngineFamily::Eleeye => &mut self.eleeye,
            EngineFamily::Pikafish => &mut self.pikafish,
        }
    }
}

/// Launch settings and optional marker overrides for one engine family.
///
/// Unset marker lists fall back to the family's built-in profile.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EngineFileConfig {
    /// Engine executable; defaults to the family name looked up on PATH
    #[serde(default)]
    pub binary: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub handshake: Option<Vec<String>>,
    #[serde(default)]
    pub ready_markers: Option<Vec<String>>,
    #[serde(default)]
    pub thinking_start_markers: Option<Vec<String>>,
    #[serde(default)]
    pub thinking_end_markers: Option<Vec<String>>,
    #[serde(default)]
    pub think_commands: Option<Vec<String>>,
    /// Empty string disables the quit command
    #[serde(default)]
    pub quit_command: Option<String>,
}

impl EngineFileConfig {
    fn profile(&self, family: EngineFamily) -> MarkerProfile {
        let mut profile = family.profile();
        if let Some(v) = &self.handshake {
            profile.handshake = v.clone();
        }
        if let Some(v) = &self.ready_markers {
            profile.ready_markers = v.clone();
        }
        if let Some(v) = &self.thinking_start_markers {
            profile.thinking_start_markers = v.clone();
        }
        if let Some(v) = &self.thinking_end_markers {
            profile.thinking_end_markers = v.clone();
        }
        if let Some(v) = &self.think_commands {
            profile.think_commands = v.clone();
        }
        if let Some(quit) = &self.quit_command {
            profile.quit_command = Some(quit.clone()).filter(|q| !q.trim().is_empty());
        }
        profile
    }
}

fn default_shutdown_grace_ms() -> u64 {
    3000
}
fn default_write_timeout_ms() -> u64 {
    3000
}
fn default_queue_high_water() -> usize {
    1024
}
fn default_max_line_len() -> usize {
    4096
}
fn default_event_capacity() -> usize {
    256
}

/// Build a figment that layers: defaults → config file → ENGINE_BRIDGE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `ENGINE_BRIDGE_SESSION__SHUTDOWN_GRACE_MS=500`  →  `session.shutdown_grace_ms = 500`
pub fn load_config(config_path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

impl FileConfig {
    /// Runtime view for one engine family
    pub fn engine_config(&self, family: EngineFamily) -> EngineConfig {
        let engine = self.engines.get(family);
        EngineConfig {
            program: engine
                .binary
                .clone()
                .filter(|b| !b.trim().is_empty())
                .unwrap_or_else(|| family.as_str().to_string()),
            args: engine.args.clone(),
            working_dir: engine.working_dir.clone(),
            env: engine.env.clone(),
            profile: engine.profile(family),
            shutdown_grace: Duration::from_millis(self.session.shutdown_grace_ms),
            write_timeout: Duration::from_millis(self.session.write_timeout_ms),
            queue_high_water: self.session.queue_high_water,
            max_line_len: self.session.max_line_len,
            event_capacity: self.session.event_capacity,
        }
    }
}
