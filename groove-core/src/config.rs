use std::path::PathBuf;

use serde::Deserialize;

use crate::engine::CcLimits;

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    defaults: DefaultsConfig,
    #[serde(default)]
    runtime: RuntimeConfig,
}

#[derive(Deserialize, Default)]
struct DefaultsConfig {
    bpm: Option<f64>,
    ppq: Option<u32>,
    steps_per_bar: Option<u32>,
    clock_source: Option<String>,
}

#[derive(Deserialize, Default)]
struct RuntimeConfig {
    cc_per_tick_global: Option<u32>,
    cc_per_tick_track: Option<u32>,
    file_poll_interval_ms: Option<u64>,
    midi_port_retry_ms: Option<u64>,
}

pub struct Config {
    defaults: DefaultsConfig,
    runtime: RuntimeConfig,
}

impl Config {
    pub fn load() -> Self {
        let mut base: ConfigFile =
            toml::from_str(DEFAULT_CONFIG).expect("failed to parse embedded config.toml");

        if let Some(path) = user_config_path() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
                        Ok(user) => {
                            merge_defaults(&mut base.defaults, user.defaults);
                            merge_runtime(&mut base.runtime, user.runtime);
                        }
                        Err(e) => {
                            log::warn!(target: "config", "ignoring malformed config {}: {}", path.display(), e)
                        }
                    },
                    Err(e) => {
                        log::warn!(target: "config", "could not read config {}: {}", path.display(), e)
                    }
                }
            }
        }

        Config {
            defaults: base.defaults,
            runtime: base.runtime,
        }
    }

    pub fn default_bpm(&self) -> f64 {
        self.defaults.bpm.unwrap_or(120.0)
    }

    pub fn default_ppq(&self) -> u32 {
        self.defaults.ppq.unwrap_or(96)
    }

    pub fn default_steps_per_bar(&self) -> u32 {
        self.defaults.steps_per_bar.unwrap_or(16)
    }

    pub fn default_clock_source(&self) -> &str {
        self.defaults.clock_source.as_deref().unwrap_or("internal")
    }

    pub fn cc_limits(&self) -> CcLimits {
        let fallback = CcLimits::default();
        CcLimits {
            per_tick_global: self.runtime.cc_per_tick_global.unwrap_or(fallback.per_tick_global),
            per_tick_track: self.runtime.cc_per_tick_track.unwrap_or(fallback.per_tick_track),
        }
    }

    pub fn file_poll_interval_ms(&self) -> u64 {
        self.runtime.file_poll_interval_ms.unwrap_or(500)
    }

    pub fn midi_port_retry_ms(&self) -> u64 {
        self.runtime.midi_port_retry_ms.unwrap_or(1500)
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("groove").join("config.toml"))
}

fn merge_defaults(base: &mut DefaultsConfig, user: DefaultsConfig) {
    if user.bpm.is_some() {
        base.bpm = user.bpm;
    }
    if user.ppq.is_some() {
        base.ppq = user.ppq;
    }
    if user.steps_per_bar.is_some() {
        base.steps_per_bar = user.steps_per_bar;
    }
    if user.clock_source.is_some() {
        base.clock_source = user.clock_source;
    }
}

fn merge_runtime(base: &mut RuntimeConfig, user: RuntimeConfig) {
    if user.cc_per_tick_global.is_some() {
        base.cc_per_tick_global = user.cc_per_tick_global;
    }
    if user.cc_per_tick_track.is_some() {
        base.cc_per_tick_track = user.cc_per_tick_track;
    }
    if user.file_poll_interval_ms.is_some() {
        base.file_poll_interval_ms = user.file_poll_interval_ms;
    }
    if user.midi_port_retry_ms.is_some() {
        base.midi_port_retry_ms = user.midi_port_retry_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_embedded_config() {
        let config = Config::load();
        assert_eq!(config.default_bpm(), 120.0);
        assert_eq!(config.default_ppq(), 96);
        assert_eq!(config.default_clock_source(), "internal");
        assert_eq!(config.cc_limits().per_tick_global, 32);
    }
}
