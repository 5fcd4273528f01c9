use pixelcast_core::Config;

const DOCUMENTATION: &str = r#"# Pixelcast configuration. You may edit this file, but be aware that formatting and comments will not
# be preserved. Missing keys take their default values.

# [creation]      parallelism, processing_timeout_ms, monitor_period_ms
# [cache]         policy = "dynamic" | "persistent", tick_period_ms, idle_threshold_ticks
# [distribution]  tick_period_ms, rate_limit (frames per viewer per tick, negative for unlimited),
#                 connect_grace_ticks, send_workers
# [limits]        max_width, max_height (in surfaces), max_source_bytes, max_frames
# [animation]     ms_per_tick

"#;

#[must_use]
pub fn preferences_dir() -> Option<std::path::PathBuf> {
    let mut base_dir = dirs::preference_dir()?;
    base_dir.push(env!("CARGO_PKG_NAME"));
    Some(base_dir)
}

/// Where resources are stored, unless overridden by `PIXELCAST_DATA`.
#[must_use]
pub fn data_dir() -> std::path::PathBuf {
    if let Some(dir) = std::env::var_os("PIXELCAST_DATA") {
        return dir.into();
    }
    let mut base_dir = dirs::data_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
    base_dir.push(env!("CARGO_PKG_NAME"));
    base_dir
}

pub struct Settings {
    failed_to_load: bool,
    pub config: Config,
}
impl Settings {
    const FILENAME: &'static str = "config.toml";
    /// Load the user's config, or defaults if it's missing or broken.
    #[must_use]
    pub fn load() -> Self {
        let mut dir = preferences_dir();
        match dir.as_mut() {
            None => Self::no_path(),
            Some(dir) => {
                dir.push(Self::FILENAME);
                Self::load_or_default(dir)
            }
        }
    }
    #[must_use]
    pub fn no_path() -> Self {
        log::warn!("Config wasn't available, defaulting.");
        Self {
            failed_to_load: true,
            config: Config::default(),
        }
    }
    #[must_use]
    fn load_or_default(path: &std::path::Path) -> Self {
        let config: anyhow::Result<Config> = try_block::try_block! {
            let string = std::fs::read_to_string(path)?;
            let config : Config = toml::from_str(&string)?;
            config.validate()?;

            Ok(config)
        };

        match config {
            Ok(config) => Self {
                failed_to_load: false,
                config,
            },
            Err(e) => {
                log::debug!("Couldn't read {path:?}: {e:#}");
                Self::no_path()
            }
        }
    }
    /// Return true if the defaults are in use because the user's file couldn't be read.
    #[must_use]
    pub fn did_fail_to_load(&self) -> bool {
        self.failed_to_load
    }
    /// Write the config out, documented, if there isn't a file yet.
    pub fn save_if_missing(&self) -> anyhow::Result<()> {
        let mut preferences =
            preferences_dir().ok_or_else(|| anyhow::anyhow!("No preferences dir found"))?;
        // Explicity do *not* create recursively. If not found, the user probably has a good reason.
        let _ = std::fs::DirBuilder::new().create(&preferences);

        preferences.push(Self::FILENAME);
        if preferences.exists() {
            return Ok(());
        }
        let string = DOCUMENTATION.to_owned() + &toml::ser::to_string_pretty(&self.config)?;
        std::fs::write(preferences, string)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let string = toml::ser::to_string_pretty(&Config::default()).unwrap();
        let config: Config = toml::from_str(&string).unwrap();
        assert_eq!(config, Config::default());
    }
    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str("[distribution]\nrate_limit = -1\n").unwrap();
        assert_eq!(config.distribution.rate_limit, -1);
        assert_eq!(config.cache, Config::default().cache);
    }
}
