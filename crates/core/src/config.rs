use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/post-finder.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout_secs: u64,
    /// Records requested per page.
    pub page_limit: u32,
    /// Largest `limit` the remote accepts.
    pub max_page_size: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://hypnohub.net".to_string(),
            user_agent: concat!("post-finder/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_secs: 30,
            page_limit: 200,
            max_page_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub delay_ms: u64,
    pub heavy_delay_ms: u64,
    /// Batches longer than this earn the heavy delay before the next call.
    pub heavy_threshold: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            delay_ms: 2_000,
            heavy_delay_ms: 5_000,
            heavy_threshold: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Attempts per sync before a transient failure is reported.
    pub max_attempts: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Chance that `hot` hands out a random record instead of the best one.
    pub hot_random_chance: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            hot_random_chance: 0.25,
        }
    }
}

pub fn load(path: Option<&str>) -> anyhow::Result<AppConfig> {
    let mut settings = config::Config::builder();
    if let Some(p) = path {
        settings = settings.add_source(config::File::with_name(p));
    } else {
        settings = settings.add_source(config::File::with_name("config/default").required(false));
    }
    settings = settings.add_source(config::Environment::with_prefix("FINDER").separator("__"));
    let cfg = settings.build()?;
    Ok(cfg.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(
                "[rate_limit]\ndelay_ms = 10\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.rate_limit.delay_ms, 10);
        assert_eq!(cfg.rate_limit.heavy_threshold, 100);
        assert_eq!(cfg.remote.page_limit, 200);
        assert!((cfg.selector.hot_random_chance - 0.25).abs() < f64::EPSILON);
    }
}
