use std::{
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Result;

use crate::retention::{RetentionPolicy, DEFAULT_RETENTION};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub image_dir: PathBuf,
    pub retention: RetentionPolicy,
    pub step_delay: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_raw =
            env::var("FLUX_API_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_normalized = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        let bind_addr = bind_normalized
            .parse::<SocketAddr>()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 3000)));

        let public_dir =
            PathBuf::from(env::var("FLUX_API_PUBLIC_DIR").unwrap_or_else(|_| "public".to_string()));

        let retention_seconds = env::var("FLUX_API_RETENTION_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETENTION);

        let retention = match env::var("FLUX_API_RETENTION_POLICY") {
            Ok(raw) => RetentionPolicy::parse(&raw, retention_seconds)?,
            Err(_) => RetentionPolicy::Timed(retention_seconds),
        };

        let step_delay = env::var("FLUX_API_STEP_DELAY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::ZERO);

        let mut config = Self::for_public_dir(&public_dir);
        config.bind_addr = bind_addr;
        config.retention = retention;
        config.step_delay = step_delay;
        Ok(config)
    }

    /// Defaults rooted at `public_dir`, with artifacts under `public_dir/images`.
    pub fn for_public_dir(public_dir: &Path) -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            image_dir: public_dir.join("images"),
            retention: RetentionPolicy::default(),
            step_delay: Duration::ZERO,
        }
    }
}
