use std::path::{Path, PathBuf};

use crate::config::{ConfigError, TownConfig};
use crate::routes::{Routes, RoutesError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("routes: {0}")]
    Routes(#[from] RoutesError),
}

// ---------------------------------------------------------------------------
// TownEnv
// ---------------------------------------------------------------------------

/// Request-scoped environment: town root, the prefix -> rig map, and the
/// dispatch config snapshot.
///
/// Loaded once at the request boundary and passed explicitly; there are no
/// process-wide singletons.
#[derive(Debug, Clone)]
pub struct TownEnv {
    pub town_root: PathBuf,
    pub routes: Routes,
    pub config: TownConfig,
}

impl TownEnv {
    pub fn load(town_root: impl Into<PathBuf>) -> Result<Self, EnvError> {
        let town_root = town_root.into();
        let routes = Routes::load(&town_root)?;
        let config = TownConfig::load(&town_root)?;
        Ok(Self {
            town_root,
            routes,
            config,
        })
    }

    /// Build an env from already-loaded parts (tests, embedders).
    pub fn with_parts(town_root: impl Into<PathBuf>, routes: Routes, config: TownConfig) -> Self {
        Self {
            town_root: town_root.into(),
            routes,
            config,
        }
    }

    /// `true` when slings go through the deferred queue instead of direct
    /// dispatch.
    pub fn deferred_dispatch(&self) -> bool {
        self.config.dispatch.max_polecats > 0
    }

    pub fn town_root(&self) -> &Path {
        &self.town_root
    }
}
