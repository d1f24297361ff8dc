//! # llamactl
//!
//! Control plane for a fleet of local LLM inference servers. Each instance
//! is a supervised child process (llama.cpp or MLX based) exposed behind a
//! single OpenAI-compatible HTTP endpoint; requests are routed by their
//! `model` field, starting instances on demand under a global running cap
//! with idle reaping and LRU eviction.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       llamactl                          │
//! │  ┌───────────────────────────────────────────────────┐  │
//! │  │ Router (/v1/*)                                    │  │
//! │  │ - Extracts model from request                     │  │
//! │  │ - Starts instance on demand (admission/eviction)  │  │
//! │  │ - Waits for readiness, then reverse-proxies       │  │
//! │  └───────────────────────────────────────────────────┘  │
//! │                          │                              │
//! │  ┌───────────────────────────────────────────────────┐  │
//! │  │ Registry + Lifecycle                              │  │
//! │  │ - name → Instance map, persistence                │  │
//! │  │ - global cap, LRU eviction, idle sweeper          │  │
//! │  └───────────────────────────────────────────────────┘  │
//! │                          │                              │
//! │  ┌───────────────────────────────────────────────────┐  │
//! │  │ Instance supervisors                              │  │
//! │  │ - spawn / log capture / crash-restart             │  │
//! │  └───────────────────────────────────────────────────┘  │
//! │      ┌───────────────────┼───────────────────┐          │
//! │      ▼                   ▼                   ▼          │
//! │  [llama:18001]      [llama:18002]       [mlx:18003]     │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod api;
pub mod backend;
mod config;
mod instance;
mod lifecycle;
mod proxy;
mod registry;
mod router;
pub mod telemetry;

pub use config::{Config, InstancesConfig};
pub use instance::{
    Instance, InstanceError, InstanceOptions, InstanceOptionsRequest, InstanceStatus, StartGuard,
};
pub use lifecycle::IdleSweeper;
pub use proxy::ProxyTarget;
pub use registry::{Registry, RegistryError};
pub use router::RouterState;

use anyhow::Result;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Build the complete llamactl stack.
///
/// Restores persisted instances, optionally restarts the ones that were
/// running at last persist, spawns the idle sweeper, and wires the
/// inference router and management API into one axum [`Router`].
///
/// Returns the router and the registry (for shutdown handling).
pub async fn build_app(config: Config) -> Result<(Router, Arc<Registry>)> {
    let registry = Arc::new(Registry::new(config.instances.clone())?);

    let previously_running = registry.restore().await?;
    if config.instances.restore_last_state {
        for name in previously_running {
            info!(instance = %name, "Restoring previously running instance");
            if let Err(e) = registry.start_instance(&name).await {
                warn!(instance = %name, error = %e, "Failed to restore instance");
            }
        }
    }

    let sweeper = IdleSweeper::new(
        Arc::clone(&registry),
        Duration::from_secs(config.instances.sweep_interval_seconds),
    );
    let _sweeper_handle = sweeper.spawn();

    let app = Router::new()
        .merge(router::routes(RouterState::new(
            Arc::clone(&registry),
            &config,
        )))
        .nest("/api/v1", api::routes(Arc::clone(&registry)));

    Ok((app, registry))
}
