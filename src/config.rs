use crate::error::{Result, SyncError};
use crate::hub::WorldSettings;
use crate::tasks::Timing;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Real-time position synchronization server.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Config {
    /// Address to bind to
    #[clap(short = 'H', long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,
    /// Port to listen on
    #[clap(short, long, env = "PORT", default_value = "3000")]
    pub port: u16,
    /// Secret used to verify session tokens
    #[clap(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,
    /// JSON array of user records to seed the record store with
    #[clap(long, env = "USERS_FILE")]
    pub users_file: Option<PathBuf>,
    /// Bearer token enabling the admin record route
    #[clap(long, env = "ADMIN_TOKEN", hide_env_values = true)]
    pub admin_token: Option<String>,
    /// Movement tick interval in milliseconds
    #[clap(long, env = "TICK_MS", default_value = "16")]
    pub tick_ms: u64,
    /// Distance a player moves per tick
    #[clap(long, env = "STEP_DISTANCE", default_value = "5.0", allow_negative_numbers = true)]
    pub step: f64,
    /// Heartbeat cycle in seconds
    #[clap(long, env = "HEARTBEAT_SECS", default_value = "10")]
    pub heartbeat_secs: u64,
    /// Full-state reconciliation interval in milliseconds
    #[clap(long, env = "RECONCILE_MS", default_value = "1000")]
    pub reconcile_ms: u64,
    #[clap(long, env = "SPAWN_X", default_value = "665.3", allow_negative_numbers = true)]
    pub spawn_x: f64,
    #[clap(long, env = "SPAWN_Y", default_value = "322.4", allow_negative_numbers = true)]
    pub spawn_y: f64,
    /// Frames queued per connection before further ones are dropped
    #[clap(long, env = "OUTBOUND_BUFFER", default_value = "256")]
    pub outbound_buffer: usize,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.tick_ms == 0 || self.heartbeat_secs == 0 || self.reconcile_ms == 0 {
            return Err(SyncError::Config("intervals must be greater than zero".into()));
        }
        if !self.step.is_finite() || self.step <= 0.0 {
            return Err(SyncError::Config(format!(
                "step distance must be positive, got {}",
                self.step
            )));
        }
        if !self.spawn_x.is_finite() || !self.spawn_y.is_finite() {
            return Err(SyncError::Config("spawn position must be finite".into()));
        }
        if self.outbound_buffer == 0 {
            return Err(SyncError::Config("outbound buffer must be at least 1".into()));
        }
        if self.jwt_secret.is_empty() {
            return Err(SyncError::Config("JWT secret must not be empty".into()));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn world_settings(&self) -> WorldSettings {
        WorldSettings {
            step: self.step,
            spawn: (self.spawn_x, self.spawn_y),
            outbound_buffer: self.outbound_buffer,
        }
    }

    pub fn timing(&self) -> Timing {
        Timing {
            tick: Duration::from_millis(self.tick_ms),
            heartbeat: Duration::from_secs(self.heartbeat_secs),
            reconcile: Duration::from_millis(self.reconcile_ms),
        }
    }
}
