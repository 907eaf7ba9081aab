use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Runtime switches for the replication engine, mirrored from console
/// variables. All reads are lock-free so the tick path can consult them
/// per entity.
pub struct SyncVars {
    /// `onesync_enabled`: master switch; when false the engine is inert.
    enabled: AtomicBool,
    /// `onesync_distanceCulling`: culls `should_be_created` by 2D distance.
    distance_culling: AtomicBool,
    /// `onesync_radiusFrequency`: frustum + distance sync-cadence tiers.
    radius_frequency: AtomicBool,
    log_enabled: AtomicBool,
    /// `onesync_logFile`: diagnostic log path; empty disables.
    log_file: Mutex<String>,
}

impl Default for SyncVars {
    fn default() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            distance_culling: AtomicBool::new(true),
            radius_frequency: AtomicBool::new(true),
            log_enabled: AtomicBool::new(false),
            log_file: Mutex::new(String::new()),
        }
    }
}

impl SyncVars {
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    pub fn distance_culling(&self) -> bool {
        self.distance_culling.load(Ordering::Relaxed)
    }

    pub fn set_distance_culling(&self, on: bool) {
        self.distance_culling.store(on, Ordering::Relaxed);
    }

    pub fn radius_frequency(&self) -> bool {
        self.radius_frequency.load(Ordering::Relaxed)
    }

    pub fn set_radius_frequency(&self, on: bool) {
        self.radius_frequency.store(on, Ordering::Relaxed);
    }

    pub fn log_enabled(&self) -> bool {
        self.log_enabled.load(Ordering::Relaxed)
    }

    pub fn log_file(&self) -> String {
        self.log_file.lock().clone()
    }

    /// An empty path disables the diagnostic log entirely.
    pub fn set_log_file(&self, path: &str) {
        *self.log_file.lock() = path.to_owned();
        self.log_enabled.store(!path.is_empty(), Ordering::Relaxed);
    }
}
