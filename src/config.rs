//! Runtime configuration.

use std::time::Duration;

/// Which backend to instantiate. Chosen from configuration at startup;
/// unavailable kinds (not compiled in) fail initialization cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Software simulation of the full contract; no GPU required.
    Headless,
    /// Cross-platform middleware backend.
    Wgpu,
    /// Low-level command-list backend.
    Vulkan,
}

#[derive(Debug, Clone)]
pub struct RhiConfig {
    pub backend: BackendKind,
    pub vsync: bool,
    /// How many frames may be recorded ahead of the GPU. Clamped to [1, 3].
    pub frames_in_flight: usize,
    pub clear_color: [f32; 4],
    /// Upper bound on any single fence wait; exceeding it is treated as
    /// device loss.
    pub fence_timeout: Duration,
}

impl Default for RhiConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Headless,
            vsync: true,
            frames_in_flight: 2,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            fence_timeout: Duration::from_secs(5),
        }
    }
}

impl RhiConfig {
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn frames_in_flight_clamped(&self) -> usize {
        self.frames_in_flight.clamp(1, 3)
    }
}
