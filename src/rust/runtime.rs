use std::sync::OnceLock;

use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use ort::Result as OrtResult;

static ENVIRONMENT: OnceLock<Result<(), String>> = OnceLock::new();

/// Graph optimization applied when loading an extractor model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizationLevel {
    Disable,
    Basic,
    Extended,
    #[default]
    All,
}

impl From<OptimizationLevel> for GraphOptimizationLevel {
    fn from(level: OptimizationLevel) -> Self {
        match level {
            OptimizationLevel::Disable => GraphOptimizationLevel::Disable,
            OptimizationLevel::Basic => GraphOptimizationLevel::Level1,
            OptimizationLevel::Extended => GraphOptimizationLevel::Level2,
            OptimizationLevel::All => GraphOptimizationLevel::Level3,
        }
    }
}

/// ONNX Runtime settings for the feature extractor session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Threads used across independent graph nodes (0 lets ONNX Runtime decide)
    pub inter_threads: usize,
    /// Threads used inside a single node (0 lets ONNX Runtime decide)
    pub intra_threads: usize,
    pub optimization_level: OptimizationLevel,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            inter_threads: 0,
            intra_threads: 0,
            optimization_level: OptimizationLevel::All,
        }
    }
}

/// Commits the process-wide ONNX Runtime environment once. Later calls report the first outcome.
pub fn ensure_initialized() -> OrtResult<()> {
    let outcome = ENVIRONMENT.get_or_init(|| {
        ort::init()
            .with_name("teachable")
            .commit()
            .map(|_| ())
            .map_err(|e| e.to_string())
    });
    match outcome {
        Ok(()) => Ok(()),
        Err(msg) => Err(ort::Error::new(msg.clone())),
    }
}

pub fn create_session_builder(config: &RuntimeConfig) -> OrtResult<SessionBuilder> {
    ensure_initialized()?;
    let mut builder = Session::builder()?;

    if config.inter_threads > 0 {
        builder = builder.with_inter_threads(config.inter_threads)?;
    }
    if config.intra_threads > 0 {
        builder = builder.with_intra_threads(config.intra_threads)?;
    }
    builder = builder.with_optimization_level(config.optimization_level.into())?;

    Ok(builder)
}
