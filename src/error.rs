// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 错误类型
/// Error taxonomy surfaced across the host boundary
use std::time::Duration;

use thiserror::Error;

use crate::types::{FrameKey, StreamId};

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not initialized: {0}")]
    NotInitialized(String),

    #[error("backpressured: queue depth {depth} reached limit {limit}")]
    Backpressured { depth: usize, limit: usize },

    #[error("inference failed for {key}: {reason}")]
    InferenceFailed { key: FrameKey, reason: String },

    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("stream {0} stalled, restart attempts exhausted")]
    Stalled(StreamId),

    #[error("shutting down")]
    Shutdown,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("all {cores} accelerator cores are at their cap of {cap} tasks")]
    BusyAllCoresFull { cores: usize, cap: usize },
}

/// 跨边界返回的扁平错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotInitialized,
    Backpressured,
    InferenceFailed,
    CapabilityUnavailable,
    Stalled,
    Shutdown,
    NotFound,
    Timeout,
    BusyAllCoresFull,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            PipelineError::NotInitialized(_) => ErrorKind::NotInitialized,
            PipelineError::Backpressured { .. } => ErrorKind::Backpressured,
            PipelineError::InferenceFailed { .. } => ErrorKind::InferenceFailed,
            PipelineError::CapabilityUnavailable(_) => ErrorKind::CapabilityUnavailable,
            PipelineError::Stalled(_) => ErrorKind::Stalled,
            PipelineError::Shutdown => ErrorKind::Shutdown,
            PipelineError::NotFound(_) => ErrorKind::NotFound,
            PipelineError::Timeout(_) => ErrorKind::Timeout,
            PipelineError::BusyAllCoresFull { .. } => ErrorKind::BusyAllCoresFull,
        }
    }

    /// 单帧级错误在本地恢复, 不上抛给宿主
    pub fn is_per_frame(&self) -> bool {
        matches!(
            self,
            PipelineError::InferenceFailed { .. }
                | PipelineError::Backpressured { .. }
                | PipelineError::Timeout(_)
        )
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
