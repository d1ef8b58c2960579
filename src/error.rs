//! Error types for the trimming engine
//!
//! Every variant is fatal to a mining session except where noted. The
//! `closing` flag is not an error and never produces one.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T, E = TrimError> = std::result::Result<T, E>;

/// Failures raised while sizing, acquiring, building or running the trimmer
#[derive(Error, Debug)]
pub enum TrimError {
    /// The configuration is out of range or sizes a resource to zero
    #[error("Invalid trimming configuration: {0}")]
    Config(String),

    /// Enumeration worked but no device passed the capability filters
    #[error("No compatible GPU found{}", format_hint(.hint))]
    NoDevice {
        /// Remediation hint, when one can be derived
        hint: Option<String>,
    },

    /// Device enumeration itself failed
    #[error("Getting GPUs failed: {0}")]
    Enumeration(String),

    /// Shader compilation or pipeline creation failed
    #[error("Building program for the GPU failed: {stage}\n{log}")]
    PipelineBuild {
        /// Which build step failed
        stage: String,
        /// Diagnostic text reported by the device
        log: String,
    },

    /// A device buffer could not be allocated
    #[error("Allocating memory on the GPU failed: {0}")]
    Allocation(String),

    /// A submitted command stream reported an error
    #[error("Running program on the GPU failed: {0}")]
    Dispatch(String),

    /// Mapping a survival bitmap for host reads failed
    #[error("Getting result from the GPU failed: {0}")]
    Map(String),

    /// The downstream consumer rejected a trimmed graph
    #[error("Trimming consumer failed: {0}")]
    Consumer(#[source] anyhow::Error),

    /// A job was driven through an illegal state transition
    #[error("Invalid job state transition: {from:?} -> {to:?}")]
    InvalidState {
        /// Current state
        from: crate::scheduler::JobState,
        /// Requested state
        to: crate::scheduler::JobState,
    },
}

fn format_hint(hint: &Option<String>) -> String {
    hint.as_ref().map(|h| format!(" ({h})")).unwrap_or_default()
}

impl TrimError {
    /// Shorthand for configuration failures
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_device_message_includes_hint() {
        let err = TrimError::NoDevice {
            hint: Some("try LOCAL_RAM_KILOBYTES=32".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "No compatible GPU found (try LOCAL_RAM_KILOBYTES=32)"
        );

        let bare = TrimError::NoDevice { hint: None };
        assert_eq!(bare.to_string(), "No compatible GPU found");
    }

    #[test]
    fn test_pipeline_build_surfaces_log() {
        let err = TrimError::PipelineBuild {
            stage: "compiling trimming kernels".to_string(),
            log: "error: unknown identifier `foo`".to_string(),
        };
        let text = err.to_string();
        assert!(text.starts_with("Building program for the GPU failed"));
        assert!(text.contains("unknown identifier"));
    }
}
