//! Error kinds for the coupler runtime.
//!
//! Errors during `init`/plan build are always fatal: no partial
//! [`crate::plan::RoutingPlan`] is ever exposed. Errors during a transfer
//! window fail that window; the coupler does not retry or attempt
//! partial-progress recovery because the peer components have already
//! advanced their own state.

use thiserror::Error;

/// A single error record: kind, message, and the grid/peer/timestep context
/// in effect when it was raised.
#[derive(Error, Debug)]
pub enum CouplerError {
    #[error("config error{}: {message}", context_suffix(.context))]
    Config {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error("io error{}: {message}", context_suffix(.context))]
    Io {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error("format error{}: {message}", context_suffix(.context))]
    Format {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error("topology error{}: {message}", context_suffix(.context))]
    Topology {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error("shape error{}: {message}", context_suffix(.context))]
    Shape {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error("protocol error{}: {message}", context_suffix(.context))]
    Protocol {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error("transport error{}: {message}", context_suffix(.context))]
    Transport {
        message: String,
        context: Option<ErrorContext>,
    },
}

/// Grid/peer/timestep context attached to an error, so a failure report
/// names where and when it happened, not just what kind it was.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub grid: Option<String>,
    pub peer_rank: Option<usize>,
    pub timestep: Option<i64>,
}

impl ErrorContext {
    pub fn grid(name: impl Into<String>) -> Self {
        Self {
            grid: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, rank: usize) -> Self {
        self.peer_rank = Some(rank);
        self
    }

    pub fn with_timestep(mut self, timestep: i64) -> Self {
        self.timestep = Some(timestep);
        self
    }
}

fn context_suffix(context: &Option<ErrorContext>) -> String {
    match context {
        None => String::new(),
        Some(ctx) => {
            let mut parts = Vec::new();
            if let Some(grid) = &ctx.grid {
                parts.push(format!("grid={grid}"));
            }
            if let Some(peer) = ctx.peer_rank {
                parts.push(format!("peer={peer}"));
            }
            if let Some(ts) = ctx.timestep {
                parts.push(format!("timestep={ts}"));
            }
            if parts.is_empty() {
                String::new()
            } else {
                format!(" [{}]", parts.join(", "))
            }
        }
    }
}

macro_rules! ctor {
    ($name:ident, $variant:ident) => {
        pub fn $name(message: impl Into<String>) -> Self {
            Self::$variant {
                message: message.into(),
                context: None,
            }
        }
    };
}

impl CouplerError {
    ctor!(config, Config);
    ctor!(io, Io);
    ctor!(format, Format);
    ctor!(topology, Topology);
    ctor!(shape, Shape);
    ctor!(protocol, Protocol);
    ctor!(transport, Transport);

    /// Attach grid/peer/timestep context to an already-constructed error.
    pub fn with_context(self, context: ErrorContext) -> Self {
        macro_rules! attach {
            ($($variant:ident),*) => {
                match self {
                    $(Self::$variant { message, .. } => Self::$variant {
                        message,
                        context: Some(context),
                    },)*
                }
            };
        }
        attach!(Config, Io, Format, Topology, Shape, Protocol, Transport)
    }

    /// The process exit code for this error's kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } | Self::Topology { .. } => 1,
            Self::Io { .. } | Self::Format { .. } => 2,
            Self::Protocol { .. } | Self::Shape { .. } => 3,
            Self::Transport { .. } => 4,
        }
    }
}

impl From<std::io::Error> for CouplerError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

impl From<serde_yaml::Error> for CouplerError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::config(e.to_string())
    }
}

impl From<csv::Error> for CouplerError {
    fn from(e: csv::Error) -> Self {
        Self::format(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CouplerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_spec_table() {
        assert_eq!(CouplerError::config("x").exit_code(), 1);
        assert_eq!(CouplerError::topology("x").exit_code(), 1);
        assert_eq!(CouplerError::io("x").exit_code(), 2);
        assert_eq!(CouplerError::format("x").exit_code(), 2);
        assert_eq!(CouplerError::protocol("x").exit_code(), 3);
        assert_eq!(CouplerError::shape("x").exit_code(), 3);
        assert_eq!(CouplerError::transport("x").exit_code(), 4);
    }

    #[test]
    fn context_is_rendered_in_message() {
        let err = CouplerError::topology("overlap detected")
            .with_context(ErrorContext::grid("ocean").with_peer(3).with_timestep(12));
        let rendered = err.to_string();
        assert!(rendered.contains("grid=ocean"));
        assert!(rendered.contains("peer=3"));
        assert!(rendered.contains("timestep=12"));
    }
}
