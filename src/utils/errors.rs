use std::path::{Path, PathBuf};
use thiserror::Error;

/// File location attached to a failure, when the failing stage knows it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub file_path: Option<PathBuf>,
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub code_snippet: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_location(mut self, line: usize, column: usize) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    pub fn with_snippet(mut self, snippet: String) -> Self {
        self.code_snippet = Some(snippet);
        self
    }
}

/// Every failure the engine can produce.
///
/// The type is `Clone` because a deduplicated file request hands the same
/// outcome to every concurrent requester.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KilnError {
    #[error("Cannot resolve '{request}'{}: {reason}", from_suffix(.from))]
    Resolution {
        request: String,
        from: Option<PathBuf>,
        reason: String,
    },

    #[error("Transform failed in {component}{}: {message}", context_suffix(.context))]
    Transform {
        component: String,
        message: String,
        context: ErrorContext,
    },

    #[error("Chunk dependency cycle detected at chunk '{chunk}'")]
    ChunkCycle { chunk: String },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("IO error{}: {message}", at_suffix(.path))]
    Io {
        path: Option<PathBuf>,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Build error: {0}")]
    Build(String),
}

fn from_suffix(from: &Option<PathBuf>) -> String {
    from.as_deref()
        .map(|p| format!(" from {}", p.display()))
        .unwrap_or_default()
}

fn at_suffix(path: &Option<PathBuf>) -> String {
    path.as_deref()
        .map(|p| format!(" at {}", p.display()))
        .unwrap_or_default()
}

fn context_suffix(context: &ErrorContext) -> String {
    let mut out = at_suffix(&context.file_path);
    if let Some(line) = context.line {
        out.push_str(&format!(":{}", line));
        if let Some(column) = context.column {
            out.push_str(&format!(":{}", column));
        }
    }
    out
}

impl KilnError {
    pub fn resolution(request: impl Into<String>, from: Option<&Path>, reason: impl Into<String>) -> Self {
        Self::Resolution {
            request: request.into(),
            from: from.map(Path::to_path_buf),
            reason: reason.into(),
        }
    }

    pub fn transform(component: impl Into<String>, path: &Path, message: impl Into<String>) -> Self {
        Self::Transform {
            component: component.into(),
            message: message.into(),
            context: ErrorContext::new().with_file(path.to_path_buf()),
        }
    }

    pub fn io(path: &Path, err: std::io::Error) -> Self {
        Self::Io {
            path: Some(path.to_path_buf()),
            message: err.to_string(),
        }
    }

    pub fn build(message: impl Into<String>) -> Self {
        Self::Build(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Attach the failing file to an error that was raised without one
    pub fn with_file(self, path: &Path) -> Self {
        match self {
            Self::Transform { component, message, mut context } => {
                if context.file_path.is_none() {
                    context.file_path = Some(path.to_path_buf());
                }
                Self::Transform { component, message, context }
            }
            Self::Io { path: None, message } => Self::Io {
                path: Some(path.to_path_buf()),
                message,
            },
            other => other,
        }
    }

    /// The file this error is attributed to, if any
    pub fn file_path(&self) -> Option<&Path> {
        match self {
            Self::Resolution { from, .. } => from.as_deref(),
            Self::Transform { context, .. } => context.file_path.as_deref(),
            Self::Io { path, .. } => path.as_deref(),
            _ => None,
        }
    }

    /// Format error with enhanced context display
    pub fn format_detailed(&self) -> String {
        match self {
            KilnError::Transform { component, message, context } => {
                Self::format_error_with_context(&format!("Transform Error ({})", component), message, context)
            }
            _ => self.to_string(),
        }
    }

    fn format_error_with_context(error_type: &str, message: &str, ctx: &ErrorContext) -> String {
        let mut output = format!("❌ {}: {}", error_type, message);

        if let Some(ref file_path) = ctx.file_path {
            output.push_str(&format!("\n📁 File: {}", file_path.display()));
        }

        match (ctx.line, ctx.column) {
            (Some(line), Some(column)) => {
                output.push_str(&format!("\n📍 Location: line {}, column {}", line, column));
            }
            (Some(line), None) => output.push_str(&format!("\n📍 Location: line {}", line)),
            _ => {}
        }

        if let Some(ref snippet) = ctx.code_snippet {
            output.push_str(&format!("\n📝 Code:\n{}", Self::format_code_snippet(snippet, ctx.line)));
        }

        output
    }

    fn format_code_snippet(snippet: &str, error_line: Option<usize>) -> String {
        let mut output = String::new();

        for (i, line) in snippet.lines().enumerate() {
            let line_num = i + 1;
            if error_line == Some(line_num) {
                output.push_str(&format!("→ {:3} │ {}\n", line_num, line));
                output.push_str(&format!("     │ {}\n", "^^^".repeat(line.len().min(20))));
            } else {
                output.push_str(&format!("  {:3} │ {}\n", line_num, line));
            }
        }

        output
    }
}

pub type Result<T> = std::result::Result<T, KilnError>;

impl From<std::io::Error> for KilnError {
    fn from(err: std::io::Error) -> Self {
        KilnError::Io {
            path: None,
            message: err.to_string(),
        }
    }
}

impl From<regex::Error> for KilnError {
    fn from(err: regex::Error) -> Self {
        KilnError::config(format!("Regex error: {}", err))
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::config(format!("JSON error: {}", err))
    }
}

impl From<anyhow::Error> for KilnError {
    fn from(err: anyhow::Error) -> Self {
        KilnError::build(format!("{:#}", err))
    }
}
