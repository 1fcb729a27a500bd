use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid job configuration or misuse of a builder (e.g. mutating a pipeline after `run`).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A control call timed out, failed at the transport layer, or returned a non-200 status.
    #[error(
        "remote call failed: {what}\n  host: {host}\n  port: {port}\n  endpoint: {endpoint}\n  {detail}"
    )]
    RemoteCall {
        what: String,
        host: String,
        port: u16,
        endpoint: String,
        detail: String,
    },

    #[error("not found: {what}\n  path: {path}")]
    NotFound { what: String, path: String },

    #[error("{label} failed!\n{messages}")]
    Pipeline { label: String, messages: String },

    /// The first failure of an attempt, plus cleanup calls that failed after it.
    #[error("{primary}\n  cleanup also failed:{}", format_cleanup(.cleanup))]
    Cleanup {
        primary: Box<Error>,
        cleanup: Vec<Error>,
    },

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Other(msg.into())
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::Configuration(msg.into())
    }

    /// The error that terminated the attempt, looking through attached cleanup failures.
    pub fn primary(&self) -> &Error {
        match self {
            Error::Cleanup { primary, .. } => primary.primary(),
            other => other,
        }
    }

    pub fn is_remote_call(&self) -> bool {
        matches!(self.primary(), Error::RemoteCall { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.primary(), Error::NotFound { .. })
    }

    pub fn is_pipeline(&self) -> bool {
        matches!(self.primary(), Error::Pipeline { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self.primary(), Error::Configuration(_))
    }
}

fn format_cleanup(errs: &[Error]) -> String {
    let mut out = String::new();
    for e in errs {
        out.push_str("\n  - ");
        out.push_str(&e.to_string().replace('\n', "\n    "));
    }
    out
}

pub type Result<T> = std::result::Result<T, Error>;
