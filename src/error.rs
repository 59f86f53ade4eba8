use derive_more::From;

/// Errors raised while building or walking the subject matcher.
#[derive(Debug, From, PartialEq, Eq)]
pub enum MatcherError {
    /// `>` used anywhere but as the final token.
    FullWildcardNotTerminal,
    /// Consecutive dots, or a leading/trailing dot.
    EmptyToken,
    /// A subject with no tokens at all.
    EmptySubject,
    /// Attempted to publish to a pattern containing `*` or `>`.
    WildcardInPublish,
}

impl std::fmt::Display for MatcherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            MatcherError::FullWildcardNotTerminal => "'>' wildcard must be the last token",
            MatcherError::EmptyToken => "empty token in subject",
            MatcherError::EmptySubject => "empty subject",
            MatcherError::WildcardInPublish => "wildcard not allowed in publish subject",
        };
        write!(f, "{}", msg)
    }
}

/// Errors raised by account-scoped operations.
#[derive(Debug, From)]
pub enum AccountError {
    Matcher(MatcherError),
    /// Removal attempted while subscriptions are still present.
    NotEmpty,
}

impl std::fmt::Display for AccountError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountError::Matcher(e) => write!(f, "{}", e),
            AccountError::NotEmpty => write!(f, "account still has active subscriptions"),
        }
    }
}

/// Errors surfaced to a client or route connection and rendered as `-ERR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    ParseError(String),
    UnknownProtocolOperation,
    AuthorizationViolation,
    SlowConsumer,
    MaxPayloadExceeded,
    MaxSubscriptionsExceeded,
    MaxControlLineExceeded,
    InvalidSubject,
    DuplicateSubscription,
    StaleConnection,
    LameDuckMode,
}

impl ProtocolError {
    /// The exact reason string the wire protocol sends after `-ERR `.
    pub fn reason(&self) -> String {
        match self {
            ProtocolError::ParseError(s) => format!("Parse Error '{}'", s),
            ProtocolError::UnknownProtocolOperation => "Unknown Protocol Operation".to_string(),
            ProtocolError::AuthorizationViolation => "Authorization Violation".to_string(),
            ProtocolError::SlowConsumer => "Slow Consumer".to_string(),
            ProtocolError::MaxPayloadExceeded => "Maximum Payload Violation".to_string(),
            ProtocolError::MaxSubscriptionsExceeded => "Maximum Subscriptions Exceeded".to_string(),
            ProtocolError::MaxControlLineExceeded => "Maximum Control Line Exceeded".to_string(),
            ProtocolError::InvalidSubject => "Invalid Subject".to_string(),
            ProtocolError::DuplicateSubscription => "Duplicate Subscription".to_string(),
            ProtocolError::StaleConnection => "Stale Connection".to_string(),
            ProtocolError::LameDuckMode => "Server Is In Lame Duck Mode".to_string(),
        }
    }

    /// Whether this error closes the connection after the `-ERR` is flushed.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolError::InvalidSubject | ProtocolError::DuplicateSubscription)
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason())
    }
}

/// Cluster-level errors: logged, never sent over the wire verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    ClusterNameMismatch { ours: String, theirs: String },
    DialFailed(String),
}

impl std::fmt::Display for ClusterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterError::ClusterNameMismatch { ours, theirs } => write!(
                f,
                "cluster name \"{}\" does not match \"{}\"",
                theirs, ours
            ),
            ClusterError::DialFailed(addr) => write!(f, "dial to {} failed", addr),
        }
    }
}

/// Fatal configuration errors. The process exits before accepting traffic.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("lame duck grace period ({grace:?}) must be strictly less than duration ({duration:?})")]
    LameDuckGraceNotLessThanDuration {
        grace: std::time::Duration,
        duration: std::time::Duration,
    },
    #[error("server name must not contain whitespace: {0:?}")]
    ServerNameHasWhitespace(String),
    #[error("invalid listen address: {0}")]
    InvalidAddress(String),
}

/// Top level error returned from the binary's `main`.
#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("startup validation failed: {0}")]
    Config(#[from] ConfigError),
    #[error("fatal runtime error: {0}")]
    Runtime(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Matches the exit codes named in the external-interfaces contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            ServerError::Config(_) => 1,
            ServerError::Runtime(_) | ServerError::Io(_) => 2,
        }
    }
}
