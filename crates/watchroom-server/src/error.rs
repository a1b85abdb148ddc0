use watchroom_core::validate::ValidationError;

/// Why a room operation was refused. Every variant is reported to the
/// requester only and leaves room state untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    Validation(String),
    Permission(String),
    NotFound(String),
    Capacity(String),
    Duplicate(String),
}

impl RoomError {
    /// Taxonomy tag for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Permission(_) => "permission",
            Self::NotFound(_) => "not_found",
            Self::Capacity(_) => "capacity",
            Self::Duplicate(_) => "duplicate",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Validation(m)
            | Self::Permission(m)
            | Self::NotFound(m)
            | Self::Capacity(m)
            | Self::Duplicate(m) => m,
        }
    }
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for RoomError {}

impl From<ValidationError> for RoomError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e.to_string())
    }
}
