use crate::core::DbError;
use crate::core::error::{SQLSTATE_OCC_DATA, SQLSTATE_OCC_SCHEMA, SQLSTATE_SERIALIZATION_FAILURE};
use std::fmt;

/// Judgment on whether a failed operation may be re-run unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictClass {
    /// Aborted by conflict detection; no partial effect persisted.
    Transient,
    /// Anything else.
    Terminal,
}

impl ConflictClass {
    #[inline]
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for ConflictClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Transient => "transient",
            Self::Terminal => "terminal",
        };
        write!(f, "{label}")
    }
}

/// Decides which errors of type `E` are retryable conflicts.
///
/// Implementations must be conservative: when in doubt, answer
/// [`ConflictClass::Terminal`].
pub trait ConflictClassifier<E: ?Sized> {
    fn classify(&self, err: &E) -> ConflictClass;
}

impl<E, F> ConflictClassifier<E> for F
where
    E: ?Sized,
    F: Fn(&E) -> ConflictClass,
{
    fn classify(&self, err: &E) -> ConflictClass {
        self(err)
    }
}

/// SQLSTATE codes treated as OCC aborts by default.
pub const DEFAULT_CONFLICT_CODES: &[&str] = &[
    SQLSTATE_OCC_DATA,
    SQLSTATE_OCC_SCHEMA,
    SQLSTATE_SERIALIZATION_FAILURE,
];

/// Classifier for PostgreSQL-compatible backends with optimistic concurrency.
///
/// The structured SQLSTATE wins whenever the server reports one. Message
/// scanning only applies to errors that arrived without a code, and only
/// matches a conflict code as a whole token.
#[derive(Debug, Clone)]
pub struct OccClassifier {
    codes: Vec<String>,
    text_fallback: bool,
}

impl Default for OccClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_CONFLICT_CODES.iter().copied())
    }
}

impl OccClassifier {
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            codes: codes.into_iter().map(Into::into).collect(),
            text_fallback: true,
        }
    }

    /// Enable or disable message scanning for code-less errors.
    pub fn with_text_fallback(mut self, enabled: bool) -> Self {
        self.text_fallback = enabled;
        self
    }

    pub fn codes(&self) -> &[String] {
        &self.codes
    }

    pub fn is_conflict_code(&self, code: &str) -> bool {
        self.codes.iter().any(|known| known.eq_ignore_ascii_case(code))
    }

    fn mentions_conflict_code(&self, text: &str) -> bool {
        text.split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| !token.is_empty() && self.is_conflict_code(token))
    }

    fn classify_parts(&self, code: Option<&str>, message: &str) -> ConflictClass {
        let transient = match code {
            Some(code) => self.is_conflict_code(code),
            None => self.text_fallback && self.mentions_conflict_code(message),
        };
        if transient {
            ConflictClass::Transient
        } else {
            ConflictClass::Terminal
        }
    }
}

impl ConflictClassifier<DbError> for OccClassifier {
    fn classify(&self, err: &DbError) -> ConflictClass {
        match err {
            DbError::Sql { code, message } => self.classify_parts(Some(code), message),
            DbError::Other(message) => self.classify_parts(None, message),
            // A dropped connection may have committed; never assume otherwise.
            DbError::Connection(_) | DbError::Decode(_) => ConflictClass::Terminal,
        }
    }
}

impl ConflictClassifier<sqlx::Error> for OccClassifier {
    fn classify(&self, err: &sqlx::Error) -> ConflictClass {
        match err {
            sqlx::Error::Database(db) => self.classify_parts(db.code().as_deref(), db.message()),
            _ => ConflictClass::Terminal,
        }
    }
}
