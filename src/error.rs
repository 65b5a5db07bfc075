//! Crate-wide error type.
//!
//! Every fallible core operation (ledger, game core, envelope, mail) returns
//! [`StarshardError`]. Command handlers at the dispatch boundary convert a variant into
//! the human-facing string; the variant itself is the contract named in the external
//! error-kind list.

use thiserror::Error;

/// Errors surfaced by the Starshard core.
#[derive(Debug, Error)]
pub enum StarshardError {
    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("already in game")]
    AlreadyInGame,

    #[error("not in game")]
    NotInGame,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("expired")]
    Expired,

    #[error("already claimed")]
    AlreadyClaimed,

    #[error("empty")]
    Empty,

    #[error("timeout")]
    Timeout,

    #[error("duplicate nickname")]
    DuplicateNickname,

    #[error("nickname too long")]
    NicknameTooLong,

    /// Admin-only: `Ledger::set` would otherwise take a balance negative.
    #[error("overdraft on set")]
    OverdraftOnSet,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StarshardError {
    /// The stable error-kind string named in the external interface contract, independent
    /// of the exact display text (which may be localized at the dispatch boundary).
    pub fn kind(&self) -> &'static str {
        match self {
            StarshardError::InsufficientBalance => "insufficient_balance",
            StarshardError::InvalidAmount(_) => "invalid_amount",
            StarshardError::InvalidArgument(_) => "invalid_argument",
            StarshardError::AlreadyInGame => "already_in_game",
            StarshardError::NotInGame => "not_in_game",
            StarshardError::NotFound(_) => "not_found",
            StarshardError::Expired => "expired",
            StarshardError::AlreadyClaimed => "already_claimed",
            StarshardError::Empty => "empty",
            StarshardError::Timeout => "timeout",
            StarshardError::DuplicateNickname => "duplicate_nickname",
            StarshardError::NicknameTooLong => "nickname_too_long",
            StarshardError::OverdraftOnSet => "overdraft_on_set",
            StarshardError::Internal(_) => "internal_error",
            StarshardError::Sqlite(_) => "internal_error",
            StarshardError::Io(_) => "internal_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, StarshardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_regardless_of_message() {
        assert_eq!(StarshardError::InsufficientBalance.kind(), "insufficient_balance");
        assert_eq!(
            StarshardError::InvalidAmount("x".into()).kind(),
            "invalid_amount"
        );
        assert_eq!(StarshardError::Empty.kind(), "empty");
    }
}
