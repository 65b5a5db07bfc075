//! # Starshard
//!
//! The concurrency, session, and economic-consistency core behind a multi-channel
//! chat-bot game platform: one shared ledger of "star shard" currency and player level,
//! a passive-message correlator, a generic per-game session registry with a turn-based
//! interaction engine, three stake-based mini-game cores (Blackjack, Mines, One-Stroke),
//! a red-envelope engine, a mail dispatcher, and channel membership tracking.
//!
//! ## Module Organization
//!
//! - [`error`] - the crate-wide error type and its stable error-kind strings
//! - [`config`] - TOML configuration loading, defaults, and validation
//! - [`logutil`] - single-line log sanitization for user-supplied text
//! - [`ledger`] - the monetary ledger: balance, level, nicknames, transactions (C1)
//! - [`correlator`] - the passive-message correlator (C2)
//! - [`session`] - the generic session registry and turn engine (C3, C4)
//! - [`games`] - Blackjack, Mines, and One-Stroke cores (C5-C7)
//! - [`redenvelope`] - the red-envelope engine (C8)
//! - [`mail`] - direct, broadcast, and scheduled mail (C9)
//! - [`channels`] - channel membership tracking (C10)
//! - [`commands`] - the text-command dispatch table (§6)
//! - [`scheduler`] - background job wiring for the periodic sweeps

pub mod channels;
pub mod commands;
pub mod config;
pub mod correlator;
pub mod error;
pub mod games;
pub mod ledger;
pub mod logutil;
pub mod mail;
pub mod redenvelope;
pub mod scheduler;
pub mod session;
