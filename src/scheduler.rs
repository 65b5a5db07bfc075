//! Background job wiring, matching `src/bbs/dispatch.rs::start_scheduler`'s idiom of one
//! `tokio::spawn` per periodic concern rather than a single monolithic loop.

use crate::channels::ChannelMembers;
use crate::correlator::{self, Correlator};
use crate::mail::{self, MailDispatcher};
use crate::redenvelope::{self, RedEnvelopeEngine};

/// Spawn every background job this crate runs: the passive-message correlator sweep,
/// the red-envelope expiry sweep, and the scheduled-mail dispatch + daily cleanup.
/// Channel membership has no periodic job of its own; it is updated inline on inbound
/// events.
pub fn spawn_background_jobs(
    correlator: Correlator,
    red_envelopes: RedEnvelopeEngine,
    mail: MailDispatcher,
    _channels: &ChannelMembers,
) -> Vec<tokio::task::JoinHandle<()>> {
    vec![
        correlator::spawn_sweeper(correlator),
        redenvelope::spawn_expiry_sweeper(red_envelopes),
        mail::spawn_mail_jobs(mail),
    ]
}
