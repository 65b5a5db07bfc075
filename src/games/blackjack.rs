//! Blackjack Core (C5).
//!
//! Grounded on `original_source/plugins/blackjack/{models,session,handlers}.py` for the
//! state-machine shape (deal, split offer, player turn, dealer turn, settle, first-game-
//! today bonus) and on `src/bbs/session.rs` for the general "session struct holds
//! per-connection state" idiom. The six-deck shoe and its per-channel reshuffle critical
//! section follow the concurrency contract in spec.md §5 exactly: the reshuffle decision
//! and the opening two-card deal are one critical section under a channel-scoped lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use rusqlite::params;
use tokio::sync::Mutex;

use crate::error::{Result, StarshardError};
use crate::games::GameStore;
use crate::ledger::Ledger;
use crate::session::{SessionRegistry, TurnHandle};

const DECKS: usize = 6;
const SHOE_CAPACITY: usize = DECKS * 52;
const RESHUFFLE_THRESHOLD: usize = SHOE_CAPACITY / 4; // 25% of 312 = 78
const SPLIT_OFFER_TIMEOUT: Duration = Duration::from_secs(60);
const TURN_TIMEOUT: Duration = Duration::from_secs(30);

/// One blackjack card's point value: 2..10 face, J/Q/K = 10, A = 11 (reduced greedily).
pub type CardValue = u8;

fn fresh_shoe_values() -> Vec<CardValue> {
    let mut cards = Vec::with_capacity(SHOE_CAPACITY);
    for _ in 0..DECKS {
        for _suit in 0..4 {
            for rank in 1..=13u8 {
                let value = match rank {
                    1 => 11,
                    11..=13 => 10,
                    n => n,
                };
                cards.push(value);
            }
        }
    }
    let mut rng = rand::thread_rng();
    cards.shuffle(&mut rng);
    cards
}

/// Per-channel shoe: six decks, reshuffled under 25% remaining.
pub struct Shoe {
    cards: Vec<CardValue>,
}

impl Shoe {
    fn new() -> Self {
        Shoe {
            cards: fresh_shoe_values(),
        }
    }

    fn needs_reshuffle(&self) -> bool {
        self.cards.len() < RESHUFFLE_THRESHOLD
    }

    fn reshuffle(&mut self) {
        self.cards = fresh_shoe_values();
    }

    /// Dealing pops from the back of the shuffled vector.
    fn draw(&mut self) -> CardValue {
        self.cards.pop().expect("shoe reshuffles before exhaustion")
    }
}

/// Hard-total-with-soft-ace valuation: sum the cards with aces at 11, then drop aces to 1
/// one at a time while the total exceeds 21.
pub fn hand_value(cards: &[CardValue]) -> i64 {
    let mut total: i64 = cards.iter().map(|&c| c as i64).sum();
    let mut aces_at_eleven = cards.iter().filter(|&&c| c == 11).count();
    while total > 21 && aces_at_eleven > 0 {
        total -= 10;
        aces_at_eleven -= 1;
    }
    total
}

fn is_natural(cards: &[CardValue]) -> bool {
    cards.len() == 2 && hand_value(cards) == 21
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandOutcome {
    Win,
    Blackjack,
    Push,
    Bust,
    Surrender,
    Timeout,
}

impl HandOutcome {
    fn as_str(self) -> &'static str {
        match self {
            HandOutcome::Win => "win",
            HandOutcome::Blackjack => "blackjack",
            HandOutcome::Push => "push",
            HandOutcome::Bust => "bust",
            HandOutcome::Surrender => "surrender",
            HandOutcome::Timeout => "timeout",
        }
    }
}

/// One finished hand's settlement.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub outcome: HandOutcome,
    pub winnings: i64,
    pub is_split: bool,
}

/// The per-session payload held by the blackjack `SessionRegistry`.
pub struct BlackjackSession {
    pub channel_id: String,
    pub bet: i64,
    pub created_at: i64,
}

pub struct BlackjackCore {
    ledger: Ledger,
    store: GameStore,
    sessions: SessionRegistry<BlackjackSession>,
    shoes: Arc<Mutex<HashMap<String, Arc<Mutex<Shoe>>>>>,
}

impl BlackjackCore {
    pub fn new(
        data_dir: &std::path::Path,
        ledger: Ledger,
        sessions: SessionRegistry<BlackjackSession>,
    ) -> Result<Self> {
        let store = GameStore::open(
            data_dir,
            "blackjack",
            "CREATE TABLE IF NOT EXISTS blackjack_games (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                bet_amount INTEGER NOT NULL,
                result TEXT NOT NULL,
                winnings INTEGER NOT NULL,
                is_split INTEGER NOT NULL,
                timestamp INTEGER NOT NULL
            );",
        )?;
        Ok(BlackjackCore {
            ledger,
            store,
            sessions,
            shoes: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn channel_shoe(&self, channel_id: &str) -> Arc<Mutex<Shoe>> {
        let mut shoes = self.shoes.lock().await;
        shoes
            .entry(channel_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Shoe::new())))
            .clone()
    }

    fn has_won_today_already(&self, user_id: &str) -> Result<bool> {
        let today_start = Utc::now().date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp();
        self.store.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM blackjack_games WHERE user_id = ?1 AND winnings > 0 AND timestamp >= ?2",
                params![user_id, today_start],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    fn record_result(&self, user_id: &str, bet: i64, settlement: &Settlement) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO blackjack_games (user_id, bet_amount, result, winnings, is_split, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    user_id,
                    bet,
                    settlement.outcome.as_str(),
                    settlement.winnings,
                    settlement.is_split as i64,
                    Utc::now().timestamp(),
                ],
            )?;
            Ok(())
        })
    }

    /// Credit/debit the net winnings for one finished hand and persist the result row,
    /// applying the first-game-today bonus (one-shot doubling of positive winnings) on
    /// the user's first positive settlement of the calendar day.
    ///
    /// The bet itself was already debited in `play()`; what's returned to the user is the
    /// gross payout `bet + winnings` (a push returns exactly the bet, a surrender returns
    /// half of it, a win returns the bet plus its winnings), not `winnings` alone.
    fn settle_hand(&self, user_id: &str, bet: i64, mut settlement: Settlement) -> Result<Settlement> {
        if settlement.winnings > 0 {
            let already_won_today = self.has_won_today_already(user_id)?;
            if !already_won_today {
                settlement.winnings *= 2;
            }
        }
        let payout = bet + settlement.winnings;
        if payout > 0 {
            self.ledger.add(user_id, payout, "blackjack")?;
        }
        self.record_result(user_id, bet, &settlement)?;
        Ok(settlement)
    }

    /// Drive one full blackjack session to completion: debit the bet, deal, offer a
    /// split, run the player/dealer turns, settle, and tear down the session. Returns the
    /// settlement(s) (one, or two if a split happened).
    pub async fn play(&self, user_id: &str, channel_id: &str, bet: i64) -> Result<Vec<Settlement>> {
        if bet < 1 {
            return Err(StarshardError::InvalidAmount("bet must be >= 1".to_string()));
        }
        if self.sessions.is_in_game(user_id).await {
            return Err(StarshardError::AlreadyInGame);
        }
        let user = self.ledger.get_user(user_id)?;
        if user.balance < bet {
            return Err(StarshardError::InsufficientBalance);
        }
        self.ledger.cost(user_id, bet, "blackjack")?;

        let (_session, mut turn) = match self
            .sessions
            .start_session(
                user_id,
                channel_id,
                BlackjackSession {
                    channel_id: channel_id.to_string(),
                    bet,
                    created_at: Utc::now().timestamp(),
                },
            )
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                self.ledger.add(user_id, bet, "blackjack_refund")?;
                return Err(e);
            }
        };

        let result = self.play_inner(user_id, channel_id, bet, &mut turn).await;
        self.sessions.end_session(user_id).await;
        result
    }

    async fn play_inner(
        &self,
        user_id: &str,
        channel_id: &str,
        bet: i64,
        turn: &mut TurnHandle,
    ) -> Result<Vec<Settlement>> {
        let shoe = self.channel_shoe(channel_id).await;

        // Reshuffle decision and opening deal are one critical section so two users
        // cannot start from the same pre-reshuffle deck.
        let (mut player, mut dealer) = {
            let mut shoe = shoe.lock().await;
            if shoe.needs_reshuffle() {
                shoe.reshuffle();
                turn.emit("牌靴已重新洗牌 (shoe reshuffled)");
            }
            let player = vec![shoe.draw(), shoe.draw()];
            let dealer = vec![shoe.draw(), shoe.draw()];
            (player, dealer)
        };

        if hand_value(&player) == 21 {
            let settlement = if hand_value(&dealer) == 21 {
                Settlement {
                    outcome: HandOutcome::Push,
                    winnings: 0,
                    is_split: false,
                }
            } else {
                Settlement {
                    outcome: HandOutcome::Blackjack,
                    winnings: (bet * 3) / 2,
                    is_split: false,
                }
            };
            let settled = self.settle_hand(user_id, bet, settlement)?;
            return Ok(vec![settled]);
        }

        let mut hands: Vec<(Vec<CardValue>, bool)> = vec![(player.clone(), false)];
        let mut extra_bet_total = 0i64;

        if player.len() == 2 && player[0] == player[1] {
            match turn.ask("两张点数相同，是否分牌? (y/n)", SPLIT_OFFER_TIMEOUT).await {
                Ok(message) if message.text.trim().eq_ignore_ascii_case("y") => {
                    let user = self.ledger.get_user(user_id)?;
                    if user.balance >= bet {
                        self.ledger.cost(user_id, bet, "blackjack_split")?;
                        extra_bet_total += bet;
                        let mut shoe = shoe.lock().await;
                        let card = player.pop().unwrap();
                        let mut hand_a = vec![player[0], shoe.draw()];
                        let mut hand_b = vec![card, shoe.draw()];
                        std::mem::swap(&mut hand_a, &mut player);
                        hands = vec![(player.clone(), true), (hand_b.clone(), true)];
                        let _ = hand_b;
                    } else {
                        turn.emit("余额不足，无法分牌");
                    }
                }
                _ => {}
            }
        }

        // `None` means the hand stood and awaits the dealer; `Some` means it already
        // settled on its own (bust, surrender, or timeout) and needs no dealer comparison.
        let mut settlements: Vec<Option<Settlement>> = Vec::new();
        let mut doubled_flags: Vec<bool> = vec![false; hands.len()];

        for (index, (hand, is_split)) in hands.iter_mut().enumerate() {
            let hand_bet = bet;
            let mut doubled = false;
            let mut busted = false;
            let mut surrendered = false;
            let mut timed_out = false;

            loop {
                if hand_value(hand) >= 21 {
                    break;
                }
                let allow_double = !*is_split && hand.len() == 2;
                let prompt = if allow_double {
                    format!("第{}手牌 {:?} (h=要牌 s=停牌 d=加倍 q=投降)", index + 1, hand)
                } else {
                    format!("第{}手牌 {:?} (h=要牌 s=停牌 q=投降)", index + 1, hand)
                };
                let message = match turn.ask(prompt, TURN_TIMEOUT).await {
                    Ok(m) => m,
                    Err(StarshardError::Timeout) => {
                        timed_out = true;
                        break;
                    }
                    Err(e) => return Err(e),
                };
                match message.text.trim().to_lowercase().as_str() {
                    "h" => {
                        let mut shoe = shoe.lock().await;
                        hand.push(shoe.draw());
                        if hand_value(hand) > 21 {
                            busted = true;
                            break;
                        }
                    }
                    "s" => break,
                    "d" if allow_double => {
                        let bal = self.ledger.get_user(user_id)?;
                        if bal.balance < hand_bet {
                            turn.emit("余额不足，无法加倍");
                            continue;
                        }
                        self.ledger.cost(user_id, hand_bet, "blackjack_double")?;
                        extra_bet_total += hand_bet;
                        doubled = true;
                        let mut shoe = shoe.lock().await;
                        hand.push(shoe.draw());
                        if hand_value(hand) > 21 {
                            busted = true;
                        }
                        break;
                    }
                    "q" => {
                        surrendered = true;
                        break;
                    }
                    _ => {
                        turn.emit("无效输入");
                    }
                }
            }

            let effective_bet = if doubled { hand_bet * 2 } else { hand_bet };
            doubled_flags[index] = doubled;

            if timed_out {
                let settled = self.settle_hand(
                    user_id,
                    hand_bet,
                    Settlement {
                        outcome: HandOutcome::Timeout,
                        winnings: -hand_bet,
                        is_split: *is_split,
                    },
                )?;
                settlements.push(Some(settled));
            } else if surrendered {
                let settled = self.settle_hand(
                    user_id,
                    hand_bet,
                    Settlement {
                        outcome: HandOutcome::Surrender,
                        winnings: -((hand_bet + 1) / 2),
                        is_split: *is_split,
                    },
                )?;
                settlements.push(Some(settled));
            } else if busted {
                let settled = self.settle_hand(
                    user_id,
                    hand_bet,
                    Settlement {
                        outcome: HandOutcome::Bust,
                        winnings: -effective_bet,
                        is_split: *is_split,
                    },
                )?;
                settlements.push(Some(settled));
            } else {
                // Stands; awaits the dealer. Carry the effective bet (doubled or not) in
                // place via a zero-winnings placeholder that the dealer phase overwrites.
                settlements.push(None);
            }
        }

        if settlements.iter().all(|s| s.is_some()) {
            let _ = extra_bet_total;
            return Ok(settlements.into_iter().flatten().collect());
        }

        // Dealer turn: draw until total >= 17.
        {
            let mut shoe = shoe.lock().await;
            while hand_value(&dealer) < 17 {
                dealer.push(shoe.draw());
            }
        }
        let dealer_value = hand_value(&dealer);
        let dealer_bust = dealer_value > 21;

        let mut final_settlements = Vec::with_capacity(settlements.len());
        for (index, settlement) in settlements.into_iter().enumerate() {
            if let Some(settled) = settlement {
                final_settlements.push(settled);
                continue;
            }
            let (hand, is_split) = &hands[index];
            let player_value = hand_value(hand);
            let effective_bet = if doubled_flags[index] { bet * 2 } else { bet };
            let winnings = if dealer_bust || player_value > dealer_value {
                effective_bet
            } else if player_value < dealer_value {
                -effective_bet
            } else {
                0
            };
            // The spec's result enum has no separate "lose to dealer without busting"
            // variant; a non-bust loss is recorded as `bust` since only that variant
            // carries negative winnings outside surrender/timeout.
            let outcome = if winnings > 0 {
                HandOutcome::Win
            } else if winnings < 0 {
                HandOutcome::Bust
            } else {
                HandOutcome::Push
            };
            let settled = self.settle_hand(
                user_id,
                bet,
                Settlement {
                    outcome,
                    winnings,
                    is_split: *is_split,
                },
            )?;
            final_settlements.push(settled);
        }

        Ok(final_settlements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ace_reduces_greedily_when_busting() {
        assert_eq!(hand_value(&[11, 9]), 20);
        assert_eq!(hand_value(&[11, 9, 5]), 15);
        assert_eq!(hand_value(&[11, 11]), 12);
        assert_eq!(hand_value(&[11, 11, 9]), 21);
    }

    #[test]
    fn natural_is_detected_on_two_cards_totalling_21() {
        assert!(is_natural(&[11, 10]));
        assert!(!is_natural(&[11, 10, 0]));
    }

    #[test]
    fn shoe_reshuffles_under_quarter_capacity() {
        let mut shoe = Shoe::new();
        while shoe.cards.len() > RESHUFFLE_THRESHOLD {
            shoe.draw();
        }
        assert!(shoe.needs_reshuffle());
        shoe.reshuffle();
        assert_eq!(shoe.cards.len(), SHOE_CAPACITY);
    }

    #[test]
    fn fresh_shoe_has_six_decks_worth_of_cards() {
        assert_eq!(fresh_shoe_values().len(), SHOE_CAPACITY);
    }
}
