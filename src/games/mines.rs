//! Mines Core (C6): Minesweeper-style "探险".
//!
//! Grounded directly on `original_source/plugins/mines/{models,session}.py`: a 5x5
//! field, a running multiplier computed from the hypergeometric probability of having
//! revealed `k` safe cells out of `m` mines in `25` total, and a `GameManager` whose
//! `is_in_game`/`start_game`/`end_game` shape maps onto this crate's
//! `SessionRegistry`/`TurnHandle` pair.

use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use rusqlite::params;

use crate::error::{Result, StarshardError};
use crate::games::GameStore;
use crate::ledger::Ledger;
use crate::session::{SessionRegistry, TurnHandle};

const GRID_SIZE: usize = 25;
const HOUSE_EDGE: f64 = 0.03;
const TURN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cell {
    Empty,
    Mine,
    EmptyShown,
    MineShown,
}

pub struct Field {
    cells: Vec<Cell>,
    mines: usize,
}

impl Field {
    pub fn new(mines: usize) -> Self {
        let mut cells = vec![Cell::Empty; GRID_SIZE];
        let mut positions: Vec<usize> = (0..GRID_SIZE).collect();
        let mut rng = rand::thread_rng();
        positions.shuffle(&mut rng);
        for &position in positions.iter().take(mines) {
            cells[position] = Cell::Mine;
        }
        Field { cells, mines }
    }

    pub fn reveal(&mut self, index: usize) -> Cell {
        let cell = self.cells[index];
        self.cells[index] = match cell {
            Cell::Mine => Cell::MineShown,
            _ => Cell::EmptyShown,
        };
        cell
    }

    pub fn reveal_all_mines(&mut self) {
        for cell in self.cells.iter_mut() {
            if *cell == Cell::Mine {
                *cell = Cell::MineShown;
            }
        }
    }

    pub fn safe_cells(&self) -> usize {
        GRID_SIZE - self.mines
    }
}

fn choose(n: u64, k: u64) -> f64 {
    if k > n {
        return 0.0;
    }
    let k = k.min(n - k);
    let mut result = 1.0f64;
    for i in 0..k {
        result *= (n - i) as f64;
        result /= (i + 1) as f64;
    }
    result
}

/// `mul = (C(25-m,k)/C(25,k))^{-1} * (1 - house_edge)` for `k` revealed safe cells out of
/// `m` mines in 25 total cells.
pub fn multiplier(mines: usize, revealed: usize) -> f64 {
    if revealed == 0 {
        return 1.0;
    }
    let total_gems = (GRID_SIZE - mines) as u64;
    let prob = choose(total_gems, revealed as u64) / choose(GRID_SIZE as u64, revealed as u64);
    (1.0 / prob) * (1.0 - HOUSE_EDGE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinesOutcome {
    Win,
    Lose,
    Cashout,
    Timeout,
}

impl MinesOutcome {
    fn as_str(self) -> &'static str {
        match self {
            MinesOutcome::Win => "win",
            MinesOutcome::Lose => "lose",
            MinesOutcome::Cashout => "cashout",
            MinesOutcome::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MinesSettlement {
    pub outcome: MinesOutcome,
    pub winnings: i64,
    pub revealed_count: usize,
}

pub struct MinesSession {
    pub channel_id: String,
    pub bet: i64,
    pub field: Field,
    pub mines: usize,
    pub revealed: std::collections::HashSet<usize>,
}

pub struct MinesCore {
    ledger: Ledger,
    store: GameStore,
    sessions: SessionRegistry<MinesSession>,
}

impl MinesCore {
    pub fn new(
        data_dir: &std::path::Path,
        ledger: Ledger,
        sessions: SessionRegistry<MinesSession>,
    ) -> Result<Self> {
        let store = GameStore::open(
            data_dir,
            "mines",
            "CREATE TABLE IF NOT EXISTS mines_games (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                bet_amount INTEGER NOT NULL,
                mines INTEGER NOT NULL,
                revealed_count INTEGER NOT NULL,
                result TEXT NOT NULL,
                winnings INTEGER NOT NULL,
                timestamp INTEGER NOT NULL
            );",
        )?;
        Ok(MinesCore { ledger, store, sessions })
    }

    fn record_result(
        &self,
        user_id: &str,
        bet: i64,
        mines: usize,
        revealed_count: usize,
        settlement: &MinesSettlement,
    ) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO mines_games (user_id, bet_amount, mines, revealed_count, result, winnings, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    user_id,
                    bet,
                    mines as i64,
                    revealed_count as i64,
                    settlement.outcome.as_str(),
                    settlement.winnings,
                    Utc::now().timestamp(),
                ],
            )?;
            Ok(())
        })
    }

    /// Drive one mines session: debit the bet, loop accepting reveal/cashout input, and
    /// settle on mine-hit, full clear, cashout, or timeout.
    pub async fn play(&self, user_id: &str, channel_id: &str, bet: i64, mines: usize) -> Result<MinesSettlement> {
        if bet < 1 {
            return Err(StarshardError::InvalidAmount("bet must be >= 1".to_string()));
        }
        if !(1..=24).contains(&mines) {
            return Err(StarshardError::InvalidArgument("mines must be in 1..=24".to_string()));
        }
        if self.sessions.is_in_game(user_id).await {
            return Err(StarshardError::AlreadyInGame);
        }
        let user = self.ledger.get_user(user_id)?;
        if user.balance < bet {
            return Err(StarshardError::InsufficientBalance);
        }
        self.ledger.cost(user_id, bet, "mines")?;

        let (session, mut turn) = match self
            .sessions
            .start_session(
                user_id,
                channel_id,
                MinesSession {
                    channel_id: channel_id.to_string(),
                    bet,
                    field: Field::new(mines),
                    mines,
                    revealed: std::collections::HashSet::new(),
                },
            )
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                self.ledger.add(user_id, bet, "mines_refund")?;
                return Err(e);
            }
        };

        let result = self.play_inner(user_id, bet, mines, &session, &mut turn).await;
        self.sessions.end_session(user_id).await;
        result
    }

    async fn play_inner(
        &self,
        user_id: &str,
        bet: i64,
        mines: usize,
        session: &tokio::sync::Mutex<MinesSession>,
        turn: &mut TurnHandle,
    ) -> Result<MinesSettlement> {
        loop {
            let message = match turn.ask("输入格子编号(1-25)或发送 s 收手", TURN_TIMEOUT).await {
                Ok(m) => m,
                Err(StarshardError::Timeout) => {
                    let revealed_count = session.lock().await.revealed.len();
                    let settlement = MinesSettlement {
                        outcome: MinesOutcome::Timeout,
                        winnings: 0,
                        revealed_count,
                    };
                    self.record_result(user_id, bet, mines, revealed_count, &settlement)?;
                    return Ok(settlement);
                }
                Err(e) => return Err(e),
            };
            let text = message.text.trim().to_lowercase();

            if text == "s" || text == "收手" || text == "cashout" {
                let mut guard = session.lock().await;
                let revealed_count = guard.revealed.len();
                let payout = (bet as f64 * multiplier(mines, revealed_count)).floor() as i64;
                let winnings = payout - bet;
                drop(guard);
                if payout > 0 {
                    self.ledger.add(user_id, payout, "mines")?;
                }
                let settlement = MinesSettlement {
                    outcome: MinesOutcome::Cashout,
                    winnings,
                    revealed_count,
                };
                self.record_result(user_id, bet, mines, revealed_count, &settlement)?;
                return Ok(settlement);
            }

            let index: usize = match text.parse::<usize>() {
                Ok(n) if (1..=25).contains(&n) => n - 1,
                _ => {
                    turn.emit("无效输入，请输入1-25或s收手");
                    continue;
                }
            };

            let mut guard = session.lock().await;
            if guard.revealed.contains(&index) {
                drop(guard);
                turn.emit("该格子已揭示过");
                continue;
            }
            let cell = guard.field.reveal(index);
            guard.revealed.insert(index);

            match cell {
                Cell::Mine => {
                    guard.field.reveal_all_mines();
                    let revealed_count = guard.revealed.len();
                    drop(guard);
                    let settlement = MinesSettlement {
                        outcome: MinesOutcome::Lose,
                        winnings: -bet,
                        revealed_count,
                    };
                    self.record_result(user_id, bet, mines, revealed_count, &settlement)?;
                    return Ok(settlement);
                }
                _ => {
                    let revealed_count = guard.revealed.len();
                    let safe_cells = guard.field.safe_cells();
                    let current_multiplier = multiplier(mines, revealed_count);
                    drop(guard);
                    if revealed_count == safe_cells {
                        let payout = (bet as f64 * current_multiplier).floor() as i64;
                        let winnings = payout - bet;
                        if payout > 0 {
                            self.ledger.add(user_id, payout, "mines")?;
                        }
                        let settlement = MinesSettlement {
                            outcome: MinesOutcome::Win,
                            winnings,
                            revealed_count,
                        };
                        self.record_result(user_id, bet, mines, revealed_count, &settlement)?;
                        return Ok(settlement);
                    }
                    let payout = (bet as f64 * current_multiplier).floor() as i64;
                    turn.emit(format!(
                        "安全！倍率 x{current_multiplier:.3} 当前可得 {payout}"
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplier_matches_scenario_s4() {
        // bet=100, mines=5, reveal 3 safe cells -> multiplier ~= 1.269.
        let mul = multiplier(5, 3);
        assert!((mul - 1.269).abs() < 0.01, "got {mul}");
    }

    #[test]
    fn multiplier_is_one_with_no_reveals() {
        assert_eq!(multiplier(5, 0), 1.0);
    }

    #[test]
    fn field_reveal_marks_cell_shown_and_returns_original_kind() {
        let mut field = Field::new(1);
        let mine_index = field.cells.iter().position(|&c| c == Cell::Mine).unwrap();
        let kind = field.reveal(mine_index);
        assert_eq!(kind, Cell::Mine);
        assert_eq!(field.cells[mine_index], Cell::MineShown);
    }

    #[test]
    fn choose_handles_edges() {
        assert_eq!(choose(5, 0), 1.0);
        assert_eq!(choose(5, 5), 1.0);
        assert!((choose(25, 3) - 2300.0).abs() < 0.01);
    }
}
