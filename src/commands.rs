//! Command dispatch table (§6): the text-command boundary the core parses out of
//! otherwise-opaque inbound message text.
//!
//! Grounded on `src/bbs/games.rs::resolve_games_command`'s alias-resolution shape
//! (case-insensitive, alias list per entry), generalized from "one game door" to the
//! full command table, with full-width-digit/space tolerance folded in up front.

use std::sync::Arc;

use crate::channels::ChannelMembers;
use crate::config::Config;
use crate::correlator::Correlator;
use crate::error::{Result, StarshardError};
use crate::games::blackjack::{BlackjackCore, BlackjackSession};
use crate::games::mines::{MinesCore, MinesSession};
use crate::games::onestroke::{OneStrokeCore, OneStrokeSession};
use crate::ledger::Ledger;
use crate::mail::MailDispatcher;
use crate::redenvelope::RedEnvelopeEngine;
use crate::session::{InboundMessage, SessionRegistry};

/// Fold full-width ASCII (U+FF01..U+FF5E) down to its normal-width equivalent and
/// collapse full-width spaces, so `ｂａｌａｎｃｅ` and `balance` parse identically.
pub fn normalize_text(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{3000}' => ' ',
            '\u{FF01}'..='\u{FF5E}' => {
                char::from_u32(c as u32 - 0xFEE0).unwrap_or(c)
            }
            other => other,
        })
        .collect()
}

/// Everything a command needs to run: one ledger, one registry per stake game, the
/// three persistence subsystems, and the passive-message correlator.
#[derive(Clone)]
pub struct AppCore {
    pub ledger: Ledger,
    pub config: Arc<Config>,
    pub blackjack: Arc<BlackjackCore>,
    pub blackjack_sessions: SessionRegistry<BlackjackSession>,
    pub mines: Arc<MinesCore>,
    pub mines_sessions: SessionRegistry<MinesSession>,
    pub onestroke: Arc<OneStrokeCore>,
    pub onestroke_sessions: SessionRegistry<OneStrokeSession>,
    pub red_envelopes: RedEnvelopeEngine,
    pub mail: MailDispatcher,
    pub channels: ChannelMembers,
    pub correlator: Correlator,
}

fn split_args(text: &str) -> Vec<&str> {
    text.split_whitespace().collect()
}

/// Handle one inbound command-boundary message. Returns the text to emit immediately,
/// or `None` for commands (blackjack/mines) that were handed off to a background task
/// and will reply asynchronously through their own `TurnHandle`.
pub async fn dispatch(core: &AppCore, message: &InboundMessage) -> Result<Option<String>> {
    let normalized = normalize_text(&message.text);
    let mut parts = split_args(normalized.trim());
    let Some(command) = parts.first().copied() else {
        return Ok(None);
    };
    let args: Vec<&str> = parts.split_off(1.min(parts.len()));
    let user_id = message.user_id.as_str();
    let channel_id = message.channel_id.as_str();

    // A user already in a one-stroke game has their whole message consumed as a move
    // string (or a reset/quit word), ahead of the regular command table — one-stroke has
    // no `TurnHandle` of its own to route through, so this check lives here rather than
    // at the transport's session-routing precedence check.
    if core.onestroke_sessions.is_in_game(user_id).await {
        let trimmed = normalized.trim();
        let reply = match trimmed.to_lowercase().as_str() {
            "quit" | "退出" => {
                core.onestroke.quit(user_id).await;
                "已退出一笔画".to_string()
            }
            "reset" | "重置" => {
                core.onestroke.reset(user_id).await?;
                "已重置，回到起点".to_string()
            }
            _ => match core.onestroke.apply_move_string(user_id, trimmed).await? {
                Some((reward, failure)) => match failure {
                    Some(f) => format!("一笔画结束，第{}步出错（{}）。获得奖励 {reward}", f.step_index + 1, f.reason),
                    None => format!("一笔画完成！获得奖励 {reward}"),
                },
                None => "移动已记录".to_string(),
            },
        };
        return Ok(Some(reply));
    }

    let reply = match command.to_lowercase().as_str() {
        "balance" | "余额" => {
            let user = core.ledger.get_user(user_id)?;
            format!("等级(level) {} · 星之碎片(balance) {}", user.level, user.balance)
        }
        "daily" | "签到" => {
            let credited = core.ledger.daily(user_id)?;
            if !credited {
                "今天已经签到过了".to_string()
            } else {
                let mut rng = rand::thread_rng();
                let bonus = Ledger::roll_daily_bonus(&mut rng);
                core.ledger.add(user_id, bonus, "daily_checkin")?;
                format!("签到成功，获得 {bonus} 个星之碎片")
            }
        }
        "transfer" | "转账" => {
            if args.len() < 2 {
                return Ok(Some("用法: transfer <昵称> <数量>".to_string()));
            }
            let (nick_tok, amount_tok) = if args[0].parse::<i64>().is_ok() {
                (args[1], args[0])
            } else {
                (args[0], args[1])
            };
            let amount: i64 = amount_tok
                .parse()
                .map_err(|_| StarshardError::InvalidAmount("amount must be an integer".to_string()))?;
            let recipient = core
                .ledger
                .find_by_nickname(nick_tok)?
                .ok_or_else(|| StarshardError::NotFound("nickname".to_string()))?;
            core.ledger.transfer(user_id, &recipient, amount, "transfer")?;
            format!("已转账 {amount} 给 {nick_tok}")
        }
        "upgrade" | "摘星" => {
            let level = core.ledger.get_level(user_id)?;
            let cost = Ledger::upgrade_cost(
                level,
                core.config.economy.upgrade_tier1_cutoff,
                core.config.economy.upgrade_tier2_cutoff,
            );
            core.ledger.cost(user_id, cost, "upgrade")?;
            core.ledger.increase_level(user_id, 1)?;
            format!("升级成功！等级 {} -> {}，花费 {cost}", level, level + 1)
        }
        "rank" | "排行榜" => {
            let top = core.ledger.get_top_users(10)?;
            let rank = core.ledger.get_user_rank(user_id)?;
            let mut out = String::from("排行榜 Top 10:\n");
            for (i, user) in top.iter().enumerate() {
                out.push_str(&format!("{}. {} 等级{} 碎片{}\n", i + 1, user.user_id, user.level, user.balance));
            }
            out.push_str(&format!("你的排名: 第{}名", rank.rank));
            out
        }
        "setnick" => {
            let nickname = args.first().copied().unwrap_or("");
            core.ledger.set_nickname(user_id, nickname, core.config.economy.nickname_reset_cost)?;
            format!("昵称已设置为 {nickname}")
        }
        "getnick" => match core.ledger.get_nickname(user_id)? {
            Some(nick) => format!("当前昵称: {nick}"),
            None => "你还没有设置昵称".to_string(),
        },
        "blackjack" | "黑香澄" => {
            let bet: i64 = args.first().and_then(|a| a.parse().ok()).unwrap_or(core.config.games.blackjack_min_bet);
            let core = core.clone();
            let user_id = user_id.to_string();
            let channel_id = channel_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = core.blackjack.play(&user_id, &channel_id, bet).await {
                    log::warn!("blackjack session for {user_id} ended in error: {e}");
                }
            });
            return Ok(Some("黑香澄开始！".to_string()));
        }
        "mines" | "探险" => {
            let bet: i64 = args.first().and_then(|a| a.parse().ok()).unwrap_or(core.config.games.blackjack_min_bet);
            let mines: usize = args
                .get(1)
                .and_then(|a| a.parse().ok())
                .unwrap_or(core.config.games.mines_default_mines as usize);
            let core = core.clone();
            let user_id = user_id.to_string();
            let channel_id = channel_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = core.mines.play(&user_id, &channel_id, bet, mines).await {
                    log::warn!("mines session for {user_id} ended in error: {e}");
                }
            });
            return Ok(Some("探险开始！".to_string()));
        }
        "onestroke" | "一笔画" => {
            let difficulty = args.first().copied().unwrap_or(&core.config.games.onestroke_default_difficulty);
            core.onestroke.start(user_id, channel_id, difficulty).await?;
            format!("一笔画开始！难度: {difficulty}")
        }
        "onestroke_rank" => {
            let difficulty = args.first().copied().unwrap_or("normal");
            let board = core.onestroke.leaderboard(difficulty)?;
            let mut out = format!("一笔画排行榜 ({difficulty}):\n");
            for (i, (user, elapsed)) in board.iter().enumerate() {
                out.push_str(&format!("{}. {} {:.2}s\n", i + 1, user, elapsed));
            }
            out
        }
        "cck" | "猜卡面" | "guess_chart" | "猜谱面" => {
            "该功能依赖外部谱面/卡面数据服务，当前环境未配置".to_string()
        }
        "mail" | "邮箱" => match args.first().and_then(|a| a.parse::<usize>().ok()) {
            None => {
                let mails = core.mail.list_for_user(user_id)?;
                if mails.is_empty() {
                    "你的邮箱是空的".to_string()
                } else {
                    let mut out = format!("邮箱 ({}封):\n", mails.len());
                    for (i, mail) in mails.iter().enumerate() {
                        let icon = if mail.is_read { "📖" } else { "📩" };
                        out.push_str(&format!("{}. {} {}\n", i + 1, icon, mail.title));
                    }
                    out
                }
            }
            Some(index) => {
                let mails = core.mail.list_for_user(user_id)?;
                let mail = mails
                    .get(index.saturating_sub(1))
                    .ok_or_else(|| StarshardError::NotFound("mail index".to_string()))?;
                let read = core.mail.read_mail(user_id, mail.recipient_row_id)?;
                format!("{}\n\n{}", read.title, read.content)
            }
        },
        "redenvelope" | "发红包" => {
            if args.len() < 2 {
                return Ok(Some("用法: redenvelope [标题] <金额> <份数>".to_string()));
            }
            let count: i64 = args[args.len() - 1]
                .parse()
                .map_err(|_| StarshardError::InvalidArgument("count must be an integer".to_string()))?;
            let amount: i64 = args[args.len() - 2]
                .parse()
                .map_err(|_| StarshardError::InvalidArgument("amount must be an integer".to_string()))?;
            let title = if args.len() > 2 { args[..args.len() - 2].join(" ") } else { "红包".to_string() };
            let envelope = core.red_envelopes.create(user_id, channel_id, &title, amount, count)?;
            format!("红包已创建！编号: {}，金额: {}，份数: {}", envelope.channel_index, amount, count)
        }
        "claim" | "抢红包" => {
            let index: Option<i64> = args.first().and_then(|a| a.parse().ok());
            let outcome = core.red_envelopes.claim(user_id, channel_id, index)?;
            let mut out = format!("恭喜你抢到 {} 个星之碎片！", outcome.amount);
            if let Some(king) = outcome.lucky_king {
                out.push_str(&format!(
                    "\n{}的红包在{}秒内被抢完，{}是手气王（{}个星之碎片）！",
                    king.creator_id, king.duration_seconds, king.lucky_user_id, king.lucky_amount
                ));
            }
            out
        }
        "envelopes" | "红包列表" => {
            let active = core.red_envelopes.list_active(channel_id)?;
            if active.is_empty() {
                "当前群聊中没有可领取的红包".to_string()
            } else {
                let mut out = format!("红包列表 ({}个):\n", active.len());
                for envelope in &active {
                    out.push_str(&format!(
                        "{}. {} | 碎片 {}/{} | 份数 {}/{}\n",
                        envelope.channel_index,
                        envelope.title,
                        envelope.remaining_amount,
                        envelope.total_amount,
                        envelope.remaining_count,
                        envelope.total_count
                    ));
                }
                out
            }
        }
        "schedulemail" => dispatch_schedulemail(core, &args)?,
        _ => return Ok(None),
    };
    Ok(Some(reply))
}

fn dispatch_schedulemail(core: &AppCore, args: &[&str]) -> Result<String> {
    let sub = args.first().copied().unwrap_or("");
    match sub {
        "add" => {
            if args.len() < 5 {
                return Ok("用法: schedulemail add <name> <recipients> <scheduled_time> <title> <content>".to_string());
            }
            let name = args[1];
            let recipients = args[2];
            let scheduled_time: i64 = args[3]
                .parse()
                .map_err(|_| StarshardError::InvalidArgument("scheduled_time must be a unix timestamp".to_string()))?;
            let title = args[4];
            let content = args.get(5..).map(|rest| rest.join(" ")).unwrap_or_default();
            core.mail.create_scheduled(name, recipients, title, &content, 0, 7, scheduled_time, "admin")?;
            Ok(format!("定时邮件 {name} 已创建"))
        }
        "edit" => {
            let name = args.get(1).copied().ok_or_else(|| StarshardError::InvalidArgument("missing name".to_string()))?;
            let title = args.get(2).copied();
            core.mail.update_scheduled(name, title, None, None)?;
            Ok(format!("定时邮件 {name} 已更新"))
        }
        "delete" => {
            let name = args.get(1).copied().ok_or_else(|| StarshardError::InvalidArgument("missing name".to_string()))?;
            core.mail.delete_scheduled(name)?;
            Ok(format!("定时邮件 {name} 已删除"))
        }
        _ => Ok("用法: schedulemail {add,edit,delete} ...".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_width_letters_fold_to_ascii() {
        assert_eq!(normalize_text("ｂａｌａｎｃｅ"), "balance");
    }

    #[test]
    fn full_width_space_folds_to_ascii_space() {
        assert_eq!(normalize_text("mines\u{3000}5"), "mines 5");
    }
}
