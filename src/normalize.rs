// ===============================
// src/normalize.rs (schema drift -> canonical types)
// ===============================
//
// The trader backend renamed and moved fields release to release without
// removing the old ones. Every canonical field has one FieldRule: an ordered
// list of (dotted) key paths. The first path holding a defined number/string
// wins; nothing present -> zero / empty. Nothing here ever fails on shape.
//
// Known status shapes (see tests/fixtures/):
//   v1  position_details = { "<SYM>": { shares | position_shares, average_price | entry_price_per_share, ... } }
//       flat summary keys, activity_summary { total_decision_points, trades_executed }, last_prediction
//   v2  status = "running", position_details.positions_by_symbol = [ { symbol, direction, shares, ... } ]
//       position_details.total_*, current_balance, performance_metrics.*, winning/losing_trades, recent_trades
//
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use ahash::AHashSet as HashSet;

use crate::domain::{
    ActivitySummary, ModelState, PerformanceData, PerformanceMetrics, PortfolioSummary, Position,
    Prediction, PredictionMeta, Side, Snapshot, Trade, TradingState,
};
use crate::error::ApiError;

/// `status` values that mean a live session. Matched exactly.
pub const ACTIVE_STATUS_TOKENS: &[&str] = &["running", "active"];
pub const ACTIVE_FLAG_KEY: &str = "is_trading";
pub const STATUS_KEY: &str = "status";

#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub field: &'static str,
    pub keys: &'static [&'static str],
}

impl FieldRule {
    pub fn number(&self, raw: &Value) -> Option<f64> {
        self.keys.iter().find_map(|k| lookup(raw, k).and_then(as_number))
    }

    pub fn number_or_zero(&self, raw: &Value) -> f64 {
        self.number(raw).unwrap_or(0.0)
    }

    pub fn count(&self, raw: &Value) -> u64 {
        self.number(raw).map(as_count).unwrap_or(0)
    }

    pub fn text(&self, raw: &Value) -> Option<String> {
        self.keys.iter().find_map(|k| {
            lookup(raw, k)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
    }
}

macro_rules! rule {
    ($name:ident, $field:literal, [$($key:literal),+ $(,)?]) => {
        pub const $name: FieldRule = FieldRule { field: $field, keys: &[$($key),+] };
    };
}

/// Portfolio / activity fields on the status payload.
pub mod status_fields {
    use super::FieldRule;

    rule!(PORTFOLIO_VALUE, "portfolio_value", ["total_portfolio_value", "portfolio_value", "position_details.total_portfolio_value", "current_balance"]);
    rule!(UNREALIZED_PNL, "unrealized_pnl", ["unrealized_pnl", "position_details.total_unrealized_pnl"]);
    rule!(REALIZED_PNL, "realized_pnl", ["realized_pnl", "total_pnl"]);
    rule!(TOTAL_PNL, "total_pnl", ["total_pnl"]);
    rule!(DRAWDOWN, "drawdown", ["drawdown", "performance_metrics.max_drawdown", "max_drawdown"]);
    rule!(BALANCE, "balance", ["balance", "available_cash", "current_balance"]);
    rule!(DAILY_PNL, "daily_pnl", ["daily_pnl", "position_details.total_unrealized_pnl"]);
    rule!(WIN_RATE, "win_rate", ["win_rate", "performance_metrics.win_rate"]);
    rule!(TRADE_COUNT, "trade_count", ["trade_count", "total_trades"]);
    rule!(DECISION_POINTS, "total_decision_points", ["activity_summary.total_decision_points", "total_trades"]);
    rule!(TRADES_EXECUTED, "trades_executed", ["activity_summary.trades_executed"]);
    rule!(WINNING_TRADES, "winning_trades", ["winning_trades"]);
    rule!(LOSING_TRADES, "losing_trades", ["losing_trades"]);
    rule!(TIMESTAMP, "timestamp", ["timestamp"]);

    pub const ALL: &[FieldRule] = &[
        PORTFOLIO_VALUE, UNREALIZED_PNL, REALIZED_PNL, TOTAL_PNL, DRAWDOWN, BALANCE, DAILY_PNL,
        WIN_RATE, TRADE_COUNT, DECISION_POINTS, TRADES_EXECUTED, WINNING_TRADES, LOSING_TRADES, TIMESTAMP,
    ];
}

/// Fields of one position record (either shape).
pub mod position_fields {
    use super::FieldRule;

    rule!(LIST, "positions", ["position_details.positions_by_symbol", "positions"]);
    rule!(SYMBOL, "symbol", ["symbol"]);
    rule!(SHARES, "shares", ["shares", "position_shares", "quantity"]);
    rule!(DIRECTION, "direction", ["direction", "side"]);
    rule!(ENTRY_PRICE, "entry_price", ["average_price", "entry_price_per_share", "entry_price"]);
    rule!(CURRENT_PRICE, "current_price", ["current_market_price", "current_price"]);
    rule!(UNREALIZED_PNL, "unrealized_pnl", ["unrealized_pnl"]);

    pub const ALL: &[FieldRule] = &[LIST, SYMBOL, SHARES, DIRECTION, ENTRY_PRICE, CURRENT_PRICE, UNREALIZED_PNL];
}

/// Fields of one trade record: v1 entry/exit records and v2 BUY/SELL actions.
pub mod trade_fields {
    use super::FieldRule;

    rule!(LIST, "trades", ["trades", "recent_trades"]);
    rule!(SYMBOL, "symbol", ["symbol"]);
    rule!(ACTION, "action", ["action"]);
    rule!(ENTRY_TS, "entry_timestamp", ["entry_date", "entry_time", "timestamp"]);
    rule!(EXIT_TS, "exit_timestamp", ["exit_date", "exit_time"]);
    rule!(QUANTITY, "quantity", ["position_size", "shares", "quantity"]);
    rule!(ENTRY_PRICE, "entry_price", ["entry_price", "price"]);
    rule!(EXIT_PRICE, "exit_price", ["exit_price"]);
    rule!(PNL, "pnl", ["pnl"]);
    rule!(FEES, "fees", ["fees", "transaction_costs"]);

    pub const ALL: &[FieldRule] = &[LIST, SYMBOL, ACTION, ENTRY_TS, EXIT_TS, QUANTITY, ENTRY_PRICE, EXIT_PRICE, PNL, FEES];
}

/// Performance-state payload; flat keys first, then the nested block.
pub mod performance_fields {
    use super::FieldRule;

    rule!(TOTAL_RETURN, "total_return", ["total_return", "performance_metrics.total_return"]);
    rule!(SHARPE, "sharpe_ratio", ["sharpe_ratio", "performance_metrics.sharpe_ratio"]);
    rule!(SORTINO, "sortino_ratio", ["sortino_ratio", "performance_metrics.sortino_ratio"]);
    rule!(CALMAR, "calmar_ratio", ["calmar_ratio", "performance_metrics.calmar_ratio"]);
    rule!(MAX_DRAWDOWN, "max_drawdown", ["max_drawdown", "performance_metrics.max_drawdown"]);
    rule!(WIN_RATE, "win_rate", ["win_rate", "performance_metrics.win_rate"]);
    rule!(NUM_TRADES, "num_trades", ["num_trades", "trade_count", "total_trades"]);
    rule!(FINAL_BALANCE, "final_balance", ["final_balance", "balance", "current_balance"]);

    pub const ALL: &[FieldRule] = &[TOTAL_RETURN, SHARPE, SORTINO, CALMAR, MAX_DRAWDOWN, WIN_RATE, NUM_TRADES, FINAL_BALANCE];
}

/// Prediction record, from /predict or the model-state block.
pub mod prediction_fields {
    use super::FieldRule;

    rule!(WRAPPER, "prediction", ["prediction"]);
    rule!(ACTION, "action", ["action_type", "action"]);
    rule!(POSITION_SIZE, "position_size", ["position_size"]);
    rule!(CONFIDENCE, "confidence", ["confidence"]);
    rule!(EXPECTED_RETURN, "expected_return", ["expected_return"]);
    rule!(RISK_SCORE, "risk_score", ["risk_score"]);
    rule!(REGIME, "regime", ["market_regime", "regime"]);
    rule!(VOLATILITY, "volatility", ["volatility"]);
    rule!(STOP_LOSS, "stop_loss", ["stop_loss", "stop_loss_price"]);
    rule!(TAKE_PROFIT, "take_profit", ["take_profit", "take_profit_price"]);
    rule!(LAST_PREDICTION, "last_prediction", ["last_prediction"]);

    pub const ALL: &[FieldRule] = &[
        WRAPPER, ACTION, POSITION_SIZE, CONFIDENCE, EXPECTED_RETURN, RISK_SCORE, REGIME, VOLATILITY,
        STOP_LOSS, TAKE_PROFIT, LAST_PREDICTION,
    ];
}

// ---- JSON helpers ----

/// Dotted-path lookup; `null` counts as absent.
pub fn lookup<'a>(raw: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(raw, |v, key| v.get(key))
        .filter(|v| !v.is_null())
}

fn lookup_any<'a>(raw: &'a Value, rule: &FieldRule) -> Option<&'a Value> {
    rule.keys.iter().find_map(|k| lookup(raw, k))
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

fn as_count(f: f64) -> u64 {
    if f > 0.0 { f.round() as u64 } else { 0 }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---- Status ----

/// LIVE iff the boolean flag is true OR the status string is an active token.
/// Both signals are checked: migrations moved the signal without removing the old field.
pub fn trading_state(raw: &Value) -> TradingState {
    let flag = raw.get(ACTIVE_FLAG_KEY).and_then(Value::as_bool) == Some(true);
    let token = raw
        .get(STATUS_KEY)
        .and_then(Value::as_str)
        .map(|s| ACTIVE_STATUS_TOKENS.contains(&s))
        .unwrap_or(false);
    if flag || token { TradingState::Live } else { TradingState::Stopped }
}

fn has_state_signal(raw: &Value) -> bool {
    lookup(raw, ACTIVE_FLAG_KEY).is_some() || lookup(raw, STATUS_KEY).is_some()
}

pub fn normalize_status(raw: &Value) -> Snapshot {
    let trading_state = trading_state(raw);
    if !trading_state.is_live() {
        // whatever else the payload carries is stale once the session is down
        return Snapshot::stopped();
    }
    Snapshot {
        trading_state,
        positions: normalize_positions(raw),
        portfolio: Some(portfolio_summary(raw)),
        activity: Some(activity_summary(raw)),
        model_state: Some(normalize_model_state(raw)),
    }
}

pub fn portfolio_summary(raw: &Value) -> PortfolioSummary {
    use status_fields::*;
    PortfolioSummary {
        portfolio_value: PORTFOLIO_VALUE.number_or_zero(raw),
        unrealized_pnl: UNREALIZED_PNL.number_or_zero(raw),
        realized_pnl: REALIZED_PNL.number_or_zero(raw),
        total_pnl: TOTAL_PNL.number_or_zero(raw),
        drawdown: DRAWDOWN.number_or_zero(raw),
        balance: BALANCE.number_or_zero(raw),
        daily_pnl: DAILY_PNL.number_or_zero(raw),
        win_rate: WIN_RATE.number_or_zero(raw),
        trade_count: TRADE_COUNT.count(raw),
    }
}

pub fn activity_summary(raw: &Value) -> ActivitySummary {
    use status_fields::*;
    let trades_executed = TRADES_EXECUTED
        .number(raw)
        .map(as_count)
        .unwrap_or_else(|| WINNING_TRADES.count(raw) + LOSING_TRADES.count(raw));
    ActivitySummary { total_decision_points: DECISION_POINTS.count(raw), trades_executed }
}

/// Positions in payload order (v1 maps iterate by symbol), unique by symbol.
pub fn normalize_positions(raw: &Value) -> Vec<Position> {
    use position_fields::*;

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut push = |symbol: String, rec: &Value| {
        if symbol.is_empty() || !seen.insert(symbol.clone()) {
            return;
        }
        out.push(position(symbol, rec));
    };

    if let Some(list) = lookup_any(raw, &LIST).and_then(Value::as_array) {
        for rec in list.iter().filter(|r| r.is_object()) {
            push(SYMBOL.text(rec).unwrap_or_default(), rec);
        }
    } else if let Some(map) = raw.get("position_details").and_then(Value::as_object) {
        for (symbol, rec) in map.iter().filter(|(_, r)| r.is_object()) {
            push(symbol.clone(), rec);
        }
    }
    out
}

fn position(symbol: String, rec: &Value) -> Position {
    use position_fields::*;

    let mut shares = SHARES.number_or_zero(rec);
    // explicit direction on an unsigned count
    if shares > 0.0 && DIRECTION.text(rec).is_some_and(|d| d.eq_ignore_ascii_case("SHORT")) {
        shares = -shares;
    }
    let entry_price = ENTRY_PRICE.number_or_zero(rec).max(0.0);
    let current_price = CURRENT_PRICE.number(rec).unwrap_or(entry_price).max(0.0);
    Position {
        symbol,
        side: Side::from_signed(shares),
        quantity: shares.abs(),
        entry_price,
        current_price,
        unrealized_pnl: UNREALIZED_PNL.number_or_zero(rec),
    }
}

// ---- Trades ----

pub fn normalize_trades(raw: &Value) -> Vec<Trade> {
    let list = match raw {
        Value::Array(items) => Some(items),
        _ => lookup_any(raw, &trade_fields::LIST).and_then(Value::as_array),
    };
    list.map(|items| {
        items
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_object())
            .map(|(i, r)| trade(r, i))
            .collect()
    })
    .unwrap_or_default()
}

fn trade(rec: &Value, index: usize) -> Trade {
    use trade_fields::*;

    let symbol = SYMBOL.text(rec).unwrap_or_default();
    let entry_timestamp = ENTRY_TS.text(rec).unwrap_or_default();
    let entry_price = ENTRY_PRICE.number_or_zero(rec);

    let (exit_timestamp, exit_price) = match ACTION.text(rec) {
        // action records: a SELL closes at its own price & time
        Some(action) if action == "SELL" => (Some(entry_timestamp.clone()), Some(entry_price)),
        Some(_) => (None, None),
        None => {
            let exit_ts = EXIT_TS.text(rec);
            let exit_px = exit_ts.as_ref().and_then(|_| EXIT_PRICE.number(rec));
            (exit_ts, exit_px)
        }
    };

    Trade {
        id: format!("{symbol}-{entry_timestamp}-{index}"),
        symbol,
        entry_timestamp,
        exit_timestamp,
        quantity: QUANTITY.number_or_zero(rec).abs(),
        entry_price,
        exit_price,
        pnl: PNL.number_or_zero(rec),
        fees: FEES.number_or_zero(rec),
    }
}

// ---- Performance ----

/// Fails only when the payload says the session is down.
pub fn normalize_performance(raw: &Value) -> Result<PerformanceData, ApiError> {
    use performance_fields::*;
    use status_fields::{LOSING_TRADES, WINNING_TRADES};

    if has_state_signal(raw) && !trading_state(raw).is_live() {
        return Err(ApiError::TradingInactive);
    }

    let num_trades = NUM_TRADES.count(raw);
    let closed_trades = match (WINNING_TRADES.number(raw), LOSING_TRADES.number(raw)) {
        (None, None) => num_trades,
        (w, l) => as_count(w.unwrap_or(0.0)) + as_count(l.unwrap_or(0.0)),
    };

    let metrics = PerformanceMetrics {
        total_return: TOTAL_RETURN.number_or_zero(raw),
        sharpe_ratio: SHARPE.number_or_zero(raw),
        sortino_ratio: SORTINO.number_or_zero(raw),
        calmar_ratio: CALMAR.number_or_zero(raw),
        max_drawdown: MAX_DRAWDOWN.number_or_zero(raw),
        win_rate: WIN_RATE.number_or_zero(raw),
        num_trades,
        closed_trades,
        final_balance: FINAL_BALANCE.number_or_zero(raw),
    };
    Ok(PerformanceData { metrics, trades: normalize_trades(raw) })
}

// ---- Predictions & model state ----

pub fn normalize_prediction(raw: &Value) -> Prediction {
    use prediction_fields::*;

    let rec = lookup_any(raw, &WRAPPER).filter(|v| v.is_object()).unwrap_or(raw);

    let meta = PredictionMeta {
        regime: REGIME.text(rec),
        volatility: VOLATILITY.number(rec),
        stop_loss: STOP_LOSS.number(rec),
        take_profit: TAKE_PROFIT.number(rec),
    };
    let has_meta = meta.regime.is_some()
        || meta.volatility.is_some()
        || meta.stop_loss.is_some()
        || meta.take_profit.is_some();

    Prediction {
        action: ACTION.text(rec).unwrap_or_else(|| "HOLD".to_string()),
        confidence: CONFIDENCE.number_or_zero(rec),
        expected_return: EXPECTED_RETURN.number_or_zero(rec),
        risk_score: RISK_SCORE.number_or_zero(rec),
        position_size: POSITION_SIZE.number_or_zero(rec),
        meta: has_meta.then_some(meta),
    }
}

/// Last decision: `last_prediction` block if present, else the newest recent trade.
pub fn normalize_model_state(raw: &Value) -> ModelState {
    let payload_ts = status_fields::TIMESTAMP.text(raw);

    if let Some(last) = lookup_any(raw, &prediction_fields::LAST_PREDICTION).filter(|v| v.is_object()) {
        return ModelState {
            last_prediction: Some(normalize_prediction(last)),
            timestamp: status_fields::TIMESTAMP.text(last).or(payload_ts).unwrap_or_else(now_rfc3339),
        };
    }

    let newest = lookup(raw, "recent_trades")
        .and_then(Value::as_array)
        .and_then(|t| t.iter().rev().find(|r| r.is_object()));
    match newest {
        Some(rec) => ModelState {
            last_prediction: Some(normalize_prediction(rec)),
            timestamp: status_fields::TIMESTAMP.text(rec).or(payload_ts).unwrap_or_else(now_rfc3339),
        },
        None => ModelState { last_prediction: None, timestamp: payload_ts.unwrap_or_else(now_rfc3339) },
    }
}
