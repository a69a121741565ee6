// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradingState { Live, Stopped, Pending }
impl TradingState {
    pub fn is_live(&self) -> bool { matches!(self, TradingState::Live) }
    pub fn as_str(&self) -> &'static str {
        match self { TradingState::Live => "LIVE", TradingState::Stopped => "STOPPED", TradingState::Pending => "PENDING" }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side { Long, Short }
impl Side {
    /// Side from a signed share count: zero counts as long.
    pub fn from_signed(shares: f64) -> Self { if shares >= 0.0 { Side::Long } else { Side::Short } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position { pub symbol: String, pub side: Side, pub quantity: f64, pub entry_price: f64, pub current_price: f64, pub unrealized_pnl: f64 }

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub portfolio_value: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub total_pnl: f64,
    pub drawdown: f64,
    pub balance: f64,
    pub daily_pnl: f64,
    pub win_rate: f64,
    pub trade_count: u64,
}

/// `total_decision_points` counts opened trades, `trades_executed` closed ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySummary { pub total_decision_points: u64, pub trades_executed: u64 }

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionMeta {
    pub regime: Option<String>,
    pub volatility: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub action: String,
    pub confidence: f64,
    pub expected_return: f64,
    pub risk_score: f64,
    pub position_size: f64,
    pub meta: Option<PredictionMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState { pub last_prediction: Option<Prediction>, pub timestamp: String }

/// Canonical view of the remote trader. The only thing consumers observe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub trading_state: TradingState,
    pub positions: Vec<Position>,
    pub portfolio: Option<PortfolioSummary>,
    pub activity: Option<ActivitySummary>,
    pub model_state: Option<ModelState>,
}

impl Snapshot {
    fn empty(trading_state: TradingState) -> Self {
        Self { trading_state, positions: Vec::new(), portfolio: None, activity: None, model_state: None }
    }
    pub fn stopped() -> Self { Self::empty(TradingState::Stopped) }
    /// Placeholder published before the first status read resolves.
    pub fn pending() -> Self { Self::empty(TradingState::Pending) }

    pub fn decision_points(&self) -> Option<u64> { self.activity.map(|a| a.total_decision_points) }
}

impl Default for Snapshot {
    fn default() -> Self { Self::pending() }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub symbol: String,
    pub entry_timestamp: String,
    pub exit_timestamp: Option<String>,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    /// Only meaningful once the trade is closed.
    pub pnl: f64,
    pub fees: f64,
}
impl Trade {
    pub fn is_closed(&self) -> bool { self.exit_timestamp.is_some() }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub num_trades: u64,
    pub closed_trades: u64,
    pub final_balance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceData { pub metrics: PerformanceMetrics, pub trades: Vec<Trade> }

// ---- Start request ----

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraderConfig {
    #[serde(skip_serializing_if = "Option::is_none")] pub initial_balance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")] pub min_confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")] pub max_risk: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")] pub max_position: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")] pub max_risk_per_trade: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")] pub max_positions: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")] pub max_drawdown: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")] pub position_limit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")] pub risk_multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")] pub stop_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")] pub take_profit: Option<f64>,
}

impl TraderConfig {
    /// Tuning the start form pre-fills.
    pub fn recommended() -> Self {
        Self {
            initial_balance: Some(10_000.0),
            min_confidence: Some(0.6),
            max_risk: Some(0.8),
            max_position: Some(1.0),
            max_risk_per_trade: Some(0.02),
            max_positions: Some(5.0),
            max_drawdown: Some(0.05),
            position_limit: Some(25_000.0),
            risk_multiplier: Some(0.5),
            stop_loss: Some(0.02),
            take_profit: Some(0.03),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest { pub symbols: Vec<String>, pub config: TraderConfig }

/// Symbol baskets backed by the service's backtests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SymbolPreset {
    Top5Elite,
    Top10,
    Diversified15,
    AllTop24,
    TechFocus,
    FinanceIndustrials,
    HealthcareConsumer,
}

impl SymbolPreset {
    pub fn symbols(&self) -> Vec<String> {
        let list = match self {
            SymbolPreset::Top5Elite => "NEM,ORCL,AVGO,NVDA,ABBV",
            SymbolPreset::Top10 => "NEM,ORCL,AVGO,NVDA,ABBV,C,GOOGL,GS,PFE,CAT",
            SymbolPreset::Diversified15 => "NEM,ORCL,AVGO,NVDA,GOOGL,GS,CAT,JNJ,NOW,MU,PM,BX,BA,MSFT,AMD",
            SymbolPreset::AllTop24 => "NEM,ORCL,AVGO,NVDA,ABBV,C,GOOGL,GS,PFE,CAT,JNJ,NOW,MU,UBER,PM,BX,UNH,AXP,BA,GE,AMD,MSFT,T,DIS",
            SymbolPreset::TechFocus => "NVDA,AVGO,GOOGL,NOW,MU,AMD,MSFT,ORCL",
            SymbolPreset::FinanceIndustrials => "GS,C,AXP,BX,CAT,BA,GE",
            SymbolPreset::HealthcareConsumer => "ABBV,PFE,JNJ,UNH,PM,DIS",
        };
        list.split(',').map(str::to_string).collect()
    }
}

// ---- Notifications ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity { Success, Error }
impl Severity {
    pub fn as_str(&self) -> &'static str { match self { Severity::Success => "success", Severity::Error => "error" } }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToastMessage { pub id: u64, pub text: String, pub severity: Severity, pub lifetime: Duration }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradeEvent { pub delta: u64, pub total: u64 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_from_sign() {
        assert_eq!(Side::from_signed(10.0), Side::Long);
        assert_eq!(Side::from_signed(0.0), Side::Long);
        assert_eq!(Side::from_signed(-0.5), Side::Short);
    }

    #[test]
    fn start_request_omits_unset_config() {
        let req = StartRequest {
            symbols: vec!["NVDA".into()],
            config: TraderConfig { stop_loss: Some(0.02), ..Default::default() },
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v, serde_json::json!({ "symbols": ["NVDA"], "config": { "stop_loss": 0.02 } }));
    }

    #[test]
    fn presets_expand_to_symbols() {
        assert_eq!(SymbolPreset::Top5Elite.symbols(), vec!["NEM", "ORCL", "AVGO", "NVDA", "ABBV"]);
        assert_eq!(SymbolPreset::AllTop24.symbols().len(), 24);
    }

    #[test]
    fn placeholder_snapshots_are_empty() {
        let s = Snapshot::default();
        assert_eq!(s.trading_state, TradingState::Pending);
        assert!(s.positions.is_empty() && s.portfolio.is_none() && s.activity.is_none());
        assert_eq!(Snapshot::stopped().trading_state.as_str(), "STOPPED");
    }
}
