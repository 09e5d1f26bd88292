//! Volatility regime monitor.
//!
//! Keeps a rolling price window per symbol and classifies the
//! annualization-free realized volatility into LOW / NORMAL / HIGH. The
//! execution engine scales its maker fill timeout with the regime.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolRegime {
    Low,
    Normal,
    High,
}

impl VolRegime {
    /// Multiplier applied to the maker fill timeout: choppier markets get
    /// more time, quiet ones less.
    pub fn timeout_factor(self) -> f64 {
        match self {
            VolRegime::High => 1.2,
            VolRegime::Low => 0.9,
            VolRegime::Normal => 1.0,
        }
    }
}

#[derive(Debug, Clone)]
struct SymbolWindow {
    prices: VecDeque<f64>,
    regime: VolRegime,
}

pub struct VolatilityMonitor {
    windows: RwLock<HashMap<String, SymbolWindow>>,
    window_size: usize,
    low_threshold: f64,
    high_threshold: f64,
}

impl VolatilityMonitor {
    pub fn new(window_size: usize) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            window_size,
            low_threshold: 0.002,
            high_threshold: 0.01,
        }
    }

    pub fn update_price(&self, symbol: &str, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        let mut windows = self.windows.write();
        let entry = windows
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolWindow {
                prices: VecDeque::with_capacity(self.window_size),
                regime: VolRegime::Normal,
            });
        if entry.prices.len() >= self.window_size {
            entry.prices.pop_front();
        }
        entry.prices.push_back(price);

        if let Some(vol) = Self::realized_vol(&entry.prices) {
            let next = if vol >= self.high_threshold {
                VolRegime::High
            } else if vol <= self.low_threshold {
                VolRegime::Low
            } else {
                VolRegime::Normal
            };
            if next != entry.regime {
                debug!(symbol, vol, from = ?entry.regime, to = ?next, "volatility regime change");
                entry.regime = next;
            }
        }
    }

    /// Stddev of log returns over the window. Needs at least 10 samples.
    fn realized_vol(prices: &VecDeque<f64>) -> Option<f64> {
        if prices.len() < 10 {
            return None;
        }
        let returns: Vec<f64> = prices
            .iter()
            .zip(prices.iter().skip(1))
            .map(|(a, b)| (b / a).ln())
            .collect();
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let var =
            returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
        Some(var.sqrt())
    }

    pub fn regime(&self, symbol: &str) -> VolRegime {
        self.windows
            .read()
            .get(symbol)
            .map(|w| w.regime)
            .unwrap_or(VolRegime::Normal)
    }
}

impl Default for VolatilityMonitor {
    fn default() -> Self {
        Self::new(288)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_symbol_defaults_to_normal() {
        let monitor = VolatilityMonitor::default();
        assert_eq!(monitor.regime("BTC"), VolRegime::Normal);
        assert_eq!(monitor.regime("BTC").timeout_factor(), 1.0);
    }

    #[test]
    fn flat_series_classifies_low() {
        let monitor = VolatilityMonitor::new(32);
        for _ in 0..20 {
            monitor.update_price("BTC", 50_000.0);
        }
        assert_eq!(monitor.regime("BTC"), VolRegime::Low);
    }

    #[test]
    fn choppy_series_classifies_high() {
        let monitor = VolatilityMonitor::new(32);
        for i in 0..30 {
            let px = if i % 2 == 0 { 50_000.0 } else { 51_500.0 };
            monitor.update_price("BTC", px);
        }
        assert_eq!(monitor.regime("BTC"), VolRegime::High);
    }

    #[test]
    fn garbage_prices_are_ignored() {
        let monitor = VolatilityMonitor::new(32);
        monitor.update_price("BTC", f64::NAN);
        monitor.update_price("BTC", -1.0);
        assert_eq!(monitor.regime("BTC"), VolRegime::Normal);
    }
}
