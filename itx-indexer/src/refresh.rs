//! Delivery of balance refresh triggers to downstream fetchers.

use itx_common::{
    models::{address::CoinBalanceRequest, token::TokenBalanceRequest},
    traits::BalanceRefresher,
};
use metrics::counter;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// Forwards refresh requests over unbounded channels so the importer never waits on a consumer.
#[derive(Clone)]
pub struct ChannelBalanceRefresher {
    coin_tx: UnboundedSender<Vec<CoinBalanceRequest>>,
    token_tx: UnboundedSender<Vec<TokenBalanceRequest>>,
}

pub struct RefreshReceivers {
    pub coin_rx: UnboundedReceiver<Vec<CoinBalanceRequest>>,
    pub token_rx: UnboundedReceiver<Vec<TokenBalanceRequest>>,
}

impl ChannelBalanceRefresher {
    pub fn new() -> (Self, RefreshReceivers) {
        let (coin_tx, coin_rx) = mpsc::unbounded_channel();
        let (token_tx, token_rx) = mpsc::unbounded_channel();
        (Self { coin_tx, token_tx }, RefreshReceivers { coin_rx, token_rx })
    }
}

impl BalanceRefresher for ChannelBalanceRefresher {
    fn refresh_coin_balances(&self, requests: Vec<CoinBalanceRequest>) {
        if requests.is_empty() {
            return;
        }
        counter!("itx_coin_balance_refreshes").increment(requests.len() as u64);
        if self.coin_tx.send(requests).is_err() {
            warn!("Coin balance consumer is gone, dropping refresh");
        }
    }

    fn refresh_token_balances(&self, requests: Vec<TokenBalanceRequest>) {
        if requests.is_empty() {
            return;
        }
        counter!("itx_token_balance_refreshes").increment(requests.len() as u64);
        if self.token_tx.send(requests).is_err() {
            warn!("Token balance consumer is gone, dropping refresh");
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshTotals {
    pub coin_balances: usize,
    pub token_balances: usize,
}

impl RefreshReceivers {
    /// Logs every trigger until both senders are dropped.
    pub async fn log_until_closed(mut self) -> RefreshTotals {
        let mut totals = RefreshTotals::default();
        let (mut coin_open, mut token_open) = (true, true);
        while coin_open || token_open {
            tokio::select! {
                coin = self.coin_rx.recv(), if coin_open => match coin {
                    Some(requests) => {
                        debug!(count = requests.len(), first = ?requests.first(), "Coin balance refresh requested");
                        totals.coin_balances += requests.len();
                    }
                    None => coin_open = false,
                },
                token = self.token_rx.recv(), if token_open => match token {
                    Some(requests) => {
                        debug!(count = requests.len(), first = ?requests.first(), "Token balance refresh requested");
                        totals.token_balances += requests.len();
                    }
                    None => token_open = false,
                },
            }
        }
        info!(coin_balances = totals.coin_balances, token_balances = totals.token_balances, "Refresh consumers finished");
        totals
    }
}
