use std::{env, str::FromStr, time::Duration};

use log::*;
use market_common::helpers::parse_boolean_flag;

use crate::mpe_api::ReconcilerConfig;

const DEFAULT_INVOICE_EXPIRY: Duration = Duration::from_secs(600);
const DEFAULT_INVOICE_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_WALLET_READY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RECEIPT_WAIT_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_BULK_PAY_DELAY: Duration = Duration::from_millis(1_000);
const DEFAULT_EXPIRY_SCAN_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_EVENT_BUFFER_SIZE: usize = 32;
const DEFAULT_DATABASE_URL: &str = "sqlite://data/market_events.db";

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Lifetime of an invoice when the payment rail does not say when it expires
    pub invoice_expiry: Duration,
    pub invoice_request_timeout: Duration,
    pub wallet_ready_timeout: Duration,
    /// How long to wait for a completion signal after a connected wallet accepted a payment
    pub receipt_wait_timeout: Duration,
    pub bulk_pay_delay: Duration,
    pub expiry_scan_interval: Duration,
    /// Channel buffer for hooks and event log subscriptions
    pub event_buffer_size: usize,
    /// The local event store. Read by `SqliteEventStore::from_config`.
    pub database_url: String,
    /// If true, invoices may be skipped and settled later. Never applies during a live bulk payment.
    pub allow_deferred_settlement: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            invoice_expiry: DEFAULT_INVOICE_EXPIRY,
            invoice_request_timeout: DEFAULT_INVOICE_REQUEST_TIMEOUT,
            wallet_ready_timeout: DEFAULT_WALLET_READY_TIMEOUT,
            receipt_wait_timeout: DEFAULT_RECEIPT_WAIT_TIMEOUT,
            bulk_pay_delay: DEFAULT_BULK_PAY_DELAY,
            expiry_scan_interval: DEFAULT_EXPIRY_SCAN_INTERVAL,
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
            database_url: DEFAULT_DATABASE_URL.to_string(),
            allow_deferred_settlement: false,
        }
    }
}

impl EngineConfig {
    pub fn from_env_or_default() -> Self {
        let invoice_expiry = seconds_from_env("MPE_INVOICE_EXPIRY_SECS", DEFAULT_INVOICE_EXPIRY);
        let invoice_request_timeout =
            seconds_from_env("MPE_INVOICE_REQUEST_TIMEOUT_SECS", DEFAULT_INVOICE_REQUEST_TIMEOUT);
        let wallet_ready_timeout = seconds_from_env("MPE_WALLET_READY_TIMEOUT_SECS", DEFAULT_WALLET_READY_TIMEOUT);
        let receipt_wait_timeout = seconds_from_env("MPE_RECEIPT_WAIT_TIMEOUT_SECS", DEFAULT_RECEIPT_WAIT_TIMEOUT);
        let bulk_pay_delay = Duration::from_millis(parse_from_env(
            "MPE_BULK_PAY_DELAY_MS",
            DEFAULT_BULK_PAY_DELAY.as_millis() as u64,
        ));
        let expiry_scan_interval = seconds_from_env("MPE_EXPIRY_SCAN_INTERVAL_SECS", DEFAULT_EXPIRY_SCAN_INTERVAL);
        let event_buffer_size = parse_from_env("MPE_EVENT_BUFFER_SIZE", DEFAULT_EVENT_BUFFER_SIZE).max(1);
        let database_url = env::var("MPE_DATABASE_URL").ok().unwrap_or_else(|| {
            info!("🪛️ MPE_DATABASE_URL is not set. Using the default, {DEFAULT_DATABASE_URL}.");
            DEFAULT_DATABASE_URL.to_string()
        });
        let allow_deferred_settlement = parse_boolean_flag(env::var("MPE_ALLOW_DEFERRED_SETTLEMENT").ok(), false);
        Self {
            invoice_expiry,
            invoice_request_timeout,
            wallet_ready_timeout,
            receipt_wait_timeout,
            bulk_pay_delay,
            expiry_scan_interval,
            event_buffer_size,
            database_url,
            allow_deferred_settlement,
        }
    }

    /// The invoice lifetime as a chrono duration, for timestamp arithmetic.
    pub fn invoice_lifetime(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.invoice_expiry).unwrap_or_else(|_| chrono::Duration::seconds(600))
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            wallet_ready_timeout: self.wallet_ready_timeout,
            receipt_wait_timeout: self.receipt_wait_timeout,
            bulk_pay_delay: self.bulk_pay_delay,
        }
    }
}

fn seconds_from_env(var: &str, default: Duration) -> Duration {
    Duration::from_secs(parse_from_env(var, default.as_secs()))
}

fn parse_from_env<T>(var: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(s) => s.trim().parse::<T>().unwrap_or_else(|e| {
            error!("🪛️ {s} is not a valid value for {var}. {e} Using the default, {default}, instead.");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn env_overrides_defaults() {
        env::set_var("MPE_INVOICE_EXPIRY_SECS", "120");
        env::set_var("MPE_BULK_PAY_DELAY_MS", "not a number");
        env::set_var("MPE_EVENT_BUFFER_SIZE", "0");
        env::set_var("MPE_ALLOW_DEFERRED_SETTLEMENT", "yes");
        env::set_var("MPE_DATABASE_URL", "sqlite://tmp/market.db");
        let config = EngineConfig::from_env_or_default();
        assert_eq!(config.invoice_expiry, Duration::from_secs(120));
        assert_eq!(config.invoice_lifetime(), chrono::Duration::seconds(120));
        assert_eq!(config.bulk_pay_delay, DEFAULT_BULK_PAY_DELAY);
        assert_eq!(config.event_buffer_size, 1);
        assert!(config.allow_deferred_settlement);
        assert_eq!(config.database_url, "sqlite://tmp/market.db");
        assert_eq!(config.reconciler_config().receipt_wait_timeout, DEFAULT_RECEIPT_WAIT_TIMEOUT);
    }
}
