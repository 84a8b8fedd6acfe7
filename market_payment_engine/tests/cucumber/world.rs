use std::{collections::HashMap, fmt::Debug, sync::Arc, time::Duration};

use cucumber::World;
use log::*;
use market_payment_engine::{
    events::EventProducers,
    mpe_api::{checkout_objects::Cart, CheckoutOutcome},
    order_types::PublicKey,
    split::Share,
    test_utils::{
        mock_rail::MockRail,
        prepare_env::{prepare_test_env, random_db_path},
    },
    EngineConfig,
    InvoiceLedger,
    InvoiceOrchestrator,
    OrderFlowApi,
    PaymentReconciler,
    SqliteEventStore,
};
use tokio::time::sleep;

#[derive(Default, Debug, World)]
pub struct MarketWorld {
    pub system: Option<MarketSystem>,
    pub cart: Option<Cart>,
    pub splits: HashMap<PublicKey, Vec<Share>>,
    pub outcome: Option<CheckoutOutcome>,
    pub last_error: Option<String>,
    /// How many completion signals in the last step actually settled an invoice
    pub settled_signals: usize,
}

pub struct MarketSystem {
    pub db_path: String,
    pub buyer: PublicKey,
    pub store: SqliteEventStore,
    pub rail: Arc<MockRail>,
    pub ledger: InvoiceLedger,
    pub orchestrator: InvoiceOrchestrator,
    pub reconciler: PaymentReconciler,
    pub orders: OrderFlowApi<SqliteEventStore>,
}

impl Debug for MarketSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MarketSystem ({}, buyer {})", self.db_path, self.buyer)
    }
}

impl MarketWorld {
    pub fn system(&self) -> &MarketSystem {
        self.system.as_ref().expect("Marketplace not initialised")
    }

    pub fn outcome(&self) -> &CheckoutOutcome {
        self.outcome.as_ref().expect("The buyer has not checked out yet")
    }
}

impl MarketSystem {
    pub async fn new(buyer: PublicKey) -> Self {
        let url = random_db_path();
        prepare_test_env(&url).await;
        let config = EngineConfig {
            database_url: url.clone(),
            bulk_pay_delay: Duration::from_millis(5),
            wallet_ready_timeout: Duration::from_millis(500),
            receipt_wait_timeout: Duration::from_millis(500),
            invoice_request_timeout: Duration::from_secs(2),
            ..EngineConfig::default()
        };
        let store = SqliteEventStore::from_config(&config).await.expect("Error creating connection to database");
        debug!("Created database: {url}");
        sleep(Duration::from_millis(50)).await;
        let rail = Arc::new(MockRail::new("mock"));
        let ledger = InvoiceLedger::new(config.invoice_lifetime(), config.allow_deferred_settlement);
        let orchestrator = InvoiceOrchestrator::new(ledger.clone(), rail.clone(), config.invoice_request_timeout);
        let reconciler = PaymentReconciler::new(
            ledger.clone(),
            Arc::new(store.clone()),
            buyer.clone(),
            EventProducers::default(),
            config.reconciler_config(),
        );
        let orders = OrderFlowApi::new(store.clone(), EventProducers::default());
        Self { db_path: url, buyer, store, rail, ledger, orchestrator, reconciler, orders }
    }
}
