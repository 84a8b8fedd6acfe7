pub mod mock_rail;
#[cfg(feature = "sqlite")]
pub mod prepare_env;

/// Initialises logging for tests. Safe to call more than once.
pub fn init_test_logging() {
    dotenvy::from_filename(".env.test").ok();
    let _ = env_logger::try_init();
}
