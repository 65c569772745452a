use std::time::Duration;

use coalescer_service::{Coalescer, CoalescerConfig, HttpExecutor};
use coalescer_test as test;

pub use test::{HitCounter, Server};

/// Setup tests and create a coalescer talking to a fresh [`HitCounter`].
///
/// Retries back off in milliseconds, so that failing requests finish quickly. The
/// `update_config` closure can modify any default configuration before the coalescer is
/// created.
///
/// Keep the returned server around until the test has finished.
pub fn setup_coalescer(
    update_config: impl FnOnce(&mut CoalescerConfig),
) -> (Coalescer, HitCounter) {
    setup_coalescer_with(true, update_config)
}

/// Like [`setup_coalescer`], but with the given initial connectivity.
pub fn setup_coalescer_with(
    online: bool,
    update_config: impl FnOnce(&mut CoalescerConfig),
) -> (Coalescer, HitCounter) {
    test::setup();

    let server = HitCounter::new();

    let mut config = CoalescerConfig {
        retry_base_delay: Duration::from_millis(5),
        retry_max_delay: Duration::from_millis(20),
        batch_window: Duration::from_millis(10),
        ..Default::default()
    };
    update_config(&mut config);

    let executor = HttpExecutor::default().with_base_url(server.base_url());
    let coalescer = Coalescer::builder(config)
        .executor(executor)
        .online(online)
        .build();

    (coalescer, server)
}
