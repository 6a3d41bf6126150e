use std::collections::HashMap;

use egd_core::config::{Acquisition, SourceConfig};
use egd_core::source::{run_cycle, SourceRuntime};

fn refusing_url_source() -> SourceConfig {
    SourceConfig {
        name: "refusing".to_string(),
        // Port 1 on loopback is a privileged port nothing listens on in a
        // test sandbox: connection is refused immediately.
        acquisition: Acquisition::Url { url: "http://127.0.0.1:1/".to_string(), prefetch: None },
        interval_secs: 10,
        scale: 1.0,
        size: None,
        min_size: None,
        no_compress: true,
        init_delay_secs: 0,
        disabled: false,
        insecure_tls: false,
        custom: HashMap::new(),
    }
}

#[tokio::test]
async fn scenario_s5_disables_after_five_consecutive_failures() {
    let config = refusing_url_source();
    let mut runtime = SourceRuntime::new(0);

    for attempt in 1..=5 {
        let outcome = run_cycle(&config, &mut runtime).await;
        assert!(outcome.processed.is_none(), "attempt {attempt} should fail");
    }

    assert!(runtime.disabled);
    assert!(!runtime.is_due(chrono::Utc::now(), config.interval_secs), "6th tick must not attempt a fetch");
}
