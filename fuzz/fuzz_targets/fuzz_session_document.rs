#![no_main]

use botb_session_sync::protocol::SessionDocument;
use botb_session_sync::session::SessionCore;
use botb_session_sync::{SessionConfig, Snapshot};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(document) = serde_json::from_slice::<SessionDocument>(data) else {
        return;
    };

    // Any parseable document must reconcile and tick without panicking,
    // confirmed or not.
    let mut core = SessionCore::new(&SessionConfig::new());
    let _ = core.begin_subscription(0);
    for pending in [true, false] {
        let snapshot = Snapshot {
            document: Some(document.clone()),
            has_pending_writes: pending,
        };
        let _ = core.apply_snapshot(&snapshot, 1_000);
        let _ = core.tick(1_050);
    }
    let _ = core.scoreboard().totals();
});
