//! Shared rig for channel tests: a software falcon plus a channel over it.

#![allow(dead_code)]

use pmu_driver::backends::{FalconGeometry, SoftwareFalcon};
use pmu_driver::{ChannelConfig, PmuChannel, Response, Result, SeqDesc};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Rig {
    pub falcon: Arc<SoftwareFalcon>,
    pub channel: PmuChannel,
}

pub fn config() -> ChannelConfig {
    ChannelConfig {
        command_timeout: Duration::from_millis(200),
        ..ChannelConfig::default()
    }
    .with_ack_timeout(Duration::from_secs(2))
    .with_enable_allow_delay(Duration::from_millis(50))
}

/// Channel booted by calling `on_notification` by hand; no notifier thread.
pub fn booted() -> Rig {
    booted_with(FalconGeometry::default(), config())
}

pub fn booted_with(geometry: FalconGeometry, config: ChannelConfig) -> Rig {
    let falcon = Arc::new(SoftwareFalcon::with_geometry(geometry));
    let channel = PmuChannel::new(falcon.clone(), config);
    channel.init().unwrap();
    falcon.boot();
    // INIT, then the three power-gating replies.
    channel.on_notification();
    channel.on_notification();
    channel.wait_boot_handshake().unwrap();
    assert_eq!(channel.sequences_in_use(), 0);
    Rig { falcon, channel }
}

/// Channel booted through the notifier thread.
pub fn booted_with_notifier(config: ChannelConfig) -> Rig {
    let falcon = Arc::new(SoftwareFalcon::new());
    let irq = falcon.connect_irq();
    let channel = PmuChannel::new(falcon.clone(), config);
    channel.init().unwrap();
    channel.start_notifier(irq).unwrap();
    falcon.boot();
    channel.wait_boot_handshake().unwrap();
    Rig { falcon, channel }
}

/// Completion that forwards its outcome over a channel.
pub fn recorder() -> (
    impl FnOnce(SeqDesc, Result<Response>) + Send + 'static,
    Receiver<(SeqDesc, Result<Response>)>,
) {
    let (tx, rx) = mpsc::channel();
    let completion = move |desc: SeqDesc, result: Result<Response>| {
        let _ = tx.send((desc, result));
    };
    (completion, rx)
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
