// Echo suppression: drop inbound PDUs that are our own traffic reflected
// back by the proxy

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Upper bound on remembered digests
const MAX_TRACKED: usize = 256;

/// Remembers digests of recently sent network PDUs
#[derive(Debug)]
pub struct EchoFilter {
    window: Duration,
    recent: Mutex<VecDeque<(blake3::Hash, Instant)>>,
}

impl EchoFilter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    fn prune(recent: &mut VecDeque<(blake3::Hash, Instant)>, window: Duration, now: Instant) {
        while let Some((_, at)) = recent.front() {
            if now.saturating_duration_since(*at) > window || recent.len() > MAX_TRACKED {
                recent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Note a PDU we just sent
    pub fn record(&self, pdu: &[u8]) {
        let now = Instant::now();
        let mut recent = self.recent.lock();
        recent.push_back((blake3::hash(pdu), now));
        Self::prune(&mut recent, self.window, now);
    }

    /// True when `pdu` is byte-identical to something sent within the window
    pub fn is_echo(&self, pdu: &[u8]) -> bool {
        let now = Instant::now();
        let digest = blake3::hash(pdu);
        let mut recent = self.recent.lock();
        Self::prune(&mut recent, self.window, now);
        recent.iter().any(|(h, _)| *h == digest)
    }

    pub fn len(&self) -> usize {
        self.recent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
