use std::time::{Duration, SystemTime, UNIX_EPOCH};
use serde_derive::{Deserialize, Serialize};

// Hybrid Logical Clock: physical milliseconds paired with a logical counter
// and a node id tie-breaker. The derived Ord is lexicographic over
// (physical, logical, node_id), which is exactly the causal order the LWW
// merge relies on: e happened-before e' implies hlc(e) < hlc(e').
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hlc {

    #[serde(rename = "pt")]
    pub physical: i64,

    #[serde(rename = "lt")]
    pub logical: i64,

    pub node_id: String,

}

fn wall_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl Hlc {

    pub fn new(node_id: &str) -> Self {
        Self {
            physical: wall_now_ms(),
            logical: 0,
            node_id: node_id.to_string(),
        }
    }

    // Local event: advance to wall time, or bump the logical counter when the
    // wall clock stalled or went backwards.
    pub fn tick(&mut self) {
        let now = wall_now_ms();
        if now > self.physical {
            self.physical = now;
            self.logical = 0;
        } else {
            self.logical += 1;
        }
    }

    // Inbound message: take the maximum of local, message and wall physical
    // time, then advance the logical counter past whichever side supplied it.
    pub fn observe(&mut self, msg: &Hlc) {
        let now = wall_now_ms();
        let max_physical = self.physical.max(msg.physical).max(now);

        if max_physical == self.physical && max_physical == msg.physical {
            self.logical = self.logical.max(msg.logical) + 1;
        } else if max_physical == msg.physical {
            self.physical = msg.physical;
            self.logical = msg.logical + 1;
        } else if max_physical == now {
            self.physical = now;
            self.logical = self.logical.max(msg.logical) + 1;
        } else {
            self.logical = self.logical.max(msg.logical) + 1;
        }
    }

    pub fn after(&self, other: &Hlc) -> bool {
        self > other
    }

    // Shifts the physical component back; used for GC thresholds.
    pub fn minus(&self, d: Duration) -> Hlc {
        Hlc {
            physical: self.physical - d.as_millis() as i64,
            logical: self.logical,
            node_id: self.node_id.clone(),
        }
    }
}

impl std::fmt::Display for Hlc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{pt:{}, lt:{}, node:{}}}", self.physical, self.logical, self.node_id)
    }
}
