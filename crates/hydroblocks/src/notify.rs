use hydrocore::BlockKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::time::{Duration, Instant};

fn default_true() -> bool {
    true
}

fn default_cooldown() -> u64 {
    900
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
    #[serde(default)]
    pub template: Option<String>,
}

impl Default for NotificationRule {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_secs: None,
            template: None,
        }
    }
}

/// Which block failures produce automatic notifications, and how often
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cooldown")]
    pub default_cooldown_secs: u64,
    #[serde(default)]
    pub per_block: HashMap<String, NotificationRule>,
    #[serde(default)]
    pub per_kind: HashMap<BlockKind, NotificationRule>,
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            default_cooldown_secs: default_cooldown(),
            per_block: HashMap::new(),
            per_kind: HashMap::new(),
        }
    }
}

impl NotificationPolicy {
    /// Block rule first, then kind rule. No rule means no automatic notification.
    pub fn rule_for(&self, block_id: &str, kind: Option<BlockKind>) -> Option<&NotificationRule> {
        self.per_block
            .get(block_id)
            .or_else(|| kind.and_then(|k| self.per_kind.get(&k)))
    }
}

/// Permit to send one notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub template: Option<String>,
}

/// Applies a [`NotificationPolicy`] and rate-limits per block id
#[derive(Debug)]
pub struct NotificationThrottle {
    policy: NotificationPolicy,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl NotificationThrottle {
    pub fn new(policy: NotificationPolicy) -> Self {
        Self {
            policy,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Admits a notification for `block_id` and starts its cooldown.
    pub fn admit(&self, block_id: &str, kind: Option<BlockKind>) -> Option<Admission> {
        if !self.policy.enabled {
            return None;
        }
        let rule = self.policy.rule_for(block_id, kind)?;
        if !rule.enabled {
            return None;
        }

        let cooldown = Duration::from_secs(rule.cooldown_secs.unwrap_or(self.policy.default_cooldown_secs));
        let now = Instant::now();
        let mut last_sent = self
            .last_sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = last_sent.get(block_id) {
            if now.duration_since(*previous) < cooldown {
                tracing::debug!(block = %block_id, "error notification rate limited");
                return None;
            }
        }
        last_sent.insert(block_id.to_string(), now);

        Some(Admission {
            template: rule.template.clone(),
        })
    }
}
