use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio::sync::watch;

/// Connection class as reported by the platform
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EffectiveType {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl EffectiveType {
    /// Maximum number of simultaneous in-flight requests for this class
    pub fn concurrency_limit(self) -> usize {
        match self {
            EffectiveType::Slow2g | EffectiveType::TwoG => 1,
            EffectiveType::ThreeG => 2,
            EffectiveType::FourG | EffectiveType::Unknown => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EffectiveType::Slow2g => "slow-2g",
            EffectiveType::TwoG => "2g",
            EffectiveType::ThreeG => "3g",
            EffectiveType::FourG => "4g",
            EffectiveType::Unknown => "unknown",
        }
    }
}

impl FromStr for EffectiveType {
    type Err = std::convert::Infallible;

    /// Unrecognised values map to `Unknown` rather than failing
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "slow-2g" => EffectiveType::Slow2g,
            "2g" => EffectiveType::TwoG,
            "3g" => EffectiveType::ThreeG,
            "4g" => EffectiveType::FourG,
            _ => EffectiveType::Unknown,
        })
    }
}

impl std::fmt::Display for EffectiveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub effective_type: EffectiveType,
    pub online: bool,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self {
            effective_type: EffectiveType::Unknown,
            online: true,
        }
    }
}

/// Observable network-quality signal.
///
/// The platform layer pushes updates in; consumers hold a
/// [`watch::Receiver`] and react to changes.
#[derive(Debug)]
pub struct NetworkMonitor {
    tx: watch::Sender<NetworkStatus>,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::default())
    }
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn status(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.status().online
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }

    /// Publish a new status; receivers are only woken on an actual change
    pub fn update(&self, status: NetworkStatus) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            tracing::debug!(
                "Network status changed: {} online={}",
                status.effective_type,
                status.online
            );
        }
    }

    pub fn set_effective_type(&self, effective_type: EffectiveType) {
        let mut status = self.status();
        status.effective_type = effective_type;
        self.update(status);
    }

    pub fn set_online(&self, online: bool) {
        let mut status = self.status();
        status.online = online;
        self.update(status);
    }
}
