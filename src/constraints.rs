//! Launch constraints and the evaluator interface that reports on them
//!
//! The engine never owns device state. It asks a [`ConstraintEvaluator`]
//! whether a [`Constraints`] set currently holds before every stage launch
//! and every retry attempt, and re-asks whenever the evaluator signals a
//! change or the poll interval elapses.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Required network state
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    #[default]
    NotRequired,
    Connected,
    Unmetered,
    NotRoaming,
    Metered,
}

/// Declarative launch preconditions. All set requirements must hold.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Constraints {
    pub requires_charging: bool,
    pub network: NetworkType,
    pub requires_battery_not_low: bool,
    pub requires_storage_not_low: bool,
    pub requires_device_idle: bool,
}

impl Constraints {
    /// No requirements at all
    pub fn none() -> Self {
        Self::default()
    }

    pub fn requires_charging(mut self, value: bool) -> Self {
        self.requires_charging = value;
        self
    }

    pub fn network(mut self, network: NetworkType) -> Self {
        self.network = network;
        self
    }

    pub fn requires_battery_not_low(mut self, value: bool) -> Self {
        self.requires_battery_not_low = value;
        self
    }

    pub fn requires_storage_not_low(mut self, value: bool) -> Self {
        self.requires_storage_not_low = value;
        self
    }

    pub fn requires_device_idle(mut self, value: bool) -> Self {
        self.requires_device_idle = value;
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Union of two sets: a requirement set in either is required.
    ///
    /// For the network requirement the stricter (higher) variant wins.
    pub fn union(&self, other: &Constraints) -> Constraints {
        Constraints {
            requires_charging: self.requires_charging || other.requires_charging,
            network: self.network.max(other.network),
            requires_battery_not_low: self.requires_battery_not_low
                || other.requires_battery_not_low,
            requires_storage_not_low: self.requires_storage_not_low
                || other.requires_storage_not_low,
            requires_device_idle: self.requires_device_idle || other.requires_device_idle,
        }
    }
}

/// External collaborator reporting whether constraints currently hold
#[async_trait]
pub trait ConstraintEvaluator: Send + Sync {
    /// Whether every requirement in `constraints` holds right now
    fn currently_satisfied(&self, constraints: &Constraints) -> bool;

    /// Resolves when conditions may have changed.
    ///
    /// Evaluators without change notification keep the default, and the
    /// engine falls back to polling.
    async fn changed(&self) {
        std::future::pending::<()>().await
    }
}

/// Evaluator that never blocks: every constraint is reported as satisfied
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysSatisfied;

#[async_trait]
impl ConstraintEvaluator for AlwaysSatisfied {
    fn currently_satisfied(&self, _constraints: &Constraints) -> bool {
        true
    }
}

/// Point-in-time view of the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub charging: bool,
    /// `None` when offline
    pub network: Option<ConnectedNetwork>,
    pub battery_low: bool,
    pub storage_low: bool,
    pub idle: bool,
}

/// Properties of the active network connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedNetwork {
    pub metered: bool,
    pub roaming: bool,
}

impl DeviceSnapshot {
    /// Whether this device state satisfies `constraints`
    pub fn satisfies(&self, constraints: &Constraints) -> bool {
        if constraints.requires_charging && !self.charging {
            return false;
        }
        if constraints.requires_battery_not_low && self.battery_low {
            return false;
        }
        if constraints.requires_storage_not_low && self.storage_low {
            return false;
        }
        if constraints.requires_device_idle && !self.idle {
            return false;
        }

        match (constraints.network, self.network) {
            (NetworkType::NotRequired, _) => true,
            (_, None) => false,
            (NetworkType::Connected, Some(_)) => true,
            (NetworkType::Unmetered, Some(net)) => !net.metered,
            (NetworkType::NotRoaming, Some(net)) => !net.roaming,
            (NetworkType::Metered, Some(net)) => net.metered,
        }
    }
}

/// In-process device state that callers update, with change notification.
///
/// Stands in for the OS service that reports power and connectivity.
#[derive(Debug, Clone)]
pub struct DeviceConditions {
    tx: Arc<watch::Sender<DeviceSnapshot>>,
}

impl DeviceConditions {
    pub fn new(initial: DeviceSnapshot) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        *self.tx.borrow()
    }

    /// Apply `update` to the current snapshot and notify waiters.
    pub fn update(&self, update: impl FnOnce(&mut DeviceSnapshot)) {
        self.tx.send_modify(update);
        debug!("Device conditions changed: {:?}", self.snapshot());
    }

    pub fn set_charging(&self, charging: bool) {
        self.update(|s| s.charging = charging);
    }

    pub fn set_network(&self, network: Option<ConnectedNetwork>) {
        self.update(|s| s.network = network);
    }

    pub fn set_battery_low(&self, low: bool) {
        self.update(|s| s.battery_low = low);
    }

    pub fn set_storage_low(&self, low: bool) {
        self.update(|s| s.storage_low = low);
    }

    pub fn set_idle(&self, idle: bool) {
        self.update(|s| s.idle = idle);
    }
}

impl Default for DeviceConditions {
    fn default() -> Self {
        Self::new(DeviceSnapshot::default())
    }
}

#[async_trait]
impl ConstraintEvaluator for DeviceConditions {
    fn currently_satisfied(&self, constraints: &Constraints) -> bool {
        self.tx.borrow().satisfies(constraints)
    }

    async fn changed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on change.
        let _ = rx.changed().await;
    }
}
