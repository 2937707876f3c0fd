//! Converge checks – classifiers for the conditions integration scenarios wait on.
//!
//! Every classifier here is a pure function of the object it is handed. The
//! "reach a state" checks read absence as pending; only [`Absent`] resolves on it.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use converge_core::{Classification, Classifier, Observed};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::core::DynamicObject;

/// Capacity key for volumes and claims.
pub const STORAGE: &str = "storage";

fn storage(capacity: Option<&BTreeMap<String, Quantity>>) -> Option<&Quantity> {
    capacity.and_then(|c| c.get(STORAGE))
}

pub fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

pub fn volume_capacity(pv: &PersistentVolume) -> Option<&Quantity> {
    storage(pv.spec.as_ref().and_then(|s| s.capacity.as_ref()))
}

pub fn claim_capacity(pvc: &PersistentVolumeClaim) -> Option<&Quantity> {
    storage(pvc.status.as_ref().and_then(|s| s.capacity.as_ref()))
}

/// Pod is `Running`. A terminated pod (`Failed` or `Succeeded`) will never get there.
#[derive(Debug, Clone, Copy, Default)]
pub struct PodRunning;

impl Classifier<Pod> for PodRunning {
    type Output = Pod;

    fn classify(&self, observed: Observed<'_, Pod>) -> Classification<Pod> {
        let Some(pod) = observed.present() else {
            return Classification::Pending;
        };
        match pod_phase(pod) {
            Some("Running") => Classification::Success(pod.clone()),
            Some(phase @ ("Failed" | "Succeeded")) => Classification::failed(format!("pod status is {} (terminated)", phase)),
            _ => Classification::Pending,
        }
    }
}

/// Volume is bound and its `spec.capacity.storage` differs from `baseline`.
#[derive(Debug, Clone)]
pub struct VolumeCapacityChanged {
    pub baseline: Quantity,
}

impl Classifier<PersistentVolume> for VolumeCapacityChanged {
    type Output = PersistentVolume;

    fn classify(&self, observed: Observed<'_, PersistentVolume>) -> Classification<PersistentVolume> {
        let Some(pv) = observed.present() else {
            return Classification::Pending;
        };
        let phase = pv.status.as_ref().and_then(|s| s.phase.as_deref());
        match (phase, volume_capacity(pv)) {
            (Some("Failed"), _) => Classification::failed("persistent volume status is Failed"),
            (Some("Bound"), Some(current)) if *current != self.baseline => Classification::Success(pv.clone()),
            _ => Classification::Pending,
        }
    }
}

/// Claim is bound and its `status.capacity.storage` differs from `baseline`.
#[derive(Debug, Clone)]
pub struct ClaimCapacityChanged {
    pub baseline: Quantity,
}

impl Classifier<PersistentVolumeClaim> for ClaimCapacityChanged {
    type Output = PersistentVolumeClaim;

    fn classify(&self, observed: Observed<'_, PersistentVolumeClaim>) -> Classification<PersistentVolumeClaim> {
        let Some(pvc) = observed.present() else {
            return Classification::Pending;
        };
        let phase = pvc.status.as_ref().and_then(|s| s.phase.as_deref());
        match (phase, claim_capacity(pvc)) {
            (Some("Lost"), _) => Classification::failed("persistent volume claim status is Lost"),
            (Some("Bound"), Some(current)) if *current != self.baseline => Classification::Success(pvc.clone()),
            _ => Classification::Pending,
        }
    }
}

/// Resource no longer exists. Used for deletion waits.
#[derive(Debug, Clone, Copy, Default)]
pub struct Absent;

impl<S> Classifier<S> for Absent {
    type Output = ();

    fn classify(&self, observed: Observed<'_, S>) -> Classification<()> {
        match observed {
            Observed::Absent => Classification::Success(()),
            Observed::Present(_) => Classification::Pending,
        }
    }
}

/// A listing holds exactly `expected` items, whatever their state.
#[derive(Debug, Clone, Copy)]
pub struct CountEquals {
    pub expected: usize,
}

impl<K> Classifier<Vec<K>> for CountEquals
where
    K: Clone + Send + Sync + 'static,
{
    type Output = Vec<K>;

    fn classify(&self, observed: Observed<'_, Vec<K>>) -> Classification<Vec<K>> {
        match observed.present() {
            Some(items) if items.len() == self.expected => Classification::Success(items.clone()),
            _ => Classification::Pending,
        }
    }
}

/// Volume snapshot reports `status.readyToUse: true`; `status.error` is terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotReady;

impl Classifier<DynamicObject> for SnapshotReady {
    type Output = DynamicObject;

    fn classify(&self, observed: Observed<'_, DynamicObject>) -> Classification<DynamicObject> {
        let Some(snap) = observed.present() else {
            return Classification::Pending;
        };
        let status = snap.data.get("status");
        if let Some(err) = status.and_then(|s| s.get("error")).filter(|e| !e.is_null()) {
            let msg = err.get("message").and_then(|m| m.as_str()).unwrap_or("unknown error");
            return Classification::failed(format!("snapshot error: {}", msg));
        }
        match status.and_then(|s| s.get("readyToUse")).and_then(|r| r.as_bool()) {
            Some(true) => Classification::Success(snap.clone()),
            _ => Classification::Pending,
        }
    }
}
