//! Per-service admission control for inbound sessions.
//!
//! # Responsibilities
//! - Cap concurrent inbound sessions per logical service
//! - Hand out an [`AdmissionPermit`] that releases its slot exactly once
//! - Apply ceiling changes from config reloads without dropping counters
//!
//! # Design Decisions
//! - Compare-and-swap admission: a rejected attempt never touches the count
//! - Release is tied to the permit's lifetime, so a slot cannot be released
//!   twice and the count cannot underflow
//! - A lowered ceiling never evicts admitted sessions; it only blocks new ones

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::config::AdmissionConfig;
use crate::observability::metrics;

/// Ceiling applied to services without an explicit entry.
pub const DEFAULT_CEILING: usize = 5;

/// An inbound session was refused because its service is full.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("service [{service}] reached its maximum of {ceiling} concurrent connections")]
pub struct AdmissionRejected {
    pub service: String,
    pub ceiling: usize,
}

#[derive(Debug)]
pub struct AdmissionController {
    default_ceiling: usize,
    ceilings: ArcSwap<HashMap<String, usize>>,
    counters: DashMap<String, Arc<AtomicUsize>>,
}

impl AdmissionController {
    pub fn new(default_ceiling: usize, ceilings: HashMap<String, usize>) -> Self {
        Self {
            default_ceiling,
            ceilings: ArcSwap::from_pointee(ceilings),
            counters: DashMap::new(),
        }
    }

    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self::new(config.default_ceiling, config.services.clone())
    }

    /// Ceiling currently in force for `service`.
    pub fn ceiling(&self, service: &str) -> usize {
        self.ceilings
            .load()
            .get(service)
            .copied()
            .unwrap_or(self.default_ceiling)
    }

    /// Sessions currently admitted for `service`.
    pub fn active(&self, service: &str) -> usize {
        self.counters
            .get(service)
            .map_or(0, |count| count.load(Ordering::Acquire))
    }

    /// Replace per-service ceilings. Admitted sessions are unaffected.
    pub fn update_ceilings(&self, ceilings: HashMap<String, usize>) {
        tracing::info!(services = ceilings.len(), "Admission ceilings updated");
        self.ceilings.store(Arc::new(ceilings));
    }

    fn counter(&self, service: &str) -> Arc<AtomicUsize> {
        if let Some(counter) = self.counters.get(service) {
            return Arc::clone(counter.value());
        }
        self.counters
            .entry(service.to_owned())
            .or_default()
            .value()
            .clone()
    }

    /// Take a slot for `service`, or report the ceiling it hit.
    pub fn try_admit(&self, service: &str) -> Result<AdmissionPermit, AdmissionRejected> {
        let ceiling = self.ceiling(service);
        let counter = self.counter(service);

        let mut current = counter.load(Ordering::Acquire);
        loop {
            if current >= ceiling {
                metrics::record_admission_rejected(service);
                tracing::warn!(service = %service, ceiling, active = current, "Admission rejected");
                return Err(AdmissionRejected {
                    service: service.to_owned(),
                    ceiling,
                });
            }
            match counter.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        tracing::debug!(service = %service, active = current + 1, ceiling, "Session admitted");
        Ok(AdmissionPermit {
            service: service.to_owned(),
            counter,
            released: false,
        })
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(DEFAULT_CEILING, HashMap::new())
    }
}

/// One admitted slot. Released on drop or by [`AdmissionPermit::release`].
#[derive(Debug)]
pub struct AdmissionPermit {
    service: String,
    counter: Arc<AtomicUsize>,
    released: bool,
}

impl AdmissionPermit {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn release(mut self) {
        self.release_slot();
    }

    fn release_slot(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let result = self
            .counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if result.is_err() {
            tracing::error!(service = %self.service, "Admission counter already at zero");
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.release_slot();
    }
}
