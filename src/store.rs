//! Published variable store.
//!
//! Holds the values the web layer reads (`Temperature_Fahrenheit`,
//! `Humidity_Percentage`, `Moisture_Percentage`). Reads are open to anyone;
//! writes go through a [`VariableWriter`], and only one writer can ever be
//! claimed per variable.

use crate::domain::PublishedVariable;
use crate::error::ConfigError;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// value reported before the first successful sample
pub const UNSET: i32 = i32::MIN;

#[derive(Debug, Clone, Copy)]
struct Slot {
    value: i32,
    updated: Option<Instant>,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            value: UNSET,
            updated: None,
        }
    }
}

pub struct PublishedVariableStore {
    slots: RwLock<[Slot; 3]>,
    claimed: [AtomicBool; 3],
}

/// JSON view of one variable
#[derive(Debug, Clone, Serialize)]
pub struct VariableView {
    pub name: PublishedVariable,
    /// `None` until the first successful sample
    pub value: Option<i32>,
    /// milliseconds since the last successful write
    pub age_ms: Option<u64>,
}

impl PublishedVariableStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: RwLock::new([Slot::default(); 3]),
            claimed: Default::default(),
        })
    }

    /// claim the single write path for `name`
    pub fn claim_writer(
        self: &Arc<Self>,
        name: PublishedVariable,
    ) -> Result<VariableWriter, ConfigError> {
        if self.claimed[name.index()].swap(true, Ordering::SeqCst) {
            return Err(ConfigError::VariableAlreadyOwned(name.as_str()));
        }
        Ok(VariableWriter {
            store: self.clone(),
            name,
        })
    }

    /// most recent successfully set value, or [`UNSET`]
    pub fn get(&self, name: PublishedVariable) -> i32 {
        self.read_slot(name).value
    }

    /// time since the last successful write
    pub fn age(&self, name: PublishedVariable) -> Option<Duration> {
        self.read_slot(name).updated.map(|t| t.elapsed())
    }

    pub fn view(&self, name: PublishedVariable) -> VariableView {
        // a slot never goes back to unset, so a present age means get() is real
        let age = self.age(name);
        VariableView {
            name,
            value: age.map(|_| self.get(name)),
            age_ms: age.map(|a| a.as_millis() as u64),
        }
    }

    pub fn snapshot(&self) -> Vec<VariableView> {
        PublishedVariable::ALL.iter().map(|v| self.view(*v)).collect()
    }

    fn read_slot(&self, name: PublishedVariable) -> Slot {
        // slots are Copy and written whole, so a poisoned lock still holds a
        // consistent value
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots[name.index()]
    }
}

/// exclusive write access to one published variable
pub struct VariableWriter {
    store: Arc<PublishedVariableStore>,
    name: PublishedVariable,
}

impl VariableWriter {
    pub fn name(&self) -> PublishedVariable {
        self.name
    }

    pub fn set(&self, value: i32) {
        let mut slots = self.store.slots.write().unwrap_or_else(|e| e.into_inner());
        slots[self.name.index()] = Slot {
            value,
            updated: Some(Instant::now()),
        };
    }
}

impl std::fmt::Debug for VariableWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariableWriter").field("name", &self.name).finish()
    }
}
