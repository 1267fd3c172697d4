//! Remote activity flags.
//!
//! Activities are boolean system variables that a remote control or the
//! CCU web UI can set. Each one applies to a scope of windows and either
//! suspends automatic control, induces a fixed setting (highest precedence,
//! also ends manual intervention), or sets a constant daytime value.
//!
//! Ventilation "until morning" is kept apart: it only knows which
//! activities to clear once the sun is up.

use std::collections::BTreeSet;

use log::{debug, info, warn};

use crate::device::SysvarStore;

/// Windows an activity applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Windows(BTreeSet<String>),
}

impl Scope {
    pub fn windows<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Scope::Windows(names.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, window: &str) -> bool {
        match self {
            Scope::All => true,
            Scope::Windows(set) => set.contains(window),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActivityKind {
    Suspend {
        scope: Scope,
    },
    InducedSetting {
        value: f64,
        scope: Scope,
    },
    ConstantDaytimeSetting {
        value: f64,
        scope: Scope,
        light_shade_separate: bool,
    },
}

impl ActivityKind {
    pub fn scope(&self) -> &Scope {
        match self {
            ActivityKind::Suspend { scope }
            | ActivityKind::InducedSetting { scope, .. }
            | ActivityKind::ConstantDaytimeSetting { scope, .. } => scope,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Activity {
    /// Name of the system variable
    pub name: String,
    pub active: bool,
    pub kind: ActivityKind,
}

impl Activity {
    pub fn new(name: impl Into<String>, kind: ActivityKind) -> Self {
        Self {
            name: name.into(),
            active: false,
            kind,
        }
    }
}

/// What arbitration decided for one window
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Override {
    Induced(f64),
    ConstantDaytime { value: f64, light_shade_separate: bool },
}

/// Priority-ordered activities
#[derive(Debug, Clone, Default)]
pub struct Arbitrator {
    activities: Vec<Activity>,
}

impl Arbitrator {
    pub fn new(activities: Vec<Activity>) -> Self {
        Self { activities }
    }

    /// Replace the definitions, keeping flags of activities that survive.
    pub fn redefine(&mut self, mut activities: Vec<Activity>) {
        for a in &mut activities {
            if let Some(old) = self.activities.iter().find(|o| o.name == a.name) {
                a.active = old.active;
            }
        }
        self.activities = activities;
    }

    pub fn activities(&self) -> &[Activity] {
        &self.activities
    }

    /// Read every flag from the store. A failed read keeps the old flag.
    pub fn refresh(&mut self, store: &dyn SysvarStore) {
        for a in &mut self.activities {
            match store.get_bool(&a.name) {
                Ok(v) if v != a.active => {
                    info!(target: "overrides", "system variable {} changed to {}", a.name, v);
                    a.active = v;
                }
                Ok(_) => {}
                Err(e) => warn!(target: "overrides", "{}", e),
            }
        }
    }

    pub fn set_active(&mut self, name: &str, active: bool) {
        for a in self.activities.iter_mut().filter(|a| a.name == name) {
            a.active = active;
        }
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.activities.iter().any(|a| a.name == name && a.active)
    }

    pub fn suspended(&self, window: &str) -> bool {
        self.activities.iter().any(|a| {
            a.active && matches!(&a.kind, ActivityKind::Suspend { scope } if scope.contains(window))
        })
    }

    /// An active suspension that covers every window
    pub fn suspended_all(&self) -> bool {
        self.activities
            .iter()
            .any(|a| a.active && matches!(&a.kind, ActivityKind::Suspend { scope: Scope::All }))
    }

    /// Induced settings first, in order; then constant daytime settings.
    pub fn arbitrate(&self, window: &str) -> Option<Override> {
        let active = || self.activities.iter().filter(|a| a.active);

        let induced = active().find_map(|a| match &a.kind {
            ActivityKind::InducedSetting { value, scope } if scope.contains(window) => {
                Some(Override::Induced(*value))
            }
            _ => None,
        });
        if induced.is_some() {
            return induced;
        }

        active().find_map(|a| match &a.kind {
            ActivityKind::ConstantDaytimeSetting {
                value,
                scope,
                light_shade_separate,
            } if scope.contains(window) => Some(Override::ConstantDaytime {
                value: *value,
                light_shade_separate: *light_shade_separate,
            }),
            _ => None,
        })
    }
}

/// "Ventilate until morning": keeps listed ventilation activities running
/// through the night and clears them once the sun is up.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VentilationSchedule {
    pub flag: String,
    pub activities: Vec<String>,
    active: bool,
}

impl VentilationSchedule {
    pub fn new(flag: impl Into<String>, activities: Vec<String>) -> Self {
        Self {
            flag: flag.into(),
            activities,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn refresh(&mut self, store: &dyn SysvarStore) {
        if self.flag.is_empty() {
            return;
        }
        match store.get_bool(&self.flag) {
            Ok(v) => self.active = v,
            Err(e) => warn!(target: "overrides", "{}", e),
        }
    }

    /// Returns true if a reset happened. Nothing is reset while all
    /// windows are suspended.
    pub fn reset_in_the_morning(
        &mut self,
        sun_is_up: bool,
        arbitrator: &mut Arbitrator,
        store: &dyn SysvarStore,
    ) -> bool {
        if !self.active || !sun_is_up {
            return false;
        }
        if arbitrator.suspended_all() {
            debug!(target: "overrides", "all windows suspended, ventilation reset deferred");
            return false;
        }
        info!(target: "overrides", "resetting ventilation activities in the morning");
        for name in &self.activities {
            if let Err(e) = store.set_bool(name, false) {
                warn!(target: "overrides", "{}", e);
            }
            arbitrator.set_active(name, false);
        }
        if let Err(e) = store.set_bool(&self.flag, false) {
            warn!(target: "overrides", "{}", e);
        }
        self.active = false;
        true
    }
}
