//! Per-window decision cycle.
//!
//! For every window, in order:
//!   suspension check -> sunlit (debounced) -> base table lookup ->
//!   activity override -> close at night -> read level, detect manual
//!   operation -> calibrate -> gated write -> settle
//!
//! Device failures are logged and leave that window untouched; the other
//! windows are still served in the same cycle.

use log::{debug, error, info, warn};

use crate::brightness::BrightnessCondition;
use crate::config::{Params, WindowDef};
use crate::device::{self, Home, Shutter};
use crate::horizon::{Sunlit, SunlitDebounce};
use crate::manual::{self, ManualDetector, WindowState};
use crate::overrides::{Arbitrator, Override};
use crate::solar::SunState;
use crate::temperature::TemperatureCondition;
use crate::Clock;

/// A write issued by the controller
#[derive(Debug, Clone, PartialEq)]
pub struct ShutterCommand {
    pub window: String,
    pub nominal: f64,
    pub success: bool,
}

/// Everything a cycle decides on besides the windows themselves
#[derive(Debug, Clone)]
pub struct CycleInput<'a> {
    pub now: i64,
    pub sun: &'a SunState,
    pub sun_is_up: bool,
    /// Civil night: ordinary writes are held back
    pub night: bool,
    pub temperature: TemperatureCondition,
    pub brightness: BrightnessCondition,
}

pub struct Window {
    pub def: WindowDef,
    shutter: Box<dyn Shutter>,
    pub state: WindowState,
    pub debounce: SunlitDebounce,
}

impl Window {
    pub fn new(def: WindowDef, shutter: Box<dyn Shutter>) -> Self {
        Self {
            def,
            shutter,
            state: WindowState::default(),
            debounce: SunlitDebounce::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// The true setting this cycle, before calibration.
    fn target(
        &mut self,
        params: &Params,
        input: &CycleInput<'_>,
        ovr: Option<Override>,
    ) -> f64 {
        let sunlit = self
            .debounce
            .update(&self.def.name, &self.def.profile, input.sun);
        let base = params.table.get(input.temperature, input.brightness, sunlit);

        let setting = match ovr {
            Some(Override::Induced(v)) => v,
            Some(Override::ConstantDaytime {
                light_shade_separate: true,
                ..
            }) if sunlit == Sunlit::Shade => {
                params
                    .table
                    .get(input.temperature, BrightnessCondition::VeryBright, Sunlit::Shade)
            }
            Some(Override::ConstantDaytime { value, .. }) => value,
            None => base,
        };
        debug!(
            target: "controller",
            "{}: {} -> base {:.2}, setting {:.2}",
            self.def.name,
            sunlit,
            base,
            setting
        );
        setting
    }

    /// Run one decision for this window. Returns the write, if any.
    fn decide(
        &mut self,
        params: &Params,
        input: &CycleInput<'_>,
        arbitrator: &Arbitrator,
        clock: &dyn Clock,
    ) -> Option<ShutterCommand> {
        let ovr = arbitrator.arbitrate(&self.def.name);
        let induced = matches!(ovr, Some(Override::Induced(_)));

        let mut setting = self.target(params, input, ovr);
        if induced {
            self.state.release();
        } else if !input.sun_is_up {
            setting = 0.0;
        }

        let raw = match device::read_level(self.shutter.as_ref()) {
            Ok(v) => v,
            Err(e) => {
                warn!(target: "controller", "{}: {}", self.def.name, e);
                return None;
            }
        };

        let edge = if induced {
            self.state.last_observed = Some(raw);
            false
        } else {
            ManualDetector::new(params.shutter_setting_tolerance)
                .observe(&self.def.name, &mut self.state, raw, input.now)
                .edge
        };

        let nominal = self.def.calibration.true_to_nominal(setting);
        let differs = (nominal - raw).abs() > params.shutter_setting_tolerance;
        // Any active override may write at night; manual intervention still wins
        let allowed = !self.state.manual_active && (!input.night || ovr.is_some() || edge);
        if !differs || !allowed {
            if differs {
                match self.state.manual_for(input.now) {
                    Some(secs) => debug!(
                        target: "controller",
                        "{}: holding at {:.2}, moved by hand {}s ago",
                        self.def.name,
                        raw,
                        secs
                    ),
                    None => debug!(
                        target: "controller",
                        "{}: holding at {:.2} (night {})",
                        self.def.name,
                        raw,
                        input.night
                    ),
                }
            }
            return None;
        }

        info!(
            target: "controller",
            "setting {} to {:.2} (nominal {:.3})",
            self.def.name,
            setting,
            nominal
        );
        match self.shutter.write_position(nominal) {
            Ok(()) => {
                manual::settle(clock, params.shutter_trigger_delay);
                self.state.commanded(nominal);
                Some(ShutterCommand {
                    window: self.def.name.clone(),
                    nominal,
                    success: true,
                })
            }
            Err(e) => {
                error!(target: "controller", "{}: {}", self.def.name, e);
                Some(ShutterCommand {
                    window: self.def.name.clone(),
                    nominal,
                    success: false,
                })
            }
        }
    }
}

#[derive(Default)]
pub struct ShutterController {
    windows: Vec<Window>,
}

impl ShutterController {
    pub fn new(windows: Vec<Window>) -> Self {
        Self { windows }
    }

    /// Look up every configured window's shutter. Windows whose shutter
    /// cannot be found after the configured retries are left out.
    pub fn build(params: &Params, home: &dyn Home, clock: &dyn Clock) -> Self {
        let mut controller = Self::default();
        controller.redefine(params, home, clock);
        controller
    }

    /// Apply new window definitions, keeping the state of windows whose
    /// name and shutter did not change.
    pub fn redefine(&mut self, params: &Params, home: &dyn Home, clock: &dyn Clock) {
        let mut old = std::mem::take(&mut self.windows);
        for def in &params.windows {
            if let Some(pos) = old
                .iter()
                .position(|w| w.def.name == def.name && w.def.shutter == def.shutter)
            {
                let mut w = old.swap_remove(pos);
                if w.def.profile != def.profile {
                    w.debounce = SunlitDebounce::new();
                }
                w.def = def.clone();
                self.windows.push(w);
                continue;
            }
            let shutter = device::lookup_with_retry(
                &def.shutter,
                params.lookup_retries,
                params.lookup_backoff,
                clock,
                || home.shutter(&def.shutter),
            );
            match shutter {
                Some(s) => {
                    info!(
                        target: "controller",
                        "window {} ({}) -> {}",
                        def.name,
                        def.room,
                        s.name()
                    );
                    self.windows.push(Window::new(def.clone(), s));
                }
                None => error!(
                    target: "controller",
                    "window {} dropped: shutter {} not found",
                    def.name,
                    def.shutter
                ),
            }
        }
    }

    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    pub fn run_cycle(
        &mut self,
        params: &Params,
        input: &CycleInput<'_>,
        arbitrator: &Arbitrator,
        clock: &dyn Clock,
    ) -> Vec<ShutterCommand> {
        debug!(
            target: "controller",
            "temperature {}, brightness {}, sun up {}, night {}",
            input.temperature,
            input.brightness,
            input.sun_is_up,
            input.night
        );
        let mut commands = Vec::new();
        for w in &mut self.windows {
            if arbitrator.suspended(&w.def.name) {
                debug!(target: "controller", "{}: suspended", w.def.name);
                continue;
            }
            if let Some(cmd) = w.decide(params, input, arbitrator, clock) {
                commands.push(cmd);
            }
        }
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Calibration;
    use crate::device::simulated::SimulatedHome;
    use crate::horizon::{HorizonProfile, Polyline};
    use crate::overrides::{Activity, ActivityKind, Scope};
    use crate::solar::SunPosition;
    use crate::ManualClock;

    fn def(name: &str) -> WindowDef {
        WindowDef {
            name: name.into(),
            room: "room".into(),
            shutter: name.into(),
            profile: HorizonProfile::new(
                Polyline::flat(0.0),
                Polyline::new(vec![(0.0, 5.0), (180.0, 60.0), (360.0, 5.0)]).unwrap(),
            ),
            calibration: Calibration::default(),
        }
    }

    fn sun(elevation: f64) -> SunState {
        let p = SunPosition {
            azimuth: 90.0,
            elevation,
        };
        SunState::fixed(p, vec![p; 3])
    }

    fn input(sun: &SunState) -> CycleInput<'_> {
        CycleInput {
            now: 1000,
            sun,
            sun_is_up: true,
            night: false,
            temperature: TemperatureCondition::Hot,
            brightness: BrightnessCondition::Normal,
        }
    }

    fn setup(names: &[&str]) -> (SimulatedHome, ShutterController, Params, ManualClock) {
        let home = SimulatedHome::new();
        let mut params = Params::default();
        for n in names {
            home.add_shutter(n, 1.0);
            params.windows.push(def(n));
        }
        let clock = ManualClock::new(0);
        let ctl = ShutterController::build(&params, &home, &clock);
        (home, ctl, params, clock)
    }

    #[test]
    fn hot_normal_sunlit_writes_table_value() {
        let (home, mut ctl, params, clock) = setup(&["kitchen"]);
        let s = sun(30.0);
        let cmds = ctl.run_cycle(&params, &input(&s), &Arbitrator::default(), &clock);
        assert_eq!(
            cmds,
            vec![ShutterCommand {
                window: "kitchen".into(),
                nominal: 0.4,
                success: true
            }]
        );
        assert_eq!(home.level("kitchen"), Some(0.4));
        assert_eq!(clock.slept(), params.shutter_trigger_delay);
        assert_eq!(ctl.windows()[0].state.last_commanded, Some(0.4));
    }

    #[test]
    fn within_tolerance_means_no_write() {
        let (home, mut ctl, params, clock) = setup(&["kitchen"]);
        home.set_level("kitchen", 0.41);
        let s = sun(30.0);
        assert!(ctl
            .run_cycle(&params, &input(&s), &Arbitrator::default(), &clock)
            .is_empty());
    }

    #[test]
    fn sun_down_closes() {
        let (home, mut ctl, params, clock) = setup(&["kitchen"]);
        let s = sun(-10.0);
        let mut i = input(&s);
        i.sun_is_up = false;
        ctl.run_cycle(&params, &i, &Arbitrator::default(), &clock);
        assert_eq!(home.level("kitchen"), Some(0.0));
    }

    #[test]
    fn night_inhibits_ordinary_writes() {
        let (home, mut ctl, params, clock) = setup(&["kitchen"]);
        let s = sun(30.0);
        let mut i = input(&s);
        i.night = true;
        assert!(ctl
            .run_cycle(&params, &i, &Arbitrator::default(), &clock)
            .is_empty());
        assert_eq!(home.level("kitchen"), Some(1.0));
    }

    #[test]
    fn induced_setting_overrides_night_and_manual() {
        let (home, mut ctl, params, clock) = setup(&["kitchen"]);
        let s = sun(30.0);
        ctl.run_cycle(&params, &input(&s), &Arbitrator::default(), &clock);
        home.set_level("kitchen", 0.7);
        ctl.run_cycle(&params, &input(&s), &Arbitrator::default(), &clock);
        assert!(ctl.windows()[0].state.manual_active);

        let mut arb = Arbitrator::new(vec![Activity::new(
            "tv evening",
            ActivityKind::InducedSetting {
                value: 0.0,
                scope: Scope::All,
            },
        )]);
        arb.set_active("tv evening", true);
        let mut i = input(&s);
        i.night = true;
        let cmds = ctl.run_cycle(&params, &i, &arb, &clock);
        assert_eq!(cmds.len(), 1);
        assert_eq!(home.level("kitchen"), Some(0.0));
        assert!(!ctl.windows()[0].state.manual_active);
    }

    #[test]
    fn constant_daytime_setting_applies_at_night() {
        let (home, mut ctl, params, clock) = setup(&["kitchen", "study"]);
        let s = sun(30.0);
        ctl.run_cycle(&params, &input(&s), &Arbitrator::default(), &clock);
        // study is held by hand
        home.set_level("study", 0.7);
        ctl.run_cycle(&params, &input(&s), &Arbitrator::default(), &clock);
        assert!(ctl.windows()[1].state.manual_active);

        let mut arb = Arbitrator::new(vec![Activity::new(
            "shutters 25",
            ActivityKind::ConstantDaytimeSetting {
                value: 0.25,
                scope: Scope::All,
                light_shade_separate: false,
            },
        )]);
        arb.set_active("shutters 25", true);
        let mut i = input(&s);
        i.night = true;
        let cmds = ctl.run_cycle(&params, &i, &arb, &clock);
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].window, "kitchen");
        assert_eq!(home.level("kitchen"), Some(0.25));
        assert_eq!(home.level("study"), Some(0.7));
    }

    #[test]
    fn manual_intervention_blocks_until_fully_opened() {
        let (home, mut ctl, params, clock) = setup(&["kitchen"]);
        let s = sun(30.0);
        let arb = Arbitrator::default();
        ctl.run_cycle(&params, &input(&s), &arb, &clock);
        assert_eq!(home.level("kitchen"), Some(0.4));

        home.set_level("kitchen", 0.1);
        assert!(ctl.run_cycle(&params, &input(&s), &arb, &clock).is_empty());
        assert!(ctl.run_cycle(&params, &input(&s), &arb, &clock).is_empty());
        assert_eq!(home.level("kitchen"), Some(0.1));

        // Opened by hand: released, and the edge allows a write even at night
        home.set_level("kitchen", 1.0);
        let mut i = input(&s);
        i.night = true;
        let cmds = ctl.run_cycle(&params, &i, &arb, &clock);
        assert_eq!(cmds.len(), 1);
        assert_eq!(home.level("kitchen"), Some(0.4));
    }

    #[test]
    fn suspension_skips_window_entirely() {
        let (home, mut ctl, params, clock) = setup(&["kitchen", "study"]);
        let mut arb = Arbitrator::new(vec![Activity::new(
            "no shutter movement",
            ActivityKind::Suspend { scope: Scope::All },
        )]);
        arb.set_active("no shutter movement", true);
        let s = sun(30.0);
        assert!(ctl.run_cycle(&params, &input(&s), &arb, &clock).is_empty());
        assert!(home.writes("kitchen").is_empty());
        assert!(home.writes("study").is_empty());
    }

    #[test]
    fn constant_daytime_light_shade_separate_in_shade() {
        let (home, mut ctl, mut params, clock) = setup(&["kitchen"]);
        params.table = crate::config::Params::parse(
            &[(
                "shutter_hot_very-bright_shade".to_string(),
                serde_json::json!(0.6),
            )]
            .into_iter()
            .collect(),
        )
        .0
        .table;
        let mut arb = Arbitrator::new(vec![Activity::new(
            "shutters 25",
            ActivityKind::ConstantDaytimeSetting {
                value: 0.25,
                scope: Scope::All,
                light_shade_separate: true,
            },
        )]);
        arb.set_active("shutters 25", true);

        // Below the minimum elevation: shade
        let s = sun(2.0);
        ctl.run_cycle(&params, &input(&s), &arb, &clock);
        assert_eq!(home.level("kitchen"), Some(0.6));
    }

    #[test]
    fn constant_daytime_in_sun_uses_its_value() {
        let (home, mut ctl, params, clock) = setup(&["kitchen"]);
        let mut arb = Arbitrator::new(vec![Activity::new(
            "shutters 25",
            ActivityKind::ConstantDaytimeSetting {
                value: 0.25,
                scope: Scope::windows(["kitchen"]),
                light_shade_separate: true,
            },
        )]);
        arb.set_active("shutters 25", true);
        let s = sun(30.0);
        ctl.run_cycle(&params, &input(&s), &arb, &clock);
        assert_eq!(home.level("kitchen"), Some(0.25));
    }

    #[test]
    fn device_error_is_isolated() {
        let (home, mut ctl, params, clock) = setup(&["kitchen", "study"]);
        home.fail_reads("kitchen", true);
        let s = sun(30.0);
        let cmds = ctl.run_cycle(&params, &input(&s), &Arbitrator::default(), &clock);
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].window, "study");
        assert_eq!(ctl.windows()[0].state, WindowState::default());

        home.fail_reads("kitchen", false);
        home.fail_writes("kitchen", true);
        let cmds = ctl.run_cycle(&params, &input(&s), &Arbitrator::default(), &clock);
        assert_eq!(
            cmds,
            vec![ShutterCommand {
                window: "kitchen".into(),
                nominal: 0.4,
                success: false
            }]
        );
        assert_eq!(ctl.windows()[0].state.last_commanded, None);
    }

    #[test]
    fn out_of_range_level_skips_window() {
        let (home, mut ctl, params, clock) = setup(&["kitchen"]);
        home.set_level("kitchen", 1.5);
        let s = sun(30.0);
        assert!(ctl
            .run_cycle(&params, &input(&s), &Arbitrator::default(), &clock)
            .is_empty());
        assert_eq!(ctl.windows()[0].state.last_observed, None);
    }

    #[test]
    fn missing_shutter_drops_window() {
        let home = SimulatedHome::new();
        home.add_shutter("study", 1.0);
        let mut params = Params::default();
        params.windows = vec![def("kitchen"), def("study")];
        params.lookup_retries = 1;
        let clock = ManualClock::new(0);
        let ctl = ShutterController::build(&params, &home, &clock);
        assert_eq!(ctl.windows().len(), 1);
        assert_eq!(ctl.windows()[0].name(), "study");
    }

    #[test]
    fn redefine_keeps_state() {
        let (home, mut ctl, mut params, clock) = setup(&["kitchen"]);
        let s = sun(30.0);
        ctl.run_cycle(&params, &input(&s), &Arbitrator::default(), &clock);
        params.windows[0].room = "other".into();
        ctl.redefine(&params, &home, &clock);
        assert_eq!(ctl.windows()[0].state.last_commanded, Some(0.4));
        assert_eq!(ctl.windows()[0].def.room, "other");
    }
}
