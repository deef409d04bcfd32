//! Integration tests: drive the whole engine against a simulated G13.
//!
//! A scripted reader feeds raw input reports, a recording sink captures the
//! synthesized keys and a mock writer logs every output report, so each test
//! runs the full read -> decode -> resolve -> dispatch -> write pipeline.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;

    use crate::bus::{BusEvent, Subscription};
    use crate::buttons::{ButtonId, Mode};
    use crate::comm::{DeviceStatus, ReconnectPolicy};
    use crate::config::EngineConfig;
    use crate::decoder::Edge;
    use crate::engine::Engine;
    use crate::keys::KeyCode;
    use crate::lcd::Framebuffer;
    use crate::macros::{Macro, MacroLibrary, MacroStep, PlaybackMode};
    use crate::output::{encode_lcd, ModeLeds, OutputCommand, OutputConfig, Rgb};
    use crate::profile::{Action, KeyCombo, Profile};
    use crate::report::{OutputReport, BACKLIGHT_REPORT_ID, LCD_REPORT_ID};
    use crate::resolver::BindingState;
    use crate::scheduler::{CancelReason, MacroEventKind};
    use crate::sink::mock::{KeyEvent, RecordingSink};
    use crate::transport::mock::{mock_link, MockConnector, MockDevice};

    const WAIT: Duration = Duration::from_secs(3);

    const A: KeyCode = KeyCode(30);
    const B: KeyCode = KeyCode(48);
    const C: KeyCode = KeyCode(46);
    const LEFT_CTRL: KeyCode = KeyCode(29);

    const IDLE: [u8; 5] = [0, 0, 0, 0, 0];
    const G1: [u8; 5] = [0x01, 0, 0, 0, 0];
    const G2: [u8; 5] = [0x02, 0, 0, 0, 0];
    const G1_G2: [u8; 5] = [0x03, 0, 0, 0, 0];
    const G1_G2_G3: [u8; 5] = [0x07, 0, 0, 0, 0];
    const G4: [u8; 5] = [0x08, 0, 0, 0, 0];
    const G9: [u8; 5] = [0, 0x01, 0, 0, 0];
    const M2: [u8; 5] = [0, 0, 0, 0x40, 0];

    const UP: KeyCode = KeyCode(103);
    const DOWN: KeyCode = KeyCode(108);
    const LEFT: KeyCode = KeyCode(105);

    struct Rig {
        engine: Engine,
        device: MockDevice,
        log: Arc<Mutex<Vec<OutputReport>>>,
        sink: Arc<RecordingSink>,
        connector: MockConnector,
        events: Subscription,
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            read_timeout_ms: 5,
            resync_timeout_ms: 1000,
            reconnect: ReconnectPolicy {
                initial_ms: 5,
                max_ms: 20,
                ..ReconnectPolicy::default()
            },
            output: OutputConfig {
                lcd_min_interval_ms: 50,
                led_min_interval_ms: 0,
            },
            ..EngineConfig::default()
        }
    }

    fn rig(profile: Profile, macros: MacroLibrary) -> Rig {
        let connector = MockConnector::new();
        let (device, log, link) = mock_link();
        connector.push(link);
        let sink = Arc::new(RecordingSink::new());
        let engine = Engine::start_with(
            Box::new(connector.clone()),
            sink.clone(),
            test_config(),
            BindingState::new(profile, macros),
        )
        .unwrap();
        let events = engine.controller().subscribe();

        // First report only seeds the state.
        device.send_buttons(IDLE);
        let controller = engine.controller();
        assert!(wait_until(|| controller.output_state().mode_leds.is_some()));

        Rig {
            engine,
            device,
            log,
            sink,
            connector,
            events,
        }
    }

    /// Idle buttons with the stick at raw position `x`, `y`.
    fn stick_report(x: u8, y: u8) -> Vec<u8> {
        vec![0x01, x, y, 0, 0, 0, 0, 0]
    }

    fn wait_until(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    fn wait_for_event(sub: &mut Subscription, pred: impl Fn(&BusEvent) -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if let Some(event) = sub.recv_timeout(Duration::from_millis(20)) {
                if pred(&event) {
                    return true;
                }
            }
        }
        false
    }

    /// Every event up to and including the first one matching `pred`.
    fn events_until(
        sub: &mut Subscription,
        pred: impl Fn(&BusEvent) -> bool,
    ) -> Option<Vec<BusEvent>> {
        let deadline = Instant::now() + WAIT;
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            if let Some(event) = sub.recv_timeout(Duration::from_millis(20)) {
                let done = pred(&event);
                seen.push(event);
                if done {
                    return Some(seen);
                }
            }
        }
        None
    }

    fn combo(keys: &[KeyCode]) -> Action {
        Action::EmitKeyCombo {
            keys: KeyCombo(keys.to_vec()),
        }
    }

    fn run_macro(id: &str) -> Action {
        Action::RunMacro {
            macro_id: id.into(),
        }
    }

    fn writes_with_id(log: &Mutex<Vec<OutputReport>>, id: u8) -> Vec<OutputReport> {
        log.lock()
            .iter()
            .filter(|r| r.report_id() == id)
            .cloned()
            .collect()
    }

    /// Byte-level scenario: G1 bound to Ctrl+C.
    #[test]
    fn press_and_release_emit_combo_in_order() {
        let mut p = Profile::empty("p");
        p.set_binding(Mode::M1, ButtonId::G1, Some(combo(&[LEFT_CTRL, C])));
        let r = rig(p, MacroLibrary::new());

        r.device.send(&[0x01, 0x80, 0x80, 0x01, 0x00, 0x00, 0x00, 0x00]);
        assert!(r.sink.wait_for(WAIT, |ev| ev.len() >= 2));
        assert!(r.engine.controller().snapshot().is_pressed(ButtonId::G1));

        r.device.send(&[0x01, 0x80, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert!(r.sink.wait_for(WAIT, |ev| ev.len() >= 4));

        assert_eq!(
            r.sink.events(),
            vec![
                KeyEvent::Press(LEFT_CTRL),
                KeyEvent::Press(C),
                KeyEvent::Release(C),
                KeyEvent::Release(LEFT_CTRL),
            ]
        );
        let history = r.engine.controller().recent_transitions();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].buttons[0].edge, Edge::Pressed);
        assert_eq!(history[1].buttons[0].edge, Edge::Released);
        assert!(!r.engine.controller().snapshot().is_pressed(ButtonId::G1));
    }

    #[test]
    fn malformed_report_is_dropped_without_state_change() {
        let mut p = Profile::empty("p");
        p.set_binding(Mode::M1, ButtonId::G1, Some(combo(&[A])));
        let r = rig(p, MacroLibrary::new());

        r.device.send(&[0x01, 0x80, 0x80, 0x01]);
        r.device.send(&[0x02, 0x80, 0x80, 0x01, 0, 0, 0, 0]);
        r.device.send_buttons(G1);
        assert!(r.sink.wait_for(WAIT, |ev| !ev.is_empty()));
        assert_eq!(r.sink.events(), vec![KeyEvent::Press(A)]);
    }

    #[test]
    fn profile_swap_mid_playback_keeps_running_macro() {
        let mut p = Profile::empty("first");
        p.set_binding(Mode::M1, ButtonId::G2, Some(run_macro("slow")));
        let lib: MacroLibrary = [Macro::new(
            "slow",
            vec![MacroStep::press(A, 0), MacroStep::release(A, 300)],
        )]
        .into_iter()
        .collect();
        let mut r = rig(p, lib);

        r.device.send_buttons(G2);
        assert!(r.sink.wait_for(WAIT, |ev| ev.len() == 1));
        r.device.send_buttons(IDLE);

        let mut second = Profile::empty("second");
        second.set_binding(Mode::M1, ButtonId::G2, Some(combo(&[B])));
        r.engine.controller().load_profile(second).unwrap();

        // The old run finishes with its original definition.
        assert!(wait_for_event(&mut r.events, |e| matches!(
            e,
            BusEvent::Macro(m) if m.kind == MacroEventKind::Completed
        )));
        assert_eq!(r.sink.events(), vec![KeyEvent::Press(A), KeyEvent::Release(A)]);

        // New bindings apply to the next press.
        r.device.send_buttons(G2);
        assert!(r.sink.wait_for(WAIT, |ev| ev.len() == 3));
        assert_eq!(r.sink.events()[2], KeyEvent::Press(B));
    }

    #[test]
    fn disconnect_cancels_macros_and_releases_keys() {
        let mut p = Profile::empty("p");
        p.set_binding(Mode::M1, ButtonId::G1, Some(run_macro("hold-a")));
        p.set_binding(Mode::M1, ButtonId::G2, Some(run_macro("hold-b")));
        p.set_binding(Mode::M1, ButtonId::G3, Some(combo(&[C])));
        let lib: MacroLibrary = [
            Macro::new(
                "hold-a",
                vec![MacroStep::press(A, 0), MacroStep::release(A, 5_000)],
            ),
            Macro::new(
                "hold-b",
                vec![MacroStep::press(B, 0), MacroStep::release(B, 5_000)],
            ),
        ]
        .into_iter()
        .collect();
        let mut r = rig(p, lib);

        r.device.send_buttons(G1_G2_G3);
        assert!(r.sink.wait_for(WAIT, |ev| ev.len() >= 3));
        assert_eq!(r.sink.held_keys().len(), 3);

        let (device2, _log2, link2) = mock_link();
        r.connector.push(link2);
        r.device.lose();

        assert!(wait_for_event(&mut r.events, |e| matches!(
            e,
            BusEvent::Device {
                status: DeviceStatus::Reconnecting
            }
        )));
        assert!(r.sink.held_keys().is_empty());
        assert!(r.engine.controller().active_macros().unwrap().is_empty());

        // Buttons still down on the new link only seed the state.
        device2.send_buttons(G1);
        let until_connected = events_until(&mut r.events, |e| {
            matches!(
                e,
                BusEvent::Device {
                    status: DeviceStatus::Connected
                }
            )
        })
        .expect("reconnected");
        assert!(
            !until_connected
                .iter()
                .any(|e| matches!(e, BusEvent::Transition(_))),
            "transition published while resynchronizing: {until_connected:?}"
        );
        assert_eq!(r.engine.controller().snapshot().buttons.len(), 1);
        let before = r.sink.events().len();
        device2.send_buttons(IDLE);
        device2.send_buttons(G2);
        assert!(r.sink.wait_for(WAIT, |ev| ev.len() > before));
        assert_eq!(r.sink.events()[before], KeyEvent::Press(B));
        assert_eq!(r.connector.opens(), 2);
    }

    #[test]
    fn disconnect_reports_device_lost_cancellations() {
        let mut p = Profile::empty("p");
        p.set_binding(Mode::M1, ButtonId::G1, Some(run_macro("a")));
        p.set_binding(Mode::M1, ButtonId::G2, Some(run_macro("b")));
        let lib: MacroLibrary = [
            Macro::new("a", vec![MacroStep::press(A, 0), MacroStep::release(A, 5_000)]),
            Macro::new("b", vec![MacroStep::press(B, 0), MacroStep::release(B, 5_000)]),
        ]
        .into_iter()
        .collect();
        let mut r = rig(p, lib);

        r.device.send_buttons(G1_G2);
        assert!(r.sink.wait_for(WAIT, |ev| ev.len() >= 2));
        r.device.lose();

        let mut cancelled = 0;
        let deadline = Instant::now() + WAIT;
        while cancelled < 2 && Instant::now() < deadline {
            if let Some(BusEvent::Macro(m)) = r.events.recv_timeout(Duration::from_millis(20)) {
                if m.kind
                    == (MacroEventKind::Cancelled {
                        reason: CancelReason::DeviceLost,
                    })
                {
                    cancelled += 1;
                }
            }
        }
        assert_eq!(cancelled, 2);
        assert!(r.sink.held_keys().is_empty());
    }

    #[test]
    fn identical_backlight_is_written_once() {
        let r = rig(Profile::default(), MacroLibrary::new());
        let controller = r.engine.controller();
        let color = Rgb::new(10, 20, 30);

        controller
            .set_output(OutputCommand::SetLedColor(color))
            .unwrap();
        controller.output().sync(WAIT).unwrap();
        let n = writes_with_id(&r.log, BACKLIGHT_REPORT_ID).len();

        controller
            .set_output(OutputCommand::SetLedColor(color))
            .unwrap();
        controller.output().sync(WAIT).unwrap();
        assert_eq!(writes_with_id(&r.log, BACKLIGHT_REPORT_ID).len(), n);
        assert_eq!(controller.output_state().backlight, Some(color));

        controller
            .set_output(OutputCommand::SetLedColor(Rgb::new(0, 0, 0)))
            .unwrap();
        controller.output().sync(WAIT).unwrap();
        assert_eq!(writes_with_id(&r.log, BACKLIGHT_REPORT_ID).len(), n + 1);
    }

    #[test]
    fn lcd_updates_coalesce_to_latest() {
        let mut p = Profile::empty("p");
        p.lcd.enabled = false;
        let r = rig(p, MacroLibrary::new());
        let controller = r.engine.controller();
        for text in ["one", "two", "three", "four"] {
            controller
                .set_output(OutputCommand::SetLcdText(vec![text.to_string()]))
                .unwrap();
        }
        controller.output().sync(WAIT).unwrap();

        let writes = writes_with_id(&r.log, LCD_REPORT_ID);
        assert!(!writes.is_empty() && writes.len() <= 2, "{} writes", writes.len());
        let expected = encode_lcd(&Framebuffer::from_text(&["four"]));
        assert_eq!(writes.last(), Some(&expected));
    }

    #[test]
    fn mode_switch_updates_leds_and_bindings() {
        let mut p = Profile::default();
        p.set_binding(Mode::M2, ButtonId::G1, Some(combo(&[B])));
        let mut r = rig(p, MacroLibrary::new());
        let controller = r.engine.controller();

        r.device.send_buttons(M2);
        assert!(wait_for_event(&mut r.events, |e| matches!(
            e,
            BusEvent::ModeChanged { mode: Mode::M2 }
        )));
        assert!(wait_until(|| controller.output_state().mode_leds
            == Some(ModeLeds(ModeLeds::M2))));
        assert_eq!(controller.snapshot().mode, Mode::M2);

        r.device.send_buttons(IDLE);
        r.device.send_buttons(G1);
        assert!(r.sink.wait_for(WAIT, |ev| !ev.is_empty()));
        assert_eq!(r.sink.events(), vec![KeyEvent::Press(B)]);
    }

    #[test]
    fn mode_switch_shows_status_screen() {
        let mut p = Profile::empty("p");
        p.lcd.default_text = "hello".into();
        let r = rig(p, MacroLibrary::new());
        let controller = r.engine.controller();
        assert!(wait_until(|| controller.output_state().lcd
            == Some(Framebuffer::from_text(&["M1: p", "hello"]))));

        r.device.send_buttons(M2);
        assert!(wait_until(|| controller.output_state().lcd
            == Some(Framebuffer::from_text(&["M2: p", "hello"]))));
    }

    #[test]
    fn digital_stick_holds_arrow_keys() {
        let r = rig(Profile::default(), MacroLibrary::new());

        r.device.send(&stick_report(0x00, 0x80));
        assert!(r.sink.wait_for(WAIT, |ev| !ev.is_empty()));
        assert_eq!(r.sink.events(), vec![KeyEvent::Press(LEFT)]);

        r.device.send(&stick_report(0x80, 0x80));
        assert!(r.sink.wait_for(WAIT, |ev| ev.len() >= 2));
        assert_eq!(
            r.sink.events(),
            vec![KeyEvent::Press(LEFT), KeyEvent::Release(LEFT)]
        );

        // Still pushed down when the cable goes.
        r.device.send(&stick_report(0x80, 0xFF));
        assert!(wait_until(|| r.sink.held_keys() == vec![DOWN]));
        r.device.lose();
        assert!(wait_until(|| r.sink.held_keys().is_empty()));
        assert!(!r.sink.events().contains(&KeyEvent::Press(UP)));
    }

    #[test]
    fn analog_stick_only_reports_motion() {
        let r = rig(Profile::empty("p"), MacroLibrary::new());
        let controller = r.engine.controller();

        r.device.send(&stick_report(0x00, 0x00));
        assert!(wait_until(|| controller.snapshot().joystick.x < -0.9));
        assert!(r.sink.events().is_empty());
    }

    #[test]
    fn recorded_macro_is_bound_and_replays() {
        let mut p = Profile::empty("p");
        p.set_binding(Mode::M1, ButtonId::G1, Some(combo(&[A])));
        let mut r = rig(p, MacroLibrary::new());
        let controller = r.engine.controller();

        controller.start_recording(ButtonId::G9).unwrap();
        assert!(wait_until(|| controller.output_state().mode_leds
            == Some(ModeLeds(ModeLeds::M1 | ModeLeds::MR))));

        r.device.send_buttons(G1);
        r.device.send_buttons(IDLE);
        assert!(r.sink.wait_for(WAIT, |ev| ev.len() >= 2));

        let m = controller.stop_recording().unwrap().expect("captured steps");
        assert_eq!(m.steps.len(), 2);
        assert!(wait_for_event(&mut r.events, |e| matches!(
            e,
            BusEvent::RecordingFinished { macro_id: Some(id), .. } if *id == m.id
        )));
        assert!(wait_until(|| controller.output_state().mode_leds
            == Some(ModeLeds(ModeLeds::M1))));
        assert_eq!(
            controller.get_active_profile().binding(Mode::M1, ButtonId::G9),
            Some(&run_macro(&m.id))
        );

        r.sink.clear();
        r.device.send_buttons(G9);
        assert!(r.sink.wait_for(WAIT, |ev| ev.len() >= 2));
        assert_eq!(r.sink.events(), vec![KeyEvent::Press(A), KeyEvent::Release(A)]);
    }

    #[test]
    fn hold_to_repeat_stops_on_release() {
        let mut p = Profile::empty("p");
        p.set_binding(Mode::M1, ButtonId::G4, Some(run_macro("spam")));
        let lib: MacroLibrary = [Macro::new(
            "spam",
            vec![MacroStep::press(A, 0), MacroStep::release(A, 5)],
        )
        .with_playback(PlaybackMode::HoldToRepeat)]
        .into_iter()
        .collect();
        let mut r = rig(p, lib);

        r.device.send_buttons(G4);
        assert!(r.sink.wait_for(WAIT, |ev| ev.len() >= 6));
        r.device.send_buttons(IDLE);
        assert!(wait_for_event(&mut r.events, |e| matches!(
            e,
            BusEvent::Macro(m) if m.kind == MacroEventKind::Cancelled { reason: CancelReason::Released }
        )));
        assert!(r.sink.held_keys().is_empty());
        let settled = r.sink.events().len();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(r.sink.events().len(), settled);
    }

    #[test]
    fn stop_releases_held_keys() {
        let mut p = Profile::empty("p");
        p.set_binding(Mode::M1, ButtonId::G1, Some(combo(&[LEFT_CTRL, A])));
        let mut r = rig(p, MacroLibrary::new());

        r.device.send_buttons(G1);
        assert!(r.sink.wait_for(WAIT, |ev| ev.len() >= 2));
        r.engine.stop();
        assert!(r.sink.held_keys().is_empty());
        assert!(wait_for_event(&mut r.events, |e| matches!(
            e,
            BusEvent::Device {
                status: DeviceStatus::Stopped
            }
        )));
    }

    #[test]
    fn engine_waits_for_device_to_appear() {
        let connector = MockConnector::new();
        let sink = Arc::new(RecordingSink::new());
        let mut engine =
            Engine::start(Box::new(connector.clone()), sink, test_config()).unwrap();
        assert!(wait_until(|| connector.opens() >= 3));

        let (device, _log, link) = mock_link();
        connector.push(link);
        device.send_buttons(IDLE);
        let controller = engine.controller();
        assert!(wait_until(|| controller.output_state().mode_leds.is_some()));
        // Default profile's backlight is applied once the device is attached.
        assert_eq!(
            controller.output_state().backlight,
            Profile::default().backlight.map(|b| b.color)
        );
        engine.stop();
    }
}
