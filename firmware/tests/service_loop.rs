//! End-to-end exercise of the host link: startup pass, then framed bytes
//! through dispatch against a scripted controller.

use std::time::{Duration, Instant};

use firmware::config::{FixtureConfig, Profile, BODY_CONTROL_MAP};
use firmware::fixture::Fixture;
use firmware::protocol::{ArtNetBody, ArtNetHead, Message, MessageFramer};
use firmware::startup::{Sequencer, SequencerStatus};
use hardware::odrive::mock::{Command, MockController};
use hardware::odrive::AxisState;
use hardware::quadrature::MockSensor;

fn run_startup(config: &FixtureConfig, link: &mut MockController) -> Sequencer {
    for axis in &config.axes {
        link.set_default_state(axis.motor, AxisState::ClosedLoopControl);
        link.set_calibration_flags(axis.motor, true, true);
    }
    let mut sensor = MockSensor::new(&[300, -300]);
    let mut sequencer = Sequencer::new(config, Instant::now());
    let mut now = Instant::now();
    for _ in 0..100_000 {
        if sequencer.tick(link, &mut sensor, now) == SequencerStatus::Complete {
            return sequencer;
        }
        now += Duration::from_millis(100);
    }
    panic!("startup never completed");
}

fn dispatch_all(
    fixture: &mut Fixture,
    link: &mut MockController,
    host: &mut Vec<u8>,
    framer: &mut MessageFramer,
) -> (usize, usize) {
    let now = Instant::now();
    let mut dispatched = 0;
    let mut faults = 0;
    while let Some(result) = framer.next_message(now) {
        match result {
            Ok(message) => {
                fixture.handle(link, host, message).unwrap();
                dispatched += 1;
            }
            Err(_) => faults += 1,
        }
    }
    (dispatched, faults)
}

#[test]
fn body_session_from_startup_to_motion() {
    let config = FixtureConfig::for_profile(Profile::Body);
    let motor = config.axes[0].motor;
    let mut link = MockController::new();
    let sequencer = run_startup(&config, &mut link);
    let mut fixture = Fixture::new(&config, &sequencer.reports());

    let mut framer = MessageFramer::new();
    let mut host = Vec::new();

    // Identify, an absolute move, a jog, then the same stop twice.
    framer.push(&[99, 0]);
    framer.push(
        &ArtNetBody {
            pan: 50_000,
            pan_control: 0,
            pan_tilt_speed: 40,
            power_special_functions: 0,
        }
        .encode(),
    );
    framer.push(
        &ArtNetBody {
            pan: 0,
            pan_control: 64,
            pan_tilt_speed: 40,
            power_special_functions: 0,
        }
        .encode(),
    );
    let stop = ArtNetBody {
        pan: 0,
        pan_control: BODY_CONTROL_MAP.stop_in_place,
        pan_tilt_speed: 40,
        power_special_functions: 0,
    };
    framer.push(&stop.encode());
    framer.push(&stop.encode());

    let before = link.commands.len();
    let (dispatched, faults) = dispatch_all(&mut fixture, &mut link, &mut host, &mut framer);
    assert_eq!(dispatched, 5);
    assert_eq!(faults, 0);

    // Identify answered with the body identifier.
    assert_eq!(host, vec![0xAF]);

    let issued = &link.commands[before..];
    assert!(issued
        .iter()
        .any(|c| matches!(c, Command::TrapezoidalMove { axis, .. } if *axis == motor)));
    let velocities: Vec<f32> = issued
        .iter()
        .filter_map(|c| match c {
            Command::SetVelocity { velocity, .. } => Some(*velocity),
            _ => None,
        })
        .collect();
    // One jog, one stop; the repeated stop was suppressed.
    assert_eq!(velocities.len(), 2);
    assert!(velocities[0] > 0.0);
    assert_eq!(velocities[1], 0.0);
}

#[test]
fn garbage_on_the_wire_does_not_stall_dispatch() {
    let config = FixtureConfig::for_profile(Profile::Body);
    let mut link = MockController::new();
    let sequencer = run_startup(&config, &mut link);
    let mut fixture = Fixture::new(&config, &sequencer.reports());

    let mut framer = MessageFramer::new();
    let mut host = Vec::new();

    framer.push(&[42, 43]); // not known tags
    framer.push(
        &ArtNetBody {
            pan: 33_000,
            pan_control: 0,
            pan_tilt_speed: 10,
            power_special_functions: 0,
        }
        .encode(),
    );

    let (dispatched, faults) = dispatch_all(&mut fixture, &mut link, &mut host, &mut framer);
    assert_eq!(dispatched, 1);
    // Each garbage byte resyncs individually.
    assert_eq!(faults, 2);
}

#[test]
fn head_messages_route_tilt_only() {
    let config = FixtureConfig::for_profile(Profile::Head);
    let motor = config.axes[0].motor;
    let mut link = MockController::new();
    let sequencer = run_startup(&config, &mut link);
    let mut fixture = Fixture::new(&config, &sequencer.reports());

    let mut framer = MessageFramer::new();
    let mut host = Vec::new();
    framer.push(
        &ArtNetHead {
            strobe_shutter: 3,
            iris: 4,
            zoom: 100,
            focus: 200,
            tilt: 45_000,
            tilt_control: 1,
            pan_tilt_speed: 90,
            power_special_functions: 0,
            led: Some([255, 0, 64]),
        }
        .encode(),
    );

    let before = link.commands.len();
    let now = Instant::now();
    while let Some(result) = framer.next_message(now) {
        let message = result.unwrap();
        assert!(matches!(message, Message::Head(_)));
        fixture.handle(&mut link, &mut host, message).unwrap();
    }

    assert!(link.commands[before..]
        .iter()
        .any(|c| matches!(c, Command::TrapezoidalMove { axis, .. } if *axis == motor)));
    assert!(host.is_empty());
}
