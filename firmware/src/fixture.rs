//! Message dispatch for one fixture.
//!
//! Routes decoded host messages to the axis controllers the active
//! profile actually has: pan commands to the body axis, tilt commands to
//! the head axis, identify requests straight back to the host. Messages
//! for an axis this build does not drive are logged and dropped, so a
//! host addressing a full fixture can share a link with a body-only or
//! head-only build.

use std::io::{self, Write};

use hardware::odrive::{LinkError, MotionController};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::axis::AxisController;
use crate::config::{AxisRole, FixtureConfig};
use crate::protocol::{ArtNetHead, Message, MessageType};
use crate::startup::AxisReport;

#[derive(Debug, Error)]
pub enum FixtureError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("host write failed: {0}")]
    Host(#[from] io::Error),
}

/// The running fixture: identity byte plus whichever axes the profile
/// configured.
pub struct Fixture {
    identifier: u8,
    body: Option<AxisController>,
    head: Option<AxisController>,
}

impl Fixture {
    /// Build axis controllers from the startup pass's homing reports.
    pub fn new(config: &FixtureConfig, reports: &[AxisReport]) -> Self {
        let mut body = None;
        let mut head = None;
        for axis in &config.axes {
            let start_index = reports
                .iter()
                .find(|r| r.motor == axis.motor)
                .map(|r| r.start_index)
                .unwrap_or(0);
            let controller = AxisController::new(axis.clone(), start_index);
            match axis.role {
                AxisRole::Body => body = Some(controller),
                AxisRole::Head => head = Some(controller),
            }
        }
        Self {
            identifier: config.identifier,
            body,
            head,
        }
    }

    /// Act on one decoded message. `host` is the reply channel for
    /// identify requests.
    pub fn handle<M: MotionController, W: Write>(
        &mut self,
        link: &mut M,
        host: &mut W,
        message: Message,
    ) -> Result<(), FixtureError> {
        match message {
            Message::Status(MessageType::Ok) => debug!("host reports ok"),
            Message::Status(mtype) => warn!(?mtype, "host reports a fault"),

            Message::Identify => {
                debug!(identifier = self.identifier, "identify request");
                host.write_all(&[self.identifier])?;
                host.flush()?;
            }

            Message::Body(body) => match &mut self.body {
                Some(axis) => {
                    axis.handle(link, body.pan_control, body.pan, body.pan_tilt_speed)?;
                    special_function(body.power_special_functions);
                }
                None => debug!("pan command ignored, no body axis configured"),
            },

            Message::Head(head) => match &mut self.head {
                Some(axis) => {
                    optics(&head);
                    axis.handle(link, head.tilt_control, head.tilt, head.pan_tilt_speed)?;
                    special_function(head.power_special_functions);
                }
                None => debug!("tilt command ignored, no head axis configured"),
            },
        }
        Ok(())
    }
}

/// Optics channels ride along in every head message. The motion build has
/// no shutter or lens hardware attached; the values are surfaced for
/// bench tracing until those drivers exist.
fn optics(head: &ArtNetHead) {
    trace!(
        strobe_shutter = head.strobe_shutter,
        iris = head.iris,
        zoom = head.zoom,
        focus = head.focus,
        "optics channels"
    );
    if let Some([r, g, b]) = head.led {
        trace!(r, g, b, "led channels");
    }
}

/// Special function slots 1 through 9 are reserved by the host protocol;
/// none are assigned an action yet.
fn special_function(value: u8) {
    if (1..=9).contains(&value) {
        debug!(value, "special function requested, none assigned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Profile;
    use crate::protocol::ArtNetBody;
    use crate::startup::CalibrationPlan;
    use hardware::odrive::mock::{Command, MockController};

    fn report(motor: u8, start_index: i32) -> AxisReport {
        AxisReport {
            motor,
            plan: CalibrationPlan::ReapplyFlags,
            ready_timed_out: false,
            index_found: true,
            start_index,
            index_offset: start_index as f32 * 8192.0,
        }
    }

    fn body_message(pan_control: u8) -> Message {
        Message::Body(ArtNetBody {
            pan: 40_000,
            pan_control,
            pan_tilt_speed: 30,
            power_special_functions: 0,
        })
    }

    #[test]
    fn identify_writes_the_profile_identifier() {
        let config = FixtureConfig::for_profile(Profile::Head);
        let mut fixture = Fixture::new(&config, &[report(config.axes[0].motor, 0)]);
        let mut link = MockController::new();
        let mut host = Vec::new();
        fixture.handle(&mut link, &mut host, Message::Identify).unwrap();
        assert_eq!(host, vec![0x50]);
        assert!(link.commands.is_empty());
    }

    #[test]
    fn pan_command_drives_the_body_axis() {
        let config = FixtureConfig::for_profile(Profile::Body);
        let motor = config.axes[0].motor;
        let mut fixture = Fixture::new(&config, &[report(motor, 2)]);
        let mut link = MockController::new();
        let mut host = Vec::new();

        fixture.handle(&mut link, &mut host, body_message(0)).unwrap();
        assert!(link
            .commands_for(motor)
            .iter()
            .any(|c| matches!(c, Command::TrapezoidalMove { .. })));
        assert!(host.is_empty());
    }

    #[test]
    fn pan_command_is_dropped_without_a_body_axis() {
        let config = FixtureConfig::for_profile(Profile::Head);
        let mut fixture = Fixture::new(&config, &[report(config.axes[0].motor, 0)]);
        let mut link = MockController::new();
        let mut host = Vec::new();

        fixture.handle(&mut link, &mut host, body_message(0)).unwrap();
        assert!(link.commands.is_empty());
    }

    #[test]
    fn bench_profile_routes_both_streams() {
        let config = FixtureConfig::for_profile(Profile::BothForTesting);
        let reports: Vec<_> = config.axes.iter().map(|a| report(a.motor, 0)).collect();
        let mut fixture = Fixture::new(&config, &reports);
        let mut link = MockController::new();
        let mut host = Vec::new();

        fixture.handle(&mut link, &mut host, body_message(0)).unwrap();
        let head = Message::Head(ArtNetHead {
            strobe_shutter: 0,
            iris: 0,
            zoom: 0,
            focus: 0,
            tilt: 20_000,
            tilt_control: 0,
            pan_tilt_speed: 60,
            power_special_functions: 0,
            led: None,
        });
        fixture.handle(&mut link, &mut host, head).unwrap();

        let body_motor = config.axis(AxisRole::Body).unwrap().motor;
        let head_motor = config.axis(AxisRole::Head).unwrap().motor;
        assert!(!link.commands_for(body_motor).is_empty());
        assert!(!link.commands_for(head_motor).is_empty());
    }

    #[test]
    fn status_messages_issue_no_motion() {
        let config = FixtureConfig::for_profile(Profile::Body);
        let mut fixture = Fixture::new(&config, &[report(config.axes[0].motor, 0)]);
        let mut link = MockController::new();
        let mut host = Vec::new();
        for mtype in [MessageType::Ok, MessageType::Warning, MessageType::Error] {
            fixture
                .handle(&mut link, &mut host, Message::Status(mtype))
                .unwrap();
        }
        assert!(link.commands.is_empty());
        assert!(host.is_empty());
    }
}
