//! Motion firmware for a pan/tilt stage-light fixture.
//!
//! A host console streams framed motion messages over a serial link;
//! this crate decodes them ([`protocol`]), runs a per-axis control state
//! machine ([`axis`]) against an ASCII-protocol motion controller, and
//! handles the one-time calibration and homing pass at startup
//! ([`startup`]). [`fixture`] ties the pieces together for whichever
//! axis complement the build profile selects ([`config`]).

pub mod axis;
pub mod config;
pub mod fixture;
pub mod protocol;
pub mod startup;
