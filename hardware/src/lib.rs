//! Device drivers for the LX1 moving-light fixture.
//!
//! Two collaborators live here:
//!
//! - [`odrive`] — ASCII line-protocol driver for the ODrive motion
//!   controller, plus the [`odrive::MotionController`] trait the control
//!   core is written against and a scripted mock for tests.
//! - [`quadrature`] — LS7366R-style quadrature counter giving a signed
//!   accumulated count over an abstract register bus.

pub mod odrive;
pub mod quadrature;
