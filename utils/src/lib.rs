//! Helpers shared by the codecbuf example programs and tests.
pub mod framegen;
