//! Test doubles for the hardware seams.

pub(crate) mod mock;
