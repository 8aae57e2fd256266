#![deny(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod assemble;
pub mod filter;
pub mod mode;
pub mod record;
