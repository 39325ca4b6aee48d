//! The posting emulator: synthetic user activity for streaming pipelines.
//!
//! This library supports the posting-emulator binary found elsewhere in this
//! project. Each cycle samples one row from each of three tables at a random
//! offset, wraps the rows in the envelope the selected sink expects and sends
//! them concurrently, forever or until told to stop.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod dispatcher;
pub mod emulator;
pub mod encoder;
pub mod record;
pub mod sampler;
pub mod sink;
