//! Command line program for running `spindle` servers.
//!
//! The same executable doubles as the worker image: servers started with
//! `spindle open` launch their workers by re-running it.

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;

extern crate anyhow;
extern crate clap;
extern crate colored;

extern crate spindle_core as spindle;

pub mod builtin;
pub mod cli;
pub mod settings;

use colored::*;

fn main() {
    // Workers never get to the command line
    spindle_net::worker::run_if_worker(&builtin::registry());

    // Run the program based on user input
    if let Err(e) = cli::start(cli::app().get_matches()) {
        eprintln!("{}{}", "error: ".red(), e);
        if e.root_cause().to_string() != e.to_string() {
            eprintln!("Caused by:\n{}", e.root_cause())
        }
        std::process::exit(1);
    }
}
