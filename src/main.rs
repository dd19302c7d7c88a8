use std::{env, panic, process};

use backtrace::Backtrace;
use clap::Parser;

use catnip_core::cli::Options;

fn main() {
    panic::set_hook(Box::new(|panic_info| {
        let message = match panic_info.payload().downcast_ref::<&str>() {
            Some(&message) => message.to_string(),
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(message) => message.clone(),
                None => "<no message>".to_string(),
            },
        };

        eprintln!("catnipd crashed! You are running catnipd {}.", env!("CARGO_PKG_VERSION"));
        eprintln!("This is probably a catnipd bug.");
        eprintln!();
        eprintln!("Please consider filing an issue: {}/issues", env!("CARGO_PKG_REPOSITORY"));
        eprintln!();
        eprintln!("Details: {}", message);

        if let Some(location) = panic_info.location() {
            eprintln!("in file {} on line {}", location.file(), location.line());
        }

        let should_backtrace = env::var("RUST_BACKTRACE")
            .map(|var| var == "1")
            .unwrap_or(false);

        if should_backtrace {
            eprintln!("{:?}", Backtrace::new());
        } else {
            eprintln!("note: run with `RUST_BACKTRACE=1` environment variable to display a backtrace.");
        }

        process::exit(1);
    }));

    let options = Options::parse();

    if let Err(err) = options.run() {
        eprintln!("{:?}", err);
        process::exit(1);
    }
}
