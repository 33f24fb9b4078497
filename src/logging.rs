//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins when set; otherwise the level is `info`, or `debug` with
//! `verbose = true`.

use tracing_subscriber::EnvFilter;

pub fn init(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    // a second init (tests, embedding) is not an error
    if json {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}
