use crate::prelude::*;
use adapter_protocol::InspectorSettings;
use clap::ArgMatches;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::Duration;
use tokio_util::codec::Decoder;

#[allow(unused_imports)]
mod prelude {
    pub use crate::error::{blame_nobody, blame_user, str_error, Blame, BlamedError, Error, SessionError};
    pub use log::{debug, error, info, warn};
}
#[macro_use]
mod error;
pub mod adapter_registry;
pub mod breakpoints;
pub mod classifier;
mod commands;
pub mod dap_codec;
pub mod dap_session;
pub mod debug_host;
pub mod events;
pub mod inspector;
pub mod memory_provider;
pub mod session_tracker;
pub mod variable_tracker;

#[cfg(test)]
mod test_support;

pub use error::{Blame, BlamedError, Error, SessionError};

/// Connects to a debug adapter, brings a session up to its first stop and runs one inspector command on it.
pub fn run(matches: &ArgMatches) -> Result<(), Error> {
    let settings: InspectorSettings = match matches.value_of("settings") {
        Some(s) => match serde_json::from_str(s) {
            Ok(settings) => settings,
            Err(err) => {
                error!("{}", err);
                Default::default()
            }
        },
        None => Default::default(),
    };

    let launch = commands::LaunchOptions {
        address: match matches.value_of("connect") {
            Some(address) => address.to_owned(),
            None => bail!(blame_user(str_error("--connect is required"))),
        },
        session_type: matches.value_of("type").unwrap_or("gdb").to_owned(),
        request: matches.value_of("request").unwrap_or("launch").to_owned(),
        config: match matches.value_of("config") {
            Some(s) => serde_json::from_str(s)?,
            None => Value::Object(Default::default()),
        },
    };
    let command = commands::Command::from_matches(matches)?;

    let rt = tokio::runtime::Builder::new_current_thread() //
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();

    let result = local.block_on(&rt, async {
        debug!("Connecting to {}", launch.address);
        let tcp_stream = TcpStream::connect(&launch.address).await?;
        tcp_stream.set_nodelay(true)?;
        let framed_stream = dap_codec::DAPCodec::new().framed(tcp_stream);
        commands::run_session(Box::new(framed_stream), &launch, &settings, &command).await
    });

    drop(local);
    rt.shutdown_timeout(Duration::from_millis(10));
    debug!("Exiting");
    result
}
