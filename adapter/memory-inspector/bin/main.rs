use clap::{App, AppSettings, Arg, SubCommand};

type Error = Box<dyn std::error::Error>;

fn main() -> Result<(), Error> {
    env_logger::Builder::from_default_env().init();

    let address = || Arg::with_name("address").long("address").takes_value(true).required(true);
    let offset = || Arg::with_name("offset").long("offset").takes_value(true);

    let matches = App::new("memory-inspector")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(Arg::with_name("connect").long("connect").takes_value(true).required(true))
        .arg(Arg::with_name("type").long("type").takes_value(true).default_value("gdb"))
        .arg(
            Arg::with_name("request")
                .long("request")
                .takes_value(true)
                .possible_values(&["launch", "attach"])
                .default_value("launch"),
        )
        .arg(Arg::with_name("config").long("config").takes_value(true))
        .arg(Arg::with_name("settings").long("settings").takes_value(true))
        .subcommand(
            SubCommand::with_name("read")
                .arg(address())
                .arg(offset())
                .arg(Arg::with_name("count").long("count").takes_value(true).required(true)),
        )
        .subcommand(
            SubCommand::with_name("write")
                .arg(address())
                .arg(offset())
                .arg(Arg::with_name("data").long("data").takes_value(true).required(true)),
        )
        .subcommand(SubCommand::with_name("variables"))
        .subcommand(
            SubCommand::with_name("watch")
                .arg(Arg::with_name("data-id").long("data-id").takes_value(true).required(true))
                .arg(
                    Arg::with_name("access")
                        .long("access")
                        .takes_value(true)
                        .possible_values(&["read", "write", "readWrite"]),
                ),
        )
        .get_matches();

    memory_inspector::run(&matches)
}
