use crate::dap_session::{AdapterConnection, DAPChannel, DAPSession};
use crate::debug_host::{request, DebugHost, SessionRef};
use crate::inspector::MemoryInspector;
use crate::prelude::*;
use crate::session_tracker::SessionEvent;

use adapter_protocol::*;
use clap::ArgMatches;
use serde_json::Value;
use std::cell::RefCell;
use std::fmt::Write;
use std::rc::Rc;
use tokio::sync::broadcast;
use tokio::time::Duration;

const SESSION_ID: &str = "1";

pub struct LaunchOptions {
    pub address: String,
    pub session_type: String,
    // "launch" or "attach"
    pub request: String,
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Read {
        address: String,
        offset: i64,
        count: i64,
    },
    Write {
        address: String,
        offset: i64,
        data: Vec<u8>,
    },
    Variables,
    Watch {
        data_id: String,
        access: Option<DataBreakpointAccessType>,
    },
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a str, Error> {
    match matches.value_of(name) {
        Some(value) => Ok(value),
        None => bail!(blame_user(str_error(format!("--{} is required", name)))),
    }
}

fn parse_number(text: Option<&str>, name: &str) -> Result<i64, Error> {
    match text {
        None => Ok(0),
        Some(text) => match parse_int::parse::<i64>(text) {
            Ok(n) => Ok(n),
            Err(_) => bail!(blame_user(str_error(format!("Invalid {}: {}", name, text)))),
        },
    }
}

impl Command {
    pub fn from_matches(matches: &ArgMatches) -> Result<Command, Error> {
        match matches.subcommand() {
            ("read", Some(m)) => Ok(Command::Read {
                address: required(m, "address")?.to_owned(),
                offset: parse_number(m.value_of("offset"), "offset")?,
                count: parse_number(Some(required(m, "count")?), "count")?,
            }),
            ("write", Some(m)) => Ok(Command::Write {
                address: required(m, "address")?.to_owned(),
                offset: parse_number(m.value_of("offset"), "offset")?,
                data: parse_hex_bytes(required(m, "data")?)?,
            }),
            ("variables", _) => Ok(Command::Variables),
            ("watch", Some(m)) => Ok(Command::Watch {
                data_id: required(m, "data-id")?.to_owned(),
                access: match m.value_of("access") {
                    Some(access) => Some(serde_json::from_value(Value::String(access.into()))?),
                    None => None,
                },
            }),
            _ => bail!(blame_user(str_error("Expected one of: read, write, variables, watch"))),
        }
    }
}

/// Parses bytes written as hex digits, e.g. `0xdeadbeef` or `de ad be ef`.
pub fn parse_hex_bytes(text: &str) -> Result<Vec<u8>, Error> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let digits = digits.strip_prefix("0x").unwrap_or(&digits);
    match hex::decode(digits) {
        Ok(bytes) => Ok(bytes),
        Err(err) => bail!(blame_user(str_error(format!("Not a sequence of hex bytes: '{}' ({})", text, err)))),
    }
}

pub fn hex_dump(address: u128, bytes: &[u8]) -> String {
    let mut output = String::new();
    for (row_index, row) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = row.iter().map(|b| format!("{:02x}", b)).collect();
        let text: String = row
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        let row_address = address.wrapping_add(row_index as u128 * 16);
        let _ = writeln!(output, "0x{:08x}: {:<47}  {}", row_address, hex.join(" "), text);
    }
    output
}

pub async fn run_session(
    channel: Box<dyn DAPChannel>,
    launch: &LaunchOptions,
    settings: &InspectorSettings,
    command: &Command,
) -> Result<(), Error> {
    let output = inspect(channel, launch, settings, command).await?;
    print!("{}", output);
    if !output.ends_with('\n') {
        println!();
    }
    Ok(())
}

/// Runs `command` against a fresh session on `channel` and returns its printable result.
pub async fn inspect(
    channel: Box<dyn DAPChannel>,
    launch: &LaunchOptions,
    settings: &InspectorSettings,
    command: &Command,
) -> Result<String, Error> {
    let host = DebugHost::new();
    let mut inspector = MemoryInspector::activate(&host, settings);

    let (dap_session, dap_fut) = DAPSession::new(channel, AdapterConnection::observer(&host, SESSION_ID));
    tokio::task::spawn_local(dap_fut);
    let mut adapter_events = dap_session.subscribe_events()?;

    let name = launch.config.get("name").and_then(|n| n.as_str()).unwrap_or("memory-inspector");
    let connection = AdapterConnection::new(SESSION_ID, name, &launch.session_type, dap_session);
    let session: SessionRef = connection;
    host.session_will_start(session.clone());
    host.set_active_session(Some(SESSION_ID));

    let result = async {
        let stopped = start(&session, &mut adapter_events, launch, settings).await?;
        execute(&inspector, &session, &stopped, command, settings).await
    }
    .await;

    let args = DisconnectArguments {
        restart: None,
        terminate_debuggee: Some(launch.request == "launch"),
    };
    log_errors!(request::<requests::Disconnect>(&*session, &args).await);
    host.session_will_stop(SESSION_ID);
    inspector.dispose();
    result
}

async fn next_event(adapter_events: &mut broadcast::Receiver<EventMessage>, event: &str) -> Result<EventMessage, Error> {
    loop {
        match adapter_events.recv().await {
            Ok(message) if message.event == event => return Ok(message),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(count)) => warn!("Missed {} adapter events", count),
            Err(broadcast::error::RecvError::Closed) => {
                bail!(blame_user(str_error(format!("The debug adapter exited before '{}'", event))))
            }
        }
    }
}

async fn wait_for_event(
    adapter_events: &mut broadcast::Receiver<EventMessage>,
    event: &str,
    timeout: Duration,
) -> Result<EventMessage, Error> {
    match tokio::time::timeout(timeout, next_event(adapter_events, event)).await {
        Ok(result) => result,
        Err(_) => bail!(blame_user(str_error(format!("Timed out waiting for '{}'", event)))),
    }
}

/// Brings the session from initialize up to its first stop.
async fn start(
    session: &SessionRef,
    adapter_events: &mut broadcast::Receiver<EventMessage>,
    launch: &LaunchOptions,
    settings: &InspectorSettings,
) -> Result<StoppedEventBody, Error> {
    let timeout = Duration::from_secs_f32(settings.stop_timeout.unwrap_or(10.0).max(0.0));

    let args = InitializeRequestArguments {
        client_id: Some("memory-inspector".into()),
        client_name: Some("Memory Inspector".into()),
        adapter_id: launch.session_type.clone(),
        lines_start_at1: Some(true),
        columns_start_at1: Some(true),
        path_format: Some("path".into()),
        supports_variable_type: Some(true),
        supports_memory_references: Some(true),
        supports_memory_event: Some(true),
        ..Default::default()
    };
    session.custom_request(requests::Initialize::COMMAND, serde_json::to_value(&args)?).await?;

    // Some adapters answer launch/attach only after configuration is done.
    let launch_request = session.custom_request(&launch.request, launch.config.clone());
    wait_for_event(adapter_events, events::Initialized::EVENT, timeout).await?;
    session.custom_request(requests::ConfigurationDone::COMMAND, Value::Null).await?;
    launch_request.await?;

    let stopped = wait_for_event(adapter_events, events::Stopped::EVENT, timeout).await?;
    let body: StoppedEventBody = serde_json::from_value(stopped.body.unwrap_or_default())?;
    info!("Debuggee stopped: {}", body.reason);
    Ok(body)
}

async fn execute(
    inspector: &MemoryInspector,
    session: &SessionRef,
    stopped: &StoppedEventBody,
    command: &Command,
    settings: &InspectorSettings,
) -> Result<String, Error> {
    match command {
        Command::Read { address, offset, count } => {
            let chunk_size = settings.read_chunk_size.unwrap_or(1024).max(1) as i64;
            let mut start_address = None;
            let mut bytes: Vec<u8> = Vec::new();
            while (bytes.len() as i64) < *count {
                let done = bytes.len() as i64;
                let args = ReadMemoryArguments {
                    memory_reference: address.clone(),
                    offset: Some(offset + done),
                    count: chunk_size.min(count - done),
                };
                let memory = inspector.memory_provider.read(&args, None).await?;
                start_address.get_or_insert(memory.address);
                if memory.bytes.is_empty() {
                    debug!("Read stopped short at {} of {} bytes", done, count);
                    break;
                }
                bytes.extend(memory.bytes);
            }
            Ok(hex_dump(start_address.unwrap_or(0), &bytes))
        }
        Command::Write { address, offset, data } => {
            let written = Rc::new(RefCell::new(Vec::new()));
            let mut subscription = {
                let written = written.clone();
                inspector.session_tracker.on_session_event(move |event| {
                    if let SessionEvent::MemoryWritten { body, .. } = event {
                        written.borrow_mut().push(body.clone());
                    }
                })
            };
            let result = inspector.memory_provider.write(address, *offset, data, None).await;
            subscription.dispose();
            let response = result?;

            let mut output = format!("Wrote {} bytes\n", response.bytes_written.unwrap_or(data.len() as i64));
            for body in written.borrow().iter() {
                let _ = writeln!(
                    output,
                    "Memory changed: {} offset {} count {}",
                    body.memory_reference, body.offset, body.count
                );
            }
            Ok(output)
        }
        Command::Variables => {
            let thread_id = match stopped.thread_id {
                Some(thread_id) => thread_id,
                None => {
                    let response = request::<requests::Threads>(&**session, &Value::Null).await?;
                    match response.threads.first() {
                        Some(thread) => thread.id,
                        None => bail!(blame_user(str_error("The debuggee has no threads"))),
                    }
                }
            };
            let args = StackTraceArguments {
                thread_id: Some(thread_id),
                start_frame: Some(0),
                levels: Some(1),
            };
            let stack = request::<requests::StackTrace>(&**session, &args).await?;
            let frame_id = match stack.stack_frames.first() {
                Some(frame) => frame.id,
                None => bail!(blame_user(str_error(format!("Thread {} has no frames", thread_id)))),
            };
            // The trackers learn the frame's variables by watching these requests go by.
            let scopes = request::<requests::Scopes>(&**session, &ScopesArguments { frame_id }).await?;
            for scope in scopes.scopes.iter().filter(|scope| !scope.expensive) {
                let args = VariablesArguments {
                    variables_reference: scope.variables_reference,
                    ..Default::default()
                };
                if let Err(err) = request::<requests::Variables>(&**session, &args).await {
                    warn!("Could not list {}: {}", scope.name, err);
                }
            }
            let variables = inspector.memory_provider.get_all_variables(None).await?;
            Ok(serde_json::to_string_pretty(&variables)?)
        }
        Command::Watch { data_id, access } => {
            let breakpoint = DataBreakpoint {
                data_id: data_id.clone(),
                access_type: *access,
                ..Default::default()
            };
            inspector.breakpoint_provider.add_data_breakpoints(&[breakpoint]).await?;
            Ok(serde_json::to_string_pretty(&inspector.breakpoint_provider.data_breakpoints())?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dap_codec::DAPCodec;
    use futures::prelude::*;
    use serde_json::json;
    use tokio::io::{duplex, DuplexStream};
    use tokio_util::codec::Decoder;

    #[test]
    fn hex_bytes() {
        assert_eq!(parse_hex_bytes("0xdeadBEEF").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(parse_hex_bytes("01 02\t03").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_hex_bytes("").unwrap(), Vec::<u8>::new());
        assert!(parse_hex_bytes("abc").is_err());
        assert!(parse_hex_bytes("zz").is_err());
        assert!(parse_hex_bytes("éé").is_err());
        let err = parse_hex_bytes("0x1g").unwrap_err();
        assert!(err.to_string().starts_with("Not a sequence of hex bytes: '0x1g'"));
    }

    #[test]
    fn dump_rows() {
        let bytes: Vec<u8> = (0x41..0x41 + 18).collect();
        let dump = hex_dump(0x1000, &bytes);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0x00001000: 41 42 43"));
        assert!(lines[0].ends_with("ABCDEFGHIJKLMNOP"));
        assert!(lines[1].starts_with("0x00001010: 51 52 "));
        assert!(lines[1].ends_with("  QR"));
        assert_eq!(hex_dump(0, &[]), "");
    }

    /// Answers the requests of a launch/stop/inspect cycle; memory holds `address & 0xff` at each address.
    async fn scripted_adapter(stream: DuplexStream, log: Rc<RefCell<Vec<(String, Value)>>>) {
        let mut framed = DAPCodec::new().framed(stream);
        let mut seq = 0;
        let mut next_seq = || {
            seq += 1;
            seq
        };
        while let Some(Ok(Ok(inbound))) = framed.next().await {
            let request = match inbound.message.type_ {
                ProtocolMessageType::Request(request) => request,
                _ => continue,
            };
            let args = request.arguments.clone().unwrap_or_default();
            log.borrow_mut().push((request.command.clone(), args.clone()));
            let body = match request.command.as_str() {
                "initialize" => json!({"supportsReadMemoryRequest": true, "supportsWriteMemoryRequest": true}),
                "readMemory" => {
                    let base = parse_address(args["memoryReference"].as_str().unwrap()).unwrap();
                    let start = base + args["offset"].as_i64().unwrap_or(0) as u128;
                    let count = args["count"].as_i64().unwrap() as u128;
                    let data: Vec<u8> = (start..start + count).map(|a| (a & 0xff) as u8).collect();
                    json!({"address": format_address(start), "data": base64::encode(data)})
                }
                "writeMemory" => json!({"bytesWritten": 2}),
                _ => json!({}),
            };
            let response = ProtocolMessage {
                seq: next_seq(),
                type_: ProtocolMessageType::Response(ResponseMessage {
                    request_seq: inbound.message.seq,
                    success: true,
                    command: request.command.clone(),
                    message: None,
                    body: Some(body),
                }),
            };
            framed.send(response).await.unwrap();

            let follow_up = match request.command.as_str() {
                "initialize" => Some(("initialized", json!({}))),
                "configurationDone" => Some(("stopped", json!({"reason": "entry", "threadId": 1}))),
                _ => None,
            };
            if let Some((event, body)) = follow_up {
                let event = ProtocolMessage {
                    seq: next_seq(),
                    type_: ProtocolMessageType::Event(EventMessage {
                        event: event.into(),
                        body: Some(body),
                    }),
                };
                framed.send(event).await.unwrap();
            }
            if request.command == "disconnect" {
                break;
            }
        }
    }

    fn run_command(command: Command) -> (String, Vec<(String, Value)>) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let output = tokio::task::LocalSet::new().block_on(&runtime, async {
            let (client, server) = duplex(1 << 16);
            tokio::task::spawn_local(scripted_adapter(server, log.clone()));
            let launch = LaunchOptions {
                address: String::new(),
                session_type: "gdb".into(),
                request: "launch".into(),
                config: json!({"program": "a.out"}),
            };
            let settings = InspectorSettings {
                stop_timeout: Some(5.0),
                read_chunk_size: Some(4),
                ..Default::default()
            };
            inspect(Box::new(DAPCodec::new().framed(client)), &launch, &settings, &command).await.unwrap()
        });
        let log = log.borrow().clone();
        (output, log)
    }

    #[test]
    fn read_in_chunks() {
        let (output, log) = run_command(Command::Read {
            address: "0x1000".into(),
            offset: 2,
            count: 6,
        });
        assert!(output.starts_with("0x00001002: 02 03 04 05 06 07 "), "{}", output);

        let commands: Vec<&str> = log.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(
            commands,
            vec!["initialize", "launch", "configurationDone", "readMemory", "readMemory", "disconnect"]
        );
        assert_eq!(log[3].1["count"], 4);
        assert_eq!(log[4].1["offset"], 6);
        assert_eq!(log[4].1["count"], 2);
        assert_eq!(log[5].1["terminateDebuggee"], true);
    }

    #[test]
    fn write_reports_change() {
        let (output, log) = run_command(Command::Write {
            address: "0x1000".into(),
            offset: 8,
            data: vec![0xaa, 0xbb],
        });
        assert_eq!(output, "Wrote 2 bytes\nMemory changed: 0x1000 offset 8 count 2\n");
        let (_, args) = log.iter().find(|(c, _)| c == "writeMemory").unwrap();
        assert_eq!(args["data"], base64::encode([0xaau8, 0xbb]));
    }
}
