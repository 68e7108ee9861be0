use crate::prelude::*;

use crate::dap_codec::{DecoderError, DecoderResult};
use crate::debug_host::{DebugHost, DebugSession};

use adapter_protocol::*;
use futures::future::LocalBoxFuture;
use futures::prelude::*;
use serde_json::Value;
use std::collections::{hash_map::Entry, HashMap};
use std::io;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use tokio::sync::{broadcast, mpsc, oneshot};

pub trait DAPChannel: Stream<Item = Result<DecoderResult, io::Error>> + Sink<ProtocolMessage, Error = io::Error> {}

impl<T> DAPChannel for T where T: Stream<Item = Result<DecoderResult, io::Error>> + Sink<ProtocolMessage, Error = io::Error> {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToAdapter,
    FromAdapter,
}

/// Sees every message exchanged over the channel, in wire order.
pub type MessageObserver = Box<dyn Fn(Direction, &Value)>;

type OutboundRequest = (String, Value, oneshot::Sender<ResponseMessage>);

/// DAPSession implements the client side of a debug adapter connection: it numbers and sends
/// requests, matches responses to them, and fans out events.
#[derive(Clone)]
pub struct DAPSession {
    // Used to communicate outgoing requests to the dispatcher.
    out_sender: mpsc::UnboundedSender<OutboundRequest>,
    // Used to create new subscriptions for events.
    events_sender: Weak<broadcast::Sender<EventMessage>>,
}

impl DAPSession {
    /// Returns a new DAPSession object and a future representing the main dispatcher loop that
    /// routes messages between the DAP channel and the requesters.
    /// The future will resolve when the adapter closes the connection from its end.
    pub fn new(channel: Box<dyn DAPChannel>, observer: MessageObserver) -> (DAPSession, impl Future<Output = ()>) {
        let mut channel: Pin<Box<dyn DAPChannel>> = channel.into();
        let events_sender = Rc::new(broadcast::channel::<EventMessage>(100).0);
        let (out_sender, mut out_receiver) = mpsc::unbounded_channel::<OutboundRequest>();
        let mut pending_requests: HashMap<u32, oneshot::Sender<ResponseMessage>> = HashMap::new();
        let mut message_seq = 0;

        let client = DAPSession {
            events_sender: Rc::downgrade(&events_sender),
            out_sender,
        };

        let dispatcher = async move {
            loop {
                tokio::select! {
                    maybe_result = channel.next() => {
                        match maybe_result {
                            Some(Ok(decoder_result)) => match decoder_result {
                                Ok(inbound) => {
                                    observer(Direction::FromAdapter, &inbound.raw);
                                    match inbound.message.type_ {
                                        ProtocolMessageType::Response(response) => match pending_requests.entry(response.request_seq) {
                                            Entry::Vacant(_) => {
                                                warn!("Received response without a pending request (request_seq={})", response.request_seq);
                                            }
                                            Entry::Occupied(entry) => {
                                                let sender = entry.remove();
                                                if sender.send(response).is_err() {
                                                    debug!("Requester is gone");
                                                }
                                            }
                                        },
                                        ProtocolMessageType::Event(event) => {
                                            // No subscribers is fine.
                                            let _ = events_sender.send(event);
                                        }
                                        ProtocolMessageType::Request(request) => {
                                            // Reverse requests (runInTerminal etc.) are not supported.
                                            message_seq += 1;
                                            let message = ProtocolMessage {
                                                seq: message_seq,
                                                type_: ProtocolMessageType::Response(ResponseMessage {
                                                    request_seq: inbound.message.seq,
                                                    success: false,
                                                    command: request.command.clone(),
                                                    message: Some(format!("Unsupported request: {}", request.command)),
                                                    body: None,
                                                }),
                                            };
                                            log_errors!(channel.send(message).await);
                                        }
                                    }
                                }
                                Err(DecoderError::SerdeError { error, value }) => {
                                    // The decoder read a complete frame, but failed to deserialize it
                                    error!("Deserialization error: {} in {}", error, value);
                                }
                            },
                            Some(Err(err)) => {
                                error!("Frame decoder error: {}", err);
                                break;
                            }
                            None => {
                                debug!("The debug adapter has disconnected");
                                break;
                            }
                        }
                    },
                    Some((command, arguments, response_sender)) = out_receiver.recv() => {
                        message_seq += 1;
                        let message = ProtocolMessage {
                            seq: message_seq,
                            type_: ProtocolMessageType::Request(RequestMessage {
                                command,
                                arguments: if arguments.is_null() { None } else { Some(arguments) },
                            }),
                        };
                        match serde_json::to_value(&message) {
                            Ok(raw) => observer(Direction::ToAdapter, &raw),
                            Err(err) => error!("Could not serialize request: {}", err),
                        }
                        pending_requests.insert(message.seq, response_sender);
                        log_errors!(channel.send(message).await);
                    }
                }
            }
            // Dropping the pending senders fails whoever is still waiting.
            drop(pending_requests);
            drop(events_sender);
        };

        (client, dispatcher)
    }

    /// Subscribe to DAP events.
    pub fn subscribe_events(&self) -> Result<broadcast::Receiver<EventMessage>, Error> {
        match self.events_sender.upgrade() {
            Some(r) => Ok(r.subscribe()),
            None => Err("DAP session is gone".into()),
        }
    }

    /// Queues a request right away, so requests go out in the order this is called;
    /// the returned future resolves with the adapter's response.
    pub fn send_request(&self, command: &str, arguments: Value) -> impl Future<Output = Result<ResponseMessage, Error>> {
        let (response_sender, response_receiver) = oneshot::channel();
        let queued = self.out_sender.send((command.into(), arguments, response_sender)).is_ok();
        let command = command.to_owned();
        async move {
            if !queued {
                return Err(str_error("DAP session is gone"));
            }
            match response_receiver.await {
                Ok(response) => Ok(response),
                Err(_) => Err(str_error(format!("No response to '{}': the debug adapter has disconnected", command))),
            }
        }
    }
}

/// A debug session backed by a live adapter connection.
pub struct AdapterConnection {
    id: String,
    name: String,
    session_type: String,
    dap_session: DAPSession,
}

impl AdapterConnection {
    pub fn new(id: &str, name: &str, session_type: &str, dap_session: DAPSession) -> Rc<AdapterConnection> {
        Rc::new(AdapterConnection {
            id: id.into(),
            name: name.into(),
            session_type: session_type.into(),
            dap_session,
        })
    }

    pub fn dap_session(&self) -> &DAPSession {
        &self.dap_session
    }

    /// Routes a session's traffic to the host's trackers.
    pub fn observer(host: &Rc<DebugHost>, session_id: &str) -> MessageObserver {
        let host = Rc::downgrade(host);
        let session_id = session_id.to_owned();
        Box::new(move |direction, message| {
            if let Some(host) = host.upgrade() {
                match direction {
                    Direction::ToAdapter => host.client_message(&session_id, message),
                    Direction::FromAdapter => host.adapter_message(&session_id, message),
                }
            }
        })
    }
}

impl DebugSession for AdapterConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn session_type(&self) -> &str {
        &self.session_type
    }

    fn custom_request(&self, command: &str, args: Value) -> LocalBoxFuture<'static, Result<Value, Error>> {
        let response = self.dap_session.send_request(command, args);
        let command = command.to_owned();
        async move {
            let response = response.await?;
            if response.success {
                Ok(response.body.unwrap_or(Value::Null))
            } else {
                let message = response.message.unwrap_or_else(|| format!("'{}' failed", command));
                Err(blame_user(str_error(message)).into())
            }
        }
        .boxed_local()
    }
}
