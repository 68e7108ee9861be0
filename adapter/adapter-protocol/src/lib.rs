mod dap;
mod inspector;
mod messages;

pub use dap::*;
pub use inspector::*;
pub use messages::{
    events, requests, Event, EventMessage, ProtocolMessage, ProtocolMessageType, Request, RequestMessage,
    ResponseMessage,
};
