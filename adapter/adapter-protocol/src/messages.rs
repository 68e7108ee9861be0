use crate::dap::*;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::*;
use serde_json::Value;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProtocolMessage {
    pub seq: u32,
    #[serde(flatten)]
    pub type_: ProtocolMessageType,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ProtocolMessageType {
    #[serde(rename = "request")]
    Request(RequestMessage),
    #[serde(rename = "response")]
    Response(ResponseMessage),
    #[serde(rename = "event")]
    Event(EventMessage),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestMessage {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResponseMessage {
    pub request_seq: u32,
    pub success: bool,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EventMessage {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// A DAP request, identified by its command name.
pub trait Request {
    const COMMAND: &'static str;
    type Arguments: Serialize + DeserializeOwned;
    type Body: Serialize + DeserializeOwned;
}

/// A DAP event, identified by its event name.
pub trait Event {
    const EVENT: &'static str;
    type Body: Serialize + DeserializeOwned;
}

macro_rules! requests {
    ($($name:ident($command:literal): $args:ty => $body:ty;)*) => {
        $(
            pub enum $name {}

            impl Request for $name {
                const COMMAND: &'static str = $command;
                type Arguments = $args;
                type Body = $body;
            }
        )*
    };
}

macro_rules! events {
    ($($name:ident($event:literal): $body:ty;)*) => {
        $(
            pub enum $name {}

            impl Event for $name {
                const EVENT: &'static str = $event;
                type Body = $body;
            }
        )*
    };
}

pub mod requests {
    use super::*;

    requests! {
        Initialize("initialize"): ClientCapabilities => Capabilities;
        Launch("launch"): Value => Value;
        Attach("attach"): Value => Value;
        ConfigurationDone("configurationDone"): Value => Value;
        Disconnect("disconnect"): DisconnectArguments => Value;
        Threads("threads"): Value => ThreadsResponseBody;
        StackTrace("stackTrace"): StackTraceArguments => StackTraceResponseBody;
        Scopes("scopes"): ScopesArguments => ScopesResponseBody;
        Variables("variables"): VariablesArguments => VariablesResponseBody;
        Evaluate("evaluate"): EvaluateArguments => EvaluateResponseBody;
        ReadMemory("readMemory"): ReadMemoryArguments => ReadMemoryResponseBody;
        WriteMemory("writeMemory"): WriteMemoryArguments => WriteMemoryResponseBody;
        DataBreakpointInfo("dataBreakpointInfo"): DataBreakpointInfoArguments => DataBreakpointInfoResponseBody;
        SetDataBreakpoints("setDataBreakpoints"): SetDataBreakpointsArguments => SetDataBreakpointsResponseBody;
    }
}

pub mod events {
    use super::*;

    events! {
        Initialized("initialized"): Value;
        Stopped("stopped"): StoppedEventBody;
        Continued("continued"): ContinuedEventBody;
        Memory("memory"): MemoryEventBody;
        Terminated("terminated"): Value;
    }
}

////////////////////////////////////////////////////////////////////////////////////
