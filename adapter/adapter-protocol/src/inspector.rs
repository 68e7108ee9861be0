use crate::dap::{Breakpoint, DataBreakpoint, ReadMemoryArguments, ReadMemoryResponseBody, WriteMemoryArguments};

use serde_derive::*;
use std::fmt;

/// Parses a memory reference or an address string: decimal, or `0x`-prefixed hex.
pub fn parse_address(text: &str) -> Option<u128> {
    parse_int::parse::<u128>(text.trim()).ok()
}

pub fn format_address(address: u128) -> String {
    format!("0x{:x}", address)
}

mod hex_address {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(address: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_address(*address))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_address(&text).ok_or_else(|| D::Error::custom(format!("Invalid address: {}", text)))
    }
}

/// A variable mapped onto the memory interval `[start_address, end_address)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VariableRange {
    pub name: String,
    #[serde(with = "hex_address")]
    pub start_address: u128,
    #[serde(with = "hex_address")]
    pub end_address: u128,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_variables_reference: Option<i64>,
    #[serde(default)]
    pub is_pointer: bool,
}

impl VariableRange {
    pub fn size(&self) -> u128 {
        self.end_address.saturating_sub(self.start_address)
    }

    /// Whether the variable shares at least one byte with `[start, end)`.
    pub fn overlaps(&self, start: u128, end: u128) -> bool {
        self.start_address < end && start < self.end_address
    }
}

/// A child target of a multi-target debug session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionContext {
    pub id: i64,
    pub name: String,
}

/// A contiguous block of target memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memory {
    pub address: u128,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub enum MemoryDecodeError {
    Address(String),
    Data(base64::DecodeError),
}

impl fmt::Display for MemoryDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MemoryDecodeError::Address(address) => write!(f, "Invalid memory address: {}", address),
            MemoryDecodeError::Data(err) => write!(f, "Invalid memory payload: {}", err),
        }
    }
}

impl std::error::Error for MemoryDecodeError {}

impl Memory {
    pub fn from_response(response: &ReadMemoryResponseBody) -> Result<Memory, MemoryDecodeError> {
        let address =
            parse_address(&response.address).ok_or_else(|| MemoryDecodeError::Address(response.address.clone()))?;
        let bytes = match &response.data {
            Some(data) => base64::decode(data).map_err(MemoryDecodeError::Data)?,
            None => Vec::new(),
        };
        Ok(Memory { address, bytes })
    }

    pub fn to_response(&self) -> ReadMemoryResponseBody {
        ReadMemoryResponseBody {
            address: self.address.to_string(),
            unreadable_bytes: None,
            data: Some(base64::encode(&self.bytes)),
        }
    }

    pub fn end_address(&self) -> u128 {
        self.address + self.bytes.len() as u128
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum BreakpointKind {
    Internal,
    External,
}

/// A data breakpoint request entry paired with the adapter's verdict on it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackedDataBreakpoint {
    #[serde(rename = "type")]
    pub kind: BreakpointKind,
    pub breakpoint: DataBreakpoint,
    pub response: Breakpoint,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackedDataBreakpoints {
    pub external: Vec<TrackedDataBreakpoint>,
    pub internal: Vec<TrackedDataBreakpoint>,
}

impl TrackedDataBreakpoints {
    pub fn all(&self) -> impl Iterator<Item = &TrackedDataBreakpoint> {
        self.external.iter().chain(self.internal.iter())
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Endianness {
    Little,
    Big,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryDisplaySettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_per_mau: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maus_per_group: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups_per_row: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endianness: Option<Endianness>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_padding: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_radix: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_radix_prefix: Option<bool>,
}

/// Display defaults an adapter suggests for its sessions.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryDisplaySettingsContribution {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<MemoryDisplaySettings>,
}

// Amalgamator custom requests

pub const AMALGAMATOR_GET_CHILD_DAP_NAMES: &str = "cdt-amalgamator/getChildDapNames";
pub const AMALGAMATOR_READ_MEMORY: &str = "cdt-amalgamator/readMemory";
pub const AMALGAMATOR_WRITE_MEMORY: &str = "cdt-amalgamator/writeMemory";

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChildDapNamesResponse {
    pub children: Option<Vec<ChildDap>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChildDap {
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AmalgamatorReadMemoryArguments {
    #[serde(flatten)]
    pub args: ReadMemoryArguments,
    pub child: ConnectionContext,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AmalgamatorWriteMemoryArguments {
    #[serde(flatten)]
    pub args: WriteMemoryArguments,
    pub child: ConnectionContext,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct InspectorSettings {
    pub c_tracker_types: Option<Vec<String>>,
    pub amalgamator_types: Option<Vec<String>>,
    pub stop_timeout: Option<f32>,
    pub read_chunk_size: Option<u32>,
}

////////////////////////////////////////////////////////////////////////////////////
