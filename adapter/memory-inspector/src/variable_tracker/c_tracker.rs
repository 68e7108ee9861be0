use super::TrackerStrategy;
use crate::debug_host::{request, SessionRef};
use crate::prelude::*;

use adapter_protocol::{parse_address, requests, EvaluateArguments, Variable, VariableRange};
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref HEX_ADDRESS: Regex = Regex::new(r"(?i)0x[0-9a-f]+").unwrap();
    static ref DECIMAL_ADDRESS: Regex = Regex::new(r"[0-9]+").unwrap();
    static ref NOT_A_DIGIT: Regex = Regex::new(r"[^0-9]").unwrap();
}

/// Resolves variables of C-like targets by evaluating `&(name)` and `sizeof(name)`.
pub struct CTracker;

/// Pulls the first address-looking token out of an evaluation result such as `(int *) 0x7ffe1234`.
pub fn extract_address(text: &str) -> Option<&str> {
    HEX_ADDRESS.find(text).or_else(|| DECIMAL_ADDRESS.find(text)).map(|m| m.as_str())
}

/// Accepts only plain decimal integers.
pub fn parse_size(text: &str) -> Option<u128> {
    let text = text.trim();
    if text.is_empty() || NOT_A_DIGIT.is_match(text) {
        return None;
    }
    text.parse().ok()
}

/// Best-effort guess at whether a variable holds an address.
pub fn is_maybe_pointer(variable: &Variable, own_address: Option<&str>) -> bool {
    match variable.type_.as_deref() {
        Some(type_) => type_.trim_end().ends_with('*'),
        None => {
            let value = variable.value.trim();
            Some(value) != own_address && extract_address(value) == Some(value)
        }
    }
}

fn expression_of(variable: &Variable) -> &str {
    variable.evaluate_name.as_deref().unwrap_or(&variable.name)
}

async fn evaluate(session: &SessionRef, frame_id: i64, expression: String) -> Result<String, Error> {
    let args = EvaluateArguments {
        expression,
        frame_id: Some(frame_id),
        context: Some("watch".into()),
    };
    let response = request::<requests::Evaluate>(&**session, &args).await?;
    Ok(response.result)
}

pub(super) async fn evaluate_address(session: &SessionRef, frame_id: i64, name: &str) -> Result<Option<String>, Error> {
    let result = evaluate(session, frame_id, format!("&({})", name)).await?;
    Ok(extract_address(&result).map(Into::into))
}

pub(super) async fn evaluate_size(session: &SessionRef, frame_id: i64, name: &str) -> Result<Option<u128>, Error> {
    let result = evaluate(session, frame_id, format!("sizeof({})", name)).await?;
    Ok(parse_size(&result))
}

pub(super) async fn resolve_variable(
    session: &SessionRef,
    frame_id: i64,
    variable: &Variable,
    parent_reference: i64,
) -> Result<Option<VariableRange>, Error> {
    let expression = expression_of(variable);
    let address = async {
        match variable.memory_reference.as_deref().filter(|r| HEX_ADDRESS.is_match(r)) {
            Some(reference) => Ok(Some(reference.to_owned())),
            None => evaluate_address(session, frame_id, expression).await,
        }
    };
    let size = evaluate_size(session, frame_id, expression);
    let (address, size) = futures::join!(address, size);
    let (address, size) = (address?, size?);

    let start = match address.as_deref().and_then(parse_address) {
        Some(start) => start,
        None => return Ok(None),
    };
    let size = match size {
        Some(size) => size,
        None => return Ok(None),
    };
    Ok(Some(VariableRange {
        name: variable.name.clone(),
        start_address: start,
        end_address: start.saturating_add(size),
        type_: variable.type_.clone(),
        value: Some(variable.value.clone()),
        parent_variables_reference: Some(parent_reference),
        is_pointer: is_maybe_pointer(variable, address.as_deref()),
    }))
}

impl TrackerStrategy for CTracker {
    fn variable_to_range<'a>(
        &'a self,
        session: &'a SessionRef,
        frame_id: i64,
        variable: &'a Variable,
        parent_reference: i64,
    ) -> LocalBoxFuture<'a, Result<Option<VariableRange>, Error>> {
        resolve_variable(session, frame_id, variable, parent_reference).boxed_local()
    }

    fn address_of_variable<'a>(
        &'a self,
        session: &'a SessionRef,
        frame_id: i64,
        name: &'a str,
    ) -> LocalBoxFuture<'a, Result<Option<String>, Error>> {
        evaluate_address(session, frame_id, name).boxed_local()
    }

    fn size_of_variable<'a>(
        &'a self,
        session: &'a SessionRef,
        frame_id: i64,
        name: &'a str,
    ) -> LocalBoxFuture<'a, Result<Option<u128>, Error>> {
        evaluate_size(session, frame_id, name).boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug_host::DebugHost;
    use crate::test_support::FakeSession;
    use serde_json::{json, Value};

    fn variable(name: &str, type_: Option<&str>, value: &str) -> Variable {
        Variable {
            name: name.into(),
            value: value.into(),
            type_: type_.map(Into::into),
            ..Default::default()
        }
    }

    #[test]
    fn address_extraction() {
        assert_eq!(extract_address("(int *) 0x7FFE1234"), Some("0x7FFE1234"));
        assert_eq!(extract_address("4096"), Some("4096"));
        assert_eq!(extract_address("<optimized out>"), None);
    }

    #[test]
    fn size_parsing() {
        assert_eq!(parse_size("4"), Some(4));
        assert_eq!(parse_size(" 16 "), Some(16));
        assert_eq!(parse_size("4ul"), None);
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("-1"), None);
    }

    #[test]
    fn pointer_heuristic() {
        assert!(is_maybe_pointer(&variable("p", Some("int*"), "0x1000"), Some("0x2000")));
        assert!(is_maybe_pointer(&variable("p", Some("char *"), "0x1000"), None));
        assert!(!is_maybe_pointer(&variable("n", Some("int"), "0x1000"), Some("0x2000")));
        // Without type information, an address-like value that isn't the variable's own address.
        assert!(is_maybe_pointer(&variable("p", None, "0x1000"), Some("0x2000")));
        assert!(!is_maybe_pointer(&variable("p", None, "0x2000"), Some("0x2000")));
        assert!(!is_maybe_pointer(&variable("s", None, "\"hello\""), Some("0x2000")));
    }

    fn evaluator(_command: &str, args: &Value) -> Result<Value, String> {
        let expression = args["expression"].as_str().unwrap_or_default();
        assert_eq!(args["context"], "watch");
        assert_eq!(args["frameId"], 3);
        match expression {
            "&(counter)" => Ok(json!({"result": "(int *) 0x1000", "variablesReference": 0})),
            "sizeof(counter)" => Ok(json!({"result": "4", "variablesReference": 0})),
            "&(ptr)" => Ok(json!({"result": "0x2000", "variablesReference": 0})),
            "sizeof(ptr)" => Ok(json!({"result": "8", "variablesReference": 0})),
            "sizeof(opaque)" => Ok(json!({"result": "incomplete type", "variablesReference": 0})),
            _ => Err(format!("No symbol \"{}\" in current context.", expression)),
        }
    }

    #[test]
    fn resolves_through_evaluate() {
        let host = DebugHost::new();
        let session: SessionRef = FakeSession::start(&host, "s1", "gdb", evaluator);
        let counter = variable("counter", Some("int"), "3");
        let range = futures::executor::block_on(CTracker.variable_to_range(&session, 3, &counter, 1))
            .unwrap()
            .unwrap();
        assert_eq!(range.start_address, 0x1000);
        assert_eq!(range.end_address, 0x1004);
        assert!(!range.is_pointer);

        let ptr = variable("ptr", Some("int*"), "0x1000");
        let range = futures::executor::block_on(CTracker.variable_to_range(&session, 3, &ptr, 1))
            .unwrap()
            .unwrap();
        assert_eq!(range.end_address - range.start_address, 8);
        assert!(range.is_pointer);
    }

    #[test]
    fn unknown_size_is_unresolved() {
        let host = DebugHost::new();
        let session: SessionRef = FakeSession::start(&host, "s1", "gdb", |command, args| {
            if args["expression"] == "&(opaque)" {
                Ok(json!({"result": "0x3000", "variablesReference": 0}))
            } else {
                evaluator(command, args)
            }
        });
        let opaque = variable("opaque", None, "{...}");
        let range = futures::executor::block_on(CTracker.variable_to_range(&session, 3, &opaque, 1)).unwrap();
        assert!(range.is_none());
    }

    #[test]
    fn evaluation_errors_propagate() {
        let host = DebugHost::new();
        let session: SessionRef = FakeSession::start(&host, "s1", "gdb", evaluator);
        let missing = variable("missing", None, "1");
        assert!(futures::executor::block_on(CTracker.variable_to_range(&session, 3, &missing, 1)).is_err());
        assert_eq!(
            futures::executor::block_on(CTracker.address_of_variable(&session, 3, "counter")).unwrap(),
            Some("0x1000".to_owned())
        );
        assert_eq!(
            futures::executor::block_on(CTracker.size_of_variable(&session, 3, "ptr")).unwrap(),
            Some(8)
        );
    }

    #[test]
    fn memory_reference_skips_address_evaluation() {
        let host = DebugHost::new();
        let session = FakeSession::start(&host, "s1", "gdb", evaluator);
        let session_ref: SessionRef = session.clone();
        let mut counter = variable("counter", Some("int"), "3");
        counter.memory_reference = Some("0x5000".into());
        let range = futures::executor::block_on(CTracker.variable_to_range(&session_ref, 3, &counter, 1))
            .unwrap()
            .unwrap();
        assert_eq!(range.start_address, 0x5000);
        let expressions: Vec<String> = session
            .requests()
            .iter()
            .map(|(_, args)| args["expression"].as_str().unwrap_or_default().to_owned())
            .collect();
        assert_eq!(expressions, vec!["sizeof(counter)"]);
    }
}
