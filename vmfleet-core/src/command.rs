//! Commands and responses exchanged between the shell, handlers and peers

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{FleetError, FleetResult};
use crate::types::VmInfo;

/// A parsed operator command.
///
/// `pattern` names the handler (`"vm kill"`); arguments are looked up by
/// name. `record` is false for commands generated internally, such as the
/// `vm info` issued by fleet aggregation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Command {
    pub pattern: String,
    pub string_args: HashMap<String, String>,
    pub list_args: HashMap<String, Vec<String>>,
    pub bool_args: HashMap<String, bool>,
    pub source: String,
    pub record: bool,
}

impl Command {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            record: true,
            ..Default::default()
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.string_args.insert(key.into(), value.into());
        self
    }

    pub fn list<I, S>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.list_args
            .insert(key.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn flag(mut self, key: impl Into<String>) -> Self {
        self.bool_args.insert(key.into(), true);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn unrecorded(mut self) -> Self {
        self.record = false;
        self
    }

    pub fn string_arg(&self, key: &str) -> Option<&str> {
        self.string_args.get(key).map(String::as_str)
    }

    pub fn list_arg(&self, key: &str) -> &[String] {
        self.list_args.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn bool_arg(&self, key: &str) -> bool {
        self.bool_args.get(key).copied().unwrap_or(false)
    }

    /// A required string argument
    pub fn require(&self, key: &str) -> FleetResult<&str> {
        self.string_arg(key)
            .ok_or_else(|| FleetError::invalid_input(key, "missing argument"))
    }
}

/// Typed payload carried alongside the text of a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseData {
    Vms(Vec<VmInfo>),
}

/// One host's answer to a command
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Response {
    pub host: String,
    pub response: String,
    pub header: Vec<String>,
    pub tabular: Vec<Vec<String>>,
    pub data: Option<ResponseData>,
    pub error: Option<String>,
}

impl Response {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn failed(host: impl Into<String>, error: &FleetError) -> Self {
        Self {
            host: host.into(),
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.response = text.into();
        self
    }

    pub fn table(mut self, header: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        self.header = header;
        self.tabular = rows;
        self
    }

    pub fn data(mut self, data: ResponseData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// VMs carried by a `vm info` response
    pub fn vms(&self) -> Option<&[VmInfo]> {
        match &self.data {
            Some(ResponseData::Vms(vms)) => Some(vms),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let cmd = Command::new("vm kill")
            .arg("target", "foo[1-3]")
            .list("names", ["a", "b"])
            .flag("noblock");

        assert_eq!(cmd.string_arg("target"), Some("foo[1-3]"));
        assert_eq!(cmd.list_arg("names"), ["a", "b"]);
        assert!(cmd.list_arg("missing").is_empty());
        assert!(cmd.bool_arg("noblock"));
        assert!(!cmd.bool_arg("verbose"));
        assert!(cmd.record);
        assert!(!cmd.clone().unrecorded().record);
        assert!(cmd.require("vlan").unwrap_err().is_malformed_input());
    }

    #[test]
    fn test_response_survives_bincode() {
        let resp = Response::new("node1")
            .table(vec!["id".into()], vec![vec!["0".into()]])
            .data(ResponseData::Vms(vec![]));

        let bytes = bincode::serialize(&resp).unwrap();
        let back: Response = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, resp);
        assert_eq!(back.vms().map(|v| v.len()), Some(0));
    }

    #[test]
    fn test_failed_response() {
        let resp = Response::failed("node1", &FleetError::vm_not_found("x"));
        assert!(resp.is_error());
        assert_eq!(resp.error.as_deref(), Some("vm not found: x"));
    }
}
