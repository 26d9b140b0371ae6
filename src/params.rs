use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// A typed configuration value.
///
/// Parameter maps are deliberately loosely keyed (string names) but strictly
/// typed: a key that is present with the wrong variant is rejected during
/// validation rather than coerced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Bool(bool),
    U16(u16),
    U32(u32),
    Str(String),
    StrList(Vec<String>),
}

impl ParamValue {
    fn kind_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "boolean",
            ParamValue::U16(_) => "uint16",
            ParamValue::U32(_) => "uint32",
            ParamValue::Str(_) => "string",
            ParamValue::StrList(_) => "string array",
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<u16> for ParamValue {
    fn from(v: u16) -> Self {
        ParamValue::U16(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::U32(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(v: Vec<String>) -> Self {
        ParamValue::StrList(v)
    }
}

impl From<&[&str]> for ParamValue {
    fn from(v: &[&str]) -> Self {
        ParamValue::StrList(v.iter().map(|s| s.to_string()).collect())
    }
}

/// An ordered map of named, typed configuration parameters.
///
/// # Example
/// ```rust
/// use udpmux::ParamMap;
///
/// let params = ParamMap::new()
///     .with("port", 4840u16)
///     .with("listen", true)
///     .with("address", "239.0.0.1");
/// ```
#[derive(Debug, Clone, Default)]
pub struct ParamMap {
    entries: BTreeMap<String, ParamValue>,
}

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion.
    pub fn with(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<ParamValue>) {
        self.entries.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.entries.get(key)
    }

    pub(crate) fn get_bool(&self, key: &str) -> Option<bool> {
        match self.entries.get(key) {
            Some(ParamValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub(crate) fn get_u16(&self, key: &str) -> Option<u16> {
        match self.entries.get(key) {
            Some(ParamValue::U16(v)) => Some(*v),
            _ => None,
        }
    }

    pub(crate) fn get_u32(&self, key: &str) -> Option<u32> {
        match self.entries.get(key) {
            Some(ParamValue::U32(v)) => Some(*v),
            _ => None,
        }
    }

    pub(crate) fn get_str(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(ParamValue::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// A scalar string is returned as a one-element list.
    pub(crate) fn get_str_list(&self, key: &str) -> Option<Vec<String>> {
        match self.entries.get(key) {
            Some(ParamValue::Str(v)) => Some(vec![v.clone()]),
            Some(ParamValue::StrList(v)) => Some(v.clone()),
            _ => None,
        }
    }
}

/// What a single parameter is allowed to look like.
struct ParamSpec {
    name: &'static str,
    kind: ParamKind,
    required: bool,
    array: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ParamKind {
    Bool,
    U16,
    U32,
    Str,
}

impl ParamKind {
    fn name(self) -> &'static str {
        match self {
            ParamKind::Bool => "boolean",
            ParamKind::U16 => "uint16",
            ParamKind::U32 => "uint32",
            ParamKind::Str => "string",
        }
    }
}

/// Validated when the manager starts.
const MANAGER_PARAMS: &[ParamSpec] = &[ParamSpec {
    name: "recv-bufsize",
    kind: ParamKind::U32,
    required: false,
    array: false,
}];

/// Validated on every `open_connection` call.
const OPEN_PARAMS: &[ParamSpec] = &[
    ParamSpec { name: "listen", kind: ParamKind::Bool, required: false, array: false },
    ParamSpec { name: "address", kind: ParamKind::Str, required: false, array: true },
    ParamSpec { name: "port", kind: ParamKind::U16, required: true, array: false },
    ParamSpec { name: "interface", kind: ParamKind::Str, required: false, array: false },
    ParamSpec { name: "ttl", kind: ParamKind::U32, required: false, array: false },
    ParamSpec { name: "loopback", kind: ParamKind::Bool, required: false, array: false },
    ParamSpec { name: "reuse", kind: ParamKind::Bool, required: false, array: false },
    ParamSpec { name: "sockpriority", kind: ParamKind::U32, required: false, array: false },
    ParamSpec { name: "validate", kind: ParamKind::Bool, required: false, array: false },
];

/// Checks a map against a descriptor table: required keys must be present,
/// present keys must match their declared type, and keys outside the table
/// are rejected.
fn validate(params: &ParamMap, specs: &[ParamSpec]) -> Result<()> {
    for spec in specs {
        let Some(value) = params.get(spec.name) else {
            if spec.required {
                return Err(Error::Internal(format!(
                    "Required parameter '{}' is missing",
                    spec.name
                )));
            }
            continue;
        };

        let matches = match (value, spec.kind) {
            (ParamValue::Bool(_), ParamKind::Bool) => true,
            (ParamValue::U16(_), ParamKind::U16) => true,
            (ParamValue::U32(_), ParamKind::U32) => true,
            (ParamValue::Str(_), ParamKind::Str) => true,
            (ParamValue::StrList(_), ParamKind::Str) => spec.array,
            _ => false,
        };
        if !matches {
            return Err(Error::Internal(format!(
                "Parameter '{}' must be a {}, got a {}",
                spec.name,
                spec.kind.name(),
                value.kind_name()
            )));
        }
    }

    for key in params.entries.keys() {
        if !specs.iter().any(|spec| spec.name == key) {
            return Err(Error::Internal(format!("Unknown parameter '{key}'")));
        }
    }

    Ok(())
}

/// Manager-level configuration, taken at `start`.
pub(crate) struct ManagerConfig {
    pub(crate) recv_bufsize: usize,
}

impl ManagerConfig {
    pub(crate) const DEFAULT_RECV_BUFSIZE: usize = 1 << 16;

    pub(crate) fn from_params(params: &ParamMap) -> Result<Self> {
        validate(params, MANAGER_PARAMS)?;
        let recv_bufsize = params
            .get_u32("recv-bufsize")
            .map(|v| v as usize)
            .unwrap_or(Self::DEFAULT_RECV_BUFSIZE);
        Ok(Self { recv_bufsize })
    }
}

/// Socket options applied to every new endpoint socket.
#[derive(Default, Clone)]
pub(crate) struct SocketOptions {
    pub(crate) ttl: Option<u32>,
    pub(crate) loopback: Option<bool>,
    pub(crate) reuse: Option<bool>,
    pub(crate) priority: Option<u32>,
}

/// Per-open configuration, lowered from a validated parameter map.
pub(crate) struct OpenConfig {
    pub(crate) port: u16,
    pub(crate) addresses: Vec<String>,
    pub(crate) listen: bool,
    pub(crate) interface: Option<String>,
    pub(crate) options: SocketOptions,
    pub(crate) validate: bool,
}

impl OpenConfig {
    pub(crate) fn from_params(params: &ParamMap) -> Result<Self> {
        validate(params, OPEN_PARAMS)?;
        let port = params
            .get_u16("port")
            .ok_or_else(|| Error::Internal("Required parameter 'port' is missing".into()))?;
        Ok(Self {
            port,
            addresses: params.get_str_list("address").unwrap_or_default(),
            listen: params.get_bool("listen").unwrap_or(false),
            interface: params.get_str("interface").map(str::to_string),
            options: SocketOptions {
                ttl: params.get_u32("ttl"),
                loopback: params.get_bool("loopback"),
                reuse: params.get_bool("reuse"),
                priority: params.get_u32("sockpriority"),
            },
            validate: params.get_bool("validate").unwrap_or(false),
        })
    }

    /// The single destination host of an outgoing endpoint. Outgoing opens
    /// do not accept address arrays.
    pub(crate) fn send_host(&self) -> Option<&str> {
        match self.addresses.as_slice() {
            [host] => Some(host.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> ParamMap {
        ParamMap::new().with("port", 4840u16)
    }

    #[test]
    fn open_params_accept_the_full_set() {
        let params = minimal()
            .with("listen", true)
            .with("address", vec!["127.0.0.1".to_string(), "::1".to_string()])
            .with("interface", "lo")
            .with("ttl", 4u32)
            .with("loopback", true)
            .with("reuse", true)
            .with("sockpriority", 3u32)
            .with("validate", false);
        let cfg = OpenConfig::from_params(&params).expect("valid parameter set");
        assert_eq!(cfg.port, 4840);
        assert_eq!(cfg.addresses.len(), 2);
        assert!(cfg.listen);
        assert_eq!(cfg.interface.as_deref(), Some("lo"));
        assert_eq!(cfg.options.ttl, Some(4));
    }

    #[test]
    fn port_is_required() {
        let err = OpenConfig::from_params(&ParamMap::new().with("listen", true));
        assert!(matches!(err, Err(Error::Internal(_))));
    }

    #[test]
    fn port_must_be_a_uint16() {
        let err = OpenConfig::from_params(&ParamMap::new().with("port", 4840u32));
        assert!(matches!(err, Err(Error::Internal(_))));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = OpenConfig::from_params(&minimal().with("ttk", 1u32));
        assert!(matches!(err, Err(Error::Internal(_))));
    }

    #[test]
    fn recv_bufsize_is_not_an_open_parameter() {
        let err = OpenConfig::from_params(&minimal().with("recv-bufsize", 1024u32));
        assert!(matches!(err, Err(Error::Internal(_))));
    }

    #[test]
    fn scalar_address_becomes_a_single_entry() {
        let cfg = OpenConfig::from_params(&minimal().with("address", "localhost"))
            .expect("scalar address");
        assert_eq!(cfg.addresses, vec!["localhost".to_string()]);
        assert_eq!(cfg.send_host(), Some("localhost"));
    }

    #[test]
    fn address_array_has_no_send_host() {
        let cfg = OpenConfig::from_params(
            &minimal().with("address", vec!["a".to_string(), "b".to_string()]),
        )
        .expect("address array");
        assert_eq!(cfg.send_host(), None);
    }

    #[test]
    fn only_address_may_be_an_array() {
        let params = minimal().with("interface", vec!["eth0".to_string()]);
        assert!(matches!(
            OpenConfig::from_params(&params),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn manager_config_defaults_the_buffer_size() {
        let cfg = ManagerConfig::from_params(&ParamMap::new()).expect("empty map");
        assert_eq!(cfg.recv_bufsize, ManagerConfig::DEFAULT_RECV_BUFSIZE);

        let cfg = ManagerConfig::from_params(&ParamMap::new().with("recv-bufsize", 2048u32))
            .expect("explicit size");
        assert_eq!(cfg.recv_bufsize, 2048);
    }

    #[test]
    fn manager_config_rejects_open_parameters() {
        let err = ManagerConfig::from_params(&ParamMap::new().with("port", 4840u16));
        assert!(matches!(err, Err(Error::Internal(_))));
    }
}
