//! JSON payloads carried by `INFO` and `CONNECT` (spec.md §6).

use serde::{Deserialize, Serialize};

/// Sent by the server on accept/dial, and again whenever cluster topology
/// changes or lame-duck mode is entered.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ServerInfo {
    pub server_id: String,
    #[serde(default)]
    pub server_name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    /// Cluster name. Empty/absent means "ephemeral": the server will adopt
    /// whatever name a peer offers during route negotiation.
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub connect_urls: Vec<String>,
    #[serde(default)]
    pub lame_duck_mode: bool,
    /// Only meaningful on route `INFO`: the sender's own server id, used to
    /// detect and drop a self-connect.
    #[serde(default)]
    pub route_id: Option<String>,
}

/// Sent by a client as the body of `CONNECT`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ConnectInfo {
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub pedantic: bool,
    pub protocol: i32,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Which account this connection joins. Absent binds to the global
    /// account (spec.md §3 "Account").
    #[serde(default)]
    pub account: Option<String>,
}
