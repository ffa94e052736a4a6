//! Configuration data consumed by a context.
//!
//! These are plain data structures; reading them from a file (or any
//! other source) is the application's concern. A default-constructed
//! [`Config`] gives a working standalone context.

use std::collections::BTreeMap;

use crate::discovery::DEFAULT_UDP_RESPONDER_PORT;

/// Per-context configuration.
#[derive(Debug, Clone)]
pub struct ContextConfig {
  /// IP address or host name of the machine running this context.
  /// Required for accepting incoming connections.
  pub host: Option<String>,
  /// TCP server port; unset means no TCP server unless started
  /// explicitly.
  pub tcp_server_port: Option<u16>,
  /// Peer context names to connect to at startup.
  pub connect_to_peers: Vec<String>,
  pub enabled: bool,
  /// Command run by an external process manager to start this context.
  /// Opaque to the messaging core.
  pub program: Option<String>,
  pub program_args: Vec<String>,
  pub workdir: Option<String>,
}

impl Default for ContextConfig {
  fn default() -> Self {
    Self {
      host: None,
      tcp_server_port: None,
      connect_to_peers: Vec::new(),
      enabled: true,
      program: None,
      program_args: Vec::new(),
      workdir: None,
    }
  }
}

/// Settings of the external process manager. Opaque to the core.
#[derive(Debug, Clone, Default)]
pub struct ProcessManagementConfig {
  pub output_dir: Option<String>,
  pub server_command: Option<String>,
  pub ssh_host: Option<String>,
  pub ssh_user: Option<String>,
}

/// Top-level configuration of a mesh deployment.
#[derive(Debug, Clone)]
pub struct Config {
  /// Workgroup label; discovery requests filter on it.
  pub workgroup: String,
  /// Per-context configuration, keyed by context name.
  pub contexts: BTreeMap<String, ContextConfig>,
  pub process_management: ProcessManagementConfig,
  /// Home directory used by the `${home}` filename substitution.
  /// Falls back to the `LABMESH_HOME` environment variable, then the
  /// user's home directory.
  pub home: Option<String>,
  pub log_dir: Option<String>,
  /// Base directory of the measurement datastore, for `${datastore}`.
  pub datastore: Option<String>,
  /// Path of the loaded configuration file, for `${config_dir}`.
  pub config_file: Option<String>,
  /// UDP port of the discovery responder. `None` disables the responder
  /// entirely.
  ///
  /// Note that the responder honours unauthenticated kill requests from
  /// the network: anyone who can send a UDP packet to this port can
  /// terminate the process. Do not expose it on untrusted networks;
  /// disable it or firewall the port instead.
  pub udp_responder_port: Option<u16>,
  /// Address that discovery requests are broadcast to, optionally with
  /// an explicit port (`"host:port"`). Defaults to the limited broadcast
  /// address and the responder port.
  pub discovery_target: Option<String>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      workgroup: "default".to_string(),
      contexts: BTreeMap::new(),
      process_management: ProcessManagementConfig::default(),
      home: None,
      log_dir: None,
      datastore: None,
      config_file: None,
      udp_responder_port: Some(DEFAULT_UDP_RESPONDER_PORT),
      discovery_target: None,
    }
  }
}

impl Config {
  /// The configuration subset for the named context, or defaults when
  /// the context is not listed.
  pub fn context(&self, name: &str) -> ContextConfig {
    self.contexts.get(name).cloned().unwrap_or_default()
  }
}
