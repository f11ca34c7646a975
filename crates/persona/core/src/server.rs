//! Network server personas.
//!
//! A server's port is allocated by the build persona from the port ledger and
//! routed to every other persona as a secret, so clients and the server agree
//! on it without talking to each other.

use crate::context::{AppContext, ExecutionMode, RuntimeContext};
use crate::epoch::Startup;
use crate::error::{PersonaError, PersonaResult};
use crate::host::HostKind;
use crate::persona::{entry_point, Persona};
use crate::secret::Secret;
use persona_identity::Id;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Handle to a declared server, usable by the server and its clients.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    id: Id,
    key: String,
    mode: ExecutionMode,
    port: Secret<u16>,
}

impl ServerHandle {
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Persona key, which is also the service's host name when distributed.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn port_secret(&self) -> &Secret<u16> {
        &self.port
    }

    pub fn port(&self) -> PersonaResult<u16> {
        self.port.get()
    }

    /// Address the server listens on.
    pub fn bind_addr(&self) -> PersonaResult<SocketAddr> {
        let ip = match self.mode {
            ExecutionMode::InProcess => IpAddr::V4(Ipv4Addr::LOCALHOST),
            ExecutionMode::Distributed => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        Ok(SocketAddr::new(ip, self.port()?))
    }

    /// `host:port` clients connect to.
    pub fn address(&self) -> PersonaResult<String> {
        let port = self.port()?;
        Ok(match self.mode {
            ExecutionMode::InProcess => format!("{}:{port}", Ipv4Addr::LOCALHOST),
            ExecutionMode::Distributed => format!("{}:{port}", self.key),
        })
    }

    pub fn url(&self) -> PersonaResult<String> {
        Ok(format!("http://{}", self.address()?))
    }
}

impl AppContext<Startup> {
    /// Declare a server persona.
    ///
    /// The entry point should start listening and return; long-running accept
    /// loops belong in [`RuntimeContext::spawn_background`] so that the
    /// in-process runner can start the next persona.
    pub fn define_server<F, Fut>(&mut self, id: Id, entry: F) -> PersonaResult<ServerHandle>
    where
        F: Fn(RuntimeContext, ServerHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let ports = self.ports().clone();
        let port_id = id.child("port");
        let allocation_id = id.clone();
        let port: Secret<u16> =
            self.declare_secret(port_id, move || ports.allocate(&allocation_id))?;

        let key = id.to_safe_name();
        let handle = ServerHandle {
            id: id.clone(),
            key: key.clone(),
            mode: self.mode(),
            port,
        };

        let captured = handle.clone();
        let persona = Persona::new(
            id,
            HostKind::Process,
            Some(entry_point(move |rt| entry(rt, captured.clone()))),
        );
        self.register_persona(persona)?;

        let service = self
            .deployment_mut()
            .service_mut(&key)
            .ok_or_else(|| PersonaError::Unreachable(format!("server `{key}` has no service")))?;
        service
            .port_secrets
            .push(handle.port_secret().env_var().to_string());
        Ok(handle)
    }
}
