//! Switch adapter backed by the Linux kernel.
//!
//! Interfaces are kernel netdevs, capture bindings are raw sockets and the
//! kernel already delivers joined multicast groups to the CPU, so there is no
//! hardware rule to program.

use crate::config::InterfaceSettings;
use async_trait::async_trait;
use std::collections::HashMap;
use std::ffi::CStr;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;
use vrrp::socket::get_interface_index;
use vrrp::{AdapterError, CaptureBinding, Dependency, RawCapture, SwitchAdapter};

pub struct KernelAdapter {
    /// Configured if_index to netdev name
    names: HashMap<i32, String>,
}

impl KernelAdapter {
    pub fn new(interfaces: &[InterfaceSettings]) -> Self {
        Self {
            names: interfaces
                .iter()
                .map(|interface| (interface.if_index, interface.name.clone()))
                .collect(),
        }
    }

    /// First IPv4 address the kernel has on `name`
    pub fn primary_address(name: &str) -> Option<Ipv4Addr> {
        let addrs = nix::ifaddrs::getifaddrs().ok()?;
        addrs
            .filter(|ifaddr| ifaddr.interface_name == name)
            .find_map(|ifaddr| {
                ifaddr
                    .address?
                    .as_sockaddr_in()
                    .map(|sin| sin.ip())
            })
    }
}

#[async_trait]
impl SwitchAdapter for KernelAdapter {
    async fn resolve_interface_name(&self, if_index: i32) -> Result<String, AdapterError> {
        if let Some(name) = self.names.get(&if_index) {
            return Ok(name.clone());
        }
        index_to_name(if_index).ok_or(AdapterError::InterfaceNotFound(if_index))
    }

    async fn open_capture(
        &self,
        name: &str,
        filter: &str,
    ) -> Result<Arc<dyn CaptureBinding>, AdapterError> {
        debug!(interface = name, filter, "Opening raw capture");
        let capture = RawCapture::open(name).map_err(|source| AdapterError::CaptureOpen {
            name: name.to_string(),
            source,
        })?;
        Ok(Arc::new(capture))
    }

    async fn program_protocol_filter(&self, enable: bool) -> Result<(), AdapterError> {
        debug!(enable, "Protocol filter handled by multicast membership");
        Ok(())
    }
}

#[async_trait]
impl Dependency for KernelAdapter {
    fn name(&self) -> &str {
        "kernel"
    }

    /// Ready once every configured interface exists
    async fn connect(&self) -> Result<(), AdapterError> {
        if self.names.is_empty() {
            return Err(AdapterError::NotRequired);
        }
        for name in self.names.values() {
            get_interface_index(name)
                .map_err(|_| AdapterError::Unreachable(format!("interface {} not present", name)))?;
        }
        Ok(())
    }
}

fn index_to_name(if_index: i32) -> Option<String> {
    let if_index = u32::try_from(if_index).ok()?;
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    let ptr = unsafe { libc::if_indextoname(if_index, buf.as_mut_ptr()) };
    if ptr.is_null() {
        return None;
    }
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Some(name.to_string_lossy().into_owned())
}
