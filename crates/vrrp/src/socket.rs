//! VRRP socket handling for multicast communication.
//!
//! Implements raw socket creation, multicast group management, and
//! send/receive operations for VRRP advertisements (RFC 3768). The socket is
//! the capture binding used when the switch adapter is the Linux kernel.

use crate::adapter::CaptureBinding;
use crate::error::AdapterError;
use crate::types::{VRRP_MULTICAST_ADDR_V4, VRRP_PROTOCOL, VRRP_TTL};
use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, ErrorKind, Read};
use std::net::SocketAddrV4;
use std::os::fd::AsRawFd;
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Largest datagram we expect on the wire
const RECV_BUFFER_LEN: usize = 1500;

/// Raw IPv4 socket bound to one interface for protocol 112
pub struct RawCapture {
    socket: AsyncFd<Socket>,
    interface: String,
    if_index: u32,
    closed: CancellationToken,
}

impl RawCapture {
    /// Open a raw VRRP socket on `interface` and join the VRRP group.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(interface: &str) -> io::Result<Self> {
        let if_index = get_interface_index(interface)?;

        let socket = Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(VRRP_PROTOCOL as i32)),
        )?;
        socket.set_nonblocking(true)?;
        socket.bind_device(Some(interface.as_bytes()))?;

        let fd = socket.as_raw_fd();
        // TTL must be 255 (RFC 3768 Section 5.2.3)
        setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_TTL, VRRP_TTL as libc::c_int)?;
        setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, VRRP_TTL as libc::c_int)?;
        // Don't loop multicast packets back to sender
        setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP, 0)?;

        let capture = Self {
            socket: AsyncFd::new(socket)?,
            interface: interface.to_string(),
            if_index,
            closed: CancellationToken::new(),
        };
        capture.membership(libc::IP_ADD_MEMBERSHIP)?;
        capture.membership(libc::IP_MULTICAST_IF)?;

        debug!(interface, if_index, "Opened VRRP raw socket");
        Ok(capture)
    }

    fn membership(&self, option: libc::c_int) -> io::Result<()> {
        let mreq = libc::ip_mreqn {
            imr_multiaddr: libc::in_addr {
                s_addr: u32::from_ne_bytes(VRRP_MULTICAST_ADDR_V4.octets()),
            },
            imr_address: libc::in_addr { s_addr: 0 },
            imr_ifindex: self.if_index as libc::c_int,
        };

        let rc = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                libc::IPPROTO_IP,
                option,
                &mreq as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::ip_mreqn>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[async_trait]
impl CaptureBinding for RawCapture {
    fn name(&self) -> &str {
        &self.interface
    }

    async fn recv(&self) -> Result<Bytes, AdapterError> {
        let mut buf = [0u8; RECV_BUFFER_LEN];

        loop {
            let mut guard = tokio::select! {
                _ = self.closed.cancelled() => return Err(AdapterError::Closed),
                guard = self.socket.readable() => guard?,
            };

            match guard.try_io(|inner| {
                let mut socket: &Socket = inner.get_ref();
                socket.read(&mut buf)
            }) {
                Ok(Ok(len)) => {
                    // The raw socket sees every protocol 112 datagram; keep the VRRP group only
                    if len >= 20 && buf[16..20] == VRRP_MULTICAST_ADDR_V4.octets() {
                        return Ok(Bytes::copy_from_slice(&buf[..len]));
                    }
                }
                Ok(Err(e)) if e.kind() == ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    fn send(&self, payload: &[u8]) -> Result<(), AdapterError> {
        if self.closed.is_cancelled() {
            return Err(AdapterError::Closed);
        }
        let dst = SockAddr::from(SocketAddrV4::new(VRRP_MULTICAST_ADDR_V4, 0));
        self.socket.get_ref().send_to(payload, &dst)?;
        Ok(())
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

impl Drop for RawCapture {
    fn drop(&mut self) {
        // Best effort to leave multicast group on cleanup
        let _ = self.membership(libc::IP_DROP_MEMBERSHIP);
    }
}

fn setsockopt_int(
    fd: std::os::fd::RawFd,
    level: libc::c_int,
    option: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Get the interface index for a given interface name
pub fn get_interface_index(name: &str) -> io::Result<u32> {
    nix::net::if_::if_nametoindex(name).map_err(|_| {
        io::Error::new(ErrorKind::NotFound, format!("Interface {} not found", name))
    })
}
