//! AF_PACKET ring backend.
//!
//! Binds one raw socket per worker to the configured interface in
//! non-blocking mode. Putting all sockets in one PACKET_FANOUT group makes
//! the kernel hash-partition the flow across them, giving each worker a
//! distinct ring slice without a shared consumer queue.

use std::ffi::CString;
use std::io;

use super::FrameRing;

/// Capture buffer size; covers a reassembled jumbo datagram.
const CAPTURE_BUF_SIZE: usize = 1 << 16;

pub struct AfPacketRing {
    fd: libc::c_int,
    buf: Vec<u8>,
}

impl AfPacketRing {
    /// Open a non-blocking raw socket on `interface`, optionally joining a
    /// fanout group shared by the node's workers.
    pub fn open(interface: &str, fanout_group: Option<u16>) -> io::Result<Self> {
        let protocol = (libc::ETH_P_ALL as u16).to_be();

        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK,
                libc::c_int::from(protocol),
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let ring = Self {
            fd,
            buf: vec![0u8; CAPTURE_BUF_SIZE],
        };

        let ifname = CString::new(interface)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name"))?;
        let ifindex = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
        if ifindex == 0 {
            return Err(io::Error::last_os_error());
        }

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
        addr.sll_protocol = protocol;
        addr.sll_ifindex = ifindex as libc::c_int;

        let rc = unsafe {
            libc::bind(
                ring.fd,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        if let Some(group) = fanout_group {
            let arg: libc::c_int =
                libc::c_int::from(group) | ((libc::PACKET_FANOUT_HASH as libc::c_int) << 16);
            let rc = unsafe {
                libc::setsockopt(
                    ring.fd,
                    libc::SOL_PACKET,
                    libc::PACKET_FANOUT,
                    &arg as *const libc::c_int as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(ring)
    }
}

impl FrameRing for AfPacketRing {
    fn poll(&mut self) -> io::Result<Option<Vec<u8>>> {
        let n = unsafe {
            libc::recv(
                self.fd,
                self.buf.as_mut_ptr() as *mut libc::c_void,
                self.buf.len(),
                libc::MSG_DONTWAIT | libc::MSG_TRUNC,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(None),
                _ => Err(err),
            };
        }

        // MSG_TRUNC reports the wire length; cap at what we captured.
        let len = (n as usize).min(self.buf.len());
        Ok(Some(self.buf[..len].to_vec()))
    }

    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        let n = unsafe {
            libc::send(
                self.fd,
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for AfPacketRing {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
