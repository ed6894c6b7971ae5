//! Vsock stream connector.
//!
//! Vsock (virtual socket) connects a guest to its host without any network
//! configuration. Raw libc calls keep this free of extra dependencies; the
//! socket is wrapped in a `UnixStream` for the Read/Write impls.
//!
//! # CID values
//!
//! - `VMADDR_CID_HYPERVISOR` (0): reserved
//! - `VMADDR_CID_LOCAL` (1): loopback
//! - `VMADDR_CID_HOST` (2): the host machine
//! - 3+: guest VMs, assigned by the hypervisor
//!
//! Only available on Linux; other platforms get the constants for
//! compilation compatibility.

/// Host CID for vsock connections (always 2).
pub const HOST_CID: u32 = 2;

/// Local CID for loopback vsock connections.
pub const LOCAL_CID: u32 = 1;

#[cfg(target_os = "linux")]
mod linux {
    use std::io;
    use std::os::unix::io::FromRawFd;
    use std::os::unix::net::UnixStream;

    use crate::channel::stream::{StreamConn, StreamConnector};

    /// Connects the stream channel over vsock.
    pub struct VsockConnector {
        cid: u32,
        port: u32,
    }

    impl VsockConnector {
        /// Use [`HOST_CID`](super::HOST_CID) as `cid` to reach the host from
        /// a guest.
        pub fn new(cid: u32, port: u32) -> Self {
            Self { cid, port }
        }
    }

    impl StreamConnector for VsockConnector {
        fn describe(&self) -> String {
            format!("vsock:{}:{}", self.cid, self.port)
        }

        fn connect(&self) -> io::Result<Box<dyn StreamConn>> {
            let fd = unsafe { libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM, 0) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }

            let addr = libc::sockaddr_vm {
                svm_family: libc::AF_VSOCK as u16,
                svm_reserved1: 0,
                svm_port: self.port,
                svm_cid: self.cid,
                svm_zero: [0u8; 4],
            };

            let result = unsafe {
                libc::connect(
                    fd,
                    &addr as *const libc::sockaddr_vm as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_vm>() as u32,
                )
            };
            if result < 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }

            // Wrap the fd in a UnixStream for the Read/Write impls.
            Ok(Box::new(unsafe { UnixStream::from_raw_fd(fd) }))
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::VsockConnector;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vsock_constants() {
        assert_eq!(HOST_CID, 2);
        assert_eq!(LOCAL_CID, 1);
    }

    // Connecting needs a hypervisor endpoint, so the connector itself is
    // exercised in a VM rather than here.
}
