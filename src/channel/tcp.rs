//! TCP stream connector.

use std::io;
use std::net::{Shutdown, TcpStream};

use super::stream::{StreamConn, StreamConnector};

/// Connects the stream channel over TCP.
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    /// `addr` is anything `TcpStream::connect` accepts, e.g. `"10.0.2.2:2049"`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl StreamConnector for TcpConnector {
    fn describe(&self) -> String {
        format!("tcp:{}", self.addr)
    }

    fn connect(&self) -> io::Result<Box<dyn StreamConn>> {
        let stream = TcpStream::connect(self.addr.as_str())?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

impl StreamConn for TcpStream {
    fn try_clone(&self) -> io::Result<Box<dyn StreamConn>> {
        Ok(Box::new(TcpStream::try_clone(self)?))
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}
