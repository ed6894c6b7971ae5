//! Unix socket connector, for local host communication and tests.

use std::io;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use super::stream::{StreamConn, StreamConnector};

/// Connects the stream channel over a unix domain socket.
pub struct UnixConnector {
    path: PathBuf,
}

impl UnixConnector {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl StreamConnector for UnixConnector {
    fn describe(&self) -> String {
        format!("unix:{}", self.path.display())
    }

    fn connect(&self) -> io::Result<Box<dyn StreamConn>> {
        Ok(Box::new(UnixStream::connect(&self.path)?))
    }
}

impl StreamConn for UnixStream {
    fn try_clone(&self) -> io::Result<Box<dyn StreamConn>> {
        Ok(Box::new(UnixStream::try_clone(self)?))
    }

    fn shutdown(&self) -> io::Result<()> {
        UnixStream::shutdown(self, Shutdown::Both)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixListener;
    use std::thread;

    #[test]
    fn test_unix_connector_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("link.sock");

        let listener = UnixListener::bind(&socket_path).unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"hello");
            stream.write_all(b"world").unwrap();
        });

        let connector = UnixConnector::new(&socket_path);
        let mut conn = connector.connect().unwrap();
        conn.write_all(b"hello").unwrap();

        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"world");

        server.join().unwrap();
    }

    #[test]
    fn test_clone_shares_the_socket() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut reader = StreamConn::try_clone(&a).unwrap();

        let mut writer = b;
        writer.write_all(b"x").unwrap();

        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).unwrap();
        assert_eq!(&byte, b"x");
    }
}
