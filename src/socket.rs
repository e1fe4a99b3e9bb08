//! Socket plumbing shared by the listeners and the relay path.

use std::{
    io::{self, Write},
    net::SocketAddr,
};

use mio::net::TcpListener;
use socket2::{Domain, Protocol, Socket, Type};

/// Bind a non-blocking listener with SO_REUSEADDR and a real backlog.
pub fn server_bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Write the whole buffer, retrying short and would-block writes.
///
/// A zero-length write or any hard error aborts with `WriteZero`/the error;
/// the caller is expected to tear the connection down in both cases.
pub fn write_all<W: Write>(dst: &mut W, buf: &[u8]) -> io::Result<()> {
    let mut offset = 0;
    while offset < buf.len() {
        match dst.write(&buf[offset..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "peer stopped accepting bytes",
                ))
            }
            Ok(n) => offset += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dribble(Vec<u8>);

    impl Write for Dribble {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            // one byte at a time forces the partial-write loop
            self.0.push(buf[0]);
            Ok(1)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_all_handles_partial_writes() {
        let mut sink = Dribble(Vec::new());
        write_all(&mut sink, b"hello world").unwrap();
        assert_eq!(sink.0, b"hello world");
    }

    struct Dead;

    impl Write for Dead {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Ok(0)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn zero_write_is_an_error() {
        let err = write_all(&mut Dead, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }
}
