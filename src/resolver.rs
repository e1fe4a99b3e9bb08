//! Asynchronous name resolution behind a pollable descriptor.
//!
//! Resolution itself happens on a short-lived worker thread; the result
//! comes back over a channel and a pipe write makes the query's receiving
//! end readable, so the event loop waits on it like any other descriptor.
//! [`DnsQuery::step`] is called on every readiness firing until it
//! terminates with an address or a failure. Dropping the query cancels
//! it: the worker's final sends go nowhere and the thread exits.

use std::{
    io::{self, Read, Write},
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    sync::mpsc::{self, TryRecvError},
    thread,
};

use mio::unix::pipe;

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("could not resolve {host}: {reason}")]
    Failed { host: String, reason: String },
}

#[derive(Debug)]
pub enum ResolveStep {
    /// not done yet; wait for the descriptor to become readable again
    Pending,
    Complete(Result<IpAddr, ResolveError>),
}

#[derive(Debug)]
pub struct DnsQuery {
    host: String,
    result_rx: mpsc::Receiver<Result<IpAddr, String>>,
    notify: pipe::Receiver,
}

impl DnsQuery {
    pub fn spawn(host: &str) -> io::Result<DnsQuery> {
        let (mut sender, notify) = pipe::new()?;
        let (result_tx, result_rx) = mpsc::channel();
        let name = host.to_string();
        thread::Builder::new()
            .name(format!("resolve {name}"))
            .spawn(move || {
                let result = resolve(&name);
                // the owning connection may be gone already; both sends
                // are best-effort
                let _ = result_tx.send(result);
                let _ = sender.write(&[1]);
            })?;
        Ok(DnsQuery {
            host: host.to_string(),
            result_rx,
            notify,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// the descriptor to register for read readiness
    pub fn source(&mut self) -> &mut pipe::Receiver {
        &mut self.notify
    }

    pub fn step(&mut self) -> ResolveStep {
        // drain the wakeup byte so the descriptor goes quiet again
        let mut buf = [0u8; 8];
        loop {
            match self.notify.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        match self.result_rx.try_recv() {
            Ok(Ok(addr)) => ResolveStep::Complete(Ok(addr)),
            Ok(Err(reason)) => ResolveStep::Complete(Err(ResolveError::Failed {
                host: self.host.clone(),
                reason,
            })),
            Err(TryRecvError::Empty) => ResolveStep::Pending,
            Err(TryRecvError::Disconnected) => ResolveStep::Complete(Err(ResolveError::Failed {
                host: self.host.clone(),
                reason: "resolver worker vanished".to_string(),
            })),
        }
    }
}

fn resolve(host: &str) -> Result<IpAddr, String> {
    let addrs: Vec<SocketAddr> = (host, 0u16)
        .to_socket_addrs()
        .map_err(|e| e.to_string())?
        .collect();
    // IPv4 records take precedence
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .map(|a| a.ip())
        .ok_or_else(|| "no address records".to_string())
}
