//! A minimal TCP transport for two agents.
//!
//! One side listens, the other connects; each then pumps incoming messages
//! into its agent with [`receive_loop`], sharing the agent with local
//! operations behind a mutex. Any other transport works equally well as long
//! as it delivers [`Message`]s in the order they were sent.

use crate::agent::Agent;
use crate::msg::{read_message, write_message, Message, MsgError};
use log::{error, info};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};

/// A message-framed connection over any byte stream.
pub struct Connection<S> {
    stream: S,
}

impl<S: Read + Write> Connection<S> {
    pub fn new(stream: S) -> Self {
        Connection { stream }
    }

    pub fn send(&mut self, message: &Message) -> Result<(), MsgError> {
        write_message(&mut self.stream, message)
    }

    pub fn recv(&mut self) -> Result<Message, MsgError> {
        read_message(&mut self.stream)
    }
}

impl Connection<TcpStream> {
    /// A second handle onto the same TCP connection, so one thread can run
    /// [`receive_loop`] while another sends.
    pub fn try_clone(&self) -> std::io::Result<Connection<TcpStream>> {
        Ok(Connection { stream: self.stream.try_clone()? })
    }
}

/// Accept a single incoming connection.
pub fn listen(addr: impl ToSocketAddrs) -> std::io::Result<Connection<TcpStream>> {
    let listener = TcpListener::bind(addr)?;
    let (stream, peer) = listener.accept()?;
    info!("accepted connection from {peer}");
    Ok(Connection::new(stream))
}

/// Connect to a listening peer.
pub fn connect(addr: impl ToSocketAddrs) -> std::io::Result<Connection<TcpStream>> {
    let stream = TcpStream::connect(addr)?;
    info!("connected to {}", stream.peer_addr()?);
    Ok(Connection::new(stream))
}

/// Read messages until the peer hangs up, dispatching each into the agent
/// and sending any reply. Handler errors are logged and do not stop the
/// loop; transport errors do.
pub fn receive_loop<S: Read + Write>(agent: &Arc<Mutex<Agent>>, connection: &mut Connection<S>) -> Result<(), MsgError> {
    loop {
        let message = match connection.recv() {
            Ok(message) => message,
            Err(e) if e.is_eof() => {
                info!("peer closed the connection");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let reply = match agent.lock().expect("agent lock poisoned").handle_message(message) {
            Ok(reply) => reply,
            Err(e) => {
                error!("handling message: {e}");
                continue;
            }
        };
        if let Some(reply) = reply {
            connection.send(&reply)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::Hello;
    use libsluice::keys::Signer;
    use std::net::TcpListener;

    #[test]
    fn messages_round_trip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let hello = Message::Hello(Hello {
            channel_account: Signer::from_seed(&[1u8; 32]).address(),
            signer: Signer::from_seed(&[2u8; 32]).address(),
        });

        let expected = hello.clone();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut connection = Connection::new(stream);
            let received = connection.recv().unwrap();
            assert_eq!(received, expected);
            connection.send(&received).unwrap();
        });

        let mut connection = connect(addr).unwrap();
        connection.send(&hello).unwrap();
        assert_eq!(connection.recv().unwrap(), hello);
        server.join().unwrap();
    }
}
