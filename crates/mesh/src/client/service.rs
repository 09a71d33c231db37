//! Client service. Wraps the state machine and handles framing of the
//! TCP byte stream.

use std::borrow::{Borrow, Cow};
use std::collections::HashMap;
use std::net;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::client::stream::Decoder;
use crate::fsm::event::Event;
use crate::fsm::handler::{Command, DisconnectReason, StateMachine};
use crate::net::{Disconnect, Io, Link, LocalTime};

pub struct Service {
    inboxes: HashMap<net::SocketAddr, Decoder>,
    machine: StateMachine,
}

impl Service {
    pub fn new(machine: StateMachine) -> Self {
        Self {
            inboxes: HashMap::new(),
            machine,
        }
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut StateMachine {
        &mut self.machine
    }
}

#[async_trait]
impl crate::net::Service for Service {
    type Command = Command;

    async fn command_received(&mut self, cmd: Self::Command) {
        self.machine.command(cmd).await
    }
}

#[async_trait]
impl crate::net::StateMachine for Service {
    type Event = Event;
    type DisconnectReason = DisconnectReason;

    async fn initialize(&mut self, time: LocalTime) {
        self.machine.initialize(time);
    }

    async fn message_received(&mut self, addr: &net::SocketAddr, bytes: Cow<'_, [u8]>) {
        let Some(inbox) = self.inboxes.get_mut(addr) else {
            debug!(target: "mesh", "Received message from unknown peer {}", addr);
            return;
        };

        inbox.input(bytes.borrow());

        loop {
            match inbox.decode_next() {
                Ok(Some(payload)) => self.machine.frame_payload_received(*addr, payload),
                Ok(None) => break,
                Err(err) => {
                    error!("Invalid frame received from {}. Error: {}", addr, err);
                    self.machine.disconnect(*addr, DisconnectReason::DecodeError);
                    return;
                }
            }
        }
    }

    async fn datagram_received(&mut self, from: net::SocketAddr, bytes: &[u8]) {
        self.machine.datagram_received(from, bytes);
    }

    fn datagram_send_failed(&mut self, addr: net::SocketAddr, err: &std::io::Error) {
        self.machine.datagram_send_failed(addr, err);
    }

    fn attempted(&mut self, addr: &net::SocketAddr) {
        self.machine.attempted(addr)
    }

    fn connected(&mut self, addr: net::SocketAddr, local_addr: &net::SocketAddr, link: Link) {
        self.inboxes.insert(addr, Decoder::new(1024));
        self.machine.connected(addr, local_addr, link);
    }

    async fn disconnected(
        &mut self,
        addr: &net::SocketAddr,
        reason: Disconnect<Self::DisconnectReason>,
    ) {
        self.inboxes.remove(addr);
        self.machine.disconnected(addr, reason)
    }

    fn tick(&mut self, local_time: LocalTime) {
        self.machine.tick(local_time);
    }

    async fn timer_expired(&mut self) {
        self.machine.timer_expired();
    }
}

impl Iterator for Service {
    type Item = Io<Vec<u8>, Event, DisconnectReason>;

    fn next(&mut self) -> Option<Self::Item> {
        self.machine.next()
    }
}
