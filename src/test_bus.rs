//! CAN bus doubles used by the executor, pipeline and ops tests.

use std::collections::VecDeque;
use std::io;

use crate::datagram;
use crate::frame::Frame;
use crate::msgpack::{self, Value};
use crate::transport::CanTransport;

/// Transport double fed by a script of frames and timeout ticks. When the
/// script runs out, every receive reads as a timeout, like an idle bus.
#[derive(Default)]
pub struct ScriptedBus {
    pub sent: Vec<Frame>,
    rx: VecDeque<Option<Frame>>,
}

impl ScriptedBus {
    pub fn new() -> ScriptedBus {
        ScriptedBus::default()
    }

    pub fn push_frame(&mut self, frame: Frame) {
        self.rx.push_back(Some(frame));
    }

    /// Queues a receive timeout tick.
    pub fn push_timeout(&mut self) {
        self.rx.push_back(None);
    }

    /// Queues the frames of an answer datagram sent by `source` to the
    /// host.
    pub fn push_answer(&mut self, source: u8, payload: &[u8]) {
        let raw = datagram::encode_datagram(payload, &[0]);
        for frame in datagram::datagram_to_frames(&raw, source) {
            self.push_frame(frame);
        }
    }

    /// Datagrams reassembled from everything the host sent, in order.
    pub fn sent_datagrams(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut datagrams = Vec::new();
        let mut buffer = Vec::new();
        for frame in &self.sent {
            if datagram::is_start_of_datagram(frame) {
                buffer.clear();
            }
            buffer.extend_from_slice(frame.data());
            if let Ok(Some(datagram)) = datagram::decode_datagram(&buffer) {
                datagrams.push(datagram);
                buffer.clear();
            }
        }
        datagrams
    }
}

impl CanTransport for ScriptedBus {
    fn send_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.sent.push(*frame);
        Ok(())
    }

    fn receive_frame(&mut self) -> io::Result<Option<Frame>> {
        Ok(self.rx.pop_front().unwrap_or(None))
    }
}

/// One decoded command observed on a [`RespondingBus`].
pub struct CommandRecord {
    pub code: u8,
    pub args: Vec<Value>,
    pub destinations: Vec<u8>,
}

/// Transport double that runs a firmware-like responder.
///
/// Every completed command datagram is decoded and handed to the
/// responder once per destination; each `Some` answer is queued back as
/// an answer datagram from that node. Returning `None` models a silent
/// board.
pub struct RespondingBus<F> {
    rx: VecDeque<Option<Frame>>,
    buffer: Vec<u8>,
    log: Vec<CommandRecord>,
    responder: F,
}

impl<F> RespondingBus<F>
where
    F: FnMut(u8, &[Value], u8) -> Option<Value>,
{
    pub fn new(responder: F) -> RespondingBus<F> {
        RespondingBus {
            rx: VecDeque::new(),
            buffer: Vec::new(),
            log: Vec::new(),
            responder,
        }
    }

    pub fn commands(&self) -> &[CommandRecord] {
        &self.log
    }
}

impl<F> CanTransport for RespondingBus<F>
where
    F: FnMut(u8, &[Value], u8) -> Option<Value>,
{
    fn send_frame(&mut self, frame: &Frame) -> io::Result<()> {
        if datagram::is_start_of_datagram(frame) {
            self.buffer.clear();
        }
        self.buffer.extend_from_slice(frame.data());

        let (command, destinations) = match datagram::decode_datagram(&self.buffer) {
            Ok(Some(datagram)) => datagram,
            _ => return Ok(()),
        };
        self.buffer.clear();

        let mut unpacker = msgpack::Unpacker::new(&command);
        let version = unpacker.unpack().unwrap();
        assert_eq!(version, Value::UInt(2));
        let code = unpacker.unpack().unwrap().as_u64().unwrap() as u8;
        let args = match unpacker.unpack().unwrap() {
            Value::Array(args) => args,
            other => panic!("command arguments are not an array: {:?}", other),
        };

        for &node in &destinations {
            if let Some(answer) = (self.responder)(code, &args, node) {
                let payload = msgpack::pack_to_vec(&answer);
                let raw = datagram::encode_datagram(&payload, &[0]);
                for answer_frame in datagram::datagram_to_frames(&raw, node) {
                    self.rx.push_back(Some(answer_frame));
                }
            }
        }

        self.log.push(CommandRecord {
            code,
            args,
            destinations,
        });
        Ok(())
    }

    fn receive_frame(&mut self) -> io::Result<Option<Frame>> {
        Ok(self.rx.pop_front().unwrap_or(None))
    }
}
