mod common;

use std::io::{Read, Write};
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::{Duration, Instant};

use common::{decode, frame, init_logger, pipe, PipeReader, PipeWriter, Recorder};
use hbus_proto::controller::command;
use hbus_proto::{
    Address, Bus, BusConfig, BusController, BusError, BusStatus, CommandOutcome, Handler,
    Message, MessageType, Port, StreamPort,
};

const TIMEOUT: Duration = Duration::from_secs(2);

struct AckSink(Sender<Message>);

impl Handler for AckSink {
    fn command_received(&mut self, _message: &Message, _port: usize) -> CommandOutcome {
        CommandOutcome::NotProcessed
    }

    fn ack_received(&mut self, message: &Message, _port: usize) -> bool {
        let _ = self.0.send(message.clone());
        true
    }
}

fn node(name: &str, address: u32, reader: PipeReader, writer: PipeWriter) -> BusController {
    let config = BusConfig::new(Address::new(address));
    let port = StreamPort::new(name, reader, writer, config.codec());
    let ports: Vec<Box<dyn Port>> = vec![Box::new(port)];
    BusController::new(config, ports)
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn read_frame(reader: &mut PipeReader) -> Vec<u8> {
    let deadline = Instant::now() + TIMEOUT;
    let mut data = Vec::new();
    let mut buf = [0; 64];
    while Instant::now() < deadline {
        if let Ok(len) = reader.read(&mut buf) {
            data.extend_from_slice(&buf[..len]);
            if len == 0 || data.len() >= 5 && data.len() >= decode_len(&data) {
                break;
            }
        }
    }
    data
}

/// Frame length for one byte addresses and short payloads.
fn decode_len(data: &[u8]) -> usize {
    let payload = usize::from(data[1] >> 4);
    7 + payload
}

#[test]
fn command_and_ack_between_two_nodes() {
    init_logger();
    let (host_tx, node_rx) = pipe();
    let (node_tx, host_rx) = pipe();

    let mut remote = node("node", 2, node_rx, node_tx);
    let (cmd_tx, cmd_rx) = mpsc::channel();
    // echo the payload, its last two bytes are the ack id
    remote.set_handler(move |message: &Message, _: usize| {
        let _ = cmd_tx.send(message.clone());
        CommandOutcome::Processed(message.payload().to_vec())
    });
    remote.open().unwrap();
    let remote = Bus::spawn(remote);

    let (ack_tx, ack_rx) = mpsc::channel();
    let mut host = node("host", 0x81, host_rx, host_tx);
    host.set_handler(AckSink(ack_tx));
    host.open().unwrap();
    let host = Bus::spawn(host);

    let handle = host.handle();
    handle
        .send_command(command::PING, Some(Address::new(2)), &[0x12, 0x34])
        .unwrap();

    let ack = ack_rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(ack.kind(), MessageType::AckResponse);
    assert_eq!(ack.source(), Address::new(2));
    assert_eq!(ack.destination(), Address::HOST);
    assert_eq!(ack.payload(), &[0x12, 0x34]);
    let received = cmd_rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(received.command(), command::PING);
    assert_eq!(received.source(), Address::HOST);
    assert_eq!(handle.status().unwrap(), BusStatus::Ready);
    assert_eq!(handle.last_error().unwrap(), 0);

    let host = host.shutdown().unwrap();
    assert_eq!(host.status(), BusStatus::Reset);
    assert!(matches!(handle.status(), Err(BusError::Stopped)));
    remote.shutdown().unwrap();
}

#[test]
fn split_and_noisy_stream() {
    init_logger();
    let (mut line_tx, node_rx) = pipe();
    let (node_tx, mut line_rx) = pipe();

    let mut remote = node("noisy", 2, node_rx, node_tx);
    let (recorder, calls) = Recorder::new(CommandOutcome::Processed(vec![1]));
    remote.set_handler(recorder);
    remote.open().unwrap();
    let remote = Bus::spawn(remote);

    let data = frame(MessageType::Normal, 2, 5, command::ACTIVATE, b"LS01 ");
    line_tx.write_all(&[0x00, 0x13, 0x37]).unwrap();
    line_tx.write_all(&data[..4]).unwrap();
    thread::sleep(Duration::from_millis(20));
    line_tx.write_all(&data[4..]).unwrap();

    assert!(wait_until(|| calls.commands().len() == 1));
    let ack = decode(&read_frame(&mut line_rx));
    assert_eq!(ack.kind(), MessageType::AckResponse);
    assert_eq!(ack.destination(), Address::new(5));
    assert_eq!(ack.payload(), &[1]);

    remote.shutdown().unwrap();
}

#[test]
fn port_can_be_reopened() {
    init_logger();
    let (mut line_tx, node_rx) = pipe();
    let (node_tx, mut line_rx) = pipe();
    let mut remote = node("reopen", 2, node_rx, node_tx);
    remote.set_handler(|_: &Message, _: usize| CommandOutcome::Processed(vec![]));

    remote.open().unwrap();
    remote.close();
    remote.open().unwrap();

    line_tx
        .write_all(&frame(MessageType::Normal, 2, 5, 0x10, &[]))
        .unwrap();
    let remote = Bus::spawn(remote);
    let ack = decode(&read_frame(&mut line_rx));
    assert_eq!(ack.kind(), MessageType::AckResponse);
    remote.shutdown().unwrap();
}
