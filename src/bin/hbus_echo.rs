use std::env;
use std::error::Error;
use std::io::{self, Read, Write};

use hbus_proto::{
    Address, BusConfig, BusController, Capabilities, CommandOutcome, Inbound, Message, Port,
    RxBuffer, Scan,
};

struct Stdout;

impl Port for Stdout {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            full_duplex: true,
            ..Capabilities::default()
        }
    }

    fn open(&mut self, _inbound: Inbound) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) {}

    fn transmit(&mut self, frame: &[u8], _route: Option<&str>) -> io::Result<()> {
        let mut out = io::stdout().lock();
        out.write_all(frame)?;
        out.flush()
    }
}

fn echo(message: &Message, _port: usize) -> CommandOutcome {
    eprintln!("Received {}", message);
    CommandOutcome::Processed(message.payload().to_vec())
}

fn node_main_loop(address: Address) -> Result<(), Box<dyn Error>> {
    let mut bus = BusController::new(BusConfig::new(address), vec![Box::new(Stdout)]);
    bus.set_handler(echo);
    bus.open()?;

    let codec = *bus.codec();
    let mut buffer = RxBuffer::new();
    let mut data_in = [0; 64];
    loop {
        let len = io::stdin().read(&mut data_in)?;
        if len == 0 {
            break;
        }
        buffer.write(&data_in[..len]);
        loop {
            match buffer.scan(&codec) {
                Scan::Frame(frame) => {
                    bus.receive(0, &frame, None)?;
                }
                Scan::Discarded(n) => eprintln!("Discarded {} bytes", n),
                Scan::NeedData => break,
            }
        }
    }
    bus.close();
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let address = match env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => Address::new(10),
    };
    node_main_loop(address)
}
