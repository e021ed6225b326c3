use anyhow::{Context, Result};
use log::info;
use serialport::{DataBits, Parity, StopBits};
use std::io::Write;
use std::iter::Peekable;
use std::str::{FromStr, SplitWhitespace};
use std::time::Duration;

use hbus_proto::controller::command;
use hbus_proto::{
    Address, Bus, BusConfig, BusController, BusHandle, ByteStack, CommandOutcome, Message, Port,
    StreamPort,
};

fn on_command(message: &Message, port: usize) -> CommandOutcome {
    match message.command() {
        command::PING => {
            info!("ping from {} on port {}", message.source(), port);
            CommandOutcome::Processed(Vec::new())
        }
        other => {
            info!("command {:#04x} from {} ignored", other, message.source());
            CommandOutcome::NotProcessed
        }
    }
}

fn cmd_ping(args: &mut CmdScanner, bus: &BusHandle) -> Result<()> {
    let destination: Address = args.parse_next()?;
    bus.send_command(command::PING, Some(destination), &[])?;
    Ok(())
}

fn cmd_activate(args: &mut CmdScanner, bus: &BusHandle) -> Result<()> {
    let destination: Address = args.parse_next()?;
    let mut stack = ByteStack::new();
    stack.push_name(args.next()?);
    bus.send_command(command::ACTIVATE, Some(destination), stack.as_bytes())?;
    Ok(())
}

fn cmd_status(bus: &BusHandle) -> Result<()> {
    println!("{:?}, last error {:#04x}", bus.status()?, bus.last_error()?);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args();
    args.next(); // Skip program name
    let port = args.next().unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let address: Address = args
        .next()
        .unwrap_or_else(|| "2".to_string())
        .parse()
        .context("Invalid address")?;

    let serial = serialport::new(&port, 57600)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .timeout(Duration::from_millis(100))
        .open()
        .context("Failed to open serial port")?;
    let reader = serial.try_clone().context("Failed to clone serial port")?;

    let config = BusConfig::new(address);
    let serial_port = StreamPort::new(port, reader, serial, config.codec());
    let ports: Vec<Box<dyn Port>> = vec![Box::new(serial_port)];
    let mut controller = BusController::new(config, ports);
    controller.set_handler(on_command);
    controller.open()?;

    let bus = Bus::spawn(controller);
    let handle = bus.handle();
    let mut stdout = std::io::stdout();
    loop {
        print!(">> ");
        stdout.flush()?;
        let mut cmd = String::new();
        let mut scan = match CmdScanner::read_stdin(&mut cmd)? {
            Some(scan) => scan,
            None => break,
        };
        if let Err(err) = match scan.next() {
            Err(_) => continue,
            Ok("ping") | Ok("p") => cmd_ping(&mut scan, &handle),
            Ok("activate") => cmd_activate(&mut scan, &handle),
            Ok("status") => cmd_status(&handle),
            Ok("quit") | Ok("q") => break,
            Ok(cmd) => {
                println!("Unknown command {}", cmd);
                continue;
            }
        } {
            println!("{:?}", err)
        }
    }
    bus.shutdown()?;
    Ok(())
}

struct CmdScanner<'a> {
    splt: Peekable<SplitWhitespace<'a>>,
}

impl<'a> CmdScanner<'a> {
    fn read_stdin(buf: &'a mut String) -> Result<Option<Self>> {
        buf.clear();
        if std::io::stdin().read_line(buf)? == 0 {
            return Ok(None);
        }
        let splt = buf.split_whitespace().peekable();
        Ok(Some(Self { splt }))
    }
    fn next(&mut self) -> Result<&'a str> {
        self.splt.next().context("End of stream")
    }
    fn parse_next<T: FromStr>(&mut self) -> Result<T> {
        self.next()?.parse::<T>().ok().context("Parse error")
    }
}
